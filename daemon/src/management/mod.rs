pub mod cache;
pub mod comm;
pub mod controller;
pub mod host;
pub mod instance;
pub mod keepalive;
pub mod lock;
pub mod markers;
pub mod status;

#[cfg(test)]
pub mod testing;

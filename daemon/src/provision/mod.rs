pub mod factory;
pub mod prefix;
pub mod setting;
pub mod world;

pub use factory::{FsProvisioner, Provisioner};

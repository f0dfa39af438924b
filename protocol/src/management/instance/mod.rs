mod id;
mod intent;
mod status;
mod world;

pub use id::*;
pub use intent::*;
pub use status::*;
pub use world::*;

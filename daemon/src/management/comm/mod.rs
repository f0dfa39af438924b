pub use process::*;
pub use process_helper::*;

mod process;
mod process_helper;

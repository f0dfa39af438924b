pub use log_file::*;

mod log_file;

pub mod file;
pub mod files;

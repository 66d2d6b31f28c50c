pub mod config;
pub mod config_dir;
pub mod error;
pub mod lockfile;
pub mod logging;

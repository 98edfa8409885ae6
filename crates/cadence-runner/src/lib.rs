pub mod cli;
pub mod config;
pub mod runtime;
pub mod sensor_log;

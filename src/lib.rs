#![forbid(unsafe_code)]

pub mod acp;
pub mod config;
pub mod connection;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod models;
pub mod orchestrator;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use orchestrator::manager::{Manager, ManagerBuilder};

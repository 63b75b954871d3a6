pub mod components;
pub mod config;
pub mod error;
pub mod executor;
pub mod lock;
pub mod markers;
pub mod orchestrator;
pub mod output;
pub mod planner;
pub mod retry;
pub mod signal;

pub use error::{Error, ErrorKind, Result};

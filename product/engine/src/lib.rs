pub mod batch;
pub mod batch_log;
pub mod cmd;
pub mod config;
mod error;
pub mod locator;
pub mod paths;
pub mod session;
pub mod status;
pub mod tools;
pub mod ytdlp;

pub use error::{EngineError, Result};

pub mod backup;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod progress;
pub mod restore;
pub mod service;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{KeeperError, Result};

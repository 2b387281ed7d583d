pub mod adapter;
pub mod admission;
pub mod config;
pub mod cycle;
pub mod dedup;
pub mod error;
pub mod history;
pub mod io;
pub mod paths;
pub mod processing;
pub mod scheduler;
pub mod selection;
pub mod services;
pub mod stats_cache;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{HuntError, Result};

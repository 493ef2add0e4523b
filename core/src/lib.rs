pub mod checker;
pub mod compile;
pub mod config;
pub mod error;
pub mod event;
pub mod runner;
pub mod scheduler;
pub mod str_interp;
pub mod style;
pub mod testing;
pub mod testset;

#[cfg(test)]
mod testutil;

pub use crate::config::Config;

pub mod backup;
pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod metadata;
pub mod poll;
pub mod schedule;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

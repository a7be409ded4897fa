//! smalltsdb: a small time-series database that rolls raw metric samples up
//! into fixed-frequency statistical summaries.
//!
//! Producers append samples to a durable incoming store; aggregators drain
//! it, fold samples into per-bucket accumulators and commit one immutable
//! aggregate row per closed bucket to the long-term store, which any reader
//! can query.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod export;
pub mod migrate;
pub mod retention;
pub mod rollup;
pub mod sample;
pub mod store;

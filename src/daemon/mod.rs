//! Long-running processes around the stores.
//!
//! Ingestors and aggregators share no memory; they communicate only through
//! the incoming and long-term databases, so any number of each may run.

mod aggregator;
mod ingestor;

pub use aggregator::AggregatorDaemon;
pub use ingestor::{
    IngestError, IngestorDaemon, IngestorHandle, IngestorStats, SampleLog, Submitted,
};

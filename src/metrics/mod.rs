pub mod aggregator;
pub mod record;
pub mod submitter;

pub use record::AttemptRecord;
pub use submitter::{MetricsSink, Submitter};

pub mod access_log;
pub mod audit_file_writer;
pub mod audit_log;
pub mod metrics;
pub mod pii_scrubber;
pub mod prometheus_exporter;

pub use metrics::Aggregator;

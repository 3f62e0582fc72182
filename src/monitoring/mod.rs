pub mod dashboard;
pub mod logger;
pub mod metrics;

pub use metrics::METRICS;

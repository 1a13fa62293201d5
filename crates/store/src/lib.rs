pub mod aggregator;
pub mod alert;
pub mod db;
pub mod histogram;
pub mod query;
pub mod retention;
pub mod service_map;
pub mod trace;
pub mod tree;
pub mod window;
pub mod write;

pub use db::{Store, StoreOptions, TraceCounts};
pub use write::SpanOutcome;

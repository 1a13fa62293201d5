//! Event ingest for tracepulse: per-tenant queues and pipelines, the
//! subscription hub, and the HTTP/OTLP ingest surfaces.

pub mod api;
pub mod http;
pub mod hub;
pub mod otlp;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod server;

pub use hub::{Subscription, SubscriptionHub};
pub use pipeline::{TenantPipeline, TickReport};
pub use queue::{IngestEvent, PushReceipt};
pub use registry::TenantRegistry;

pub mod alert;
pub mod request;
pub mod service;
pub mod span;
pub mod stats;

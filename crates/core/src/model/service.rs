use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceNode {
    pub name: String,
    pub request_count: u64,
    pub span_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
    pub operations: Vec<OperationCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationCount {
    pub name: String,
    pub count: u64,
}

/// A caller → callee relationship observed through parent/child spans that
/// cross a service boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEdge {
    pub caller: String,
    pub callee: String,
    pub call_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceMap {
    pub generated_at: DateTime<Utc>,
    pub lookback_seconds: u64,
    pub trace_count: usize,
    pub services: Vec<ServiceNode>,
    pub edges: Vec<ServiceEdge>,
}

impl ServiceMap {
    pub fn empty(generated_at: DateTime<Utc>, lookback_seconds: u64) -> Self {
        Self {
            generated_at,
            lookback_seconds,
            trace_count: 0,
            services: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceNode> {
        self.services.iter().find(|s| s.name == name)
    }
}

pub mod decode;
pub mod grpc;
pub mod http;

use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTracePartialSuccess, ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tracepulse_core::error::Result;
use tracepulse_core::ids::TenantId;

use crate::registry::TenantRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub dropped_oldest: usize,
    pub first_rejection: Option<String>,
}

impl ExportOutcome {
    pub fn to_response(&self) -> ExportTraceServiceResponse {
        let partial_success = (self.rejected > 0).then(|| ExportTracePartialSuccess {
            rejected_spans: self.rejected as i64,
            error_message: self.first_rejection.clone().unwrap_or_default(),
        });
        ExportTraceServiceResponse { partial_success }
    }
}

/// Routes an OTLP trace export to tenant pipelines. The header tenant
/// applies to every resource; otherwise each resource must carry
/// `tenant.id`. Tenants are resolved before anything is enqueued.
pub fn ingest_export(
    registry: &TenantRegistry,
    header_tenant: Option<&TenantId>,
    req: &ExportTraceServiceRequest,
) -> Result<ExportOutcome> {
    let batches = decode::decode_export(req);
    let routed = batches
        .into_iter()
        .map(|batch| {
            let tenant = match header_tenant {
                Some(tenant) => tenant.clone(),
                None => TenantId::parse_opt(batch.tenant.as_deref())?,
            };
            Ok((tenant, batch))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut outcome = ExportOutcome::default();
    for (tenant, batch) in routed {
        let pipeline = registry.pipeline_for_ingest(&tenant)?;
        outcome.rejected += batch.rejected.len();
        if outcome.first_rejection.is_none() {
            outcome.first_rejection = batch.rejected.into_iter().next();
        }
        for span in batch.spans {
            let receipt = pipeline.ingest_span(span)?;
            outcome.accepted += 1;
            if receipt.dropped_oldest {
                outcome.dropped_oldest += 1;
            }
        }
    }
    Ok(outcome)
}

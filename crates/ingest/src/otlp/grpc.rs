use std::sync::Arc;

use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{
    TraceService, TraceServiceServer,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tonic::{Request, Response, Status};
use tracepulse_core::ErrorKind;
use tracepulse_core::error::TracepulseError;
use tracepulse_core::ids::TenantId;

use crate::api::TENANT_HEADER;
use crate::otlp::ingest_export;
use crate::registry::TenantRegistry;

#[derive(Clone)]
pub struct GrpcIngest {
    registry: Arc<TenantRegistry>,
}

impl GrpcIngest {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    pub fn traces_service(&self) -> TraceServiceServer<Self> {
        TraceServiceServer::new(self.clone())
    }
}

fn to_status(err: TracepulseError) -> Status {
    match err.kind() {
        ErrorKind::TenantInactive => Status::failed_precondition(err.to_string()),
        kind if kind.is_client_error() => Status::invalid_argument(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl TraceService for GrpcIngest {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> std::result::Result<Response<ExportTraceServiceResponse>, Status> {
        let tenant = match request.metadata().get(TENANT_HEADER) {
            None => None,
            Some(value) => {
                let raw = value
                    .to_str()
                    .map_err(|_| Status::invalid_argument("x-tenant-id is not valid text"))?;
                Some(TenantId::parse(raw).map_err(to_status)?)
            }
        };
        let req = request.into_inner();
        let outcome =
            ingest_export(&self.registry, tenant.as_ref(), &req).map_err(to_status)?;
        tracing::debug!(
            accepted = outcome.accepted,
            rejected = outcome.rejected,
            "otlp grpc traces accepted"
        );
        Ok(Response::new(outcome.to_response()))
    }
}

#[cfg(test)]
mod tests {
    use tonic::Code;
    use tonic::metadata::MetadataValue;
    use tracepulse_core::config::Config;
    use tracepulse_testkit::otlp_trace_request;

    use super::*;

    async fn wait_for_spans(registry: &TenantRegistry, tenant: &str, spans: usize) {
        let tenant = TenantId::parse(tenant).unwrap();
        for _ in 0..200 {
            if let Ok(pipeline) = registry.get(&tenant)
                && pipeline.store().trace_counts().spans == spans
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("spans never arrived for {tenant}");
    }

    #[tokio::test]
    async fn metadata_tenant_routes_spans() {
        let registry = Arc::new(TenantRegistry::new(Arc::new(Config::default())));
        let ingest = GrpcIngest::new(registry.clone());

        let mut request = Request::new(otlp_trace_request("checkout", Some("ignored")));
        request
            .metadata_mut()
            .insert(TENANT_HEADER, MetadataValue::from_static("acme"));
        let response = ingest.export(request).await.unwrap().into_inner();
        assert!(response.partial_success.is_none());

        wait_for_spans(&registry, "acme", 2).await;
        assert!(registry.get(&TenantId::parse("ignored").unwrap()).is_err());
    }

    #[tokio::test]
    async fn missing_tenant_is_invalid_argument() {
        let registry = Arc::new(TenantRegistry::new(Arc::new(Config::default())));
        let ingest = GrpcIngest::new(registry);
        let status = ingest
            .export(Request::new(otlp_trace_request("checkout", None)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracepulse_core::error::{Result, TracepulseError};

use crate::http;
use crate::otlp::grpc::GrpcIngest;
use crate::registry::TenantRegistry;

/// Serves JSON/OTLP HTTP ingest and OTLP gRPC ingest until either fails.
pub async fn run_ingest_servers(
    registry: Arc<TenantRegistry>,
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
) -> Result<()> {
    let grpc = GrpcIngest::new(registry.clone());
    let http_router = http::router(registry);

    let grpc_task = tokio::spawn(async move {
        Server::builder()
            .add_service(grpc.traces_service())
            .serve(grpc_addr)
            .await
    });

    let http_task = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        tracing::info!(addr = %http_addr, "ingest http listening");
        axum::serve(listener, http_router).await
    });
    tracing::info!(addr = %grpc_addr, "ingest grpc listening");

    tokio::select! {
        res = grpc_task => {
            let inner = res.map_err(|e| TracepulseError::Internal(format!("gRPC task join failed: {e}")))?;
            inner.map_err(|e| TracepulseError::Io(format!("gRPC server failed: {e}")))
        }
        res = http_task => {
            let inner = res.map_err(|e| TracepulseError::Internal(format!("HTTP task join failed: {e}")))?;
            inner.map_err(|e| TracepulseError::Io(format!("HTTP server failed: {e}")))
        }
    }
}

use std::collections::{BTreeMap, HashMap};
use std::io::IsTerminal;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace as sdktrace;
use tokio::sync::mpsc;
use tracepulse_core::ids::{SpanId, TenantId, TraceId};
use tracepulse_core::model::span::{Span, SpanStatus, SpanType};
use tracepulse_ingest::TenantRegistry;
use tracing::{Event, Id, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const SELF_TENANT: &str = "tracepulse";
const SELF_SERVICE: &str = "tracepulse";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub self_observe: SelfObserveMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfObserveMode {
    Off,
    On,
}

impl SelfObserveMode {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("TRACEPULSE_SELF_OBSERVE").unwrap_or_default())
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Self::On,
            _ => Self::Off,
        }
    }
}

pub fn init_cli_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .compact()
        .try_init();
}

/// Installs the server subscriber: env-filtered compact logs, optional OTLP
/// export and optional self-observation into the `tracepulse` tenant.
pub fn init_run_tracing(cfg: TelemetryConfig, registry: Option<Arc<TenantRegistry>>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .compact();

    let otlp_layer = build_otlp_layer();
    let self_layer = match cfg.self_observe {
        SelfObserveMode::On => registry.map(SelfObserveLayer::new),
        SelfObserveMode::Off => None,
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otlp_layer)
        .with(self_layer)
        .try_init();
}

pub fn shutdown_tracing() {
    if let Some(provider) = otlp_provider_slot()
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
    {
        let _ = provider.shutdown();
    }
}

fn build_otlp_layer<S>() -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let has_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
    if !has_endpoint {
        return None;
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();
    let tracer = provider.tracer("tracepulse");

    if let Ok(mut slot) = otlp_provider_slot().lock() {
        *slot = Some(provider);
    }

    Some(tracing_opentelemetry::layer().with_tracer(tracer))
}

fn otlp_provider_slot() -> &'static Mutex<Option<sdktrace::SdkTracerProvider>> {
    static SLOT: OnceLock<Mutex<Option<sdktrace::SdkTracerProvider>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

#[derive(Debug, Clone)]
struct SpanStart {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    name: String,
    target: String,
    start_time: DateTime<Utc>,
    fields: BTreeMap<String, String>,
    errored: bool,
}

impl SpanStart {
    fn finish(self, end: DateTime<Utc>) -> Option<Span> {
        let duration_ms = (end - self.start_time)
            .num_microseconds()
            .map(|us| us.max(0) as f64 / 1000.0)?;
        let mut tags = self.fields;
        tags.insert("code.namespace".to_string(), self.target);
        Some(Span {
            trace_id: TraceId::parse(&self.trace_id).ok()?,
            span_id: SpanId::parse(&self.span_id).ok()?,
            parent_span_id: self
                .parent_span_id
                .as_deref()
                .and_then(|p| SpanId::parse(p).ok()),
            service_name: SELF_SERVICE.to_string(),
            operation_name: self.name,
            span_type: SpanType::Function,
            start_time: self.start_time,
            duration_ms,
            status: if self.errored {
                SpanStatus::Error
            } else {
                SpanStatus::Ok
            },
            tags,
        })
    }
}

/// Feeds the server's own tracing spans back in as tenant `tracepulse`.
/// ERROR events inside a span mark it as failed.
#[derive(Clone)]
struct SelfObserveLayer {
    tx: mpsc::UnboundedSender<Span>,
    spans: Arc<Mutex<HashMap<u64, SpanStart>>>,
}

impl SelfObserveLayer {
    fn new(registry: Arc<TenantRegistry>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Span>();
        tokio::spawn(async move {
            let Ok(tenant) = TenantId::parse(SELF_TENANT) else {
                return;
            };
            while let Some(span) = rx.recv().await {
                // the tenant may have been deactivated; spans are best effort
                if let Ok(pipeline) = registry.pipeline_for_ingest(&tenant) {
                    let _ = pipeline.ingest_span(span);
                }
            }
        });

        Self {
            tx,
            spans: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<S> Layer<S> for SelfObserveLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if *event.metadata().level() != tracing::Level::ERROR {
            return;
        }
        let Some(current) = ctx.lookup_current() else {
            return;
        };
        if let Ok(mut map) = self.spans.lock()
            && let Some(span) = map.get_mut(&current.id().into_u64())
        {
            span.errored = true;
        }
    }

    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let id_u64 = id.into_u64();
        let span_id = format!("{id_u64:016x}");

        let parent_id = attrs
            .parent()
            .map(Id::into_u64)
            .or_else(|| ctx.lookup_current().map(|s| s.id().into_u64()));

        let parent = parent_id.and_then(|pid| {
            self.spans
                .lock()
                .ok()
                .and_then(|m| m.get(&pid).map(|p| (p.trace_id.clone(), p.span_id.clone())))
        });
        let (trace_id, parent_span_id) = match parent {
            Some((trace_id, parent_span)) => (trace_id, Some(parent_span)),
            None => (uuid::Uuid::new_v4().simple().to_string(), None),
        };

        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        let start = SpanStart {
            trace_id,
            span_id,
            parent_span_id,
            name: attrs.metadata().name().to_string(),
            target: attrs.metadata().target().to_string(),
            start_time: Utc::now(),
            fields: visitor.fields,
            errored: false,
        };

        if let Ok(mut map) = self.spans.lock() {
            map.insert(id_u64, start);
        }
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let Some(start) = self
            .spans
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&id.into_u64()))
        else {
            return;
        };

        if let Some(span) = start.finish(Utc::now()) {
            let _ = self.tx.send(span);
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: BTreeMap<String, String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn self_observe_mode_parses_truthy_values() {
        assert_eq!(SelfObserveMode::parse("on"), SelfObserveMode::On);
        assert_eq!(SelfObserveMode::parse("TRUE"), SelfObserveMode::On);
        assert_eq!(SelfObserveMode::parse(""), SelfObserveMode::Off);
        assert_eq!(SelfObserveMode::parse("nope"), SelfObserveMode::Off);
    }

    #[test]
    fn finished_span_carries_parent_and_error_state() {
        let start = Utc::now();
        let span = SpanStart {
            trace_id: "abc".into(),
            span_id: "0000000000000002".into(),
            parent_span_id: Some("0000000000000001".into()),
            name: "tick".into(),
            target: "tracepulse_ingest::pipeline".into(),
            start_time: start,
            fields: BTreeMap::new(),
            errored: true,
        }
        .finish(start + Duration::milliseconds(12))
        .unwrap();

        assert_eq!(span.service_name, "tracepulse");
        assert_eq!(span.duration_ms, 12.0);
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.parent_span_id.unwrap().as_str(), "0000000000000001");
        assert_eq!(span.tags["code.namespace"], "tracepulse_ingest::pipeline");
    }
}

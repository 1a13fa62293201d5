mod client;
mod output;
mod query_server;
mod stream;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Method;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracepulse_core::config::{Config, ReconnectPolicy};
use tracepulse_core::model::alert::{Alert, AlertRule, RuleStatus};
use tracepulse_core::model::service::ServiceMap;
use tracepulse_core::model::stats::{EndpointStat, Stats, TimeSeries};
use tracepulse_core::query::{StatusResponse, TraceExport, TraceResponse, TraceSummary, TracesQuery};
use tracepulse_core::stream::{ClientMessage, Envelope, StreamContract};
use tracepulse_ingest::TenantRegistry;

use crate::client::QueryClient;
use crate::output::{
    print_alerts_human, print_endpoints_human, print_envelope_human, print_rules_human,
    print_service_map_human, print_stats_human, print_status_human, print_time_series_human,
    print_trace_human, print_traces_human,
};
use crate::telemetry::{
    SelfObserveMode, TelemetryConfig, init_cli_tracing, init_run_tracing, shutdown_tracing,
};

const CLOSE_POLICY: u16 = 1008;

#[derive(Parser, Debug)]
#[command(name = "tracepulse")]
#[command(about = "Real-time trace, metrics and alerting pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true, help = "Query server address (host:port or URL)")]
    addr: Option<String>,

    #[arg(long, global = true)]
    tenant: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run ingest and query servers")]
    Run {
        #[arg(long)]
        ingest_http_addr: Option<String>,
        #[arg(long)]
        ingest_grpc_addr: Option<String>,
        #[arg(long)]
        query_http_addr: Option<String>,
    },
    #[command(about = "List traces")]
    Traces {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        operation: Option<String>,
        #[arg(long, help = "Minimum duration in ms")]
        min_duration: Option<f64>,
        #[arg(long, help = "Maximum duration in ms")]
        max_duration: Option<f64>,
        #[arg(long)]
        errors: bool,
        #[arg(long, help = "Relative range such as 15m or 1h")]
        range: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    #[command(about = "Show a trace as a span tree")]
    Trace { trace_id: String },
    #[command(about = "Export a trace to a JSON file")]
    Export {
        trace_id: String,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    #[command(about = "Show the service dependency map")]
    ServiceMap,
    #[command(about = "Show windowed request statistics")]
    Stats,
    #[command(about = "Show the busiest endpoints")]
    Endpoints {
        #[arg(long)]
        limit: Option<usize>,
    },
    #[command(about = "Show one metric as a time series")]
    Series {
        #[arg(default_value = "rps")]
        metric: String,
    },
    #[command(about = "Show recent alerts")]
    Alerts {
        #[arg(long)]
        limit: Option<usize>,
    },
    #[command(about = "Show or replace alert rules")]
    Rules {
        #[arg(long, help = "JSON file holding the replacement rule list")]
        set: Option<PathBuf>,
    },
    #[command(about = "Show server and tenant status")]
    Status,
    #[command(about = "Follow the live stream")]
    Tail {
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,
        #[arg(long)]
        series: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            ingest_http_addr,
            ingest_grpc_addr,
            query_http_addr,
        } => {
            let telemetry_cfg = TelemetryConfig {
                self_observe: SelfObserveMode::from_env(),
            };
            run_server(
                ingest_http_addr,
                ingest_grpc_addr,
                query_http_addr,
                telemetry_cfg,
            )
            .await
        }
        command => {
            init_cli_tracing();
            let client = QueryClient::new(cli.addr, cli.tenant);
            run_client(&client, command, cli.json).await
        }
    }
}

async fn run_client(client: &QueryClient, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Run { .. } => anyhow::bail!("`run` starts the servers and has no client form"),
        Commands::Traces {
            service,
            operation,
            min_duration,
            max_duration,
            errors,
            range,
            since,
            until,
            sort,
            limit,
        } => {
            let query = TracesQuery {
                service,
                operation,
                min_duration,
                max_duration,
                error_only: errors,
                time_range: range,
                since,
                until,
                sort,
                limit: Some(limit),
            };
            let traces: Vec<TraceSummary> = client.get_json("/traces", &query).await?;
            emit(&traces, json, |v| print_traces_human(v))
        }
        Commands::Trace { trace_id } => {
            let trace: TraceResponse = client
                .get(&format!("/traces/{trace_id}"))
                .await?;
            emit(&trace, json, print_trace_human)
        }
        Commands::Export { trace_id, output } => {
            run_export(client, &trace_id, output, json).await
        }
        Commands::ServiceMap => {
            let map: ServiceMap = client.get("/service-map").await?;
            emit(&map, json, print_service_map_human)
        }
        Commands::Stats => {
            let stats: Stats = client.get("/stats").await?;
            emit(&stats, json, print_stats_human)
        }
        Commands::Endpoints { limit } => {
            let endpoints: Vec<EndpointStat> =
                client.get_json("/endpoints", &[("limit", limit)]).await?;
            emit(&endpoints, json, |v| print_endpoints_human(v))
        }
        Commands::Series { metric } => {
            let series: TimeSeries = client
                .get_json("/time-series", &[("metric", metric)])
                .await?;
            emit(&series, json, print_time_series_human)
        }
        Commands::Alerts { limit } => {
            let alerts: Vec<Alert> = client.get_json("/alerts", &[("limit", limit)]).await?;
            emit(&alerts, json, |v| print_alerts_human(v))
        }
        Commands::Rules { set } => {
            let rules: Vec<RuleStatus> = match set {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("read rules file {}", path.display()))?;
                    let replacement: Vec<AlertRule> = serde_json::from_str(&raw)
                        .with_context(|| format!("parse rules file {}", path.display()))?;
                    client
                        .send_json(Method::PUT, "/alert-rules", Some(&replacement))
                        .await?
                }
                None => client.get("/alert-rules").await?,
            };
            emit(&rules, json, |v| print_rules_human(v))
        }
        Commands::Status => {
            let status: StatusResponse = client.get("/status").await?;
            emit(&status, json, print_status_human)
        }
        Commands::Tail { topics, series } => {
            tokio::select! {
                res = run_tail(client, topics, series, json) => res,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
    }
}

fn emit<T: Serialize>(value: &T, json: bool, human: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

async fn run_export(
    client: &QueryClient,
    trace_id: &str,
    output: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let (bytes, suggested) = client
        .get_bytes(&format!("/traces/{trace_id}/export"))
        .await?;
    let export = TraceExport::parse(&bytes).context("server returned an invalid export")?;
    let path = output
        .or_else(|| suggested.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(export.filename(Utc::now())));
    std::fs::write(&path, &bytes).with_context(|| format!("write {}", path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "path": path,
                "trace_id": export.trace_id,
                "span_count": export.span_count,
            })
        );
    } else {
        println!(
            "wrote {} (trace={} spans={})",
            path.display(),
            export.trace_id,
            export.span_count
        );
    }
    Ok(())
}

fn ws_url(base: &str, tenant: Option<&str>) -> String {
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    match tenant {
        Some(tenant) => format!("{base}/stream?tenant={tenant}"),
        None => format!("{base}/stream"),
    }
}

/// Base delay from the advertised policy plus up to `jitter` of it at random.
fn reconnect_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    let jitter_range = (base.as_millis() as f64 * policy.jitter.clamp(0.0, 1.0)) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    base + Duration::from_millis(jitter)
}

/// Streams until the server rejects the subscription, reconnecting with the
/// server's policy otherwise. Reconnects resume from the last seen `seq`.
async fn run_tail(
    client: &QueryClient,
    topics: Vec<String>,
    series: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let contract: StreamContract = client
        .get("/stream/contract")
        .await
        .context("fetch stream contract")?;
    let url = ws_url(client.base_url(), client.tenant());
    let mut last_seq: Option<u64> = None;
    let mut attempt = 0u32;

    loop {
        let before = last_seq;
        match tail_once(&url, &topics, series.as_deref(), &mut last_seq, json).await {
            Ok(Some(CLOSE_POLICY)) => anyhow::bail!("server rejected the subscription"),
            Ok(code) => tracing::info!(code = ?code, "stream closed"),
            Err(err) => tracing::warn!(error = %err, "stream failed"),
        }
        if last_seq != before {
            attempt = 0;
        }
        attempt += 1;
        let delay = reconnect_delay(&contract.reconnect, attempt);
        eprintln!("reconnecting in {}", humantime::format_duration(delay));
        tokio::time::sleep(delay).await;
    }
}

async fn tail_once(
    url: &str,
    topics: &[String],
    series: Option<&str>,
    last_seq: &mut Option<u64>,
    json: bool,
) -> anyhow::Result<Option<u16>> {
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("connect {url}"))?;
    let (mut write, mut read) = ws.split();

    let subscribe = ClientMessage::Subscribe {
        topics: topics.to_vec(),
        last_seq: *last_seq,
        series: series.map(str::to_string),
    };
    write
        .send(Message::Text(serde_json::to_string(&subscribe)?.into()))
        .await
        .context("send subscribe frame")?;

    while let Some(msg) = read.next().await {
        match msg.context("read stream frame")? {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::debug!(error = %err, "skipping unreadable frame");
                        continue;
                    }
                };
                *last_seq = Some(envelope.seq);
                if json {
                    println!("{}", text.as_str());
                } else {
                    print_envelope_human(&envelope);
                }
                let ack = ClientMessage::Ack { seq: envelope.seq };
                write
                    .send(Message::Text(serde_json::to_string(&ack)?.into()))
                    .await
                    .context("send ack")?;
            }
            Message::Close(frame) => return Ok(frame.map(|f| u16::from(f.code))),
            _ => {}
        }
    }
    Ok(None)
}

async fn run_server(
    ingest_http_addr: Option<String>,
    ingest_grpc_addr: Option<String>,
    query_http_addr: Option<String>,
    telemetry_cfg: TelemetryConfig,
) -> anyhow::Result<()> {
    let mut cfg = Config::load().context("load config")?;
    if let Some(v) = ingest_http_addr {
        cfg.ingest_http_addr = v;
    }
    if let Some(v) = ingest_grpc_addr {
        cfg.ingest_grpc_addr = v;
    }
    if let Some(v) = query_http_addr {
        cfg.query_http_addr = v;
    }
    let cfg = Arc::new(cfg);

    let registry = Arc::new(TenantRegistry::new(cfg.clone()));
    init_run_tracing(telemetry_cfg, Some(registry.clone()));

    eprintln!("tracepulse run");
    eprintln!("  ingest http: {}", cfg.ingest_http_addr);
    eprintln!("  ingest grpc: {}", cfg.ingest_grpc_addr);
    eprintln!("  query http: {}", cfg.query_http_addr);
    eprintln!(
        "  tick: {}  window: {} x {}",
        humantime::format_duration(cfg.tick_interval),
        cfg.window_buckets,
        humantime::format_duration(cfg.bucket_width)
    );

    let grpc_addr = cfg
        .ingest_grpc_addr
        .parse()
        .with_context(|| format!("invalid ingest grpc addr {}", cfg.ingest_grpc_addr))?;
    let http_addr = cfg
        .ingest_http_addr
        .parse()
        .with_context(|| format!("invalid ingest http addr {}", cfg.ingest_http_addr))?;
    let query_addr = cfg
        .query_http_addr
        .parse()
        .with_context(|| format!("invalid query http addr {}", cfg.query_http_addr))?;

    let ingest_task = tokio::spawn(tracepulse_ingest::server::run_ingest_servers(
        registry.clone(),
        grpc_addr,
        http_addr,
    ));
    let query_http_task = tokio::spawn(query_server::run_query_http_server(
        registry.clone(),
        cfg.clone(),
        query_addr,
    ));

    tokio::select! {
        res = ingest_task => {
            res??;
        }
        res = query_http_task => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    registry.shutdown_all();
    shutdown_tracing();
    Ok(())
}

#[cfg(test)]
mod tests {
    use tracepulse_core::config::BackoffStrategy;

    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tracepulse",
            "traces",
            "--service",
            "orders",
            "--errors",
            "--tenant",
            "acme",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.tenant.as_deref(), Some("acme"));
        match cli.command {
            Commands::Traces {
                service,
                errors,
                limit,
                ..
            } => {
                assert_eq!(service.as_deref(), Some("orders"));
                assert!(errors);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn tail_topics_split_on_commas() {
        let cli = Cli::try_parse_from(["tracepulse", "tail", "--topics", "stats,alerts"]).unwrap();
        match cli.command {
            Commands::Tail { topics, series } => {
                assert_eq!(topics, vec!["stats", "alerts"]);
                assert!(series.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn ws_url_follows_scheme_and_tenant() {
        assert_eq!(
            ws_url("http://127.0.0.1:1778", Some("acme")),
            "ws://127.0.0.1:1778/stream?tenant=acme"
        );
        assert_eq!(ws_url("https://pulse.example", None), "wss://pulse.example/stream");
    }

    #[test]
    fn reconnect_delay_stays_within_jitter_band() {
        let fixed = ReconnectPolicy::default();
        assert_eq!(reconnect_delay(&fixed, 1), Duration::from_secs(5));
        assert_eq!(reconnect_delay(&fixed, 7), Duration::from_secs(5));

        let exp = ReconnectPolicy {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.5,
        };
        for attempt in 1..10 {
            let base = exp.base_delay(attempt);
            let delay = reconnect_delay(&exp, attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 2);
        }
        assert_eq!(exp.base_delay(10), Duration::from_millis(1_000));
    }
}

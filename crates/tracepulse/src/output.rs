use std::collections::HashMap;

use chrono::SecondsFormat;
use owo_colors::OwoColorize;
use tracepulse_core::ids::SpanId;
use tracepulse_core::model::alert::{Alert, RulePhase, RuleStatus, Severity};
use tracepulse_core::model::service::ServiceMap;
use tracepulse_core::model::span::{Span, SpanStatus};
use tracepulse_core::model::stats::{EndpointStat, Stats, TimeSeries};
use tracepulse_core::query::{StatusResponse, TraceResponse, TraceSummary};
use tracepulse_core::stream::{Envelope, MessageType};

pub fn print_traces_human(v: &[TraceSummary]) {
    for item in v {
        println!(
            "{} trace={} duration={:.1}ms spans={} errors={} status={} root=\"{} {}\"{}",
            item.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            item.trace_id,
            item.total_duration_ms,
            item.span_count,
            item.error_count,
            status_label(item.status),
            item.root_service,
            item.root_operation,
            if item.completed { "" } else { " (active)" }
        );
    }
    println!("-- {} traces --", v.len());
}

pub fn print_trace_human(v: &TraceResponse) {
    let s = &v.summary;
    println!(
        "TRACE {} duration={:.1}ms spans={} errors={} services={}",
        s.trace_id,
        s.total_duration_ms,
        s.span_count,
        s.error_count,
        s.services.join(",")
    );

    let by_id: HashMap<&SpanId, &Span> = v.spans.iter().map(|s| (&s.span_id, s)).collect();
    for entry in &v.hierarchy.entries {
        let indent = "  ".repeat(entry.depth);
        match by_id.get(&entry.span_id) {
            Some(span) => println!(
                "{}{} {} ({:.1}ms) {}",
                indent,
                span.service_name,
                span.operation_name,
                span.duration_ms,
                status_label(span.status)
            ),
            None => println!("{indent}[missing parent {}]", entry.span_id),
        }
    }
    if v.hierarchy.orphan_count > 0 {
        println!("orphans={}", v.hierarchy.orphan_count);
    }
    if v.hierarchy.cyclic {
        println!("{}", "parent links form a cycle; spans listed flat".yellow());
    }
}

pub fn print_stats_human(v: &Stats) {
    println!(
        "window={}s requests={} rps={:.2} errors={} error_rate={:.2}%",
        v.window_seconds,
        v.total_requests,
        v.requests_per_second,
        v.error_count,
        v.error_rate * 100.0
    );
    println!(
        "latency avg={:.1}ms p50={:.1}ms p95={:.1}ms p99={:.1}ms",
        v.avg_latency_ms, v.p50_latency_ms, v.p95_latency_ms, v.p99_latency_ms
    );
    println!(
        "bytes={} bandwidth={:.0}B/s dropped={} late={} future={}",
        v.bytes_transferred,
        v.bandwidth_bytes_per_second,
        v.dropped_events,
        v.late_events,
        v.future_events
    );
    let codes = v
        .status_codes
        .iter()
        .map(|(code, count)| format!("{code}={count}"))
        .collect::<Vec<_>>();
    println!("status_codes {}", codes.join(" "));
}

pub fn print_endpoints_human(v: &[EndpointStat]) {
    for e in v {
        println!(
            "{} count={} errors={} error_rate={:.2}% avg={:.1}ms",
            e.endpoint,
            e.count,
            e.error_count,
            e.error_rate * 100.0,
            e.avg_latency_ms
        );
    }
    println!("-- {} endpoints --", v.len());
}

pub fn print_time_series_human(v: &TimeSeries) {
    for point in &v.points {
        println!(
            "{} {}={:.3}",
            point.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            v.metric,
            point.value
        );
    }
    println!("-- {} points ({}s buckets) --", v.points.len(), v.bucket_seconds);
}

pub fn print_service_map_human(v: &ServiceMap) {
    println!(
        "generated={} lookback={}s traces={}",
        v.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        v.lookback_seconds,
        v.trace_count
    );
    for node in &v.services {
        println!(
            "service={} spans={} requests={} error_rate={:.2}% avg={:.1}ms",
            node.name,
            node.span_count,
            node.request_count,
            node.error_rate * 100.0,
            node.avg_duration_ms
        );
    }
    for edge in &v.edges {
        println!(
            "  {} -> {} calls={} errors={}",
            edge.caller, edge.callee, edge.call_count, edge.error_count
        );
    }
    println!("-- {} services, {} edges --", v.services.len(), v.edges.len());
}

pub fn print_alerts_human(v: &[Alert]) {
    for alert in v {
        print_alert_line(alert);
    }
    println!("-- {} alerts --", v.len());
}

pub fn print_rules_human(v: &[RuleStatus]) {
    for status in v {
        let phase = match status.phase {
            RulePhase::Armed => "armed".to_string(),
            RulePhase::Firing { since } => {
                format!("firing since {}", since.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            RulePhase::Cooldown { until } => {
                format!("cooldown until {}", until.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        };
        println!(
            "{} {} {} {} {} fired={} [{}]",
            severity_label(status.rule.severity),
            status.rule.name,
            status.rule.metric,
            status.rule.comparator,
            status.rule.threshold,
            status.fired_count,
            phase
        );
        if let Some(err) = &status.last_error {
            println!("  {}", err.red());
        }
    }
    println!("-- {} rules --", v.len());
}

pub fn print_status_human(v: &StatusResponse) {
    println!("version={}", v.version);
    for t in &v.tenants {
        println!(
            "tenant={} active_traces={} completed_traces={} spans={} queue={} dropped={} late_spans={} subscribers={} rules={}",
            t.tenant_id,
            t.active_traces,
            t.completed_traces,
            t.span_count,
            t.queue_depth,
            t.dropped_events,
            t.late_spans,
            t.subscribers,
            t.alert_rules
        );
    }
    if !v.deactivated.is_empty() {
        println!("deactivated={}", v.deactivated.join(","));
    }
}

/// One line per pushed frame for `tail`.
pub fn print_envelope_human(env: &Envelope) {
    let seq = format!("#{}", env.seq);
    match env.kind {
        MessageType::StatsUpdate => {
            if let Ok(stats) = serde_json::from_value::<Stats>(env.data.clone()) {
                println!(
                    "{} stats rps={:.2} error_rate={:.2}% p95={:.1}ms dropped={}",
                    seq.dimmed(),
                    stats.requests_per_second,
                    stats.error_rate * 100.0,
                    stats.p95_latency_ms,
                    stats.dropped_events
                );
                return;
            }
        }
        MessageType::Alert => {
            if let Ok(alert) = serde_json::from_value::<Alert>(env.data.clone()) {
                print!("{} ", seq.dimmed());
                print_alert_line(&alert);
                return;
            }
        }
        MessageType::Trace => {
            if let Ok(trace) = serde_json::from_value::<TraceSummary>(env.data.clone()) {
                println!(
                    "{} trace={} {} {} ({:.1}ms) {}",
                    seq.dimmed(),
                    trace.trace_id,
                    trace.root_service,
                    trace.root_operation,
                    trace.total_duration_ms,
                    status_label(trace.status)
                );
                return;
            }
        }
        MessageType::Heartbeat => {
            println!("{} heartbeat", seq.dimmed());
            return;
        }
        _ => {}
    }
    let kind = serde_json::to_value(env.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    println!("{} {} {}", seq.dimmed(), kind, env.data);
}

fn print_alert_line(alert: &Alert) {
    println!(
        "{} {} {} {} {} value={:.3} rule={} | {}",
        alert.triggered_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        severity_label(alert.severity),
        alert.metric,
        alert.comparator,
        alert.threshold,
        alert.value,
        alert.rule,
        alert.message
    );
}

fn severity_label(severity: Severity) -> String {
    let label = severity.as_str().to_ascii_uppercase();
    match severity {
        Severity::Low => label.dimmed().to_string(),
        Severity::Medium => label.yellow().to_string(),
        Severity::High => label.red().to_string(),
        Severity::Critical => label.bright_red().bold().to_string(),
    }
}

fn status_label(status: SpanStatus) -> String {
    match status {
        SpanStatus::Ok => status.as_str().green().to_string(),
        SpanStatus::Error => status.as_str().red().to_string(),
        SpanStatus::Timeout => status.as_str().yellow().to_string(),
    }
}

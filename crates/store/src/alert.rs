use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracepulse_core::model::alert::{Alert, AlertRule, RulePhase, RuleStatus};
use tracepulse_core::model::stats::Stats;
use tracing::{debug, warn};

/// Per-rule Armed → Firing → Cooldown → Armed state machine. A sustained
/// breach yields one alert per cooldown period.
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    rules: Vec<RuleStatus>,
    history: VecDeque<Alert>,
    history_limit: usize,
}

impl AlertEvaluator {
    pub fn new(rules: Vec<AlertRule>, history_limit: usize) -> Self {
        let mut evaluator = Self {
            rules: Vec::new(),
            history: VecDeque::new(),
            history_limit,
        };
        evaluator.replace_rules(rules);
        evaluator
    }

    /// Installs a new rule set. Every rule restarts in `Armed`.
    pub fn replace_rules(&mut self, rules: Vec<AlertRule>) {
        self.rules = rules
            .into_iter()
            .map(|rule| {
                let last_error = rule.resolve().err().map(|e| e.to_string());
                if let Some(error) = &last_error {
                    warn!(rule = %rule.name, %error, "alert rule will be skipped until corrected");
                }
                RuleStatus {
                    rule,
                    phase: RulePhase::Armed,
                    last_value: None,
                    last_error,
                    fired_count: 0,
                }
            })
            .collect();
    }

    pub fn rules(&self) -> &[RuleStatus] {
        &self.rules
    }

    /// Most recent alerts, newest last.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Runs one evaluation pass at tick time `now`. A rule that cannot be
    /// resolved is recorded and skipped; the remaining rules still run.
    pub fn evaluate(&mut self, stats: &Stats, now: DateTime<Utc>) -> Vec<Alert> {
        let mut fired = Vec::new();
        for status in &mut self.rules {
            let (metric, comparator) = match status.rule.resolve() {
                Ok(resolved) => resolved,
                Err(err) => {
                    debug!(rule = %status.rule.name, error = %err, "skipping alert rule");
                    status.last_error = Some(err.to_string());
                    continue;
                }
            };
            status.last_error = None;

            if let RulePhase::Firing { since } = status.phase {
                let until = i64::try_from(status.rule.cooldown_seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|cooldown| since.checked_add_signed(cooldown))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                status.phase = RulePhase::Cooldown { until };
            }
            if let RulePhase::Cooldown { until } = status.phase
                && now >= until
            {
                status.phase = RulePhase::Armed;
            }

            let value = metric.value_of(stats);
            status.last_value = Some(value);
            if status.phase != RulePhase::Armed || !comparator.holds(value, status.rule.threshold)
            {
                continue;
            }

            status.phase = RulePhase::Firing { since: now };
            status.fired_count += 1;
            let message = status.rule.message.clone().unwrap_or_else(|| {
                format!(
                    "{} {} {} (value {:.4})",
                    metric, comparator, status.rule.threshold, value
                )
            });
            fired.push(Alert {
                id: uuid::Uuid::new_v4().to_string(),
                rule: status.rule.name.clone(),
                metric,
                comparator,
                threshold: status.rule.threshold,
                value,
                severity: status.rule.severity,
                message,
                triggered_at: now,
            });
        }

        for alert in &fired {
            if self.history.len() >= self.history_limit.max(1) {
                self.history.pop_front();
            }
            self.history.push_back(alert.clone());
        }
        fired
    }
}

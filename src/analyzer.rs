//! Session analysis.
//!
//! Two kinds of work live here:
//! - **Per-session checks**, run by the queue workers after ingestion. They
//!   compare what a client reported in `metrics` against the turns it sent
//!   and persist a `SessionAnalysis`.
//! - **Per-agent windows**, served on request: aggregate metrics over the
//!   last N hours, regressions against the preceding baseline window, and
//!   z-score anomalies among the sessions in the window.

use crate::config::AnalyzerConfig;
use crate::db::{SessionStore, StoreError};
use crate::model::{AgentSession, Finding, FindingKind, Outcome, SessionAnalysis};
use crate::queue::{JobFailure, SessionProcessor};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobFailure for AnalysisError {
    fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::SessionNotFound(_) => false,
            AnalysisError::Store(StoreError::Closed | StoreError::Codec(_)) => false,
            AnalysisError::Store(_) => true,
        }
    }
}

/// Aggregates over one agent's sessions in a time window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentMetricsReport {
    pub agent_name: String,
    pub time_window_hours: u32,
    pub session_count: usize,
    pub total_turns: u64,
    pub total_llm_calls: u64,
    pub total_tool_calls: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_latency: u64,
    pub avg_turns_per_session: f64,
    pub avg_tokens_per_session: f64,
    pub avg_cost_per_session: f64,
    pub avg_latency_per_session: f64,
    pub avg_latency_per_turn: f64,
    /// Share of sessions with a known outcome that succeeded.
    pub success_rate: Option<f64>,
    pub avg_time_to_first_response: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackedMetric {
    AvgLatencyPerSession,
    AvgCostPerSession,
    AvgTurnsPerSession,
    AvgTokensPerSession,
    SuccessRate,
}

impl TrackedMetric {
    const ALL: [TrackedMetric; 5] = [
        TrackedMetric::AvgLatencyPerSession,
        TrackedMetric::AvgCostPerSession,
        TrackedMetric::AvgTurnsPerSession,
        TrackedMetric::AvgTokensPerSession,
        TrackedMetric::SuccessRate,
    ];

    fn higher_is_worse(self) -> bool {
        !matches!(self, TrackedMetric::SuccessRate)
    }

    fn value(self, s: &WindowSummary) -> Option<f64> {
        match self {
            TrackedMetric::AvgLatencyPerSession => Some(s.per_session(s.total_latency as f64)),
            TrackedMetric::AvgCostPerSession => Some(s.per_session(s.total_cost)),
            TrackedMetric::AvgTurnsPerSession => Some(s.per_session(s.total_turns as f64)),
            TrackedMetric::AvgTokensPerSession => Some(s.per_session(s.total_tokens as f64)),
            TrackedMetric::SuccessRate => s.success_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// A tracked metric that got worse relative to the baseline window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Regression {
    pub metric: TrackedMetric,
    pub baseline_value: f64,
    pub current_value: f64,
    /// Signed relative change, current vs baseline.
    pub change_pct: f64,
    pub severity: Severity,
    pub baseline_sessions: usize,
    pub current_sessions: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMetric {
    TotalLatency,
    TotalCost,
    TotalTurns,
    TotalTokens,
}

impl SessionMetric {
    const ALL: [SessionMetric; 4] = [
        SessionMetric::TotalLatency,
        SessionMetric::TotalCost,
        SessionMetric::TotalTurns,
        SessionMetric::TotalTokens,
    ];

    fn value(self, s: &AgentSession) -> f64 {
        match self {
            SessionMetric::TotalLatency => s.metrics.total_latency as f64,
            SessionMetric::TotalCost => s.metrics.total_cost,
            SessionMetric::TotalTurns => s.metrics.total_turns as f64,
            SessionMetric::TotalTokens => s.metrics.total_tokens as f64,
        }
    }
}

/// One session whose metric sits far from the window's mean.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Anomaly {
    pub session_id: String,
    pub metric: SessionMetric,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
}

/// Running totals over a set of sessions.
#[derive(Debug, Default, Clone, PartialEq)]
struct WindowSummary {
    session_count: usize,
    total_turns: u64,
    total_llm_calls: u64,
    total_tool_calls: u64,
    total_tokens: u64,
    total_cost: f64,
    total_latency: u64,
    known_outcomes: usize,
    successes: usize,
    ttfr_sum: u64,
    ttfr_count: usize,
}

impl WindowSummary {
    fn from_sessions(sessions: &[AgentSession]) -> Self {
        let mut s = Self::default();
        for session in sessions {
            let m = &session.metrics;
            // Counters are client-reported; any u64 passes ingest.
            s.session_count += 1;
            s.total_turns = s.total_turns.saturating_add(m.total_turns);
            s.total_llm_calls = s.total_llm_calls.saturating_add(m.total_llm_calls);
            s.total_tool_calls = s.total_tool_calls.saturating_add(m.total_tool_calls);
            s.total_tokens = s.total_tokens.saturating_add(m.total_tokens);
            s.total_cost += m.total_cost;
            s.total_latency = s.total_latency.saturating_add(m.total_latency);
            match session.outcome() {
                Outcome::Success => {
                    s.known_outcomes += 1;
                    s.successes += 1;
                }
                Outcome::Failure => s.known_outcomes += 1,
                Outcome::Unknown => {}
            }
            if let Some(ttfr) = m.time_to_first_response {
                s.ttfr_sum = s.ttfr_sum.saturating_add(ttfr);
                s.ttfr_count += 1;
            }
        }
        s
    }

    fn per_session(&self, total: f64) -> f64 {
        if self.session_count == 0 {
            0.0
        } else {
            total / self.session_count as f64
        }
    }

    fn success_rate(&self) -> Option<f64> {
        (self.known_outcomes > 0).then(|| self.successes as f64 / self.known_outcomes as f64)
    }

    fn into_report(self, agent_name: &str, hours: u32) -> AgentMetricsReport {
        let avg_latency_per_turn = if self.total_turns == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.total_turns as f64
        };
        AgentMetricsReport {
            agent_name: agent_name.to_string(),
            time_window_hours: hours,
            session_count: self.session_count,
            total_turns: self.total_turns,
            total_llm_calls: self.total_llm_calls,
            total_tool_calls: self.total_tool_calls,
            total_tokens: self.total_tokens,
            total_cost: self.total_cost,
            total_latency: self.total_latency,
            avg_turns_per_session: self.per_session(self.total_turns as f64),
            avg_tokens_per_session: self.per_session(self.total_tokens as f64),
            avg_cost_per_session: self.per_session(self.total_cost),
            avg_latency_per_session: self.per_session(self.total_latency as f64),
            avg_latency_per_turn,
            success_rate: self.success_rate(),
            avg_time_to_first_response: (self.ttfr_count > 0)
                .then(|| self.ttfr_sum as f64 / self.ttfr_count as f64),
        }
    }
}

/// Consistency checks between a session's reported summary and its turns.
pub fn inspect_session(session: &AgentSession) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Some(w) = session
        .turns
        .windows(2)
        .find(|w| w[1].turn_number < w[0].turn_number)
    {
        findings.push(Finding {
            kind: FindingKind::TurnsOutOfOrder,
            detail: format!(
                "turn {} follows turn {}",
                w[1].turn_number, w[0].turn_number
            ),
        });
    }

    let mut seen = HashSet::with_capacity(session.turns.len());
    if let Some(dup) = session
        .turns
        .iter()
        .find(|t| !seen.insert(t.turn_number))
    {
        findings.push(Finding {
            kind: FindingKind::DuplicateTurnNumber,
            detail: format!("turn number {} appears more than once", dup.turn_number),
        });
    }

    let actual_turns = session.turns.len() as u64;
    if session.metrics.total_turns != actual_turns {
        findings.push(Finding {
            kind: FindingKind::TurnCountMismatch,
            detail: format!(
                "reported {} turns, received {}",
                session.metrics.total_turns, actual_turns
            ),
        });
    }

    let actual_calls = session.counted_llm_calls();
    if session.metrics.total_llm_calls != actual_calls {
        findings.push(Finding {
            kind: FindingKind::LlmCallCountMismatch,
            detail: format!(
                "reported {} LLM calls, received {}",
                session.metrics.total_llm_calls, actual_calls
            ),
        });
    }

    if let Some(end) = session.end_time.filter(|end| *end < session.start_time) {
        findings.push(Finding {
            kind: FindingKind::NegativeDuration,
            detail: format!("ends at {end}, before start at {}", session.start_time),
        });
    }

    findings
}

fn compare_windows(
    baseline: &WindowSummary,
    current: &WindowSummary,
    config: &AnalyzerConfig,
) -> Vec<Regression> {
    if baseline.session_count < config.min_samples || current.session_count < config.min_samples
    {
        return Vec::new();
    }

    TrackedMetric::ALL
        .iter()
        .filter_map(|&metric| {
            let base = metric.value(baseline)?;
            let cur = metric.value(current)?;
            if base == 0.0 {
                return None;
            }
            let change_pct = (cur - base) / base * 100.0;
            let worsening = if metric.higher_is_worse() {
                change_pct
            } else {
                -change_pct
            };
            let severity = if worsening >= config.critical_threshold_pct {
                Severity::Critical
            } else if worsening >= config.warning_threshold_pct {
                Severity::Warning
            } else {
                return None;
            };
            Some(Regression {
                metric,
                baseline_value: base,
                current_value: cur,
                change_pct,
                severity,
                baseline_sessions: baseline.session_count,
                current_sessions: current.session_count,
            })
        })
        .collect()
}

fn find_anomalies(sessions: &[AgentSession], config: &AnalyzerConfig) -> Vec<Anomaly> {
    if sessions.len() < config.min_samples || sessions.is_empty() {
        return Vec::new();
    }

    let mut anomalies = Vec::new();
    for metric in SessionMetric::ALL {
        let values: Vec<f64> = sessions.iter().map(|s| metric.value(s)).collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        // Identical values can leave rounding noise instead of an exact zero.
        if std_dev <= f64::EPSILON * mean.abs().max(1.0) {
            continue;
        }

        for (session, value) in sessions.iter().zip(values) {
            let z_score = (value - mean) / std_dev;
            if z_score.abs() >= config.anomaly_z_threshold {
                anomalies.push(Anomaly {
                    session_id: session.session_id.clone(),
                    metric,
                    value,
                    mean,
                    std_dev,
                    z_score,
                });
            }
        }
    }
    anomalies
}

pub struct SessionAnalyzer {
    store: Arc<dyn SessionStore>,
    config: AnalyzerConfig,
}

impl SessionAnalyzer {
    pub fn new(store: Arc<dyn SessionStore>, config: AnalyzerConfig) -> Self {
        Self { store, config }
    }

    /// Load a stored session, check it, and persist the result.
    pub async fn analyze_session(&self, session_id: &str) -> Result<SessionAnalysis, AnalysisError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AnalysisError::SessionNotFound(session_id.to_string()))?;

        let findings = inspect_session(&session);
        let analysis = SessionAnalysis {
            session_id: session.session_id.clone(),
            agent_name: session.agent_name.clone(),
            analyzed_at: Utc::now(),
            flagged: !findings.is_empty(),
            findings,
        };
        self.store.save_analysis(&analysis).await?;

        if analysis.flagged {
            tracing::info!(
                session_id,
                agent = %analysis.agent_name,
                findings = analysis.findings.len(),
                "session flagged by analysis"
            );
        }
        Ok(analysis)
    }

    pub async fn get_agent_metrics(
        &self,
        agent_name: &str,
        hours: u32,
    ) -> Result<AgentMetricsReport, AnalysisError> {
        self.get_agent_metrics_at(agent_name, hours, Utc::now().timestamp_millis())
            .await
    }

    pub async fn detect_regressions(
        &self,
        agent_name: &str,
        hours: u32,
    ) -> Result<Vec<Regression>, AnalysisError> {
        self.detect_regressions_at(agent_name, hours, Utc::now().timestamp_millis())
            .await
    }

    pub async fn detect_anomalies(
        &self,
        agent_name: &str,
        hours: u32,
    ) -> Result<Vec<Anomaly>, AnalysisError> {
        self.detect_anomalies_at(agent_name, hours, Utc::now().timestamp_millis())
            .await
    }

    /// Sessions that started within `hours` before `now_ms`. Sessions
    /// stamped in the future (client clock skew) are included.
    async fn current_window(
        &self,
        agent_name: &str,
        hours: u32,
        now_ms: i64,
    ) -> Result<Vec<AgentSession>, AnalysisError> {
        let from = now_ms - i64::from(hours) * HOUR_MS;
        Ok(self
            .store
            .sessions_in_range(agent_name, from, i64::MAX)
            .await?)
    }

    async fn get_agent_metrics_at(
        &self,
        agent_name: &str,
        hours: u32,
        now_ms: i64,
    ) -> Result<AgentMetricsReport, AnalysisError> {
        let sessions = self.current_window(agent_name, hours, now_ms).await?;
        Ok(WindowSummary::from_sessions(&sessions).into_report(agent_name, hours))
    }

    async fn detect_regressions_at(
        &self,
        agent_name: &str,
        hours: u32,
        now_ms: i64,
    ) -> Result<Vec<Regression>, AnalysisError> {
        let window_ms = i64::from(hours) * HOUR_MS;
        let current_start = now_ms - window_ms;
        let baseline_start =
            current_start - window_ms * i64::from(self.config.baseline_window_multiplier);

        let current = self.current_window(agent_name, hours, now_ms).await?;
        let baseline = self
            .store
            .sessions_in_range(agent_name, baseline_start, current_start)
            .await?;

        let regressions = compare_windows(
            &WindowSummary::from_sessions(&baseline),
            &WindowSummary::from_sessions(&current),
            &self.config,
        );
        tracing::debug!(
            agent = agent_name,
            hours,
            baseline_sessions = baseline.len(),
            current_sessions = current.len(),
            regressions = regressions.len(),
            "regression check"
        );
        Ok(regressions)
    }

    async fn detect_anomalies_at(
        &self,
        agent_name: &str,
        hours: u32,
        now_ms: i64,
    ) -> Result<Vec<Anomaly>, AnalysisError> {
        let sessions = self.current_window(agent_name, hours, now_ms).await?;
        Ok(find_anomalies(&sessions, &self.config))
    }
}

#[async_trait]
impl SessionProcessor for SessionAnalyzer {
    type Error = AnalysisError;

    async fn process(&self, session_id: &str) -> Result<(), AnalysisError> {
        self.analyze_session(session_id).await.map(|_| ())
    }
}

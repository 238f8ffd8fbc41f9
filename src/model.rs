/// Internal session model.
///
/// These are the validated, canonical records the store and analyzer work
/// with. Field names are snake_case; the camelCase client format lives in
/// `wire.rs`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type JsonObject = Map<String, Value>;

/// One complete recorded interaction between an agent and a user or task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub agent_name: String,
    pub user_id: Option<String>,
    /// Epoch milliseconds.
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub initial_request: String,
    pub final_outcome: Option<JsonObject>,
    pub turns: Vec<Turn>,
    pub metrics: SessionMetrics,
    pub metadata: Option<JsonObject>,
    /// Distinct tags in first-seen order.
    pub tags: Option<Vec<String>>,
}

/// One request/response cycle within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub turn_number: i64,
    pub timestamp: i64,
    pub trigger: JsonObject,
    pub agent_response: Option<JsonObject>,
    pub llm_calls: Vec<JsonObject>,
    pub user_feedback: Option<JsonObject>,
}

/// Summary counters reported by the client for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionMetrics {
    pub total_turns: u64,
    pub total_llm_calls: u64,
    pub total_tool_calls: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_latency: u64,
    pub average_latency_per_turn: f64,
    pub average_cost_per_turn: f64,
    pub time_to_first_response: Option<u64>,
    pub time_to_resolution: Option<u64>,
}

/// Result of the background consistency check on one stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnalysis {
    pub session_id: String,
    pub agent_name: String,
    pub analyzed_at: DateTime<Utc>,
    pub flagged: bool,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    TurnsOutOfOrder,
    DuplicateTurnNumber,
    TurnCountMismatch,
    LlmCallCountMismatch,
    NegativeDuration,
}

/// Outcome of a session as far as it can be read from `final_outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
}

impl AgentSession {
    /// Classify `final_outcome`: a boolean `success` field wins, otherwise a
    /// `status` string is matched against known values.
    pub fn outcome(&self) -> Outcome {
        let Some(outcome) = &self.final_outcome else {
            return Outcome::Unknown;
        };

        if let Some(success) = outcome.get("success").and_then(Value::as_bool) {
            return if success {
                Outcome::Success
            } else {
                Outcome::Failure
            };
        }

        match outcome
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("success" | "succeeded" | "resolved" | "completed") => Outcome::Success,
            Some("failure" | "failed" | "error" | "abandoned") => Outcome::Failure,
            _ => Outcome::Unknown,
        }
    }

    /// Number of LLM calls actually present across all turns.
    pub fn counted_llm_calls(&self) -> u64 {
        self.turns.iter().map(|t| t.llm_calls.len() as u64).sum()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::session;
    use super::*;
    use serde_json::json;

    fn with_outcome(v: Value) -> AgentSession {
        let mut s = session("s1", "bot", 0);
        s.final_outcome = v.as_object().cloned();
        s
    }

    #[test]
    fn outcome_from_success_flag() {
        assert_eq!(with_outcome(json!({"success": true})).outcome(), Outcome::Success);
        assert_eq!(with_outcome(json!({"success": false})).outcome(), Outcome::Failure);
    }

    #[test]
    fn outcome_from_status_string() {
        assert_eq!(with_outcome(json!({"status": "Resolved"})).outcome(), Outcome::Success);
        assert_eq!(with_outcome(json!({"status": "failed"})).outcome(), Outcome::Failure);
        assert_eq!(with_outcome(json!({"status": "pending"})).outcome(), Outcome::Unknown);
    }

    #[test]
    fn success_flag_wins_over_status() {
        let s = with_outcome(json!({"success": false, "status": "completed"}));
        assert_eq!(s.outcome(), Outcome::Failure);
    }

    #[test]
    fn missing_outcome_is_unknown() {
        let mut s = session("s1", "bot", 0);
        s.final_outcome = None;
        assert_eq!(s.outcome(), Outcome::Unknown);
    }

    #[test]
    fn counted_llm_calls_sums_turns() {
        let s = session("s1", "bot", 0);
        assert_eq!(s.counted_llm_calls(), 2);
    }
}

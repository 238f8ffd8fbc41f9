/// Client-facing JSON format for sessions.
///
/// Clients send and receive camelCase field names (`sessionId`,
/// `totalLLMCalls`, ...). snake_case names are accepted on input as aliases.
/// `IngestRequest::into_sessions` is the only way a wire batch becomes
/// internal `AgentSession`s, and it is where batch-level validation happens.
use crate::model::{AgentSession, JsonObject, SessionMetrics, Turn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSession {
    #[serde(rename = "sessionId", alias = "session_id")]
    pub session_id: String,
    #[serde(rename = "agentName", alias = "agent_name")]
    pub agent_name: String,
    #[serde(rename = "userId", alias = "user_id", default)]
    pub user_id: Option<String>,
    #[serde(rename = "startTime", alias = "start_time")]
    pub start_time: i64,
    #[serde(rename = "endTime", alias = "end_time", default)]
    pub end_time: Option<i64>,
    #[serde(rename = "initialRequest", alias = "initial_request")]
    pub initial_request: String,
    #[serde(rename = "finalOutcome", alias = "final_outcome", default)]
    pub final_outcome: Option<JsonObject>,
    pub turns: Vec<WireTurn>,
    pub metrics: WireMetrics,
    #[serde(default)]
    pub metadata: Option<JsonObject>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTurn {
    #[serde(rename = "turnId", alias = "turn_id")]
    pub turn_id: String,
    #[serde(rename = "turnNumber", alias = "turn_number")]
    pub turn_number: i64,
    pub timestamp: i64,
    pub trigger: JsonObject,
    #[serde(rename = "agentResponse", alias = "agent_response", default)]
    pub agent_response: Option<JsonObject>,
    #[serde(rename = "llmCalls", alias = "llm_calls")]
    pub llm_calls: Vec<JsonObject>,
    #[serde(rename = "userFeedback", alias = "user_feedback", default)]
    pub user_feedback: Option<JsonObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMetrics {
    #[serde(rename = "totalTurns", alias = "total_turns")]
    pub total_turns: u64,
    #[serde(rename = "totalLLMCalls", alias = "total_llm_calls")]
    pub total_llm_calls: u64,
    #[serde(rename = "totalToolCalls", alias = "total_tool_calls")]
    pub total_tool_calls: u64,
    #[serde(rename = "totalTokens", alias = "total_tokens")]
    pub total_tokens: u64,
    #[serde(rename = "totalCost", alias = "total_cost")]
    pub total_cost: f64,
    #[serde(rename = "totalLatency", alias = "total_latency")]
    pub total_latency: u64,
    #[serde(rename = "averageLatencyPerTurn", alias = "average_latency_per_turn")]
    pub average_latency_per_turn: f64,
    #[serde(rename = "averageCostPerTurn", alias = "average_cost_per_turn")]
    pub average_cost_per_turn: f64,
    #[serde(
        rename = "timeToFirstResponse",
        alias = "time_to_first_response",
        default
    )]
    pub time_to_first_response: Option<u64>,
    #[serde(rename = "timeToResolution", alias = "time_to_resolution", default)]
    pub time_to_resolution: Option<u64>,
}

/// Body of `POST /v1/sessions/ingest`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub sessions: Vec<WireSession>,
    /// Client submission time, epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestResponse {
    pub success: bool,
    pub sessions_received: usize,
    pub message: String,
}

impl IngestResponse {
    pub fn received(count: usize) -> Self {
        Self {
            success: true,
            sessions_received: count,
            message: format!("Successfully received {count} session(s)"),
        }
    }
}

/// Batch validation failures. Each names the offending field by its wire path.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("sessions must contain at least one session")]
    EmptyBatch,
    #[error("sessions[{index}].{field} must not be empty")]
    EmptyField { index: usize, field: &'static str },
    #[error("sessions[{index}].turns[{turn}].turnId must not be empty")]
    EmptyTurnId { index: usize, turn: usize },
    #[error("sessions[{index}].sessionId '{session_id}' appears more than once in the batch")]
    DuplicateSessionId { index: usize, session_id: String },
}

impl IngestRequest {
    /// Validate the batch and convert it into internal sessions, keeping
    /// batch order.
    pub fn into_sessions(self) -> Result<Vec<AgentSession>, ValidationError> {
        if self.sessions.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }

        let mut seen = HashSet::with_capacity(self.sessions.len());
        let mut out = Vec::with_capacity(self.sessions.len());

        for (index, wire) in self.sessions.into_iter().enumerate() {
            if wire.session_id.trim().is_empty() {
                return Err(ValidationError::EmptyField {
                    index,
                    field: "sessionId",
                });
            }
            if wire.agent_name.trim().is_empty() {
                return Err(ValidationError::EmptyField {
                    index,
                    field: "agentName",
                });
            }
            if let Some(turn) = wire.turns.iter().position(|t| t.turn_id.trim().is_empty()) {
                return Err(ValidationError::EmptyTurnId { index, turn });
            }
            if !seen.insert(wire.session_id.clone()) {
                return Err(ValidationError::DuplicateSessionId {
                    index,
                    session_id: wire.session_id,
                });
            }
            out.push(AgentSession::from(wire));
        }

        Ok(out)
    }
}

fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(tags.len());
    tags.into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

impl From<WireSession> for AgentSession {
    fn from(w: WireSession) -> Self {
        Self {
            session_id: w.session_id,
            agent_name: w.agent_name,
            user_id: w.user_id,
            start_time: w.start_time,
            end_time: w.end_time,
            initial_request: w.initial_request,
            final_outcome: w.final_outcome,
            turns: w.turns.into_iter().map(Turn::from).collect(),
            metrics: SessionMetrics::from(w.metrics),
            metadata: w.metadata,
            tags: w.tags.map(dedup_tags),
        }
    }
}

impl From<WireTurn> for Turn {
    fn from(w: WireTurn) -> Self {
        Self {
            turn_id: w.turn_id,
            turn_number: w.turn_number,
            timestamp: w.timestamp,
            trigger: w.trigger,
            agent_response: w.agent_response,
            llm_calls: w.llm_calls,
            user_feedback: w.user_feedback,
        }
    }
}

impl From<WireMetrics> for SessionMetrics {
    fn from(w: WireMetrics) -> Self {
        Self {
            total_turns: w.total_turns,
            total_llm_calls: w.total_llm_calls,
            total_tool_calls: w.total_tool_calls,
            total_tokens: w.total_tokens,
            total_cost: w.total_cost,
            total_latency: w.total_latency,
            average_latency_per_turn: w.average_latency_per_turn,
            average_cost_per_turn: w.average_cost_per_turn,
            time_to_first_response: w.time_to_first_response,
            time_to_resolution: w.time_to_resolution,
        }
    }
}

impl From<&AgentSession> for WireSession {
    fn from(s: &AgentSession) -> Self {
        Self {
            session_id: s.session_id.clone(),
            agent_name: s.agent_name.clone(),
            user_id: s.user_id.clone(),
            start_time: s.start_time,
            end_time: s.end_time,
            initial_request: s.initial_request.clone(),
            final_outcome: s.final_outcome.clone(),
            turns: s.turns.iter().map(WireTurn::from).collect(),
            metrics: WireMetrics::from(&s.metrics),
            metadata: s.metadata.clone(),
            tags: s.tags.clone(),
        }
    }
}

impl From<&Turn> for WireTurn {
    fn from(t: &Turn) -> Self {
        Self {
            turn_id: t.turn_id.clone(),
            turn_number: t.turn_number,
            timestamp: t.timestamp,
            trigger: t.trigger.clone(),
            agent_response: t.agent_response.clone(),
            llm_calls: t.llm_calls.clone(),
            user_feedback: t.user_feedback.clone(),
        }
    }
}

impl From<&SessionMetrics> for WireMetrics {
    fn from(m: &SessionMetrics) -> Self {
        Self {
            total_turns: m.total_turns,
            total_llm_calls: m.total_llm_calls,
            total_tool_calls: m.total_tool_calls,
            total_tokens: m.total_tokens,
            total_cost: m.total_cost,
            total_latency: m.total_latency,
            average_latency_per_turn: m.average_latency_per_turn,
            average_cost_per_turn: m.average_cost_per_turn,
            time_to_first_response: m.time_to_first_response,
            time_to_resolution: m.time_to_resolution,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{ingest_body, wire_session};
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> IngestRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn camel_case_batch_converts() {
        let req = parse(ingest_body(vec![wire_session("s1", "support-bot", 1000)]));
        let sessions = req.into_sessions().unwrap();

        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.session_id, "s1");
        assert_eq!(s.agent_name, "support-bot");
        assert_eq!(s.metrics.total_llm_calls, 1);
        assert_eq!(s.metrics.time_to_first_response, Some(250));
        assert_eq!(s.metrics.time_to_resolution, None);
        assert_eq!(s.turns[0].turn_id, "s1-t1");
        assert!(s.turns[0].user_feedback.is_none());
    }

    #[test]
    fn snake_case_names_accepted() {
        let body = json!({
            "sessions": [{
                "session_id": "s9",
                "agent_name": "bot",
                "start_time": 5,
                "initial_request": "hi",
                "turns": [],
                "metrics": {
                    "total_turns": 0, "total_llm_calls": 0, "total_tool_calls": 0,
                    "total_tokens": 0, "total_cost": 0.0, "total_latency": 0,
                    "average_latency_per_turn": 0.0, "average_cost_per_turn": 0.0
                }
            }],
            "timestamp": 6
        });
        let sessions = parse(body).into_sessions().unwrap();
        assert_eq!(sessions[0].session_id, "s9");
        assert!(sessions[0].user_id.is_none());
    }

    #[test]
    fn missing_required_field_fails_to_deserialize() {
        let mut s = wire_session("s1", "bot", 0);
        s.as_object_mut().unwrap().remove("initialRequest");
        let result: Result<IngestRequest, _> = serde_json::from_value(ingest_body(vec![s]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("initialRequest"), "{err}");
    }

    #[test]
    fn trigger_must_be_an_object() {
        let mut s = wire_session("s1", "bot", 0);
        s["turns"][0]["trigger"] = json!("not-an-object");
        let result: Result<IngestRequest, _> = serde_json::from_value(ingest_body(vec![s]));
        assert!(result.is_err());
    }

    #[test]
    fn empty_batch_rejected() {
        let err = parse(ingest_body(vec![])).into_sessions().unwrap_err();
        assert_eq!(err, ValidationError::EmptyBatch);
    }

    #[test]
    fn blank_agent_name_rejected() {
        let req = parse(ingest_body(vec![
            wire_session("s1", "bot", 0),
            wire_session("s2", "  ", 0),
        ]));
        let err = req.into_sessions().unwrap_err();
        assert_eq!(
            err,
            ValidationError::EmptyField {
                index: 1,
                field: "agentName"
            }
        );
        assert_eq!(err.to_string(), "sessions[1].agentName must not be empty");
    }

    #[test]
    fn duplicate_session_in_batch_rejected() {
        let req = parse(ingest_body(vec![
            wire_session("dup", "bot", 0),
            wire_session("dup", "bot", 1),
        ]));
        assert!(matches!(
            req.into_sessions(),
            Err(ValidationError::DuplicateSessionId { index: 1, .. })
        ));
    }

    #[test]
    fn tags_deduplicated_in_order() {
        let mut s = wire_session("s1", "bot", 0);
        s["tags"] = json!(["b", "a", "b", "c", "a"]);
        let sessions = parse(ingest_body(vec![s])).into_sessions().unwrap();
        assert_eq!(
            sessions[0].tags.as_deref(),
            Some(&["b".to_string(), "a".to_string(), "c".to_string()][..])
        );
    }

    #[test]
    fn outgoing_wire_is_camel_case() {
        let sessions = parse(ingest_body(vec![wire_session("s1", "bot", 0)]))
            .into_sessions()
            .unwrap();
        let out = serde_json::to_value(WireSession::from(&sessions[0])).unwrap();

        assert_eq!(out["sessionId"], "s1");
        assert_eq!(out["metrics"]["totalLLMCalls"], 1);
        assert_eq!(out["turns"][0]["turnNumber"], 1);
        assert!(out.get("session_id").is_none());
        assert!(out["metrics"].get("total_llm_calls").is_none());
    }

    #[test]
    fn ingest_response_message() {
        let r = IngestResponse::received(2);
        assert!(r.success);
        assert_eq!(r.sessions_received, 2);
        assert_eq!(r.message, "Successfully received 2 session(s)");
    }
}

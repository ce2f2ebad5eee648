//! Core data model.
//!
//! A work item is something a remote worker has to do. The store owns its
//! lifecycle state; request and reply messages carry it across the channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Substring that marks a reply body as successful when the reply carries no
/// structured `success` flag.
pub const SUCCESS_MARKER: &str = "SUCCESS";

/// Reply body the default task produces.
pub const DEFAULT_SUCCESS_BODY: &str = "SUCCESS: Work completed!";

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked through `Pending -> InProgress -> {Completed, Failed}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Externally assigned identifier. Immutable.
    pub id: WorkId,

    /// Current lifecycle state.
    pub status: Status,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Outcome payload recorded by the completer.
    pub result: Option<String>,
}

impl WorkItem {
    /// A fresh item waiting to be dispatched.
    pub fn pending(id: WorkId) -> Self {
        Self {
            id,
            status: Status::Pending,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkId(pub i64);

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(WorkId)
            .map_err(|_| Error::Malformed(format!("invalid work item id: {s:?}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Waiting for the coordinator to dispatch it.
    Pending,
    /// Request published, reply not yet applied.
    InProgress,
    /// Worker reported success. Terminal.
    Completed,
    /// Worker reported failure. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, InProgress) | (InProgress, Completed) | (InProgress, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::InProgress => "InProgress",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(Status::Pending),
            "InProgress" => Ok(Status::InProgress),
            "Completed" => Ok(Status::Completed),
            "Failed" => Ok(Status::Failed),
            other => Err(Error::Other(format!("unknown status: {other}"))),
        }
    }
}

/// Check a requested transition against the state machine.
///
/// `Ok(false)` when `from` is terminal: terminal states absorb every further
/// attempt as a no-op. Any other disallowed pair is an error.
pub(crate) fn validate_transition(from: Status, to: Status) -> Result<bool> {
    if from.is_terminal() {
        Ok(false)
    } else if from.can_transition_to(to) {
        Ok(true)
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

// ---------------------------------------------------------------------------
// Transition fields
// ---------------------------------------------------------------------------

/// Columns written together with a status change. `None` leaves the column
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

impl TransitionFields {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn completed(at: DateTime<Utc>, result: impl Into<String>) -> Self {
        Self {
            completed_at: Some(at),
            result: Some(result.into()),
            ..Self::default()
        }
    }

    /// Apply to an in-memory copy of an item.
    pub fn apply(&self, item: &mut WorkItem, to: Status) {
        item.status = to;
        if let Some(at) = self.started_at {
            item.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            item.completed_at = Some(at);
        }
        if let Some(ref result) = self.result {
            item.result = Some(result.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Coordinator -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub correlation_id: String,
    pub reply_to: String,
    pub body: String,
}

impl RequestMessage {
    pub fn new(id: WorkId, reply_to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            correlation_id: id.to_string(),
            reply_to: reply_to.into(),
            body: body.into(),
        }
    }

    /// The reference request body for an item.
    pub fn default_body(id: WorkId) -> String {
        format!("Process work item {id}")
    }

    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let msg: Self = serde_json::from_value(payload.clone())
            .map_err(|e| Error::Malformed(format!("request: {e}")))?;
        if msg.reply_to.trim().is_empty() {
            return Err(Error::Malformed("request has no reply_to".to_string()));
        }
        Ok(msg)
    }
}

/// Worker -> completer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub correlation_id: String,
    pub body: String,

    /// Structured outcome. Older producers omit it and rely on the body marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl ReplyMessage {
    pub fn new(correlation_id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: outcome.body,
            success: Some(outcome.success),
        }
    }

    /// The work item this reply is for.
    pub fn work_id(&self) -> Result<WorkId> {
        self.correlation_id.parse()
    }

    /// Structured flag if present, otherwise the `SUCCESS` substring rule.
    pub fn is_success(&self) -> bool {
        self.success
            .unwrap_or_else(|| self.body.contains(SUCCESS_MARKER))
    }

    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| Error::Malformed(format!("reply: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a task produced. Opaque body plus a success/failure classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub body: String,
}

impl Outcome {
    pub fn success(body: impl Into<String>) -> Self {
        Self {
            success: true,
            body: body.into(),
        }
    }

    pub fn failure(body: impl Into<String>) -> Self {
        Self {
            success: false,
            body: body.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_forward_transitions_are_allowed() {
        assert!(Status::Pending.can_transition_to(Status::InProgress));
        assert!(Status::InProgress.can_transition_to(Status::Completed));
        assert!(Status::InProgress.can_transition_to(Status::Failed));

        assert!(!Status::Pending.can_transition_to(Status::Completed));
        assert!(!Status::InProgress.can_transition_to(Status::Pending));
        for terminal in [Status::Completed, Status::Failed] {
            assert!(terminal.is_terminal());
            for to in [Status::Pending, Status::InProgress, Status::Completed, Status::Failed] {
                assert!(!terminal.can_transition_to(to));
                assert!(!validate_transition(terminal, to).unwrap());
            }
        }
    }

    #[test]
    fn disallowed_pairs_from_live_states_are_errors() {
        assert!(validate_transition(Status::Pending, Status::InProgress).unwrap());
        for (from, to) in [
            (Status::Pending, Status::Completed),
            (Status::Pending, Status::Failed),
            (Status::InProgress, Status::Pending),
        ] {
            assert!(matches!(
                validate_transition(from, to),
                Err(Error::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn status_text_matches_store_column() {
        for status in [Status::Pending, Status::InProgress, Status::Completed, Status::Failed] {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert!("in_progress".parse::<Status>().is_err());
    }

    #[test]
    fn request_wire_format() {
        let msg = RequestMessage::new(WorkId(1), "work-replies", RequestMessage::default_body(WorkId(1)));
        assert_eq!(
            msg.to_payload().unwrap(),
            json!({
                "correlation_id": "1",
                "reply_to": "work-replies",
                "body": "Process work item 1"
            })
        );
    }

    #[test]
    fn request_without_reply_to_is_malformed() {
        let missing = json!({"correlation_id": "1", "body": "x"});
        assert!(matches!(
            RequestMessage::from_payload(&missing),
            Err(Error::Malformed(_))
        ));

        let empty = json!({"correlation_id": "1", "reply_to": " ", "body": "x"});
        assert!(matches!(
            RequestMessage::from_payload(&empty),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn reply_falls_back_to_marker_without_structured_flag() {
        let legacy = ReplyMessage::from_payload(&json!({
            "correlation_id": "7",
            "body": "SUCCESS: Work completed!"
        }))
        .unwrap();
        assert!(legacy.is_success());
        assert_eq!(legacy.work_id().unwrap(), WorkId(7));

        let failed = ReplyMessage::from_payload(&json!({
            "correlation_id": "7",
            "body": "disk full"
        }))
        .unwrap();
        assert!(!failed.is_success());
    }

    #[test]
    fn structured_flag_wins_over_marker() {
        let reply = ReplyMessage::new("3", Outcome::failure("SUCCESS was not achieved"));
        assert!(!reply.is_success());
    }

    #[test]
    fn bad_correlation_id_is_malformed() {
        let reply = ReplyMessage::new("abc", Outcome::success(DEFAULT_SUCCESS_BODY));
        assert!(matches!(reply.work_id(), Err(Error::Malformed(_))));
    }
}

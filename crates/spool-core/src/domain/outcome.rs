//! Outcome model: what happened to one delivered message.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;

/// Result of one delivery attempt.
///
/// Serialized as SCREAMING_SNAKE_CASE: COMPLETED / RETRIED / ABANDONED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    /// Acknowledged and removed from the queue.
    Completed,
    /// Re-attempted in place under the same lock.
    Retried,
    /// Lock released; the broker will redeliver.
    Abandoned,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Completed => "COMPLETED",
            OutcomeKind::Retried => "RETRIED",
            OutcomeKind::Abandoned => "ABANDONED",
        }
    }

    /// Completed と Abandoned だけが終端
    pub fn is_terminal(self) -> bool {
        !matches!(self, OutcomeKind::Retried)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a whole delivery (all in-place retries included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Terminal resolution: `Completed` or `Abandoned`.
    pub kind: OutcomeKind,

    /// Number of in-place retries before the resolution.
    pub retries: u32,

    /// Classification of the failure that led to the resolution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorKind>,
}

impl DeliveryOutcome {
    pub fn completed(retries: u32) -> Self {
        Self {
            kind: OutcomeKind::Completed,
            retries,
            failure: None,
        }
    }

    pub fn completed_after_error(retries: u32, failure: ErrorKind) -> Self {
        Self {
            kind: OutcomeKind::Completed,
            retries,
            failure: Some(failure),
        }
    }

    pub fn abandoned(retries: u32, failure: ErrorKind) -> Self {
        Self {
            kind: OutcomeKind::Abandoned,
            retries,
            failure: Some(failure),
        }
    }

    /// One outcome per attempt: `Retried` for each in-place retry, then the resolution.
    pub fn attempts(&self) -> Vec<OutcomeKind> {
        let mut attempts = vec![OutcomeKind::Retried; self.retries as usize];
        attempts.push(self.kind);
        attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_as_required_names() {
        let s = serde_json::to_string(&OutcomeKind::Completed).unwrap();
        assert_eq!(s, "\"COMPLETED\"");

        let s = serde_json::to_string(&OutcomeKind::Retried).unwrap();
        assert_eq!(s, "\"RETRIED\"");

        let s = serde_json::to_string(&OutcomeKind::Abandoned).unwrap();
        assert_eq!(s, "\"ABANDONED\"");
    }

    #[test]
    fn only_retried_is_not_terminal() {
        assert!(OutcomeKind::Completed.is_terminal());
        assert!(OutcomeKind::Abandoned.is_terminal());
        assert!(!OutcomeKind::Retried.is_terminal());
    }

    #[test]
    fn attempts_list_retries_before_the_resolution() {
        assert_eq!(DeliveryOutcome::completed(0).attempts(), [OutcomeKind::Completed]);
        assert_eq!(
            DeliveryOutcome::abandoned(2, ErrorKind::Transient).attempts(),
            [OutcomeKind::Retried, OutcomeKind::Retried, OutcomeKind::Abandoned]
        );
        assert!(
            DeliveryOutcome::completed(3)
                .attempts()
                .iter()
                .filter(|kind| kind.is_terminal())
                .count()
                == 1
        );
    }

    #[test]
    fn clean_completion_omits_failure() {
        let v = serde_json::to_value(DeliveryOutcome::completed(0)).unwrap();
        assert_eq!(v["kind"], "COMPLETED");
        assert!(v.get("failure").is_none());

        let v = serde_json::to_value(DeliveryOutcome::abandoned(2, ErrorKind::LockOrTimeout)).unwrap();
        assert_eq!(v["failure"], "LOCK_OR_TIMEOUT");
        assert_eq!(v["retries"], 2);
    }
}

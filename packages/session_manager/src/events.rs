use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifies one underlying process among those sharing a session id.
/// Issued in strictly increasing order and never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events produced toward the UI layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Display-oriented output (bracketed paste toggles removed)
    Output { id: String, text: String },
    /// The process exited on its own (not emitted for kill or resume)
    Exit { id: String, code: i32 },
    /// A credential/quota failure was recognized; at most once per instance
    CredentialFailed { id: String, reason: String },
    /// The instance left the registry; `credential_dir` now belongs to the caller
    Closed {
        id: String,
        instance_id: InstanceId,
        credential_dir: Option<PathBuf>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Output { id, .. }
            | Self::Exit { id, .. }
            | Self::CredentialFailed { id, .. }
            | Self::Closed { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_tag() {
        let ev = SessionEvent::CredentialFailed {
            id: "s1".to_string(),
            reason: "Insufficient credits".to_string(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "credential_failed");
        assert_eq!(json["id"], "s1");
        assert_eq!(json["reason"], "Insufficient credits");
    }

    #[test]
    fn test_closed_event_carries_plain_instance_number() {
        let ev = SessionEvent::Closed {
            id: "s1".to_string(),
            instance_id: InstanceId(7),
            credential_dir: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["instance_id"], 7);
        assert!(json["credential_dir"].is_null());
        assert_eq!(ev.session_id(), "s1");
    }
}

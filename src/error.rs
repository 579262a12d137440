// ABOUTME: Error taxonomy for sync runs
// ABOUTME: Separates config, transport, verification and row-level failures so callers can classify them

use std::fmt;

/// Maximum number of characters of a remote response body shown in an error
/// message or persisted as a row's failure reason. The error itself keeps the
/// full body.
pub const REASON_CLIP: usize = 1000;

#[derive(Debug)]
pub enum SyncError {
    /// Invalid job definition. Raised before any network or database I/O.
    Config(String),
    /// Non-2xx response or network failure talking to the remote endpoint.
    Transport { status: Option<u16>, body: String },
    /// The remote accepted the request but the response failed verification.
    Verification(String),
    /// The remote rejected a POST because the entity already exists.
    DuplicateKey(String),
    /// A row failed to write and the job's error policy is abort.
    RowWrite { index: usize, reason: String },
    /// Another run of the same job id is still in flight.
    Busy(String),
}

impl SyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config(msg.into())
    }

    /// Short reason string persisted alongside failed rows.
    pub fn reason(&self) -> String {
        match self {
            SyncError::Transport { status: Some(s), body } => {
                clip(&format!("HTTP {}: {}", s, body), REASON_CLIP)
            }
            SyncError::Transport { status: None, body } => clip(body, REASON_CLIP),
            SyncError::Verification(msg) => clip(&format!("verification failed: {}", msg), REASON_CLIP),
            SyncError::DuplicateKey(body) => clip(&format!("duplicate key: {}", body), REASON_CLIP),
            other => clip(&other.to_string(), REASON_CLIP),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SyncError::Transport {
                status: Some(status),
                body,
            } => write!(
                f,
                "Remote request failed with status {}: {}",
                status,
                clip(body, REASON_CLIP)
            ),
            SyncError::Transport { status: None, body } => {
                write!(f, "Remote request failed: {}", clip(body, REASON_CLIP))
            }
            SyncError::Verification(msg) => write!(f, "Response verification failed: {}", msg),
            SyncError::DuplicateKey(body) => write!(
                f,
                "Duplicate key rejected by remote: {}",
                clip(body, REASON_CLIP)
            ),
            SyncError::RowWrite { index, reason } => {
                write!(f, "Row {} failed to write: {}", index, reason)
            }
            SyncError::Busy(job) => write!(
                f,
                "Job '{}' is already running. Wait for the in-flight run to finish",
                job
            ),
        }
    }
}

impl std::error::Error for SyncError {}

/// Truncate `text` to at most `max` characters.
pub fn clip(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("äöü", 2), "äö");
        assert_eq!(clip("abc", 10), "abc");
    }

    #[test]
    fn test_transport_reason_carries_status() {
        let err = SyncError::Transport {
            status: Some(400),
            body: "bad".to_string(),
        };
        assert_eq!(err.reason(), "HTTP 400: bad");
    }

    #[test]
    fn test_reason_is_clipped() {
        let err = SyncError::Transport {
            status: None,
            body: "x".repeat(REASON_CLIP + 50),
        };
        assert_eq!(err.reason().chars().count(), REASON_CLIP);
    }

    #[test]
    fn test_display_clips_but_body_is_kept() {
        let body = format!("{}DBSQL_DUPLICATE_KEY_ERROR", "x".repeat(REASON_CLIP + 100));
        let err = SyncError::Transport {
            status: Some(400),
            body: body.clone(),
        };
        assert!(!err.to_string().contains("DBSQL_DUPLICATE_KEY_ERROR"));
        assert!(err.to_string().chars().count() < body.chars().count());
        match &err {
            SyncError::Transport { body: kept, .. } => assert_eq!(kept, &body),
            other => panic!("unexpected error {:?}", other),
        }
    }
}

use thiserror::Error;

/// Failures the scan engine absorbs per message or per group pass.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScanError {
    /// Extraction produced a message with neither sender nor text.
    #[error("invalid message in group '{group}': {reason}")]
    InvalidMessage { group: String, reason: String },

    /// Transient WebClient failure; the pass yields nothing and is retried next time.
    #[error("extraction failed for group '{group}': {reason}")]
    ExtractionFailed { group: String, reason: String },

    /// No scenario lists this group.
    #[error("no scenario configured for group '{0}'")]
    UnknownGroup(String),

    /// Nothing to route to; terminates the run.
    #[error("no scenarios configured")]
    NoScenarios,
}

impl ScanError {
    pub fn extraction_failed(group: &str, reason: impl std::fmt::Display) -> Self {
        Self::ExtractionFailed {
            group: group.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_message(group: &str, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            group: group.to_string(),
            reason: reason.into(),
        }
    }
}

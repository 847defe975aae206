use sha2::{Digest, Sha256};
use std::time::Duration;

use super::{RawMessage, ScanError, SentAt};

/// Stable identity of one chat event, independent of re-extraction jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageFingerprint([u8; 32]);

impl std::fmt::Display for MessageFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough for logs.
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Derives fingerprints from (group, sender, text, sent_at bucket).
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    tolerance_secs: i64,
}

impl Fingerprinter {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance_secs: tolerance.as_secs().max(1) as i64,
        }
    }

    pub fn fingerprint(&self, message: &RawMessage) -> Result<MessageFingerprint, ScanError> {
        let sender = normalize_sender(&message.sender);
        let text = normalize_text(&message.text);
        if sender.is_empty() && text.is_empty() {
            return Err(ScanError::invalid_message(
                &message.group,
                format!("no sender and no text at {}", message.position),
            ));
        }

        // Instants and times of day bucket on different scales; tag them apart.
        let bucket = match message.sent_at {
            Some(at @ SentAt::Instant(_)) => {
                format!("i{}", at.seconds().div_euclid(self.tolerance_secs))
            }
            Some(at @ SentAt::TimeOfDay(_)) => {
                format!("t{}", at.seconds().div_euclid(self.tolerance_secs))
            }
            None => "-".to_string(),
        };

        let mut hasher = Sha256::new();
        // Length-prefix each part so field boundaries cannot be shifted.
        for part in [message.group.trim(), sender.as_str(), text.as_str(), bucket.as_str()] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Ok(MessageFingerprint(bytes))
    }
}

/// Display-name variants: case and whitespace runs do not matter.
fn normalize_sender(sender: &str) -> String {
    sender
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{VisibleMessage, WebClient};
use crate::config::ReplayConfig;
use crate::scan::{SentAt, UiPosition};

#[derive(Debug, Deserialize)]
struct TranscriptLine {
    #[serde(default)]
    sender: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    outgoing: bool,
    /// Defaults to the 1-based line index.
    #[serde(default)]
    position: Option<i64>,
}

/// WebClient over recorded chat transcripts, one `<group>.json` file per group.
///
/// The file is re-read on every call, so lines appended while running show up
/// on the next poll the same way new messages appear in a live chat panel.
pub struct ReplayWebClient {
    directory: PathBuf,
    window: usize,
    scroll_step: usize,
    /// Messages hidden below the viewport, per group.
    offsets: Mutex<HashMap<String, usize>>,
}

impl ReplayWebClient {
    pub fn new(config: &ReplayConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            window: config.window.max(1),
            scroll_step: config.scroll_step.max(1),
            offsets: Mutex::new(HashMap::new()),
        }
    }

    fn transcript_path(&self, group: &str) -> Result<PathBuf> {
        if group.is_empty() || group.contains(['/', '\\']) || group == ".." {
            bail!("Invalid group name for a transcript: {:?}", group);
        }
        Ok(transcript_file(&self.directory, group))
    }

    async fn load(&self, group: &str) -> Result<Vec<VisibleMessage>> {
        let path = self.transcript_path(group)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read transcript {}", path.display()))?;
        parse_transcript(&content)
            .with_context(|| format!("Failed to parse transcript {}", path.display()))
    }

    fn offset(&self, group: &str) -> usize {
        self.offsets
            .lock()
            .map(|offsets| offsets.get(group).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn set_offset(&self, group: &str, offset: usize) {
        if let Ok(mut offsets) = self.offsets.lock() {
            offsets.insert(group.to_string(), offset);
        }
    }
}

#[async_trait]
impl WebClient for ReplayWebClient {
    async fn open_group(&self, group: &str) -> Result<()> {
        let messages = self.load(group).await?;
        debug!("Opened transcript for '{}' ({} messages)", group, messages.len());
        self.set_offset(group, 0);
        Ok(())
    }

    async fn scroll_back(&self, group: &str) -> Result<bool> {
        let len = self.load(group).await?.len();
        let offset = self.offset(group);
        if offset + self.window >= len {
            return Ok(false);
        }
        self.set_offset(group, offset + self.scroll_step);
        Ok(true)
    }

    async fn read_visible(&self, group: &str) -> Result<Vec<VisibleMessage>> {
        let mut messages = self.load(group).await?;
        let end = messages.len().saturating_sub(self.offset(group));
        let start = end.saturating_sub(self.window);
        messages.truncate(end);
        Ok(messages.split_off(start))
    }
}

fn parse_transcript(content: &str) -> Result<Vec<VisibleMessage>> {
    let lines: Vec<TranscriptLine> = serde_json::from_str(content)?;
    let mut messages: Vec<VisibleMessage> = lines
        .into_iter()
        .enumerate()
        .map(|(index, line)| VisibleMessage {
            sender: line.sender,
            phone: line.phone.filter(|p| !p.trim().is_empty()),
            text: line.text,
            timestamp: line.timestamp.as_deref().and_then(parse_timestamp),
            outgoing: line.outgoing,
            position: UiPosition(line.position.unwrap_or(index as i64 + 1)),
        })
        .collect();
    messages.sort_by_key(|m| m.position);
    Ok(messages)
}

/// RFC 3339, or a bare `HH:MM` as rendered by chat panels (kept dateless).
fn parse_timestamp(raw: &str) -> Option<SentAt> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(SentAt::Instant(parsed.with_timezone(&Utc)));
    }
    NaiveTime::parse_from_str(raw, "%H:%M")
        .ok()
        .map(SentAt::TimeOfDay)
}

/// Path of the transcript `ReplayWebClient` reads for `group`.
pub fn transcript_file(directory: &Path, group: &str) -> PathBuf {
    directory.join(format!("{}.json", group))
}

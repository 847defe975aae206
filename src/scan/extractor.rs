use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::state::Cursor;
use super::{RawMessage, ScanError, UiPosition};
use crate::platform::{VisibleMessage, WebClient};

/// Output of one extraction pass for one group.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Oldest first; `extraction_order` numbers them from 0.
    pub messages: Vec<RawMessage>,
    /// Slots that had a sender but no text.
    pub skipped_empty: usize,
    /// Slots sent by the logged-in account.
    pub skipped_own: usize,
    /// Where the next incremental read should start.
    pub next_cursor: Cursor,
}

/// Turns WebClient windows into clean RawMessage sequences.
#[derive(Clone)]
pub struct MessageExtractor {
    client: Arc<dyn WebClient>,
    call_timeout: Duration,
}

impl MessageExtractor {
    pub fn new(client: Arc<dyn WebClient>, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    /// Scroll back up to `max_scroll_steps` times, collecting every distinct
    /// slot seen. Overlapping windows are merged by UI position.
    pub async fn extract_history(
        &self,
        group: &str,
        max_scroll_steps: u32,
    ) -> Result<Extraction, ScanError> {
        self.call(group, "open_group", self.client.open_group(group))
            .await?;

        let mut slots: BTreeMap<UiPosition, VisibleMessage> = BTreeMap::new();
        let window = self
            .call(group, "read_visible", self.client.read_visible(group))
            .await?;
        merge_window(&mut slots, window);

        for step in 1..=max_scroll_steps {
            let more = self
                .call(group, "scroll_back", self.client.scroll_back(group))
                .await?;
            if !more {
                debug!("Group '{}': reached start of history at step {}", group, step);
                break;
            }

            let window = self
                .call(group, "read_visible", self.client.read_visible(group))
                .await?;
            let added = merge_window(&mut slots, window);
            debug!(
                "Group '{}': scroll {}/{} added {} message(s)",
                group, step, max_scroll_steps, added
            );
            if added == 0 {
                break;
            }
        }

        let next_cursor = slots
            .keys()
            .next_back()
            .map(|last| Cursor::after(*last))
            .unwrap_or_default();
        let mut extraction = build_extraction(group, slots.into_values());
        extraction.next_cursor = next_cursor;
        Ok(extraction)
    }

    /// Read the visible window without scrolling and keep slots at or after `cursor`.
    pub async fn extract_new(&self, group: &str, cursor: Cursor) -> Result<Extraction, ScanError> {
        self.call(group, "open_group", self.client.open_group(group))
            .await?;
        let window = self
            .call(group, "read_visible", self.client.read_visible(group))
            .await?;

        let mut slots: BTreeMap<UiPosition, VisibleMessage> = BTreeMap::new();
        merge_window(
            &mut slots,
            window.into_iter().filter(|m| cursor.admits(m.position)),
        );

        let next_cursor = slots
            .keys()
            .next_back()
            .map(|last| Cursor::after(*last))
            .unwrap_or(cursor);
        let mut extraction = build_extraction(group, slots.into_values());
        extraction.next_cursor = next_cursor;
        Ok(extraction)
    }

    async fn call<T, F>(&self, group: &str, operation: &str, fut: F) -> Result<T, ScanError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ScanError::extraction_failed(
                group,
                format!("{}: {:#}", operation, e),
            )),
            Err(_) => Err(ScanError::extraction_failed(
                group,
                format!("{} timed out after {:?}", operation, self.call_timeout),
            )),
        }
    }
}

/// Insert slots not seen yet; returns how many were new.
fn merge_window(
    slots: &mut BTreeMap<UiPosition, VisibleMessage>,
    window: impl IntoIterator<Item = VisibleMessage>,
) -> usize {
    let mut added = 0;
    for message in window {
        if let std::collections::btree_map::Entry::Vacant(slot) = slots.entry(message.position) {
            slot.insert(message);
            added += 1;
        }
    }
    added
}

fn build_extraction(group: &str, slots: impl Iterator<Item = VisibleMessage>) -> Extraction {
    let mut extraction = Extraction::default();
    for visible in slots {
        if visible.outgoing {
            extraction.skipped_own += 1;
            continue;
        }
        let sender = visible.sender.trim().to_string();
        let text = visible.text.trim().to_string();
        if text.is_empty() && !sender.is_empty() {
            extraction.skipped_empty += 1;
            continue;
        }
        let order = extraction.messages.len() as u64;
        extraction.messages.push(RawMessage {
            group: group.to_string(),
            sender,
            phone: visible
                .phone
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            text,
            sent_at: visible.timestamp,
            position: visible.position,
            extraction_order: order,
        });
    }
    extraction
}

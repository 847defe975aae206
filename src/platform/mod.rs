pub mod replay;

use anyhow::Result;
use async_trait::async_trait;

use crate::scan::{SentAt, UiPosition};

/// One message slot as rendered in the visible chat panel
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VisibleMessage {
    pub sender: String,
    pub phone: Option<String>,
    pub text: String,
    pub timestamp: Option<SentAt>,
    /// Sent from the account the panel is logged in as.
    pub outgoing: bool,
    pub position: UiPosition,
}

/// Chat UI driver. Implementations own navigation and DOM scraping;
/// callers only see ordered windows of visible messages.
#[async_trait]
pub trait WebClient: Send + Sync {
    /// Focus the group's chat panel, scrolled to its newest content.
    async fn open_group(&self, group: &str) -> Result<()>;

    /// Scroll one step towards older content. Returns false when nothing older exists.
    async fn scroll_back(&self, group: &str) -> Result<bool>;

    /// Read the currently visible window, oldest first.
    async fn read_visible(&self, group: &str) -> Result<Vec<VisibleMessage>>;
}

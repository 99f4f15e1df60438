//! Chat platform seam.
//!
//! Everything the bot needs from Discord goes through [`ChatPlatform`], so the
//! reconciler, the role-button handler and the forum analysis can run against
//! either the serenity-backed [`discord::DiscordPlatform`] or the in-memory
//! [`memory::MemoryPlatform`].

pub mod discord;
pub mod memory;

use crate::templates::{ButtonStyle, EmbedTemplate};
use serenity::async_trait;
use thiserror::Error;

/// Failure of a platform call, classified the way callers care about
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    /// Not-found and forbidden both mean "treat the target as absent"
    pub fn is_absent(&self) -> bool {
        matches!(self, PlatformError::NotFound | PlatformError::Forbidden)
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u64,
    pub name: String,
    pub guild_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleInfo {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: u64,
    pub channel_id: u64,
    pub content: String,
}

/// A button as it is sent to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedButton {
    pub custom_id: String,
    pub label: String,
    pub style: ButtonStyle,
    pub emoji: Option<String>,
}

/// Fully rendered message body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embeds: Vec<EmbedTemplate>,
    pub buttons: Vec<RenderedButton>,
}

/// A forum thread, reduced to what the forum analysis looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: u64,
    pub name: String,
    pub locked: bool,
    pub pinned: bool,
    pub applied_tags: Vec<u64>,
    pub message_count: u64,
}

impl ThreadInfo {
    pub fn mention(&self) -> String {
        format!("<#{}>", self.id)
    }

    pub fn has_tag(&self, tag_id: u64) -> bool {
        self.applied_tags.contains(&tag_id)
    }
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Resolve a channel from cache, falling back to a network fetch
    async fn resolve_channel(&self, channel_id: u64) -> Option<ChannelInfo>;

    async fn fetch_message(&self, channel_id: u64, message_id: u64) -> PlatformResult<RemoteMessage>;

    /// Send a message, returning its platform id
    async fn send_message(&self, channel_id: u64, message: &OutgoingMessage) -> PlatformResult<u64>;

    /// Replace content, embeds and components of an existing message
    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        message: &OutgoingMessage,
    ) -> PlatformResult<()>;

    /// Replace only the components of a message, leaving content and embeds alone
    async fn edit_components(
        &self,
        channel_id: u64,
        message_id: u64,
        buttons: &[RenderedButton],
    ) -> PlatformResult<()>;

    fn cached_role(&self, guild_id: u64, role_id: u64) -> Option<RoleInfo>;

    /// Fetch the guild's role list from the network, refreshing any cache
    async fn fetch_roles(&self, guild_id: u64) -> PlatformResult<Vec<RoleInfo>>;

    async fn role_member_count(&self, guild_id: u64, role_id: u64) -> PlatformResult<u64>;

    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> PlatformResult<()>;

    /// Active and archived threads of a forum channel, newest first
    async fn forum_threads(&self, guild_id: u64, forum_channel_id: u64) -> PlatformResult<Vec<ThreadInfo>>;

    /// Count of the first reaction on a thread's starter message.
    ///
    /// `Ok(None)` when the thread has no starter message at all.
    async fn starter_reaction_count(&self, thread_id: u64) -> PlatformResult<Option<u64>>;
}

/// Resolve a role by id, forcing one refresh of the role list on a cache miss
pub async fn resolve_role(
    platform: &dyn ChatPlatform,
    guild_id: u64,
    role_id: u64,
) -> PlatformResult<Option<RoleInfo>> {
    if let Some(role) = platform.cached_role(guild_id, role_id) {
        return Ok(Some(role));
    }

    log::debug!("Role {} not found in cache, fetching guild roles", role_id);
    let roles = platform.fetch_roles(guild_id).await?;
    Ok(roles.into_iter().find(|r| r.id == role_id))
}

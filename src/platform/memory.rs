//! In-memory chat platform.
//!
//! Holds channels, messages, roles and forum threads in plain maps and records
//! every write. Used by the test suites and handy for dry runs of a document.

use super::{
    ChannelInfo, ChatPlatform, OutgoingMessage, PlatformError, PlatformResult, RemoteMessage,
    RenderedButton, RoleInfo, ThreadInfo,
};
use serenity::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// A write performed against the platform
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Send { channel_id: u64, message_id: u64 },
    Edit { channel_id: u64, message_id: u64 },
    EditComponents { channel_id: u64, message_id: u64 },
    AddRole { guild_id: u64, user_id: u64, role_id: u64 },
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub channel_id: u64,
    pub message: OutgoingMessage,
}

#[derive(Default)]
struct State {
    next_id: u64,
    channels: HashMap<u64, ChannelInfo>,
    messages: HashMap<u64, StoredMessage>,
    /// guild -> roles known to the server
    roles: HashMap<u64, Vec<RoleInfo>>,
    /// (guild, role) pairs visible through the cache
    cached_roles: HashSet<(u64, u64)>,
    /// (guild, role) -> members holding the role
    members: HashMap<(u64, u64), HashSet<u64>>,
    /// forum channel -> threads, newest first
    threads: HashMap<u64, Vec<ThreadInfo>>,
    /// thread -> first reaction count on its starter message
    starters: HashMap<u64, u64>,
    writes: Vec<WriteOp>,
    fetch_failures: HashMap<u64, PlatformError>,
}

#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        let platform = Self::default();
        platform.lock().next_id = 1_000;
        platform
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_channel(&self, guild_id: u64, channel_id: u64, name: &str) {
        self.lock().channels.insert(
            channel_id,
            ChannelInfo {
                id: channel_id,
                name: name.to_string(),
                guild_id: Some(guild_id),
            },
        );
    }

    /// Register a role; `cached` controls whether the cache knows about it
    pub fn add_guild_role(&self, guild_id: u64, role_id: u64, name: &str, cached: bool) {
        let mut state = self.lock();
        state.roles.entry(guild_id).or_default().push(RoleInfo {
            id: role_id,
            name: name.to_string(),
        });
        if cached {
            state.cached_roles.insert((guild_id, role_id));
        }
    }

    pub fn add_role_member(&self, guild_id: u64, role_id: u64, user_id: u64) {
        self.lock()
            .members
            .entry((guild_id, role_id))
            .or_default()
            .insert(user_id);
    }

    /// Add a forum thread; `starter_reactions` of `None` means the starter message is gone
    pub fn add_thread(&self, forum_channel_id: u64, thread: ThreadInfo, starter_reactions: Option<u64>) {
        let mut state = self.lock();
        if let Some(count) = starter_reactions {
            state.starters.insert(thread.id, count);
        }
        state.threads.entry(forum_channel_id).or_default().push(thread);
    }

    /// Remove a message as if it had been deleted out of band
    pub fn delete_message(&self, message_id: u64) {
        self.lock().messages.remove(&message_id);
    }

    /// Make every fetch of `message_id` fail with `error`
    pub fn fail_fetch(&self, message_id: u64, error: PlatformError) {
        self.lock().fetch_failures.insert(message_id, error);
    }

    pub fn clear_fetch_failures(&self) {
        self.lock().fetch_failures.clear();
    }

    pub fn message(&self, message_id: u64) -> Option<StoredMessage> {
        self.lock().messages.get(&message_id).cloned()
    }

    pub fn messages_in(&self, channel_id: u64) -> Vec<(u64, StoredMessage)> {
        let state = self.lock();
        let mut messages: Vec<(u64, StoredMessage)> = state
            .messages
            .iter()
            .filter(|(_, m)| m.channel_id == channel_id)
            .map(|(id, m)| (*id, m.clone()))
            .collect();
        messages.sort_by_key(|(id, _)| *id);
        messages
    }

    pub fn writes(&self) -> Vec<WriteOp> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

#[async_trait]
impl ChatPlatform for MemoryPlatform {
    async fn resolve_channel(&self, channel_id: u64) -> Option<ChannelInfo> {
        self.lock().channels.get(&channel_id).cloned()
    }

    async fn fetch_message(&self, channel_id: u64, message_id: u64) -> PlatformResult<RemoteMessage> {
        let state = self.lock();
        if let Some(error) = state.fetch_failures.get(&message_id) {
            return Err(error.clone());
        }
        match state.messages.get(&message_id) {
            Some(stored) if stored.channel_id == channel_id => Ok(RemoteMessage {
                id: message_id,
                channel_id,
                content: stored.message.content.clone().unwrap_or_default(),
            }),
            _ => Err(PlatformError::NotFound),
        }
    }

    async fn send_message(&self, channel_id: u64, message: &OutgoingMessage) -> PlatformResult<u64> {
        let mut state = self.lock();
        if !state.channels.contains_key(&channel_id) {
            return Err(PlatformError::NotFound);
        }
        state.next_id += 1;
        let message_id = state.next_id;
        state.messages.insert(
            message_id,
            StoredMessage {
                channel_id,
                message: message.clone(),
            },
        );
        state.writes.push(WriteOp::Send { channel_id, message_id });
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        message: &OutgoingMessage,
    ) -> PlatformResult<()> {
        let mut state = self.lock();
        match state.messages.get_mut(&message_id) {
            Some(stored) if stored.channel_id == channel_id => {
                stored.message = message.clone();
            }
            _ => return Err(PlatformError::NotFound),
        }
        state.writes.push(WriteOp::Edit { channel_id, message_id });
        Ok(())
    }

    async fn edit_components(
        &self,
        channel_id: u64,
        message_id: u64,
        buttons: &[RenderedButton],
    ) -> PlatformResult<()> {
        let mut state = self.lock();
        match state.messages.get_mut(&message_id) {
            Some(stored) if stored.channel_id == channel_id => {
                stored.message.buttons = buttons.to_vec();
            }
            _ => return Err(PlatformError::NotFound),
        }
        state.writes.push(WriteOp::EditComponents { channel_id, message_id });
        Ok(())
    }

    fn cached_role(&self, guild_id: u64, role_id: u64) -> Option<RoleInfo> {
        let state = self.lock();
        if !state.cached_roles.contains(&(guild_id, role_id)) {
            return None;
        }
        state
            .roles
            .get(&guild_id)
            .and_then(|roles| roles.iter().find(|r| r.id == role_id).cloned())
    }

    async fn fetch_roles(&self, guild_id: u64) -> PlatformResult<Vec<RoleInfo>> {
        let mut state = self.lock();
        let roles = state.roles.get(&guild_id).cloned().unwrap_or_default();
        for role in &roles {
            state.cached_roles.insert((guild_id, role.id));
        }
        Ok(roles)
    }

    async fn role_member_count(&self, guild_id: u64, role_id: u64) -> PlatformResult<u64> {
        Ok(self
            .lock()
            .members
            .get(&(guild_id, role_id))
            .map(|m| m.len() as u64)
            .unwrap_or(0))
    }

    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> PlatformResult<()> {
        let mut state = self.lock();
        let exists = state
            .roles
            .get(&guild_id)
            .map(|roles| roles.iter().any(|r| r.id == role_id))
            .unwrap_or(false);
        if !exists {
            return Err(PlatformError::NotFound);
        }
        state
            .members
            .entry((guild_id, role_id))
            .or_default()
            .insert(user_id);
        state.writes.push(WriteOp::AddRole {
            guild_id,
            user_id,
            role_id,
        });
        Ok(())
    }

    async fn forum_threads(&self, _guild_id: u64, forum_channel_id: u64) -> PlatformResult<Vec<ThreadInfo>> {
        Ok(self
            .lock()
            .threads
            .get(&forum_channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn starter_reaction_count(&self, thread_id: u64) -> PlatformResult<Option<u64>> {
        Ok(self.lock().starters.get(&thread_id).copied())
    }
}

//! # Feature: Message Reconciliation
//!
//! Converges a [`FeatureDocument`] onto the chat server with as few writes as
//! possible. Each channel of the desired document is paired with the applied
//! channel of the same id, each group with the applied group at the same
//! position:
//!
//! - disabled groups and groups with nothing to post are skipped
//! - a group without a message id is sent and the new id recorded
//! - a group whose message is gone (not found or forbidden) is sent again
//! - a group that differs from its applied copy is edited in place
//! - anything else is left alone
//!
//! The returned document carries the back-filled message ids and channel names.
//! The applied snapshot returned next to it only records groups that really
//! reached the server; a group that failed keeps its previous applied copy so
//! the next pass diffs against it again.

use crate::components::{ButtonBinding, ButtonPanel, ComponentRegistry};
use crate::platform::{resolve_role, ChatPlatform, OutgoingMessage, PlatformError, PlatformResult};
use crate::templates::{role_button_custom_id, FeatureDocument, MessageGroup, MessageTemplate};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;

/// Counts of what one reconcile pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub edited: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileSummary {
    pub fn writes(&self) -> usize {
        self.created + self.edited
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} edited, {} unchanged, {} skipped, {} failed",
            self.created, self.edited, self.unchanged, self.skipped, self.failed
        )
    }
}

/// Result of one reconcile pass
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Desired document with ids and channel names filled in
    pub document: FeatureDocument,
    /// What is now known to be published
    pub applied: FeatureDocument,
    pub summary: ReconcileSummary,
}

/// Message body plus the role buttons it carries
struct RenderedGroup {
    message: OutgoingMessage,
    bindings: Vec<ButtonBinding>,
    show_count: bool,
}

pub struct Reconciler {
    feature: String,
    guild_id: u64,
    platform: Arc<dyn ChatPlatform>,
    registry: Arc<ComponentRegistry>,
}

impl Reconciler {
    pub fn new(
        feature: impl Into<String>,
        guild_id: u64,
        platform: Arc<dyn ChatPlatform>,
        registry: Arc<ComponentRegistry>,
    ) -> Self {
        Reconciler {
            feature: feature.into(),
            guild_id,
            platform,
            registry,
        }
    }

    /// Apply `desired` on top of what `applied` says is already published
    pub async fn reconcile(
        &self,
        mut desired: FeatureDocument,
        applied: &FeatureDocument,
    ) -> ReconcileOutcome {
        let mut summary = ReconcileSummary::default();
        let mut published = Vec::with_capacity(desired.channels.len());

        for channel in desired.channels.iter_mut() {
            let applied_channel = applied.channel(&channel.id);
            let channel_id = match channel.channel_id() {
                Ok(id) => id,
                Err(e) => {
                    warn!("[{}] {}", self.feature, e);
                    summary.skipped += channel.groups.len();
                    published.extend(applied_channel.cloned());
                    continue;
                }
            };

            let info = match self.platform.resolve_channel(channel_id).await {
                Some(info) => info,
                None => {
                    warn!(
                        "[{}] Invalid channel id {} or the channel is not visible, skipping",
                        self.feature, channel_id
                    );
                    summary.skipped += channel.groups.len();
                    published.extend(applied_channel.cloned());
                    continue;
                }
            };
            channel.name = Some(info.name.clone());

            let mut unsettled = Vec::new();
            for (index, group) in channel.groups.iter_mut().enumerate() {
                let applied_group = applied_channel.and_then(|c| c.groups.get(index));
                let settled = self
                    .reconcile_group(channel_id, &info.name, index, group, applied_group, &mut summary)
                    .await;
                if !settled {
                    unsettled.push(index);
                }
            }

            let mut snapshot = channel.clone();
            for index in unsettled {
                snapshot.groups[index] = applied_channel
                    .and_then(|c| c.groups.get(index))
                    .cloned()
                    .unwrap_or_else(unpublished_group);
            }
            published.push(snapshot);
        }

        info!("[{}] Reconciled: {}", self.feature, summary);
        ReconcileOutcome {
            document: desired,
            applied: FeatureDocument { channels: published },
            summary,
        }
    }

    /// Returns `false` when the server may not match the group yet
    async fn reconcile_group(
        &self,
        channel_id: u64,
        channel_name: &str,
        index: usize,
        group: &mut MessageGroup,
        applied: Option<&MessageGroup>,
        summary: &mut ReconcileSummary,
    ) -> bool {
        if group.disabled {
            debug!("[{}] #{} group {} is disabled", self.feature, channel_name, index);
            summary.skipped += 1;
            return true;
        }
        if group.message.is_empty() {
            debug!("[{}] #{} group {} has nothing to post", self.feature, channel_name, index);
            summary.skipped += 1;
            return true;
        }

        // Does the recorded message still exist?
        let existing = match group.message.message_id() {
            None => None,
            Some(message_id) => match self.platform.fetch_message(channel_id, message_id).await {
                Ok(message) => Some(message.id),
                Err(e) if e.is_absent() => {
                    info!(
                        "[{}] Message {} in #{} is gone ({}), sending it again",
                        self.feature, message_id, channel_name, e
                    );
                    None
                }
                Err(e) => {
                    error!(
                        "[{}] Failed to fetch message {} in #{}: {}",
                        self.feature, message_id, channel_name, e
                    );
                    self.register_existing(channel_id, message_id, &group.message).await;
                    summary.failed += 1;
                    return false;
                }
            },
        };

        let changed = applied != Some(&*group);
        let rendered = match self.render(&group.message).await {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(
                    "[{}] Failed to render group {} in #{}: {}",
                    self.feature, index, channel_name, e
                );
                summary.failed += 1;
                return false;
            }
        };

        let message_id = match existing {
            Some(message_id) if !changed => {
                summary.unchanged += 1;
                message_id
            }
            Some(message_id) => {
                if let Err(e) = self
                    .platform
                    .edit_message(channel_id, message_id, &rendered.message)
                    .await
                {
                    error!(
                        "[{}] Failed to edit message {} in #{}: {}",
                        self.feature, message_id, channel_name, e
                    );
                    summary.failed += 1;
                    return false;
                }
                debug!("[{}] Edited message {} in #{}", self.feature, message_id, channel_name);
                summary.edited += 1;
                message_id
            }
            None => {
                if is_blank(&rendered.message) {
                    warn!(
                        "[{}] Group {} in #{} renders to an empty message, skipping",
                        self.feature, index, channel_name
                    );
                    summary.skipped += 1;
                    return true;
                }
                match self.platform.send_message(channel_id, &rendered.message).await {
                    Ok(message_id) => {
                        debug!("[{}] Sent message {} to #{}", self.feature, message_id, channel_name);
                        summary.created += 1;
                        group.message.id = Some(message_id.to_string());
                        message_id
                    }
                    Err(e) => {
                        error!("[{}] Failed to send to #{}: {}", self.feature, channel_name, e);
                        summary.failed += 1;
                        return false;
                    }
                }
            }
        };

        if !rendered.bindings.is_empty() {
            self.registry.register(ButtonPanel {
                guild_id: self.guild_id,
                channel_id,
                message_id,
                show_count: rendered.show_count,
                buttons: rendered.bindings,
            });
        }
        true
    }

    /// Keep clicks working on a message we could not verify
    async fn register_existing(&self, channel_id: u64, message_id: u64, message: &MessageTemplate) {
        if message.buttons.is_none() {
            return;
        }
        match self.render(message).await {
            Ok(rendered) if !rendered.bindings.is_empty() => self.registry.register(ButtonPanel {
                guild_id: self.guild_id,
                channel_id,
                message_id,
                show_count: rendered.show_count,
                buttons: rendered.bindings,
            }),
            Ok(_) => {}
            Err(e) => debug!("[{}] Could not register buttons of {}: {}", self.feature, message_id, e),
        }
    }

    async fn render(&self, message: &MessageTemplate) -> PlatformResult<RenderedGroup> {
        let mut bindings = Vec::new();
        let mut show_count = false;

        if let Some(buttons) = &message.buttons {
            show_count = buttons.count;
            for button in &buttons.list {
                let role_id = button
                    .role_id()
                    .map_err(|e| PlatformError::Other(e.to_string()))?;
                if resolve_role(self.platform.as_ref(), self.guild_id, role_id)
                    .await?
                    .is_none()
                {
                    warn!(
                        "[{}] Role {} for button '{}' does not exist, leaving it out",
                        self.feature, role_id, button.label
                    );
                    continue;
                }

                let count = if buttons.count {
                    Some(self.platform.role_member_count(self.guild_id, role_id).await?)
                } else {
                    None
                };
                bindings.push(ButtonBinding {
                    role_id,
                    custom_id: role_button_custom_id(role_id),
                    label: button.label.clone(),
                    style: button.style,
                    emoji: button.emoji.clone(),
                    count,
                });
            }
        }

        Ok(RenderedGroup {
            message: OutgoingMessage {
                content: message.content(),
                embeds: message.embeds.clone(),
                buttons: bindings.iter().map(ButtonBinding::render).collect(),
            },
            bindings,
            show_count,
        })
    }
}

/// Stand-in applied copy for a group that was never published
fn unpublished_group() -> MessageGroup {
    MessageGroup {
        disabled: false,
        message: MessageTemplate::default(),
        extra: Default::default(),
    }
}

fn is_blank(message: &OutgoingMessage) -> bool {
    message.content.is_none() && message.embeds.is_empty() && message.buttons.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{MemoryPlatform, WriteOp};
    use serde_json::{json, Value};

    const GUILD: u64 = 1;

    fn doc(value: Value) -> FeatureDocument {
        FeatureDocument::from_value(&value).unwrap()
    }

    fn setup() -> (Arc<MemoryPlatform>, Arc<ComponentRegistry>, Reconciler) {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_channel(GUILD, 1, "general");
        platform.add_channel(GUILD, 2, "roles");
        let registry = Arc::new(ComponentRegistry::new());
        let reconciler = Reconciler::new("embed_message", GUILD, platform.clone(), registry.clone());
        (platform, registry, reconciler)
    }

    fn hello() -> FeatureDocument {
        doc(json!({"channels":[{"id":"1","groups":[{"disabled":false,"message":{"content":"hi","embeds":[]}}]}]}))
    }

    #[tokio::test]
    async fn test_first_apply_sends_and_records_id() {
        let (platform, _registry, reconciler) = setup();

        let ReconcileOutcome {
            document: applied,
            summary,
            ..
        } = reconciler.reconcile(hello(), &FeatureDocument::default()).await;

        assert_eq!(summary.created, 1);
        assert_eq!(platform.write_count(), 1);
        let id = applied.channels[0].groups[0].message.message_id().unwrap();
        assert_eq!(
            platform.message(id).unwrap().message.content.as_deref(),
            Some("hi")
        );
        assert_eq!(applied.channels[0].name.as_deref(), Some("general"));
    }

    #[tokio::test]
    async fn test_second_apply_is_idempotent() {
        let (platform, _registry, reconciler) = setup();
        let applied = reconciler.reconcile(hello(), &FeatureDocument::default()).await.document;
        platform.clear_writes();

        let ReconcileOutcome {
            document: again,
            summary,
            ..
        } = reconciler.reconcile(applied.clone(), &applied).await;

        assert_eq!(platform.write_count(), 0);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(again, applied);
    }

    #[tokio::test]
    async fn test_changed_group_is_edited_in_place() {
        let (platform, _registry, reconciler) = setup();
        let applied = reconciler.reconcile(hello(), &FeatureDocument::default()).await.document;
        let id = applied.channels[0].groups[0].message.message_id().unwrap();
        platform.clear_writes();

        let mut desired = applied.clone();
        desired.channels[0].groups[0].message.content = "hello there".to_string();
        let ReconcileOutcome {
            document: after,
            summary,
            ..
        } = reconciler.reconcile(desired, &applied).await;

        assert_eq!(summary.edited, 1);
        assert_eq!(
            platform.writes(),
            vec![WriteOp::Edit {
                channel_id: 1,
                message_id: id
            }]
        );
        assert_eq!(after.channels[0].groups[0].message.message_id(), Some(id));
        assert_eq!(platform.messages_in(1).len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_group_is_never_touched() {
        let (platform, _registry, reconciler) = setup();
        let desired = doc(json!({"channels":[{"id":"1","groups":[
            {"disabled":true,"message":{"content":"hidden"}},
            {"message":{"content":"shown"}}
        ]}]}));

        let ReconcileOutcome {
            document: applied,
            summary,
            ..
        } = reconciler.reconcile(desired, &FeatureDocument::default()).await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
        assert!(applied.channels[0].groups[0].message.id.is_none());
        assert!(applied.channels[0].groups[1].message.id.is_some());
    }

    #[tokio::test]
    async fn test_deleted_message_is_recreated() {
        let (platform, _registry, reconciler) = setup();
        let applied = reconciler.reconcile(hello(), &FeatureDocument::default()).await.document;
        let old_id = applied.channels[0].groups[0].message.message_id().unwrap();
        platform.delete_message(old_id);
        platform.clear_writes();

        let ReconcileOutcome {
            document: after,
            summary,
            ..
        } = reconciler.reconcile(applied.clone(), &applied).await;

        assert_eq!(summary.created, 1);
        let new_id = after.channels[0].groups[0].message.message_id().unwrap();
        assert_ne!(new_id, old_id);
        assert!(platform.message(new_id).is_some());
    }

    #[tokio::test]
    async fn test_forbidden_fetch_is_treated_as_absent() {
        let (platform, _registry, reconciler) = setup();
        let applied = reconciler.reconcile(hello(), &FeatureDocument::default()).await.document;
        let old_id = applied.channels[0].groups[0].message.message_id().unwrap();
        platform.fail_fetch(old_id, PlatformError::Forbidden);

        let ReconcileOutcome {
            document: after,
            summary,
            ..
        } = reconciler.reconcile(applied.clone(), &applied).await;

        assert_eq!(summary.created, 1);
        assert_ne!(after.channels[0].groups[0].message.message_id(), Some(old_id));
    }

    #[tokio::test]
    async fn test_transient_fetch_error_is_retried_on_next_pass() {
        let (platform, _registry, reconciler) = setup();
        let first = reconciler.reconcile(hello(), &FeatureDocument::default()).await;
        let id = first.document.channels[0].groups[0].message.message_id().unwrap();
        platform.fail_fetch(id, PlatformError::Other("rate limited".to_string()));
        platform.clear_writes();

        let mut desired = first.document.clone();
        desired.channels[0].groups[0].message.content = "changed".to_string();
        let failed = reconciler.reconcile(desired, &first.applied).await;

        assert_eq!(failed.summary.failed, 1);
        assert_eq!(platform.write_count(), 0);
        assert_eq!(failed.document.channels[0].groups[0].message.message_id(), Some(id));
        // The snapshot still describes what the server shows
        assert_eq!(failed.applied.channels[0].groups[0].message.content, "hi");

        platform.clear_fetch_failures();
        let retried = reconciler.reconcile(failed.document, &failed.applied).await;

        assert_eq!(retried.summary.edited, 1);
        assert_eq!(
            platform.message(id).unwrap().message.content.as_deref(),
            Some("changed")
        );
        assert_eq!(retried.applied, retried.document);
    }

    #[tokio::test]
    async fn test_failed_first_send_leaves_no_applied_copy() {
        let (platform, _registry, reconciler) = setup();
        let mut desired = hello();
        desired.channels[0].groups[0].message.id = Some("4242".to_string());
        platform.fail_fetch(4242, PlatformError::Other("gateway timeout".to_string()));

        let outcome = reconciler.reconcile(desired, &FeatureDocument::default()).await;

        assert_eq!(outcome.summary.failed, 1);
        assert_ne!(outcome.applied, outcome.document);
        assert!(outcome.applied.channels[0].groups[0].message.id.is_none());
    }

    #[tokio::test]
    async fn test_unresolvable_channel_does_not_stop_the_batch() {
        let (platform, _registry, reconciler) = setup();
        let desired = doc(json!({"channels":[
            {"id":"999","groups":[{"message":{"content":"lost"}}]},
            {"id":"2","groups":[{"message":{"content":"found"}}]}
        ]}));

        let ReconcileOutcome {
            document: applied,
            applied: snapshot,
            summary,
        } = reconciler.reconcile(desired, &FeatureDocument::default()).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.created, 1);
        assert!(applied.channels[0].groups[0].message.id.is_none());
        assert!(applied.channels[0].name.is_none());
        assert_eq!(platform.messages_in(2).len(), 1);
        // Only the channel that was published is recorded as applied
        assert_eq!(snapshot.channels.len(), 1);
        assert_eq!(snapshot.channels[0].id, "2");
    }

    #[tokio::test]
    async fn test_empty_group_is_skipped() {
        let (platform, _registry, reconciler) = setup();
        let desired = doc(json!({"channels":[{"id":"1","groups":[{"message":{"content":"","embeds":[]}}]}]}));

        let summary = reconciler.reconcile(desired, &FeatureDocument::default()).await.summary;

        assert_eq!(summary.skipped, 1);
        assert_eq!(platform.write_count(), 0);
    }

    #[tokio::test]
    async fn test_buttons_register_panel_and_omit_unknown_roles() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_channel(GUILD, 2, "roles");
        platform.add_guild_role(GUILD, 100, "Gamer", true);
        platform.add_guild_role(GUILD, 200, "Artist", false);
        platform.add_role_member(GUILD, 100, 5);
        let registry = Arc::new(ComponentRegistry::new());
        let reconciler = Reconciler::new("role_buttons", GUILD, platform.clone(), registry.clone());

        let desired = doc(json!({"channels":[{"id":"2","groups":[{"message":{
            "content":"Pick a role",
            "buttons":{"count":true,"list":[
                {"label":"Gamer","style":"green","role_id":"100"},
                {"label":"Artist","role_id":"200"},
                {"label":"Ghost","role_id":"300"}
            ]}
        }}]}]}));

        let applied = reconciler.reconcile(desired, &FeatureDocument::default()).await.document;
        let id = applied.channels[0].groups[0].message.message_id().unwrap();

        let labels: Vec<String> = platform
            .message(id)
            .unwrap()
            .message
            .buttons
            .iter()
            .map(|b| b.label.clone())
            .collect();
        assert_eq!(labels, vec!["Gamer (1)", "Artist (0)"]);

        let panel = registry.panel(id).unwrap();
        assert!(panel.show_count);
        assert_eq!(panel.buttons.len(), 2);
        assert_eq!(panel.buttons[0].custom_id, "role_button:100");

        // The dropped button stays in the document
        let list = &applied.channels[0].groups[0].message.buttons.as_ref().unwrap().list;
        assert_eq!(list.len(), 3);
    }

    #[tokio::test]
    async fn test_unchanged_buttons_reregister_without_writes() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_channel(GUILD, 2, "roles");
        platform.add_guild_role(GUILD, 100, "Gamer", true);
        let desired = doc(json!({"channels":[{"id":"2","groups":[{"message":{
            "buttons":{"list":[{"label":"Gamer","role_id":"100"}]}
        }}]}]}));
        let first = Reconciler::new("role_buttons", GUILD, platform.clone(), Arc::new(ComponentRegistry::new()));
        let applied = first.reconcile(desired, &FeatureDocument::default()).await.document;
        platform.clear_writes();

        // Fresh registry, as after a restart
        let registry = Arc::new(ComponentRegistry::new());
        let second = Reconciler::new("role_buttons", GUILD, platform.clone(), registry.clone());
        second.reconcile(applied.clone(), &applied).await;

        assert_eq!(platform.write_count(), 0);
        let id = applied.channels[0].groups[0].message.message_id().unwrap();
        assert!(registry.panel(id).is_some());
    }

    #[tokio::test]
    async fn test_applied_channel_matched_by_id() {
        let (platform, _registry, reconciler) = setup();
        let first = doc(json!({"channels":[
            {"id":"1","groups":[{"message":{"content":"one"}}]},
            {"id":"2","groups":[{"message":{"content":"two"}}]}
        ]}));
        let applied = reconciler.reconcile(first, &FeatureDocument::default()).await.document;
        platform.clear_writes();

        let mut reordered = applied.clone();
        reordered.channels.reverse();
        let summary = reconciler.reconcile(reordered, &applied).await.summary;

        assert_eq!(summary.unchanged, 2);
        assert_eq!(platform.write_count(), 0);
    }
}

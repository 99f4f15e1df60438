//! # Feature: Role Buttons
//!
//! Persistent role-granting buttons. The reconciler registers every panel it
//! publishes in the [`ComponentRegistry`], keyed by platform message id, so a
//! click arriving after a restart still knows the labels, styles and count
//! settings of its panel. [`RoleButtonHandler`] turns a click into a role grant.

use crate::platform::{resolve_role, ChatPlatform, PlatformResult, RenderedButton};
use crate::templates::{button_label, parse_role_button_custom_id, ButtonStyle};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;

/// One button of a published panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonBinding {
    pub role_id: u64,
    pub custom_id: String,
    pub label: String,
    pub style: ButtonStyle,
    pub emoji: Option<String>,
    /// Last rendered member count, when counts are shown
    pub count: Option<u64>,
}

impl ButtonBinding {
    pub fn render(&self) -> RenderedButton {
        RenderedButton {
            custom_id: self.custom_id.clone(),
            label: button_label(&self.label, self.count),
            style: self.style,
            emoji: self.emoji.clone(),
        }
    }
}

/// A published message carrying role buttons
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonPanel {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub show_count: bool,
    pub buttons: Vec<ButtonBinding>,
}

impl ButtonPanel {
    pub fn render(&self) -> Vec<RenderedButton> {
        self.buttons.iter().map(ButtonBinding::render).collect()
    }
}

/// Panels by message id. Registering a message id again replaces its panel.
#[derive(Default)]
pub struct ComponentRegistry {
    panels: DashMap<u64, ButtonPanel>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, panel: ButtonPanel) {
        debug!(
            "Registering {} button(s) on message {}",
            panel.buttons.len(),
            panel.message_id
        );
        self.panels.insert(panel.message_id, panel);
    }

    pub fn panel(&self, message_id: u64) -> Option<ButtonPanel> {
        self.panels.get(&message_id).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.panels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    fn update_count(&self, message_id: u64, role_id: u64, count: u64) -> Option<ButtonPanel> {
        let mut panel = self.panels.get_mut(&message_id)?;
        for button in panel.buttons.iter_mut().filter(|b| b.role_id == role_id) {
            button.count = Some(count);
        }
        Some(panel.clone())
    }
}

/// A role button click
#[derive(Debug, Clone)]
pub struct ButtonClick {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub user_id: u64,
    pub custom_id: String,
}

/// What to tell the user who clicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted { role_id: u64, member_count: Option<u64> },
    RoleMissing { role_id: u64 },
    NotARoleButton,
}

impl GrantOutcome {
    pub fn reply(&self) -> &'static str {
        match self {
            GrantOutcome::Granted { .. } => "Successful",
            GrantOutcome::RoleMissing { .. } | GrantOutcome::NotARoleButton => "❌ Failed",
        }
    }
}

pub struct RoleButtonHandler {
    platform: Arc<dyn ChatPlatform>,
    registry: Arc<ComponentRegistry>,
}

impl RoleButtonHandler {
    pub fn new(platform: Arc<dyn ChatPlatform>, registry: Arc<ComponentRegistry>) -> Self {
        RoleButtonHandler { platform, registry }
    }

    pub fn handles(custom_id: &str) -> bool {
        parse_role_button_custom_id(custom_id).is_some()
    }

    /// Grant the role bound to the clicked button.
    ///
    /// Clicking again re-grants; it never removes the role.
    pub async fn handle_click(&self, click: &ButtonClick) -> PlatformResult<GrantOutcome> {
        let role_id = match parse_role_button_custom_id(&click.custom_id) {
            Some(role_id) => role_id,
            None => return Ok(GrantOutcome::NotARoleButton),
        };

        let role = resolve_role(self.platform.as_ref(), click.guild_id, role_id).await?;
        let role = match role {
            Some(role) => role,
            None => {
                warn!("Role {} not found in guild {}", role_id, click.guild_id);
                return Ok(GrantOutcome::RoleMissing { role_id });
            }
        };

        self.platform
            .add_role(click.guild_id, click.user_id, role.id)
            .await?;
        info!("Granted role {} ({}) to user {}", role.name, role.id, click.user_id);

        let show_count = self
            .registry
            .panel(click.message_id)
            .map(|p| p.show_count)
            .unwrap_or(false);
        if !show_count {
            return Ok(GrantOutcome::Granted {
                role_id,
                member_count: None,
            });
        }

        let count = self.platform.role_member_count(click.guild_id, role_id).await?;
        if let Some(panel) = self.registry.update_count(click.message_id, role_id, count) {
            self.platform
                .edit_components(click.channel_id, click.message_id, &panel.render())
                .await?;
        }

        Ok(GrantOutcome::Granted {
            role_id,
            member_count: Some(count),
        })
    }
}

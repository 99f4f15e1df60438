//! # Feature: Message Templates
//!
//! Typed model of the JSON documents that describe managed messages: channels,
//! message groups, embeds and role buttons. Documents are parsed and validated
//! once at the boundary; the reconciler only ever sees these types.
//!
//! ```json
//! {"channels": [{"id": "1", "groups": [{"disabled": false,
//!   "message": {"content": "hi", "embeds": []}}]}]}
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of every role button custom id
pub const ROLE_BUTTON_PREFIX: &str = "role_button:";

/// Discord allows five buttons per row and five rows per message
pub const MAX_BUTTONS_PER_MESSAGE: usize = 25;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureDocument {
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: String,

    /// Filled in with the resolved channel name on every apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub groups: Vec<MessageGroup>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    #[serde(default)]
    pub disabled: bool,

    pub message: MessageTemplate,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    /// Platform message id, back-filled after the first send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub embeds: Vec<EmbedTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<ButtonGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedTemplate {
    /// Label used in logs and the dashboard only, never sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// `#rrggbb`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,

    /// RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonGroup {
    /// Show the role's member count next to each label
    #[serde(default)]
    pub count: bool,

    #[serde(default)]
    pub list: Vec<ButtonTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonTemplate {
    pub label: String,

    #[serde(default)]
    pub style: ButtonStyle,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,

    pub role_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonStyle {
    #[default]
    #[serde(alias = "blurple")]
    Primary,
    #[serde(alias = "grey", alias = "gray")]
    Secondary,
    #[serde(alias = "green")]
    Success,
    #[serde(alias = "red")]
    Danger,
}

impl FeatureDocument {
    /// Parse a raw document and validate it
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.as_object().map(|o| o.is_empty()).unwrap_or(false) {
            return Ok(FeatureDocument::default());
        }
        let document: FeatureDocument = serde_json::from_value(value.clone())?;
        document.validate()?;
        Ok(document)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Check everything the platform would otherwise reject halfway through an apply
    pub fn validate(&self) -> Result<()> {
        for channel in &self.channels {
            channel.channel_id()?;

            for (index, group) in channel.groups.iter().enumerate() {
                let message = &group.message;

                if let Some(id) = &message.id {
                    if id.parse::<u64>().is_err() {
                        anyhow::bail!(
                            "Channel {} group {} has a non-numeric message id '{}'",
                            channel.id,
                            index,
                            id
                        );
                    }
                }

                for embed in &message.embeds {
                    if let Some(color) = &embed.color {
                        parse_color(color)?;
                    }
                }

                if let Some(buttons) = &message.buttons {
                    if buttons.list.len() > MAX_BUTTONS_PER_MESSAGE {
                        anyhow::bail!(
                            "Channel {} group {} has {} buttons, at most {} are allowed",
                            channel.id,
                            index,
                            buttons.list.len(),
                            MAX_BUTTONS_PER_MESSAGE
                        );
                    }
                    for button in &buttons.list {
                        if button.label.trim().is_empty() {
                            anyhow::bail!("Channel {} group {} has a button without a label", channel.id, index);
                        }
                        button.role_id()?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelEntry> {
        self.channels.iter().find(|c| c.id == id)
    }
}

impl ChannelEntry {
    pub fn channel_id(&self) -> Result<u64> {
        self.id
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("Channel id '{}' is not numeric", self.id))
    }
}

impl MessageTemplate {
    pub fn message_id(&self) -> Option<u64> {
        self.id.as_deref().and_then(|id| id.parse().ok())
    }

    /// Nothing to post: no content, no embeds, no buttons
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.embeds.is_empty()
            && self.buttons.as_ref().map(|b| b.list.is_empty()).unwrap_or(true)
    }

    pub fn content(&self) -> Option<String> {
        if self.content.is_empty() {
            None
        } else {
            Some(self.content.clone())
        }
    }
}

impl ButtonTemplate {
    pub fn role_id(&self) -> Result<u64> {
        self.role_id
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("Button '{}' has a non-numeric role id '{}'", self.label, self.role_id))
    }
}

impl EmbedTemplate {
    /// Numeric color, if one is set and well formed
    pub fn color_value(&self) -> Option<u32> {
        self.color.as_deref().and_then(|c| parse_color(c).ok())
    }
}

/// Parse a `#rrggbb` color
pub fn parse_color(color: &str) -> Result<u32> {
    let hex = color
        .strip_prefix('#')
        .ok_or_else(|| anyhow::anyhow!("Color '{}' must start with '#'", color))?;
    if hex.len() != 6 {
        anyhow::bail!("Color '{}' must have six hex digits", color);
    }
    u32::from_str_radix(hex, 16).map_err(|_| anyhow::anyhow!("Color '{}' is not valid hex", color))
}

/// Custom id carried by a role button
pub fn role_button_custom_id(role_id: u64) -> String {
    format!("{}{}", ROLE_BUTTON_PREFIX, role_id)
}

/// Role id encoded in a role button custom id
pub fn parse_role_button_custom_id(custom_id: &str) -> Option<u64> {
    custom_id.strip_prefix(ROLE_BUTTON_PREFIX)?.parse().ok()
}

/// Button label with an optional member count suffix
pub fn button_label(label: &str, count: Option<u64>) -> String {
    match count {
        Some(count) => format!("{} ({})", label, count),
        None => label.to_string(),
    }
}

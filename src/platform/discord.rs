//! Serenity-backed [`ChatPlatform`].
//!
//! Messages, roles and members go through serenity's cache and HTTP client.
//! Forum threads are listed through the REST API directly with `reqwest`,
//! since applied tags and pin flags are all the analysis needs from them.

use super::{
    ChannelInfo, ChatPlatform, OutgoingMessage, PlatformError, PlatformResult, RemoteMessage,
    RenderedButton, RoleInfo, ThreadInfo,
};
use crate::templates::{ButtonStyle, EmbedTemplate};
use log::{debug, warn};
use serde::Deserialize;
use serenity::async_trait;
use serenity::builder::{CreateActionRow, CreateButton, CreateComponents, CreateEmbed};
use serenity::cache::Cache;
use serenity::http::{Http, HttpError};
use serenity::model::application::component::ButtonStyle as SerenityButtonStyle;
use serenity::model::channel::{Channel, ReactionType};
use serenity::model::id::{ChannelId, GuildId, MessageId, RoleId, UserId};
use serenity::model::Timestamp;
use serenity::utils::Colour;
use std::convert::TryFrom;
use std::sync::Arc;

const DISCORD_API: &str = "https://discord.com/api/v10";

/// Page size used when walking guild members
const MEMBER_PAGE_SIZE: u64 = 1000;

/// Thread channel flag set on pinned forum posts
const THREAD_FLAG_PINNED: u64 = 1 << 1;

pub struct DiscordPlatform {
    http: Arc<Http>,
    cache: Arc<Cache>,
    rest: reqwest::Client,
    token: String,
}

impl DiscordPlatform {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>, token: &str) -> Self {
        DiscordPlatform {
            http,
            cache,
            rest: reqwest::Client::new(),
            token: token.to_string(),
        }
    }

    async fn rest_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> PlatformResult<T> {
        let response = self
            .rest
            .get(format!("{}{}", DISCORD_API, path))
            .query(query)
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| PlatformError::Other(format!("Failed to connect to Discord API: {}", e)))?;

        match response.status().as_u16() {
            404 => return Err(PlatformError::NotFound),
            403 => return Err(PlatformError::Forbidden),
            _ => {}
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Other(format!("Discord API error ({}): {}", status, body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::Other(format!("Failed to parse Discord API response: {}", e)))
    }
}

/// Map a serenity error onto the categories callers branch on
fn classify(err: serenity::Error) -> PlatformError {
    if let serenity::Error::Http(ref http_err) = err {
        if let HttpError::UnsuccessfulRequest(ref response) = **http_err {
            match response.status_code.as_u16() {
                404 => return PlatformError::NotFound,
                403 => return PlatformError::Forbidden,
                _ => {}
            }
        }
    }
    PlatformError::Other(err.to_string())
}

fn build_embed(template: &EmbedTemplate) -> CreateEmbed {
    let mut embed = CreateEmbed::default();
    if let Some(title) = &template.title {
        embed.title(title);
    }
    if let Some(description) = &template.description {
        embed.description(description);
    }
    if let Some(url) = &template.url {
        embed.url(url);
    }
    if let Some(color) = template.color_value() {
        embed.colour(Colour::new(color));
    }
    if let Some(footer) = &template.footer {
        embed.footer(|f| f.text(footer));
    }
    if let Some(image) = &template.image {
        embed.image(image);
    }
    if let Some(thumbnail) = &template.thumbnail {
        embed.thumbnail(thumbnail);
    }
    if let Some(timestamp) = &template.timestamp {
        match Timestamp::parse(timestamp) {
            Ok(ts) => {
                embed.timestamp(ts);
            }
            Err(_) => warn!("Ignoring invalid embed timestamp '{}'", timestamp),
        }
    }
    for field in &template.fields {
        embed.field(&field.name, &field.value, field.inline);
    }
    embed
}

fn button_style(style: ButtonStyle) -> SerenityButtonStyle {
    match style {
        ButtonStyle::Primary => SerenityButtonStyle::Primary,
        ButtonStyle::Secondary => SerenityButtonStyle::Secondary,
        ButtonStyle::Success => SerenityButtonStyle::Success,
        ButtonStyle::Danger => SerenityButtonStyle::Danger,
    }
}

fn build_components(buttons: &[RenderedButton]) -> CreateComponents {
    let mut components = CreateComponents::default();
    for chunk in buttons.chunks(5) {
        let mut row = CreateActionRow::default();
        for rendered in chunk {
            let mut button = CreateButton::default();
            button
                .custom_id(&rendered.custom_id)
                .label(&rendered.label)
                .style(button_style(rendered.style));
            if let Some(emoji) = &rendered.emoji {
                let reaction = ReactionType::try_from(emoji.as_str())
                    .unwrap_or_else(|_| ReactionType::Unicode(emoji.clone()));
                button.emoji(reaction);
            }
            row.add_button(button);
        }
        components.add_action_row(row);
    }
    components
}

#[derive(Debug, Deserialize)]
struct RawThreadMetadata {
    #[serde(default)]
    locked: bool,
}

#[derive(Debug, Deserialize)]
struct RawThread {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    message_count: Option<u64>,
    #[serde(default)]
    flags: Option<u64>,
    #[serde(default)]
    applied_tags: Vec<String>,
    #[serde(default)]
    thread_metadata: Option<RawThreadMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawThreadList {
    threads: Vec<RawThread>,
    #[serde(default)]
    has_more: bool,
}

impl RawThread {
    fn into_thread_info(self) -> Option<ThreadInfo> {
        Some(ThreadInfo {
            id: self.id.parse().ok()?,
            name: self.name,
            locked: self.thread_metadata.map(|m| m.locked).unwrap_or(false),
            pinned: self.flags.unwrap_or(0) & THREAD_FLAG_PINNED != 0,
            applied_tags: self
                .applied_tags
                .iter()
                .filter_map(|t| t.parse().ok())
                .collect(),
            message_count: self.message_count.unwrap_or(0),
        })
    }
}

#[async_trait]
impl ChatPlatform for DiscordPlatform {
    async fn resolve_channel(&self, channel_id: u64) -> Option<ChannelInfo> {
        if let Some(channel) = self.cache.guild_channel(ChannelId(channel_id)) {
            return Some(ChannelInfo {
                id: channel_id,
                name: channel.name,
                guild_id: Some(channel.guild_id.0),
            });
        }

        debug!("Channel {} not in cache, fetching", channel_id);
        match self.http.get_channel(channel_id).await {
            Ok(Channel::Guild(channel)) => Some(ChannelInfo {
                id: channel_id,
                name: channel.name,
                guild_id: Some(channel.guild_id.0),
            }),
            Ok(_) => None,
            Err(e) => {
                debug!("Failed to fetch channel {}: {}", channel_id, e);
                None
            }
        }
    }

    async fn fetch_message(&self, channel_id: u64, message_id: u64) -> PlatformResult<RemoteMessage> {
        let message = ChannelId(channel_id)
            .message(&self.http, MessageId(message_id))
            .await
            .map_err(classify)?;
        Ok(RemoteMessage {
            id: message.id.0,
            channel_id,
            content: message.content,
        })
    }

    async fn send_message(&self, channel_id: u64, message: &OutgoingMessage) -> PlatformResult<u64> {
        let embeds: Vec<CreateEmbed> = message.embeds.iter().map(build_embed).collect();
        let components = build_components(&message.buttons);

        let sent = ChannelId(channel_id)
            .send_message(&self.http, |m| {
                if let Some(content) = &message.content {
                    m.content(content);
                }
                m.set_embeds(embeds).set_components(components)
            })
            .await
            .map_err(classify)?;
        Ok(sent.id.0)
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        message: &OutgoingMessage,
    ) -> PlatformResult<()> {
        let embeds: Vec<CreateEmbed> = message.embeds.iter().map(build_embed).collect();
        let components = build_components(&message.buttons);
        let content = message.content.clone().unwrap_or_default();

        ChannelId(channel_id)
            .edit_message(&self.http, MessageId(message_id), |m| {
                m.content(content).set_embeds(embeds).set_components(components)
            })
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn edit_components(
        &self,
        channel_id: u64,
        message_id: u64,
        buttons: &[RenderedButton],
    ) -> PlatformResult<()> {
        let components = build_components(buttons);
        ChannelId(channel_id)
            .edit_message(&self.http, MessageId(message_id), |m| m.set_components(components))
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn cached_role(&self, guild_id: u64, role_id: u64) -> Option<RoleInfo> {
        self.cache
            .role(GuildId(guild_id), RoleId(role_id))
            .map(|role| RoleInfo {
                id: role.id.0,
                name: role.name,
            })
    }

    async fn fetch_roles(&self, guild_id: u64) -> PlatformResult<Vec<RoleInfo>> {
        let roles = GuildId(guild_id).roles(&self.http).await.map_err(classify)?;
        Ok(roles
            .into_values()
            .map(|role| RoleInfo {
                id: role.id.0,
                name: role.name,
            })
            .collect())
    }

    async fn role_member_count(&self, guild_id: u64, role_id: u64) -> PlatformResult<u64> {
        let role = RoleId(role_id);
        let cached = self
            .cache
            .guild_field(GuildId(guild_id), |guild| {
                count_holders(
                    guild.members.values().map(|m| m.roles.as_slice()),
                    guild.members.len(),
                    guild.member_count,
                    role,
                )
            })
            .flatten();
        if let Some(count) = cached {
            return Ok(count);
        }

        debug!("Member cache of guild {} is incomplete, counting over HTTP", guild_id);
        let mut count = 0u64;
        let mut after: Option<UserId> = None;

        loop {
            let page = GuildId(guild_id)
                .members(&self.http, Some(MEMBER_PAGE_SIZE), after)
                .await
                .map_err(classify)?;

            count += page.iter().filter(|m| m.roles.contains(&role)).count() as u64;

            if (page.len() as u64) < MEMBER_PAGE_SIZE {
                break;
            }
            after = page.last().map(|m| m.user.id);
        }

        Ok(count)
    }

    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> PlatformResult<()> {
        let mut member = GuildId(guild_id)
            .member(&*self.http, UserId(user_id))
            .await
            .map_err(classify)?;
        member
            .add_role(&self.http, RoleId(role_id))
            .await
            .map_err(classify)
    }

    async fn forum_threads(&self, guild_id: u64, forum_channel_id: u64) -> PlatformResult<Vec<ThreadInfo>> {
        let parent = forum_channel_id.to_string();

        let active: RawThreadList = self
            .rest_get(&format!("/guilds/{}/threads/active", guild_id), &[])
            .await?;
        let mut threads: Vec<ThreadInfo> = active
            .threads
            .into_iter()
            .filter(|t| t.parent_id.as_deref() == Some(parent.as_str()))
            .filter_map(RawThread::into_thread_info)
            .collect();
        threads.sort_by(|a, b| b.id.cmp(&a.id));

        let path = format!("/channels/{}/threads/archived/public", forum_channel_id);
        let mut before: Option<String> = None;
        loop {
            let mut query = vec![("limit", "100".to_string())];
            if let Some(ts) = &before {
                query.push(("before", ts.clone()));
            }
            let page: serde_json::Value = self.rest_get(&path, &query).await?;

            // Pagination cursor is the archive timestamp of the last thread
            before = page["threads"]
                .as_array()
                .and_then(|t| t.last())
                .and_then(|t| t["thread_metadata"]["archive_timestamp"].as_str())
                .map(str::to_string);

            let list: RawThreadList = serde_json::from_value(page)
                .map_err(|e| PlatformError::Other(format!("Failed to parse thread list: {}", e)))?;
            let has_more = list.has_more;
            threads.extend(list.threads.into_iter().filter_map(RawThread::into_thread_info));

            if !has_more || before.is_none() {
                break;
            }
        }

        Ok(threads)
    }

    async fn starter_reaction_count(&self, thread_id: u64) -> PlatformResult<Option<u64>> {
        // Forum posts share their id with the thread
        let starter = match ChannelId(thread_id)
            .message(&self.http, MessageId(thread_id))
            .await
        {
            Ok(message) => Some(message),
            Err(e) => {
                let err = classify(e);
                if !err.is_absent() {
                    return Err(err);
                }
                ChannelId(thread_id)
                    .messages(&self.http, |r| r.after(MessageId(1)).limit(1))
                    .await
                    .map_err(classify)?
                    .into_iter()
                    .next()
            }
        };

        Ok(starter.map(|m| m.reactions.first().map(|r| r.count).unwrap_or(0)))
    }
}

/// Count members holding `role`, or `None` when the cache does not hold every
/// member of the guild yet
fn count_holders<'a>(
    member_roles: impl Iterator<Item = &'a [RoleId]>,
    cached: usize,
    member_count: u64,
    role: RoleId,
) -> Option<u64> {
    if (cached as u64) < member_count {
        return None;
    }
    Some(member_roles.filter(|roles| roles.contains(&role)).count() as u64)
}

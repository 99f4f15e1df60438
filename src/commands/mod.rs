//! Slash command registration and interaction dispatch

pub mod slash;

use crate::components::{ButtonClick, RoleButtonHandler};
use crate::forum_analysis::ForumAnalyser;
use anyhow::Result;
use log::{debug, error, info, warn};
use serenity::model::application::interaction::application_command::ApplicationCommandInteraction;
use serenity::model::application::interaction::message_component::MessageComponentInteraction;
use serenity::model::application::interaction::InteractionResponseType;
use serenity::model::id::GuildId;
use serenity::prelude::*;
use std::sync::Arc;

use slash::admin::{forum_analysis_request, FORUM_ANALYSIS};

/// Register every slash command for one guild
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    let commands = slash::create_all_commands();
    let count = commands.len();
    guild_id
        .set_application_commands(&ctx.http, |builder| {
            for command in commands {
                builder.add_application_command(command);
            }
            builder
        })
        .await?;
    info!("Registered {} slash command(s) for guild {}", count, guild_id);
    Ok(())
}

pub struct CommandHandler {
    forum: Option<Arc<ForumAnalyser>>,
    role_buttons: RoleButtonHandler,
}

impl CommandHandler {
    pub fn new(forum: Option<Arc<ForumAnalyser>>, role_buttons: RoleButtonHandler) -> Self {
        CommandHandler { forum, role_buttons }
    }

    pub async fn handle_slash_command(
        &self,
        ctx: &Context,
        command: &ApplicationCommandInteraction,
    ) -> Result<()> {
        match command.data.name.as_str() {
            FORUM_ANALYSIS => self.handle_forum_analysis(ctx, command).await,
            other => {
                warn!("Unknown slash command '{}'", other);
                respond(ctx, command, "Unknown command", true).await
            }
        }
    }

    async fn handle_forum_analysis(
        &self,
        ctx: &Context,
        command: &ApplicationCommandInteraction,
    ) -> Result<()> {
        let request = forum_analysis_request(
            command
                .data
                .options
                .iter()
                .map(|option| (option.name.as_str(), option.value.as_ref())),
        );

        let params = match request.validate() {
            Ok(params) => params,
            Err(message) => return respond(ctx, command, &message, false).await,
        };

        let analyser = match &self.forum {
            Some(analyser) => analyser.clone(),
            None => {
                return respond(ctx, command, "Forum analysis is not configured", true).await;
            }
        };

        if let Err(message) = analyser.check_channel(command.channel_id.0) {
            return respond(ctx, command, &message, true).await;
        }

        respond(ctx, command, "Generating data...", false).await?;
        info!(
            "[forum_analysis] Started by {} with {}",
            command.user.name,
            params.describe()
        );
        tokio::spawn(async move {
            if let Err(e) = analyser.run(&params).await {
                error!("[forum_analysis] Analysis failed: {}", e);
            }
        });
        Ok(())
    }

    pub async fn handle_component(
        &self,
        ctx: &Context,
        component: &MessageComponentInteraction,
    ) -> Result<()> {
        let custom_id = component.data.custom_id.as_str();
        if !RoleButtonHandler::handles(custom_id) {
            debug!("Ignoring component '{}'", custom_id);
            return Ok(());
        }

        let guild_id = match component.guild_id {
            Some(guild_id) => guild_id.0,
            None => return respond_component(ctx, component, "❌ Failed").await,
        };
        let click = ButtonClick {
            guild_id,
            channel_id: component.channel_id.0,
            message_id: component.message.id.0,
            user_id: component.user.id.0,
            custom_id: custom_id.to_string(),
        };

        let reply = match self.role_buttons.handle_click(&click).await {
            Ok(outcome) => outcome.reply(),
            Err(e) => {
                error!("[role_buttons] Failed to grant from '{}': {}", custom_id, e);
                "❌ Failed"
            }
        };
        respond_component(ctx, component, reply).await
    }
}

async fn respond(
    ctx: &Context,
    command: &ApplicationCommandInteraction,
    content: &str,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_interaction_response(&ctx.http, |response| {
            response
                .kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|message| message.content(content).ephemeral(ephemeral))
        })
        .await?;
    Ok(())
}

async fn respond_component(
    ctx: &Context,
    component: &MessageComponentInteraction,
    content: &str,
) -> Result<()> {
    component
        .create_interaction_response(&ctx.http, |response| {
            response
                .kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|message| message.content(content).ephemeral(true))
        })
        .await?;
    Ok(())
}

//! Ranger Discord bot entry point
//!
//! Runs the bot and the config dashboard in one process. Configuration can come
//! from:
//! - config.yaml (or the file named by CONFIG_FILE)
//! - Environment variables
//!
//! With `debug_server` enabled only the dashboard is started.

use anyhow::Result;
use dotenvy::dotenv;
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use serenity::async_trait;
use serenity::client::bridge::gateway::ChunkGuildFilter;
use serenity::model::application::interaction::{Interaction, InteractionResponseType};
use serenity::model::gateway::Ready;
use serenity::model::id::GuildId;
use serenity::prelude::*;
use std::sync::Arc;

use ranger::commands::{register_guild_commands, CommandHandler};
use ranger::components::{ComponentRegistry, RoleButtonHandler};
use ranger::config::AppConfig;
use ranger::dashboard::{self, DashboardState};
use ranger::database::Database;
use ranger::features::managed::{ManagedMessages, EMBED_MESSAGE, ROLE_BUTTONS};
use ranger::features::FeatureRegistry;
use ranger::forum_analysis::{ForumAnalyser, ForumSettings};
use ranger::platform::discord::DiscordPlatform;
use ranger::platform::ChatPlatform;
use ranger::reconcile::Reconciler;
use ranger::store::ConfigStore;

/// Everything the event handler needs once the client exists
struct Runtime {
    features: FeatureRegistry,
    command_handler: CommandHandler,
}

struct Handler {
    guild_id: GuildId,
    runtime: Arc<OnceCell<Runtime>>,
}

impl Handler {
    fn runtime(&self) -> Option<&Runtime> {
        let runtime = self.runtime.get();
        if runtime.is_none() {
            warn!("Event received before the runtime was initialised");
        }
        runtime
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected and ready!", ready.user.name);
        info!("Connected to {} guilds", ready.guilds.len());

        if let Err(e) = register_guild_commands(&ctx, self.guild_id).await {
            error!("Failed to register guild slash commands: {e}");
        }

        // Fill the member cache so role counts do not need the HTTP member list
        ctx.shard
            .chunk_guild(self.guild_id, None, ChunkGuildFilter::None, None);

        let runtime = match self.runtime() {
            Some(runtime) => runtime,
            None => return,
        };
        // Reconnects fire `ready` again; components are only published once
        if runtime.features.on_ready().await {
            info!("Persistent components added");
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let runtime = match self.runtime() {
            Some(runtime) => runtime,
            None => return,
        };

        match interaction {
            Interaction::ApplicationCommand(command) => {
                if let Err(e) = runtime
                    .command_handler
                    .handle_slash_command(&ctx, &command)
                    .await
                {
                    error!(
                        "Error handling slash command '{}': {}",
                        command.data.name, e
                    );

                    let error_message =
                        "Sorry, I encountered an error processing your command. Please try again.";

                    #[allow(clippy::redundant_pattern_matching)]
                    if let Err(_) = command
                        .edit_original_interaction_response(&ctx.http, |response| {
                            response.content(error_message)
                        })
                        .await
                    {
                        let _ = command
                            .create_interaction_response(&ctx.http, |response| {
                                response
                                    .kind(InteractionResponseType::ChannelMessageWithSource)
                                    .interaction_response_data(|message| {
                                        message.content(error_message).ephemeral(true)
                                    })
                            })
                            .await;
                    }
                }
            }
            Interaction::MessageComponent(component) => {
                if let Err(e) = runtime
                    .command_handler
                    .handle_component(&ctx, &component)
                    .await
                {
                    error!(
                        "Error handling component interaction '{}': {}",
                        component.data.custom_id, e
                    );
                }
            }
            Interaction::Ping(_) => {
                info!("Ping interaction received");
            }
            _ => {}
        }
    }
}

/// Build the features, wire them to the platform and connect to the gateway
async fn run_bot(config: &AppConfig, store: ConfigStore) -> Result<()> {
    let guild_id = config.guild_id()?;
    let runtime = Arc::new(OnceCell::new());
    let handler = Handler {
        guild_id: GuildId(guild_id),
        runtime: runtime.clone(),
    };

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_MEMBERS;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await
        .map_err(|e| {
            error!("Failed to create Discord client: {e}");
            anyhow::anyhow!("Client creation failed: {}", e)
        })?;

    let platform: Arc<dyn ChatPlatform> = Arc::new(DiscordPlatform::new(
        client.cache_and_http.http.clone(),
        client.cache_and_http.cache.clone(),
        &config.discord_token,
    ));
    let components = Arc::new(ComponentRegistry::new());

    let mut features = FeatureRegistry::new();
    for name in [EMBED_MESSAGE, ROLE_BUTTONS] {
        let reconciler = Reconciler::new(name, guild_id, platform.clone(), components.clone());
        features.register(Arc::new(ManagedMessages::spawn(
            name,
            store.clone(),
            reconciler,
            config.poll_interval(),
        )));
    }
    features.load_all().await?;

    let forum = match &config.forum_analysis {
        Some(forum_config) => Some(Arc::new(ForumAnalyser::new(
            platform.clone(),
            guild_id,
            ForumSettings::from_config(forum_config)?,
        ))),
        None => {
            info!("[forum_analysis] Not configured, command will report as much");
            None
        }
    };
    let command_handler = CommandHandler::new(
        forum,
        RoleButtonHandler::new(platform.clone(), components.clone()),
    );

    if runtime
        .set(Runtime {
            features,
            command_handler,
        })
        .is_err()
    {
        anyhow::bail!("Runtime initialised twice");
    }

    let dashboard_config = config.dashboard.clone();
    let dashboard_state = DashboardState::new(store, Some(platform));
    tokio::spawn(async move {
        if let Err(e) = dashboard::serve(&dashboard_config, dashboard_state).await {
            error!("[dashboard] {:#}", e);
        }
    });

    // Set up Ctrl+C handler for graceful shutdown
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                shard_manager.lock().await.shutdown_all().await;
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    });

    info!("Connecting to Discord gateway...");

    // Blocks until disconnect
    client.start().await.map_err(|e| {
        error!("Gateway connection failed: {e}");
        anyhow::anyhow!("Gateway connection failed: {}", e)
    })?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    let config = AppConfig::auto_load()?;

    // Set up logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log_level),
    )
    .init();

    info!("Starting Ranger...");
    let store = ConfigStore::new(&config.configs_dir);

    if config.debug_server {
        info!("Server debugging turned on, skipping bot start");
        return dashboard::serve(&config.dashboard, DashboardState::new(store, None)).await;
    }

    // Held open for the lifetime of the process
    let _database = Database::new(&config.database_path).await.map_err(|e| {
        error!("Failed to open database at {}: {e}", config.database_path);
        e
    })?;

    if let Err(e) = run_bot(&config, store).await {
        error!("Bot failed: {:#}", e);
        return Err(e);
    }

    info!("Bot shut down successfully");
    Ok(())
}

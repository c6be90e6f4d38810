use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trackbot::config::Config;
use trackbot::db::Database;
use trackbot::discord::{SerenityDelivery, SerenityRoles};
use trackbot::poller::fetch::Fetcher;
use trackbot::poller::scheduler::{PollScheduler, TrackerHandle};
use trackbot::poller::SubscriptionPoller;
use trackbot::roles::{export::ExportService, forum::AdForumService, linked::LinkedRoleService};
use trackbot::services::tracking::TrackingStore;
use trackbot::trackers::{curseforge::CurseForgeFetcher, http_client, twitch::TwitchFetcher, youtube::YouTubeFetcher};
use trackbot::{commands, events, Data};

/// Build a tracker's poller and start its scheduler.
async fn spawn_tracker(
    fetcher: Arc<dyn Fetcher>,
    delivery: Arc<SerenityDelivery>,
    tracking: &TrackingStore,
    shutdown: &CancellationToken,
) -> anyhow::Result<TrackerHandle> {
    let kind = fetcher.kind();
    let store = Arc::new(tracking.clone());
    let poller = Arc::new(SubscriptionPoller::new(fetcher, delivery, store.clone(), store));
    let period = tracking.poll_interval(kind).await?;
    let (scheduler, handle) = PollScheduler::new(poller.clone(), period, shutdown.child_token());
    tokio::spawn(scheduler.run());
    Ok(TrackerHandle {
        poller,
        scheduler: handle,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    let discord_token = config.discord_token.clone();
    let shutdown = CancellationToken::new();

    let db = Database::new(&config)?;
    db.execute_init()?;

    let mut owners = std::collections::HashSet::new();
    if let Some(owner_id) = config.owner_id {
        owners.insert(serenity::UserId::new(owner_id));
    }

    let setup_shutdown = shutdown.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            owners,
            event_handler: |ctx, event, framework, data| {
                Box::pin(events::handle_event(ctx, event, framework, data))
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!("Command /{} failed: {}", ctx.command().qualified_name, error);
                            let _ = ctx.say("❌ Something went wrong, check the bot logs.").await;
                        }
                        other => {
                            if let Err(e) = poise::builtins::on_error(other).await {
                                error!("Error while handling error: {}", e);
                            }
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                if config.register_commands {
                    let commands = &framework.options().commands;
                    match config.dev_guild_id {
                        Some(guild_id) => {
                            poise::builtins::register_in_guild(ctx, commands, serenity::GuildId::new(guild_id))
                                .await?;
                            info!("Registered commands in dev guild {}", guild_id);
                        }
                        None => {
                            poise::builtins::register_globally(ctx, commands).await?;
                            info!("Registered commands globally");
                        }
                    }
                }

                // Set bot status
                ctx.set_activity(Some(serenity::ActivityData::custom(&config.status_message)));

                let http_client = http_client(config.http_timeout_secs);
                let delivery = Arc::new(SerenityDelivery::new(ctx.http.clone()));
                let tracking = TrackingStore::new(db.clone(), config.clone());
                let twitch_api = Arc::new(TwitchFetcher::new(http_client.clone()));

                let cfmod = spawn_tracker(
                    Arc::new(CurseForgeFetcher::new(http_client.clone())),
                    delivery.clone(),
                    &tracking,
                    &setup_shutdown,
                )
                .await?;
                let tube = spawn_tracker(
                    Arc::new(YouTubeFetcher::new(http_client.clone())),
                    delivery.clone(),
                    &tracking,
                    &setup_shutdown,
                )
                .await?;
                let twitch = spawn_tracker(twitch_api.clone(), delivery, &tracking, &setup_shutdown).await?;

                Ok(Data {
                    http: ctx.http.clone(),
                    linked_roles: Arc::new(LinkedRoleService::new(db.clone())),
                    adforum: Arc::new(AdForumService::new(db.clone())),
                    exports: Arc::new(ExportService::new(db.clone())),
                    roles: Arc::new(SerenityRoles::new(ctx.http.clone())),
                    config,
                    db,
                    tracking,
                    cfmod,
                    tube,
                    twitch,
                    twitch_api,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::GUILD_MEMBERS;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            ctrl_c_shutdown.cancel();
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }
    shutdown.cancel();

    Ok(())
}

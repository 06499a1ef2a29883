use crate::bot::handlers::{handle_command, Command};
use crate::bot::updates::{handle_group_message, handle_member_update};
use crate::bot::UnauthorizedCache;
use crate::config::{
    get_roster_probe_concurrency, get_unauthorized_cache_max_size, get_unauthorized_cache_ttl,
    get_unauthorized_cooldown, BotSettings,
};
use crate::gateway::TelegramGateway;
use lurkwarden_core::config::{get_sweep_interval, EngineTuning, StoreBackend};
use lurkwarden_core::gateway::ChatGateway;
use lurkwarden_core::moderator::Moderator;
use lurkwarden_core::storage::{MembershipStore, MemoryStore, R2Backend, R2Store};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::AllowedUpdate;
use teloxide::update_listeners::Polling;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the Telegram transport runtime.
///
/// Serves updates until Ctrl-C, with the periodic sweep running alongside.
pub async fn run_bot(settings: Arc<BotSettings>) {
    let store = init_store(&settings).await;
    let bot = Bot::new(settings.telegram.telegram_token.clone());

    let gateway: Arc<dyn ChatGateway> = Arc::new(TelegramGateway::new(
        bot.clone(),
        Arc::clone(&store),
        get_roster_probe_concurrency(),
    ));
    let moderator = Arc::new(Moderator::new(
        gateway,
        store,
        settings.moderation.as_ref(),
        EngineTuning::from_env(),
    ));
    info!(tuning = ?moderator.tuning(), "Moderation engine initialized.");

    let cancel = CancellationToken::new();
    let every = get_sweep_interval();
    info!(interval_secs = every.as_secs(), "Starting sweep scheduler");
    let sweeps = tokio::spawn(moderator.sweeper().run(every, cancel.clone()));

    let unauthorized_cache = init_unauthorized_cache();
    let handler = setup_handler();

    // chat_member updates are only delivered when requested explicitly
    let listener = Polling::builder(bot.clone())
        .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChatMember])
        .delete_webhook()
        .await
        .build();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![moderator, settings, unauthorized_cache])
        .enable_ctrlc_handler()
        .build()
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    cancel.cancel();
    if let Err(e) = sweeps.await {
        error!(error = %e, "Sweep scheduler ended abnormally");
    }
    info!("Bot stopped.");
}

async fn init_store(settings: &BotSettings) -> Arc<dyn MembershipStore> {
    match settings.moderation.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store, membership data is lost on restart.");
            Arc::new(MemoryStore::in_memory())
        }
        StoreBackend::R2 => match R2Backend::new(settings.moderation.as_ref()).await {
            Ok(backend) => {
                let store = R2Store::new(backend);
                match store.check_connection().await {
                    Ok(()) => info!("R2 Storage initialized."),
                    Err(e) => error!(error = %e, "R2 Storage connection check returned error."),
                }
                Arc::new(store)
            }
            Err(e) => {
                error!(error = %e, "Failed to initialize R2 Storage");
                std::process::exit(1);
            }
        },
    }
}

fn init_unauthorized_cache() -> UnauthorizedCache {
    let cooldown = get_unauthorized_cooldown();
    let ttl = get_unauthorized_cache_ttl();
    let max_size = get_unauthorized_cache_max_size();

    info!(
        "Initializing UnauthorizedCache (cooldown: {}s, ttl: {}s, max_size: {})",
        cooldown, ttl, max_size
    );

    UnauthorizedCache::new(cooldown, ttl, max_size)
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_chat_member().endpoint(handle_member_update))
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(dptree::endpoint(handle_group_message)),
        )
}

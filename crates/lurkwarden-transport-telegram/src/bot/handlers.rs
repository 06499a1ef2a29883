//! Moderation command handlers.

use crate::bot::resilient::send_html_resilient;
use crate::bot::views;
use crate::bot::UnauthorizedCache;
use crate::config::BotSettings;
use crate::gateway::{profile_of, user_id_of};
use anyhow::Result;
use lurkwarden_core::error::ModerationError;
use lurkwarden_core::executor::PurgeMode;
use lurkwarden_core::moderator::Moderator;
use std::future::Future;
use std::sync::Arc;
use teloxide::{prelude::*, utils::command::BotCommands};
use tracing::{error, info, warn};

/// Window used by `/gcstats` without an argument.
const DEFAULT_STATS_WINDOW: &str = "7d";

/// Supported commands.
#[allow(missing_docs)] // variants are documented via `#[command(description)]`
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Lurkwarden commands:")]
pub enum Command {
    #[command(description = "show this help")]
    Help,
    #[command(description = "welcome message")]
    Start,
    #[command(description = "kick members without a media post within <time>, e.g. /inactivekick 3d")]
    InactiveKick(String),
    #[command(description = "ban members without a media post within <time>")]
    InactiveBan(String),
    #[command(description = "report who /inactivekick <time> would remove")]
    PretendKick(String),
    #[command(rename = "3strikes", description = "toggle a ban on the third inactivity kick")]
    ThreeStrikes,
    #[command(description = "toggle banning members who leave")]
    BanLeavers,
    #[command(description = "require membership of another chat: <chat id> or off")]
    Obligation(String),
    #[command(description = "reconcile every tracked chat now")]
    Sweep,
    #[command(rename = "wl_add", description = "exempt a user from purges: @user, id, or reply")]
    WlAdd(String),
    #[command(rename = "wl_del", description = "remove a purge exemption")]
    WlDel(String),
    #[command(rename = "wl", description = "list exempt users")]
    Wl,
    #[command(description = "everything known about a user: @user, id, or reply")]
    LurkInfo(String),
    #[command(description = "chat statistics over <time>, default 7d")]
    GcStats(String),
    #[command(description = "forget chats the bot can no longer reach (private chat only)")]
    CleanDb,
}

/// Where a command may be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Anyone, anywhere.
    Public,
    /// Chat admins inside a group.
    Group,
    /// Authorized admins in a private chat.
    Private,
    /// Either of the above.
    Anywhere,
}

impl Command {
    const fn scope(&self) -> Scope {
        match self {
            Self::Help | Self::Start => Scope::Public,
            Self::CleanDb => Scope::Private,
            Self::Sweep | Self::Wl => Scope::Anywhere,
            _ => Scope::Group,
        }
    }
}

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, user_id_of)
}

/// Endpoint for parsed commands.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    moderator: Arc<Moderator>,
    settings: Arc<BotSettings>,
    cache: UnauthorizedCache,
) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    if let Err(e) = run_command(&bot, &msg, cmd, &moderator, &settings, &cache).await {
        error!(chat_id, error = %e, "Command failed");
    }
    respond(())
}

/// Private chats need an explicitly authorized admin; groups need a chat admin
/// in a chat one of the authorized admins moderates.
async fn is_allowed(msg: &Message, moderator: &Moderator, settings: &BotSettings) -> bool {
    let issuer = get_user_id_safe(msg);
    let authorized = settings.telegram.authorized_admins();
    if msg.chat.is_private() {
        return authorized.contains(&issuer);
    }
    let chat_id = msg.chat.id.0;
    moderator.is_chat_admin(chat_id, issuer).await
        && moderator.is_chat_authorized(chat_id, &authorized).await
}

async fn refuse(bot: &Bot, msg: &Message, cache: &UnauthorizedCache) -> Result<()> {
    let chat_id = msg.chat.id.0;
    let issuer = get_user_id_safe(msg);
    info!(chat_id, user_id = issuer, "Unauthorized command");
    if cache.should_reply(chat_id, issuer) {
        send_html_resilient(bot, msg.chat.id, views::NOT_AUTHORIZED).await?;
        cache.mark_replied(chat_id).await;
    }
    Ok(())
}

async fn run_command(
    bot: &Bot,
    msg: &Message,
    cmd: Command,
    moderator: &Arc<Moderator>,
    settings: &BotSettings,
    cache: &UnauthorizedCache,
) -> Result<()> {
    let private = msg.chat.is_private();
    let misplaced = match cmd.scope() {
        Scope::Group if private => Some(views::GROUP_ONLY),
        Scope::Private if !private => Some(views::PRIVATE_ONLY),
        _ => None,
    };
    if let Some(text) = misplaced {
        send_html_resilient(bot, msg.chat.id, text).await?;
        return Ok(());
    }
    if cmd.scope() != Scope::Public && !is_allowed(msg, moderator, settings).await {
        return refuse(bot, msg, cache).await;
    }

    let chat_id = msg.chat.id.0;
    let reply = match cmd {
        Command::Help => html_escape::encode_text(&Command::descriptions().to_string()).into_owned(),
        Command::Start => views::WELCOME.to_string(),
        Command::InactiveKick(cutoff) => {
            spawn_purge(bot, moderator, msg.chat.id, cutoff, PurgeMode::Kick, false);
            return Ok(());
        }
        Command::InactiveBan(cutoff) => {
            spawn_purge(bot, moderator, msg.chat.id, cutoff, PurgeMode::Ban, false);
            return Ok(());
        }
        Command::PretendKick(cutoff) => {
            spawn_purge(bot, moderator, msg.chat.id, cutoff, PurgeMode::Kick, true);
            return Ok(());
        }
        Command::Sweep => {
            let moderator = Arc::clone(moderator);
            spawn_reply(bot.clone(), msg.chat.id, async move {
                views::sweep_summary(&moderator.run_sweep_now().await)
            });
            return Ok(());
        }
        Command::ThreeStrikes => outcome(moderator.toggle_three_strikes(chat_id).await, |on| {
            views::toggled("Three strikes", on)
        }),
        Command::BanLeavers => outcome(moderator.toggle_ban_leavers(chat_id).await, |on| {
            views::toggled("Ban leavers", on)
        }),
        Command::Obligation(arg) => set_obligation(moderator, chat_id, &arg).await,
        Command::WlAdd(arg) => change_whitelist(moderator, msg, &arg, true).await,
        Command::WlDel(arg) => change_whitelist(moderator, msg, &arg, false).await,
        Command::Wl => outcome(moderator.whitelist((!private).then_some(chat_id)).await, |e| {
            views::whitelist(&e)
        }),
        Command::LurkInfo(arg) => match target_user(moderator, msg, &arg).await {
            Ok((user_id, _)) => outcome(moderator.lookup_user(chat_id, user_id).await, |l| {
                views::lookup(&l)
            }),
            Err(e) => views::error(&e),
        },
        Command::GcStats(window) => {
            let window = Some(window.trim())
                .filter(|w| !w.is_empty())
                .unwrap_or(DEFAULT_STATS_WINDOW);
            outcome(moderator.chat_stats(chat_id, window).await, |s| views::stats(&s))
        }
        Command::CleanDb => outcome(moderator.clean_inactive_chats().await, |removed| {
            views::cleaned(&removed)
        }),
    };
    send_html_resilient(bot, msg.chat.id, reply).await?;
    Ok(())
}

/// Render a result, logging rejected commands.
fn outcome<T>(result: Result<T, ModerationError>, render: impl FnOnce(T) -> String) -> String {
    match result {
        Ok(value) => render(value),
        Err(e) => {
            warn!(error = %e, "Command rejected");
            views::error(&e)
        }
    }
}

/// Run a long operation off the dispatcher and reply when it finishes.
fn spawn_reply<F>(bot: Bot, chat: ChatId, reply: F)
where
    F: Future<Output = String> + Send + 'static,
{
    tokio::spawn(async move {
        let text = reply.await;
        if let Err(e) = send_html_resilient(&bot, chat, text).await {
            error!(chat_id = chat.0, error = %e, "Background reply failed");
        }
    });
}

fn spawn_purge(
    bot: &Bot,
    moderator: &Arc<Moderator>,
    chat: ChatId,
    cutoff: String,
    mode: PurgeMode,
    pretend: bool,
) {
    info!(chat_id = chat.0, cutoff = %cutoff, ?mode, pretend, "Purge requested");
    let moderator = Arc::clone(moderator);
    spawn_reply(bot.clone(), chat, async move {
        outcome(
            moderator.run_purge(chat.0, &cutoff, mode, pretend).await,
            |(cutoff, report)| views::purge_summary(&cutoff, &report),
        )
    });
}

async fn set_obligation(moderator: &Moderator, chat_id: i64, arg: &str) -> String {
    let target = match arg.trim() {
        "off" | "none" | "clear" => None,
        text => match text.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => return "Usage: /obligation &lt;chat id&gt; or /obligation off".to_string(),
        },
    };
    outcome(moderator.set_obligation(chat_id, target).await, |config| {
        views::obligation_set(&config)
    })
}

/// The replied-to user, or the `@handle`/id argument.
async fn target_user(
    moderator: &Moderator,
    msg: &Message,
    arg: &str,
) -> Result<(i64, String), ModerationError> {
    if let Some(user) = msg.reply_to_message().and_then(|m| m.from.as_ref()) {
        return Ok((user_id_of(user), profile_of(user).mention()));
    }
    let user_id = moderator.resolve_user(msg.chat.id.0, arg).await?;
    Ok((user_id, arg.trim().to_string()))
}

async fn change_whitelist(moderator: &Moderator, msg: &Message, arg: &str, add: bool) -> String {
    let chat_id = msg.chat.id.0;
    let (user_id, label) = match target_user(moderator, msg, arg).await {
        Ok(target) => target,
        Err(e) => return views::error(&e),
    };
    let result = if add {
        moderator.add_whitelist(chat_id, user_id).await
    } else {
        moderator.remove_whitelist(chat_id, user_id).await
    };
    outcome(result, |changed| views::whitelist_changed(&label, add, changed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        assert_eq!(
            Command::parse("/inactivekick 3d", "lurkbot").ok(),
            Some(Command::InactiveKick("3d".into()))
        );
        assert_eq!(
            Command::parse("/3strikes", "lurkbot").ok(),
            Some(Command::ThreeStrikes)
        );
        assert_eq!(
            Command::parse("/wl_add @bob", "lurkbot").ok(),
            Some(Command::WlAdd("@bob".into()))
        );
        assert_eq!(
            Command::parse("/lurkinfo 42", "lurkbot").ok(),
            Some(Command::LurkInfo("42".into()))
        );
        assert_eq!(Command::parse("/cleandb", "lurkbot").ok(), Some(Command::CleanDb));
    }

    #[test]
    fn test_scopes() {
        assert_eq!(Command::Help.scope(), Scope::Public);
        assert_eq!(Command::CleanDb.scope(), Scope::Private);
        assert_eq!(Command::Wl.scope(), Scope::Anywhere);
        assert_eq!(Command::InactiveBan("1d".into()).scope(), Scope::Group);
        assert_eq!(Command::Obligation("off".into()).scope(), Scope::Group);
    }
}

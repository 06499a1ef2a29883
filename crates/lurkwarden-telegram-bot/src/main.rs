use dotenvy::dotenv;
use lurkwarden_core::config::ModerationSettings;
use lurkwarden_transport_telegram::config::{BotSettings, TelegramSettings};
use lurkwarden_transport_telegram::runner::run_bot;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Secrets masked in every log line, with their replacement.
const REDACTIONS: &[(&str, &str)] = &[
    (
        r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)",
        "$1[TELEGRAM_TOKEN]$3",
    ),
    (r"([0-9]{8,10}:[A-Za-z0-9_-]{35})", "[TELEGRAM_TOKEN]"),
    (r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+", "$1[TELEGRAM_TOKEN]"),
    (r"R2_ACCESS_KEY_ID=[^\s&]+", "R2_ACCESS_KEY_ID=[MASKED]"),
    (r"R2_SECRET_ACCESS_KEY=[^\s&]+", "R2_SECRET_ACCESS_KEY=[MASKED]"),
    (r"'aws_access_key_id': '[^']*'", "'aws_access_key_id': '[MASKED]'"),
    (
        r"'aws_secret_access_key': '[^']*'",
        "'aws_secret_access_key': '[MASKED]'",
    ),
];

/// Compiled redaction rules.
struct Redactor {
    rules: Vec<(Regex, &'static str)>,
}

impl Redactor {
    /// Compile every rule.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is invalid.
    fn new() -> Result<Self, regex::Error> {
        let rules = REDACTIONS
            .iter()
            .map(|(pattern, replacement)| Regex::new(pattern).map(|re| (re, *replacement)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    fn redact(&self, input: &str) -> String {
        self.rules
            .iter()
            .fold(input.to_string(), |text, (pattern, replacement)| {
                pattern.replace_all(&text, *replacement).into_owned()
            })
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    redactor: Arc<Redactor>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let redacted = self.redactor.redact(&String::from_utf8_lossy(buf));
        self.inner.write_all(redacted.as_bytes())?;
        // The caller's whole buffer was consumed even if the output length differs
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    redactor: Arc<Redactor>,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
            redactor: Arc::clone(&self.redactor),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Compiled before logging starts so nothing is written unmasked
    let redactor = Arc::new(Redactor::new().map_err(|e| {
        eprintln!("Failed to compile redaction patterns: {e}");
        e
    })?);
    init_logging(redactor);

    info!("Starting Lurkwarden Telegram bot...");

    let settings = init_settings();
    run_bot(settings).await;

    Ok(())
}

fn init_logging(redactor: Arc<Redactor>) {
    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
        redactor,
    };

    let debug_mode = std::env::var("DEBUG_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(
                "lurkwarden_core=info,lurkwarden_transport_telegram=info,lurkwarden_telegram_bot=info,teloxide=warn,hyper=warn,h2=error,reqwest=warn,aws_config=warn,aws_smithy_runtime=warn,tokio=warn",
            )
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<BotSettings> {
    let moderation = match ModerationSettings::new() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load moderation configuration: {}", e);
            std::process::exit(1);
        }
    };
    let telegram = match TelegramSettings::new() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load telegram configuration: {}", e);
            std::process::exit(1);
        }
    };
    if telegram.authorized_admins().is_empty() {
        info!("No authorized admins configured: every chat admin may moderate.");
    }

    info!(store = ?moderation.store_backend, "Configuration loaded successfully.");
    Arc::new(BotSettings::new(moderation, telegram))
}

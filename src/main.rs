use dotenvy::dotenv;
use ichancy_agent_rs::api::transport::{HttpTransport, Transport};
use ichancy_agent_rs::api::{IchancyClient, ResponseClassifier};
use ichancy_agent_rs::bot;
use ichancy_agent_rs::bot::handlers::Command;
use ichancy_agent_rs::bot::state::State;
use ichancy_agent_rs::config::Settings;
use ichancy_agent_rs::session::store::{RedisSessionStore, SessionStore};
use ichancy_agent_rs::session::{AgentCredentials, SessionManager, SessionPolicy};
use ichancy_agent_rs::storage::{PlayerStorage, RedisPlayerStore};
use redis::aio::ConnectionManager;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    secret1: Regex,
    secret2: Regex,
    secret3: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            secret1: Regex::new(r"AGENT_PASSWORD=[^\s&]+")?,
            secret2: Regex::new(r"REDIS_PASSWORD=[^\s&]+")?,
            secret3: Regex::new(r#""password"\s*:\s*"[^"]*""#)?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token1
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token2
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token3
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .secret1
            .replace_all(&output, "AGENT_PASSWORD=[MASKED]")
            .to_string();
        output = self
            .secret2
            .replace_all(&output, "REDIS_PASSWORD=[MASKED]")
            .to_string();
        output = self
            .secret3
            .replace_all(&output, r#""password": "[MASKED]""#)
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // We return the original buffer length to satisfy the contract,
        // even if the redacted string length differs.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);

    // Setup logging with redaction
    init_logging(patterns);

    info!("Starting Ichancy provisioning bot...");

    // Load settings
    let settings = init_settings();

    // Initialize Redis-backed stores
    let redis_conn = init_redis(&settings).await;
    let session_store: Arc<dyn SessionStore> =
        Arc::new(RedisSessionStore::new(redis_conn.clone()));
    let player_store: Arc<dyn PlayerStorage> = Arc::new(RedisPlayerStore::new(redis_conn));

    // Initialize the panel client
    let transport = init_transport(&settings);
    let session = init_session(transport.clone(), session_store, &settings).await;
    let client = Arc::new(IchancyClient::new(
        transport,
        session,
        ResponseClassifier::new(settings.challenge_markers()),
        settings.parent_id.clone(),
    ));
    info!("Panel client initialized.");

    // Initialize Bot
    let bot = Bot::new(settings.telegram_token.clone());

    // Initialize bot state
    let bot_state = init_bot_state();

    // Setup handlers
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![client, player_store, bot_state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_redis(settings: &Settings) -> ConnectionManager {
    let client = match redis::Client::open(settings.redis_url()) {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid Redis URL: {}", e);
            std::process::exit(1);
        }
    };
    let mut conn = match ConnectionManager::new(client).await {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };
    let ping: Result<String, redis::RedisError> = redis::cmd("PING").query_async(&mut conn).await;
    match ping {
        Ok(_) => info!("Redis connection established."),
        Err(e) => {
            error!("Redis ping failed: {}", e);
            std::process::exit(1);
        }
    }
    conn
}

fn init_transport(settings: &Settings) -> Arc<dyn Transport> {
    match HttpTransport::new(&settings.origin()) {
        Ok(t) => {
            info!("HTTP transport ready for {}.", settings.origin());
            Arc::new(t)
        }
        Err(e) => {
            error!("Failed to build the HTTP transport: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_session(
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    settings: &Settings,
) -> Arc<SessionManager> {
    let credentials = AgentCredentials {
        username: settings.agent_username.clone(),
        password: settings.agent_password.clone(),
    };
    let manager = Arc::new(SessionManager::new(
        transport,
        store,
        credentials,
        SessionPolicy::from_env(),
        settings.challenge_markers(),
    ));
    if manager.restore().await {
        info!("Panel session restored from Redis.");
    } else {
        info!("No reusable panel session; will sign in on first use.");
    }
    manager
}

fn init_bot_state() -> Arc<InMemStorage<State>> {
    InMemStorage::<State>::new()
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .enter_dialogue::<Message, InMemStorage<State>, State>()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(dptree::case![State::AwaitingUsername].endpoint(handle_username_step))
        .branch(dptree::case![State::AwaitingPassword { username }].endpoint(handle_password_step))
        .branch(
            dptree::case![State::Idle].branch(
                dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_idle_text),
            ),
        )
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    dialogue: Dialogue<State, InMemStorage<State>>,
    client: Arc<IchancyClient>,
    store: Arc<dyn PlayerStorage>,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start | Command::Create => bot::handlers::start(bot, msg, dialogue).await,
        Command::Balance => bot::handlers::balance(bot, msg, client, store).await,
        Command::Cancel => bot::handlers::cancel(bot, msg, dialogue).await,
        Command::Help => bot::handlers::help(bot, msg).await,
    };
    if let Err(e) = res {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_username_step(
    bot: Bot,
    msg: Message,
    dialogue: Dialogue<State, InMemStorage<State>>,
    client: Arc<IchancyClient>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::receive_username(bot, msg, dialogue, client).await {
        error!("Username step error: {}", e);
    }
    respond(())
}

async fn handle_password_step(
    bot: Bot,
    msg: Message,
    dialogue: Dialogue<State, InMemStorage<State>>,
    username: String,
    client: Arc<IchancyClient>,
    store: Arc<dyn PlayerStorage>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) =
        bot::handlers::receive_password(bot, msg, dialogue, username, client, store).await
    {
        error!("Password step error: {}", e);
    }
    respond(())
}

async fn handle_idle_text(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::idle_hint(bot, msg).await {
        error!("Idle hint error: {}", e);
    }
    respond(())
}

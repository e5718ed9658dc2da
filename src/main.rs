//! ontime-server - reminder server for OnTime
//!
//! Schedules "start preparing" push reminders, sends the daily schedule
//! broadcasts and keeps each user's punctuality score.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ontime_server::api;
use ontime_server::clock::{Clock, SystemClock};
use ontime_server::config::{self, Config};
use ontime_server::db::Database;
use ontime_server::dispatch::NotificationDispatcher;
use ontime_server::jobs::{self, BroadcastJob};
use ontime_server::lateness::{LatenessRatio, LatenessTracker};
use ontime_server::models::User;
use ontime_server::push;
use ontime_server::reminder::Reminders;
use ontime_server::scheduler::ReminderScheduler;
use ontime_server::service::ScheduleService;

#[derive(Parser)]
#[command(name = "ontime-server")]
#[command(about = "Reminder and punctuality server for OnTime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new gateway token
    Token {
        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register a user
    Add {
        /// Display name used in reminder messages
        #[arg(short, long)]
        name: String,

        /// Default spare minutes added before each schedule
        #[arg(short, long, default_value_t = 0)]
        spare_minutes: u32,

        /// Device push token
        #[arg(long)]
        push_token: Option<String>,

        /// Create the user with notifications turned off
        #[arg(long)]
        notifications_off: bool,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ontime_server=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = load_config(config)?;

            // Override with CLI args
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            run_server(cfg).await
        }

        Commands::Token {
            name,
            list,
            revoke,
            config,
        } => {
            let config_path = match config {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if list {
                return list_tokens(&config_path);
            }

            if let Some(token_name) = revoke {
                return revoke_token(&config_path, &token_name);
            }

            let label = name.unwrap_or_else(|| "gateway".to_string());
            add_token(&config_path, &label)
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Generate a gateway token: ontime-server token --name gateway");
            println!("  2. Set [push] endpoint and api_key to deliver reminders");
            println!(
                "  3. Start the server: ontime-server serve --config {}",
                path.display()
            );

            Ok(())
        }

        Commands::User {
            command:
                UserCommands::Add {
                    name,
                    spare_minutes,
                    push_token,
                    notifications_off,
                    config,
                },
        } => {
            let cfg = load_config(config)?;
            let db = Database::open(&cfg.database.path).context("Failed to open database")?;

            let mut user = User::new(name, spare_minutes);
            user.push_token = push_token;
            db.insert_user(&user, !notifications_off)
                .context("Failed to create user")?;

            println!("Created user '{}'", user.name);
            println!("User id: {}", user.id);
            println!("Pass it to the API in the X-User-Id header.");
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

fn list_tokens(config_path: &std::path::Path) -> Result<()> {
    if !config_path.exists() {
        println!("No config file found at {}", config_path.display());
        println!("Run 'ontime-server init' to create one.");
        return Ok(());
    }

    let cfg = Config::load_from(config_path)?;
    if cfg.tokens.is_empty() {
        println!("No tokens configured.");
        println!("Generate one with: ontime-server token --name <gateway>");
        return Ok(());
    }

    println!("Configured tokens:");
    println!();
    for token in &cfg.tokens {
        let hash_preview: String = token.token_hash.chars().take(20).collect();
        println!("  {} - {}...", token.name, hash_preview);
    }
    Ok(())
}

fn revoke_token(config_path: &std::path::Path, token_name: &str) -> Result<()> {
    if !config_path.exists() {
        println!("No config file found at {}", config_path.display());
        return Ok(());
    }

    let mut cfg = Config::load_from(config_path)?;
    let original_len = cfg.tokens.len();
    cfg.tokens.retain(|t| t.name != token_name);

    if cfg.tokens.len() == original_len {
        println!("Token '{}' not found.", token_name);
    } else {
        cfg.save_to(config_path)?;
        println!("Revoked token '{}'.", token_name);
    }
    Ok(())
}

fn add_token(config_path: &std::path::Path, label: &str) -> Result<()> {
    let token = generate_token();
    let token_hash = config::hash_token(&token)?;

    if config_path.exists() {
        let mut cfg = Config::load_from(config_path)?;

        if cfg.tokens.iter().any(|t| t.name == label) {
            println!(
                "Token '{}' already exists. Use --revoke first to replace it.",
                label
            );
            return Ok(());
        }

        cfg.tokens.push(config::TokenConfig {
            name: label.to_string(),
            token_hash,
        });
        cfg.save_to(config_path)?;

        println!("Generated gateway token for '{}'\n", label);
        println!("Token: {}\n", token);
        println!("Send it from the gateway as: Authorization: Bearer {}", token);
    } else {
        println!("Generated gateway token for '{}':\n", label);
        println!("Token: {}\n", token);
        println!("Add this to your server's config.toml:\n");
        println!("  [[tokens]]");
        println!("  name = \"{}\"", label);
        println!("  token_hash = \"{}\"\n", token_hash);
    }
    println!("Save this token now - it cannot be retrieved later!");

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let db = Arc::new(Database::open(&config.database.path).context("Failed to open database")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let push = push::from_config(&config.push)?;
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::clone(&db),
        push,
        config.reminders.title.clone(),
        config.reminders.prepare_message.clone(),
    ));
    let scheduler = Arc::new(ReminderScheduler::new(Arc::clone(&clock)));
    let reminders = Reminders::new(Arc::clone(&scheduler), Arc::clone(&dispatcher));

    // Timers live only in memory; rebuild them before taking requests.
    jobs::recover_notifications(&db, &reminders, clock.as_ref())
        .context("Failed to recover reminders")?;

    let cancel = CancellationToken::new();
    let evening = BroadcastJob::evening(
        &config.reminders,
        Arc::clone(&db),
        Arc::clone(&dispatcher),
        Arc::clone(&clock),
    )?;
    let morning = BroadcastJob::morning(
        &config.reminders,
        Arc::clone(&db),
        Arc::clone(&dispatcher),
        Arc::clone(&clock),
    )?;
    let evening_task = tokio::spawn(evening.run(cancel.child_token()));
    let morning_task = tokio::spawn(morning.run(cancel.child_token()));

    let tracker = LatenessTracker::new(Arc::clone(&db), Arc::new(LatenessRatio));
    let service = ScheduleService::new(db, reminders, tracker);
    let state = api::AppState::new(service, config.clone());
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("ontime-server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    scheduler.shutdown();
    for task in [evening_task, morning_task] {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Broadcast job ended abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let token_body: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();

    format!("ont_{}", token_body)
}

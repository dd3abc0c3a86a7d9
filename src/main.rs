//! notification-sync command-line front end.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use notification_sync::inbox::{normalize_count, normalize_list};
use notification_sync::{
    ApiClient, BackoffPolicy, Config, HttpEventSource, InboxSnapshot, NotificationApi, Reconciler,
    SessionBoundary, StreamClient,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "notification-sync")]
#[command(version = VERSION)]
#[command(about = "Keep a notification inbox in sync with its backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Credentials {
    /// Account email
    #[arg(long, env = "NOTIFY_SYNC_EMAIL")]
    email: String,
    /// Account password
    #[arg(long, env = "NOTIFY_SYNC_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and follow the inbox live until Ctrl-C
    Watch {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Print one page of notifications
    List {
        #[command(flatten)]
        credentials: Credentials,
        /// Page number, starting at 1
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Page size (defaults to the configured page limit)
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print the unread count
    Count {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Mark a notification as read
    Read {
        #[command(flatten)]
        credentials: Credentials,
        /// Notification id
        id: String,
    },
    /// Mark every notification as read
    ReadAll {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Delete a notification
    Delete {
        #[command(flatten)]
        credentials: Credentials,
        /// Notification id
        id: String,
    },
    /// Ask the backend to push a test notification
    Trigger {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("NOTIFY_SYNC_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load()?;

    if let Commands::Config { save } = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if save {
            config.save().context("Failed to save config")?;
            println!("Saved to {}", Config::config_dir()?.join("config.json").display());
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: Config) -> Result<()> {
    let client = ApiClient::new(&config)?;
    let session = SessionBoundary::new(client.clone());

    match command {
        Commands::Watch { credentials } => watch(&config, session, &credentials).await?,
        Commands::List {
            credentials,
            page,
            limit,
        } => {
            sign_in(&session, &credentials).await?;
            let payload = client
                .fetch_page(page, limit.unwrap_or(config.page_limit))
                .await?;
            let records = normalize_list(&payload);
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Count { credentials } => {
            sign_in(&session, &credentials).await?;
            let payload = client.fetch_unread_count().await?;
            let count = normalize_count(&payload).context("Server sent an unreadable count")?;
            println!("{count}");
        }
        Commands::Read { credentials, id } => {
            sign_in(&session, &credentials).await?;
            client.mark_read(&id).await?;
            println!("Marked {id} as read");
        }
        Commands::ReadAll { credentials } => {
            sign_in(&session, &credentials).await?;
            client.mark_all_read().await?;
            println!("Marked all notifications as read");
        }
        Commands::Delete { credentials, id } => {
            sign_in(&session, &credentials).await?;
            client.delete(&id).await?;
            println!("Deleted {id}");
        }
        Commands::Trigger { credentials } => {
            sign_in(&session, &credentials).await?;
            let response = client.trigger_test_notification().await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

async fn sign_in(session: &SessionBoundary, credentials: &Credentials) -> Result<()> {
    session
        .login(&credentials.email, &credentials.password)
        .await
        .context("Login failed")?;
    Ok(())
}

async fn watch(config: &Config, session: SessionBoundary, credentials: &Credentials) -> Result<()> {
    let client = session.client().clone();
    if config.end_session_on_renewal_exhausted {
        session.watch_renewal_exhaustion();
    }

    let stream = StreamClient::new(
        Arc::new(HttpEventSource::new(&client)),
        BackoffPolicy::from_config(config),
    );
    let reconciler = Reconciler::new(Arc::new(client), stream, config.page_limit);
    let follower = reconciler.follow(session.subscribe());

    let identity = session
        .login(&credentials.email, &credentials.password)
        .await
        .context("Login failed")?;
    println!(
        "Signed in as {}",
        identity.email.as_deref().unwrap_or(&identity.id)
    );

    let mut snapshots = reconciler.subscribe();
    let mut identities = session.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                log::info!("Received Ctrl-C, shutting down");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", summary(&snapshot));
            }
            changed = identities.changed() => {
                if changed.is_err() || identities.borrow_and_update().is_none() {
                    println!("Session ended");
                    break;
                }
            }
        }
    }

    if let Err(e) = session.logout().await {
        log::warn!("Logout failed: {}", e);
    }
    drop(identities);
    drop(session);
    if let Err(e) = follower.await {
        log::warn!("Inbox task ended abnormally: {}", e);
    }
    Ok(())
}

fn summary(snapshot: &InboxSnapshot) -> String {
    let status = if snapshot.is_stream_connected {
        "live"
    } else {
        "offline"
    };
    let mut line = format!(
        "[{}] {} notifications, {} unread",
        status,
        snapshot.notifications.len(),
        snapshot.unread_count
    );
    if snapshot.is_loading {
        line.push_str(" (loading)");
    }
    if let Some(newest) = snapshot.notifications.first() {
        line.push_str(&format!(" | newest: {} [{}]", newest.title, newest.priority));
    }
    line
}

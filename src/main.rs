use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use level_notify::backend::StaticAuth;
use level_notify::chime;
use level_notify::config::{self, Config};
use level_notify::db::{self, NewNotification, SqliteBackend};
use level_notify::model::{Level, NotificationView, Role, TargetLevel};
use level_notify::reconciler::{MarkOutcome, Reconciler};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print an example config file
    ExampleConfig,
    /// Create a profile and print its id
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: Role,
        /// Required for students (100, 200 or 300)
        #[arg(long)]
        level: Option<Level>,
    },
    /// Broadcast a notification as a teacher
    Publish {
        #[arg(long = "as")]
        author: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        message: String,
        /// 100, 200, 300 or all
        #[arg(long, default_value = "all")]
        level: TargetLevel,
        #[arg(long)]
        content_id: Option<String>,
    },
    /// Show a user's notifications
    List {
        #[arg(long = "as")]
        user: String,
        #[arg(long)]
        json: bool,
    },
    /// Mark one notification read
    Read {
        #[arg(long = "as")]
        user: String,
        notification_id: String,
    },
    /// Follow new notifications until Ctrl-C
    Watch {
        #[arg(long = "as")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if matches!(args.command, Command::ExampleConfig) {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let backend = open_backend(&cfg).await?;

    match args.command {
        Command::ExampleConfig => {}
        Command::Register { name, role, level } => {
            let profile = db::create_profile(backend.pool(), &name, role, level).await?;
            info!(id = %profile.id, role = profile.role.as_str(), "profile created");
            println!("{}", profile.id);
        }
        Command::Publish {
            author,
            title,
            message,
            level,
            content_id,
        } => {
            let new = NewNotification {
                title,
                message,
                target_level: level,
                content_id,
            };
            let notification = db::publish_notification(backend.pool(), &author, &new).await?;
            println!(
                "notification {} sent to {}",
                notification.id,
                match notification.target_level {
                    TargetLevel::All => "all levels".to_string(),
                    TargetLevel::Level(level) => format!("level {level}"),
                }
            );
        }
        Command::List { user, json } => {
            let reconciler = reconciler_for(&cfg, backend, &user).await?;
            reconciler.fetch().await?;
            let feed = reconciler.snapshot().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&feed)?);
            } else {
                println!("{} unread", feed.unread_count);
                for view in &feed.notifications {
                    println!("{}", render(view));
                }
            }
            reconciler.teardown().await;
        }
        Command::Read {
            user,
            notification_id,
        } => {
            let reconciler = reconciler_for(&cfg, backend, &user).await?;
            reconciler.fetch().await?;
            let feed = reconciler.snapshot().await;
            let view = feed
                .notifications
                .iter()
                .find(|v| v.id() == notification_id)
                .ok_or_else(|| anyhow!("no notification {notification_id} for this user"))?;
            match reconciler.mark_as_read(view).await? {
                MarkOutcome::Marked { .. } => println!("marked read"),
                MarkOutcome::AlreadyRead => println!("already read"),
                other => warn!(?other, "notification not marked"),
            }
            println!("{} unread", reconciler.unread_count().await);
            reconciler.teardown().await;
        }
        Command::Watch { user } => {
            let reconciler = reconciler_for(&cfg, backend, &user).await?;
            watch(&reconciler).await?;
        }
    }

    Ok(())
}

async fn open_backend(cfg: &Config) -> Result<Arc<SqliteBackend>> {
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    Ok(Arc::new(SqliteBackend::new(
        pool,
        Duration::from_millis(cfg.app.poll_interval_ms),
    )))
}

async fn reconciler_for(
    cfg: &Config,
    backend: Arc<SqliteBackend>,
    user_id: &str,
) -> Result<Reconciler> {
    let profile = db::get_profile(backend.pool(), user_id)
        .await?
        .ok_or_else(|| anyhow!("unknown profile {user_id}"))?;
    let auth = StaticAuth::signed_in(profile.as_current_user());
    Ok(Reconciler::new(
        backend,
        Arc::new(auth),
        chime::from_flag(cfg.notifications.chime),
    )
    .with_fetch_limit(cfg.notifications.fetch_limit))
}

async fn watch(reconciler: &Reconciler) -> Result<()> {
    let mut changes = reconciler.changes().await;
    reconciler.start().await?;

    let mut shown = HashSet::new();
    print_new(reconciler, &mut shown).await;
    info!("watching for notifications; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_new(reconciler, &mut shown).await;
            }
        }
    }

    reconciler.teardown().await;
    Ok(())
}

async fn print_new(reconciler: &Reconciler, shown: &mut HashSet<String>) {
    let feed = reconciler.snapshot().await;
    let mut fresh: Vec<_> = feed
        .notifications
        .iter()
        .filter(|v| shown.insert(v.id().to_string()))
        .collect();
    if fresh.is_empty() {
        return;
    }
    fresh.reverse();
    for view in fresh {
        println!("{}", render(view));
    }
    println!("({} unread)", feed.unread_count);
}

fn render(view: &NotificationView) -> String {
    let n = &view.notification;
    format!(
        "[{}] {} {:>3} {} | {}: {}",
        if view.is_read { "x" } else { " " },
        n.created_at.format("%Y-%m-%d %H:%M"),
        n.target_level,
        n.id,
        n.title,
        n.message
    )
}

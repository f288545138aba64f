use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use feedsync::api::ApiClient;
use feedsync::config::Config;
use feedsync::model::{Author, PostKind};
use feedsync::network::NetworkMonitor;
use feedsync::realtime::RealtimeBridge;
use feedsync::storage::{CacheStore, StorageError, StoreLimits};
use feedsync::sync::{FeedSyncController, FeedView, MutationOutcome, SyncNotice};

type Controller = FeedSyncController<ApiClient>;

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(dir, perms) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Offline-first social feed client")]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend base URL, overriding `api_base_url`
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Cache database (default: ~/.config/feedsync/cache.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Delete the cache database before starting
    #[arg(long)]
    reset_cache: bool,

    /// Start as if the device had no connectivity
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the feed (cached first, then refreshed)
    Show {
        /// Pages to load
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Keep the feed live from the push stream until Ctrl-C
    Follow,
    /// Toggle the like on a post
    Like { post_id: String },
    /// Comment on a post
    Comment { post_id: String, text: String },
    /// Publish a post
    Post {
        text: String,
        #[arg(long, default_value = "general")]
        kind: PostKind,
    },
    /// Replay queued offline actions
    Drain,
    /// Print cache statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    ensure_private_dir(&config_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?
        .with_env_overrides();

    let db_path = args.db.clone().unwrap_or_else(|| config_dir.join("cache.db"));
    let store = open_store(&db_path, config.store_limits()).await?;
    if args.reset_cache {
        store.clear().await.context("Failed to reset cache")?;
        println!("Cache reset.");
    }

    let command = args.command.unwrap_or(Command::Show { pages: 1 });
    if let Command::Stats = command {
        return print_stats(&store).await;
    }

    let api_url = args
        .api_url
        .or_else(|| config.api_base_url.clone())
        .context("No API URL configured: pass --api-url or set api_base_url in config.toml")?;
    let client = ApiClient::new(&api_url, config.api_token.clone(), config.client_options())
        .context("Invalid API URL")?;
    let api = Arc::new(client.clone());

    let monitor = NetworkMonitor::new(!args.offline);
    let probe_config = config.probe_config();
    let quality = monitor.probe_once(api.as_ref(), &probe_config).await;
    tracing::info!(quality = %quality, "Network graded");

    let viewer = Author {
        id: "me".to_string(),
        name: "You".to_string(),
        avatar_url: None,
    };
    let controller = Arc::new(FeedSyncController::new(
        store,
        api.clone(),
        monitor.clone(),
        config.sync_config(viewer),
    ));
    let mut notices = controller.subscribe_notices();

    match command {
        Command::Show { pages } => {
            load(&controller).await;
            for _ in 1..pages {
                match controller.load_more().await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        eprintln!("Could not load more: {e}");
                        break;
                    }
                }
            }
            print_view(&controller.view());
        }
        Command::Follow => {
            load(&controller).await;
            print_view(&controller.view());

            let bridge = RealtimeBridge::new(client, config.stream_config());
            bridge.connect();
            let events = controller.attach_realtime(&bridge);
            let probing = monitor.spawn_probing(api.clone(), probe_config);
            let cancel = CancellationToken::new();
            let drainer = controller.spawn_auto_drain(cancel.clone());

            let mut views = controller.subscribe();
            println!("Following the feed, Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = views.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let view = views.borrow_and_update().clone();
                        print_status_line(&view);
                    }
                    notice = notices.recv() => {
                        if let Ok(notice) = notice {
                            print_notice(&notice);
                        }
                    }
                }
            }

            cancel.cancel();
            bridge.disconnect();
            events.abort();
            probing.shutdown().await;
            drainer.await.ok();
        }
        Command::Like { post_id } => {
            load(&controller).await;
            let outcome = controller.apply_optimistic_like(&post_id).await;
            report_mutation(&controller, outcome.map_err(Into::into));
            if let Some(item) = controller.view().get(&post_id) {
                println!(
                    "{} is now {} ({} likes)",
                    post_id,
                    if item.liked_by_viewer { "liked" } else { "not liked" },
                    item.like_count
                );
            }
        }
        Command::Comment { post_id, text } => {
            load(&controller).await;
            let outcome = controller.apply_optimistic_comment(&post_id, &text).await;
            report_mutation(&controller, outcome.map_err(Into::into));
        }
        Command::Post { text, kind } => {
            load(&controller).await;
            let outcome = controller
                .apply_optimistic_post_create(&text, kind, Vec::new())
                .await;
            report_mutation(&controller, outcome.map_err(Into::into));
        }
        Command::Drain => {
            load(&controller).await;
            let report = controller.drain_offline_queue().await?;
            println!("Settled {} action(s)", report.settled.len());
            if report.halted_offline {
                println!("Stopped early: offline");
            }
            while let Ok(notice) = notices.try_recv() {
                print_notice(&notice);
            }
            println!("{} action(s) still pending", controller.view().pending_actions);
        }
        Command::Stats => print_stats(controller.store()).await?,
    }

    Ok(())
}

/// Open the on-disk cache, falling back to an in-memory store when the file
/// is unusable. A locked cache is the only hard failure.
async fn open_store(db_path: &Path, limits: StoreLimits) -> Result<CacheStore> {
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    match CacheStore::open(db_path_str, limits).await {
        Ok(store) => Ok(store),
        Err(StorageError::InstanceLocked) => {
            eprintln!("Error: {}", StorageError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::warn!(path = %db_path.display(), error = %e, "Cache unavailable, running without persistence");
            eprintln!("Warning: cache unavailable ({e}); nothing will persist this session");
            CacheStore::open_in_memory(limits)
                .await
                .context("Failed to open in-memory cache")
        }
    }
}

/// Initial load, waiting for the background refresh so commands act on the
/// freshest view available.
async fn load(controller: &Arc<Controller>) {
    let initial = controller.initial_load().await;
    if let Some(refresh) = initial.refresh {
        match refresh.await {
            Ok(Ok(count)) => tracing::debug!(count, "Refreshed page 1"),
            Ok(Err(e)) => eprintln!("Refresh failed, showing cached feed: {e}"),
            Err(e) => tracing::warn!(error = %e, "Refresh task failed"),
        }
    }
}

fn report_mutation(controller: &Controller, outcome: anyhow::Result<MutationOutcome>) {
    match outcome {
        Ok(MutationOutcome::Confirmed) => println!("Done."),
        Ok(MutationOutcome::Queued { action_id }) => {
            println!("Saved offline, will sync when connected (action {action_id})")
        }
        Ok(MutationOutcome::WillPublishWhenOnline { action_id }) => {
            println!("Will publish when online (action {action_id})")
        }
        Err(e) => eprintln!("Failed: {e:#}"),
    }
    if let Some(banner) = controller.view().offline_banner() {
        println!("{banner}");
    }
}

async fn print_stats(store: &CacheStore) -> Result<()> {
    let stats = store.stats().await.context("Failed to read cache stats")?;
    println!("Items:           {}", stats.item_count);
    println!("Staged items:    {}", stats.staged_count);
    println!("Media blobs:     {}", stats.media_count);
    println!("Media bytes:     {}", stats.media_bytes);
    println!("Pending actions: {}", stats.pending_action_count);
    if let Some(at) = store.last_synced_at().await? {
        println!("Last synced:     {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

fn print_view(view: &FeedView) {
    if let Some(banner) = view.offline_banner() {
        println!("[{banner}]");
    }
    if view.degraded {
        println!("[cache unavailable, showing live data only]");
    }
    if view.is_empty() {
        println!("No posts yet.");
        return;
    }

    for item in &view.items {
        let heart = if item.liked_by_viewer { "liked" } else { "likes" };
        let first_line = item.body.lines().next().unwrap_or_default();
        println!(
            "{}  {:<16} {:>4} {}  {:>3} comments  [{}]",
            item.created_at.format("%Y-%m-%d %H:%M"),
            truncate(&item.author.name, 16),
            item.like_count,
            heart,
            item.comment_count,
            item.kind.as_str(),
        );
        println!("    {}  ({})", truncate(first_line, 72), item.id);
    }

    let mut footer = format!("{} posts", view.len());
    if !view.has_more {
        footer.push_str(", end of feed");
    }
    if let Some(at) = view.last_synced_at {
        footer.push_str(&format!(", synced {}", at.format("%H:%M:%S")));
    }
    println!("{footer}");
}

fn print_status_line(view: &FeedView) {
    let newest = view
        .items
        .first()
        .map(|i| truncate(i.body.lines().next().unwrap_or_default(), 40))
        .unwrap_or_default();
    println!(
        "[{}] {} posts, {} pending{}  newest: {}",
        view.quality,
        view.len(),
        view.pending_actions,
        if view.is_refreshing { ", refreshing" } else { "" },
        newest
    );
}

fn print_notice(notice: &SyncNotice) {
    match notice {
        SyncNotice::MutationFailed {
            kind,
            target_id,
            reason,
            ..
        } => eprintln!(
            "! {} on {} was undone: {}",
            kind.as_str(),
            target_id.as_deref().unwrap_or("new post"),
            reason
        ),
        SyncNotice::Degraded { reason } => eprintln!("! cache unavailable: {reason}"),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

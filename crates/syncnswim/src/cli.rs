//! Command-line surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use syncnswim_core::{
    AppConfig, BatchSyncManager, ConfigManager, DEFAULT_POLL_INTERVAL, DeviceError,
    DeviceLocator, DeviceMonitor, DeviceTarget, EpisodeSource, FeedEpisodeSource, FileSystem,
    MonitorEvent, REMOVABLE_MEDIA_PARENTS, RealFileSystem, SyncMode, WritableStore,
};
use tracing::{debug, info};

/// Sync podcasts or a rotating music sample onto a removable device
#[derive(Parser, Debug)]
#[command(name = "syncnswim")]
#[command(version)]
pub struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Show debug output on the console
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Watch for the device and sync every time it is mounted
    Run,
    /// Sync once if the device is mounted
    Sync {
        /// Wait for the device, optionally for SECS instead of the configured timeout
        #[arg(long, value_name = "SECS")]
        wait: Option<Option<u64>>,
    },
    /// Show where the device is mounted
    Detect,
    /// Manage followed podcasts
    Podcasts {
        #[command(subcommand)]
        action: PodcastCommand,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum PodcastCommand {
    /// List podcasts
    List,
    /// Follow a podcast
    Add {
        /// Display name
        name: String,
        /// RSS feed URL
        rss_url: String,
    },
    /// Stop following a podcast
    Remove {
        /// RSS feed URL
        rss_url: String,
    },
    /// Include a podcast in syncs
    Enable {
        /// RSS feed URL
        rss_url: String,
    },
    /// Exclude a podcast from syncs
    Disable {
        /// RSS feed URL
        rss_url: String,
    },
    /// Fetch a feed and show its latest episode
    Test {
        /// RSS feed URL
        rss_url: String,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Print the configuration as JSON
    Show,
    /// Print the config file location
    Path,
    /// Choose what a sync pass copies
    Mode {
        /// `podcasts` or `music`
        mode: SyncMode,
    },
}

/// Errors surfaced by commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Failure reported by the core library.
    #[error(transparent)]
    Core(#[from] syncnswim_core::Error),

    /// The async runtime or signal handling failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// A sync pass did not complete cleanly.
    #[error("{0}")]
    SyncFailed(String),
}

/// Run the parsed command.
pub fn execute(cli: Cli) -> Result<(), CliError> {
    let mut manager = match &cli.config {
        Some(path) => ConfigManager::open(path)?,
        None => ConfigManager::open_default()?,
    };
    debug!("Using config {}", manager.path().display());

    match cli.command {
        Command::Run => run_daemon(manager.config()),
        Command::Sync { wait } => sync_once(manager.config(), wait),
        Command::Detect => detect(manager.config()),
        Command::Podcasts { action } => podcasts(&mut manager, action),
        Command::Config { action } => configure(&mut manager, action),
    }
}

fn locator_for(config: &AppConfig) -> DeviceLocator {
    DeviceLocator::system(DeviceTarget::new(config.device_name.as_str()))
}

fn sync_manager(config: &AppConfig, fs: &Arc<dyn FileSystem>) -> Result<BatchSyncManager, CliError> {
    let episodes = Arc::new(FeedEpisodeSource::new(&config.download_directory)?);
    Ok(BatchSyncManager::from_config(config, Arc::clone(fs), episodes))
}

fn run_daemon(config: &AppConfig) -> Result<(), CliError> {
    config.validate()?;
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new());
    let manager = Arc::new(sync_manager(config, &fs)?);
    let locator = Arc::new(locator_for(config));
    let monitor = DeviceMonitor::new(
        locator,
        manager,
        fs,
        config.device_music_directory.as_str(),
    );

    let runtime = crate::build_runtime()?;
    info!("SyncNSwim started in {} mode", config.sync_mode);

    runtime.block_on(async move {
        let (mut events, _handle) = monitor.start();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });
        tokio::signal::ctrl_c().await
    })?;

    // An in-flight pass is abandoned rather than awaited.
    info!("Interrupted, shutting down");
    runtime.shutdown_background();
    Ok(())
}

fn log_event(event: &MonitorEvent) {
    match serde_json::to_string(event) {
        Ok(json) => debug!("Monitor event: {}", json),
        Err(e) => debug!("Monitor event {:?} ({})", event, e),
    }
}

fn sync_once(config: &AppConfig, wait: Option<Option<u64>>) -> Result<(), CliError> {
    config.validate()?;
    let locator = locator_for(config);

    let resolved = match wait {
        None => locator.resolve(),
        Some(secs) => {
            let timeout = secs.map_or_else(|| config.storage_wait_timeout(), Duration::from_secs);
            locator.wait_for(timeout, DEFAULT_POLL_INTERVAL)
        }
    };
    let Some(resolved) = resolved else {
        return Err(syncnswim_core::Error::from(DeviceError::NotFound {
            name: config.device_name.clone(),
        })
        .into());
    };
    println!("Device found at {}", resolved.mount_path.display());

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new());
    let manager = sync_manager(config, &fs)?;
    let store = WritableStore::for_mount(
        &resolved,
        &config.device_music_directory,
        fs,
        locator.inspector(),
    );

    let report = manager.sync(&store);
    for name in &report.placed {
        println!("  {name}");
    }
    if report.success() {
        println!("{}", report.summary());
        Ok(())
    } else {
        Err(CliError::SyncFailed(report.summary()))
    }
}

fn detect(config: &AppConfig) -> Result<(), CliError> {
    let locator = locator_for(config);

    match locator.resolve() {
        Some(found) => {
            println!("'{}' mounted at {}", locator.target(), found.mount_path.display());
            if let Some(record) = &found.mount_record {
                println!(
                    "  {} ({}) options: {}",
                    record.device_path, record.filesystem_type, record.options
                );
                if record.read_only() {
                    println!("  Mounted read-only: remount read-write before syncing");
                }
            }
            let store = WritableStore::for_mount(
                &found,
                &config.device_music_directory,
                Arc::new(RealFileSystem::new()),
                locator.inspector(),
            );
            if let Some(free) = store.free_space_bytes() {
                println!("  Free space: {:.1} MB", free as f64 / (1024.0 * 1024.0));
            }
        }
        None => println!("'{}' is not mounted", locator.target()),
    }

    let table = locator.inspector().current_mounts();
    let removable: Vec<_> = table
        .iter()
        .filter(|record| {
            REMOVABLE_MEDIA_PARENTS
                .iter()
                .any(|parent| record.mount_path.starts_with(parent))
        })
        .collect();
    if !removable.is_empty() {
        println!("Removable media:");
        for record in removable {
            println!(
                "  {} on {} type {} ({})",
                record.device_path,
                record.mount_path.display(),
                record.filesystem_type,
                record.options
            );
        }
    }
    Ok(())
}

fn podcasts(manager: &mut ConfigManager, action: PodcastCommand) -> Result<(), CliError> {
    match action {
        PodcastCommand::List => {
            if manager.podcasts().is_empty() {
                println!("No podcasts configured");
            }
            for podcast in manager.podcasts() {
                let mark = if podcast.enabled { "x" } else { " " };
                println!("[{mark}] {} - {}", podcast.name, podcast.rss_url);
            }
        }
        PodcastCommand::Add { name, rss_url } => {
            manager.add_podcast(&name, &rss_url)?;
            println!("Added {name}");
        }
        PodcastCommand::Remove { rss_url } => {
            let removed = manager.remove_podcast(&rss_url)?;
            println!("Removed {}", removed.name);
        }
        PodcastCommand::Enable { rss_url } => {
            let podcast = manager.set_podcast_enabled(&rss_url, true)?;
            println!("Enabled {}", podcast.name);
        }
        PodcastCommand::Disable { rss_url } => {
            let podcast = manager.set_podcast_enabled(&rss_url, false)?;
            println!("Disabled {}", podcast.name);
        }
        PodcastCommand::Test { rss_url } => {
            let source = FeedEpisodeSource::new(&manager.config().download_directory)?;
            match source.latest_episode(&rss_url)? {
                Some(episode) => {
                    println!("Latest: {}", episode.title);
                    println!("  Published: {}", episode.published);
                    println!("  Audio: {}", episode.media_url);
                    println!("  Saved as: {}", episode.file_name());
                }
                None => println!("Feed has no downloadable episode"),
            }
        }
    }
    Ok(())
}

fn configure(manager: &mut ConfigManager, action: ConfigCommand) -> Result<(), CliError> {
    match action {
        ConfigCommand::Show => {
            let json = serde_json::to_string_pretty(manager.config())
                .map_err(syncnswim_core::Error::from)?;
            println!("{json}");
        }
        ConfigCommand::Path => println!("{}", manager.path().display()),
        ConfigCommand::Mode { mode } => {
            manager.set_sync_mode(mode)?;
            println!("Sync mode set to {mode}");
        }
    }
    Ok(())
}

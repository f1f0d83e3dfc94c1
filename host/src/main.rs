use clap::{Parser, Subcommand};
use host::config::{
    HostConfig, Layout, StorageTarget, DEFAULT_MONITOR_INTERVAL, DEFAULT_MONITOR_MAX_DELAY,
    DEFAULT_TRANSFERS,
};
use host::coordinator::Coordinator;
use host::local_remote::LocalRemote;
use host::lock_monitor::{LockEvent, LockMonitor};
use host::lock_store::LockCheck;
use host::rclone::RcloneRemote;
use host::remote::Remote;
use host::HostError;
use log::{info, warn};
use shared::{format_bytes, format_duration, ServerId, TransferProgress, DEFAULT_PREFIX};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Take turns hosting a shared game world", long_about = None)]
struct Args {
    /// Directory holding the local world copies
    #[arg(long, env = "PTH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Key prefix for worlds inside the bucket
    #[arg(long, env = "PTH_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Use a directory as storage instead of an S3 bucket
    #[arg(long, env = "PTH_LOCAL_REMOTE")]
    local_remote: Option<PathBuf>,

    /// S3 provider name as understood by rclone
    #[arg(long, env = "PTH_PROVIDER", default_value = "Other")]
    provider: String,

    #[arg(long, env = "PTH_ENDPOINT", default_value = "")]
    endpoint: String,

    #[arg(long, env = "PTH_REGION", default_value = "")]
    region: String,

    #[arg(long, env = "PTH_BUCKET")]
    bucket: Option<String>,

    #[arg(long, env = "PTH_ACCESS_KEY")]
    access_key: Option<String>,

    #[arg(long, env = "PTH_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Path to the rclone executable
    #[arg(long, env = "PTH_RCLONE", default_value = "rclone")]
    rclone: PathBuf,

    /// Parallel file transfers during pull and push
    #[arg(long, default_value_t = DEFAULT_TRANSFERS)]
    transfers: u32,

    /// How often rclone reports progress, in milliseconds
    #[arg(long, default_value = "500")]
    stats_interval_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show who is hosting a world
    Status { server: ServerId },
    /// List worlds in storage
    List,
    /// Storage used by one world, or by all of them
    Size { server: Option<ServerId> },
    /// Replace the local copy with the stored one
    Pull { server: ServerId },
    /// Replace the stored copy with the local one
    Push { server: ServerId },
    /// Delete a world from storage
    Delete { server: ServerId },
    /// Verify credentials and bucket
    CheckAccess,
    /// Playtime statistics of a local world
    Stats { server: ServerId },
    /// Lock a world for hosting, pulling it first if needed
    Acquire {
        server: ServerId,
        #[arg(short, long, env = "PTH_USERNAME")]
        username: String,
    },
    /// Publish a hosted world and unlock it
    Release {
        server: ServerId,
        #[arg(short, long, env = "PTH_USERNAME")]
        username: String,
    },
    /// Remove a lock left behind by a crashed host
    Unlock { server: ServerId },
    /// Report lock changes until Ctrl+C
    Watch {
        server: ServerId,
        /// Seconds between checks
        #[arg(long, default_value_t = DEFAULT_MONITOR_INTERVAL.as_secs())]
        interval: u64,
        /// Upper bound in seconds for the delay after failed checks
        #[arg(long, default_value_t = DEFAULT_MONITOR_MAX_DELAY.as_secs())]
        max_delay: u64,
    },
    /// Acquire, wait for Ctrl+C while the game server runs, then release
    Host {
        server: ServerId,
        #[arg(short, long, env = "PTH_USERNAME")]
        username: String,
    },
}

impl Args {
    fn config(&self) -> HostConfig {
        let defaults = HostConfig::default();
        let root = self
            .data_dir
            .clone()
            .unwrap_or_else(|| defaults.layout.local_root().to_path_buf());

        let (monitor_interval, monitor_max_delay) = match &self.command {
            Command::Watch {
                interval, max_delay, ..
            } => (Duration::from_secs(*interval), Duration::from_secs(*max_delay)),
            _ => (defaults.monitor_interval, defaults.monitor_max_delay),
        };

        HostConfig {
            layout: Layout::new(root, self.prefix.as_str()),
            sync_tool: self.rclone.clone(),
            transfers: self.transfers,
            stats_interval: Duration::from_millis(self.stats_interval_ms),
            monitor_interval,
            monitor_max_delay,
        }
    }

    fn remote(&self, config: &HostConfig) -> Result<Arc<dyn Remote>, HostError> {
        if let Some(dir) = &self.local_remote {
            info!("Using {} as storage", dir.display());
            return Ok(Arc::new(LocalRemote::new(dir)));
        }

        let required = |value: &Option<String>, flag: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| HostError::InvalidInput(format!("{} is required unless --local-remote is given", flag)))
        };

        let target = StorageTarget {
            provider: self.provider.clone(),
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            bucket: required(&self.bucket, "--bucket")?,
            access_key: required(&self.access_key, "--access-key")?,
            secret_key: required(&self.secret_key, "--secret-key")?,
        };

        Ok(Arc::new(
            RcloneRemote::new(&config.sync_tool, target)
                .with_transfers(config.transfers)
                .with_stats_interval(config.stats_interval),
        ))
    }
}

fn print_progress(progress: TransferProgress) {
    eprintln!(
        "{:>3}%  {} / {}",
        progress.percent, progress.transferred, progress.total
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    // Parse command line arguments
    let args = Args::parse();
    let config = args.config();

    // Select the storage backend
    let remote = args.remote(&config)?;
    let coordinator = Coordinator::new(config.layout.clone(), remote);

    info!("Local worlds in {}", config.layout.local_root().display());

    // Run the requested command
    match args.command {
        Command::Status { server } => match coordinator.status(&server).await {
            LockCheck::Found(lock) => println!(
                "{} is hosted by {} since {}",
                server, lock.owner, lock.started_at
            ),
            LockCheck::NotFound => println!("{} is available", server),
            LockCheck::Unknown(err) => {
                return Err(HostError::LockUnknown {
                    server_id: server.to_string(),
                    source: Box::new(err),
                }
                .into())
            }
        },
        Command::List => {
            let servers = coordinator.sync().list_available().await?;
            if servers.is_empty() {
                println!("No worlds in storage");
            }
            for server in servers {
                println!("{}", server);
            }
        }
        Command::Size { server } => {
            let size = coordinator.sync().size_of(server.as_ref()).await?;
            println!("{} objects, {}", size.count, format_bytes(size.bytes));
        }
        Command::Pull { server } => {
            coordinator.sync().pull(&server, Some(&print_progress)).await?;
            println!("Pulled {}", server);
        }
        Command::Push { server } => {
            coordinator.sync().push(&server, Some(&print_progress)).await?;
            println!("Pushed {}", server);
        }
        Command::Delete { server } => {
            coordinator.sync().remove(&server).await?;
            println!("Deleted {} from storage", server);
        }
        Command::CheckAccess => {
            coordinator.sync().check_access().await?;
            println!("Storage is reachable");
        }
        Command::Stats { server } => match coordinator.sessions().statistics(&server).await? {
            Some(stats) => {
                println!(
                    "{}: {} sessions, {} total",
                    server,
                    stats.session_count,
                    format_duration(stats.total_playtime_millis)
                );
                for session in stats.sessions {
                    let length = session
                        .duration_millis
                        .map(format_duration)
                        .unwrap_or_else(|| "in progress".to_string());
                    println!("  {}  {}  {}", session.start_time, session.username, length);
                }
            }
            None => println!("{} has no recorded sessions", server),
        },
        Command::Acquire { server, username } => {
            let acquired = coordinator
                .acquire(&server, &username, Some(&print_progress))
                .await?;
            println!(
                "{} locked by {}{}",
                server,
                acquired.lock.owner,
                if acquired.pulled { " (pulled latest copy)" } else { "" }
            );
        }
        Command::Release { server, username } => {
            let released = coordinator
                .release(&server, &username, Some(&print_progress))
                .await?;
            match released.session_millis {
                Some(millis) => println!("Released {} after {}", server, format_duration(millis)),
                None => println!("Released {}", server),
            }
        }
        Command::Unlock { server } => {
            let removal = coordinator.force_release(&server).await?;
            if removal.existed {
                println!("Lock of {} removed", server);
            } else {
                println!("{} was not locked", server);
            }
        }
        Command::Watch { server, .. } => {
            let (events_tx, mut events_rx) = mpsc::unbounded_channel();
            let mut monitor = LockMonitor::new(
                coordinator.locks().clone(),
                events_tx,
                config.monitor_max_delay,
            );
            monitor.start(server, config.monitor_interval);

            // Report lock changes until Ctrl+C
            loop {
                tokio::select! {
                    event = events_rx.recv() => match event {
                        Some(LockEvent::Detected { server_id, owner, started_at }) => {
                            println!("{} is now hosted by {} (since {})", server_id, owner, started_at)
                        }
                        Some(LockEvent::Available { server_id }) => {
                            println!("{} is available", server_id)
                        }
                        Some(LockEvent::CheckFailed { server_id, error, retry_delay }) => {
                            warn!("Check of {} failed, retrying in {:?}: {}", server_id, retry_delay, error)
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        println!("Received Ctrl+C, stopping watch");
                        break;
                    }
                }
            }

            monitor.stop();
        }
        Command::Host { server, username } => {
            coordinator
                .acquire(&server, &username, Some(&print_progress))
                .await?;
            println!("Hosting {}. Press Ctrl+C to publish and release it.", server);

            // Handle shutdown gracefully
            tokio::signal::ctrl_c().await?;
            println!("Received Ctrl+C, releasing {}", server);

            coordinator
                .release(&server, &username, Some(&print_progress))
                .await?;
            println!("Released {}", server);
        }
    }

    Ok(())
}

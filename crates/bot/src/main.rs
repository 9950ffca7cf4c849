use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stampede_bot::cli::{self, Args, Command};
use stampede_bot::conference_manager::{ConferenceManager, ConferenceOptions};
use stampede_bot::ui;
use stampede_bot::viewer_manager::{ViewerManager, ViewerOptions};

const LOG_FILE: &str = "load_test.log";

fn main() -> anyhow::Result<()> {
    let args = match cli::parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return Ok(()),
        Err(e) => {
            eprintln!("{e}");
            eprintln!();
            cli::print_usage();
            std::process::exit(1);
        }
    };

    init_logging(args.nogui)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.network_threads.max(1))
        .enable_all()
        .build()
        .context("failed to build the network runtime")?;
    runtime.block_on(run(args))
}

fn init_logging(nogui: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if nogui {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    }

    // The dashboard owns the terminal; logs go to a file next to the binary.
    let path = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(LOG_FILE)))
        .unwrap_or_else(|| std::path::PathBuf::from(LOG_FILE));
    let file = std::fs::File::create(&path)
        .with_context(|| format!("cannot create log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Conference {
            room_count,
            user_per_room,
            base_room_id,
        } => {
            info!(
                worker_threads = args.worker_threads,
                network_threads = args.network_threads,
                peer_factories = args.peer_factories,
                room_count,
                user_per_room,
                "starting conference swarm",
            );
            let manager = ConferenceManager::new(
                args.worker_threads,
                args.peer_factories,
                ConferenceOptions::default(),
            );
            manager
                .apply_config(room_count, user_per_room, base_room_id)
                .await;

            if args.nogui {
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            } else {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
                    _ = ui::conference_dashboard(&manager) => {}
                }
            }
        }
        Command::Livestream {
            streamer_id,
            viewer_count,
        } => {
            info!(
                worker_threads = args.worker_threads,
                network_threads = args.network_threads,
                peer_factories = args.peer_factories,
                streamer_id = %streamer_id,
                viewer_count,
                "starting viewer swarm",
            );
            let manager = ViewerManager::new(
                args.worker_threads,
                args.peer_factories,
                ViewerOptions::default(),
            );
            manager.set_streamer_id(streamer_id);
            manager.set_viewer_count(viewer_count).await;

            if args.nogui {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
                    _ = ui::livestream_status_line(&manager) => {}
                }
            } else {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
                    _ = ui::livestream_dashboard(&manager) => {}
                }
            }
        }
    }

    info!("shut down");
    Ok(())
}

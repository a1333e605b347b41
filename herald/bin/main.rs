use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use herald::{Controller, Event, HeraldConfig, MessageOptions, config};
use herald_common::{Signal, internal, logging};
use herald_delivery::SmtpTransport;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

#[cfg(not(unix))]
compile_error!("Only unix-like systems are currently supported");

#[derive(Parser)]
#[command(name = "herald", version, about = "A crash-safe bulk mail dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send the campaign to the recipients in a csv file
    Send {
        /// CSV file with recipient addresses in the fourth column
        csv: PathBuf,
    },
    /// Clear the recipient database entirely
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Print the configuration path, writing a default config if none exists
    Config,
}

static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    match Cli::parse().command {
        Command::Send { csv } => send(csv).await,
        Command::Clear { yes } => clear(yes).await,
        Command::Config => config_file(),
    }
}

/// Wait for CTRL+C or SIGTERM, then broadcast the shutdown signal.
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    }

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

fn load_config() -> anyhow::Result<HeraldConfig> {
    let path = config::find_config_file()?;
    HeraldConfig::load(&path)
}

async fn send(csv: PathBuf) -> anyhow::Result<()> {
    let cfg = load_config()?;

    anyhow::ensure!(
        csv.exists(),
        "The provided csv file does not exist: {}",
        csv.display()
    );
    let html = std::fs::read_to_string(&cfg.message.html_path).with_context(|| {
        format!(
            "Failed to read the html file {}",
            cfg.message.html_path.display()
        )
    })?;

    let backing = cfg.store.into_backing_store()?;
    let transport = Arc::new(SmtpTransport::new(cfg.smtp));
    let (controller, mut events) = Controller::new(backing, transport, cfg.queue);
    let controller = Arc::new(controller);

    controller.initialize().await?;

    if controller.is_recoverable().await {
        let resume = Confirm::new()
            .with_prompt("Do you want to continue your last session?")
            .default(true)
            .interact()?;

        if resume {
            controller.recover_from_database().await;
        } else {
            controller.clean_non_sent().await?;
        }
    }

    controller
        .set_message(MessageOptions {
            from: cfg.message.from.clone(),
            subject: cfg.message.subject.clone(),
            html,
        })
        .await;

    controller.load_csv(&csv).await?;
    controller.start().await?;

    let server = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller.serve(SHUTDOWN_BROADCAST.subscribe()).await;
        })
    };

    let run = tokio::select! {
        done = drive_events(&mut events) => done,
        r = shutdown_signal() => r,
    };

    finalize(&controller, server).await?;

    run
}

/// Print controller events until the run's backlog is exhausted.
async fn drive_events(events: &mut mpsc::UnboundedReceiver<Event>) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            Event::Info(message) => info!("{message}"),
            Event::Error(message) => error!("{message}"),
            Event::QueueMoved { total } => info!("{total} remaining"),
            Event::QueueDone { total_items } => {
                if total_items == 0 {
                    info!("The queue got emptied");
                } else {
                    info!("Queue drained, {total_items} recipient(s) still recoverable");
                }
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Graceful shutdown: stop admission, give the in-flight attempt a short
/// grace period, then flush the store one final time.
async fn finalize(controller: &Controller, server: tokio::task::JoinHandle<()>) -> anyhow::Result<()> {
    internal!(level = INFO, "Closing...");

    controller.pause();
    let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

    let grace = Duration::from_secs(5);
    let abort = server.abort_handle();
    if tokio::time::timeout(grace, server).await.is_err() {
        internal!(
            level = WARN,
            "In-flight delivery did not finish within {grace:?}; it will be retried on the next run"
        );
        abort.abort();
    }

    internal!(level = INFO, "Saving database");
    controller.persist().await?;
    internal!(level = INFO, "Database saved");

    Ok(())
}

async fn clear(yes: bool) -> anyhow::Result<()> {
    let cfg = load_config()?;

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Clear the recipient database entirely?")
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    let backing = cfg.store.into_backing_store()?;
    let store = herald_store::RecipientStore::new(backing);
    store.open().await?;
    store.clear().await?;
    info!("Database cleared");

    Ok(())
}

fn config_file() -> anyhow::Result<()> {
    match config::find_config_file() {
        Ok(path) => {
            println!("{}", path.display());
            Ok(())
        }
        Err(_) => {
            let path = PathBuf::from("./herald.config.ron");
            std::fs::write(&path, config::DEFAULT_CONFIG)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

mod config;
mod doorbell;
mod hardware;
mod settings;
mod status;
mod sync;
mod units;
mod watcher;

use clap::{Parser, Subcommand};
use doorbell::Doorbell;
use settings::{SettingsStore, Store};
use status::{SessionState, StatusTracker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync::{SettingsSync, SharedSettings};
use tokio_util::sync::CancellationToken;
use units::UnitRegistry;

/// Doorbell and gate controller: rings the chime, opens the gate, and keeps
/// each unit's user settings in sync with a remote store.
#[derive(Parser, Debug)]
#[command(name = "dingdongditch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "dingdongditch.toml")]
    config: PathBuf,

    /// Extra logging (watcher checks, pin transitions)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch buzzers and keep settings in sync until interrupted
    Run,
    /// Act as if the buzzer of UNIT was pressed
    Ring { unit: String },
    /// Release the gate strike for UNIT
    Open {
        unit: String,
        /// Seconds to hold the strike open (default 3)
        #[arg(long)]
        duration: Option<f64>,
    },
    /// Register the configured units with the settings store
    Init,
    /// Print the current settings snapshot
    Settings {
        /// Only show the parsed settings of this unit
        #[arg(long)]
        unit: Option<String>,
    },
    /// Validate config and print resolved settings, don't run
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "dingdongditch=debug"
    } else {
        "dingdongditch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = dispatch(cli).await {
        tracing::error!(error = %e, "dingdongditch failed");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load(&cli.config)?;
    config.validate()?;

    match cli.command {
        Command::Check => {
            config.validate_settings()?;
            println!("dingdongditch v{}", env!("CARGO_PKG_VERSION"));
            println!("Config file: {}", cli.config.display());
            println!("{config:#?}");
            Ok(())
        }
        Command::Settings { unit } => {
            config.validate_settings()?;
            let store = Store::from_config(&config.settings)?;
            match unit {
                Some(unit_id) => match settings::unit_settings(&store, &unit_id).await {
                    Some(s) => println!("{s:#?}"),
                    None => println!("no settings for unit {unit_id}"),
                },
                None => match store.get_settings().await? {
                    Some(snapshot) => {
                        println!("revision: {}", snapshot.revision);
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&serde_json::Value::Object(snapshot.data))?
                        );
                    }
                    None => println!("settings store is empty"),
                },
            }
            Ok(())
        }
        Command::Init => {
            config.validate_settings()?;
            let store = Store::from_config(&config.settings)?;
            let snapshot = settings::init_data(&store, &config.unit_ids()).await?;
            match snapshot {
                Some(s) => println!("initialised {} units, revision {}", config.unit_ids().len(), s.revision),
                None => println!("initialised {} units, no user settings yet", config.unit_ids().len()),
            }
            Ok(())
        }
        Command::Ring { unit } => {
            config.validate_settings()?;
            let units = Arc::new(UnitRegistry::simulated(&config.units, config.hardware.buzzer_hold()));
            let shared = SharedSettings::new();
            SettingsSync::new(Arc::new(Store::from_config(&config.settings)?), shared.clone())
                .update()
                .await;
            let doorbell = Doorbell::new(units, shared);
            let response = doorbell
                .on_buzzer(&unit)
                .await
                .ok_or_else(|| format!("unknown unit {unit:?}"))?;
            if !response.recipients.is_empty() {
                println!("would notify: {}", response.recipients.join(", "));
            }
            if let Some(chime) = response.chime {
                chime.await?;
            }
            Ok(())
        }
        Command::Open { unit, duration } => {
            let units = Arc::new(UnitRegistry::simulated(&config.units, config.hardware.buzzer_hold()));
            let duration = duration
                .map(Duration::try_from_secs_f64)
                .transpose()
                .map_err(|e| format!("invalid --duration: {e}"))?;
            let doorbell = Doorbell::new(units, SharedSettings::new());
            let pulse = doorbell
                .open(&unit, duration)
                .ok_or_else(|| format!("unknown unit {unit:?}"))?;
            pulse.await?;
            Ok(())
        }
        Command::Run => {
            config.validate_settings()?;
            run(config).await
        }
    }
}

/// Main service loop: buzzer polling plus the settings watch session.
async fn run(config: config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let units = Arc::new(UnitRegistry::simulated(&config.units, config.hardware.buzzer_hold()));
    if units.is_empty() {
        tracing::warn!("no units configured, buzzers will not be watched");
    } else {
        tracing::info!(units = ?units.ids(), "units ready");
    }
    let shared = SharedSettings::new();
    let store = Arc::new(Store::from_config(&config.settings)?);
    tracing::info!(adapter = store.name(), "using settings store");

    let interval = config.watcher.interval();
    let tracker = StatusTracker::new(config.status.path.clone(), interval);
    tracker.update(SessionState::Starting, None, None);

    let sync = SettingsSync::new(store, shared.clone());
    let watch = sync.watch(interval, config.watcher.on_failure)?;

    let token = CancellationToken::new();
    let doorbell = Doorbell::new(units, shared.clone());
    let buzzers = {
        let token = token.child_token();
        let tick = config.hardware.poll_interval();
        tokio::spawn(async move { doorbell.run_buzzers(token, tick).await })
    };

    // Status is refreshed at least every few seconds, and at most once per check.
    let mut status_tick = tokio::time::interval(interval.min(Duration::from_secs(5)));
    let mut stopped = false;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                tracing::info!("shutting down");
                break;
            }
            _ = status_tick.tick() => {
                let revision = shared.revision().await.map(|r| r.to_string());
                if watch.is_finished() {
                    if !stopped {
                        tracing::error!(
                            error = watch.last_error().as_deref().unwrap_or("unknown"),
                            "settings watch stopped; serving with last applied settings"
                        );
                        stopped = true;
                    }
                    tracker.update(SessionState::Stopped, Some(&watch), revision);
                } else {
                    tracker.update(SessionState::Watching, Some(&watch), revision);
                }
            }
        }
    }

    tracing::debug!(state = ?watch.state(), "stopping settings watch");
    token.cancel();
    let exit = watch.shutdown().await;
    tracing::debug!(?exit, "settings watch finished");
    if let Err(e) = buzzers.await {
        tracing::warn!(error = %e, "buzzer task ended abnormally");
    }
    tracker.finish();
    Ok(())
}

use std::{error::Error, path::PathBuf, process};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use stagelinq::{config::Config, events::Event, stagelinq::StageLinq};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Settings not in the file keep their defaults. Without this option,
    /// only defaults are used.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "STAGELINQ_CONFIG")]
    config: Option<PathBuf>,

    /// Source name announced to devices
    ///
    /// [default: testing]
    #[arg(short, long, value_hint = ValueHint::Other)]
    name: Option<String>,

    /// Download the track databases of connected devices
    #[arg(long, default_value_t = false)]
    download_databases: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Both the library and this binary log under the crate name.
        logger.filter_module("stagelinq", level);
    }

    logger.init();
}

/// Builds the configuration from the optional file and the overrides on
/// the command line.
fn load_config(args: &Args) -> stagelinq::error::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            debug!("loading configuration from {}", path.display());
            Config::from_file(path)?
        }
        None => Config::default(),
    };

    if let Some(name) = &args.name {
        config.source_name.clone_from(name);
    }
    if args.download_databases {
        config.download_databases = true;
    }

    Ok(config)
}

fn log_event(event: &Event) {
    match event {
        Event::Discovered(info) => info!("discovered {info}"),
        Event::Connected(info) => info!("connected to {info}"),
        Event::Disconnected(token) => info!("{token} disconnected"),
        Event::DeviceFailed(token) => error!("could not connect to {token}"),
        Event::Health(token, health) => info!("{token}: {health:?}"),
        Event::TrackLoaded(status) => info!(
            "deck {} loaded {} - {}",
            status.deck,
            status.state.artist.as_deref().unwrap_or("unknown artist"),
            status.state.title.as_deref().unwrap_or("unknown title"),
        ),
        Event::NowPlaying(status) => info!(
            "deck {} is playing {}",
            status.deck,
            status.state.title.as_deref().unwrap_or("unknown title"),
        ),
        Event::StateChanged(status) => debug!("deck {}: {:?}", status.deck, status.state),
        Event::State(token, state) => debug!("{token}: {} = {:?}", state.name, state.json),
        Event::Beat(token, beat) => debug!("{token}: beat {:?}", beat.decks),
        Event::FileTransferProgress(token, progress) => {
            debug!("{token}: downloaded {}%", progress.percent_complete);
        }
        Event::DatabaseDownloaded {
            token,
            source,
            path,
        } => info!("{token}: database of {source} saved to {}", path.display()),
    }
}

/// Main application loop.
///
/// Runs until interrupted, logging everything the session reports.
///
/// # Errors
///
/// This function returns an error when the configuration cannot be loaded or
/// the session cannot start listening.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    let session = StageLinq::new(config);
    let mut events = session.subscribe();
    session.connect().await?;

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                session.disconnect().await;
                break Ok(())
            }

            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break Ok(()),
            },
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

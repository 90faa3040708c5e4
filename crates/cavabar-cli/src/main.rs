mod analyzer;
mod broker;
mod client;
mod registry;

use cavabar_core::display::{DisplayOverrides, StandbyMode};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Exit status for "another broker already owns the socket", distinct from
/// generic failures.
const EXIT_ALREADY_RUNNING: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "cavabar",
    about = "Audio visualizer broker and status-bar stream client",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker: supervise the analyzer and serve subscribers.
    Manager(ManagerArgs),
    /// Connect as a subscriber and stream waybar-style JSON records.
    Waybar(WaybarArgs),
    /// Check whether a broker is running (exit 0) or not (exit 1).
    Status,
    /// Ask a running broker to restart its analyzer.
    Reload,
}

#[derive(Args, Debug)]
struct ManagerArgs {
    /// Number of analyzer bars (env: CAVA_BARS).
    #[arg(long)]
    bars: Option<usize>,
    /// Amplitude ceiling of the raw ascii feed (env: CAVA_RANGE).
    #[arg(long)]
    range: Option<u32>,
    /// Audio channel mode (env: CAVA_CHANNELS).
    #[arg(long, value_enum)]
    channels: Option<analyzer::Channels>,
    /// Reverse the frequency order (env: CAVA_REVERSE).
    #[arg(long)]
    reverse: Option<bool>,
}

#[derive(Args, Debug)]
struct WaybarArgs {
    /// Bar glyphs, one character per amplitude level.
    #[arg(long)]
    bar: Option<String>,
    /// Per-level glyph strings; overrides --bar.
    #[arg(long = "bar-array", num_args = 1..)]
    bar_array: Option<Vec<String>>,
    /// Number of displayed bars (default: glyph count).
    #[arg(long)]
    width: Option<usize>,
    /// Standby policy: 0=hide, 1=blank, 2=full, 3=low, other text verbatim.
    #[arg(long)]
    stb: Option<String>,
    /// Analyzer bar count used when auto-starting a broker.
    #[arg(long)]
    bars: Option<usize>,
    /// Analyzer amplitude range used when auto-starting a broker.
    #[arg(long)]
    range: Option<u32>,
}

impl From<WaybarArgs> for DisplayOverrides {
    fn from(args: WaybarArgs) -> Self {
        Self {
            glyphs: args.bar,
            glyph_levels: args.bar_array,
            width: args.width,
            standby: args.stb.as_deref().map(StandbyMode::from_cli),
            bars: args.bars,
            range: args.range,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let paths = registry::RuntimePaths::resolve();

    let code = match cli.command {
        Command::Manager(args) => {
            let settings = analyzer::resolve_settings(
                args.bars,
                args.range,
                args.channels,
                args.reverse,
                |key| std::env::var(key).ok(),
            );
            match broker::run(paths, settings).await {
                Ok(()) => 0,
                Err(broker::BrokerError::AlreadyRunning) => {
                    eprintln!("cavabar broker is already running");
                    EXIT_ALREADY_RUNNING
                }
                Err(err) => {
                    eprintln!("broker error: {err}");
                    1
                }
            }
        }
        Command::Waybar(args) => match client::run_subscriber(paths, args.into()).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("Error: {err:#}");
                1
            }
        },
        Command::Status => client::run_status(paths).await,
        Command::Reload => match client::run_reload(paths).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("Error: {err:#}");
                1
            }
        },
    };
    std::process::exit(code);
}

/// Diagnostics go to stderr; the waybar subcommand's stdout is reserved for
/// the JSON record stream.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

//! Supervision of the external audio analyzer subprocess.
//!
//! The broker owns exactly zero or one analyzer at a time. Its runtime
//! configuration file is regenerated on every (re)start, and stop always
//! waits the old process out (bounded, then forced) before a relaunch so
//! two analyzers never race on the output pipe.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use clap::ValueEnum;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const DEFAULT_ANALYZER_PROGRAM: &str = "cava";
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Channels {
    Mono,
    Stereo,
}

impl Channels {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channels::Mono => "mono",
            Channels::Stereo => "stereo",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub bars: usize,
    pub range: u32,
    pub channels: Channels,
    pub reverse: bool,
    /// Analyzer executable; tests point this at a stub.
    pub program: String,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            bars: cavabar_core::display::DEFAULT_BARS,
            range: cavabar_core::display::DEFAULT_RANGE,
            channels: Channels::Stereo,
            reverse: false,
            program: DEFAULT_ANALYZER_PROGRAM.to_string(),
        }
    }
}

/// Layer analyzer settings: explicit CLI values beat environment overrides
/// (`CAVA_BARS`, `CAVA_RANGE`, `CAVA_CHANNELS`, `CAVA_REVERSE`), which beat
/// the built-in defaults. The environment is injected so tests never mutate
/// process-global state.
pub fn resolve_settings(
    bars: Option<usize>,
    range: Option<u32>,
    channels: Option<Channels>,
    reverse: Option<bool>,
    env: impl Fn(&str) -> Option<String>,
) -> AnalyzerSettings {
    let defaults = AnalyzerSettings::default();
    AnalyzerSettings {
        bars: bars
            .or_else(|| env("CAVA_BARS").and_then(|value| value.trim().parse().ok()))
            .unwrap_or(defaults.bars),
        range: range
            .or_else(|| env("CAVA_RANGE").and_then(|value| value.trim().parse().ok()))
            .unwrap_or(defaults.range),
        channels: channels
            .or_else(|| env("CAVA_CHANNELS").and_then(|value| parse_channels(&value)))
            .unwrap_or(defaults.channels),
        reverse: reverse
            .or_else(|| env("CAVA_REVERSE").map(|value| truthy(&value)))
            .unwrap_or(defaults.reverse),
        program: defaults.program,
    }
}

fn parse_channels(raw: &str) -> Option<Channels> {
    match raw.trim().to_lowercase().as_str() {
        "mono" => Some(Channels::Mono),
        "stereo" => Some(Channels::Stereo),
        _ => None,
    }
}

/// Accepts both numeric ("1", "0") and word ("true", "yes", "on") forms.
fn truthy(raw: &str) -> bool {
    let value = raw.trim().to_lowercase();
    if let Ok(number) = value.parse::<i64>() {
        return number != 0;
    }
    matches!(value.as_str(), "true" | "yes" | "on")
}

/// Render the analyzer's runtime configuration: raw ascii output on stdout,
/// one `;`-separated line per frame.
pub fn render_config(settings: &AnalyzerSettings) -> String {
    format!(
        "[general]\n\
         bars = {bars}\n\
         sleep_timer = 1\n\
         \n\
         [input]\n\
         method = pulse\n\
         source = auto\n\
         \n\
         [output]\n\
         method = raw\n\
         raw_target = /dev/stdout\n\
         data_format = ascii\n\
         ascii_max_range = {range}\n\
         channels = {channels}\n\
         reverse = {reverse}\n",
        bars = settings.bars,
        range = settings.range,
        channels = settings.channels.as_str(),
        reverse = u8::from(settings.reverse),
    )
}

/// Handle to the supervised subprocess. Each successful start hands the new
/// stdout pipe to the broadcaster through the channel created in [`new`],
/// so a restart transparently swaps the feed.
///
/// [`new`]: Analyzer::new
pub struct Analyzer {
    settings: AnalyzerSettings,
    conf_path: PathBuf,
    child: Option<Child>,
    stdout_tx: mpsc::UnboundedSender<ChildStdout>,
}

impl Analyzer {
    pub fn new(
        settings: AnalyzerSettings,
        conf_path: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<ChildStdout>) {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                conf_path,
                child: None,
                stdout_tx,
            },
            stdout_rx,
        )
    }

    /// Regenerate the configuration file and launch the analyzer with its
    /// stdout captured.
    pub async fn start(&mut self) -> io::Result<()> {
        if let Some(dir) = self.conf_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.conf_path, render_config(&self.settings)).await?;

        let mut child = Command::new(&self.settings.program)
            .arg("-p")
            .arg(&self.conf_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        if let Some(stdout) = child.stdout.take() {
            let _ = self.stdout_tx.send(stdout);
        }
        info!(
            event = "analyzer_started",
            pid = child.id().unwrap_or_default(),
            bars = self.settings.bars,
            range = self.settings.range,
            channels = self.settings.channels.as_str(),
            reverse = self.settings.reverse,
        );
        self.child = Some(child);
        Ok(())
    }

    /// Graceful terminate, bounded wait, then forced kill. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(event = "analyzer_kill_escalation");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        info!(event = "analyzer_stopped");
    }

    /// Full stop before relaunch. A spawn failure here leaves the broker
    /// running without a feed; a missing binary is only fatal at first start.
    pub async fn restart(&mut self) {
        self.stop().await;
        if let Err(err) = self.start().await {
            if err.kind() == io::ErrorKind::NotFound {
                error!(
                    event = "analyzer_missing",
                    program = %self.settings.program,
                );
            } else {
                error!(event = "analyzer_spawn_error", error = %err);
            }
        }
    }
}

//! Subscriber-side commands: the status-bar stream client, the liveness
//! status check, and the reload sender.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use cavabar_core::display::{DisplayConfig, DisplayOverrides, HostConfig};
use cavabar_core::frame::{format_frame, standby_text, RenderedFrame};
use cavabar_core::ipc::{BarRecord, RELOAD_COMMAND};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::registry::{self, RuntimePaths};

const HOST_CONFIG_WAIT: Duration = Duration::from_millis(100);
const ENSURE_TIMEOUT: Duration = Duration::from_secs(5);
const ENSURE_POLL: Duration = Duration::from_millis(100);

/// Stream formatted frames to stdout until the broker closes the connection.
/// Auto-starts a broker when none is reachable.
pub async fn run_subscriber(paths: RuntimePaths, args: DisplayOverrides) -> Result<()> {
    let host = read_host_config()
        .await
        .map(DisplayOverrides::from)
        .unwrap_or_default();
    let config = DisplayConfig::resolve(host, args)?;

    ensure_broker(&paths, &config).await?;

    let stream = UnixStream::connect(&paths.socket)
        .await
        .context("cannot connect to the broker socket")?;

    // Give the consumer an initial frame before any data arrives.
    if let Some(record) = initial_record(&config) {
        emit(&record)?;
    }

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("read from broadcast stream")?
    {
        if line.trim().is_empty() {
            continue;
        }
        let rendered = format_frame(&line, &config.glyphs, config.width, &config.standby);
        if let Some(record) = frame_record(rendered) {
            emit(&record)?;
        }
    }

    info!(event = "broker_closed_stream");
    Ok(())
}

/// The host may embed a config object in the first stdin line. Read it
/// without blocking a host that sends nothing.
async fn read_host_config() -> Option<HostConfig> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    match tokio::time::timeout(HOST_CONFIG_WAIT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => HostConfig::parse(&line),
        _ => None,
    }
}

/// The record for one formatted frame. Frames that render to nothing (the
/// hide policy during standby) produce no record at all.
fn frame_record(rendered: RenderedFrame) -> Option<BarRecord> {
    if rendered.text.is_empty() {
        return None;
    }
    Some(if rendered.standby {
        BarRecord::standby(rendered.text)
    } else {
        BarRecord::active(rendered.text)
    })
}

/// The standby record shown before any data arrives, absent when the policy
/// renders to nothing.
fn initial_record(config: &DisplayConfig) -> Option<BarRecord> {
    let text = standby_text(&config.standby, &config.glyphs, config.width);
    if text.is_empty() {
        return None;
    }
    Some(BarRecord::standby(text))
}

fn emit(record: &BarRecord) -> Result<()> {
    use std::io::Write;
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, record).context("serialize record")?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Spawn a detached broker if none is alive, then poll liveness until it is
/// reachable or the bounded wait expires.
async fn ensure_broker(paths: &RuntimePaths, config: &DisplayConfig) -> Result<()> {
    if registry::broker_alive(paths).await {
        return Ok(());
    }
    spawn_detached_broker(config)?;
    debug!(event = "broker_autostart", bars = config.bars, range = config.range);

    let deadline = Instant::now() + ENSURE_TIMEOUT;
    while Instant::now() < deadline {
        if registry::broker_alive(paths).await {
            return Ok(());
        }
        tokio::time::sleep(ENSURE_POLL).await;
    }
    bail!(
        "broker did not become reachable within {} seconds",
        ENSURE_TIMEOUT.as_secs()
    );
}

fn spawn_detached_broker(config: &DisplayConfig) -> Result<()> {
    let exe = std::env::current_exe().context("resolve current executable")?;
    std::process::Command::new(exe)
        .arg("manager")
        .arg("--bars")
        .arg(config.bars.to_string())
        .arg("--range")
        .arg(config.range.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("spawn broker in background")?;
    Ok(())
}

/// Exit 0 when a broker is alive, 1 otherwise.
pub async fn run_status(paths: RuntimePaths) -> i32 {
    if registry::broker_alive(&paths).await {
        println!("cavabar broker is running");
        0
    } else {
        println!("cavabar broker is not running");
        1
    }
}

/// Send the reload sentinel to a running broker. No retry.
pub async fn run_reload(paths: RuntimePaths) -> Result<()> {
    if !paths.socket.exists() {
        bail!("cavabar broker is not running");
    }
    let mut stream = UnixStream::connect(&paths.socket)
        .await
        .context("connect to the broker socket")?;
    stream
        .write_all(format!("{RELOAD_COMMAND}\n").as_bytes())
        .await
        .context("send reload command")?;
    stream.flush().await.context("flush reload command")?;
    drop(stream);
    println!("Reload command sent.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cavabar_core::display::{StandbyMode, BLANK_PLACEHOLDER};

    fn config_with_standby(standby: StandbyMode) -> DisplayConfig {
        let args = DisplayOverrides {
            standby: Some(standby),
            ..Default::default()
        };
        DisplayConfig::resolve(DisplayOverrides::default(), args).unwrap()
    }

    #[test]
    fn active_frames_emit_active_records() {
        let config = config_with_standby(StandbyMode::Hide);
        let rendered = format_frame(
            "1;5;9;14;3;0;0;2",
            &config.glyphs,
            config.width,
            &config.standby,
        );
        let record = frame_record(rendered).unwrap();
        assert_eq!(record.tooltip, "Cava audio visualizer - active");
        assert_eq!(record.text.chars().count(), config.width);
    }

    #[test]
    fn standby_frames_emit_standby_records() {
        let config = config_with_standby(StandbyMode::Full);
        let rendered = format_frame("0;0;0;0", &config.glyphs, config.width, &config.standby);
        let record = frame_record(rendered).unwrap();
        assert_eq!(record.tooltip, "Cava audio visualizer - standby");
        assert_eq!(record.text, "█".repeat(config.width));
    }

    #[test]
    fn hidden_standby_frames_produce_no_record() {
        let config = config_with_standby(StandbyMode::Hide);
        let rendered = format_frame("0;0;0", &config.glyphs, config.width, &config.standby);
        assert_eq!(frame_record(rendered), None);
    }

    #[test]
    fn initial_record_follows_the_standby_policy() {
        assert_eq!(initial_record(&config_with_standby(StandbyMode::Hide)), None);
        let record = initial_record(&config_with_standby(StandbyMode::Blank)).unwrap();
        assert_eq!(record.text, BLANK_PLACEHOLDER);
        assert_eq!(record.tooltip, "Cava audio visualizer - standby");
    }

    #[test]
    fn host_config_line_beats_cli_arguments() {
        let host = HostConfig::parse(r#"{"config": {"bar": "ab", "width": 2, "stb": 2}}"#)
            .map(DisplayOverrides::from)
            .unwrap_or_default();
        let args = DisplayOverrides {
            width: Some(9),
            standby: Some(StandbyMode::Hide),
            ..Default::default()
        };
        let config = DisplayConfig::resolve(host, args).unwrap();
        assert_eq!(config.width, 2);
        assert_eq!(config.standby, StandbyMode::Full);
        let rendered = format_frame("0;0", &config.glyphs, config.width, &config.standby);
        assert_eq!(frame_record(rendered).unwrap().text, "bb");
    }
}

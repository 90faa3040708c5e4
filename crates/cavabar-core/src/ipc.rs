//! Wire-level constants and the subscriber output record.
//!
//! The broadcast direction carries the analyzer's raw newline-terminated
//! lines byte-for-byte. The command direction is a single sentinel line.

use serde::{Deserialize, Serialize};

/// Inbound command line that asks the broker to restart its analyzer.
pub const RELOAD_COMMAND: &str = "CMD:RELOAD";

/// Names of the runtime artifacts under the per-user runtime directory.
pub const RUNTIME_SUBDIR: &str = "cavabar";
pub const SOCKET_FILE: &str = "cava.sock";
pub const PID_FILE: &str = "cava.pid";
pub const ANALYZER_CONF_FILE: &str = "cava.manager.conf";

/// One JSON record per received frame, emitted to the subscriber's stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BarRecord {
    pub text: String,
    pub tooltip: String,
}

impl BarRecord {
    pub fn active(text: String) -> Self {
        Self {
            text,
            tooltip: "Cava audio visualizer - active".to_string(),
        }
    }

    pub fn standby(text: String) -> Self {
        Self {
            text,
            tooltip: "Cava audio visualizer - standby".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_record_serializes_text_and_tooltip() {
        let record = BarRecord::active("▁▂▃".to_string());
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"text":"▁▂▃","tooltip":"Cava audio visualizer - active"}"#
        );
    }
}

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_GLYPHS: &str = "▁▂▃▄▅▆▇█";
pub const DEFAULT_BARS: usize = 16;
pub const DEFAULT_RANGE: u32 = 15;

/// Rendering for the blank standby policy. The left-to-right mark keeps the
/// bar module from collapsing while staying visually empty.
pub const BLANK_PLACEHOLDER: &str = "\u{200e} ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DisplayError {
    #[error("glyph set cannot be empty")]
    EmptyGlyphs,
}

/// Ordered glyphs, one per amplitude level. Built either from a string of
/// single-character bars or from an explicit per-level string array (the
/// array form allows markup-rich glyphs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphSet {
    levels: Vec<String>,
}

impl GlyphSet {
    pub fn from_chars(chars: &str) -> Result<Self, DisplayError> {
        let levels: Vec<String> = chars.chars().map(String::from).collect();
        if levels.is_empty() {
            return Err(DisplayError::EmptyGlyphs);
        }
        Ok(Self { levels })
    }

    pub fn from_levels(levels: Vec<String>) -> Result<Self, DisplayError> {
        if levels.is_empty() {
            return Err(DisplayError::EmptyGlyphs);
        }
        Ok(Self { levels })
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Glyph for `index`, saturating at the last level. A `GlyphSet` is never
    /// empty, so this cannot index out of range.
    pub fn level(&self, index: usize) -> &str {
        &self.levels[index.min(self.levels.len() - 1)]
    }

    pub fn first(&self) -> &str {
        &self.levels[0]
    }

    pub fn last(&self) -> &str {
        &self.levels[self.levels.len() - 1]
    }
}

impl Default for GlyphSet {
    fn default() -> Self {
        Self {
            levels: DEFAULT_GLYPHS.chars().map(String::from).collect(),
        }
    }
}

/// What to render when a frame carries no audio activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StandbyMode {
    /// Policy 0: render nothing.
    #[default]
    Hide,
    /// Policy 1: a single blank-looking placeholder glyph.
    Blank,
    /// Policy 2: the fullest glyph repeated across the width.
    Full,
    /// Policy 3: the emptiest glyph repeated across the width.
    Low,
    /// Any string policy (and any other number, via its decimal form) is
    /// rendered verbatim.
    Text(String),
}

impl StandbyMode {
    fn from_number(value: i64) -> Self {
        match value {
            0 => Self::Hide,
            1 => Self::Blank,
            2 => Self::Full,
            3 => Self::Low,
            other => Self::Text(other.to_string()),
        }
    }

    /// Parse a CLI argument: digit strings select a numbered policy, anything
    /// else is a custom marker.
    pub fn from_cli(raw: &str) -> Self {
        let trimmed = raw.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(value) = trimmed.parse::<i64>() {
                return Self::from_number(value);
            }
        }
        Self::Text(raw.to_string())
    }

    /// Parse the `stb` value of a host config, which may arrive as a number,
    /// a digit string, or a free-form string.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|f| f as i64))
                .map(Self::from_number)
                .unwrap_or_default(),
            Value::Bool(flag) => Self::from_number(i64::from(*flag)),
            Value::String(text) => Self::from_cli(text),
            _ => Self::default(),
        }
    }
}

/// The `config` object a status bar embeds in the first stdin line of the
/// client, e.g. `{"config": {"bar": "▁▂▃▄", "width": 8, "stb": 2}}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub bar: Option<String>,
    #[serde(rename = "bar-array")]
    pub bar_array: Option<Vec<String>>,
    pub width: Option<usize>,
    pub stb: Option<Value>,
    pub bars: Option<usize>,
    pub range: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HostInput {
    config: HostConfig,
}

impl HostConfig {
    /// Parse one stdin line from the host. Malformed input resolves to no
    /// config rather than an error.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str::<HostInput>(line.trim())
            .ok()
            .map(|input| input.config)
    }
}

/// One layer of display settings; `None` means "not set at this layer".
#[derive(Debug, Clone, Default)]
pub struct DisplayOverrides {
    pub glyphs: Option<String>,
    pub glyph_levels: Option<Vec<String>>,
    pub width: Option<usize>,
    pub standby: Option<StandbyMode>,
    pub bars: Option<usize>,
    pub range: Option<u32>,
}

impl From<HostConfig> for DisplayOverrides {
    fn from(config: HostConfig) -> Self {
        Self {
            glyphs: config.bar,
            glyph_levels: config.bar_array,
            width: config.width,
            standby: config.stb.as_ref().map(StandbyMode::from_json),
            bars: config.bars,
            range: config.range,
        }
    }
}

/// Fully resolved per-session display settings, immutable after resolution.
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub glyphs: GlyphSet,
    pub width: usize,
    pub standby: StandbyMode,
    /// Analyzer bar count used when auto-starting a broker.
    pub bars: usize,
    /// Analyzer amplitude range used when auto-starting a broker.
    pub range: u32,
}

impl DisplayConfig {
    /// Layered resolution: host config beats CLI arguments, which beat the
    /// built-in defaults. An explicit glyph array beats a glyph string.
    pub fn resolve(host: DisplayOverrides, args: DisplayOverrides) -> Result<Self, DisplayError> {
        let glyphs = if let Some(levels) = host.glyph_levels.or(args.glyph_levels) {
            GlyphSet::from_levels(levels)?
        } else if let Some(chars) = host.glyphs.or(args.glyphs) {
            GlyphSet::from_chars(&chars)?
        } else {
            GlyphSet::default()
        };
        let width = host.width.or(args.width).unwrap_or_else(|| glyphs.len());
        let standby = host.standby.or(args.standby).unwrap_or_default();
        let bars = host.bars.or(args.bars).unwrap_or(width);
        let range = host.range.or(args.range).unwrap_or(DEFAULT_RANGE);
        Ok(Self {
            glyphs,
            width,
            standby,
            bars,
            range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn glyph_set_level_saturates() {
        let glyphs = GlyphSet::from_chars("▁▂▃▄").unwrap();
        assert_eq!(glyphs.level(0), "▁");
        assert_eq!(glyphs.level(3), "▄");
        assert_eq!(glyphs.level(99), "▄");
    }

    #[test]
    fn empty_glyph_inputs_are_rejected() {
        assert_eq!(GlyphSet::from_chars(""), Err(DisplayError::EmptyGlyphs));
        assert_eq!(
            GlyphSet::from_levels(Vec::new()),
            Err(DisplayError::EmptyGlyphs)
        );
    }

    #[test]
    fn standby_mode_parses_numbers_and_strings() {
        assert_eq!(StandbyMode::from_cli("0"), StandbyMode::Hide);
        assert_eq!(StandbyMode::from_cli("1"), StandbyMode::Blank);
        assert_eq!(StandbyMode::from_cli("2"), StandbyMode::Full);
        assert_eq!(StandbyMode::from_cli("3"), StandbyMode::Low);
        assert_eq!(
            StandbyMode::from_cli("7"),
            StandbyMode::Text("7".to_string())
        );
        assert_eq!(
            StandbyMode::from_cli("IDLE"),
            StandbyMode::Text("IDLE".to_string())
        );
    }

    #[test]
    fn standby_mode_from_json_coerces_digit_strings() {
        assert_eq!(StandbyMode::from_json(&json!(2)), StandbyMode::Full);
        assert_eq!(StandbyMode::from_json(&json!("3")), StandbyMode::Low);
        assert_eq!(
            StandbyMode::from_json(&json!("quiet")),
            StandbyMode::Text("quiet".to_string())
        );
        assert_eq!(StandbyMode::from_json(&json!(null)), StandbyMode::Hide);
    }

    #[test]
    fn host_config_parses_embedded_config_object() {
        let line = r#"{"config": {"bar": "▁▂▃▄", "width": 8, "stb": "2", "range": 3}}"#;
        let config = HostConfig::parse(line).unwrap();
        assert_eq!(config.bar.as_deref(), Some("▁▂▃▄"));
        assert_eq!(config.width, Some(8));
        assert_eq!(config.range, Some(3));
        assert!(HostConfig::parse("not json").is_none());
    }

    #[test]
    fn resolve_layers_host_over_args_over_defaults() {
        let host = DisplayOverrides {
            width: Some(4),
            ..Default::default()
        };
        let args = DisplayOverrides {
            width: Some(10),
            standby: Some(StandbyMode::Full),
            ..Default::default()
        };
        let config = DisplayConfig::resolve(host, args).unwrap();
        assert_eq!(config.width, 4);
        assert_eq!(config.standby, StandbyMode::Full);
        assert_eq!(config.glyphs, GlyphSet::default());
        assert_eq!(config.bars, 4);
        assert_eq!(config.range, DEFAULT_RANGE);
    }

    #[test]
    fn resolve_defaults_width_to_glyph_count() {
        let config =
            DisplayConfig::resolve(DisplayOverrides::default(), DisplayOverrides::default())
                .unwrap();
        assert_eq!(config.width, DEFAULT_GLYPHS.chars().count());
        assert_eq!(config.standby, StandbyMode::Hide);
    }

    #[test]
    fn glyph_array_beats_glyph_string() {
        let args = DisplayOverrides {
            glyphs: Some("▁▂▃▄".to_string()),
            glyph_levels: Some(vec!["<low>".to_string(), "<high>".to_string()]),
            ..Default::default()
        };
        let config = DisplayConfig::resolve(DisplayOverrides::default(), args).unwrap();
        assert_eq!(config.glyphs.len(), 2);
        assert_eq!(config.glyphs.first(), "<low>");
    }
}

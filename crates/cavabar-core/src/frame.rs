//! Pure formatting of raw analyzer lines into glyph strings.
//!
//! A raw line is a `;`-separated list of non-negative integers, one per
//! analyzer band. The formatter resamples the band count to the configured
//! display width, maps each value to a glyph, and falls back to the standby
//! policy when the line carries no activity.

use crate::display::{GlyphSet, StandbyMode, BLANK_PLACEHOLDER};

/// A formatted frame plus whether it came from the standby path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFrame {
    pub text: String,
    pub standby: bool,
}

/// Format one raw line. Empty, unparsable, or all-zero lines degrade to the
/// standby rendering; anything else yields exactly `width` glyphs.
pub fn format_frame(
    line: &str,
    glyphs: &GlyphSet,
    width: usize,
    standby: &StandbyMode,
) -> RenderedFrame {
    let values = parse_samples(line.trim());
    if values.is_empty() || values.iter().all(|value| *value == 0) {
        return RenderedFrame {
            text: standby_text(standby, glyphs, width),
            standby: true,
        };
    }

    let values = if values.len() == width {
        values
    } else {
        resample(&values, width)
    };

    let mut text = String::with_capacity(width * 3);
    for value in values {
        text.push_str(glyphs.level(value as usize));
    }
    RenderedFrame {
        text,
        standby: false,
    }
}

/// The standby rendering for a policy, given the session's glyphs and width.
pub fn standby_text(standby: &StandbyMode, glyphs: &GlyphSet, width: usize) -> String {
    match standby {
        StandbyMode::Hide => String::new(),
        StandbyMode::Blank => BLANK_PLACEHOLDER.to_string(),
        StandbyMode::Full => glyphs.last().repeat(width),
        StandbyMode::Low => glyphs.first().repeat(width),
        StandbyMode::Text(text) => text.clone(),
    }
}

/// Items that are not pure digit runs are skipped, not fatal.
fn parse_samples(line: &str) -> Vec<u64> {
    line.split(';')
        .filter(|item| !item.is_empty() && item.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|item| item.parse().ok())
        .collect()
}

/// Linear interpolation from `values.len()` bands to `width` bands. A width
/// of one always resolves to source position zero, matching the upstream
/// formula's fallback.
fn resample(values: &[u64], width: usize) -> Vec<u64> {
    let source_len = values.len();
    let mut out = Vec::with_capacity(width);
    for index in 0..width {
        let position = if width > 1 {
            (index as f64) * ((source_len - 1) as f64) / ((width - 1) as f64)
        } else {
            0.0
        };
        let left = position.floor() as usize;
        let right = (left + 1).min(source_len - 1);
        if left == right {
            out.push(values[left]);
        } else {
            let fraction = position - left as f64;
            let interpolated =
                values[left] as f64 + (values[right] as f64 - values[left] as f64) * fraction;
            out.push(interpolated.round() as u64);
        }
    }
    out
}

//! EBU R128 loudness measurement via FFmpeg's `loudnorm` filter.
//!
//! The measurement pass runs `loudnorm` with `print_format=json`; the filter
//! prints a flat JSON object at the end of stderr. The apply pass feeds those
//! values back as `measured_*` parameters with `linear=true`.

use serde::Deserialize;

use crate::error::{MediaError, MediaResult};

/// Loudness the normalized mix is corrected to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessTarget {
    /// Integrated loudness, LUFS
    pub integrated: f64,
    /// Maximum true peak, dBTP
    pub true_peak: f64,
    /// Loudness range, LU
    pub range: f64,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            integrated: -16.0,
            true_peak: -1.5,
            range: 11.0,
        }
    }
}

impl LoudnessTarget {
    /// `loudnorm` filter for the measurement pass.
    pub fn measure_filter(&self) -> String {
        format!(
            "loudnorm=I={}:TP={}:LRA={}:print_format=json",
            self.integrated, self.true_peak, self.range
        )
    }

    /// `loudnorm` filter applying a linear correction from a measurement.
    pub fn apply_filter(&self, m: &LoudnessMeasurement) -> String {
        format!(
            "loudnorm=I={}:TP={}:LRA={}:measured_I={}:measured_TP={}:measured_LRA={}:measured_thresh={}:offset={}:linear=true:print_format=summary",
            self.integrated,
            self.true_peak,
            self.range,
            m.input_i,
            m.input_tp,
            m.input_lra,
            m.input_thresh,
            m.target_offset
        )
    }
}

/// Statistics reported by the measurement pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessMeasurement {
    pub input_i: f64,
    pub input_tp: f64,
    pub input_lra: f64,
    pub input_thresh: f64,
    pub target_offset: f64,
}

/// Raw report; `loudnorm` prints every value as a string.
#[derive(Debug, Deserialize)]
struct LoudnormReport {
    input_i: String,
    input_tp: String,
    input_lra: String,
    input_thresh: String,
    target_offset: String,
}

/// Parse the trailing JSON block `loudnorm` writes to stderr.
pub fn parse_loudnorm_report(stderr: &str) -> MediaResult<LoudnessMeasurement> {
    let end = stderr
        .rfind('}')
        .ok_or_else(|| MediaError::loudness("no JSON block in loudnorm output"))?;
    let start = stderr[..end]
        .rfind('{')
        .ok_or_else(|| MediaError::loudness("unterminated JSON block in loudnorm output"))?;

    let report: LoudnormReport = serde_json::from_str(&stderr[start..=end])?;

    Ok(LoudnessMeasurement {
        input_i: parse_value("input_i", &report.input_i)?,
        input_tp: parse_value("input_tp", &report.input_tp)?,
        input_lra: parse_value("input_lra", &report.input_lra)?,
        input_thresh: parse_value("input_thresh", &report.input_thresh)?,
        target_offset: parse_value("target_offset", &report.target_offset)?,
    })
}

// Silent input reports "-inf", which loudnorm cannot correct against.
fn parse_value(field: &str, raw: &str) -> MediaResult<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| MediaError::loudness(format!("{field} is not a number: {raw:?}")))?;
    if !value.is_finite() {
        return Err(MediaError::loudness(format!("{field} is not finite: {raw}")));
    }
    Ok(value)
}

//! Parsing of the per-frame status lines a render node prints on stdout.
//!
//! A line looks like
//!
//! ```text
//! Fra:1 Mem:96.46M (0.00M, Peak 97.02M) | Time:00:01.23 | Remaining:00:03.50 | Mem:8.00M, Peak:8.00M | Scene, View Layer | Rendered 1/4 Tiles | Sample 16/32
//! ```
//!
//! where the `Remaining:` and trailing extra-information segments are
//! optional. Lines that do not follow the layout are ignored.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Information token the engine reports once a node's work is done.
pub const FINISHED: &str = "Finished";
/// Information token recorded when a node exits abnormally.
pub const FAILED: &str = "Failed";
/// Information token seeded before a node has reported anything.
pub const PENDING: &str = "Pending";

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Fra:(?P<frame>-?\d+) Mem:(?P<mem>\d+(?:\.\d+)?)M \([^)]*\) \| Time:(?P<time>(?:\d+:)?\d+:\d+(?:\.\d+)?) \| (?:Remaining:(?P<remaining>(?:\d+:)?\d+:\d+(?:\.\d+)?) \| )?Mem:(?P<current>\d+(?:\.\d+)?)M, Peak:(?P<peak>\d+(?:\.\d+)?)M \| (?P<scene>[^,|]*), (?P<layer>[^|]*?) \| (?P<info>[^|]*?)(?: \| (?P<extra>.*))?$",
    )
    .expect("progress line pattern is valid")
});

/// Latest structured status reported by one render node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub frame: i64,
    /// Global memory in MiB.
    pub memory_global: f64,
    pub render_time_ms: u64,
    pub remaining_time_ms: Option<u64>,
    pub memory_current: f64,
    pub memory_peak: f64,
    pub scene: String,
    pub render_layer: String,
    pub information: String,
    pub extra_information: Option<String>,
}

impl ProgressSnapshot {
    /// Entry recorded for a node that has just been launched.
    pub fn placeholder(start_frame: i64) -> Self {
        Self {
            frame: start_frame,
            memory_global: 0.0,
            render_time_ms: 0,
            remaining_time_ms: None,
            memory_current: 0.0,
            memory_peak: 0.0,
            scene: String::new(),
            render_layer: String::new(),
            information: PENDING.to_string(),
            extra_information: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.information == FINISHED
    }

    pub fn is_failed(&self) -> bool {
        self.information == FAILED
    }

    /// Whether the node has reached one of the terminal tokens.
    pub fn is_resolved(&self) -> bool {
        self.is_finished() || self.is_failed()
    }
}

/// Parse one stdout line. Returns `None` for anything that is not a progress line.
pub fn parse_line(line: &str) -> Option<ProgressSnapshot> {
    let caps = PROGRESS_LINE.captures(line.trim())?;

    let remaining_time_ms = match caps.name("remaining") {
        Some(m) => Some(parse_clock(m.as_str())?),
        None => None,
    };

    Some(ProgressSnapshot {
        frame: caps["frame"].parse().ok()?,
        memory_global: caps["mem"].parse().ok()?,
        render_time_ms: parse_clock(&caps["time"])?,
        remaining_time_ms,
        memory_current: caps["current"].parse().ok()?,
        memory_peak: caps["peak"].parse().ok()?,
        scene: caps["scene"].trim().to_string(),
        render_layer: caps["layer"].trim().to_string(),
        information: caps["info"].trim().to_string(),
        extra_information: caps
            .name("extra")
            .map(|m| m.as_str().trim().to_string())
            .filter(|extra| !extra.is_empty()),
    })
}

/// Convert `[HH:]MM:SS[.ff]` into milliseconds.
///
/// The fractional part is read as a decimal fraction of a second, so
/// `00:01.23` is 1230 ms.
pub fn parse_clock(text: &str) -> Option<u64> {
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));

    let mut fields = whole.rsplit(':');
    let seconds: u64 = fields.next()?.parse().ok()?;
    let minutes: u64 = fields.next()?.parse().ok()?;
    let hours: u64 = match fields.next() {
        Some(hours) => hours.parse().ok()?,
        None => 0,
    };
    if fields.next().is_some() {
        return None;
    }

    let millis = if fraction.is_empty() {
        0
    } else {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let padded: String =
            fraction.chars().chain(std::iter::repeat('0')).take(3).collect();
        padded.parse::<u64>().ok()?
    };

    // digit runs are unbounded, so overflow is a non-match
    hours
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(1000)?
        .checked_add(millis)
}

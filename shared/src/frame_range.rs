//! Screenshot frame selection
//!
//! A selection is either an explicit list of frame numbers (`"5,7,12"`) or a
//! range (`"<start>-<count>[-<interval>]"`, or `"all"`). Exactly one form is
//! chosen when the string is parsed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Default interval between captured frames in a range.
pub const DEFAULT_INTERVAL: u64 = 1;

/// Error produced when a frame selection string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameRangeError {
    #[error("empty frame selection")]
    Empty,

    #[error("frame range '{0}' must have the form <start>-<count>[-<interval>]")]
    Malformed(String),

    #[error("invalid number '{0}' in frame range")]
    InvalidNumber(String),

    #[error("frame range count must be at least 1")]
    ZeroCount,

    #[error("frame range interval must be at least 1")]
    ZeroInterval,

    #[error("last frame of range starting at {start} does not fit in a frame number")]
    Overflow { start: u64 },

    #[error("frame list '{0}' contains no frame numbers")]
    NoFrames(String),
}

/// Number of frames covered by a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameCount {
    Unlimited,
    Bounded(u64),
}

/// Outcome of testing a frame number against a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeCheck {
    /// The frame lies inside the range bounds
    pub in_range: bool,
    /// The frame is one of the frames to capture (in range and on an interval step)
    pub capture_frame: bool,
}

/// `(start, count, interval)` frame range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: u64,
    pub count: FrameCount,
    pub interval: u64,
    valid: bool,
}

impl FrameRange {
    /// Create a validated range.
    pub fn new(start: u64, count: FrameCount, interval: u64) -> Result<Self, FrameRangeError> {
        if interval == 0 {
            return Err(FrameRangeError::ZeroInterval);
        }
        if let FrameCount::Bounded(count) = count {
            if count == 0 {
                return Err(FrameRangeError::ZeroCount);
            }
            (count - 1)
                .checked_mul(interval)
                .and_then(|span| start.checked_add(span))
                .ok_or(FrameRangeError::Overflow { start })?;
        }
        Ok(Self {
            start,
            count,
            interval,
            valid: true,
        })
    }

    /// Range covering every frame from 0 on.
    pub fn all() -> Self {
        Self {
            start: 0,
            count: FrameCount::Unlimited,
            interval: DEFAULT_INTERVAL,
            valid: true,
        }
    }

    /// Whether the range still selects frames.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Stop selecting frames (used once the capture session is torn down).
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Last frame of a bounded range, `None` when unlimited.
    pub fn end_frame(&self) -> Option<u64> {
        match self.count {
            FrameCount::Unlimited => None,
            FrameCount::Bounded(count) => Some(
                self.start
                    .saturating_add(count.saturating_sub(1).saturating_mul(self.interval)),
            ),
        }
    }

    /// Test `frame` against the range.
    pub fn check(&self, frame: u64) -> RangeCheck {
        if !self.valid || frame < self.start {
            return RangeCheck::default();
        }
        let in_range = match self.end_frame() {
            None => true,
            Some(end) => frame <= end,
        };
        RangeCheck {
            in_range,
            capture_frame: in_range && (frame - self.start) % self.interval == 0,
        }
    }

    /// True once no capture frame after `frame` remains.
    ///
    /// An invalidated range is always at its end; an unlimited range never is.
    pub fn is_end_of_range(&self, frame: u64) -> bool {
        if !self.valid {
            return true;
        }
        match self.end_frame() {
            None => false,
            Some(end) => {
                let check = self.check(frame);
                check.in_range && check.capture_frame && frame >= end
            }
        }
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.count {
            FrameCount::Unlimited => write!(f, "{}-all-{}", self.start, self.interval),
            FrameCount::Bounded(count) => write!(f, "{}-{}-{}", self.start, count, self.interval),
        }
    }
}

/// Parsed screenshot frame selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameSelection {
    /// Explicit frame numbers
    List(BTreeSet<u64>),
    /// Start/count/interval range
    Range(FrameRange),
}

impl FrameSelection {
    /// Parse a selection string.
    ///
    /// Strings equal to `all` or containing `-` use the range syntax; anything
    /// else is a comma separated list in which only words starting with a digit
    /// contribute a frame.
    pub fn parse(spec: &str) -> Result<Self, FrameRangeError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(FrameRangeError::Empty);
        }
        if Self::is_range_syntax(spec) {
            return parse_range(spec).map(FrameSelection::Range);
        }

        let frames: BTreeSet<u64> = spec
            .split(',')
            .filter_map(|word| leading_number(word.trim()))
            .collect();
        if frames.is_empty() {
            return Err(FrameRangeError::NoFrames(spec.to_string()));
        }
        Ok(FrameSelection::List(frames))
    }

    /// Whether `spec` would be parsed as a range rather than a list.
    pub fn is_range_syntax(spec: &str) -> bool {
        let spec = spec.trim();
        spec.eq_ignore_ascii_case("all") || spec.contains('-')
    }

    /// Whether `frame` should be captured.
    pub fn is_capture_frame(&self, frame: u64) -> bool {
        match self {
            FrameSelection::List(frames) => frames.contains(&frame),
            FrameSelection::Range(range) => range.check(frame).capture_frame,
        }
    }

    /// Whether any frame remains to be captured.
    pub fn is_active(&self) -> bool {
        match self {
            FrameSelection::List(frames) => !frames.is_empty(),
            FrameSelection::Range(range) => range.is_valid(),
        }
    }
}

impl fmt::Display for FrameSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSelection::List(frames) => {
                let words: Vec<String> = frames.iter().map(u64::to_string).collect();
                f.write_str(&words.join(","))
            }
            FrameSelection::Range(range) => range.fmt(f),
        }
    }
}

fn parse_range(spec: &str) -> Result<FrameRange, FrameRangeError> {
    if spec.eq_ignore_ascii_case("all") {
        return Ok(FrameRange::all());
    }

    let parts: Vec<&str> = spec.split('-').map(str::trim).collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(FrameRangeError::Malformed(spec.to_string()));
    }

    let start = parse_number(parts[0])?;
    let count = if parts[1].eq_ignore_ascii_case("all") {
        FrameCount::Unlimited
    } else {
        FrameCount::Bounded(parse_number(parts[1])?)
    };
    let interval = match parts.get(2) {
        Some(word) => parse_number(word)?,
        None => DEFAULT_INTERVAL,
    };

    FrameRange::new(start, count, interval)
}

fn parse_number(word: &str) -> Result<u64, FrameRangeError> {
    if word.is_empty() || !word.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameRangeError::InvalidNumber(word.to_string()));
    }
    word.parse()
        .map_err(|_| FrameRangeError::InvalidNumber(word.to_string()))
}

/// Leading decimal digits of `word`, if it starts with one.
fn leading_number(word: &str) -> Option<u64> {
    let digits: &str = {
        let end = word
            .bytes()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(word.len());
        &word[..end]
    };
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

//! `Range` header parsing for PLAY (RFC 2326 §12.29, §3.5–3.7).
//!
//! Three units are accepted:
//!
//! ```text
//! npt=5-10               seconds
//! npt=00:01:05.5-        hh:mm:ss[.fraction]
//! smpte=0:10:20:15-      hh:mm:ss[:frames[.subframes]], frames at 30 fps
//! clock=19961108T142300Z-19961108T143520Z
//! ```
//!
//! `now` as the first value means "live, no seeking" and yields no offsets.
//! `clock` values are absolute; they are turned into offsets from the
//! current time. `;time=` parameters are ignored.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Longest `Range` value the server will look at.
pub const MAX_RANGE_LEN: usize = 256;

const SMPTE_FRAME_RATE: f64 = 30.0;

/// A `Range` value the server refuses (457 Invalid Range).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid range: {0}")]
pub struct InvalidRange(pub String);

/// Start and end offsets requested by a PLAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayRange {
    pub start: Option<Duration>,
    pub end: Option<Duration>,
}

impl PlayRange {
    /// Parse a `Range` header value against the current wall clock.
    pub fn parse(value: &str) -> Result<Self, InvalidRange> {
        Self::parse_at(value, Utc::now())
    }

    /// Parse a `Range` header value, resolving `clock=` values against `now`.
    pub fn parse_at(value: &str, now: DateTime<Utc>) -> Result<Self, InvalidRange> {
        let invalid = || InvalidRange(value.to_string());

        if value.len() > MAX_RANGE_LEN {
            return Err(invalid());
        }

        let (unit, spec) = value.trim().split_once('=').ok_or_else(invalid)?;
        let unit = unit.trim().to_ascii_lowercase();

        let times: Vec<&str> = spec
            .split(['-', ';'])
            .map(str::trim)
            .filter(|t| !t.is_empty() && !t.starts_with("time="))
            .collect();

        let first = times.first().ok_or_else(invalid)?;
        if first.eq_ignore_ascii_case("now") {
            return Ok(Self::default());
        }
        if times.len() > 2 {
            return Err(invalid());
        }

        let parse_one = |t: &str| -> Option<Duration> {
            match unit.as_str() {
                "npt" => parse_npt(t),
                u if u.starts_with("smpte") => parse_smpte(t),
                "clock" => parse_clock(t, now),
                _ => None,
            }
        };

        let start = parse_one(*first).ok_or_else(invalid)?;
        let end = match times.get(1) {
            Some(t) => Some(parse_one(*t).ok_or_else(invalid)?),
            None => None,
        };

        Ok(Self {
            start: Some(start),
            end,
        })
    }

    /// Normalised `Range` value echoed in the PLAY response.
    pub fn header_value(&self) -> String {
        match (self.start, self.end) {
            (None, _) => "npt=now-".to_string(),
            (Some(start), None) => format!("npt={:.3}-", start.as_secs_f64()),
            (Some(start), Some(end)) => {
                format!("npt={:.3}-{:.3}", start.as_secs_f64(), end.as_secs_f64())
            }
        }
    }
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

fn parse_hms(value: &str) -> Option<(u64, u64, f64)> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let secs: f64 = parts.next()?.parse().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&secs) {
        return None;
    }
    Some((hours, minutes, secs))
}

fn parse_npt(value: &str) -> Option<Duration> {
    if value.contains(':') {
        if value.matches(':').count() != 2 {
            return None;
        }
        let (h, m, s) = parse_hms(value)?;
        seconds(h as f64 * 3600.0 + m as f64 * 60.0 + s)
    } else {
        seconds(value.parse().ok()?)
    }
}

fn parse_smpte(value: &str) -> Option<Duration> {
    let colons = value.matches(':').count();
    let (clock, frames) = match colons {
        2 => (value, 0.0),
        3 => {
            let (clock, frames) = value.rsplit_once(':')?;
            let frames: f64 = frames.parse().ok()?;
            if !(0.0..SMPTE_FRAME_RATE).contains(&frames) {
                return None;
            }
            (clock, frames)
        }
        _ => return None,
    };
    if clock.contains('.') {
        return None;
    }
    let (h, m, s) = parse_hms(clock)?;
    seconds(h as f64 * 3600.0 + m as f64 * 60.0 + s + frames / SMPTE_FRAME_RATE)
}

fn parse_clock(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let instant = ["%Y%m%dT%H%M%SZ", "%Y%m%dT%H%M%S%.fZ"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())?
        .and_utc();
    (now - instant).abs().to_std().ok()
}

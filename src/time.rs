// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions around time.
//!
//! Observation timestamps live in the `hifitime` time domain ([Epoch],
//! [Duration]); the calibration registry stores validity windows as MJD days;
//! the durable store stamps rows with unix seconds.

use std::time::{SystemTime, UNIX_EPOCH};

use hifitime::{Duration, Epoch, Unit};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref RE_TIMESTAMP: Regex = Regex::new(
        r"^(?P<y>\d{4})-(?P<mo>\d{2})-(?P<d>\d{2})T(?P<h>\d{2}):(?P<mi>\d{2}):(?P<s>\d{2})$"
    )
    .unwrap();
}

/// Current wall-clock time as unix seconds. Used for all row timestamps in the
/// durable store.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parse a `YYYY-MM-DDTHH:MM:SS` timestamp (UTC, no fractional seconds) into
/// an [Epoch].
pub(crate) fn parse_utc(s: &str) -> Result<Epoch, ParseTimestampError> {
    let caps = RE_TIMESTAMP
        .captures(s)
        .ok_or_else(|| ParseTimestampError::Unrecognised(s.to_string()))?;
    // The regex guarantees these are digit runs; only range errors remain.
    let y: i32 = caps["y"].parse().unwrap();
    let mo: u8 = caps["mo"].parse().unwrap();
    let d: u8 = caps["d"].parse().unwrap();
    let h: u8 = caps["h"].parse().unwrap();
    let mi: u8 = caps["mi"].parse().unwrap();
    let sec: u8 = caps["s"].parse().unwrap();
    if !(1..=12).contains(&mo) || !(1..=31).contains(&d) || h > 23 || mi > 59 || sec > 59 {
        return Err(ParseTimestampError::OutOfRange(s.to_string()));
    }
    Ok(Epoch::from_gregorian_utc(y, mo, d, h, mi, sec, 0))
}

/// Format an [Epoch] as `YYYY-MM-DDTHH:MM:SS`, rounded to the nearest UTC
/// second. Rounding (rather than truncating) keeps keys stable when an epoch
/// has picked up sub-second float error from MJD conversions.
pub(crate) fn format_utc(e: Epoch) -> String {
    let (y, mo, d, h, mi, s, _) =
        (e + Duration::from_f64(0.5, Unit::Second)).to_gregorian_utc();
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}")
}

/// Floor an [Epoch] to the start of its fixed-length window. The window grid
/// is anchored at UTC midnight, so window starts fall on clean UTC times and
/// every timestamp inside one window maps to the same window start.
pub(crate) fn quantise_to_window(e: Epoch, window: Duration) -> Epoch {
    let mjd = e.as_mjd_utc_days();
    let day = mjd.floor();
    // Work in whole seconds of day; MJD round-trips carry ~µs float error.
    let sec_of_day = ((mjd - day) * 86400.0).round();
    let window_s = window.to_seconds();
    let floored = (sec_of_day / window_s).floor() * window_s;
    Epoch::from_mjd_utc(day + floored / 86400.0)
}

/// The midpoint of the window starting at `start`.
pub(crate) fn window_mid(start: Epoch, window: Duration) -> Epoch {
    start + Duration::from_f64(window.to_seconds() / 2.0, Unit::Second)
}

/// An [Epoch] as MJD UTC days, the registry's validity-window domain.
pub(crate) fn epoch_to_mjd(e: Epoch) -> f64 {
    e.as_mjd_utc_days()
}

#[derive(Debug, Error)]
pub enum ParseTimestampError {
    #[error("'{0}' is not a YYYY-MM-DDTHH:MM:SS timestamp")]
    Unrecognised(String),

    #[error("timestamp '{0}' has an out-of-range field")]
    OutOfRange(String),
}

// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wall-clock timestamps shared by the recordings index, the HLS playlist
//! writer, and the ONVIF client's WS-Security headers.

use crate::err;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The zone used for directory-layout timestamps (`<YYYY-MM-DD>/<HH>`).
///
/// Assigned once from `jiff::tz::TimeZone::system()` at startup; tests set
/// it to a known political zone so path layout is deterministic.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE
        .get()
        .expect("global zone should be initialized")
        .clone()
}

/// A UTC timestamp, serialized as RFC 3339 and stored in the recordings
/// index as integer unix seconds.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Timestamp(pub jiff::Timestamp);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(jiff::Timestamp::now())
    }

    pub fn from_unix_secs(secs: i64) -> Result<Self, Error> {
        jiff::Timestamp::from_second(secs)
            .map(Timestamp)
            .map_err(|e| err!(ConfigInvalid, msg("timestamp out of range"), source(e)))
    }

    pub fn unix_secs(&self) -> i64 {
        self.0.as_second()
    }

    /// Splits into the `(date, hour)` pair used for the on-disk recording
    /// layout `<stream>/<YYYY-MM-DD>/<HH>/recording_<epoch>.mp4`.
    pub fn date_hour(&self) -> (String, u8) {
        let zoned = self.0.to_zoned(global_zone());
        (
            format!("{}", zoned.strftime("%Y-%m-%d")),
            zoned.hour() as u8,
        )
    }

    /// Millisecond-precision RFC 3339 form required by WS-Security's
    /// `wsu:Created` element and WS-Discovery's probe timestamps.
    pub fn to_onvif(self) -> String {
        format!("{}", self.0.strftime("%Y-%m-%dT%H:%M:%S.%3fZ"))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<jiff::Timestamp>()
            .map(Timestamp)
            .map_err(|e| err!(ConfigInvalid, msg("invalid timestamp {s:?}"), source(e)))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl std::ops::Sub for Timestamp {
    type Output = std::time::Duration;
    fn sub(self, rhs: Timestamp) -> std::time::Duration {
        self.0
            .duration_since(rhs.0)
            .try_into()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

pub mod testutil {
    pub fn init_zone() {
        super::init_zone(|| {
            jiff::tz::TimeZone::get("America/Los_Angeles")
                .expect("America/Los_Angeles should exist")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_rfc3339() {
        let t = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let s = t.to_string();
        let parsed: Timestamp = s.parse().unwrap();
        assert_eq!(t, parsed);
    }

    #[test]
    fn date_hour_uses_global_zone() {
        testutil::init_zone();
        // 2023-11-14T22:13:20Z is 2023-11-14T14:13:20-08:00 in Los Angeles.
        let t = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let (date, hour) = t.date_hour();
        assert_eq!(date, "2023-11-14");
        assert_eq!(hour, 14);
    }

    #[test]
    fn onvif_format_has_millis_and_zulu() {
        let t = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        assert_eq!(t.to_onvif(), "2023-11-14T22:13:20.000Z");
    }
}

// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

// Error taxonomy shared by every core component.
//
// The shape follows the propagation policy in the core design: callers match
// on `ErrorKind` to decide whether to retry locally, surface to the
// supervisor/shutdown coordinator, or simply report NotFound/Conflict to an
// API caller. `Error` carries an optional human-readable message and an
// optional source error for logging; it is not meant to be pattern-matched
// beyond its `ErrorKind`.

use std::fmt;

/// Classification of an error, matching the propagation policy of the core
/// design.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // --- Transient: recovered locally via reconnect or retry. ---
    OpenFailed,
    ReadError,
    PacketTimeout,
    SocketError,

    // --- Fatal: surfaces to the supervisor/shutdown coordinator; ends the
    // stream until an operator or the watchdog intervenes. ---
    NoVideoTrack,
    SinkFatal,
    ConfigInvalid,

    // --- NotFound: returned to callers; never causes a worker to exit. ---
    StreamNotFound,
    RecordingNotFound,
    SegmentNotFound,

    // --- Conflict: returned to start/stop-style APIs. ---
    NameInUse,
    AlreadyStopping,
    /// The supervisor table is full; `start` has no room for another stream.
    NoCapacity,
    /// `stop` didn't observe worker exit within its grace window. The
    /// worker is still torn down asynchronously; this is a timeout on the
    /// caller's wait, not a failure to stop.
    StopTimeout,

    /// A clip/export query matched zero recordings.
    NoCoverage,

    /// Always benign: a cooperative cancellation observed a shutdown
    /// or stop request.
    Cancelled,

    /// A filesystem operation failed; `Error::path` carries the path.
    Io,

    /// Anything that doesn't fit the above. Used sparingly.
    Internal,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::OpenFailed
                | ErrorKind::ReadError
                | ErrorKind::PacketTimeout
                | ErrorKind::SocketError
        )
    }

    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::NoVideoTrack | ErrorKind::SinkFatal | ErrorKind::ConfigInvalid
        )
    }

    pub fn is_not_found(self) -> bool {
        matches!(
            self,
            ErrorKind::StreamNotFound | ErrorKind::RecordingNotFound | ErrorKind::SegmentNotFound
        )
    }

    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            ErrorKind::NameInUse | ErrorKind::AlreadyStopping | ErrorKind::StopTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::OpenFailed => "open failed",
            ErrorKind::ReadError => "read error",
            ErrorKind::PacketTimeout => "packet timeout",
            ErrorKind::SocketError => "socket error",
            ErrorKind::NoVideoTrack => "no video track",
            ErrorKind::SinkFatal => "sink fatal",
            ErrorKind::ConfigInvalid => "invalid configuration",
            ErrorKind::StreamNotFound => "stream not found",
            ErrorKind::RecordingNotFound => "recording not found",
            ErrorKind::SegmentNotFound => "segment not found",
            ErrorKind::NameInUse => "name in use",
            ErrorKind::AlreadyStopping => "already stopping",
            ErrorKind::NoCapacity => "supervisor table full",
            ErrorKind::StopTimeout => "stop timed out",
            ErrorKind::NoCoverage => "no recordings cover the requested range",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "i/o error",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    path: Option<std::path::PathBuf>,
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            path: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// A `Display`-able view of this error plus its full source chain, one
    /// cause per line. Intended for log fields, e.g. `warn!(exception =
    /// %e.chain(), "...")`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }

    pub fn io(path: impl Into<std::path::PathBuf>, cause: std::io::Error) -> Self {
        Error::new(ErrorKind::Io).with_path(path).with_source(cause)
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = self
            .0
            .source
            .as_deref()
            .map(|e| e as &dyn std::error::Error);
        while let Some(c) = cause {
            write!(f, "\ncaused by: {c}")?;
            cause = c.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(p) = &self.path {
            write!(f, " ({})", p.display())?;
        }
        if let Some(m) = &self.msg {
            write!(f, ": {m}")?;
        } else if let Some(s) = &self.source {
            write!(f, ": {s}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io).with_source(e)
    }
}

/// Extension methods for tagging a foreign `Result` with an `ErrorKind`.
pub trait ResultExt<T> {
    fn err_kind(self, kind: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn err_kind(self, kind: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(kind).with_source(e))
    }
}

/// Builds an [`Error`] with a kind and, optionally, a `msg(...)` format
/// string and/or a `source(expr)` cause, in either order.
///
/// ```ignore
/// err!(OpenFailed, msg("couldn't reach {url}"))
/// err!(ReadError, source(io_err))
/// err!(PacketTimeout, msg("no packet for {secs}s"), source(io_err))
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_msg(format!($($msg)*))
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_source($src)
    };
    ($kind:ident, msg($($msg:tt)*), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($($msg)*))
            .with_source($src)
    };
}

/// Like [`err!`], but returns immediately with `Err(...)`.
#[macro_export]
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::err!($($args)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_msg() {
        let e = err!(OpenFailed, msg("could not connect to {}", "cam1"));
        assert_eq!(e.kind(), ErrorKind::OpenFailed);
        assert_eq!(e.to_string(), "open failed: could not connect to cam1");
    }

    #[test]
    fn chain_walks_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = err!(SinkFatal, msg("segment write failed"), source(io));
        let chained = e.chain().to_string();
        assert!(chained.contains("segment write failed"));
        assert!(chained.contains("disk full"));
    }

    #[test]
    fn taxonomy_classification() {
        assert!(ErrorKind::OpenFailed.is_transient());
        assert!(ErrorKind::SinkFatal.is_fatal());
        assert!(ErrorKind::StreamNotFound.is_not_found());
        assert!(ErrorKind::NameInUse.is_conflict());
        assert!(!ErrorKind::Cancelled.is_transient());
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Downstream-facing diagnostics. Per-entry problems become `Warning` records
// (and log lines); only CwdError and a hard parser abort are fatal and travel
// through `UnpackError` instead.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

// Logging
use log::{info, warn};
// JSON report
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarnCode {
    #[serde(rename = "ENTRY_ERROR")]
    EntryError,
    #[serde(rename = "ENTRY_INFO")]
    EntryInfo,
    #[serde(rename = "ENTRY_UNSUPPORTED")]
    EntryUnsupported,
    #[serde(rename = "BAD_ARCHIVE")]
    BadArchive,
    #[serde(rename = "ABORT")]
    Abort,
}

impl WarnCode {
    /// BAD_ARCHIVE and ABORT mark the whole stream as unusable; everything
    /// else the extraction survives.
    pub fn recoverable(self) -> bool {
        !matches!(self, WarnCode::BadArchive | WarnCode::Abort)
    }
}

impl fmt::Display for WarnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WarnCode::EntryError       => "ENTRY_ERROR",
            WarnCode::EntryInfo        => "ENTRY_INFO",
            WarnCode::EntryUnsupported => "ENTRY_UNSUPPORTED",
            WarnCode::BadArchive       => "BAD_ARCHIVE",
            WarnCode::Abort            => "ABORT"
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Warning {
    pub code: WarnCode,
    pub message: String,
    /// Archive path of the entry the warning is about, if any.
    pub path: Option<String>,
    pub recoverable: bool,
}

/// Lifecycle notifications, emitted exactly once and in this order after the
/// upstream is done and no operations remain in flight.
pub const LIFECYCLE: [&str; 3] = ["pre-finish", "finish", "end"];

/// Shared warning sink. Mutated from inside reservations; a plain mutex is
/// fine, this is not a hot path.
#[derive(Debug, Default)]
pub struct Events {
    warnings: Mutex<Vec<Warning>>,
    lifecycle: Mutex<Vec<&'static str>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, code: WarnCode, message: impl Into<String>, path: Option<&Path>) {
        let message = message.into();
        let path = path.map(|p| p.to_string_lossy().into_owned());
        match &path {
            Some(p) => warn!("{}: {} ('{}')", code, message, p),
            None => warn!("{}: {}", code, message),
        }
        let mut sink = self.warnings.lock().unwrap_or_else(|e| e.into_inner());
        sink.push(Warning {
            code,
            message,
            path,
            recoverable: code.recoverable(),
        });
    }

    /// Fire `pre-finish`, `finish`, `end`. The caller guarantees this runs
    /// once, after the tracker reached zero with the upstream ended.
    pub fn finish(&self) {
        let mut fired = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        for stage in LIFECYCLE {
            info!("{}", stage);
            fired.push(stage);
        }
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn lifecycle(&self) -> Vec<&'static str> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

//! Leveled stderr logging for the devnet orchestrator.
//!
//! Records go to stderr as text or JSON lines. Long-running waits can emit
//! inline progress fragments (`Mined 12/46 ...`) that stay on one line until
//! the next regular record or an explicit [`progress_end`].

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Error,
            2 => Self::Warn,
            4 => Self::Debug,
            5 => Self::Trace,
            _ => Self::Info,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

/// Kind of a recorded line: a full record or an inline progress fragment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordKind {
    Line,
    Progress,
}

#[derive(Clone, Debug)]
pub struct Record {
    pub kind: RecordKind,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static JSON: AtomicBool = AtomicBool::new(false);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static STDERR: AtomicBool = AtomicBool::new(true);

// Set while a progress fragment has been written without a trailing newline.
static PROGRESS_OPEN: AtomicBool = AtomicBool::new(false);

static RECORDER_LIMIT: AtomicUsize = AtomicUsize::new(0);
static RECORDER: OnceLock<Mutex<Vec<Record>>> = OnceLock::new();

// Serializes writers so a progress fragment and a record never interleave.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

pub fn init(config: LogConfig) {
    LEVEL.store(config.level as u8, Ordering::Relaxed);
    JSON.store(matches!(config.format, Format::Json), Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn level() -> Level {
    Level::from_u8(LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

pub fn set_stderr_enabled(enabled: bool) {
    STDERR.store(enabled, Ordering::Relaxed);
}

/// Keeps up to `limit` records in memory. Used by tests to assert on output.
pub fn start_recording(limit: usize) {
    RECORDER_LIMIT.store(limit, Ordering::Relaxed);
    let recorder = RECORDER.get_or_init(|| Mutex::new(Vec::new()));
    if let Ok(mut guard) = recorder.lock() {
        guard.clear();
    }
}

pub fn stop_recording() {
    RECORDER_LIMIT.store(0, Ordering::Relaxed);
}

pub fn recorded() -> Vec<Record> {
    RECORDER
        .get()
        .and_then(|recorder| recorder.lock().ok().map(|guard| guard.clone()))
        .unwrap_or_default()
}

pub fn log(level: Level, target: &'static str, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    emit(RecordKind::Line, level, target, args);
}

/// Writes an inline fragment without a newline (text format).
pub fn progress(target: &'static str, args: fmt::Arguments<'_>) {
    if !enabled(Level::Info) {
        return;
    }
    emit(RecordKind::Progress, Level::Info, target, args);
}

/// Terminates an open progress line, if any.
pub fn progress_end() {
    let _guard = WRITE_LOCK.lock();
    if PROGRESS_OPEN.swap(false, Ordering::Relaxed) && STDERR.load(Ordering::Relaxed) {
        let _ = writeln!(io::stderr().lock());
    }
}

fn emit(kind: RecordKind, level: Level, target: &'static str, args: fmt::Arguments<'_>) {
    let _guard = WRITE_LOCK.lock();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let json = JSON.load(Ordering::Relaxed);
    let limit = RECORDER_LIMIT.load(Ordering::Relaxed);
    let msg = args.to_string();

    if STDERR.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        if json {
            let line = json!({
                "ts_ms": u64::try_from(now.as_millis()).unwrap_or(u64::MAX),
                "level": level.as_str(),
                "target": target,
                "progress": kind == RecordKind::Progress,
                "msg": msg,
            });
            let _ = writeln!(out, "{line}");
        } else {
            let open = PROGRESS_OPEN.load(Ordering::Relaxed);
            match kind {
                RecordKind::Progress => {
                    if !open && TIMESTAMPS.load(Ordering::Relaxed) {
                        let _ = write!(out, "{} ", UtcTimestamp(now));
                    }
                    let _ = write!(out, "{msg}");
                    let _ = out.flush();
                    PROGRESS_OPEN.store(true, Ordering::Relaxed);
                }
                RecordKind::Line => {
                    if open {
                        let _ = writeln!(out);
                        PROGRESS_OPEN.store(false, Ordering::Relaxed);
                    }
                    if TIMESTAMPS.load(Ordering::Relaxed) {
                        let _ = write!(out, "{} ", UtcTimestamp(now));
                    }
                    let _ = writeln!(out, "{} {}: {msg}", level.as_str(), target);
                }
            }
        }
    }

    if limit > 0 {
        if let Some(recorder) = RECORDER.get() {
            if let Ok(mut guard) = recorder.lock() {
                if guard.len() < limit {
                    guard.push(Record {
                        kind,
                        level,
                        target,
                        msg,
                    });
                }
            }
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

#[macro_export]
macro_rules! progress {
    ($($arg:tt)*) => {{
        $crate::progress(module_path!(), format_args!($($arg)*));
    }};
}

/// RFC 3339 UTC rendering of a duration since the unix epoch.
struct UtcTimestamp(Duration);

impl fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let (year, month, day) = date_from_unix_days((secs / 86_400) as i64);
        let rem = secs % 86_400;
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            rem / 3600,
            (rem / 60) % 60,
            rem % 60,
            self.0.subsec_millis()
        )
    }
}

// Proleptic Gregorian conversion (Hinnant's days-to-civil).
fn date_from_unix_days(days: i64) -> (i64, u32, u32) {
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * month_index + 2) / 5 + 1) as u32;
    let month = if month_index < 10 {
        month_index + 3
    } else {
        month_index - 9
    } as u32;
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

/// Files larger than this are cut down to their tail by [`shrink_file`].
pub const SHRINK_THRESHOLD_BYTES: u64 = 10 * 1_000_000;
/// Bytes kept from the end of a shrunk log file.
pub const SHRINK_KEEP_BYTES: u64 = 200 * 1_000;

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
    /// Mirror every line to stderr even when a log file is open.
    pub print_to_console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            print_to_console: true,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_STDERR_ENABLED: AtomicBool = AtomicBool::new(true);

struct FileSink {
    path: PathBuf,
    file: File,
}

static LOG_FILE: OnceLock<Mutex<Option<FileSink>>> = OnceLock::new();
static LOG_FILE_REOPEN: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub msg: String,
}

static LOG_CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static LOG_CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
    LOG_STDERR_ENABLED.store(config.print_to_console, Ordering::Relaxed);
}

/// Starts appending log lines to `path`, replacing any previously opened file.
pub fn open_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let slot = LOG_FILE.get_or_init(|| Mutex::new(None));
    let mut guard = slot
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
    *guard = Some(FileSink {
        path: path.to_path_buf(),
        file,
    });
    LOG_FILE_REOPEN.store(false, Ordering::Relaxed);
    Ok(())
}

/// Flushes and drops the log file. Later lines only reach stderr (if enabled).
pub fn close_file() {
    let Some(slot) = LOG_FILE.get() else {
        return;
    };
    if let Ok(mut guard) = slot.lock() {
        if let Some(mut sink) = guard.take() {
            let _ = sink.file.flush();
        }
    }
}

pub fn log_file_path() -> Option<PathBuf> {
    let slot = LOG_FILE.get()?;
    let guard = slot.lock().ok()?;
    guard.as_ref().map(|sink| sink.path.clone())
}

/// Asks the logger to reopen its file before writing the next line. Safe to call from a
/// signal task; the reopen itself happens on the logging thread.
pub fn request_reopen() {
    LOG_FILE_REOPEN.store(true, Ordering::Relaxed);
}

/// Cuts `path` down to its last [`SHRINK_KEEP_BYTES`] once it grows past
/// [`SHRINK_THRESHOLD_BYTES`]. Returns whether the file was rewritten.
pub fn shrink_file(path: &Path) -> io::Result<bool> {
    let len = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if len <= SHRINK_THRESHOLD_BYTES {
        return Ok(false);
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(len - SHRINK_KEEP_BYTES))?;
    let mut tail = Vec::with_capacity(SHRINK_KEEP_BYTES as usize);
    file.read_to_end(&mut tail)?;
    drop(file);
    fs::write(path, &tail)?;
    Ok(true)
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        disable_capture();
        return;
    }
    LOG_CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    LOG_CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(4096))));
    LOG_CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_capture() {
    LOG_CAPTURE_ENABLED.store(false, Ordering::Relaxed);
}

pub fn clear_captured_logs() {
    let Some(buf) = LOG_CAPTURE.get() else {
        return;
    };
    if let Ok(mut guard) = buf.lock() {
        guard.clear();
    }
}

pub fn set_stderr_enabled(enabled: bool) {
    LOG_STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(buf) = LOG_CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = buf.lock() else {
        return Vec::new();
    };
    let len = guard.len();
    let start = len.saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }

    let capture_enabled = LOG_CAPTURE_ENABLED.load(Ordering::Relaxed);
    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        0 => Format::Text,
        1 => Format::Json,
        _ => Format::Text,
    };
    let timestamps = LOG_TIMESTAMPS.load(Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let msg = args.to_string();

    let rendered = match format {
        Format::Text => {
            let mut out = String::with_capacity(msg.len() + 48);
            if timestamps {
                let ts = Timestamp {
                    unix_seconds: now.as_secs(),
                    millis: now.subsec_millis(),
                };
                out.push_str(&format!("{ts} "));
            }
            out.push_str(&format!("{} {}: {msg}", level.as_str(), target));
            out
        }
        Format::Json => json!({
            "ts_ms": ts_ms,
            "level": level.as_str(),
            "target": target,
            "file": file,
            "line": line,
            "msg": msg,
        })
        .to_string(),
    };

    let wrote_file = write_file_line(&rendered);
    if LOG_STDERR_ENABLED.load(Ordering::Relaxed) || !wrote_file {
        let mut out = io::stderr().lock();
        let _ = writeln!(out, "{rendered}");
    }

    if capture_enabled {
        let Some(buf) = LOG_CAPTURE.get() else {
            return;
        };
        let Ok(mut guard) = buf.lock() else {
            return;
        };
        let cap = LOG_CAPTURE_CAPACITY.load(Ordering::Relaxed);
        if cap == 0 {
            return;
        }
        guard.push_back(CapturedLog {
            ts_ms,
            level,
            target,
            file,
            line,
            msg,
        });
        while guard.len() > cap {
            let _ = guard.pop_front();
        }
    }
}

fn write_file_line(rendered: &str) -> bool {
    let Some(slot) = LOG_FILE.get() else {
        return false;
    };
    let Ok(mut guard) = slot.lock() else {
        return false;
    };
    let Some(sink) = guard.as_mut() else {
        return false;
    };
    if LOG_FILE_REOPEN.swap(false, Ordering::Relaxed) {
        // logrotate moved the file away; start a fresh one at the same path
        if let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink.path)
        {
            sink.file = file;
        }
    }
    writeln!(sink.file, "{rendered}").is_ok()
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
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

struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let days = (self.unix_seconds / SECS_PER_DAY) as i64;
        let secs_of_day = self.unix_seconds % SECS_PER_DAY;
        let hour = secs_of_day / 3600;
        let minute = (secs_of_day % 3600) / 60;
        let second = secs_of_day % 60;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z",
            millis = self.millis
        )
    }
}

fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    // Howard Hinnant's days-to-civil conversion.
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = y + if m <= 2 { 1 } else { 0 };
    (year, m, d)
}

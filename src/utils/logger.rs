use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// How rolled log files are split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
}

impl LogRotation {
    fn parse(s: &str) -> Self {
        match s {
            "minutely" => Self::Minutely,
            "hourly" => Self::Hourly,
            _ => Self::Daily,
        }
    }
}

/// Tracing setup for controller processes.
///
/// Knobs come from the environment: `ENSEMBLE_LOG` (level),
/// `ENSEMBLE_LOG_DIR`, `ENSEMBLE_LOG_PREFIX`, `ENSEMBLE_LOG_ROTATION`
/// and `ENSEMBLE_LOG_KEEP`. Without a directory, output goes to stdout.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub prefix: String,
    pub rotation: LogRotation,
    pub keep_files: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            dir: None,
            prefix: "ensemble".into(),
            rotation: LogRotation::Daily,
            keep_files: 3,
        }
    }
}

impl LoggerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: std::env::var("ENSEMBLE_LOG").unwrap_or(defaults.level),
            dir: std::env::var("ENSEMBLE_LOG_DIR").ok().map(PathBuf::from),
            prefix: std::env::var("ENSEMBLE_LOG_PREFIX").unwrap_or(defaults.prefix),
            rotation: std::env::var("ENSEMBLE_LOG_ROTATION")
                .map(|s| LogRotation::parse(&s))
                .unwrap_or(defaults.rotation),
            keep_files: std::env::var("ENSEMBLE_LOG_KEEP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.keep_files),
        }
    }

    /// Install the global subscriber. When logging to files the
    /// returned guard must stay alive for the life of the process.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.dir.as_ref() else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            return Ok(None);
        };

        let rotation = match self.rotation {
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        };

        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(rotation)
            .max_log_files(self.keep_files)
            .filename_prefix(self.prefix.as_str())
            .build(dir)
            .with_context(|| format!("cannot open log directory {}", dir.display()))?;

        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .try_init();

        tracing::info!(
            "logging to {} (prefix {}, rotation {:?})",
            dir.display(),
            self.prefix,
            self.rotation
        );
        Ok(Some(guard))
    }
}

const NEVER: u64 = u64::MAX;

/// Call-site rate limiter for log statements on hot or foreign threads.
///
/// Keymaster callbacks are required to stay lock-free, so this is
/// atomics only: one message per interval wins the compare-exchange and
/// may log; it also learns how many calls were suppressed since the
/// previous winner.
pub struct Throttle {
    origin: Instant,
    interval_ms: u64,
    last_ms: AtomicU64,
    suppressed: AtomicU64,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(NEVER),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(suppressed)` when this call may log, `None` otherwise.
    #[inline]
    pub fn admit(&self) -> Option<u64> {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        let due = last == NEVER || now.saturating_sub(last) >= self.interval_ms;

        if due
            && self
                .last_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }

        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}

/// Throttled logging; the level is an identifier (`error`, `warn`).
/// Each expansion owns one [`Throttle`] for its call site.
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        static THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> =
            std::sync::OnceLock::new();
        match THROTTLE
            .get_or_init(|| $crate::utils::logger::Throttle::new($interval))
            .admit()
        {
            Some(0) => tracing::$level!($($arg)*),
            Some(suppressed) => tracing::$level!(suppressed, $($arg)*),
            None => {}
        }
    }};
}

#[macro_export]
macro_rules! warn_throttled {
    ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn, $interval, $($arg)*) };
}

#[macro_export]
macro_rules! error_throttled {
    ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(error, $interval, $($arg)*) };
}

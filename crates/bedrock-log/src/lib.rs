//! A minimal, zero-dependency logging crate for the bedrock substrate.
//!
//! Diagnostics go to stderr with the level, the module path of the call
//! site and, unless disabled, ANSI colors. The level is process-wide and
//! can be taken from the `BEDROCK_LOG` environment variable.
//!
//! # Example
//!
//! ```
//! use bedrock_log::{debug, error, info, warn, Level};
//!
//! bedrock_log::set_level(Level::Debug);
//!
//! let used = 128;
//! info!("arena holds {} bytes", used);
//! debug!("slots: {:?}", [1, 2, 3]);
//! warn!("pool block nearly full");
//! error!("could not allocate from arena");
//! ```

use std::fmt::{self, Arguments};
use std::io::Write;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Environment variable consulted by [`init_from_env`].
pub const LOG_ENV: &str = "BEDROCK_LOG";

/// Log levels, ordered from most severe (Error) to least severe (Trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Fatal conditions and failed operations.
    Error = 0,
    /// Suspicious but recoverable situations.
    Warn = 1,
    /// Lifecycle events.
    Info = 2,
    /// Container and allocator internals.
    Debug = 3,
    /// Per-allocation detail.
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a log level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {}", self.0)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, ignoring case.
    ///
    /// ```
    /// use bedrock_log::Level;
    ///
    /// assert_eq!("error".parse(), Ok(Level::Error));
    /// assert_eq!("Trace".parse(), Ok(Level::Trace));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// The process-wide logger.
///
/// Level and color settings are atomics, so the logger can be consulted
/// from any thread without locking.
pub struct Logger {
    level: AtomicU8,
    color: AtomicBool,
}

impl Logger {
    const fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            color: AtomicBool::new(true),
        }
    }

    /// Sets the minimum level that is emitted.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current minimum level.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Enables or disables ANSI colors.
    pub fn set_color(&self, enabled: bool) {
        self.color.store(enabled, Ordering::Relaxed);
    }

    /// Returns true if a message at `level` would be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    fn write(&self, level: Level, target: &str, args: Arguments) {
        const RESET: &str = "\x1b[0m";

        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        // A failed diagnostic write has nowhere better to go.
        let _ = if self.color.load(Ordering::Relaxed) {
            writeln!(out, "{}[{level}]{RESET} {target}: {args}", level.color_code())
        } else {
            writeln!(out, "[{level}] {target}: {args}")
        };
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it at `Level::Warn` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the minimum level of the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the minimum level from a level name.
///
/// ```
/// bedrock_log::set_level_from_str("debug").unwrap();
/// assert_eq!(bedrock_log::get_logger().level(), bedrock_log::Level::Debug);
/// ```
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Configures the global logger from the environment.
///
/// `BEDROCK_LOG` selects the level and `NO_COLOR` (any value) disables
/// colors. An unparsable `BEDROCK_LOG` leaves the level unchanged and is
/// returned as an error so the caller can report it.
pub fn init_from_env() -> Result<(), ParseLevelError> {
    let logger = get_logger();
    if std::env::var_os("NO_COLOR").is_some() {
        logger.set_color(false);
    }
    match std::env::var(LOG_ENV) {
        Ok(value) => set_level_from_str(&value),
        Err(_) => Ok(()),
    }
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    let logger = get_logger();
    if logger.enabled(level) {
        logger.write(level, target, args);
    }
}

/// Returns true if the global logger emits messages at the given level.
///
/// Useful to skip building expensive diagnostics.
#[macro_export]
macro_rules! log_enabled {
    ($level:expr) => {
        $crate::get_logger().enabled($level)
    };
}

/// Logs a message at an explicit level, tagged with the caller's module path.
///
/// ```
/// use bedrock_log::{log, Level};
///
/// log!(level: Level::Info, "table grew to {} slots", 128);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Logs at the Error level.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at the Warn level.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at the Info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at the Debug level.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at the Trace level.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}

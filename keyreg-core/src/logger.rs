//! Routes registry log records to a host-provided sink.
//!
//! The registry logs through the `log` facade. A host that has no `log`
//! implementation of its own can install a [`Logger`] with [`set_logger`].
//! Each record reaches the sink tagged with the registry component that
//! emitted it (`registry`, `fs`, `codec`, ...), so hosts can route rotation
//! and re-key events separately from file-level diagnostics.

use std::sync::{Arc, OnceLock};

const CRATE_NAME: &str = "keyreg_core";

/// A sink for registry log messages.
///
/// # Examples
///
/// ```rust
/// use keyreg_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, component: &str, message: &str) {
///         eprintln!("[{level:?}] {component}: {message}");
///     }
/// }
/// ```
pub trait Logger: Sync + Send {
    /// Logs `message` from `component` at `level`.
    ///
    /// `component` is the registry module that emitted the record, or the
    /// `log` target for records from other crates.
    fn log(&self, level: LogLevel, component: &str, message: &str);
}

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Very low priority, often extremely detailed messages.
    Trace,
    /// Replay summaries and open/close events.
    Debug,
    /// Progress of the registry: creation, rotation, re-keying.
    Info,
    /// Potentially harmful situations, such as duplicate records.
    Warn,
    /// Errors.
    Error,
}

struct LogBridge;

impl log::Log for LogBridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if let Some(sink) = LOGGER_INSTANCE.get() {
            forward(sink.as_ref(), record);
        }
    }

    fn flush(&self) {}
}

/// Hands `record` to `sink` with its registry component.
///
/// Debug and trace output from other crates is dropped.
fn forward(sink: &dyn Logger, record: &log::Record<'_>) {
    let level = log_level(record.level());
    let message = record.args().to_string();
    match component(record) {
        Some(component) => sink.log(level, component, &message),
        None if level <= LogLevel::Debug => {}
        None => sink.log(level, record.target(), &message),
    }
}

/// Registry module a record came from, `None` for other crates.
fn component<'a>(record: &'a log::Record<'_>) -> Option<&'a str> {
    let module_path = record.module_path()?;
    if module_path == CRATE_NAME {
        return Some(module_path);
    }
    module_path.strip_prefix(CRATE_NAME)?.strip_prefix("::")
}

const fn log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

const fn level_filter(level: LogLevel) -> log::LevelFilter {
    match level {
        LogLevel::Error => log::LevelFilter::Error,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Trace => log::LevelFilter::Trace,
    }
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs `logger` as the process-wide sink for registry logs.
///
/// Records less severe than `max_level` are discarded before formatting.
///
/// # Errors
///
/// Fails if a `log` implementation is already installed in this process,
/// including one from an earlier call. The previous sink stays in place.
pub fn set_logger(
    logger: Arc<dyn Logger>,
    max_level: LogLevel,
) -> Result<(), log::SetLoggerError> {
    static BRIDGE: LogBridge = LogBridge;
    log::set_logger(&BRIDGE)?;
    LOGGER_INSTANCE.get_or_init(|| logger);
    log::set_max_level(level_filter(max_level));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingLogger {
        messages: Mutex<Vec<(LogLevel, String, String)>>,
    }

    impl CapturingLogger {
        fn contains(&self, level: LogLevel, component: &str, needle: &str) -> bool {
            self.messages
                .lock()
                .expect("lock")
                .iter()
                .any(|(l, c, m)| *l == level && c == component && m.contains(needle))
        }
    }

    impl Logger for CapturingLogger {
        fn log(&self, level: LogLevel, component: &str, message: &str) {
            self.messages.lock().expect("lock").push((
                level,
                component.to_string(),
                message.to_string(),
            ));
        }
    }

    fn emit(sink: &CapturingLogger, level: log::Level, module_path: &str, message: &str) {
        forward(
            sink,
            &log::Record::builder()
                .level(level)
                .target(module_path)
                .module_path(Some(module_path))
                .args(format_args!("{message}"))
                .build(),
        );
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(log_level(log::Level::Error), LogLevel::Error);
        assert_eq!(log_level(log::Level::Warn), LogLevel::Warn);
        assert_eq!(log_level(log::Level::Trace), LogLevel::Trace);
        assert_eq!(level_filter(LogLevel::Info), log::LevelFilter::Info);
        assert!(LogLevel::Debug < LogLevel::Warn);
    }

    #[test]
    fn test_records_are_tagged_with_component() {
        let sink = CapturingLogger::default();
        emit(&sink, log::Level::Info, "keyreg_core::registry", "rotated to data key 3");
        emit(&sink, log::Level::Warn, "keyreg_core::fs", "could not roll back");
        emit(&sink, log::Level::Debug, "keyreg_core", "crate root");

        assert!(sink.contains(LogLevel::Info, "registry", "rotated to data key 3"));
        assert!(sink.contains(LogLevel::Warn, "fs", "could not roll back"));
        assert!(sink.contains(LogLevel::Debug, "keyreg_core", "crate root"));
    }

    #[test]
    fn test_verbose_records_from_other_crates_are_dropped() {
        let sink = CapturingLogger::default();
        emit(&sink, log::Level::Debug, "rand::rngs", "reseeding");
        emit(&sink, log::Level::Trace, "keyreg_core_ext", "lookalike crate");
        emit(&sink, log::Level::Warn, "rand::rngs", "entropy source slow");

        let messages = sink.messages.lock().expect("lock");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, LogLevel::Warn);
        assert_eq!(messages[0].1, "rand::rngs");
    }

    #[test]
    fn test_installed_logger_receives_registry_events() {
        let capture = Arc::new(CapturingLogger::default());
        set_logger(capture.clone(), LogLevel::Trace).expect("first install");
        assert!(set_logger(Arc::new(CapturingLogger::default()), LogLevel::Info).is_err());

        let dir = tempfile::tempdir().expect("tempdir");
        let options = crate::RegistryOptions::new(dir.path()).with_encryption_key(vec![1u8; 16]);
        let registry = crate::KeyRegistry::open(&options).expect("open");
        registry.latest_data_key_at(1_700_000_000).expect("latest");

        assert!(capture.contains(LogLevel::Info, "registry", "rotated to data key 1"));
        assert!(capture.contains(LogLevel::Debug, "registry", "replayed 0 data keys"));
    }
}

//! Log filter selection, the rolling file sink under `<data_dir>/logs`, and the crash
//! artifact panic hook.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "vidfill";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Targets carrying forwarded ffmpeg stderr. Kept at `debug` in the file sink so a
/// failed decode or encode can be diagnosed after the fact.
const FFMPEG_STDERR_TARGETS: [&str; 2] = ["ffmpeg_stderr", "ffmpeg_encode_stderr"];

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Disabled {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstall {
    Installed { crash_dir: PathBuf },
    AlreadyInstalled { crash_dir: PathBuf },
    Skipped { reason: String },
}

/// Pick console and file filters.
///
/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the default. The
/// noise filter only applies when the user did not ask for something explicitly.
pub fn compose_log_filters(options: &LoggingOptions) -> LogFilters {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    let console_filter = merge_noise_filter(&options.noise_filter, &user_filter, implicit);
    let file_filter = if implicit {
        let file_noise = rewrite_noise_filter_for_file(&options.noise_filter);
        merge_noise_filter(&file_noise, &user_filter, true)
    } else {
        user_filter.clone()
    };

    LogFilters {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn select_user_filter(options: &LoggingOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise: bool) -> String {
    if include_noise && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

fn rewrite_noise_filter_for_file(noise_filter: &str) -> String {
    let mut directives = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for directive in noise_filter
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
    {
        let target = directive
            .split_once('=')
            .map(|(target, _)| target.trim())
            .filter(|target| FFMPEG_STDERR_TARGETS.contains(target));
        match target {
            Some(target) => {
                if !seen.contains(&target) {
                    directives.push(format!("{target}=debug"));
                    seen.push(target);
                }
            }
            None => directives.push(directive.to_string()),
        }
    }

    for target in FFMPEG_STDERR_TARGETS {
        if !seen.contains(&target) {
            directives.push(format!("{target}=debug"));
        }
    }

    directives.join(",")
}

/// Daily-rotated `vidfill.*.log` files under `<data_dir>/logs`, or the reason there
/// are none.
pub fn build_file_sink(options: &LoggingOptions) -> FileSink {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::Disabled {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSink::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSink::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Install a process-wide hook that writes `panic-*.log` under `<data_dir>/logs/crash`
/// before delegating to the previous hook. Idempotent.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstall {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstall::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstall::Skipped {
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstall::Skipped {
            reason: format!(
                "failed to create crash artifact directory {}: {error}",
                crash_dir.display()
            ),
        };
    }

    let _guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstall::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        write_crash_artifact_or_warn(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstall::Installed { crash_dir }
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: String,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let (backtrace_policy, backtrace) = capture_backtrace();
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "<unknown>".to_string());

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location,
            payload: payload_to_string(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }
}

fn write_crash_artifact_or_warn(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the artifact must not recurse into this hook.
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_artifact(crash_dir, &CrashReport::capture(info))
    }));

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn capture_backtrace() -> (String, String) {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1/full to enable)".to_string(),
            "<disabled by backtrace policy>".to_string(),
        ),
        BacktraceStatus::Unsupported => (
            "unsupported".to_string(),
            "<backtrace unsupported on this platform>".to_string(),
        ),
        _ => ("unknown".to_string(), "<backtrace status unknown>".to_string()),
    }
}

fn write_crash_artifact(crash_dir: &Path, report: &CrashReport) -> io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{sequence:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", report.backtrace)?;
    file.flush()?;

    Ok(path)
}

fn payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn sample_report() -> CrashReport {
        CrashReport {
            timestamp: chrono::Utc::now(),
            thread_name: "window-worker".to_string(),
            location: "src/schedule.rs:40:9".to_string(),
            payload: "slot overflow".to_string(),
            backtrace_policy: "captured".to_string(),
            backtrace: "fake backtrace".to_string(),
        }
    }

    #[test]
    fn test_cli_log_filter_wins() {
        let options = LoggingOptions {
            verbose: 2,
            cli_log_filter: Some("vidfill_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_log_filters(&options);
        assert_eq!(filters.user_filter, "vidfill_core=trace");
        assert_eq!(filters.console_filter, "vidfill_core=trace");
        assert_eq!(filters.file_filter, "vidfill_core=trace");
    }

    #[test]
    fn test_verbosity_levels() {
        let debug = LoggingOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingOptions {
            verbose: 3,
            ..Default::default()
        };
        assert_eq!(compose_log_filters(&debug).console_filter, "debug");
        assert_eq!(compose_log_filters(&trace).console_filter, "trace");
    }

    #[test]
    fn test_rust_log_used_with_noise_filter() {
        let options = LoggingOptions {
            rust_log_env: Some("warn,vidfill_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_log_filters(&options);
        assert_eq!(filters.user_filter, "warn,vidfill_core=debug");
        assert_eq!(
            filters.console_filter,
            format!("{DEFAULT_NOISE_FILTER},warn,vidfill_core=debug")
        );
    }

    #[test]
    fn test_file_filter_keeps_ffmpeg_stderr_at_debug() {
        let filters = compose_log_filters(&LoggingOptions::default());
        assert_eq!(
            filters.console_filter,
            "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error,info"
        );
        assert_eq!(
            filters.file_filter,
            "ort=error,ffmpeg_stderr=debug,ffmpeg_encode_stderr=debug,info"
        );
    }

    #[test]
    fn test_file_filter_adds_missing_ffmpeg_targets() {
        let options = LoggingOptions {
            noise_filter: "ort=error".to_string(),
            ..Default::default()
        };

        let filters = compose_log_filters(&options);
        assert_eq!(filters.console_filter, "ort=error,info");
        assert_eq!(
            filters.file_filter,
            "ort=error,ffmpeg_stderr=debug,ffmpeg_encode_stderr=debug,info"
        );
    }

    #[test]
    fn test_file_sink_created_under_data_dir() {
        let data_dir = tempdir().unwrap();
        let options = LoggingOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        match build_file_sink(&options) {
            FileSink::Ready {
                log_dir,
                retention_files,
                ..
            } => {
                assert_eq!(log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert_eq!(retention_files, DEFAULT_LOG_RETENTION_FILES);
                assert!(log_dir.is_dir());
            }
            FileSink::Disabled { reason, .. } => panic!("expected ready sink, got: {reason}"),
        }
    }

    #[test]
    fn test_file_sink_disabled_without_data_dir() {
        match build_file_sink(&LoggingOptions::default()) {
            FileSink::Disabled {
                attempted_log_dir,
                reason,
            } => {
                assert!(attempted_log_dir.is_none());
                assert!(reason.contains("not configured"));
            }
            FileSink::Ready { log_dir, .. } => panic!("unexpected sink at {}", log_dir.display()),
        }
    }

    #[test]
    fn test_file_sink_disabled_when_log_dir_blocked() {
        let blocker = NamedTempFile::new().unwrap();
        let options = LoggingOptions {
            data_dir: Some(blocker.path().to_path_buf()),
            ..Default::default()
        };

        match build_file_sink(&options) {
            FileSink::Disabled {
                attempted_log_dir,
                reason,
            } => {
                assert_eq!(
                    attempted_log_dir,
                    Some(blocker.path().join(DEFAULT_LOG_DIR_NAME))
                );
                assert!(reason.contains("failed to create log directory"));
            }
            FileSink::Ready { log_dir, .. } => panic!("unexpected sink at {}", log_dir.display()),
        }
    }

    #[test]
    fn test_crash_artifact_contents() {
        let crash_dir = tempdir().unwrap();
        let path = write_crash_artifact(crash_dir.path(), &sample_report()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();

        assert!(path.starts_with(crash_dir.path()));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("log"));
        assert!(contents.contains("timestamp_utc="));
        assert!(contents.contains("thread=window-worker"));
        assert!(contents.contains("location=src/schedule.rs:40:9"));
        assert!(contents.contains("payload=slot overflow"));
        assert!(contents.contains("backtrace_policy=captured"));
        assert!(contents.contains("fake backtrace"));
    }

    #[test]
    fn test_crash_artifact_names_are_unique() {
        let crash_dir = tempdir().unwrap();
        let report = sample_report();
        let first = write_crash_artifact(crash_dir.path(), &report).unwrap();
        let second = write_crash_artifact(crash_dir.path(), &report).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_crash_artifact_unwritable_dir() {
        let not_a_dir = NamedTempFile::new().unwrap();
        let crash_dir = not_a_dir.path().join("crash");
        assert!(write_crash_artifact(&crash_dir, &sample_report()).is_err());
    }

    #[test]
    fn test_payload_to_string() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(payload_to_string(str_payload), "boom");
        assert_eq!(payload_to_string(string_payload), "kaboom");
        assert_eq!(payload_to_string(int_payload), "<non-string panic payload>");
    }
}

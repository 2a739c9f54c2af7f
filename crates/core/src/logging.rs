use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "png=warn,tiff=warn,image=warn";
pub const DEFAULT_FILE_DETAIL_FILTER: &str = "pairtile_core=debug,pairtile_app=debug";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_FILE_PREFIX: &str = "pairtile";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    /// Directory for rolling log files; console-only when unset.
    pub log_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    /// Appended to the file sink's filter when no level was asked for.
    pub file_detail_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            file_detail_filter: DEFAULT_FILE_DETAIL_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready(plan) => Some(&plan.log_dir),
            Self::Fallback(plan) => plan.attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = normalize_retention_files(options.retention_files);

    let Some(log_dir) = options.log_dir.clone() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: no log directory configured".to_string(),
        });
    };

    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

/// Console and file filters share the user's choice. When nobody asked for a
/// specific level the noise filter is prepended to both, and the file sink
/// additionally records pairtile's own debug events.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    let console_filter = merge_noise_filter(
        options.noise_filter.as_str(),
        user_filter.as_str(),
        implicit && options.include_noise_filter_when_implicit,
    );
    let file_filter = if implicit && !options.file_detail_filter.trim().is_empty() {
        format!("{console_filter},{}", options.file_detail_filter)
    } else {
        console_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    compose_logging_filters(options).console_filter
}

fn normalize_retention_files(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
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

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise_filter: bool) -> String {
    if include_noise_filter && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LoggingInitOptions {
        LoggingInitOptions::default()
    }

    #[test]
    fn implicit_filter_prepends_noise() {
        let plan = compose_logging_filters(&options());
        assert_eq!(plan.user_filter, "info");
        assert_eq!(plan.console_filter, format!("{DEFAULT_NOISE_FILTER},info"));
        assert_eq!(
            plan.file_filter,
            format!("{DEFAULT_NOISE_FILTER},info,{DEFAULT_FILE_DETAIL_FILTER}")
        );
    }

    #[test]
    fn explicit_levels_apply_to_the_file_sink_unchanged() {
        let plan = compose_logging_filters(&LoggingInitOptions {
            verbose: 1,
            ..options()
        });
        assert_eq!(plan.file_filter, "debug");

        let plan = compose_logging_filters(&LoggingInitOptions {
            cli_log_filter: Some("warn".to_string()),
            ..options()
        });
        assert_eq!(plan.file_filter, plan.console_filter);
    }

    #[test]
    fn empty_file_detail_keeps_filters_equal() {
        let plan = compose_logging_filters(&LoggingInitOptions {
            file_detail_filter: String::new(),
            ..options()
        });
        assert_eq!(plan.file_filter, plan.console_filter);
    }

    #[test]
    fn rust_log_beats_default_but_keeps_noise() {
        let opts = LoggingInitOptions {
            rust_log_env: Some("pairtile_core=debug".to_string()),
            ..options()
        };
        assert_eq!(
            select_log_filter(&opts),
            format!("{DEFAULT_NOISE_FILTER},pairtile_core=debug")
        );
    }

    #[test]
    fn verbosity_overrides_rust_log_and_drops_noise() {
        let opts = LoggingInitOptions {
            rust_log_env: Some("warn".to_string()),
            verbose: 1,
            ..options()
        };
        assert_eq!(select_log_filter(&opts), "debug");

        let opts = LoggingInitOptions { verbose: 3, ..opts };
        assert_eq!(select_log_filter(&opts), "trace");
    }

    #[test]
    fn explicit_filter_wins() {
        let opts = LoggingInitOptions {
            cli_log_filter: Some("error".to_string()),
            verbose: 2,
            rust_log_env: Some("debug".to_string()),
            ..options()
        };
        assert_eq!(select_log_filter(&opts), "error");
    }

    #[test]
    fn empty_noise_filter_is_not_merged() {
        let opts = LoggingInitOptions {
            noise_filter: "  ".to_string(),
            ..options()
        };
        assert_eq!(select_log_filter(&opts), "info");
    }

    #[test]
    fn file_sink_without_dir_falls_back() {
        let plan = build_file_sink_plan(&options());
        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
        assert!(plan
            .fallback_reason()
            .is_some_and(|reason| reason.contains("no log directory")));
    }

    #[test]
    fn file_sink_creates_log_dir() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let log_dir = temp.path().join("logs");
        let plan = build_file_sink_plan(&LoggingInitOptions {
            log_dir: Some(log_dir.clone()),
            retention_files: 0,
            ..options()
        });

        assert!(plan.is_ready());
        assert!(log_dir.is_dir());
        match plan {
            FileSinkPlan::Ready(ready) => {
                assert_eq!(ready.retention_files, DEFAULT_LOG_RETENTION_FILES)
            }
            FileSinkPlan::Fallback(fallback) => panic!("unexpected fallback: {}", fallback.reason),
        }
    }

    #[test]
    fn file_sink_reports_uncreatable_dir() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"file").expect("create blocking file");

        let plan = build_file_sink_plan(&LoggingInitOptions {
            log_dir: Some(blocker.join("logs")),
            ..options()
        });
        assert!(!plan.is_ready());
        assert!(plan
            .fallback_reason()
            .is_some_and(|reason| reason.contains("failed to create log directory")));
    }
}

//! provides logging helpers

use std::path::Path;
use std::path::PathBuf;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// When set, logs go to a daily rotated file at this path instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "HOSTDEVICE_PLUGIN_LOG_PATH";

const DEFAULT_LOG_PREFIX: &str = "hostdevice-plugin.log";
const MAX_LOG_FILES: usize = 7;

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Split a configured log path into the rotation directory and file prefix.
///
/// A path that names an existing directory keeps the default prefix.
fn log_file_location(log_path: &Path) -> (PathBuf, String) {
    if log_path.is_dir() {
        return (log_path.to_path_buf(), DEFAULT_LOG_PREFIX.to_string());
    }
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let prefix = log_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string());
    (dir, prefix)
}

/// Build the formatting layer, writing to a rolling file when `log_path` is set.
///
/// Falls back to stderr if the rolling appender cannot be created.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> (BoxedLayer<S>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if let Some(log_path) = log_path {
        let (dir, prefix) = log_file_location(Path::new(&log_path));
        match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .max_log_files(MAX_LOG_FILES)
            .build(&dir)
        {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed();
                return (layer, Some(guard));
            }
            Err(e) => {
                eprintln!("failed to create log file in {}: {e}", dir.display());
            }
        }
    }

    let layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed();
    (layer, None)
}

/// initiate the global tracing subscriber
///
/// The returned guard must be kept alive for the lifetime of the process when
/// logging to a file, otherwise buffered lines are lost.
pub fn init() -> Option<WorkerGuard> {
    let log_path = std::env::var(LOG_PATH_ENV_VAR).ok();
    let (fmt_layer, guard) = get_fmt_layer(log_path);

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}

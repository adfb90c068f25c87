use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex, Once};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;

const LOG_LEVEL_ENV: &str = "LAYERFILTER_LOG_LEVEL";
const LOG_DIR_ENV: &str = "LAYERFILTER_LOG_DIR";
const LOG_FILE_PREFIX: &str = "layerfilter.log";

/// Installs the global subscriber. The returned guards flush the non-blocking
/// writers when dropped, so the caller keeps them alive for the whole process.
pub fn init_logging() -> Vec<WorkerGuard> {
    let mut guards = vec![];

    let log_level = std::env::var(LOG_LEVEL_ENV).unwrap_or("INFO".to_owned());
    let log_level = Level::from_str(log_level.as_str()).unwrap_or(Level::INFO);

    let (stdout_write, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdout_layer = Layer::new()
        .with_writer(stdout_write.with_max_level(log_level))
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);
    guards.push(stdout_guard);

    // Optional rolling file output next to stdout.
    let file_layer = std::env::var(LOG_DIR_ENV).ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (file_write, file_guard) = tracing_appender::non_blocking(appender);
        guards.push(file_guard);
        Layer::new()
            .with_writer(file_write.with_max_level(log_level))
            .with_ansi(false)
            .with_thread_ids(true)
            .with_target(true)
    });

    #[cfg(not(feature = "console"))]
    let subscriber = Registry::default().with(stdout_layer).with(file_layer);
    #[cfg(feature = "console")]
    let subscriber = Registry::default()
        .with(stdout_layer)
        .with(file_layer)
        .with(console_subscriber::spawn());

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global subscriber already installed, keeping the existing one");
    }

    guards
}

static GLOBAL_TEST_LOG_GUARDS: LazyLock<Arc<Mutex<Option<Vec<WorkerGuard>>>>> =
    LazyLock::new(|| Arc::new(Mutex::new(None)));

/// Installs logging once per test binary; later calls are no-ops.
pub fn init_test_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        if let Ok(mut guards) = GLOBAL_TEST_LOG_GUARDS.as_ref().lock() {
            *guards = Some(init_logging());
        }
    });
}

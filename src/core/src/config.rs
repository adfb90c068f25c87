use std::str::FromStr;
use std::time::Duration;

use common_utils::RetryPolicy;
use tracing::warn;

use crate::backend::BackendKind;

const ENV_FORCED_BACKEND: &str = "LAYERFILTER_FORCED_BACKEND";
const ENV_WARNING_THRESHOLD: &str = "LAYERFILTER_WARNING_THRESHOLD";
const ENV_CACHE_MAX_ENTRIES: &str = "LAYERFILTER_CACHE_MAX_ENTRIES";
const ENV_HISTORY_DEPTH: &str = "LAYERFILTER_HISTORY_DEPTH";
const ENV_TIMEOUT_MS: &str = "LAYERFILTER_TIMEOUT_MS";

/// Engine configuration.
///
/// `forced_backend`, `performance_warning_threshold`, `cache_max_entries` and
/// `history_depth` affect filtering behavior; the rest are resource limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Always wins when the named backend is usable for the layer.
    pub forced_backend: Option<BackendKind>,
    /// Feature count above which a non-native backend choice is reported.
    pub performance_warning_threshold: u64,
    pub cache_max_entries: usize,
    pub history_depth: usize,
    /// Applies to server and embedded engine calls.
    pub backend_timeout: Duration,
    pub lock_retry: RetryPolicy,
    /// The generic engine builds an in-memory R-tree above this many features.
    pub generic_index_threshold: usize,
    pub server_pool_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            forced_backend: None,
            performance_warning_threshold: 50_000,
            cache_max_entries: 64,
            history_depth: 10,
            backend_timeout: Duration::from_secs(30),
            lock_retry: RetryPolicy::default(),
            generic_index_threshold: 1_000,
            server_pool_size: 4,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LAYERFILTER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_FORCED_BACKEND) {
            config.forced_backend = parse_or_keep(ENV_FORCED_BACKEND, &value, None, |v| {
                v.parse::<BackendKind>().ok().map(Some)
            });
        }
        if let Some(value) = lookup(ENV_WARNING_THRESHOLD) {
            config.performance_warning_threshold = parse_or_keep(
                ENV_WARNING_THRESHOLD,
                &value,
                config.performance_warning_threshold,
                parse_number,
            );
        }
        if let Some(value) = lookup(ENV_CACHE_MAX_ENTRIES) {
            config.cache_max_entries = parse_or_keep(
                ENV_CACHE_MAX_ENTRIES,
                &value,
                config.cache_max_entries,
                parse_number,
            );
        }
        if let Some(value) = lookup(ENV_HISTORY_DEPTH) {
            config.history_depth =
                parse_or_keep(ENV_HISTORY_DEPTH, &value, config.history_depth, parse_number);
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            config.backend_timeout = parse_or_keep(
                ENV_TIMEOUT_MS,
                &value,
                config.backend_timeout,
                |v| parse_number::<u64>(v).map(Duration::from_millis),
            );
        }
        config
    }

    pub fn with_forced_backend(mut self, backend: BackendKind) -> Self {
        self.forced_backend = Some(backend);
        self
    }

    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    pub fn with_cache_max_entries(mut self, entries: usize) -> Self {
        self.cache_max_entries = entries;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }
}

fn parse_number<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

fn parse_or_keep<T>(key: &str, value: &str, current: T, parse: impl Fn(&str) -> Option<T>) -> T {
    match parse(value) {
        Some(parsed) => parsed,
        None => {
            warn!(key, value, "ignoring unparsable configuration value");
            current
        }
    }
}

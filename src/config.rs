//! Configuration for the edition manager.

use std::{path::Path, time::Duration};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, ResultExt, Snafu};

/// Default capacity of the temporary fetcher cache.
pub const DEFAULT_MAX_TEMPORARY_FETCHERS: usize = 64;
/// Default time a slot may stay unconfirmed before its content is prefetched.
pub const DEFAULT_PREFETCH_DELAY: Duration = Duration::from_secs(60);
/// Default delay between background polling rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default upper bound for the background polling delay.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Errors when loading a [`Config`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {path}"))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse {path}"))]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Manager configuration.
///
/// Usually created with [`Config::default`], or loaded from a TOML file with
/// [`Config::load`]. Missing fields take their default values, durations are written in
/// humantime format, e.g. `"90s"` or `"1h"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the temporary fetcher cache.
    ///
    /// A value of zero is treated as one.
    pub max_temporary_fetchers: usize,
    /// How long a slot may stay ahead of the known good edition before its content is
    /// fetched speculatively. Also the period of the prefetch sweep.
    #[serde(with = "humantime_serde")]
    pub prefetch_delay: Duration,
    /// Delay between background polling rounds that found something.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound for the delay between unproductive background polling rounds.
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,
    /// Consecutive misses that end a polling round.
    pub min_failures: usize,
    /// Upper bound on sequential probes in a single polling round.
    pub max_probes_per_round: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_temporary_fetchers: DEFAULT_MAX_TEMPORARY_FETCHERS,
            prefetch_delay: DEFAULT_PREFETCH_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            min_failures: 3,
            max_probes_per_round: 32,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let display = path.to_string_lossy().to_string();
        let s = tokio::fs::read_to_string(path).await.context(ReadSnafu {
            path: display.clone(),
        })?;
        Self::from_toml(&s).map_err(|source| ParseSnafu { path: display }.into_error(source))
    }

    fn from_toml(s: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(s)
    }
}

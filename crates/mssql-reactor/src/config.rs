//! Connection options recognized by the exchange engine.

use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Default number of rows requested per cursor fetch.
pub const DEFAULT_FETCH_SIZE: u32 = 128;

/// Prepared-statement cache selector.
///
/// Parsed from the `preparedStatementCache` option: `"none"` disables
/// caching, a positive integer selects an LRU cache of that capacity, and
/// zero or a negative integer selects the unbounded cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementCacheSpec {
    /// Never cache; every lookup answers the unprepared sentinel.
    Disabled,
    /// Cache without eviction.
    Unbounded,
    /// LRU cache with the given capacity.
    Lru(usize),
}

impl Default for StatementCacheSpec {
    fn default() -> Self {
        Self::Unbounded
    }
}

impl FromStr for StatementCacheSpec {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("none") {
            return Ok(Self::Disabled);
        }

        match trimmed.parse::<i64>() {
            Ok(capacity) if capacity > 0 => Ok(Self::Lru(capacity as usize)),
            Ok(_) => Ok(Self::Unbounded),
            Err(_) => Err(Error::Config(format!(
                "cannot parse prepared statement cache selector: {value:?}"
            ))),
        }
    }
}

/// A duration with an explicit sign, as produced by ISO-8601 parsing.
///
/// Negative lock wait timeouts translate to `SET LOCK_TIMEOUT -1` (infinite
/// wait).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedDuration {
    negative: bool,
    duration: Duration,
}

impl SignedDuration {
    /// A positive duration.
    #[must_use]
    pub fn positive(duration: Duration) -> Self {
        Self {
            negative: false,
            duration,
        }
    }

    /// A negative duration (infinite wait for lock timeouts).
    #[must_use]
    pub fn negative(duration: Duration) -> Self {
        Self {
            negative: true,
            duration,
        }
    }

    /// Whether the duration is negative.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// The magnitude of the duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Render the value for `SET LOCK_TIMEOUT`; negative values become `-1`.
    #[must_use]
    pub fn lock_timeout_millis(&self) -> i64 {
        if self.negative {
            -1
        } else {
            self.duration.as_millis() as i64
        }
    }
}

/// Parse an ISO-8601 duration (`PnDTnHnMnS`, fractional seconds allowed,
/// optional leading sign).
///
/// # Errors
///
/// Returns a configuration error for any input that is not a valid ISO-8601
/// duration.
pub fn parse_duration(value: &str) -> Result<SignedDuration, Error> {
    let bad = || Error::Config(format!("cannot parse duration: {value:?}"));

    let mut rest = value.trim();
    let negative = if let Some(stripped) = rest.strip_prefix('-') {
        rest = stripped;
        true
    } else {
        rest = rest.strip_prefix('+').unwrap_or(rest);
        false
    };

    rest = rest
        .strip_prefix('P')
        .or_else(|| rest.strip_prefix('p'))
        .ok_or_else(bad)?;

    let mut seconds: f64 = 0.0;
    let mut in_time = false;
    let mut saw_component = false;
    let mut number = String::new();

    for c in rest.chars() {
        match c {
            'T' | 't' => {
                if in_time || !number.is_empty() {
                    return Err(bad());
                }
                in_time = true;
            }
            '0'..='9' | '.' => number.push(c),
            designator => {
                let magnitude: f64 = number.parse().map_err(|_| bad())?;
                number.clear();
                saw_component = true;

                let factor = match (in_time, designator.to_ascii_uppercase()) {
                    (false, 'D') => 86_400.0,
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(bad()),
                };
                seconds += magnitude * factor;
            }
        }
    }

    if !number.is_empty() || !saw_component {
        return Err(bad());
    }

    let duration = Duration::from_secs_f64(seconds);
    Ok(if negative {
        SignedDuration::negative(duration)
    } else {
        SignedDuration::positive(duration)
    })
}

/// Options that shape how queries are exchanged on a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    fetch_size: u32,
    statement_cache: StatementCacheSpec,
    statement_timeout: Option<Duration>,
    lock_wait_timeout: Option<SignedDuration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            fetch_size: DEFAULT_FETCH_SIZE,
            statement_cache: StatementCacheSpec::default(),
            statement_timeout: None,
            lock_wait_timeout: None,
        }
    }
}

impl ConnectionOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cursor fetch size. A fetch size of zero disables cursoring;
    /// all queries are then executed directly through `sp_executesql`.
    #[must_use]
    pub fn with_fetch_size(mut self, fetch_size: u32) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    /// Select the prepared-statement cache variant.
    #[must_use]
    pub fn with_statement_cache(mut self, spec: StatementCacheSpec) -> Self {
        self.statement_cache = spec;
        self
    }

    /// Set the statement timeout. On expiry an attention command is issued
    /// on the connection.
    #[must_use]
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Set the lock wait timeout applied at transaction begin.
    #[must_use]
    pub fn with_lock_wait_timeout(mut self, timeout: SignedDuration) -> Self {
        self.lock_wait_timeout = Some(timeout);
        self
    }

    /// The cursor fetch size.
    #[must_use]
    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    /// Whether queries should be exchanged through server cursors.
    #[must_use]
    pub fn prefers_cursors(&self) -> bool {
        self.fetch_size > 0
    }

    /// The selected prepared-statement cache variant.
    #[must_use]
    pub fn statement_cache(&self) -> StatementCacheSpec {
        self.statement_cache
    }

    /// The statement timeout, if configured.
    #[must_use]
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    /// The lock wait timeout, if configured.
    #[must_use]
    pub fn lock_wait_timeout(&self) -> Option<SignedDuration> {
        self.lock_wait_timeout
    }
}

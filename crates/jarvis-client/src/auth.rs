//! Bearer credentials: a static API key or a fetched, cached token.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::errors::ClientError;

/// Cached tokens are refreshed this long before they expire.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5);

/// Time source for token expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A freshly issued bearer token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Issues bearer tokens when no API key is configured.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<IssuedToken, ClientError>;
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Caches the last issued token until [`REFRESH_MARGIN`] before its expiry.
///
/// The lock is not held while fetching, so two concurrent callers that both
/// see an expired token will both fetch; the last one to finish wins.
pub struct TokenCache {
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CachedToken>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached token, fetching a new one from `source` when none is
    /// cached or the refresh point has passed.
    pub async fn token(&self, source: &dyn TokenSource) -> Result<String, ClientError> {
        let now = self.clock.now();
        if let Some(token) = self.current(now) {
            return Ok(token);
        }
        debug!("fetching bearer token");
        let issued = source.fetch_token().await?;
        let refresh_at = now
            .checked_add(issued.expires_in)
            .and_then(|expiry| expiry.checked_sub(REFRESH_MARGIN))
            .unwrap_or_else(|| far_future(now, issued.expires_in));
        *self.lock() = Some(CachedToken {
            token: issued.token.clone(),
            refresh_at,
        });
        Ok(issued.token)
    }

    /// Drops the cached token so the next call fetches a new one.
    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    fn current(&self, now: Instant) -> Option<String> {
        self.lock()
            .as_ref()
            .filter(|cached| now < cached.refresh_at)
            .map(|cached| cached.token.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CachedToken>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Latest representable refresh point when `now + expires_in` overflows.
/// Lifetimes shorter than the margin still refresh on the next call.
fn far_future(now: Instant, expires_in: Duration) -> Instant {
    if expires_in <= REFRESH_MARGIN {
        return now;
    }
    let mut step = expires_in - REFRESH_MARGIN;
    let mut at = now;
    while !step.is_zero() {
        match at.checked_add(step) {
            Some(next) => at = next,
            None => step /= 2,
        }
    }
    at
}

/// Resolves the bearer token for a request: the API key when present,
/// otherwise a cached token from `source`, otherwise none.
pub async fn resolve_bearer(
    api_key: Option<&str>,
    source: Option<&dyn TokenSource>,
    cache: &TokenCache,
) -> Result<Option<String>, ClientError> {
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        return Ok(Some(key.to_string()));
    }
    match source {
        Some(source) => cache.token(source).await.map(Some),
        None => Ok(None),
    }
}

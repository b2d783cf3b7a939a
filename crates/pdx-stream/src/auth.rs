//! Bearer-token collaborators.
//!
//! The streaming client never creates credentials itself. It asks a
//! [`TokenSource`] for the current token, reads the lease's issuance time to
//! judge staleness, and asks for a refresh (forced after the server rejected
//! the token) before reconnecting.
//!
//! - [`StaticToken`]: a fixed token, never refreshed
//! - [`LeasedToken`]: mints a new token through a [`TokenMinter`] when the
//!   lease is forced, stale, or empty

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use pdx_core::PdxError;
use pdx_core::config::DEFAULT_TOKEN_EXPIRY_SECS;
use pdx_core::time_util::now_ms;
use tracing::{debug, info};

/// Default staleness threshold (23 h).
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(DEFAULT_TOKEN_EXPIRY_SECS as u64);

/// `true` once `now_ms - issued_at_ms` reaches `threshold`.
///
/// A lease that was never issued (`issued_at_ms == 0`) has no baseline and is
/// never stale.
pub fn lease_is_stale(issued_at_ms: u64, now_ms: u64, threshold: Duration) -> bool {
    if issued_at_ms == 0 {
        return false;
    }
    u128::from(now_ms.saturating_sub(issued_at_ms)) >= threshold.as_millis()
}

/// A bearer token and when it was issued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenLease {
    pub token: String,
    /// Milliseconds since Unix epoch; 0 = never issued.
    pub issued_at_ms: u64,
}

impl TokenLease {
    pub fn new(token: impl Into<String>, issued_at_ms: u64) -> Self {
        Self { token: token.into(), issued_at_ms }
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

/// Supplier of the bearer credential.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current token, if any was ever issued.
    fn token(&self) -> Option<String>;

    /// Issuance time of the current lease in epoch milliseconds; 0 = never.
    fn issued_at_ms(&self) -> u64;

    /// Refresh the lease if `force` is set or the source judges it stale,
    /// then return the (possibly new) token.
    async fn refresh_if_needed(&self, force: bool) -> Result<Option<String>, PdxError>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    lease: TokenLease,
}

impl StaticToken {
    /// Token issued now.
    pub fn new(token: impl Into<String>) -> Self {
        Self { lease: TokenLease::new(token, now_ms()) }
    }

    pub fn with_lease(lease: TokenLease) -> Self {
        Self { lease }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        (!self.lease.is_empty()).then(|| self.lease.token.clone())
    }

    fn issued_at_ms(&self) -> u64 {
        self.lease.issued_at_ms
    }

    async fn refresh_if_needed(&self, _force: bool) -> Result<Option<String>, PdxError> {
        Ok(self.token())
    }
}

/// Produces fresh bearer tokens (e.g. a signed REST `/auth` call).
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self) -> Result<String, PdxError>;
}

/// A lease that is replaced in place through a [`TokenMinter`].
pub struct LeasedToken<M> {
    minter: M,
    lease: RwLock<TokenLease>,
    threshold: Duration,
}

impl<M: TokenMinter> LeasedToken<M> {
    /// Empty lease; the first refresh mints a token.
    pub fn new(minter: M) -> Self {
        Self::with_lease(minter, TokenLease::default())
    }

    pub fn with_lease(minter: M, lease: TokenLease) -> Self {
        Self { minter, lease: RwLock::new(lease), threshold: DEFAULT_TOKEN_EXPIRY }
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn into_source(self) -> Arc<dyn TokenSource>
    where
        M: 'static,
    {
        Arc::new(self)
    }

    /// Snapshot of the current lease.
    pub fn lease(&self) -> TokenLease {
        self.lease.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn is_stale(&self, lease: &TokenLease) -> bool {
        lease.is_empty() || lease_is_stale(lease.issued_at_ms, now_ms(), self.threshold)
    }
}

#[async_trait]
impl<M: TokenMinter> TokenSource for LeasedToken<M> {
    fn token(&self) -> Option<String> {
        let lease = self.lease();
        (!lease.is_empty()).then_some(lease.token)
    }

    fn issued_at_ms(&self) -> u64 {
        self.lease().issued_at_ms
    }

    async fn refresh_if_needed(&self, force: bool) -> Result<Option<String>, PdxError> {
        let current = self.lease();
        if !force && !self.is_stale(&current) {
            debug!("[auth] token still fresh");
            return Ok(Some(current.token));
        }

        let token = self.minter.mint().await?;
        if token.is_empty() {
            return Err(PdxError::Auth("minter returned an empty token".into()));
        }
        info!("[auth] token refreshed (forced={force})");
        *self.lease.write().unwrap_or_else(|p| p.into_inner()) = TokenLease::new(token.clone(), now_ms());
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const HOUR_MS: u64 = 3_600_000;

    struct CountingMinter(AtomicUsize);

    #[async_trait]
    impl TokenMinter for CountingMinter {
        async fn mint(&self) -> Result<String, PdxError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("jwt-{n}"))
        }
    }

    #[test]
    fn staleness_boundary() {
        let issued = 1_700_000_000_000;
        let threshold = DEFAULT_TOKEN_EXPIRY;
        let threshold_ms = 23 * HOUR_MS;

        for elapsed in [0, 1, HOUR_MS, threshold_ms - 1] {
            assert!(!lease_is_stale(issued, issued + elapsed, threshold), "elapsed={elapsed}");
        }
        for elapsed in [threshold_ms, threshold_ms + 1, 24 * HOUR_MS, 1000 * HOUR_MS] {
            assert!(lease_is_stale(issued, issued + elapsed, threshold), "elapsed={elapsed}");
        }
    }

    #[test]
    fn never_issued_is_never_stale() {
        assert!(!lease_is_stale(0, u64::MAX, DEFAULT_TOKEN_EXPIRY));
        // Clock skew backwards is not staleness either.
        assert!(!lease_is_stale(10_000, 5_000, Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn static_token_never_changes() {
        let src = StaticToken::new("abc");
        assert_eq!(src.refresh_if_needed(true).await.unwrap().as_deref(), Some("abc"));
        assert!(src.issued_at_ms() > 0);
    }

    #[tokio::test]
    async fn leased_token_refresh_policy() {
        let src = LeasedToken::new(CountingMinter(AtomicUsize::new(0)));
        assert_eq!(src.token(), None);
        assert_eq!(src.issued_at_ms(), 0);

        // Empty lease: mint.
        assert_eq!(src.refresh_if_needed(false).await.unwrap().as_deref(), Some("jwt-1"));
        // Fresh lease: keep.
        assert_eq!(src.refresh_if_needed(false).await.unwrap().as_deref(), Some("jwt-1"));
        // Forced: mint even though fresh.
        assert_eq!(src.refresh_if_needed(true).await.unwrap().as_deref(), Some("jwt-2"));
        assert!(src.issued_at_ms() > 0);
    }

    #[tokio::test]
    async fn leased_token_as_shared_source() {
        let src = LeasedToken::with_lease(CountingMinter(AtomicUsize::new(0)), TokenLease::new("seed", now_ms()))
            .with_threshold(Duration::from_millis(0))
            .into_source();
        assert_eq!(src.token().as_deref(), Some("seed"));
        // A zero threshold makes every lease stale.
        assert_eq!(src.refresh_if_needed(false).await.unwrap().as_deref(), Some("jwt-1"));
        assert_eq!(src.token().as_deref(), Some("jwt-1"));
    }

    #[tokio::test]
    async fn stale_lease_is_replaced() {
        let old = TokenLease::new("old", now_ms() - 24 * HOUR_MS);
        let src = LeasedToken::with_lease(CountingMinter(AtomicUsize::new(0)), old);
        assert_eq!(src.refresh_if_needed(false).await.unwrap().as_deref(), Some("jwt-1"));
        assert_eq!(src.lease().token, "jwt-1");
    }
}

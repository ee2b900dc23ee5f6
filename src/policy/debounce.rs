use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::collaborators::FeeEstimateSource;
use crate::config::EngineConfig;
use crate::error::SendError;
use crate::types::FeeEstimates;

/// Collapses bursts of fee-estimate requests into one fetch.
///
/// Each request takes a generation number and waits out the debounce window.
/// Only the newest request still current after the wait fetches; the ones it
/// superseded resolve to `None`. Results are cached for a short TTL.
pub struct FeeEstimateDebouncer {
    source: Arc<dyn FeeEstimateSource>,
    window: Duration,
    ttl: Duration,
    generation: AtomicU64,
    cached: Mutex<Option<(Instant, FeeEstimates)>>,
}

impl FeeEstimateDebouncer {
    pub fn new(source: Arc<dyn FeeEstimateSource>, window: Duration, ttl: Duration) -> Self {
        FeeEstimateDebouncer {
            source,
            window,
            ttl,
            generation: AtomicU64::new(0),
            cached: Mutex::new(None),
        }
    }

    pub fn from_config(source: Arc<dyn FeeEstimateSource>, config: &EngineConfig) -> Self {
        Self::new(
            source,
            Duration::from_millis(config.fee_debounce_ms),
            Duration::from_millis(config.fee_cache_ttl_ms),
        )
    }

    async fn fresh(&self) -> Option<FeeEstimates> {
        let cached = *self.cached.lock().await;
        cached
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, estimates)| estimates)
    }

    /// # Returns
    /// `Ok(None)` when a newer request superseded this one
    pub async fn request(&self) -> Result<Option<FeeEstimates>, SendError> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(estimates) = self.fresh().await {
            debug!("fee estimates served from cache");
            return Ok(Some(estimates));
        }

        tokio::time::sleep(self.window).await;
        if self.generation.load(Ordering::SeqCst) != ticket {
            debug!("fee estimate request {} superseded", ticket);
            return Ok(None);
        }

        let estimates = self.source.fetch_fee_estimates().await?;
        *self.cached.lock().await = Some((Instant::now(), estimates));
        Ok(Some(estimates))
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeFeeSource;

    fn debouncer(source: Arc<FakeFeeSource>) -> FeeEstimateDebouncer {
        FeeEstimateDebouncer::from_config(source, &EngineConfig::default())
    }

    #[tokio::test]
    async fn test_burst_collapses_to_one_fetch() {
        tokio::time::pause();
        let source = Arc::new(FakeFeeSource::new(12, 6, 2));
        let debouncer = debouncer(source.clone());

        let (a, b, c) = tokio::join!(debouncer.request(), debouncer.request(), debouncer.request());
        assert_eq!(a.unwrap(), None);
        assert_eq!(b.unwrap(), None);
        assert_eq!(c.unwrap().unwrap().normal, 6);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        tokio::time::pause();
        let source = Arc::new(FakeFeeSource::new(12, 6, 2));
        let debouncer = debouncer(source.clone());

        assert!(debouncer.request().await.unwrap().is_some());
        assert!(debouncer.request().await.unwrap().is_some());
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert!(debouncer.request().await.unwrap().is_some());
        assert_eq!(source.calls(), 2);

        debouncer.invalidate().await;
        assert!(debouncer.request().await.unwrap().is_some());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_source_error_propagates() {
        tokio::time::pause();
        let source = Arc::new(FakeFeeSource::failing());
        let err = debouncer(source).request().await.unwrap_err();
        assert!(matches!(err, SendError::NetworkError(_)));
    }
}

//! Caller-supplied fetch operations.
//!
//! The orchestrator never knows how data is obtained. A screen hands it a
//! [`Fetcher`], usually just an async closure, and the orchestrator decides
//! when to run it.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use smartcache_core::{CacheError, CacheResult, FetchError};

/// An asynchronous fetch of one resource.
///
/// Any `Fn() -> impl Future<Output = Result<T, FetchError>>` qualifies:
///
/// ```
/// use smartcache::{FetchError, Fetcher};
///
/// async fn load_orders() -> Result<Vec<u32>, FetchError> {
///     Ok(vec![1, 2, 3])
/// }
///
/// fn assert_fetcher<F: Fetcher<Vec<u32>>>(_: &F) {}
/// assert_fetcher(&load_orders);
/// assert_fetcher(&|| async { Ok::<_, FetchError>(vec![4u32]) });
/// ```
///
/// The fetcher is kept by the background-refresh task for its key, so it
/// must be `'static` and callable repeatedly. Retry and backoff are the
/// fetcher's business.
#[async_trait]
pub trait Fetcher<T>: Send + Sync + 'static {
    async fn fetch(&self) -> Result<T, FetchError>;
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + 'static,
{
    async fn fetch(&self) -> Result<T, FetchError> {
        (self)().await
    }
}

/// A fetcher whose result has been serialised to JSON.
///
/// Refresh jobs and the in-flight table store fetchers of different payload
/// types side by side, so they hold this erased form.
pub(crate) trait ErasedFetcher: Send + Sync + 'static {
    fn fetch_value(&self) -> BoxFuture<'static, CacheResult<Value>>;
}

pub(crate) struct JsonFetcher<T, F> {
    key: String,
    fetcher: Arc<F>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> JsonFetcher<T, F>
where
    T: Serialize + Send + 'static,
    F: Fetcher<T>,
{
    pub(crate) fn erase(key: impl Into<String>, fetcher: F) -> Arc<dyn ErasedFetcher> {
        Arc::new(Self {
            key: key.into(),
            fetcher: Arc::new(fetcher),
            _payload: PhantomData,
        })
    }
}

impl<T, F> ErasedFetcher for JsonFetcher<T, F>
where
    T: Serialize + Send + 'static,
    F: Fetcher<T>,
{
    fn fetch_value(&self) -> BoxFuture<'static, CacheResult<Value>> {
        let fetcher = Arc::clone(&self.fetcher);
        let key = self.key.clone();
        Box::pin(async move {
            let payload = fetcher.fetch().await.map_err(CacheError::Fetch)?;
            serde_json::to_value(&payload).map_err(|e| CacheError::Codec {
                key,
                reason: e.to_string(),
            })
        })
    }
}

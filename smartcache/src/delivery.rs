//! Deliveries and subscriptions.
//!
//! Every `get_data`/`force_refresh` call returns a [`Subscription`]. Its first
//! delivery is the value the call resolved with; later deliveries come from
//! the key's background-refresh task, in order, over the same channel.

use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smartcache_core::Timestamp;
use smartcache_storage::CacheKey;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::refresh::RefreshJob;
use crate::timers::TimerRegistry;

/// Where a delivered payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverySource {
    /// Served from a fresh cache entry without fetching.
    Cache,
    /// Produced by a fetch that just completed.
    Network,
}

impl fmt::Display for DeliverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => f.write_str("cache"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// One payload handed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    pub payload: T,
    pub source: DeliverySource,
    pub delivered_at: Timestamp,
}

impl<T> Delivery<T> {
    pub fn from_cache(&self) -> bool {
        self.source == DeliverySource::Cache
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Untyped delivery as it travels through refresh jobs.
#[derive(Debug, Clone)]
pub(crate) struct RawDelivery {
    pub(crate) payload: Value,
    pub(crate) source: DeliverySource,
    pub(crate) delivered_at: Timestamp,
}

pub(crate) type DeliverySender = mpsc::UnboundedSender<RawDelivery>;

/// Identity of one subscription within a refresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The subscription's attachment to its key's refresh job.
pub(crate) struct JobLink {
    pub(crate) job: Arc<RefreshJob>,
    pub(crate) timers: Arc<TimerRegistry>,
}

/// Result of a cache read plus the stream of later refreshes for its key.
///
/// Dropping the subscription (or calling [`dispose`](Self::dispose)) stops
/// its deliveries. When the last subscription of a key goes away the key's
/// refresh task is cancelled.
pub struct Subscription<T> {
    id: SubscriptionId,
    key: CacheKey,
    initial: Delivery<T>,
    receiver: mpsc::UnboundedReceiver<RawDelivery>,
    link: Option<JobLink>,
}

impl<T> Subscription<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(
        id: SubscriptionId,
        key: CacheKey,
        initial: Delivery<T>,
        receiver: mpsc::UnboundedReceiver<RawDelivery>,
        link: Option<JobLink>,
    ) -> Self {
        Self {
            id,
            key,
            initial,
            receiver,
            link,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The payload the call resolved with.
    pub fn value(&self) -> &T {
        &self.initial.payload
    }

    /// Where the resolved payload came from.
    pub fn source(&self) -> DeliverySource {
        self.initial.source
    }

    pub fn initial(&self) -> &Delivery<T> {
        &self.initial
    }

    /// Whether a background-refresh task is feeding this subscription.
    pub fn is_refreshing(&self) -> bool {
        self.link.as_ref().is_some_and(|link| !link.job.is_closed())
    }

    /// Next delivery, starting with the initial one.
    ///
    /// Returns `None` once the key's refresh task is gone (cancelled, key
    /// evicted, or never scheduled) and everything queued has been read.
    pub async fn next(&mut self) -> Option<Delivery<T>> {
        loop {
            let raw = self.receiver.recv().await?;
            if let Some(delivery) = self.decode(raw) {
                return Some(delivery);
            }
        }
    }

    /// Next delivery if one is already queued.
    pub fn try_next(&mut self) -> Option<Delivery<T>> {
        while let Ok(raw) = self.receiver.try_recv() {
            if let Some(delivery) = self.decode(raw) {
                return Some(delivery);
            }
        }
        None
    }

    /// Stop receiving deliveries.
    pub fn dispose(self) {
        drop(self);
    }

    /// Consume the subscription, keeping only the resolved payload.
    pub fn into_value(self) -> T
    where
        T: Clone,
    {
        self.initial.payload.clone()
    }

    fn decode(&self, raw: RawDelivery) -> Option<Delivery<T>> {
        match serde_json::from_value::<T>(raw.payload) {
            Ok(payload) => Some(Delivery {
                payload,
                source: raw.source,
                delivered_at: raw.delivered_at,
            }),
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    subscription = %self.id,
                    error = %e,
                    "Dropping delivery that does not match the subscriber's payload type"
                );
                None
            }
        }
    }
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// All deliveries as a stream.
    pub fn into_stream(self) -> impl Stream<Item = Delivery<T>> + Send {
        stream::unfold(self, |mut subscription| async move {
            let delivery = subscription.next().await?;
            Some((delivery, subscription))
        })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Some(link) = self.link.take() {
            if link.job.detach(self.id) == 0 {
                link.timers.cancel_if_idle(&self.key, &link.job);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("initial", &self.initial)
            .field("linked", &self.link.is_some())
            .finish()
    }
}

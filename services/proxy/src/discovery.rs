// Broker discovery: who owns a topic, and which broker is least loaded.
// The proxy never assigns ownership itself; it asks a provider and lets the
// broker's own lookup reply be authoritative.
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use egret_wire::{BrokerUrl, TopicName};

#[async_trait]
pub trait BrokerDiscoveryProvider: Send + Sync {
    /// All brokers currently able to serve lookups.
    async fn active_brokers(&self) -> Result<Vec<BrokerUrl>>;

    /// Broker to forward a topic lookup to. Need not be the final owner;
    /// the broker's reply may redirect (and redirects are rewritten to loop
    /// back through the proxy).
    async fn owning_broker(&self, topic: &TopicName) -> Result<BrokerUrl> {
        let brokers = self.active_brokers().await?;
        pick_by_topic(&brokers, topic)
    }

    /// Broker for load-insensitive control-plane work (metadata, schema).
    async fn least_loaded_broker(&self) -> Result<BrokerUrl>;
}

fn pick_by_topic(brokers: &[BrokerUrl], topic: &TopicName) -> Result<BrokerUrl> {
    if brokers.is_empty() {
        bail!("no active brokers");
    }
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    let index = (hasher.finish() % brokers.len() as u64) as usize;
    Ok(brokers[index].clone())
}

/// Fixed broker list. Used by tests and by single-broker deployments that
/// have no control plane.
pub struct StaticDiscovery {
    brokers: Vec<BrokerUrl>,
    next: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(brokers: Vec<BrokerUrl>) -> Self {
        Self {
            brokers,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BrokerDiscoveryProvider for StaticDiscovery {
    async fn active_brokers(&self) -> Result<Vec<BrokerUrl>> {
        Ok(self.brokers.clone())
    }

    async fn least_loaded_broker(&self) -> Result<BrokerUrl> {
        // Without load data, rotate.
        if self.brokers.is_empty() {
            bail!("no active brokers");
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.brokers.len();
        Ok(self.brokers[index].clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
struct BrokerEntry {
    service_url: String,
    #[serde(default)]
    load: f64,
}

#[derive(Debug, Deserialize)]
struct BrokerListResponse {
    items: Vec<BrokerEntry>,
}

/// Control-plane-backed discovery. Polls the broker registry endpoint and
/// serves lookups from the cached list so the hot path never blocks on HTTP.
pub struct ControlPlaneDiscovery {
    base_url: String,
    client: reqwest::Client,
    cache: RwLock<Vec<BrokerEntry>>,
}

impl ControlPlaneDiscovery {
    pub fn new(base_url: String) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cache: RwLock::new(Vec::new()),
        })
    }

    /// Initial fetch. Failing here means the control plane is unreachable,
    /// which is a distinct startup failure (exit code 2).
    pub async fn prime(&self) -> Result<()> {
        let items = self.fetch().await.context("prime broker list")?;
        *self.cache.write().await = items;
        Ok(())
    }

    /// Background refresh loop; runs until the returned handle is aborted.
    pub fn spawn_sync(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match discovery.fetch().await {
                    Ok(items) => *discovery.cache.write().await = items,
                    // Keep serving the last good list; brokers rarely all die
                    // at once while the control plane is down.
                    Err(err) => tracing::warn!(error = %err, "broker list refresh failed"),
                }
            }
        })
    }

    async fn fetch(&self) -> Result<Vec<BrokerEntry>> {
        let url = format!("{}/v1/brokers", self.base_url);
        let response: BrokerListResponse = self
            .client
            .get(url)
            .send()
            .await
            .context("fetch broker list")?
            .error_for_status()
            .context("broker list status")?
            .json()
            .await
            .context("decode broker list")?;
        Ok(response.items)
    }

    async fn cached_urls(&self) -> Result<Vec<(BrokerUrl, f64)>> {
        let cache = self.cache.read().await;
        let mut brokers = Vec::with_capacity(cache.len());
        for entry in cache.iter() {
            let url: BrokerUrl = entry
                .service_url
                .parse()
                .with_context(|| format!("broker registry url: {}", entry.service_url))?;
            brokers.push((url, entry.load));
        }
        Ok(brokers)
    }
}

#[async_trait]
impl BrokerDiscoveryProvider for ControlPlaneDiscovery {
    async fn active_brokers(&self) -> Result<Vec<BrokerUrl>> {
        Ok(self
            .cached_urls()
            .await?
            .into_iter()
            .map(|(url, _)| url)
            .collect())
    }

    async fn least_loaded_broker(&self) -> Result<BrokerUrl> {
        let brokers = self.cached_urls().await?;
        brokers
            .into_iter()
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(url, _)| url)
            .ok_or_else(|| anyhow::anyhow!("no active brokers"))
    }
}

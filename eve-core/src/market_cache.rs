use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::{counter, histogram};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::esi_client::{EsiClientTrait, PaginatedResource};
use crate::pagination::{BatchPager, PageSet};
use eve_domain::{Error, EsiOrder, MarketOrder, RegionId, RegionOrderBook, Result};
use eve_store::OrderStore;

/// Snapshots never count as fresh beyond this many seconds, whatever the
/// upstream expiry claims.
pub const DEFAULT_L1_TTL_CAP_SECONDS: i64 = 300;

pub const DEFAULT_GZIP_MAX_DECOMPRESSED: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct MarketCacheConfig {
    pub l1_ttl_cap: ChronoDuration,
    pub populate_deadline: Duration,
    pub gzip_max_decompressed: usize,
}

impl Default for MarketCacheConfig {
    fn default() -> Self {
        MarketCacheConfig {
            l1_ttl_cap: ChronoDuration::seconds(DEFAULT_L1_TTL_CAP_SECONDS),
            populate_deadline: Duration::from_secs(15),
            gzip_max_decompressed: DEFAULT_GZIP_MAX_DECOMPRESSED,
        }
    }
}

// ---------------------------------------------------------------------------
// gzip payload helpers
// ---------------------------------------------------------------------------

pub fn compress_payload(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| Error::Internal(format!("gzip encode: {e}")))?;
    encoder.finish().map_err(|e| Error::Internal(format!("gzip encode: {e}")))
}

/// Rejects payloads that inflate beyond `max_decompressed` before
/// materializing them.
pub fn decompress_payload(compressed: &[u8], max_decompressed: usize) -> Result<Vec<u8>> {
    let decoder = GzDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder
        .take(max_decompressed as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| Error::protocol(format!("gzip decode: {e}")))?;

    if raw.len() > max_decompressed {
        return Err(Error::validation(format!("decompressed cache payload exceeds {max_decompressed} bytes")));
    }
    Ok(raw)
}

// ---------------------------------------------------------------------------
// L2: shared compressed key/value store
// ---------------------------------------------------------------------------

fn cache_key(region_id: RegionId) -> String {
    format!("market_orders:{}", region_id.0)
}

/// The cross-instance snapshot cache. Every operation is best-effort from
/// the caller's point of view; an unreachable store degrades to L1-only
/// service.
#[derive(Clone)]
pub struct SharedCache {
    manager: ConnectionManager,
    gzip_max_decompressed: usize,
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache").finish_non_exhaustive()
    }
}

impl SharedCache {
    pub async fn connect(url: &str, gzip_max_decompressed: usize) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(SharedCache {
            manager,
            gzip_max_decompressed,
        })
    }

    async fn get_book(&self, region_id: RegionId) -> Result<Option<RegionOrderBook>> {
        let mut conn = self.manager.clone();
        let payload: Option<Vec<u8>> = conn
            .get(cache_key(region_id))
            .await
            .map_err(|e| Error::unavailable(format!("shared cache get: {e}")))?;

        match payload {
            None => Ok(None),
            Some(payload) => {
                let raw = decompress_payload(&payload, self.gzip_max_decompressed)?;
                let book: RegionOrderBook =
                    serde_json::from_slice(&raw).map_err(|e| Error::protocol(format!("shared cache payload for region {region_id}: {e}")))?;
                Ok(Some(book))
            }
        }
    }

    async fn put_book(&self, book: &RegionOrderBook, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_vec(book).map_err(|e| Error::Internal(format!("snapshot serialization: {e}")))?;
        let payload = compress_payload(&raw)?;

        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(cache_key(book.region_id), payload, ttl.as_secs().max(1))
            .await
            .map_err(|e| Error::unavailable(format!("shared cache set: {e}")))?;
        Ok(())
    }

    async fn refresh_ttl(&self, region_id: RegionId, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .expire(cache_key(region_id), ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| Error::unavailable(format!("shared cache expire: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// the two-tier cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedBook {
    book: Arc<RegionOrderBook>,
    stored_at: DateTime<Utc>,
}

type PopulateOutcome = Result<Arc<RegionOrderBook>>;

/// Region order-book snapshots behind an in-process map and a shared
/// compressed store, with at most one upstream populate per region at a
/// time.
#[derive(Debug)]
pub struct MarketCache {
    pager: BatchPager,
    orders: Arc<dyn OrderStore>,
    l2: Option<SharedCache>,
    config: MarketCacheConfig,
    l1: RwLock<HashMap<RegionId, CachedBook>>,
    in_flight: Mutex<HashMap<RegionId, watch::Receiver<Option<PopulateOutcome>>>>,
}

enum Flight {
    Lead(watch::Sender<Option<PopulateOutcome>>),
    Wait(watch::Receiver<Option<PopulateOutcome>>),
}

impl MarketCache {
    pub fn new(client: Arc<dyn EsiClientTrait>, orders: Arc<dyn OrderStore>, l2: Option<SharedCache>, bp_workers: usize, config: MarketCacheConfig) -> Self {
        MarketCache {
            pager: BatchPager::new(client, bp_workers),
            orders,
            l2,
            config,
            l1: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The freshest snapshot of a region, populating on demand. Partial
    /// snapshots (deadline hit mid-ingest) are returned but never cached.
    pub async fn get(&self, region_id: RegionId, cancel: CancellationToken) -> Result<Arc<RegionOrderBook>> {
        if let Some(book) = self.l1_fresh(region_id).await {
            counter!("cache_hits").increment(1);
            return Ok(book);
        }

        if let Some(book) = self.l2_lookup(region_id).await {
            counter!("cache_hits").increment(1);
            let book = Arc::new(book);
            self.store_l1(book.clone()).await;
            return Ok(book);
        }

        match self.join_or_lead(region_id).await {
            Flight::Wait(mut rx) => loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(Error::unavailable(format!("snapshot populate for region {region_id} was abandoned")));
                }
            },
            Flight::Lead(tx) => {
                // someone else may have finished between our miss and the
                // lease; serve their snapshot instead of refetching
                let outcome = match self.l1_fresh(region_id).await {
                    Some(book) => Ok(book),
                    None => {
                        counter!("cache_misses").increment(1);
                        self.populate(region_id, cancel).await
                    }
                };
                let _ = tx.send(Some(outcome.clone()));
                self.in_flight.lock().await.remove(&region_id);
                outcome
            }
        }
    }

    async fn join_or_lead(&self, region_id: RegionId) -> Flight {
        let mut guard = self.in_flight.lock().await;
        if let Some(rx) = guard.get(&region_id) {
            return Flight::Wait(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        guard.insert(region_id, rx);
        Flight::Lead(tx)
    }

    async fn populate(&self, region_id: RegionId, cancel: CancellationToken) -> Result<Arc<RegionOrderBook>> {
        let started = std::time::Instant::now();
        let previous = self.l1_any(region_id).await;

        let resource = PaginatedResource::market_orders(region_id).with_if_modified_since(previous.as_ref().map(|book| book.captured_at));
        let deadline = tokio::time::Instant::now() + self.config.populate_deadline;

        let page_set = self
            .pager
            .fetch_all_pages(resource, deadline, cancel)
            .await
            .map_err(|e| match e {
                Error::Transient(msg) | Error::RateLimited(msg) => Error::unavailable(format!("market fetch for region {region_id} failed: {msg}")),
                other => other,
            })?;

        histogram!("populate_latency_seconds").record(started.elapsed().as_secs_f64());

        if page_set.not_modified {
            return self.handle_not_modified(region_id, previous, &page_set).await;
        }

        let captured_at = Utc::now();
        let orders = self.parse_pages(region_id, &page_set, captured_at)?;

        if orders.is_empty() && !page_set.complete {
            return Err(Error::unavailable(format!("market fetch for region {region_id} produced no data")));
        }

        self.orders.upsert_orders(orders.clone()).await?;

        let book = Arc::new(RegionOrderBook {
            region_id,
            orders,
            captured_at,
            upstream_expires_at: page_set.expires_at,
            complete: page_set.complete,
        });

        if book.complete {
            self.store_l2(&book).await;
            self.store_l1(book.clone()).await;
        } else {
            counter!("populate_partial").increment(1);
            event!(Level::WARN, "Serving partial snapshot for region {} without caching it", region_id);
        }

        Ok(book)
    }

    async fn handle_not_modified(&self, region_id: RegionId, previous: Option<Arc<RegionOrderBook>>, page_set: &PageSet) -> Result<Arc<RegionOrderBook>> {
        let Some(previous) = previous else {
            // conditional fetch without a prior snapshot cannot happen;
            // treat a contradictory upstream as down
            return Err(Error::unavailable(format!("upstream reported not-modified for region {region_id} but no snapshot is held")));
        };

        let refreshed = Arc::new(RegionOrderBook {
            upstream_expires_at: page_set.expires_at.or(previous.upstream_expires_at),
            ..(*previous).clone()
        });

        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.refresh_ttl(region_id, self.l2_ttl(refreshed.upstream_expires_at)).await {
                event!(Level::WARN, "Failed to refresh shared cache TTL for region {}: {}", region_id, e);
            }
        }
        self.store_l1(refreshed.clone()).await;
        counter!("cache_hits").increment(1);

        Ok(refreshed)
    }

    fn parse_pages(&self, region_id: RegionId, page_set: &PageSet, captured_at: DateTime<Utc>) -> Result<Vec<MarketOrder>> {
        let mut orders = Vec::new();
        let mut invalid = 0usize;

        for (page_no, body) in &page_set.pages {
            let wire: Vec<EsiOrder> =
                serde_json::from_slice(body).map_err(|e| Error::protocol(format!("order page {page_no} of region {region_id}: {e}")))?;
            for order in wire {
                let order = order.into_market_order(region_id, captured_at);
                if order.validate().is_ok() {
                    orders.push(order);
                } else {
                    invalid += 1;
                }
            }
        }

        if invalid > 0 {
            event!(Level::WARN, "Dropped {} invalid upstream orders for region {}", invalid, region_id);
        }
        Ok(orders)
    }

    async fn l1_fresh(&self, region_id: RegionId) -> Option<Arc<RegionOrderBook>> {
        let guard = self.l1.read().await;
        let cached = guard.get(&region_id)?;

        let hard_cap = cached.stored_at + self.config.l1_ttl_cap;
        let expiry = match cached.book.upstream_expires_at {
            Some(upstream) => upstream.min(hard_cap),
            None => hard_cap,
        };
        (Utc::now() < expiry).then(|| cached.book.clone())
    }

    async fn l1_any(&self, region_id: RegionId) -> Option<Arc<RegionOrderBook>> {
        self.l1.read().await.get(&region_id).map(|cached| cached.book.clone())
    }

    async fn store_l1(&self, book: Arc<RegionOrderBook>) {
        let mut guard = self.l1.write().await;
        guard.insert(
            book.region_id,
            CachedBook {
                book,
                stored_at: Utc::now(),
            },
        );
    }

    async fn l2_lookup(&self, region_id: RegionId) -> Option<RegionOrderBook> {
        let l2 = self.l2.as_ref()?;
        match l2.get_book(region_id).await {
            Ok(book) => book,
            Err(e) => {
                // the shared store being down must never take reads down
                event!(Level::WARN, "Shared cache lookup for region {} failed: {}", region_id, e);
                None
            }
        }
    }

    async fn store_l2(&self, book: &RegionOrderBook) {
        let Some(l2) = &self.l2 else {
            return;
        };
        if let Err(e) = l2.put_book(book, self.l2_ttl(book.upstream_expires_at)).await {
            event!(Level::WARN, "Shared cache store for region {} failed: {}", book.region_id, e);
        }
    }

    fn l2_ttl(&self, upstream_expires_at: Option<DateTime<Utc>>) -> Duration {
        let cap = self.config.l1_ttl_cap.to_std().unwrap_or(Duration::from_secs(300));
        let until_expiry = upstream_expires_at
            .and_then(|expires| (expires - Utc::now()).to_std().ok())
            .unwrap_or(cap);
        until_expiry.min(cap).max(Duration::from_secs(1))
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use mockall::automock;
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::DbModelManager;
use eve_domain::{Error, MarketOrder, OrderId, RegionId, Result, StationId, TypeId};

/// Upsert batches are split into statements of this many rows so a
/// multi-million row ingest never materializes one giant bind list.
const UPSERT_CHUNK_ROWS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderStaleness {
    pub newest_fetched_at: DateTime<Utc>,
    pub age_seconds: i64,
}

/// Authoritative store of observed market orders. Snapshots are keyed
/// `(order_id, fetched_at)` so history survives; the freshest batch per
/// region is the logical current book.
#[automock]
#[async_trait]
pub trait OrderStore: Send + Sync + Debug {
    /// Atomic: either every row of the batch lands or none does. Rows
    /// violating the order invariants reject the whole batch.
    async fn upsert_orders(&self, orders: Vec<MarketOrder>) -> Result<()>;

    /// The freshest observed order set of a region.
    async fn get_orders_for_region(&self, region_id: RegionId) -> Result<Vec<MarketOrder>>;

    async fn get_orders_for_item_region(&self, region_id: RegionId, type_id: TypeId) -> Result<Vec<MarketOrder>>;

    /// `None` when the region was never ingested.
    async fn staleness(&self, region_id: RegionId) -> Result<Option<OrderStaleness>>;

    /// Deletes observations older than `max_age`, returning the row count.
    async fn evict_older_than(&self, max_age: Duration) -> Result<u64>;
}

fn validate_batch(orders: &[MarketOrder]) -> Result<()> {
    for order in orders {
        order.validate()?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DbOrderStore {
    pub mm: DbModelManager,
}

#[derive(Debug, FromRow)]
struct DbOrderRow {
    order_id: i64,
    type_id: i32,
    region_id: i32,
    location_id: i64,
    is_buy_order: bool,
    price: f64,
    volume_total: i32,
    volume_remain: i32,
    min_volume: Option<i32>,
    issued: DateTime<Utc>,
    duration: i32,
    fetched_at: DateTime<Utc>,
}

impl From<DbOrderRow> for MarketOrder {
    fn from(row: DbOrderRow) -> Self {
        MarketOrder {
            order_id: OrderId(row.order_id),
            type_id: TypeId(row.type_id),
            region_id: RegionId(row.region_id),
            location_id: StationId(row.location_id),
            is_buy_order: row.is_buy_order,
            price: row.price,
            volume_total: row.volume_total,
            volume_remain: row.volume_remain,
            min_volume: row.min_volume,
            issued: row.issued,
            duration: row.duration,
            fetched_at: row.fetched_at,
        }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::unavailable(format!("order store: {e}"))
}

const SELECT_ORDER_COLUMNS: &str = r#"
SELECT order_id
     , type_id
     , region_id
     , location_id
     , is_buy_order
     , price
     , volume_total
     , volume_remain
     , min_volume
     , issued
     , duration
     , fetched_at
  FROM market_orders
"#;

impl DbOrderStore {
    pub fn new(mm: DbModelManager) -> Self {
        Self { mm }
    }
}

#[async_trait]
impl OrderStore for DbOrderStore {
    async fn upsert_orders(&self, orders: Vec<MarketOrder>) -> Result<()> {
        validate_batch(&orders)?;
        if orders.is_empty() {
            return Ok(());
        }

        let total = orders.len();
        let mut tx = self.mm.pool().begin().await.map_err(db_err)?;

        for chunk in orders.chunks(UPSERT_CHUNK_ROWS) {
            let mut order_ids = Vec::with_capacity(chunk.len());
            let mut type_ids = Vec::with_capacity(chunk.len());
            let mut region_ids = Vec::with_capacity(chunk.len());
            let mut location_ids = Vec::with_capacity(chunk.len());
            let mut is_buys = Vec::with_capacity(chunk.len());
            let mut prices = Vec::with_capacity(chunk.len());
            let mut volume_totals = Vec::with_capacity(chunk.len());
            let mut volume_remains = Vec::with_capacity(chunk.len());
            let mut min_volumes: Vec<Option<i32>> = Vec::with_capacity(chunk.len());
            let mut issueds = Vec::with_capacity(chunk.len());
            let mut durations = Vec::with_capacity(chunk.len());
            let mut fetched_ats = Vec::with_capacity(chunk.len());

            for order in chunk {
                order_ids.push(order.order_id.0);
                type_ids.push(order.type_id.0);
                region_ids.push(order.region_id.0);
                location_ids.push(order.location_id.0);
                is_buys.push(order.is_buy_order);
                prices.push(order.price);
                volume_totals.push(order.volume_total);
                volume_remains.push(order.volume_remain);
                min_volumes.push(order.min_volume);
                issueds.push(order.issued);
                durations.push(order.duration);
                fetched_ats.push(order.fetched_at);
            }

            sqlx::query(
                r#"
INSERT INTO market_orders (order_id, type_id, region_id, location_id, is_buy_order, price,
                           volume_total, volume_remain, min_volume, issued, duration, fetched_at)
SELECT * FROM UNNEST($1::bigint[], $2::int[], $3::int[], $4::bigint[], $5::boolean[], $6::double precision[],
                     $7::int[], $8::int[], $9::int[], $10::timestamptz[], $11::int[], $12::timestamptz[])
ON CONFLICT (order_id, fetched_at)
DO UPDATE SET price = EXCLUDED.price, volume_remain = EXCLUDED.volume_remain
                "#,
            )
            .bind(&order_ids)
            .bind(&type_ids)
            .bind(&region_ids)
            .bind(&location_ids)
            .bind(&is_buys)
            .bind(&prices)
            .bind(&volume_totals)
            .bind(&volume_remains)
            .bind(&min_volumes)
            .bind(&issueds)
            .bind(&durations)
            .bind(&fetched_ats)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        event!(Level::DEBUG, "Upserted {} market orders", total);
        Ok(())
    }

    async fn get_orders_for_region(&self, region_id: RegionId) -> Result<Vec<MarketOrder>> {
        let query = format!(
            "{SELECT_ORDER_COLUMNS} WHERE region_id = $1 AND fetched_at = (SELECT MAX(fetched_at) FROM market_orders WHERE region_id = $1)"
        );
        let rows: Vec<DbOrderRow> = sqlx::query_as(&query)
            .bind(region_id.0)
            .fetch_all(self.mm.pool())
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(MarketOrder::from).collect_vec())
    }

    async fn get_orders_for_item_region(&self, region_id: RegionId, type_id: TypeId) -> Result<Vec<MarketOrder>> {
        let query = format!(
            "{SELECT_ORDER_COLUMNS} WHERE region_id = $1 AND type_id = $2 AND fetched_at = (SELECT MAX(fetched_at) FROM market_orders WHERE region_id = $1)"
        );
        let rows: Vec<DbOrderRow> = sqlx::query_as(&query)
            .bind(region_id.0)
            .bind(type_id.0)
            .fetch_all(self.mm.pool())
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(MarketOrder::from).collect_vec())
    }

    async fn staleness(&self, region_id: RegionId) -> Result<Option<OrderStaleness>> {
        let newest: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as("SELECT MAX(fetched_at) FROM market_orders WHERE region_id = $1")
            .bind(region_id.0)
            .fetch_optional(self.mm.pool())
            .await
            .map_err(db_err)?;

        Ok(newest.and_then(|(newest_fetched_at,)| newest_fetched_at).map(|newest_fetched_at| OrderStaleness {
            newest_fetched_at,
            age_seconds: (Utc::now() - newest_fetched_at).num_seconds(),
        }))
    }

    async fn evict_older_than(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let result = sqlx::query("DELETE FROM market_orders WHERE fetched_at < $1")
            .bind(cutoff)
            .execute(self.mm.pool())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// in-memory implementation for tests and local development
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    rows: Mutex<HashMap<(OrderId, DateTime<Utc>), MarketOrder>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn upsert_orders(&self, orders: Vec<MarketOrder>) -> Result<()> {
        validate_batch(&orders)?;

        let mut guard = self.rows.lock().await;
        for order in orders {
            guard
                .entry((order.order_id, order.fetched_at))
                .and_modify(|existing| {
                    existing.price = order.price;
                    existing.volume_remain = order.volume_remain;
                })
                .or_insert(order);
        }
        Ok(())
    }

    async fn get_orders_for_region(&self, region_id: RegionId) -> Result<Vec<MarketOrder>> {
        let guard = self.rows.lock().await;
        let newest = guard
            .values()
            .filter(|order| order.region_id == region_id)
            .map(|order| order.fetched_at)
            .max();

        Ok(newest
            .map(|newest| {
                guard
                    .values()
                    .filter(|order| order.region_id == region_id && order.fetched_at == newest)
                    .cloned()
                    .sorted_by_key(|order| order.order_id)
                    .collect_vec()
            })
            .unwrap_or_default())
    }

    async fn get_orders_for_item_region(&self, region_id: RegionId, type_id: TypeId) -> Result<Vec<MarketOrder>> {
        Ok(self
            .get_orders_for_region(region_id)
            .await?
            .into_iter()
            .filter(|order| order.type_id == type_id)
            .collect_vec())
    }

    async fn staleness(&self, region_id: RegionId) -> Result<Option<OrderStaleness>> {
        let guard = self.rows.lock().await;
        Ok(guard
            .values()
            .filter(|order| order.region_id == region_id)
            .map(|order| order.fetched_at)
            .max()
            .map(|newest_fetched_at| OrderStaleness {
                newest_fetched_at,
                age_seconds: (Utc::now() - newest_fetched_at).num_seconds(),
            }))
    }

    async fn evict_older_than(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let mut guard = self.rows.lock().await;
        let before = guard.len();
        guard.retain(|_, order| order.fetched_at >= cutoff);
        Ok((before - guard.len()) as u64)
    }
}

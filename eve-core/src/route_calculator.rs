use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::market_cache::MarketCache;
use crate::universe::StaticUniverse;
use eve_domain::{
    effective_ship, group_order_book, is_viable, rank_routes, trade_route, CharacterContext, EffectiveShip, Error, Item, ItemBook, ModuleTypeInfo, RegionId,
    Result, RouteResult, StackingPolicy, TradeRoute, TravelTimeModel, TypeId, ViabilityFilter,
};

#[derive(Debug, Clone, Copy)]
pub struct RouteOptions {
    pub min_spread_pct: f64,
    pub max_routes: usize,
    pub total_deadline: Duration,
    pub avoid_lowsec: bool,
    pub prefilter_volume: bool,
    /// Some flows only make sense for a docked caller.
    pub require_docked: bool,
    pub workers: usize,
}

impl Default for RouteOptions {
    fn default() -> Self {
        RouteOptions {
            min_spread_pct: 5.0,
            max_routes: 50,
            total_deadline: Duration::from_secs(30),
            avoid_lowsec: false,
            prefilter_volume: true,
            require_docked: false,
            workers: 50,
        }
    }
}

/// The orchestrator: joins the market snapshot with the caller's
/// effective ship and the stargate graph, fans the viable items over a
/// worker pool under the request deadline, and ranks what came back.
pub struct RouteCalculator {
    market: Arc<MarketCache>,
    universe: Arc<StaticUniverse>,
    travel: Arc<dyn TravelTimeModel>,
    stacking: StackingPolicy,
}

impl RouteCalculator {
    pub fn new(market: Arc<MarketCache>, universe: Arc<StaticUniverse>, travel: Arc<dyn TravelTimeModel>, stacking: StackingPolicy) -> Self {
        RouteCalculator {
            market,
            universe,
            travel,
            stacking,
        }
    }

    pub async fn compute_routes(
        &self,
        region_id: RegionId,
        ship_choice: Option<TypeId>,
        ctx: &CharacterContext,
        options: &RouteOptions,
        cancel: CancellationToken,
    ) -> Result<RouteResult> {
        let deadline = Instant::now() + options.total_deadline;

        if options.require_docked && !ctx.location.is_docked() {
            return Err(Error::NotDocked);
        }

        let ship_type = ship_choice.unwrap_or(ctx.active_ship.type_id);
        let ship = self.universe.lookup_ship(ship_type)?.clone();
        let modules: Vec<ModuleTypeInfo> = ctx
            .ship_fitting
            .fitted_type_ids()
            .into_iter()
            .filter_map(|type_id| self.universe.lookup_module(type_id).ok().cloned())
            .collect();
        let eff_ship = effective_ship(&ship, &ctx.trading_skills, &modules, self.stacking);

        let market = tokio::time::timeout_at(deadline, self.market.get(region_id, cancel.clone()))
            .await
            .map_err(|_| Error::unavailable(format!("market snapshot for region {region_id} not available within the deadline")))??;

        let filter = ViabilityFilter {
            min_spread_pct: options.min_spread_pct,
            prefilter_volume: options.prefilter_volume,
        };
        let work: Vec<(ItemBook, Item)> = group_order_book(&market.orders)
            .into_iter()
            .filter_map(|book| {
                // items missing from the static data cannot be priced by
                // volume and are skipped
                let item = self.universe.lookup_item(book.type_id).ok()?.clone();
                is_viable(&book, item.volume_m3, &eff_ship, &filter).then_some((book, item))
            })
            .collect();

        event!(Level::DEBUG, "Region {}: {} items survive the viability prefilter over {} orders", region_id, work.len(), market.orders.len());

        let deadline_hit = Arc::new(AtomicBool::new(false));
        let was_cancelled = Arc::new(AtomicBool::new(false));
        let mut routes = self
            .run_worker_pool(work, eff_ship, options, deadline, cancel, deadline_hit.clone(), was_cancelled.clone())
            .await;

        rank_routes(&mut routes);
        routes.truncate(options.max_routes);

        let deadline_partial = deadline_hit.load(Ordering::SeqCst);
        let cancel_partial = was_cancelled.load(Ordering::SeqCst);
        let market_partial = !market.complete;
        let partial_reason = if deadline_partial {
            Some("deadline".to_string())
        } else if cancel_partial {
            Some("cancelled".to_string())
        } else if market_partial {
            Some("incomplete_market".to_string())
        } else {
            None
        };

        Ok(RouteResult {
            routes,
            partial: partial_reason.is_some(),
            partial_reason,
            captured_at: market.captured_at,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_worker_pool(
        &self,
        work: Vec<(ItemBook, Item)>,
        eff_ship: EffectiveShip,
        options: &RouteOptions,
        deadline: Instant,
        cancel: CancellationToken,
        deadline_hit: Arc<AtomicBool>,
        was_cancelled: Arc<AtomicBool>,
    ) -> Vec<TradeRoute> {
        if work.is_empty() {
            return Vec::new();
        }

        let queue_cap = work.len();
        let (work_tx, work_rx) = mpsc::channel::<(ItemBook, Item)>(queue_cap);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<TradeRoute>(queue_cap);

        tokio::spawn(async move {
            for entry in work {
                if work_tx.send(entry).await.is_err() {
                    break;
                }
            }
        });

        let worker_count = options.workers.min(queue_cap).max(1);
        let avoid_lowsec = options.avoid_lowsec;
        for _ in 0..worker_count {
            let universe = Arc::clone(&self.universe);
            let travel = Arc::clone(&self.travel);
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let deadline_hit = Arc::clone(&deadline_hit);
            let was_cancelled = Arc::clone(&was_cancelled);
            tokio::spawn(async move {
                loop {
                    let entry = { work_rx.lock().await.recv().await };
                    let Some((book, item)) = entry else {
                        break;
                    };

                    if Instant::now() >= deadline {
                        deadline_hit.store(true, Ordering::SeqCst);
                        break;
                    }
                    if cancel.is_cancelled() {
                        was_cancelled.store(true, Ordering::SeqCst);
                        break;
                    }

                    if let Some(route) = compute_item_route(&universe, travel.as_ref(), &eff_ship, avoid_lowsec, &book, &item) {
                        if result_tx.send(route).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
        drop(result_tx);

        let mut routes = Vec::new();
        while let Some(route) = result_rx.recv().await {
            routes.push(route);
        }
        routes
    }
}

/// Route math for one viable item. Any resolution failure skips the item
/// rather than failing the request; structures with unknown systems are
/// skipped by the same rule.
fn compute_item_route(
    universe: &StaticUniverse,
    travel: &dyn TravelTimeModel,
    eff_ship: &EffectiveShip,
    avoid_lowsec: bool,
    book: &ItemBook,
    item: &Item,
) -> Option<TradeRoute> {
    let buy_ref = universe.resolve_station(book.best_ask.location_id).ok()?;
    let sell_ref = universe.resolve_station(book.best_bid.location_id).ok()?;
    let buy_system = buy_ref.system_id?;
    let sell_system = sell_ref.system_id?;

    let jumps = if buy_system == sell_system {
        0
    } else {
        universe.shortest_path(buy_system, sell_system, avoid_lowsec).ok()?.jumps
    };

    let seconds_per_trip = travel.seconds_per_trip(eff_ship, jumps);
    trade_route(book, &item.name, item.volume_m3, eff_ship, jumps, seconds_per_trip, &buy_ref.name, &sell_ref.name)
}

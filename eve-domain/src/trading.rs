use crate::model::{EffectiveShip, MarketOrder, TradeRoute, TypeId};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use std::collections::HashMap;

/// Best ask (cheapest sell order) and best bid (highest buy order) of one
/// item inside a region snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemBook {
    pub type_id: TypeId,
    pub best_ask: MarketOrder,
    pub best_bid: MarketOrder,
}

impl ItemBook {
    /// `(max_bid - min_ask) / min_ask`, in percent. Negative when the
    /// book is crossed the wrong way.
    pub fn raw_spread_pct(&self) -> f64 {
        (self.best_bid.price - self.best_ask.price) / self.best_ask.price * 100.0
    }
}

/// Groups a region snapshot by item and keeps only items with both sides
/// of the book present. You buy from the sell side and sell to the buy
/// side, so the interesting pair is (min ask, max bid).
pub fn group_order_book(orders: &[MarketOrder]) -> Vec<ItemBook> {
    let mut asks: HashMap<TypeId, &MarketOrder> = HashMap::new();
    let mut bids: HashMap<TypeId, &MarketOrder> = HashMap::new();

    for order in orders {
        if order.volume_remain <= 0 {
            continue;
        }
        if order.is_buy_order {
            bids.entry(order.type_id)
                .and_modify(|best| {
                    if order.price > best.price {
                        *best = order;
                    }
                })
                .or_insert(order);
        } else {
            asks.entry(order.type_id)
                .and_modify(|best| {
                    if order.price < best.price {
                        *best = order;
                    }
                })
                .or_insert(order);
        }
    }

    asks.into_iter()
        .filter_map(|(type_id, ask)| {
            bids.get(&type_id).map(|bid| ItemBook {
                type_id,
                best_ask: (*ask).clone(),
                best_bid: (**bid).clone(),
            })
        })
        .sorted_by_key(|book| book.type_id)
        .collect_vec()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViabilityFilter {
    pub min_spread_pct: f64,
    pub prefilter_volume: bool,
}

/// Per-item viability prefilter applied before any pathfinding happens.
pub fn is_viable(book: &ItemBook, unit_volume_m3: f64, eff_ship: &EffectiveShip, filter: &ViabilityFilter) -> bool {
    if book.raw_spread_pct() < filter.min_spread_pct {
        return false;
    }
    if filter.prefilter_volume {
        // a single unit that dwarfs the hold won't meaningfully ship
        if unit_volume_m3 > eff_ship.effective_cargo_m3 * 10.0 {
            return false;
        }
        // and a best ask that fills less than a tenth of the hold is not
        // worth the trip
        let ask_volume_m3 = book.best_ask.volume_remain as f64 * unit_volume_m3;
        if ask_volume_m3 < eff_ship.effective_cargo_m3 * 0.1 {
            return false;
        }
    }
    true
}

/// Profit math for a single viable item given resolved travel figures.
/// Returns `None` when no unit fits or the trade nets out negative after
/// fees and tax.
#[allow(clippy::too_many_arguments)]
pub fn trade_route(
    book: &ItemBook,
    item_name: &str,
    unit_volume_m3: f64,
    eff_ship: &EffectiveShip,
    jumps: u32,
    seconds_per_trip: f64,
    buy_station_name: &str,
    sell_station_name: &str,
) -> Option<TradeRoute> {
    if unit_volume_m3 <= 0.0 || seconds_per_trip <= 0.0 {
        return None;
    }

    let cargo_limited = (eff_ship.effective_cargo_m3 / unit_volume_m3).floor() as i64;
    let quantity = cargo_limited
        .min(book.best_ask.volume_remain as i64)
        .min(book.best_bid.volume_remain as i64);
    if quantity <= 0 {
        return None;
    }

    let min_ask = book.best_ask.price;
    let max_bid = book.best_bid.price;
    let quantity_f = quantity as f64;

    let gross = quantity_f * (max_bid - min_ask);
    // selling pays tax and broker fee; buying off an existing sell order
    // pays the broker fee only
    let sell_side_costs = max_bid * quantity_f * (eff_ship.sales_tax_rate + eff_ship.broker_fee_rate);
    let buy_side_costs = min_ask * quantity_f * eff_ship.broker_fee_rate;
    let net = gross - sell_side_costs - buy_side_costs;
    if net <= 0.0 {
        return None;
    }

    Some(TradeRoute {
        type_id: book.type_id,
        item_name: item_name.to_string(),
        buy_station: book.best_ask.location_id,
        buy_station_name: buy_station_name.to_string(),
        buy_price: min_ask,
        sell_station: book.best_bid.location_id,
        sell_station_name: sell_station_name.to_string(),
        sell_price: max_bid,
        quantity_per_trip: quantity,
        gross_profit_per_trip: gross,
        net_profit_per_trip: net,
        jumps,
        seconds_per_trip,
        isk_per_hour: net * 3600.0 / seconds_per_trip,
    })
}

/// Total ranking order: ISK/hour descending, then larger net profit, then
/// fewer jumps, then item id. Total so that identical inputs always yield
/// an identical listing.
pub fn rank_routes(routes: &mut [TradeRoute]) {
    routes.sort_by(|a, b| {
        OrderedFloat(b.isk_per_hour)
            .cmp(&OrderedFloat(a.isk_per_hour))
            .then_with(|| OrderedFloat(b.net_profit_per_trip).cmp(&OrderedFloat(a.net_profit_per_trip)))
            .then_with(|| a.jumps.cmp(&b.jumps))
            .then_with(|| a.type_id.cmp(&b.type_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderId, RegionId, StationId};
    use chrono::{TimeZone, Utc};

    fn order(order_id: i64, type_id: i32, station: i64, is_buy: bool, price: f64, remain: i32) -> MarketOrder {
        MarketOrder {
            order_id: OrderId(order_id),
            type_id: TypeId(type_id),
            region_id: RegionId(10000002),
            location_id: StationId(station),
            is_buy_order: is_buy,
            price,
            volume_total: remain.max(1),
            volume_remain: remain,
            min_volume: None,
            issued: Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
            duration: 90,
            fetched_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
        }
    }

    fn eff_ship(cargo: f64) -> EffectiveShip {
        EffectiveShip {
            effective_cargo_m3: cargo,
            effective_warp_speed_au_s: 4.5,
            effective_align_s: 8.0,
            sales_tax_rate: 0.027,
            broker_fee_rate: 0.021,
        }
    }

    #[test]
    fn grouping_picks_best_of_each_side() {
        let orders = vec![
            order(1, 34, 100, false, 5.2, 1000),
            order(2, 34, 101, false, 5.0, 500),
            order(3, 34, 102, true, 5.8, 300),
            order(4, 34, 103, true, 6.1, 200),
            // one-sided item never shows up
            order(5, 35, 100, false, 100.0, 10),
            // drained orders are ignored
            order(6, 34, 104, true, 9.9, 0),
        ];
        let books = group_order_book(&orders);
        assert_eq!(books.len(), 1);
        let book = &books[0];
        assert_eq!(book.type_id, TypeId(34));
        assert_eq!(book.best_ask.order_id, OrderId(2));
        assert_eq!(book.best_bid.order_id, OrderId(4));
        assert!((book.raw_spread_pct() - 22.0).abs() < 1e-9);
    }

    #[test]
    fn viability_rejects_thin_spreads() {
        let books = group_order_book(&[order(1, 34, 100, false, 100.0, 1000), order(2, 34, 101, true, 103.0, 1000)]);
        let filter = ViabilityFilter {
            min_spread_pct: 5.0,
            prefilter_volume: false,
        };
        assert!(!is_viable(&books[0], 0.01, &eff_ship(5000.0), &filter));
    }

    #[test]
    fn viability_volume_prefilter() {
        let books = group_order_book(&[order(1, 34, 100, false, 100.0, 2), order(2, 34, 101, true, 200.0, 1000)]);
        let ship = eff_ship(5000.0);
        let filter = ViabilityFilter {
            min_spread_pct: 5.0,
            prefilter_volume: true,
        };

        // unit volume ten times the hold: rejected
        assert!(!is_viable(&books[0], 60_000.0, &ship, &filter));
        // the best ask only covers 2 units of 10 m3 = 20 m3 < 10% of 5000
        assert!(!is_viable(&books[0], 10.0, &ship, &filter));
        // same book passes without the volume prefilter
        assert!(is_viable(&books[0], 10.0, &ship, &ViabilityFilter { min_spread_pct: 5.0, prefilter_volume: false }));
    }

    #[test]
    fn route_quantity_is_min_of_cargo_and_both_orders() {
        let books = group_order_book(&[order(1, 34, 100, false, 10.0, 700), order(2, 34, 101, true, 20.0, 450)]);
        let route = trade_route(&books[0], "Tritanium", 1.0, &eff_ship(500.0), 3, 300.0, "A", "B").unwrap();
        // cargo fits 500, ask has 700, bid wants 450
        assert_eq!(route.quantity_per_trip, 450);
    }

    #[test]
    fn route_net_subtracts_fees_and_tax() {
        let books = group_order_book(&[order(1, 34, 100, false, 100.0, 1000), order(2, 34, 101, true, 150.0, 1000)]);
        let ship = eff_ship(100.0);
        let route = trade_route(&books[0], "Tritanium", 1.0, &ship, 2, 200.0, "A", "B").unwrap();

        assert_eq!(route.quantity_per_trip, 100);
        assert!((route.gross_profit_per_trip - 5000.0).abs() < 1e-9);
        let expected_net = 5000.0 - 150.0 * 100.0 * (0.027 + 0.021) - 100.0 * 100.0 * 0.021;
        assert!((route.net_profit_per_trip - expected_net).abs() < 1e-9);
        assert!((route.isk_per_hour - expected_net * 18.0).abs() < 1e-6);
    }

    #[test]
    fn unprofitable_routes_are_dropped() {
        // 1% spread cannot survive ~7% of combined fees
        let books = group_order_book(&[order(1, 34, 100, false, 100.0, 1000), order(2, 34, 101, true, 101.0, 1000)]);
        assert!(trade_route(&books[0], "Tritanium", 1.0, &eff_ship(100.0), 2, 200.0, "A", "B").is_none());
    }

    fn route(type_id: i32, isk_per_hour: f64, net: f64, jumps: u32) -> TradeRoute {
        TradeRoute {
            type_id: TypeId(type_id),
            item_name: format!("item-{type_id}"),
            buy_station: StationId(100),
            buy_station_name: "A".to_string(),
            buy_price: 1.0,
            sell_station: StationId(101),
            sell_station_name: "B".to_string(),
            sell_price: 2.0,
            quantity_per_trip: 1,
            gross_profit_per_trip: net,
            net_profit_per_trip: net,
            jumps,
            seconds_per_trip: 60.0,
            isk_per_hour,
        }
    }

    #[test]
    fn faster_turnover_beats_larger_profit_per_trip() {
        // 50k every 180s beats 100k every 600s
        let mut routes = vec![route(2, 600_000.0, 100_000.0, 1), route(1, 1_000_000.0, 50_000.0, 1)];
        rank_routes(&mut routes);
        assert_eq!(routes[0].type_id, TypeId(1));
        assert_eq!(routes[1].type_id, TypeId(2));
    }

    #[test]
    fn ranking_tie_breaks_are_total() {
        let mut routes = vec![
            route(40, 500_000.0, 10_000.0, 4),
            route(30, 500_000.0, 10_000.0, 2),
            route(20, 500_000.0, 20_000.0, 9),
            route(10, 500_000.0, 10_000.0, 2),
        ];
        rank_routes(&mut routes);
        // larger net first, then fewer jumps, then item id
        let ids: Vec<i32> = routes.iter().map(|r| r.type_id.0).collect();
        assert_eq!(ids, vec![20, 10, 30, 40]);
    }
}

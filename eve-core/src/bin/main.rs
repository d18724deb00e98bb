use anyhow::Context;
use clap::Parser;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use std::sync::Arc;
use thousands::Separable;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use eve_core::character::CharacterContextResolver;
use eve_core::configuration::Configuration;
use eve_core::esi_client::{AuthToken, EsiClient, EsiClientTrait};
use eve_core::market_cache::{MarketCache, SharedCache};
use eve_core::reqwest_helpers::create_client;
use eve_core::route_calculator::RouteCalculator;
use eve_core::universe::StaticUniverse;
use eve_domain::{
    ActiveShip, CharacterContext, CharacterId, CharacterLocation, RegionId, RouteResult, ShipFitting, StackingPolicy, SystemId, TradingSkills, TypeId,
    WarpAwareModel,
};
use eve_store::{prepare_database, DbModelManager, DbOrderStore, OrderStore};

#[derive(Parser, Debug)]
#[command(name = "eve-route-optimizer", about = "Ranks intra-region station trades by ISK per hour")]
struct Cli {
    /// Region to trade in, e.g. 10000002 for The Forge.
    #[arg(long)]
    region_id: i32,

    #[arg(long)]
    character_id: Option<i64>,

    /// Upstream bearer token; taken from the environment so it stays out
    /// of shell history.
    #[arg(long, env = "EVE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Ship to plan for; required when no character credentials are
    /// supplied, otherwise overrides the active ship.
    #[arg(long)]
    ship_type_id: Option<i32>,

    #[arg(long)]
    avoid_lowsec: bool,

    /// Refuse to plan unless the character is docked.
    #[arg(long)]
    require_docked: bool,

    #[arg(long)]
    min_spread_pct: Option<f64>,

    #[arg(long)]
    max_routes: Option<usize>,

    /// Maintenance: delete order observations older than this many hours
    /// and exit.
    #[arg(long)]
    evict_older_than_hours: Option<i64>,
}

fn anonymous_context(ship_type: TypeId) -> CharacterContext {
    CharacterContext {
        character_id: CharacterId(0),
        location: CharacterLocation {
            system_id: SystemId(0),
            station_id: None,
        },
        active_ship: ActiveShip {
            type_id: ship_type,
            instance_id: 0,
        },
        ship_fitting: ShipFitting::default(),
        trading_skills: TradingSkills::default(),
        resolved_at: chrono::Utc::now(),
    }
}

fn print_routes(result: &RouteResult) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Item",
        "Buy at",
        "Buy",
        "Sell at",
        "Sell",
        "Qty/trip",
        "Net/trip",
        "Jumps",
        "s/trip",
        "ISK/h",
    ]);

    for route in &result.routes {
        table.add_row(vec![
            route.item_name.clone(),
            route.buy_station_name.clone(),
            format!("{:.2}", route.buy_price),
            route.sell_station_name.clone(),
            format!("{:.2}", route.sell_price),
            route.quantity_per_trip.separate_with_commas(),
            (route.net_profit_per_trip.round() as i64).separate_with_commas(),
            route.jumps.to_string(),
            format!("{:.0}", route.seconds_per_trip),
            (route.isk_per_hour.round() as i64).separate_with_commas(),
        ]);
    }

    println!("{table}");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Configuration::from_env()?;

    let universe = Arc::new(StaticUniverse::load(&config.sus_path).with_context(|| format!("loading static universe from {}", config.sus_path))?);
    let region_id = RegionId(cli.region_id);
    let region = universe.lookup_region(region_id)?;
    event!(Level::INFO, "Planning trades in {} ({})", region.display_name(), region_id);

    let pool = prepare_database(config.pg_connection_string()).await?;
    let store: Arc<dyn OrderStore> = Arc::new(DbOrderStore::new(DbModelManager::new(pool)));

    if let Some(hours) = cli.evict_older_than_hours {
        let evicted = store.evict_older_than(chrono::Duration::hours(hours)).await?;
        println!("Evicted {evicted} order observations older than {hours}h");
        return Ok(());
    }

    let http = create_client(&config.upstream_user_agent, config.rate_budget());
    let client: Arc<dyn EsiClientTrait> = Arc::new(EsiClient::try_with_base_url(http, &config.upstream_base_url)?);

    let l2 = match &config.mc_l2_url {
        Some(url) => match SharedCache::connect(url, config.mc_l2_gzip_max_decompressed).await {
            Ok(shared) => Some(shared),
            Err(e) => {
                event!(Level::WARN, "Shared cache at {} unreachable, running on L1 only: {}", url, e);
                None
            }
        },
        None => None,
    };

    let market = Arc::new(MarketCache::new(
        client.clone(),
        store.clone(),
        l2,
        config.bp_workers,
        config.market_cache_config(),
    ));
    let resolver = CharacterContextResolver::new(client.clone(), config.bp_workers);

    let cancel = CancellationToken::new();
    let ship_choice = cli.ship_type_id.map(TypeId);

    let ctx = match (cli.character_id, cli.access_token.as_deref()) {
        (Some(character_id), Some(token)) => {
            let token = AuthToken(token.to_string());
            let verified = resolver.verify(&token, cancel.clone()).await?;
            event!(Level::INFO, "Token verified for {} ({})", verified.character_name, verified.character_id);
            resolver
                .resolve(CharacterId(character_id), &token, ship_choice, cancel.clone())
                .await?
        }
        _ => {
            let Some(ship_type) = ship_choice else {
                anyhow::bail!("--ship-type-id is required when no character credentials are supplied");
            };
            event!(Level::INFO, "No character credentials supplied, planning with conservative defaults");
            anonymous_context(ship_type)
        }
    };

    let calculator = RouteCalculator::new(market, universe, Arc::new(WarpAwareModel::default()), StackingPolicy::default());

    let mut options = config.route_options();
    options.avoid_lowsec = cli.avoid_lowsec;
    options.require_docked = cli.require_docked;
    if let Some(min_spread_pct) = cli.min_spread_pct {
        options.min_spread_pct = min_spread_pct;
    }
    if let Some(max_routes) = cli.max_routes {
        options.max_routes = max_routes;
    }

    let started = std::time::Instant::now();
    let result = calculator
        .compute_routes(region_id, ship_choice, &ctx, &options, cancel)
        .await?;

    event!(
        Level::INFO,
        "Ranked {} routes in {:?} (snapshot captured {})",
        result.routes.len(),
        started.elapsed(),
        result.captured_at
    );
    if let Some(reason) = &result.partial_reason {
        event!(Level::WARN, "Result is partial: {}", reason);
    }

    print_routes(&result);
    Ok(())
}

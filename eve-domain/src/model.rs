use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use strum::Display as StrumDisplay;

use crate::error::{Error, Result};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct RegionId(pub i32);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SystemId(pub i32);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct StationId(pub i64);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TypeId(pub i32);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct CharacterId(pub i64);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct OrderId(pub i64);

impl Display for RegionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for SystemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for StationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for TypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for CharacterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Solar system ids occupy a fixed numeric band in the static data export.
/// Station resolution uses this to detect callers that hand us a system id
/// where a station id was expected.
pub const SYSTEM_ID_RANGE: std::ops::Range<i64> = 30_000_000..32_000_000;

/// Player-owned structures live above the NPC id space and are absent from
/// the static data export.
pub const STRUCTURE_ID_FLOOR: i64 = 1_000_000_000_000;

// ---------------------------------------------------------------------------
// static universe entities
// ---------------------------------------------------------------------------

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Item {
    pub type_id: TypeId,
    pub name: String,
    pub volume_m3: f64,
    pub category: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, StrumDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum SlotClass {
    Hi,
    Med,
    Low,
    Rig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ShipTypeInfo {
    pub type_id: TypeId,
    pub name: String,
    pub base_cargo_m3: f64,
    pub base_warp_speed_au_s: f64,
    pub base_align_s: f64,
    pub slot_layout: SlotLayout,
    pub racial_family: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotLayout {
    pub hi: u8,
    pub med: u8,
    pub low: u8,
    pub rig: u8,
}

/// Attribute keys of fitted modules, as found in the static data export.
pub mod attr {
    /// Additional cargo capacity as a fractional bonus per instance (0.175
    /// for an Expanded Cargohold I).
    pub const CARGO_BONUS: &str = "cargoBonusPct";
    /// Warp speed multiplier per instance (1.2 for a hyperspatial rig).
    pub const WARP_SPEED_MULTIPLIER: &str = "warpSpeedMultiplier";
    /// Inertia multiplier per instance (0.85 reduces align time by 15%).
    pub const INERTIA_MODIFIER: &str = "inertiaModifier";
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ModuleTypeInfo {
    pub type_id: TypeId,
    pub name: String,
    pub slot_class: SlotClass,
    pub attributes: HashMap<String, f64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Station {
    pub station_id: StationId,
    pub system_id: SystemId,
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SolarSystem {
    pub system_id: SystemId,
    pub region_id: RegionId,
    pub name: String,
    pub security_status: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Region {
    pub region_id: RegionId,
    /// Localized names keyed by locale code ("en", "de", ...).
    pub name: HashMap<String, String>,
}

impl Region {
    /// English name if present, otherwise any available locale, otherwise
    /// the numeric id.
    pub fn display_name(&self) -> String {
        if let Some(en) = self.name.get("en") {
            return en.clone();
        }
        let mut locales: Vec<&String> = self.name.keys().collect();
        locales.sort();
        locales
            .first()
            .and_then(|locale| self.name.get(*locale))
            .cloned()
            .unwrap_or_else(|| self.region_id.to_string())
    }
}

/// A station reference produced by station resolution. Player structures
/// are not in the static export; they resolve to a synthetic label with an
/// unknown system.
#[derive(Debug, Clone, PartialEq)]
pub struct StationRef {
    pub station_id: StationId,
    pub system_id: Option<SystemId>,
    pub name: String,
}

// ---------------------------------------------------------------------------
// market orders
// ---------------------------------------------------------------------------

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub order_id: OrderId,
    pub type_id: TypeId,
    pub region_id: RegionId,
    pub location_id: StationId,
    pub is_buy_order: bool,
    pub price: f64,
    pub volume_total: i32,
    pub volume_remain: i32,
    pub min_volume: Option<i32>,
    pub issued: DateTime<Utc>,
    pub duration: i32,
    pub fetched_at: DateTime<Utc>,
}

impl MarketOrder {
    /// The repository-level row invariants. Rows violating these never
    /// enter the order store.
    pub fn validate(&self) -> Result<()> {
        if self.price <= 0.0 {
            return Err(Error::validation(format!("order {} has non-positive price {}", self.order_id.0, self.price)));
        }
        if self.volume_remain < 0 || self.volume_remain > self.volume_total {
            return Err(Error::validation(format!(
                "order {} has volume_remain {} outside 0..={}",
                self.order_id.0, self.volume_remain, self.volume_total
            )));
        }
        Ok(())
    }
}

/// The upstream wire shape of a single order, region-agnostic. Pages of
/// these get stamped with the region and fetch time on ingestion.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EsiOrder {
    pub order_id: i64,
    pub type_id: i32,
    pub location_id: i64,
    pub is_buy_order: bool,
    pub price: f64,
    pub volume_total: i32,
    pub volume_remain: i32,
    #[serde(default)]
    pub min_volume: Option<i32>,
    pub issued: DateTime<Utc>,
    pub duration: i32,
    #[serde(default)]
    pub range: Option<String>,
}

impl EsiOrder {
    pub fn into_market_order(self, region_id: RegionId, fetched_at: DateTime<Utc>) -> MarketOrder {
        MarketOrder {
            order_id: OrderId(self.order_id),
            type_id: TypeId(self.type_id),
            region_id,
            location_id: StationId(self.location_id),
            is_buy_order: self.is_buy_order,
            price: self.price,
            volume_total: self.volume_total,
            volume_remain: self.volume_remain,
            min_volume: self.min_volume,
            issued: self.issued,
            duration: self.duration,
            fetched_at,
        }
    }
}

/// A sealed, region-scoped materialization of the order book. A new
/// snapshot replaces the previous one wholesale.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RegionOrderBook {
    pub region_id: RegionId,
    pub orders: Vec<MarketOrder>,
    pub captured_at: DateTime<Utc>,
    pub upstream_expires_at: Option<DateTime<Utc>>,
    /// False when the ingest deadline expired before every page landed.
    /// Partial snapshots are served but never written to the shared cache.
    pub complete: bool,
}

// ---------------------------------------------------------------------------
// character context
// ---------------------------------------------------------------------------

/// Well-known trade-relevant skill ids from the static data export.
pub mod skill {
    pub const ACCOUNTING: i32 = 16622;
    pub const BROKER_RELATIONS: i32 = 3446;
    pub const NAVIGATION: i32 = 3449;
    pub const EVASIVE_MANEUVERING: i32 = 3453;
    /// The racial industrial skills all grant the same +5%/level cargo
    /// bonus on their hulls; any of them counts.
    pub const RACIAL_INDUSTRIALS: [i32; 4] = [3340, 3341, 3342, 3343];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterLocation {
    pub system_id: SystemId,
    /// Absent means the character is in space.
    pub station_id: Option<StationId>,
}

impl CharacterLocation {
    pub fn is_docked(&self) -> bool {
        self.station_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveShip {
    pub type_id: TypeId,
    /// The specific hull instance; fitted modules reference it as their
    /// location.
    pub instance_id: i64,
}

/// Skill levels and standings that feed the attribute engine. All levels
/// default to zero, which is the conservative floor (worst fees, smallest
/// cargo, slowest ship).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TradingSkills {
    pub accounting: u8,
    pub broker_relations: u8,
    pub navigation: u8,
    pub evasive_maneuvering: u8,
    pub racial_industrial: u8,
    pub faction_standing: f64,
    pub corp_standing: f64,
}

impl TradingSkills {
    /// Projects a raw `skill_id -> level` map onto the named skills the
    /// attribute engine cares about.
    pub fn from_skill_levels(levels: &HashMap<i32, u8>) -> Self {
        let racial_industrial = skill::RACIAL_INDUSTRIALS
            .iter()
            .filter_map(|id| levels.get(id).copied())
            .max()
            .unwrap_or(0);
        TradingSkills {
            accounting: levels.get(&skill::ACCOUNTING).copied().unwrap_or(0),
            broker_relations: levels.get(&skill::BROKER_RELATIONS).copied().unwrap_or(0),
            navigation: levels.get(&skill::NAVIGATION).copied().unwrap_or(0),
            evasive_maneuvering: levels.get(&skill::EVASIVE_MANEUVERING).copied().unwrap_or(0),
            racial_industrial,
            faction_standing: 0.0,
            corp_standing: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShipFitting {
    pub modules_by_slot: Vec<(SlotClass, TypeId)>,
}

impl ShipFitting {
    pub fn fitted_type_ids(&self) -> Vec<TypeId> {
        self.modules_by_slot.iter().map(|(_, type_id)| *type_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterContext {
    pub character_id: CharacterId,
    pub location: CharacterLocation,
    pub active_ship: ActiveShip,
    pub ship_fitting: ShipFitting,
    pub trading_skills: TradingSkills,
    pub resolved_at: DateTime<Utc>,
}

/// Identity behind a supplied token, as reported by the verify endpoint.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct VerifiedCharacter {
    #[serde(rename = "CharacterID")]
    pub character_id: i64,
    #[serde(rename = "CharacterName")]
    pub character_name: String,
    #[serde(rename = "Scopes", default)]
    pub scopes: String,
}

// ---------------------------------------------------------------------------
// upstream wire shapes for character endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct EsiLocation {
    pub solar_system_id: i32,
    #[serde(default)]
    pub station_id: Option<i64>,
    #[serde(default)]
    pub structure_id: Option<i64>,
}

impl EsiLocation {
    pub fn into_location(self) -> CharacterLocation {
        CharacterLocation {
            system_id: SystemId(self.solar_system_id),
            station_id: self.station_id.or(self.structure_id).map(StationId),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct EsiShip {
    pub ship_type_id: i32,
    pub ship_item_id: i64,
    pub ship_name: String,
}

impl EsiShip {
    pub fn into_active_ship(self) -> ActiveShip {
        ActiveShip {
            type_id: TypeId(self.ship_type_id),
            instance_id: self.ship_item_id,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct EsiSkillEntry {
    pub skill_id: i32,
    pub trained_skill_level: u8,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct EsiSkills {
    pub skills: Vec<EsiSkillEntry>,
}

impl EsiSkills {
    pub fn into_levels(self) -> HashMap<i32, u8> {
        self.skills
            .into_iter()
            .map(|entry| (entry.skill_id, entry.trained_skill_level))
            .collect()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EsiAsset {
    pub item_id: i64,
    pub type_id: i32,
    pub location_id: i64,
    pub location_flag: String,
    pub is_singleton: bool,
    pub quantity: i32,
}

impl EsiAsset {
    /// Fitted modules sit in the slot-tagged locations of their hull;
    /// everything else is hangar or cargo content.
    pub fn fitted_slot_class(&self) -> Option<SlotClass> {
        let flag = self.location_flag.as_str();
        let (slot_no, class, max_slot) = if let Some(digits) = flag.strip_prefix("HiSlot") {
            (digits, SlotClass::Hi, 7u8)
        } else if let Some(digits) = flag.strip_prefix("MedSlot") {
            (digits, SlotClass::Med, 7)
        } else if let Some(digits) = flag.strip_prefix("LoSlot") {
            (digits, SlotClass::Low, 7)
        } else if let Some(digits) = flag.strip_prefix("RigSlot") {
            (digits, SlotClass::Rig, 2)
        } else {
            return None;
        };
        slot_no
            .parse::<u8>()
            .ok()
            .filter(|n| *n <= max_slot)
            .map(|_| class)
    }
}

// ---------------------------------------------------------------------------
// effective ship & routes
// ---------------------------------------------------------------------------

/// Derived hauler characteristics after skills and fitting are applied.
/// Computed on demand, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveShip {
    pub effective_cargo_m3: f64,
    pub effective_warp_speed_au_s: f64,
    pub effective_align_s: f64,
    pub sales_tax_rate: f64,
    pub broker_fee_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRoute {
    pub type_id: TypeId,
    pub item_name: String,
    pub buy_station: StationId,
    pub buy_station_name: String,
    pub buy_price: f64,
    pub sell_station: StationId,
    pub sell_station_name: String,
    pub sell_price: f64,
    pub quantity_per_trip: i64,
    pub gross_profit_per_trip: f64,
    pub net_profit_per_trip: f64,
    pub jumps: u32,
    pub seconds_per_trip: f64,
    pub isk_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteResult {
    pub routes: Vec<TradeRoute>,
    pub partial: bool,
    pub partial_reason: Option<String>,
    pub captured_at: DateTime<Utc>,
}

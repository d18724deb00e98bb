use itertools::Itertools;
use pathfinding::prelude::bfs;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use eve_domain::{
    Error, Item, ModuleTypeInfo, Region, RegionId, Result, ShipTypeInfo, SolarSystem, Station, StationId, StationRef, SystemId, TypeId, STRUCTURE_ID_FLOOR,
    SYSTEM_ID_RANGE,
};

/// Systems at or above this security rating count as highsec for route
/// avoidance.
pub const HIGHSEC_THRESHOLD: f64 = 0.5;

/// The on-disk shape of the prebuilt universe file.
#[derive(Debug, Clone, Deserialize)]
pub struct UniverseData {
    pub items: Vec<Item>,
    pub ships: Vec<ShipTypeInfo>,
    pub modules: Vec<ModuleTypeInfo>,
    pub regions: Vec<Region>,
    pub systems: Vec<SolarSystem>,
    pub stations: Vec<Station>,
    /// Undirected stargate edges between system ids.
    pub stargates: Vec<(i32, i32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    pub jumps: u32,
    pub path: Vec<SystemId>,
    /// Set when lowsec avoidance found no route and the full graph was
    /// used instead.
    pub lowsec_fallback: bool,
}

/// Read-only universe lookups, loaded once at startup and shared across
/// tasks. The stargate graph lives in a dense adjacency arena; lookups
/// never suspend.
#[derive(Debug)]
pub struct StaticUniverse {
    items: HashMap<TypeId, Item>,
    ships: HashMap<TypeId, ShipTypeInfo>,
    modules: HashMap<TypeId, ModuleTypeInfo>,
    regions: HashMap<RegionId, Region>,
    systems: HashMap<SystemId, SolarSystem>,
    stations: HashMap<StationId, Station>,
    system_index: HashMap<SystemId, u32>,
    index_system: Vec<SystemId>,
    adjacency: Vec<Vec<u32>>,
}

impl StaticUniverse {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let data: UniverseData = serde_json::from_slice(&raw)?;
        Ok(Self::from_data(data))
    }

    pub fn from_data(data: UniverseData) -> Self {
        let items = data.items.into_iter().map(|item| (item.type_id, item)).collect();
        let ships = data.ships.into_iter().map(|ship| (ship.type_id, ship)).collect();
        let modules = data.modules.into_iter().map(|module| (module.type_id, module)).collect();
        let regions = data.regions.into_iter().map(|region| (region.region_id, region)).collect();
        let systems: HashMap<SystemId, SolarSystem> = data.systems.into_iter().map(|system| (system.system_id, system)).collect();
        let stations = data.stations.into_iter().map(|station| (station.station_id, station)).collect();

        let index_system: Vec<SystemId> = systems.keys().copied().sorted().collect();
        let system_index: HashMap<SystemId, u32> = index_system
            .iter()
            .enumerate()
            .map(|(index, system_id)| (*system_id, index as u32))
            .collect();

        let mut adjacency = vec![Vec::new(); index_system.len()];
        for (a, b) in data.stargates {
            let (Some(&ia), Some(&ib)) = (system_index.get(&SystemId(a)), system_index.get(&SystemId(b))) else {
                continue;
            };
            if ia != ib {
                adjacency[ia as usize].push(ib);
                adjacency[ib as usize].push(ia);
            }
        }
        for neighbours in &mut adjacency {
            neighbours.sort_unstable();
            neighbours.dedup();
        }

        StaticUniverse {
            items,
            ships,
            modules,
            regions,
            systems,
            stations,
            system_index,
            index_system,
            adjacency,
        }
    }

    pub fn lookup_item(&self, type_id: TypeId) -> Result<&Item> {
        self.items
            .get(&type_id)
            .ok_or_else(|| Error::not_found(format!("item type {type_id}")))
    }

    pub fn lookup_ship(&self, type_id: TypeId) -> Result<&ShipTypeInfo> {
        self.ships
            .get(&type_id)
            .ok_or_else(|| Error::not_found(format!("ship type {type_id}")))
    }

    pub fn lookup_module(&self, type_id: TypeId) -> Result<&ModuleTypeInfo> {
        self.modules
            .get(&type_id)
            .ok_or_else(|| Error::not_found(format!("module type {type_id}")))
    }

    pub fn lookup_region(&self, region_id: RegionId) -> Result<&Region> {
        self.regions
            .get(&region_id)
            .ok_or_else(|| Error::not_found(format!("region {region_id}")))
    }

    pub fn system_region(&self, system_id: SystemId) -> Result<RegionId> {
        self.systems
            .get(&system_id)
            .map(|system| system.region_id)
            .ok_or_else(|| Error::not_found(format!("system {system_id}")))
    }

    /// Resolves a location id to a station reference. Ids in the solar
    /// system band are treated as systems handed over in place of a
    /// station; ids above the NPC space are player structures and resolve
    /// to a synthetic label with an unknown system.
    pub fn resolve_station(&self, station_id: StationId) -> Result<StationRef> {
        if let Some(station) = self.stations.get(&station_id) {
            return Ok(StationRef {
                station_id,
                system_id: Some(station.system_id),
                name: station.name.clone(),
            });
        }

        if SYSTEM_ID_RANGE.contains(&station_id.0) {
            let system_id = SystemId(station_id.0 as i32);
            if let Some(system) = self.systems.get(&system_id) {
                return Ok(StationRef {
                    station_id,
                    system_id: Some(system_id),
                    name: system.name.clone(),
                });
            }
        }

        if station_id.0 >= STRUCTURE_ID_FLOOR {
            return Ok(StationRef {
                station_id,
                system_id: None,
                name: format!("Structure {}", station_id.0),
            });
        }

        Err(Error::not_found(format!("station {station_id}")))
    }

    /// Unweighted breadth-first shortest path across the stargate graph.
    /// With `avoid_lowsec`, edges touching a sub-0.5 system are excluded;
    /// when that leaves no route, the full graph decides and the result
    /// is flagged.
    pub fn shortest_path(&self, from: SystemId, to: SystemId, avoid_lowsec: bool) -> Result<PathResult> {
        let start = *self
            .system_index
            .get(&from)
            .ok_or_else(|| Error::not_found(format!("system {from}")))?;
        let goal = *self
            .system_index
            .get(&to)
            .ok_or_else(|| Error::not_found(format!("system {to}")))?;

        if avoid_lowsec {
            if let Some(path) = self.bfs_indices(start, goal, true) {
                return Ok(self.to_path_result(path, false));
            }
            return self
                .bfs_indices(start, goal, false)
                .map(|path| self.to_path_result(path, true))
                .ok_or_else(|| Error::not_found(format!("no stargate route from {from} to {to}")));
        }

        self.bfs_indices(start, goal, false)
            .map(|path| self.to_path_result(path, false))
            .ok_or_else(|| Error::not_found(format!("no stargate route from {from} to {to}")))
    }

    fn bfs_indices(&self, start: u32, goal: u32, highsec_only: bool) -> Option<Vec<u32>> {
        if highsec_only && !self.is_highsec(start) {
            return None;
        }
        bfs(
            &start,
            |&index| {
                self.adjacency[index as usize]
                    .iter()
                    .copied()
                    .filter(|&neighbour| !highsec_only || self.is_highsec(neighbour))
                    .collect_vec()
            },
            |&index| index == goal,
        )
    }

    fn is_highsec(&self, index: u32) -> bool {
        let system_id = self.index_system[index as usize];
        self.systems
            .get(&system_id)
            .map(|system| system.security_status >= HIGHSEC_THRESHOLD)
            .unwrap_or(false)
    }

    fn to_path_result(&self, indices: Vec<u32>, lowsec_fallback: bool) -> PathResult {
        let path: Vec<SystemId> = indices.iter().map(|&index| self.index_system[index as usize]).collect();
        PathResult {
            jumps: (path.len().saturating_sub(1)) as u32,
            path,
            lowsec_fallback,
        }
    }

    /// All known regions, alphabetized by localized display name.
    pub fn all_regions(&self) -> Vec<&Region> {
        self.regions
            .values()
            .sorted_by_key(|region| (region.display_name(), region.region_id))
            .collect_vec()
    }

    /// Case-insensitive substring search over item names, deterministic
    /// ordering by name then id.
    pub fn search_items(&self, term: &str, limit: usize) -> Vec<&Item> {
        let needle = term.to_lowercase();
        self.items
            .values()
            .filter(|item| item.name.to_lowercase().contains(&needle))
            .sorted_by_key(|item| (item.name.clone(), item.type_id))
            .take(limit)
            .collect_vec()
    }
}

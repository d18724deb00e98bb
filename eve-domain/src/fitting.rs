use crate::model::{attr, EffectiveShip, ModuleTypeInfo, ShipTypeInfo, TradingSkills};

/// Whether the diminishing-returns curve applies to repeated instances of
/// the same attribute class. Cargo bonuses are confirmed non-penalized;
/// warp and inertia follow the game's stacking curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackingPolicy {
    pub cargo: bool,
    pub warp: bool,
    pub inertia: bool,
}

impl Default for StackingPolicy {
    fn default() -> Self {
        StackingPolicy {
            cargo: false,
            warp: true,
            inertia: true,
        }
    }
}

const SALES_TAX_BASE: f64 = 0.036;
const SALES_TAX_PER_LEVEL: f64 = 0.003;
const BROKER_FEE_BASE: f64 = 0.03;
const BROKER_FEE_PER_LEVEL: f64 = 0.003;
const BROKER_FEE_PER_FACTION_STANDING: f64 = 0.0003;
const BROKER_FEE_PER_CORP_STANDING: f64 = 0.0002;
const BROKER_FEE_FLOOR: f64 = 0.0025;

/// Combines base hull attributes, skills, and fitted modules into the
/// derived figures route computation runs on. Pure and deterministic.
pub fn effective_ship(ship: &ShipTypeInfo, skills: &TradingSkills, modules: &[ModuleTypeInfo], policy: StackingPolicy) -> EffectiveShip {
    let cargo_multipliers: Vec<f64> = modules
        .iter()
        .filter_map(|m| m.attributes.get(attr::CARGO_BONUS))
        .map(|bonus| 1.0 + bonus)
        .collect();
    let warp_multipliers: Vec<f64> = modules
        .iter()
        .filter_map(|m| m.attributes.get(attr::WARP_SPEED_MULTIPLIER))
        .copied()
        .collect();
    let inertia_multipliers: Vec<f64> = modules
        .iter()
        .filter_map(|m| m.attributes.get(attr::INERTIA_MODIFIER))
        .copied()
        .collect();

    let effective_cargo_m3 = ship.base_cargo_m3
        * (1.0 + 0.05 * skills.racial_industrial as f64)
        * combine_multipliers(&cargo_multipliers, policy.cargo);
    let effective_warp_speed_au_s = ship.base_warp_speed_au_s
        * (1.0 + 0.10 * skills.navigation as f64)
        * combine_multipliers(&warp_multipliers, policy.warp);
    let effective_align_s = ship.base_align_s
        * (1.0 - 0.05 * skills.evasive_maneuvering as f64)
        * combine_multipliers(&inertia_multipliers, policy.inertia);

    EffectiveShip {
        effective_cargo_m3,
        effective_warp_speed_au_s,
        effective_align_s,
        sales_tax_rate: sales_tax(skills.accounting),
        broker_fee_rate: broker_fee(skills.broker_relations, skills.faction_standing, skills.corp_standing),
    }
}

pub fn sales_tax(accounting_level: u8) -> f64 {
    (SALES_TAX_BASE - SALES_TAX_PER_LEVEL * accounting_level as f64).max(0.0)
}

pub fn broker_fee(broker_relations_level: u8, faction_standing: f64, corp_standing: f64) -> f64 {
    let rate = BROKER_FEE_BASE
        - BROKER_FEE_PER_LEVEL * broker_relations_level as f64
        - BROKER_FEE_PER_FACTION_STANDING * faction_standing
        - BROKER_FEE_PER_CORP_STANDING * corp_standing;
    rate.max(BROKER_FEE_FLOOR)
}

/// Folds per-instance multipliers into one factor. With the penalty, the
/// strongest instance applies in full and the n-th (1-based, ordered by
/// descending effect) is scaled by `0.5^((n-1)^2)`.
fn combine_multipliers(multipliers: &[f64], stacking_penalized: bool) -> f64 {
    if !stacking_penalized {
        return multipliers.iter().product();
    }

    let mut ordered = multipliers.to_vec();
    ordered.sort_by(|a, b| {
        (b - 1.0)
            .abs()
            .partial_cmp(&(a - 1.0).abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    ordered
        .iter()
        .enumerate()
        .map(|(i, multiplier)| {
            let bonus = multiplier - 1.0;
            1.0 + bonus * stacking_factor(i)
        })
        .product()
}

fn stacking_factor(index: usize) -> f64 {
    let n = index as f64;
    0.5_f64.powf(n * n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SlotClass, SlotLayout, TypeId};
    use std::collections::HashMap;

    fn hauler_650() -> ShipTypeInfo {
        ShipTypeInfo {
            type_id: TypeId(650),
            name: "Nereus".to_string(),
            base_cargo_m3: 2700.0,
            base_warp_speed_au_s: 3.4,
            base_align_s: 10.8,
            slot_layout: SlotLayout { hi: 2, med: 4, low: 4, rig: 3 },
            racial_family: "Gallente".to_string(),
        }
    }

    fn module_with(slot: SlotClass, key: &str, value: f64) -> ModuleTypeInfo {
        ModuleTypeInfo {
            type_id: TypeId(1319),
            name: format!("{key} module"),
            slot_class: slot,
            attributes: HashMap::from([(key.to_string(), value)]),
        }
    }

    fn expanded_cargohold() -> ModuleTypeInfo {
        module_with(SlotClass::Low, attr::CARGO_BONUS, 0.175)
    }

    fn cargohold_optimization_rig() -> ModuleTypeInfo {
        module_with(SlotClass::Rig, attr::CARGO_BONUS, 0.15)
    }

    #[test]
    fn cargo_calibration_against_in_game_values() {
        // 5x Expanded Cargohold I, 3x Medium Cargohold Optimization I,
        // racial industrial at level 1.
        let mut modules = vec![expanded_cargohold(); 5];
        modules.extend(vec![cargohold_optimization_rig(); 3]);
        let skills = TradingSkills {
            racial_industrial: 1,
            ..Default::default()
        };

        let eff = effective_ship(&hauler_650(), &skills, &modules, StackingPolicy::default());

        let expected = 9641.0;
        let deviation = (eff.effective_cargo_m3 - expected).abs() / expected;
        assert!(deviation < 0.002, "cargo {} deviates {:.4} from {}", eff.effective_cargo_m3, deviation, expected);
    }

    #[test]
    fn cargo_bonuses_are_not_stacking_penalized() {
        let modules = vec![expanded_cargohold(); 2];
        let eff = effective_ship(&hauler_650(), &TradingSkills::default(), &modules, StackingPolicy::default());
        let expected = 2700.0 * 1.175 * 1.175;
        assert!((eff.effective_cargo_m3 - expected).abs() < 1e-9);
    }

    #[test]
    fn sales_tax_scales_with_accounting() {
        assert!((sales_tax(0) - 0.036).abs() < 1e-12);
        assert!((sales_tax(3) - 0.027).abs() < 1e-12);
        assert!((sales_tax(5) - 0.021).abs() < 1e-12);
    }

    #[test]
    fn sales_tax_never_goes_negative() {
        // not reachable through the 0..=5 skill range, but the floor holds
        assert!(sales_tax(20) >= 0.0);
    }

    #[test]
    fn broker_fee_clamps_to_floor() {
        // high skills and standings push the raw rate below 0.25%
        let fee = broker_fee(5, 10.0, 10.0);
        assert!((fee - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn broker_fee_mid_range() {
        let fee = broker_fee(3, 0.0, 0.0);
        assert!((fee - 0.021).abs() < 1e-12);
    }

    #[test]
    fn warp_multipliers_follow_stacking_curve() {
        // two identical +20% hyperspatial multipliers: the second is halved
        let modules = vec![
            module_with(SlotClass::Rig, attr::WARP_SPEED_MULTIPLIER, 1.2),
            module_with(SlotClass::Rig, attr::WARP_SPEED_MULTIPLIER, 1.2),
        ];
        let eff = effective_ship(&hauler_650(), &TradingSkills::default(), &modules, StackingPolicy::default());
        let expected = 3.4 * 1.2 * 1.1;
        assert!((eff.effective_warp_speed_au_s - expected).abs() < 1e-9);
    }

    #[test]
    fn stacking_penalty_orders_by_strongest_first() {
        let modules = vec![
            module_with(SlotClass::Rig, attr::WARP_SPEED_MULTIPLIER, 1.1),
            module_with(SlotClass::Rig, attr::WARP_SPEED_MULTIPLIER, 1.2),
        ];
        let eff = effective_ship(&hauler_650(), &TradingSkills::default(), &modules, StackingPolicy::default());
        // 1.2 applies unpenalized, 1.1 is halved to 1.05
        let expected = 3.4 * 1.2 * 1.05;
        assert!((eff.effective_warp_speed_au_s - expected).abs() < 1e-9);
    }

    #[test]
    fn inertia_modules_shorten_align_time() {
        let modules = vec![module_with(SlotClass::Low, attr::INERTIA_MODIFIER, 0.85)];
        let skills = TradingSkills {
            evasive_maneuvering: 2,
            ..Default::default()
        };
        let eff = effective_ship(&hauler_650(), &skills, &modules, StackingPolicy::default());
        let expected = 10.8 * 0.9 * 0.85;
        assert!((eff.effective_align_s - expected).abs() < 1e-9);
    }

    #[test]
    fn stacking_policy_can_disable_the_curve() {
        let modules = vec![
            module_with(SlotClass::Rig, attr::WARP_SPEED_MULTIPLIER, 1.2),
            module_with(SlotClass::Rig, attr::WARP_SPEED_MULTIPLIER, 1.2),
        ];
        let policy = StackingPolicy {
            warp: false,
            ..Default::default()
        };
        let eff = effective_ship(&hauler_650(), &TradingSkills::default(), &modules, policy);
        let expected = 3.4 * 1.2 * 1.2;
        assert!((eff.effective_warp_speed_au_s - expected).abs() < 1e-9);
    }

    #[test]
    fn derivation_is_referentially_stable() {
        let modules = vec![expanded_cargohold(), cargohold_optimization_rig()];
        let skills = TradingSkills {
            accounting: 4,
            broker_relations: 2,
            navigation: 5,
            evasive_maneuvering: 3,
            racial_industrial: 5,
            faction_standing: 2.5,
            corp_standing: 1.0,
        };
        let a = effective_ship(&hauler_650(), &skills, &modules, StackingPolicy::default());
        let b = effective_ship(&hauler_650(), &skills, &modules, StackingPolicy::default());
        assert_eq!(a, b);
    }
}

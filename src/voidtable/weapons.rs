//! Pluggable weapon registry.
//!
//! Weapons are data, not behavior: a small table of id → stats that characters
//! and enemy templates reference by id. Embedders can extend the registry at
//! runtime for custom arsenals.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Broad damage classification used in status displays and morale logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageKind {
    Lethal,
    Stun,
    Mixed,
}

impl DamageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DamageKind::Lethal => "lethal",
            DamageKind::Stun => "stun",
            DamageKind::Mixed => "mixed",
        }
    }
}

/// Range bands a weapon can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeBand {
    Engaged,
    Near,
    Far,
    Extreme,
}

/// One weapon's stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Weapon {
    pub id: String,
    pub name: String,
    pub damage: i32,
    pub damage_kind: DamageKind,
    pub max_range: RangeBand,
}

impl Weapon {
    fn new(id: &str, name: &str, damage: i32, damage_kind: DamageKind, max_range: RangeBand) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            damage,
            damage_kind,
            max_range,
        }
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Weapon>> = {
        let mut m = HashMap::new();
        for weapon in [
            Weapon::new("fists", "Fists", 2, DamageKind::Stun, RangeBand::Engaged),
            Weapon::new("combat_knife", "Combat Knife", 4, DamageKind::Lethal, RangeBand::Engaged),
            Weapon::new("stun_baton", "Stun Baton", 5, DamageKind::Stun, RangeBand::Engaged),
            Weapon::new("pistol", "Pistol", 6, DamageKind::Lethal, RangeBand::Near),
            Weapon::new("heavy_pistol", "Heavy Pistol", 7, DamageKind::Lethal, RangeBand::Near),
            Weapon::new("smg", "Machine Pistol", 6, DamageKind::Lethal, RangeBand::Near),
            Weapon::new("shock_rifle", "Shock Rifle", 7, DamageKind::Mixed, RangeBand::Far),
            Weapon::new("rifle", "Combat Rifle", 8, DamageKind::Lethal, RangeBand::Far),
            Weapon::new("marksman_rifle", "Marksman Rifle", 9, DamageKind::Lethal, RangeBand::Extreme),
            Weapon::new("resonance_blade", "Resonance Blade", 7, DamageKind::Lethal, RangeBand::Engaged),
            Weapon::new("void_lash", "Void Lash", 8, DamageKind::Mixed, RangeBand::Near),
        ] {
            m.insert(weapon.id.clone(), weapon);
        }
        Mutex::new(m)
    };
}

/// Look up a weapon by id.
pub fn get_weapon(id: &str) -> Option<Weapon> {
    REGISTRY.lock().expect("weapon registry poisoned").get(id).cloned()
}

/// Register or replace a weapon definition.
pub fn register_weapon(weapon: Weapon) {
    REGISTRY
        .lock()
        .expect("weapon registry poisoned")
        .insert(weapon.id.clone(), weapon);
}

/// Ids currently known to the registry (sorted).
pub fn available_weapons() -> Vec<String> {
    let mut ids: Vec<String> = REGISTRY
        .lock()
        .expect("weapon registry poisoned")
        .keys()
        .cloned()
        .collect();
    ids.sort();
    ids
}

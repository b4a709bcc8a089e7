//! Character sheets and derived combat state.
//!
//! [`CharacterSheet`] is the persistent identity (attributes, skills, goals,
//! bonds, inventory); [`CombatState`] is the derived per-session layer
//! (health, wounds, buffs, position) that resets between sessions.

use crate::voidtable::dice::DiceRoller;
use crate::voidtable::economy::{default_inventory, Element, EnergyInventory, Seed};
use crate::voidtable::mechanics::Attribute;
use crate::voidtable::weapons::{get_weapon, Weapon};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Personality dials that steer template actions and prompt tone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalityProfile {
    #[serde(default = "default_dial")]
    pub risk_tolerance: i32,
    #[serde(default = "default_dial")]
    pub void_curiosity: i32,
    #[serde(default)]
    pub bond_preference: String,
    #[serde(default = "default_dial")]
    pub ritual_conservatism: i32,
}

fn default_dial() -> i32 {
    5
}

impl Default for PersonalityProfile {
    fn default() -> Self {
        Self {
            risk_tolerance: 5,
            void_curiosity: 3,
            bond_preference: String::new(),
            ritual_conservatism: 5,
        }
    }
}

/// A character's persistent sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterSheet {
    pub name: String,
    #[serde(default = "default_pronouns")]
    pub pronouns: String,
    pub faction: String,
    pub attributes: HashMap<String, i32>,
    pub skills: HashMap<String, i32>,
    #[serde(default)]
    pub void_score: i32,
    #[serde(default)]
    pub soulcredit: i32,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub bonds: Vec<String>,
    #[serde(default)]
    pub inventory: BTreeMap<String, i32>,
    #[serde(skip)]
    pub energy_inventory: EnergyInventory,
    #[serde(default)]
    pub personality: PersonalityProfile,
}

fn default_pronouns() -> String {
    "they/them".to_string()
}

impl CharacterSheet {
    /// Finish construction: fill missing inventory slots, seed the wallet,
    /// and grant the faction starter seed.
    pub fn initialize(&mut self, dice: &DiceRoller) {
        if self.inventory.is_empty() {
            self.inventory = default_inventory();
        }

        if self.energy_inventory.seeds.is_empty()
            && self.energy_inventory.breath == 0
            && self.energy_inventory.spark == 0
        {
            self.energy_inventory = EnergyInventory::starting(dice);
            if self.faction.contains("Tempest") {
                self.energy_inventory.add_seed(Seed::hollow("tempest_supply"));
            } else if self.faction.contains("Sovereign") || self.faction.contains("Pantheon") {
                self.energy_inventory
                    .add_seed(Seed::attuned(Element::Spirit, "nexus_sanctified"));
            } else {
                self.energy_inventory.add_seed(Seed::raw("leyline_harvest", dice));
            }
        }

        if self.soulcredit == 0 {
            // Lower, varied starting soulcredit.
            self.soulcredit = dice.roll_range(4, 7);
        }
    }

    pub fn attribute(&self, attribute: Attribute) -> i32 {
        self.attributes.get(attribute.as_str()).copied().unwrap_or(3)
    }

    pub fn skill(&self, skill: &str) -> i32 {
        self.skills.get(skill).copied().unwrap_or(0)
    }

    /// Whether any offering is in the pouch. Pass a specific slot name to
    /// check just that one.
    pub fn has_offering(&self, offering_type: Option<&str>) -> bool {
        match offering_type {
            Some(slot) => self.inventory.get(slot).copied().unwrap_or(0) > 0,
            None => self
                .inventory
                .iter()
                .any(|(slot, count)| (slot.contains("offering") || slot.contains("incense")) && *count > 0),
        }
    }

    /// Consume one offering; returns false when none was available.
    pub fn consume_offering(&mut self, offering_type: Option<&str>) -> bool {
        if let Some(slot) = offering_type {
            if let Some(count) = self.inventory.get_mut(slot) {
                if *count > 0 {
                    *count -= 1;
                    return true;
                }
            }
            return false;
        }
        for (slot, count) in self.inventory.iter_mut() {
            if (slot.contains("offering") || slot.contains("incense")) && *count > 0 {
                *count -= 1;
                return true;
            }
        }
        false
    }

    /// A ritual focus is any crystal focus or tech kit.
    pub fn has_focus(&self) -> bool {
        self.inventory.get("crystal_focus").copied().unwrap_or(0) > 0
            || self.inventory.get("tech_kit").copied().unwrap_or(0) > 0
    }

    /// Skills sorted strongest-first for prompt tiering.
    pub fn tiered_skills(&self) -> Vec<(String, i32)> {
        let mut skills: Vec<(String, i32)> = self
            .skills
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        skills.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        skills
    }
}

/// A timed positive effect from ally support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buff {
    pub effect: String,
    pub bonus: i32,
    pub duration: i32,
    pub source: String,
    pub rounds_remaining: i32,
}

/// Weapon loadout keys in configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeaponLoadout {
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub sidearm: Option<String>,
}

/// Derived combat layer for one character.
#[derive(Debug, Clone)]
pub struct CombatState {
    pub health: i32,
    pub max_health: i32,
    pub wounds: i32,
    pub stuns: i32,
    /// Combat-balance override; the attribute-derived value is not used.
    pub soak: i32,
    pub position: String,
    pub equipped_primary: Option<Weapon>,
    pub equipped_sidearm: Option<Weapon>,
    pub carried_weapons: Vec<Weapon>,
    pub buffs: Vec<Buff>,
    pub free_action_used: bool,
}

impl CombatState {
    /// Max health = Size × 2 + Endurance + 13 (combat balance bonus that
    /// supports sustained multi-round fights).
    pub fn from_sheet(sheet: &CharacterSheet, equipped: &WeaponLoadout, carried: &[String]) -> Self {
        let size = sheet.attributes.get("Size").copied().unwrap_or(5);
        let endurance = sheet.attribute(Attribute::Endurance);
        let max_health = size * 2 + endurance + 13;

        let load = |id: &Option<String>, fallback: Option<&str>| -> Option<Weapon> {
            let id = id.as_deref().or(fallback)?;
            match get_weapon(id) {
                Some(weapon) => Some(weapon),
                None => {
                    error!("unknown weapon id {:?} for {}", id, sheet.name);
                    get_weapon("fists")
                }
            }
        };

        let mut carried_weapons = Vec::new();
        for id in carried {
            match get_weapon(id) {
                Some(weapon) => carried_weapons.push(weapon),
                None => warn!("skipping unknown carried weapon {:?}", id),
            }
        }

        Self {
            health: max_health,
            max_health,
            wounds: 0,
            stuns: 0,
            soak: 10,
            position: "Near-PC".to_string(),
            equipped_primary: load(&equipped.primary, Some("pistol")),
            equipped_sidearm: load(&equipped.sidearm, Some("combat_knife")),
            carried_weapons,
            buffs: Vec::new(),
            free_action_used: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.health > 0
    }

    /// Wounds ≥ 5 means fatally wounded; a death save is required.
    pub fn is_fatally_wounded(&self) -> bool {
        self.wounds >= 5
    }

    /// Death save: Health attribute × 2 + d20 vs DC 20 + 5 per wound past the
    /// fifth. Natural 1 always kills. Beating the DC by 10+ keeps the
    /// character conscious; meeting it leaves them unconscious; failing is
    /// death. Returns `(alive, status)`.
    pub fn check_death_save(
        &self,
        health_attribute: i32,
        dice: &DiceRoller,
        name: &str,
    ) -> (bool, &'static str) {
        if self.wounds < 5 {
            return (true, "conscious");
        }
        let extra_wounds = self.wounds - 5;
        let dc = 20 + 5 * extra_wounds;
        let roll = dice.d20();
        let total = health_attribute * 2 + roll;
        info!(
            "{} death save: {}x2 + {} = {} vs DC {} (wounds: {})",
            name, health_attribute, roll, total, dc, self.wounds
        );

        if roll == 1 {
            warn!("{} fumbled death save", name);
            (false, "dead")
        } else if total >= dc + 10 {
            (true, "conscious")
        } else if total >= dc {
            (true, "unconscious")
        } else {
            warn!("{} failed death save", name);
            (false, "dead")
        }
    }

    /// Apply post-soak damage; every 5 damage inflicts a wound.
    pub fn take_damage(&mut self, damage: i32) -> i32 {
        let wounds = damage / 5;
        self.wounds += wounds;
        self.health -= damage;
        wounds
    }

    pub fn heal(&mut self, amount: i32) -> i32 {
        let old = self.health;
        self.health = (self.health + amount).min(self.max_health);
        self.health - old
    }

    pub fn add_buff(&mut self, effect: &str, bonus: i32, duration: i32, source: &str) {
        info!(
            "buff gained: {} (+{}) from {} for {} rounds",
            effect, bonus, source, duration
        );
        self.buffs.push(Buff {
            effect: effect.to_string(),
            bonus,
            duration,
            source: source.to_string(),
            rounds_remaining: duration,
        });
    }

    /// Decrement buff durations and drop the expired ones.
    pub fn tick_buffs(&mut self) {
        for buff in &mut self.buffs {
            buff.rounds_remaining -= 1;
        }
        self.buffs.retain(|b| b.rounds_remaining > 0);
    }

    /// Sum of active buff bonuses (applied as a modifier on rolls).
    pub fn buff_bonus(&self) -> i32 {
        self.buffs.iter().map(|b| b.bonus).sum()
    }
}

/// Shared registry of per-character combat state.
///
/// Player agents, the Director (damage/buff application), and the enemy
/// manager all touch the same health pools; the roster gives them one
/// handle. Writes never overlap in practice — the round loop serializes
/// every mutation point.
#[derive(Clone, Default)]
pub struct CombatRoster {
    inner: std::sync::Arc<std::sync::Mutex<BTreeMap<String, CombatState>>>,
}

impl CombatRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent_id: &str, state: CombatState) {
        self.inner
            .lock()
            .expect("combat roster poisoned")
            .insert(agent_id.to_string(), state);
    }

    /// Run a closure against one character's combat state. Returns `None`
    /// when the agent is unknown.
    pub fn with<R>(&self, agent_id: &str, f: impl FnOnce(&mut CombatState) -> R) -> Option<R> {
        let mut guard = self.inner.lock().expect("combat roster poisoned");
        guard.get_mut(agent_id).map(f)
    }

    pub fn is_alive(&self, agent_id: &str) -> bool {
        self.with(agent_id, |c| c.is_alive()).unwrap_or(false)
    }

    /// `(agent_id, position, health, max_health)` rows, sorted by agent id.
    pub fn battlefield_rows(&self) -> Vec<(String, String, i32, i32)> {
        let guard = self.inner.lock().expect("combat roster poisoned");
        guard
            .iter()
            .map(|(id, c)| (id.clone(), c.position.clone(), c.health, c.max_health))
            .collect()
    }

    /// Reset every free-action slot (start of round).
    pub fn reset_free_actions(&self) {
        let mut guard = self.inner.lock().expect("combat roster poisoned");
        for state in guard.values_mut() {
            state.free_action_used = false;
        }
    }

    /// Tick buffs for every character (cleanup phase).
    pub fn tick_all_buffs(&self) {
        let mut guard = self.inner.lock().expect("combat roster poisoned");
        for state in guard.values_mut() {
            state.tick_buffs();
        }
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("combat roster poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voidtable::economy::SeedKind;

    fn sheet() -> CharacterSheet {
        CharacterSheet {
            name: "Zara Nightwhisper".to_string(),
            pronouns: "she/her".to_string(),
            faction: "Tempest Industries".to_string(),
            attributes: [("Size", 5), ("Endurance", 3), ("Agility", 4), ("Health", 3)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            skills: [("Astral Arts", 5), ("Awareness", 3)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            void_score: 2,
            soulcredit: 5,
            goals: vec!["Explore void manipulation".to_string()],
            bonds: vec![],
            inventory: BTreeMap::new(),
            energy_inventory: EnergyInventory::default(),
            personality: PersonalityProfile::default(),
        }
    }

    #[test]
    fn test_initialize_grants_faction_seed_and_inventory() {
        let dice = DiceRoller::seeded(2);
        let mut s = sheet();
        s.initialize(&dice);
        assert!(s.inventory.contains_key("med_kit"));
        // Tempest characters start with a Hollow seed.
        assert_eq!(s.energy_inventory.count_seeds(SeedKind::Hollow), 1);
    }

    #[test]
    fn test_max_health_formula() {
        let s = sheet();
        let combat = CombatState::from_sheet(&s, &WeaponLoadout::default(), &[]);
        // Size 5 × 2 + Endurance 3 + 13 = 26.
        assert_eq!(combat.max_health, 26);
        assert_eq!(combat.soak, 10);
        assert_eq!(combat.position, "Near-PC");
        assert!(combat.equipped_primary.is_some());
    }

    #[test]
    fn test_damage_wounds_and_healing() {
        let s = sheet();
        let mut combat = CombatState::from_sheet(&s, &WeaponLoadout::default(), &[]);
        let wounds = combat.take_damage(11);
        assert_eq!(wounds, 2);
        assert_eq!(combat.health, 15);
        assert_eq!(combat.heal(50), 11);
        assert_eq!(combat.health, combat.max_health);
    }

    #[test]
    fn test_death_save_thresholds() {
        let s = sheet();
        let mut combat = CombatState::from_sheet(&s, &WeaponLoadout::default(), &[]);
        // Not fatally wounded: always conscious, no roll consumed.
        let (alive, status) = combat.check_death_save(3, &DiceRoller::seeded(1), "Zara");
        assert!(alive);
        assert_eq!(status, "conscious");

        combat.wounds = 6;
        // DC = 20 + 5 = 25. Run a batch of saves and check every outcome is
        // one of the defined statuses with consistent liveness.
        let dice = DiceRoller::seeded(99);
        for _ in 0..30 {
            let (alive, status) = combat.check_death_save(3, &dice, "Zara");
            match status {
                "conscious" | "unconscious" => assert!(alive),
                "dead" => assert!(!alive),
                other => panic!("unexpected status {}", other),
            }
        }
    }

    #[test]
    fn test_buff_ticking() {
        let s = sheet();
        let mut combat = CombatState::from_sheet(&s, &WeaponLoadout::default(), &[]);
        combat.add_buff("aim bonus", 2, 2, "Kael");
        combat.add_buff("morale", 1, 1, "Mira");
        assert_eq!(combat.buff_bonus(), 3);
        combat.tick_buffs();
        assert_eq!(combat.buff_bonus(), 2);
        combat.tick_buffs();
        assert_eq!(combat.buff_bonus(), 0);
    }

    #[test]
    fn test_offering_and_focus_checks() {
        let dice = DiceRoller::seeded(4);
        let mut s = sheet();
        s.initialize(&dice);
        assert!(!s.has_offering(None));
        s.inventory.insert("incense".to_string(), 2);
        assert!(s.has_offering(None));
        assert!(s.consume_offering(None));
        assert_eq!(s.inventory["incense"], 1);

        assert!(!s.has_focus());
        s.inventory.insert("crystal_focus".to_string(), 1);
        assert!(s.has_focus());
    }

    #[test]
    fn test_tiered_skills_ordering() {
        let s = sheet();
        let tiers = s.tiered_skills();
        assert_eq!(tiers[0].0, "Astral Arts");
        assert_eq!(tiers[0].1, 5);
    }
}

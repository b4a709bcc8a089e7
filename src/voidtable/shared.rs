//! Process-wide shared state.
//!
//! One [`SharedState`] instance is created by the orchestrator and handed to
//! every component. It is single-writer in practice — the orchestrator and
//! agents append or read, never concurrently mutate the same key — but the
//! collections sit behind mutexes so the handle can cross task boundaries.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A registered player character.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub agent_id: String,
    pub name: String,
    pub faction: String,
}

/// A shared party discovery with attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub discovery: String,
    pub character: String,
}

/// A single-use +2 bonus granted through coordination.
#[derive(Debug, Clone)]
pub struct CoordinationBonus {
    pub bonus: i32,
    pub from: String,
    pub reason: String,
}

/// A recently used scenario, for variety enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub theme: String,
    pub location: String,
}

/// An inter-player currency transfer awaiting pickup.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub from: String,
    pub to: String,
    pub currency: String,
    pub amount: i32,
    pub from_name: String,
    pub to_name: String,
}

/// What a combat id resolves to.
#[derive(Debug, Clone)]
pub struct CombatantRef {
    pub agent_id: String,
    pub name: String,
    pub is_player: bool,
}

/// Issues opaque `tgt_xxxx` ids for every combatant when free targeting is
/// enabled, so LLMs target by id instead of ambiguous fuzzy names — which
/// also makes friendly fire detectable.
#[derive(Default)]
pub struct CombatIdMapper {
    pub enabled: bool,
    counter: u32,
    by_target_id: HashMap<String, CombatantRef>,
    by_agent_id: HashMap<String, String>,
}

impl CombatIdMapper {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    /// Register a combatant (idempotent per agent id); returns its target id.
    pub fn register(&mut self, agent_id: &str, name: &str, is_player: bool) -> String {
        if let Some(existing) = self.by_agent_id.get(agent_id) {
            return existing.clone();
        }
        self.counter += 1;
        let target_id = format!("tgt_{:04x}", self.counter);
        self.by_target_id.insert(
            target_id.clone(),
            CombatantRef {
                agent_id: agent_id.to_string(),
                name: name.to_string(),
                is_player,
            },
        );
        self.by_agent_id.insert(agent_id.to_string(), target_id.clone());
        target_id
    }

    pub fn unregister(&mut self, agent_id: &str) {
        if let Some(target_id) = self.by_agent_id.remove(agent_id) {
            self.by_target_id.remove(&target_id);
        }
    }

    pub fn resolve(&self, target_id: &str) -> Option<CombatantRef> {
        self.by_target_id.get(target_id).cloned()
    }

    pub fn is_player(&self, target_id: &str) -> bool {
        self.by_target_id
            .get(target_id)
            .map(|r| r.is_player)
            .unwrap_or(false)
    }

    pub fn target_id_for(&self, agent_id: &str) -> Option<String> {
        self.by_agent_id.get(agent_id).cloned()
    }

    /// `(target_id, name, is_player)` rows for prompt composition, sorted by
    /// target id for deterministic output.
    pub fn roster(&self) -> Vec<(String, String, bool)> {
        let mut rows: Vec<(String, String, bool)> = self
            .by_target_id
            .iter()
            .map(|(id, r)| (id.clone(), r.name.clone(), r.is_player))
            .collect();
        rows.sort();
        rows
    }
}

struct SharedStateInner {
    registered_players: Vec<PlayerInfo>,
    party_discoveries: Vec<Discovery>,
    coordination_bonuses: HashMap<String, CoordinationBonus>,
    recent_scenarios: Vec<ScenarioRecord>,
    pending_transfers: Vec<PendingTransfer>,
    combat_ids: CombatIdMapper,
}

/// Cheap-to-clone shared registry.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<SharedStateInner>>,
}

const MAX_DISCOVERIES: usize = 10;
const MAX_RECENT_SCENARIOS: usize = 5;

impl SharedState {
    pub fn new(free_targeting_mode: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedStateInner {
                registered_players: Vec::new(),
                party_discoveries: Vec::new(),
                coordination_bonuses: HashMap::new(),
                recent_scenarios: Vec::new(),
                pending_transfers: Vec::new(),
                combat_ids: CombatIdMapper::new(free_targeting_mode),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedStateInner> {
        self.inner.lock().expect("shared state poisoned")
    }

    // ---- Players ----

    pub fn register_player(&self, agent_id: &str, name: &str, faction: &str) {
        let mut inner = self.lock();
        if inner.registered_players.iter().any(|p| p.agent_id == agent_id) {
            return;
        }
        inner.registered_players.push(PlayerInfo {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            faction: faction.to_string(),
        });
    }

    pub fn registered_players(&self) -> Vec<PlayerInfo> {
        self.lock().registered_players.clone()
    }

    /// Names of the other party members.
    pub fn other_players(&self, current_agent_id: &str) -> Vec<String> {
        self.lock()
            .registered_players
            .iter()
            .filter(|p| p.agent_id != current_agent_id)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn agent_id_for_name(&self, name: &str) -> Option<String> {
        let name_lower = name.to_lowercase();
        self.lock()
            .registered_players
            .iter()
            .find(|p| {
                p.name.to_lowercase() == name_lower
                    || p.name.to_lowercase().contains(&name_lower)
                    || name_lower.contains(&p.name.to_lowercase())
            })
            .map(|p| p.agent_id.clone())
    }

    // ---- Discoveries ----

    /// Append to the party knowledge pool (deduplicated, bounded FIFO).
    pub fn add_discovery(&self, discovery: &str, character_name: &str) {
        if discovery.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.party_discoveries.iter().any(|d| d.discovery == discovery) {
            return;
        }
        inner.party_discoveries.push(Discovery {
            discovery: discovery.to_string(),
            character: character_name.to_string(),
        });
        if inner.party_discoveries.len() > MAX_DISCOVERIES {
            let excess = inner.party_discoveries.len() - MAX_DISCOVERIES;
            inner.party_discoveries.drain(..excess);
        }
    }

    pub fn recent_discoveries(&self, limit: usize) -> Vec<Discovery> {
        let inner = self.lock();
        let start = inner.party_discoveries.len().saturating_sub(limit);
        inner.party_discoveries[start..].to_vec()
    }

    // ---- Coordination bonuses ----

    /// Grant a +2 single-use bonus to the named character's next related
    /// roll. Replaces any existing bonus. Returns false when the recipient is
    /// unknown.
    pub fn grant_coordination_bonus(
        &self,
        from_name: &str,
        to_name: &str,
        reason: &str,
    ) -> bool {
        let target_agent = {
            let inner = self.lock();
            inner
                .registered_players
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(to_name))
                .map(|p| p.agent_id.clone())
        };
        let Some(target_agent) = target_agent else {
            return false;
        };
        info!("{} granted +2 coordination bonus to {} ({})", from_name, to_name, reason);
        self.lock().coordination_bonuses.insert(
            target_agent,
            CoordinationBonus {
                bonus: 2,
                from: from_name.to_string(),
                reason: reason.to_string(),
            },
        );
        true
    }

    /// Take (and clear) a pending bonus for the agent.
    pub fn consume_coordination_bonus(&self, agent_id: &str) -> Option<CoordinationBonus> {
        self.lock().coordination_bonuses.remove(agent_id)
    }

    // ---- Scenario variety ----

    pub fn add_scenario(&self, theme: &str, location: &str) {
        let mut inner = self.lock();
        inner.recent_scenarios.push(ScenarioRecord {
            theme: theme.to_string(),
            location: location.to_string(),
        });
        if inner.recent_scenarios.len() > MAX_RECENT_SCENARIOS {
            let excess = inner.recent_scenarios.len() - MAX_RECENT_SCENARIOS;
            inner.recent_scenarios.drain(..excess);
        }
    }

    pub fn recent_scenarios(&self) -> Vec<ScenarioRecord> {
        self.lock().recent_scenarios.clone()
    }

    /// Formatted variety context for the scenario-generation prompt.
    pub fn recent_scenario_info(&self) -> String {
        let recent = self.recent_scenarios();
        if recent.is_empty() {
            return String::new();
        }
        let themes: Vec<&str> = recent.iter().map(|s| s.theme.as_str()).collect();
        let locations: Vec<&str> = recent.iter().map(|s| s.location.as_str()).collect();
        format!(
            "\n**Recently Used (AVOID THESE):**\n- Recent themes: {}\n- Recent locations: {}\n\nGenerate something DIFFERENT from these recent scenarios.\n",
            themes.join(", "),
            locations.join(", ")
        )
    }

    /// Load the cross-session scenario cache. Missing or corrupt files are a
    /// silent fresh start.
    pub fn load_dm_notes(&self, path: &Path) {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(notes) => {
                if let Some(list) = notes.get("recent_scenarios") {
                    if let Ok(scenarios) =
                        serde_json::from_value::<Vec<ScenarioRecord>>(list.clone())
                    {
                        self.lock().recent_scenarios = scenarios;
                    }
                }
            }
            Err(e) => warn!("ignoring unreadable dm notes: {}", e),
        }
    }

    pub fn save_dm_notes(&self, path: &Path) {
        let notes = json!({
            "recent_scenarios": self.recent_scenarios(),
            "last_updated": chrono::Utc::now().to_rfc3339(),
        });
        if let Ok(raw) = serde_json::to_string_pretty(&notes) {
            let _ = std::fs::write(path, raw);
        }
    }

    // ---- Transfers ----

    pub fn push_transfer(&self, transfer: PendingTransfer) {
        self.lock().pending_transfers.push(transfer);
    }

    /// Take every transfer addressed to the agent.
    pub fn take_transfers_for(&self, agent_id: &str) -> Vec<PendingTransfer> {
        let mut inner = self.lock();
        let (mine, rest): (Vec<_>, Vec<_>) = inner
            .pending_transfers
            .drain(..)
            .partition(|t| t.to == agent_id);
        inner.pending_transfers = rest;
        mine
    }

    // ---- Combat ids ----

    pub fn with_combat_ids<R>(&self, f: impl FnOnce(&mut CombatIdMapper) -> R) -> R {
        f(&mut self.lock().combat_ids)
    }

    pub fn free_targeting_enabled(&self) -> bool {
        self.lock().combat_ids.enabled
    }

    /// Serializable snapshot for the final session record.
    pub fn snapshot(&self) -> serde_json::Value {
        let inner = self.lock();
        json!({
            "registered_players": inner.registered_players,
            "party_discoveries": inner.party_discoveries,
            "recent_scenarios": inner.recent_scenarios,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_registration_dedup() {
        let state = SharedState::new(false);
        state.register_player("player_01", "Zara", "Tempest");
        state.register_player("player_01", "Zara", "Tempest");
        state.register_player("player_02", "Kael", "Pantheon");
        assert_eq!(state.registered_players().len(), 2);
        assert_eq!(state.other_players("player_01"), vec!["Kael".to_string()]);
    }

    #[test]
    fn test_discoveries_bounded_and_deduped() {
        let state = SharedState::new(false);
        state.add_discovery("the glyph is inverted", "Zara");
        state.add_discovery("the glyph is inverted", "Kael");
        assert_eq!(state.recent_discoveries(5).len(), 1);
        for i in 0..12 {
            state.add_discovery(&format!("finding {}", i), "Zara");
        }
        let all = state.recent_discoveries(20);
        assert_eq!(all.len(), 10);
        assert_eq!(all.last().unwrap().discovery, "finding 11");
    }

    #[test]
    fn test_coordination_bonus_single_use() {
        let state = SharedState::new(false);
        state.register_player("player_02", "Kael Dren", "Pantheon");
        assert!(state.grant_coordination_bonus("Zara", "Kael Dren", "shared intel"));
        assert!(!state.grant_coordination_bonus("Zara", "Nobody", "x"));

        let bonus = state.consume_coordination_bonus("player_02").unwrap();
        assert_eq!(bonus.bonus, 2);
        assert_eq!(bonus.from, "Zara");
        assert!(state.consume_coordination_bonus("player_02").is_none());
    }

    #[test]
    fn test_recent_scenarios_bounded() {
        let state = SharedState::new(false);
        for i in 0..7 {
            state.add_scenario(&format!("theme {}", i), &format!("loc {}", i));
        }
        let recent = state.recent_scenarios();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].theme, "theme 2");
        assert!(state.recent_scenario_info().contains("theme 6"));
    }

    #[test]
    fn test_dm_notes_round_trip() {
        let dir = std::env::temp_dir().join(format!("voidtable_notes_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("dm_notes.json");

        let state = SharedState::new(false);
        state.add_scenario("Heist", "Arcadia Docks");
        state.save_dm_notes(&path);

        let restored = SharedState::new(false);
        restored.load_dm_notes(&path);
        assert_eq!(restored.recent_scenarios().len(), 1);
        assert_eq!(restored.recent_scenarios()[0].location, "Arcadia Docks");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_transfers_are_per_recipient() {
        let state = SharedState::new(false);
        state.push_transfer(PendingTransfer {
            from: "player_01".into(),
            to: "player_02".into(),
            currency: "spark".into(),
            amount: 2,
            from_name: "Zara".into(),
            to_name: "Kael".into(),
        });
        assert!(state.take_transfers_for("player_03").is_empty());
        let mine = state.take_transfers_for("player_02");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].amount, 2);
        assert!(state.take_transfers_for("player_02").is_empty());
    }

    #[test]
    fn test_combat_id_mapper() {
        let state = SharedState::new(true);
        let (zara_id, enemy_id) = state.with_combat_ids(|ids| {
            let z = ids.register("player_01", "Zara", true);
            let e = ids.register("enemy_ab12", "Syndicate Grunt", false);
            // Re-registration is idempotent.
            assert_eq!(ids.register("player_01", "Zara", true), z);
            (z, e)
        });
        assert!(zara_id.starts_with("tgt_"));
        assert_ne!(zara_id, enemy_id);

        state.with_combat_ids(|ids| {
            assert!(ids.is_player(&zara_id));
            assert!(!ids.is_player(&enemy_id));
            assert_eq!(ids.resolve(&enemy_id).unwrap().name, "Syndicate Grunt");
            ids.unregister("enemy_ab12");
            assert!(ids.resolve(&enemy_id).is_none());
        });
    }
}

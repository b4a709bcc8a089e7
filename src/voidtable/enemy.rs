//! Enemy agents and the combat manager.
//!
//! Enemies enter play through Director `[SPAWN_ENEMY: …]` markers, fight
//! with the same initiative and resolution rules as players, declare their
//! actions through per-enemy LLM prompts, and leave through despawn markers,
//! failed death saves, or broken morale.
//!
//! Declaration is INTENTION, resolution is REALITY: the
//! [`ResolutionState`] accumulator tracks what earlier actors changed this
//! round (kills, claimed tokens, relocations) and invalidates declared
//! actions whose premises no longer hold — those become narrated failures
//! with a reason code, never executed actions.

use crate::voidtable::character::CombatRoster;
use crate::voidtable::dice::DiceRoller;
use crate::voidtable::event_log::EventLog;
use crate::voidtable::llm::{LlmClient, LlmRequest};
use crate::voidtable::markers::{DespawnEnemyMarker, SpawnEnemyMarker};
use crate::voidtable::mechanics::{ActionType, Attribute, MechanicsEngine};
use crate::voidtable::shared::SharedState;
use crate::voidtable::weapons::{get_weapon, RangeBand, Weapon};
use lazy_static::lazy_static;
use log::{info, warn};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// A stat block enemies are stamped from.
#[derive(Debug, Clone)]
pub struct EnemyTemplate {
    pub id: &'static str,
    pub health: i32,
    pub soak: i32,
    pub attributes: &'static [(&'static str, i32)],
    pub combat_skill: i32,
    pub weapon_id: &'static str,
    pub morale: i32,
}

lazy_static! {
    static ref TEMPLATES: HashMap<&'static str, EnemyTemplate> = {
        let mut m = HashMap::new();
        for template in [
            EnemyTemplate { id: "grunt", health: 15, soak: 8, attributes: &[("Strength", 3), ("Agility", 3), ("Health", 3)], combat_skill: 2, weapon_id: "pistol", morale: 6 },
            EnemyTemplate { id: "elite", health: 25, soak: 10, attributes: &[("Strength", 4), ("Agility", 4), ("Health", 4)], combat_skill: 3, weapon_id: "rifle", morale: 8 },
            EnemyTemplate { id: "sniper", health: 20, soak: 8, attributes: &[("Strength", 3), ("Agility", 5), ("Health", 3)], combat_skill: 4, weapon_id: "marksman_rifle", morale: 6 },
            EnemyTemplate { id: "boss", health: 40, soak: 12, attributes: &[("Strength", 5), ("Agility", 4), ("Health", 5)], combat_skill: 4, weapon_id: "resonance_blade", morale: 10 },
            EnemyTemplate { id: "enforcer", health: 30, soak: 11, attributes: &[("Strength", 5), ("Agility", 3), ("Health", 4)], combat_skill: 3, weapon_id: "shock_rifle", morale: 9 },
            EnemyTemplate { id: "ambusher", health: 18, soak: 8, attributes: &[("Strength", 3), ("Agility", 5), ("Health", 3)], combat_skill: 3, weapon_id: "combat_knife", morale: 5 },
        ] {
            m.insert(template.id, template);
        }
        m
    };
}

/// Look up a template by id (`grunt`, `elite`, `sniper`, `boss`, `enforcer`,
/// `ambusher`).
pub fn get_template(id: &str) -> Option<EnemyTemplate> {
    TEMPLATES.get(id).cloned()
}

/// Tactical doctrines and the behavior one implies.
pub fn doctrine_guidance(tactics: &str) -> &'static str {
    match tactics {
        "aggressive_melee" => "Close to Engaged and strike the nearest threat.",
        "defensive_ranged" => "Hold range, prefer cover tokens, fire at the biggest threat.",
        "tactical_ranged" => "Maintain Near/Far range, focus fire on wounded targets.",
        "extreme_range" => "Stay at Extreme range and pick off isolated targets.",
        "ambush" => "Stay unseen until a target is vulnerable, then strike hard.",
        _ => "Adapt to the battlefield; press advantages, withdraw from bad odds.",
    }
}

/// Threat-priority table shared by every enemy prompt.
const THREAT_PRIORITIES: &str = "Threat priority: 1) whoever damaged you last, \
2) ritualists mid-channel, 3) the most wounded PC in reach, 4) the closest PC.";

/// A timed penalty applied by player effects.
#[derive(Debug, Clone)]
pub struct EnemyDebuff {
    pub effect: String,
    pub penalty: i32,
    pub rounds_remaining: i32,
    pub source: String,
}

/// One spawned enemy.
#[derive(Debug, Clone)]
pub struct EnemyAgent {
    pub agent_id: String,
    pub name: String,
    pub template: String,
    pub health: i32,
    pub max_health: i32,
    pub wounds: i32,
    pub soak: i32,
    pub position: String,
    pub tactics: String,
    pub morale: i32,
    pub unit_count: u32,
    pub combat_skill: i32,
    pub attributes: HashMap<String, i32>,
    pub weapon: Weapon,
    pub is_active: bool,
    pub status_effects: Vec<String>,
    pub debuffs: Vec<EnemyDebuff>,
    pub revealed_weaknesses: Vec<(String, i32)>,
    pub spawn_round: u32,
}

impl EnemyAgent {
    fn from_template(
        template: &EnemyTemplate,
        name: &str,
        position: &str,
        tactics: &str,
        unit_count: u32,
        spawn_round: u32,
    ) -> Self {
        Self {
            agent_id: format!("enemy_{}", &Uuid::new_v4().simple().to_string()[..8]),
            name: name.to_string(),
            template: template.id.to_string(),
            health: template.health,
            max_health: template.health,
            wounds: 0,
            soak: template.soak,
            position: position.to_string(),
            tactics: tactics.to_string(),
            morale: template.morale,
            unit_count,
            combat_skill: template.combat_skill,
            attributes: template
                .attributes
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            weapon: get_weapon(template.weapon_id)
                .unwrap_or_else(|| get_weapon("fists").expect("fists always registered")),
            is_active: true,
            status_effects: Vec::new(),
            debuffs: Vec::new(),
            revealed_weaknesses: Vec::new(),
            spawn_round,
        }
    }

    pub fn attribute(&self, name: &str) -> i32 {
        self.attributes.get(name).copied().unwrap_or(3)
    }

    pub fn is_alive(&self) -> bool {
        self.health > 0 && self.is_active
    }

    pub fn add_debuff(&mut self, effect: &str, penalty: i32, duration: i32, source: &str) {
        self.debuffs.push(EnemyDebuff {
            effect: effect.to_string(),
            penalty,
            rounds_remaining: duration,
            source: source.to_string(),
        });
    }

    pub fn add_status_effect(&mut self, effect: &str) {
        if !self.status_effects.iter().any(|s| s == effect) {
            self.status_effects.push(effect.to_string());
        }
    }

    pub fn add_revealed_weakness(&mut self, weakness: &str, bonus: i32) {
        self.revealed_weaknesses.push((weakness.to_string(), bonus));
    }

    pub fn debuff_penalty(&self) -> i32 {
        self.debuffs.iter().map(|d| d.penalty).sum()
    }

    pub fn tick_debuffs(&mut self) {
        for debuff in &mut self.debuffs {
            debuff.rounds_remaining -= 1;
        }
        self.debuffs.retain(|d| d.rounds_remaining > 0);
    }

    /// Apply post-soak damage; every 5 damage is a wound.
    pub fn take_damage(&mut self, damage: i32) -> i32 {
        let wounds = damage / 5;
        self.wounds += wounds;
        self.health -= damage;
        wounds
    }

    /// Death save when fatally wounded (wounds ≥ 5): Health×2 + d20 vs
    /// 20 + 5·(wounds−5). Natural 1 kills; DC+10 stays conscious; ≥ DC is
    /// unconscious; below is dead.
    pub fn check_death_save(&self, dice: &DiceRoller) -> (bool, &'static str) {
        if self.wounds < 5 {
            return (self.health > 0, if self.health > 0 { "conscious" } else { "dead" });
        }
        let dc = 20 + 5 * (self.wounds - 5);
        let roll = dice.d20();
        let total = self.attribute("Health") * 2 + roll;
        if roll == 1 {
            (false, "dead")
        } else if total >= dc + 10 {
            (true, "conscious")
        } else if total >= dc {
            (true, "unconscious")
        } else {
            (false, "dead")
        }
    }

    /// Morale check at half health or worse: morale + d20 vs 18.
    pub fn morale_holds(&self, dice: &DiceRoller) -> bool {
        if self.health * 2 > self.max_health {
            return true;
        }
        self.morale + dice.d20() >= 18
    }
}

/// A declared enemy action awaiting resolution.
#[derive(Debug, Clone)]
pub struct EnemyDeclaration {
    pub agent_id: String,
    pub character_name: String,
    pub initiative: i32,
    pub major_action: String,
    /// Combat id (`tgt_xxxx`) or raw name of the intended target.
    pub target: Option<String>,
    pub claim_token: Option<String>,
    pub required_range: Option<RangeBand>,
}

/// Why a declared action no longer holds at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    TargetDefeated(String),
    TokenTaken(String),
    OutOfRange(String),
    ActorDown,
}

impl InvalidationReason {
    pub fn code(&self) -> &'static str {
        match self {
            InvalidationReason::TargetDefeated(_) => "target_defeated",
            InvalidationReason::TokenTaken(_) => "token_taken",
            InvalidationReason::OutOfRange(_) => "out_of_range",
            InvalidationReason::ActorDown => "actor_down",
        }
    }
}

/// Per-round accumulator of battlefield changes made during resolution.
#[derive(Debug, Default)]
pub struct ResolutionState {
    defeated: HashSet<String>,
    claimed_tokens: HashSet<String>,
    relocations: HashMap<String, String>,
}

impl ResolutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_defeated(&mut self, combatant: &str) {
        self.defeated.insert(combatant.to_string());
    }

    pub fn is_defeated(&self, combatant: &str) -> bool {
        self.defeated.contains(combatant)
    }

    /// Claim a token; returns false when already taken this round.
    pub fn claim_token(&mut self, token: &str) -> bool {
        self.claimed_tokens.insert(token.to_string())
    }

    pub fn is_token_claimed(&self, token: &str) -> bool {
        self.claimed_tokens.contains(token)
    }

    pub fn record_relocation(&mut self, combatant: &str, position: &str) {
        self.relocations
            .insert(combatant.to_string(), position.to_string());
    }

    pub fn position_of(&self, combatant: &str) -> Option<&str> {
        self.relocations.get(combatant).map(String::as_str)
    }

    /// Check a declaration against live state.
    pub fn validate(
        &self,
        declaration: &EnemyDeclaration,
        target_alive: impl Fn(&str) -> bool,
        range_reachable: impl Fn(RangeBand) -> bool,
    ) -> Result<(), InvalidationReason> {
        if let Some(target) = &declaration.target {
            if self.is_defeated(target) || !target_alive(target) {
                return Err(InvalidationReason::TargetDefeated(target.clone()));
            }
        }
        if let Some(token) = &declaration.claim_token {
            if self.is_token_claimed(token) {
                return Err(InvalidationReason::TokenTaken(token.clone()));
            }
        }
        if let Some(range) = declaration.required_range {
            if !range_reachable(range) {
                return Err(InvalidationReason::OutOfRange(format!("{:?}", range)));
            }
        }
        Ok(())
    }
}

/// Result of executing (or invalidating) one enemy action.
#[derive(Debug, Clone)]
pub struct EnemyActionResult {
    pub character_name: String,
    pub narration: String,
    pub invalidated: Option<String>,
    /// `(player_agent_id, post_soak_damage, wounds)` when the attack landed.
    pub damage_to: Option<(String, i32, i32)>,
}

/// An end-of-round lifecycle event.
#[derive(Debug, Clone)]
pub struct CleanupEvent {
    pub event_type: &'static str,
    pub narration: String,
    pub enemy_id: String,
    pub enemy_name: String,
}

/// Owns every live enemy and drives their lifecycle.
pub struct EnemyCombatManager {
    pub enabled: bool,
    pub enemies: Vec<EnemyAgent>,
    shared: SharedState,
    dice: DiceRoller,
    declarations: HashMap<String, EnemyDeclaration>,
}

impl EnemyCombatManager {
    pub fn new(enabled: bool, shared: SharedState, dice: DiceRoller) -> Self {
        Self {
            enabled,
            enemies: Vec::new(),
            shared,
            dice,
            declarations: HashMap::new(),
        }
    }

    pub fn active_enemies(&self) -> impl Iterator<Item = &EnemyAgent> {
        self.enemies.iter().filter(|e| e.is_alive())
    }

    pub fn active_count(&self) -> usize {
        self.active_enemies().count()
    }

    pub fn enemy_by_id(&self, agent_id: &str) -> Option<&EnemyAgent> {
        self.enemies.iter().find(|e| e.agent_id == agent_id)
    }

    pub fn enemy_by_id_mut(&mut self, agent_id: &str) -> Option<&mut EnemyAgent> {
        self.enemies.iter_mut().find(|e| e.agent_id == agent_id)
    }

    /// Fuzzy name match against active enemies (either direction contains).
    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut EnemyAgent> {
        let name_lower = name.to_lowercase();
        self.enemies.iter_mut().filter(|e| e.is_alive()).find(|e| {
            let enemy_lower = e.name.to_lowercase();
            enemy_lower.contains(&name_lower) || name_lower.contains(&enemy_lower)
        })
    }

    /// Spawn enemies from a parsed marker. Multi-count spawns are numbered
    /// `Name 1`, `Name 2`, …
    pub fn spawn_from_marker(
        &mut self,
        marker: &SpawnEnemyMarker,
        round: u32,
        event_log: Option<&Arc<EventLog>>,
    ) -> Vec<String> {
        let Some(template) = get_template(&marker.template) else {
            warn!("unknown enemy template {:?}", marker.template);
            return Vec::new();
        };

        let mut notifications = Vec::new();
        for index in 0..marker.count {
            let name = if marker.count > 1 {
                format!("{} {}", marker.name, index + 1)
            } else {
                marker.name.clone()
            };
            let enemy = EnemyAgent::from_template(
                &template,
                &name,
                &marker.position,
                &marker.tactics,
                1,
                round,
            );

            if self.shared.free_targeting_enabled() {
                self.shared.with_combat_ids(|ids| {
                    ids.register(&enemy.agent_id, &enemy.name, false);
                });
            }
            if let Some(log) = event_log {
                let _ = log.log_enemy_spawn(
                    round,
                    &enemy.agent_id,
                    &enemy.name,
                    &enemy.template,
                    json!({
                        "health": enemy.max_health,
                        "soak": enemy.soak,
                        "weapon": enemy.weapon.name,
                        "combat_skill": enemy.combat_skill,
                    }),
                    &enemy.position,
                    &enemy.tactics,
                );
            }
            info!("spawned enemy {} ({}) at {}", enemy.name, enemy.template, enemy.position);
            notifications.push(format!(
                "⚔️ {} appears at {} ({} HP, {})",
                enemy.name, enemy.position, enemy.max_health, enemy.weapon.name
            ));
            self.enemies.push(enemy);
        }
        notifications
    }

    /// Remove enemies named by a despawn marker.
    pub fn despawn_from_marker(
        &mut self,
        marker: &DespawnEnemyMarker,
        round: u32,
        event_log: Option<&Arc<EventLog>>,
    ) -> Vec<String> {
        let name_lower = marker.name.to_lowercase();
        let mut notifications = Vec::new();
        for enemy in self.enemies.iter_mut().filter(|e| e.is_active) {
            let enemy_lower = enemy.name.to_lowercase();
            if enemy_lower.contains(&name_lower) || name_lower.contains(&enemy_lower) {
                enemy.is_active = false;
                if let Some(log) = event_log {
                    let _ = log.log_enemy_defeat(
                        round,
                        &enemy.agent_id,
                        &enemy.name,
                        &marker.reason,
                        round.saturating_sub(enemy.spawn_round),
                    );
                }
                self.shared.with_combat_ids(|ids| ids.unregister(&enemy.agent_id));
                notifications.push(format!("🏃 {} leaves the field ({})", enemy.name, marker.reason));
            }
        }
        notifications
    }

    /// Process every enemy-lifecycle marker in a narration. Returns
    /// notifications for display.
    pub fn process_narration(
        &mut self,
        narration: &str,
        round: u32,
        event_log: Option<&Arc<EventLog>>,
    ) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        let mut notifications = Vec::new();
        for marker in crate::voidtable::markers::parse_spawn_enemies(narration) {
            notifications.extend(self.spawn_from_marker(&marker, round, event_log));
        }
        for marker in crate::voidtable::markers::parse_despawn_enemies(narration) {
            notifications.extend(self.despawn_from_marker(&marker, round, event_log));
        }
        for name in crate::voidtable::markers::parse_enemy_surrenders(narration) {
            if let Some(enemy) = self.find_by_name_mut(&name) {
                enemy.is_active = false;
                enemy.add_status_effect("prisoner");
                notifications.push(format!("🏳️ {} surrenders", enemy.name));
            } else {
                warn!("surrender marker for unknown enemy {:?}", name);
            }
        }
        for name in crate::voidtable::markers::parse_enemy_flees(narration) {
            if let Some(enemy) = self.find_by_name_mut(&name) {
                enemy.is_active = false;
                let enemy_name = enemy.name.clone();
                notifications.push(format!("🏃 {} flees", enemy_name));
            } else {
                warn!("flee marker for unknown enemy {:?}", name);
            }
        }
        notifications
    }

    /// Initiative entries for all living enemies: same `Agility·4 + d20` as
    /// players.
    pub fn initiative_entries(&self, mechanics: &MechanicsEngine) -> Vec<(i32, String)> {
        self.active_enemies()
            .map(|enemy| {
                (
                    mechanics.calculate_initiative(enemy.attribute("Agility")),
                    enemy.agent_id.clone(),
                )
            })
            .collect()
    }

    /// Compose the tactical prompt and ask the enemy's LLM for a declaration.
    /// Falls back to a doctrine-driven template when the LLM fails or emits
    /// garbage.
    pub async fn declare_enemy(
        &mut self,
        enemy_id: &str,
        initiative: i32,
        roster: &CombatRoster,
        available_tokens: &[String],
        llm: &dyn LlmClient,
    ) -> Option<EnemyDeclaration> {
        let enemy = self.enemy_by_id(enemy_id)?.clone();
        if !enemy.is_alive() {
            return None;
        }

        let combatant_rows = self.shared.with_combat_ids(|ids| ids.roster());
        let battlefield: String = roster
            .battlefield_rows()
            .iter()
            .map(|(id, position, health, max)| format!("- {} at {} ({}/{} HP)", id, position, health, max))
            .collect::<Vec<_>>()
            .join("\n");
        let targets: String = combatant_rows
            .iter()
            .filter(|(_, _, is_player)| *is_player)
            .map(|(id, name, _)| format!("- {} = {}", id, name))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You control {} ({} at {}, {}/{} HP, armed with {}).\n\
             Doctrine: {}\n{}\n\n\
             Battlefield:\n{}\n\nTargets by id:\n{}\n\nClaimable tokens: {}\n\n\
             Declare ONE major action. Respond exactly as:\n\
             ACTION: [what you do]\nTARGET: [tgt_xxxx id or none]\nCLAIM: [token name or none]",
            enemy.name,
            enemy.template,
            enemy.position,
            enemy.health,
            enemy.max_health,
            enemy.weapon.name,
            doctrine_guidance(&enemy.tactics),
            THREAT_PRIORITIES,
            battlefield,
            targets,
            if available_tokens.is_empty() { "none".to_string() } else { available_tokens.join(", ") },
        );

        let declaration = match llm
            .complete(LlmRequest::new(prompt).with_temperature(0.7).with_max_tokens(200))
            .await
        {
            Ok(response) => self.parse_declaration(&enemy, initiative, &response.content),
            Err(e) => {
                warn!("enemy declaration LLM failed for {}: {}", enemy.name, e);
                None
            }
        }
        .unwrap_or_else(|| self.template_declaration(&enemy, initiative, &combatant_rows));

        self.declarations.insert(enemy_id.to_string(), declaration.clone());
        Some(declaration)
    }

    fn parse_declaration(
        &self,
        enemy: &EnemyAgent,
        initiative: i32,
        response: &str,
    ) -> Option<EnemyDeclaration> {
        let mut action = None;
        let mut target = None;
        let mut claim = None;
        for line in response.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("ACTION:") {
                action = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("TARGET:") {
                let value = rest.trim();
                if !value.eq_ignore_ascii_case("none") && !value.is_empty() {
                    target = Some(value.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("CLAIM:") {
                let value = rest.trim();
                if !value.eq_ignore_ascii_case("none") && !value.is_empty() {
                    claim = Some(value.to_string());
                }
            }
        }
        let action = action?;
        Some(EnemyDeclaration {
            agent_id: enemy.agent_id.clone(),
            character_name: enemy.name.clone(),
            initiative,
            major_action: action,
            target,
            claim_token: claim,
            required_range: Some(enemy.weapon.max_range),
        })
    }

    /// Doctrine fallback: attack the first living player target.
    fn template_declaration(
        &self,
        enemy: &EnemyAgent,
        initiative: i32,
        combatant_rows: &[(String, String, bool)],
    ) -> EnemyDeclaration {
        let target = combatant_rows
            .iter()
            .find(|(_, _, is_player)| *is_player)
            .map(|(id, _, _)| id.clone());
        EnemyDeclaration {
            agent_id: enemy.agent_id.clone(),
            character_name: enemy.name.clone(),
            initiative,
            major_action: format!("attack with {}", enemy.weapon.name),
            target,
            claim_token: None,
            required_range: Some(enemy.weapon.max_range),
        }
    }

    /// Execute the enemy's buffered declaration with resolution-state
    /// invalidation. Damage is applied to the targeted player through the
    /// roster.
    pub fn execute_enemy_action(
        &mut self,
        enemy_id: &str,
        mechanics: &mut MechanicsEngine,
        roster: &CombatRoster,
        resolution_state: &mut ResolutionState,
    ) -> Option<EnemyActionResult> {
        let declaration = self.declarations.remove(enemy_id)?;
        let enemy = self.enemy_by_id(enemy_id)?.clone();

        if !enemy.is_alive() {
            return Some(EnemyActionResult {
                character_name: enemy.name.clone(),
                narration: format!("{} is down; their action never happens.", enemy.name),
                invalidated: Some(InvalidationReason::ActorDown.code().to_string()),
                damage_to: None,
            });
        }

        // Resolve the target id to a live player before validation.
        let target_ref = declaration.target.as_ref().and_then(|target| {
            if target.starts_with("tgt_") {
                self.shared.with_combat_ids(|ids| ids.resolve(target))
            } else {
                None
            }
        });

        let validation = resolution_state.validate(
            &declaration,
            |target| {
                if target.starts_with("tgt_") {
                    self.shared
                        .with_combat_ids(|ids| ids.resolve(target))
                        .map(|r| roster.is_alive(&r.agent_id))
                        .unwrap_or(false)
                } else {
                    true
                }
            },
            |_range| true,
        );

        if let Err(reason) = validation {
            let narration = match &reason {
                InvalidationReason::TargetDefeated(target) => format!(
                    "{} moves to strike, but {} is already down — the attack dies unspent.",
                    enemy.name, target
                ),
                InvalidationReason::TokenTaken(token) => format!(
                    "{} lunges for {} but it was claimed moments before.",
                    enemy.name, token
                ),
                InvalidationReason::OutOfRange(range) => format!(
                    "{} can no longer reach their mark ({} required).",
                    enemy.name, range
                ),
                InvalidationReason::ActorDown => {
                    format!("{} is down; their action never happens.", enemy.name)
                }
            };
            return Some(EnemyActionResult {
                character_name: enemy.name.clone(),
                narration,
                invalidated: Some(reason.code().to_string()),
                damage_to: None,
            });
        }

        if let Some(token) = &declaration.claim_token {
            resolution_state.claim_token(token);
        }

        // Non-attack actions just narrate.
        let Some(target_ref) = target_ref else {
            return Some(EnemyActionResult {
                character_name: enemy.name.clone(),
                narration: format!("{} {}.", enemy.name, declaration.major_action),
                invalidated: None,
                damage_to: None,
            });
        };

        // Attack roll: Strength × combat skill + d20 vs combat DC, with
        // debuffs as penalties.
        let mut modifiers = BTreeMap::new();
        let debuff_penalty = enemy.debuff_penalty();
        if debuff_penalty != 0 {
            modifiers.insert("debuffs".to_string(), debuff_penalty);
        }
        let dc = mechanics.calculate_dc(
            &declaration.major_action,
            ActionType::Combat,
            false,
            false,
            false,
            false,
        );
        let resolution = mechanics.resolve_action(
            &declaration.major_action,
            Attribute::Strength,
            Some("Combat"),
            enemy.attribute("Strength"),
            enemy.combat_skill,
            dc,
            Some(modifiers),
            None,
        );

        if !resolution.success {
            return Some(EnemyActionResult {
                character_name: enemy.name.clone(),
                narration: format!(
                    "{} attacks {} with {} and misses (margin {:+}).",
                    enemy.name, target_ref.name, enemy.weapon.name, resolution.margin
                ),
                invalidated: None,
                damage_to: None,
            });
        }

        let (damage, wounds, target_down) = roster
            .with(&target_ref.agent_id, |combat| {
                let raw = enemy.weapon.damage + resolution.margin / 5;
                let damage = (raw - combat.soak / 2).max(1);
                let wounds = combat.take_damage(damage);
                (damage, wounds, !combat.is_alive())
            })
            .unwrap_or((0, 0, false));

        if target_down {
            resolution_state.mark_defeated(
                &self
                    .shared
                    .with_combat_ids(|ids| ids.target_id_for(&target_ref.agent_id))
                    .unwrap_or_else(|| target_ref.agent_id.clone()),
            );
        }

        Some(EnemyActionResult {
            character_name: enemy.name.clone(),
            narration: format!(
                "{} hits {} with {} for {} damage (margin {:+}).",
                enemy.name, target_ref.name, enemy.weapon.name, damage, resolution.margin
            ),
            invalidated: None,
            damage_to: Some((target_ref.agent_id.clone(), damage, wounds)),
        })
    }

    /// End-of-round processing: death saves for the fatally wounded, morale
    /// checks for the battered, debuff ticking. Fleeing advances an
    /// escape-themed clock when one exists.
    pub fn cleanup_round(
        &mut self,
        mechanics: &mut MechanicsEngine,
        round: u32,
        event_log: Option<&Arc<EventLog>>,
    ) -> Vec<CleanupEvent> {
        let mut events = Vec::new();
        let dice = self.dice.clone();

        let escape_clock = mechanics
            .scene_clocks
            .keys()
            .find(|name| {
                let lower = name.to_lowercase();
                lower.contains("escape") || lower.contains("retreat")
            })
            .cloned();

        for enemy in self.enemies.iter_mut().filter(|e| e.is_active) {
            enemy.tick_debuffs();

            if enemy.health <= 0 || enemy.wounds >= 5 {
                let (alive, status) = enemy.check_death_save(&dice);
                if !alive {
                    enemy.is_active = false;
                    events.push(CleanupEvent {
                        event_type: "enemy_killed",
                        narration: format!("{} succumbs to their wounds.", enemy.name),
                        enemy_id: enemy.agent_id.clone(),
                        enemy_name: enemy.name.clone(),
                    });
                    if let Some(log) = event_log {
                        let _ = log.log_enemy_defeat(
                            round,
                            &enemy.agent_id,
                            &enemy.name,
                            "killed",
                            round.saturating_sub(enemy.spawn_round),
                        );
                    }
                    continue;
                } else if status == "unconscious" {
                    enemy.is_active = false;
                    enemy.add_status_effect("unconscious");
                    events.push(CleanupEvent {
                        event_type: "enemy_unconscious",
                        narration: format!("{} collapses, unconscious.", enemy.name),
                        enemy_id: enemy.agent_id.clone(),
                        enemy_name: enemy.name.clone(),
                    });
                    continue;
                }
            }

            if enemy.health > 0 && !enemy.morale_holds(&dice) {
                enemy.is_active = false;
                events.push(CleanupEvent {
                    event_type: "enemy_fled",
                    narration: format!("{} breaks and flees the field.", enemy.name),
                    enemy_id: enemy.agent_id.clone(),
                    enemy_name: enemy.name.clone(),
                });
                if let Some(clock) = &escape_clock {
                    mechanics.queue_clock_update(clock, 2, &format!("{} fled", enemy.name));
                }
                if let Some(log) = event_log {
                    let _ = log.log_enemy_defeat(
                        round,
                        &enemy.agent_id,
                        &enemy.name,
                        "retreated",
                        round.saturating_sub(enemy.spawn_round),
                    );
                }
            }
        }

        // Deregister combat ids for everyone who left the field.
        for enemy in self.enemies.iter().filter(|e| !e.is_active) {
            self.shared.with_combat_ids(|ids| ids.unregister(&enemy.agent_id));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voidtable::character::{CharacterSheet, CombatState, WeaponLoadout};
    use crate::voidtable::economy::EnergyInventory;
    use crate::voidtable::llm::ScriptedLlmClient;
    use crate::voidtable::mechanics::ClockSpec;

    fn manager() -> (EnemyCombatManager, SharedState, CombatRoster) {
        let shared = SharedState::new(true);
        let roster = CombatRoster::new();
        let manager = EnemyCombatManager::new(true, shared.clone(), DiceRoller::seeded(5));
        (manager, shared, roster)
    }

    fn spawn_marker(count: u32) -> SpawnEnemyMarker {
        SpawnEnemyMarker {
            name: "Syndicate Grunts".to_string(),
            template: "grunt".to_string(),
            count,
            position: "Near-Enemy".to_string(),
            tactics: "aggressive_melee".to_string(),
        }
    }

    fn player_state() -> CombatState {
        let sheet = CharacterSheet {
            name: "Zara".to_string(),
            pronouns: "she/her".to_string(),
            faction: "Tempest".to_string(),
            attributes: [("Size", 5), ("Endurance", 3)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            skills: HashMap::new(),
            void_score: 0,
            soulcredit: 5,
            goals: vec![],
            bonds: vec![],
            inventory: Default::default(),
            energy_inventory: EnergyInventory::default(),
            personality: Default::default(),
        };
        CombatState::from_sheet(&sheet, &WeaponLoadout::default(), &[])
    }

    #[test]
    fn test_spawn_numbering_and_registration() {
        let (mut manager, shared, _) = manager();
        let notifications = manager.spawn_from_marker(&spawn_marker(3), 1, None);
        assert_eq!(notifications.len(), 3);
        assert_eq!(manager.active_count(), 3);
        assert!(manager.enemies.iter().any(|e| e.name == "Syndicate Grunts 2"));
        // Every spawn got a combat id.
        let ids = shared.with_combat_ids(|ids| ids.roster());
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|(_, _, is_player)| !is_player));
    }

    #[test]
    fn test_despawn_marker_by_fuzzy_name() {
        let (mut manager, _, _) = manager();
        manager.spawn_from_marker(&spawn_marker(1), 1, None);
        let notifications = manager.despawn_from_marker(
            &DespawnEnemyMarker {
                name: "syndicate".to_string(),
                reason: "escaped".to_string(),
            },
            2,
            None,
        );
        assert_eq!(notifications.len(), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_surrender_and_flee_markers() {
        let (mut manager, _, _) = manager();
        manager.spawn_from_marker(&spawn_marker(2), 1, None);
        let notes = manager.process_narration(
            "[ENEMY_SURRENDER: Syndicate Grunts 1]\n[ENEMY_FLEE: Syndicate Grunts 2]",
            2,
            None,
        );
        assert_eq!(notes.len(), 2);
        assert_eq!(manager.active_count(), 0);
        let prisoner = manager
            .enemies
            .iter()
            .find(|e| e.name == "Syndicate Grunts 1")
            .unwrap();
        assert!(prisoner.status_effects.contains(&"prisoner".to_string()));
    }

    #[tokio::test]
    async fn test_declaration_parse_and_fallback() {
        let (mut manager, shared, roster) = manager();
        shared.with_combat_ids(|ids| {
            ids.register("player_01", "Zara", true);
        });
        roster.insert("player_01", player_state());
        manager.spawn_from_marker(&spawn_marker(1), 1, None);
        let enemy_id = manager.enemies[0].agent_id.clone();
        let zara_tgt = shared
            .with_combat_ids(|ids| ids.target_id_for("player_01"))
            .unwrap();

        // Structured response parses.
        let llm = ScriptedLlmClient::always(
            "stub",
            &format!("ACTION: rush the operative\nTARGET: {}\nCLAIM: none", zara_tgt),
        );
        let declaration = manager
            .declare_enemy(&enemy_id, 22, &roster, &[], &llm)
            .await
            .unwrap();
        assert_eq!(declaration.target.as_deref(), Some(zara_tgt.as_str()));
        assert_eq!(declaration.major_action, "rush the operative");

        // Garbage response falls back to the doctrine template.
        let garbage = ScriptedLlmClient::always("stub", "I refuse to answer in the format.");
        let fallback = manager
            .declare_enemy(&enemy_id, 22, &roster, &[], &garbage)
            .await
            .unwrap();
        assert!(fallback.major_action.contains("attack"));
        assert_eq!(fallback.target.as_deref(), Some(zara_tgt.as_str()));
    }

    #[tokio::test]
    async fn test_invalidation_on_defeated_target() {
        let (mut manager, shared, roster) = manager();
        shared.with_combat_ids(|ids| {
            ids.register("player_01", "Zara", true);
        });
        roster.insert("player_01", player_state());
        manager.spawn_from_marker(&spawn_marker(1), 1, None);
        let enemy_id = manager.enemies[0].agent_id.clone();
        let zara_tgt = shared
            .with_combat_ids(|ids| ids.target_id_for("player_01"))
            .unwrap();

        let llm = ScriptedLlmClient::always(
            "stub",
            &format!("ACTION: strike\nTARGET: {}\nCLAIM: none", zara_tgt),
        );
        manager
            .declare_enemy(&enemy_id, 20, &roster, &[], &llm)
            .await
            .unwrap();

        // Someone killed the target earlier in resolution order.
        let mut resolution_state = ResolutionState::new();
        resolution_state.mark_defeated(&zara_tgt);

        let mut mechanics = MechanicsEngine::new(DiceRoller::seeded(9));
        let result = manager
            .execute_enemy_action(&enemy_id, &mut mechanics, &roster, &mut resolution_state)
            .unwrap();
        assert_eq!(result.invalidated.as_deref(), Some("target_defeated"));
        assert!(result.damage_to.is_none());
    }

    #[tokio::test]
    async fn test_attack_applies_damage_through_roster() {
        let (mut manager, shared, roster) = manager();
        shared.with_combat_ids(|ids| {
            ids.register("player_01", "Zara", true);
        });
        roster.insert("player_01", player_state());
        manager.spawn_from_marker(&spawn_marker(1), 1, None);
        let enemy_id = manager.enemies[0].agent_id.clone();
        let zara_tgt = shared
            .with_combat_ids(|ids| ids.target_id_for("player_01"))
            .unwrap();

        let llm = ScriptedLlmClient::always(
            "stub",
            &format!("ACTION: strike\nTARGET: {}\nCLAIM: none", zara_tgt),
        );
        manager
            .declare_enemy(&enemy_id, 20, &roster, &[], &llm)
            .await
            .unwrap();

        let mut resolution_state = ResolutionState::new();
        let mut mechanics = MechanicsEngine::new(DiceRoller::seeded(9));
        let before = roster.with("player_01", |c| c.health).unwrap();
        let result = manager
            .execute_enemy_action(&enemy_id, &mut mechanics, &roster, &mut resolution_state)
            .unwrap();

        if let Some((target, damage, _)) = result.damage_to {
            assert_eq!(target, "player_01");
            assert!(damage >= 1);
            let after = roster.with("player_01", |c| c.health).unwrap();
            assert_eq!(after, before - damage);
        } else {
            // A miss is legitimate under this seed; it must narrate as such.
            assert!(result.narration.contains("misses"));
        }
    }

    #[test]
    fn test_token_claims_are_exclusive() {
        let mut state = ResolutionState::new();
        assert!(state.claim_token("High Ground"));
        assert!(!state.claim_token("High Ground"));
        assert!(state.is_token_claimed("High Ground"));
    }

    #[test]
    fn test_cleanup_flee_advances_escape_clock() {
        let (mut manager, _, _) = manager();
        manager.spawn_from_marker(&spawn_marker(1), 1, None);
        // Batter the enemy below half health so morale checks run; force the
        // worst case by draining morale.
        {
            let enemy = &mut manager.enemies[0];
            enemy.health = 2;
            enemy.morale = -30;
        }
        let mut mechanics = MechanicsEngine::new(DiceRoller::seeded(10));
        mechanics.create_scene_clock(ClockSpec {
            name: "Escape Window".to_string(),
            maximum: 6,
            ..Default::default()
        });

        let events = manager.cleanup_round(&mut mechanics, 2, None);
        assert!(events.iter().any(|e| e.event_type == "enemy_fled"));
        assert_eq!(manager.active_count(), 0);
        // The flee queued an escape-clock advance.
        assert!(mechanics.queued_update_count() > 0);
    }

    #[test]
    fn test_death_save_bounds() {
        let template = get_template("grunt").unwrap();
        let mut enemy = EnemyAgent::from_template(&template, "Grunt", "Near-Enemy", "adaptive", 1, 1);
        enemy.wounds = 7;
        enemy.health = 1;
        let dice = DiceRoller::seeded(77);
        for _ in 0..20 {
            let (alive, status) = enemy.check_death_save(&dice);
            match status {
                "conscious" | "unconscious" => assert!(alive),
                "dead" => assert!(!alive),
                other => panic!("unexpected status {}", other),
            }
        }
    }
}

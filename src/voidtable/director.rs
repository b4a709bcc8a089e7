//! The Director agent.
//!
//! The Director generates scenarios with scene clocks, adjudicates every
//! declared action mechanically and narratively, and synthesizes each round
//! into a single broadcast narration. Its LLM output is treated as untrusted
//! input: the outcome parser and marker registry lift all state changes out
//! of the prose, and malformed spawn markers trigger a low-temperature
//! compliance retry before being dropped.

use crate::voidtable::agent::{AgentRuntime, BusLink};
use crate::voidtable::character::CombatRoster;
use crate::voidtable::economy::{create_standard_vendors, Vendor, VendorKind};
use crate::voidtable::enemy::EnemyCombatManager;
use crate::voidtable::event_log::EventLog;
use crate::voidtable::knowledge::{format_for_prompt, KnowledgeStore};
use crate::voidtable::llm::{LlmClient, LlmRequest};
use crate::voidtable::markers;
use crate::voidtable::mechanics::{ActionType, Attribute, ClockSpec, Condition, MechanicsEngine};
use crate::voidtable::message::{Message, MessageType};
use crate::voidtable::outcome::{
    self, generate_fallback_buff, generate_fallback_effect, ActionContext, FallbackBuff,
    ParsedOutcome,
};
use crate::voidtable::shared::SharedState;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The active scenario.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub theme: String,
    pub location: String,
    pub situation: String,
    pub void_level: i32,
    pub active_vendor: Option<Vendor>,
    pub required_purchase: Option<String>,
    pub vendor_gate_description: Option<String>,
}

/// One parsed clock line from scenario generation.
#[derive(Debug, Clone)]
struct GeneratedClock {
    name: String,
    maximum: i32,
    description: String,
    advance_means: String,
    regress_means: String,
    filled_consequence: String,
}

struct GeneratedScenario {
    theme: String,
    location: String,
    situation: String,
    void_level: i32,
    clocks: Vec<GeneratedClock>,
    required_purchase: Option<String>,
    vendor_gate_description: Option<String>,
    required_vendor_kind: Option<VendorKind>,
}

/// Configuration slice the Director needs.
#[derive(Clone, Default)]
pub struct DirectorConfig {
    pub force_scenario: Option<String>,
    pub force_combat: bool,
    pub force_vendor_gate: bool,
    pub enemy_agents_enabled: bool,
    /// `(name, faction, goals)` for party-aware scenario generation.
    pub party: Vec<(String, String, Vec<String>)>,
}

pub struct DirectorAgent {
    agent_id: String,
    llm: Arc<dyn LlmClient>,
    shared: SharedState,
    roster: CombatRoster,
    mechanics: Arc<Mutex<MechanicsEngine>>,
    enemy_manager: Arc<Mutex<EnemyCombatManager>>,
    knowledge: Arc<dyn KnowledgeStore>,
    event_log: Arc<EventLog>,
    config: DirectorConfig,
    vendor_pool: Vec<Vendor>,
    current_scenario: Option<Scenario>,
    /// Set by the orchestrator when every clock has completed.
    pub needs_story_advancement: Arc<AtomicBool>,
    current_round: Arc<AtomicU32>,
    eye_of_breach_appeared: bool,
    dice: crate::voidtable::dice::DiceRoller,
}

impl DirectorAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: &str,
        llm: Arc<dyn LlmClient>,
        shared: SharedState,
        roster: CombatRoster,
        mechanics: Arc<Mutex<MechanicsEngine>>,
        enemy_manager: Arc<Mutex<EnemyCombatManager>>,
        knowledge: Arc<dyn KnowledgeStore>,
        event_log: Arc<EventLog>,
        config: DirectorConfig,
        needs_story_advancement: Arc<AtomicBool>,
        current_round: Arc<AtomicU32>,
        dice: crate::voidtable::dice::DiceRoller,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            llm,
            shared,
            roster,
            mechanics,
            enemy_manager,
            knowledge,
            event_log,
            config,
            vendor_pool: create_standard_vendors(),
            current_scenario: None,
            needs_story_advancement,
            current_round,
            eye_of_breach_appeared: false,
            dice,
        }
    }

    // ---- Scenario generation ----

    async fn generate_scenario(&mut self, link: &BusLink) -> Result<(), Box<dyn Error + Send + Sync>> {
        let generated = if let Some(forced) = self.config.force_scenario.clone() {
            info!("using forced scenario");
            self.forced_scenario(&forced)
        } else if self.config.force_vendor_gate {
            self.vendor_gated_scenario()
        } else if self.config.force_combat {
            self.combat_scenario()
        } else {
            self.llm_scenario().await
        };

        let vendor = if let Some(kind) = generated.required_vendor_kind {
            self.vendor_pool.iter().find(|v| v.kind == kind).cloned()
        } else {
            self.contextual_vendor(&generated.theme)
        };
        if let Some(vendor) = &vendor {
            info!("vendor encounter: {} ({})", vendor.name, vendor.kind);
        }

        let scenario = Scenario {
            theme: generated.theme.clone(),
            location: generated.location.clone(),
            situation: generated.situation.clone(),
            void_level: generated.void_level,
            active_vendor: vendor,
            required_purchase: generated.required_purchase.clone(),
            vendor_gate_description: generated.vendor_gate_description.clone(),
        };

        let clocks_payload = {
            let mut mechanics = self.mechanics.lock().await;
            mechanics.scene_void_level = scenario.void_level;
            for clock in &generated.clocks {
                mechanics.create_scene_clock(ClockSpec {
                    name: clock.name.clone(),
                    maximum: clock.maximum,
                    description: clock.description.clone(),
                    advance_means: clock.advance_means.clone(),
                    regress_means: clock.regress_means.clone(),
                    filled_consequence: clock.filled_consequence.clone(),
                    timeout_rounds: None,
                    allow_negative: false,
                });
                info!("created clock: {} (0/{})", clock.name, clock.maximum);
                let _ = self
                    .event_log
                    .log_clock_spawn(&clock.name, clock.maximum, &clock.description);
            }
            clock_payload_rows(&mechanics)
        };

        let scenario_value = scenario_to_value(&scenario, clocks_payload);
        let _ = self.event_log.log_scenario(scenario_value.clone());
        self.shared.add_scenario(&scenario.theme, &scenario.location);

        let opening = self.opening_narration(&scenario, &generated.clocks);
        self.current_scenario = Some(scenario);

        link.send(
            MessageType::ScenarioSetup,
            None,
            json!({
                "scenario": scenario_value,
                "opening_narration": opening,
            }),
        )
        .await?;
        Ok(())
    }

    async fn llm_scenario(&mut self) -> GeneratedScenario {
        let prompt = self.scenario_prompt();
        let first = self
            .llm
            .complete(LlmRequest::new(prompt.clone()).with_temperature(0.9).with_max_tokens(500))
            .await;

        let mut generated = match first {
            Ok(response) => self.parse_scenario_text(&response.content),
            Err(e) => {
                error!("scenario generation failed: {}, using fallback", e);
                return self.fallback_scenario();
            }
        };

        // Variety enforcement: one higher-creativity regeneration on a
        // location collision with recent scenarios.
        let collides = {
            let location_lower = generated.location.to_lowercase();
            self.shared.recent_scenarios().iter().any(|recent| {
                let recent_lower = recent.location.to_lowercase();
                recent_lower.contains(&location_lower) || location_lower.contains(&recent_lower)
            })
        };
        if collides {
            info!("location {:?} recently used - regenerating once", generated.location);
            let retry_prompt = format!(
                "{}\n\nCRITICAL: You MUST pick a completely different location. DO NOT reuse any recently listed location.",
                prompt
            );
            if let Ok(response) = self
                .llm
                .complete(LlmRequest::new(retry_prompt).with_temperature(1.0).with_max_tokens(500))
                .await
            {
                generated = self.parse_scenario_text(&response.content);
            }
        }

        generated
    }

    fn scenario_prompt(&self) -> String {
        let mut party_context = String::new();
        if !self.config.party.is_empty() {
            party_context.push_str("=== PARTY COMPOSITION ===\nYour scenario MUST fit this party:\n");
            for (name, faction, goals) in &self.config.party {
                party_context.push_str(&format!("**{}** ({})\n", name, faction));
                for goal in goals {
                    party_context.push_str(&format!("  - {}\n", goal));
                }
            }
            party_context.push_str(
                "Do NOT create scenarios where characters must betray their own faction; \
                 cross-faction conflict belongs BETWEEN factions.\n\n",
            );
        }

        let lore_hits = self.knowledge.query(
            "setting locations factions void corruption",
            3,
        );
        let lore_context = if lore_hits.is_empty() {
            String::new()
        } else {
            format!(
                "CANONICAL LORE (use this):\n{}\n\n",
                format_for_prompt(&lore_hits, 1200)
            )
        };

        let variety_context = self.shared.recent_scenario_info();

        format!(
            "Generate a unique scenario for a dark sci-fi tabletop session.\n\n\
             {party}{lore}{variety}\n\
             Create:\n\
             THEME: [2-3 words]\nLOCATION: [specific place]\nSITUATION: [1-2 sentences]\n\
             VOID_LEVEL: [0-10 ambient corruption]\n\
             CLOCK1: name | max | description | ADVANCE=[meaning] | REGRESS=[meaning] | FILLED=[consequence]\n\
             CLOCK2: ... (three clocks total: a threat, an objective, a complication)\n\n\
             Every FILLED consequence MUST carry a marker: mechanical\n\
             ([SPAWN_ENEMY: name | template | count | position | tactics] or [DESPAWN_ENEMY: name | reason])\n\
             or narrative ([ADVANCE_STORY: Location | Situation] or [NEW_CLOCK: Name | Max | Description]).\n\
             Templates: grunt, elite, sniper, boss, enforcer, ambusher.\n\
             Positions: Engaged, Near-Enemy, Far-Enemy, Extreme-Enemy.\n\
             Tactics: aggressive_melee, defensive_ranged, tactical_ranged, extreme_range, ambush, adaptive.\n\
             About half of all scenarios should carry combat stakes (a danger clock\n\
             whose FILLED spawns enemies); the rest lean social, intrigue, or crisis.",
            party = party_context,
            lore = lore_context,
            variety = variety_context,
        )
    }

    fn parse_scenario_text(&self, text: &str) -> GeneratedScenario {
        let mut scenario = GeneratedScenario {
            theme: "Unknown".to_string(),
            location: "Unknown Location".to_string(),
            situation: "Something mysterious is happening".to_string(),
            void_level: 3,
            clocks: Vec::new(),
            required_purchase: None,
            vendor_gate_description: None,
            required_vendor_kind: None,
        };

        for line in text.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("THEME:") {
                scenario.theme = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("LOCATION:") {
                scenario.location = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("SITUATION:") {
                scenario.situation = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("VOID_LEVEL:") {
                if let Ok(level) = value.trim().parse::<i32>() {
                    scenario.void_level = level.clamp(0, 10);
                }
            } else if line.starts_with("CLOCK") {
                if let Some((_, body)) = line.split_once(':') {
                    if let Some(clock) = parse_clock_line(body) {
                        scenario.clocks.push(clock);
                    }
                }
            }
        }

        // Narrative clocks with pure-prose FILLED clauses stall the story;
        // reject the clause so expiry falls back to the mandatory-marker
        // directive instead.
        for clock in &mut scenario.clocks {
            let filled = &clock.filled_consequence;
            if !filled.is_empty() && !has_control_marker(filled) && !is_danger_themed(&clock.name, &clock.description) {
                warn!(
                    "rejecting prose-only FILLED clause on narrative clock {:?}",
                    clock.name
                );
                clock.filled_consequence.clear();
            }
        }

        if scenario.clocks.len() < 2 {
            scenario.clocks.push(GeneratedClock {
                name: "Danger Escalation".to_string(),
                maximum: 6,
                description: "The situation worsens".to_string(),
                advance_means: "Threat intensifies".to_string(),
                regress_means: "Pressure relieved".to_string(),
                filled_consequence: String::new(),
            });
            scenario.clocks.push(GeneratedClock {
                name: "Party Progress".to_string(),
                maximum: 6,
                description: "Uncovering the truth".to_string(),
                advance_means: "Headway made".to_string(),
                regress_means: "Ground lost".to_string(),
                filled_consequence: String::new(),
            });
        }

        scenario
    }

    fn fallback_scenario(&self) -> GeneratedScenario {
        let themes = [
            "Corporate Intrigue",
            "Void Investigation",
            "Bond Crisis",
            "Tech Heist",
            "Ritual Gone Wrong",
        ];
        let theme = themes[self.dice.pick_index(themes.len())];
        GeneratedScenario {
            theme: theme.to_string(),
            location: "Unknown Location".to_string(),
            situation: "The party finds themselves in a mysterious situation".to_string(),
            void_level: 3,
            clocks: vec![
                GeneratedClock {
                    name: "Danger Level".to_string(),
                    maximum: 6,
                    description: "Escalating threat".to_string(),
                    advance_means: "Threat grows".to_string(),
                    regress_means: "Threat recedes".to_string(),
                    filled_consequence: String::new(),
                },
                GeneratedClock {
                    name: "Investigation".to_string(),
                    maximum: 6,
                    description: "Uncovering the truth".to_string(),
                    advance_means: "Evidence gathered".to_string(),
                    regress_means: "Leads lost".to_string(),
                    filled_consequence: String::new(),
                },
                GeneratedClock {
                    name: "Time Pressure".to_string(),
                    maximum: 6,
                    description: "Running out of time".to_string(),
                    advance_means: "The window closes".to_string(),
                    regress_means: "Time bought".to_string(),
                    filled_consequence: String::new(),
                },
            ],
            required_purchase: None,
            vendor_gate_description: None,
            required_vendor_kind: None,
        }
    }

    fn forced_scenario(&self, forced: &str) -> GeneratedScenario {
        let mut scenario = self.combat_scenario();
        scenario.theme = "Forced Engagement".to_string();
        scenario.situation = forced.to_string();
        scenario
    }

    fn combat_scenario(&self) -> GeneratedScenario {
        GeneratedScenario {
            theme: "Hostile Extraction".to_string(),
            location: "Derelict Cargo Span".to_string(),
            situation: "The handoff was a setup; armed silhouettes spread across the gantries."
                .to_string(),
            void_level: 4,
            clocks: vec![
                GeneratedClock {
                    name: "Security Alert".to_string(),
                    maximum: 6,
                    description: "Hostile reinforcements converging".to_string(),
                    advance_means: "Hunters close in".to_string(),
                    regress_means: "Pursuit misled".to_string(),
                    filled_consequence:
                        "Reinforcements arrive [SPAWN_ENEMY: Strike Team | elite | 2 | Far-Enemy | tactical_ranged]"
                            .to_string(),
                },
                GeneratedClock {
                    name: "Escape Route".to_string(),
                    maximum: 6,
                    description: "Finding a way off the span".to_string(),
                    advance_means: "Exit path revealed".to_string(),
                    regress_means: "Path blocked".to_string(),
                    filled_consequence:
                        "Exit found [ADVANCE_STORY: Maintenance Tunnels | You slip into the dark; allies regroup ahead]"
                            .to_string(),
                },
                GeneratedClock {
                    name: "Cargo Integrity".to_string(),
                    maximum: 4,
                    description: "The prize is taking fire".to_string(),
                    advance_means: "Cargo damaged".to_string(),
                    regress_means: "Cargo shielded".to_string(),
                    filled_consequence:
                        "The cargo ruptures [NEW_CLOCK: Containment Breach | 4 | Something inside wakes]"
                            .to_string(),
                },
            ],
            required_purchase: None,
            vendor_gate_description: None,
            required_vendor_kind: None,
        }
    }

    fn vendor_gated_scenario(&self) -> GeneratedScenario {
        GeneratedScenario {
            theme: "Sealed Archive".to_string(),
            location: "Sunken Record Vault".to_string(),
            situation: "The vault door reads ambient corruption before it opens; the party's \
                        instruments cannot."
                .to_string(),
            void_level: 5,
            clocks: vec![
                GeneratedClock {
                    name: "Vault Countdown".to_string(),
                    maximum: 6,
                    description: "The vault's purge cycle approaches".to_string(),
                    advance_means: "Purge draws closer".to_string(),
                    regress_means: "Cycle delayed".to_string(),
                    filled_consequence:
                        "The purge begins [ADVANCE_STORY: Flooded Galleries | The records wash away; salvage what floats]"
                            .to_string(),
                },
                GeneratedClock {
                    name: "Archive Access".to_string(),
                    maximum: 6,
                    description: "Opening the inner vault".to_string(),
                    advance_means: "Locks yield".to_string(),
                    regress_means: "Locks reseal".to_string(),
                    filled_consequence:
                        "The vault opens [NEW_CLOCK: Deep Shelves | 4 | What the archive kept hidden]"
                            .to_string(),
                },
            ],
            required_purchase: Some("void scanner (basic)".to_string()),
            vendor_gate_description: Some(
                "The inner door only cycles for a party carrying a calibrated void scanner."
                    .to_string(),
            ),
            required_vendor_kind: Some(VendorKind::TechBroker),
        }
    }

    fn contextual_vendor(&self, theme: &str) -> Option<Vendor> {
        let theme_lower = theme.to_lowercase();
        let kind = if theme_lower.contains("ritual") || theme_lower.contains("void") {
            Some(VendorKind::RitualSupplier)
        } else if theme_lower.contains("tech") || theme_lower.contains("heist") {
            Some(VendorKind::TechBroker)
        } else if theme_lower.contains("debt") || theme_lower.contains("bond") || theme_lower.contains("trade") {
            Some(VendorKind::BondBroker)
        } else {
            None
        };
        match kind {
            Some(kind) => self.vendor_pool.iter().find(|v| v.kind == kind).cloned(),
            None => None,
        }
    }

    fn opening_narration(&self, scenario: &Scenario, clocks: &[GeneratedClock]) -> String {
        let mut narration = format!(
            "{}. {} The air carries a void pressure of {}/10.",
            scenario.location, scenario.situation, scenario.void_level
        );
        for clock in clocks {
            if !clock.filled_consequence.is_empty()
                && clock.filled_consequence.contains("[SPAWN_ENEMY:")
                && scenario.theme.to_lowercase().contains("forced")
            {
                // Forced engagements open with their spawn marker live.
                narration.push(' ');
                narration.push_str(&clock.filled_consequence);
            }
        }
        if let Some(vendor) = &scenario.active_vendor {
            narration.push_str(&format!(
                " {} ({}) has set up nearby: \"{}\"",
                vendor.name, vendor.kind, vendor.greeting
            ));
        }
        if let Some(gate) = &scenario.vendor_gate_description {
            narration.push(' ');
            narration.push_str(gate);
        }
        narration
    }

    // ---- Adjudication ----

    async fn handle_adjudication(
        &mut self,
        payload: &Value,
        link: &BusLink,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let actions = payload
            .get("actions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let round = payload.get("round").and_then(Value::as_u64).unwrap_or(0) as u32;
        let action_index = payload
            .get("action_index")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        if actions.is_empty() {
            link.send(
                MessageType::ActionResolved,
                None,
                json!({"agent_id": "adjudication"}),
            )
            .await?;
            return Ok(());
        }

        // Clock ages tick once per round, on the first adjudication.
        if action_index == 0 {
            let mut mechanics = self.mechanics.lock().await;
            mechanics.current_round = round;
            mechanics.increment_all_clock_rounds();
        }
        let _ = self.event_log.log_adjudication_start(round, actions.len());

        for entry in &actions {
            let player_id = entry
                .get("player_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let character_name = entry
                .get("character_name")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            let initiative = entry.get("initiative").and_then(Value::as_i64).unwrap_or(0) as i32;
            let action = entry.get("action").cloned().unwrap_or(json!({}));

            let (narration, outcome_value, resolution_record) = self
                .resolve_action_mechanically(&player_id, &character_name, &action, round, initiative)
                .await;

            link.send(
                MessageType::ActionResolved,
                None,
                json!({
                    "agent_id": player_id,
                    "action_index": action_index,
                    "original_action": action,
                    "outcome": outcome_value,
                    "narration": narration,
                    "resolution_data": resolution_record,
                }),
            )
            .await?;
        }

        Ok(())
    }

    /// Resolve one action: DC, dice, narration, outcome parsing, and state
    /// application. Returns `(narration, outcome, resolution_record)`.
    async fn resolve_action_mechanically(
        &mut self,
        player_id: &str,
        character_name: &str,
        action: &Value,
        round: u32,
        initiative: i32,
    ) -> (String, Value, Value) {
        let intent = action
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or_else(|| action.get("description").and_then(Value::as_str).unwrap_or(""))
            .to_string();
        let description = action
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let action_type = action
            .get("action_type")
            .and_then(Value::as_str)
            .and_then(ActionType::parse)
            .unwrap_or(ActionType::Custom);
        let is_ritual = action.get("is_ritual").and_then(Value::as_bool).unwrap_or(false)
            || action_type == ActionType::Ritual;
        let is_free_action = action
            .get("is_free_action")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let attribute = action
            .get("attribute")
            .and_then(Value::as_str)
            .and_then(Attribute::parse)
            .unwrap_or(Attribute::Perception);
        let skill = action
            .get("skill")
            .and_then(Value::as_str)
            .map(str::to_string);
        let attribute_value = action
            .get("attribute_value")
            .and_then(Value::as_i64)
            .unwrap_or(3) as i32;
        let skill_value = action.get("skill_value").and_then(Value::as_i64).unwrap_or(0) as i32;
        let has_offering = action
            .get("has_offering")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let has_primary_tool = action
            .get("has_primary_tool")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let faction = action.get("faction").and_then(Value::as_str).map(str::to_string);
        let buff_bonus = action.get("buff_bonus").and_then(Value::as_i64).unwrap_or(0) as i32;

        // Mechanical resolution under the engine lock (no awaits inside).
        let (resolution, ritual_outcome, mechanical_text, active_clocks) = {
            let mut mechanics = self.mechanics.lock().await;

            let mut modifiers = BTreeMap::new();
            if let Some(bonus) = self.shared.consume_coordination_bonus(player_id) {
                info!(
                    "{} receives +{} coordination bonus from {}",
                    character_name, bonus.bonus, bonus.from
                );
                modifiers.insert("coordination".to_string(), bonus.bonus);
            }
            if buff_bonus > 0 {
                modifiers.insert("ally_support".to_string(), buff_bonus);
            }

            let dc = mechanics.calculate_dc(
                &intent,
                action_type,
                is_ritual,
                action.get("is_extreme").and_then(Value::as_bool).unwrap_or(false),
                action.get("is_multi_stage").and_then(Value::as_bool).unwrap_or(false),
                is_free_action,
            );

            // Inter-party bonding rituals roll Empathy × Intimacy Ritual as
            // declared; only non-social rituals take the forced
            // Willpower × Astral Arts path.
            let ritual_path = is_ritual && skill.as_deref() != Some("Intimacy Ritual");
            let (resolution, ritual_outcome) = if ritual_path {
                let outcome = mechanics.resolve_ritual(
                    &intent,
                    attribute_value,
                    skill_value,
                    dc,
                    has_primary_tool,
                    has_offering,
                    false,
                    Some(player_id),
                    faction.as_deref(),
                );
                (outcome.resolution.clone(), Some(outcome))
            } else {
                let resolution = mechanics.resolve_action(
                    &intent,
                    attribute,
                    skill.as_deref(),
                    attribute_value,
                    skill_value,
                    dc,
                    if modifiers.is_empty() { None } else { Some(modifiers) },
                    Some(player_id),
                );
                (resolution, None)
            };

            let mechanical_text = mechanics.format_resolution(&resolution);
            (resolution, ritual_outcome, mechanical_text, mechanics.scene_clocks.clone())
        };

        // Narration outside the lock (LLM call).
        let llm_narration = self
            .narrate_resolution(character_name, &intent, &description, &mechanical_text)
            .await;
        let mut narration = format!("{}\n\n{}", mechanical_text, llm_narration);

        // Resolve target ids to character names for collaborative cleansing.
        let mut action_context = ActionContext {
            intent: intent.clone(),
            is_ritual,
            target_character: None,
        };
        let target_enemy = action
            .get("target_enemy")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(target) = &target_enemy {
            if target.starts_with("tgt_") {
                if let Some(target_ref) = self.shared.with_combat_ids(|ids| ids.resolve(target)) {
                    if target_ref.is_player {
                        action_context.target_character = Some(target_ref.name.clone());
                    }
                }
            }
        }

        let parsed = outcome::parse_state_changes(
            &llm_narration,
            &action_context,
            resolution.outcome_tier,
            resolution.margin,
            &active_clocks,
        );
        let combat_data = outcome::parse_combat_triplet(&llm_narration);

        // Apply everything back into the engine.
        let action_id = format!("{}_{}_{}", player_id, intent, resolution.total);
        let (economy, clock_states) = self
            .apply_parsed_outcome(
                player_id,
                character_name,
                &action_id,
                &parsed,
                ritual_outcome.as_ref(),
                &mut narration,
            )
            .await;

        // Mechanical effects against the declared target.
        if let Some(target) = &target_enemy {
            self.apply_target_effect(
                player_id,
                character_name,
                target,
                action,
                &resolution,
                &combat_data,
                &llm_narration,
                round,
                &mut narration,
            )
            .await;
        }
        if let Some(ally) = action.get("target_ally").and_then(Value::as_str) {
            self.apply_ally_buff(ally, &intent, resolution.margin, &mut narration);
        }

        // Lifecycle markers emitted inside per-action narration.
        {
            let mut manager = self.enemy_manager.lock().await;
            let notes = manager.process_narration(&llm_narration, round, Some(&self.event_log));
            for note in notes {
                narration.push_str(&format!("\n{}", note));
            }
        }

        // Successful discoveries feed the party knowledge pool.
        if resolution.success {
            if let Some(discovery) = extract_discovery(&llm_narration, &intent) {
                self.shared.add_discovery(&discovery, character_name);
            }
        }

        // Event log record.
        let mut context = json!({
            "action_type": action_type.as_str(),
            "is_ritual": is_ritual,
            "is_free_action": is_free_action,
            "faction": faction,
            "description": description,
            "initiative": initiative,
        });
        if let Some(metadata) = action.get("prompt_metadata") {
            context["prompt_metadata"] = metadata.clone();
        }
        if !combat_data.is_empty() {
            context["combat"] = json!({
                "attack_roll": combat_data.attack_roll,
                "damage": combat_data.damage,
                "soak": combat_data.soak,
                "post_soak_damage": combat_data.post_soak_damage,
            });
        }
        let effects: Vec<String> = parsed
            .conditions
            .iter()
            .map(|c| format!("{}: {}", c.condition_type, c.description))
            .collect();
        let _ = self.event_log.log_action_resolution(
            round,
            "adjudicate",
            character_name,
            &intent,
            &resolution,
            economy,
            clock_states,
            effects,
            context,
        );

        let outcome_value = json!({
            "dm_response": narration,
            "success": resolution.success,
            "narration_source": "llm",
            "resolution": {
                "intent": resolution.intent,
                "attribute": resolution.attribute.as_str(),
                "skill": resolution.skill,
                "roll": resolution.roll,
                "total": resolution.total,
                "difficulty": resolution.difficulty,
                "margin": resolution.margin,
                "outcome_tier": resolution.outcome_tier.as_str(),
                "success": resolution.success,
            },
        });
        let resolution_record = json!({
            "player_id": player_id,
            "character_name": character_name,
            "initiative": initiative,
            "action": action,
            "resolution": outcome_value,
        });
        (narration, outcome_value, resolution_record)
    }

    async fn narrate_resolution(
        &self,
        character_name: &str,
        intent: &str,
        description: &str,
        mechanical_text: &str,
    ) -> String {
        let scenario_line = self
            .current_scenario
            .as_ref()
            .map(|s| format!("{} — {}", s.location, s.situation))
            .unwrap_or_default();
        let prompt = format!(
            "You are the Director of a dark sci-fi tabletop session.\n\
             Scene: {}\n\
             {} attempted: {}\n{}\n\
             Mechanical result (authoritative, do not contradict):\n{}\n\n\
             Narrate the outcome in 2-4 vivid sentences grounded in the result. You may\n\
             emit markers: \u{1f4ca} Clock Name: +/-N (reason), \u{26ab} Void: +N (reason),\n\
             \u{2696}\u{fe0f} Soulcredit: +/-N (reason), [POSITION: X], and an EFFECT: block\n\
             (type=damage|debuff|status|movement|reveal, target=..., final=N) when a target\n\
             takes mechanical harm.",
            scenario_line, character_name, intent, description, mechanical_text
        );

        match self
            .llm
            .complete(LlmRequest::new(prompt).with_temperature(0.8).with_max_tokens(400))
            .await
        {
            Ok(response) => response.content,
            Err(e) => {
                warn!("adjudication narration failed ({}), using template", e);
                String::new()
            }
        }
    }

    /// Queue clocks, apply void/soulcredit/conditions/position from a parsed
    /// outcome. Returns `(economy, clock_states)` for the event log.
    async fn apply_parsed_outcome(
        &mut self,
        player_id: &str,
        character_name: &str,
        action_id: &str,
        parsed: &ParsedOutcome,
        ritual_outcome: Option<&crate::voidtable::mechanics::RitualOutcome>,
        narration: &mut String,
    ) -> (Value, Value) {
        let mut mechanics = self.mechanics.lock().await;

        for trigger in &parsed.clock_triggers {
            if mechanics.scene_clocks.contains_key(&trigger.clock) {
                mechanics.queue_clock_update(&trigger.clock, trigger.ticks, &trigger.reason);
                debug!(
                    "queued: {} {:+} ({}) [source: {}]",
                    trigger.clock, trigger.ticks, trigger.reason, trigger.source
                );
            }
        }

        // Ritual requirement void first, then parser void — both under the
        // same action id, so the dedup set guarantees a single charge.
        let mut void_delta_applied = 0;
        let mut void_reasons = parsed.void_reasons.clone();
        let void_target_id = parsed
            .void_target_character
            .as_ref()
            .and_then(|name| self.shared.agent_id_for_name(name))
            .unwrap_or_else(|| player_id.to_string());
        let void_target_name = parsed
            .void_target_character
            .clone()
            .unwrap_or_else(|| character_name.to_string());

        if let Some(ritual) = ritual_outcome {
            if ritual.void_change > 0 {
                let state = mechanics.void_state(&void_target_id);
                let old = state.score;
                state.add_void(
                    ritual.void_change,
                    "Ritual requirements",
                    Some(action_id),
                    false,
                );
                void_delta_applied += state.score - old;
                void_reasons.extend(ritual.consequences.iter().cloned());
            }
        }

        if parsed.void_change > 0 {
            let state = mechanics.void_state(&void_target_id);
            let old = state.score;
            state.add_void(
                parsed.void_change,
                &parsed.void_reasons.join(", "),
                Some(action_id),
                false,
            );
            void_delta_applied += state.score - old;
        } else if parsed.void_change < 0 {
            let state = mechanics.void_state(&void_target_id);
            let old = state.score;
            state.reduce_void(-parsed.void_change, &parsed.void_reasons.join(", "));
            void_delta_applied += state.score - old;
        }

        if void_delta_applied != 0 {
            let new_score = mechanics.void_state(&void_target_id).score;
            let old_score = new_score - void_delta_applied;
            narration.push_str(&format!(
                "\n\n⚫ Void ({}): {} → {}/10 ({})",
                void_target_name,
                old_score,
                new_score,
                void_reasons.join(", ")
            ));
            let _ = self.event_log.log_void_change(
                mechanics.current_round,
                &void_target_name,
                old_score,
                new_score,
                void_delta_applied,
                &void_reasons.join(", "),
            );
        }

        // Soulcredit: ritual rules plus explicit markers.
        let mut sc_delta = parsed.soulcredit_change;
        let mut sc_reasons = parsed.soulcredit_reasons.clone();
        if let Some(ritual) = ritual_outcome {
            sc_delta += ritual.soulcredit_change;
        }
        if sc_delta != 0 {
            let state = mechanics.soulcredit_state(player_id, 0);
            let old = state.score;
            state.adjust(sc_delta, &sc_reasons.join(", "));
            if state.score != old {
                let new_score = state.score;
                narration.push_str(&format!(
                    "\n\n⚖️ Soulcredit: {} → {} ({})",
                    old,
                    new_score,
                    sc_reasons.join(", ")
                ));
            }
        } else {
            sc_reasons.clear();
        }

        for condition in &parsed.conditions {
            mechanics.add_condition(
                player_id,
                Condition {
                    name: condition.name.clone(),
                    condition_type: condition.condition_type.clone(),
                    penalty: condition.penalty,
                    description: condition.description.clone(),
                    duration: 3,
                    affects: vec![],
                },
            );
            narration.push_str(&format!(
                "\n\n🩹 Condition: {} ({:+})",
                condition.name, condition.penalty
            ));
        }

        if let Some(position) = &parsed.position_change {
            self.roster.with(player_id, |combat| {
                debug!("{} position: {} → {}", player_id, combat.position, position);
                combat.position = position.clone();
            });
        }

        // Eye of Breach: one-shot manifestation at high void.
        let character_void = mechanics.void_state(&void_target_id).score;
        let scene_void = mechanics.scene_void_level;
        drop(mechanics);
        if let Some(event) = self.check_eye_of_breach(character_void, scene_void).await {
            narration.push_str(&format!("\n\n{}", event));
        }

        let mechanics = self.mechanics.lock().await;
        let clock_states: serde_json::Map<String, Value> = mechanics
            .scene_clocks
            .iter()
            .map(|(name, clock)| (name.clone(), json!(clock.progress_label())))
            .collect();
        let economy = json!({
            "void_delta": void_delta_applied,
            "void_triggers": void_reasons,
            "soulcredit_delta": sc_delta,
            "soulcredit_reasons": sc_reasons,
        });
        (economy, Value::Object(clock_states))
    }

    /// Apply damage/debuff/status/movement/reveal effects to the declared
    /// target. Fallback damage is synthesized only for enemy targets; the
    /// Director's prose is authoritative for PC targets.
    #[allow(clippy::too_many_arguments)]
    async fn apply_target_effect(
        &mut self,
        attacker_id: &str,
        attacker_name: &str,
        target: &str,
        action: &Value,
        resolution: &crate::voidtable::mechanics::ActionResolution,
        combat_data: &outcome::CombatTriplet,
        llm_narration: &str,
        round: u32,
        narration: &mut String,
    ) {
        let mut effect = markers::parse_effect_block(llm_narration);

        if effect.is_none() {
            if let Some(final_damage) = combat_data.post_soak_damage {
                if final_damage > 0 {
                    effect = Some(markers::EffectBlock {
                        effect_type: "damage".to_string(),
                        target: target.to_string(),
                        final_damage: Some(final_damage),
                        penalty: None,
                        duration: None,
                        bonus: None,
                        effect: None,
                        new_position: None,
                        source: "narration",
                    });
                }
            }
        }

        let is_targeting_pc = target.starts_with("tgt_")
            && self.shared.with_combat_ids(|ids| ids.is_player(target));

        if effect.is_none() && resolution.success && !is_targeting_pc {
            let weapon_damage = action
                .get("weapon_damage")
                .and_then(Value::as_i64)
                .unwrap_or(6) as i32;
            let target_soak = {
                let manager = self.enemy_manager.lock().await;
                self.resolve_enemy_id(target, &manager)
                    .and_then(|id| manager.enemy_by_id(&id).map(|e| e.soak))
                    .unwrap_or(8)
            };
            effect = generate_fallback_effect(target, weapon_damage, resolution.margin, target_soak);
            if effect.is_some() {
                debug!("generated fallback effect for {}", target);
            }
        }

        let Some(effect) = effect else { return };

        if is_targeting_pc {
            // Friendly fire: damage applies to the ally agent.
            let Some(target_ref) = self.shared.with_combat_ids(|ids| ids.resolve(target)) else {
                return;
            };
            warn!(
                "friendly fire: {} targeting PC {} ({})",
                attacker_name, target_ref.name, target
            );
            if effect.effect_type == "damage" {
                if let Some(damage) = effect.final_damage {
                    let wounds = self
                        .roster
                        .with(&target_ref.agent_id, |combat| combat.take_damage(damage))
                        .unwrap_or(0);
                    narration.push_str(&format!(
                        "\n\n🔥 **Friendly fire: {} takes {} damage!**",
                        target_ref.name, damage
                    ));
                    let _ = self.event_log.log_combat_action(
                        round,
                        (attacker_id, attacker_name),
                        (target_ref.agent_id.as_str(), target_ref.name.as_str()),
                        "friendly fire",
                        json!({"total": resolution.total, "dc": resolution.difficulty,
                               "hit": resolution.success, "margin": resolution.margin}),
                        Some(json!({"dealt": damage})),
                        wounds,
                        None,
                    );
                }
            }
            return;
        }

        let mut manager = self.enemy_manager.lock().await;
        let Some(enemy_id) = self.resolve_enemy_id(&effect.target, &manager)
            .or_else(|| self.resolve_enemy_id(target, &manager))
        else {
            warn!("could not find target {:?} to apply effect", effect.target);
            return;
        };
        let Some(enemy) = manager.enemy_by_id_mut(&enemy_id) else {
            return;
        };

        match effect.effect_type.as_str() {
            "damage" => {
                let damage = effect.final_damage.unwrap_or(0);
                if damage <= 0 {
                    return;
                }
                let wounds = enemy.take_damage(damage);
                let source_label = if effect.source == "fallback" { " (fallback)" } else { "" };
                narration.push_str(&format!(
                    "\n\n⚔️ **{} takes {} damage!**{}",
                    enemy.name, damage, source_label
                ));

                let defender_state = json!({
                    "health": enemy.health,
                    "max_health": enemy.max_health,
                    "wounds": enemy.wounds,
                    "alive": enemy.health > 0,
                });
                let enemy_name = enemy.name.clone();
                let enemy_agent_id = enemy.agent_id.clone();

                if enemy.health <= 0 {
                    let (alive, status) = enemy.check_death_save(&self.dice);
                    if !alive {
                        enemy.is_active = false;
                        narration.push_str(&format!("\n💀 **{} is KILLED!**", enemy_name));
                        let _ = self.event_log.log_enemy_defeat(
                            round,
                            &enemy_agent_id,
                            &enemy_name,
                            "killed",
                            round.saturating_sub(enemy.spawn_round),
                        );
                    } else if status == "unconscious" {
                        enemy.is_active = false;
                        narration
                            .push_str(&format!("\n😵 **{} is knocked unconscious!**", enemy_name));
                    } else {
                        narration
                            .push_str(&format!("\n⚠️ **{} is critically wounded!**", enemy_name));
                    }
                }

                let _ = self.event_log.log_combat_action(
                    round,
                    (attacker_id, attacker_name),
                    (enemy_agent_id.as_str(), enemy_name.as_str()),
                    action
                        .get("skill")
                        .and_then(Value::as_str)
                        .unwrap_or("attack"),
                    json!({
                        "attr": resolution.attribute.as_str(),
                        "attr_val": resolution.attribute_value,
                        "skill": resolution.skill,
                        "skill_val": resolution.skill_value,
                        "d20": resolution.roll,
                        "total": resolution.total,
                        "dc": resolution.difficulty,
                        "hit": resolution.success,
                        "margin": resolution.margin,
                    }),
                    Some(json!({
                        "base_damage": combat_data.damage.unwrap_or(damage),
                        "soak": combat_data.soak.unwrap_or(0),
                        "dealt": damage,
                    })),
                    wounds,
                    Some(defender_state),
                );
            }
            "debuff" => {
                let penalty = effect.penalty.unwrap_or(-2);
                let duration = effect.duration.unwrap_or(3);
                let description = effect
                    .effect
                    .clone()
                    .unwrap_or_else(|| format!("{} to rolls", penalty));
                enemy.add_debuff(&description, penalty, duration, attacker_name);
                narration.push_str(&format!(
                    "\n\n🔻 **{} debuffed: {}** (lasts {} rounds)",
                    enemy.name, description, duration
                ));
            }
            "status" => {
                let status = effect.effect.clone().unwrap_or_else(|| "affected".to_string());
                enemy.add_status_effect(&status);
                narration.push_str(&format!("\n\n💫 **{} status: {}**", enemy.name, status));
            }
            "movement" => {
                if let Some(position) = &effect.new_position {
                    enemy.position = position.clone();
                    narration.push_str(&format!(
                        "\n\n🚶 **{} forced to {}!**",
                        enemy.name, position
                    ));
                }
            }
            "reveal" => {
                let weakness = effect
                    .effect
                    .clone()
                    .unwrap_or_else(|| "weakness revealed".to_string());
                let bonus = effect.bonus.unwrap_or(2);
                enemy.add_revealed_weakness(&weakness, bonus);
                narration.push_str(&format!(
                    "\n\n🔍 **{} weakness revealed: {}** (+{} for allies)",
                    enemy.name, weakness, bonus
                ));
            }
            other => warn!("unknown effect type {:?}", other),
        }
    }

    fn resolve_enemy_id(&self, target: &str, manager: &EnemyCombatManager) -> Option<String> {
        if target.starts_with("tgt_") {
            let target_ref = self.shared.with_combat_ids(|ids| ids.resolve(target))?;
            if target_ref.is_player {
                return None;
            }
            return Some(target_ref.agent_id);
        }
        let target_lower = target.to_lowercase();
        manager
            .active_enemies()
            .find(|enemy| {
                let name_lower = enemy.name.to_lowercase();
                name_lower.contains(&target_lower) || target_lower.contains(&name_lower)
            })
            .map(|enemy| enemy.agent_id.clone())
    }

    fn apply_ally_buff(&self, ally_name: &str, intent: &str, margin: i32, narration: &mut String) {
        let Some(ally_id) = self.shared.agent_id_for_name(ally_name) else {
            warn!("could not find ally {:?} to apply buff", ally_name);
            return;
        };
        match generate_fallback_buff(ally_name, intent, margin) {
            Some(FallbackBuff::Heal { amount, .. }) => {
                let healed = self
                    .roster
                    .with(&ally_id, |combat| combat.heal(amount))
                    .unwrap_or(0);
                if healed > 0 {
                    narration.push_str(&format!(
                        "\n\n💚 **{} healed for {} HP!**",
                        ally_name, healed
                    ));
                }
            }
            Some(FallbackBuff::Buff {
                bonus,
                duration,
                effect,
                ..
            }) => {
                self.roster.with(&ally_id, |combat| {
                    combat.add_buff(&effect, bonus, duration, "ally");
                });
                narration.push_str(&format!(
                    "\n\n🔺 **{} buffed: {}** (+{} for {} rounds)",
                    ally_name, effect, bonus, duration
                ));
            }
            None => {}
        }
    }

    async fn check_eye_of_breach(&mut self, character_void: i32, scene_void: i32) -> Option<String> {
        if self.eye_of_breach_appeared || (character_void < 6 && scene_void < 6) {
            return None;
        }
        self.eye_of_breach_appeared = true;

        let situation = self
            .current_scenario
            .as_ref()
            .map(|s| s.situation.clone())
            .unwrap_or_default();
        let prompt = format!(
            "The Eye of Breach — a rogue AI that manifests through high void corruption —\n\
             has just appeared. Character void: {}/10, ambient void: {}/10.\nScenario: {}\n\n\
             Write 2-3 ominous sentences of its manifestation: surveillance, data harvesting,\n\
             reality distortion. Create tension without solving anything for the players.",
            character_void, scene_void, situation
        );

        let text = match self
            .llm
            .complete(LlmRequest::new(prompt).with_temperature(0.85).with_max_tokens(200))
            .await
        {
            Ok(response) => response.content,
            Err(_) => "Reality fractures as an ancient intelligence turns its gaze toward the \
                       rising corruption, data streaming through dimensions that should not \
                       connect."
                .to_string(),
        };
        info!(
            "Eye of Breach appeared (char void {}, ambient {})",
            character_void, scene_void
        );
        Some(format!("👁️ **Eye of Breach Detected** {}", text))
    }

    // ---- Synthesis ----

    async fn handle_synthesis(
        &mut self,
        payload: &Value,
        link: &BusLink,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let resolutions = payload
            .get("resolutions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let round = payload.get("round").and_then(Value::as_u64).unwrap_or(0) as u32;

        if resolutions.is_empty() {
            return Ok(());
        }

        let synthesis = self.synthesize_round(&resolutions, round).await;
        let _ = self.event_log.log_synthesis(round, &synthesis);

        link.send(
            MessageType::DmNarration,
            None,
            json!({
                "narration": synthesis,
                "is_round_synthesis": true,
                "round": round,
            }),
        )
        .await
    }

    async fn synthesize_round(&mut self, resolutions: &[Value], round: u32) -> String {
        let outcomes_block: String = resolutions
            .iter()
            .map(|res| {
                let name = res
                    .get("character_name")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown");
                let success = res
                    .get("resolution")
                    .and_then(|r| r.get("success"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let intent = res
                    .get("action")
                    .and_then(|a| a.get("intent"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown action");
                format!("- {} {} at: {}", name, if success { "succeeded" } else { "failed" }, intent)
            })
            .collect::<Vec<_>>()
            .join("\n");

        // Flush queued clock updates and collect expiry context while the
        // lock is held; the LLM call happens afterwards.
        let (clock_block, filled_block, expired_block) = {
            let mut mechanics = self.mechanics.lock().await;
            let deltas = mechanics.apply_queued_clock_updates();
            if !deltas.is_empty() {
                for (name, delta) in &deltas {
                    let _ = self.event_log.log_clock_event(
                        round,
                        name,
                        delta.before,
                        delta.after,
                        delta.maximum,
                        delta.filled,
                        &delta.reasons.join(", "),
                    );
                }
            }
            let filled = mechanics.take_filled_clocks();
            let expired = mechanics.check_and_expire_clocks();

            let mut clock_lines = Vec::new();
            for (name, clock) in &mechanics.scene_clocks {
                let overflow = clock.overflow();
                let status = if clock.filled() && overflow >= 3 {
                    format!("CRITICAL OVERFLOW: {} (+{})", clock.progress_label(), overflow)
                } else if clock.filled() && overflow >= 1 {
                    format!("OVERFLOWING: {} (+{})", clock.progress_label(), overflow)
                } else if clock.filled() {
                    format!("FILLED: {}", clock.progress_label())
                } else {
                    clock.progress_label()
                };
                clock_lines.push(format!(
                    "  - {}: {}\n    Advance = {} | Regress = {}",
                    name, status, clock.advance_means, clock.regress_means
                ));
            }
            let clock_block = if clock_lines.is_empty() {
                String::new()
            } else {
                format!("\n**Current Clock State:**\n{}", clock_lines.join("\n"))
            };

            let filled_block = if filled.is_empty() {
                String::new()
            } else {
                format!(
                    "\n**CLOCKS FILLED:** {}\nFilled clocks MUST trigger scenario changes: \
                     include the markers from their filled consequences, or for narrative \
                     clocks use [ADVANCE_STORY: Location | Situation] or [NEW_CLOCK: Name | Max | Description].",
                    filled
                        .iter()
                        .map(|f| f.clock_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };

            let expired_block = if expired.is_empty() {
                String::new()
            } else {
                let lines: Vec<String> = expired
                    .iter()
                    .map(|exp| {
                        let directive = match exp.expiration_kind {
                            crate::voidtable::mechanics::ExpirationKind::CrisisAverted => {
                                "CRISIS AVERTED/OPPORTUNITY LOST — narrate how the window closed."
                                    .to_string()
                            }
                            crate::voidtable::mechanics::ExpirationKind::ForceResolve => {
                                if exp.filled_consequence.is_empty() {
                                    "FILLED — you MUST use [ADVANCE_STORY: Location | Situation] to move the story.".to_string()
                                } else {
                                    format!(
                                        "FILLED — consequence: {} (include its markers verbatim).",
                                        exp.filled_consequence
                                    )
                                }
                            }
                            crate::voidtable::mechanics::ExpirationKind::Escalate => {
                                "SITUATION ESCALATES — the stalemate breaks; consider [ADVANCE_STORY: …] or [NEW_CLOCK: …].".to_string()
                            }
                        };
                        format!(
                            "  - {} (was {}/{}): {}",
                            exp.clock_name, exp.current, exp.maximum, directive
                        )
                    })
                    .collect();
                format!("\n**CLOCKS EXPIRED (auto-removed):**\n{}", lines.join("\n"))
            };

            (clock_block, filled_block, expired_block)
        };

        let advance_block = if self.needs_story_advancement.load(Ordering::SeqCst) {
            "\n**STORY ADVANCEMENT REQUIRED — ALL CLOCKS COMPLETE.**\n\
             You MUST include [ADVANCE_STORY: New Location | New Situation] AND 2-3\n\
             [NEW_CLOCK: Name | Max | Description] markers, or the scene will stall."
                .to_string()
        } else {
            String::new()
        };

        let enemy_block = if self.config.enemy_agents_enabled {
            "\nSpawn enemies ONLY when a filled clock's consequence carries a\n\
             [SPAWN_ENEMY: name | template | count | position | tactics] marker — never\n\
             for drama alone. Copy the marker text exactly."
        } else {
            ""
        };

        let prompt = format!(
            "You are the Director. Multiple characters just acted simultaneously.\n\n\
             **What they tried:**\n{}\n{}{}{}{}{}\n\n\
             Write a cohesive 1-2 paragraph narration of how these actions played out\n\
             together — fastest resolved first, each success or failure reshaping the\n\
             situation for the slower actors. Interpret each clock through its Advance/Regress\n\
             semantics before deciding whether its movement helped or hurt the party. If the\n\
             party is failing its objectives, let the desperation show.",
            outcomes_block, clock_block, filled_block, expired_block, advance_block, enemy_block
        );

        let mut synthesis = match self
            .llm
            .complete(LlmRequest::new(prompt).with_temperature(0.8).with_max_tokens(500))
            .await
        {
            Ok(response) => response.content,
            Err(e) => {
                error!("synthesis generation failed: {}", e);
                format!("Round {} completes with mixed results:\n{}", round, outcomes_block)
            }
        };

        // Compliance retry for malformed spawn markers, at low temperature.
        let invalid = markers::extract_invalid_spawn_markers(&synthesis);
        if !invalid.is_empty() {
            warn!("{} invalid SPAWN_ENEMY markers in synthesis - retrying", invalid.len());
            let _ = self
                .event_log
                .log_marker_retry(round, "SPAWN_ENEMY", &invalid, None, None);
            let retry_prompt = format!(
                "You emitted incomplete SPAWN_ENEMY markers. Rewrite each with ALL 5 fields:\n\
                 [SPAWN_ENEMY: name | template | count | position | tactics]\n\
                 Templates: grunt, elite, sniper, boss, enforcer, ambusher.\n\
                 Positions: Engaged, Near-Enemy, Far-Enemy, Extreme-Enemy.\n\n\
                 INVALID:\n{}\n\nProvide ONLY the corrected markers, one per line.",
                invalid
                    .iter()
                    .map(|m| format!("- [SPAWN_ENEMY: {}]", m))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            match self
                .llm
                .complete(LlmRequest::new(retry_prompt).with_temperature(0.3).with_max_tokens(300))
                .await
            {
                Ok(response) if !response.content.trim().is_empty() => {
                    let _ = self.event_log.log_marker_retry(
                        round,
                        "SPAWN_ENEMY",
                        &invalid,
                        Some(response.content.as_str()),
                        Some(true),
                    );
                    synthesis.push_str("\n\n");
                    synthesis.push_str(&response.content);
                }
                _ => {
                    let _ = self.event_log.log_marker_retry(
                        round,
                        "SPAWN_ENEMY",
                        &invalid,
                        Some(""),
                        Some(false),
                    );
                }
            }
        }

        if self.needs_story_advancement.swap(false, Ordering::SeqCst) {
            info!("story advancement synthesis generated - flag cleared");
        }
        synthesis
    }
}

fn parse_clock_line(body: &str) -> Option<GeneratedClock> {
    let parts: Vec<&str> = body.split('|').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }
    let maximum = parts[1].parse().unwrap_or(6);
    let mut clock = GeneratedClock {
        name: parts[0].to_string(),
        maximum,
        description: parts[2].to_string(),
        advance_means: String::new(),
        regress_means: String::new(),
        filled_consequence: String::new(),
    };
    let mut iter = parts[3..].iter();
    while let Some(part) = iter.next() {
        if let Some(value) = part.strip_prefix("ADVANCE=") {
            clock.advance_means = value.trim().to_string();
        } else if let Some(value) = part.strip_prefix("REGRESS=") {
            clock.regress_means = value.trim().to_string();
        } else if let Some(value) = part.strip_prefix("FILLED=") {
            // FILLED is the last field; rejoin any pipes inside its embedded
            // markers ([NEW_CLOCK: Name | Max | Desc], [SPAWN_ENEMY: …]).
            let mut consequence = value.trim().to_string();
            for rest in iter.by_ref() {
                consequence.push_str(" | ");
                consequence.push_str(rest);
            }
            clock.filled_consequence = consequence;
        }
    }
    Some(clock)
}

fn has_control_marker(text: &str) -> bool {
    ["[SPAWN_ENEMY:", "[DESPAWN_ENEMY:", "[ADVANCE_STORY:", "[NEW_CLOCK:", "[SESSION_END:"]
        .iter()
        .any(|marker| text.contains(marker))
}

fn is_danger_themed(name: &str, description: &str) -> bool {
    let combined = format!("{} {}", name.to_lowercase(), description.to_lowercase());
    ["danger", "threat", "alert", "security", "pursuit", "assault", "breach", "attack"]
        .iter()
        .any(|kw| combined.contains(kw))
}

/// First sentence of the narration that reads like new information.
fn extract_discovery(narration: &str, intent: &str) -> Option<String> {
    const DISCOVERY_KEYWORDS: [&str; 16] = [
        "discover", "find", "notice", "reveal", "uncover", "detect", "sense", "identify",
        "realize", "learn", "see", "observe", "recognize", "spot", "trace", "glimpse",
    ];
    for sentence in narration.split('.') {
        let sentence = sentence.trim();
        let lower = sentence.to_lowercase();
        if DISCOVERY_KEYWORDS.iter().any(|kw| lower.contains(kw))
            && sentence.len() > 20
            && sentence.len() < 200
        {
            return Some(sentence.to_string());
        }
    }
    if intent.is_empty() {
        None
    } else {
        Some(format!("Investigated: {}", intent.chars().take(100).collect::<String>()))
    }
}

fn clock_payload_rows(mechanics: &MechanicsEngine) -> Vec<Value> {
    mechanics
        .scene_clocks
        .values()
        .map(|clock| {
            json!({
                "name": clock.name,
                "maximum": clock.maximum,
                "progress": clock.progress_label(),
                "description": clock.description,
                "advance_means": clock.advance_means,
                "regress_means": clock.regress_means,
            })
        })
        .collect()
}

fn scenario_to_value(scenario: &Scenario, clocks: Vec<Value>) -> Value {
    json!({
        "theme": scenario.theme,
        "location": scenario.location,
        "situation": scenario.situation,
        "void_level": scenario.void_level,
        "active_vendor": scenario.active_vendor.as_ref().map(|vendor| json!({
            "name": vendor.name,
            "type": vendor.kind.to_string(),
            "faction": vendor.faction,
            "greeting": vendor.greeting,
            "inventory_preview": vendor.inventory.iter().take(3).map(|i| i.name.clone()).collect::<Vec<_>>(),
        })),
        "required_purchase": scenario.required_purchase,
        "vendor_gate_description": scenario.vendor_gate_description,
        "clocks": clocks,
    })
}

#[async_trait]
impl AgentRuntime for DirectorAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn on_start(&mut self, link: &BusLink) -> Result<(), Box<dyn Error + Send + Sync>> {
        link.send(
            MessageType::AgentReady,
            None,
            json!({
                "agent_type": "dm",
                "capabilities": ["scenario_generation", "adjudication", "synthesis"],
            }),
        )
        .await?;
        info!("[DM {}] Director ready", self.agent_id);
        Ok(())
    }

    async fn on_shutdown(&mut self) {
        debug!("director {} shutting down", self.agent_id);
    }

    async fn handle_message(
        &mut self,
        message: Message,
        link: &BusLink,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match message.message_type {
            MessageType::SessionStart => {
                self.generate_scenario(link).await?;
            }
            MessageType::ActionDeclared => match message.payload_str("phase") {
                Some("resolution_only") => {
                    let payload = message.payload.clone();
                    self.handle_adjudication(&payload, link).await?;
                }
                Some("synthesis") => {
                    let payload = message.payload.clone();
                    self.handle_synthesis(&payload, link).await?;
                }
                // Declaration-phase broadcasts are just noted.
                _ => debug!("[DM] noted declaration from {}", message.sender),
            },
            MessageType::ScenarioUpdate => {
                if let Some(scenario) = self.current_scenario.as_mut() {
                    if let Some(location) = message.payload_str("new_location") {
                        scenario.location = location.to_string();
                    }
                    if let Some(situation) = message.payload_str("new_situation") {
                        scenario.situation = situation.to_string();
                    }
                    if let Some(theme) = message.payload_str("new_theme") {
                        scenario.theme = theme.to_string();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clock_line_full() {
        let clock = parse_clock_line(
            " Security Alert | 6 | Hunters closing in | ADVANCE=Hunters nearer | REGRESS=Misled | FILLED=Arrive [SPAWN_ENEMY: Hunters | elite | 2 | Far-Enemy | tactical_ranged]",
        )
        .unwrap();
        assert_eq!(clock.name, "Security Alert");
        assert_eq!(clock.maximum, 6);
        assert_eq!(clock.advance_means, "Hunters nearer");
        assert!(clock.filled_consequence.contains("[SPAWN_ENEMY:"));
    }

    #[test]
    fn test_parse_clock_line_minimal() {
        let clock = parse_clock_line("Escape | 4 | Way out").unwrap();
        assert_eq!(clock.maximum, 4);
        assert!(clock.filled_consequence.is_empty());
        assert!(parse_clock_line("TooFew | 4").is_none());
    }

    #[test]
    fn test_parse_clock_line_rejoins_piped_filled_markers() {
        let clock = parse_clock_line(
            "Void Resonance | 4 | Growing instability | ADVANCE=Intensifies | REGRESS=Stabilized | FILLED=Rift opens [NEW_CLOCK: Rift Manifestation | 6 | Entities crossing over]",
        )
        .unwrap();
        assert_eq!(
            clock.filled_consequence,
            "Rift opens [NEW_CLOCK: Rift Manifestation | 6 | Entities crossing over]"
        );
        // The rejoined marker parses as a complete NEW_CLOCK.
        let markers = crate::voidtable::markers::parse_new_clocks(&clock.filled_consequence);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].max, 6);
    }

    #[test]
    fn test_has_control_marker_detection() {
        assert!(has_control_marker("done [ADVANCE_STORY: A | B]"));
        assert!(has_control_marker("[NEW_CLOCK: X | 4 | y]"));
        assert!(!has_control_marker("the story just continues in prose"));
    }

    #[test]
    fn test_extract_discovery_prefers_informative_sentence() {
        let narration = "The scanner hums quietly. You uncover a maintenance credential wedged \
                         behind the relay panel. Dust settles.";
        let discovery = extract_discovery(narration, "scan the relay").unwrap();
        assert!(discovery.contains("uncover"));

        // Fallback names the intent.
        let fallback = extract_discovery("Nothing here", "sweep the hall").unwrap();
        assert!(fallback.starts_with("Investigated:"));
    }

    #[test]
    fn test_danger_theming() {
        assert!(is_danger_themed("Security Alert", "hunters"));
        assert!(!is_danger_themed("Evidence Collection", "gathering proof"));
    }
}

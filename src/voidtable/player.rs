//! LLM-backed player agent.
//!
//! Each player owns a character sheet, produces structured
//! [`ActionDeclaration`]s on `TurnRequest`, and applies the local side of
//! resolutions: consumed offerings, synced void, vendor purchases, and
//! currency transfers. Inter-party dialogue and bonding rituals are free
//! actions — they trigger a second ("main") declaration in the same turn and
//! can grant the named party member a single-use +2 coordination bonus.

use crate::voidtable::action::{ActionDeclaration, ActionValidator};
use crate::voidtable::agent::{AgentRuntime, BusLink};
use crate::voidtable::character::{CharacterSheet, CombatRoster, CombatState, WeaponLoadout};
use crate::voidtable::economy::{inventory_key_for, item_price};
use crate::voidtable::llm::{LlmClient, LlmRequest};
use crate::voidtable::mechanics::{ActionType, Attribute, MechanicsEngine};
use crate::voidtable::message::{Message, MessageType};
use crate::voidtable::prompts::PromptLibrary;
use crate::voidtable::router::{character_skill_value, normalize_skill, ActionRouter};
use crate::voidtable::shared::{PendingTransfer, SharedState};
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{json, Value};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

lazy_static! {
    static ref TRANSFER_AMOUNT_RE: Regex =
        Regex::new(r"(?i)(\d+)\s+(spark|drip|grain|breath)").unwrap();
    static ref TRANSFER_RECIPIENT_RE: Regex = Regex::new(r"(?i)to\s+(\w+(?:\s+\w+)*)").unwrap();
    static ref DIFFICULTY_LINE_RE: Regex = Regex::new(r"(\d+)").unwrap();
}

const COORDINATION_KEYWORDS: [&str; 12] = [
    "share", "tell", "inform", "coordinate", "discuss", "ask", "brief", "report", "advise",
    "warn", "update", "consult",
];

/// One player participant.
pub struct PlayerAgent {
    agent_id: String,
    pub sheet: CharacterSheet,
    llm: Arc<dyn LlmClient>,
    provider: String,
    shared: SharedState,
    roster: CombatRoster,
    mechanics: Arc<Mutex<MechanicsEngine>>,
    validator: Arc<Mutex<ActionValidator>>,
    prompts: Arc<PromptLibrary>,
    equipped: WeaponLoadout,
    carried: Vec<String>,
    current_scenario: Option<Value>,
    free_action_used: bool,
}

impl PlayerAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: &str,
        sheet: CharacterSheet,
        llm: Arc<dyn LlmClient>,
        provider: &str,
        shared: SharedState,
        roster: CombatRoster,
        mechanics: Arc<Mutex<MechanicsEngine>>,
        validator: Arc<Mutex<ActionValidator>>,
        prompts: Arc<PromptLibrary>,
        equipped: WeaponLoadout,
        carried: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            sheet,
            llm,
            provider: provider.to_string(),
            shared,
            roster,
            mechanics,
            validator,
            prompts,
            equipped,
            carried,
            current_scenario: None,
            free_action_used: false,
        }
    }

    // ---- Prompt composition ----

    fn prompt_variables(&self, recent_intents: &[String], other_players: &[String]) -> Value {
        let attributes_line = Attribute::ALL
            .iter()
            .map(|a| format!("{} {}", a.as_str(), self.sheet.attribute(*a)))
            .collect::<Vec<_>>()
            .join(", ");
        let skills_line = self
            .sheet
            .tiered_skills()
            .iter()
            .map(|(name, value)| format!("{} {}", name, value))
            .collect::<Vec<_>>()
            .join(", ");

        let scenario = self.current_scenario.clone().unwrap_or_else(|| json!({}));
        let clocks_block = scenario
            .get("clocks")
            .and_then(Value::as_array)
            .map(|clocks| {
                clocks
                    .iter()
                    .map(|c| {
                        format!(
                            "- {} ({}): advance = {}, regress = {}",
                            c.get("name").and_then(Value::as_str).unwrap_or("?"),
                            c.get("progress").and_then(Value::as_str).unwrap_or("0/?"),
                            c.get("advance_means").and_then(Value::as_str).unwrap_or(""),
                            c.get("regress_means").and_then(Value::as_str).unwrap_or(""),
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| "- none".to_string());

        let discoveries_block = {
            let discoveries = self.shared.recent_discoveries(5);
            if discoveries.is_empty() {
                "- none yet".to_string()
            } else {
                discoveries
                    .iter()
                    .map(|d| format!("- {} ({})", d.discovery, d.character))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        json!({
            "character": {
                "name": self.sheet.name,
                "pronouns": self.sheet.pronouns,
                "faction": self.sheet.faction,
                "attributes_line": attributes_line,
                "skills_line": skills_line,
                "void_score": self.sheet.void_score,
                "soulcredit": self.sheet.soulcredit,
                "goals_line": self.sheet.goals.join("; "),
            },
            "recent_intents": if recent_intents.is_empty() {
                "none".to_string()
            } else {
                recent_intents.join("; ")
            },
            "scenario": {
                "theme": scenario.get("theme").and_then(Value::as_str).unwrap_or("Unknown"),
                "location": scenario.get("location").and_then(Value::as_str).unwrap_or("Unknown"),
                "situation": scenario.get("situation").and_then(Value::as_str).unwrap_or(""),
            },
            "clocks_block": clocks_block,
            "party_line": other_players.join(", "),
            "discoveries_block": discoveries_block,
            "position": self
                .roster
                .with(&self.agent_id, |c| c.position.clone())
                .unwrap_or_else(|| "Near-PC".to_string()),
            "combatants_block": self
                .shared
                .with_combat_ids(|ids| ids.roster())
                .iter()
                .map(|(id, name, is_player)| {
                    format!("- {} = {}{}", id, name, if *is_player { " (ally)" } else { "" })
                })
                .collect::<Vec<_>>()
                .join("\n"),
        })
    }

    fn declaration_prompt(
        &self,
        recent_intents: &[String],
        other_players: &[String],
        exclude_dialogue: bool,
        enemies_present: bool,
    ) -> (String, Option<crate::voidtable::prompts::PromptMetadata>) {
        let variables = self.prompt_variables(recent_intents, other_players);
        let mut sections = vec!["identity", "scene"];
        if enemies_present {
            sections.push("tactical");
        }
        sections.push("action_format");

        let composed = self
            .prompts
            .compose("player", &self.provider, "en", &sections, &variables);
        let mut prompt = composed
            .as_ref()
            .map(|p| p.content.clone())
            .unwrap_or_else(|| "Declare your next action.".to_string());
        if exclude_dialogue {
            prompt.push_str(
                "\n\nYou already used your free dialogue this round. Declare a NON-dialogue main action.",
            );
        }
        (prompt, composed.map(|p| p.metadata))
    }

    // ---- Action generation ----

    /// Parse the structured declaration format out of LLM text.
    fn parse_action_from_llm(&self, text: &str) -> Option<ActionDeclaration> {
        let mut intent = None;
        let mut attribute = None;
        let mut skill: Option<String> = None;
        let mut difficulty = None;
        let mut justification = String::new();
        let mut action_type = None;
        let mut description = None;
        let mut target = None;
        let mut target_position = None;
        let mut has_tool = false;
        let mut has_offering = false;
        let mut components = None;

        for line in text.lines() {
            let line = line.trim().trim_start_matches('*').trim();
            let Some((key, value)) = line.split_once(':') else { continue };
            let value = value.trim();
            match key.trim().to_ascii_uppercase().as_str() {
                "INTENT" => intent = Some(value.to_string()),
                "ATTRIBUTE" => attribute = Attribute::parse(value),
                "SKILL" => skill = normalize_skill(Some(value)),
                "DIFFICULTY" => {
                    if let Some(caps) = DIFFICULTY_LINE_RE.captures(value) {
                        difficulty = caps[1].parse::<i32>().ok();
                    }
                    if let Some((_, rest)) = value.split_once('-') {
                        justification = rest.trim().to_string();
                    }
                }
                "ACTION_TYPE" => action_type = ActionType::parse(value),
                "DESCRIPTION" => description = Some(value.to_string()),
                "TARGET" => {
                    if !value.eq_ignore_ascii_case("none") && !value.is_empty() {
                        target = Some(value.to_string());
                    }
                }
                "TARGET_POSITION" => target_position = Some(value.to_string()),
                "PRIMARY_TOOL" => has_tool = value.to_ascii_lowercase().starts_with('y'),
                "OFFERING" => has_offering = value.to_ascii_lowercase().starts_with('y'),
                "COMPONENTS" => components = Some(value.to_string()),
                _ => {}
            }
        }

        let intent = intent?;
        let mut declaration = ActionDeclaration::new(
            intent,
            description.unwrap_or_else(|| text.chars().take(200).collect()),
            attribute.unwrap_or(Attribute::Perception),
            skill,
            action_type.unwrap_or(ActionType::Custom),
            self.sheet.name.clone(),
            self.agent_id.clone(),
        );
        declaration.difficulty_estimate = difficulty.unwrap_or(20).clamp(5, 50);
        if !justification.is_empty() {
            declaration.difficulty_justification = justification;
        }
        declaration.target_enemy = target;
        declaration.target_position = target_position;
        declaration.has_primary_tool = has_tool;
        declaration.has_offering = has_offering;
        declaration.ritual_components = components;
        Some(declaration)
    }

    /// Personality-driven template action for LLM failures and validation
    /// retries.
    fn template_action(&self, exclude_dialogue: bool) -> ActionDeclaration {
        let risk = self.sheet.personality.risk_tolerance;
        let curiosity = self.sheet.personality.void_curiosity;
        let other_players = self.shared.other_players(&self.agent_id);

        let (intent, description, attribute, skill, action_type) = if curiosity >= 7 {
            (
                "sense the void currents around the disturbance".to_string(),
                format!("{} opens their senses to the local resonance, hunting the wrongness.", self.sheet.name),
                Attribute::Perception,
                normalize_skill(Some("Attunement")).filter(|s| self.sheet.skill(s) > 0),
                ActionType::Perception,
            )
        } else if risk >= 7 {
            (
                "push forward and examine the most dangerous lead".to_string(),
                format!("{} moves straight at the heart of the problem, careless of exposure.", self.sheet.name),
                Attribute::Perception,
                normalize_skill(Some("Awareness")).filter(|s| self.sheet.skill(s) > 0),
                ActionType::Investigate,
            )
        } else if !exclude_dialogue && !other_players.is_empty() && risk <= 3 {
            (
                format!("ask {} what they make of the situation", other_players[0]),
                format!("{} keeps close to the group, trading observations.", self.sheet.name),
                Attribute::Empathy,
                normalize_skill(Some("Charm")).filter(|s| self.sheet.skill(s) > 0),
                ActionType::Social,
            )
        } else {
            (
                "search the area for anything out of place".to_string(),
                format!("{} works the scene methodically, cataloguing details.", self.sheet.name),
                Attribute::Perception,
                normalize_skill(Some("Awareness")).filter(|s| self.sheet.skill(s) > 0),
                ActionType::Investigate,
            )
        };

        let mut declaration = ActionDeclaration::new(
            intent,
            description,
            attribute,
            skill,
            action_type,
            self.sheet.name.clone(),
            self.agent_id.clone(),
        );
        declaration.difficulty_justification = "routine pressured action".to_string();
        declaration.difficulty_estimate = 18;
        declaration
    }

    async fn generate_declaration(
        &self,
        recent_intents: &[String],
        other_players: &[String],
        exclude_dialogue: bool,
        enemies_present: bool,
    ) -> (ActionDeclaration, Option<crate::voidtable::prompts::PromptMetadata>) {
        let (prompt, metadata) = self.declaration_prompt(
            recent_intents,
            other_players,
            exclude_dialogue,
            enemies_present,
        );
        let declaration = match self
            .llm
            .complete(LlmRequest::new(prompt).with_temperature(0.8).with_max_tokens(400))
            .await
        {
            Ok(response) => self
                .parse_action_from_llm(&response.content)
                .unwrap_or_else(|| {
                    warn!("{} produced unparseable action, using template", self.agent_id);
                    self.template_action(exclude_dialogue)
                }),
            Err(e) => {
                warn!("{} LLM failed ({}), using template action", self.agent_id, e);
                self.template_action(exclude_dialogue)
            }
        };
        (declaration, metadata)
    }

    /// Serialize a declaration into the on-wire action payload, enriched
    /// with sheet-derived values.
    fn action_payload(
        &self,
        declaration: &ActionDeclaration,
        is_free_action: bool,
        prompt_metadata: Option<&crate::voidtable::prompts::PromptMetadata>,
    ) -> Value {
        let mut payload = serde_json::to_value(declaration).unwrap_or_else(|_| json!({}));
        let skill_value = character_skill_value(
            &self.sheet.skills,
            declaration.skill.as_deref(),
        );
        let attribute_value = self.sheet.attribute(declaration.attribute);
        let is_ritual = declaration.is_ritual || declaration.action_type == ActionType::Ritual;
        if let Value::Object(map) = &mut payload {
            map.insert("attribute_value".into(), json!(attribute_value));
            map.insert("skill_value".into(), json!(skill_value));
            map.insert("character".into(), json!(self.sheet.name));
            map.insert("agent_id".into(), json!(self.agent_id));
            map.insert("faction".into(), json!(self.sheet.faction));
            map.insert("is_free_action".into(), json!(is_free_action));
            map.insert(
                "has_offering".into(),
                json!(is_ritual && self.sheet.has_offering(None)),
            );
            map.insert(
                "has_primary_tool".into(),
                json!(is_ritual && self.sheet.has_focus()),
            );
            map.insert(
                "buff_bonus".into(),
                json!(self
                    .roster
                    .with(&self.agent_id, |c| c.buff_bonus())
                    .unwrap_or(0)),
            );
            if let Some(metadata) = prompt_metadata {
                map.insert("prompt_metadata".into(), metadata.to_value());
            }
        }
        payload
    }

    /// Detect a free action: dialogue or an inter-party ritual naming another
    /// party member. Grants the coordination bonus as a side effect.
    fn detect_free_action(&self, declaration: &ActionDeclaration, other_players: &[String]) -> bool {
        let is_dialogue = declaration.attribute == Attribute::Empathy
            && matches!(declaration.skill.as_deref(), Some("Charm") | Some("Counsel"));
        let is_intimacy = declaration.skill.as_deref() == Some("Intimacy Ritual");
        if !is_dialogue && !is_intimacy {
            return false;
        }

        let intent_lower = declaration.intent.to_lowercase();
        let description_lower = declaration.description.to_lowercase();
        for player_name in other_players {
            let name_lower = player_name.to_lowercase();
            let mentioned = intent_lower.contains(&name_lower)
                || description_lower.contains(&name_lower)
                || two_word_mention(&name_lower, &intent_lower, &description_lower);
            if !mentioned {
                continue;
            }

            if COORDINATION_KEYWORDS.iter().any(|kw| intent_lower.contains(kw)) {
                self.shared.grant_coordination_bonus(
                    &self.sheet.name,
                    player_name,
                    "coordinated information sharing",
                );
            }
            return true;
        }
        false
    }

    async fn send_declaration(
        &self,
        link: &BusLink,
        declaration: &ActionDeclaration,
        is_free_action: bool,
        prompt_metadata: Option<&crate::voidtable::prompts::PromptMetadata>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let payload = self.action_payload(declaration, is_free_action, prompt_metadata);
        debug!("[{}] {}", self.sheet.name, declaration.summary());
        link.send(MessageType::ActionDeclared, None, payload).await
    }

    async fn take_turn(&mut self, link: &BusLink) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.current_scenario.is_none() {
            debug!("{} has no scenario, skipping turn", self.sheet.name);
            return Ok(());
        }

        self.apply_incoming_transfers();

        let other_players = self.shared.other_players(&self.agent_id);
        let recent_intents = {
            let validator = self.validator.lock().await;
            validator.deduplicator.recent_intents(&self.agent_id)
        };
        let enemies_present = self
            .shared
            .with_combat_ids(|ids| ids.roster().iter().any(|(_, _, is_player)| !is_player));

        let (mut declaration, prompt_metadata) = self
            .generate_declaration(&recent_intents, &other_players, false, enemies_present)
            .await;

        // Ritual marking and skill alias normalization; the router fills the
        // rest at adjudication. AI choices are otherwise preserved.
        let router = ActionRouter::new();
        if router.is_explicit_ritual(&declaration.intent)
            || declaration.action_type == ActionType::Ritual
        {
            declaration.is_ritual = true;
            declaration.action_type = ActionType::Ritual;
        }
        if let Some(skill) = declaration.skill.clone() {
            declaration.skill = normalize_skill(Some(skill.as_str()));
        }

        // One structural retry with a simpler action, then give up to the
        // template.
        let valid = {
            let mut validator = self.validator.lock().await;
            let (valid, issues) = validator.validate_action(&declaration, true);
            if !valid {
                warn!("[{}] action rejected: {}", self.sheet.name, issues.join("; "));
            }
            valid
        };
        if !valid {
            declaration = self.template_action(false);
            let mut validator = self.validator.lock().await;
            let _ = validator.validate_action(&declaration, true);
        }

        let free_action_available = !self
            .roster
            .with(&self.agent_id, |c| c.free_action_used)
            .unwrap_or(false)
            && !self.free_action_used;
        let is_free_action = free_action_available
            && self.detect_free_action(&declaration, &other_players);

        self.send_declaration(link, &declaration, is_free_action, prompt_metadata.as_ref())
            .await?;

        // A free action yields a second, non-dialogue main action.
        if is_free_action {
            self.free_action_used = true;
            self.roster.with(&self.agent_id, |c| c.free_action_used = true);
            info!("[{}] free action used - generating main action", self.sheet.name);

            let (mut main, main_metadata) = self
                .generate_declaration(&recent_intents, &other_players, true, enemies_present)
                .await;
            let routed = router.route_action(
                &main.intent,
                main.action_type.as_str(),
                &self.sheet.skills,
                router.is_explicit_ritual(&main.intent),
                main.skill.as_deref(),
                &other_players,
            );
            if routed.attribute != main.attribute || routed.skill != main.skill {
                info!(
                    "[{}] routed main action to {} × {:?} ({})",
                    self.sheet.name, routed.attribute, routed.skill, routed.rationale
                );
                main.attribute = routed.attribute;
                main.skill = routed.skill;
            }
            {
                let mut validator = self.validator.lock().await;
                let _ = validator.validate_action(&main, true);
            }
            self.send_declaration(link, &main, false, main_metadata.as_ref())
                .await?;
        }

        Ok(())
    }

    // ---- Resolution side effects ----

    fn handle_resolution(&mut self, message: &Message) {
        let Some(resolved_agent) = message.payload_str("agent_id") else {
            return;
        };
        if resolved_agent != self.agent_id {
            return;
        }

        let original_action = message.payload.get("original_action").cloned().unwrap_or(json!({}));
        let outcome = message.payload.get("outcome").cloned().unwrap_or(json!({}));
        let success = outcome.get("success").and_then(Value::as_bool).unwrap_or(false);

        if original_action
            .get("has_offering")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            && self.sheet.consume_offering(None)
        {
            info!("[{}] consumed offering", self.sheet.name);
        }

        // Void and soulcredit are authoritative in the mechanics engine.
        if let Ok(mechanics) = self.mechanics.try_lock() {
            if let Some(void) = mechanics.void_states.get(&self.agent_id) {
                self.sheet.void_score = void.score;
            }
            if let Some(soulcredit) = mechanics.soulcredit_states.get(&self.agent_id) {
                self.sheet.soulcredit = soulcredit.score;
            }
        }

        let intent = original_action
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        if success && (intent.contains("purchase") || intent.contains("buy")) {
            self.process_purchase(&intent);
        }
        if success
            && (intent.contains("give") || intent.contains("transfer") || intent.contains("pool"))
        {
            self.process_transfer(&intent);
        }
    }

    fn process_purchase(&mut self, intent: &str) {
        let Some(item_name) = known_item_in(intent) else {
            return;
        };
        let Some((currency, amount)) = item_price(item_name) else {
            return;
        };
        if self.sheet.energy_inventory.spend_currency(currency, amount) {
            if let Some(slot) = inventory_key_for(item_name) {
                *self.sheet.inventory.entry(slot.to_string()).or_insert(0) += 1;
                info!(
                    "[{}] purchased {} (-{} {}), +1 {}",
                    self.sheet.name, item_name, amount, currency, slot
                );
            } else {
                info!("[{}] purchased {} (-{} {})", self.sheet.name, item_name, amount, currency);
            }
        } else {
            warn!(
                "[{}] cannot afford {} ({} {})",
                self.sheet.name, item_name, amount, currency
            );
        }
    }

    fn process_transfer(&mut self, intent: &str) {
        let Some(caps) = TRANSFER_AMOUNT_RE.captures(intent) else {
            return;
        };
        let amount: i32 = caps[1].parse().unwrap_or(0);
        let currency = caps[2].to_lowercase();
        let Some(recipient_caps) = TRANSFER_RECIPIENT_RE.captures(intent) else {
            return;
        };
        let recipient_name = recipient_caps[1].trim();

        let Some(recipient_id) = self.shared.agent_id_for_name(recipient_name) else {
            warn!("[{}] could not find {} to transfer to", self.sheet.name, recipient_name);
            return;
        };
        if recipient_id == self.agent_id {
            return;
        }

        if self.sheet.energy_inventory.spend_currency(&currency, amount) {
            self.shared.push_transfer(PendingTransfer {
                from: self.agent_id.clone(),
                to: recipient_id,
                currency: currency.clone(),
                amount,
                from_name: self.sheet.name.clone(),
                to_name: recipient_name.to_string(),
            });
            info!(
                "[{}] gave {} {} to {}",
                self.sheet.name, amount, currency, recipient_name
            );
        } else {
            warn!("[{}] insufficient {} to give", self.sheet.name, currency);
        }
    }

    fn apply_incoming_transfers(&mut self) {
        for transfer in self.shared.take_transfers_for(&self.agent_id) {
            self.sheet
                .energy_inventory
                .add_currency(&transfer.currency, transfer.amount);
            info!(
                "[{}] received {} {} from {}",
                self.sheet.name, transfer.amount, transfer.currency, transfer.from_name
            );
        }
    }

    // ---- Debrief ----

    async fn give_debrief(&self, link: &BusLink, payload: &Value) -> Result<(), Box<dyn Error + Send + Sync>> {
        let is_dying = !self.roster.is_alive(&self.agent_id);
        let wounds = self
            .roster
            .with(&self.agent_id, |c| c.wounds)
            .unwrap_or(0);
        let situation = self
            .current_scenario
            .as_ref()
            .and_then(|s| s.get("situation"))
            .and_then(Value::as_str)
            .unwrap_or("Mission completed");
        let conversation = payload
            .get("conversation_so_far")
            .and_then(Value::as_str)
            .unwrap_or("");

        let prompt = if is_dying {
            format!(
                "You are {} ({}) giving your FINAL WORDS before dying.\n\
                 You took {} fatal wounds and failed your death save.\n\
                 Mission context: {}\n\
                 Your goals (unfulfilled): {}\n{}\n\
                 Provide a brief (1-2 sentence) dying statement in character voice. Keep it \
                 impactful; you're dying.",
                self.sheet.name,
                self.sheet.faction,
                wounds,
                situation,
                self.sheet.goals.join("; "),
                conversation,
            )
        } else {
            format!(
                "You are {} ({}) in a post-mission debrief conversation.\n\
                 Mission context: {}\n\
                 Your goals: {}\n{}\n\
                 Provide a brief (2-3 sentence) debrief in character voice: what you \
                 accomplished, how you feel about your companions, your concerns going \
                 forward. This is dialogue, not a report.",
                self.sheet.name,
                self.sheet.faction,
                situation,
                self.sheet.goals.join("; "),
                conversation,
            )
        };

        let text = match self
            .llm
            .complete(LlmRequest::new(prompt).with_temperature(0.8).with_max_tokens(250))
            .await
        {
            Ok(response) => response.content,
            Err(e) => {
                warn!("[{}] debrief generation failed: {}", self.sheet.name, e);
                format!("{} has nothing further to add.", self.sheet.name)
            }
        };

        link.send(
            MessageType::PlayerResponse,
            None,
            json!({
                "kind": "debrief",
                "agent_id": self.agent_id,
                "character": self.sheet.name,
                "debrief": text,
                "is_dying": is_dying,
                "final_state": {
                    "name": self.sheet.name,
                    "faction": self.sheet.faction,
                    "void_score": self.sheet.void_score,
                    "soulcredit": self.sheet.soulcredit,
                    "goals": self.sheet.goals,
                },
            }),
        )
        .await
    }
}

fn two_word_mention(name_lower: &str, intent_lower: &str, description_lower: &str) -> bool {
    let parts: Vec<&str> = name_lower.split_whitespace().collect();
    if parts.len() < 2 {
        return false;
    }
    parts.windows(2).any(|pair| {
        let combo = format!("{} {}", pair[0], pair[1]);
        intent_lower.contains(&combo) || description_lower.contains(&combo)
    })
}

fn known_item_in(intent: &str) -> Option<&'static str> {
    const ITEMS: [&str; 18] = [
        "breathwater flask",
        "dripfruit chews",
        "med kit (basic)",
        "med kit (tactical)",
        "ration pack",
        "glowsticks",
        "comm unit",
        "sparksticks",
        "echo-calibrator",
        "scrambled id chip",
        "bond insurance policy",
        "data slate (encrypted)",
        "incense stick (single)",
        "incense stick",
        "purification incense (bundle)",
        "purification incense",
        "ritual altar access",
        "void scanner (basic)",
    ];
    ITEMS.iter().find(|item| intent.contains(*item)).copied()
}

#[async_trait]
impl AgentRuntime for PlayerAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn on_start(&mut self, link: &BusLink) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.shared
            .register_player(&self.agent_id, &self.sheet.name, &self.sheet.faction);
        self.roster.insert(
            &self.agent_id,
            CombatState::from_sheet(&self.sheet, &self.equipped, &self.carried),
        );
        if self.shared.free_targeting_enabled() {
            self.shared.with_combat_ids(|ids| {
                ids.register(&self.agent_id, &self.sheet.name, true);
            });
        }

        link.send(
            MessageType::AgentReady,
            None,
            json!({
                "agent_type": "player",
                "character": {
                    "name": self.sheet.name,
                    "faction": self.sheet.faction,
                },
            }),
        )
        .await?;
        info!("[{}] ready to play", self.sheet.name);
        Ok(())
    }

    async fn on_shutdown(&mut self) {
        debug!("player {} shutting down", self.agent_id);
    }

    async fn handle_message(
        &mut self,
        message: Message,
        link: &BusLink,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match message.message_type {
            MessageType::ScenarioSetup => {
                self.current_scenario = message.payload.get("scenario").cloned();
            }
            MessageType::ScenarioUpdate => {
                if let Some(scenario) = self.current_scenario.as_mut() {
                    if let (Value::Object(scenario), Value::Object(update)) =
                        (scenario, &message.payload)
                    {
                        if let Some(theme) = update.get("new_theme") {
                            scenario.insert("theme".into(), theme.clone());
                        }
                        if let Some(location) = update.get("new_location") {
                            scenario.insert("location".into(), location.clone());
                        }
                        if let Some(situation) = update.get("new_situation") {
                            scenario.insert("situation".into(), situation.clone());
                        }
                    }
                } else {
                    self.current_scenario = Some(message.payload.clone());
                }
            }
            MessageType::TurnRequest => {
                match message.payload_str("phase") {
                    Some("declaration") => {
                        if self.roster.is_alive(&self.agent_id) {
                            self.take_turn(link).await?;
                        }
                    }
                    Some("debrief") => {
                        self.give_debrief(link, &message.payload).await?;
                    }
                    _ => {}
                }
                // Round boundary resets the local free-action latch.
                if message.payload_bool("round_start").unwrap_or(false) {
                    self.free_action_used = false;
                }
            }
            MessageType::ActionResolved => {
                self.handle_resolution(&message);
            }
            MessageType::GameStateUpdate => {
                if message.payload_bool("round_reset").unwrap_or(false) {
                    self.free_action_used = false;
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
    use crate::voidtable::dice::DiceRoller;
    use crate::voidtable::llm::ScriptedLlmClient;

    fn sheet() -> CharacterSheet {
        let mut sheet = CharacterSheet {
            name: "Zara Nightwhisper".to_string(),
            pronouns: "she/her".to_string(),
            faction: "Tempest Industries".to_string(),
            attributes: [
                ("Size", 5),
                ("Endurance", 3),
                ("Agility", 4),
                ("Perception", 4),
                ("Willpower", 4),
                ("Empathy", 3),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
            skills: [("Astral Arts", 5), ("Awareness", 3), ("Charm", 2)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            void_score: 2,
            soulcredit: 5,
            goals: vec!["Explore void manipulation".to_string()],
            bonds: vec![],
            inventory: Default::default(),
            energy_inventory: Default::default(),
            personality: Default::default(),
        };
        sheet.initialize(&DiceRoller::seeded(8));
        sheet
    }

    fn player(llm: Arc<dyn LlmClient>) -> PlayerAgent {
        let shared = SharedState::new(false);
        let roster = CombatRoster::new();
        let mechanics = Arc::new(Mutex::new(MechanicsEngine::new(DiceRoller::seeded(3))));
        let validator = Arc::new(Mutex::new(ActionValidator::new()));
        let prompts = Arc::new(PromptLibrary::with_defaults());
        let sheet = sheet();
        let agent = PlayerAgent::new(
            "player_01",
            sheet,
            llm,
            "anthropic",
            shared.clone(),
            roster.clone(),
            mechanics,
            validator,
            prompts,
            WeaponLoadout::default(),
            vec![],
        );
        // Mirror on_start's registration for unit tests that never connect.
        shared.register_player("player_01", "Zara Nightwhisper", "Tempest Industries");
        roster.insert(
            "player_01",
            CombatState::from_sheet(&agent.sheet, &WeaponLoadout::default(), &[]),
        );
        agent
    }

    #[test]
    fn test_parse_structured_action() {
        let agent = player(Arc::new(ScriptedLlmClient::always("stub", "x")));
        let text = "INTENT: scan the relay for tampering\n\
                    ATTRIBUTE: Perception\n\
                    SKILL: investigation\n\
                    DIFFICULTY: 20 - hidden mechanisms\n\
                    ACTION_TYPE: investigate\n\
                    DESCRIPTION: She sweeps the relay housing with practiced eyes.";
        let declaration = agent.parse_action_from_llm(text).unwrap();
        assert_eq!(declaration.intent, "scan the relay for tampering");
        assert_eq!(declaration.attribute, Attribute::Perception);
        // Alias normalized to the canonical skill name.
        assert_eq!(declaration.skill.as_deref(), Some("Awareness"));
        assert_eq!(declaration.difficulty_estimate, 20);
        assert_eq!(declaration.action_type, ActionType::Investigate);
    }

    #[test]
    fn test_parse_ritual_extras() {
        let agent = player(Arc::new(ScriptedLlmClient::always("stub", "x")));
        let text = "INTENT: perform a ritual to seal the rift\n\
                    ATTRIBUTE: Willpower\nSKILL: Astral Arts\n\
                    DIFFICULTY: 22 - ritual under pressure\nACTION_TYPE: ritual\n\
                    DESCRIPTION: Chalk, breath, and will against the dark.\n\
                    PRIMARY_TOOL: yes\nOFFERING: no\nCOMPONENTS: chalk circle";
        let declaration = agent.parse_action_from_llm(text).unwrap();
        assert!(declaration.has_primary_tool);
        assert!(!declaration.has_offering);
        assert_eq!(declaration.ritual_components.as_deref(), Some("chalk circle"));
    }

    #[test]
    fn test_template_action_respects_personality() {
        let mut agent = player(Arc::new(ScriptedLlmClient::always("stub", "x")));
        agent.sheet.personality.void_curiosity = 9;
        let action = agent.template_action(false);
        assert!(action.intent.contains("void"));

        agent.sheet.personality.void_curiosity = 1;
        agent.sheet.personality.risk_tolerance = 9;
        let action = agent.template_action(false);
        assert!(action.intent.contains("dangerous"));
    }

    #[test]
    fn test_free_action_detection_and_bonus_grant() {
        let agent = player(Arc::new(ScriptedLlmClient::always("stub", "x")));
        agent.shared.register_player("player_02", "Kael Dren", "Pantheon");

        let mut declaration = ActionDeclaration::new(
            "tell Kael Dren what I found about the glyph",
            "Zara shares the etched pattern she copied.",
            Attribute::Empathy,
            Some("Charm".to_string()),
            ActionType::Social,
            "Zara Nightwhisper",
            "player_01",
        );
        let others = agent.shared.other_players("player_01");
        assert!(agent.detect_free_action(&declaration, &others));
        // The coordination keyword granted Kael a +2.
        let bonus = agent.shared.consume_coordination_bonus("player_02").unwrap();
        assert_eq!(bonus.bonus, 2);

        // Non-dialogue skills never count as free actions.
        declaration.skill = Some("Awareness".to_string());
        declaration.attribute = Attribute::Perception;
        assert!(!agent.detect_free_action(&declaration, &others));
    }

    #[test]
    fn test_purchase_deducts_and_pockets() {
        let mut agent = player(Arc::new(ScriptedLlmClient::always("stub", "x")));
        agent.sheet.energy_inventory.drip = 10;
        agent.process_purchase("buy med kit (basic) from the vendor");
        assert_eq!(agent.sheet.energy_inventory.drip, 5);
        assert_eq!(agent.sheet.inventory.get("med_kit"), Some(&1));

        // Unaffordable: nothing changes.
        agent.sheet.energy_inventory.spark = 0;
        agent.process_purchase("buy echo-calibrator");
        assert_eq!(agent.sheet.inventory.get("echo_calibrator"), None);
    }

    #[test]
    fn test_transfer_enqueues_for_recipient() {
        let mut agent = player(Arc::new(ScriptedLlmClient::always("stub", "x")));
        agent.shared.register_player("player_02", "Kael", "Pantheon");
        agent.sheet.energy_inventory.spark = 3;
        agent.process_transfer("give 2 spark to Kael");
        assert_eq!(agent.sheet.energy_inventory.spark, 1);

        let transfers = agent.shared.take_transfers_for("player_02");
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, 2);
        assert_eq!(transfers[0].currency, "spark");
    }

    #[test]
    fn test_incoming_transfers_credit_wallet() {
        let mut agent = player(Arc::new(ScriptedLlmClient::always("stub", "x")));
        let before = agent.sheet.energy_inventory.drip;
        agent.shared.push_transfer(PendingTransfer {
            from: "player_02".into(),
            to: "player_01".into(),
            currency: "drip".into(),
            amount: 4,
            from_name: "Kael".into(),
            to_name: "Zara".into(),
        });
        agent.apply_incoming_transfers();
        assert_eq!(agent.sheet.energy_inventory.drip, before + 4);
    }

    #[tokio::test]
    async fn test_generation_falls_back_on_unparseable_output() {
        let agent = player(Arc::new(ScriptedLlmClient::always(
            "stub",
            "I wave my hands dramatically.",
        )));
        let (declaration, _) = agent.generate_declaration(&[], &[], false, false).await;
        // Template fallback always yields a valid declaration.
        assert!(declaration.validate().is_empty());
    }
}

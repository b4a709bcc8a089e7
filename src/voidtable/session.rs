//! Session orchestrator.
//!
//! Owns the whole run: brings up the bus, spawns the Director and a selected
//! party of players, waits for readiness, then drives the round loop —
//! declaration (slowest → fastest), resolution (fastest → slowest),
//! synthesis, cleanup — until the Director declares an ending, the party
//! wipes, or the round limit is reached. Ends with in-character debriefs and
//! a persisted session record.
//!
//! Phase ordering is enforced with explicit notification barriers (one
//! signal per expected response), never sleep-based pacing; the only sleeps
//! are the deliberate settle pauses after broadcast fan-outs.

use crate::voidtable::action::ActionValidator;
use crate::voidtable::agent::{run_agent, AgentRole};
use crate::voidtable::bus::MessageBus;
use crate::voidtable::character::{CharacterSheet, CombatRoster};
use crate::voidtable::config::{CharacterConfig, SessionConfig};
use crate::voidtable::dice::DiceRoller;
use crate::voidtable::director::{DirectorAgent, DirectorConfig};
use crate::voidtable::enemy::{EnemyCombatManager, ResolutionState};
use crate::voidtable::event_log::{self, EventLog};
use crate::voidtable::knowledge::{EmptyKnowledge, KnowledgeStore};
use crate::voidtable::llm::{LlmClient, ScriptedLlmClient};
use crate::voidtable::markers::{self, SessionEndStatus};
use crate::voidtable::mechanics::{ClockSpec, MechanicsEngine};
use crate::voidtable::message::{Message, MessageType};
use crate::voidtable::player::PlayerAgent;
use crate::voidtable::prompts::PromptLibrary;
use crate::voidtable::shared::SharedState;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// Unrecoverable orchestration failures (setup, missing agents).
#[derive(Debug)]
pub enum SessionError {
    Setup(String),
    Bus(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Setup(msg) => write!(f, "session setup failed: {}", msg),
            SessionError::Bus(msg) => write!(f, "bus failure: {}", msg),
        }
    }
}

impl Error for SessionError {}

/// Per-round statistics for the round-summary event.
#[derive(Debug, Default, Clone)]
struct RoundStats {
    actions_attempted: u32,
    success_count: u32,
    total_margin: i64,
    damage_dealt_by_players: i64,
    damage_taken_by_players: i64,
    void_gained: i64,
    void_lost: i64,
}

/// Signal plumbing fed by the bus handlers. Handlers only buffer and notify;
/// all state mutation happens in the round loop.
struct SessionSignals {
    scenario_ready: Notify,
    scenario_payload: StdMutex<Option<Value>>,
    in_declaration_phase: AtomicBool,
    declared_actions: StdMutex<HashMap<String, Vec<Value>>>,
    declaration_waiters: StdMutex<HashMap<String, Arc<Notify>>>,
    resolution_waiters: StdMutex<HashMap<String, Arc<Notify>>>,
    resolution_data: StdMutex<HashMap<String, Value>>,
    synthesis_ready: Notify,
    synthesis_text: StdMutex<String>,
    ready_agents: StdMutex<Vec<String>>,
    ready_notify: Notify,
    debrief_ready: Notify,
    debrief_payload: StdMutex<Option<Value>>,
}

impl SessionSignals {
    fn new() -> Self {
        Self {
            scenario_ready: Notify::new(),
            scenario_payload: StdMutex::new(None),
            in_declaration_phase: AtomicBool::new(false),
            declared_actions: StdMutex::new(HashMap::new()),
            declaration_waiters: StdMutex::new(HashMap::new()),
            resolution_waiters: StdMutex::new(HashMap::new()),
            resolution_data: StdMutex::new(HashMap::new()),
            synthesis_ready: Notify::new(),
            synthesis_text: StdMutex::new(String::new()),
            ready_agents: StdMutex::new(Vec::new()),
            ready_notify: Notify::new(),
            debrief_ready: Notify::new(),
            debrief_payload: StdMutex::new(None),
        }
    }
}

/// Final report returned from a completed run.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub rounds_played: u32,
    pub end_status: String,
    pub event_log_path: std::path::PathBuf,
    pub record_path: std::path::PathBuf,
}

/// The orchestrator. Construct with a config, inject LLM clients (tests use
/// scripted ones), then [`run`](SessionOrchestrator::run).
pub struct SessionOrchestrator {
    config: SessionConfig,
    dm_llm: Arc<dyn LlmClient>,
    player_llms: HashMap<String, Arc<dyn LlmClient>>,
    default_player_llm: Arc<dyn LlmClient>,
    knowledge: Arc<dyn KnowledgeStore>,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig) -> Self {
        // Without injected clients everything falls back to template
        // behavior — deterministic, offline.
        let offline: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::new("offline", vec![]));
        Self {
            config,
            dm_llm: offline.clone(),
            player_llms: HashMap::new(),
            default_player_llm: offline,
            knowledge: Arc::new(EmptyKnowledge),
        }
    }

    pub fn with_dm_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.dm_llm = llm;
        self
    }

    /// Per-character LLM, keyed by character name.
    pub fn with_player_llm(mut self, character_name: &str, llm: Arc<dyn LlmClient>) -> Self {
        self.player_llms.insert(character_name.to_string(), llm);
        self
    }

    pub fn with_default_player_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.default_player_llm = llm;
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Select the party: a seeded random subset of the roster sized
    /// `party_size` (or the full roster when it's smaller).
    fn select_party(&self, dice: &DiceRoller) -> Vec<CharacterConfig> {
        let mut pool = self.config.agents.players.clone();
        let party_size = self.config.party_size.min(pool.len());
        if pool.len() <= party_size {
            return pool;
        }
        let mut selected = Vec::with_capacity(party_size);
        for _ in 0..party_size {
            let index = dice.pick_index(pool.len());
            selected.push(pool.remove(index));
        }
        selected
    }

    /// Run the complete session.
    pub async fn run(self) -> Result<SessionReport, Box<dyn Error + Send + Sync>> {
        let dice = match self.config.rng_seed {
            Some(seed) => DiceRoller::seeded(seed),
            None => DiceRoller::from_entropy(),
        };

        let session_id = Uuid::new_v4().to_string();
        let event_log = Arc::new(
            EventLog::create(
                &session_id,
                &self.config.output_dir,
                serde_json::to_value(&self.config).unwrap_or(json!({})),
            )
            .map_err(|e| SessionError::Setup(e.to_string()))?,
        );

        let shared = SharedState::new(self.config.enemy_agent_config.free_targeting_mode);
        let dm_notes_path = self.config.output_dir.join("dm_notes.json");
        shared.load_dm_notes(&dm_notes_path);

        let roster = CombatRoster::new();
        let mechanics = Arc::new(Mutex::new(MechanicsEngine::new(dice.clone())));
        let enemy_manager = Arc::new(Mutex::new(EnemyCombatManager::new(
            self.config.enemy_agents_enabled,
            shared.clone(),
            dice.clone(),
        )));
        let validator = Arc::new(Mutex::new(ActionValidator::new()));
        let prompts = Arc::new(PromptLibrary::with_defaults());
        let current_round = Arc::new(AtomicU32::new(0));
        let needs_story_advancement = Arc::new(AtomicBool::new(false));

        // Bus + signal plumbing.
        let bus = MessageBus::new(self.config.socket_path.clone());
        bus.start().await.map_err(|e| SessionError::Bus(e.to_string()))?;
        let signals = Arc::new(SessionSignals::new());
        install_handlers(&bus, &signals, &event_log, &current_round).await;

        // Party selection, then spawn agents.
        let party = self.select_party(&dice);
        if party.is_empty() {
            return Err(Box::new(SessionError::Setup("no players configured".into())));
        }
        info!(
            "selected party: {}",
            party.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
        );

        let director_config = DirectorConfig {
            force_scenario: self.config.force_scenario.clone(),
            force_combat: self.config.force_combat,
            force_vendor_gate: self.config.force_vendor_gate,
            enemy_agents_enabled: self.config.enemy_agents_enabled,
            party: party
                .iter()
                .map(|p| (p.name.clone(), p.faction.clone(), p.goals.clone()))
                .collect(),
        };

        let director = DirectorAgent::new(
            "dm_01",
            self.dm_llm.clone(),
            shared.clone(),
            roster.clone(),
            mechanics.clone(),
            enemy_manager.clone(),
            self.knowledge.clone(),
            event_log.clone(),
            director_config,
            needs_story_advancement.clone(),
            current_round.clone(),
            dice.clone(),
        );
        let (_dm_link, dm_handle) = run_agent(director, AgentRole::Dm, bus.socket_path()).await?;

        let mut handles = vec![dm_handle];
        let mut player_info: BTreeMap<String, (String, i32)> = BTreeMap::new();
        for (index, character) in party.iter().enumerate() {
            let agent_id = format!("player_{:02}", index + 1);
            let mut sheet = character_to_sheet(character);
            sheet.initialize(&dice);
            // Raw seeds age one cycle per session.
            sheet.energy_inventory.degrade_raw_seeds(1);
            let agility = sheet.attribute(crate::voidtable::mechanics::Attribute::Agility);
            player_info.insert(agent_id.clone(), (sheet.name.clone(), agility));

            // Seed the engine ledgers with the sheet's starting values.
            {
                let mut engine = mechanics.lock().await;
                engine.void_state(&agent_id).score = sheet.void_score.clamp(0, 10);
                engine.soulcredit_state(&agent_id, sheet.soulcredit);
            }

            let llm = self
                .player_llms
                .get(&character.name)
                .cloned()
                .unwrap_or_else(|| self.default_player_llm.clone());
            let provider = character
                .llm
                .as_ref()
                .map(|l| l.provider.clone())
                .unwrap_or_else(|| "anthropic".to_string());

            let player = PlayerAgent::new(
                &agent_id,
                sheet,
                llm,
                &provider,
                shared.clone(),
                roster.clone(),
                mechanics.clone(),
                validator.clone(),
                prompts.clone(),
                character.equipped_weapons.clone().unwrap_or_default(),
                character.carried_weapons.clone(),
            );
            let (_link, handle) = run_agent(player, AgentRole::Player, bus.socket_path()).await?;
            handles.push(handle);
        }

        // Wait for every agent to announce readiness.
        let expected_ready = 1 + player_info.len();
        wait_for_ready(&signals, expected_ready).await?;
        info!("all {} agents ready", expected_ready);

        // Kick off the session: the Director answers with ScenarioSetup.
        bus.route(&Message::new(
            MessageType::SessionStart,
            "coordinator",
            None,
            json!({"session_id": session_id, "config": {"session_name": self.config.session_name}}),
        ))
        .await;

        info!("waiting for scenario generation...");
        signals.scenario_ready.notified().await;
        let opening_narration = signals
            .scenario_payload
            .lock()
            .expect("scenario payload poisoned")
            .as_ref()
            .and_then(|p| p.get("opening_narration"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        // Opening narration may carry initial spawn markers.
        {
            let mut manager = enemy_manager.lock().await;
            for note in manager.process_narration(&opening_narration, 0, Some(&event_log)) {
                info!("{}", note);
            }
        }

        // Settle so every player has processed ScenarioSetup before the
        // first declarations go out.
        tokio::time::sleep(Duration::from_secs(2)).await;

        // ---- Round loop ----
        let mut round: u32 = 0;
        let mut end_status = String::from("round_limit");
        let mut had_active_clocks = false;
        let mut stats = RoundStats::default();

        loop {
            round += 1;
            current_round.store(round, Ordering::SeqCst);
            info!("--- Round {} ---", round);

            {
                let mut engine = mechanics.lock().await;
                engine.current_round = round;
                for state in engine.void_states.values_mut() {
                    state.reset_round_void();
                }
            }
            let _ = event_log.log_round_start(round);

            let alive_players: Vec<String> = player_info
                .keys()
                .filter(|id| roster.is_alive(id))
                .cloned()
                .collect();
            if alive_players.is_empty() {
                warn!("all players defeated - total party kill");
                end_status = "tpk".to_string();
                break;
            }

            // Initiative for players and enemies alike.
            let mut initiative_order: Vec<(i32, String, bool)> = Vec::new();
            {
                let engine = mechanics.lock().await;
                for agent_id in &alive_players {
                    let (name, agility) = &player_info[agent_id];
                    let initiative = engine.calculate_initiative(*agility);
                    debug!("[{}] initiative: {}", name, initiative);
                    initiative_order.push((initiative, agent_id.clone(), true));
                }
                let manager = enemy_manager.lock().await;
                for (initiative, enemy_id) in manager.initiative_entries(&engine) {
                    initiative_order.push((initiative, enemy_id, false));
                }
            }
            initiative_order.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

            // Phase 1: declarations, slowest → fastest.
            signals.in_declaration_phase.store(true, Ordering::SeqCst);
            signals
                .declared_actions
                .lock()
                .expect("declared actions poisoned")
                .clear();
            let _ = event_log.log_declaration_phase_start(round);

            for (initiative, actor_id, is_player) in initiative_order.iter().rev() {
                if *is_player {
                    if !roster.is_alive(actor_id) {
                        continue;
                    }
                    let waiter = Arc::new(Notify::new());
                    signals
                        .declaration_waiters
                        .lock()
                        .expect("declaration waiters poisoned")
                        .insert(actor_id.clone(), waiter.clone());

                    bus.route(&Message::new(
                        MessageType::TurnRequest,
                        "coordinator",
                        Some(actor_id.clone()),
                        json!({"phase": "declaration", "initiative": initiative}),
                    ))
                    .await;
                    waiter.notified().await;
                    signals
                        .declaration_waiters
                        .lock()
                        .expect("declaration waiters poisoned")
                        .remove(actor_id);
                } else {
                    let mut manager = enemy_manager.lock().await;
                    if let Some(declaration) = manager
                        .declare_enemy(actor_id, *initiative, &roster, &[], self.dm_llm.as_ref())
                        .await
                    {
                        let _ = event_log.log_action_declaration(
                            round,
                            &declaration.agent_id,
                            &declaration.character_name,
                            declaration.initiative,
                            json!({
                                "major_action": declaration.major_action,
                                "target": declaration.target,
                            }),
                        );
                    }
                }
            }
            // Brief settle so trailing free-action declarations land in the
            // buffer before the phase flag drops.
            tokio::time::sleep(Duration::from_millis(100)).await;
            signals.in_declaration_phase.store(false, Ordering::SeqCst);

            // Phase 2: resolution, fastest → slowest.
            let mut resolution_state = ResolutionState::new();
            let mut all_resolutions: Vec<Value> = Vec::new();
            let void_before = total_void(&mechanics).await;

            for (_initiative, actor_id, is_player) in &initiative_order {
                if *is_player {
                    if !roster.is_alive(actor_id) {
                        debug!("{} is down - skipping execution", actor_id);
                        continue;
                    }
                    let buffered = {
                        let declared = signals
                            .declared_actions
                            .lock()
                            .expect("declared actions poisoned");
                        declared.get(actor_id).cloned().unwrap_or_default()
                    };
                    for (index, action) in buffered.iter().enumerate() {
                        // Declared movement applies at execution time.
                        if let Some(target_position) =
                            action.get("target_position").and_then(Value::as_str)
                        {
                            roster.with(actor_id, |combat| {
                                if combat.position == target_position {
                                    warn!(
                                        "{} tried to move to current position {} - skipping",
                                        actor_id, target_position
                                    );
                                } else {
                                    info!(
                                        "[{}] position: {} → {}",
                                        actor_id, combat.position, target_position
                                    );
                                    combat.position = target_position.to_string();
                                    resolution_state
                                        .record_relocation(actor_id, target_position);
                                }
                            });
                        }

                        let key = format!("{}_{}", actor_id, index);
                        let waiter = Arc::new(Notify::new());
                        signals
                            .resolution_waiters
                            .lock()
                            .expect("resolution waiters poisoned")
                            .insert(key.clone(), waiter.clone());

                        let entry = json!({
                            "player_id": actor_id,
                            "character_name": player_info[actor_id].0,
                            "initiative": _initiative,
                            "action": action,
                        });
                        bus.route(&Message::new(
                            MessageType::ActionDeclared,
                            "coordinator",
                            Some("dm_01".to_string()),
                            json!({
                                "phase": "resolution_only",
                                "actions": [entry],
                                "round": round,
                                "action_index": index,
                            }),
                        ))
                        .await;
                        waiter.notified().await;

                        let data = signals
                            .resolution_data
                            .lock()
                            .expect("resolution data poisoned")
                            .remove(&key);
                        signals
                            .resolution_waiters
                            .lock()
                            .expect("resolution waiters poisoned")
                            .remove(&key);
                        if let Some(data) = data {
                            stats.actions_attempted += 1;
                            if let Some(resolution) = data
                                .get("resolution")
                                .and_then(|o| o.get("resolution"))
                            {
                                if resolution
                                    .get("success")
                                    .and_then(Value::as_bool)
                                    .unwrap_or(false)
                                {
                                    stats.success_count += 1;
                                }
                                stats.total_margin += resolution
                                    .get("margin")
                                    .and_then(Value::as_i64)
                                    .unwrap_or(0);
                            }
                            all_resolutions.push(data);
                        }
                    }
                } else {
                    let mut engine = mechanics.lock().await;
                    let mut manager = enemy_manager.lock().await;
                    if let Some(result) = manager.execute_enemy_action(
                        actor_id,
                        &mut engine,
                        &roster,
                        &mut resolution_state,
                    ) {
                        if let Some(reason) = &result.invalidated {
                            info!("⚠️ [{}] {} ({})", result.character_name, result.narration, reason);
                        } else {
                            info!("[{}] {}", result.character_name, result.narration);
                        }
                        if let Some((_, damage, _)) = result.damage_to {
                            stats.damage_taken_by_players += damage as i64;
                        }
                        let _ = event_log.append(
                            "enemy_action",
                            Some(round),
                            json!({
                                "enemy": result.character_name,
                                "narration": result.narration,
                                "invalidated": result.invalidated,
                            }),
                        );
                    }
                }
            }

            // Phase 3: synthesis.
            if !all_resolutions.is_empty() {
                bus.route(&Message::new(
                    MessageType::ActionDeclared,
                    "coordinator",
                    Some("dm_01".to_string()),
                    json!({
                        "phase": "synthesis",
                        "resolutions": all_resolutions,
                        "round": round,
                    }),
                ))
                .await;
                signals.synthesis_ready.notified().await;

                let synthesis = signals
                    .synthesis_text
                    .lock()
                    .expect("synthesis text poisoned")
                    .clone();
                apply_synthesis_markers(
                    &synthesis,
                    round,
                    &bus,
                    &mechanics,
                    &enemy_manager,
                    &event_log,
                    &mut end_status,
                )
                .await;
            }

            // Phase 4: cleanup.
            {
                let mut engine = mechanics.lock().await;
                let mut manager = enemy_manager.lock().await;
                for event in manager.cleanup_round(&mut engine, round, Some(&event_log)) {
                    info!("[CLEANUP] {}", event.narration);
                }
            }
            roster.tick_all_buffs();

            // Character snapshots + aggregate summary.
            let void_after = total_void(&mechanics).await;
            if void_after > void_before {
                stats.void_gained += (void_after - void_before) as i64;
            } else {
                stats.void_lost += (void_before - void_after) as i64;
            }
            log_character_snapshots(&player_info, &roster, &mechanics, &event_log, round).await;

            let (clocks_advanced, clocks_filled, active_unfilled) = {
                let engine = mechanics.lock().await;
                let advanced = engine.scene_clocks.values().filter(|c| c.current > 0).count();
                let filled = engine.scene_clocks.values().filter(|c| c.filled()).count();
                let unfilled = engine.scene_clocks.values().filter(|c| !c.filled()).count();
                if !engine.scene_clocks.is_empty() {
                    had_active_clocks = true;
                }
                (advanced, filled, unfilled)
            };

            let active_enemies = enemy_manager.lock().await.active_count();
            let success_rate = if stats.actions_attempted > 0 {
                stats.success_count as f64 / stats.actions_attempted as f64
            } else {
                0.0
            };
            let avg_margin = if stats.actions_attempted > 0 {
                stats.total_margin as f64 / stats.actions_attempted as f64
            } else {
                0.0
            };
            let _ = event_log.log_round_summary(
                round,
                json!({
                    "actions_attempted": stats.actions_attempted,
                    "success_count": stats.success_count,
                    "success_rate": success_rate,
                    "average_margin": avg_margin,
                    "damage_dealt_by_players": stats.damage_dealt_by_players,
                    "damage_taken_by_players": stats.damage_taken_by_players,
                    "void_gained": stats.void_gained,
                    "void_lost": stats.void_lost,
                    "clocks_advanced": clocks_advanced,
                    "clocks_filled": clocks_filled,
                    "active_enemies": active_enemies,
                }),
            );
            stats = RoundStats::default();

            // Free-action slots reset each round, on both sides of the bus.
            roster.reset_free_actions();
            bus.route(&Message::new(
                MessageType::GameStateUpdate,
                "coordinator",
                None,
                json!({"round_reset": true, "round": round}),
            ))
            .await;

            // All clocks done ⇒ the next synthesis must advance the story.
            if had_active_clocks && active_unfilled == 0 {
                info!("all clocks complete - story advancement required");
                needs_story_advancement.store(true, Ordering::SeqCst);
                had_active_clocks = false;
            }

            // Vendor cadence.
            maybe_spawn_vendor(&self.config, round, &dice, &bus).await;

            // End conditions.
            if end_status == "victory" || end_status == "defeat" || end_status == "draw" {
                info!("Director declared session end: {}", end_status);
                break;
            }
            if round >= self.config.max_turns {
                info!("round limit reached ({})", self.config.max_turns);
                break;
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        // ---- Debrief ----
        run_debriefs(&player_info, &roster, &bus, &signals, &event_log).await;

        // ---- Persist & shut down ----
        let final_state = {
            let engine = mechanics.lock().await;
            let mut state = engine.state_summary();
            state["session_end_status"] = json!(end_status);
            state
        };
        let _ = event_log.log_session_end(final_state.clone());

        let events = event_log::load_events(event_log.log_path()).unwrap_or_default();
        let rounds_structured = event_log::restructure_into_rounds(&events);
        let record = json!({
            "session_id": session_id,
            "config": serde_json::to_value(&self.config).unwrap_or(json!({})),
            "rounds": rounds_structured,
            "raw_events": events,
            "end_status": end_status,
            "shared_state": shared.snapshot(),
            "final_state": final_state,
        });
        let record_path = self.config.output_dir.join(format!("session_{}.json", session_id));
        if let Ok(raw) = serde_json::to_string_pretty(&record) {
            if let Err(e) = std::fs::write(&record_path, raw) {
                error!("failed to write session record: {}", e);
            }
        }
        let yaml_path = self.config.output_dir.join(format!("session_{}.yaml", session_id));
        if let Ok(raw) = serde_yaml::to_string(&record) {
            let _ = std::fs::write(&yaml_path, raw);
        }
        shared.save_dm_notes(&dm_notes_path);
        info!("session data saved to {}", record_path.display());

        // Cooperative shutdown, then force-close stragglers.
        bus.route(&Message::new(MessageType::Shutdown, "coordinator", None, json!({})))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        for handle in &handles {
            handle.abort();
        }
        bus.shutdown().await;

        Ok(SessionReport {
            session_id,
            rounds_played: round,
            end_status,
            event_log_path: event_log.log_path().to_path_buf(),
            record_path,
        })
    }
}

fn character_to_sheet(config: &CharacterConfig) -> CharacterSheet {
    CharacterSheet {
        name: config.name.clone(),
        pronouns: config
            .pronouns
            .clone()
            .unwrap_or_else(|| "they/them".to_string()),
        faction: config.faction.clone(),
        attributes: config.attributes.clone(),
        skills: config.skills.clone(),
        void_score: config.void_score,
        soulcredit: config.soulcredit,
        goals: config.goals.clone(),
        bonds: config.bonds.clone(),
        inventory: config.inventory.clone().unwrap_or_default(),
        energy_inventory: Default::default(),
        personality: config.personality.clone(),
    }
}

async fn install_handlers(
    bus: &MessageBus,
    signals: &Arc<SessionSignals>,
    event_log: &Arc<EventLog>,
    current_round: &Arc<AtomicU32>,
) {
    // Declarations: buffered during the declaration phase only.
    {
        let signals = signals.clone();
        let event_log = event_log.clone();
        let current_round = current_round.clone();
        bus.add_handler(
            "session_declaration_buffer",
            Box::new(move |message: &Message| {
                if message.message_type != MessageType::ActionDeclared {
                    return;
                }
                if !signals.in_declaration_phase.load(Ordering::SeqCst) {
                    return;
                }
                // Coordinator-routed phase messages are not declarations.
                if message.payload.get("phase").is_some() {
                    return;
                }
                let agent_id = message.sender.clone();
                signals
                    .declared_actions
                    .lock()
                    .expect("declared actions poisoned")
                    .entry(agent_id.clone())
                    .or_default()
                    .push(message.payload.clone());

                let round = current_round.load(Ordering::SeqCst);
                let character = message
                    .payload
                    .get("character")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown");
                let _ = event_log.log_action_declaration(
                    round,
                    &agent_id,
                    character,
                    message
                        .payload
                        .get("initiative")
                        .and_then(Value::as_i64)
                        .unwrap_or(0) as i32,
                    message.payload.clone(),
                );

                let waiters = signals
                    .declaration_waiters
                    .lock()
                    .expect("declaration waiters poisoned");
                if let Some(waiter) = waiters.get(&agent_id) {
                    waiter.notify_one();
                } else {
                    debug!("no pending declaration waiter for {}", agent_id);
                }
            }),
        )
        .await;
    }

    // Resolutions: keyed by (agent, action_index).
    {
        let signals = signals.clone();
        bus.add_handler(
            "session_resolution_tracker",
            Box::new(move |message: &Message| {
                if message.message_type != MessageType::ActionResolved {
                    return;
                }
                let Some(agent_id) = message.payload.get("agent_id").and_then(Value::as_str) else {
                    return;
                };
                let index = message
                    .payload
                    .get("action_index")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let key = format!("{}_{}", agent_id, index);
                if let Some(data) = message.payload.get("resolution_data") {
                    signals
                        .resolution_data
                        .lock()
                        .expect("resolution data poisoned")
                        .insert(key.clone(), data.clone());
                }
                let waiters = signals
                    .resolution_waiters
                    .lock()
                    .expect("resolution waiters poisoned");
                if let Some(waiter) = waiters.get(&key) {
                    waiter.notify_one();
                }
            }),
        )
        .await;
    }

    // Scenario setup barrier.
    {
        let signals = signals.clone();
        bus.add_handler(
            "session_scenario_tracker",
            Box::new(move |message: &Message| {
                if message.message_type != MessageType::ScenarioSetup {
                    return;
                }
                *signals
                    .scenario_payload
                    .lock()
                    .expect("scenario payload poisoned") = Some(message.payload.clone());
                signals.scenario_ready.notify_one();
            }),
        )
        .await;
    }

    // Synthesis barrier + last-narration capture.
    {
        let signals = signals.clone();
        bus.add_handler(
            "session_dm_narration_tracker",
            Box::new(move |message: &Message| {
                if message.message_type != MessageType::DmNarration {
                    return;
                }
                if message
                    .payload
                    .get("is_round_synthesis")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    *signals
                        .synthesis_text
                        .lock()
                        .expect("synthesis text poisoned") = message
                        .payload
                        .get("narration")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    signals.synthesis_ready.notify_one();
                }
            }),
        )
        .await;
    }

    // Readiness counter.
    {
        let signals = signals.clone();
        bus.add_handler(
            "session_ready_tracker",
            Box::new(move |message: &Message| {
                if message.message_type != MessageType::AgentReady {
                    return;
                }
                let mut ready = signals.ready_agents.lock().expect("ready agents poisoned");
                if !ready.contains(&message.sender) {
                    ready.push(message.sender.clone());
                }
                signals.ready_notify.notify_one();
            }),
        )
        .await;
    }

    // Debrief responses.
    {
        let signals = signals.clone();
        bus.add_handler(
            "session_debrief_tracker",
            Box::new(move |message: &Message| {
                if message.message_type != MessageType::PlayerResponse {
                    return;
                }
                if message.payload.get("kind").and_then(Value::as_str) != Some("debrief") {
                    return;
                }
                *signals
                    .debrief_payload
                    .lock()
                    .expect("debrief payload poisoned") = Some(message.payload.clone());
                signals.debrief_ready.notify_one();
            }),
        )
        .await;
    }
}

async fn wait_for_ready(
    signals: &Arc<SessionSignals>,
    expected: usize,
) -> Result<(), SessionError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        {
            let ready = signals.ready_agents.lock().expect("ready agents poisoned");
            if ready.len() >= expected {
                return Ok(());
            }
        }
        tokio::select! {
            _ = signals.ready_notify.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Err(SessionError::Setup(format!(
                    "agents failed to become ready ({} expected)", expected
                )));
            }
        }
    }
}

async fn total_void(mechanics: &Arc<Mutex<MechanicsEngine>>) -> i32 {
    let engine = mechanics.lock().await;
    engine.void_states.values().map(|v| v.score).sum()
}

/// Apply the control markers found in a round synthesis.
async fn apply_synthesis_markers(
    synthesis: &str,
    round: u32,
    bus: &MessageBus,
    mechanics: &Arc<Mutex<MechanicsEngine>>,
    enemy_manager: &Arc<Mutex<EnemyCombatManager>>,
    event_log: &Arc<EventLog>,
    end_status: &mut String,
) {
    // Session end.
    if let Some(end) = markers::parse_session_end(synthesis) {
        *end_status = match end.status {
            SessionEndStatus::Victory => "victory",
            SessionEndStatus::Defeat => "defeat",
            SessionEndStatus::Draw => "draw",
        }
        .to_string();
    }

    // Story advancement clears the clock board and resets scene void — a
    // scene boundary — before any new clocks are spawned.
    if let Some(advance) = markers::parse_advance_story(synthesis) {
        info!(
            "story advances: {} - {}",
            advance.location, advance.situation
        );
        {
            let mut engine = mechanics.lock().await;
            let archived = engine.clear_all_clocks();
            if !archived.is_empty() {
                info!("cleared clocks for story advancement: {}", archived.join(", "));
            }
            for state in engine.void_states.values_mut() {
                state.reset_scene_void();
            }
        }
        bus.route(&Message::new(
            MessageType::ScenarioUpdate,
            "coordinator",
            None,
            json!({
                "new_location": advance.location,
                "new_situation": advance.situation,
                "story_advanced": true,
            }),
        ))
        .await;
        let _ = event_log.append(
            "story_advancement",
            Some(round),
            json!({"location": advance.location, "situation": advance.situation}),
        );
    }

    // New clocks spawn after any board clearing.
    let new_clocks = markers::parse_new_clocks(synthesis);
    if !new_clocks.is_empty() {
        let mut engine = mechanics.lock().await;
        for clock in new_clocks {
            engine.create_scene_clock(ClockSpec {
                name: clock.name.clone(),
                maximum: clock.max,
                description: clock.description.clone(),
                ..Default::default()
            });
            info!("new clock spawned: {} (0/{})", clock.name, clock.max);
            let _ = event_log.log_clock_spawn(&clock.name, clock.max, &clock.description);
        }
    }

    // Scenario pivot archives every filled clock.
    if let Some(theme) = markers::parse_pivot_scenario(synthesis) {
        info!("scenario pivots: {}", theme);
        {
            let mut engine = mechanics.lock().await;
            let filled: Vec<String> = engine
                .scene_clocks
                .iter()
                .filter(|(_, clock)| clock.filled())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &filled {
                engine.scene_clocks.remove(name);
                info!("archived filled clock after pivot: {}", name);
            }
        }
        bus.route(&Message::new(
            MessageType::ScenarioUpdate,
            "coordinator",
            None,
            json!({
                "new_theme": theme,
                "new_situation": format!("The situation has changed. New objective: {}", theme),
            }),
        ))
        .await;
    }

    // Enemy lifecycle markers in the synthesis.
    {
        let mut manager = enemy_manager.lock().await;
        for note in manager.process_narration(synthesis, round, Some(event_log)) {
            info!("{}", note);
        }
    }
}

async fn log_character_snapshots(
    player_info: &BTreeMap<String, (String, i32)>,
    roster: &CombatRoster,
    mechanics: &Arc<Mutex<MechanicsEngine>>,
    event_log: &Arc<EventLog>,
    round: u32,
) {
    let engine = mechanics.lock().await;
    for (agent_id, (name, _)) in player_info {
        let snapshot = roster.with(agent_id, |combat| {
            (
                combat.health,
                combat.max_health,
                combat.wounds,
                combat.position.clone(),
                combat.is_alive(),
            )
        });
        let Some((health, max_health, wounds, position, alive)) = snapshot else {
            continue;
        };
        let void_score = engine.void_states.get(agent_id).map(|v| v.score).unwrap_or(0);
        let soulcredit = engine
            .soulcredit_states
            .get(agent_id)
            .map(|s| s.score)
            .unwrap_or(0);
        let conditions: Vec<String> = engine
            .conditions_for(agent_id)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let _ = event_log.log_character_state(
            round,
            agent_id,
            name,
            health,
            max_health,
            wounds,
            void_score,
            soulcredit,
            &position,
            conditions,
            !alive,
        );
    }
}

async fn maybe_spawn_vendor(
    config: &SessionConfig,
    round: u32,
    dice: &DiceRoller,
    bus: &MessageBus,
) {
    if config.vendor_spawn_frequency <= 0 {
        return;
    }
    if round % config.vendor_spawn_frequency as u32 != 0 {
        return;
    }
    let vendors = crate::voidtable::economy::create_standard_vendors();
    let vendor = &vendors[dice.pick_index(vendors.len())];
    info!("round {}: vendor {} arrives", round, vendor.name);
    bus.route(&Message::new(
        MessageType::DmNarration,
        "coordinator",
        None,
        json!({
            "narration": format!(
                "💰 **{} arrives!** A {} {} approaches. \"{}\" They have goods for sale or barter.\n{}",
                vendor.name, vendor.faction, vendor.kind, vendor.greeting, vendor.inventory_display()
            ),
        }),
    ))
    .await;
}

async fn run_debriefs(
    player_info: &BTreeMap<String, (String, i32)>,
    roster: &CombatRoster,
    bus: &MessageBus,
    signals: &Arc<SessionSignals>,
    event_log: &Arc<EventLog>,
) {
    info!("=== Mission Debrief ===");
    let mut conversation = String::new();
    for (agent_id, (name, _)) in player_info {
        // The dead still get dying words; only never-spawned agents are
        // skipped.
        if roster.with(agent_id, |_| ()).is_none() {
            continue;
        }
        *signals
            .debrief_payload
            .lock()
            .expect("debrief payload poisoned") = None;
        bus.route(&Message::new(
            MessageType::TurnRequest,
            "coordinator",
            Some(agent_id.clone()),
            json!({"phase": "debrief", "conversation_so_far": conversation}),
        ))
        .await;

        // A player that cannot answer (crashed task) shouldn't hang the
        // shutdown path.
        let waited = tokio::time::timeout(Duration::from_secs(30), signals.debrief_ready.notified()).await;
        if waited.is_err() {
            warn!("debrief timed out for {}", name);
            continue;
        }
        let payload = signals
            .debrief_payload
            .lock()
            .expect("debrief payload poisoned")
            .take();
        if let Some(payload) = payload {
            let text = payload
                .get("debrief")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            info!("[{}] {}", name, text);
            conversation.push_str(&format!("\n**What others have said:**\n{}: \"{}\"\n", name, text));
            let _ = event_log.log_debrief(
                name,
                &text,
                payload.get("final_state").cloned().unwrap_or(json!({})),
            );
        }
    }
}

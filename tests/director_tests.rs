//! Director adjudication and synthesis over a live bus.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};
use voidtable::voidtable::agent::{run_agent, AgentRole};
use voidtable::voidtable::bus::MessageBus;
use voidtable::voidtable::character::{CharacterSheet, CombatRoster, CombatState, WeaponLoadout};
use voidtable::voidtable::dice::DiceRoller;
use voidtable::voidtable::director::{DirectorAgent, DirectorConfig};
use voidtable::voidtable::enemy::EnemyCombatManager;
use voidtable::voidtable::event_log::{self, EventLog};
use voidtable::voidtable::knowledge::EmptyKnowledge;
use voidtable::voidtable::llm::ScriptedLlmClient;
use voidtable::voidtable::mechanics::MechanicsEngine;
use voidtable::voidtable::message::{Message, MessageType};
use voidtable::voidtable::shared::SharedState;

fn sheet(name: &str) -> CharacterSheet {
    CharacterSheet {
        name: name.to_string(),
        pronouns: "they/them".to_string(),
        faction: "Freeborn".to_string(),
        attributes: [("Size", 5), ("Endurance", 3), ("Agility", 3), ("Perception", 4)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        skills: [("Awareness", 3)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        void_score: 0,
        soulcredit: 4,
        goals: vec![],
        bonds: vec![],
        inventory: Default::default(),
        energy_inventory: Default::default(),
        personality: Default::default(),
    }
}

struct Harness {
    bus: MessageBus,
    shared: SharedState,
    roster: CombatRoster,
    event_log_path: std::path::PathBuf,
    resolved: Arc<StdMutex<Vec<Value>>>,
    resolved_notify: Arc<Notify>,
    narration: Arc<StdMutex<Option<Value>>>,
    narration_notify: Arc<Notify>,
    _dir: tempfile::TempDir,
}

async fn harness(dm_script: Vec<String>, enemy_enabled: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let dice = DiceRoller::seeded(99);
    let shared = SharedState::new(true);
    let roster = CombatRoster::new();
    let mechanics = Arc::new(Mutex::new(MechanicsEngine::new(dice.clone())));
    let enemy_manager = Arc::new(Mutex::new(EnemyCombatManager::new(
        enemy_enabled,
        shared.clone(),
        dice.clone(),
    )));
    let event_log = Arc::new(EventLog::create("director_test", dir.path(), json!({})).unwrap());
    let event_log_path = event_log.log_path().to_path_buf();

    // Two PCs on the field with combat ids tgt_0001 / tgt_0002.
    for (agent_id, name) in [("player_01", "Zara"), ("player_02", "Mira")] {
        shared.register_player(agent_id, name, "Freeborn");
        shared.with_combat_ids(|ids| {
            ids.register(agent_id, name, true);
        });
        roster.insert(
            agent_id,
            CombatState::from_sheet(&sheet(name), &WeaponLoadout::default(), &[]),
        );
    }

    let bus = MessageBus::new(None);
    bus.start().await.unwrap();

    let resolved = Arc::new(StdMutex::new(Vec::new()));
    let resolved_notify = Arc::new(Notify::new());
    {
        let resolved = resolved.clone();
        let notify = resolved_notify.clone();
        bus.add_handler(
            "capture_resolved",
            Box::new(move |message: &Message| {
                if message.message_type == MessageType::ActionResolved {
                    resolved.lock().unwrap().push(message.payload.clone());
                    notify.notify_one();
                }
            }),
        )
        .await;
    }
    let narration = Arc::new(StdMutex::new(None));
    let narration_notify = Arc::new(Notify::new());
    {
        let narration = narration.clone();
        let notify = narration_notify.clone();
        bus.add_handler(
            "capture_narration",
            Box::new(move |message: &Message| {
                if message.message_type == MessageType::DmNarration {
                    *narration.lock().unwrap() = Some(message.payload.clone());
                    notify.notify_one();
                }
            }),
        )
        .await;
    }

    let director = DirectorAgent::new(
        "dm_01",
        Arc::new(ScriptedLlmClient::new("dm", dm_script)),
        shared.clone(),
        roster.clone(),
        mechanics,
        enemy_manager,
        Arc::new(EmptyKnowledge),
        event_log,
        DirectorConfig {
            enemy_agents_enabled: enemy_enabled,
            ..Default::default()
        },
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicU32::new(1)),
        dice,
    );
    run_agent(director, AgentRole::Dm, bus.socket_path())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    Harness {
        bus,
        shared,
        roster,
        event_log_path,
        resolved,
        resolved_notify,
        narration,
        narration_notify,
        _dir: dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_friendly_fire_damages_the_ally_agent() {
    let narration_script =
        "She wheels and fires before recognizing the silhouette in the smoke.\n\
         EFFECT: type=damage, target=tgt_0002, final=6"
            .to_string();
    let harness = harness(vec![narration_script], false).await;

    let mira_before = harness.roster.with("player_02", |c| c.health).unwrap();
    let mira_target = harness
        .shared
        .with_combat_ids(|ids| ids.target_id_for("player_02"))
        .unwrap();
    assert_eq!(mira_target, "tgt_0002");

    let action = json!({
        "intent": "fire at the moving shape",
        "description": "A snapshot at movement in the smoke.",
        "attribute": "Perception",
        "skill": "Awareness",
        "attribute_value": 4,
        "skill_value": 3,
        "action_type": "combat",
        "target_enemy": mira_target,
        "character": "Zara",
        "agent_id": "player_01",
    });
    harness
        .bus
        .route(&Message::new(
            MessageType::ActionDeclared,
            "coordinator",
            Some("dm_01".to_string()),
            json!({
                "phase": "resolution_only",
                "actions": [{
                    "player_id": "player_01",
                    "character_name": "Zara",
                    "initiative": 20,
                    "action": action,
                }],
                "round": 1,
                "action_index": 0,
            }),
        ))
        .await;
    harness.resolved_notify.notified().await;

    let resolved = harness.resolved.lock().unwrap();
    let payload = resolved.last().unwrap();
    let narration = payload["narration"].as_str().unwrap();
    assert!(narration.contains("Friendly fire"));

    // The damage landed on the ally agent's pool, not a character sheet.
    let mira_after = harness.roster.with("player_02", |c| c.health).unwrap();
    assert_eq!(mira_after, mira_before - 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_spawn_marker_triggers_compliance_retry() {
    // First synthesis emits a 3-field spawn marker; the retry at low
    // temperature supplies the complete 5-field form.
    let bad_synthesis =
        "The alarm fill brings boots on the deck. [SPAWN_ENEMY: Security Team | grunt | 2]"
            .to_string();
    let corrected = "[SPAWN_ENEMY: Security Team | grunt | 2 | Far-Enemy | tactical_ranged]".to_string();
    let harness = harness(vec![bad_synthesis, corrected], true).await;

    harness
        .bus
        .route(&Message::new(
            MessageType::ActionDeclared,
            "coordinator",
            Some("dm_01".to_string()),
            json!({
                "phase": "synthesis",
                "resolutions": [{
                    "player_id": "player_01",
                    "character_name": "Zara",
                    "initiative": 20,
                    "action": {"intent": "hold the line"},
                    "resolution": {"success": true},
                }],
                "round": 1,
            }),
        ))
        .await;
    harness.narration_notify.notified().await;

    let payload = harness.narration.lock().unwrap().clone().unwrap();
    assert_eq!(payload["is_round_synthesis"], true);
    let narration = payload["narration"].as_str().unwrap().to_string();

    // The corrected marker was appended and now parses as complete; the
    // original invalid instance is still present for audit.
    let spawns = voidtable::voidtable::markers::parse_spawn_enemies(&narration);
    assert_eq!(spawns.len(), 1);
    assert_eq!(spawns[0].count, 2);
    assert_eq!(
        voidtable::voidtable::markers::extract_invalid_spawn_markers(&narration).len(),
        1
    );

    // Audit trail: both the retry request and its result are in the log.
    let events = event_log::load_events(&harness.event_log_path).unwrap();
    let retry_events: Vec<&str> = events
        .iter()
        .filter_map(|e| e.get("event_type").and_then(Value::as_str))
        .filter(|t| t.starts_with("marker_retry"))
        .collect();
    assert!(retry_events.contains(&"marker_retry"));
    assert!(retry_events.contains(&"marker_retry_result"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adjudication_narration_carries_roll_math() {
    let harness = harness(vec!["The sweep turns up scuffed plating.".to_string()], false).await;

    harness
        .bus
        .route(&Message::new(
            MessageType::ActionDeclared,
            "coordinator",
            Some("dm_01".to_string()),
            json!({
                "phase": "resolution_only",
                "actions": [{
                    "player_id": "player_01",
                    "character_name": "Zara",
                    "initiative": 15,
                    "action": {
                        "intent": "sweep the deck plating",
                        "description": "A low crawl along the seam line.",
                        "attribute": "Perception",
                        "skill": "Awareness",
                        "attribute_value": 4,
                        "skill_value": 3,
                        "action_type": "investigate",
                        "character": "Zara",
                        "agent_id": "player_01",
                    },
                }],
                "round": 1,
                "action_index": 0,
            }),
        ))
        .await;
    harness.resolved_notify.notified().await;

    let resolved = harness.resolved.lock().unwrap();
    let payload = resolved.last().unwrap();
    let narration = payload["narration"].as_str().unwrap();
    // The transparency block leads the narration.
    assert!(narration.contains("Perception × Awareness"));
    assert!(narration.contains("DC:"));
    assert!(narration.contains("scuffed plating"));

    let resolution = &payload["outcome"]["resolution"];
    assert_eq!(resolution["attribute"], "Perception");
    let total = resolution["total"].as_i64().unwrap();
    let roll = resolution["roll"].as_i64().unwrap();
    assert_eq!(total, 4 * 3 + roll);
}

//! Replay determinism: same seed + same transcript ⇒ identical event logs
//! after volatile-field normalization.

use serde_json::Value;
use std::sync::Arc;
use voidtable::voidtable::config::{AgentsConfig, CharacterConfig, SessionConfig};
use voidtable::voidtable::event_log;
use voidtable::voidtable::llm::ScriptedLlmClient;
use voidtable::voidtable::session::SessionOrchestrator;

const SCENARIO_TEXT: &str = "THEME: Cold Ledger\n\
LOCATION: Nimbus Relay Deck\n\
SITUATION: A frozen audit trail points at someone on this deck.\n\
VOID_LEVEL: 2\n\
CLOCK1: Audit Trail | 6 | Following the money | ADVANCE=Trail warms | REGRESS=Trail cools | FILLED=Culprit named [ADVANCE_STORY: Relay Core | The culprit runs for the core]\n\
CLOCK2: Deck Suspicion | 6 | The crew notices the questions | ADVANCE=Suspicion grows | REGRESS=Cover holds | FILLED=Lockdown [NEW_CLOCK: Lockdown | 4 | Exits sealing]";

const NARRATION_TEXT: &str = "The deck hums on, indifferent; the work continues.";

const PLAYER_ACTION: &str = "INTENT: examine the relay ledger terminals\n\
ATTRIBUTE: Perception\n\
SKILL: Awareness\n\
DIFFICULTY: 20 - encrypted records\n\
ACTION_TYPE: investigate\n\
DESCRIPTION: Working terminal to terminal, matching stamps against the audit trail.";

fn config(output_dir: std::path::PathBuf) -> SessionConfig {
    let character = |name: &str, faction: &str| CharacterConfig {
        name: name.to_string(),
        pronouns: None,
        faction: faction.to_string(),
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
        goals: vec!["close the audit".to_string()],
        bonds: vec![],
        inventory: None,
        equipped_weapons: None,
        carried_weapons: vec![],
        personality: Default::default(),
        llm: None,
    };

    SessionConfig {
        session_name: "replay_test".to_string(),
        max_turns: 2,
        output_dir,
        party_size: 2,
        rng_seed: Some(777),
        agents: AgentsConfig {
            dm: Default::default(),
            players: vec![
                character("Auditor Venn", "ACG"),
                character("Sable Okoro", "Freeborn"),
            ],
        },
        ..Default::default()
    }
}

/// Strip every volatile field (timestamps, hashes, session ids, machine
/// paths) recursively so two replays compare structurally.
fn scrub(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, inner) in map {
                if matches!(
                    key.as_str(),
                    "ts" | "timestamp" | "prev_hash" | "hash" | "session" | "config"
                ) {
                    continue;
                }
                out.insert(key.clone(), scrub(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(scrub).collect()),
        other => other.clone(),
    }
}

async fn run_once(dir: &std::path::Path) -> Vec<Value> {
    let orchestrator = SessionOrchestrator::new(config(dir.to_path_buf()))
        .with_dm_llm(Arc::new(ScriptedLlmClient::new(
            "dm",
            vec![SCENARIO_TEXT.to_string(), NARRATION_TEXT.to_string()],
        )))
        .with_default_player_llm(Arc::new(ScriptedLlmClient::always("player", PLAYER_ACTION)));

    let report = orchestrator.run().await.unwrap();
    event_log::load_events(&report.event_log_path).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_seed_and_transcript_replays_identically() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let events_a = run_once(dir_a.path()).await;
    let events_b = run_once(dir_b.path()).await;

    assert!(!events_a.is_empty());
    assert_eq!(events_a.len(), events_b.len(), "replays must log the same event count");

    let scrubbed_a: Vec<Value> = events_a.iter().map(scrub).collect();
    let scrubbed_b: Vec<Value> = events_b.iter().map(scrub).collect();
    for (index, (a, b)) in scrubbed_a.iter().zip(&scrubbed_b).enumerate() {
        assert_eq!(a, b, "event {} diverged between replays", index);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_different_seeds_diverge() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let events_a = run_once(dir_a.path()).await;

    let mut alt = config(dir_b.path().to_path_buf());
    alt.rng_seed = Some(778);
    let report = SessionOrchestrator::new(alt)
        .with_dm_llm(Arc::new(ScriptedLlmClient::new(
            "dm",
            vec![SCENARIO_TEXT.to_string(), NARRATION_TEXT.to_string()],
        )))
        .with_default_player_llm(Arc::new(ScriptedLlmClient::always("player", PLAYER_ACTION)))
        .run()
        .await
        .unwrap();
    let events_b = event_log::load_events(&report.event_log_path).unwrap();

    // Different dice: at least one resolution roll differs.
    let rolls = |events: &[Value]| -> Vec<i64> {
        events
            .iter()
            .filter(|e| e.get("event_type").and_then(|t| t.as_str()) == Some("action_resolution"))
            .filter_map(|e| e["roll"]["d20"].as_i64())
            .collect()
    };
    assert_ne!(rolls(&events_a), rolls(&events_b));
}

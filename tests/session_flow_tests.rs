//! Full session runs over the bus with scripted LLMs and seeded dice.

use std::sync::Arc;
use voidtable::voidtable::config::{CharacterConfig, SessionConfig};
use voidtable::voidtable::event_log;
use voidtable::voidtable::llm::ScriptedLlmClient;
use voidtable::voidtable::session::SessionOrchestrator;

const SCENARIO_TEXT: &str = "THEME: Transit Heist\n\
LOCATION: Arcadia Freight Spine\n\
SITUATION: A sealed freight capsule hides tampered ledgers.\n\
VOID_LEVEL: 3\n\
CLOCK1: Security Alert | 6 | Patrol response builds | ADVANCE=Patrols close in | REGRESS=Patrols misled | FILLED=Lockdown begins [NEW_CLOCK: Lockdown | 4 | Exits sealing]\n\
CLOCK2: Ledger Recovery | 6 | Extracting the proof | ADVANCE=Evidence secured | REGRESS=Evidence lost | FILLED=Proof complete [ADVANCE_STORY: Magistrate Office | Confront the magistrate]";

const NARRATION_TEXT: &str =
    "The attempt plays out cleanly under the flood lamps; nothing stirs in response.";

const PLAYER_ACTION: &str = "INTENT: survey the freight spine for tamper marks\n\
ATTRIBUTE: Perception\n\
SKILL: Awareness\n\
DIFFICULTY: 20 - hidden mechanisms\n\
ACTION_TYPE: investigate\n\
DESCRIPTION: A careful sweep of the capsule seams, looking for fresh cuts.";

fn character(name: &str, faction: &str) -> CharacterConfig {
    CharacterConfig {
        name: name.to_string(),
        pronouns: Some("they/them".to_string()),
        faction: faction.to_string(),
        attributes: [
            ("Size", 5),
            ("Endurance", 3),
            ("Agility", 4),
            ("Perception", 4),
            ("Willpower", 4),
            ("Empathy", 3),
            ("Intelligence", 3),
            ("Strength", 3),
            ("Charisma", 3),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect(),
        skills: [("Awareness", 3), ("Charm", 2), ("Astral Arts", 2)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        void_score: 0,
        soulcredit: 5,
        goals: vec!["recover the ledgers".to_string()],
        bonds: vec![],
        inventory: None,
        equipped_weapons: None,
        carried_weapons: vec![],
        personality: Default::default(),
        llm: None,
    }
}

fn base_config(output_dir: std::path::PathBuf, max_turns: u32) -> SessionConfig {
    SessionConfig {
        session_name: "flow_test".to_string(),
        max_turns,
        output_dir,
        party_size: 2,
        rng_seed: Some(42),
        agents: voidtable::voidtable::config::AgentsConfig {
            dm: Default::default(),
            players: vec![
                character("Zara Nightwhisper", "Tempest Industries"),
                character("Kael Dren", "Pantheon Security"),
            ],
        },
        ..Default::default()
    }
}

fn count_events(events: &[serde_json::Value], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e.get("event_type").and_then(|t| t.as_str()) == Some(event_type))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_round_session_produces_complete_event_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path().to_path_buf(), 2);

    let orchestrator = SessionOrchestrator::new(config)
        .with_dm_llm(Arc::new(ScriptedLlmClient::new(
            "dm",
            vec![SCENARIO_TEXT.to_string(), NARRATION_TEXT.to_string()],
        )))
        .with_default_player_llm(Arc::new(ScriptedLlmClient::always("player", PLAYER_ACTION)));

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.rounds_played, 2);
    assert_eq!(report.end_status, "round_limit");

    // The event log is intact and complete.
    assert!(event_log::verify_integrity(&report.event_log_path).unwrap());
    let events = event_log::load_events(&report.event_log_path).unwrap();

    assert_eq!(count_events(&events, "session_start"), 1);
    assert_eq!(count_events(&events, "scenario"), 1);
    assert_eq!(count_events(&events, "round_start"), 2);
    // Two players, two rounds, one action each: every action appears exactly
    // once as a declaration and once as a resolution.
    assert_eq!(count_events(&events, "action_declaration"), 4);
    assert_eq!(count_events(&events, "action_resolution"), 4);
    assert_eq!(count_events(&events, "round_synthesis"), 2);
    assert_eq!(count_events(&events, "round_summary"), 2);
    assert_eq!(count_events(&events, "mission_debrief"), 2);
    assert_eq!(count_events(&events, "session_end"), 1);

    // Each resolution carries exactly one outcome tier.
    for event in events
        .iter()
        .filter(|e| e.get("event_type").and_then(|t| t.as_str()) == Some("action_resolution"))
    {
        let tier = event["roll"]["tier"].as_str().unwrap();
        assert!([
            "critical_failure",
            "failure",
            "marginal",
            "moderate",
            "good",
            "excellent",
            "exceptional"
        ]
        .contains(&tier));
    }

    // The restructured record nests both rounds.
    let rounds = event_log::restructure_into_rounds(&events);
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0]["declarations"].as_array().unwrap().len(), 2);
    assert_eq!(rounds[0]["scenario"]["theme"], "Transit Heist");
    assert!(rounds[0]["synthesis"].as_str().unwrap().contains("flood lamps"));

    // The final session record was written.
    assert!(report.record_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_end_marker_terminates_early() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path().to_path_buf(), 10);

    // DM call order in round 1: scenario, two adjudication narrations, then
    // the synthesis that declares victory.
    let orchestrator = SessionOrchestrator::new(config)
        .with_dm_llm(Arc::new(ScriptedLlmClient::new(
            "dm",
            vec![
                SCENARIO_TEXT.to_string(),
                NARRATION_TEXT.to_string(),
                NARRATION_TEXT.to_string(),
                "The ledgers are secured and the patrols never knew. \
                 [SESSION_END: VICTORY - proof recovered]"
                    .to_string(),
            ],
        )))
        .with_default_player_llm(Arc::new(ScriptedLlmClient::always("player", PLAYER_ACTION)));

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.end_status, "victory");
    assert_eq!(report.rounds_played, 1);

    let events = event_log::load_events(&report.event_log_path).unwrap();
    let end = events
        .iter()
        .find(|e| e.get("event_type").and_then(|t| t.as_str()) == Some("session_end"))
        .unwrap();
    assert_eq!(end["final_state"]["session_end_status"], "victory");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_story_advancement_markers_rebuild_clock_board() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path().to_path_buf(), 2);

    let advancing_synthesis = "The proof is complete; the trail leads onward. \
         [ADVANCE_STORY: Magistrate Office | Confront the magistrate with the ledgers] \
         [NEW_CLOCK: Magistrate Resolve | 4 | His will to stonewall]";

    let orchestrator = SessionOrchestrator::new(config)
        .with_dm_llm(Arc::new(ScriptedLlmClient::new(
            "dm",
            vec![
                SCENARIO_TEXT.to_string(),
                NARRATION_TEXT.to_string(),
                NARRATION_TEXT.to_string(),
                advancing_synthesis.to_string(),
                NARRATION_TEXT.to_string(),
            ],
        )))
        .with_default_player_llm(Arc::new(ScriptedLlmClient::always("player", PLAYER_ACTION)));

    let report = orchestrator.run().await.unwrap();
    let events = event_log::load_events(&report.event_log_path).unwrap();

    // The advancement was applied and the new clock spawned after the board
    // was cleared.
    assert_eq!(count_events(&events, "story_advancement"), 1);
    let spawned: Vec<&str> = events
        .iter()
        .filter(|e| e.get("event_type").and_then(|t| t.as_str()) == Some("clock_spawn"))
        .filter_map(|e| e.get("clock_name").and_then(|n| n.as_str()))
        .collect();
    assert!(spawned.contains(&"Magistrate Resolve"));

    // An advancement synthesis must carry both marker kinds or the scene
    // stalls; lint the narration for them.
    assert!(voidtable::voidtable::markers::parse_advance_story(advancing_synthesis).is_some());
    assert!(!voidtable::voidtable::markers::parse_new_clocks(advancing_synthesis).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inter_party_dialogue_is_a_free_action() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path().to_path_buf(), 1);

    let dialogue_action = "INTENT: tell Kael Dren what I found about the glyph\n\
ATTRIBUTE: Empathy\n\
SKILL: Charm\n\
DIFFICULTY: 10 - simple party communication\n\
ACTION_TYPE: social\n\
DESCRIPTION: Zara leans in and walks Kael through the etched pattern she copied.";

    let orchestrator = SessionOrchestrator::new(config)
        .with_dm_llm(Arc::new(ScriptedLlmClient::new(
            "dm",
            vec![SCENARIO_TEXT.to_string(), NARRATION_TEXT.to_string()],
        )))
        // Zara: dialogue first, then her main action; Kael: a normal action.
        .with_player_llm(
            "Zara Nightwhisper",
            Arc::new(ScriptedLlmClient::new(
                "zara",
                vec![dialogue_action.to_string(), PLAYER_ACTION.to_string()],
            )),
        )
        .with_player_llm(
            "Kael Dren",
            Arc::new(ScriptedLlmClient::always("kael", PLAYER_ACTION)),
        );

    let report = orchestrator.run().await.unwrap();
    let events = event_log::load_events(&report.event_log_path).unwrap();

    // Three declarations in round one: Zara's free dialogue + her main
    // action, plus Kael's single action — and three matching resolutions.
    assert_eq!(count_events(&events, "action_declaration"), 3);
    assert_eq!(count_events(&events, "action_resolution"), 3);

    let zara_declarations = events
        .iter()
        .filter(|e| {
            e.get("event_type").and_then(|t| t.as_str()) == Some("action_declaration")
                && e.get("player_id").and_then(|p| p.as_str()) == Some("player_01")
        })
        .count();
    assert_eq!(zara_declarations, 2);

    // The first of Zara's actions is flagged as the free action.
    let zara_actions: Vec<&serde_json::Value> = events
        .iter()
        .filter(|e| {
            e.get("event_type").and_then(|t| t.as_str()) == Some("action_declaration")
                && e.get("player_id").and_then(|p| p.as_str()) == Some("player_01")
        })
        .collect();
    assert_eq!(zara_actions[0]["action"]["is_free_action"], true);
    assert_eq!(zara_actions[1]["action"]["is_free_action"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_setup_fails_without_players() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf(), 1);
    config.agents.players.clear();

    let result = SessionOrchestrator::new(config).run().await;
    assert!(result.is_err());
}

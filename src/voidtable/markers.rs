//! Director control markers.
//!
//! The marker vocabulary is the real protocol between the Director's prose
//! and the engine: LLM output is untrusted text, and these parsers lift the
//! structured commands out of it. Every parser is a pure function over the
//! narration string; nothing here mutates state.
//!
//! Recognized markers:
//!
//! ```text
//! [SESSION_END: VICTORY|DEFEAT|DRAW - optional reason]
//! [NEW_CLOCK: Name | Max | Description]
//! [ADVANCE_STORY: Location | Situation]
//! [PIVOT_SCENARIO: Theme]
//! [SPAWN_ENEMY: name | template | count | position | tactics]   (all 5 fields)
//! [DESPAWN_ENEMY: name | reason]
//! [ENEMY_SURRENDER: name]   [ENEMY_FLEE: name]
//! [POSITION: PositionName]
//! EFFECT: type=damage, target=tgt_ab12, final=6
//! ```

use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Terminal session status declared by the Director.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndStatus {
    Victory,
    Defeat,
    Draw,
}

impl SessionEndStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEndStatus::Victory => "victory",
            SessionEndStatus::Defeat => "defeat",
            SessionEndStatus::Draw => "draw",
        }
    }
}

/// Parsed `[SESSION_END: …]`.
#[derive(Debug, Clone)]
pub struct SessionEndMarker {
    pub status: SessionEndStatus,
    pub reason: Option<String>,
}

/// Parsed `[NEW_CLOCK: …]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewClockMarker {
    pub name: String,
    pub max: i32,
    pub description: String,
}

/// Parsed `[ADVANCE_STORY: …]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceStoryMarker {
    pub location: String,
    pub situation: String,
}

/// Parsed `[SPAWN_ENEMY: …]` with all five fields present.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnEnemyMarker {
    pub name: String,
    pub template: String,
    pub count: u32,
    pub position: String,
    pub tactics: String,
}

/// Parsed `[DESPAWN_ENEMY: …]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DespawnEnemyMarker {
    pub name: String,
    pub reason: String,
}

/// A typed mechanical effect block keyed to a target.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectBlock {
    /// damage | debuff | status | movement | reveal
    pub effect_type: String,
    pub target: String,
    /// Post-soak damage for damage effects.
    pub final_damage: Option<i32>,
    pub penalty: Option<i32>,
    pub duration: Option<i32>,
    pub bonus: Option<i32>,
    pub effect: Option<String>,
    pub new_position: Option<String>,
    /// `"narration"` for parsed blocks, `"fallback"` for synthesized ones.
    pub source: &'static str,
}

lazy_static! {
    static ref SESSION_END_RE: Regex =
        Regex::new(r"(?i)\[SESSION_END:\s*(VICTORY|DEFEAT|DRAW)(?:\s*-\s*([^\]]+))?\]").unwrap();
    static ref NEW_CLOCK_RE: Regex =
        Regex::new(r"\[NEW_CLOCK:\s*([^|\]]+)\|\s*(\d+)\s*\|\s*([^\]]+)\]").unwrap();
    static ref PIVOT_RE: Regex = Regex::new(r"\[PIVOT_SCENARIO:\s*([^\]]+)\]").unwrap();
    static ref ADVANCE_RE: Regex =
        Regex::new(r"\[ADVANCE_STORY:\s*([^|\]]+)\|\s*([^\]]+)\]").unwrap();
    static ref SPAWN_RE: Regex = Regex::new(r"\[SPAWN_ENEMY:\s*([^\]]+)\]").unwrap();
    static ref DESPAWN_RE: Regex =
        Regex::new(r"\[DESPAWN_ENEMY:\s*([^|\]]+)(?:\|\s*([^\]]+))?\]").unwrap();
    static ref SURRENDER_RE: Regex = Regex::new(r"\[ENEMY_SURRENDER:\s*([^\]]+)\]").unwrap();
    static ref FLEE_RE: Regex = Regex::new(r"\[ENEMY_FLEE:\s*([^\]]+)\]").unwrap();
    static ref POSITION_RE: Regex = Regex::new(r"(?i)\[POSITION:\s*([^\]]+)\]").unwrap();
    static ref EFFECT_RE: Regex = Regex::new(r"(?m)EFFECT:\s*([^\n\r]+)").unwrap();
}

/// Scan for a session-end declaration.
pub fn parse_session_end(narration: &str) -> Option<SessionEndMarker> {
    let caps = SESSION_END_RE.captures(narration)?;
    let status = match caps[1].to_ascii_uppercase().as_str() {
        "VICTORY" => SessionEndStatus::Victory,
        "DEFEAT" => SessionEndStatus::Defeat,
        _ => SessionEndStatus::Draw,
    };
    let reason = caps.get(2).map(|m| m.as_str().trim().to_string());
    info!(
        "parsed session end marker: {}{}",
        status.as_str(),
        reason.as_deref().map(|r| format!(" - {}", r)).unwrap_or_default()
    );
    Some(SessionEndMarker { status, reason })
}

/// Scan for all `[NEW_CLOCK: …]` markers.
pub fn parse_new_clocks(narration: &str) -> Vec<NewClockMarker> {
    NEW_CLOCK_RE
        .captures_iter(narration)
        .filter_map(|caps| {
            let max = caps[2].trim().parse().ok()?;
            let marker = NewClockMarker {
                name: caps[1].trim().to_string(),
                max,
                description: caps[3].trim().to_string(),
            };
            info!("parsed new clock: {} ({} ticks)", marker.name, marker.max);
            Some(marker)
        })
        .collect()
}

/// Scan for a scenario pivot.
pub fn parse_pivot_scenario(narration: &str) -> Option<String> {
    PIVOT_RE
        .captures(narration)
        .map(|caps| caps[1].trim().to_string())
}

/// Scan for a story advancement.
pub fn parse_advance_story(narration: &str) -> Option<AdvanceStoryMarker> {
    ADVANCE_RE.captures(narration).map(|caps| AdvanceStoryMarker {
        location: caps[1].trim().to_string(),
        situation: caps[2].trim().to_string(),
    })
}

/// Scan for complete spawn markers. Instances missing any of the five fields
/// are skipped here; use [`extract_invalid_spawn_markers`] to collect them
/// for a compliance retry.
pub fn parse_spawn_enemies(narration: &str) -> Vec<SpawnEnemyMarker> {
    SPAWN_RE
        .captures_iter(narration)
        .filter_map(|caps| parse_spawn_fields(&caps[1]))
        .collect()
}

fn parse_spawn_fields(body: &str) -> Option<SpawnEnemyMarker> {
    let fields: Vec<&str> = body.split('|').map(str::trim).collect();
    if fields.len() != 5 || fields.iter().any(|f| f.is_empty()) {
        return None;
    }
    let count: u32 = fields[2].parse().ok()?;
    Some(SpawnEnemyMarker {
        name: fields[0].to_string(),
        template: fields[1].to_lowercase(),
        count: count.max(1),
        position: fields[3].to_string(),
        tactics: fields[4].to_lowercase(),
    })
}

/// Collect the raw bodies of incomplete `[SPAWN_ENEMY: …]` markers so the
/// Director can issue a format-compliance retry.
pub fn extract_invalid_spawn_markers(narration: &str) -> Vec<String> {
    SPAWN_RE
        .captures_iter(narration)
        .filter(|caps| parse_spawn_fields(&caps[1]).is_none())
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Scan for despawn markers. A missing reason defaults to `"despawned"`.
pub fn parse_despawn_enemies(narration: &str) -> Vec<DespawnEnemyMarker> {
    DESPAWN_RE
        .captures_iter(narration)
        .map(|caps| DespawnEnemyMarker {
            name: caps[1].trim().to_string(),
            reason: caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| "despawned".to_string()),
        })
        .collect()
}

/// Scan for enemy surrender markers (names).
pub fn parse_enemy_surrenders(narration: &str) -> Vec<String> {
    SURRENDER_RE
        .captures_iter(narration)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Scan for enemy flee markers (names).
pub fn parse_enemy_flees(narration: &str) -> Vec<String> {
    FLEE_RE
        .captures_iter(narration)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Scan for an explicit `[POSITION: X]` marker.
pub fn parse_position_marker(narration: &str) -> Option<String> {
    POSITION_RE
        .captures(narration)
        .map(|caps| caps[1].trim().to_string())
}

/// Parse the first `EFFECT:` block into a typed effect.
pub fn parse_effect_block(narration: &str) -> Option<EffectBlock> {
    let caps = EFFECT_RE.captures(narration)?;
    let mut fields: HashMap<String, String> = HashMap::new();
    for pair in caps[1].split(',') {
        let mut kv = pair.splitn(2, '=');
        let key = kv.next()?.trim().to_lowercase();
        let value = kv.next().map(str::trim).unwrap_or("").to_string();
        if !key.is_empty() && !value.is_empty() {
            fields.insert(key, value);
        }
    }

    let effect_type = fields.get("type")?.to_lowercase();
    if !matches!(
        effect_type.as_str(),
        "damage" | "debuff" | "status" | "movement" | "reveal"
    ) {
        return None;
    }
    let target = fields.get("target")?.clone();
    let parse_num = |key: &str| fields.get(key).and_then(|v| v.parse::<i32>().ok());

    Some(EffectBlock {
        effect_type,
        target,
        final_damage: parse_num("final").or_else(|| parse_num("damage")),
        penalty: parse_num("penalty"),
        duration: parse_num("duration"),
        bonus: parse_num("bonus"),
        effect: fields.get("effect").cloned(),
        new_position: fields.get("new_position").cloned(),
        source: "narration",
    })
}

//! Outcome parser: lifts structured state changes from Director prose.
//!
//! The Director's narration is untrusted LLM text. After every adjudication
//! this module extracts the mechanical consequences — clock deltas, void and
//! soulcredit changes, conditions, position changes — into a
//! [`ParsedOutcome`] bundle. Nothing is applied during parsing; the Director
//! consumes the bundle and mutates the engine afterwards, which keeps the
//! extraction testable and allows dry-run previews.
//!
//! Explicit markers always win: when the narration carries `📊 Clock: ±N`
//! markers, implicit keyword inference over clock categories is skipped
//! entirely.

use crate::voidtable::markers::{self, EffectBlock};
use crate::voidtable::mechanics::{OutcomeTier, SceneClock};
use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use std::collections::BTreeMap;

/// One queued clock change extracted from narration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockTrigger {
    pub clock: String,
    pub ticks: i32,
    pub reason: String,
    /// `"explicit"` for 📊 markers, `"inferred"` for keyword matches.
    pub source: &'static str,
}

/// A condition extracted from narration (including 🎭/🏔️ markers).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCondition {
    pub name: String,
    pub condition_type: String,
    pub penalty: i32,
    pub description: String,
    /// e.g. `"prevents_targeting"` for Unseen.
    pub special: Option<String>,
}

/// Everything the parser lifted from one narration.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutcome {
    pub clock_triggers: Vec<ClockTrigger>,
    pub void_change: i32,
    pub void_reasons: Vec<String>,
    /// When a cleansing action targets another character, the void change
    /// applies to them instead of the actor.
    pub void_target_character: Option<String>,
    pub soulcredit_change: i32,
    pub soulcredit_reasons: Vec<String>,
    pub conditions: Vec<ParsedCondition>,
    pub position_change: Option<String>,
    pub notes: Vec<String>,
}

/// Attack/damage numbers recovered from combat narration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombatTriplet {
    pub attack_roll: Option<i32>,
    pub attack_dc: Option<i32>,
    pub attack_hit: Option<bool>,
    pub damage: Option<i32>,
    pub soak: Option<i32>,
    pub post_soak_damage: Option<i32>,
}

impl CombatTriplet {
    pub fn is_empty(&self) -> bool {
        self.post_soak_damage.is_none() && self.attack_roll.is_none()
    }
}

/// The slice of the original action the parser needs.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub intent: String,
    pub is_ritual: bool,
    /// Resolved character name when the action targets a PC.
    pub target_character: Option<String>,
}

lazy_static! {
    static ref SOULCREDIT_RE: Regex =
        Regex::new(r"⚖️\s*[Ss]oulcredit:\s*([+-]?\d+)\s*(?:\(([^)]+)\))?").unwrap();
    static ref CLOCK_MARKER_RE: Regex =
        Regex::new(r"📊\s*([^:\n]+):\s*([+-]?\d+)\s*(?:\(([^)]+)\))?").unwrap();
    static ref VOID_PLUS_RE: Regex = Regex::new(r"\+(\d+)\s*void").unwrap();
    static ref VOID_SUFFIX_RE: Regex = Regex::new(r"void\s*\+(\d+)").unwrap();
    static ref VOID_GAINS_RE: Regex = Regex::new(r"gains?\s+(\d+)\s+void").unwrap();
    static ref VOID_CORRUPTION_RE: Regex = Regex::new(r"(\d+)\s+void\s+corruption").unwrap();
    static ref TARGET_POSITION_RE: Regex =
        Regex::new(r"(?i)\[TARGET_POSITION:\s*([^\]]+)\]").unwrap();
    static ref MOVES_FROM_RE: Regex =
        Regex::new(r"moves?\s+from\s+([A-Za-z\-]+)\s+to\s+([A-Za-z\-]+)").unwrap();
    static ref SHIFTS_TO_RE: Regex =
        Regex::new(r"(?:shifts?|moves?)\s+to\s+([A-Za-z\-]+(?:\s+[A-Za-z\-]+)?)").unwrap();
    static ref CONDITION_MARKER_RE: Regex =
        Regex::new(r"🎭\s*Condition:\s*([^\(]+)\s*\(([^\)]+)\)").unwrap();
    static ref TOKEN_MARKER_RE: Regex =
        Regex::new(r"🏔️\s*Token Claimed:\s*([^\(]+)\s*\(([^\)]+)\)").unwrap();
    static ref SIGNED_NUM_RE: Regex = Regex::new(r"([+\-]\d+)").unwrap();
    static ref ATTACK_RE: Regex =
        Regex::new(r"(?:Attack|attack):\s*(\d+)\s*(?:vs|against|VS)\s*(?:DC|dc)?\s*(\d+)").unwrap();
    static ref DAMAGE_TRIPLET_RE: Regex = Regex::new(
        r"(?:Damage|damage):\s*(\d+)\s*→\s*(?:Soak|soak):\s*(\d+)\s*→\s*(?:Final|final):\s*(\d+)"
    )
    .unwrap();
    static ref TAKES_DAMAGE_RE: Regex =
        Regex::new(r"(?i)(?:takes|suffers)\s+(\d+)\s+damage").unwrap();
}

const GROUNDING_KEYWORDS: [&str; 6] = [
    "ground", "center", "meditate", "calm self", "focus inward", "discipline mind",
];
const PURGE_KEYWORDS: [&str; 6] = [
    "purge", "cleanse", "dephase", "filter", "contain void", "isolate corruption",
];

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

/// Parse an explicit `⚖️ Soulcredit: ±N (reason)` marker.
pub fn parse_soulcredit_markers(narration: &str) -> (i32, String) {
    if let Some(caps) = SOULCREDIT_RE.captures(narration) {
        let delta: i32 = caps[1].parse().unwrap_or(0);
        let reason = caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| "Soulcredit change".to_string());
        info!("parsed soulcredit marker: {:+} ({})", delta, reason);
        return (delta, reason);
    }
    (0, String::new())
}

/// Parse explicit `📊 Clock Name: ±N (reason)` markers. Clock names match
/// case-insensitively against the active set.
pub fn parse_explicit_clock_markers(
    narration: &str,
    active_clocks: &BTreeMap<String, SceneClock>,
) -> Vec<ClockTrigger> {
    let mut triggers = Vec::new();
    if active_clocks.is_empty() {
        return triggers;
    }

    for caps in CLOCK_MARKER_RE.captures_iter(narration) {
        let raw_name = caps[1].trim();
        let Ok(ticks) = caps[2].parse::<i32>() else { continue };
        let reason = caps
            .get(3)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| "Clock update".to_string());

        let resolved = if active_clocks.contains_key(raw_name) {
            Some(raw_name.to_string())
        } else {
            active_clocks
                .keys()
                .find(|name| name.eq_ignore_ascii_case(raw_name))
                .cloned()
        };
        if let Some(clock) = resolved {
            triggers.push(ClockTrigger {
                clock,
                ticks,
                reason,
                source: "explicit",
            });
        }
    }
    triggers
}

/// Thematic categories active clocks are sorted into for implicit inference.
#[derive(Default)]
struct ClockCategories {
    danger: Vec<String>,
    investigation: Vec<String>,
    corruption: Vec<String>,
    time: Vec<String>,
    stability: Vec<String>,
    safety: Vec<String>,
    containment: Vec<String>,
}

fn categorize_clocks(active_clocks: &BTreeMap<String, SceneClock>) -> ClockCategories {
    let mut cats = ClockCategories::default();
    for (name, clock) in active_clocks {
        let combined = format!("{} {}", name.to_lowercase(), clock.description.to_lowercase());
        if contains_any(&combined, &["danger", "threat", "escalation", "suspicion", "security", "alarm", "alert", "lockdown", "response"]) {
            cats.danger.push(name.clone());
        }
        if contains_any(&combined, &["investigation", "progress", "evidence", "exposure", "discovery", "data", "extraction"]) {
            cats.investigation.push(name.clone());
        }
        if contains_any(&combined, &["corruption", "void", "contamination", "sanctuary", "taint", "manifests"]) {
            cats.corruption.push(name.clone());
        }
        if contains_any(&combined, &["time", "pressure", "deadline", "clock", "countdown"]) {
            cats.time.push(name.clone());
        }
        if contains_any(&combined, &["stability", "sanity", "morale", "cohesion", "crew", "communal", "bonds", "bond", "integrity"]) {
            cats.stability.push(name.clone());
        }
        if contains_any(&combined, &["safety", "passenger", "civilian", "evacuation", "rescue", "protect", "save", "survivors"]) {
            cats.safety.push(name.clone());
        }
        if contains_any(&combined, &["cascade", "surge", "energy", "meltdown", "overload", "breach", "rupture"]) {
            cats.containment.push(name.clone());
        }
    }
    cats
}

/// Implicit clock inference: classify each active clock by theme, then apply
/// category-specific keyword rules against the narration and outcome.
/// Explicit markers suppress this entirely.
pub fn parse_clock_triggers(
    narration: &str,
    outcome_tier: OutcomeTier,
    margin: i32,
    active_clocks: &BTreeMap<String, SceneClock>,
) -> Vec<ClockTrigger> {
    if active_clocks.is_empty() {
        return Vec::new();
    }

    let explicit = parse_explicit_clock_markers(narration, active_clocks);
    if !explicit.is_empty() {
        return explicit;
    }

    let narration_lower = narration.to_lowercase();
    let cats = categorize_clocks(active_clocks);
    let mut triggers = Vec::new();
    let success = outcome_tier.is_success();
    let failure = !success;
    let critical = outcome_tier == OutcomeTier::CriticalFailure;

    let push = |triggers: &mut Vec<ClockTrigger>, clocks: &[String], ticks: i32, reason: String| {
        for clock in clocks {
            triggers.push(ClockTrigger {
                clock: clock.clone(),
                ticks,
                reason: reason.clone(),
                source: "inferred",
            });
        }
    };

    // Danger / security response.
    if !cats.danger.is_empty() {
        if contains_any(&narration_lower, &["security", "alarm", "alert", "drone", "protocol", "lockdown", "surveillance", "detected", "suspicious", "patrol", "guard"]) {
            push(&mut triggers, &cats.danger, 1, "Security response".to_string());
        }
        if contains_any(&narration_lower, &["psi-lockdown", "facility-wide", "catatonic", "panic", "emergency", "crisis"]) {
            push(&mut triggers, &cats.danger, 2, "Major incident".to_string());
        }
    }

    // Investigation progress on successes mentioning evidence.
    if !cats.investigation.is_empty() && success {
        let evidence = [
            "badge", "terminal", "signature", "log", "trace", "pattern", "evidence",
            "fingerprint", "credential", "device", "residue", "fracture", "tampering",
            "tunnel", "path", "trail", "syndicate", "corporate", "insignia", "sigil",
            "identifier", "sequence", "protocol", "unauthorized", "clue", "discovery",
            "found", "uncovered", "revealed", "saboteur", "operative", "infiltrator",
            "collaborator", "data", "file", "record", "database", "archive", "network",
        ];
        if contains_any(&narration_lower, &evidence) {
            let ticks = if margin >= 10 { 2 } else { 1 };
            push(&mut triggers, &cats.investigation, ticks, format!("Evidence discovered (margin {:+})", margin));
        }
    }

    // Corruption spreading.
    if !cats.corruption.is_empty() {
        if contains_any(&narration_lower, &["corruption", "void manifests", "contamination spreads", "tainted", "void energy", "void exposure", "corrupted", "defiled", "infected"]) {
            push(&mut triggers, &cats.corruption, 1, "Void corruption spreading".to_string());
        }
        if failure
            && contains_any(&narration_lower, &["void", "ritual", "astral", "channel", "corruption", "taint"])
        {
            let ticks = if critical { 2 } else { 1 };
            push(&mut triggers, &cats.corruption, ticks, "Failed void manipulation".to_string());
        }
    }

    // Time pressure.
    if !cats.time.is_empty()
        && contains_any(&narration_lower, &["time passes", "hours pass", "delay", "wait", "slow", "take too long", "meanwhile", "during this", "while you"])
    {
        push(&mut triggers, &cats.time, 1, "Time passing".to_string());
    }

    // Stability: degrades on social/mental failure, improves on healing.
    if !cats.stability.is_empty() {
        if failure
            && contains_any(&narration_lower, &["panic", "traumat", "scream", "catatonic", "shared consciousness", "discord", "fracture", "sever", "broken bonds", "disrupted", "fear", "terror", "horror", "despair", "breakdown", "collapse"])
        {
            let ticks = if critical { 2 } else { 1 };
            push(&mut triggers, &cats.stability, ticks, "Social cohesion degrading".to_string());
        } else if success
            && contains_any(&narration_lower, &["stabiliz", "heal", "mend", "bond", "harmoni", "protective", "reconstitute", "restore", "strengthen", "repair", "comfort", "calm"])
        {
            push(&mut triggers, &cats.stability, -1, "Bonds stabilized".to_string());
        }
    }

    // Safety / evacuation progress on successes.
    if !cats.safety.is_empty() && success {
        let safety_phrases = [
            "evacuate", "evacuation", "rescued", "save", "protect", "shield", "shelter",
            "passenger", "civilian", "corridor", "safe passage", "safe zone", "safe path",
            "redirect flow", "reroute", "guide", "waypoint", "barrier", "protective field",
            "emergency route", "escape path", "exodus", "flee", "sanctuary",
        ];
        if contains_any(&narration_lower, &safety_phrases) {
            let ticks = if margin >= 15 { 3 } else if margin >= 8 { 2 } else { 1 };
            push(&mut triggers, &cats.safety, ticks, format!("Evacuation progress (margin {:+})", margin));
        }
    }

    // Containment: failures push toward disaster; shaky marginals too.
    if !cats.containment.is_empty() {
        if failure
            && contains_any(&narration_lower, &["surge", "cascade", "energy", "void", "ritual", "channel", "contain", "redirect", "stabiliz", "barrier", "field", "diversion"])
        {
            let ticks = if critical { 3 } else { 2 };
            push(&mut triggers, &cats.containment, ticks, "Failed containment".to_string());
        } else if outcome_tier == OutcomeTier::Marginal
            && margin <= 2
            && contains_any(&narration_lower, &["barely", "tenuous", "struggle", "strain", "flicker", "unstable", "temporary", "hold", "fragile", "wobble", "waver"])
        {
            push(&mut triggers, &cats.containment, 1, "Barely contained".to_string());
        }
    }

    triggers
}

/// Parse void gains from narration and intent: explicit `+N Void` variants
/// (highest wins) plus ritual-failure, void-manipulation, and psychic
/// feedback heuristics.
pub fn parse_void_triggers(
    narration: &str,
    action_intent: &str,
    outcome_tier: OutcomeTier,
) -> (i32, Vec<String>) {
    let mut void_change = 0;
    let mut reasons = Vec::new();
    let narration_lower = narration.to_lowercase();
    let intent_lower = action_intent.to_lowercase();
    let failure = !outcome_tier.is_success();
    let critical = outcome_tier == OutcomeTier::CriticalFailure;

    for re in [&*VOID_PLUS_RE, &*VOID_SUFFIX_RE, &*VOID_GAINS_RE, &*VOID_CORRUPTION_RE] {
        for caps in re.captures_iter(&narration_lower) {
            if let Ok(amount) = caps[1].parse::<i32>() {
                void_change = void_change.max(amount);
                if !reasons.iter().any(|r| r == "Void corruption") {
                    reasons.push("Void corruption".to_string());
                }
            }
        }
    }

    if intent_lower.contains("ritual") && failure {
        void_change += 1;
        reasons.push("Failed ritual".to_string());
    }

    let manipulation = [
        "void energy", "void manipulation", "void-touched", "void resonance", "corrupt",
        "forbidden", "void-shield", "tap into void", "controlled void", "void exposure",
        "void-enhanced", "void scan", "attune to void", "opening to the void", "void channel",
    ];
    if manipulation
        .iter()
        .any(|p| narration_lower.contains(p) || intent_lower.contains(p))
    {
        if critical {
            void_change += 1;
            reasons.push("Void backlash from critical failure".to_string());
        } else if failure {
            void_change += 1;
            reasons.push("Failed void manipulation".to_string());
        }
    }

    if failure
        && contains_any(&narration_lower, &["psychic recoil", "feedback", "backlash", "mental trauma", "consciousness corrupted"])
    {
        void_change += 1;
        reasons.push("Psychic/mental corruption".to_string());
    }

    if contains_any(&intent_lower, &["without offering", "skip offering", "shortcut"]) {
        void_change += 1;
        reasons.push("Ritual shortcut (no offering)".to_string());
    }

    (void_change, reasons)
}

fn capitalize_position(raw: &str) -> String {
    raw.split('-')
        .map(|word| {
            // Positions name sides as PC/NPC; keep those fully capitalized.
            if word.eq_ignore_ascii_case("pc") || word.eq_ignore_ascii_case("npc") {
                return word.to_ascii_uppercase();
            }
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => format!(
                    "{}{}",
                    first.to_ascii_uppercase(),
                    chars.collect::<String>()
                ),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse a position change. Priority: explicit `[POSITION: X]` in narration,
/// then `[TARGET_POSITION: X]` in the action intent, then prose patterns.
pub fn parse_position_change(narration: &str, action_intent: &str) -> Option<String> {
    if let Some(pos) = markers::parse_position_marker(narration) {
        info!("parsed explicit position marker: {}", pos);
        return Some(pos);
    }

    if let Some(caps) = TARGET_POSITION_RE.captures(action_intent) {
        let pos = caps[1].trim().to_string();
        info!("parsed target position from declaration: {}", pos);
        return Some(pos);
    }

    let narration_lower = narration.to_lowercase();
    if let Some(caps) = MOVES_FROM_RE.captures(&narration_lower) {
        return Some(capitalize_position(&caps[2]));
    }
    if let Some(caps) = SHIFTS_TO_RE.captures(&narration_lower) {
        return Some(capitalize_position(caps[1].trim()));
    }
    None
}

/// Parse 🎭 condition and 🏔️ token-claim markers.
pub fn parse_condition_markers(narration: &str) -> Vec<ParsedCondition> {
    let mut conditions = Vec::new();

    for caps in CONDITION_MARKER_RE.captures_iter(narration) {
        let name = caps[1].trim().to_string();
        let description = caps[2].trim().to_string();
        if description.to_lowercase().contains("can't be targeted")
            || name.to_lowercase().contains("unseen")
        {
            conditions.push(ParsedCondition {
                name,
                condition_type: "Unseen".to_string(),
                penalty: 0,
                description,
                special: Some("prevents_targeting".to_string()),
            });
        } else {
            conditions.push(ParsedCondition {
                condition_type: name.replace(' ', "_"),
                name,
                penalty: 0,
                description,
                special: None,
            });
        }
    }

    for caps in TOKEN_MARKER_RE.captures_iter(narration) {
        let token_name = caps[1].trim().to_string();
        let description = caps[2].trim().to_string();
        let bonus = SIGNED_NUM_RE
            .captures(&description)
            .and_then(|c| c[1].parse::<i32>().ok())
            .unwrap_or(0);
        conditions.push(ParsedCondition {
            condition_type: format!("Token_{}", token_name.replace(' ', "_")),
            name: format!("{} Token", token_name),
            // Negative penalty is a bonus.
            penalty: -bonus,
            description,
            special: None,
        });
    }

    conditions
}

/// Recover attack/damage numbers from combat narration.
pub fn parse_combat_triplet(narration: &str) -> CombatTriplet {
    let mut data = CombatTriplet::default();

    if let Some(caps) = ATTACK_RE.captures(narration) {
        let roll: i32 = caps[1].parse().unwrap_or(0);
        let dc: i32 = caps[2].parse().unwrap_or(0);
        data.attack_roll = Some(roll);
        data.attack_dc = Some(dc);
        data.attack_hit = Some(roll >= dc);
    }

    if let Some(caps) = DAMAGE_TRIPLET_RE.captures(narration) {
        data.damage = caps[1].parse().ok();
        data.soak = caps[2].parse().ok();
        data.post_soak_damage = caps[3].parse().ok();
    } else if let Some(caps) = TAKES_DAMAGE_RE.captures(narration) {
        data.post_soak_damage = caps[1].parse().ok();
    }

    data
}

/// Complete per-resolution extraction.
pub fn parse_state_changes(
    narration: &str,
    action: &ActionContext,
    outcome_tier: OutcomeTier,
    margin: i32,
    active_clocks: &BTreeMap<String, SceneClock>,
) -> ParsedOutcome {
    let mut out = ParsedOutcome {
        clock_triggers: parse_clock_triggers(narration, outcome_tier, margin, active_clocks),
        ..Default::default()
    };

    let (mut void_change, mut void_reasons) =
        parse_void_triggers(narration, &action.intent, outcome_tier);

    // Recovery moves override accumulated gains on success.
    let intent_lower = action.intent.to_lowercase();
    if outcome_tier.is_success() {
        if contains_any(&intent_lower, &GROUNDING_KEYWORDS) {
            void_change = -1;
            void_reasons = vec!["Grounding meditation success".to_string()];
            out.notes.push("Grounding: -1 Void (personal recovery)".to_string());
        } else if contains_any(&intent_lower, &PURGE_KEYWORDS) {
            out.notes.push("Purge: -Scene Void pressure (one round)".to_string());
        }
    }
    out.void_change = void_change;
    out.void_reasons = void_reasons;

    // Collaborative cleansing redirects the void change at the named target.
    if out.void_change != 0
        && contains_any(&intent_lower, &["cleanse", "purify", "ground"])
    {
        out.void_target_character = action.target_character.clone();
    }

    // Narration-implied conditions.
    let narration_lower = narration.to_lowercase();
    if contains_any(&narration_lower, &["headache", "migraine", "splitting pain"]) {
        out.conditions.push(ParsedCondition {
            name: "Mental Strain".to_string(),
            condition_type: "Mental Strain".to_string(),
            penalty: -2,
            description: "Headache from psychic feedback".to_string(),
            special: None,
        });
    }
    if contains_any(&narration_lower, &["overheat", "crack", "damage", "short out"]) {
        out.conditions.push(ParsedCondition {
            name: "Equipment Damage".to_string(),
            condition_type: "Equipment Damage".to_string(),
            penalty: -2,
            description: "Damaged equipment".to_string(),
            special: None,
        });
    }

    let (sc_delta, sc_reason) = parse_soulcredit_markers(narration);
    out.soulcredit_change = sc_delta;
    if !sc_reason.is_empty() {
        out.soulcredit_reasons.push(sc_reason);
    }

    out.position_change = parse_position_change(narration, &action.intent);
    out.conditions.extend(parse_condition_markers(narration));

    out
}

/// Synthesize a damage effect when a successful attack narration carried no
/// explicit `EFFECT:` block. Only for enemy targets — the Director's prose is
/// authoritative for anything aimed at a PC.
pub fn generate_fallback_effect(
    target: &str,
    weapon_damage: i32,
    margin: i32,
    target_soak: i32,
) -> Option<EffectBlock> {
    if margin < 0 {
        return None;
    }
    let raw = weapon_damage + margin / 5;
    let final_damage = (raw - target_soak / 2).max(1);
    Some(EffectBlock {
        effect_type: "damage".to_string(),
        target: target.to_string(),
        final_damage: Some(final_damage),
        penalty: None,
        duration: None,
        bonus: None,
        effect: None,
        new_position: None,
        source: "fallback",
    })
}

/// Ally-support fallback: healing when the intent reads as treatment,
/// otherwise a small timed bonus.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackBuff {
    Heal { target: String, amount: i32 },
    Buff {
        target: String,
        bonus: i32,
        duration: i32,
        effect: String,
    },
}

pub fn generate_fallback_buff(target: &str, intent: &str, margin: i32) -> Option<FallbackBuff> {
    if margin < 0 {
        return None;
    }
    let intent_lower = intent.to_lowercase();
    if contains_any(&intent_lower, &["heal", "mend", "patch", "treat", "bandage", "first aid"]) {
        Some(FallbackBuff::Heal {
            target: target.to_string(),
            amount: 3 + margin / 5,
        })
    } else {
        Some(FallbackBuff::Buff {
            target: target.to_string(),
            bonus: 2,
            duration: 2,
            effect: "coordinated support".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voidtable::mechanics::ClockSpec;
    use crate::voidtable::mechanics::MechanicsEngine;
    use crate::voidtable::dice::DiceRoller;

    fn clocks_with(names: &[(&str, &str)]) -> BTreeMap<String, SceneClock> {
        let mut engine = MechanicsEngine::new(DiceRoller::seeded(1));
        for (name, desc) in names {
            engine.create_scene_clock(ClockSpec {
                name: name.to_string(),
                maximum: 6,
                description: desc.to_string(),
                ..Default::default()
            });
        }
        engine.scene_clocks
    }

    #[test]
    fn test_explicit_markers_suppress_inference() {
        let clocks = clocks_with(&[("Security Alert", "guards closing in")]);
        let narration = "Alarms scream across the deck. 📊 Security Alert: +2 (alarm tripped)";
        let triggers = parse_clock_triggers(narration, OutcomeTier::Failure, -4, &clocks);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].ticks, 2);
        assert_eq!(triggers[0].source, "explicit");
    }

    #[test]
    fn test_explicit_marker_case_insensitive_clock_lookup() {
        let clocks = clocks_with(&[("Evidence Collection", "proof of sabotage")]);
        let triggers =
            parse_explicit_clock_markers("📊 evidence collection: -1 (files wiped)", &clocks);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].clock, "Evidence Collection");
        assert_eq!(triggers[0].ticks, -1);
    }

    #[test]
    fn test_investigation_inference_scales_with_margin() {
        let clocks = clocks_with(&[("Saboteur Exposure", "tracking the evidence trail")]);
        let narration = "You uncover a maintenance log with an unauthorized credential.";
        let weak = parse_clock_triggers(narration, OutcomeTier::Marginal, 2, &clocks);
        assert_eq!(weak[0].ticks, 1);
        let strong = parse_clock_triggers(narration, OutcomeTier::Good, 12, &clocks);
        assert_eq!(strong[0].ticks, 2);
    }

    #[test]
    fn test_stability_clock_regresses_on_healing() {
        let clocks = clocks_with(&[("Communal Stability", "crew cohesion fraying")]);
        let triggers = parse_clock_triggers(
            "Her breathing steadies as you mend the severed bond.",
            OutcomeTier::Moderate,
            7,
            &clocks,
        );
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].ticks, -1);
    }

    #[test]
    fn test_containment_failure_advances_hard() {
        let clocks = clocks_with(&[("Energy Cascade", "the reactor surge builds")]);
        let triggers = parse_clock_triggers(
            "The containment field collapses as the surge doubles.",
            OutcomeTier::CriticalFailure,
            -22,
            &clocks,
        );
        assert!(triggers.iter().any(|t| t.ticks == 3));
    }

    #[test]
    fn test_void_explicit_takes_highest() {
        let (void, reasons) = parse_void_triggers(
            "The backlash sears you. +2 Void. Later you gain 1 void more.",
            "channel the conduit",
            OutcomeTier::Failure,
        );
        assert!(void >= 2);
        assert!(reasons.iter().any(|r| r == "Void corruption"));
    }

    #[test]
    fn test_ritual_failure_adds_void() {
        let (void, reasons) =
            parse_void_triggers("The circle gutters out.", "perform a ritual of warding", OutcomeTier::Failure);
        assert_eq!(void, 1);
        assert_eq!(reasons, vec!["Failed ritual".to_string()]);
    }

    #[test]
    fn test_grounding_success_reduces_void() {
        let action = ActionContext {
            intent: "ground and center myself".to_string(),
            ..Default::default()
        };
        let out = parse_state_changes(
            "You breathe out and the static recedes.",
            &action,
            OutcomeTier::Moderate,
            6,
            &BTreeMap::new(),
        );
        assert_eq!(out.void_change, -1);
        assert!(out.notes.iter().any(|n| n.contains("Grounding")));
    }

    #[test]
    fn test_purge_is_note_not_delta() {
        let action = ActionContext {
            intent: "purge the corruption from the vents".to_string(),
            ..Default::default()
        };
        let out = parse_state_changes(
            "The filters hum as the haze clears.",
            &action,
            OutcomeTier::Good,
            11,
            &BTreeMap::new(),
        );
        assert_eq!(out.void_change, 0);
        assert!(out.notes.iter().any(|n| n.contains("Purge")));
    }

    #[test]
    fn test_cleansing_redirects_void_target() {
        let action = ActionContext {
            intent: "cleanse the void from Zara".to_string(),
            is_ritual: true,
            target_character: Some("Zara Nightwhisper".to_string()),
        };
        let out = parse_state_changes(
            "You draw the corruption out of her. +1 void burned away.",
            &action,
            OutcomeTier::Good,
            10,
            &BTreeMap::new(),
        );
        assert_eq!(out.void_target_character.as_deref(), Some("Zara Nightwhisper"));
    }

    #[test]
    fn test_soulcredit_marker() {
        let (delta, reason) = parse_soulcredit_markers("⚖️ Soulcredit: -2 (created Hollow Seed)");
        assert_eq!(delta, -2);
        assert_eq!(reason, "created Hollow Seed");
    }

    #[test]
    fn test_condition_extraction() {
        let action = ActionContext::default();
        let out = parse_state_changes(
            "A splitting pain blooms behind your eyes and the scanner cracks.",
            &action,
            OutcomeTier::Failure,
            -3,
            &BTreeMap::new(),
        );
        let names: Vec<&str> = out.conditions.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"Mental Strain"));
        assert!(names.contains(&"Equipment Damage"));
    }

    #[test]
    fn test_token_marker_bonus() {
        let conditions = parse_condition_markers("🏔️ Token Claimed: High Ground (+2 ranged)");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].penalty, -2);
        assert!(conditions[0].name.contains("High Ground"));
    }

    #[test]
    fn test_position_priority_chain() {
        // Explicit narration marker wins.
        assert_eq!(
            parse_position_change("[POSITION: Engaged] she closes in", "[TARGET_POSITION: Far-PC]"),
            Some("Engaged".to_string())
        );
        // Then the declared target position.
        assert_eq!(
            parse_position_change("she closes in", "[TARGET_POSITION: Far-PC]"),
            Some("Far-PC".to_string())
        );
        // Then prose movement.
        assert_eq!(
            parse_position_change("Kael moves from near-pc to far-pc under fire", ""),
            Some("Far-PC".to_string())
        );
        assert_eq!(parse_position_change("Kael holds position", ""), None);
    }

    #[test]
    fn test_combat_triplet() {
        let data = parse_combat_triplet("Attack: 24 vs DC 18. Damage: 9 → Soak: 3 → Final: 6");
        assert_eq!(data.attack_hit, Some(true));
        assert_eq!(data.post_soak_damage, Some(6));

        let simple = parse_combat_triplet("The raider takes 4 damage and staggers.");
        assert_eq!(simple.post_soak_damage, Some(4));
    }

    #[test]
    fn test_fallback_effect_only_on_success() {
        assert!(generate_fallback_effect("tgt_ab12", 6, -3, 10).is_none());
        let effect = generate_fallback_effect("tgt_ab12", 6, 10, 10).unwrap();
        assert_eq!(effect.effect_type, "damage");
        assert_eq!(effect.source, "fallback");
        assert!(effect.final_damage.unwrap() >= 1);
    }

    #[test]
    fn test_fallback_buff_heal_vs_support() {
        match generate_fallback_buff("Mira", "patch up Mira's wounds", 10).unwrap() {
            FallbackBuff::Heal { amount, .. } => assert_eq!(amount, 5),
            other => panic!("expected heal, got {:?}", other),
        }
        match generate_fallback_buff("Mira", "call out firing solutions for Mira", 4).unwrap() {
            FallbackBuff::Buff { bonus, duration, .. } => {
                assert_eq!(bonus, 2);
                assert_eq!(duration, 2);
            }
            other => panic!("expected buff, got {:?}", other),
        }
    }
}

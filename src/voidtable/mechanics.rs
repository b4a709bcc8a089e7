//! Mechanical resolution core.
//!
//! Implements the dice-resolved rules the Director adjudicates with:
//! attribute × skill + d20 against a difficulty, outcome tiers by margin,
//! ritual requirements, the Void corruption economy with multi-level caps,
//! the Soulcredit reputation ledger, scene clocks with batched updates and
//! expiration, conditions, and initiative.
//!
//! The engine is deterministic apart from its [`DiceRoller`]; given a seeded
//! roller every resolution replays identically.
//!
//! # Resolution formula
//!
//! ```text
//! skilled:   total = attribute × skill + d20 + Σ modifiers
//! unskilled: total = attribute + d20 − 5 + Σ modifiers
//! margin    = total − difficulty
//! ```
//!
//! Margin selects one of seven outcome tiers; see [`OutcomeTier::from_margin`].
//!
//! # Clock batching
//!
//! Clock deltas produced while resolving actions are never applied directly.
//! They are queued via [`MechanicsEngine::queue_clock_update`] and flushed in
//! one aggregated pass by [`MechanicsEngine::apply_queued_clock_updates`]
//! during synthesis, so two +3 nudges in the same round fill a 4-tick clock
//! once, not twice.

use crate::voidtable::dice::DiceRoller;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// The eight character attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Strength,
    Agility,
    Endurance,
    Perception,
    Intelligence,
    Empathy,
    Willpower,
    Charisma,
}

impl Attribute {
    pub const ALL: [Attribute; 8] = [
        Attribute::Strength,
        Attribute::Agility,
        Attribute::Endurance,
        Attribute::Perception,
        Attribute::Intelligence,
        Attribute::Empathy,
        Attribute::Willpower,
        Attribute::Charisma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Strength => "Strength",
            Attribute::Agility => "Agility",
            Attribute::Endurance => "Endurance",
            Attribute::Perception => "Perception",
            Attribute::Intelligence => "Intelligence",
            Attribute::Empathy => "Empathy",
            Attribute::Willpower => "Willpower",
            Attribute::Charisma => "Charisma",
        }
    }

    pub fn parse(s: &str) -> Option<Attribute> {
        Attribute::ALL
            .iter()
            .copied()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared action categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Explore,
    Investigate,
    Ritual,
    Social,
    Combat,
    Technical,
    Perception,
    Custom,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Explore => "explore",
            ActionType::Investigate => "investigate",
            ActionType::Ritual => "ritual",
            ActionType::Social => "social",
            ActionType::Combat => "combat",
            ActionType::Technical => "technical",
            ActionType::Perception => "perception",
            ActionType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<ActionType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "explore" => Some(ActionType::Explore),
            "investigate" => Some(ActionType::Investigate),
            "ritual" => Some(ActionType::Ritual),
            "social" => Some(ActionType::Social),
            "combat" => Some(ActionType::Combat),
            "technical" => Some(ActionType::Technical),
            "perception" | "sensing" => Some(ActionType::Perception),
            "custom" => Some(ActionType::Custom),
            _ => None,
        }
    }
}

/// Outcome quality tiers, selected by margin of success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTier {
    CriticalFailure,
    Failure,
    Marginal,
    Moderate,
    Good,
    Excellent,
    Exceptional,
}

impl OutcomeTier {
    /// Tier from `total − difficulty`.
    pub fn from_margin(margin: i32) -> OutcomeTier {
        if margin <= -20 {
            OutcomeTier::CriticalFailure
        } else if margin < 0 {
            OutcomeTier::Failure
        } else if margin < 5 {
            OutcomeTier::Marginal
        } else if margin < 10 {
            OutcomeTier::Moderate
        } else if margin < 15 {
            OutcomeTier::Good
        } else if margin < 20 {
            OutcomeTier::Excellent
        } else {
            OutcomeTier::Exceptional
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, OutcomeTier::CriticalFailure | OutcomeTier::Failure)
    }

    /// One step worse, floor-clamped at Marginal while still a success.
    /// Used by the ritual offering rule.
    pub fn downgraded(&self) -> OutcomeTier {
        match self {
            OutcomeTier::Exceptional => OutcomeTier::Excellent,
            OutcomeTier::Excellent => OutcomeTier::Good,
            OutcomeTier::Good => OutcomeTier::Moderate,
            OutcomeTier::Moderate => OutcomeTier::Marginal,
            other => *other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeTier::CriticalFailure => "critical_failure",
            OutcomeTier::Failure => "failure",
            OutcomeTier::Marginal => "marginal",
            OutcomeTier::Moderate => "moderate",
            OutcomeTier::Good => "good",
            OutcomeTier::Excellent => "excellent",
            OutcomeTier::Exceptional => "exceptional",
        }
    }
}

impl fmt::Display for OutcomeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard difficulty ladder. Routine pressured checks sit at 18-22; 26+ is
/// reserved for extreme, multi-stage actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Trivial,
    Easy,
    Routine,
    Moderate,
    Challenging,
    Difficult,
    VeryDifficult,
    Formidable,
    Legendary,
}

impl Difficulty {
    pub fn value(&self) -> i32 {
        match self {
            Difficulty::Trivial => 10,
            Difficulty::Easy => 15,
            Difficulty::Routine => 18,
            Difficulty::Moderate => 20,
            Difficulty::Challenging => 22,
            Difficulty::Difficult => 26,
            Difficulty::VeryDifficult => 30,
            Difficulty::Formidable => 35,
            Difficulty::Legendary => 40,
        }
    }
}

/// A status condition affecting a character's rolls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub condition_type: String,
    /// Signed modifier applied to affected rolls (penalties are negative).
    pub penalty: i32,
    pub description: String,
    /// Rounds remaining; `-1` means until resolved.
    pub duration: i32,
    /// Attribute/skill names this condition applies to. Empty ⇒ everything.
    pub affects: Vec<String>,
}

impl Condition {
    pub fn applies_to(&self, attribute: Attribute, skill: Option<&str>) -> bool {
        if self.affects.is_empty() {
            return true;
        }
        if self.affects.iter().any(|a| a == attribute.as_str()) {
            return true;
        }
        if let Some(skill) = skill {
            if self.affects.iter().any(|a| a == skill) {
                return true;
            }
        }
        false
    }
}

/// Result of a resolved action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResolution {
    pub intent: String,
    pub attribute: Attribute,
    pub skill: Option<String>,
    pub attribute_value: i32,
    pub skill_value: i32,
    /// The d20 result.
    pub roll: i32,
    pub total: i32,
    pub difficulty: i32,
    pub margin: i32,
    pub outcome_tier: OutcomeTier,
    pub success: bool,
    /// Brief mechanical narrative stub; the Director layers prose on top.
    pub narrative: String,
}

impl ActionResolution {
    /// The pre-d20 ability score (attribute × skill, or attribute − 5).
    pub fn ability(&self) -> i32 {
        if self.skill.is_some() && self.skill_value > 0 {
            self.attribute_value * self.skill_value
        } else {
            self.attribute_value - 5
        }
    }
}

/// How an expiring clock leaves the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationKind {
    /// Under half full at timeout: danger passed, opportunity lost.
    CrisisAverted,
    /// Filled: consequences fire, then the clock is removed.
    ForceResolve,
    /// Mid-range at timeout: the stalemate breaks one way or the other.
    Escalate,
}

impl ExpirationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirationKind::CrisisAverted => "crisis_averted",
            ExpirationKind::ForceResolve => "force_resolve",
            ExpirationKind::Escalate => "escalate",
        }
    }
}

/// Progress clock with semantic guidance for the Director.
///
/// `current` may overflow past `maximum` to signal growing urgency; it only
/// drops below zero when `allow_negative` is set. Once filled, `ever_filled`
/// latches true for one-time triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneClock {
    pub name: String,
    pub current: i32,
    pub maximum: i32,
    pub description: String,
    /// What advancing means (e.g. "hunters close in").
    pub advance_means: String,
    /// What regressing means (e.g. "pursuit misled").
    pub regress_means: String,
    /// What happens when the clock fills (may embed control markers).
    pub filled_consequence: String,
    /// Rounds until the clock expires off the board.
    pub timeout_rounds: u32,
    /// Bidirectional trackers may go down to `-maximum`.
    pub allow_negative: bool,
    ever_filled: bool,
    rounds_alive: u32,
}

/// Auto-assign a timeout from the maximum so clocks don't all expire at once.
fn default_timeout_for(maximum: i32) -> u32 {
    if maximum <= 4 {
        4
    } else if maximum <= 6 {
        6
    } else if maximum <= 8 {
        7
    } else {
        8
    }
}

impl SceneClock {
    pub fn new(name: impl Into<String>, maximum: i32) -> Self {
        let maximum = maximum.max(1);
        Self {
            name: name.into(),
            current: 0,
            maximum,
            description: String::new(),
            advance_means: String::new(),
            regress_means: String::new(),
            filled_consequence: String::new(),
            timeout_rounds: default_timeout_for(maximum),
            allow_negative: false,
            ever_filled: false,
            rounds_alive: 0,
        }
    }

    /// Advance, allowing overflow. Returns true when at or above maximum.
    pub fn advance(&mut self, ticks: i32) -> bool {
        self.current += ticks.max(0);
        if self.filled() {
            self.ever_filled = true;
            true
        } else {
            false
        }
    }

    /// Regress, clamped at 0 unless `allow_negative` (then at `-maximum`).
    pub fn regress(&mut self, ticks: i32) {
        let ticks = ticks.max(0);
        let floor = if self.allow_negative { -self.maximum } else { 0 };
        let next = (self.current - ticks).max(floor);
        if next == 0 && self.current > 0 && !self.allow_negative && self.current - ticks < 0 {
            debug!("clock {} regressed to 0 (clamped)", self.name);
        }
        self.current = next;
    }

    pub fn filled(&self) -> bool {
        self.current >= self.maximum
    }

    pub fn ever_filled(&self) -> bool {
        self.ever_filled
    }

    pub fn overflow(&self) -> i32 {
        (self.current - self.maximum).max(0)
    }

    pub fn rounds_alive(&self) -> u32 {
        self.rounds_alive
    }

    pub fn increment_round(&mut self) {
        self.rounds_alive += 1;
    }

    pub fn is_expired(&self) -> bool {
        self.rounds_alive >= self.timeout_rounds
    }

    pub fn expiration_kind(&self) -> ExpirationKind {
        if self.filled() {
            ExpirationKind::ForceResolve
        } else if (self.current as f64) < (self.maximum as f64) * 0.5 {
            ExpirationKind::CrisisAverted
        } else {
            ExpirationKind::Escalate
        }
    }

    pub fn progress_label(&self) -> String {
        format!("{}/{}", self.current, self.maximum)
    }
}

/// One entry in a void or soulcredit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerChange {
    pub change: i32,
    pub reason: String,
    pub old_score: i32,
    pub new_score: i32,
    #[serde(default)]
    pub high_risk: bool,
}

/// Per-character Void corruption with multi-level caps.
///
/// Caps: +1 per action, +2 per round, +3 per scene — the scene cap is only
/// bypassed when an add is flagged high-risk. Adds carrying an already-seen
/// action id are ignored so the ritual path and the outcome parser cannot
/// double-count the same action.
#[derive(Debug, Clone, Default)]
pub struct VoidState {
    pub score: i32,
    pub history: Vec<LedgerChange>,
    processed_actions: HashSet<String>,
    round_gain: i32,
    scene_gain: i32,
    opted_high_risk: bool,
}

impl VoidState {
    const MAX_SCORE: i32 = 10;
    const ROUND_CAP: i32 = 2;
    const SCENE_CAP: i32 = 3;

    /// Add corruption under the caps; returns the new score.
    pub fn add_void(
        &mut self,
        amount: i32,
        reason: &str,
        action_id: Option<&str>,
        high_risk: bool,
    ) -> i32 {
        if let Some(id) = action_id {
            if self.processed_actions.contains(id) {
                debug!("skipping duplicate void add for action {}", id);
                return self.score;
            }
        }

        let capped = amount.min(1);
        if self.round_gain >= Self::ROUND_CAP && !high_risk {
            info!("round void cap reached (+{}/{})", self.round_gain, Self::ROUND_CAP);
            return self.score;
        }
        if self.scene_gain >= Self::SCENE_CAP && !high_risk {
            warn!(
                "scene void cap reached (+{}/{} automatic)",
                self.scene_gain,
                Self::SCENE_CAP
            );
            return self.score;
        }

        let remaining_round = Self::ROUND_CAP - self.round_gain;
        let remaining_scene = if high_risk {
            Self::MAX_SCORE
        } else {
            Self::SCENE_CAP - self.scene_gain
        };
        let actual = capped.min(remaining_round).min(remaining_scene);
        if actual <= 0 {
            return self.score;
        }

        self.round_gain += actual;
        self.scene_gain += actual;
        if high_risk {
            self.opted_high_risk = true;
        }

        let old = self.score;
        self.score = (self.score + actual).min(Self::MAX_SCORE);
        self.history.push(LedgerChange {
            change: actual,
            reason: reason.to_string(),
            old_score: old,
            new_score: self.score,
            high_risk,
        });
        if let Some(id) = action_id {
            self.processed_actions.insert(id.to_string());
        }
        info!(
            "void added: +{} (requested {}, round {}/{}, scene {}/{})",
            actual,
            amount,
            self.round_gain,
            Self::ROUND_CAP,
            self.scene_gain,
            Self::SCENE_CAP
        );
        self.score
    }

    /// Reduce corruption (grounding, cleansing); returns the new score.
    pub fn reduce_void(&mut self, amount: i32, reason: &str) -> i32 {
        let old = self.score;
        self.score = (self.score - amount.max(0)).max(0);
        self.history.push(LedgerChange {
            change: self.score - old,
            reason: reason.to_string(),
            old_score: old,
            new_score: self.score,
            high_risk: false,
        });
        self.score
    }

    /// Call at the start of each round.
    pub fn reset_round_void(&mut self) {
        self.round_gain = 0;
    }

    /// Call at scene boundaries (story advancement).
    pub fn reset_scene_void(&mut self) {
        self.scene_gain = 0;
        self.opted_high_risk = false;
    }

    pub fn has_processed(&self, action_id: &str) -> bool {
        self.processed_actions.contains(action_id)
    }

    pub fn corruption_level(&self) -> &'static str {
        match self.score {
            0 => "Pure",
            1..=2 => "Touched",
            3..=4 => "Shadowed",
            5..=6 => "Corrupted",
            7..=8 => "Consumed",
            _ => "Lost to Void",
        }
    }
}

/// Per-character Soulcredit: spiritual reputation clamped to [-10, +10].
#[derive(Debug, Clone, Default)]
pub struct SoulcreditState {
    pub score: i32,
    pub history: Vec<LedgerChange>,
}

impl SoulcreditState {
    pub fn with_score(score: i32) -> Self {
        Self {
            score: score.clamp(-10, 10),
            history: Vec::new(),
        }
    }

    /// Adjust and clamp; only records history when the score actually moves.
    pub fn adjust(&mut self, amount: i32, reason: &str) -> i32 {
        let old = self.score;
        self.score = (self.score + amount).clamp(-10, 10);
        if self.score != old {
            self.history.push(LedgerChange {
                change: self.score - old,
                reason: reason.to_string(),
                old_score: old,
                new_score: self.score,
                high_risk: false,
            });
            info!("soulcredit: {} -> {} ({})", old, self.score, reason);
        }
        self.score
    }

    pub fn reputation_level(&self) -> &'static str {
        match self.score {
            8..=10 => "Exemplary",
            5..=7 => "Honorable",
            2..=4 => "Trustworthy",
            -1..=1 => "Neutral",
            -4..=-2 => "Questionable",
            -7..=-5 => "Disreputable",
            _ => "Pariah",
        }
    }
}

/// Outcome of the ritual resolution path.
#[derive(Debug, Clone)]
pub struct RitualOutcome {
    pub resolution: ActionResolution,
    /// Void the outcome parser should apply for this action id. Not applied
    /// here — the parser owns void application so the same action id cannot
    /// be charged twice.
    pub void_change: i32,
    pub soulcredit_change: i32,
    pub consequences: Vec<String>,
}

/// Aggregated result of one flushed clock.
#[derive(Debug, Clone, Serialize)]
pub struct ClockDelta {
    pub before: i32,
    pub after: i32,
    pub maximum: i32,
    pub reasons: Vec<String>,
    pub direction: &'static str,
    pub filled: bool,
}

/// A clock leaving the board, for the Director to narrate.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiredClock {
    pub clock_name: String,
    pub expiration_kind: ExpirationKind,
    pub current: i32,
    pub maximum: i32,
    pub description: String,
    pub advance_means: String,
    pub regress_means: String,
    pub filled_consequence: String,
    /// `"filled"` or `"timeout"`.
    pub removal_reason: &'static str,
}

/// A clock that filled this round (before expiry processing).
#[derive(Debug, Clone, Serialize)]
pub struct FilledClock {
    pub clock_name: String,
    pub reason: String,
}

/// Parameters for creating a scene clock.
#[derive(Debug, Clone, Default)]
pub struct ClockSpec {
    pub name: String,
    pub maximum: i32,
    pub description: String,
    pub advance_means: String,
    pub regress_means: String,
    pub filled_consequence: String,
    pub timeout_rounds: Option<u32>,
    pub allow_negative: bool,
}

lazy_static::lazy_static! {
    /// Faction tenets the soulcredit engine rewards upholding at cost.
    static ref FACTION_TENETS: HashMap<&'static str, Vec<&'static str>> = {
        let mut m = HashMap::new();
        m.insert("ACG", vec!["enforce debt", "uphold debt law", "collect debt fairly", "enforce contract"]);
        m.insert("Pantheon", vec!["uphold law", "enforce order", "maintain civic", "protect citizens"]);
        m.insert("Tempest", vec!["resist commodification", "maintain autonomy", "refuse contract", "preserve freedom"]);
        m.insert("Communes", vec!["community ritual", "mutual aid", "share resources", "collective ritual"]);
        m
    };

    /// Faction tenets whose violation costs soulcredit.
    static ref FACTION_VIOLATIONS: HashMap<&'static str, Vec<&'static str>> = {
        let mut m = HashMap::new();
        m.insert("ACG", vec!["forgive debt", "waive contract", "ignore debt law"]);
        m.insert("Pantheon", vec!["break law", "corrupt official", "abuse authority"]);
        m.insert("Tempest", vec!["commodify ritual", "sell ritual", "commercialize magic"]);
        m.insert("Communes", vec!["hoard resources", "refuse aid", "individual gain"]);
        m
    };
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

/// The rules engine. Owned by the orchestrator; the Director mutates it while
/// the orchestrator awaits that adjudication, so there is never overlapping
/// access.
pub struct MechanicsEngine {
    pub scene_clocks: BTreeMap<String, SceneClock>,
    pub void_states: BTreeMap<String, VoidState>,
    pub soulcredit_states: BTreeMap<String, SoulcreditState>,
    pub action_history: Vec<ActionResolution>,
    pub conditions: BTreeMap<String, Vec<Condition>>,
    /// Environmental void pressure (0-10); raises DCs at 4+ and 7+.
    pub scene_void_level: i32,
    pub current_round: u32,
    dice: DiceRoller,
    last_clock_increment_round: Option<u32>,
    clock_update_queue: Vec<(String, i32, String)>,
    filled_this_round: Vec<FilledClock>,
}

impl MechanicsEngine {
    pub fn new(dice: DiceRoller) -> Self {
        Self {
            scene_clocks: BTreeMap::new(),
            void_states: BTreeMap::new(),
            soulcredit_states: BTreeMap::new(),
            action_history: Vec::new(),
            conditions: BTreeMap::new(),
            scene_void_level: 0,
            current_round: 0,
            dice,
            last_clock_increment_round: None,
            clock_update_queue: Vec::new(),
            filled_this_round: Vec::new(),
        }
    }

    pub fn dice(&self) -> &DiceRoller {
        &self.dice
    }

    // ---- Difficulty ----

    /// Calculate the DC for an action from its context. Clamped to [10, 40].
    pub fn calculate_dc(
        &self,
        intent: &str,
        action_type: ActionType,
        is_ritual: bool,
        is_extreme: bool,
        is_multi_stage: bool,
        is_inter_party: bool,
    ) -> i32 {
        let intent_lower = intent.to_lowercase();

        let mut dc = if is_inter_party && action_type == ActionType::Social {
            let complicated = contains_any(
                &intent_lower,
                &["shout", "scream", "distant", "far away", "across", "noise", "chaos", "combat"],
            );
            if complicated {
                Difficulty::Routine.value()
            } else {
                Difficulty::Trivial.value()
            }
        } else if is_ritual {
            Difficulty::Challenging.value()
        } else {
            match action_type {
                ActionType::Combat => Difficulty::Routine.value(),
                ActionType::Social => Difficulty::Routine.value(),
                ActionType::Perception | ActionType::Investigate => Difficulty::Moderate.value(),
                ActionType::Technical => Difficulty::Moderate.value(),
                _ => Difficulty::Routine.value(),
            }
        };

        if is_extreme || is_multi_stage {
            dc = dc.max(Difficulty::Difficult.value());
        }

        if self.scene_void_level >= 7 {
            dc += 4;
        } else if self.scene_void_level >= 4 {
            dc += 2;
        }

        dc.clamp(10, 40)
    }

    // ---- Resolution ----

    /// Resolve an action: attribute × skill + d20 vs difficulty.
    ///
    /// Active conditions whose `affects` list is empty or names the rolled
    /// (attribute, skill) are merged into the modifier set. The arithmetic is
    /// re-verified with assertions; a mismatch is an engine bug and panics.
    pub fn resolve_action(
        &mut self,
        intent: &str,
        attribute: Attribute,
        skill: Option<&str>,
        attribute_value: i32,
        skill_value: i32,
        difficulty: i32,
        modifiers: Option<BTreeMap<String, i32>>,
        agent_id: Option<&str>,
    ) -> ActionResolution {
        let mut modifiers = modifiers.unwrap_or_default();

        if let Some(agent_id) = agent_id {
            if let Some(conditions) = self.conditions.get(agent_id) {
                for condition in conditions {
                    if condition.applies_to(attribute, skill) {
                        modifiers.insert(condition.name.clone(), condition.penalty);
                        debug!("applied condition {}: {}", condition.name, condition.penalty);
                    }
                }
            }
        }

        let roll = self.dice.d20();

        let skilled = skill.is_some() && skill_value > 0;
        let (ability, base_total) = if skilled {
            let ability = attribute_value * skill_value;
            (ability, ability + roll)
        } else {
            let ability = attribute_value - 5;
            (ability, attribute_value + roll - 5)
        };
        assert_eq!(
            base_total,
            ability + roll,
            "resolution math error: ability {} + d20 {}",
            ability,
            roll
        );

        let modifier_sum: i32 = modifiers.values().sum();
        let total = base_total + modifier_sum;
        assert_eq!(
            total,
            base_total + modifier_sum,
            "modifier application error: base {} + mods {}",
            base_total,
            modifier_sum
        );

        let margin = total - difficulty;
        let outcome_tier = OutcomeTier::from_margin(margin);
        let success = margin >= 0;

        let narrative = Self::narrative_stub(intent, outcome_tier, margin);
        let resolution = ActionResolution {
            intent: intent.to_string(),
            attribute,
            skill: if skilled { skill.map(str::to_string) } else { None },
            attribute_value,
            skill_value: if skilled { skill_value } else { 0 },
            roll,
            total,
            difficulty,
            margin,
            outcome_tier,
            success,
            narrative,
        };
        self.action_history.push(resolution.clone());
        resolution
    }

    fn narrative_stub(intent: &str, tier: OutcomeTier, margin: i32) -> String {
        let verb = match tier {
            OutcomeTier::CriticalFailure => "catastrophically fails",
            OutcomeTier::Failure => "fails",
            OutcomeTier::Marginal => "barely succeeds",
            OutcomeTier::Moderate => "succeeds adequately",
            OutcomeTier::Good => "succeeds well",
            OutcomeTier::Excellent => "succeeds excellently",
            OutcomeTier::Exceptional => "achieves exceptional success",
        };
        format!("{} {} (margin: {:+})", intent, verb, margin)
    }

    /// Resolve a ritual: forced Willpower × Astral Arts with tool, altar, and
    /// offering modifiers.
    ///
    /// Missing tool: +1 Void. Missing offering: +1 Void and, on success, the
    /// tier is downgraded one step (floor-clamped at Marginal). Failure adds
    /// +1 Void and critical failure a further +1. The void total is returned
    /// in the outcome for the parser to apply, never applied here.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve_ritual(
        &mut self,
        intent: &str,
        willpower: i32,
        astral_arts: i32,
        difficulty: i32,
        has_primary_tool: bool,
        has_offering: bool,
        sanctified_altar: bool,
        agent_id: Option<&str>,
        faction: Option<&str>,
    ) -> RitualOutcome {
        let mut modifiers = BTreeMap::new();
        let mut void_change = 0;
        let mut consequences = Vec::new();
        let mut downgrade_on_success = false;

        if has_primary_tool {
            modifiers.insert("primary_tool".to_string(), 2);
        } else {
            void_change += 1;
            consequences.push("Missing ritual focus (+1 Void)".to_string());
        }

        if sanctified_altar {
            modifiers.insert("sanctified_altar".to_string(), 3);
            consequences.push("Sanctified altar (+3)".to_string());
        }

        if has_offering {
            modifiers.insert("offering".to_string(), 1);
            consequences.push("Offering consumed (+1)".to_string());
        } else {
            void_change += 1;
            downgrade_on_success = true;
            consequences.push("No offering: +1 Void, tier downgraded".to_string());
        }

        let mut resolution = self.resolve_action(
            intent,
            Attribute::Willpower,
            Some("Astral Arts"),
            willpower,
            astral_arts,
            difficulty,
            Some(modifiers),
            agent_id,
        );

        if downgrade_on_success && resolution.success {
            let old = resolution.outcome_tier;
            resolution.outcome_tier = old.downgraded();
            if resolution.outcome_tier != old {
                consequences.push(format!(
                    "Tier downgraded: {} -> {}",
                    old, resolution.outcome_tier
                ));
            }
            if let Some(last) = self.action_history.last_mut() {
                last.outcome_tier = resolution.outcome_tier;
            }
        }

        if !resolution.success {
            void_change += 1;
            consequences.push("Failed ritual: +1 Void".to_string());
            if resolution.outcome_tier == OutcomeTier::CriticalFailure {
                void_change += 1;
                consequences.push("Critical failure backlash: +1 Void".to_string());
            }
        }

        let (soulcredit_change, sc_reasons) = self.calculate_soulcredit_change(
            &resolution,
            true,
            has_offering,
            faction,
            intent,
            "",
        );
        consequences.extend(sc_reasons);

        RitualOutcome {
            resolution,
            void_change,
            soulcredit_change,
            consequences,
        }
    }

    // ---- Soulcredit rules ----

    /// Scan intent + narration for reputation-affecting behavior.
    ///
    /// Soulcredit tracks spiritual standing — contracts, oaths, faction
    /// tenets, cleansing — not ritual quality. Returns the signed delta and
    /// human-readable reasons.
    pub fn calculate_soulcredit_change(
        &self,
        resolution: &ActionResolution,
        is_ritual: bool,
        has_offering: bool,
        faction: Option<&str>,
        action_intent: &str,
        action_narration: &str,
    ) -> (i32, Vec<String>) {
        let mut delta = 0;
        let mut reasons = Vec::new();
        let text = format!("{} {}", action_intent, action_narration).to_lowercase();

        // Gains.
        if contains_any(
            &text,
            &["fulfill contract", "fulfill oath", "complete contract", "honor oath", "uphold contract", "fulfill agreement"],
        ) && resolution.success
        {
            delta += 1;
            reasons.push("Fulfilled ritual contract/oath (+1 SC)".to_string());
        }

        if contains_any(
            &text,
            &["aid ritual", "help ritual", "assist ritual", "support ritual", "join ritual"],
        ) && has_offering
            && resolution.success
        {
            delta += 1;
            reasons.push("Aided another's ritual with offering (+1 SC)".to_string());
        }

        if contains_any(
            &text,
            &["cleanse void", "purify void", "remove void", "void cleansing", "spiritual cleansing"],
        ) && resolution.success
        {
            let bonus = if resolution.margin >= 10 { 3 } else { 2 };
            delta += bonus;
            reasons.push(format!("Void cleansing ritual (+{} SC)", bonus));
        }

        if contains_any(&text, &["public ritual", "witnessed ritual", "ceremonial ritual"])
            && resolution.success
            && resolution.margin >= 5
        {
            delta += 2;
            reasons.push("Public ritual aligned with principles (+2 SC)".to_string());
        }

        if let Some(faction) = faction {
            if let Some(tenets) = FACTION_TENETS.get(faction) {
                if contains_any(&text, tenets)
                    && resolution.success
                    && (text.contains("at cost") || text.contains("sacrifice"))
                {
                    delta += 1;
                    reasons.push(format!("Upheld {} tenets at personal cost (+1 SC)", faction));
                }
            }
        }

        if is_ritual
            && resolution.success
            && resolution.margin >= 10
            && !reasons
                .iter()
                .any(|r| r.contains("cleansing") || r.contains("Public ritual"))
        {
            delta += 1;
            reasons.push("Ritual success with strong resonance (+1 SC)".to_string());
        }

        // Losses.
        if contains_any(
            &text,
            &["break contract", "break oath", "violate contract", "betray bond", "default on oath", "abandon contract"],
        ) {
            delta -= 2;
            reasons.push("Broke ritual contract/oath (-2 SC)".to_string());
        }

        if contains_any(
            &text,
            &["refuse debt", "default on debt", "dodge debt", "evade payment", "skip payment"],
        ) {
            delta -= 2;
            reasons.push("Defaulted on ritual debt (-2 SC)".to_string());
        }

        if contains_any(
            &text,
            &["betray principle", "violate principle", "abandon belief", "contradict guiding"],
        ) {
            delta -= 3;
            reasons.push("Betrayed guiding principle (-3 SC)".to_string());
        }

        if let Some(faction) = faction {
            if let Some(violations) = FACTION_VIOLATIONS.get(faction) {
                if contains_any(&text, violations) {
                    delta -= 2;
                    reasons.push(format!("Contradicted {} tenets (-2 SC)", faction));
                }
            }
        }

        if is_ritual
            && !resolution.success
            && contains_any(&text, &["unprepared", "no offering", "rushed", "careless", "negligent"])
        {
            delta -= 1;
            reasons.push("Ritual failure from negligence (-1 SC)".to_string());
        }

        (delta, reasons)
    }

    // ---- Ledger accessors ----

    pub fn void_state(&mut self, agent_id: &str) -> &mut VoidState {
        self.void_states.entry(agent_id.to_string()).or_default()
    }

    pub fn soulcredit_state(&mut self, agent_id: &str, initial_score: i32) -> &mut SoulcreditState {
        self.soulcredit_states
            .entry(agent_id.to_string())
            .or_insert_with(|| SoulcreditState::with_score(initial_score))
    }

    // ---- Clocks ----

    /// Create and register a clock. Name collisions replace the old clock.
    pub fn create_scene_clock(&mut self, spec: ClockSpec) -> &SceneClock {
        let maximum = spec.maximum.max(1);
        let timeout_rounds = spec.timeout_rounds.unwrap_or_else(|| {
            let t = default_timeout_for(maximum);
            info!("clock {} auto-assigned timeout: {} rounds (max={})", spec.name, t, maximum);
            t
        });
        let name = spec.name.clone();
        let clock = SceneClock {
            name: spec.name,
            current: 0,
            maximum,
            description: spec.description,
            advance_means: spec.advance_means,
            regress_means: spec.regress_means,
            filled_consequence: spec.filled_consequence,
            timeout_rounds,
            allow_negative: spec.allow_negative,
            ever_filled: false,
            rounds_alive: 0,
        };
        self.scene_clocks.insert(name.clone(), clock);
        &self.scene_clocks[&name]
    }

    /// Queue a clock delta for the synthesis flush. Positive ticks advance,
    /// negative regress.
    pub fn queue_clock_update(&mut self, clock_name: &str, ticks: i32, reason: &str) {
        debug!("queued clock update: {} {:+} ({})", clock_name, ticks, reason);
        self.clock_update_queue
            .push((clock_name.to_string(), ticks, reason.to_string()));
    }

    pub fn queued_update_count(&self) -> usize {
        self.clock_update_queue.len()
    }

    /// Flush the queue: aggregate per clock, apply a single signed change,
    /// then record fills. Returns the per-clock before/after deltas.
    pub fn apply_queued_clock_updates(&mut self) -> BTreeMap<String, ClockDelta> {
        if self.clock_update_queue.is_empty() {
            return BTreeMap::new();
        }

        let mut aggregated: BTreeMap<String, (i32, Vec<String>)> = BTreeMap::new();
        for (name, ticks, reason) in self.clock_update_queue.drain(..) {
            let entry = aggregated.entry(name).or_insert_with(|| (0, Vec::new()));
            entry.0 += ticks;
            entry.1.push(reason);
        }

        let mut deltas = BTreeMap::new();
        for (name, (total_ticks, reasons)) in aggregated {
            let Some(clock) = self.scene_clocks.get_mut(&name) else {
                warn!("queued update for unknown clock {}", name);
                continue;
            };
            let before = clock.current;
            let maximum = clock.maximum;
            let was_filled = clock.filled();

            let direction = match total_ticks.cmp(&0) {
                std::cmp::Ordering::Greater => {
                    clock.advance(total_ticks);
                    "up"
                }
                std::cmp::Ordering::Less => {
                    clock.regress(-total_ticks);
                    "down"
                }
                std::cmp::Ordering::Equal => "flat",
            };
            let after = clock.current;
            let filled = clock.filled();

            if filled {
                let overflow = clock.overflow();
                if overflow >= 3 {
                    warn!("clock {} critical overflow: {}/{} (+{})", name, after, maximum, overflow);
                } else if overflow >= 1 {
                    warn!("clock {} overflowing: {}/{} (+{})", name, after, maximum, overflow);
                } else if !was_filled {
                    info!("clock {} filled: {}/{}", name, after, maximum);
                }
                if !was_filled {
                    self.filled_this_round.push(FilledClock {
                        clock_name: name.clone(),
                        reason: reasons.join(", "),
                    });
                }
            }

            info!(
                "clock {}: {}/{} -> {}/{} ({}: {})",
                name,
                before,
                maximum,
                after,
                maximum,
                direction,
                reasons.join(", ")
            );
            deltas.insert(
                name,
                ClockDelta {
                    before,
                    after,
                    maximum,
                    reasons,
                    direction,
                    filled,
                },
            );
        }
        deltas
    }

    /// Clocks that filled since the last call; clears the list.
    pub fn take_filled_clocks(&mut self) -> Vec<FilledClock> {
        std::mem::take(&mut self.filled_this_round)
    }

    /// Age every clock once per round (idempotent within a round).
    pub fn increment_all_clock_rounds(&mut self) {
        if self.last_clock_increment_round == Some(self.current_round) {
            debug!("clock rounds already incremented for round {}", self.current_round);
            return;
        }
        self.last_clock_increment_round = Some(self.current_round);
        info!("incrementing all clock rounds (game round {})", self.current_round);
        for clock in self.scene_clocks.values_mut() {
            clock.increment_round();
        }
    }

    /// Remove filled and timed-out clocks, returning their expiry records for
    /// the Director to narrate. Call after the queue flush during synthesis.
    pub fn check_and_expire_clocks(&mut self) -> Vec<ExpiredClock> {
        let mut expired = Vec::new();
        let mut to_remove = Vec::new();

        for (name, clock) in &self.scene_clocks {
            if clock.filled() {
                expired.push(ExpiredClock {
                    clock_name: name.clone(),
                    expiration_kind: ExpirationKind::ForceResolve,
                    current: clock.current,
                    maximum: clock.maximum,
                    description: clock.description.clone(),
                    advance_means: clock.advance_means.clone(),
                    regress_means: clock.regress_means.clone(),
                    filled_consequence: clock.filled_consequence.clone(),
                    removal_reason: "filled",
                });
                to_remove.push(name.clone());
                warn!("clock {} filled: {} - removing after consequences", name, clock.progress_label());
            } else if clock.is_expired() {
                expired.push(ExpiredClock {
                    clock_name: name.clone(),
                    expiration_kind: clock.expiration_kind(),
                    current: clock.current,
                    maximum: clock.maximum,
                    description: clock.description.clone(),
                    advance_means: clock.advance_means.clone(),
                    regress_means: clock.regress_means.clone(),
                    filled_consequence: clock.filled_consequence.clone(),
                    removal_reason: "timeout",
                });
                to_remove.push(name.clone());
                warn!(
                    "clock {} timed out after {} rounds ({})",
                    name,
                    clock.rounds_alive(),
                    clock.expiration_kind().as_str()
                );
            }
        }

        for name in to_remove {
            self.scene_clocks.remove(&name);
            info!("removed clock: {}", name);
        }
        expired
    }

    /// Remove every clock (story advancement clears the board).
    pub fn clear_all_clocks(&mut self) -> Vec<String> {
        let names: Vec<String> = self.scene_clocks.keys().cloned().collect();
        self.scene_clocks.clear();
        names
    }

    // ---- Initiative ----

    /// Initiative: Agility × 4 + d20.
    pub fn calculate_initiative(&self, agility: i32) -> i32 {
        agility * 4 + self.dice.d20()
    }

    // ---- Conditions ----

    /// Attach a condition; duplicate names are ignored.
    pub fn add_condition(&mut self, agent_id: &str, condition: Condition) {
        let list = self.conditions.entry(agent_id.to_string()).or_default();
        if list.iter().any(|c| c.name == condition.name) {
            debug!("condition {} already present for {}", condition.name, agent_id);
            return;
        }
        info!("applied condition to {}: {} ({:+})", agent_id, condition.name, condition.penalty);
        list.push(condition);
    }

    pub fn remove_condition(&mut self, agent_id: &str, condition_name: &str) {
        if let Some(list) = self.conditions.get_mut(agent_id) {
            list.retain(|c| c.name != condition_name);
        }
    }

    pub fn conditions_for(&self, agent_id: &str) -> &[Condition] {
        self.conditions
            .get(agent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Decrement timed conditions and drop the expired ones.
    pub fn tick_conditions(&mut self, agent_id: &str) {
        if let Some(list) = self.conditions.get_mut(agent_id) {
            for condition in list.iter_mut() {
                if condition.duration > 0 {
                    condition.duration -= 1;
                    if condition.duration == 0 {
                        info!("condition expired: {} for {}", condition.name, agent_id);
                    }
                }
            }
            list.retain(|c| c.duration != 0);
        }
    }

    // ---- Reporting ----

    /// Transparency block prepended to every narration: the full roll math.
    pub fn format_resolution(&self, resolution: &ActionResolution) -> String {
        let (roll_line, formula) = match &resolution.skill {
            Some(skill) if resolution.skill_value > 0 => (
                format!("{} × {}", resolution.attribute, skill),
                format!(
                    "{} × {} + d20({})",
                    resolution.attribute_value, resolution.skill_value, resolution.roll
                ),
            ),
            _ => (
                format!("{} (unskilled)", resolution.attribute),
                format!("{} + d20({}) - 5", resolution.attribute_value, resolution.roll),
            ),
        };
        let mark = if resolution.success { "✓" } else { "✗" };
        format!(
            "**{}**\nRoll: {}\nCalculation: {} = **{}**\nDC: {} | Margin: {:+} | Tier: **{}** {}\n{}",
            resolution.intent,
            roll_line,
            formula,
            resolution.total,
            resolution.difficulty,
            resolution.margin,
            resolution.outcome_tier.as_str().to_uppercase(),
            mark,
            resolution.narrative
        )
    }

    /// Serializable snapshot of all tracked state, for the session record.
    pub fn state_summary(&self) -> serde_json::Value {
        let clocks: serde_json::Map<String, serde_json::Value> = self
            .scene_clocks
            .iter()
            .map(|(name, clock)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "current": clock.current,
                        "maximum": clock.maximum,
                        "filled": clock.filled(),
                        "progress": clock.progress_label(),
                    }),
                )
            })
            .collect();

        let voids: serde_json::Map<String, serde_json::Value> = self
            .void_states
            .iter()
            .map(|(agent, state)| {
                (
                    agent.clone(),
                    serde_json::json!({
                        "score": state.score,
                        "level": state.corruption_level(),
                        "changes": state.history.len(),
                    }),
                )
            })
            .collect();

        let soulcredits: serde_json::Map<String, serde_json::Value> = self
            .soulcredit_states
            .iter()
            .map(|(agent, state)| {
                (
                    agent.clone(),
                    serde_json::json!({
                        "score": state.score,
                        "level": state.reputation_level(),
                    }),
                )
            })
            .collect();

        let recent: Vec<serde_json::Value> = self
            .action_history
            .iter()
            .rev()
            .take(5)
            .map(|a| {
                serde_json::json!({
                    "intent": a.intent,
                    "outcome": a.outcome_tier.as_str(),
                    "margin": a.margin,
                })
            })
            .collect();

        serde_json::json!({
            "scene_clocks": clocks,
            "void_states": voids,
            "soulcredit_states": soulcredits,
            "recent_actions": recent,
        })
    }
}

//! Structured action declarations and their validation.
//!
//! Agents never act through free prose alone: every turn produces an
//! [`ActionDeclaration`] carrying the mechanical fields the Director needs to
//! adjudicate. The [`ActionValidator`] enforces structure and, outside of
//! combat, rejects near-duplicate intents so agents don't loop on the same
//! move.

use crate::voidtable::mechanics::{ActionType, Attribute};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A structured statement of intent, produced before dice are rolled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDeclaration {
    /// Concise verb phrase describing what the character does.
    pub intent: String,
    /// 1-2 sentence narrative description.
    pub description: String,

    pub attribute: Attribute,
    /// Skill name, or `None` for a raw attribute check.
    pub skill: Option<String>,
    pub difficulty_estimate: i32,
    pub difficulty_justification: String,

    pub character_name: String,
    pub agent_id: String,
    pub action_type: ActionType,

    /// Tactical movement applied at execution time.
    #[serde(default)]
    pub target_position: Option<String>,
    /// Raw name or generated `tgt_xxxx` combat id when attacking.
    #[serde(default)]
    pub target_enemy: Option<String>,
    /// Character name when supporting an ally.
    #[serde(default)]
    pub target_ally: Option<String>,

    #[serde(default)]
    pub is_ritual: bool,
    #[serde(default)]
    pub has_primary_tool: bool,
    #[serde(default)]
    pub has_offering: bool,
    #[serde(default)]
    pub ritual_components: Option<String>,

    #[serde(default)]
    pub situational_modifiers: BTreeMap<String, i32>,

    pub timestamp: DateTime<Utc>,
}

impl ActionDeclaration {
    pub fn new(
        intent: impl Into<String>,
        description: impl Into<String>,
        attribute: Attribute,
        skill: Option<String>,
        action_type: ActionType,
        character_name: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            intent: intent.into(),
            description: description.into(),
            attribute,
            skill,
            difficulty_estimate: 20,
            difficulty_justification: "estimated from context".to_string(),
            character_name: character_name.into(),
            agent_id: agent_id.into(),
            action_type,
            target_position: None,
            target_enemy: None,
            target_ally: None,
            is_ritual: false,
            has_primary_tool: false,
            has_offering: false,
            ritual_components: None,
            situational_modifiers: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Structural validation. Returns every problem found (empty ⇒ valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.intent.trim().len() < 3 {
            errors.push("Intent must be a clear action description".to_string());
        }
        if self.description.trim().len() < 10 {
            errors.push("Description must be at least 10 characters".to_string());
        }
        if !(5..=50).contains(&self.difficulty_estimate) {
            errors.push("Difficulty estimate must be between 5 and 50".to_string());
        }
        if self.difficulty_justification.trim().is_empty() {
            errors.push("Must provide justification for difficulty estimate".to_string());
        }

        errors
    }

    /// Brief summary for logging: `Name: intent (Attribute × Skill vs ~DC)`.
    pub fn summary(&self) -> String {
        let skill_text = match &self.skill {
            Some(skill) if !skill.eq_ignore_ascii_case("none") => format!(" × {}", skill),
            _ => String::new(),
        };
        format!(
            "{}: {} ({}{} vs ~{})",
            self.character_name, self.intent, self.attribute, skill_text, self.difficulty_estimate
        )
    }
}

/// Rolling-window duplicate detection over an agent's recent intents.
///
/// Similarity is Jaccard over lowercase word sets; ≥ 0.7 counts as a
/// duplicate.
pub struct IntentDeduplicator {
    window_size: usize,
    agent_history: HashMap<String, Vec<String>>,
}

impl IntentDeduplicator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            agent_history: HashMap::new(),
        }
    }

    /// True when `intent` is too similar to one of the agent's recent intents.
    pub fn check_duplicate(&self, agent_id: &str, intent: &str, threshold: f64) -> bool {
        let Some(recent) = self.agent_history.get(agent_id) else {
            return false;
        };
        let intent_words: HashSet<String> =
            intent.to_lowercase().split_whitespace().map(String::from).collect();
        if intent_words.is_empty() {
            return false;
        }

        for past in recent {
            let past_words: HashSet<String> =
                past.to_lowercase().split_whitespace().map(String::from).collect();
            if past_words.is_empty() {
                continue;
            }
            let intersection = intent_words.intersection(&past_words).count();
            let union = intent_words.union(&past_words).count();
            let similarity = intersection as f64 / union as f64;
            if similarity >= threshold {
                warn!(
                    "agent {} attempting duplicate action: {:?} vs {:?} (similarity {:.2})",
                    agent_id, intent, past, similarity
                );
                return true;
            }
        }
        false
    }

    /// Record an intent and trim the window.
    pub fn record_intent(&mut self, agent_id: &str, intent: &str) {
        let history = self.agent_history.entry(agent_id.to_string()).or_default();
        history.push(intent.to_string());
        if history.len() > self.window_size {
            let excess = history.len() - self.window_size;
            history.drain(..excess);
        }
    }

    pub fn recent_intents(&self, agent_id: &str) -> Vec<String> {
        self.agent_history.get(agent_id).cloned().unwrap_or_default()
    }

    /// Suggest alternative moves to break a repetition loop.
    pub fn suggest_alternatives(
        &self,
        agent_id: &str,
        character_name: &str,
        scenario_context: &str,
    ) -> Vec<String> {
        let recent = self.recent_intents(agent_id);
        let recent_lower: Vec<String> = recent.iter().map(|i| i.to_lowercase()).collect();
        let used = |kw: &[&str]| recent_lower.iter().any(|i| kw.iter().any(|k| i.contains(k)));

        let used_investigation = used(&["scan", "investigate"]);
        let used_ritual = used(&["ritual", "harmoniz"]);
        let used_social = used(&["ask", "talk", "interact"]);

        let mut suggestions = Vec::new();
        if used_investigation && !used_social {
            suggestions.push(format!(
                "{} could question NPCs or other characters about their observations",
                character_name
            ));
        }
        if used_ritual && !used_investigation {
            suggestions.push(format!(
                "{} could use technical or forensic methods to gather evidence",
                character_name
            ));
        }
        if !used_ritual {
            suggestions.push(format!(
                "{} could attempt a ritual to reveal hidden information",
                character_name
            ));
        }
        if scenario_context.to_lowercase().contains("chamber")
            && !recent_lower.iter().any(|i| i.contains("chamber"))
        {
            suggestions.push(format!(
                "{} could physically search specific chambers or areas",
                character_name
            ));
        }
        if suggestions.len() < 3 {
            suggestions.push(format!("{} could change their approach entirely", character_name));
            suggestions.push(format!(
                "{} could collaborate with another character",
                character_name
            ));
            suggestions.push(format!(
                "{} could try a high-risk, proactive action",
                character_name
            ));
        }
        suggestions.truncate(3);
        suggestions
    }

    pub fn clear(&mut self, agent_id: Option<&str>) {
        match agent_id {
            Some(id) => {
                self.agent_history.remove(id);
            }
            None => self.agent_history.clear(),
        }
    }
}

/// Validates declarations and maintains the dedup window.
pub struct ActionValidator {
    pub deduplicator: IntentDeduplicator,
}

impl Default for ActionValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionValidator {
    pub fn new() -> Self {
        Self {
            deduplicator: IntentDeduplicator::new(2),
        }
    }

    /// Validate a declaration. Duplicates are only rejected when
    /// `allow_duplicates` is false (combat allows repeated attacks).
    pub fn validate_action(
        &mut self,
        action: &ActionDeclaration,
        allow_duplicates: bool,
    ) -> (bool, Vec<String>) {
        let mut issues = action.validate();

        if !allow_duplicates
            && self
                .deduplicator
                .check_duplicate(&action.agent_id, &action.intent, 0.7)
        {
            issues.push(format!(
                "Action too similar to recent intents: {:?}",
                self.deduplicator.recent_intents(&action.agent_id)
            ));
            let suggestions = self.deduplicator.suggest_alternatives(
                &action.agent_id,
                &action.character_name,
                &action.description,
            );
            issues.push(format!("Suggested alternatives: {}", suggestions.join("; ")));
        }

        let is_valid = issues.is_empty();
        if is_valid || allow_duplicates {
            self.deduplicator.record_intent(&action.agent_id, &action.intent);
        }
        (is_valid, issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration(intent: &str) -> ActionDeclaration {
        ActionDeclaration::new(
            intent,
            "A sufficiently descriptive narrative line.",
            Attribute::Perception,
            Some("Awareness".to_string()),
            ActionType::Investigate,
            "Zara Nightwhisper",
            "player_01",
        )
    }

    #[test]
    fn test_structural_validation() {
        let good = declaration("scan the chamber for residue");
        assert!(good.validate().is_empty());

        let mut bad = declaration("x");
        bad.description = "short".to_string();
        bad.difficulty_estimate = 3;
        bad.difficulty_justification = String::new();
        let errors = bad.validate();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_summary_never_shows_none_skill() {
        let mut decl = declaration("scan the chamber");
        decl.skill = None;
        assert!(!decl.summary().contains("None"));
        decl.skill = Some("Awareness".to_string());
        assert!(decl.summary().contains("× Awareness"));
    }

    #[test]
    fn test_duplicate_detection_jaccard() {
        let mut dedup = IntentDeduplicator::new(3);
        dedup.record_intent("player_01", "scan the eastern chamber for void residue");
        assert!(dedup.check_duplicate(
            "player_01",
            "scan the eastern chamber for residue",
            0.7
        ));
        assert!(!dedup.check_duplicate("player_01", "question the dock foreman", 0.7));
        // Other agents have independent windows.
        assert!(!dedup.check_duplicate(
            "player_02",
            "scan the eastern chamber for void residue",
            0.7
        ));
    }

    #[test]
    fn test_window_trimming() {
        let mut dedup = IntentDeduplicator::new(2);
        dedup.record_intent("p", "first action here");
        dedup.record_intent("p", "second action here");
        dedup.record_intent("p", "third action here");
        let recent = dedup.recent_intents("p");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], "second action here");
    }

    #[test]
    fn test_validator_rejects_duplicates_only_when_asked() {
        let mut validator = ActionValidator::new();
        let action = declaration("scan the shrine for tampering marks");

        let (valid, _) = validator.validate_action(&action, true);
        assert!(valid);

        // Same intent again: allowed in combat mode...
        let (valid, _) = validator.validate_action(&action, true);
        assert!(valid);

        // ...rejected with suggestions when duplicates are disallowed.
        let (valid, issues) = validator.validate_action(&action, false);
        assert!(!valid);
        assert!(issues.iter().any(|i| i.contains("too similar")));
        assert!(issues.iter().any(|i| i.contains("Suggested alternatives")));
    }

    #[test]
    fn test_suggestions_shape() {
        let mut dedup = IntentDeduplicator::new(3);
        dedup.record_intent("p", "scan the relay");
        dedup.record_intent("p", "investigate the relay logs");
        let suggestions = dedup.suggest_alternatives("p", "Kael", "a sealed chamber complex");
        assert_eq!(suggestions.len(), 3);
        assert!(suggestions.iter().all(|s| s.contains("Kael")));
    }
}

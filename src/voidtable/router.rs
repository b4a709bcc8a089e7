//! Action routing: normalize a declared intent to (attribute, skill).
//!
//! Players declare free-text intents; the router maps each to the attribute ×
//! skill pair the mechanics engine rolls with. A skill the character actually
//! possesses and declared themselves is trusted and only paired with its
//! canonical attribute — the keyword chains below only run when no valid
//! declaration was made.

use crate::voidtable::mechanics::Attribute;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

/// Routed mechanical basis for an action.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedAction {
    pub attribute: Attribute,
    pub skill: Option<String>,
    pub rationale: String,
}

impl RoutedAction {
    fn new(attribute: Attribute, skill: Option<&str>, rationale: &str) -> Self {
        Self {
            attribute,
            skill: skill.map(str::to_string),
            rationale: rationale.to_string(),
        }
    }
}

const SENSING_KEYWORDS: [&str; 9] = [
    "trace", "sense", "detect", "attune", "calibrate", "scan", "perceive", "feel", "read",
];
const RITUAL_KEYWORDS: [&str; 6] = [
    "perform a ritual", "conduct a ritual", "ritual to", "begin ritual", "cast ritual",
    "invoke ritual",
];
const TECH_KEYWORDS: [&str; 9] = [
    "interface", "hack", "patch", "contain", "isolate", "firewall", "encrypt", "debug",
    "analyze system",
];
const DREAMWORK_KEYWORDS: [&str; 7] = [
    "dream", "sleep", "oneiric", "lucid", "nightmare", "vision", "memory dive",
];
const DIALOGUE_KEYWORDS: [&str; 8] = [
    "talk to", "speak to", "ask", "tell", "discuss with", "question", "say to", "converse with",
];
const SOCIAL_CARE_KEYWORDS: [&str; 6] = [
    "counsel", "comfort", "guide", "heal mind", "therapy", "support",
];
const SOCIAL_COMMAND_KEYWORDS: [&str; 6] = [
    "order", "command", "rally", "intimidate", "coordinate", "organize",
];
const SOCIAL_GENERAL_KEYWORDS: [&str; 5] = ["discuss", "talk", "share", "convince", "persuade"];
const INVESTIGATION_KEYWORDS: [&str; 6] = [
    "investigate", "search", "examine", "study", "research", "uncover",
];
pub const GROUNDING_KEYWORDS: [&str; 6] = [
    "ground", "center", "meditate", "calm self", "focus inward", "discipline mind",
];
pub const PURGE_KEYWORDS: [&str; 6] = [
    "purge", "cleanse", "dephase", "filter", "contain void", "isolate corruption",
];

lazy_static! {
    /// Canonical attribute pairing for known skills.
    static ref SKILL_ATTRIBUTES: HashMap<&'static str, Attribute> = {
        let mut m = HashMap::new();
        // Technical skills
        m.insert("Drone Operation", Attribute::Intelligence);
        m.insert("Pilot", Attribute::Agility);
        m.insert("Systems", Attribute::Intelligence);
        // Knowledge skills
        m.insert("Debt Law", Attribute::Intelligence);
        m.insert("Corporate Influence", Attribute::Charisma);
        m.insert("Investigation", Attribute::Perception);
        // Social skills
        m.insert("Charm", Attribute::Empathy);
        m.insert("Guile", Attribute::Charisma);
        m.insert("Counsel", Attribute::Empathy);
        m.insert("Command", Attribute::Charisma);
        m.insert("Intimidation", Attribute::Charisma);
        m.insert("Intimacy Ritual", Attribute::Empathy);
        // Perception skills
        m.insert("Awareness", Attribute::Perception);
        m.insert("Attunement", Attribute::Perception);
        // Spiritual skills
        m.insert("Astral Arts", Attribute::Willpower);
        m.insert("Dreamwork", Attribute::Willpower);
        m.insert("Discipline", Attribute::Willpower);
        m
    };

    /// Aliases the LLMs habitually use for canonical skill names.
    static ref SKILL_ALIASES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("social", "Charm");
        m.insert("charm", "Charm");
        m.insert("guile", "Guile");
        m.insert("deception", "Guile");
        m.insert("persuasion", "Charm");
        m.insert("empathy", "Charm");
        m.insert("investigation", "Awareness");
        m.insert("investigate", "Awareness");
        m.insert("awareness", "Awareness");
        m.insert("perception", "Awareness");
        m.insert("search", "Awareness");
        m.insert("astral arts", "Astral Arts");
        m.insert("astral", "Astral Arts");
        m.insert("ritual", "Astral Arts");
        m.insert("systems", "Systems");
        m.insert("tech", "Systems");
        m.insert("technology", "Systems");
        m.insert("attunement", "Attunement");
        m.insert("discipline", "Discipline");
        m.insert("dreamwork", "Dreamwork");
        m
    };

    static ref PARENTHETICAL_RE: Regex = Regex::new(r"\s*\([^)]*\)").unwrap();
}

/// Normalize a skill name: strip parenthetical values ("Charm (5)" → "Charm")
/// and resolve aliases. Unknown names pass through cleaned.
pub fn normalize_skill(skill_name: Option<&str>) -> Option<String> {
    let raw = skill_name?;
    let cleaned = PARENTHETICAL_RE.replace_all(raw, "").trim().to_string();
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("none") {
        return None;
    }
    let lower = cleaned.to_lowercase();
    Some(
        SKILL_ALIASES
            .get(lower.as_str())
            .map(|s| s.to_string())
            .unwrap_or(cleaned),
    )
}

/// Look up a (normalized) skill value from a character's sheet.
pub fn character_skill_value(skills: &HashMap<String, i32>, skill_name: Option<&str>) -> i32 {
    let Some(name) = skill_name else { return 0 };
    if let Some(value) = skills.get(name) {
        return *value;
    }
    if let Some(normalized) = normalize_skill(Some(name)) {
        if let Some(value) = skills.get(&normalized) {
            return *value;
        }
    }
    0
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

/// The router itself. Stateless; safe to construct per call.
#[derive(Default)]
pub struct ActionRouter;

impl ActionRouter {
    pub fn new() -> Self {
        Self
    }

    /// True when the intent explicitly declares a ritual.
    pub fn is_explicit_ritual(&self, intent: &str) -> bool {
        let intent_lower = intent.to_lowercase();
        contains_any(&intent_lower, &RITUAL_KEYWORDS)
    }

    /// Route an intent to (attribute, skill, rationale).
    ///
    /// Priority: trusted declared skill → recovery → purge → dialogue →
    /// inter-party ritual → ritual → sensing → tech → dreamwork → social
    /// chains → investigation → action-type fallback → unskilled Perception.
    pub fn route_action(
        &self,
        intent: &str,
        action_type: &str,
        character_skills: &HashMap<String, i32>,
        is_explicit_ritual: bool,
        declared_skill: Option<&str>,
        other_players: &[String],
    ) -> RoutedAction {
        let intent_lower = intent.to_lowercase();
        let has = |skill: &str| character_skills.contains_key(skill);

        // Trust a declared skill the character actually has, unless a ritual
        // override is in play.
        if let Some(declared) = declared_skill {
            if character_skills.contains_key(declared) && !is_explicit_ritual {
                if let Some(attribute) = SKILL_ATTRIBUTES.get(declared) {
                    return RoutedAction::new(
                        *attribute,
                        Some(declared),
                        &format!("Valid {} skill", declared),
                    );
                }
                // Unknown pairing: make an educated guess.
                let declared_lower = declared.to_lowercase();
                if contains_any(&declared_lower, &["tech", "system", "drone", "hack"]) {
                    return RoutedAction::new(
                        Attribute::Intelligence,
                        Some(declared),
                        &format!("Valid {} skill (technical)", declared),
                    );
                }
                if contains_any(&declared_lower, &["social", "charm", "counsel"]) {
                    return RoutedAction::new(
                        Attribute::Empathy,
                        Some(declared),
                        &format!("Valid {} skill (social)", declared),
                    );
                }
                return RoutedAction::new(
                    Attribute::Intelligence,
                    Some(declared),
                    &format!("Valid {} skill", declared),
                );
            }
        }

        // Recovery moves come first so players can always dig out of void.
        if contains_any(&intent_lower, &GROUNDING_KEYWORDS) {
            return if has("Discipline") {
                RoutedAction::new(
                    Attribute::Willpower,
                    Some("Discipline"),
                    "Grounding meditation (-1 Void on success)",
                )
            } else {
                RoutedAction::new(
                    Attribute::Willpower,
                    None,
                    "Grounding meditation (unskilled, -1 Void on success)",
                )
            };
        }

        if contains_any(&intent_lower, &PURGE_KEYWORDS) {
            return if has("Systems") {
                RoutedAction::new(
                    Attribute::Intelligence,
                    Some("Systems"),
                    "Void purging/dephasing (-scene Void on success)",
                )
            } else {
                RoutedAction::new(Attribute::Intelligence, None, "Void purging (unskilled)")
            };
        }

        // Dialogue with the party.
        if contains_any(&intent_lower, &DIALOGUE_KEYWORDS) {
            return if has("Charm") {
                RoutedAction::new(Attribute::Empathy, Some("Charm"), "Dialogue with party member")
            } else if has("Counsel") {
                RoutedAction::new(Attribute::Empathy, Some("Counsel"), "Dialogue with party member")
            } else {
                RoutedAction::new(Attribute::Empathy, None, "Dialogue (unskilled)")
            };
        }

        // Rituals naming another party member are social bonding actions.
        let is_ritual = is_explicit_ritual || action_type == "ritual";
        let is_inter_party_ritual = is_ritual
            && other_players
                .iter()
                .any(|name| intent_lower.contains(&name.to_lowercase()));

        if is_inter_party_ritual {
            return if has("Intimacy Ritual") {
                RoutedAction::new(
                    Attribute::Empathy,
                    Some("Intimacy Ritual"),
                    "Inter-party ritual (social bonding)",
                )
            } else if has("Charm") {
                RoutedAction::new(
                    Attribute::Empathy,
                    Some("Charm"),
                    "Inter-party interaction (no Intimacy Ritual skill)",
                )
            } else if has("Counsel") {
                RoutedAction::new(
                    Attribute::Empathy,
                    Some("Counsel"),
                    "Inter-party interaction (no Intimacy Ritual skill)",
                )
            } else {
                RoutedAction::new(Attribute::Empathy, None, "Inter-party interaction (unskilled)")
            };
        }

        if is_ritual {
            return RoutedAction::new(Attribute::Willpower, Some("Astral Arts"), "Ritual action");
        }

        if contains_any(&intent_lower, &SENSING_KEYWORDS) {
            return if has("Attunement") {
                RoutedAction::new(
                    Attribute::Perception,
                    Some("Attunement"),
                    "Sensing resonance/void currents",
                )
            } else {
                RoutedAction::new(Attribute::Perception, None, "Raw perception (no Attunement skill)")
            };
        }

        if contains_any(&intent_lower, &TECH_KEYWORDS) {
            return if has("Systems") {
                RoutedAction::new(Attribute::Intelligence, Some("Systems"), "Technical system work")
            } else {
                RoutedAction::new(Attribute::Intelligence, None, "Raw intelligence (no Systems skill)")
            };
        }

        if contains_any(&intent_lower, &DREAMWORK_KEYWORDS) {
            return if has("Dreamwork") {
                RoutedAction::new(Attribute::Willpower, Some("Dreamwork"), "Oneiric navigation")
            } else {
                RoutedAction::new(Attribute::Empathy, None, "Raw empathy (no Dreamwork skill)")
            };
        }

        if contains_any(&intent_lower, &SOCIAL_CARE_KEYWORDS) {
            return if has("Counsel") {
                RoutedAction::new(Attribute::Empathy, Some("Counsel"), "Social care/support")
            } else if has("Charm") {
                RoutedAction::new(Attribute::Empathy, Some("Charm"), "Social care via charm")
            } else {
                RoutedAction::new(Attribute::Empathy, None, "Raw empathy")
            };
        }

        if contains_any(&intent_lower, &SOCIAL_COMMAND_KEYWORDS) {
            return if has("Command") {
                RoutedAction::new(Attribute::Charisma, Some("Command"), "Social command/leadership")
            } else if has("Guile") {
                RoutedAction::new(Attribute::Charisma, Some("Guile"), "Social manipulation")
            } else {
                RoutedAction::new(Attribute::Charisma, None, "Raw charisma")
            };
        }

        if contains_any(&intent_lower, &SOCIAL_GENERAL_KEYWORDS) {
            return if has("Charm") {
                RoutedAction::new(Attribute::Empathy, Some("Charm"), "General social interaction")
            } else if has("Guile") {
                RoutedAction::new(Attribute::Empathy, Some("Guile"), "Social deception")
            } else {
                RoutedAction::new(Attribute::Empathy, None, "Raw empathy")
            };
        }

        if contains_any(&intent_lower, &INVESTIGATION_KEYWORDS) {
            return if has("Awareness") {
                RoutedAction::new(Attribute::Perception, Some("Awareness"), "Investigation/search")
            } else {
                RoutedAction::new(Attribute::Perception, None, "Raw perception")
            };
        }

        // Action-type fallback.
        match action_type {
            "social" => RoutedAction::new(
                Attribute::Empathy,
                if has("Charm") { Some("Charm") } else { None },
                "Social action",
            ),
            "investigate" => RoutedAction::new(
                Attribute::Perception,
                if has("Awareness") { Some("Awareness") } else { None },
                "Investigation",
            ),
            "technical" => RoutedAction::new(
                Attribute::Intelligence,
                if has("Systems") { Some("Systems") } else { None },
                "Technical action",
            ),
            _ => RoutedAction::new(Attribute::Perception, None, "Generic observation"),
        }
    }
}

/// Enforce ritual mechanics: rituals always roll Willpower × Astral Arts.
/// The correction is silent (logged by callers); returns the corrected pair.
pub fn validate_ritual_mechanics(
    action_type: &str,
    attribute: Attribute,
    skill: Option<&str>,
) -> (Attribute, Option<String>) {
    if action_type == "ritual" {
        (Attribute::Willpower, Some("Astral Arts".to_string()))
    } else {
        (attribute, skill.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skills(pairs: &[(&str, i32)]) -> HashMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_declared_skill_is_trusted() {
        let router = ActionRouter::new();
        let sheet = skills(&[("Pilot", 4), ("Charm", 2)]);
        let routed = router.route_action(
            "thread the shuttle through the debris",
            "technical",
            &sheet,
            false,
            Some("Pilot"),
            &[],
        );
        assert_eq!(routed.attribute, Attribute::Agility);
        assert_eq!(routed.skill.as_deref(), Some("Pilot"));
    }

    #[test]
    fn test_ritual_override_beats_declared_skill() {
        let router = ActionRouter::new();
        let sheet = skills(&[("Systems", 3), ("Astral Arts", 2)]);
        let routed = router.route_action(
            "perform a ritual to seal the breach",
            "ritual",
            &sheet,
            true,
            Some("Systems"),
            &[],
        );
        assert_eq!(routed.attribute, Attribute::Willpower);
        assert_eq!(routed.skill.as_deref(), Some("Astral Arts"));
    }

    #[test]
    fn test_recovery_routes_to_discipline() {
        let router = ActionRouter::new();
        let with = router.route_action("ground and center myself", "custom", &skills(&[("Discipline", 3)]), false, None, &[]);
        assert_eq!(with.skill.as_deref(), Some("Discipline"));
        assert_eq!(with.attribute, Attribute::Willpower);

        let without = router.route_action("ground and center myself", "custom", &skills(&[]), false, None, &[]);
        assert!(without.skill.is_none());
        assert_eq!(without.attribute, Attribute::Willpower);
    }

    #[test]
    fn test_purge_routes_to_systems() {
        let router = ActionRouter::new();
        let routed = router.route_action("purge the corrupted buffer", "technical", &skills(&[("Systems", 4)]), false, None, &[]);
        assert_eq!(routed.attribute, Attribute::Intelligence);
        assert_eq!(routed.skill.as_deref(), Some("Systems"));
    }

    #[test]
    fn test_dialogue_routes_to_charm() {
        let router = ActionRouter::new();
        let routed = router.route_action(
            "tell Mira what I found about the glyph",
            "social",
            &skills(&[("Charm", 3)]),
            false,
            None,
            &["Mira".to_string()],
        );
        assert_eq!(routed.attribute, Attribute::Empathy);
        assert_eq!(routed.skill.as_deref(), Some("Charm"));
    }

    #[test]
    fn test_inter_party_ritual_prefers_intimacy() {
        let router = ActionRouter::new();
        let routed = router.route_action(
            "perform a ritual to share strength with Kael",
            "ritual",
            &skills(&[("Intimacy Ritual", 3), ("Astral Arts", 4)]),
            true,
            None,
            &["Kael".to_string()],
        );
        assert_eq!(routed.attribute, Attribute::Empathy);
        assert_eq!(routed.skill.as_deref(), Some("Intimacy Ritual"));
    }

    #[test]
    fn test_keyword_chains() {
        let router = ActionRouter::new();
        let sheet = skills(&[("Attunement", 2), ("Systems", 3), ("Awareness", 2)]);
        assert_eq!(
            router.route_action("scan the leyline currents", "perception", &sheet, false, None, &[]).skill.as_deref(),
            Some("Attunement")
        );
        assert_eq!(
            router.route_action("hack the door controls", "technical", &sheet, false, None, &[]).skill.as_deref(),
            Some("Systems")
        );
        assert_eq!(
            router.route_action("investigate the shrine wreckage", "investigate", &sheet, false, None, &[]).skill.as_deref(),
            Some("Awareness")
        );
    }

    #[test]
    fn test_ultimate_fallback() {
        let router = ActionRouter::new();
        let routed = router.route_action("wait and watch", "explore", &skills(&[]), false, None, &[]);
        assert_eq!(routed.attribute, Attribute::Perception);
        assert!(routed.skill.is_none());
    }

    #[test]
    fn test_normalize_skill_aliases_and_values() {
        assert_eq!(normalize_skill(Some("social")).as_deref(), Some("Charm"));
        assert_eq!(normalize_skill(Some("Charm (5)")).as_deref(), Some("Charm"));
        assert_eq!(normalize_skill(Some("investigation")).as_deref(), Some("Awareness"));
        assert_eq!(normalize_skill(Some("None")), None);
        assert_eq!(normalize_skill(Some("Leyline Cartography")).as_deref(), Some("Leyline Cartography"));

        let sheet = skills(&[("Awareness", 3)]);
        assert_eq!(character_skill_value(&sheet, Some("investigation")), 3);
        assert_eq!(character_skill_value(&sheet, Some("Awareness")), 3);
        assert_eq!(character_skill_value(&sheet, Some("Pilot")), 0);
        assert_eq!(character_skill_value(&sheet, None), 0);
    }

    #[test]
    fn test_ritual_mechanics_enforcement() {
        let (attr, skill) = validate_ritual_mechanics("ritual", Attribute::Perception, Some("Awareness"));
        assert_eq!(attr, Attribute::Willpower);
        assert_eq!(skill.as_deref(), Some("Astral Arts"));

        let (attr, skill) = validate_ritual_mechanics("combat", Attribute::Strength, None);
        assert_eq!(attr, Attribute::Strength);
        assert!(skill.is_none());
    }
}

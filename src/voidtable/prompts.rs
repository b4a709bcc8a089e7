//! Versioned prompt registry and template substitution.
//!
//! Prompt text is addressed by `(agent_type, provider, language, section)`
//! and substituted with a small `{name}` / `{nested.path}` engine. The
//! resolved [`PromptMetadata`] travels with the produced action or narration
//! into the event log, so every logged turn can be traced back to the exact
//! prompt template that produced it.

use serde_json::Value;
use std::collections::HashMap;

/// Identity of a resolved prompt, carried into the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMetadata {
    pub version: String,
    pub provider: String,
    pub language: String,
    pub template: String,
}

impl PromptMetadata {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "version": self.version,
            "provider": self.provider,
            "language": self.language,
            "template": self.template,
        })
    }
}

/// A prompt resolved against variables.
#[derive(Debug, Clone)]
pub struct LoadedPrompt {
    pub content: String,
    pub metadata: PromptMetadata,
}

#[derive(Clone)]
struct PromptEntry {
    content: String,
    version: String,
}

/// In-memory registry of prompt sections.
///
/// Lookup falls back along `(provider, language)` → `(provider, "en")` →
/// `("default", "en")` so a sparse registry still resolves.
pub struct PromptLibrary {
    entries: HashMap<(String, String, String, String), PromptEntry>,
}

impl PromptLibrary {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A library pre-loaded with the built-in section set.
    pub fn with_defaults() -> Self {
        let mut lib = Self::new();
        for (agent_type, section, content) in default_sections() {
            lib.register(agent_type, "default", "en", section, content, "1.0");
        }
        lib
    }

    pub fn register(
        &mut self,
        agent_type: &str,
        provider: &str,
        language: &str,
        section: &str,
        content: &str,
        version: &str,
    ) {
        self.entries.insert(
            (
                agent_type.to_string(),
                provider.to_string(),
                language.to_string(),
                section.to_string(),
            ),
            PromptEntry {
                content: content.to_string(),
                version: version.to_string(),
            },
        );
    }

    fn lookup(
        &self,
        agent_type: &str,
        provider: &str,
        language: &str,
        section: &str,
    ) -> Option<(&PromptEntry, String, String)> {
        let chain = [
            (provider, language),
            (provider, "en"),
            ("default", language),
            ("default", "en"),
        ];
        for (p, l) in chain {
            let key = (
                agent_type.to_string(),
                p.to_string(),
                l.to_string(),
                section.to_string(),
            );
            if let Some(entry) = self.entries.get(&key) {
                return Some((entry, p.to_string(), l.to_string()));
            }
        }
        None
    }

    /// Resolve a section and substitute variables.
    pub fn load(
        &self,
        agent_type: &str,
        provider: &str,
        language: &str,
        section: &str,
        variables: &Value,
    ) -> Option<LoadedPrompt> {
        let (entry, resolved_provider, resolved_language) =
            self.lookup(agent_type, provider, language, section)?;
        Some(LoadedPrompt {
            content: substitute_variables(&entry.content, variables),
            metadata: PromptMetadata {
                version: entry.version.clone(),
                provider: resolved_provider,
                language: resolved_language,
                template: format!("{}/{}", agent_type, section),
            },
        })
    }

    /// Resolve several sections and join them with blank lines. Metadata is
    /// taken from the first section that resolves.
    pub fn compose(
        &self,
        agent_type: &str,
        provider: &str,
        language: &str,
        sections: &[&str],
        variables: &Value,
    ) -> Option<LoadedPrompt> {
        let mut parts = Vec::new();
        let mut metadata = None;
        for section in sections {
            if let Some(loaded) = self.load(agent_type, provider, language, section, variables) {
                if metadata.is_none() {
                    metadata = Some(loaded.metadata);
                }
                parts.push(loaded.content);
            }
        }
        let metadata = metadata?;
        Some(LoadedPrompt {
            content: parts.join("\n\n"),
            metadata,
        })
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Substitute `{name}` and `{nested.path}` placeholders from a JSON value.
/// Unresolvable placeholders are left verbatim.
pub fn substitute_variables(content: &str, variables: &Value) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        // Find the closing brace on the same placeholder.
        let rest = &content[start + 1..];
        match rest.find(['}', '{', '\n']) {
            Some(end) if rest.as_bytes()[end] == b'}' => {
                let path = &rest[..end];
                match resolve_path(variables, path) {
                    Some(value) => {
                        out.push_str(&value);
                        // Skip past the placeholder body and closing brace.
                        for _ in 0..end + 1 {
                            chars.next();
                        }
                    }
                    None => out.push('{'),
                }
            }
            _ => out.push('{'),
        }
    }
    out
}

fn resolve_path(variables: &Value, path: &str) -> Option<String> {
    if path.is_empty() || !path.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return None;
    }
    let mut cursor = variables;
    for segment in path.split('.') {
        cursor = cursor.get(segment)?;
    }
    Some(match cursor {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// The built-in section set: the core player/director scaffolding the agents
/// compose their prompts from.
fn default_sections() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        (
            "player",
            "identity",
            "You are {character.name} ({character.pronouns}), a {character.faction} operative.\n\
             Attributes: {character.attributes_line}\n\
             Skills (strongest first): {character.skills_line}\n\
             Void {character.void_score}/10 | Soulcredit {character.soulcredit}\n\
             Goals: {character.goals_line}",
        ),
        (
            "player",
            "action_format",
            "When declaring an action you MUST provide every field:\n\
             INTENT: [brief action description]\n\
             ATTRIBUTE: [attribute name]\n\
             SKILL: [skill name or None]\n\
             DIFFICULTY: [number] - [justification]\n\
             ACTION_TYPE: [explore | investigate | ritual | social | combat | technical | perception]\n\
             DESCRIPTION: [1-2 sentence narrative description]\n\
             For rituals also provide:\n\
             PRIMARY_TOOL: [yes/no]\nOFFERING: [yes/no]\nCOMPONENTS: [materials]\n\
             Do NOT repeat actions you've attempted in the last 2 turns.\n\
             Recent actions: {recent_intents}",
        ),
        (
            "player",
            "scene",
            "Scenario: {scenario.theme} at {scenario.location}\n\
             Situation: {scenario.situation}\n\
             Scene clocks:\n{clocks_block}\n\
             Party: {party_line}\n\
             Recent party discoveries:\n{discoveries_block}",
        ),
        (
            "player",
            "tactical",
            "Combat context: enemies present. Your position: {position}.\n\
             Combatants (target by id):\n{combatants_block}\n\
             Add TARGET: [tgt_xxxx id] when attacking and optionally\n\
             [TARGET_POSITION: Position] to move.",
        ),
        (
            "dm",
            "adjudication",
            "You are the Director of a dark sci-fi tabletop session.\n\
             {character_name} attempted: {intent}\n\
             Mechanical result (authoritative, do not contradict):\n{mechanical_block}\n\
             Narrate the outcome in 2-4 vivid sentences grounded in the result.\n\
             You may emit markers: \u{1f4ca} Clock Name: +/-N (reason), \u{26ab} Void: +N (reason),\n\
             \u{2696}\u{fe0f} Soulcredit: +/-N (reason), [POSITION: X], and an EFFECT: block when a\n\
             target takes mechanical harm.",
        ),
        (
            "dm",
            "synthesis",
            "You are the Director. Multiple characters just acted simultaneously.\n\
             What they tried:\n{outcomes_block}\n{clock_block}\n{filled_block}\n{expired_block}\n{advance_block}\n\
             Write a cohesive 1-2 paragraph narration of how these actions played out\n\
             together, fastest to slowest. If clocks filled, their consequences MUST\n\
             appear, including any control markers from their filled consequence.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_and_nested_substitution() {
        let vars = json!({
            "name": "Zara",
            "character": {"faction": "Tempest", "void_score": 3},
        });
        assert_eq!(substitute_variables("Hi {name}", &vars), "Hi Zara");
        assert_eq!(
            substitute_variables("{character.faction} void {character.void_score}", &vars),
            "Tempest void 3"
        );
    }

    #[test]
    fn test_unresolved_placeholders_left_verbatim() {
        let vars = json!({"known": "yes"});
        assert_eq!(
            substitute_variables("{known} and {unknown.path}", &vars),
            "yes and {unknown.path}"
        );
        // Braces that aren't placeholders survive.
        assert_eq!(substitute_variables("json {{", &vars), "json {{");
    }

    #[test]
    fn test_library_fallback_chain() {
        let mut lib = PromptLibrary::new();
        lib.register("player", "default", "en", "identity", "default text", "1.0");
        lib.register("player", "anthropic", "en", "identity", "anthropic text", "2.0");

        let specific = lib
            .load("player", "anthropic", "de", "identity", &json!({}))
            .unwrap();
        assert_eq!(specific.content, "anthropic text");
        assert_eq!(specific.metadata.version, "2.0");

        let fallback = lib
            .load("player", "openai", "en", "identity", &json!({}))
            .unwrap();
        assert_eq!(fallback.content, "default text");
        assert_eq!(fallback.metadata.provider, "default");

        assert!(lib.load("dm", "openai", "en", "identity", &json!({})).is_none());
    }

    #[test]
    fn test_compose_joins_sections_with_first_metadata() {
        let lib = PromptLibrary::with_defaults();
        let vars = json!({
            "character": {
                "name": "Zara", "pronouns": "she/her", "faction": "Tempest",
                "attributes_line": "Will 4", "skills_line": "Astral Arts 5",
                "void_score": 2, "soulcredit": 5, "goals_line": "survive",
            },
            "recent_intents": "none",
        });
        let prompt = lib
            .compose("player", "anthropic", "en", &["identity", "action_format"], &vars)
            .unwrap();
        assert!(prompt.content.contains("Zara"));
        assert!(prompt.content.contains("INTENT:"));
        assert_eq!(prompt.metadata.template, "player/identity");
    }
}

//! Session configuration.
//!
//! Configs load from JSON or YAML (decided by file extension) into typed
//! structs. Character entries mirror the character-config surface: identity,
//! attributes/skills, optional starting ledgers, goals/bonds, optional
//! inventory and weapon loadouts, and a personality profile.

use crate::voidtable::character::{PersonalityProfile, WeaponLoadout};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// LLM provider settings for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-0".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            temperature: default_temperature(),
        }
    }
}

/// One character in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterConfig {
    pub name: String,
    #[serde(default)]
    pub pronouns: Option<String>,
    pub faction: String,
    pub attributes: HashMap<String, i32>,
    pub skills: HashMap<String, i32>,
    #[serde(default)]
    pub void_score: i32,
    #[serde(default)]
    pub soulcredit: i32,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub bonds: Vec<String>,
    #[serde(default)]
    pub inventory: Option<BTreeMap<String, i32>>,
    #[serde(default)]
    pub equipped_weapons: Option<WeaponLoadout>,
    #[serde(default)]
    pub carried_weapons: Vec<String>,
    #[serde(default)]
    pub personality: PersonalityProfile,
    #[serde(default)]
    pub llm: Option<LlmSettings>,
}

/// The DM slot in the agents table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DmConfig {
    #[serde(default)]
    pub llm: LlmSettings,
}

/// The agents table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub dm: DmConfig,
    #[serde(default)]
    pub players: Vec<CharacterConfig>,
}

/// Enemy subsystem knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnemyAgentConfig {
    #[serde(default)]
    pub free_targeting_mode: bool,
}

/// The full session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default = "default_party_size")]
    pub party_size: usize,
    #[serde(default)]
    pub enable_human_interface: bool,
    /// ≤ 0 disables random vendor spawns.
    #[serde(default = "default_vendor_spawn_frequency")]
    pub vendor_spawn_frequency: i32,
    #[serde(default)]
    pub force_scenario: Option<String>,
    #[serde(default)]
    pub force_combat: bool,
    #[serde(default)]
    pub force_vendor_gate: bool,
    #[serde(default)]
    pub enemy_agents_enabled: bool,
    #[serde(default)]
    pub enemy_agent_config: EnemyAgentConfig,
    /// Seed for the shared dice roller. `None` rolls from entropy.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default)]
    pub agents: AgentsConfig,
}

fn default_session_name() -> String {
    "session".to_string()
}

fn default_max_turns() -> u32 {
    50
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_party_size() -> usize {
    2
}

fn default_vendor_spawn_frequency() -> i32 {
    -1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            max_turns: default_max_turns(),
            output_dir: default_output_dir(),
            socket_path: None,
            party_size: default_party_size(),
            enable_human_interface: false,
            vendor_spawn_frequency: default_vendor_spawn_frequency(),
            force_scenario: None,
            force_combat: false,
            force_vendor_gate: false,
            enemy_agents_enabled: false,
            enemy_agent_config: EnemyAgentConfig::default(),
            rng_seed: None,
            agents: AgentsConfig::default(),
        }
    }
}

/// Config loading failures — unrecoverable setup errors.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {}", msg),
        }
    }
}

impl Error for ConfigError {}

impl SessionConfig {
    /// Load from a JSON or YAML file, decided by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_config_with_defaults() {
        let raw = r#"{
            "session_name": "smoke",
            "max_turns": 5,
            "agents": {
                "dm": {"llm": {"model": "claude-sonnet-4-0"}},
                "players": [{
                    "name": "Zara Nightwhisper",
                    "faction": "Tempest Industries",
                    "attributes": {"Willpower": 4, "Agility": 3},
                    "skills": {"Astral Arts": 5},
                    "goals": ["Explore void manipulation"]
                }]
            }
        }"#;
        let config: SessionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.session_name, "smoke");
        assert_eq!(config.max_turns, 5);
        assert_eq!(config.party_size, 2);
        assert_eq!(config.vendor_spawn_frequency, -1);
        assert!(!config.enemy_agents_enabled);
        assert_eq!(config.agents.players.len(), 1);
        assert_eq!(config.agents.players[0].skills["Astral Arts"], 5);
    }

    #[test]
    fn test_yaml_config_round_trip() {
        let config = SessionConfig {
            session_name: "yaml_test".to_string(),
            rng_seed: Some(42),
            enemy_agents_enabled: true,
            enemy_agent_config: EnemyAgentConfig {
                free_targeting_mode: true,
            },
            ..Default::default()
        };
        let raw = serde_yaml::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed.session_name, "yaml_test");
        assert_eq!(parsed.rng_seed, Some(42));
        assert!(parsed.enemy_agent_config.free_targeting_mode);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = std::env::temp_dir().join(format!("voidtable_cfg_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);

        let yaml_path = dir.join("session.yaml");
        std::fs::write(&yaml_path, "session_name: from_yaml\nmax_turns: 3\n").unwrap();
        let config = SessionConfig::load(&yaml_path).unwrap();
        assert_eq!(config.session_name, "from_yaml");

        let json_path = dir.join("session.json");
        std::fs::write(&json_path, r#"{"session_name": "from_json"}"#).unwrap();
        let config = SessionConfig::load(&json_path).unwrap();
        assert_eq!(config.session_name, "from_json");

        assert!(SessionConfig::load(&dir.join("missing.json")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}

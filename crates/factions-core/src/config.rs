//! Configuration snapshot passed into every component constructor.
//!
//! Files are read by extension (RON, TOML, or JSON). Every field has a
//! default, so a config file only needs to list what it overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file has an extension we don't support.
    #[error("unsupported config format: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {source_name}: {detail}")]
    Parse { source_name: String, detail: String },

    /// A value is outside its allowed range.
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Sections
// ===========================================================================

/// Faction name rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameRules {
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for NameRules {
    fn default() -> Self {
        Self {
            min_length: 3,
            max_length: 16,
        }
    }
}

/// Membership limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberRules {
    /// Maximum members per faction. `0` means unlimited.
    pub max_members: usize,
}

impl Default for MemberRules {
    fn default() -> Self {
        Self { max_members: 20 }
    }
}

/// Power economy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Power a brand new player starts with.
    pub starting_power: f64,
    /// Per-player power ceiling.
    pub max_power: f64,
    /// Power required per claimed chunk. `<= 0` disables the power gate.
    pub power_per_claim: f64,
    /// Power lost on death.
    pub death_penalty: f64,
    /// Power regenerated per tick.
    pub regen_per_tick: f64,
    /// Regenerate only players currently flagged online.
    pub regen_online_only: bool,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            starting_power: 10.0,
            max_power: 10.0,
            power_per_claim: 1.0,
            death_penalty: 4.0,
            regen_per_tick: 0.2,
            regen_online_only: true,
        }
    }
}

/// Which worlds permit claiming. Deny wins over allow; an empty allow list
/// allows every world not denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl WorldFilter {
    pub fn allows(&self, world: &str) -> bool {
        if self.deny.iter().any(|w| w == world) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|w| w == world)
    }
}

/// Claim rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Absolute ceiling on claims per faction regardless of power.
    pub max_claims: usize,
    /// New claims must share an edge with an existing claim.
    pub require_adjacency: bool,
    /// A faction home must sit inside the faction's own territory.
    pub home_must_be_claimed: bool,
    pub worlds: WorldFilter,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_claims: 100,
            require_adjacency: false,
            home_must_be_claimed: false,
            worlds: WorldFilter::default(),
        }
    }
}

/// Diplomacy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiplomacyConfig {
    /// Age after which a pending ally request may be pruned.
    pub ally_request_timeout_secs: u64,
}

impl Default for DiplomacyConfig {
    fn default() -> Self {
        Self {
            ally_request_timeout_secs: 300,
        }
    }
}

// ===========================================================================
// FactionsConfig
// ===========================================================================

/// Complete configuration snapshot. Read-only once handed to a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactionsConfig {
    pub names: NameRules,
    pub members: MemberRules,
    pub power: PowerConfig,
    pub claims: ClaimConfig,
    pub diplomacy: DiplomacyConfig,
}

impl FactionsConfig {
    /// Load a config file, picking the format from its extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let source_name = path.display().to_string();
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("ron") => Self::parse_ron(&content, &source_name)?,
            Some("toml") => Self::parse_toml(&content, &source_name)?,
            Some("json") => Self::parse_json(&content, &source_name)?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    file: path.to_path_buf(),
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_toml(content, "<toml>")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_ron(content, "<ron>")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_json(content, "<json>")?;
        config.validate()?;
        Ok(config)
    }

    fn parse_toml(content: &str, source_name: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            source_name: source_name.to_string(),
            detail: e.to_string(),
        })
    }

    fn parse_ron(content: &str, source_name: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::Parse {
            source_name: source_name.to_string(),
            detail: e.to_string(),
        })
    }

    fn parse_json(content: &str, source_name: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            source_name: source_name.to_string(),
            detail: e.to_string(),
        })
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.names.min_length == 0 {
            return Err(ConfigError::Invalid {
                field: "names.min_length",
                reason: "must be at least 1".into(),
            });
        }
        if self.names.min_length > self.names.max_length {
            return Err(ConfigError::Invalid {
                field: "names.max_length",
                reason: format!(
                    "{} is below min_length {}",
                    self.names.max_length, self.names.min_length
                ),
            });
        }
        let p = &self.power;
        for (field, value) in [
            ("power.starting_power", p.starting_power),
            ("power.max_power", p.max_power),
            ("power.death_penalty", p.death_penalty),
            ("power.regen_per_tick", p.regen_per_tick),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} must be a finite non-negative number"),
                });
            }
        }
        if !p.power_per_claim.is_finite() {
            return Err(ConfigError::Invalid {
                field: "power.power_per_claim",
                reason: "must be finite".into(),
            });
        }
        if p.starting_power > p.max_power {
            return Err(ConfigError::Invalid {
                field: "power.starting_power",
                reason: format!("{} exceeds max_power {}", p.starting_power, p.max_power),
            });
        }
        Ok(())
    }
}

//! Configuration file support for nested context declarations
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! name: ctxNested
//!
//! levels:
//!   - name: segByString
//!     kind: keyed
//!     items:
//!       - event_type: SupportBean
//!         properties: [theString]
//!   - name: byRange
//!     kind: category
//!     event_type: SupportBean
//!     items:
//!       - label: low
//!         constraints:
//!           - property: intPrimitive
//!             op: { range: { low: 0, high: 10 } }
//!       - label: high
//!
//! manager:
//!   reuse_partition_ids: false
//!   max_partitions: 10000
//!
//! logging:
//!   level: debug
//!   format: json
//! ```

use crate::controller::{
    CategoryFactory, CategoryItem, ControllerFactory, EndCondition, HashFactory, InitTermFactory,
    KeyedFactory, KeyedItem, StartCondition, TemporalFactory,
};
use crate::error::{ConfigError, ContextError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// A nested context declaration plus manager and logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context name
    pub name: String,

    /// Nesting levels, outermost first
    pub levels: Vec<LevelConfig>,

    /// Orchestrator options
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One nesting level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Level name, unique within the declaration
    pub name: String,

    #[serde(flatten)]
    pub kind: LevelKind,
}

/// Partitioning scheme of one level
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LevelKind {
    Keyed {
        items: Vec<KeyedItem>,
    },
    Category {
        event_type: String,
        items: Vec<CategoryItem>,
    },
    Hash {
        event_type: String,
        property: String,
        granularity: i64,
        #[serde(default)]
        preallocate: bool,
    },
    InitiatedTerminated {
        start: StartCondition,
        end: EndCondition,
        #[serde(default)]
        overlapping: bool,
    },
    Temporal {
        start_ms: i64,
        end_ms: i64,
    },
}

/// Orchestrator options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ManagerConfig {
    /// Hand released partition ids out again before fresh ones
    pub reuse_partition_ids: bool,

    /// Refuse to start more leaf partitions than this
    pub max_partitions: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl ContextConfig {
    /// Load configuration from a file (auto-detects format from extension)
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> std::result::Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// One factory per level, outermost first.
    pub fn build_factories(&self) -> Result<Vec<Arc<dyn ControllerFactory>>> {
        if self.levels.is_empty() {
            return Err(ContextError::EmptyDeclaration(self.name.clone()));
        }
        let mut seen = HashSet::new();
        let mut factories: Vec<Arc<dyn ControllerFactory>> = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            if !seen.insert(level.name.as_str()) {
                return Err(ContextError::DuplicateContextName {
                    context: self.name.clone(),
                    name: level.name.clone(),
                });
            }
            factories.push(level.build()?);
        }
        Ok(factories)
    }
}

impl LevelConfig {
    fn build(&self) -> Result<Arc<dyn ControllerFactory>> {
        let name = self.name.clone();
        Ok(match &self.kind {
            LevelKind::Keyed { items } => Arc::new(KeyedFactory::new(name, items.clone())?),
            LevelKind::Category { event_type, items } => {
                Arc::new(CategoryFactory::new(name, event_type.clone(), items.clone())?)
            }
            LevelKind::Hash {
                event_type,
                property,
                granularity,
                preallocate,
            } => Arc::new(HashFactory::new(
                name,
                event_type.clone(),
                property.clone(),
                *granularity,
                *preallocate,
            )?),
            LevelKind::InitiatedTerminated {
                start,
                end,
                overlapping,
            } => Arc::new(InitTermFactory::new(
                name,
                start.clone(),
                end.clone(),
                *overlapping,
            )?),
            LevelKind::Temporal { start_ms, end_ms } => {
                Arc::new(TemporalFactory::new(name, *start_ms, *end_ms)?)
            }
        })
    }
}

//! Entity kinds under evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity under evaluation.
///
/// Prompt variants and structural change detection differ per kind, so
/// callers branch on this enum rather than on free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A single agent
    Agent,
    /// A team (crew) of cooperating agents
    Team,
    /// A flow: a multi-step workflow, possibly with human-in-the-loop points
    Flow,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Team => "team",
            Self::Flow => "flow",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "agent" | "agents" => Some(Self::Agent),
            "team" | "teams" | "crew" | "crews" => Some(Self::Team),
            "flow" | "flows" => Some(Self::Flow),
            _ => None,
        }
    }

    pub fn all() -> [Self; 3] {
        [Self::Agent, Self::Team, Self::Flow]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to one entity inside the specification document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Whether a user-supplied selector names this entity. A bare name
    /// matches every kind; `kind:name` matches one.
    pub fn matches(&self, selector: &str) -> bool {
        match selector.split_once(':') {
            Some((kind, name)) if EntityKind::from_str(kind).is_some() => {
                EntityKind::from_str(kind) == Some(self.kind) && name == self.name
            }
            _ => selector == self.name,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

//! Tracked entities and the principals that change them.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// =============================================================================
// Entity
// =============================================================================

/// A catalog record whose lifecycle is tracked by the revision ledger.
///
/// Implementors are plain values: every mutation produces a new value that
/// fully replaces the stored one.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Stable name of the entity type, recorded on every snapshot.
    const KIND: &'static str;

    /// Returns the entity's identifier.
    fn id(&self) -> &str;

    /// Returns the names of every blob this entity references.
    fn blob_names(&self) -> Vec<String>;

    /// Returns the keyed-lock key guarding this entity.
    fn key(&self) -> EntityKey {
        EntityKey::new(Self::KIND, self.id())
    }
}

/// Lock key for one entity: its type plus its identifier.
///
/// Including the type lets a single lock manager serve every entity type
/// without collisions between equal identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    kind: &'static str,
    id: String,
}

impl EntityKey {
    /// Creates a key for entity `id` of type `kind`.
    #[must_use]
    pub fn new(kind: &'static str, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Creates a key for entity `id` of type `T`.
    #[must_use]
    pub fn of<T: Entity>(id: impl Into<String>) -> Self {
        Self::new(T::KIND, id)
    }

    /// Returns the entity type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Returns the entity identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.kind, self.id)
    }
}

// =============================================================================
// Committer
// =============================================================================

/// The kind of principal responsible for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitterType {
    /// Background jobs and the service itself.
    System,
    /// A regular account.
    User,
    /// An account acting with moderation rights.
    Moderator,
}

impl fmt::Display for CommitterType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Moderator => "moderator",
        };
        formatter.write_str(name)
    }
}

/// Who made a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Committer {
    /// Account identifier, or `"system"`.
    pub id: String,
    /// Role the principal acted in.
    pub kind: CommitterType,
}

impl Committer {
    /// The service acting on its own behalf.
    #[must_use]
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            kind: CommitterType::System,
        }
    }

    /// A regular account.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: CommitterType::User,
        }
    }

    /// An account acting as moderator.
    #[must_use]
    pub fn moderator(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: CommitterType::Moderator,
        }
    }
}

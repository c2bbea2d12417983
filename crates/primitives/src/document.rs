use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one document across all reactors.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// A named partition of a document's state with its own operation log and
/// revision counter.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Scope {
    Global,
    Local,
    Document,
    /// A scope this build does not know about; carried verbatim so the wire
    /// stays forward-compatible.
    Custom(String),
}

impl Scope {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Global => "global",
            Self::Local => "local",
            Self::Document => "document",
            Self::Custom(name) => name,
        }
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        match s {
            "global" => Self::Global,
            "local" => Self::Local,
            "document" => Self::Document,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Serialize for Scope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}

/// A named lineage of a document's operation log.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Branch(String);

pub const DEFAULT_BRANCH: &str = "main";

impl Branch {
    #[must_use]
    pub fn main() -> Self {
        Self(DEFAULT_BRANCH.to_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Branch {
    fn default() -> Self {
        Self::main()
    }
}

impl From<&str> for Branch {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// The unit of ordering: jobs and operations are strictly FIFO within one
/// partition, unordered across partitions.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKey {
    pub document_id: DocumentId,
    pub scope: Scope,
    pub branch: Branch,
}

impl PartitionKey {
    #[must_use]
    pub fn new(document_id: DocumentId, scope: Scope, branch: Branch) -> Self {
        Self {
            document_id,
            scope,
            branch,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.document_id, self.scope, self.branch)
    }
}

#[derive(Debug, Error)]
#[error("invalid partition key: {0:?}")]
pub struct InvalidPartitionKey(String);

impl FromStr for PartitionKey {
    type Err = InvalidPartitionKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');

        match (parts.next(), parts.next(), parts.next()) {
            (Some(doc), Some(scope), Some(branch)) if !doc.is_empty() => Ok(Self {
                document_id: doc.into(),
                scope: scope.into(),
                branch: branch.into(),
            }),
            _ => Err(InvalidPartitionKey(s.to_owned())),
        }
    }
}

/// Document header: type and known branches.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHeader {
    pub document_id: DocumentId,
    pub document_type: String,
    pub branches: Vec<Branch>,
    pub created_at_utc_ms: u64,
}

impl DocumentHeader {
    #[must_use]
    pub fn new(document_id: DocumentId, document_type: impl Into<String>) -> Self {
        Self {
            document_id,
            document_type: document_type.into(),
            branches: vec![Branch::main()],
            created_at_utc_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_round_trips_through_strings() {
        assert_eq!(Scope::from("global"), Scope::Global);
        assert_eq!(Scope::from("document"), Scope::Document);
        assert_eq!(
            Scope::from("workspace"),
            Scope::Custom("workspace".to_owned())
        );
        assert_eq!(Scope::Global.as_str(), "global");
    }

    #[test]
    fn partition_key_parses() -> eyre::Result<()> {
        let key: PartitionKey = "doc-1/global/main".parse()?;

        assert_eq!(key.document_id.as_str(), "doc-1");
        assert_eq!(key.scope, Scope::Global);
        assert_eq!(key.branch.as_str(), "main");
        assert_eq!(key.to_string(), "doc-1/global/main");

        assert!("".parse::<PartitionKey>().is_err());
        assert!("doc-only".parse::<PartitionKey>().is_err());

        Ok(())
    }
}

// Mergeable edit units exchanged between clients and a session.
//
// A session never interprets a changeset: it applies it through the document,
// merges it into its pending broadcast, and forwards it. `YrsUpdate` is the
// production encoding (a Yjs v1 update); tests plug in their own types.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// An opaque, mergeable unit of document edits.
pub trait Changeset:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Fold `other` into `self` so that applying the result is equivalent to
    /// applying `self` then `other`.
    fn merge(&mut self, other: &Self) -> Result<(), ChangesetError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangesetError {
    #[error("changeset payload is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("failed to merge changesets: {0}")]
    Merge(String),
}

/// A Yjs v1 binary update, carried as base64 on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct YrsUpdate(Vec<u8>);

impl YrsUpdate {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, ChangesetError> {
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(|error| ChangesetError::InvalidEncoding(error.to_string()))
    }
}

impl fmt::Debug for YrsUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "YrsUpdate({} bytes)", self.0.len())
    }
}

impl Changeset for YrsUpdate {
    fn merge(&mut self, other: &Self) -> Result<(), ChangesetError> {
        let merged = yrs::merge_updates_v1(&[self.0.as_slice(), other.0.as_slice()])
            .map_err(|error| ChangesetError::Merge(error.to_string()))?;
        self.0 = merged;
        Ok(())
    }
}

impl Serialize for YrsUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for YrsUpdate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

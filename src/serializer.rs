use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Codec used to persist record envelopes.
///
/// `Bincode` is compact and is the default. `Json` keeps the persisted files
/// and nodes readable by administrative tooling. A store must be read with
/// the same codec it was written with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Bincode,
    Json,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordSerializer {
    kind: SerializerKind,
}

impl RecordSerializer {
    pub fn new(kind: SerializerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = match self.kind {
            SerializerKind::Bincode => bincode::serialize(value)?,
            SerializerKind::Json => serde_json::to_vec_pretty(value)?,
        };
        Ok(bytes)
    }

    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let value = match self.kind {
            SerializerKind::Bincode => bincode::deserialize(bytes)?,
            SerializerKind::Json => serde_json::from_slice(bytes)?,
        };
        Ok(value)
    }
}

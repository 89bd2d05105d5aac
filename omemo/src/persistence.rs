//! Snapshot persistence for the identity store
//!
//! One JSON document per account, human-inspectable (binary fields are
//! base64), written atomically via a temp file rename. The file is the
//! recovery surface for an account: losing it invalidates every session
//! established towards us.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OmemoError, Result};

/// Opaque serialized session state.
///
/// Underlying engines have emitted both textual and binary shapes over
/// time; both are stored as-is and dispatched on load.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "format", content = "data", rename_all = "lowercase")]
pub enum SessionRecord {
    Text(String),
    Binary(#[serde(with = "b64")] Vec<u8>),
}

impl SessionRecord {
    pub fn is_empty(&self) -> bool {
        match self {
            SessionRecord::Text(s) => s.is_empty(),
            SessionRecord::Binary(b) => b.is_empty(),
        }
    }

    /// The raw bytes of the record
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SessionRecord::Text(s) => s.as_bytes(),
            SessionRecord::Binary(b) => b.as_slice(),
        }
    }
}

/// Persisted signed pre-key
#[derive(Serialize, Deserialize, Clone)]
pub struct SignedPreKeySnapshot {
    pub id: u32,
    pub public: String,
    pub private: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted one-time pre-key
#[derive(Serialize, Deserialize, Clone)]
pub struct PreKeySnapshot {
    pub id: u32,
    pub public: String,
    pub private: String,
}

/// Serializable image of one account's identity store
#[derive(Serialize, Deserialize, Clone)]
pub struct Snapshot {
    pub account: String,
    pub device_id: u32,
    pub registration_id: u32,
    pub identity_seed: String,
    pub identity_public: String,
    pub signed_pre_key: SignedPreKeySnapshot,
    #[serde(default)]
    pub retired_signed_pre_keys: Vec<SignedPreKeySnapshot>,
    pub pre_keys: Vec<PreKeySnapshot>,
    /// Next one-time pre-key id to issue (0 in older snapshots)
    #[serde(default)]
    pub next_pre_key_id: u32,
    /// Sessions keyed `"peer-jid.device-id"`
    pub sessions: HashMap<String, SessionRecord>,
    /// Peer identity keys keyed `"peer-jid.device-id"`, base64
    pub identities: HashMap<String, String>,
}

/// File-backed snapshot storage for one account
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Storage for `account` under `data_dir`, or the conventional
    /// per-user configuration directory when no override is given.
    pub fn for_account(data_dir: Option<&Path>, account: &str) -> Self {
        let dir = match data_dir {
            Some(d) => d.to_path_buf(),
            None => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nightjar"),
        };
        // Account ids are JIDs; keep the filename filesystem-safe.
        let safe: String = account
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '@' { c } else { '_' })
            .collect();
        Self {
            path: dir.join(format!("omemo-{safe}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot already exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot, if present
    pub fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| OmemoError::PersistenceFailed(e.to_string()))?;
        let snapshot = serde_json::from_str(&text)?;
        Ok(Some(snapshot))
    }

    /// Write the snapshot atomically
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| OmemoError::PersistenceFailed(e.to_string()))?;
        }
        let text = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| OmemoError::PersistenceFailed(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| OmemoError::PersistenceFailed(e.to_string()))?;
        Ok(())
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(&s).map_err(serde::de::Error::custom)
    }
}

use anyhow::{Context, Result};
use tracing::warn;

use crate::db::Database;
use crate::models::{PersistedBundle, SessionPointer};

pub const BUNDLE_KEY: &str = "basket_data";
pub const SESSION_KEY: &str = "basket_session";

/// Synchronous, durable local storage for the persisted bundle and the
/// session pointer. Reads never fail: missing or corrupt blobs read as `None`.
/// The pair is always written and cleared together.
pub trait LocalCache: Send {
    fn read_bundle(&self) -> Option<PersistedBundle>;
    fn read_session(&self) -> Option<SessionPointer>;
    fn write_all(&self, session: &SessionPointer, bundle: &PersistedBundle) -> Result<()>;
    fn clear_all(&self) -> Result<()>;
}

fn read_json<T: serde::de::DeserializeOwned>(db: &Database, key: &str) -> Option<T> {
    let raw = match db.get_value(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, "local cache read failed, treating as empty: {e:#}");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, "local cache entry is corrupt, treating as empty: {e}");
            None
        }
    }
}

impl LocalCache for Database {
    fn read_bundle(&self) -> Option<PersistedBundle> {
        read_json::<PersistedBundle>(self, BUNDLE_KEY).map(PersistedBundle::normalized)
    }

    fn read_session(&self) -> Option<SessionPointer> {
        read_json::<SessionPointer>(self, SESSION_KEY).filter(|s| !s.email.trim().is_empty())
    }

    fn write_all(&self, session: &SessionPointer, bundle: &PersistedBundle) -> Result<()> {
        let session = serde_json::to_string(session).context("Failed to serialize session")?;
        let bundle = serde_json::to_string(bundle).context("Failed to serialize bundle")?;
        self.set_values(&[(SESSION_KEY, &session), (BUNDLE_KEY, &bundle)])
    }

    fn clear_all(&self) -> Result<()> {
        self.delete_values(&[SESSION_KEY, BUNDLE_KEY])
    }
}

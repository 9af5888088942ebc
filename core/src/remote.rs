use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::db::Database;
use crate::models::{PersistedBundle, RemoteBundle, UserProfile, normalize_email};

/// Cloud document store holding one bundle per user, keyed by normalized email.
///
/// `pull` returns `Ok(None)` when no document exists; transport failures are
/// `Err`. Implementations must apply [`normalize_email`] to every key.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn pull(&self, email: &str) -> Result<Option<RemoteBundle>>;
    async fn push(&self, email: &str, bundle: &PersistedBundle) -> Result<()>;
    async fn exists(&self, email: &str) -> Result<bool>;
    /// Privileged: every stored profile.
    async fn list_all(&self) -> Result<Vec<UserProfile>>;
}

/// SQLite-backed document store. Serves as the local-only stand-in when no
/// remote is configured, and as the backing store of `basket serve`.
pub struct DocumentStore {
    db: Mutex<Database>,
}

impl DocumentStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(&self, email: &str) -> Result<Option<RemoteBundle>> {
        let key = normalize_email(email);
        let Some(body) = self.lock().get_document(&key)? else {
            return Ok(None);
        };
        let bundle = serde_json::from_str(&body)
            .with_context(|| format!("Stored document for '{key}' is not a valid bundle"))?;
        Ok(Some(bundle))
    }

    pub fn save(&self, email: &str, bundle: &RemoteBundle) -> Result<()> {
        let key = normalize_email(email);
        let body = serde_json::to_string(bundle).context("Failed to serialize bundle")?;
        self.lock().put_document(&key, &body)
    }

    pub fn contains(&self, email: &str) -> Result<bool> {
        self.lock().document_exists(&normalize_email(email))
    }

    pub fn profiles(&self) -> Result<Vec<UserProfile>> {
        let bodies = self.lock().list_documents()?;
        let mut profiles = Vec::new();
        for body in bodies {
            match serde_json::from_str::<RemoteBundle>(&body) {
                Ok(RemoteBundle {
                    user: Some(user), ..
                }) => profiles.push(user.normalized()),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable document: {e}"),
            }
        }
        Ok(profiles)
    }
}

#[async_trait]
impl RemoteStore for DocumentStore {
    async fn pull(&self, email: &str) -> Result<Option<RemoteBundle>> {
        self.load(email)
    }

    async fn push(&self, email: &str, bundle: &PersistedBundle) -> Result<()> {
        self.save(email, &RemoteBundle::from(bundle.clone()))
    }

    async fn exists(&self, email: &str) -> Result<bool> {
        self.contains(email)
    }

    async fn list_all(&self) -> Result<Vec<UserProfile>> {
        self.profiles()
    }
}

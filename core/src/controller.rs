//! Reconciliation controller: owns the in-memory [`AppState`] and keeps it
//! consistent with the local cache and the remote store.
//!
//! Ordering rules:
//! - the local cache is seeded synchronously at construction, before `boot`;
//! - every tracked change writes the local cache synchronously, then restarts
//!   the debounced remote push;
//! - a write that would replace a non-empty stored history with an empty one
//!   is dropped once boot has finished. Logout is the only way to clear history.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::lookup_access_code;
use crate::cache::LocalCache;
use crate::extract::{Coach, NoWakeLock, ReceiptExtractor, Upload, WakeGuard, WakeLock};
use crate::insights::{budget_impact_pct, current_month_spend};
use crate::models::{
    AppState, ChatMessage, PersistedBundle, Receipt, Role, SessionPointer, UserProfile,
    cap_chat, cap_history, validate_email,
};
use crate::remote::RemoteStore;

/// Idle time after the last change before the bundle is pushed.
pub const PUSH_DEBOUNCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initializing,
    Syncing,
    Ready,
}

/// Foreground failures. `code()` is what lands in `AppState::error`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no account exists for that email")]
    UserNotFound,
    #[error("an account already exists for that email")]
    UserExists,
    #[error("access code not recognized")]
    InvalidAccessCode,
    #[error("{0}")]
    InvalidEmail(String),
    #[error("could not reach the remote store: {0}")]
    Connection(String),
    #[error("receipt could not be read")]
    ProcessingFailed,
    #[error("owner access required")]
    Forbidden,
    #[error("not signed in")]
    NotSignedIn,
    #[error("local cache could not be updated: {0}")]
    Storage(String),
}

impl SessionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::UserExists => "USER_EXISTS",
            Self::InvalidAccessCode => "INVALID_CODE",
            Self::InvalidEmail(_) => "INVALID_EMAIL",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::ProcessingFailed => "PROCESSING_FAILED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotSignedIn => "NOT_SIGNED_IN",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    fn connection(err: &anyhow::Error) -> Self {
        Self::Connection(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Write,
    /// No identity: anonymous state is never persisted.
    Anonymous,
    /// Proposed history is empty while the stored one is not.
    HistoryWipe,
}

/// Decide whether `proposed` may replace what the local cache holds.
#[must_use]
pub fn guard_decision(
    stored: Option<&PersistedBundle>,
    proposed: &PersistedBundle,
    booting: bool,
) -> GuardDecision {
    if !proposed.user.has_identity() {
        return GuardDecision::Anonymous;
    }
    let stored_has_history = stored.is_some_and(|s| !s.history.is_empty());
    if !booting && stored_has_history && proposed.history.is_empty() {
        return GuardDecision::HistoryWipe;
    }
    GuardDecision::Write
}

/// Sign-up form.
#[derive(Debug, Clone, Default)]
pub struct SignUp {
    pub name: String,
    pub email: String,
    pub access_code: String,
    pub monthly_budget: Option<f64>,
    pub dietary_regime: Option<String>,
    pub family_context: Option<String>,
    pub goals: Option<String>,
}

async fn push_bundle(remote: &dyn RemoteStore, email: &str, bundle: &PersistedBundle) -> Result<bool> {
    if !bundle.is_cloud_enabled || email.trim().is_empty() {
        debug!("cloud sync disabled, skipping push");
        return Ok(false);
    }
    remote.push(email, bundle).await?;
    info!(email, receipts = bundle.history.len(), "pushed bundle");
    Ok(true)
}

struct PendingPush {
    timer: JoinHandle<()>,
    fired: Arc<AtomicBool>,
    email: String,
    bundle: PersistedBundle,
}

/// Trailing debounce: each schedule cancels the previous timer. A push that
/// has already started runs to completion on its own task.
struct PushScheduler {
    delay: Duration,
    pending: Option<PendingPush>,
}

impl PushScheduler {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    fn schedule(&mut self, remote: Arc<dyn RemoteStore>, email: String, bundle: PersistedBundle) {
        self.cancel();
        let delay = self.delay;
        let fired = Arc::new(AtomicBool::new(false));
        let task_fired = Arc::clone(&fired);
        let task_email = email.clone();
        let task_bundle = bundle.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task_fired.store(true, Ordering::SeqCst);
            let push = tokio::spawn(async move {
                if let Err(e) = push_bundle(remote.as_ref(), &task_email, &task_bundle).await {
                    warn!("background push failed: {e:#}");
                }
            });
            let _ = push.await;
        });
        self.pending = Some(PendingPush {
            timer,
            fired,
            email,
            bundle,
        });
    }

    fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
        }
    }

    fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| !p.fired.load(Ordering::SeqCst))
    }

    /// Fire a waiting push now, or wait for one already under way.
    async fn flush(&mut self, remote: &dyn RemoteStore) -> Result<bool> {
        let Some(pending) = self.pending.take() else {
            return Ok(false);
        };
        if pending.fired.load(Ordering::SeqCst) {
            let _ = pending.timer.await;
            return Ok(false);
        }
        pending.timer.abort();
        push_bundle(remote, &pending.email, &pending.bundle).await
    }
}

pub struct Controller {
    state: AppState,
    phase: Phase,
    cache: Box<dyn LocalCache>,
    remote: Arc<dyn RemoteStore>,
    wake_lock: Arc<dyn WakeLock>,
    scheduler: PushScheduler,
}

impl Controller {
    /// Seed state from the local cache synchronously. Call [`Controller::boot`]
    /// next to restore the session from the remote store.
    pub fn new(cache: Box<dyn LocalCache>, remote: Arc<dyn RemoteStore>) -> Self {
        let state = match cache.read_bundle() {
            Some(bundle) => {
                debug!(receipts = bundle.history.len(), "seeded state from local cache");
                AppState::from_bundle(bundle)
            }
            None => AppState::default(),
        };
        Self {
            state,
            phase: Phase::Initializing,
            cache,
            remote,
            wake_lock: Arc::new(NoWakeLock),
            scheduler: PushScheduler::new(PUSH_DEBOUNCE),
        }
    }

    #[must_use]
    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.scheduler.delay = delay;
        self
    }

    #[must_use]
    pub fn with_wake_lock(mut self, lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = lock;
        self
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn cache(&self) -> &dyn LocalCache {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn has_pending_push(&self) -> bool {
        self.scheduler.is_pending()
    }

    pub fn clear_error(&mut self) {
        self.state.error = None;
    }

    /// Restore the session: pull the remote bundle for the cached session
    /// email and merge it over the cache-seeded state. Pull failures keep the
    /// local state and are only logged. Runs once.
    pub async fn boot(&mut self) {
        if self.phase != Phase::Initializing {
            return;
        }
        let Some(session) = self.cache.read_session() else {
            self.phase = Phase::Ready;
            return;
        };

        self.phase = Phase::Syncing;
        let before = self.state.clone();
        match self.remote.pull(&session.email).await {
            Ok(Some(remote)) => {
                let local_saved = self.cache.read_bundle().and_then(|b| b.saved_at);
                if let (Some(local), Some(remote_saved)) = (local_saved, remote.saved_at) {
                    if remote_saved < local {
                        warn!(
                            %local,
                            remote = %remote_saved,
                            "remote bundle is older than the local cache; remote wins"
                        );
                    }
                }
                self.state.merge_remote(remote);
                if !self.state.profile.has_identity() {
                    self.state.profile.email.clone_from(&session.email);
                }
            }
            Ok(None) => info!(email = %session.email, "no remote bundle for session"),
            Err(e) => warn!("session restore failed, keeping local state: {e:#}"),
        }
        self.phase = Phase::Ready;

        if self.state != before {
            self.persist();
        }
    }

    /// Pull the signed-in user's bundle again and merge it (foreground).
    pub async fn refresh(&mut self) -> Result<(), SessionError> {
        if !self.state.profile.has_identity() {
            return self.fail(SessionError::NotSignedIn);
        }
        let email = self.state.profile.email.clone();
        match self.remote.pull(&email).await {
            Ok(Some(remote)) => {
                self.state.merge_remote(remote);
                self.persist();
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => self.fail(SessionError::connection(&e)),
        }
    }

    // --- Persistence ---

    /// Write the current state to the local cache (subject to the history
    /// guard) and restart the debounced remote push.
    fn persist(&mut self) {
        let mut proposed = self.state.to_bundle();
        let stored = self.cache.read_bundle();
        match guard_decision(stored.as_ref(), &proposed, self.phase != Phase::Ready) {
            GuardDecision::Write => {}
            GuardDecision::Anonymous => {
                debug!("anonymous state, not persisting");
                return;
            }
            GuardDecision::HistoryWipe => {
                warn!("refusing to replace stored history with an empty one");
                return;
            }
        }

        proposed.saved_at = Some(Utc::now());
        let email = self.state.profile.email.clone();
        let session = SessionPointer {
            email: email.clone(),
        };
        if let Err(e) = self.cache.write_all(&session, &proposed) {
            warn!("failed to write local cache: {e:#}");
            return;
        }
        self.scheduler
            .schedule(Arc::clone(&self.remote), email, proposed);
    }

    /// Push a waiting debounced change immediately. Short-lived processes call
    /// this before exiting.
    pub async fn flush(&mut self) -> Result<bool> {
        self.scheduler.flush(self.remote.as_ref()).await
    }

    fn fail<T>(&mut self, err: SessionError) -> Result<T, SessionError> {
        self.state.is_loading = false;
        self.state.error = Some(err.code().to_string());
        Err(err)
    }

    fn require_identity(&mut self) -> Result<(), SessionError> {
        if self.state.profile.has_identity() {
            Ok(())
        } else {
            self.fail(SessionError::NotSignedIn)
        }
    }

    /// Hand over the cache to `email`. A cached pair that belongs to another
    /// account is pushed if a push was waiting, then cleared, so the history
    /// guard never compares the new account against the old one.
    async fn switch_account(&mut self, email: &str) -> Result<(), SessionError> {
        let stored = self.cache.read_bundle().map(|b| b.user.email);
        let session = self.cache.read_session().map(|s| s.email);
        if stored.iter().chain(session.iter()).all(|e| e == email) {
            return Ok(());
        }
        if let Err(e) = self.flush().await {
            warn!("push for the previous account failed: {e:#}");
        }
        if let Err(e) = self.cache.clear_all() {
            return self.fail(SessionError::Storage(format!("{e:#}")));
        }
        info!(previous = ?stored.or(session), %email, "switched account, local cache cleared");
        Ok(())
    }

    // --- Session ---

    pub async fn sign_in(&mut self, email: &str) -> Result<(), SessionError> {
        let email = match validate_email(email) {
            Ok(email) => email,
            Err(e) => return self.fail(SessionError::InvalidEmail(e.to_string())),
        };
        self.state.is_loading = true;
        self.state.error = None;

        match self.remote.pull(&email).await {
            Ok(Some(remote)) => {
                let mut bundle = remote.into_bundle();
                if !bundle.user.has_identity() {
                    bundle.user.email.clone_from(&email);
                }
                self.switch_account(&email).await?;
                self.state = AppState::from_bundle(bundle);
                self.phase = Phase::Ready;
                info!(%email, "signed in");
                self.persist();
                Ok(())
            }
            Ok(None) => self.fail(SessionError::UserNotFound),
            Err(e) => self.fail(SessionError::connection(&e)),
        }
    }

    /// Create a local account. Nothing is written remotely here; the normal
    /// persistence path pushes the new bundle.
    pub async fn sign_up(&mut self, form: SignUp) -> Result<(), SessionError> {
        let email = match validate_email(&form.email) {
            Ok(email) => email,
            Err(e) => return self.fail(SessionError::InvalidEmail(e.to_string())),
        };
        let Some(grant) = lookup_access_code(&form.access_code) else {
            return self.fail(SessionError::InvalidAccessCode);
        };
        self.state.is_loading = true;
        self.state.error = None;

        match self.remote.exists(&email).await {
            Ok(false) => {}
            Ok(true) => return self.fail(SessionError::UserExists),
            Err(e) => return self.fail(SessionError::connection(&e)),
        }
        self.switch_account(&email).await?;

        let defaults = UserProfile::default();
        let profile = UserProfile {
            name: form.name,
            email: email.clone(),
            dietary_regime: form.dietary_regime.unwrap_or(defaults.dietary_regime),
            monthly_budget: form.monthly_budget.unwrap_or(defaults.monthly_budget),
            family_context: form.family_context.unwrap_or_default(),
            goals: form.goals.unwrap_or_default(),
            account_status: grant.status,
            role: grant.role,
            joined_at: Utc::now().to_rfc3339(),
            promo_code: Some(form.access_code.trim().to_uppercase()),
            ..defaults
        }
        .normalized();

        self.state = AppState {
            profile,
            ..AppState::default()
        };
        self.phase = Phase::Ready;
        info!(%email, "signed up");
        self.persist();
        Ok(())
    }

    /// Discard identity and cached data, bypassing the history guard.
    pub fn logout(&mut self) -> Result<()> {
        self.scheduler.cancel();
        let cleared = self.cache.clear_all();
        self.state = AppState::default();
        self.phase = Phase::Ready;
        cleared
    }

    // --- Tracked mutations ---

    /// Replace the profile from the settings form. Identity, role, and
    /// account status are kept.
    pub fn update_profile(&mut self, profile: UserProfile) -> Result<(), SessionError> {
        self.require_identity()?;
        let current = &self.state.profile;
        let mut profile = UserProfile {
            email: current.email.clone(),
            role: current.role,
            account_status: current.account_status,
            joined_at: current.joined_at.clone(),
            promo_code: current.promo_code.clone(),
            ..profile
        }
        .normalized();
        profile.current_spend = current_month_spend(&self.state.history, Local::now().date_naive());
        self.state.profile = profile;
        self.persist();
        Ok(())
    }

    pub fn set_cloud_enabled(&mut self, enabled: bool) {
        if self.state.is_cloud_enabled == enabled {
            return;
        }
        self.state.is_cloud_enabled = enabled;
        self.persist();
    }

    /// Save a new or edited receipt. An existing id is replaced in place;
    /// otherwise the receipt becomes the newest history entry.
    pub fn save_receipt(&mut self, receipt: Receipt) -> Receipt {
        let mut receipt = receipt.normalized(self.state.profile.categories());
        if receipt.analysis.budget_impact_pct <= 0.0 {
            receipt.analysis.budget_impact_pct =
                budget_impact_pct(receipt.metadata.total_spent, self.state.profile.monthly_budget);
        }

        if let Some(slot) = self.state.history.iter_mut().find(|r| r.id == receipt.id) {
            *slot = receipt.clone();
        } else {
            self.state.history.insert(0, receipt.clone());
            cap_history(&mut self.state.history);
        }
        self.state.profile.current_spend =
            current_month_spend(&self.state.history, Local::now().date_naive());
        self.state.current_analysis = Some(receipt.clone());
        self.persist();
        receipt
    }

    /// Run each upload through the extractor and save the results. The batch
    /// stops at the first failure; receipts saved before it are kept.
    pub async fn process_uploads(
        &mut self,
        extractor: &dyn ReceiptExtractor,
        uploads: &[Upload],
    ) -> Result<Vec<Receipt>, SessionError> {
        let lock = Arc::clone(&self.wake_lock);
        let _awake = WakeGuard::acquire(lock.as_ref());
        self.state.is_loading = true;
        self.state.error = None;

        let mut saved = Vec::with_capacity(uploads.len());
        for upload in uploads {
            match extractor.extract(upload, &self.state.profile).await {
                Ok(mut receipt) => {
                    receipt.id = Uuid::new_v4().to_string();
                    receipt.image_ref = Some(upload.file_name.clone());
                    saved.push(self.save_receipt(receipt));
                }
                Err(e) => {
                    warn!(file = %upload.file_name, "receipt processing failed: {e:#}");
                    return self.fail(SessionError::ProcessingFailed);
                }
            }
        }

        self.state.is_loading = false;
        Ok(saved)
    }

    /// Append a user message, ask the coach, append the reply.
    pub async fn send_chat(&mut self, coach: &dyn Coach, text: &str) -> Result<String, SessionError> {
        self.state.chat_history.push(ChatMessage::user(text.trim()));
        cap_chat(&mut self.state.chat_history);
        self.persist();

        self.state.is_loading = true;
        let reply = coach
            .reply(
                &self.state.profile,
                &self.state.history,
                &self.state.chat_history,
            )
            .await;
        match reply {
            Ok(reply) => {
                self.state.is_loading = false;
                self.state.chat_history.push(ChatMessage::model(reply.clone()));
                cap_chat(&mut self.state.chat_history);
                self.persist();
                Ok(reply)
            }
            Err(e) => {
                warn!("coach reply failed: {e:#}");
                self.fail(SessionError::connection(&e))
            }
        }
    }

    /// Every stored profile. Owner role only.
    pub async fn admin_profiles(&mut self) -> Result<Vec<UserProfile>, SessionError> {
        if self.state.profile.role != Role::Owner {
            return self.fail(SessionError::Forbidden);
        }
        match self.remote.list_all().await {
            Ok(profiles) => Ok(profiles),
            Err(e) => self.fail(SessionError::connection(&e)),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.scheduler.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::cache::{BUNDLE_KEY, SESSION_KEY};
    use crate::db::Database;
    use crate::models::{AccountStatus, Item, RemoteBundle, ReceiptMetadata};

    const EMAIL: &str = "jane@example.com";

    #[derive(Default)]
    struct FakeRemote {
        docs: Mutex<HashMap<String, RemoteBundle>>,
        pushes: Mutex<Vec<(String, PersistedBundle)>>,
        exists_checks: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeRemote {
        fn with_doc(email: &str, doc: RemoteBundle) -> Self {
            let remote = Self::default();
            remote.docs.lock().unwrap().insert(email.to_string(), doc);
            remote
        }

        fn failing() -> Self {
            let remote = Self::default();
            remote.fail.store(true, Ordering::SeqCst);
            remote
        }

        fn check(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("network unreachable");
            }
            Ok(())
        }

        fn pushes(&self) -> Vec<(String, PersistedBundle)> {
            self.pushes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn pull(&self, email: &str) -> Result<Option<RemoteBundle>> {
            self.check()?;
            Ok(self.docs.lock().unwrap().get(email).cloned())
        }

        async fn push(&self, email: &str, bundle: &PersistedBundle) -> Result<()> {
            self.check()?;
            self.pushes
                .lock()
                .unwrap()
                .push((email.to_string(), bundle.clone()));
            Ok(())
        }

        async fn exists(&self, email: &str) -> Result<bool> {
            self.check()?;
            self.exists_checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.docs.lock().unwrap().contains_key(email))
        }

        async fn list_all(&self) -> Result<Vec<UserProfile>> {
            self.check()?;
            Ok(self
                .docs
                .lock()
                .unwrap()
                .values()
                .filter_map(|d| d.user.clone())
                .collect())
        }
    }

    fn profile(email: &str) -> UserProfile {
        UserProfile {
            name: "Jane".to_string(),
            email: email.to_string(),
            ..UserProfile::default()
        }
    }

    fn receipt(id: &str, total: f64) -> Receipt {
        Receipt {
            id: id.to_string(),
            metadata: ReceiptMetadata {
                store_name: "FreshMart".to_string(),
                date: Local::now().date_naive().format("%Y-%m-%d").to_string(),
                total_spent: total,
                ..ReceiptMetadata::default()
            },
            items: vec![Item {
                raw_name: "BREAD".to_string(),
                name: "Bread".to_string(),
                category: "bakery".to_string(),
                quantity: 1.0,
                unit_price: total,
                total_price: total,
                ..Item::default()
            }],
            ..Receipt::default()
        }
    }

    fn bundle_with(receipts: usize, cloud: bool) -> PersistedBundle {
        PersistedBundle {
            user: profile(EMAIL),
            history: (0..receipts).map(|i| receipt(&format!("r{i}"), 10.0)).collect(),
            chat_history: Vec::new(),
            is_cloud_enabled: cloud,
            saved_at: None,
        }
    }

    fn cache_with(bundle: Option<&PersistedBundle>, session: bool) -> Box<dyn LocalCache> {
        let db = Database::open_in_memory().unwrap();
        let mut entries = Vec::new();
        if let Some(bundle) = bundle {
            entries.push((BUNDLE_KEY, serde_json::to_string(bundle).unwrap()));
        }
        if session {
            let pointer = SessionPointer {
                email: EMAIL.to_string(),
            };
            entries.push((SESSION_KEY, serde_json::to_string(&pointer).unwrap()));
        }
        let entries: Vec<(&str, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
        db.set_values(&entries).unwrap();
        Box::new(db)
    }

    async fn booted(cache: Box<dyn LocalCache>, remote: &Arc<FakeRemote>) -> Controller {
        let remote: Arc<dyn RemoteStore> = Arc::clone(remote) as Arc<dyn RemoteStore>;
        let mut ctl = Controller::new(cache, remote);
        ctl.boot().await;
        ctl
    }

    // --- Guard ---

    #[test]
    fn test_guard_blocks_history_wipe_after_boot() {
        let stored = bundle_with(3, true);
        let proposed = bundle_with(0, true);
        assert_eq!(
            guard_decision(Some(&stored), &proposed, false),
            GuardDecision::HistoryWipe
        );
        assert_eq!(
            guard_decision(Some(&stored), &proposed, true),
            GuardDecision::Write
        );
    }

    #[test]
    fn test_guard_allows_when_stored_empty_or_absent() {
        let proposed = bundle_with(0, true);
        assert_eq!(guard_decision(None, &proposed, false), GuardDecision::Write);
        assert_eq!(
            guard_decision(Some(&bundle_with(0, false)), &proposed, false),
            GuardDecision::Write
        );
        assert_eq!(
            guard_decision(Some(&bundle_with(2, true)), &bundle_with(1, true), false),
            GuardDecision::Write
        );
    }

    #[test]
    fn test_guard_skips_anonymous() {
        let mut proposed = bundle_with(1, true);
        proposed.user.email = "  ".to_string();
        assert_eq!(guard_decision(None, &proposed, false), GuardDecision::Anonymous);
    }

    #[tokio::test]
    async fn test_history_wipe_leaves_cache_untouched() {
        let stored = bundle_with(4, true);
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&stored), false), &remote).await;
        assert_eq!(ctl.phase(), Phase::Ready);

        let before = ctl.cache().read_bundle().unwrap();
        ctl.state.history.clear();
        ctl.state.is_cloud_enabled = false;
        ctl.persist();

        assert_eq!(ctl.cache().read_bundle().unwrap(), before);
        assert!(!ctl.has_pending_push());
    }

    #[tokio::test]
    async fn test_write_over_empty_cache_stores_proposed() {
        let stored = bundle_with(0, true);
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&stored), false), &remote).await;

        ctl.set_cloud_enabled(false);
        let cached = ctl.cache().read_bundle().unwrap();
        let mut expected = ctl.state().to_bundle();
        expected.saved_at = cached.saved_at;
        assert_eq!(cached, expected);
        assert_eq!(ctl.cache().read_session().unwrap().email, EMAIL);
    }

    #[tokio::test]
    async fn test_anonymous_state_not_persisted() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(None, false), &remote).await;
        ctl.save_receipt(receipt("r1", 5.0));
        assert_eq!(ctl.state().history.len(), 1);
        assert!(ctl.cache().read_bundle().is_none());
        assert!(ctl.cache().read_session().is_none());
    }

    // --- Debounce ---

    #[tokio::test(start_paused = true)]
    async fn test_rapid_changes_collapse_into_one_push() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(1, true)), false), &remote).await;

        for i in 0..3 {
            ctl.save_receipt(receipt(&format!("new{i}"), 1.0 + f64::from(i)));
            // Every change is written locally right away
            assert_eq!(ctl.cache().read_bundle().unwrap().history[0].id, format!("new{i}"));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(remote.pushes().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let pushes = remote.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, EMAIL);
        let ids: Vec<&str> = pushes[0].1.history.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new2", "new1", "new0", "r0"]);
        assert!(!ctl.has_pending_push());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_skipped_when_cloud_disabled() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(1, false)), false), &remote).await;
        ctl.save_receipt(receipt("r9", 3.0));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(remote.pushes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_failure_keeps_local_state() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(1, true)), false), &remote).await;
        remote.fail.store(true, Ordering::SeqCst);

        ctl.save_receipt(receipt("r9", 3.0));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(ctl.state().history.len(), 2);
        assert_eq!(ctl.cache().read_bundle().unwrap().history.len(), 2);
        assert!(ctl.state().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_push() {
        let remote = Arc::new(FakeRemote::default());
        {
            let mut ctl = booted(cache_with(Some(&bundle_with(1, true)), false), &remote).await;
            ctl.save_receipt(receipt("r9", 3.0));
            assert!(ctl.has_pending_push());
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(remote.pushes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_pushes_latest_immediately() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(1, true)), false), &remote).await;
        ctl.save_receipt(receipt("a", 1.0));
        ctl.save_receipt(receipt("b", 2.0));

        assert!(ctl.flush().await.unwrap());
        let pushes = remote.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1.history[0].id, "b");

        // Timer was cancelled: nothing more arrives later
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.pushes().len(), 1);
        assert!(!ctl.flush().await.unwrap());
    }

    // --- Boot ---

    #[tokio::test]
    async fn test_boot_without_session_uses_cache() {
        let remote = Arc::new(FakeRemote::with_doc(
            EMAIL,
            RemoteBundle::from(bundle_with(7, true)),
        ));
        let ctl = booted(cache_with(Some(&bundle_with(2, true)), false), &remote).await;
        assert_eq!(ctl.phase(), Phase::Ready);
        assert_eq!(ctl.state().history.len(), 2);
    }

    #[tokio::test]
    async fn test_boot_remote_overrides_overlapping_fields() {
        let mut remote_bundle = bundle_with(5, false);
        remote_bundle.user.name = "Jane Remote".to_string();
        let remote = Arc::new(FakeRemote::with_doc(EMAIL, RemoteBundle::from(remote_bundle)));

        let ctl = booted(cache_with(Some(&bundle_with(2, true)), true), &remote).await;
        assert_eq!(ctl.phase(), Phase::Ready);
        assert_eq!(ctl.state().profile.name, "Jane Remote");
        assert_eq!(ctl.state().history.len(), 5);
        assert!(!ctl.state().is_cloud_enabled);
        // The merged state is written back locally
        assert_eq!(ctl.cache().read_bundle().unwrap().history.len(), 5);
    }

    #[tokio::test]
    async fn test_boot_partial_remote_preserves_local_fields() {
        let partial = RemoteBundle {
            is_cloud_enabled: Some(false),
            ..RemoteBundle::default()
        };
        let remote = Arc::new(FakeRemote::with_doc(EMAIL, partial));
        let ctl = booted(cache_with(Some(&bundle_with(3, true)), true), &remote).await;
        assert_eq!(ctl.state().history.len(), 3);
        assert_eq!(ctl.state().profile.name, "Jane");
        assert!(!ctl.state().is_cloud_enabled);
    }

    #[tokio::test]
    async fn test_boot_pull_failure_keeps_cache() {
        let remote = Arc::new(FakeRemote::failing());
        let cached = bundle_with(12, false);
        let ctl = booted(cache_with(Some(&cached), true), &remote).await;

        assert_eq!(ctl.phase(), Phase::Ready);
        assert_eq!(ctl.state().history.len(), 12);
        assert!(!ctl.state().is_cloud_enabled);
        assert!(ctl.state().error.is_none());
        assert_eq!(ctl.state(), &AppState::from_bundle(cached));
    }

    #[tokio::test]
    async fn test_boot_pull_failure_without_cache_uses_defaults() {
        let remote = Arc::new(FakeRemote::failing());
        let ctl = booted(cache_with(None, true), &remote).await;
        assert_eq!(ctl.state(), &AppState::default());
        assert!(ctl.state().error.is_none());
    }

    #[tokio::test]
    async fn test_boot_null_pull_keeps_cache() {
        let remote = Arc::new(FakeRemote::default());
        let ctl = booted(cache_with(Some(&bundle_with(2, true)), true), &remote).await;
        assert_eq!(ctl.state().history.len(), 2);
    }

    #[tokio::test]
    async fn test_boot_runs_once() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(1, true)), true), &remote).await;
        remote.docs.lock().unwrap().insert(
            EMAIL.to_string(),
            RemoteBundle::from(bundle_with(9, true)),
        );
        ctl.boot().await;
        assert_eq!(ctl.state().history.len(), 1);
    }

    #[tokio::test]
    async fn test_boot_empty_remote_history_does_not_wipe_cache() {
        // In-memory follows the remote, disk keeps its copy
        let remote = Arc::new(FakeRemote::with_doc(
            EMAIL,
            RemoteBundle::from(bundle_with(0, true)),
        ));
        let ctl = booted(cache_with(Some(&bundle_with(4, true)), true), &remote).await;
        assert!(ctl.state().history.is_empty());
        assert_eq!(ctl.cache().read_bundle().unwrap().history.len(), 4);
    }

    #[tokio::test]
    async fn test_boot_blank_remote_email_keeps_session_identity() {
        let mut doc = bundle_with(2, true);
        doc.user.email = String::new();
        let remote = Arc::new(FakeRemote::with_doc(EMAIL, RemoteBundle::from(doc)));
        let mut ctl = booted(cache_with(Some(&bundle_with(2, true)), true), &remote).await;
        assert_eq!(ctl.state().profile.email, EMAIL);

        ctl.save_receipt(receipt("later", 4.0));
        let cached = ctl.cache().read_bundle().unwrap();
        assert!(cached.history.iter().any(|r| r.id == "later"));
        assert!(ctl.has_pending_push());
    }

    #[tokio::test]
    async fn test_boot_blank_remote_email_without_cached_bundle() {
        let mut doc = bundle_with(1, true);
        doc.user.email = "  ".to_string();
        let remote = Arc::new(FakeRemote::with_doc(EMAIL, RemoteBundle::from(doc)));
        let ctl = booted(cache_with(None, true), &remote).await;
        assert_eq!(ctl.state().profile.email, EMAIL);
        assert_eq!(ctl.cache().read_bundle().unwrap().user.email, EMAIL);
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_treated_as_empty() {
        let db = Database::open_in_memory().unwrap();
        db.set_values(&[(BUNDLE_KEY, "{{{")]).unwrap();
        let remote = Arc::new(FakeRemote::default());
        let ctl = booted(Box::new(db), &remote).await;
        assert_eq!(ctl.state(), &AppState::default());
    }

    // --- Session flows ---

    #[tokio::test]
    async fn test_sign_up_with_master_key() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(None, false), &remote).await;

        ctl.sign_up(SignUp {
            name: "Jane".to_string(),
            email: "Jane@Example.com".to_string(),
            access_code: "MASTER_KEY".to_string(),
            monthly_budget: Some(450.0),
            ..SignUp::default()
        })
        .await
        .unwrap();

        assert_eq!(remote.exists_checks.load(Ordering::SeqCst), 1);
        let profile = &ctl.state().profile;
        assert_eq!(profile.email, EMAIL);
        assert_eq!(profile.account_status, AccountStatus::Active);
        assert_eq!(profile.role, Role::User);
        assert_eq!(profile.promo_code.as_deref(), Some("MASTER_KEY"));
        assert!((profile.monthly_budget - 450.0).abs() < f64::EPSILON);
        assert!(!profile.joined_at.is_empty());

        // No direct remote write; local cache holds the new account
        assert!(remote.pushes().is_empty());
        assert_eq!(ctl.cache().read_session().unwrap().email, EMAIL);
    }

    #[tokio::test]
    async fn test_sign_up_existing_email() {
        let remote = Arc::new(FakeRemote::with_doc(EMAIL, RemoteBundle::default()));
        let mut ctl = booted(cache_with(None, false), &remote).await;
        let err = ctl
            .sign_up(SignUp {
                email: EMAIL.to_string(),
                access_code: "MASTER_KEY".to_string(),
                ..SignUp::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "USER_EXISTS");
        assert_eq!(ctl.state().error.as_deref(), Some("USER_EXISTS"));
        assert!(!ctl.state().profile.has_identity());
    }

    #[tokio::test]
    async fn test_sign_up_bad_code_skips_remote() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(None, false), &remote).await;
        let err = ctl
            .sign_up(SignUp {
                email: EMAIL.to_string(),
                access_code: "NOPE".to_string(),
                ..SignUp::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CODE");
        assert_eq!(remote.exists_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sign_up_transport_error() {
        let remote = Arc::new(FakeRemote::failing());
        let mut ctl = booted(cache_with(None, false), &remote).await;
        let err = ctl
            .sign_up(SignUp {
                email: EMAIL.to_string(),
                access_code: "MASTER_KEY".to_string(),
                ..SignUp::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(!ctl.state().is_loading);
    }

    #[tokio::test]
    async fn test_sign_in_not_found() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(None, false), &remote).await;
        let before = ctl.state().profile.clone();

        let err = ctl.sign_in(EMAIL).await.unwrap_err();
        assert_eq!(err.code(), "USER_NOT_FOUND");
        assert_eq!(ctl.state().error.as_deref(), Some("USER_NOT_FOUND"));
        assert_eq!(ctl.state().profile, before);
        assert!(!ctl.state().is_loading);
    }

    #[tokio::test]
    async fn test_sign_in_transport_error_is_distinct() {
        let remote = Arc::new(FakeRemote::failing());
        let mut ctl = booted(cache_with(None, false), &remote).await;
        let err = ctl.sign_in(EMAIL).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    #[tokio::test]
    async fn test_sign_in_replaces_state() {
        let remote = Arc::new(FakeRemote::with_doc(
            EMAIL,
            RemoteBundle::from(bundle_with(3, true)),
        ));
        let mut ctl = booted(cache_with(None, false), &remote).await;
        ctl.state.error = Some("USER_NOT_FOUND".to_string());

        ctl.sign_in("  JANE@example.com").await.unwrap();
        assert_eq!(ctl.state().profile.email, EMAIL);
        assert_eq!(ctl.state().history.len(), 3);
        assert!(ctl.state().error.is_none());
        assert!(!ctl.state().is_loading);
        assert_eq!(ctl.cache().read_bundle().unwrap().history.len(), 3);
    }

    #[tokio::test]
    async fn test_sign_in_invalid_email() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(None, false), &remote).await;
        let err = ctl.sign_in("not-an-email").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_EMAIL");
    }

    #[tokio::test]
    async fn test_sign_up_over_other_account_survives_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basket.db");
        let jane = bundle_with(3, true);
        Database::open(&path)
            .unwrap()
            .write_all(
                &SessionPointer {
                    email: EMAIL.to_string(),
                },
                &jane,
            )
            .unwrap();

        let remote = Arc::new(FakeRemote::default());
        {
            let mut ctl = booted(Box::new(Database::open(&path).unwrap()), &remote).await;
            assert_eq!(ctl.state().history.len(), 3);
            ctl.sign_up(SignUp {
                name: "Bob".to_string(),
                email: "bob@example.com".to_string(),
                access_code: "MASTER_KEY".to_string(),
                ..SignUp::default()
            })
            .await
            .unwrap();
            assert_eq!(ctl.cache().read_session().unwrap().email, "bob@example.com");
            assert!(ctl.cache().read_bundle().unwrap().history.is_empty());
            assert!(ctl.has_pending_push());
        }

        let ctl = booted(Box::new(Database::open(&path).unwrap()), &remote).await;
        assert_eq!(ctl.state().profile.email, "bob@example.com");
        assert!(ctl.state().history.is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_other_account_with_empty_history() {
        let mut bob = bundle_with(0, true);
        bob.user = profile("bob@example.com");
        let remote = Arc::new(FakeRemote::with_doc(
            "bob@example.com",
            RemoteBundle::from(bob),
        ));
        let mut ctl = booted(cache_with(Some(&bundle_with(4, true)), true), &remote).await;

        ctl.sign_in("bob@example.com").await.unwrap();
        assert_eq!(ctl.cache().read_session().unwrap().email, "bob@example.com");
        let cached = ctl.cache().read_bundle().unwrap();
        assert_eq!(cached.user.email, "bob@example.com");
        assert!(cached.history.is_empty());
    }

    #[tokio::test]
    async fn test_account_switch_pushes_previous_account_first() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(1, true)), true), &remote).await;
        ctl.save_receipt(receipt("unsent", 2.0));

        ctl.sign_up(SignUp {
            email: "bob@example.com".to_string(),
            access_code: "MASTER_KEY".to_string(),
            ..SignUp::default()
        })
        .await
        .unwrap();

        let pushes = remote.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, EMAIL);
        assert_eq!(pushes[0].1.history[0].id, "unsent");
    }

    #[tokio::test]
    async fn test_sign_in_same_account_keeps_guard() {
        // Same identity with an empty remote history is a transient state
        let remote = Arc::new(FakeRemote::with_doc(
            EMAIL,
            RemoteBundle::from(bundle_with(0, true)),
        ));
        let mut ctl = booted(cache_with(Some(&bundle_with(4, true)), false), &remote).await;
        ctl.sign_in(EMAIL).await.unwrap();
        assert_eq!(ctl.cache().read_bundle().unwrap().history.len(), 4);
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(5, true)), true), &remote).await;
        ctl.save_receipt(receipt("pending", 2.0));
        assert!(ctl.has_pending_push());

        ctl.logout().unwrap();
        assert!(ctl.cache().read_session().is_none());
        assert!(ctl.cache().read_bundle().is_none());
        assert_eq!(ctl.state(), &AppState::default());
        assert!(!ctl.has_pending_push());
    }

    // --- Mutations ---

    #[tokio::test]
    async fn test_save_receipt_replaces_in_place() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(3, true)), false), &remote).await;

        let mut edited = ctl.state().history[1].clone();
        edited.metadata.store_name = "Edited".to_string();
        ctl.save_receipt(edited);

        let history = &ctl.state().history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].id, "r1");
        assert_eq!(history[1].metadata.store_name, "Edited");
    }

    #[tokio::test]
    async fn test_save_receipt_normalizes_and_tracks_spend() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(0, true)), false), &remote).await;

        let saved = ctl.save_receipt(receipt("", 30.0));
        assert!(!saved.id.is_empty());
        assert_eq!(saved.items[0].category, "Bakery");
        // 30 of a 600 budget
        assert!((saved.analysis.budget_impact_pct - 5.0).abs() < 1e-9);
        assert!((ctl.state().profile.current_spend - 30.0).abs() < 1e-9);
        assert_eq!(ctl.state().current_analysis.as_ref().unwrap().id, saved.id);
    }

    #[tokio::test]
    async fn test_history_capped_at_limit() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(100, true)), false), &remote).await;
        ctl.save_receipt(receipt("newest", 1.0));
        assert_eq!(ctl.state().history.len(), 100);
        assert_eq!(ctl.state().history[0].id, "newest");
        assert_eq!(ctl.state().history[99].id, "r98");
    }

    #[tokio::test]
    async fn test_update_profile_keeps_identity() {
        let remote = Arc::new(FakeRemote::default());
        let mut cached = bundle_with(0, true);
        cached.user.account_status = AccountStatus::Active;
        let mut ctl = booted(cache_with(Some(&cached), false), &remote).await;

        ctl.update_profile(UserProfile {
            name: "Janet".to_string(),
            email: "hijack@example.com".to_string(),
            role: Role::Owner,
            monthly_budget: 320.0,
            custom_categories: Vec::new(),
            ..UserProfile::default()
        })
        .unwrap();

        let profile = &ctl.state().profile;
        assert_eq!(profile.name, "Janet");
        assert_eq!(profile.email, EMAIL);
        assert_eq!(profile.role, Role::User);
        assert_eq!(profile.account_status, AccountStatus::Active);
        assert!(!profile.custom_categories.is_empty());
        assert_eq!(ctl.cache().read_bundle().unwrap().user.name, "Janet");
    }

    #[tokio::test]
    async fn test_update_profile_requires_sign_in() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(None, false), &remote).await;
        let err = ctl.update_profile(UserProfile::default()).unwrap_err();
        assert_eq!(err.code(), "NOT_SIGNED_IN");
    }

    struct ScriptedExtractor {
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ReceiptExtractor for ScriptedExtractor {
        async fn extract(&self, upload: &Upload, _profile: &UserProfile) -> Result<Receipt> {
            if self.fail_on.as_deref() == Some(upload.file_name.as_str()) {
                anyhow::bail!("blurry");
            }
            Ok(receipt("model-id", 12.0))
        }
    }

    #[derive(Default)]
    struct CountingLock {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl WakeLock for CountingLock {
        fn acquire(&self) -> Result<()> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn upload(name: &str) -> Upload {
        Upload {
            file_name: name.to_string(),
            mime_type: "image/jpeg".to_string(),
            bytes: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_process_uploads_saves_each() {
        let remote = Arc::new(FakeRemote::default());
        let lock = Arc::new(CountingLock::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(0, true)), false), &remote)
            .await
            .with_wake_lock(Arc::clone(&lock) as Arc<dyn WakeLock>);

        let extractor = ScriptedExtractor { fail_on: None };
        let saved = ctl
            .process_uploads(&extractor, &[upload("a.jpg"), upload("b.jpg")])
            .await
            .unwrap();

        assert_eq!(saved.len(), 2);
        assert_ne!(saved[0].id, saved[1].id);
        assert_eq!(saved[1].image_ref.as_deref(), Some("b.jpg"));
        assert_eq!(ctl.state().history[0].id, saved[1].id);
        assert!(!ctl.state().is_loading);
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_uploads_failure_releases_lock() {
        let remote = Arc::new(FakeRemote::default());
        let lock = Arc::new(CountingLock::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(0, true)), false), &remote)
            .await
            .with_wake_lock(Arc::clone(&lock) as Arc<dyn WakeLock>);

        let extractor = ScriptedExtractor {
            fail_on: Some("b.jpg".to_string()),
        };
        let err = ctl
            .process_uploads(&extractor, &[upload("a.jpg"), upload("b.jpg"), upload("c.jpg")])
            .await
            .unwrap_err();

        assert_eq!(err.code(), "PROCESSING_FAILED");
        assert_eq!(ctl.state().error.as_deref(), Some("PROCESSING_FAILED"));
        assert_eq!(ctl.state().history.len(), 1);
        assert!(!ctl.state().is_loading);
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    struct EchoCoach {
        fail: bool,
    }

    #[async_trait]
    impl Coach for EchoCoach {
        async fn reply(
            &self,
            _profile: &UserProfile,
            history: &[Receipt],
            chat: &[ChatMessage],
        ) -> Result<String> {
            if self.fail {
                anyhow::bail!("quota exceeded");
            }
            let last = chat.last().map(|m| m.text.clone()).unwrap_or_default();
            Ok(format!("{} receipts; you said {last}", history.len()))
        }
    }

    #[tokio::test]
    async fn test_send_chat_appends_both_messages() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(2, true)), false), &remote).await;

        let reply = ctl
            .send_chat(&EchoCoach { fail: false }, " hello ")
            .await
            .unwrap();
        assert_eq!(reply, "2 receipts; you said hello");
        assert_eq!(
            ctl.state().chat_history,
            vec![ChatMessage::user("hello"), ChatMessage::model(reply)]
        );
        assert_eq!(ctl.cache().read_bundle().unwrap().chat_history.len(), 2);
    }

    #[tokio::test]
    async fn test_send_chat_failure_keeps_user_message() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(0, true)), false), &remote).await;
        let err = ctl
            .send_chat(&EchoCoach { fail: true }, "hello")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert_eq!(ctl.state().chat_history, vec![ChatMessage::user("hello")]);
    }

    #[tokio::test]
    async fn test_chat_log_capped() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(0, true)), false), &remote).await;
        for i in 0..20 {
            ctl.send_chat(&EchoCoach { fail: false }, &format!("q{i}"))
                .await
                .unwrap();
        }
        let chat = &ctl.state().chat_history;
        assert_eq!(chat.len(), 30);
        assert_eq!(chat[0], ChatMessage::user("q5"));
    }

    #[tokio::test]
    async fn test_admin_profiles_owner_only() {
        let remote = Arc::new(FakeRemote::with_doc(
            "x@y.io",
            RemoteBundle::from(bundle_with(0, true)),
        ));
        let mut ctl = booted(cache_with(Some(&bundle_with(0, true)), false), &remote).await;
        let err = ctl.admin_profiles().await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let mut owner = bundle_with(0, true);
        owner.user.role = Role::Owner;
        let mut ctl = booted(cache_with(Some(&owner), false), &remote).await;
        assert_eq!(ctl.admin_profiles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_merges_remote() {
        let remote = Arc::new(FakeRemote::default());
        let mut ctl = booted(cache_with(Some(&bundle_with(1, true)), false), &remote).await;
        remote.docs.lock().unwrap().insert(
            EMAIL.to_string(),
            RemoteBundle::from(bundle_with(6, true)),
        );
        ctl.refresh().await.unwrap();
        assert_eq!(ctl.state().history.len(), 6);
    }
}

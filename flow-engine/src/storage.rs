use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::group::{GroupSession, GroupStatus};
use crate::session::{Session, SessionStatus, WaitKind, session_key};

/// Volatile key/value tier with TTL support plus atomic set primitives
/// (used for the group membership mirror).
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    async fn set_clear(&self, key: &str) -> Result<()>;
}

/// Durable relational tier. Rows survive cache eviction and restarts;
/// expiry flips status and never deletes (auditability).
#[async_trait]
pub trait DurableTier: Send + Sync {
    async fn fetch_session(&self, session_key: &str) -> Result<Option<Session>>;
    async fn upsert_session(&self, session: &Session) -> Result<()>;
    async fn delete_session(&self, session_key: &str) -> Result<()>;
    async fn mark_sessions_expired_before(&self, horizon: DateTime<Utc>) -> Result<u64>;

    async fn fetch_group(&self, id: Uuid) -> Result<Option<GroupSession>>;
    async fn upsert_group(&self, group: &GroupSession) -> Result<()>;
    async fn active_group_count(&self, bot_id: &str) -> Result<u64>;
    async fn find_active_group_for(
        &self,
        bot_id: &str,
        participant_id: &str,
    ) -> Result<Option<GroupSession>>;
    async fn archive_groups_inactive_before(&self, horizon: DateTime<Utc>) -> Result<u64>;
}

struct CacheEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// In-memory cache tier over DashMap with lazy per-entry expiry.
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
    sets: DashMap<String, BTreeSet<String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sets: DashMap::new(),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheTier for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Utc::now() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        // Expired: evict on the way out.
        self.entries.remove(key);
        Ok(None)
    }

    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| FlowError::Storage(format!("ttl out of range: {e}")))?;
        self.entries.insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_clear(&self, key: &str) -> Result<()> {
        self.sets.remove(key);
        Ok(())
    }
}

/// In-memory durable tier for tests and single-node deployments.
pub struct InMemoryDurable {
    sessions: DashMap<String, Session>,
    groups: DashMap<Uuid, GroupSession>,
}

impl InMemoryDurable {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for InMemoryDurable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableTier for InMemoryDurable {
    async fn fetch_session(&self, session_key: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(session_key).map(|s| s.clone()))
    }

    async fn upsert_session(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.session_key.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, session_key: &str) -> Result<()> {
        self.sessions.remove(session_key);
        Ok(())
    }

    async fn mark_sessions_expired_before(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let mut marked = 0;
        for mut entry in self.sessions.iter_mut() {
            if entry.status == SessionStatus::Active && entry.last_activity < horizon {
                entry.status = SessionStatus::Expired;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn fetch_group(&self, id: Uuid) -> Result<Option<GroupSession>> {
        Ok(self.groups.get(&id).map(|g| g.clone()))
    }

    async fn upsert_group(&self, group: &GroupSession) -> Result<()> {
        self.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn active_group_count(&self, bot_id: &str) -> Result<u64> {
        Ok(self
            .groups
            .iter()
            .filter(|g| g.bot_id == bot_id && g.status == GroupStatus::Active)
            .count() as u64)
    }

    async fn find_active_group_for(
        &self,
        bot_id: &str,
        participant_id: &str,
    ) -> Result<Option<GroupSession>> {
        Ok(self
            .groups
            .iter()
            .find(|g| {
                g.bot_id == bot_id
                    && g.status == GroupStatus::Active
                    && g.participant_ids.contains(participant_id)
            })
            .map(|g| g.clone()))
    }

    async fn archive_groups_inactive_before(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let mut archived = 0;
        for mut entry in self.groups.iter_mut() {
            if entry.status == GroupStatus::Active && entry.last_activity < horizon {
                entry.status = GroupStatus::Archived;
                archived += 1;
            }
        }
        Ok(archived)
    }
}

fn session_status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Completed => "completed",
        SessionStatus::Expired => "expired",
    }
}

fn group_status_str(status: GroupStatus) -> &'static str {
    match status {
        GroupStatus::Active => "active",
        GroupStatus::Completed => "completed",
        GroupStatus::Archived => "archived",
    }
}

/// Postgres durable tier. Session and group rows carry their full state as
/// JSONB alongside the columns the sweeps and lookups filter on.
pub struct PostgresDurable {
    pool: PgPool,
}

impl PostgresDurable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flow_sessions (
                session_key TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                last_activity TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS group_sessions (
                id UUID PRIMARY KEY,
                bot_id TEXT NOT NULL,
                status TEXT NOT NULL,
                last_activity TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DurableTier for PostgresDurable {
    async fn fetch_session(&self, session_key: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT payload FROM flow_sessions WHERE session_key = $1")
            .bind(session_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: Value = row.try_get("payload")?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_session(&self, session: &Session) -> Result<()> {
        let payload = serde_json::to_value(session)?;
        sqlx::query(
            "INSERT INTO flow_sessions (session_key, bot_id, participant_id, status, last_activity, payload)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (session_key)
             DO UPDATE SET status = $4, last_activity = $5, payload = $6",
        )
        .bind(&session.session_key)
        .bind(&session.bot_id)
        .bind(&session.participant_id)
        .bind(session_status_str(session.status))
        .bind(session.last_activity)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, session_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM flow_sessions WHERE session_key = $1")
            .bind(session_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_sessions_expired_before(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE flow_sessions
             SET status = 'expired', payload = jsonb_set(payload, '{status}', '\"expired\"')
             WHERE status = 'active' AND last_activity < $1",
        )
        .bind(horizon)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_group(&self, id: Uuid) -> Result<Option<GroupSession>> {
        let row = sqlx::query("SELECT payload FROM group_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: Value = row.try_get("payload")?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_group(&self, group: &GroupSession) -> Result<()> {
        let payload = serde_json::to_value(group)?;
        sqlx::query(
            "INSERT INTO group_sessions (id, bot_id, status, last_activity, payload)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id)
             DO UPDATE SET status = $3, last_activity = $4, payload = $5",
        )
        .bind(group.id)
        .bind(&group.bot_id)
        .bind(group_status_str(group.status))
        .bind(group.last_activity)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_group_count(&self, bot_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM group_sessions WHERE bot_id = $1 AND status = 'active'",
        )
        .bind(bot_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn find_active_group_for(
        &self,
        bot_id: &str,
        participant_id: &str,
    ) -> Result<Option<GroupSession>> {
        let row = sqlx::query(
            "SELECT payload FROM group_sessions
             WHERE bot_id = $1 AND status = 'active'
               AND payload->'participant_ids' @> to_jsonb($2::text)
             LIMIT 1",
        )
        .bind(bot_id)
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let payload: Value = row.try_get("payload")?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn archive_groups_inactive_before(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE group_sessions
             SET status = 'archived', payload = jsonb_set(payload, '{status}', '\"archived\"')
             WHERE status = 'active' AND last_activity < $1",
        )
        .bind(horizon)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Decides whether a session state must survive cache eviction. Durable
/// writes are the expensive path; most conversational steps are transient.
pub trait PersistencePolicy: Send + Sync {
    fn should_persist(&self, session: &Session) -> bool;
}

/// Default policy: persist when the session is parked on an endpoint-class
/// wait, a payment is pending, the session belongs to a group, or any
/// configured critical-state flag is set. The flag list is caller data,
/// not a closed contract.
pub struct StatePersistencePolicy {
    critical_flags: Vec<String>,
}

impl StatePersistencePolicy {
    pub fn new(critical_flags: Vec<String>) -> Self {
        Self { critical_flags }
    }
}

impl Default for StatePersistencePolicy {
    fn default() -> Self {
        Self::new(vec![
            "game_started".to_string(),
            "auction_active".to_string(),
            "awaiting_players".to_string(),
            "payment_required".to_string(),
        ])
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

impl PersistencePolicy for StatePersistencePolicy {
    fn should_persist(&self, session: &Session) -> bool {
        if session
            .pending_wait
            .as_ref()
            .is_some_and(|w| w.kind == WaitKind::Endpoint)
        {
            return true;
        }
        if session
            .variables
            .resolve("payment_status")
            .and_then(|v| v.as_str())
            == Some("pending")
        {
            return true;
        }
        if session.group_ref.is_some() {
            return true;
        }
        self.critical_flags
            .iter()
            .any(|flag| session.variables.resolve(flag).is_some_and(truthy))
    }
}

const SESSION_CACHE_PREFIX: &str = "session:";
const USER_VARS_PREFIX: &str = "uservars:";
const GLOBAL_VARS_PREFIX: &str = "globalvars:";

/// Reconciles the cache and durable tiers behind one get/save/delete API.
/// The exclusive owner of both tiers for session rows.
pub struct SessionStore {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableTier>,
    policy: Arc<dyn PersistencePolicy>,
    /// Effectively "keep warm while referenced".
    cache_ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn CacheTier>, durable: Arc<dyn DurableTier>) -> Self {
        Self::with_policy(cache, durable, Arc::new(StatePersistencePolicy::default()))
    }

    pub fn with_policy(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableTier>,
        policy: Arc<dyn PersistencePolicy>,
    ) -> Self {
        Self {
            cache,
            durable,
            policy,
            cache_ttl: Duration::from_secs(365 * 24 * 60 * 60),
        }
    }

    /// Cache first; on miss the durable tier; on durable hit repopulate
    /// the cache (write-through) before returning. Cache failures are
    /// never fatal.
    pub async fn get_session(
        &self,
        bot_id: &str,
        participant_id: &str,
    ) -> Result<Option<Session>> {
        let key = session_key(bot_id, participant_id);
        let cache_key = format!("{SESSION_CACHE_PREFIX}{key}");

        match self.cache.get(&cache_key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(session) => return Ok(Some(session)),
                Err(e) => warn!(session_key = %key, error = %e, "discarding undecodable cached session"),
            },
            Ok(None) => {}
            Err(e) => warn!(session_key = %key, error = %e, "cache read failed, falling back to durable tier"),
        }

        let Some(session) = self.durable.fetch_session(&key).await? else {
            return Ok(None);
        };
        debug!(session_key = %key, "session loaded from durable tier");
        if let Ok(value) = serde_json::to_value(&session) {
            if let Err(e) = self.cache.put(&cache_key, value, self.cache_ttl).await {
                warn!(session_key = %key, error = %e, "cache repopulation failed");
            }
        }
        Ok(Some(session))
    }

    /// Existing session, or a fresh one seeded with the participant's
    /// user-scope variables and the bot's global-scope variables.
    pub async fn load_or_create(
        &self,
        bot_id: &str,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Session> {
        if let Some(session) = self.get_session(bot_id, participant_id).await? {
            return Ok(session);
        }
        let mut session = Session::new(bot_id, participant_id, flow_id);
        let key = &session.session_key;
        if let Ok(Some(value)) = self.cache.get(&format!("{USER_VARS_PREFIX}{key}")).await {
            if let Ok(map) = serde_json::from_value(value) {
                session.variables.replace_scope(crate::variables::Scope::User, map);
            }
        }
        if let Ok(Some(value)) = self.cache.get(&format!("{GLOBAL_VARS_PREFIX}{bot_id}")).await {
            if let Ok(map) = serde_json::from_value(value) {
                session.variables.replace_scope(crate::variables::Scope::Global, map);
            }
        }
        Ok(session)
    }

    /// Always writes the cache (TTL refresh); writes the durable tier only
    /// when forced or when the persistence policy holds. A durable write
    /// failure on a persistence-required path is surfaced to the caller:
    /// the event must not be treated as processed.
    pub async fn save_session(&self, session: &Session, force_persist: bool) -> Result<()> {
        let key = &session.session_key;
        let value = serde_json::to_value(session)?;

        if let Err(e) = self
            .cache
            .put(&format!("{SESSION_CACHE_PREFIX}{key}"), value, self.cache_ttl)
            .await
        {
            warn!(session_key = %key, error = %e, "cache write failed");
        }

        // Keep the cross-session overlays warm alongside the session row.
        let user_map = serde_json::to_value(session.variables.scope_map(crate::variables::Scope::User))?;
        let global_map =
            serde_json::to_value(session.variables.scope_map(crate::variables::Scope::Global))?;
        if let Err(e) = self
            .cache
            .put(&format!("{USER_VARS_PREFIX}{key}"), user_map, self.cache_ttl)
            .await
        {
            warn!(session_key = %key, error = %e, "user overlay write failed");
        }
        if let Err(e) = self
            .cache
            .put(
                &format!("{GLOBAL_VARS_PREFIX}{}", session.bot_id),
                global_map,
                self.cache_ttl,
            )
            .await
        {
            warn!(bot_id = %session.bot_id, error = %e, "global overlay write failed");
        }

        if force_persist || self.policy.should_persist(session) {
            self.durable.upsert_session(session).await?;
            debug!(session_key = %key, force_persist, "session persisted durably");
        }
        Ok(())
    }

    pub async fn delete_session(&self, bot_id: &str, participant_id: &str) -> Result<()> {
        let key = session_key(bot_id, participant_id);
        if let Err(e) = self.cache.delete(&format!("{SESSION_CACHE_PREFIX}{key}")).await {
            warn!(session_key = %key, error = %e, "cache delete failed");
        }
        self.durable.delete_session(&key).await
    }

    /// Background sweep: flips durable rows older than the horizon to
    /// expired. Rows are never deleted.
    pub async fn sweep_expired(&self, horizon: DateTime<Utc>) -> Result<u64> {
        self.durable.mark_sessions_expired_before(horizon).await
    }
}

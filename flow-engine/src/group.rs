use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::storage::{CacheTier, DurableTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Completed,
    Archived,
}

/// Capacity invariants for lobby sessions.
#[derive(Debug, Clone, Copy)]
pub struct GroupLimits {
    /// Hard cap on participants per group.
    pub max_size: usize,
    /// Hard cap on concurrently active groups per bot.
    pub max_active_per_bot: usize,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_active_per_bot: 1_000,
        }
    }
}

/// A session shared by multiple participants: shared variables, a shared
/// cursor, and bounded membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSession {
    pub id: Uuid,
    pub bot_id: String,
    pub flow_id: String,
    pub participant_ids: BTreeSet<String>,
    #[serde(default)]
    pub shared_variables: Map<String, Value>,
    pub current_node_id: Option<String>,
    pub status: GroupStatus,
    pub max_size: usize,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl GroupSession {
    pub fn new(bot_id: &str, flow_id: &str, created_by: &str, max_size: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            bot_id: bot_id.to_string(),
            flow_id: flow_id.to_string(),
            participant_ids: BTreeSet::new(),
            shared_variables: Map::new(),
            current_node_id: None,
            status: GroupStatus::Active,
            max_size,
            created_by: created_by.to_string(),
            created_at: now,
            last_activity: now,
        }
    }
}

fn row_key(id: Uuid) -> String {
    format!("group:{id}")
}

fn members_key(id: Uuid) -> String {
    format!("groupmembers:{id}")
}

fn index_key(bot_id: &str, participant_id: &str) -> String {
    format!("pgroup:{bot_id}:{participant_id}")
}

const GROUP_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Manages multi-participant lobby sessions on top of the shared tiers.
///
/// Write order is always authoritative row first, fast set second, so a
/// crash leaves the mirror either correct or conservatively stale; reads
/// prefer the mirror and fall back to the row.
pub struct GroupService {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableTier>,
    limits: GroupLimits,
    /// Serializes mutations per group so updates from different
    /// participants apply in arrival order.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl GroupService {
    pub fn new(cache: Arc<dyn CacheTier>, durable: Arc<dyn DurableTier>) -> Self {
        Self::with_limits(cache, durable, GroupLimits::default())
    }

    pub fn with_limits(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableTier>,
        limits: GroupLimits,
    ) -> Self {
        Self {
            cache,
            durable,
            limits,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, group_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(group_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn create(
        &self,
        bot_id: &str,
        flow_id: &str,
        creator_id: &str,
    ) -> Result<GroupSession> {
        let active = self.durable.active_group_count(bot_id).await?;
        if active as usize >= self.limits.max_active_per_bot {
            return Err(FlowError::Capacity(format!(
                "bot {bot_id} already has {active} active groups"
            )));
        }

        self.leave_current_group(bot_id, creator_id, None).await?;

        let mut group = GroupSession::new(bot_id, flow_id, creator_id, self.limits.max_size);
        group.participant_ids.insert(creator_id.to_string());
        self.durable.upsert_group(&group).await?;
        self.mirror_join(&group, creator_id).await;
        self.store_row(&group).await;
        info!(group_id = %group.id, bot_id, creator_id, "group created");
        Ok(group)
    }

    pub async fn add_participant(&self, group_id: Uuid, participant_id: &str) -> Result<()> {
        // Peek outside the lock for the bot id; the prior-membership
        // removal takes the old group's lock, so it must happen before we
        // take this one.
        let peek = self.load(group_id).await?;
        if peek.status != GroupStatus::Active {
            return Err(FlowError::Validation(format!("group {group_id} is not active")));
        }
        if peek.participant_ids.contains(participant_id) {
            return Ok(());
        }

        // One active group per participant per bot: joining here removes
        // the prior membership first.
        self.leave_current_group(&peek.bot_id, participant_id, Some(group_id)).await?;

        let lock = self.lock_for(group_id);
        let _guard = lock.lock().await;
        let mut group = self.load(group_id).await?;
        if group.status != GroupStatus::Active {
            return Err(FlowError::Validation(format!("group {group_id} is not active")));
        }
        if group.participant_ids.contains(participant_id) {
            return Ok(());
        }
        if group.participant_ids.len() >= group.max_size {
            return Err(FlowError::Capacity(format!(
                "group {group_id} is full ({} participants)",
                group.participant_ids.len()
            )));
        }

        group.participant_ids.insert(participant_id.to_string());
        group.last_activity = Utc::now();
        self.durable.upsert_group(&group).await?;
        self.mirror_join(&group, participant_id).await;
        self.store_row(&group).await;
        debug!(group_id = %group_id, participant_id, "participant joined");
        Ok(())
    }

    pub async fn remove_participant(&self, group_id: Uuid, participant_id: &str) -> Result<()> {
        let lock = self.lock_for(group_id);
        let _guard = lock.lock().await;
        let mut group = self.load(group_id).await?;
        if !group.participant_ids.remove(participant_id) {
            return Ok(());
        }
        group.last_activity = Utc::now();
        if group.participant_ids.is_empty() {
            group.status = GroupStatus::Archived;
        }
        self.durable.upsert_group(&group).await?;
        if let Err(e) = self.cache.set_remove(&members_key(group_id), participant_id).await {
            warn!(group_id = %group_id, error = %e, "membership mirror remove failed");
        }
        if let Err(e) = self.cache.delete(&index_key(&group.bot_id, participant_id)).await {
            warn!(group_id = %group_id, error = %e, "participant index delete failed");
        }
        self.store_row(&group).await;
        if group.status == GroupStatus::Archived {
            info!(group_id = %group_id, "last participant left, group archived");
            let _ = self.cache.set_clear(&members_key(group_id)).await;
        }
        Ok(())
    }

    /// Merge a patch into the shared variables, in arrival order per group.
    pub async fn update_shared_variables(
        &self,
        group_id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<()> {
        let lock = self.lock_for(group_id);
        let _guard = lock.lock().await;
        let mut group = self.load(group_id).await?;
        for (k, v) in patch {
            group.shared_variables.insert(k, v);
        }
        group.last_activity = Utc::now();
        self.durable.upsert_group(&group).await?;
        self.store_row(&group).await;
        Ok(())
    }

    /// Membership read: fast set first, authoritative row as fallback
    /// (repopulating the mirror on the way).
    pub async fn get_participant_ids(&self, group_id: Uuid) -> Result<Vec<String>> {
        match self.cache.set_members(&members_key(group_id)).await {
            Ok(members) if !members.is_empty() => return Ok(members),
            Ok(_) => {}
            Err(e) => warn!(group_id = %group_id, error = %e, "membership mirror read failed"),
        }
        let group = self.load(group_id).await?;
        for member in &group.participant_ids {
            let _ = self.cache.set_add(&members_key(group_id), member).await;
        }
        Ok(group.participant_ids.iter().cloned().collect())
    }

    pub async fn get(&self, group_id: Uuid) -> Result<GroupSession> {
        self.load(group_id).await
    }

    /// The active group a participant currently belongs to, if any.
    pub async fn active_group_for(
        &self,
        bot_id: &str,
        participant_id: &str,
    ) -> Result<Option<GroupSession>> {
        if let Ok(Some(value)) = self.cache.get(&index_key(bot_id, participant_id)).await {
            if let Some(id) = value.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                match self.load(id).await {
                    Ok(group) if group.status == GroupStatus::Active => return Ok(Some(group)),
                    _ => {}
                }
            }
        }
        self.durable.find_active_group_for(bot_id, participant_id).await
    }

    pub async fn archive(&self, group_id: Uuid) -> Result<()> {
        let lock = self.lock_for(group_id);
        let _guard = lock.lock().await;
        let mut group = self.load(group_id).await?;
        if group.status == GroupStatus::Archived {
            return Ok(());
        }
        group.status = GroupStatus::Archived;
        group.last_activity = Utc::now();
        self.durable.upsert_group(&group).await?;
        for member in group.participant_ids.clone() {
            let _ = self.cache.delete(&index_key(&group.bot_id, &member)).await;
        }
        let _ = self.cache.set_clear(&members_key(group_id)).await;
        self.store_row(&group).await;
        info!(group_id = %group_id, "group archived");
        Ok(())
    }

    pub async fn touch(&self, group_id: Uuid) -> Result<()> {
        let lock = self.lock_for(group_id);
        let _guard = lock.lock().await;
        let mut group = self.load(group_id).await?;
        group.last_activity = Utc::now();
        self.durable.upsert_group(&group).await?;
        self.store_row(&group).await;
        Ok(())
    }

    /// Periodic sweep: archives groups inactive past the horizon
    /// regardless of participant count. Mirrors self-heal on next read.
    pub async fn sweep_inactive(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let archived = self.durable.archive_groups_inactive_before(horizon).await?;
        if archived > 0 {
            info!(archived, "inactive groups archived by sweep");
        }
        Ok(archived)
    }

    async fn load(&self, group_id: Uuid) -> Result<GroupSession> {
        if let Ok(Some(value)) = self.cache.get(&row_key(group_id)).await {
            if let Ok(group) = serde_json::from_value(value) {
                return Ok(group);
            }
        }
        self.durable
            .fetch_group(group_id)
            .await?
            .ok_or_else(|| FlowError::GroupNotFound(group_id.to_string()))
    }

    async fn store_row(&self, group: &GroupSession) {
        match serde_json::to_value(group) {
            Ok(value) => {
                if let Err(e) = self.cache.put(&row_key(group.id), value, GROUP_CACHE_TTL).await {
                    warn!(group_id = %group.id, error = %e, "group row cache write failed");
                }
            }
            Err(e) => warn!(group_id = %group.id, error = %e, "group row serialization failed"),
        }
    }

    async fn mirror_join(&self, group: &GroupSession, participant_id: &str) {
        if let Err(e) = self.cache.set_add(&members_key(group.id), participant_id).await {
            warn!(group_id = %group.id, error = %e, "membership mirror add failed");
        }
        if let Err(e) = self
            .cache
            .put(
                &index_key(&group.bot_id, participant_id),
                Value::String(group.id.to_string()),
                GROUP_CACHE_TTL,
            )
            .await
        {
            warn!(group_id = %group.id, error = %e, "participant index write failed");
        }
    }

    async fn leave_current_group(
        &self,
        bot_id: &str,
        participant_id: &str,
        joining: Option<Uuid>,
    ) -> Result<()> {
        if let Some(current) = self.active_group_for(bot_id, participant_id).await? {
            if Some(current.id) != joining {
                debug!(
                    participant_id,
                    old_group = %current.id,
                    "participant leaving previous group before join"
                );
                self.remove_participant(current.id, participant_id).await?;
            }
        }
        Ok(())
    }
}

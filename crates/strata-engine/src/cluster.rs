//! Cluster membership, leader election and the invalidation broadcast.
//!
//! Instances learn about each other only through heartbeats on the shared
//! broadcast channel. Membership is a list ordered by start time (instance
//! id breaks ties); the head is the leader. The role is an owned
//! `{Follower, Leader}` state machine published on a watch channel;
//! nothing outside this module mutates membership. Leadership is advisory:
//! brief dual- or zero-leader windows during churn are tolerated because
//! refresh work is idempotent.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use strata_core::{dependency_key, now_ms, BroadcastOptions, EntityRef};
use strata_store::{LocalCache, SharedCache, StoreBackend};

use crate::envelope::{Envelope, Message};
use crate::error::Result;

/// Heartbeats missed before a member is pruned, and heartbeat intervals
/// waited before this instance starts making leadership claims.
const CONVERGENCE_INTERVALS: i64 = 3;

/// Role of this instance within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// One known instance.
#[derive(Debug, Clone)]
pub struct Member {
    pub instance: Uuid,
    pub started_at_ms: i64,
    pub seen_at_ms: i64,
}

/// A mutation of a tracked upstream entity, reported by the integration
/// layer.
#[derive(Debug, Clone)]
pub enum EntityChange {
    Upsert(EntityRef),
    Delete(EntityRef),
}

pub struct Cluster {
    instance: Uuid,
    started_at_ms: i64,
    backend: Arc<dyn StoreBackend>,
    shared: Arc<SharedCache>,
    local: Arc<LocalCache>,
    opts: BroadcastOptions,
    members: Mutex<Vec<Member>>,
    tracked_kinds: Mutex<HashSet<String>>,
    role_tx: watch::Sender<Role>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Cluster {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        shared: Arc<SharedCache>,
        local: Arc<LocalCache>,
        opts: BroadcastOptions,
    ) -> Arc<Self> {
        let (role_tx, _) = watch::channel(Role::Follower);
        Arc::new(Self {
            instance: Uuid::new_v4(),
            started_at_ms: now_ms(),
            backend,
            shared,
            local,
            opts,
            members: Mutex::new(Vec::new()),
            tracked_kinds: Mutex::new(HashSet::new()),
            role_tx,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn is_leader(&self) -> bool {
        *self.role_tx.borrow() == Role::Leader
    }

    /// Role transitions for the refresher supervisor.
    pub fn role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.lock().clone()
    }

    /// Subscribe to the broadcast channel and start heartbeating.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let subscription = self.backend.subscribe(&self.opts.channel_name).await?;

        let cluster = Arc::clone(&self);
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut subscription = subscription;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    payload = subscription.recv() => match payload {
                        Some(payload) => match Envelope::decode(&payload) {
                            Ok(envelope) => {
                                if cluster.opts.exclude_self && envelope.from == cluster.instance {
                                    continue;
                                }
                                cluster.handle(envelope).await;
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "undecodable broadcast payload");
                            }
                        },
                        None => {
                            tracing::warn!("broadcast subscription ended");
                            break;
                        }
                    },
                }
            }
        });

        let cluster = Arc::clone(&self);
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            let interval =
                std::time::Duration::from_millis(cluster.opts.heartbeat_interval_ms.max(1));
            loop {
                cluster.record_heartbeat(cluster.instance, cluster.started_at_ms);
                if let Err(err) = cluster
                    .publish(Message::KeepAlive { started_at_ms: cluster.started_at_ms })
                    .await
                {
                    tracing::warn!(error = %err, "heartbeat publish failed");
                }
                cluster.prune();
                cluster.evaluate_role();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        Ok(())
    }

    /// Announce departure and stop all cluster tasks.
    pub async fn stop(&self) {
        if let Err(err) = self.publish(Message::Shutdown).await {
            tracing::debug!(error = %err, "shutdown announcement failed");
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        let _ = self.role_tx.send(Role::Follower);
    }

    pub async fn publish(&self, message: Message) -> Result<()> {
        let payload = Envelope::new(self.instance, message).encode()?;
        self.backend.publish(&self.opts.channel_name, payload).await?;
        Ok(())
    }

    /// Start tracking an entity kind. Returns true when it was new.
    pub fn track_entity(&self, kind: impl Into<String>) -> bool {
        self.tracked_kinds.lock().insert(kind.into())
    }

    pub fn tracked_entities(&self) -> Vec<String> {
        self.tracked_kinds.lock().iter().cloned().collect()
    }

    /// React to a local entity mutation: evict dependents here and tell the
    /// other instances about the mutation.
    pub async fn entity_changed(&self, change: EntityChange) -> Result<()> {
        let (message, entity) = match change {
            EntityChange::Upsert(entity) => {
                (Message::Upsert { entity: entity.clone() }, entity)
            }
            EntityChange::Delete(entity) => {
                (Message::Delete { entity: entity.clone() }, entity)
            }
        };
        self.publish(message).await?;
        self.evict_dependents(&entity).await
    }

    async fn handle(&self, envelope: Envelope) {
        match envelope.message {
            Message::KeepAlive { started_at_ms } => {
                self.record_heartbeat(envelope.from, started_at_ms);
                self.evaluate_role();
            }
            Message::Shutdown => {
                self.remove_member(envelope.from);
                self.evaluate_role();
            }
            Message::SubscribeEvent { kind } => {
                self.tracked_kinds.lock().insert(kind);
            }
            Message::Evict { keys } => {
                if envelope.from == self.instance {
                    return;
                }
                for key in &keys {
                    self.local.delete(key);
                }
                tracing::debug!(count = keys.len(), from = %envelope.from, "evicted on broadcast");
            }
            Message::Upsert { entity } | Message::Delete { entity } => {
                if let Err(err) = self.evict_dependents(&entity).await {
                    tracing::warn!(
                        kind = %entity.kind,
                        error = %err,
                        "dependent eviction failed"
                    );
                }
            }
        }
    }

    /// Evict everything registered under the entity's dependency key from
    /// the shared store, then broadcast the keys so every local cache
    /// converges.
    async fn evict_dependents(&self, entity: &EntityRef) -> Result<()> {
        let dependency = dependency_key(entity)?;
        let keys = self.shared.dependents(&dependency).await?;
        if keys.is_empty() {
            return Ok(());
        }
        tracing::debug!(kind = %entity.kind, count = keys.len(), "evicting dependent entries");
        for key in &keys {
            self.shared.delete(key, true).await?;
            self.local.delete(key);
        }
        // the index entry is spent; survivors re-register on their next fetch
        self.backend.delete(&[strata_store::keys::dep_key(&dependency)]).await?;
        self.publish(Message::Evict { keys }).await
    }

    fn record_heartbeat(&self, instance: Uuid, started_at_ms: i64) {
        let now = now_ms();
        let mut members = self.members.lock();
        if let Some(member) = members.iter_mut().find(|member| member.instance == instance) {
            member.seen_at_ms = now;
            return;
        }
        members.push(Member { instance, started_at_ms, seen_at_ms: now });
        members.sort_by(|a, b| {
            a.started_at_ms
                .cmp(&b.started_at_ms)
                .then_with(|| a.instance.cmp(&b.instance))
        });
    }

    fn remove_member(&self, instance: Uuid) {
        self.members.lock().retain(|member| member.instance != instance);
    }

    fn prune(&self) {
        let cutoff = now_ms() - CONVERGENCE_INTERVALS * self.opts.heartbeat_interval_ms as i64;
        self.members.lock().retain(|member| member.seen_at_ms >= cutoff);
    }

    /// Re-derive the role from the member list head. Held back until the
    /// membership list has had time to converge after startup.
    fn evaluate_role(&self) {
        let warmup = CONVERGENCE_INTERVALS * self.opts.heartbeat_interval_ms as i64;
        if now_ms() - self.started_at_ms < warmup {
            return;
        }
        let head = self.members.lock().first().map(|member| member.instance);
        let role = if head == Some(self.instance) { Role::Leader } else { Role::Follower };
        self.role_tx.send_if_modified(|current| {
            if *current == role {
                return false;
            }
            tracing::info!(instance = %self.instance, ?role, "cluster role changed");
            *current = role;
            true
        });
    }
}

//! The shared exchange store.
//!
//! Each linked pair of roles shares a small key-value namespace, split into a per-instance scope
//! written only by the owning instance and a per-role scope written only by the role's elected
//! writer. Peers are notified of changes, and only of changes: re-writing an identical value
//! produces no notification.

mod watcher;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::coordination::{lease_key, now_millis, LeaseRecord};
use crate::error::{AppError, HandlerResult};
use crate::registry::Registry;

pub use watcher::ExchangeWatcher;

/// The registry prefix under which all exchange data lives.
pub const EXCHANGE_PREFIX: &str = "exchange/";
const MEMBERS_PREFIX: &str = "exchange/members/";
const ROLE_PREFIX: &str = "exchange/role/";
const INSTANCE_PREFIX: &str = "exchange/instance/";

/// The capacity of the change notification channel.
const NOTIFICATION_CAPACITY: usize = 1024;
/// The number of attempts made by a single role-scope write whose guarding lease keeps changing.
const MAX_FENCED_WRITE_ATTEMPTS: usize = 3;

/// A namespace of the exchange store.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// The scope of a single instance, written only by that instance.
    Instance(String),
    /// The scope of a role, written only by the role's elected writer.
    Role(String),
}

impl Scope {
    fn data_key(&self, key: &str) -> String {
        match self {
            Self::Instance(instance) => format!("{}{}/{}", INSTANCE_PREFIX, instance, key),
            Self::Role(role) => format!("{}{}/{}", ROLE_PREFIX, role, key),
        }
    }

    /// Parse a registry key back into its scope and data key.
    fn parse(raw: &str) -> Option<(Self, String)> {
        if let Some(rest) = raw.strip_prefix(INSTANCE_PREFIX) {
            let (instance, key) = rest.rsplit_once('/')?;
            return Some((Self::Instance(instance.into()), key.into()));
        }
        if let Some(rest) = raw.strip_prefix(ROLE_PREFIX) {
            let (role, key) = rest.rsplit_once('/')?;
            return Some((Self::Role(role.into()), key.into()));
        }
        None
    }
}

/// A notification of changed exchange data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeNotification {
    /// Keys of the given scope were written or removed.
    Data { scope: Scope, keys: Vec<String> },
    /// The set of live members of the given role changed.
    Membership { role: String },
}

/// A live member of a role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub instance: String,
    /// The time, in unix milliseconds, when the instance joined.
    pub joined_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct MemberRecord {
    joined_at: i64,
    heartbeat: i64,
}

/// A consistency primitive giving bound agents a shared, scoped key-value namespace.
#[async_trait]
pub trait ExchangeStore: Send + Sync + 'static {
    /// Join the given role, or refresh the heartbeat of an existing membership.
    async fn join(&self, role: &str, instance: &str) -> Result<()>;

    /// Depart the given role.
    async fn depart(&self, role: &str, instance: &str) -> Result<()>;

    /// The live members of the given role, ordered from oldest to newest join.
    async fn members(&self, role: &str) -> Result<Vec<Member>>;

    /// Publish a value in the given scope on behalf of `writer`.
    ///
    /// Role-scope writes require `writer` to hold the role's unexpired lease, and instance-scope
    /// writes require `writer` to be the instance. Violations are `InvariantViolation`s.
    async fn publish(&self, writer: &str, scope: &Scope, key: &str, value: &str) -> HandlerResult;

    /// Read a value of the given scope.
    async fn read(&self, scope: &Scope, key: &str) -> Result<Option<String>>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;

    /// Perform one change-detection pass, emitting notifications for observed changes.
    async fn sync(&self) -> Result<()>;
}

/// An exchange store layered on the shared registry.
pub struct RegistryExchange {
    registry: Arc<dyn Registry>,
    /// The heartbeat age in milliseconds after which a member is considered departed.
    member_ttl: i64,
    notify: broadcast::Sender<ChangeNotification>,
    /// The exchange state as of the last change-detection pass.
    observed: Mutex<Observed>,
}

#[derive(Default)]
struct Observed {
    data: BTreeMap<String, String>,
    members: BTreeMap<String, BTreeSet<String>>,
}

impl RegistryExchange {
    /// Create a new instance.
    pub fn new(registry: Arc<dyn Registry>, member_ttl_seconds: u64) -> Self {
        let (notify, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            registry,
            member_ttl: member_ttl_seconds as i64 * 1000,
            notify,
            observed: Mutex::new(Observed::default()),
        }
    }

    fn member_key(role: &str, instance: &str) -> String {
        format!("{}{}/{}", MEMBERS_PREFIX, role, instance)
    }

    /// Check that `writer` may write the given scope.
    ///
    /// For role scopes, returns the lease key and the raw lease observed, which must still be in
    /// place when the write lands.
    async fn check_fence(&self, writer: &str, scope: &Scope) -> HandlerResult<Option<(String, String)>> {
        match scope {
            Scope::Instance(instance) if instance == writer => Ok(None),
            Scope::Instance(instance) => Err(AppError::InvariantViolation(format!(
                "instance {} attempted to write the scope of instance {}",
                writer, instance
            ))),
            Scope::Role(role) => {
                let key = lease_key(role);
                let raw = self
                    .registry
                    .get(&key)
                    .await
                    .map_err(AppError::collaborator)?
                    .ok_or_else(|| AppError::InvariantViolation(format!("no writer lease exists for role {}", role)))?;
                let lease: LeaseRecord = serde_json::from_str(&raw)
                    .context("error decoding writer lease")
                    .map_err(AppError::collaborator)?;
                if !lease.is_held_by(writer, now_millis()) {
                    return Err(AppError::InvariantViolation(format!(
                        "{} attempted to write role {} whose lease is held by {}",
                        writer, role, lease.holder
                    )));
                }
                Ok(Some((key, raw)))
            }
        }
    }

    /// Group the live members of every role from a prefix listing.
    fn live_members(&self, listing: &BTreeMap<String, String>, now: i64) -> BTreeMap<String, Vec<Member>> {
        let mut roles: BTreeMap<String, Vec<Member>> = BTreeMap::new();
        for (key, raw) in listing.range(MEMBERS_PREFIX.to_string()..) {
            let rest = match key.strip_prefix(MEMBERS_PREFIX) {
                Some(rest) => rest,
                None => break,
            };
            let (role, instance) = match rest.split_once('/') {
                Some(parts) => parts,
                None => continue,
            };
            let record: MemberRecord = match serde_json::from_str(raw) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(error = ?err, key = %key, "dropping malformed member record");
                    continue;
                }
            };
            if record.heartbeat + self.member_ttl <= now {
                continue;
            }
            let member = Member {
                instance: instance.into(),
                joined_at: record.joined_at,
            };
            roles.entry(role.into()).or_default().push(member);
        }
        for members in roles.values_mut() {
            members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.instance.cmp(&b.instance)));
        }
        roles
    }
}

#[async_trait]
impl ExchangeStore for RegistryExchange {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn join(&self, role: &str, instance: &str) -> Result<()> {
        let key = Self::member_key(role, instance);
        let now = now_millis();
        // Keep the original join time of a live membership so that join order is stable.
        let joined_at = match self.registry.get(&key).await? {
            Some(raw) => match serde_json::from_str::<MemberRecord>(&raw) {
                Ok(record) if record.heartbeat + self.member_ttl > now => record.joined_at,
                _ => now,
            },
            None => now,
        };
        let record = serde_json::to_string(&MemberRecord { joined_at, heartbeat: now }).context("error encoding member record")?;
        self.registry.put(&key, &record).await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn depart(&self, role: &str, instance: &str) -> Result<()> {
        self.registry.delete(&Self::member_key(role, instance)).await
    }

    async fn members(&self, role: &str) -> Result<Vec<Member>> {
        let prefix = format!("{}{}/", MEMBERS_PREFIX, role);
        let listing = self.registry.get_prefix(&prefix).await?;
        let mut roles = self.live_members(&listing, now_millis());
        Ok(roles.remove(role).unwrap_or_default())
    }

    #[tracing::instrument(level = "trace", skip(self, value))]
    async fn publish(&self, writer: &str, scope: &Scope, key: &str, value: &str) -> HandlerResult {
        let data_key = scope.data_key(key);
        for _ in 0..MAX_FENCED_WRITE_ATTEMPTS {
            let fence = self.check_fence(writer, scope).await?;
            let current = self.registry.get(&data_key).await.map_err(AppError::collaborator)?;
            if current.as_deref() == Some(value) {
                return Ok(());
            }
            let (guard_key, guard) = match fence {
                Some(fence) => fence,
                None => return self.registry.put(&data_key, value).await.map_err(AppError::collaborator),
            };
            // The write only lands if the lease checked above is still the current one.
            let applied = self
                .registry
                .put_guarded(&data_key, value, &guard_key, &guard)
                .await
                .map_err(AppError::collaborator)?;
            if applied {
                return Ok(());
            }
            tracing::debug!(writer, ?scope, "writer lease changed during publish, re-checking fence");
        }
        Err(AppError::collaborator(anyhow!(
            "writer lease of {:?} kept changing while {} was publishing",
            scope,
            writer
        )))
    }

    async fn read(&self, scope: &Scope, key: &str) -> Result<Option<String>> {
        self.registry.get(&scope.data_key(key)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notify.subscribe()
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn sync(&self) -> Result<()> {
        let listing = self.registry.get_prefix(EXCHANGE_PREFIX).await?;
        let now = now_millis();
        let members: BTreeMap<String, BTreeSet<String>> = self
            .live_members(&listing, now)
            .into_iter()
            .map(|(role, members)| (role, members.into_iter().map(|member| member.instance).collect()))
            .collect();
        let data: BTreeMap<String, String> = listing
            .into_iter()
            .filter(|(key, _)| !key.starts_with(MEMBERS_PREFIX))
            .collect();

        let mut observed = self.observed.lock().await;
        let mut notifications = vec![];

        // Diff membership per role.
        let roles: BTreeSet<&String> = members.keys().chain(observed.members.keys()).collect();
        for role in roles {
            if members.get(role) != observed.members.get(role) {
                notifications.push(ChangeNotification::Membership { role: role.clone() });
            }
        }

        // Diff data, grouping changed keys by scope.
        let mut changed: BTreeMap<Scope, Vec<String>> = BTreeMap::new();
        let keys: BTreeSet<&String> = data.keys().chain(observed.data.keys()).collect();
        for key in keys {
            if data.get(key) == observed.data.get(key) {
                continue;
            }
            match Scope::parse(key) {
                Some((scope, data_key)) => changed.entry(scope).or_default().push(data_key),
                None => tracing::warn!(key = %key, "ignoring unrecognized exchange key"),
            }
        }
        notifications.extend(changed.into_iter().map(|(scope, keys)| ChangeNotification::Data { scope, keys }));

        observed.data = data;
        observed.members = members;
        drop(observed);

        for notification in notifications {
            tracing::debug!(?notification, "exchange change observed");
            // No receivers is fine, nobody is interested yet.
            let _ = self.notify.send(notification);
        }
        Ok(())
    }
}

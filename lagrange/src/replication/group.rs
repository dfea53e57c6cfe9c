//! Replicated groups and their housekeeping timer.
//!
//! A [`ReplicatedGroup`] is a set of member addresses sharing one replicated
//! log through a [`ReplicatedExecutor`]. Leadership is never cached: every
//! [`is_leader`](ReplicatedGroup::is_leader) call asks the executor.
//!
//! # Housekeeping
//!
//! Specialized groups implement [`HouseKeeping`] and register themselves with
//! [`ReplicatedGroup::start_house_keeping`]. The timer task holds a `Weak`
//! reference to the target:
//! - The group owns the task handle and aborts it on close
//! - When the target is dropped, `Weak::upgrade()` fails and the task exits

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::replication::executor::{ExecutorError, LEADER_MARKER, Query, ReplicatedExecutor, Row};

/// Periodic maintenance run by a group's timer.
#[async_trait]
pub trait HouseKeeping: Send + Sync {
    /// One tick. Groups without maintenance work fail loudly so a missing
    /// override is noticed.
    async fn house_keeping(&self) -> Result<(), GroupError> {
        Err(GroupError::HouseKeepingNotImplemented)
    }
}

/// A consensus group of one or more members.
pub struct ReplicatedGroup {
    id: String,
    members: RwLock<BTreeSet<String>>,
    executor: Arc<dyn ReplicatedExecutor>,
    timer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for ReplicatedGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedGroup")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ReplicatedGroup {
    /// Create a group.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::NoMembers`] if `members` is empty.
    pub fn new(
        id: impl Into<String>,
        members: impl IntoIterator<Item = String>,
        executor: Arc<dyn ReplicatedExecutor>,
    ) -> Result<Self, GroupError> {
        let members: BTreeSet<String> = members.into_iter().collect();
        if members.is_empty() {
            return Err(GroupError::NoMembers);
        }
        Ok(Self {
            id: id.into(),
            members: RwLock::new(members),
            executor,
            timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> Result<Vec<String>, GroupError> {
        let members = self.members.read().map_err(|_| GroupError::LockPoisoned)?;
        Ok(members.iter().cloned().collect())
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn ReplicatedExecutor> {
        &self.executor
    }

    /// Whether the local member currently leads the group.
    pub async fn is_leader(&self) -> Result<bool, GroupError> {
        let status = self.executor.status().await?;
        Ok(status.contains(LEADER_MARKER))
    }

    pub async fn execute(&self, query: &Query) -> Result<Vec<Row>, GroupError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GroupError::Closed);
        }
        Ok(self.executor.execute_query(query).await?)
    }

    /// Admit `address` through the executor, then record it as a member.
    pub async fn add_member(&self, address: &str) -> Result<(), GroupError> {
        self.executor.add_member(address).await?;
        self.members
            .write()
            .map_err(|_| GroupError::LockPoisoned)?
            .insert(address.to_owned());
        Ok(())
    }

    /// Start ticking `target` every `interval`, replacing any earlier timer.
    /// The first tick happens one full interval from now.
    pub fn start_house_keeping(
        &self,
        target: Weak<dyn HouseKeeping>,
        interval: Duration,
    ) -> Result<(), GroupError> {
        let handle = spawn_house_keeping(self.id.clone(), target, interval);
        let previous = self
            .timer
            .lock()
            .map_err(|_| GroupError::LockPoisoned)?
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Stop the timer and close the executor. Safe to call more than once.
    pub async fn close(&self) -> Result<(), GroupError> {
        let timer = self
            .timer
            .lock()
            .map_err(|_| GroupError::LockPoisoned)?
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(group = %self.id, "closing replicated group");
        Ok(self.executor.close().await?)
    }
}

#[async_trait]
impl HouseKeeping for ReplicatedGroup {}

/// Spawn the tick loop. Tick errors are logged and do not stop the timer.
fn spawn_house_keeping(
    group_id: String,
    target: Weak<dyn HouseKeeping>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                tracing::debug!(group = %group_id, "housekeeping target dropped, stopping timer");
                break;
            };
            if let Err(e) = target.house_keeping().await {
                tracing::warn!(group = %group_id, "housekeeping failed: {e}");
            }
        }
    })
}

/// Errors returned by replicated groups.
#[derive(Debug)]
pub enum GroupError {
    /// A group needs at least one member.
    NoMembers,
    /// The group was ticked but has no housekeeping of its own.
    HouseKeepingNotImplemented,
    /// The group has been closed.
    Closed,
    /// The executor failed.
    Executor(ExecutorError),
    /// A stored row could not be decoded.
    Decode(serde_json::Error),
    /// An internal lock was poisoned.
    LockPoisoned,
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMembers => write!(f, "replicated group needs at least one member"),
            Self::HouseKeepingNotImplemented => {
                write!(f, "house keeping is not implemented for this group")
            }
            Self::Closed => write!(f, "replicated group is closed"),
            Self::Executor(e) => write!(f, "executor error: {e}"),
            Self::Decode(e) => write!(f, "row decode error: {e}"),
            Self::LockPoisoned => write!(f, "group lock poisoned"),
        }
    }
}

impl std::error::Error for GroupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Executor(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ExecutorError> for GroupError {
    fn from(e: ExecutorError) -> Self {
        Self::Executor(e)
    }
}

impl From<serde_json::Error> for GroupError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e)
    }
}

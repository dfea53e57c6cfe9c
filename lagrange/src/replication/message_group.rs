//! Durable log of outbound messages awaiting acknowledgement.
//!
//! Each row of the `messages` table is one in-flight message together with
//! everything needed to resend it or resume its callback once the ACK
//! arrives. All rows go through the group's executor, so every member of
//! the group sees the same log.

use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::cache::schema::MESSAGES;
use crate::config::MessagingConfig;
use crate::messaging::envelope::Message;
use crate::replication::executor::{Query, Row};
use crate::replication::group::{GroupError, HouseKeeping, ReplicatedGroup};
use crate::time::TimeSource;

/// Invoked on every housekeeping tick while this member leads the group.
pub type HouseKeepingCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A row of the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub message_id: String,
    pub message_name: String,
    /// JSON text of the caller's context.
    pub context: String,
    pub callback: Option<String>,
    pub creation_time: u64,
    pub resends: u32,
    pub destination: String,
    /// JSON text of the full envelope.
    pub payload: String,
}

impl PersistedMessage {
    fn from_row(row: Row) -> Result<Self, GroupError> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    pub fn context_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.context)
    }

    pub fn envelope(&self) -> Result<Message, serde_json::Error> {
        Message::from_json(&self.payload)
    }
}

/// A replicated group holding the `messages` table.
///
/// # Invariants
///
/// - `messageId` is unique within the table
/// - A row's resend count only grows, and a row with `max_resends` or more
///   resends is exhausted
/// - The housekeeping callback only runs while this member leads the group
pub struct MessageGroup {
    group: ReplicatedGroup,
    max_resends: u32,
    time: Arc<dyn TimeSource>,
    callback: RwLock<Option<HouseKeepingCallback>>,
}

impl fmt::Debug for MessageGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageGroup")
            .field("group", &self.group)
            .field("max_resends", &self.max_resends)
            .finish_non_exhaustive()
    }
}

impl MessageGroup {
    /// Create the `messages` table and start the housekeeping timer.
    pub async fn open(
        group: ReplicatedGroup,
        config: &MessagingConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Arc<Self>, GroupError> {
        for statement in MESSAGES.create_statements() {
            group.execute(&Query::new(statement)).await?;
        }

        let message_group = Arc::new(Self {
            group,
            max_resends: config.max_resends,
            time,
            callback: RwLock::new(None),
        });
        let weak = Arc::downgrade(&message_group);
        let target: Weak<dyn HouseKeeping> = weak;
        message_group
            .group
            .start_house_keeping(target, config.housekeeping_interval)?;
        Ok(message_group)
    }

    #[must_use]
    pub const fn group(&self) -> &ReplicatedGroup {
        &self.group
    }

    #[must_use]
    pub const fn max_resends(&self) -> u32 {
        self.max_resends
    }

    pub fn set_house_keeping_callback(&self, callback: HouseKeepingCallback) -> Result<(), GroupError> {
        *self.callback.write().map_err(|_| GroupError::LockPoisoned)? = Some(callback);
        Ok(())
    }

    /// Record `message` as sent to `destination`, with zero resends.
    ///
    /// # Pre-conditions
    ///
    /// - No row has `message.request_id` as its `messageId`
    ///
    /// # Post-conditions
    ///
    /// - [`get_unacknowledged_messages`](Self::get_unacknowledged_messages)
    ///   includes the message, stamped with the current time
    pub async fn save_message(
        &self,
        message: &Message,
        destination: &str,
        context: &Value,
        callback: Option<&str>,
    ) -> Result<(), GroupError> {
        let query = Query::with_params(
            "INSERT INTO messages (messageId, messageName, context, callback, creationTime, \
             resends, destination, payload) VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
            vec![
                json!(message.request_id.to_string()),
                json!(message.message_name),
                json!(context.to_string()),
                json!(callback),
                json!(self.time.now_ms()),
                json!(destination),
                json!(message.to_json()?),
            ],
        );
        self.group.execute(&query).await?;
        Ok(())
    }

    pub async fn find_message_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<PersistedMessage>, GroupError> {
        let rows = self
            .group
            .execute(&Query::with_params(
                "SELECT * FROM messages WHERE messageId = ?",
                vec![json!(message_id)],
            ))
            .await?;
        rows.into_iter().next().map(PersistedMessage::from_row).transpose()
    }

    /// # Post-conditions
    ///
    /// - The row's resend count is one higher; a missing row is ignored
    pub async fn increment_resends_for_message(&self, message_id: &str) -> Result<(), GroupError> {
        self.group
            .execute(&Query::with_params(
                "UPDATE messages SET resends = resends + 1 WHERE messageId = ?",
                vec![json!(message_id)],
            ))
            .await?;
        Ok(())
    }

    /// Delete a message. Returns whether a row was removed.
    pub async fn remove_message_by_message_id(&self, message_id: &str) -> Result<bool, GroupError> {
        let removed = self
            .group
            .execute(&Query::with_params(
                "DELETE FROM messages WHERE messageId = ? RETURNING messageId",
                vec![json!(message_id)],
            ))
            .await?;
        Ok(!removed.is_empty())
    }

    /// Messages with retries left, oldest first.
    pub async fn get_unacknowledged_messages(&self) -> Result<Vec<PersistedMessage>, GroupError> {
        self.select_by_resends("SELECT * FROM messages WHERE resends < ? ORDER BY creationTime")
            .await
    }

    /// Messages that have used up their retries.
    pub async fn get_exhausted_messages(&self) -> Result<Vec<PersistedMessage>, GroupError> {
        self.select_by_resends("SELECT * FROM messages WHERE resends >= ? ORDER BY creationTime")
            .await
    }

    async fn select_by_resends(&self, sql: &str) -> Result<Vec<PersistedMessage>, GroupError> {
        self.group
            .execute(&Query::with_params(sql, vec![json!(self.max_resends)]))
            .await?
            .into_iter()
            .map(PersistedMessage::from_row)
            .collect()
    }

    pub async fn close(&self) -> Result<(), GroupError> {
        self.group.close().await
    }
}

#[async_trait]
impl HouseKeeping for MessageGroup {
    async fn house_keeping(&self) -> Result<(), GroupError> {
        if !self.group.is_leader().await? {
            return Ok(());
        }
        let callback = self
            .callback
            .read()
            .map_err(|_| GroupError::LockPoisoned)?
            .clone();
        if let Some(callback) = callback {
            callback().await;
        }
        Ok(())
    }
}

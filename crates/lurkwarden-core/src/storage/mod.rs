//! Storage layer for membership data
//!
//! Every chat is persisted as one [`ChatDocument`]. [`DocumentStore`] implements
//! [`MembershipStore`] on top of any [`DocumentBackend`], serializing writes per
//! chat so concurrent upserts never lose each other's changes.

mod document;
mod memory;
mod r2;

pub use document::ChatDocument;
pub use memory::MemoryBackend;
pub use r2::R2Backend;

use crate::model::{
    ActivityRecord, ChatConfig, ChatConfigUpdate, CounterKind, EscalationRecord, MemberRecord,
    StatusFilter, Transition,
};
use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error retrieving object from S3
    #[error("S3 Get error: {0}")]
    S3Get(Box<SdkError<GetObjectError>>),
    /// Error putting or deleting an object in S3
    #[error("S3 put error: {0}")]
    S3Put(String),
    /// Error listing objects in S3
    #[error("S3 list error: {0}")]
    S3List(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
    /// Stored data contradicts itself
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),
}

/// Interface for membership persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Apply a transition to one record, creating it if needed
    async fn upsert_member(
        &self,
        chat_id: i64,
        user_id: i64,
        transition: Transition,
    ) -> Result<MemberRecord, StorageError>;
    /// Apply many transitions to one chat in a single write
    async fn upsert_members(
        &self,
        chat_id: i64,
        batch: Vec<(i64, Transition)>,
    ) -> Result<(), StorageError>;
    /// Get one membership record
    async fn get_member(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<MemberRecord>, StorageError>;
    /// Every chat the user has a record in
    async fn list_user_memberships(&self, user_id: i64) -> Result<Vec<MemberRecord>, StorageError>;
    /// Case-insensitive handle lookup
    async fn find_member_by_handle(
        &self,
        chat_id: i64,
        handle: String,
    ) -> Result<Option<MemberRecord>, StorageError>;
    /// Records of a chat matching the filter
    async fn list_members(
        &self,
        chat_id: i64,
        filter: StatusFilter,
    ) -> Result<Vec<MemberRecord>, StorageError>;
    /// Ids of a chat matching the filter
    async fn list_member_ids(
        &self,
        chat_id: i64,
        filter: StatusFilter,
    ) -> Result<HashSet<i64>, StorageError>;
    /// Start tracking a user, or move the timestamp forward if newer
    async fn upsert_activity(
        &self,
        user_id: i64,
        chat_id: i64,
        posted_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;
    /// Stop tracking one user
    async fn delete_activity(&self, user_id: i64, chat_id: i64) -> Result<(), StorageError>;
    /// Stop tracking several users
    async fn delete_activities(&self, chat_id: i64, user_ids: Vec<i64>)
        -> Result<(), StorageError>;
    /// Activity of every tracked user of a chat
    async fn list_activity(
        &self,
        chat_id: i64,
    ) -> Result<HashMap<i64, ActivityRecord>, StorageError>;
    /// Bump an escalation counter
    async fn increment_counter(
        &self,
        user_id: i64,
        chat_id: i64,
        kind: CounterKind,
        at: DateTime<Utc>,
        last_posted: Option<DateTime<Utc>>,
    ) -> Result<EscalationRecord, StorageError>;
    /// Read an escalation counter; zero when absent
    async fn get_counter(
        &self,
        user_id: i64,
        chat_id: i64,
        kind: CounterKind,
    ) -> Result<EscalationRecord, StorageError>;
    /// Chat configuration, `None` if untracked
    async fn get_chat_config(&self, chat_id: i64) -> Result<Option<ChatConfig>, StorageError>;
    /// Apply a configuration update, tracking the chat if needed
    async fn update_chat_config(
        &self,
        chat_id: i64,
        update: ChatConfigUpdate,
    ) -> Result<ChatConfig, StorageError>;
    /// Apply a configuration update to a tracked chat only; `None` if untracked
    async fn touch_chat_config(
        &self,
        chat_id: i64,
        update: ChatConfigUpdate,
    ) -> Result<Option<ChatConfig>, StorageError>;
    /// Ids of every tracked chat
    async fn list_chat_ids(&self) -> Result<Vec<i64>, StorageError>;
    /// Forget a chat and everything stored for it
    async fn delete_chat(&self, chat_id: i64) -> Result<(), StorageError>;
    /// Whitelist a user; `true` if newly added
    async fn add_whitelist(&self, user_id: i64, chat_id: i64) -> Result<bool, StorageError>;
    /// Remove a user from the whitelist; `true` if they were on it
    async fn remove_whitelist(&self, user_id: i64, chat_id: i64) -> Result<bool, StorageError>;
    /// Whitelisted ids of a chat
    async fn list_whitelist(&self, chat_id: i64) -> Result<HashSet<i64>, StorageError>;
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), StorageError>;
}

/// Raw persistence of chat documents
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Load a chat document
    async fn load(&self, chat_id: i64) -> Result<Option<ChatDocument>, StorageError>;
    /// Replace a chat document
    async fn save(&self, document: &ChatDocument) -> Result<(), StorageError>;
    /// Remove a chat document
    async fn delete(&self, chat_id: i64) -> Result<(), StorageError>;
    /// Ids of every stored document
    async fn list_chat_ids(&self) -> Result<Vec<i64>, StorageError>;
    /// Check connection to the backend
    async fn check_connection(&self) -> Result<(), StorageError>;
}

/// [`MembershipStore`] over a document backend.
pub struct DocumentStore<B> {
    backend: B,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

/// In-process store.
pub type MemoryStore = DocumentStore<MemoryBackend>;
/// R2-backed store.
pub type R2Store = DocumentStore<R2Backend>;

impl MemoryStore {
    /// Empty in-process store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }
}

impl<B: DocumentBackend> DocumentStore<B> {
    /// Wrap a backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn chat_lock(&self, chat_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(chat_id).or_default())
    }

    async fn read<R, F>(&self, chat_id: i64, reader: F) -> Result<Option<R>, StorageError>
    where
        F: FnOnce(&ChatDocument) -> R + Send,
    {
        Ok(self.backend.load(chat_id).await?.as_ref().map(reader))
    }

    /// Load-modify-save under the chat's write lock.
    async fn write<R, F>(&self, chat_id: i64, writer: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut ChatDocument) -> R + Send,
        R: Send,
    {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;
        let mut document = self
            .backend
            .load(chat_id)
            .await?
            .unwrap_or_else(|| ChatDocument::new(chat_id));
        let result = writer(&mut document);
        self.backend.save(&document).await?;
        Ok(result)
    }

    /// Like [`DocumentStore::write`], but leaves a missing document missing.
    async fn write_existing<R, F>(&self, chat_id: i64, writer: F) -> Result<Option<R>, StorageError>
    where
        F: FnOnce(&mut ChatDocument) -> R + Send,
        R: Send,
    {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;
        let Some(mut document) = self.backend.load(chat_id).await? else {
            return Ok(None);
        };
        let result = writer(&mut document);
        self.backend.save(&document).await?;
        Ok(Some(result))
    }
}

#[async_trait]
impl<B: DocumentBackend> MembershipStore for DocumentStore<B> {
    async fn upsert_member(
        &self,
        chat_id: i64,
        user_id: i64,
        transition: Transition,
    ) -> Result<MemberRecord, StorageError> {
        self.write(chat_id, |doc| doc.apply(user_id, &transition).clone())
            .await
    }

    async fn upsert_members(
        &self,
        chat_id: i64,
        batch: Vec<(i64, Transition)>,
    ) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.write(chat_id, |doc| {
            for (user_id, transition) in &batch {
                doc.apply(*user_id, transition);
            }
        })
        .await
    }

    async fn get_member(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<MemberRecord>, StorageError> {
        Ok(self
            .read(chat_id, |doc| doc.members.get(&user_id).cloned())
            .await?
            .flatten())
    }

    async fn list_user_memberships(&self, user_id: i64) -> Result<Vec<MemberRecord>, StorageError> {
        let mut memberships = Vec::new();
        for chat_id in self.backend.list_chat_ids().await? {
            if let Some(Some(record)) = self
                .read(chat_id, |doc| doc.members.get(&user_id).cloned())
                .await?
            {
                memberships.push(record);
            }
        }
        Ok(memberships)
    }

    async fn find_member_by_handle(
        &self,
        chat_id: i64,
        handle: String,
    ) -> Result<Option<MemberRecord>, StorageError> {
        Ok(self
            .read(chat_id, |doc| doc.find_by_handle(&handle).cloned())
            .await?
            .flatten())
    }

    async fn list_members(
        &self,
        chat_id: i64,
        filter: StatusFilter,
    ) -> Result<Vec<MemberRecord>, StorageError> {
        Ok(self
            .read(chat_id, |doc| {
                doc.members_matching(filter).cloned().collect::<Vec<_>>()
            })
            .await?
            .unwrap_or_default())
    }

    async fn list_member_ids(
        &self,
        chat_id: i64,
        filter: StatusFilter,
    ) -> Result<HashSet<i64>, StorageError> {
        Ok(self
            .read(chat_id, |doc| {
                doc.members_matching(filter)
                    .map(|record| record.user_id)
                    .collect::<HashSet<_>>()
            })
            .await?
            .unwrap_or_default())
    }

    async fn upsert_activity(
        &self,
        user_id: i64,
        chat_id: i64,
        posted_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        self.write(chat_id, |doc| {
            doc.activity.entry(user_id).or_default().touch(posted_at);
        })
        .await
    }

    async fn delete_activity(&self, user_id: i64, chat_id: i64) -> Result<(), StorageError> {
        self.delete_activities(chat_id, vec![user_id]).await
    }

    async fn delete_activities(
        &self,
        chat_id: i64,
        user_ids: Vec<i64>,
    ) -> Result<(), StorageError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.write(chat_id, |doc| {
            for user_id in &user_ids {
                doc.activity.remove(user_id);
            }
        })
        .await
    }

    async fn list_activity(
        &self,
        chat_id: i64,
    ) -> Result<HashMap<i64, ActivityRecord>, StorageError> {
        Ok(self
            .read(chat_id, |doc| doc.activity.clone())
            .await?
            .unwrap_or_default())
    }

    async fn increment_counter(
        &self,
        user_id: i64,
        chat_id: i64,
        kind: CounterKind,
        at: DateTime<Utc>,
        last_posted: Option<DateTime<Utc>>,
    ) -> Result<EscalationRecord, StorageError> {
        self.write(chat_id, |doc| {
            let counter = doc.counters_mut(kind).entry(user_id).or_default();
            counter.increment(at, last_posted);
            *counter
        })
        .await
    }

    async fn get_counter(
        &self,
        user_id: i64,
        chat_id: i64,
        kind: CounterKind,
    ) -> Result<EscalationRecord, StorageError> {
        Ok(self
            .read(chat_id, |doc| doc.counter(kind, user_id))
            .await?
            .unwrap_or_default())
    }

    async fn get_chat_config(&self, chat_id: i64) -> Result<Option<ChatConfig>, StorageError> {
        self.read(chat_id, |doc| doc.config.clone()).await
    }

    async fn update_chat_config(
        &self,
        chat_id: i64,
        update: ChatConfigUpdate,
    ) -> Result<ChatConfig, StorageError> {
        self.write(chat_id, |doc| {
            doc.config.apply(&update);
            doc.config.clone()
        })
        .await
    }

    async fn touch_chat_config(
        &self,
        chat_id: i64,
        update: ChatConfigUpdate,
    ) -> Result<Option<ChatConfig>, StorageError> {
        self.write_existing(chat_id, |doc| {
            doc.config.apply(&update);
            doc.config.clone()
        })
        .await
    }

    async fn list_chat_ids(&self) -> Result<Vec<i64>, StorageError> {
        self.backend.list_chat_ids().await
    }

    async fn delete_chat(&self, chat_id: i64) -> Result<(), StorageError> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;
        self.backend.delete(chat_id).await
    }

    async fn add_whitelist(&self, user_id: i64, chat_id: i64) -> Result<bool, StorageError> {
        self.write(chat_id, |doc| doc.whitelist.insert(user_id))
            .await
    }

    async fn remove_whitelist(&self, user_id: i64, chat_id: i64) -> Result<bool, StorageError> {
        Ok(self
            .write_existing(chat_id, |doc| doc.whitelist.remove(&user_id))
            .await?
            .unwrap_or(false))
    }

    async fn list_whitelist(&self, chat_id: i64) -> Result<HashSet<i64>, StorageError> {
        Ok(self
            .read(chat_id, |doc| doc.whitelist.iter().copied().collect::<HashSet<_>>())
            .await?
            .unwrap_or_default())
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        self.backend.check_connection().await
    }
}

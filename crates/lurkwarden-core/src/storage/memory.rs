use super::{ChatDocument, DocumentBackend, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps chat documents in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    documents: RwLock<HashMap<i64, ChatDocument>>,
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn load(&self, chat_id: i64) -> Result<Option<ChatDocument>, StorageError> {
        Ok(self.documents.read().await.get(&chat_id).cloned())
    }

    async fn save(&self, document: &ChatDocument) -> Result<(), StorageError> {
        self.documents
            .write()
            .await
            .insert(document.chat_id(), document.clone());
        Ok(())
    }

    async fn delete(&self, chat_id: i64) -> Result<(), StorageError> {
        self.documents.write().await.remove(&chat_id);
        Ok(())
    }

    async fn list_chat_ids(&self) -> Result<Vec<i64>, StorageError> {
        let mut ids: Vec<i64> = self.documents.read().await.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

use super::{ChatDocument, DocumentBackend, StorageError};
use crate::config::ModerationSettings;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CHAT_PREFIX: &str = "chats/";

/// R2-backed document storage, one JSON object per chat
pub struct R2Backend {
    client: Client,
    bucket: String,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl R2Backend {
    /// Create a new R2 backend
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &ModerationSettings) -> Result<Self, StorageError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-storage");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(60 * 60))
            .time_to_idle(Duration::from_secs(30 * 60))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
            cache,
        })
    }

    async fn put_bytes(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        // Write-through
        self.cache.insert(key.to_string(), Arc::new(body.clone())).await;

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await;
        if let Err(e) = result {
            // The cache must not serve a write S3 never saw
            self.cache.invalidate(key).await;
            return Err(StorageError::S3Put(e.to_string()));
        }
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, StorageError> {
        if let Some(cached) = self.cache.get(key).await {
            return Ok(Some(cached));
        }

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                    .into_bytes();
                let data = Arc::new(data.to_vec());
                self.cache.insert(key.to_string(), Arc::clone(&data)).await;
                Ok(Some(data))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(StorageError::S3Get(Box::new(e))),
        }
    }
}

#[async_trait]
impl DocumentBackend for R2Backend {
    async fn load(&self, chat_id: i64) -> Result<Option<ChatDocument>, StorageError> {
        let key = chat_document_key(chat_id);
        let Some(bytes) = self.get_bytes(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ChatDocument>(&bytes) {
            Ok(document) if document.chat_id() == chat_id => Ok(Some(document)),
            Ok(document) => Err(StorageError::DataInconsistency(format!(
                "{key} holds chat {}",
                document.chat_id()
            ))),
            Err(e) => {
                warn!(key = %key, error = %e, "Chat document failed to deserialize");
                self.cache.invalidate(&key).await;
                Err(e.into())
            }
        }
    }

    async fn save(&self, document: &ChatDocument) -> Result<(), StorageError> {
        let body = serde_json::to_vec(document)?;
        self.put_bytes(&chat_document_key(document.chat_id()), body)
            .await
    }

    async fn delete(&self, chat_id: i64) -> Result<(), StorageError> {
        let key = chat_document_key(chat_id);
        self.cache.invalidate(&key).await;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StorageError::S3Put(e.to_string()))?;
        Ok(())
    }

    async fn list_chat_ids(&self) -> Result<Vec<i64>, StorageError> {
        let mut ids = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(CHAT_PREFIX)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::S3List(e.to_string()))?;

            ids.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(chat_id_from_key),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        match self.client.list_buckets().send().await {
            Ok(_) => {
                info!("Successfully connected to R2 storage.");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(StorageError::Config(err_msg))
            }
        }
    }
}

/// Returns the R2 key of a chat's document
#[must_use]
pub fn chat_document_key(chat_id: i64) -> String {
    format!("{CHAT_PREFIX}{chat_id}.json")
}

fn chat_id_from_key(key: &str) -> Option<i64> {
    key.strip_prefix(CHAT_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

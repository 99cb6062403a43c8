//! JSON-lines persistence
//!
//! Appends one record per line to a file. Saved messages get a canonical
//! `msg_<uuid>` id; artifact links are recorded as their own lines. The store
//! keeps no artifacts of its own, so linking always reports zero updates.
//!
//! ```text
//! {"record":"message","id":"msg_…","localId":"local_…","role":"assistant","text":"…",…}
//! {"record":"link","requestId":"r1","canonicalId":"msg_…","chatId":null}
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::messages::{MessageId, RequestId};

use super::{DraftMessage, PersistenceError, PersistenceSink, SavedMessage};

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "camelCase")]
enum Record<'a> {
    #[serde(rename_all = "camelCase")]
    Message {
        id: &'a MessageId,
        #[serde(flatten)]
        draft: &'a DraftMessage,
    },
    #[serde(rename_all = "camelCase")]
    Link {
        request_id: &'a RequestId,
        canonical_id: &'a MessageId,
        chat_id: Option<&'a str>,
    },
}

/// Append-only file store
pub struct JsonlPersistence {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlPersistence {
    /// Open (or create) the file at `path` for appending
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Io` if the file or its parent directory
    /// cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::debug!(path = %path.display(), "Opened message log");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// File being appended to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &Record<'_>) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for JsonlPersistence {
    async fn save(&self, draft: DraftMessage) -> Result<SavedMessage, PersistenceError> {
        let id = MessageId(format!("msg_{}", uuid::Uuid::new_v4().simple()));
        self.append(&Record::Message { id: &id, draft: &draft })
            .await?;
        Ok(SavedMessage { id })
    }

    async fn link_artifacts(
        &self,
        request_id: &RequestId,
        canonical_id: &MessageId,
        chat_id: Option<&str>,
    ) -> Result<usize, PersistenceError> {
        self.append(&Record::Link {
            request_id,
            canonical_id,
            chat_id,
        })
        .await?;
        Ok(0)
    }
}

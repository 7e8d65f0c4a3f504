use crate::domain::invoice::InvoicePair;
use crate::domain::ports::{Attachment, DocumentRenderer, EmailClient, ObjectStorage};
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Renders the invoice pair as pretty-printed JSON.
#[derive(Debug, Default, Clone)]
pub struct JsonDocumentRenderer;

#[async_trait]
impl DocumentRenderer for JsonDocumentRenderer {
    fn file_extension(&self) -> &str {
        "json"
    }

    async fn render(&self, pair: &InvoicePair) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(pair)?)
    }
}

/// Object storage on the local file system, rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStorage for FileSystemStorage {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ReconcileError::ValidationError(format!(
                "object path '{path}' must be relative"
            )));
        }
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(format!("file://{}", target.display()))
    }
}

/// Mail client that only logs what it would send.
#[derive(Debug, Default, Clone)]
pub struct LoggingEmailClient;

#[async_trait]
impl EmailClient for LoggingEmailClient {
    async fn send(&self, to: &str, subject: &str, attachments: &[Attachment]) -> Result<()> {
        let files: Vec<&str> = attachments.iter().map(|a| a.file_name.as_str()).collect();
        info!(to, subject, ?files, "Email queued");
        Ok(())
    }
}

//! Broadcaster comment REST wrapper.
//!
//! `PUT`/`DELETE` against the unama broadcaster_comment endpoint,
//! authenticated by the `x-public-api-token` header from the watch page.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const BROADCASTER_COMMENT_BASE: &str = "https://live2.nicovideo.jp/unama/api/v3/programs";
const TOKEN_HEADER: &str = "x-public-api-token";

#[derive(Debug, Error)]
pub enum CommentError {
    #[error("broadcaster comment endpoint returned status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
}

/// A pinned broadcaster comment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcasterComment {
    pub text: String,
    pub name: Option<String>,
    pub is_permanent: bool,
    /// Color command, e.g. `red`.
    pub command: Option<String>,
}

impl BroadcasterComment {
    fn form_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("text", self.text.clone()),
            ("isPermanent", self.is_permanent.to_string()),
        ];
        if let Some(name) = &self.name {
            params.push(("name", name.clone()));
        }
        if let Some(command) = &self.command {
            params.push(("command", command.clone()));
        }
        params
    }
}

#[async_trait]
pub trait CommentBackend: Send + Sync {
    async fn put(
        &self,
        live_id: &str,
        token: &str,
        params: Vec<(&'static str, String)>,
    ) -> Result<u16, CommentError>;

    async fn delete(&self, live_id: &str, token: &str) -> Result<u16, CommentError>;
}

pub struct ReqwestCommentBackend {
    client: reqwest::Client,
}

impl ReqwestCommentBackend {
    pub fn new() -> Result<Self, CommentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| CommentError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn endpoint(live_id: &str) -> String {
        format!("{BROADCASTER_COMMENT_BASE}/{live_id}/broadcaster_comment")
    }
}

#[async_trait]
impl CommentBackend for ReqwestCommentBackend {
    async fn put(
        &self,
        live_id: &str,
        token: &str,
        params: Vec<(&'static str, String)>,
    ) -> Result<u16, CommentError> {
        let response = self
            .client
            .put(Self::endpoint(live_id))
            .header(TOKEN_HEADER, token)
            .form(&params)
            .send()
            .await
            .map_err(|err| CommentError::Network(err.to_string()))?;
        Ok(response.status().as_u16())
    }

    async fn delete(&self, live_id: &str, token: &str) -> Result<u16, CommentError> {
        let response = self
            .client
            .delete(Self::endpoint(live_id))
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|err| CommentError::Network(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}

pub struct BroadcasterCommentClient {
    backend: Arc<dyn CommentBackend>,
    live_id: String,
    token: String,
}

impl BroadcasterCommentClient {
    pub fn new(live_id: impl Into<String>, token: impl Into<String>) -> Result<Self, CommentError> {
        Ok(Self::with_backend(
            Arc::new(ReqwestCommentBackend::new()?),
            live_id,
            token,
        ))
    }

    pub fn with_backend(
        backend: Arc<dyn CommentBackend>,
        live_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            live_id: live_id.into(),
            token: token.into(),
        }
    }

    /// Posts (or replaces) the pinned broadcaster comment.
    pub async fn put(&self, comment: &BroadcasterComment) -> Result<(), CommentError> {
        let status = self
            .backend
            .put(&self.live_id, &self.token, comment.form_params())
            .await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(CommentError::Status(status))
        }
    }

    /// Deletes the pinned broadcaster comment.
    pub async fn delete(&self) -> Result<(), CommentError> {
        let status = self.backend.delete(&self.live_id, &self.token).await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(CommentError::Status(status))
        }
    }
}

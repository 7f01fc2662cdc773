//! 認証済みセッションでCSVを取得する

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{FetchFailure, UsageError};
use crate::traits::BrowserSession;

/// 取得した生レスポンス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl RawPayload {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// リソース取得（リトライなし・1リクエストのみ）
#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    url: String,
    timeout: Duration,
}

impl ResourceFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub async fn fetch(&self, session: &mut dyn BrowserSession) -> Result<RawPayload, UsageError> {
        info!(url = %self.url, "Fetching resource with authenticated session");

        let payload = match tokio::time::timeout(self.timeout, session.fetch(&self.url)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Resource fetch timed out");
                return Err(FetchFailure::NoResponse.into());
            }
        };

        if !payload.is_success() {
            warn!(status = payload.status, "Resource fetch returned error status");
            return Err(FetchFailure::Status(payload.status).into());
        }

        info!(
            status = payload.status,
            content_type = payload.content_type.as_deref().unwrap_or("-"),
            bytes = payload.body.len(),
            "Resource fetched"
        );
        Ok(payload)
    }
}

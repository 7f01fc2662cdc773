//! デバッグ用の副産物（スクリーンショット・HTML）
//!
//! 失敗時の調査用。保存に失敗しても処理は続行し、エラーも変えない。

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::traits::BrowserSession;

const FILE_PREFIX: &str = "ebmud";
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ArtifactSink {
    dir: Option<PathBuf>,
}

impl ArtifactSink {
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        if config.debug_artifacts {
            Self::new(&config.artifact_dir)
        } else {
            Self::disabled()
        }
    }

    fn path_for(dir: &Path, label: &str, extension: &str) -> PathBuf {
        dir.join(format!("{}_{}.{}", FILE_PREFIX, label, extension))
    }

    /// ページのスクリーンショットを保存
    pub async fn capture(&self, session: &dyn BrowserSession, label: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;

        let png = match tokio::time::timeout(CAPTURE_TIMEOUT, session.screenshot()).await {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => {
                warn!(label, error = %e, "Failed to capture screenshot");
                return None;
            }
            Err(_) => {
                warn!(label, "Screenshot capture timed out");
                return None;
            }
        };

        self.write(Self::path_for(dir, label, "png"), png).await
    }

    /// テキスト（HTML本文など）を保存
    pub async fn save_text(&self, label: &str, extension: &str, content: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        self.write(Self::path_for(dir, label, extension), content.as_bytes().to_vec())
            .await
    }

    async fn write(&self, path: PathBuf, bytes: Vec<u8>) -> Option<PathBuf> {
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %path.display(), error = %e, "Failed to create artifact directory");
                return None;
            }
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                info!(path = %path.display(), "Saved debug artifact");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to save debug artifact");
                None
            }
        }
    }
}

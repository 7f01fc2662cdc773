//! 単一エントリのファイルキャッシュ
//!
//! 最後に取得できたCSV（パース済み）を取得時刻付きで1件だけ保持する。
//! 読めない・壊れたファイルはキャッシュミスとして扱う。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UsageError;
use crate::table::Record;

/// 現在時刻の供給元（テストで差し替える）
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "epoch_seconds")]
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<Record>,
}

impl CacheEntry {
    /// `now - fetched_at <= ttl` なら有効
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age <= ttl,
            Err(_) => true,
        }
    }
}

/// 取得時刻は UNIX 秒（小数、ミリ秒精度）で保存する
pub mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(at.timestamp_millis() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() {
            return Err(de::Error::custom("fetched_at is not a finite number"));
        }
        DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
            .ok_or_else(|| de::Error::custom("fetched_at is out of range"))
    }
}

/// キャッシュストア（単一キー・TTL付き）
#[derive(Clone)]
pub struct CacheStore {
    path: PathBuf,
    ttl: Duration,
    clock: Clock,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// 有効期限に関係なく保存済みエントリを読む
    pub async fn load(&self) -> Option<CacheEntry> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to read cache, treating as miss");
                }
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry>(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt cache file, treating as miss");
                None
            }
        }
    }

    /// 有効期限内のエントリのみ返す
    pub async fn get(&self) -> Option<CacheEntry> {
        let entry = self.load().await?;
        let now = self.now();

        if entry.is_fresh_at(now, self.ttl) {
            debug!(
                fetched_at = %entry.fetched_at,
                rows = entry.rows.len(),
                "Cache hit"
            );
            Some(entry)
        } else {
            debug!(fetched_at = %entry.fetched_at, "Cache expired");
            None
        }
    }

    /// エントリを現在時刻で上書き保存（一時ファイルに書いてから rename）
    pub async fn put(&self, rows: Vec<Record>) -> Result<CacheEntry, UsageError> {
        let entry = CacheEntry {
            fetched_at: self.now(),
            rows,
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| UsageError::Cache(format!("シリアライズ失敗: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UsageError::Cache(format!("{}: {}", parent.display(), e)))?;
        }

        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| UsageError::Cache(format!("{}: {}", temp_path.display(), e)))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(UsageError::Cache(format!("{}: {}", self.path.display(), e)));
        }

        info!(
            path = %self.path.display(),
            rows = entry.rows.len(),
            "Cache written"
        );
        Ok(entry)
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
    }
}

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tower::Service;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactSink;
use crate::cache::{epoch_seconds, CacheEntry, CacheStore};
use crate::config::ServiceConfig;
use crate::error::{UsageError, ValidationFailure};
use crate::fetch::ResourceFetcher;
use crate::flight::SingleFlight;
use crate::login::SessionAcquirer;
use crate::table::{self, Latest, Record};
use crate::traits::{BrowserEngine, BrowserSession};
use crate::validate::validate;

/// 取得リクエスト
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// キャッシュの有効期限を無視して取り直す
    pub force_refresh: bool,
}

impl SnapshotRequest {
    pub fn current() -> Self {
        Self::default()
    }

    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
        }
    }
}

/// 取得結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub cached: bool,
    /// 更新に失敗し、期限切れのキャッシュを返している
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
    #[serde(with = "epoch_seconds")]
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<Record>,
}

impl UsageSnapshot {
    fn cached(entry: CacheEntry) -> Self {
        Self {
            cached: true,
            stale: false,
            fetched_at: entry.fetched_at,
            rows: entry.rows,
        }
    }

    fn stale(entry: CacheEntry) -> Self {
        Self {
            stale: true,
            ..Self::cached(entry)
        }
    }

    fn fresh(entry: CacheEntry) -> Self {
        Self {
            cached: false,
            ..Self::cached(entry)
        }
    }

    /// 最新レコード
    pub fn latest(&self, date_column: Option<&str>) -> Option<Latest<'_>> {
        table::latest(&self.rows, date_column)
    }
}

struct Inner {
    config: ServiceConfig,
    engine: Arc<dyn BrowserEngine>,
    cache: CacheStore,
    artifacts: ArtifactSink,
    flight: SingleFlight<UsageSnapshot>,
}

/// 使用量取得サービス（キャッシュ → ログイン → 取得 → 検証 → キャッシュ保存）
///
/// Clone は同じキャッシュ・同じ single-flight を共有する。
#[derive(Clone)]
pub struct UsageService {
    inner: Arc<Inner>,
}

impl UsageService {
    pub fn new(config: ServiceConfig, engine: Arc<dyn BrowserEngine>) -> Self {
        let cache = CacheStore::new(&config.cache.path, config.cache.ttl);
        Self::with_cache(config, engine, cache)
    }

    pub fn with_cache(config: ServiceConfig, engine: Arc<dyn BrowserEngine>, cache: CacheStore) -> Self {
        let artifacts = ArtifactSink::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                cache,
                artifacts,
                flight: SingleFlight::new(),
            }),
        }
    }

    /// 現在の使用量（有効なキャッシュがあればそれを返す）
    pub async fn current(&self) -> Result<UsageSnapshot, UsageError> {
        self.get(SnapshotRequest::current()).await
    }

    /// キャッシュを無視して取り直す
    pub async fn refresh(&self) -> Result<UsageSnapshot, UsageError> {
        self.get(SnapshotRequest::refresh()).await
    }

    pub async fn get(&self, request: SnapshotRequest) -> Result<UsageSnapshot, UsageError> {
        if !request.force_refresh {
            if let Some(entry) = self.inner.cache.get().await {
                info!(rows = entry.rows.len(), "Serving cached usage");
                return Ok(UsageSnapshot::cached(entry));
            }
        }

        let inner = self.inner.clone();
        self.inner
            .flight
            .run(move || async move { inner.refresh(request.force_refresh).await })
            .await
    }
}

impl Inner {
    async fn refresh(&self, force: bool) -> Result<UsageSnapshot, UsageError> {
        // 直前に別の更新が終わっていればそれを使う
        if !force {
            if let Some(entry) = self.cache.get().await {
                return Ok(UsageSnapshot::cached(entry));
            }
        }

        match self.run_pipeline().await {
            Ok(rows) => match self.cache.put(rows.clone()).await {
                Ok(entry) => Ok(UsageSnapshot::fresh(entry)),
                Err(e) => {
                    warn!(error = %e, "Failed to write cache, returning uncached rows");
                    Ok(UsageSnapshot {
                        cached: false,
                        stale: false,
                        fetched_at: self.cache.now(),
                        rows,
                    })
                }
            },
            Err(e) => {
                error!(stage = e.stage(), error = %e, "Usage refresh failed");

                if self.config.cache.serve_stale {
                    if let Some(entry) = self.cache.load().await {
                        warn!(fetched_at = %entry.fetched_at, "Serving expired cache after failed refresh");
                        return Ok(UsageSnapshot::stale(entry));
                    }
                }

                Err(e)
            }
        }
    }

    /// ブラウザを起動し、成否に関わらず必ず閉じる
    async fn run_pipeline(&self) -> Result<Vec<Record>, UsageError> {
        let started = Instant::now();
        let mut session = self.engine.launch().await?;

        let result = self.drive(&mut *session).await;

        if let Err(e) = &result {
            let label = format!("{}_failure", e.stage());
            self.artifacts.capture(&*session, &label).await;
        }
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close browser session");
        }

        match &result {
            Ok(rows) => info!(rows = rows.len(), elapsed = ?started.elapsed(), "Usage refreshed"),
            Err(e) => warn!(stage = e.stage(), elapsed = ?started.elapsed(), "Pipeline aborted"),
        }
        result
    }

    async fn drive(&self, session: &mut dyn BrowserSession) -> Result<Vec<Record>, UsageError> {
        SessionAcquirer::new(&self.config.login)
            .with_artifacts(self.artifacts.clone())
            .acquire(session, &self.config.credentials)
            .await?;

        let raw = ResourceFetcher::new(&self.config.resource_url, self.config.fetch_timeout)
            .fetch(session)
            .await?;

        match validate(&raw) {
            Ok(validated) => Ok(validated.rows),
            Err(e) => {
                if e == UsageError::Validation(ValidationFailure::UnexpectedMarkup) {
                    self.artifacts
                        .save_text("unexpected_html", "html", &raw.body)
                        .await;
                }
                Err(e)
            }
        }
    }
}

/// tower::Serviceを実装した使用量サービス
impl Service<SnapshotRequest> for UsageService {
    type Response = UsageSnapshot;
    type Error = UsageError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SnapshotRequest) -> Self::Future {
        info!(force_refresh = req.force_refresh, "使用量リクエスト受信");

        let service = self.clone();
        Box::pin(async move { service.get(req).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tower::ServiceExt;

    use crate::browser::scripted::{ScriptedEngine, SessionScript, APP_URL};
    use crate::cache::tests::manual_clock;
    use crate::config::{Credentials, LoginConfig};
    use crate::error::{AuthFailure, FetchFailure};
    use crate::fetch::RawPayload;

    const T0: i64 = 1_700_000_000;

    struct Harness {
        service: UsageService,
        engine: ScriptedEngine,
        cache: CacheStore,
        clock: Arc<std::sync::atomic::AtomicI64>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(script: SessionScript, configure: impl FnOnce(ServiceConfig) -> ServiceConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::new(Credentials::new("user@example.com", "s3cret").unwrap())
            .with_login(
                LoginConfig::default()
                    .with_entry_url(APP_URL)
                    .with_hosts("login.example.com", "app.example.com"),
            )
            .with_resource_url("https://app.example.com/index.php/accountPreferences/download")
            .with_cache_path(dir.path().join("cache.json"))
            .with_cache_ttl(Duration::from_secs(3600));
        let config = configure(config);

        let (clock_fn, clock) = manual_clock(T0);
        let cache = CacheStore::new(&config.cache.path, config.cache.ttl).with_clock(clock_fn);
        let engine = ScriptedEngine::new(script);
        let service = UsageService::with_cache(config, Arc::new(engine.clone()), cache.clone());

        Harness {
            service,
            engine,
            cache,
            clock,
            _dir: dir,
        }
    }

    fn harness(script: SessionScript) -> Harness {
        harness_with(script, |config| config)
    }

    fn rows(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                vec![
                    ("Date".to_string(), format!("2023-12-{:02}", i + 1)),
                    ("Usage".to_string(), (10 * i).to_string()),
                ]
                .into_iter()
                .collect()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_window_scenario() {
        let h = harness(SessionScript::new());
        let written = h.cache.put(rows(5)).await.unwrap();

        h.clock.store(T0 + 1800, Ordering::SeqCst);
        let snapshot = h.service.current().await.unwrap();
        assert!(snapshot.cached);
        assert_eq!(snapshot.rows, written.rows);
        assert_eq!(snapshot.rows.len(), 5);
        assert_eq!(h.engine.launches(), 0);

        h.clock.store(T0 + 4000, Ordering::SeqCst);
        let snapshot = h.service.current().await.unwrap();
        assert!(!snapshot.cached);
        assert_eq!(h.engine.launches(), 1);
        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.rows[0].get("Date"), Some("2024-01-01"));
        assert_eq!(snapshot.fetched_at.timestamp(), T0 + 4000);

        // 新しいエントリで上書きされ、次はキャッシュから返る
        let again = h.service.current().await.unwrap();
        assert!(again.cached);
        assert_eq!(again.rows, snapshot.rows);
        assert_eq!(h.engine.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closed_after_success() {
        let h = harness(SessionScript::new());
        h.service.current().await.unwrap();

        let logs = h.engine.logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].closed);
        assert_eq!(logs[0].fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_form_not_found_leaves_cache_untouched() {
        let h = harness(SessionScript::new().with_form_delay(None));
        let before = h.cache.put(rows(3)).await.unwrap();
        h.clock.store(T0 + 7200, Ordering::SeqCst);

        let err = h.service.current().await.unwrap_err();
        assert_eq!(err, UsageError::Authentication(AuthFailure::FormNotFound));
        assert_eq!(err.stage(), "authentication");

        assert_eq!(h.cache.load().await, Some(before));
        let logs = h.engine.logs();
        assert!(logs[0].closed);
        assert_eq!(logs[0].fetches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_html_login_page_is_never_cached() {
        let script = SessionScript::new().with_fetch_response(
            RawPayload::new(200, "<!DOCTYPE html><html><body><form id=\"fm1\"></form></body></html>")
                .with_content_type("text/html; charset=UTF-8"),
        );
        let h = harness(script);

        let err = h.service.current().await.unwrap_err();
        assert_eq!(err, UsageError::Validation(ValidationFailure::UnexpectedMarkup));
        assert!(h.cache.load().await.is_none());
        assert!(!h.cache.path().exists());
        assert!(h.engine.logs()[0].closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_html_saved_when_debugging() {
        let artifacts = tempfile::tempdir().unwrap();
        let artifact_dir = artifacts.path().to_path_buf();
        let script = SessionScript::new()
            .with_fetch_response(RawPayload::new(200, "<html><body>Please log in</body></html>"));
        let h = harness_with(script, move |config| config.with_debug_artifacts(artifact_dir));

        h.service.current().await.unwrap_err();

        let saved = std::fs::read_to_string(artifacts.path().join("ebmud_unexpected_html.html")).unwrap();
        assert!(saved.contains("Please log in"));
        assert!(artifacts.path().join("ebmud_validation_failure.png").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_status_error() {
        let script = SessionScript::new().with_fetch_response(RawPayload::new(500, "oops"));
        let h = harness(script);

        let err = h.service.current().await.unwrap_err();
        assert_eq!(err, UsageError::Fetch(FetchFailure::Status(500)));
        assert!(err.is_upstream());
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_reported() {
        let script = SessionScript::new().with_launch_error(UsageError::Browser("chrome not found".into()));
        let h = harness(script);

        let err = h.service.current().await.unwrap_err();
        assert_eq!(err.stage(), "browser");
        assert!(!err.is_upstream());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_trigger_single_login() {
        let h = harness(SessionScript::new());

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let service = h.service.clone();
                tokio::spawn(async move { service.current().await })
            })
            .collect();

        let mut results = Vec::new();
        for call in calls {
            results.push(call.await.unwrap().unwrap());
        }

        assert_eq!(h.engine.launches(), 1);
        assert!(results.iter().all(|s| s.rows == results[0].rows));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_bypasses_fresh_cache() {
        let h = harness(SessionScript::new());
        h.cache.put(rows(5)).await.unwrap();

        let snapshot = h.service.refresh().await.unwrap();
        assert!(!snapshot.cached);
        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(h.engine.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_served_only_when_enabled() {
        let failing = || SessionScript::new().with_fetch_error(FetchFailure::NoResponse.into());

        let h = harness(failing());
        h.cache.put(rows(4)).await.unwrap();
        h.clock.store(T0 + 4000, Ordering::SeqCst);
        let err = h.service.current().await.unwrap_err();
        assert_eq!(err, UsageError::Fetch(FetchFailure::NoResponse));

        let h = harness_with(failing(), |config| config.with_serve_stale(true));
        let old = h.cache.put(rows(4)).await.unwrap();
        h.clock.store(T0 + 4000, Ordering::SeqCst);
        let snapshot = h.service.current().await.unwrap();
        assert!(snapshot.cached);
        assert!(snapshot.stale);
        assert_eq!(snapshot.rows, old.rows);
        assert_eq!(snapshot.fetched_at, old.fetched_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_without_entry_still_fails() {
        let script = SessionScript::new().with_fetch_error(FetchFailure::NoResponse.into());
        let h = harness_with(script, |config| config.with_serve_stale(true));

        assert!(h.service.current().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tower_service_call() {
        let h = harness(SessionScript::new());

        let snapshot = h
            .service
            .clone()
            .oneshot(SnapshotRequest::current())
            .await
            .unwrap();
        assert!(!snapshot.cached);

        let snapshot = h.service.clone().oneshot(SnapshotRequest::current()).await.unwrap();
        assert!(snapshot.cached);
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = UsageSnapshot {
            cached: true,
            stale: false,
            fetched_at: DateTime::from_timestamp(T0, 0).unwrap(),
            rows: rows(1),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["cached"], true);
        assert!(value.get("stale").is_none());
        assert_eq!(value["fetched_at"].as_f64(), Some(T0 as f64));
        assert_eq!(value["rows"][0]["Usage"], "0");

        let stale = UsageSnapshot {
            stale: true,
            ..snapshot
        };
        assert_eq!(serde_json::to_value(&stale).unwrap()["stale"], true);
    }

    #[test]
    fn test_snapshot_latest() {
        let snapshot = UsageSnapshot {
            cached: false,
            stale: false,
            fetched_at: DateTime::from_timestamp(T0, 0).unwrap(),
            rows: rows(3),
        };
        let latest = snapshot.latest(None).unwrap();
        assert_eq!(latest.record.get("Date"), Some("2023-12-03"));
    }
}

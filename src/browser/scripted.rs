//! テスト用のスクリプト化ブラウザ
//!
//! 実際の Chrome を起動せず、時間経過に応じてURL・フォーム表示・
//! ネットワーク状態が変化するセッションを再現する。tokio の時間を
//! 一時停止したテスト (`start_paused = true`) で使う。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::UsageError;
use crate::fetch::RawPayload;
use crate::traits::{BrowserEngine, BrowserSession};

pub const LOGIN_URL: &str = "https://login.example.com/cas/login?service=app";
pub const APP_URL: &str = "https://app.example.com/index.php/dashboard";

#[derive(Debug, Clone)]
pub struct SessionScript {
    /// navigate 後に表示されるURL
    landing_url: String,
    /// navigate からフォームが表示されるまで（None なら表示されない）
    form_delay: Option<Duration>,
    /// 送信後のURL遷移（送信からの経過時間, URL）。同じURLへの遷移は再描画を表す
    hops: Vec<(Duration, String)>,
    /// 送信後にネットワークが静かになるまで（None なら静かにならない）
    busy_for: Option<Duration>,
    fetch_response: Result<RawPayload, UsageError>,
    fetch_delay: Duration,
    launch_error: Option<UsageError>,
}

impl Default for SessionScript {
    fn default() -> Self {
        Self {
            landing_url: LOGIN_URL.to_string(),
            form_delay: Some(Duration::from_secs(1)),
            hops: vec![
                (Duration::from_secs(1), "https://broker.example.com/federate".to_string()),
                (Duration::from_secs(2), "https://sso.example.com/handshake".to_string()),
                (Duration::from_secs(3), APP_URL.to_string()),
            ],
            busy_for: Some(Duration::from_secs(3)),
            fetch_response: Ok(RawPayload::new(200, "Date,Usage\n2024-01-01,100\n2024-01-02,120\n")
                .with_content_type("text/csv")),
            fetch_delay: Duration::from_millis(100),
            launch_error: None,
        }
    }
}

impl SessionScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_landing_url(mut self, url: impl Into<String>) -> Self {
        self.landing_url = url.into();
        self
    }

    pub fn with_form_delay(mut self, delay: Option<Duration>) -> Self {
        self.form_delay = delay;
        self
    }

    pub fn with_hops(mut self, hops: Vec<(Duration, &str)>) -> Self {
        self.busy_for = hops.last().map(|(at, _)| *at).or(Some(Duration::ZERO));
        self.hops = hops.into_iter().map(|(at, url)| (at, url.to_string())).collect();
        self
    }

    pub fn with_busy_for(mut self, busy_for: Option<Duration>) -> Self {
        self.busy_for = busy_for;
        self
    }

    pub fn with_fetch_response(mut self, payload: RawPayload) -> Self {
        self.fetch_response = Ok(payload);
        self
    }

    pub fn with_fetch_error(mut self, error: UsageError) -> Self {
        self.fetch_response = Err(error);
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn with_launch_error(mut self, error: UsageError) -> Self {
        self.launch_error = Some(error);
        self
    }
}

/// セッションに対して行われた操作の記録
#[derive(Debug, Default, Clone)]
pub struct SessionLog {
    pub navigations: Vec<String>,
    pub fills: Vec<(String, String)>,
    pub clicks: Vec<String>,
    pub fetches: usize,
    pub screenshots: usize,
    pub closed: bool,
}

pub struct ScriptedSession {
    script: SessionScript,
    navigated_at: Option<Instant>,
    submitted_at: Option<Instant>,
    log: Arc<Mutex<SessionLog>>,
}

impl ScriptedSession {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script,
            navigated_at: None,
            submitted_at: None,
            log: Arc::new(Mutex::new(SessionLog::default())),
        }
    }

    pub fn log(&self) -> SessionLog {
        self.log.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.log.lock().unwrap().fetches
    }

    /// 送信後に通過した遷移の数
    fn hops_passed(&self) -> usize {
        match self.submitted_at {
            Some(submitted) => {
                let elapsed = submitted.elapsed();
                self.script.hops.iter().filter(|(at, _)| *at <= elapsed).count()
            }
            None => 0,
        }
    }

    fn url_now(&self) -> String {
        if let Some(submitted) = self.submitted_at {
            let elapsed = submitted.elapsed();
            if let Some((_, url)) = self.script.hops.iter().rev().find(|(at, _)| *at <= elapsed) {
                return url.clone();
            }
        }
        if self.navigated_at.is_some() {
            self.script.landing_url.clone()
        } else {
            "about:blank".to_string()
        }
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> Result<(), UsageError> {
        self.log.lock().unwrap().navigations.push(url.to_string());
        self.navigated_at = Some(Instant::now());
        Ok(())
    }

    async fn current_url(&self) -> Result<String, UsageError> {
        Ok(self.url_now())
    }

    async fn is_visible(&self, _selector: &str) -> Result<bool, UsageError> {
        if self.submitted_at.is_some() {
            return Ok(self.url_now() == self.script.landing_url);
        }
        Ok(match (self.navigated_at, self.script.form_delay) {
            (Some(at), Some(delay)) => at.elapsed() >= delay,
            _ => false,
        })
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), UsageError> {
        self.log
            .lock()
            .unwrap()
            .fills
            .push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), UsageError> {
        self.log.lock().unwrap().clicks.push(selector.to_string());
        self.submitted_at = Some(Instant::now());
        Ok(())
    }

    async fn document_id(&self) -> Result<String, UsageError> {
        let navigations = self.log.lock().unwrap().navigations.len();
        Ok(format!("doc-{}-{}", navigations, self.hops_passed()))
    }

    async fn is_network_idle(&self) -> Result<bool, UsageError> {
        let Some(submitted) = self.submitted_at else {
            return Ok(true);
        };
        Ok(match self.script.busy_for {
            Some(busy_for) => submitted.elapsed() >= busy_for,
            None => false,
        })
    }

    async fn fetch(&mut self, _url: &str) -> Result<RawPayload, UsageError> {
        self.log.lock().unwrap().fetches += 1;
        tokio::time::sleep(self.script.fetch_delay).await;
        self.script.fetch_response.clone()
    }

    async fn screenshot(&self) -> Result<Vec<u8>, UsageError> {
        self.log.lock().unwrap().screenshots += 1;
        Ok(b"\x89PNG\r\n\x1a\n".to_vec())
    }

    async fn page_source(&self) -> Result<String, UsageError> {
        Ok(format!("<html><body>{}</body></html>", self.url_now()))
    }

    async fn close(&mut self) -> Result<(), UsageError> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

/// 起動のたびに同じスクリプトのセッションを返すエンジン
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: SessionScript,
    sessions: Arc<Mutex<Vec<Arc<Mutex<SessionLog>>>>>,
}

impl ScriptedEngine {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script,
            sessions: Arc::default(),
        }
    }

    pub fn launches(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// 起動したセッションの操作記録（起動順）
    pub fn logs(&self) -> Vec<SessionLog> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|log| log.lock().unwrap().clone())
            .collect()
    }
}

#[async_trait]
impl BrowserEngine for ScriptedEngine {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, UsageError> {
        if let Some(error) = &self.script.launch_error {
            return Err(error.clone());
        }
        let session = ScriptedSession::new(self.script.clone());
        self.sessions.lock().unwrap().push(session.log.clone());
        Ok(Box::new(session))
    }
}

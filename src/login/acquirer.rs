//! ログイン状態機械
//!
//! AtEntry → AwaitingForm → Submitting → AwaitingRedirect → Authenticated
//!
//! 固定の sleep ではなく条件（要素表示・URL・ネットワークアイドル）を
//! ポーリングして待つ。待機はすべて上限付きで、上限に達したら
//! `Failed` に遷移する。

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactSink;
use crate::config::{Credentials, LoginConfig};
use crate::error::{AuthFailure, UsageError};
use crate::traits::BrowserSession;

use super::types::{Location, LoginOutcome, LoginState, OriginRules};

/// 1回の問い合わせ（URL取得・要素判定など）の上限
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 状態をまたいで持ち回る観測結果
#[derive(Debug)]
struct Progress {
    started: Instant,
    form_deadline: Instant,
    landed_url: String,
    hops: usize,
    submitted: bool,
    /// 送信時点のドキュメント（取れなかった場合は None）
    form_document: Option<String>,
}

pub struct SessionAcquirer<'a> {
    config: &'a LoginConfig,
    rules: OriginRules,
    artifacts: ArtifactSink,
}

impl<'a> SessionAcquirer<'a> {
    pub fn new(config: &'a LoginConfig) -> Self {
        Self {
            config,
            rules: OriginRules::from_config(config),
            artifacts: ArtifactSink::disabled(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactSink) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// ログインを実行し、アプリ側に到達するまで進める
    pub async fn acquire(
        &self,
        session: &mut dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<LoginOutcome, UsageError> {
        let started = Instant::now();
        let mut progress = Progress {
            started,
            form_deadline: started + self.config.form_timeout,
            landed_url: String::new(),
            hops: 0,
            submitted: false,
            form_document: None,
        };
        let mut state = LoginState::AtEntry;

        loop {
            let next = match state {
                LoginState::AtEntry => self.enter(session, &mut progress).await?,
                LoginState::AwaitingForm => self.await_form(session, &progress).await,
                LoginState::Submitting => {
                    progress.form_document = probe(session.document_id()).await;
                    self.submit(session, credentials).await?;
                    progress.submitted = true;
                    LoginState::AwaitingRedirect
                }
                LoginState::AwaitingRedirect => self.await_redirect(session, &mut progress).await,
                LoginState::Authenticated => {
                    let outcome = LoginOutcome {
                        landed_url: progress.landed_url,
                        hops: progress.hops,
                        submitted: progress.submitted,
                        elapsed: progress.started.elapsed(),
                    };
                    info!(
                        url = %outcome.landed_url,
                        hops = outcome.hops,
                        elapsed = ?outcome.elapsed,
                        "Login successful"
                    );
                    return Ok(outcome);
                }
                LoginState::Failed(reason) => {
                    warn!(
                        reason = %reason,
                        url = %progress.landed_url,
                        elapsed = ?progress.started.elapsed(),
                        "Login failed"
                    );
                    return Err(reason.into());
                }
            };

            debug!(from = state.name(), to = next.name(), "Login state transition");
            state = next;
        }
    }

    /// AtEntry: 入口URLへ遷移
    async fn enter(
        &self,
        session: &mut dyn BrowserSession,
        progress: &mut Progress,
    ) -> Result<LoginState, UsageError> {
        info!(url = %self.config.entry_url, "Navigating to login entry");

        let remaining = progress.form_deadline.saturating_duration_since(Instant::now());
        let settled = match tokio::time::timeout(remaining, session.navigate(&self.config.entry_url)).await {
            Ok(result) => {
                result?;
                true
            }
            Err(_) => {
                warn!("Entry navigation did not settle in time, polling for the form");
                false
            }
        };

        let url = probe(session.current_url()).await.unwrap_or_default();
        debug!(url = %url, "Landed after entry navigation");
        progress.landed_url = url;

        // 既存セッションでアプリに直接着いた場合はフォーム不要
        if settled && self.rules.classify(&progress.landed_url) == Location::App {
            info!("Already authenticated, skipping login form");
            return Ok(LoginState::Authenticated);
        }

        Ok(LoginState::AwaitingForm)
    }

    /// AwaitingForm: ID・パスワード欄が表示されるまで待つ
    async fn await_form(&self, session: &mut dyn BrowserSession, progress: &Progress) -> LoginState {
        loop {
            let identity = probe(session.is_visible(&self.config.identity_selector))
                .await
                .unwrap_or(false);
            let secret = identity
                && probe(session.is_visible(&self.config.secret_selector))
                    .await
                    .unwrap_or(false);

            if identity && secret {
                debug!("Login form is visible");
                self.artifacts.capture(&*session, "login_debug").await;
                return LoginState::Submitting;
            }

            if Instant::now() >= progress.form_deadline {
                warn!(
                    timeout = ?self.config.form_timeout,
                    identity_selector = %self.config.identity_selector,
                    "Login form fields never appeared"
                );
                return LoginState::Failed(AuthFailure::FormNotFound);
            }

            sleep(self.config.poll_interval).await;
        }
    }

    /// Submitting: 入力して送信
    async fn submit(
        &self,
        session: &mut dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), UsageError> {
        info!(identity = credentials.identity(), "Submitting login form");

        bounded("identity input", session.fill(&self.config.identity_selector, credentials.identity()))
            .await?;
        bounded("password input", session.fill(&self.config.secret_selector, credentials.secret()))
            .await?;
        bounded("submit click", session.click(&self.config.submit_selector)).await?;

        Ok(())
    }

    /// AwaitingRedirect: アプリ host に着くか、ネットワークが静かになるまで待つ
    async fn await_redirect(
        &self,
        session: &mut dyn BrowserSession,
        progress: &mut Progress,
    ) -> LoginState {
        let deadline = Instant::now() + self.config.redirect_timeout;
        let mut last_url: Option<String> = None;
        let mut idle_streak = 0u32;
        // 送信後に新しいドキュメントが読み込まれたか
        let mut reloaded = false;

        loop {
            sleep(self.config.poll_interval).await;

            if let Some(url) = probe(session.current_url()).await {
                if last_url.as_deref() != Some(url.as_str()) {
                    if last_url.is_some() {
                        progress.hops += 1;
                    }
                    debug!(url = %url, hop = progress.hops, "Redirect chain moved");
                    progress.landed_url = url.clone();
                    last_url = Some(url);
                }
            }

            if !reloaded {
                if let (Some(before), Some(now)) =
                    (progress.form_document.as_deref(), probe(session.document_id()).await)
                {
                    reloaded = before != now;
                }
            }

            let location = last_url.as_deref().map(|url| self.rules.classify(url));
            if location == Some(Location::App) {
                return LoginState::Authenticated;
            }

            let idle = probe(session.is_network_idle()).await.unwrap_or(false);
            idle_streak = if idle { idle_streak + 1 } else { 0 };

            if idle_streak >= self.config.idle_checks {
                match location {
                    // 送信前のページのままなら応答待ち
                    Some(Location::Login) if reloaded => {
                        warn!(url = %progress.landed_url, "Network settled back on the login host");
                        return LoginState::Failed(AuthFailure::CredentialsRejected);
                    }
                    Some(Location::Login) => {}
                    Some(_) => {
                        info!(url = %progress.landed_url, "Network settled outside the login host");
                        return LoginState::Authenticated;
                    }
                    None => {}
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    timeout = ?self.config.redirect_timeout,
                    url = %progress.landed_url,
                    "Redirect chain did not finish in time"
                );
                return LoginState::Failed(AuthFailure::RedirectTimeout);
            }
        }
    }
}

/// ポーリング用の問い合わせ。失敗・タイムアウトは「まだ」とみなす
async fn probe<T>(fut: impl Future<Output = Result<T, UsageError>>) -> Option<T> {
    match tokio::time::timeout(PROBE_TIMEOUT, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            // 遷移中は実行コンテキストが消えて評価に失敗することがある
            debug!(error = %e, "Probe failed");
            None
        }
        Err(_) => {
            debug!("Probe timed out");
            None
        }
    }
}

/// 入力・クリック操作。タイムアウトはブラウザエラー
async fn bounded(
    action: &str,
    fut: impl Future<Output = Result<(), UsageError>>,
) -> Result<(), UsageError> {
    tokio::time::timeout(PROBE_TIMEOUT, fut)
        .await
        .map_err(|_| UsageError::Browser(format!("{} がタイムアウトしました", action)))?
}

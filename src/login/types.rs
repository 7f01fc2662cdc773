//! ログイン状態機械の型定義

use std::time::Duration;

use url::Url;

use crate::config::LoginConfig;
use crate::error::AuthFailure;

/// ログイン状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    AtEntry,
    AwaitingForm,
    Submitting,
    AwaitingRedirect,
    Authenticated,
    Failed(AuthFailure),
}

impl LoginState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AtEntry => "at_entry",
            Self::AwaitingForm => "awaiting_form",
            Self::Submitting => "submitting",
            Self::AwaitingRedirect => "awaiting_redirect",
            Self::Authenticated => "authenticated",
            Self::Failed(_) => "failed",
        }
    }
}

/// URL がどこにいるか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// ログインフォームの host
    Login,
    /// 認証後のアプリ
    App,
    /// それ以外（途中のリダイレクト先、about:blank など）
    Elsewhere,
}

/// ログイン host / アプリ host による判定ルール
///
/// 途中の host は列挙しない。上流の経路が変わっても、
/// 最初と最後の host が同じなら動く。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRules {
    login_host: String,
    app_host: String,
    app_path_prefix: Option<String>,
}

impl OriginRules {
    pub fn new(login_host: impl Into<String>, app_host: impl Into<String>) -> Self {
        Self {
            login_host: login_host.into().to_ascii_lowercase(),
            app_host: app_host.into().to_ascii_lowercase(),
            app_path_prefix: None,
        }
    }

    pub fn from_config(config: &LoginConfig) -> Self {
        Self {
            app_path_prefix: config.app_path_prefix.clone(),
            ..Self::new(&config.login_host, &config.app_host)
        }
    }

    pub fn with_app_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.app_path_prefix = Some(prefix.into());
        self
    }

    pub fn classify(&self, url: &str) -> Location {
        let Ok(parsed) = Url::parse(url) else {
            return Location::Elsewhere;
        };
        let Some(host) = parsed.host_str() else {
            return Location::Elsewhere;
        };

        let path_ok = self
            .app_path_prefix
            .as_deref()
            .map_or(true, |prefix| parsed.path().starts_with(prefix));
        // ログインとアプリが同じ host ならパス接頭辞で区別する
        let distinct = host != self.login_host || self.app_path_prefix.is_some();

        if host == self.app_host && path_ok && distinct {
            Location::App
        } else if host == self.login_host {
            Location::Login
        } else {
            Location::Elsewhere
        }
    }
}

/// ログイン成功時の情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// 最終的に到達したURL
    pub landed_url: String,
    /// 送信後に観測したURL変化の回数
    pub hops: usize,
    /// フォーム送信を行ったか（既にログイン済みなら false）
    pub submitted: bool,
    pub elapsed: Duration,
}

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::UsageError;

pub const DEFAULT_CSV_URL: &str =
    "https://ebmud.watersmart.com/index.php/accountPreferences/download";
/// ログイン開始ページ（アプリのHTMLページ。ダウンロードURLだとナビゲーションが確定しない）
pub const DEFAULT_ENTRY_URL: &str = "https://ebmud.watersmart.com/index.php/trackUsage";
pub const DEFAULT_LOGIN_HOST: &str = "cas.ebmud.com";
pub const DEFAULT_APP_HOST: &str = "ebmud.watersmart.com";

const IDENTITY_VAR: &str = "EBMUD_EMAIL";
const SECRET_VAR: &str = "EBMUD_PASSWORD";

/// ログイン用の認証情報（ID・パスワード）
///
/// 生成時に両方が空でないことを検証する。`Debug` 出力ではパスワードを伏せる。
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    identity: String,
    secret: String,
}

impl Credentials {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Result<Self, UsageError> {
        let identity = identity.into();
        let secret = secret.into();

        let mut missing = Vec::new();
        if identity.trim().is_empty() {
            missing.push(IDENTITY_VAR);
        }
        if secret.trim().is_empty() {
            missing.push(SECRET_VAR);
        }
        if !missing.is_empty() {
            return Err(missing_vars(&missing));
        }

        Ok(Self { identity, secret })
    }

    /// 環境変数の参照関数から認証情報を取得
    pub fn from_lookup<F>(lookup: F) -> Result<Self, UsageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let identity = lookup(IDENTITY_VAR).unwrap_or_default();
        let secret = lookup(SECRET_VAR).unwrap_or_default();
        Self::new(identity, secret)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"***")
            .finish()
    }
}

fn missing_vars(names: &[&str]) -> UsageError {
    UsageError::Configuration(format!(
        "必須の環境変数が設定されていません: {}（.env に記載するか export してください）",
        names.join(", ")
    ))
}

/// ログイン状態機械の設定
///
/// 途中のリダイレクト host は列挙せず、ログイン host とアプリ host の
/// 2つだけで成否を判定する。
#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// ログイン開始URL（未認証ならCASへリダイレクトされる）
    pub entry_url: String,
    /// ログインフォームの host
    pub login_host: String,
    /// 認証後に到達するアプリの host
    pub app_host: String,
    /// アプリ host 上で要求するパスの接頭辞
    pub app_path_prefix: Option<String>,
    pub identity_selector: String,
    pub secret_selector: String,
    pub submit_selector: String,
    /// フォーム表示待ちの上限
    pub form_timeout: Duration,
    /// 送信後のリダイレクト待ちの上限
    pub redirect_timeout: Duration,
    /// ポーリング間隔
    pub poll_interval: Duration,
    /// ネットワークアイドルとみなす連続判定回数
    pub idle_checks: u32,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            entry_url: DEFAULT_ENTRY_URL.to_string(),
            login_host: DEFAULT_LOGIN_HOST.to_string(),
            app_host: DEFAULT_APP_HOST.to_string(),
            app_path_prefix: None,
            identity_selector: "#username".to_string(),
            secret_selector: "#upassword".to_string(),
            submit_selector: r#"button[type="submit"]"#.to_string(),
            form_timeout: Duration::from_secs(30),
            redirect_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            idle_checks: 3,
        }
    }
}

impl LoginConfig {
    pub fn with_entry_url(mut self, url: impl Into<String>) -> Self {
        self.entry_url = url.into();
        self
    }

    pub fn with_hosts(mut self, login_host: impl Into<String>, app_host: impl Into<String>) -> Self {
        self.login_host = login_host.into();
        self.app_host = app_host.into();
        self
    }

}

/// ブラウザ起動オプション
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    /// Chrome 実行ファイル（未指定なら chromiumoxide の自動検出）
    pub chrome_path: Option<PathBuf>,
    /// CDPリクエストタイムアウト
    pub request_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub ttl: Duration,
    /// 更新失敗時に期限切れキャッシュを返すか
    pub serve_stale: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/ebmud_water_cache.json"),
            ttl: Duration::from_secs(3600),
            serve_stale: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub credentials: Credentials,
    pub login: LoginConfig,
    /// 取得対象のCSV URL
    pub resource_url: String,
    pub fetch_timeout: Duration,
    pub cache: CacheConfig,
    pub browser: BrowserOptions,
    pub server: ServerConfig,
    /// デバッグ用スクリーンショット・HTML保存
    pub debug_artifacts: bool,
    pub artifact_dir: PathBuf,
    /// 最新レコード判定に使う日付列
    pub latest_date_column: Option<String>,
}

impl ServiceConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            login: LoginConfig::default(),
            resource_url: DEFAULT_CSV_URL.to_string(),
            fetch_timeout: Duration::from_secs(30),
            cache: CacheConfig::default(),
            browser: BrowserOptions::default(),
            server: ServerConfig::default(),
            debug_artifacts: false,
            artifact_dir: std::env::temp_dir(),
            latest_date_column: None,
        }
    }

    /// プロセス環境変数から読み込む（起動時に一度だけ呼ぶ）
    pub fn from_env() -> Result<Self, UsageError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 参照関数から読み込む。必須項目の欠落・不正値は `Configuration` エラー
    pub fn from_lookup<F>(lookup: F) -> Result<Self, UsageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let credentials = Credentials::from_lookup(&lookup)?;
        let mut config = Self::new(credentials);

        if let Some(url) = get("EBMUD_CSV_URL") {
            config.resource_url = url;
        }
        if let Some(url) = get("EBMUD_LOGIN_URL") {
            config.login.entry_url = url;
        }
        if let Some(host) = get("EBMUD_LOGIN_HOST") {
            config.login.login_host = host;
        }
        if let Some(host) = get("EBMUD_APP_HOST") {
            config.login.app_host = host;
        }
        config.login.app_path_prefix = get("EBMUD_APP_PATH_PREFIX");
        if let Some(selector) = get("EBMUD_IDENTITY_SELECTOR") {
            config.login.identity_selector = selector;
        }
        if let Some(selector) = get("EBMUD_SECRET_SELECTOR") {
            config.login.secret_selector = selector;
        }
        if let Some(selector) = get("EBMUD_SUBMIT_SELECTOR") {
            config.login.submit_selector = selector;
        }
        if let Some(secs) = parse_var::<u64>(&get, "EBMUD_FORM_TIMEOUT_SECS")? {
            config.login.form_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&get, "EBMUD_REDIRECT_TIMEOUT_SECS")? {
            config.login.redirect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&get, "EBMUD_FETCH_TIMEOUT_SECS")? {
            config.fetch_timeout = Duration::from_secs(secs);
        }

        if let Some(path) = get("EBMUD_CACHE_PATH") {
            config.cache.path = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>(&get, "EBMUD_CACHE_TTL_SECONDS")? {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(flag) = parse_flag(&get, "EBMUD_SERVE_STALE")? {
            config.cache.serve_stale = flag;
        }

        config.latest_date_column = get("EBMUD_LATEST_DATE_COLUMN");
        if let Some(dir) = get("EBMUD_ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(dir);
        }
        if let Some(flag) = parse_flag(&get, "DEBUG")? {
            config.debug_artifacts = flag;
        }

        if let Some(flag) = parse_flag(&get, "EBMUD_HEADLESS")? {
            config.browser.headless = flag;
        }
        config.browser.chrome_path = get("CHROME_PATH")
            .or_else(|| get("CHROMIUM_PATH"))
            .map(PathBuf::from);

        if let Some(address) = get("BIND_ADDRESS") {
            config.server.bind_address = address;
        }
        if let Some(port) = parse_var::<u16>(&get, "PORT")? {
            config.server.port = port;
        }

        Ok(config)
    }

    pub fn with_login(mut self, login: LoginConfig) -> Self {
        self.login = login;
        self
    }

    pub fn with_resource_url(mut self, url: impl Into<String>) -> Self {
        self.resource_url = url.into();
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache.path = path.into();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = ttl;
        self
    }

    pub fn with_serve_stale(mut self, serve_stale: bool) -> Self {
        self.cache.serve_stale = serve_stale;
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.browser.headless = headless;
        self
    }

    pub fn with_debug_artifacts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_artifacts = true;
        self.artifact_dir = dir.into();
        self
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, UsageError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                UsageError::Configuration(format!("{} の値が不正です ({:?}): {}", key, raw, e))
            })
        })
        .transpose()
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, UsageError> {
    get(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(UsageError::Configuration(format!(
                "{} の値が不正です ({:?}): 0/1 を指定してください",
                key, raw
            ))),
        })
        .transpose()
}

use std::path::PathBuf;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BrowserOptions;
use crate::error::{FetchFailure, UsageError};
use crate::fetch::RawPayload;
use crate::traits::{BrowserEngine, BrowserSession};

/// 要素の表示判定（offsetWidth / offsetHeight / getClientRects）
const VISIBLE_SCRIPT: &str = r#"
    ((selector) => {
        const el = document.querySelector(selector);
        if (!el) return false;
        return !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
    })(__SELECTOR__)
"#;

/// 値を設定して input / change イベントを発火
const FILL_SCRIPT: &str = r#"
    ((selector, value) => {
        const el = document.querySelector(selector);
        if (!el) return false;
        el.focus();
        el.value = value;
        el.dispatchEvent(new Event('input', { bubbles: true }));
        el.dispatchEvent(new Event('change', { bubbles: true }));
        return true;
    })(__SELECTOR__, __VALUE__)
"#;

/// 読み込み完了かつ直近500ms以内に開始された未完了リクエストがないか
const NETWORK_IDLE_SCRIPT: &str = r#"
    (() => {
        if (document.readyState !== 'complete') return false;
        const entries = performance.getEntriesByType('resource');
        const now = performance.now();
        const recentRequests = entries.filter(e => (now - e.startTime) < 500 && e.duration === 0);
        const hasPending = window.__pendingRequests > 0;
        return recentRequests.length === 0 && !hasPending;
    })()
"#;

/// ドキュメントごとに変わる時刻原点
const DOCUMENT_ID_SCRIPT: &str = "String(performance.timeOrigin)";

/// ページの Cookie を使って1回だけ GET（結果は JSON 文字列）
const FETCH_SCRIPT: &str = r#"
    (async (url) => {
        try {
            const resp = await fetch(url, { credentials: 'include', redirect: 'follow' });
            const body = await resp.text();
            return JSON.stringify({
                status: resp.status,
                contentType: resp.headers.get('content-type'),
                body: body,
            });
        } catch (e) {
            return JSON.stringify({ error: String(e) });
        }
    })(__URL__)
"#;

/// ログインページの input 一覧（セレクタ調査用）
const INPUTS_SCRIPT: &str = r#"
    (() => {
        const inputs = Array.from(document.querySelectorAll('input'));
        return JSON.stringify(inputs.map((el, idx) => ({
            index: idx,
            type: el.getAttribute('type'),
            name: el.getAttribute('name'),
            id: el.getAttribute('id'),
            placeholder: el.getAttribute('placeholder'),
            ariaLabel: el.getAttribute('aria-label'),
            autocomplete: el.getAttribute('autocomplete'),
            visible: !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length),
        })));
    })()
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResult {
    #[serde(default)]
    status: u16,
    content_type: Option<String>,
    #[serde(default)]
    body: String,
    error: Option<String>,
}

/// ページ内 fetch は同一 origin のみ（ブラウザの CORS 制限は外さない）
fn same_origin(page_url: &str, resource_url: &str) -> bool {
    match (Url::parse(page_url), Url::parse(resource_url)) {
        (Ok(page), Ok(resource)) => page.origin() == resource.origin(),
        _ => false,
    }
}

/// JS リテラルとして安全に埋め込む
fn js_literal(value: &str) -> Result<String, UsageError> {
    serde_json::to_string(value).map_err(|e| UsageError::Browser(e.to_string()))
}

fn cdp_error(context: &str, e: impl std::fmt::Display) -> UsageError {
    UsageError::Browser(format!("{}: {}", context, e))
}

/// Chrome を起動するエンジン（取得ごとに新しいプロセス）
#[derive(Debug, Clone, Default)]
pub struct ChromiumEngine {
    options: BrowserOptions,
}

impl ChromiumEngine {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }

    /// ブラウザを起動して空のページを1枚開く
    pub async fn launch_session(&self) -> Result<ChromiumSession, UsageError> {
        info!("Launching browser...");

        // ユニークなユーザーデータディレクトリを生成
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("water-usage-{}", unique_id));

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&user_data_dir)
            .window_size(1280, 800);

        if let Some(path) = &self.options.chrome_path {
            builder = builder.chrome_executable(path);
        }

        if !self.options.headless {
            builder = builder.with_head();
        }

        builder = builder
            .no_sandbox()
            .request_timeout(self.options.request_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        let browser_config = builder.build().map_err(UsageError::Browser)?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| cdp_error("起動失敗", e))?;

        // ハンドラータスクを起動
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler_task.abort();
                let _ = tokio::fs::remove_dir_all(&user_data_dir).await;
                return Err(cdp_error("ページ作成失敗", e));
            }
        };

        info!("Browser launched");
        Ok(ChromiumSession {
            browser: Some(browser),
            page,
            handler_task: Some(handler_task),
            user_data_dir,
        })
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, UsageError> {
        Ok(Box::new(self.launch_session().await?))
    }
}

pub struct ChromiumSession {
    browser: Option<Browser>,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    user_data_dir: PathBuf,
}

impl ChromiumSession {
    async fn eval_bool(&self, script: &str) -> Result<bool, UsageError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| cdp_error("JavaScript", e))?
            .into_value::<bool>()
            .map_err(|e| cdp_error("JavaScript 戻り値", e))
    }

    async fn eval_string(&self, script: &str) -> Result<String, UsageError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| cdp_error("JavaScript", e))?
            .into_value::<String>()
            .map_err(|e| cdp_error("JavaScript 戻り値", e))
    }

    /// ページ上の input 要素一覧（JSON）
    pub async fn input_fields(&self) -> Result<serde_json::Value, UsageError> {
        let json = self.eval_string(INPUTS_SCRIPT).await?;
        serde_json::from_str(&json).map_err(|e| cdp_error("input 一覧", e))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> Result<(), UsageError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| cdp_error("ナビゲーション", e))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, UsageError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(|e| cdp_error("URL取得", e))?
            .unwrap_or_default())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, UsageError> {
        let script = VISIBLE_SCRIPT.replace("__SELECTOR__", &js_literal(selector)?);
        self.eval_bool(&script).await
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), UsageError> {
        let script = FILL_SCRIPT
            .replace("__SELECTOR__", &js_literal(selector)?)
            .replace("__VALUE__", &js_literal(value)?);
        if self.eval_bool(&script).await? {
            Ok(())
        } else {
            Err(UsageError::Browser(format!("要素が見つかりません: {}", selector)))
        }
    }

    async fn click(&mut self, selector: &str) -> Result<(), UsageError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| cdp_error(selector, e))?
            .click()
            .await
            .map_err(|e| cdp_error(selector, e))?;
        Ok(())
    }

    async fn document_id(&self) -> Result<String, UsageError> {
        self.eval_string(DOCUMENT_ID_SCRIPT).await
    }

    async fn is_network_idle(&self) -> Result<bool, UsageError> {
        self.eval_bool(NETWORK_IDLE_SCRIPT).await
    }

    async fn fetch(&mut self, url: &str) -> Result<RawPayload, UsageError> {
        let page_url = self.current_url().await?;
        if !same_origin(&page_url, url) {
            warn!(page = %page_url, url, "Session did not settle on the resource origin");
            return Err(UsageError::Browser(format!(
                "ページ ({}) と取得先 ({}) の origin が異なるため取得できません",
                page_url, url
            )));
        }

        let script = FETCH_SCRIPT.replace("__URL__", &js_literal(url)?);
        let json = self.eval_string(&script).await?;
        let result: FetchResult =
            serde_json::from_str(&json).map_err(|e| cdp_error("fetch 結果", e))?;

        if let Some(error) = result.error {
            warn!(url, error = %error, "In-page fetch failed");
            return Err(FetchFailure::NoResponse.into());
        }

        Ok(RawPayload {
            status: result.status,
            content_type: result.content_type,
            body: result.body,
        })
    }

    async fn screenshot(&self) -> Result<Vec<u8>, UsageError> {
        self.page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| cdp_error("スクリーンショット", e))
    }

    async fn page_source(&self) -> Result<String, UsageError> {
        self.page
            .content()
            .await
            .map_err(|e| cdp_error("HTML取得", e))
    }

    async fn close(&mut self) -> Result<(), UsageError> {
        info!("Closing browser...");

        let mut result = Ok(());
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                result = Err(cdp_error("終了失敗", e));
            }
            if let Err(e) = browser.wait().await {
                debug!("Browser wait failed: {}", e);
            }
        }

        if let Some(task) = self.handler_task.take() {
            task.abort();
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!(path = %self.user_data_dir.display(), "Failed to remove user data dir: {}", e);
        }

        info!("Browser closed");
        result
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
    }
}

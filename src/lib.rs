//! 水道使用量取得サービス
//!
//! - CAS ログイン（フェデレーションのリダイレクトを含む）をブラウザで通過
//! - ログイン済みセッションで日別使用量CSVを取得・検証・パース
//! - 結果を TTL 付きでファイルにキャッシュし、HTTP で公開
//!
//! # 使用例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use water_usage_service::{ChromiumEngine, Credentials, ServiceConfig, UsageService};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServiceConfig::new(Credentials::new("user@example.com", "password").unwrap())
//!         .with_cache_path("./ebmud_water_cache.json")
//!         .with_headless(false);
//!
//!     let engine = Arc::new(ChromiumEngine::new(config.browser.clone()));
//!     let service = UsageService::new(config, engine);
//!
//!     let snapshot = service.current().await.unwrap();
//!     println!("rows: {} (cached: {})", snapshot.rows.len(), snapshot.cached);
//!     if let Some(latest) = snapshot.latest(None) {
//!         println!("latest: {:?}", latest.record);
//!     }
//! }
//! ```
//!
//! # tower::Service として使う
//!
//! ```rust,ignore
//! use tower::ServiceExt;
//! use water_usage_service::SnapshotRequest;
//!
//! let snapshot = service.clone().oneshot(SnapshotRequest::refresh()).await?;
//! ```

pub mod artifacts;
pub mod browser;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod flight;
pub mod login;
pub mod server;
pub mod service;
pub mod table;
pub mod traits;
pub mod validate;

// 主要な型をリエクスポート
pub use browser::{ChromiumEngine, ChromiumSession};
pub use cache::{CacheEntry, CacheStore};
pub use config::{Credentials, LoginConfig, ServiceConfig};
pub use error::{AuthFailure, FetchFailure, ParseError, UsageError, ValidationFailure};
pub use fetch::{RawPayload, ResourceFetcher};
pub use login::{LoginState, SessionAcquirer};
pub use server::build_router;
pub use service::{SnapshotRequest, UsageService, UsageSnapshot};
pub use table::Record;
pub use traits::{BrowserEngine, BrowserSession};

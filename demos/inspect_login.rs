//! ログインページの input 要素を一覧表示する（セレクタ調査用）
//!
//! ```text
//! cargo run --example inspect_login
//! ```

use std::path::PathBuf;

use water_usage_service::config::BrowserOptions;
use water_usage_service::{BrowserSession, ChromiumEngine, LoginConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let url = std::env::var("EBMUD_LOGIN_URL").unwrap_or_else(|_| LoginConfig::default().entry_url);
    let out_dir = PathBuf::from(std::env::var("EBMUD_ARTIFACT_DIR").unwrap_or_else(|_| ".".into()));

    let options = BrowserOptions {
        headless: std::env::var("EBMUD_HEADLESS").map(|v| v != "0").unwrap_or(false),
        ..Default::default()
    };

    println!("=== Login Page Inspector ===");
    println!("URL: {}", url);

    let mut session = match ChromiumEngine::new(options).launch_session().await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = session.navigate(&url).await {
        eprintln!("エラー: {}", e);
    } else {
        // リダイレクト先のフォーム描画を待つ
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        match session.current_url().await {
            Ok(current) => println!("現在のURL: {}", current),
            Err(e) => eprintln!("URL取得失敗: {}", e),
        }

        match session.input_fields().await {
            Ok(fields) => println!(
                "{}",
                serde_json::to_string_pretty(&fields).unwrap_or_else(|_| fields.to_string())
            ),
            Err(e) => eprintln!("input 一覧取得失敗: {}", e),
        }

        if let Ok(png) = session.screenshot().await {
            let path = out_dir.join("ebmud_login_page.png");
            match std::fs::write(&path, png) {
                Ok(()) => println!("スクリーンショット: {}", path.display()),
                Err(e) => eprintln!("保存失敗: {}", e),
            }
        }
        if let Ok(html) = session.page_source().await {
            let path = out_dir.join("ebmud_login_page.html");
            match std::fs::write(&path, html) {
                Ok(()) => println!("HTML: {}", path.display()),
                Err(e) => eprintln!("保存失敗: {}", e),
            }
        }
    }

    if let Err(e) = session.close().await {
        eprintln!("終了処理失敗: {}", e);
    }
}

//! 環境変数の設定で1回だけ取得パイプラインを実行する
//!
//! ```text
//! EBMUD_EMAIL=... EBMUD_PASSWORD=... cargo run --example fetch_once
//! ```

use std::sync::Arc;

use water_usage_service::{ChromiumEngine, ServiceConfig, UsageService};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    };
    let date_column = config.latest_date_column.clone();
    let engine = Arc::new(ChromiumEngine::new(config.browser.clone()));
    let service = UsageService::new(config, engine);

    println!("=== Water Usage Fetch ===");

    match service.refresh().await {
        Ok(snapshot) => {
            println!("成功! {} 行 (取得時刻: {})", snapshot.rows.len(), snapshot.fetched_at);
            match snapshot.latest(date_column.as_deref()) {
                Some(latest) => {
                    println!("最新 (列: {}):", latest.date_column.unwrap_or("-"));
                    for (column, value) in latest.record.iter() {
                        println!("  {}: {}", column, value);
                    }
                }
                None => println!("データ行がありません"),
            }
        }
        Err(e) => {
            eprintln!("エラー [{}]: {}", e.stage(), e);
            std::process::exit(1);
        }
    }
}

use async_trait::async_trait;

use crate::error::UsageError;
use crate::fetch::RawPayload;

/// ブラウザエンジン（1回の取得ごとに新しいセッションを起動する）
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// 新しいブラウザセッションを起動
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, UsageError>;
}

/// 1回の取得パイプラインで使うブラウザセッション
///
/// Cookie などの認証状態はセッション内に閉じており、`close` 後は再利用しない。
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// ページ遷移（読み込み完了まで待機）
    async fn navigate(&mut self, url: &str) -> Result<(), UsageError>;

    /// 現在のURL
    async fn current_url(&self) -> Result<String, UsageError>;

    /// 要素が存在し、かつ表示されているか
    async fn is_visible(&self, selector: &str) -> Result<bool, UsageError>;

    /// 入力欄に値を設定
    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), UsageError>;

    /// 要素をクリック
    async fn click(&mut self, selector: &str) -> Result<(), UsageError>;

    /// 現在のドキュメントの識別子（新しいドキュメントが読み込まれると変わる）
    async fn document_id(&self) -> Result<String, UsageError>;

    /// ネットワークが静かになっているか（1回分の判定）
    async fn is_network_idle(&self) -> Result<bool, UsageError>;

    /// セッションの Cookie を使って1回だけ GET する
    async fn fetch(&mut self, url: &str) -> Result<RawPayload, UsageError>;

    /// スクリーンショット (PNG)
    async fn screenshot(&self) -> Result<Vec<u8>, UsageError>;

    /// 現在のページのHTML
    async fn page_source(&self) -> Result<String, UsageError>;

    /// リソース解放
    async fn close(&mut self) -> Result<(), UsageError>;
}

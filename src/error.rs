use thiserror::Error;

/// ログイン状態機械の失敗理由
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("ログインフォームが時間内に表示されませんでした")]
    FormNotFound,

    #[error("ログイン後のリダイレクトが時間内に完了しませんでした")]
    RedirectTimeout,

    #[error("ログインページに戻されました（認証情報が拒否された可能性）")]
    CredentialsRejected,
}

/// リソース取得の失敗理由
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("応答がありません")]
    NoResponse,
}

/// ペイロード検証の失敗理由
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("本文が空です")]
    EmptyBody,

    #[error("CSVではなくHTMLを受信しました（認証が維持されていない可能性）")]
    UnexpectedMarkup,

    #[error("表形式ですがデータ行がありません")]
    MalformedTable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("ヘッダー行がありません")]
    MissingHeader,

    #[error("CSV読み込みエラー: {0}")]
    Csv(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("設定エラー: {0}")]
    Configuration(String),

    #[error("ブラウザエラー: {0}")]
    Browser(String),

    #[error("認証エラー: {0}")]
    Authentication(AuthFailure),

    #[error("取得エラー: {0}")]
    Fetch(FetchFailure),

    #[error("検証エラー: {0}")]
    Validation(ValidationFailure),

    #[error("パースエラー: {0}")]
    Parse(#[from] ParseError),

    #[error("キャッシュエラー: {0}")]
    Cache(String),

    #[error("内部エラー: {0}")]
    Internal(String),
}

impl UsageError {
    /// 失敗したステージ名（API応答用）
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Browser(_) => "browser",
            Self::Authentication(_) => "authentication",
            Self::Fetch(_) => "fetch",
            Self::Validation(_) => "validation",
            Self::Parse(_) => "parse",
            Self::Cache(_) => "cache",
            Self::Internal(_) => "internal",
        }
    }

    /// 上流ポータル側の問題かどうか
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Fetch(_) | Self::Validation(_) | Self::Parse(_)
        )
    }
}

impl From<AuthFailure> for UsageError {
    fn from(reason: AuthFailure) -> Self {
        Self::Authentication(reason)
    }
}

impl From<FetchFailure> for UsageError {
    fn from(reason: FetchFailure) -> Self {
        Self::Fetch(reason)
    }
}

impl From<ValidationFailure> for UsageError {
    fn from(reason: ValidationFailure) -> Self {
        Self::Validation(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(
            UsageError::from(AuthFailure::FormNotFound).stage(),
            "authentication"
        );
        assert_eq!(UsageError::from(FetchFailure::Status(503)).stage(), "fetch");
        assert_eq!(
            UsageError::from(ValidationFailure::UnexpectedMarkup).stage(),
            "validation"
        );
        assert_eq!(UsageError::from(ParseError::MissingHeader).stage(), "parse");
        assert_eq!(UsageError::Configuration("x".into()).stage(), "configuration");
    }

    #[test]
    fn test_upstream_classification() {
        assert!(UsageError::from(AuthFailure::CredentialsRejected).is_upstream());
        assert!(UsageError::from(FetchFailure::NoResponse).is_upstream());
        assert!(!UsageError::Browser("launch".into()).is_upstream());
        assert!(!UsageError::Cache("disk".into()).is_upstream());
    }
}

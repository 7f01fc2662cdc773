//! 取得した本文が本当にCSVかどうかを判定する
//!
//! 上流は再ログイン画面やエラー画面を HTTP 200 で返すことがあるため、
//! ステータスコードだけでは判定しない。

use tracing::{debug, warn};

use crate::error::{UsageError, ValidationFailure};
use crate::fetch::RawPayload;
use crate::table::{self, Record};

/// HTML文書とみなす目印（小文字で比較）
const MARKUP_MARKERS: &[&str] = &["<html", "<!doctype html", "<head", "<body", "<form"];

/// 検証済みのペイロード（1行以上のレコードを持つ）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPayload {
    pub rows: Vec<Record>,
}

/// 本文がHTMLに見えるか
pub fn looks_like_markup(body: &str, content_type: Option<&str>) -> bool {
    let lower = body.to_ascii_lowercase();
    if MARKUP_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return true;
    }

    let declared_html = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false);
    declared_html && lower.trim_start_matches('\u{feff}').trim_start().starts_with('<')
}

/// 生ペイロードを検証してレコード列に変換
///
/// - 空の本文 → `EmptyBody`
/// - HTML → `UnexpectedMarkup`
/// - ヘッダーなし → `ParseError`
/// - データ行なし → `MalformedTable`
pub fn validate(raw: &RawPayload) -> Result<ValidatedPayload, UsageError> {
    if raw.body.trim_start_matches('\u{feff}').trim().is_empty() {
        warn!(status = raw.status, "Payload body is empty");
        return Err(ValidationFailure::EmptyBody.into());
    }

    if looks_like_markup(&raw.body, raw.content_type.as_deref()) {
        warn!(
            status = raw.status,
            content_type = raw.content_type.as_deref().unwrap_or("-"),
            "Expected CSV but received HTML"
        );
        return Err(ValidationFailure::UnexpectedMarkup.into());
    }

    let rows = table::parse(&raw.body)?;
    if rows.is_empty() {
        warn!("Payload has a header row but no data rows");
        return Err(ValidationFailure::MalformedTable.into());
    }

    debug!(rows = rows.len(), "Payload validated");
    Ok(ValidatedPayload { rows })
}

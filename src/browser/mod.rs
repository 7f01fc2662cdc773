//! ブラウザエンジン実装
//!
//! 本番は chromiumoxide (Chrome DevTools Protocol)。テストではスクリプト化した
//! 偽セッションを使う。

mod chromium;

#[cfg(test)]
pub(crate) mod scripted;

pub use chromium::{ChromiumEngine, ChromiumSession};

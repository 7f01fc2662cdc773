//! ログイン（CAS フォーム + フェデレーションのリダイレクト）モジュール

mod acquirer;
mod types;

pub use acquirer::SessionAcquirer;
pub use types::{Location, LoginOutcome, LoginState, OriginRules};

//! CSV テキスト → レコード列
//!
//! 列順・行順は上流のCSVのまま保持する。値はすべて文字列のまま扱う。

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// 1行分のデータ（列名 → 値、列の挿入順を保持）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// 列を追加。同名の列が既にあれば位置はそのまま値だけ上書き
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = Record;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of column name to string value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Record, A::Error> {
                let mut record = Record::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    record.insert(k, v);
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

/// CSVテキストをレコード列に変換
///
/// 先頭の BOM・空白・改行は取り除いてから1行目をヘッダーとして扱う。
/// 列数が足りない行は空文字で補い、余分な列は捨てる。
pub fn parse(text: &str) -> Result<Vec<Record>, ParseError> {
    let text = text.trim_start_matches(['\u{feff}', ' ', '\n', '\r', '\t']);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParseError::Csv(e.to_string()))?
        .clone();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(ParseError::MissingHeader);
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|e| ParseError::Csv(e.to_string()))?;
        let record: Record = headers
            .iter()
            .enumerate()
            .map(|(i, column)| (column, row.get(i).unwrap_or("")))
            .collect();
        rows.push(record);
    }

    Ok(rows)
}

/// 最新レコードの判定結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Latest<'a> {
    pub record: &'a Record,
    /// 判定に使った日付列（日付が読めなかった場合は None）
    pub date_column: Option<&'a str>,
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%Y/%m/%d"];

/// 日付文字列を解釈（日付のみの場合は 00:00）
pub fn parse_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// 日付列を決める：指定列 → ヘッダーに "date" を含む最初の列
fn find_date_column<'a>(rows: &'a [Record], hint: Option<&str>) -> Option<&'a str> {
    let first = rows.first()?;

    if let Some(hint) = hint {
        if let Some(column) = first.columns().find(|c| *c == hint) {
            return Some(column);
        }
    }

    first
        .columns()
        .find(|c| c.to_ascii_lowercase().contains("date"))
}

/// 最新のレコードを返す
///
/// 上流のCSVが昇順か降順かは保証されないため、日付列の値を実際に比較する。
/// 同じ日付なら後の行を優先。日付が1つも読めなければ最終行。
pub fn latest<'a>(rows: &'a [Record], date_column: Option<&str>) -> Option<Latest<'a>> {
    let last = rows.last()?;

    let dated = find_date_column(rows, date_column).and_then(|column| {
        rows.iter()
            .filter_map(|r| r.get(column).and_then(parse_date).map(|d| (d, r)))
            // max_by は同値なら最後の要素を返す
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, record)| Latest {
                record,
                date_column: Some(column),
            })
    });

    Some(dated.unwrap_or(Latest {
        record: last,
        date_column: None,
    }))
}

//! Structured-row readers: blob bytes -> lazy, forward-only sequence of rows.

use bytes::Bytes;
use kvload_core::{DataRecord, DataRecordType, DecodeError, MutationType, UdfLanguage, Value};
use serde_json::{Map, Value as Json};

use crate::{columns, decode_row, DecoderOptions, Row};

/// Column reported for errors that concern the whole row rather than one field.
pub const ROW_COLUMN: &str = "<row>";

/// A row together with the record type it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRow {
    pub record_type: DataRecordType,
    pub columns: Row,
}

pub type RowIter = Box<dyn Iterator<Item = Result<DecodedRow, DecodeError>> + Send>;

/// Opens a reader over one blob (a delta file or a realtime payload).
pub trait RowReaderFactory: Send + Sync {
    fn open(&self, blob: Bytes) -> RowIter;
}

/// Reads newline-delimited JSON objects whose fields are the row columns.
///
/// Rows use the configured default type unless they carry a `record_type`
/// column (`key_value_mutation` or `udf_config`).
#[derive(Debug, Clone, Copy)]
pub struct JsonLinesReaderFactory {
    default_record_type: DataRecordType,
}

impl JsonLinesReaderFactory {
    pub fn new(default_record_type: DataRecordType) -> Self { Self { default_record_type } }
}

impl Default for JsonLinesReaderFactory {
    fn default() -> Self { Self::new(DataRecordType::KeyValueMutation) }
}

impl RowReaderFactory for JsonLinesReaderFactory {
    fn open(&self, blob: Bytes) -> RowIter {
        Box::new(JsonLinesRows { blob, pos: 0, line: 0, default_record_type: self.default_record_type })
    }
}

struct JsonLinesRows {
    blob: Bytes,
    pos: usize,
    line: usize,
    default_record_type: DataRecordType,
}

impl Iterator for JsonLinesRows {
    type Item = Result<DecodedRow, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.blob.len() {
            let rest = &self.blob[self.pos..];
            let end = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
            let raw = &rest[..end];
            self.pos += end + 1;
            self.line += 1;
            let text = match std::str::from_utf8(raw) {
                Ok(t) => t.trim(),
                Err(_) => return Some(Err(DecodeError::new(ROW_COLUMN, format!("line {}: not valid utf-8", self.line)))),
            };
            if text.is_empty() {
                continue;
            }
            return Some(parse_line(text, self.line, self.default_record_type));
        }
        None
    }
}

fn parse_record_type(raw: &str) -> Result<DataRecordType, DecodeError> {
    match raw.to_ascii_lowercase().as_str() {
        "key_value_mutation" => Ok(DataRecordType::KeyValueMutation),
        "udf_config" => Ok(DataRecordType::UdfConfig),
        _ => Err(DecodeError::new(columns::RECORD_TYPE, format!("unknown record type {:?}", raw))),
    }
}

fn parse_line(text: &str, line: usize, default_record_type: DataRecordType) -> Result<DecodedRow, DecodeError> {
    let obj: Map<String, Json> =
        serde_json::from_str(text).map_err(|e| DecodeError::new(ROW_COLUMN, format!("line {}: {}", line, e)))?;
    let mut row = Row::default();
    for (k, v) in obj {
        let s = match v {
            Json::String(s) => s,
            Json::Number(n) => n.to_string(),
            Json::Bool(b) => b.to_string(),
            other => {
                return Err(DecodeError::new(k, format!("line {}: expected a scalar, got {}", line, other)));
            }
        };
        row.insert(k, s);
    }
    let record_type = match row.remove(columns::RECORD_TYPE) {
        Some(rt) => parse_record_type(&rt)?,
        None => default_record_type,
    };
    Ok(DecodedRow { record_type, columns: row })
}

/// Read and decode every row of a blob, lazily.
pub fn decode_stream(
    factory: &dyn RowReaderFactory,
    blob: Bytes,
    opts: DecoderOptions,
) -> impl Iterator<Item = Result<DataRecord, DecodeError>> + Send {
    factory
        .open(blob)
        .map(move |row| row.and_then(|r| decode_row(&r.columns, r.record_type, &opts)))
}

/// Render a record as one JSON line readable by [`JsonLinesReaderFactory`].
pub fn encode_json_line(record: &DataRecord, value_separator: char) -> String {
    let separator = value_separator.to_string();
    let mut obj = Map::new();
    let mut put = |k: &str, v: String| {
        obj.insert(k.to_string(), Json::String(v));
    };
    match record {
        DataRecord::KeyValueMutation(kv) => {
            let (value_type, value) = match &kv.value {
                Value::String(s) => (crate::VALUE_TYPE_STRING, s.clone()),
                Value::StringSet(set) => (crate::VALUE_TYPE_STRING_SET, set.join(separator.as_str())),
            };
            let mutation = match kv.mutation_type {
                MutationType::Update => crate::MUTATION_TYPE_UPDATE,
                MutationType::Delete => crate::MUTATION_TYPE_DELETE,
            };
            put(columns::RECORD_TYPE, "key_value_mutation".into());
            put(columns::KEY, kv.key.clone());
            put(columns::VALUE, value);
            put(columns::VALUE_TYPE, value_type.into());
            put(columns::MUTATION_TYPE, mutation.into());
            put(columns::LOGICAL_COMMIT_TIME, kv.logical_commit_time.to_string());
        }
        DataRecord::UdfConfig(udf) => {
            let language = match udf.language {
                UdfLanguage::Javascript => crate::LANGUAGE_JAVASCRIPT,
            };
            put(columns::RECORD_TYPE, "udf_config".into());
            put(columns::CODE_SNIPPET, udf.code_snippet.clone());
            put(columns::HANDLER_NAME, udf.handler_name.clone());
            put(columns::LANGUAGE, language.into());
            put(columns::LOGICAL_COMMIT_TIME, udf.logical_commit_time.to_string());
        }
    }
    Json::Object(obj).to_string()
}

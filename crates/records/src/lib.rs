//! kvload records: turn structured rows into typed `DataRecord`s.
//!
//! Decoding is pure. A malformed row fails on its own; callers decide whether
//! to skip it or abort the whole file.

#![forbid(unsafe_code)]

use kvload_core::constants::DEFAULT_VALUE_SEPARATOR;
use kvload_core::{
    DataRecord, DataRecordType, DecodeError, KeyValueMutationRecord, MutationType, StringSet, UdfLanguage,
    UserDefinedFunctionsConfigRecord, Value,
};
use rustc_hash::FxHashMap;

pub mod reader;

pub use reader::{decode_stream, encode_json_line, DecodedRow, JsonLinesReaderFactory, RowIter, RowReaderFactory};

/// Column name -> raw string value.
pub type Row = FxHashMap<String, String>;

/// Stable column names.
pub mod columns {
    pub const KEY: &str = "key";
    pub const VALUE: &str = "value";
    pub const VALUE_TYPE: &str = "value_type";
    pub const LOGICAL_COMMIT_TIME: &str = "logical_commit_time";
    pub const MUTATION_TYPE: &str = "mutation_type";
    pub const CODE_SNIPPET: &str = "code_snippet";
    pub const HANDLER_NAME: &str = "handler_name";
    pub const LANGUAGE: &str = "language";
    pub const RECORD_TYPE: &str = "record_type";
}

pub const VALUE_TYPE_STRING: &str = "string";
pub const VALUE_TYPE_STRING_SET: &str = "string_set";
pub const MUTATION_TYPE_UPDATE: &str = "update";
pub const MUTATION_TYPE_DELETE: &str = "delete";
pub const LANGUAGE_JAVASCRIPT: &str = "javascript";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Splits `string_set` values.
    pub value_separator: char,
}

impl Default for DecoderOptions {
    fn default() -> Self { Self { value_separator: DEFAULT_VALUE_SEPARATOR } }
}

fn column<'a>(row: &'a Row, name: &str) -> Result<&'a str, DecodeError> {
    row.get(name).map(String::as_str).ok_or_else(|| DecodeError::new(name, "missing column"))
}

fn commit_time(row: &Row) -> Result<i64, DecodeError> {
    let raw = column(row, columns::LOGICAL_COMMIT_TIME)?;
    raw.trim().parse::<i64>().map_err(|_| {
        DecodeError::new(columns::LOGICAL_COMMIT_TIME, format!("cannot convert {:?} to a number", raw))
    })
}

fn mutation_type(row: &Row) -> Result<MutationType, DecodeError> {
    let raw = column(row, columns::MUTATION_TYPE)?;
    match raw.to_ascii_lowercase().as_str() {
        MUTATION_TYPE_UPDATE => Ok(MutationType::Update),
        MUTATION_TYPE_DELETE => Ok(MutationType::Delete),
        _ => Err(DecodeError::new(columns::MUTATION_TYPE, format!("unknown mutation type {:?}", raw))),
    }
}

fn value(row: &Row, separator: char) -> Result<Value, DecodeError> {
    let value_type = column(row, columns::VALUE_TYPE)?.to_ascii_lowercase();
    let raw = column(row, columns::VALUE)?;
    match value_type.as_str() {
        VALUE_TYPE_STRING => Ok(Value::String(raw.to_string())),
        VALUE_TYPE_STRING_SET => Ok(Value::StringSet(raw.split(separator).map(str::to_string).collect::<StringSet>())),
        other => Err(DecodeError::new(columns::VALUE_TYPE, format!("value type {:?} is not supported", other))),
    }
}

fn language(row: &Row) -> Result<UdfLanguage, DecodeError> {
    let raw = column(row, columns::LANGUAGE)?;
    match raw.to_ascii_lowercase().as_str() {
        LANGUAGE_JAVASCRIPT => Ok(UdfLanguage::Javascript),
        _ => Err(DecodeError::new(columns::LANGUAGE, format!("language {:?} is not supported", raw))),
    }
}

/// Decode one row as the declared record type.
pub fn decode_row(row: &Row, record_type: DataRecordType, opts: &DecoderOptions) -> Result<DataRecord, DecodeError> {
    match record_type {
        DataRecordType::KeyValueMutation => {
            let key = column(row, columns::KEY)?.to_string();
            let value = value(row, opts.value_separator)?;
            let logical_commit_time = commit_time(row)?;
            let mutation_type = mutation_type(row)?;
            Ok(DataRecord::KeyValueMutation(KeyValueMutationRecord { key, value, logical_commit_time, mutation_type }))
        }
        DataRecordType::UdfConfig => {
            let code_snippet = column(row, columns::CODE_SNIPPET)?.to_string();
            let handler_name = column(row, columns::HANDLER_NAME)?.to_string();
            let logical_commit_time = commit_time(row)?;
            let language = language(row)?;
            Ok(DataRecord::UdfConfig(UserDefinedFunctionsConfigRecord {
                code_snippet,
                handler_name,
                logical_commit_time,
                language,
            }))
        }
    }
}

//! JSONL Parser (C2, spec §4.2). Streams a file as a pull-based sequence of
//! `LineResult`s with bounded memory. Blank lines are skipped silently;
//! malformed lines never abort the file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::encoding::Encoding;
use crate::error::{EncodingError, Outcome};
use crate::model::{ErrorDetail, LogRecord, Severity};
use crate::pipeline::validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Validation,
    Processing,
    Encoding,
}

#[derive(Debug, Clone)]
pub struct ProcessingError {
    pub line_no: usize,
    pub content: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum LineResult {
    Valid(LogRecord),
    Invalid(ProcessingError),
}

/// Underlying line source. Plain UTF-8 (the overwhelming common case) is
/// streamed line-by-line with `tokio::io::AsyncBufReadExt`; other encodings
/// are transcoded up front (still bounded — the file processor has already
/// rejected anything above `large_file_size_threshold`) and iterated in memory.
enum Source {
    Utf8(tokio::io::Lines<BufReader<tokio::fs::File>>),
    Decoded(std::vec::IntoIter<String>),
}

pub struct JsonlParser {
    source: Source,
    line_no: usize,
    source_file: PathBuf,
    /// True only for the UTF-8 path when the encoding detector found a BOM
    /// (§4.1): `tokio`'s line reader does not strip it, unlike `encoding_rs`
    /// on the `Decoded` path, so the first line needs one manual trim.
    strip_bom_on_first_line: bool,
}

impl JsonlParser {
    pub async fn open(path: &Path, encoding: Encoding, has_bom: bool) -> Result<Self, EncodingError> {
        let source = match encoding {
            Encoding::Utf8 => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| EncodingError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Source::Utf8(BufReader::new(file).lines())
            }
            other => {
                let bytes = tokio::fs::read(path).await.map_err(|source| EncodingError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                let text = decode_full(&bytes, other);
                let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
                Source::Decoded(lines.into_iter())
            }
        };
        Ok(Self {
            source,
            line_no: 0,
            source_file: path.to_path_buf(),
            strip_bom_on_first_line: has_bom && encoding == Encoding::Utf8,
        })
    }

    /// Pull the next line result. Returns `None` at end of file.
    /// `Outcome::Cancelled` is returned if `cancel` fired before the next
    /// line could be read — the caller's partial output up to this point
    /// remains valid and observable.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<Outcome<LineResult>> {
        loop {
            if cancel.is_cancelled() {
                return Some(Outcome::Cancelled);
            }

            let raw = match &mut self.source {
                Source::Utf8(lines) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Some(Outcome::Cancelled),
                        line = lines.next_line() => match line {
                            Ok(Some(l)) => l,
                            Ok(None) => return None,
                            Err(e) => {
                                self.line_no += 1;
                                return Some(Outcome::Completed(LineResult::Invalid(
                                    ProcessingError {
                                        line_no: self.line_no,
                                        content: String::new(),
                                        kind: ErrorKind::Encoding,
                                        message: format!("io error reading line: {e}"),
                                    },
                                )));
                            }
                        },
                    }
                }
                Source::Decoded(iter) => match iter.next() {
                    Some(l) => l,
                    None => return None,
                },
            };

            self.line_no += 1;
            let raw = if self.strip_bom_on_first_line {
                self.strip_bom_on_first_line = false;
                raw.strip_prefix('\u{FEFF}').map(str::to_string).unwrap_or(raw)
            } else {
                raw
            };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }

            return Some(Outcome::Completed(parse_line(
                trimmed,
                self.line_no,
                &self.source_file,
            )));
        }
    }
}

/// Parse, materialise, validate, and (on success) HTML-escape a single line.
fn parse_line(raw: &str, line_no: usize, source_file: &Path) -> LineResult {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return LineResult::Invalid(ProcessingError {
                line_no,
                content: raw.to_string(),
                kind: ErrorKind::Parse,
                message: format!("invalid JSON: {e}"),
            });
        }
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => {
            return LineResult::Invalid(ProcessingError {
                line_no,
                content: raw.to_string(),
                kind: ErrorKind::Parse,
                message: "top-level value must be a JSON object".to_string(),
            });
        }
    };

    // Case-insensitive key matching: normalise to lowercase, first occurrence wins.
    let mut fields: std::collections::HashMap<String, &Value> = std::collections::HashMap::new();
    for (k, v) in obj {
        fields.entry(k.to_ascii_lowercase()).or_insert(v);
    }

    let get_str = |key: &str| -> Option<String> {
        fields.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
    };

    let id = match get_str("id") {
        Some(s) if !s.is_empty() => s,
        _ => {
            return LineResult::Invalid(ProcessingError {
                line_no,
                content: raw.to_string(),
                kind: ErrorKind::Validation,
                message: "missing required field: id".to_string(),
            });
        }
    };
    let device_id = match get_str("device_id") {
        Some(s) if !s.is_empty() => s,
        _ => {
            return LineResult::Invalid(ProcessingError {
                line_no,
                content: raw.to_string(),
                kind: ErrorKind::Validation,
                message: "missing required field: device_id".to_string(),
            });
        }
    };
    let message = match get_str("message") {
        Some(s) => s,
        None => {
            return LineResult::Invalid(ProcessingError {
                line_no,
                content: raw.to_string(),
                kind: ErrorKind::Validation,
                message: "missing required field: message".to_string(),
            });
        }
    };

    let timestamp = match fields.get("timestamp") {
        Some(v) => match parse_timestamp(v) {
            Some(ts) => ts,
            None => {
                return LineResult::Invalid(ProcessingError {
                    line_no,
                    content: raw.to_string(),
                    kind: ErrorKind::Validation,
                    message: "timestamp: could not parse as ISO-8601".to_string(),
                });
            }
        },
        None => {
            return LineResult::Invalid(ProcessingError {
                line_no,
                content: raw.to_string(),
                kind: ErrorKind::Validation,
                message: "missing required field: timestamp".to_string(),
            });
        }
    };

    let level = match get_str("level").as_deref().and_then(Severity::parse) {
        Some(l) => l,
        None => {
            return LineResult::Invalid(ProcessingError {
                line_no,
                content: raw.to_string(),
                kind: ErrorKind::Validation,
                message: "level: must be one of Debug|Info|Warning|Error|Critical".to_string(),
            });
        }
    };

    let category = get_str("category");
    let tags: Vec<String> = fields
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|e| e.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let error = fields.get("error").and_then(|v| v.as_object()).map(|e| ErrorDetail {
        code: e.get("code").and_then(|v| v.as_str()).map(String::from),
        message: e.get("message").and_then(|v| v.as_str()).map(String::from),
        stack: e.get("stack").and_then(|v| v.as_str()).map(String::from),
    });

    let mut record = LogRecord {
        id,
        device_id,
        timestamp,
        level,
        message,
        category,
        tags,
        error,
        source_file: source_file.to_path_buf(),
        processed_at: Utc::now(),
    };

    if let Err(errors) = validator::validate(&record) {
        return LineResult::Invalid(ProcessingError {
            line_no,
            content: raw.to_string(),
            kind: ErrorKind::Validation,
            message: errors.join("; "),
        });
    }

    escape_record(&mut record);
    LineResult::Valid(record)
}

/// Try `chrono`'s native RFC3339 deserialisation first; on failure, retry
/// with a handful of common ISO-8601 variants (missing timezone, missing
/// sub-second precision) before giving up.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Ok(ts) = serde_json::from_value::<DateTime<Utc>>(value.clone()) {
        return Some(ts);
    }
    let s = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

/// HTML-entity-escape the user-controlled string fields (§4.2). `source_file`
/// (a path) and `error.stack` (a diagnostic, never rendered) are exempt.
fn escape_record(record: &mut LogRecord) {
    record.id = html_escape(&record.id);
    record.device_id = html_escape(&record.device_id);
    record.message = html_escape(&record.message);
    if let Some(category) = &record.category {
        record.category = Some(html_escape(category));
    }
    for tag in &mut record.tags {
        *tag = html_escape(tag);
    }
    if let Some(err) = &mut record.error {
        if let Some(code) = &err.code {
            err.code = Some(html_escape(code));
        }
        if let Some(message) = &err.message {
            err.message = Some(html_escape(message));
        }
        // err.stack intentionally left untouched.
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Transcode a non-UTF-8 byte buffer to a UTF-8 `String` for the encodings
/// the detector recognises (§4.1). Malformed sequences are replaced, not
/// fatal — the per-line JSON parse will reject whatever garbage results.
fn decode_full(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Utf16Le => {
            let (text, _, _) = encoding_rs::UTF_16LE.decode(bytes);
            text.into_owned()
        }
        Encoding::Utf16Be => {
            let (text, _, _) = encoding_rs::UTF_16BE.decode(bytes);
            text.into_owned()
        }
        Encoding::ShiftJis => {
            let (text, _, _) = encoding_rs::SHIFT_JIS.decode(bytes);
            text.into_owned()
        }
        Encoding::Utf32Le => decode_utf32(bytes, false),
        Encoding::Utf32Be => decode_utf32(bytes, true),
    }
}

fn decode_utf32(bytes: &[u8], big_endian: bool) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk.try_into().unwrap();
        let code = if big_endian {
            u32::from_be_bytes(arr)
        } else {
            u32::from_le_bytes(arr)
        };
        if let Some(c) = char::from_u32(code) {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(raw: &str) -> LineResult {
        parse_line(raw, 1, &PathBuf::from("a.jsonl"))
    }

    #[test]
    fn happy_path_record_parses_valid() {
        let line = r#"{"id":"1","device_id":"d1","timestamp":"2025-03-21T15:30:45.123Z","level":"info","message":"ok"}"#;
        match parse(line) {
            LineResult::Valid(r) => {
                assert_eq!(r.id, "1");
                assert_eq!(r.level, Severity::Info);
            }
            LineResult::Invalid(e) => panic!("expected valid, got {:?}", e),
        }
    }

    #[test]
    fn malformed_json_is_parse_error() {
        match parse("{not json}") {
            LineResult::Invalid(e) => assert_eq!(e.kind, ErrorKind::Parse),
            LineResult::Valid(_) => panic!("expected invalid"),
        }
    }

    #[test]
    fn empty_id_is_validation_error() {
        let line = r#"{"id":"","device_id":"d1","timestamp":"2025-03-21T15:30:45Z","level":"info","message":"x"}"#;
        match parse(line) {
            LineResult::Invalid(e) => {
                assert_eq!(e.kind, ErrorKind::Validation);
            }
            LineResult::Valid(_) => panic!("expected invalid"),
        }
    }

    #[test]
    fn case_insensitive_keys_are_recognised() {
        let line = r#"{"ID":"1","Device_Id":"d1","TIMESTAMP":"2025-03-21T15:30:45Z","Level":"ERROR","Message":"boom"}"#;
        match parse(line) {
            LineResult::Valid(r) => assert_eq!(r.level, Severity::Error),
            LineResult::Invalid(e) => panic!("expected valid, got {:?}", e),
        }
    }

    #[test]
    fn html_unsafe_fields_are_escaped() {
        let line = r#"{"id":"1","device_id":"d1","timestamp":"2025-03-21T15:30:45Z","level":"info","message":"<script>alert(1)</script>"}"#;
        match parse(line) {
            LineResult::Valid(r) => assert!(r.message.contains("&lt;script&gt;")),
            LineResult::Invalid(e) => panic!("expected valid, got {:?}", e),
        }
    }

    #[test]
    fn error_stack_is_not_escaped() {
        let line = r#"{"id":"1","device_id":"d1","timestamp":"2025-03-21T15:30:45Z","level":"info","message":"x","error":{"stack":"<at x>"}}"#;
        match parse(line) {
            LineResult::Valid(r) => {
                assert_eq!(r.error.unwrap().stack.unwrap(), "<at x>");
            }
            LineResult::Invalid(e) => panic!("expected valid, got {:?}", e),
        }
    }

    #[test]
    fn timestamp_recovers_from_raw_string_when_native_parse_fails() {
        let line = r#"{"id":"1","device_id":"d1","timestamp":"2025-03-21 15:30:45","level":"info","message":"x"}"#;
        match parse(line) {
            LineResult::Valid(r) => assert_eq!(r.timestamp.to_rfc3339().starts_with("2025-03-21T15:30:45"), true),
            LineResult::Invalid(e) => panic!("expected valid, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn utf8_bom_is_stripped_from_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let mut content = vec![0xEFu8, 0xBB, 0xBF];
        content.extend_from_slice(
            br#"{"id":"1","device_id":"d1","timestamp":"2025-03-21T15:30:45Z","level":"info","message":"ok"}"#,
        );
        content.push(b'\n');
        std::fs::write(&path, content).unwrap();

        let cancel = CancellationToken::new();
        let mut parser = JsonlParser::open(&path, Encoding::Utf8, true).await.unwrap();
        match parser.next(&cancel).await {
            Some(Outcome::Completed(LineResult::Valid(r))) => assert_eq!(r.id, "1"),
            other => panic!("expected valid record, got {:?}", other),
        }
    }
}

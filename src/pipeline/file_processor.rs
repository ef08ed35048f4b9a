//! File Processor (C4, spec §4.4). Orchestrates encoding detection, the JSONL
//! parser, and the validator for one file, emitting a per-file summary.
//! Individual malformed/invalid lines never fail the file.

use std::path::Path;

use fs2::FileExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AgentConfig;
use crate::encoding;
use crate::error::{FileProcessorError, Outcome};
use crate::model::LogRecord;
use crate::pipeline::parser::{ErrorKind, JsonlParser, LineResult, ProcessingError};

const MAX_SAMPLE_INVALID: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreFilter {
    Process,
    /// Not a target file; not an error (§4.4 step 1-3).
    Skip,
}

/// The result of processing one file (§4.4).
#[derive(Debug)]
pub struct FileProcessingResult {
    pub success: bool,
    pub processed_records: usize,
    pub invalid_records: usize,
    pub duration_ms: u64,
    pub file_size: u64,
    pub error: Option<String>,
    /// Valid records ready for the batch processor, in file order (§5).
    pub records: Vec<LogRecord>,
}

/// Steps 1-4 of §4.4: extension/size/lock filtering ahead of the expensive path.
pub fn should_process(path: &Path, config: &AgentConfig) -> Result<PreFilter, FileProcessorError> {
    if !path.exists() {
        return Ok(PreFilter::Skip);
    }

    if !extension_allowed(path, config) {
        return Ok(PreFilter::Skip);
    }

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PreFilter::Skip),
        Err(e) => return Err(FileProcessorError::FilesystemTransient(e)),
    };
    if metadata.len() > config.large_file_size_threshold {
        return Ok(PreFilter::Skip);
    }

    match std::fs::File::open(path) {
        Ok(file) => match file.try_lock_shared() {
            Ok(()) => {
                let _ = file.unlock();
                Ok(PreFilter::Process)
            }
            Err(_) => Ok(PreFilter::Skip),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PreFilter::Skip),
        Err(e) => Err(FileProcessorError::FilesystemTransient(e)),
    }
}

/// Extension-filter precedence (§9 Open Questions): `file_extensions` (list)
/// wins if non-empty, else `file_filter` (glob) if set, else accept all.
fn extension_allowed(path: &Path, config: &AgentConfig) -> bool {
    if !config.file_extensions.is_empty() {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        return config
            .file_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext));
    }
    if let Some(filter) = &config.file_filter {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        return glob_match(filter, name);
    }
    true
}

/// Single-wildcard glob matcher (`*` only), sufficient for `*.jsonl`-style filters.
fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => pattern == name,
    }
}

/// Main path of §4.4: detect encoding, stream+validate every line, and
/// produce a per-file summary. Success iff encoding detection succeeded and
/// no fatal IO exception occurred — invalid individual records do not fail
/// the file.
pub async fn process(path: &Path, cancel: &CancellationToken) -> FileProcessingResult {
    let start = std::time::Instant::now();
    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let detection = match encoding::detect(path) {
        Ok(d) => d,
        Err(e) => {
            return FileProcessingResult {
                success: false,
                processed_records: 0,
                invalid_records: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                file_size,
                error: Some(format!("encoding detection failed: {e}")),
                records: Vec::new(),
            };
        }
    };
    if let Some(warning) = &detection.warning {
        tracing::warn!(file = %path.display(), "{warning}");
    }

    let mut parser = match JsonlParser::open(path, detection.encoding, detection.has_bom).await {
        Ok(p) => p,
        Err(e) => {
            return FileProcessingResult {
                success: false,
                processed_records: 0,
                invalid_records: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                file_size,
                error: Some(format!("failed to open for parsing: {e}")),
                records: Vec::new(),
            };
        }
    };

    let mut records = Vec::new();
    let mut invalid_count = 0usize;
    let mut samples: Vec<ProcessingError> = Vec::new();

    loop {
        match parser.next(cancel).await {
            None => break,
            Some(Outcome::Cancelled) => break,
            Some(Outcome::Completed(LineResult::Valid(record))) => records.push(record),
            Some(Outcome::Completed(LineResult::Invalid(err))) => {
                invalid_count += 1;
                if samples.len() < MAX_SAMPLE_INVALID {
                    samples.push(err);
                }
            }
        }
    }

    for sample in &samples {
        debug!(
            line = sample.line_no,
            kind = ?sample.kind,
            message = %sample.message,
            "invalid record"
        );
    }

    FileProcessingResult {
        success: true,
        processed_records: records.len(),
        invalid_records: invalid_count,
        duration_ms: start.elapsed().as_millis() as u64,
        file_size,
        error: None,
        records,
    }
}

#[allow(dead_code)]
fn classify(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Parse => "parse",
        ErrorKind::Validation => "validation",
        ErrorKind::Processing => "processing",
        ErrorKind::Encoding => "encoding",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn base_config(dir: &Path) -> AgentConfig {
        let toml_str = format!(
            r#"
monitoring_paths = ["{}"]
[iothub]
connection_string = "HostName=h;DeviceId=d;SharedAccessKey=k"
"#,
            dir.display()
        );
        toml::from_str(&toml_str).unwrap()
    }

    #[test]
    fn glob_matches_simple_wildcard() {
        assert!(glob_match("*.jsonl", "a.jsonl"));
        assert!(!glob_match("*.jsonl", "a.json"));
        assert!(glob_match("prefix*", "prefix-x"));
    }

    #[test]
    fn extension_list_wins_over_glob() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.file_extensions = vec!["log".to_string()];
        config.file_filter = Some("*.jsonl".to_string());

        assert!(extension_allowed(Path::new("a.log"), &config));
        assert!(!extension_allowed(Path::new("a.jsonl"), &config));
    }

    #[test]
    fn glob_used_when_no_extension_list() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.file_filter = Some("*.jsonl".to_string());
        assert!(extension_allowed(Path::new("a.jsonl"), &config));
        assert!(!extension_allowed(Path::new("a.txt"), &config));
    }

    #[test]
    fn missing_file_is_skip_not_error() {
        let dir = tempdir().unwrap();
        let config = base_config(dir.path());
        let result = should_process(&dir.path().join("nope.jsonl"), &config).unwrap();
        assert_eq!(result, PreFilter::Skip);
    }

    #[test]
    fn oversized_file_is_skip() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.large_file_size_threshold = 4;
        let path = dir.path().join("big.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        let result = should_process(&path, &config).unwrap();
        assert_eq!(result, PreFilter::Skip);
    }

    #[tokio::test]
    async fn happy_path_two_records_blank_line_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"1\",\"device_id\":\"d1\",\"timestamp\":\"2025-03-21T15:30:45.123Z\",\"level\":\"info\",\"message\":\"ok\"}\n\n{\"id\":\"2\",\"device_id\":\"d1\",\"timestamp\":\"2025-03-21T15:30:46.000Z\",\"level\":\"error\",\"message\":\"boom\"}\n",
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let result = process(&path, &cancel).await;
        assert!(result.success);
        assert_eq!(result.processed_records, 2);
        assert_eq!(result.invalid_records, 0);
        assert_eq!(result.records[0].id, "1");
        assert_eq!(result.records[1].id, "2");
    }

    #[tokio::test]
    async fn malformed_line_counted_invalid_file_still_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"1\",\"device_id\":\"d1\",\"timestamp\":\"2025-03-21T15:30:45Z\",\"level\":\"info\",\"message\":\"ok\"}\n{not json}\n{\"id\":\"2\",\"device_id\":\"d1\",\"timestamp\":\"2025-03-21T15:30:46Z\",\"level\":\"info\",\"message\":\"ok2\"}\n",
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let result = process(&path, &cancel).await;
        assert!(result.success);
        assert_eq!(result.processed_records, 2);
        assert_eq!(result.invalid_records, 1);
    }

    #[tokio::test]
    async fn blank_file_yields_zero_and_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "\n\n\n").unwrap();

        let cancel = CancellationToken::new();
        let result = process(&path, &cancel).await;
        assert!(result.success);
        assert_eq!(result.processed_records, 0);
        assert_eq!(result.invalid_records, 0);
    }
}

//! Encoding Detector (C1, spec §4.1). Pure function of file content — given a
//! path, returns `{encoding, has_bom, confidence, error?}`. Never panics.

use std::io::Read;
use std::path::Path;

use crate::error::EncodingError;

const SAMPLE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
    ShiftJis,
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub encoding: Encoding,
    pub has_bom: bool,
    pub confidence: f64,
    pub warning: Option<String>,
}

/// Detect the encoding of a file by BOM, then UTF-8 validation, then a
/// Shift-JIS heuristic, falling back to low-confidence UTF-8 (§4.1).
pub fn detect(path: &Path) -> Result<DetectionResult, EncodingError> {
    if !path.exists() {
        return Err(EncodingError::NotFound(path.to_path_buf()));
    }

    let mut file = std::fs::File::open(path).map_err(|source| EncodingError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut sample = vec![0u8; SAMPLE_SIZE];
    let n = file.read(&mut sample).map_err(|source| EncodingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    sample.truncate(n);

    Ok(detect_from_bytes(&sample))
}

/// Pure byte-sample classifier, split out so tests (and the caller above)
/// don't need to touch the filesystem for every case.
pub fn detect_from_bytes(sample: &[u8]) -> DetectionResult {
    if let Some(result) = detect_bom(sample) {
        return result;
    }

    if is_valid_utf8(sample) {
        return DetectionResult {
            encoding: Encoding::Utf8,
            has_bom: false,
            confidence: 1.0,
            warning: None,
        };
    }

    if let Some(result) = detect_shift_jis(sample) {
        return result;
    }

    DetectionResult {
        encoding: Encoding::Utf8,
        has_bom: false,
        confidence: 0.5,
        warning: Some("could not confidently detect encoding, falling back to UTF-8".to_string()),
    }
}

fn detect_bom(sample: &[u8]) -> Option<DetectionResult> {
    let make = |encoding: Encoding| {
        Some(DetectionResult {
            encoding,
            has_bom: true,
            confidence: 1.0,
            warning: None,
        })
    };
    // UTF-32LE's BOM is a prefix of UTF-16LE's; check the longer one first.
    if sample.starts_with(&[0xEF, 0xBB, 0xBF]) {
        make(Encoding::Utf8)
    } else if sample.starts_with(&[0xFF, 0xFE, 0x00, 0x00]) {
        make(Encoding::Utf32Le)
    } else if sample.starts_with(&[0x00, 0x00, 0xFE, 0xFF]) {
        make(Encoding::Utf32Be)
    } else if sample.starts_with(&[0xFF, 0xFE]) {
        make(Encoding::Utf16Le)
    } else if sample.starts_with(&[0xFE, 0xFF]) {
        make(Encoding::Utf16Be)
    } else {
        None
    }
}

/// Standard UTF-8 continuation-byte automaton.
fn is_valid_utf8(sample: &[u8]) -> bool {
    std::str::from_utf8(sample).is_ok()
}

fn detect_shift_jis(sample: &[u8]) -> Option<DetectionResult> {
    let mut pairs = 0u32;
    let mut covered_bytes = 0usize;
    let mut i = 0;
    while i + 1 < sample.len() {
        let b1 = sample[i];
        let b2 = sample[i + 1];
        let b1_ok = (0x81..=0x9F).contains(&b1) || (0xE0..=0xFC).contains(&b1);
        let b2_ok = (0x40..=0x7E).contains(&b2) || (0x80..=0xFC).contains(&b2);
        if b1_ok && b2_ok {
            pairs += 1;
            covered_bytes += 2;
            i += 2;
        } else {
            i += 1;
        }
    }

    if sample.is_empty() {
        return None;
    }
    let coverage = covered_bytes as f64 / sample.len() as f64;
    if pairs >= 10 && coverage >= 0.10 {
        Some(DetectionResult {
            encoding: Encoding::ShiftJis,
            has_bom: false,
            confidence: coverage.min(1.0),
            warning: None,
        })
    } else {
        None
    }
}

//! Validator (C3, spec §4.3). Pure, no I/O: applies schema rules to an
//! already-materialised `LogRecord` and reports valid/invalid with reasons.

use chrono::{Duration, Utc};

use crate::model::LogRecord;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_TAG_LEN: usize = 64;
const MAX_TAGS: usize = 32;
const MAX_TIMESTAMP_SKEW_FUTURE_HOURS: i64 = 1;
const MAX_TIMESTAMP_AGE_YEARS: i64 = 10;

/// Validate a record against the schema rules in §4.3. Unknown fields are
/// not this function's concern — the parser preserves them, this function
/// never sees them.
pub fn validate(record: &LogRecord) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if record.id.trim().is_empty() {
        errors.push("id: must be a non-empty string".to_string());
    }
    if record.device_id.trim().is_empty() {
        errors.push("device_id: must be a non-empty string".to_string());
    }
    if record.message.is_empty() {
        errors.push("message: must be a non-empty string".to_string());
    } else if record.message.len() > MAX_MESSAGE_BYTES {
        errors.push(format!(
            "message: exceeds {} bytes (got {})",
            MAX_MESSAGE_BYTES,
            record.message.len()
        ));
    }

    let now = Utc::now();
    let earliest = now - Duration::days(365 * MAX_TIMESTAMP_AGE_YEARS);
    let latest = now + Duration::hours(MAX_TIMESTAMP_SKEW_FUTURE_HOURS);
    if record.timestamp < earliest || record.timestamp > latest {
        errors.push(format!(
            "timestamp: {} is outside the allowed window [{}, {}]",
            record.timestamp, earliest, latest
        ));
    }

    if record.tags.len() > MAX_TAGS {
        errors.push(format!(
            "tags: at most {} tags allowed (got {})",
            MAX_TAGS,
            record.tags.len()
        ));
    }
    for (i, tag) in record.tags.iter().enumerate() {
        if tag.len() > MAX_TAG_LEN {
            errors.push(format!(
                "tags[{}]: exceeds {} chars (got {})",
                i,
                MAX_TAG_LEN,
                tag.len()
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use std::path::PathBuf;

    fn base_record() -> LogRecord {
        LogRecord {
            id: "1".to_string(),
            device_id: "d1".to_string(),
            timestamp: Utc::now(),
            level: Severity::Info,
            message: "hello".to_string(),
            category: None,
            tags: vec![],
            error: None,
            source_file: PathBuf::from("a.jsonl"),
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn accepts_a_well_formed_record() {
        assert!(validate(&base_record()).is_ok());
    }

    #[test]
    fn rejects_empty_id() {
        let mut r = base_record();
        r.id = String::new();
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("id")));
    }

    #[test]
    fn rejects_oversized_message() {
        let mut r = base_record();
        r.message = "x".repeat(MAX_MESSAGE_BYTES + 1);
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("message")));
    }

    #[test]
    fn rejects_future_timestamp_beyond_skew() {
        let mut r = base_record();
        r.timestamp = Utc::now() + Duration::hours(2);
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("timestamp")));
    }

    #[test]
    fn rejects_timestamp_older_than_ten_years() {
        let mut r = base_record();
        r.timestamp = Utc::now() - Duration::days(365 * 11);
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("timestamp")));
    }

    #[test]
    fn rejects_too_many_tags() {
        let mut r = base_record();
        r.tags = (0..MAX_TAGS + 1).map(|i| i.to_string()).collect();
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("tags")));
    }

    #[test]
    fn rejects_overlong_tag() {
        let mut r = base_record();
        r.tags = vec!["x".repeat(MAX_TAG_LEN + 1)];
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("tags[0]")));
    }

    #[test]
    fn reports_every_violation_at_once() {
        let mut r = base_record();
        r.id = String::new();
        r.device_id = String::new();
        let errs = validate(&r).unwrap_err();
        assert_eq!(errs.len(), 2);
    }
}

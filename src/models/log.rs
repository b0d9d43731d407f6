use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One canonical log record, regardless of which backend produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// RFC3339 with up to nanosecond precision.
    pub timestamp: String,
    pub line: String,
    pub labels: BTreeMap<String, String>,
    /// One of `error`, `warning`, `info`, `debug`, or empty when unknown.
    pub level: String,
}

impl LogEntry {
    pub fn new(timestamp: String, line: String, labels: BTreeMap<String, String>) -> Self {
        let level = detect_level(&labels, &line);
        Self { timestamp, line, labels, level }
    }
}

const LEVEL_LABEL_KEYS: [&str; 3] = ["level", "severity", "severity_text"];

/// Infer a severity for a log record. Label values win over the line scan;
/// an unrecognised or "Unspecified" label value falls through to a
/// case-insensitive substring scan of the line, highest severity first.
pub fn detect_level(labels: &BTreeMap<String, String>, line: &str) -> String {
    for key in LEVEL_LABEL_KEYS {
        if let Some(raw) = labels.get(key) {
            let raw = raw.trim();
            if raw.is_empty() || raw.eq_ignore_ascii_case("unspecified") {
                continue;
            }
            if let Some(level) = canonical_level(raw) {
                return level.to_string();
            }
        }
    }
    let lower = line.to_lowercase();
    for (needle, level) in [
        ("error", "error"),
        ("warn", "warning"),
        ("info", "info"),
        ("debug", "debug"),
    ] {
        if lower.contains(needle) {
            return level.to_string();
        }
    }
    String::new()
}

fn canonical_level(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "error" | "err" | "fatal" | "critical" | "crit" => Some("error"),
        "warn" | "warning" => Some("warning"),
        "info" | "informational" | "notice" => Some("info"),
        "debug" | "trace" | "verbose" => Some("debug"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn line_scan_priority() {
        assert_eq!(detect_level(&BTreeMap::new(), "Error: x"), "error");
        assert_eq!(detect_level(&BTreeMap::new(), "warning: disk almost full"), "warning");
        assert_eq!(detect_level(&BTreeMap::new(), "info: started"), "info");
        assert_eq!(detect_level(&BTreeMap::new(), "debug trace here"), "debug");
        assert_eq!(detect_level(&BTreeMap::new(), "nothing to see"), "");
        // error outranks warn even when both appear
        assert_eq!(detect_level(&BTreeMap::new(), "warn then error"), "error");
    }

    #[test]
    fn label_dominates_line() {
        let l = labels(&[("level", "warn")]);
        assert_eq!(detect_level(&l, "Error: boom"), "warning");
        let l = labels(&[("severity", "DEBUG")]);
        assert_eq!(detect_level(&l, "error everywhere"), "debug");
        let l = labels(&[("severity_text", "Fatal")]);
        assert_eq!(detect_level(&l, ""), "error");
    }

    #[test]
    fn unspecified_severity_falls_through_to_line() {
        let l = labels(&[("severity", "Unspecified")]);
        assert_eq!(detect_level(&l, "level=info msg=q"), "info");
    }

    #[test]
    fn output_is_always_in_the_closed_set() {
        let allowed = ["error", "warning", "info", "debug", ""];
        let cases = [
            (labels(&[]), "panic ERROR everything"),
            (labels(&[("level", "weird")]), "some warning"),
            (labels(&[("severity", "17")]), "ok"),
            (labels(&[("level", "")]), "dEbUg on"),
        ];
        for (l, line) in cases {
            let got = detect_level(&l, line);
            assert!(allowed.contains(&got.as_str()), "unexpected level {got:?}");
        }
    }

    #[test]
    fn entry_constructor_infers_level() {
        let e = LogEntry::new(
            "2023-11-14T22:13:20Z".into(),
            "Error: boom".into(),
            labels(&[("job", "api")]),
        );
        assert_eq!(e.level, "error");
    }
}

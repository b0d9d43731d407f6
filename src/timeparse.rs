use chrono::{DateTime, SecondsFormat, Utc};

// Magnitude cutoffs for bare integer timestamps: anything at or above 1e11
// is milliseconds, 1e14 microseconds, 1e17 nanoseconds.
const MS_CUTOFF: i128 = 100_000_000_000;
const US_CUTOFF: i128 = 100_000_000_000_000;
const NS_CUTOFF: i128 = 100_000_000_000_000_000;

/// Scale a bare epoch integer of unknown unit to nanoseconds.
pub fn epoch_to_nanos(raw: i128) -> i128 {
    let magnitude = raw.abs();
    if magnitude >= NS_CUTOFF {
        raw
    } else if magnitude >= US_CUTOFF {
        raw * 1_000
    } else if magnitude >= MS_CUTOFF {
        raw * 1_000_000
    } else {
        raw * 1_000_000_000
    }
}

pub fn datetime_from_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec)
}

/// Format with up to nanosecond precision, trailing zero groups trimmed
/// (`2023-11-14T22:15:00Z`, `2023-11-14T22:13:20.123456789Z`).
pub fn rfc3339_nanos(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Convert an epoch integer of unknown unit straight to an RFC3339 string.
pub fn epoch_to_rfc3339(raw: i64) -> String {
    let nanos = epoch_to_nanos(raw as i128);
    i64::try_from(nanos)
        .ok()
        .and_then(datetime_from_nanos)
        .map(rfc3339_nanos)
        .unwrap_or_else(|| raw.to_string())
}

/// Parse a timestamp from whatever shape a backend row hands us: RFC3339
/// strings, stringified epoch integers or floats, or JSON numbers in epoch
/// seconds/ms/us/ns.
pub fn parse_flexible(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_flexible_str(s),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let nanos = epoch_to_nanos(i as i128);
                datetime_from_nanos(i64::try_from(nanos).ok()?)
            } else {
                let secs = n.as_f64()?;
                datetime_from_nanos((secs * 1e9) as i64)
            }
        }
        _ => None,
    }
}

pub fn parse_flexible_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // "2023-11-14 22:13:20" without a zone, as ClickHouse emits by default.
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(i) = s.parse::<i128>() {
        return datetime_from_nanos(i64::try_from(epoch_to_nanos(i)).ok()?);
    }
    if let Ok(f) = s.parse::<f64>() {
        return datetime_from_nanos((f * 1e9) as i64);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnitude_cutoffs() {
        // 2023-11-14T22:13:20Z expressed in four units.
        let secs = 1_700_000_000_i128;
        assert_eq!(epoch_to_nanos(secs), 1_700_000_000_000_000_000);
        assert_eq!(epoch_to_nanos(secs * 1_000), 1_700_000_000_000_000_000);
        assert_eq!(epoch_to_nanos(secs * 1_000_000), 1_700_000_000_000_000_000);
        assert_eq!(epoch_to_nanos(secs * 1_000_000_000), 1_700_000_000_000_000_000);
    }

    #[test]
    fn all_units_round_trip_to_same_rfc3339() {
        let expected = "2023-11-14T22:13:20Z";
        for raw in [
            1_700_000_000_i64,
            1_700_000_000_000,
            1_700_000_000_000_000,
            1_700_000_000_000_000_000,
        ] {
            assert_eq!(epoch_to_rfc3339(raw), expected, "raw={raw}");
        }
        let via_string = parse_flexible_str("2023-11-14T22:13:20Z").unwrap();
        assert_eq!(rfc3339_nanos(via_string), expected);
    }

    #[test]
    fn nanosecond_precision_survives() {
        assert_eq!(
            epoch_to_rfc3339(1_700_000_000_123_456_789),
            "2023-11-14T22:13:20.123456789Z"
        );
        assert_eq!(epoch_to_rfc3339(1_700_000_100_000_000_000), "2023-11-14T22:15:00Z");
    }

    #[test]
    fn flexible_parsing_of_json_shapes() {
        let from_num = parse_flexible(&serde_json::json!(1_700_000_000_i64)).unwrap();
        let from_ms = parse_flexible(&serde_json::json!(1_700_000_000_000_i64)).unwrap();
        let from_str = parse_flexible(&serde_json::json!("1700000000")).unwrap();
        let from_rfc = parse_flexible(&serde_json::json!("2023-11-14T22:13:20Z")).unwrap();
        let from_ch = parse_flexible(&serde_json::json!("2023-11-14 22:13:20")).unwrap();
        assert_eq!(from_num, from_ms);
        assert_eq!(from_num, from_str);
        assert_eq!(from_num, from_rfc);
        assert_eq!(from_num, from_ch);
    }

    #[test]
    fn fractional_seconds() {
        let dt = parse_flexible(&serde_json::json!(1_700_000_000.5_f64)).unwrap();
        assert_eq!(rfc3339_nanos(dt), "2023-11-14T22:13:20.500Z");
    }
}

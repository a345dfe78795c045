//! Event time resolution.

use agentspan_core::TraceEvent;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::ConversionError;

/// Parses an event timestamp.
///
/// RFC 3339 is the wire format. Timestamps without an offset are read as UTC.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

/// Resolves one timestamp per event, in array order.
///
/// Events without a parseable time inherit the time of the nearest preceding
/// timed event, or of the first timed event when none precedes them. A
/// non-empty batch with no timed event at all cannot be ordered.
pub(crate) fn resolve(events: &[TraceEvent]) -> Result<Vec<DateTime<Utc>>, ConversionError> {
    let parsed: Vec<Option<DateTime<Utc>>> = events
        .iter()
        .map(|e| e.event_time.as_deref().and_then(parse_event_time))
        .collect();

    let Some(mut last) = parsed.iter().flatten().next().copied() else {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        return Err(ConversionError::NoTimingAnchor {
            total: events.len(),
            invalid: events.iter().filter(|e| e.event_time.is_some()).count(),
        });
    };

    Ok(parsed
        .into_iter()
        .map(|t| {
            if let Some(t) = t {
                last = t;
            }
            last
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspan_core::TraceKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(time: Option<&str>) -> TraceEvent {
        TraceEvent {
            kind: TraceKind::Orchestration,
            payload: json!({}),
            event_time: time.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_event_time("2024-05-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_event_time("2024-05-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_event_time("2024-05-01T10:00:00"), Some(expected));
        assert_eq!(
            parse_event_time("2024-05-01T10:00:00.250Z"),
            Some(expected + chrono::Duration::milliseconds(250))
        );
        assert_eq!(parse_event_time("yesterday"), None);
    }

    #[test]
    fn test_untimed_events_inherit() {
        let times = resolve(&[
            event(None),
            event(Some("2024-05-01T10:00:01Z")),
            event(Some("garbage")),
            event(Some("2024-05-01T10:00:03Z")),
        ])
        .unwrap();

        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 3).unwrap();
        assert_eq!(times, vec![t1, t1, t1, t3]);
    }

    #[test]
    fn test_no_anchor() {
        assert!(resolve(&[]).unwrap().is_empty());

        let err = resolve(&[event(Some("garbage")), event(None)]).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::NoTimingAnchor {
                total: 2,
                invalid: 1
            }
        ));
    }
}

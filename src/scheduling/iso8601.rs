use super::ScheduleError;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Longest accepted interval, one leap year.
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// Parsed ISO-8601 repeating interval such as `R3/2012-01-01T00:00:00Z/PT1H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoInterval {
    pub interval_secs: u64,
    pub start: Option<DateTime<Utc>>,
    pub recurrences: Option<u32>,
}

/// Accepts `[Rn/][start/]duration` in any order the standard allows for these
/// three parts. Calendar units (years, months) are rejected because their
/// length varies.
pub fn parse_iso8601_interval(raw: &str) -> Result<IsoInterval, ScheduleError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::invalid("empty ISO-8601 interval"));
    }
    let mut interval_secs = None;
    let mut start = None;
    let mut recurrences = None;
    for part in trimmed.split('/') {
        if let Some(count) = part.strip_prefix('R') {
            if recurrences.is_some() {
                return Err(ScheduleError::invalid(format!(
                    "`{raw}` repeats the recurrence part"
                )));
            }
            recurrences = if count.is_empty() {
                None
            } else {
                Some(count.parse::<u32>().map_err(|_| {
                    ScheduleError::invalid(format!("invalid recurrence count `{part}`"))
                })?)
            };
            if recurrences == Some(0) {
                return Err(ScheduleError::invalid("recurrence count must be >= 1"));
            }
        } else if part.starts_with('P') {
            if interval_secs.is_some() {
                return Err(ScheduleError::invalid(format!(
                    "`{raw}` has more than one duration"
                )));
            }
            interval_secs = Some(parse_duration(part)?);
        } else {
            if start.is_some() {
                return Err(ScheduleError::invalid(format!(
                    "`{raw}` has more than one start time"
                )));
            }
            start = Some(parse_start(part)?);
        }
    }
    let interval_secs = interval_secs
        .ok_or_else(|| ScheduleError::invalid(format!("`{raw}` has no duration part")))?;
    Ok(IsoInterval {
        interval_secs,
        start,
        recurrences,
    })
}

fn parse_start(raw: &str) -> Result<DateTime<Utc>, ScheduleError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| ScheduleError::invalid(format!("invalid start time `{raw}`")))
}

fn parse_duration(raw: &str) -> Result<u64, ScheduleError> {
    let invalid = || ScheduleError::invalid(format!("invalid duration `{raw}`"));
    let body = raw.strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut in_time = false;
    for ch in body.chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            'T' if !in_time && digits.is_empty() => in_time = true,
            unit => {
                let value: u64 = digits.parse().map_err(|_| invalid())?;
                digits.clear();
                let seconds = match (in_time, unit) {
                    (false, 'W') => 7 * 24 * 3600,
                    (false, 'D') => 24 * 3600,
                    (true, 'H') => 3600,
                    (true, 'M') => 60,
                    (true, 'S') => 1,
                    (false, 'Y') | (false, 'M') => {
                        return Err(ScheduleError::invalid(format!(
                            "calendar units are not supported in `{raw}`"
                        )))
                    }
                    _ => return Err(invalid()),
                };
                total = value
                    .checked_mul(seconds)
                    .and_then(|part| total.checked_add(part))
                    .ok_or_else(invalid)?;
            }
        }
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    if total == 0 {
        return Err(ScheduleError::invalid("interval must be at least one second"));
    }
    if total > MAX_INTERVAL_SECS {
        return Err(ScheduleError::invalid(format!(
            "interval must be <= {MAX_INTERVAL_SECS} seconds"
        )));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_recurrence_start_and_duration() {
        let parsed = parse_iso8601_interval("R3/2012-01-01T00:00:00Z/PT1H").expect("parse");
        assert_eq!(parsed.interval_secs, 3600);
        assert_eq!(parsed.recurrences, Some(3));
        assert_eq!(
            parsed.start,
            Some(Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).single().expect("date"))
        );
    }

    #[test]
    fn parses_bare_and_mixed_durations() {
        assert_eq!(parse_iso8601_interval("PT30M").expect("parse").interval_secs, 1800);
        assert_eq!(
            parse_iso8601_interval("P1DT12H").expect("parse").interval_secs,
            36 * 3600
        );
        assert_eq!(parse_iso8601_interval("P2W").expect("parse").interval_secs, 14 * 86400);
        let naive = parse_iso8601_interval("2020-06-01T12:00:00/PT5S").expect("naive start");
        assert!(naive.start.is_some());
        assert_eq!(naive.recurrences, None);
    }

    #[test]
    fn rejects_malformed_input() {
        for raw in ["", "R3", "PT", "P1M", "PT0S", "R0/PT1H", "PT1H/PT2H", "yesterday/PT1H", "P1H"] {
            let err = parse_iso8601_interval(raw).expect_err(raw);
            assert!(matches!(err, ScheduleError::InvalidSchedule(_)), "{raw}");
        }
    }
}

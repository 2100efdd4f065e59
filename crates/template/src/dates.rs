//! Date resolution and formatting for the `formatDate` helper.
//!
//! Phrases are resolved against an explicit `now`; patterns use moment-style
//! tokens (`YYYY-MM-DD`), which is how digest authors write them.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::RenderError;

/// Tokens recognised in a format pattern, longest first so `MMMM` wins over `MM`.
const TOKENS: &[&str] = &[
    "YYYY", "YY", "MMMM", "MMM", "MM", "M", "DD", "D", "dddd", "ddd", "HH", "H", "hh", "h", "mm",
    "ss", "A", "a",
];

/// Resolve a relative phrase ("2 days ago", "in 1 week", "yesterday") or an
/// absolute date string against `now`.
pub fn resolve(phrase: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, RenderError> {
    let normalized = phrase.trim().to_lowercase();

    match normalized.as_str() {
        "now" | "today" => return Ok(now),
        "yesterday" => return Ok(now - Duration::days(1)),
        "tomorrow" => return Ok(now + Duration::days(1)),
        _ => {}
    }

    if let Some(resolved) = resolve_relative(&normalized, now)? {
        return Ok(resolved);
    }

    parse_absolute(phrase.trim()).ok_or_else(|| {
        RenderError::Helper(format!("formatDate: cannot interpret date '{}'", phrase))
    })
}

fn resolve_relative(
    phrase: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RenderError> {
    let words: Vec<&str> = phrase.split_whitespace().collect();

    let (amount, unit, past) = match words.as_slice() {
        [n, unit, "ago"] => (*n, *unit, true),
        ["in", n, unit] => (*n, *unit, false),
        [n, unit, "from", "now"] => (*n, *unit, false),
        _ => return Ok(None),
    };

    let amount: u32 = match amount {
        "a" | "an" | "one" => 1,
        n => match n.parse() {
            Ok(n) => n,
            Err(_) => return Ok(None),
        },
    };

    let shifted = match unit.trim_end_matches('s') {
        "second" | "sec" => shift(now, Duration::seconds(amount.into()), past),
        "minute" | "min" => shift(now, Duration::minutes(amount.into()), past),
        "hour" => shift(now, Duration::hours(amount.into()), past),
        "day" => shift(now, Duration::days(amount.into()), past),
        "week" => shift(now, Duration::weeks(amount.into()), past),
        "month" => shift_months(now, amount, past),
        "year" => shift_months(now, amount.saturating_mul(12), past),
        other => {
            return Err(RenderError::Helper(format!(
                "formatDate: unknown time unit '{}'",
                other
            )));
        }
    };

    shifted.map(Some).ok_or_else(|| {
        RenderError::Helper(format!("formatDate: '{}' is out of range", phrase))
    })
}

fn shift(now: DateTime<Utc>, by: Duration, past: bool) -> Option<DateTime<Utc>> {
    if past {
        now.checked_sub_signed(by)
    } else {
        now.checked_add_signed(by)
    }
}

fn shift_months(now: DateTime<Utc>, months: u32, past: bool) -> Option<DateTime<Utc>> {
    if past {
        now.checked_sub_months(Months::new(months))
    } else {
        now.checked_add_months(Months::new(months))
    }
}

fn parse_absolute(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Format `date` using a moment-style pattern.
///
/// Text inside `[...]` is emitted literally; unknown characters pass through.
pub fn format(date: DateTime<Utc>, pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;

    while let Some(c) = rest.chars().next() {
        if c == '[' {
            match rest.find(']') {
                Some(end) => {
                    out.push_str(&rest[1..end]);
                    rest = &rest[end + 1..];
                }
                None => {
                    out.push_str(&rest[1..]);
                    rest = "";
                }
            }
            continue;
        }

        match TOKENS.iter().find(|t| rest.starts_with(**t)) {
            Some(token) => {
                out.push_str(&format_token(date, token));
                rest = &rest[token.len()..];
            }
            None => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }

    out
}

fn format_token(date: DateTime<Utc>, token: &str) -> String {
    match token {
        "YYYY" => format!("{:04}", date.year()),
        "YY" => format!("{:02}", date.year().rem_euclid(100)),
        "MMMM" => date.format("%B").to_string(),
        "MMM" => date.format("%b").to_string(),
        "MM" => format!("{:02}", date.month()),
        "M" => date.month().to_string(),
        "DD" => format!("{:02}", date.day()),
        "D" => date.day().to_string(),
        "dddd" => date.format("%A").to_string(),
        "ddd" => date.format("%a").to_string(),
        "HH" => format!("{:02}", date.hour()),
        "H" => date.hour().to_string(),
        "hh" => format!("{:02}", date.hour12().1),
        "h" => date.hour12().1.to_string(),
        "mm" => format!("{:02}", date.minute()),
        "ss" => format!("{:02}", date.second()),
        "A" => if date.hour12().0 { "PM" } else { "AM" }.to_string(),
        "a" => if date.hour12().0 { "pm" } else { "am" }.to_string(),
        _ => token.to_string(),
    }
}

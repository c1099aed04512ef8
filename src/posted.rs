use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use std::sync::LazyLock;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

static UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:(?P<minute>minutos?|minutes?|mins?)|(?P<hour>horas?|hours?|hrs?)|(?P<day>d[ií]as?|days?)|(?P<week>semanas?|weeks?)|(?P<month>mes|meses|months?))\b",
    )
    .expect("valid regex")
});

/// Resolve phrases like "hace 3 días", "2 weeks ago" or "Reposted 5 hours ago"
/// against `now`. Text without a recognised unit resolves to `now`; text with a
/// unit but no number, or an amount too large to subtract, yields `None`.
pub fn resolve_relative(text: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let lower = text.to_lowercase();
    let Some(unit) = UNIT.captures(&lower) else {
        return Some(now);
    };
    let amount: i64 = NUMBER.find(&lower)?.as_str().parse().ok()?;

    let offset = if unit.name("minute").is_some() {
        Duration::try_minutes(amount)
    } else if unit.name("hour").is_some() {
        Duration::try_hours(amount)
    } else if unit.name("day").is_some() {
        Duration::try_days(amount)
    } else if unit.name("week").is_some() {
        Duration::try_weeks(amount)
    } else {
        amount.checked_mul(30).and_then(Duration::try_days)
    }?;
    now.checked_sub_signed(offset)
}

/// Same as [`resolve_relative`], formatted as `YYYY-MM-DD`.
pub fn resolve_date(text: &str, now: NaiveDateTime) -> Option<String> {
    resolve_relative(text, now).map(|t| t.format("%Y-%m-%d").to_string())
}

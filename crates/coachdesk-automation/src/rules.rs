//! Automation rule definitions: the core data model for scheduled sends.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use coachdesk_core::error::{CoachDeskError, Result};
use serde::{Deserialize, Serialize};

/// An automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    /// Unique rule ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What condition makes a recipient eligible.
    pub trigger: Trigger,
    /// Template reference handed to the renderer.
    pub template: String,
    /// Local time-of-day interval during which scheduled sends are allowed.
    pub window: SendWindow,
    /// Maximum sends per recipient per local calendar day.
    pub max_per_day: u32,
    /// Inactive rules are ignored by the sweep.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Trigger condition. Offsets are unsigned: every kind's offset points in a
/// single direction (before a session, after a due date, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Session starts in `hours_before` hours.
    SessionUpcoming { hours_before: u32 },
    /// Unpaid charge due in exactly `days_before` days.
    PaymentDue { days_before: u32 },
    /// Unpaid charge at least `days_after` days past due.
    PaymentOverdue { days_after: u32 },
    /// Today is the recipient's birthday.
    Birthday,
    /// No activity for at least `days` days.
    Inactivity { days: u32 },
    /// `hours_after` hours have passed since the recipient joined.
    Welcome { hours_after: u32 },
    /// A fixed calendar date, for every eligible recipient.
    CalendarDate { date: NaiveDate },
}

impl Trigger {
    /// Short tag used in logs and reports.
    pub fn tag(&self) -> &'static str {
        match self {
            Trigger::SessionUpcoming { .. } => "session_upcoming",
            Trigger::PaymentDue { .. } => "payment_due",
            Trigger::PaymentOverdue { .. } => "payment_overdue",
            Trigger::Birthday => "birthday",
            Trigger::Inactivity { .. } => "inactivity",
            Trigger::Welcome { .. } => "welcome",
            Trigger::CalendarDate { .. } => "calendar_date",
        }
    }
}

/// Half-open local time-of-day window `[start, end)`. No overnight wraparound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow", into = "RawWindow")]
pub struct SendWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl SendWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self> {
        if start > end {
            return Err(CoachDeskError::Config(format!(
                "send window start {start} is after end {end} (overnight windows are not supported)"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse "HH:MM" (or "HH:MM:SS") bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Self::new(parse_time(start)?, parse_time(end)?)
    }

    /// The whole local day.
    pub fn all_day() -> Self {
        Self { start: NaiveTime::MIN, end: end_of_day() }
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

/// Last representable instant of a day; written as "24:00".
fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN)
}

pub(crate) fn parse_time(s: &str) -> Result<NaiveTime> {
    if s == "24:00" {
        return Ok(end_of_day());
    }
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| CoachDeskError::Config(format!("Invalid time '{s}': {e}")))
}

pub(crate) fn format_time(t: NaiveTime) -> String {
    if t == end_of_day() {
        "24:00".to_string()
    } else if t.second() == 0 && t.nanosecond() == 0 {
        t.format("%H:%M").to_string()
    } else {
        t.format("%H:%M:%S").to_string()
    }
}

#[derive(Serialize, Deserialize)]
struct RawWindow {
    start: String,
    end: String,
}

impl TryFrom<RawWindow> for SendWindow {
    type Error = CoachDeskError;

    fn try_from(raw: RawWindow) -> Result<Self> {
        Self::parse(&raw.start, &raw.end)
    }
}

impl From<SendWindow> for RawWindow {
    fn from(w: SendWindow) -> Self {
        Self {
            start: format_time(w.start),
            end: format_time(w.end),
        }
    }
}

impl AutomationRule {
    /// Create a new active rule.
    pub fn new(id: &str, name: &str, trigger: Trigger, template: &str, window: SendWindow, max_per_day: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            trigger,
            template: template.to_string(),
            window,
            max_per_day,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Check the invariants the sweep relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_per_day == 0 {
            return Err(CoachDeskError::Config(format!(
                "rule '{}' has max_per_day = 0",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_window_is_half_open() {
        let w = SendWindow::parse("08:00", "20:00").unwrap();
        assert!(w.contains(t(8, 0)));
        assert!(w.contains(t(19, 59)));
        assert!(!w.contains(t(20, 0)));
        assert!(!w.contains(t(7, 59)));
    }

    #[test]
    fn test_overnight_window_rejected() {
        assert!(SendWindow::parse("22:00", "06:00").is_err());
    }

    #[test]
    fn test_empty_window_never_open() {
        let w = SendWindow::parse("09:00", "09:00").unwrap();
        assert!(!w.contains(t(9, 0)));
    }

    #[test]
    fn test_all_day_window() {
        let w = SendWindow::all_day();
        assert!(w.contains(t(0, 0)));
        assert!(w.contains(NaiveTime::from_hms_opt(23, 59, 59).unwrap()));
        assert_eq!(format_time(w.end()), "24:00");
        assert_eq!(SendWindow::parse("00:00", "24:00").unwrap(), w);
    }

    #[test]
    fn test_trigger_serde_tagged() {
        let json = serde_json::to_value(Trigger::SessionUpcoming { hours_before: 24 }).unwrap();
        assert_eq!(json["kind"], "session_upcoming");
        assert_eq!(json["hours_before"], 24);

        let parsed: Trigger = serde_json::from_str(r#"{"kind":"birthday"}"#).unwrap();
        assert_eq!(parsed, Trigger::Birthday);
    }

    #[test]
    fn test_window_serde_uses_clock_strings() {
        let w = SendWindow::parse("08:00", "20:30").unwrap();
        let json = serde_json::to_value(w).unwrap();
        assert_eq!(json["start"], "08:00");
        assert_eq!(json["end"], "20:30");
        assert!(serde_json::from_str::<SendWindow>(r#"{"start":"21:00","end":"08:00"}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let rule = AutomationRule::new("r1", "noop", Trigger::Birthday, "tpl", SendWindow::all_day(), 0);
        assert!(rule.validate().is_err());
    }
}

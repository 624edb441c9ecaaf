//! Recipients and the occasions that make a rule fire for them.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A directory entry that can receive notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    /// Channel address: chat id, phone number, webhook user key.
    pub address: String,
    /// Marketing/notification consent. Never bypassed.
    pub consent: bool,
    pub status: RecipientStatus,
    /// Wall-clock zone used for send windows and calendar days.
    pub timezone: Tz,
    pub birth_date: Option<NaiveDate>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Active,
    Paused,
    Archived,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Active => "active",
            RecipientStatus::Paused => "paused",
            RecipientStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RecipientStatus::Active),
            "paused" => Some(RecipientStatus::Paused),
            "archived" => Some(RecipientStatus::Archived),
            _ => None,
        }
    }
}

impl Recipient {
    /// Create an active, consenting recipient.
    pub fn new(id: &str, name: &str, address: &str, timezone: Tz) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            consent: true,
            status: RecipientStatus::Active,
            timezone,
            birth_date: None,
            last_activity_at: None,
            joined_at: Utc::now(),
        }
    }

    /// Scheduled dispatch needs consent and an active lifecycle status.
    pub fn eligible_for_scheduled(&self) -> bool {
        self.consent && self.status == RecipientStatus::Active
    }

    /// Local calendar day at `now`.
    pub fn local_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }
}

/// The specific event instance a trigger matched. Derived, never stored;
/// only its `key` ends up in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occasion {
    pub key: String,
    /// Human-readable description for templates.
    pub label: String,
    /// When the underlying event happens, if it has a point in time.
    pub at: Option<DateTime<Utc>>,
}

impl Occasion {
    pub fn session(session: &Session) -> Self {
        Self {
            key: format!("session:{}", session.id),
            label: session.title.clone(),
            at: Some(session.starts_at),
        }
    }

    pub fn charge(charge: &Charge) -> Self {
        Self {
            key: format!("charge:{}", charge.id),
            label: charge.description.clone(),
            at: charge.due_on.and_hms_opt(0, 0, 0).map(|d| d.and_utc()),
        }
    }

    pub fn birthday(day: NaiveDate) -> Self {
        Self {
            key: format!("birthday:{day}"),
            label: "birthday".into(),
            at: None,
        }
    }

    pub fn inactivity(since: DateTime<Utc>) -> Self {
        Self {
            key: format!("inactivity:{}", since.date_naive()),
            label: "inactivity".into(),
            at: Some(since),
        }
    }

    pub fn welcome(joined_at: DateTime<Utc>) -> Self {
        Self {
            key: "welcome".into(),
            label: "welcome".into(),
            at: Some(joined_at),
        }
    }

    pub fn calendar(date: NaiveDate) -> Self {
        Self {
            key: format!("date:{date}"),
            label: date.to_string(),
            at: None,
        }
    }

    /// A one-off operator request.
    pub fn manual(request_id: &str) -> Self {
        Self {
            key: format!("manual:{request_id}"),
            label: "manual".into(),
            at: None,
        }
    }
}

/// A scheduled session from the bookings directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub recipient_id: String,
    pub starts_at: DateTime<Utc>,
    pub title: String,
}

/// A charge from the billing directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub recipient_id: String,
    pub due_on: NaiveDate,
    pub amount_cents: i64,
    pub paid: bool,
    pub description: String,
}

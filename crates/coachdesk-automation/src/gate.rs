//! Window & cap gate.
//!
//! The window check is a pure function of the rule, the recipient's zone and
//! `now`. Cap and duplicate checks are not done here with a separate read:
//! they are the ledger's atomic reservation, so two concurrent gates can
//! never both admit past the cap.

use chrono::{DateTime, Utc};
use coachdesk_core::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::ledger::{Denial, DispatchKey, DispatchLedger, Reservation};
use crate::recipient::{Occasion, Recipient};
use crate::rules::AutomationRule;

/// Why a candidate was not dispatched. Expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRejection {
    OutsideWindow,
    CapExceeded,
    Duplicate,
    NoConsent,
    UnknownRecipient,
}

impl From<Denial> for GateRejection {
    fn from(d: Denial) -> Self {
        match d {
            Denial::Duplicate => GateRejection::Duplicate,
            Denial::CapExceeded => GateRejection::CapExceeded,
        }
    }
}

impl std::fmt::Display for GateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateRejection::OutsideWindow => write!(f, "outside-window"),
            GateRejection::CapExceeded => write!(f, "cap-exceeded"),
            GateRejection::Duplicate => write!(f, "duplicate"),
            GateRejection::NoConsent => write!(f, "no-consent"),
            GateRejection::UnknownRecipient => write!(f, "unknown-recipient"),
        }
    }
}

/// Scheduled sends honour the send window; manual sends skip it because an
/// operator asked for "now". Both enforce consent and the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Scheduled,
    Manual,
}

/// Gate decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A `reserved` ledger record now exists for `key`.
    Admitted { record_id: i64, key: DispatchKey },
    Rejected(GateRejection),
}

/// Is `now` inside the rule's window on the recipient's wall clock?
pub fn in_window(rule: &AutomationRule, recipient: &Recipient, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&recipient.timezone).time();
    rule.window.contains(local)
}

/// Build the dispatch key; the day is the recipient's local day at `now`.
pub fn dispatch_key(
    rule: &AutomationRule,
    recipient: &Recipient,
    occasion: &Occasion,
    now: DateTime<Utc>,
) -> DispatchKey {
    DispatchKey {
        rule_id: rule.id.clone(),
        recipient_id: recipient.id.clone(),
        occasion_key: occasion.key.clone(),
        day: recipient.local_day(now),
    }
}

pub struct Gate {
    ledger: Arc<dyn DispatchLedger>,
}

impl Gate {
    pub fn new(ledger: Arc<dyn DispatchLedger>) -> Self {
        Self { ledger }
    }

    /// Run all checks and, if they pass, reserve the ledger slot.
    /// Rejected candidates leave no ledger record.
    pub async fn admit(
        &self,
        rule: &AutomationRule,
        recipient: &Recipient,
        occasion: &Occasion,
        now: DateTime<Utc>,
        mode: GateMode,
    ) -> Result<Admission> {
        if !recipient.consent {
            return Ok(Admission::Rejected(GateRejection::NoConsent));
        }
        if mode == GateMode::Scheduled && !in_window(rule, recipient, now) {
            return Ok(Admission::Rejected(GateRejection::OutsideWindow));
        }

        let key = dispatch_key(rule, recipient, occasion, now);
        match self.ledger.reserve(&key, rule.max_per_day).await? {
            Reservation::Granted(record_id) => Ok(Admission::Admitted { record_id, key }),
            Reservation::Denied(denial) => Ok(Admission::Rejected(denial.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SqliteLedger;
    use crate::rules::{SendWindow, Trigger};
    use chrono::TimeZone;

    fn rule(max_per_day: u32) -> AutomationRule {
        AutomationRule::new(
            "r1",
            "Reminder",
            Trigger::SessionUpcoming { hours_before: 24 },
            "tpl",
            SendWindow::parse("08:00", "20:00").unwrap(),
            max_per_day,
        )
    }

    #[test]
    fn test_window_uses_recipient_local_time() {
        let rule = rule(1);
        let ny = Recipient::new("c1", "Ana", "chat-1", chrono_tz::America::New_York);
        let utc = Recipient::new("c2", "Ben", "chat-2", chrono_tz::UTC);
        // 13:00 UTC = 09:00 in New York (EDT).
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 13, 0, 0).unwrap();
        assert!(in_window(&rule, &ny, now));
        assert!(in_window(&rule, &utc, now));

        // 02:00 UTC = 22:00 the previous evening in New York.
        let night = Utc.with_ymd_and_hms(2026, 6, 1, 2, 0, 0).unwrap();
        assert!(!in_window(&rule, &ny, night));
    }

    #[test]
    fn test_key_day_is_local() {
        let rule = rule(1);
        let tokyo = Recipient::new("c1", "Ana", "chat-1", chrono_tz::Asia::Tokyo);
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 20, 0, 0).unwrap();
        let key = dispatch_key(&rule, &tokyo, &Occasion::birthday(tokyo.local_day(now)), now);
        assert_eq!(key.day.to_string(), "2026-06-02");
        assert_eq!(key.occasion_key, "birthday:2026-06-02");
    }

    #[tokio::test]
    async fn test_outside_window_leaves_no_record() {
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let gate = Gate::new(ledger.clone());
        let rule = rule(1);
        let r = Recipient::new("c1", "Ana", "chat-1", chrono_tz::UTC);
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 21, 0, 0).unwrap();

        let decision = gate.admit(&rule, &r, &Occasion::manual("x"), now, GateMode::Scheduled).await.unwrap();
        assert_eq!(decision, Admission::Rejected(GateRejection::OutsideWindow));
        assert!(ledger.records_for("r1", "c1").await.unwrap().is_empty());

        // Manual mode ignores the window.
        let decision = gate.admit(&rule, &r, &Occasion::manual("x"), now, GateMode::Manual).await.unwrap();
        assert!(matches!(decision, Admission::Admitted { .. }));
    }

    #[tokio::test]
    async fn test_consent_never_bypassed() {
        let gate = Gate::new(Arc::new(SqliteLedger::open_in_memory().unwrap()));
        let mut r = Recipient::new("c1", "Ana", "chat-1", chrono_tz::UTC);
        r.consent = false;
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let decision = gate.admit(&rule(1), &r, &Occasion::manual("x"), now, GateMode::Manual).await.unwrap();
        assert_eq!(decision, Admission::Rejected(GateRejection::NoConsent));
    }

    #[tokio::test]
    async fn test_cap_and_duplicate_from_ledger() {
        let gate = Gate::new(Arc::new(SqliteLedger::open_in_memory().unwrap()));
        let rule = rule(1);
        let r = Recipient::new("c1", "Ana", "chat-1", chrono_tz::UTC);
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();

        let first = gate.admit(&rule, &r, &Occasion::manual("a"), now, GateMode::Scheduled).await.unwrap();
        assert!(matches!(first, Admission::Admitted { .. }));
        let again = gate.admit(&rule, &r, &Occasion::manual("a"), now, GateMode::Scheduled).await.unwrap();
        assert_eq!(again, Admission::Rejected(GateRejection::Duplicate));
        let other = gate.admit(&rule, &r, &Occasion::manual("b"), now, GateMode::Scheduled).await.unwrap();
        assert_eq!(other, Admission::Rejected(GateRejection::CapExceeded));
    }
}

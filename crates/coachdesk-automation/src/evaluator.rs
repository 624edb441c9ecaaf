//! Eligibility evaluator: which (recipient, occasion) pairs satisfy a rule now.
//!
//! Read + filter only, no side effects. Day-based triggers are judged on the
//! recipient's local calendar, so directory queries are widened by a day on
//! each side of the UTC date and narrowed per recipient afterwards.
//! Threshold-crossing triggers (sessions, welcome) look back over a window
//! that normally starts at the previous sweep, so each sweep only sees newly
//! matching occasions and a delayed sweep still covers the gap.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use coachdesk_core::error::{CoachDeskError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::directory::RecipientDirectory;
use crate::recipient::{Occasion, Recipient};
use crate::rules::{AutomationRule, Trigger};

/// A recipient + occasion that currently matches a rule.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub recipient: Recipient,
    pub occasion: Occasion,
}

pub struct Evaluator {
    recipients: Arc<dyn RecipientDirectory>,
    /// Default look-back for threshold-crossing triggers; equals the sweep interval.
    tolerance: Duration,
}

impl Evaluator {
    pub fn new(recipients: Arc<dyn RecipientDirectory>, tolerance: Duration) -> Self {
        Self { recipients, tolerance }
    }

    /// Candidates for `rule` at `now`, scheduled-eligible recipients only.
    pub async fn evaluate(&self, rule: &AutomationRule, now: DateTime<Utc>) -> Result<Vec<Candidate>> {
        self.evaluate_with_lookback(rule, now, self.tolerance).await
    }

    /// Like `evaluate`, with threshold triggers matching crossings inside
    /// `[now - lookback, now]`. Offsets that leave chrono's range are a
    /// config error for this rule.
    pub async fn evaluate_with_lookback(
        &self,
        rule: &AutomationRule,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<Candidate>> {
        let utc_today = now.date_naive();
        let pairs: Vec<(Recipient, Occasion)> = match &rule.trigger {
            Trigger::SessionUpcoming { hours_before } => {
                let target = offset(rule, now, Duration::hours(i64::from(*hours_before)))?;
                // A long look-back stops at sessions that have already started.
                let floor = now.min(offset(rule, target, -self.tolerance)?);
                let from = offset(rule, target, -lookback)?.max(floor);
                self.recipients
                    .sessions_starting_between(from, target)
                    .await?
                    .into_iter()
                    .map(|(r, s)| {
                        let occasion = Occasion::session(&s);
                        (r, occasion)
                    })
                    .collect()
            }
            Trigger::PaymentDue { days_before } => {
                let d = i64::from(*days_before);
                let (from, to) = (shift_checked(rule, utc_today, d - 1)?, shift_checked(rule, utc_today, d + 1)?);
                self.recipients
                    .unpaid_charges_due_between(Some(from), to)
                    .await?
                    .into_iter()
                    .filter(|(r, c)| c.due_on == shift(r.local_day(now), d))
                    .map(|(r, c)| {
                        let occasion = Occasion::charge(&c);
                        (r, occasion)
                    })
                    .collect()
            }
            Trigger::PaymentOverdue { days_after } => {
                let d = i64::from(*days_after);
                let to = shift_checked(rule, utc_today, 1 - d)?;
                self.recipients
                    .unpaid_charges_due_between(None, to)
                    .await?
                    .into_iter()
                    .filter(|(r, c)| {
                        let today = r.local_day(now);
                        c.due_on < today && c.due_on <= shift(today, -d)
                    })
                    .map(|(r, c)| {
                        let occasion = Occasion::charge(&c);
                        (r, occasion)
                    })
                    .collect()
            }
            Trigger::Birthday => self
                .birthday_pool(utc_today)
                .await?
                .into_iter()
                .filter_map(|r| {
                    let today = r.local_day(now);
                    let dob = r.birth_date?;
                    birthday_matches(dob, today).then(|| (r, Occasion::birthday(today)))
                })
                .collect(),
            Trigger::Inactivity { days } => self
                .recipients
                .inactive_since(offset(rule, now, -Duration::days(i64::from(*days)))?)
                .await?
                .into_iter()
                .map(|r| {
                    let since = r.last_activity_at.unwrap_or(r.joined_at);
                    (r, Occasion::inactivity(since))
                })
                .collect(),
            Trigger::Welcome { hours_after } => {
                let threshold = offset(rule, now, -Duration::hours(i64::from(*hours_after)))?;
                self.recipients
                    .joined_between(offset(rule, threshold, -lookback)?, threshold)
                    .await?
                    .into_iter()
                    .map(|r| {
                        let occasion = Occasion::welcome(r.joined_at);
                        (r, occasion)
                    })
                    .collect()
            }
            Trigger::CalendarDate { date } => self
                .recipients
                .all_recipients()
                .await?
                .into_iter()
                .filter(|r| r.local_day(now) == *date)
                .map(|r| (r, Occasion::calendar(*date)))
                .collect(),
        };

        Ok(pairs
            .into_iter()
            .filter(|(r, _)| r.eligible_for_scheduled())
            .map(|(recipient, occasion)| Candidate { recipient, occasion })
            .collect())
    }

    /// Recipients whose birthday falls on any local "today" reachable from
    /// `utc_today`, deduplicated by id.
    async fn birthday_pool(&self, utc_today: NaiveDate) -> Result<Vec<Recipient>> {
        let mut days = Vec::new();
        for offset in -1..=1 {
            let d = shift(utc_today, offset);
            days.push((d.month(), d.day()));
            if d.month() == 2 && d.day() == 28 && !is_leap_year(d.year()) {
                days.push((2, 29));
            }
        }
        days.dedup();

        let mut pool = BTreeMap::new();
        for (month, day) in days {
            for r in self.recipients.recipients_with_birthday(month, day).await? {
                pool.entry(r.id.clone()).or_insert(r);
            }
        }
        Ok(pool.into_values().collect())
    }
}

/// 29 February birthdays are observed on 28 February in non-leap years.
fn birthday_matches(dob: NaiveDate, today: NaiveDate) -> bool {
    if dob.month() == today.month() && dob.day() == today.day() {
        return true;
    }
    dob.month() == 2 && dob.day() == 29 && today.month() == 2 && today.day() == 28 && !is_leap_year(today.year())
}

fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

fn offset(rule: &AutomationRule, at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(by)
        .ok_or_else(|| CoachDeskError::Config(format!("rule '{}': trigger offset out of range", rule.id)))
}

fn shift_checked(rule: &AutomationRule, date: NaiveDate, days: i64) -> Result<NaiveDate> {
    Duration::try_days(days)
        .and_then(|d| date.checked_add_signed(d))
        .ok_or_else(|| CoachDeskError::Config(format!("rule '{}': trigger offset out of range", rule.id)))
}

/// Only called with offsets already range-checked against a neighbouring day.
fn shift(date: NaiveDate, days: i64) -> NaiveDate {
    date.checked_add_signed(Duration::days(days)).unwrap_or(date)
}

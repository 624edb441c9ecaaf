//! Message templates.
//!
//! Rendering is a pure function of (template, recipient, occasion).
//! Supported placeholders: `{{recipient.name}}`, `{{recipient.id}}`,
//! `{{occasion.label}}`, `{{occasion.date}}`, `{{occasion.time}}`.
//! Dates and times are shown in the recipient's zone.

use coachdesk_core::config::TemplateConfig;
use coachdesk_core::error::{CoachDeskError, Result};
use std::collections::BTreeMap;

use crate::channel::RenderedMessage;
use crate::recipient::{Occasion, Recipient};

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template_ref: &str, recipient: &Recipient, occasion: &Occasion) -> Result<RenderedMessage>;
}

/// Config-backed template set.
#[derive(Debug, Clone, Default)]
pub struct TemplateBook {
    templates: BTreeMap<String, TemplateConfig>,
}

impl TemplateBook {
    pub fn new(templates: BTreeMap<String, TemplateConfig>) -> Self {
        Self { templates }
    }

    pub fn insert(&mut self, template_ref: &str, subject: &str, body: &str) {
        self.templates.insert(
            template_ref.to_string(),
            TemplateConfig { subject: subject.to_string(), body: body.to_string() },
        );
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateRenderer for TemplateBook {
    fn render(&self, template_ref: &str, recipient: &Recipient, occasion: &Occasion) -> Result<RenderedMessage> {
        let tpl = self
            .templates
            .get(template_ref)
            .ok_or_else(|| CoachDeskError::Template(format!("Unknown template: {template_ref}")))?;
        Ok(RenderedMessage {
            subject: interpolate(&tpl.subject, recipient, occasion),
            body: interpolate(&tpl.body, recipient, occasion),
        })
    }
}

fn interpolate(text: &str, recipient: &Recipient, occasion: &Occasion) -> String {
    let local = occasion.at.map(|at| at.with_timezone(&recipient.timezone));
    let date = local.map(|t| t.format("%Y-%m-%d").to_string()).unwrap_or_default();
    let time = local.map(|t| t.format("%H:%M").to_string()).unwrap_or_default();

    text.replace("{{recipient.name}}", &recipient.name)
        .replace("{{recipient.id}}", &recipient.id)
        .replace("{{occasion.label}}", &occasion.label)
        .replace("{{occasion.date}}", &date)
        .replace("{{occasion.time}}", &time)
}

/// Renders ad-hoc bulk messages: the body is the template.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InlineTemplate<'a> {
    pub subject: &'a str,
    pub body: &'a str,
}

impl InlineTemplate<'_> {
    pub fn render(&self, recipient: &Recipient, occasion: &Occasion) -> RenderedMessage {
        RenderedMessage {
            subject: interpolate(self.subject, recipient, occasion),
            body: interpolate(self.body, recipient, occasion),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient::Session;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_render_session_reminder_in_local_time() {
        let mut book = TemplateBook::default();
        book.insert(
            "session-reminder",
            "Session {{occasion.date}}",
            "Hi {{recipient.name}}, {{occasion.label}} starts at {{occasion.time}}.",
        );
        let r = Recipient::new("c1", "Ana", "chat-1", chrono_tz::Europe::Berlin);
        let session = Session {
            id: "s1".into(),
            recipient_id: "c1".into(),
            starts_at: Utc.with_ymd_and_hms(2026, 6, 2, 7, 0, 0).unwrap(),
            title: "PT session".into(),
        };
        let msg = book.render("session-reminder", &r, &Occasion::session(&session)).unwrap();
        assert_eq!(msg.subject, "Session 2026-06-02");
        // Berlin is UTC+2 in June.
        assert_eq!(msg.body, "Hi Ana, PT session starts at 09:00.");
    }

    #[test]
    fn test_unknown_template_is_error() {
        let book = TemplateBook::default();
        let r = Recipient::new("c1", "Ana", "chat-1", chrono_tz::UTC);
        let err = book.render("missing", &r, &Occasion::manual("x")).unwrap_err();
        assert!(matches!(err, CoachDeskError::Template(_)));
    }

    #[test]
    fn test_inline_template() {
        let r = Recipient::new("c7", "Sam", "chat-7", chrono_tz::UTC);
        let msg = InlineTemplate { subject: "Gym closed", body: "Sorry {{recipient.name}}!" }
            .render(&r, &Occasion::manual("b1"));
        assert_eq!(msg.body, "Sorry Sam!");
    }
}

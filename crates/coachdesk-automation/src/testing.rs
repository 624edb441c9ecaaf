//! Test fixtures: a scripted channel and an in-memory engine harness.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelAdapter, ChannelError, ChannelErrorKind, RenderedMessage};
use crate::directory::SqliteDirectory;
use crate::ledger::SqliteLedger;
use crate::orchestrator::{DispatchSettings, Dispatcher};
use crate::recipient::Recipient;
use crate::rules::AutomationRule;
use crate::template::TemplateBook;

/// Channel whose behaviour per address is fixed up front.
#[derive(Default)]
pub struct ScriptedChannel {
    failing: HashMap<String, ChannelErrorKind>,
    hanging: HashSet<String>,
    cancel: Mutex<Option<CancellationToken>>,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<(String, RenderedMessage)>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, address: &str, kind: ChannelErrorKind) -> Self {
        self.failing.insert(address.to_string(), kind);
        self
    }

    /// Sends to `address` never complete.
    pub fn hang(mut self, address: &str) -> Self {
        self.hanging.insert(address.to_string());
        self
    }

    /// Cancel `token` during the first send.
    pub fn cancel_on_send(&self, token: CancellationToken) {
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = Some(token);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(String, RenderedMessage)> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel.lock().ok().and_then(|mut slot| slot.take()) {
            token.cancel();
        }
        if self.hanging.contains(address) {
            futures::future::pending::<()>().await;
        }
        match self.failing.get(address) {
            Some(kind) => Err(ChannelError { kind: *kind, detail: format!("scripted failure for {address}") }),
            None => {
                if let Ok(mut d) = self.delivered.lock() {
                    d.push((address.to_string(), message.clone()));
                }
                Ok(())
            }
        }
    }
}

/// A full dispatcher over in-memory SQLite and a scripted channel.
pub struct Harness {
    pub directory: Arc<SqliteDirectory>,
    pub ledger: Arc<SqliteLedger>,
    pub channel: Arc<ScriptedChannel>,
    pub templates: Arc<TemplateBook>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(channel: ScriptedChannel) -> Self {
        Self::with_settings(
            channel,
            DispatchSettings { tolerance: chrono::Duration::minutes(5), ..DispatchSettings::default() },
        )
    }

    pub fn with_settings(channel: ScriptedChannel, settings: DispatchSettings) -> Self {
        let directory = Arc::new(SqliteDirectory::open_in_memory().unwrap());
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let channel = Arc::new(channel);

        let mut book = TemplateBook::default();
        book.insert(
            "session-reminder",
            "Session {{occasion.date}}",
            "Hi {{recipient.name}}, {{occasion.label}} starts at {{occasion.time}}.",
        );
        book.insert("invoice", "Payment reminder", "Hi {{recipient.name}}, {{occasion.label}} is unpaid.");
        let templates = Arc::new(book);

        let dispatcher = Dispatcher::new(
            directory.clone(),
            directory.clone(),
            ledger.clone(),
            templates.clone(),
            channel.clone(),
            settings,
        );
        Self { directory, ledger, channel, templates, dispatcher }
    }

    /// Another dispatcher sharing this harness's stores and channel, as a
    /// second process would.
    pub fn second_dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.directory.clone(),
            self.directory.clone(),
            self.ledger.clone(),
            self.templates.clone(),
            self.channel.clone(),
            self.dispatcher.settings().clone(),
        )
    }

    pub fn add_rule(&self, rule: &AutomationRule) {
        self.directory.upsert_rule(rule).unwrap();
    }

    /// Active, consenting UTC recipient named after its id, address `chat-<id>`.
    pub fn add_recipient(&self, id: &str) -> Recipient {
        let r = Recipient::new(id, id, &format!("chat-{id}"), chrono_tz::UTC);
        self.directory.upsert_recipient(&r).unwrap();
        r
    }
}

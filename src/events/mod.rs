//! In-process event pipeline
//!
//! Every write through the manager emits a `before` event, which handlers
//! may mutate or veto, and an `after` event, which handlers only observe.
//! Channels are named `<table>.<operation>.<timing>`; handlers on the
//! wildcard channel `*` see every event after the specific channel's own.
//!
//! Dispatch is sequential in registration order. A failing handler never
//! stops its siblings. On a `before` channel the first failure is returned
//! as [`DataError::HandlerRejected`] and the write does not happen; on an
//! `after` channel failures are only logged.

pub mod triggers;

pub use triggers::install_default_triggers;

use crate::adapter::QueryResult;
use crate::error::{DataError, Result};
use crate::query::{Operation, Row, UniversalQuery};
use crate::security::User;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Timing {
    Before,
    After,
}

impl Display for Timing {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Timing::Before => write!(f, "before"),
            Timing::After => write!(f, "after"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseEvent {
    pub table: String,
    pub operation: Operation,
    pub timing: Timing,
    /// Outgoing payload; `before` handlers may rewrite it
    pub data: Option<Row>,
    /// Rows as they were before an update or delete
    pub old_data: Vec<Row>,
    /// Adapter result, set on `after` events
    pub result: Option<QueryResult>,
    pub user: User,
    pub timestamp: DateTime<Utc>,
}

impl DatabaseEvent {
    pub fn before(query: &UniversalQuery, user: &User, old_data: Vec<Row>) -> Self {
        Self {
            table: query.collection.clone(),
            operation: query.operation,
            timing: Timing::Before,
            data: query.data.clone(),
            old_data,
            result: None,
            user: user.clone(),
            timestamp: Utc::now(),
        }
    }

    /// The matching `after` event carrying the adapter's result
    pub fn into_after(mut self, result: QueryResult) -> Self {
        self.timing = Timing::After;
        self.result = Some(result);
        self.timestamp = Utc::now();
        self
    }

    pub fn channel(&self) -> String {
        channel(&self.table, self.operation, self.timing)
    }

    /// Rows the write touched: the result's rows, else the pre-image
    pub fn affected_rows(&self) -> &[Row] {
        match &self.result {
            Some(result) if !result.rows().is_empty() => result.rows(),
            _ => &self.old_data,
        }
    }
}

pub fn channel(table: &str, operation: Operation, timing: Timing) -> String {
    format!("{}.{}.{}", table, operation, timing)
}

/// A subscriber
///
/// Closures `Fn(&mut DatabaseEvent) -> anyhow::Result<()>` implement this
/// trait; handlers that need to await implement it directly.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &mut DatabaseEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&mut DatabaseEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &mut DatabaseEvent) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Subscribers = HashMap<String, Vec<(HandlerId, Arc<dyn EventHandler>)>>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Subscribers>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Subscribers> {
        self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Subscribers> {
        self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on(&self, channel: impl Into<String>, handler: impl EventHandler + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let channel = channel.into();
        debug!("subscribed handler {:?} to {}", id, channel);
        self.write()
            .entry(channel)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; false when it was not subscribed to `channel`
    pub fn off(&self, channel: &str, id: HandlerId) -> bool {
        let mut handlers = self.write();
        let Some(list) = handlers.get_mut(channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(channel);
        }
        removed
    }

    /// Whether an event on `channel` would reach any handler
    pub fn has_subscribers(&self, channel: &str) -> bool {
        let handlers = self.read();
        handlers.contains_key(channel) || handlers.contains_key(WILDCARD)
    }

    /// Channel handlers first, then wildcard handlers; cloned out of the lock
    fn subscribers(&self, channel: &str) -> Vec<(HandlerId, Arc<dyn EventHandler>)> {
        let handlers = self.read();
        let mut out = handlers.get(channel).cloned().unwrap_or_default();
        if channel != WILDCARD {
            out.extend(handlers.get(WILDCARD).cloned().unwrap_or_default());
        }
        out
    }

    /// Run `before` handlers; any failure vetoes the write
    pub async fn emit_before(&self, event: &mut DatabaseEvent) -> Result<()> {
        let channel = event.channel();
        let mut rejection = None;
        for (id, handler) in self.subscribers(&channel) {
            if let Err(e) = handler.handle(event).await {
                warn!("before handler {:?} on {} failed: {:#}", id, channel, e);
                rejection.get_or_insert_with(|| format!("{:#}", e));
            }
        }
        match rejection {
            Some(reason) => Err(DataError::HandlerRejected { channel, reason }),
            None => Ok(()),
        }
    }

    /// Run `after` handlers; failures are logged and swallowed
    ///
    /// Handlers receive a copy of the event; their edits are discarded.
    pub async fn emit_after(&self, event: &DatabaseEvent) {
        let channel = event.channel();
        for (id, handler) in self.subscribers(&channel) {
            let mut copy = event.clone();
            if let Err(e) = handler.handle(&mut copy).await {
                warn!("after handler {:?} on {} failed: {:#}", id, channel, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn update_event() -> DatabaseEvent {
        let query = UniversalQuery::update("projects", json!({"status": "closed"}).as_object().cloned().unwrap())
            .where_eq("id", "p1");
        DatabaseEvent::before(&query, &User::member("u1"), Vec::new())
    }

    #[test]
    fn test_channel_names() {
        let event = update_event();
        assert_eq!(event.channel(), "projects.update.before");
        let event = event.into_after(QueryResult::Affected { count: 0, rows: vec![] });
        assert_eq!(event.channel(), "projects.update.after");
    }

    #[tokio::test]
    async fn test_before_handlers_mutate_and_veto() {
        let bus = EventBus::new();
        bus.on("projects.update.before", |event: &mut DatabaseEvent| -> anyhow::Result<()> {
            if let Some(data) = event.data.as_mut() {
                data.insert("touched".to_string(), json!(true));
            }
            Ok(())
        });

        let mut event = update_event();
        bus.emit_before(&mut event).await.unwrap();
        assert_eq!(event.data.as_ref().unwrap()["touched"], json!(true));

        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        bus.on(WILDCARD, |_: &mut DatabaseEvent| -> anyhow::Result<()> { anyhow::bail!("closed projects are frozen") });
        bus.on(WILDCARD, move |_: &mut DatabaseEvent| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let err = bus.emit_before(&mut update_event()).await.unwrap_err();
        assert!(matches!(err, DataError::HandlerRejected { ref channel, .. } if channel == "projects.update.before"));
        // sibling after the failing handler still ran
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_after_failures_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.on("projects.update.after", |_: &mut DatabaseEvent| -> anyhow::Result<()> { anyhow::bail!("boom") });
        let log = seen.clone();
        bus.on(WILDCARD, move |event: &mut DatabaseEvent| -> anyhow::Result<()> {
            log.lock().unwrap().push(event.channel());
            Ok(())
        });

        let event = update_event().into_after(QueryResult::Affected { count: 1, rows: vec![] });
        bus.emit_after(&event).await;
        assert_eq!(*seen.lock().unwrap(), vec!["projects.update.after".to_string()]);
    }

    #[test]
    fn test_off_and_subscriber_checks() {
        let bus = EventBus::new();
        assert!(!bus.has_subscribers("projects.insert.after"));
        let id = bus.on("projects.insert.after", |_: &mut DatabaseEvent| -> anyhow::Result<()> { Ok(()) });
        assert!(bus.has_subscribers("projects.insert.after"));
        assert!(!bus.has_subscribers("profiles.insert.after"));
        assert!(bus.off("projects.insert.after", id));
        assert!(!bus.off("projects.insert.after", id));
        assert!(!bus.has_subscribers("projects.insert.after"));
    }
}

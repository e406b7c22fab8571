//! Asynchronous events and the ready-callback dispatcher.
//!
//! The connection's reader task hands every 650-coded reply here as a
//! [`RawEvent`]. The dispatcher cares about exactly one kind, a hidden
//! service descriptor upload confirmation, which means the service is
//! reachable, and logs the rest at decreasing severity without letting any
//! of them affect control flow.

use crate::protocol::Reply;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::conn::EventReceiver;

/// Event names subscribed for every session.
pub(crate) const BASE_EVENTS: &[&str] = &["CIRC", "WARN", "ERR"];

/// Additional names subscribed once hidden services come into play.
pub(crate) const HS_EVENTS: &[&str] = &[
    "CIRC",
    "ORCONN",
    "INFO",
    "NOTICE",
    "WARN",
    "ERR",
    "HS_DESC",
    "HS_DESC_CONTENT",
];

/// An unparsed asynchronous event: the leading keyword and the rest.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Event keyword, e.g. `CIRC`, `HS_DESC`.
    pub kind: String,
    /// Remainder of the first line plus any continuation lines.
    pub payload: String,
}

impl RawEvent {
    pub(crate) fn from_reply(reply: &Reply) -> Self {
        let first = reply.first_line();
        let (kind, rest) = match first.split_once(' ') {
            Some((k, r)) => (k.to_string(), r.to_string()),
            None => (first.to_string(), String::new()),
        };
        let mut payload = rest;
        for extra in reply.lines.iter().skip(1) {
            payload.push('\n');
            payload.push_str(extra);
        }
        RawEvent { kind, payload }
    }
}

/// Callback fired once when a service has been announced to the network.
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Registry of pending ready-callbacks, keyed by onion address.
///
/// Entries are removed when fired: at-most-once delivery per registration.
#[derive(Clone, Default)]
pub struct ReadyRegistry {
    inner: Arc<Mutex<HashMap<String, Vec<ReadyCallback>>>>,
}

impl ReadyRegistry {
    /// Register a callback for `address` (full `x.onion` form).
    pub fn register(&self, address: &str, callback: ReadyCallback) {
        self.inner
            .lock()
            .expect("ready registry poisoned")
            .entry(address.to_string())
            .or_default()
            .push(callback);
    }

    /// Remove and return all callbacks for `address`.
    fn take(&self, address: &str) -> Vec<ReadyCallback> {
        self.inner
            .lock()
            .expect("ready registry poisoned")
            .remove(address)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self, address: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(address)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Consumes the event stream for the lifetime of the connection.
pub struct EventDispatcher {
    registry: ReadyRegistry,
}

impl EventDispatcher {
    pub(crate) fn new(registry: ReadyRegistry) -> Self {
        EventDispatcher { registry }
    }

    /// Spawn the dispatch loop. It ends when the connection's reader drops
    /// the sending side.
    pub(crate) fn run(self, mut events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.dispatch(event);
            }
            debug!("event stream ended");
        })
    }

    fn dispatch(&self, event: RawEvent) {
        match event.kind.as_str() {
            "HS_DESC" => self.handle_hs_desc(&event.payload),
            "WARN" => warn!(target: "tor_warden::node", "{}", event.payload),
            "ERR" => error!(target: "tor_warden::node", "{}", event.payload),
            "CIRC" | "STREAM" | "ORCONN" => {
                debug!(kind = %event.kind, "{}", event.payload);
            }
            "NOTICE" | "INFO" => trace!(target: "tor_warden::node", "{}", event.payload),
            other => trace!(kind = other, "{}", event.payload),
        }
    }

    /// `HS_DESC <action> <service-id> ...`; an UPLOADED action means the
    /// descriptor reached a directory server and the service is reachable.
    fn handle_hs_desc(&self, payload: &str) {
        let mut words = payload.split_whitespace();
        let action = words.next().unwrap_or("");
        let service_id = words.next().unwrap_or("");
        match action {
            "UPLOADED" if !service_id.is_empty() => {
                let address = format!("{service_id}.onion");
                let callbacks = self.registry.take(&address);
                if !callbacks.is_empty() {
                    info!(%address, "hidden service announced to the network");
                }
                for callback in callbacks {
                    // Each callback gets its own task so a slow one cannot
                    // stall event processing.
                    tokio::spawn(async move { callback() });
                }
            }
            "FAILED" => debug!(service_id, "descriptor upload failed"),
            _ => trace!(action, service_id, "descriptor event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReplyLine;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn raw(kind: &str, payload: &str) -> RawEvent {
        RawEvent {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    #[test]
    fn raw_event_from_reply() {
        let reply = Reply::from_lines(
            vec![ReplyLine::parse("650 HS_DESC UPLOADED abcdef x y").unwrap()],
            vec![],
        )
        .unwrap();
        let event = RawEvent::from_reply(&reply);
        assert_eq!(event.kind, "HS_DESC");
        assert_eq!(event.payload, "UPLOADED abcdef x y");
    }

    #[tokio::test]
    async fn uploaded_event_fires_callbacks_once() {
        let registry = ReadyRegistry::default();
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        for _ in 0..2 {
            let tx = fired_tx.clone();
            registry.register("abcdef.onion", Box::new(move || drop(tx.send(()))));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = EventDispatcher::new(registry.clone()).run(rx);
        tx.send(raw("HS_DESC", "UPLOADED abcdef NO_AUTH $relay")).unwrap();

        // Both callbacks fire, each exactly once.
        tokio::time::timeout(Duration::from_secs(1), fired_rx.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), fired_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.pending("abcdef.onion"), 0);

        // A second upload for the same address finds nothing to fire.
        tx.send(raw("HS_DESC", "UPLOADED abcdef NO_AUTH $relay")).unwrap();
        drop(fired_tx);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), fired_rx.recv())
                .await
                .unwrap()
                .is_none()
        );

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn other_addresses_are_untouched() {
        let registry = ReadyRegistry::default();
        registry.register("other.onion", Box::new(|| {}));

        let (tx, rx) = mpsc::unbounded_channel();
        let task = EventDispatcher::new(registry.clone()).run(rx);
        tx.send(raw("HS_DESC", "UPLOADED abcdef")).unwrap();
        tx.send(raw("WARN", "something benign")).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(registry.pending("other.onion"), 1);
    }
}

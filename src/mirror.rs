//! The keyed local mirror driven by a follow-mode stream (§4.K).
//!
//! A [`LiveMirror`] is a singleton per `(path, query)` within a facade: the
//! first [`crate::subscription::Subscription`] to attach starts the
//! underlying follow stream, and the last to detach stops it and clears
//! the cache. Updates fan out through a `tokio::sync::watch` channel,
//! which gives "hot observable" replay for free — a freshly cloned
//! receiver already holds the latest snapshot, so a new subscriber sees
//! current state without waiting for the next packet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::error::Result;
use crate::parser::RouterRow;
use crate::subscription::{ForeignReader, Subscription, SubscriptionOptions};

/// Identity of a mirror: the menu path plus the optional query predicate
/// that scopes its follow stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorKey {
    pub path: String,
    pub query: Option<String>,
}

struct ActiveStream {
    tag: String,
    reader_task: tokio::task::JoinHandle<()>,
}

struct MirrorState {
    items: HashMap<String, RouterRow>,
    subscriber_count: usize,
    stream: Option<ActiveStream>,
    watch_tx: watch::Sender<Arc<Vec<RouterRow>>>,
}

/// A keyed local mirror of one RouterOS collection, kept current by a
/// follow-mode stream.
pub struct LiveMirror {
    key: MirrorKey,
    /// Extra fields requested on top of the always-included `.id`/`.dead`
    /// (§4.K: "a fixed property list that always includes `.id` and
    /// `.dead` so that deletion and identity are observable").
    fields: Vec<String>,
    client: Weak<ClientInner>,
    state: Mutex<MirrorState>,
}

impl LiveMirror {
    pub(crate) fn new(key: MirrorKey, fields: Vec<String>, client: Weak<ClientInner>) -> Arc<Self> {
        let (watch_tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Arc::new(Self {
            key,
            fields,
            client,
            state: Mutex::new(MirrorState {
                items: HashMap::new(),
                subscriber_count: 0,
                stream: None,
                watch_tx,
            }),
        })
    }

    pub fn key(&self) -> &MirrorKey {
        &self.key
    }

    /// Attach a new subscription, starting the follow stream if this is
    /// the first one. `foreign_reader` is only consulted when `opts.join`
    /// is set.
    pub async fn subscribe(
        self: &Arc<Self>,
        opts: SubscriptionOptions,
        foreign_reader: Option<Arc<dyn ForeignReader>>,
    ) -> Result<Subscription> {
        let (watch_rx, first_subscriber) = {
            let mut state = self.state.lock().unwrap();
            state.subscriber_count += 1;
            (state.watch_tx.subscribe(), state.subscriber_count == 1)
        };
        if first_subscriber {
            if let Err(e) = self.start_stream().await {
                let mut state = self.state.lock().unwrap();
                state.subscriber_count -= 1;
                return Err(e);
            }
        }
        Ok(Subscription::spawn(self.clone(), watch_rx, opts, foreign_reader))
    }

    /// Release one subscription's hold; stop the stream and clear the
    /// cache once the last one has gone.
    pub(crate) async fn release(self: &Arc<Self>) {
        let should_stop = {
            let mut state = self.state.lock().unwrap();
            state.subscriber_count = state.subscriber_count.saturating_sub(1);
            state.subscriber_count == 0
        };
        if should_stop {
            self.stop_stream_and_detach().await;
        }
    }

    async fn start_stream(self: &Arc<Self>) -> Result<()> {
        let Some(client) = self.client.upgrade() else {
            return Err(crate::error::Error::ConnectionLost);
        };
        let mut proplist: Vec<String> = vec![".id".to_owned(), ".dead".to_owned()];
        for field in &self.fields {
            if !proplist.contains(field) {
                proplist.push(field.clone());
            }
        }
        let (row_tx, mut row_rx) = mpsc::unbounded_channel();
        let handle = client
            .start_follow(&self.key.path, self.key.query.as_deref(), &proplist, row_tx)
            .await?;

        let mirror = self.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(row) = row_rx.recv().await {
                mirror.merge_packet(row);
            }
            debug!("live mirror: stream reader exiting");
        });

        let mut state = self.state.lock().unwrap();
        state.stream = Some(ActiveStream {
            tag: handle.tag,
            reader_task,
        });
        Ok(())
    }

    async fn stop_stream_and_detach(self: &Arc<Self>) {
        let stream = {
            let mut state = self.state.lock().unwrap();
            state.items.clear();
            state.stream.take()
        };
        if let Some(client) = self.client.upgrade() {
            // Detach from the registry before the stream itself tears
            // down, breaking the Mirror<->Facade reference cycle (§9).
            client.detach_mirror(&self.key);
            if let Some(stream) = &stream {
                let _ = client.cancel_follow(&stream.tag).await;
            }
        }
        if let Some(stream) = stream {
            stream.reader_task.abort();
        }
    }

    /// Merge one inbound packet per §4.K: resolve identity, drop on
    /// `.dead`, otherwise partial-update the existing entry and publish a
    /// fresh snapshot to every subscriber.
    fn merge_packet(&self, row: RouterRow) {
        let Some(id) = identifier_of(&row) else {
            debug!("live mirror: packet has neither id nor name, dropping");
            return;
        };
        let mut state = self.state.lock().unwrap();
        let dead = row
            .get("dead")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if dead {
            state.items.remove(&id);
        } else {
            state
                .items
                .entry(id)
                .and_modify(|existing| merge_fields(existing, &row))
                .or_insert(row);
        }
        let snapshot: Vec<RouterRow> = state.items.values().cloned().collect();
        if state.watch_tx.send(Arc::new(snapshot)).is_err() {
            warn!("live mirror: no subscribers left to receive snapshot");
        }
    }

    #[cfg(test)]
    pub(crate) fn test_merge_packet(&self, row: RouterRow) {
        self.merge_packet(row);
    }

    #[cfg(test)]
    pub(crate) fn test_len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

fn identifier_of(row: &RouterRow) -> Option<String> {
    row.get("id")
        .and_then(Value::as_str)
        .or_else(|| row.get("name").and_then(Value::as_str))
        .map(str::to_owned)
}

fn merge_fields(existing: &mut RouterRow, incoming: &RouterRow) {
    for (key, value) in incoming {
        existing.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> RouterRow {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn test_mirror() -> Arc<LiveMirror> {
        LiveMirror::new(
            MirrorKey { path: "/interface".into(), query: None },
            vec![],
            Weak::new(),
        )
    }

    #[test]
    fn deletion_via_dead_flag_removes_the_entry() {
        let mirror = test_mirror();
        mirror.test_merge_packet(row(&[("id", json!("*1")), ("name", json!("ether1"))]));
        assert_eq!(mirror.test_len(), 1);
        mirror.test_merge_packet(row(&[("id", json!("*1")), ("dead", json!(true))]));
        assert_eq!(mirror.test_len(), 0);
    }

    #[test]
    fn falls_back_to_name_when_id_is_absent() {
        let mirror = test_mirror();
        mirror.test_merge_packet(row(&[("name", json!("ether1")), ("mtu", json!(1500))]));
        assert_eq!(mirror.test_len(), 1);
    }

    #[test]
    fn packet_without_id_or_name_is_dropped() {
        let mirror = test_mirror();
        mirror.test_merge_packet(row(&[("mtu", json!(1500))]));
        assert_eq!(mirror.test_len(), 0);
    }

    #[test]
    fn partial_updates_merge_rather_than_replace() {
        let mirror = test_mirror();
        mirror.test_merge_packet(row(&[("id", json!("*1")), ("name", json!("ether1")), ("mtu", json!(1500))]));
        mirror.test_merge_packet(row(&[("id", json!("*1")), ("mtu", json!(9000))]));
        let state = mirror.state.lock().unwrap();
        let item = &state.items["*1"];
        assert_eq!(item.get("name").unwrap(), "ether1");
        assert_eq!(item.get("mtu").unwrap(), &json!(9000));
    }
}

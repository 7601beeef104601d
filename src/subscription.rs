//! The per-subscriber middleware pipeline fed by a [`crate::mirror::LiveMirror`]:
//! throttle (leading + trailing edge), an optional single-level join against
//! a foreign collection, and an optional diff against the last emitted
//! snapshot (§4.L).
//!
//! Throttling and diffing are plain local state machines; the join stage is
//! the only one that needs to reach back out to the facade, so it is kept
//! behind the small [`ForeignReader`] seam rather than threading the whole
//! client type through this module.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant as TokioInstant;
use tracing::warn;

use crate::collection_utils::{field_as_key, index_by};
use crate::error::Result;
use crate::mirror::LiveMirror;
use crate::parser::RouterRow;

/// A one-level left-join: for each emission, the foreign collection at
/// `foreign_path` is read once and indexed by `foreign_field`; every local
/// row is matched on `local_field` and gets the matched foreign row (or
/// `null`) attached under `attribute`.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub foreign_path: String,
    pub local_field: String,
    pub foreign_field: String,
    pub attribute: String,
}

/// Per-subscription configuration (§3 "Snapshot Pipeline State").
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub diff: bool,
    /// `0` disables throttling: every update fires synchronously.
    pub throttle_ms: u64,
    pub join: Option<JoinSpec>,
}

/// The result of comparing the previously emitted snapshot against the
/// current one, keyed by identity (`.id`, falling back to `name:<name>`,
/// last-resort the row's full JSON serialization).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub added: Vec<RouterRow>,
    pub modified: Vec<RouterRow>,
    pub removed: Vec<RouterRow>,
    pub current: Vec<RouterRow>,
}

impl Diff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// What a subscription delivers to its consumer.
#[derive(Debug, Clone)]
pub enum Emission {
    Snapshot(Vec<RouterRow>),
    Diff(Diff),
}

/// The join stage's only dependency on the facade: a one-shot read of a
/// collection by menu path. Implemented by `ClientInner` so this module
/// never needs the facade's full surface.
#[async_trait::async_trait]
pub trait ForeignReader: Send + Sync {
    async fn read_once(&self, path: &str) -> Result<Vec<RouterRow>>;
}

/// A live handle to one subscriber's pipeline. Emissions are drained with
/// [`Subscription::recv`]; dropping (or calling [`Subscription::stop`])
/// cancels any pending throttle timer and detaches from the parent mirror,
/// letting it reference-count down and possibly terminate its stream.
pub struct Subscription {
    emissions: mpsc::UnboundedReceiver<Emission>,
    task: tokio::task::JoinHandle<()>,
    mirror: Arc<LiveMirror>,
    released: bool,
}

impl Subscription {
    pub(crate) fn spawn(
        mirror: Arc<LiveMirror>,
        mut watch_rx: watch::Receiver<Arc<Vec<RouterRow>>>,
        opts: SubscriptionOptions,
        foreign_reader: Option<Arc<dyn ForeignReader>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut pipeline = Pipeline::new(opts);

            // Hot-observable replay: a freshly attached subscriber sees the
            // mirror's current state immediately, not just future updates.
            let initial = watch_rx.borrow_and_update().clone();
            pipeline.handle_update(initial.as_slice(), &foreign_reader, &tx).await;

            loop {
                let deadline = pipeline.timer_deadline;
                let timer = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(TokioInstant::from_std(at)).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    changed = watch_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = watch_rx.borrow_and_update().clone();
                        pipeline.handle_update(snapshot.as_slice(), &foreign_reader, &tx).await;
                    }
                    () = timer => {
                        pipeline.fire_pending(&foreign_reader, &tx).await;
                    }
                }
            }
        });
        Self {
            emissions: rx,
            task,
            mirror,
            released: false,
        }
    }

    /// Await the next emission. Returns `None` once the parent mirror's
    /// stream has ended and no more updates will ever arrive.
    pub async fn recv(&mut self) -> Option<Emission> {
        self.emissions.recv().await
    }

    /// Idempotent: cancels the pending throttle timer and detaches from the
    /// parent mirror. Safe to call more than once, or to simply drop the
    /// subscription instead.
    pub async fn stop(mut self) {
        self.task.abort();
        if !self.released {
            self.released = true;
            self.mirror.release().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        if !self.released {
            self.released = true;
            let mirror = self.mirror.clone();
            tokio::spawn(async move { mirror.release().await });
        }
    }
}

/// The throttle/join/diff state machine for one subscription.
struct Pipeline {
    opts: SubscriptionOptions,
    last_emit: Option<Instant>,
    pending_update: Option<Vec<RouterRow>>,
    timer_deadline: Option<Instant>,
    previous_snapshot: Vec<RouterRow>,
}

impl Pipeline {
    fn new(opts: SubscriptionOptions) -> Self {
        Self {
            opts,
            last_emit: None,
            pending_update: None,
            timer_deadline: None,
            previous_snapshot: Vec::new(),
        }
    }

    /// Apply the leading/trailing-edge throttle to one raw update from the
    /// mirror (§4.L).
    async fn handle_update(
        &mut self,
        snapshot: &[RouterRow],
        foreign_reader: &Option<Arc<dyn ForeignReader>>,
        tx: &mpsc::UnboundedSender<Emission>,
    ) {
        if self.opts.throttle_ms == 0 {
            self.emit(snapshot.to_vec(), foreign_reader, tx).await;
            return;
        }
        let now = Instant::now();
        let idle_long_enough = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= Duration::from_millis(self.opts.throttle_ms),
        };
        if idle_long_enough {
            self.emit(snapshot.to_vec(), foreign_reader, tx).await;
        } else {
            self.pending_update = Some(snapshot.to_vec());
            if self.timer_deadline.is_none() {
                let last_emit = self.last_emit.unwrap_or(now);
                self.timer_deadline = Some(last_emit + Duration::from_millis(self.opts.throttle_ms));
            }
        }
    }

    /// The buffered trailing-edge timer fired: emit whatever the latest
    /// buffered update was, per the "last value always wins" guarantee.
    async fn fire_pending(
        &mut self,
        foreign_reader: &Option<Arc<dyn ForeignReader>>,
        tx: &mpsc::UnboundedSender<Emission>,
    ) {
        self.timer_deadline = None;
        if let Some(pending) = self.pending_update.take() {
            self.emit(pending, foreign_reader, tx).await;
        }
    }

    async fn emit(
        &mut self,
        mut snapshot: Vec<RouterRow>,
        foreign_reader: &Option<Arc<dyn ForeignReader>>,
        tx: &mpsc::UnboundedSender<Emission>,
    ) {
        self.last_emit = Some(Instant::now());
        if let Some(join) = &self.opts.join {
            apply_join(&mut snapshot, join, foreign_reader).await;
        }
        if self.opts.diff {
            let diff = compute_diff(&self.previous_snapshot, &snapshot);
            // Updated unconditionally, even when nothing is emitted, so that
            // toggling diff mode on later starts from an accurate baseline.
            self.previous_snapshot = snapshot;
            if diff.is_empty() {
                return;
            }
            let _ = tx.send(Emission::Diff(diff));
        } else {
            self.previous_snapshot = snapshot.clone();
            let _ = tx.send(Emission::Snapshot(snapshot));
        }
    }
}

async fn apply_join(
    rows: &mut [RouterRow],
    join: &JoinSpec,
    foreign_reader: &Option<Arc<dyn ForeignReader>>,
) {
    let Some(reader) = foreign_reader else {
        warn!("subscription: join configured but no foreign reader is attached, skipping");
        return;
    };
    let foreign_rows = match reader.read_once(&join.foreign_path).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(
                error = %e,
                path = %join.foreign_path,
                "subscription: join read failed, emitting un-joined data"
            );
            return;
        }
    };
    let index = index_by(&foreign_rows, &join.foreign_field);
    for row in rows.iter_mut() {
        let matched = field_as_key(row, &join.local_field)
            .and_then(|key| index.get(key.as_str()))
            .map(|foreign_row| Value::Object((*foreign_row).clone()));
        row.insert(join.attribute.clone(), matched.unwrap_or(Value::Null));
    }
}

/// Identity key for diffing: `.id` first, then `name`, then the row's own
/// JSON text as an always-available last resort (§4.L).
fn identity_key(row: &RouterRow) -> String {
    if let Some(id) = row.get("id").and_then(Value::as_str) {
        return format!("id:{id}");
    }
    if let Some(name) = row.get("name").and_then(Value::as_str) {
        return format!("name:{name}");
    }
    serde_json::to_string(row).unwrap_or_default()
}

fn compute_diff(previous: &[RouterRow], current: &[RouterRow]) -> Diff {
    let previous_index: HashMap<String, &RouterRow> =
        previous.iter().map(|row| (identity_key(row), row)).collect();
    let current_index: HashMap<String, &RouterRow> =
        current.iter().map(|row| (identity_key(row), row)).collect();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    for (key, row) in &current_index {
        match previous_index.get(key) {
            None => added.push((*row).clone()),
            Some(previous_row) => {
                if !structurally_equal(previous_row, row) {
                    modified.push((*row).clone());
                }
            }
        }
    }
    let mut removed = Vec::new();
    for (key, row) in &previous_index {
        if !current_index.contains_key(key) {
            removed.push((*row).clone());
        }
    }
    Diff {
        added,
        modified,
        removed,
        current: current.to_vec(),
    }
}

fn structurally_equal(a: &RouterRow, b: &RouterRow) -> bool {
    serde_json::to_string(a).unwrap_or_default() == serde_json::to_string(b).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, extra: &[(&str, Value)]) -> RouterRow {
        let mut row = serde_json::Map::new();
        row.insert("id".to_owned(), json!(id));
        for (k, v) in extra {
            row.insert((*k).to_owned(), v.clone());
        }
        row
    }

    #[test]
    fn diff_detects_added_modified_and_removed() {
        let previous = vec![
            row("*1", &[("mtu", json!(1500))]),
            row("*2", &[("mtu", json!(1400))]),
        ];
        let current = vec![
            row("*1", &[("mtu", json!(9000))]),
            row("*3", &[("mtu", json!(1000))]),
        ];
        let diff = compute_diff(&previous, &current);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].get("id").unwrap(), "*3");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].get("id").unwrap(), "*1");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].get("id").unwrap(), "*2");
    }

    #[test]
    fn diff_is_empty_when_nothing_changed() {
        let rows = vec![row("*1", &[("mtu", json!(1500))])];
        let diff = compute_diff(&rows, &rows.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn falls_back_to_name_then_full_json_for_identity() {
        let a = {
            let mut m = serde_json::Map::new();
            m.insert("name".to_owned(), json!("ether1"));
            m
        };
        let b = {
            let mut m = serde_json::Map::new();
            m.insert("name".to_owned(), json!("ether1"));
            m.insert("mtu".to_owned(), json!(1500));
            m
        };
        assert_eq!(identity_key(&a), identity_key(&{
            let mut m = serde_json::Map::new();
            m.insert("name".to_owned(), json!("ether1"));
            m
        }));
        let diff = compute_diff(&[a], &[b]);
        assert_eq!(diff.modified.len(), 1);
    }

    #[tokio::test]
    async fn apply_join_attaches_matched_foreign_row_and_nulls_unmatched() {
        struct StaticReader(Vec<RouterRow>);
        #[async_trait::async_trait]
        impl ForeignReader for StaticReader {
            async fn read_once(&self, _path: &str) -> Result<Vec<RouterRow>> {
                Ok(self.0.clone())
            }
        }
        let reader: Arc<dyn ForeignReader> = Arc::new(StaticReader(vec![row(
            "ignored",
            &[("vlanId", json!(10)), ("name", json!("vlan10"))],
        )]));
        let join = JoinSpec {
            foreign_path: "/interface/vlan".into(),
            local_field: "vlan".into(),
            foreign_field: "vlanId".into(),
            attribute: "vlanInfo".into(),
        };
        let mut rows = vec![
            row("*1", &[("vlan", json!(10))]),
            row("*2", &[("vlan", json!(99))]),
        ];
        apply_join(&mut rows, &join, &Some(reader)).await;
        assert_eq!(rows[0].get("vlanInfo").unwrap().get("name").unwrap(), "vlan10");
        assert_eq!(rows[1].get("vlanInfo").unwrap(), &Value::Null);
    }
}

//! The multiplexed tagged request router (§4.I).
//!
//! One [`SocketTransport`] carries arbitrarily many interleaved requests
//! and follow-mode streams, each identified by a short client-generated
//! tag. A single pump task owns the transport and is the only reader of
//! incoming words; it assembles them into sentences and dispatches each
//! terminal or data reply to whichever pending operation owns its tag.
//! Submitters never touch the transport's read side — they only hold a
//! clone of its write sender, guarded by a sentence-granularity lock so
//! two concurrent submissions can never interleave their words on the
//! wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::auth::legacy_login_response;
use crate::command::Params;
use crate::error::{Error, Result};
use crate::parser::{RouterRow, parse_row};
use crate::ratelimit::RateLimiter;
use crate::transport::socket::{SocketTransport, TransportEvent};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TAG_RANDOM_CHARS: usize = 8;

/// What a completed print/add/set/remove request resolves with: the `!re`
/// rows accumulated along the way, plus any attributes that rode on the
/// terminal `!done` sentence itself (e.g. `ret=` on a login reply).
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub rows: Vec<RouterRow>,
    pub done_attrs: HashMap<String, String>,
}

/// Either a `(command, params)` pair or a preformed word list, per the
/// "polymorphic stream start" design note (§9) — the preformed form
/// preserves query-vs-attribute distinctions a caller may have already
/// resolved (e.g. `=follow=` sentinel words a key/value map can't express).
pub enum StreamTarget {
    Command { path: String, params: Params },
    Sentence(Vec<String>),
}

enum PendingKind {
    Request {
        rows: Vec<RouterRow>,
        resolve: oneshot::Sender<Result<RequestOutcome>>,
    },
    Stream {
        row_tx: mpsc::UnboundedSender<RouterRow>,
        done_tx: Option<oneshot::Sender<Result<()>>>,
    },
}

struct PendingOp {
    kind: PendingKind,
    start: Instant,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingOp>>>;

/// A handle to an open follow-mode stream. `tag` is what `cancel_stream`
/// needs; `done_rx` resolves when the stream ends, `Ok(())` for a normal
/// cancellation and `Err` for an abnormal `!trap`.
pub struct StreamHandle {
    pub tag: String,
    pub done_rx: oneshot::Receiver<Result<()>>,
}

/// The per-connection tag-routed request/response multiplexer.
pub struct RouterCore {
    writer: mpsc::Sender<String>,
    write_lock: tokio::sync::Mutex<()>,
    pending: PendingMap,
    rate_limiter: Arc<RateLimiter>,
    pump: tokio::task::JoinHandle<()>,
}

impl RouterCore {
    /// Take ownership of `transport` and start the pump task that drives
    /// its reader loop for the lifetime of this router core.
    pub fn new(transport: SocketTransport, rate_limiter: Arc<RateLimiter>) -> Self {
        let writer = transport.writer();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pump = spawn_pump(transport, pending.clone(), rate_limiter.clone());
        Self {
            writer,
            write_lock: tokio::sync::Mutex::new(()),
            pending,
            rate_limiter,
            pump,
        }
    }

    /// Allocate a tag unique among currently outstanding operations on
    /// this connection: `t` followed by `TAG_RANDOM_CHARS` base-36 digits.
    fn alloc_tag(&self) -> String {
        alloc_tag(&self.pending)
    }

    async fn write_words(&self, words: Vec<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        for word in words {
            self.writer
                .send(word)
                .await
                .map_err(|_| Error::ConnectionLost)?;
        }
        Ok(())
    }

    /// Submit one request (`print`/`add`/`set`/`remove`/...) and await its
    /// terminal reply.
    pub async fn submit_request(&self, command: &str, params: &Params) -> Result<RequestOutcome> {
        let tag = self.alloc_tag();
        let (resolve, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            tag.clone(),
            PendingOp {
                kind: PendingKind::Request {
                    rows: Vec::new(),
                    resolve,
                },
                start: Instant::now(),
            },
        );
        debug!(tag = %tag, command = %command, "router core: submitting request");
        let words = build_words(command, params, &tag);
        if let Err(e) = self.write_words(words).await {
            self.pending.lock().unwrap().remove(&tag);
            return Err(e);
        }
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Start a follow-mode stream. Rows arrive on `row_tx` as they are
    /// dispatched — the pump task never blocks waiting for the consumer to
    /// drain it, since the channel is unbounded (§4.I concurrency note: a
    /// misbehaving callback must not stall the router).
    pub async fn submit_stream(
        &self,
        target: StreamTarget,
        row_tx: mpsc::UnboundedSender<RouterRow>,
    ) -> Result<StreamHandle> {
        let tag = self.alloc_tag();
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            tag.clone(),
            PendingOp {
                kind: PendingKind::Stream {
                    row_tx,
                    done_tx: Some(done_tx),
                },
                start: Instant::now(),
            },
        );
        let words = match target {
            StreamTarget::Command { path, params } => build_words(&path, &params, &tag),
            StreamTarget::Sentence(mut words) => {
                words.push(format!(".tag={tag}"));
                words.push(String::new());
                words
            }
        };
        debug!(tag = %tag, "router core: starting stream");
        if let Err(e) = self.write_words(words).await {
            self.pending.lock().unwrap().remove(&tag);
            return Err(e);
        }
        Ok(StreamHandle { tag, done_rx })
    }

    /// Cancel a stream by tag: `/cancel tag=<id>` as a new tagged request,
    /// bypassing the rate limiter and circuit breaker (§4.I). Best-effort —
    /// the original stream's own pending entry is cleared by the pump task
    /// when the matching `!trap interrupted` arrives, not by this call.
    pub async fn cancel_stream(&self, tag: &str) -> Result<()> {
        let cancel_tag = self.alloc_tag();
        let (resolve, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            cancel_tag.clone(),
            PendingOp {
                kind: PendingKind::Request {
                    rows: Vec::new(),
                    resolve,
                },
                start: Instant::now(),
            },
        );
        let params = Params::new().attr("tag", tag);
        let words = build_words("/cancel", &params, &cancel_tag);
        self.write_words(words).await?;
        let _ = rx.await;
        Ok(())
    }

    /// The legacy challenge/response login (§4.D, §4.I). Exempt from the
    /// rate limiter and circuit breaker — called during connect, before
    /// either should govern traffic.
    pub async fn login(&self, user: &str, password: &str) -> Result<()> {
        let params = Params::new().attr("name", user).attr("password", password);
        let outcome = self
            .submit_request("/login", &params)
            .await
            .map_err(to_auth_error)?;

        let Some(challenge) = outcome.done_attrs.get("ret") else {
            info!("router core: login accepted without challenge");
            return Ok(());
        };

        let response = legacy_login_response(password, challenge)?;
        let params = Params::new().attr("name", user).attr("response", response);
        self.submit_request("/login", &params)
            .await
            .map_err(to_auth_error)?;
        info!("router core: legacy challenge/response login succeeded");
        Ok(())
    }

    /// Feed a measured round-trip latency into the rate limiter, for
    /// callers (e.g. the REST transport) that measure their own RTT
    /// outside the socket dispatch path.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }
}

impl Drop for RouterCore {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn to_auth_error(err: Error) -> Error {
    match err {
        Error::Router { detail, .. } => Error::Auth(detail),
        other => other,
    }
}

fn alloc_tag(pending: &PendingMap) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let suffix: String = (0..TAG_RANDOM_CHARS)
            .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
            .collect();
        let tag = format!("t{suffix}");
        if !pending.lock().unwrap().contains_key(&tag) {
            return tag;
        }
    }
}

/// Build `[command-word, <key-prefixed words>, .tag=<tag>, <empty>]` per
/// §4.I's submission rule: `?`-prefixed entries are queries and pass
/// through verbatim with just the marker prepended; everything else is an
/// attribute and gets a leading `=`.
fn build_words(command: &str, params: &Params, tag: &str) -> Vec<String> {
    let mut words = Vec::with_capacity(2 + params.attributes.len() + params.queries.len());
    words.push(command.to_owned());
    for (key, value) in &params.attributes {
        words.push(format!("={key}={value}"));
    }
    for predicate in &params.queries {
        words.push(format!("?{predicate}"));
    }
    words.push(format!(".tag={tag}"));
    words.push(String::new());
    words
}

/// The per-connection "current sentence" accumulator for incoming words
/// (§4.I "Word assembly (incoming)").
#[derive(Default)]
struct SentenceBuilder {
    reply_type: Option<String>,
    tag: Option<String>,
    attrs: HashMap<String, String>,
}

struct CompletedSentence {
    reply_type: Option<String>,
    tag: Option<String>,
    attrs: HashMap<String, String>,
}

impl SentenceBuilder {
    /// Feed one decoded word. Returns the completed sentence when `word`
    /// is the empty terminator, resetting the accumulator for the next one.
    fn feed(&mut self, word: &str) -> Option<CompletedSentence> {
        if word.is_empty() {
            return Some(CompletedSentence {
                reply_type: self.reply_type.take(),
                tag: self.tag.take(),
                attrs: std::mem::take(&mut self.attrs),
            });
        }
        if let Some(reply_type) = word.strip_prefix('!') {
            self.reply_type = Some(reply_type.to_owned());
        } else if let Some(tag) = word.strip_prefix(".tag=") {
            self.tag = Some(tag.to_owned());
        } else if let Some(rest) = word.strip_prefix('=') {
            match rest.split_once('=') {
                Some((key, value)) => {
                    self.attrs.insert(key.to_owned(), value.to_owned());
                }
                None => {
                    self.attrs.insert(rest.to_owned(), String::new());
                }
            }
        } else if let Some(ret) = word.strip_prefix("ret=") {
            self.attrs.insert("ret".to_owned(), ret.to_owned());
        } else {
            self.attrs.insert(word.to_owned(), "true".to_owned());
        }
        None
    }
}

fn spawn_pump(
    mut transport: SocketTransport,
    pending: PendingMap,
    rate_limiter: Arc<RateLimiter>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sentence = SentenceBuilder::default();
        loop {
            match transport.next_event().await {
                Some(TransportEvent::Word(word)) => {
                    if let Some(completed) = sentence.feed(&word) {
                        dispatch(&pending, &rate_limiter, completed);
                    }
                }
                Some(TransportEvent::Error(e)) => {
                    warn!(error = %e, "router core: transport error, failing pending operations");
                    fail_all(&pending);
                    break;
                }
                Some(TransportEvent::Closed) | None => {
                    info!("router core: connection closed, failing pending operations");
                    fail_all(&pending);
                    break;
                }
            }
        }
    })
}

/// Route one completed sentence to its pending operation (§4.I "Dispatch").
fn dispatch(pending: &PendingMap, rate_limiter: &RateLimiter, sentence: CompletedSentence) {
    let Some(tag) = sentence.tag else {
        debug!("router core: reply with no tag, dropping");
        return;
    };
    let Some(reply_type) = sentence.reply_type.as_deref() else {
        debug!(tag = %tag, "router core: sentence with no reply type, dropping");
        return;
    };

    match reply_type {
        "re" => {
            let mut guard = pending.lock().unwrap();
            let Some(op) = guard.get_mut(&tag) else {
                debug!(tag = %tag, "router core: !re for unknown tag, dropping");
                return;
            };
            let row = parse_row(&sentence.attrs);
            match &mut op.kind {
                PendingKind::Request { rows, .. } => rows.push(row),
                PendingKind::Stream { row_tx, .. } => {
                    let _ = row_tx.send(row);
                }
            }
        }
        "done" => {
            let Some(op) = pending.lock().unwrap().remove(&tag) else {
                debug!(tag = %tag, "router core: !done for unknown tag, dropping");
                return;
            };
            rate_limiter.submit_feedback(op.start.elapsed());
            match op.kind {
                PendingKind::Request { rows, resolve } => {
                    let _ = resolve.send(Ok(RequestOutcome {
                        rows,
                        done_attrs: sentence.attrs,
                    }));
                }
                PendingKind::Stream { done_tx, .. } => {
                    if let Some(tx) = done_tx {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
        }
        "trap" => {
            let Some(op) = pending.lock().unwrap().remove(&tag) else {
                debug!(tag = %tag, "router core: !trap for unknown tag, dropping");
                return;
            };
            rate_limiter.submit_feedback(op.start.elapsed());
            let message = sentence.attrs.get("message").cloned().unwrap_or_default();
            let interrupted = message.contains("interrupted");
            match op.kind {
                PendingKind::Request { rows, resolve } => {
                    if interrupted {
                        debug!(tag = %tag, "router core: interrupted trap absorbed on request op");
                        let _ = resolve.send(Ok(RequestOutcome {
                            rows,
                            done_attrs: sentence.attrs,
                        }));
                    } else {
                        let _ = resolve.send(Err(Error::router(message, None)));
                    }
                }
                PendingKind::Stream { done_tx, .. } => {
                    if interrupted {
                        debug!(tag = %tag, "router core: stream cancel acknowledged");
                    } else {
                        warn!(tag = %tag, message = %message, "router core: stream terminated abnormally");
                    }
                    if let Some(tx) = done_tx {
                        let outcome = if interrupted {
                            Ok(())
                        } else {
                            Err(Error::router(message, None))
                        };
                        let _ = tx.send(outcome);
                    }
                }
            }
        }
        "fatal" => {
            warn!(tag = %tag, "router core: !fatal reply received, connection will close");
        }
        other => {
            debug!(tag = %tag, reply = %other, "router core: unknown reply type, dropping");
        }
    }
}

fn fail_all(pending: &PendingMap) {
    let ops = std::mem::take(&mut *pending.lock().unwrap());
    for (_, op) in ops {
        match op.kind {
            PendingKind::Request { resolve, .. } => {
                let _ = resolve.send(Err(Error::ConnectionLost));
            }
            PendingKind::Stream { done_tx, .. } => {
                if let Some(tx) = done_tx {
                    let _ = tx.send(Err(Error::ConnectionLost));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn sentence(reply_type: &str, tag: &str, attrs: &[(&str, &str)]) -> CompletedSentence {
        CompletedSentence {
            reply_type: Some(reply_type.to_owned()),
            tag: Some(tag.to_owned()),
            attrs: attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn new_pending() -> PendingMap {
        Arc::new(Mutex::new(StdHashMap::new()))
    }

    #[test]
    fn sentence_builder_assembles_a_full_sentence_from_raw_words() {
        let mut builder = SentenceBuilder::default();
        assert!(builder.feed("!re").is_none());
        assert!(builder.feed(".tag=t1").is_none());
        assert!(builder.feed("=.id=*1").is_none());
        assert!(builder.feed("=name=ether1").is_none());
        assert!(builder.feed("disabled").is_none());
        let completed = builder.feed("").unwrap();
        assert_eq!(completed.reply_type.as_deref(), Some("re"));
        assert_eq!(completed.tag.as_deref(), Some("t1"));
        assert_eq!(completed.attrs.get(".id"), Some(&"*1".to_string()));
        assert_eq!(completed.attrs.get("name"), Some(&"ether1".to_string()));
        assert_eq!(completed.attrs.get("disabled"), Some(&"true".to_string()));
    }

    #[test]
    fn sentence_builder_stores_ret_under_a_plain_key() {
        let mut builder = SentenceBuilder::default();
        builder.feed("!done");
        builder.feed(".tag=t1");
        builder.feed("ret=0123456789abcdef0123456789abcdef");
        let completed = builder.feed("").unwrap();
        assert_eq!(
            completed.attrs.get("ret").map(String::as_str),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn alloc_tag_produces_unique_t_prefixed_tags() {
        let pending = new_pending();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let tag = alloc_tag(&pending);
            assert!(tag.starts_with('t'));
            assert!(tag.len() >= 7);
            assert!(seen.insert(tag.clone()), "tag {tag} was not unique");
            pending.lock().unwrap().insert(
                tag,
                PendingOp {
                    kind: PendingKind::Request {
                        rows: Vec::new(),
                        resolve: oneshot::channel().0,
                    },
                    start: Instant::now(),
                },
            );
        }
    }

    #[test]
    fn build_words_prefixes_attributes_with_equals_and_queries_with_question_mark() {
        let params = Params::new().attr("name", "ether1").query("type=ether");
        let words = build_words("/interface/print", &params, "t1");
        assert_eq!(words[0], "/interface/print");
        assert!(words.contains(&"=name=ether1".to_string()));
        assert!(words.contains(&"?type=ether".to_string()));
        assert_eq!(words[words.len() - 2], ".tag=t1");
        assert_eq!(words.last(), Some(&String::new()));
    }

    #[tokio::test]
    async fn done_resolves_request_with_accumulated_rows_and_removes_pending() {
        let pending = new_pending();
        let limiter = RateLimiter::new(10.0, 10.0);
        let (resolve, rx) = oneshot::channel();
        pending.lock().unwrap().insert(
            "t1".to_string(),
            PendingOp {
                kind: PendingKind::Request {
                    rows: Vec::new(),
                    resolve,
                },
                start: Instant::now(),
            },
        );
        dispatch(&pending, &limiter, sentence("re", "t1", &[("name", "ether1")]));
        dispatch(&pending, &limiter, sentence("done", "t1", &[]));
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn two_concurrent_requests_each_observe_only_their_own_rows() {
        let pending = new_pending();
        let limiter = RateLimiter::new(10.0, 10.0);
        let (resolve_a, rx_a) = oneshot::channel();
        let (resolve_b, rx_b) = oneshot::channel();
        pending.lock().unwrap().insert(
            "ta".to_string(),
            PendingOp {
                kind: PendingKind::Request { rows: Vec::new(), resolve: resolve_a },
                start: Instant::now(),
            },
        );
        pending.lock().unwrap().insert(
            "tb".to_string(),
            PendingOp {
                kind: PendingKind::Request { rows: Vec::new(), resolve: resolve_b },
                start: Instant::now(),
            },
        );
        // Interleave as the scenario in §8 describes: !re A, !re B, !done B, !done A.
        dispatch(&pending, &limiter, sentence("re", "ta", &[("id", "a1")]));
        dispatch(&pending, &limiter, sentence("re", "tb", &[("id", "b1")]));
        dispatch(&pending, &limiter, sentence("done", "tb", &[]));
        dispatch(&pending, &limiter, sentence("done", "ta", &[]));

        let outcome_a = rx_a.await.unwrap().unwrap();
        let outcome_b = rx_b.await.unwrap().unwrap();
        assert_eq!(outcome_a.rows[0].get("id").unwrap(), "a1");
        assert_eq!(outcome_b.rows[0].get("id").unwrap(), "b1");
    }

    #[tokio::test]
    async fn interrupted_trap_is_absorbed_not_treated_as_an_error() {
        let pending = new_pending();
        let limiter = RateLimiter::new(10.0, 10.0);
        let (row_tx, mut row_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        pending.lock().unwrap().insert(
            "ts".to_string(),
            PendingOp {
                kind: PendingKind::Stream { row_tx, done_tx: Some(done_tx) },
                start: Instant::now(),
            },
        );
        dispatch(
            &pending,
            &limiter,
            sentence("trap", "ts", &[("message", "interrupted")]),
        );
        let outcome = done_rx.await.unwrap();
        assert!(outcome.is_ok());
        row_rx.close();
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_interrupted_trap_fails_the_request() {
        let pending = new_pending();
        let limiter = RateLimiter::new(10.0, 10.0);
        let (resolve, rx) = oneshot::channel();
        pending.lock().unwrap().insert(
            "t1".to_string(),
            PendingOp {
                kind: PendingKind::Request { rows: Vec::new(), resolve },
                start: Instant::now(),
            },
        );
        dispatch(
            &pending,
            &limiter,
            sentence("trap", "t1", &[("message", "no such item")]),
        );
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Router { .. })));
    }

    #[test]
    fn unknown_tag_is_dropped_silently() {
        let pending = new_pending();
        let limiter = RateLimiter::new(10.0, 10.0);
        dispatch(&pending, &limiter, sentence("done", "ghost", &[]));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connection_loss_fails_every_pending_operation() {
        let pending = new_pending();
        let (resolve, rx) = oneshot::channel();
        pending.lock().unwrap().insert(
            "t1".to_string(),
            PendingOp {
                kind: PendingKind::Request { rows: Vec::new(), resolve },
                start: Instant::now(),
            },
        );
        fail_all(&pending);
        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(pending.lock().unwrap().is_empty());
    }
}

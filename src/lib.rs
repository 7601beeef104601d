//! Hybrid REST/binary-API client library for administering MikroTik
//! RouterOS devices at scale.
//!
//! The facade ([`client::RouterClient`]) speaks either the legacy binary
//! sentence protocol or the modern REST interface, routing every read,
//! write, and follow-mode stream through the same stability envelope:
//! an adaptive rate limiter, a circuit breaker, a short-TTL read cache,
//! and an offline command queue. On top of that sits a reactive
//! collection layer ([`mirror`]/[`subscription`]) that turns a follow
//! stream into a locally-coherent, diffable, throttled snapshot feed.

pub mod auth;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod codec;
pub mod collection_utils;
pub mod command;
pub mod config;
pub mod error;
pub mod mirror;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod ratelimit;
pub mod router;
pub mod subscription;
pub mod swarm;
pub mod transport;

pub use client::{
    CollectionHandle, CommandBuilder, ConnectionState, RouterClient, StreamTarget, Transaction, WriteOptions,
    WriteOutcome,
};
pub use command::Params;
pub use config::{AliasResolver, Config, NoopAliasResolver, Protocol};
pub use error::{Error, Result};
pub use mirror::{LiveMirror, MirrorKey};
pub use parser::RouterRow;
pub use pool::ConnectionPool;
pub use queue::{Action, DeferredTask, OfflineQueue};
pub use router::{RequestOutcome, StreamHandle};
pub use subscription::{Diff, Emission, ForeignReader, JoinSpec, Subscription, SubscriptionOptions};
pub use swarm::{NodeOutcome, Swarm};

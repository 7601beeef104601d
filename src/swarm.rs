//! Swarm (§4.N): a named map of independent facades, broadcast/multicast
//! fanned out concurrently. A failure on one node never cancels the others
//! and never surfaces as an `Err` from the swarm call itself — outcomes are
//! collected per node, the same shape `control_api::fetch_server_streams`
//! uses when polling multiple upstream services and reporting per-service
//! results rather than failing the whole poll.

use std::collections::HashMap;

use futures_util::future::join_all;

use crate::client::{RouterClient, WriteOutcome};
use crate::command::Params;
use crate::error::Error;

/// The result of one node's attempt within a broadcast/multicast.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub node_id: String,
    pub success: bool,
    pub data: Option<WriteOutcome>,
    pub error: Option<Error>,
}

/// A named collection of facades addressed together.
#[derive(Default)]
pub struct Swarm {
    nodes: HashMap<String, RouterClient>,
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node_id: impl Into<String>, client: RouterClient) {
        self.nodes.insert(node_id.into(), client);
    }

    pub fn remove(&mut self, node_id: &str) -> Option<RouterClient> {
        self.nodes.remove(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&RouterClient> {
        self.nodes.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fan `command`/`params` out to every node concurrently.
    pub async fn broadcast(&self, path: &str, params: Params) -> Vec<NodeOutcome> {
        self.dispatch(self.nodes.keys().cloned().collect(), path, params).await
    }

    /// Fan out to only the named subset of nodes. Unknown ids report as a
    /// failed outcome rather than being silently dropped, so a caller's
    /// typo is visible in the result set.
    pub async fn multicast(&self, node_ids: &[&str], path: &str, params: Params) -> Vec<NodeOutcome> {
        self.dispatch(node_ids.iter().map(|s| (*s).to_owned()).collect(), path, params).await
    }

    async fn dispatch(&self, node_ids: Vec<String>, path: &str, params: Params) -> Vec<NodeOutcome> {
        let attempts = node_ids.into_iter().map(|node_id| {
            let params = params.clone();
            async move {
                match self.nodes.get(&node_id) {
                    Some(client) => {
                        // Broadcasts span many nodes; a node that's briefly
                        // unreachable should queue its write rather than
                        // fail the whole fan-out, so swarm writes opt into
                        // offline deferral unconditionally.
                        let opts = crate::client::WriteOptions { persistent: true, ..Default::default() };
                        match client.write(path, params, opts).await {
                            Ok(outcome) => NodeOutcome { node_id, success: true, data: Some(outcome), error: None },
                            Err(e) => NodeOutcome { node_id, success: false, data: None, error: Some(e) },
                        }
                    }
                    None => NodeOutcome {
                        node_id: node_id.clone(),
                        success: false,
                        data: None,
                        error: Some(Error::Config(format!("unknown swarm node {node_id:?}"))),
                    },
                }
            }
        });
        join_all(attempts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn test_swarm(node_ids: &[&str]) -> Swarm {
        let mut swarm = Swarm::new();
        for id in node_ids {
            swarm.insert(*id, crate::client::test_client(Protocol::Rest));
        }
        swarm
    }

    #[tokio::test]
    async fn broadcast_collects_one_outcome_per_node() {
        let swarm = test_swarm(&["r1", "r2", "r3"]);
        let outcomes = swarm.broadcast("/ip/address/add", Params::new().attr("address", "10.0.0.1/24")).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[tokio::test]
    async fn multicast_reports_unknown_node_ids_as_failures_without_aborting() {
        let swarm = test_swarm(&["r1"]);
        let outcomes = swarm.multicast(&["r1", "ghost"], "/ip/address/add", Params::new()).await;
        assert_eq!(outcomes.len(), 2);
        let ghost = outcomes.iter().find(|o| o.node_id == "ghost").unwrap();
        assert!(!ghost.success);
        assert!(ghost.error.is_some());
        let r1 = outcomes.iter().find(|o| o.node_id == "r1").unwrap();
        assert!(r1.success);
    }

    #[tokio::test]
    async fn empty_swarm_broadcast_returns_empty_outcomes() {
        let swarm = Swarm::new();
        let outcomes = swarm.broadcast("/ip/address/add", Params::new()).await;
        assert!(outcomes.is_empty());
    }
}

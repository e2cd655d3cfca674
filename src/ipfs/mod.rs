//! The IPFS capability surface the database depends on.
//!
//! The database core is generic over [`IpfsApi`]. Two implementations are
//! provided: [`HttpIpfs`] drives a running IPFS daemon over its HTTP RPC
//! API, and [`MemIpfs`] is a complete in-memory node used by the test suite
//! and for offline work.

use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;
use libipld::Ipld;

use crate::error::Result;

mod http;
mod mem;

pub use http::HttpIpfs;
pub use mem::{MemIpfs, MemSwarm};

/// Input encoding for data handed to `dag_put`.
pub const INPUT_ENCODING: &str = "json";

/// Storage format for DAG nodes written by `dag_put`.
pub const STORE_FORMAT: &str = "cbor";

/// Multicodec code for DAG-CBOR.
pub(crate) const DAG_CBOR: u64 = 0x71;

/// Multicodec code for raw blocks.
pub(crate) const RAW: u64 = 0x55;

/// A named outgoing link of a DAG node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub cid: Cid,
}

/// A message received on a pubsub topic.
#[derive(Debug, Clone)]
pub struct PubsubMessage {
    /// Peer ID of the sender.
    pub from: String,
    pub data: Bytes,
}

/// Stream of messages produced by a subscription.
pub type MessageStream = BoxStream<'static, Result<PubsubMessage>>;

/// Capabilities of an IPFS node, as used by the database.
///
/// Handles are cheap to clone and shared per database instance; all
/// operations abort when the owning database cancels its lifetime token.
#[async_trait]
pub trait IpfsApi: Clone + Send + Sync + Debug + 'static {
    /// Parses `data` as JSON and stores it as a DAG-CBOR node, returning the
    /// root CID. Pins the node recursively when `pin` is set.
    async fn dag_put(&self, data: &[u8], pin: bool) -> Result<Cid>;

    /// Resolves a path (a CID with an optional `/field/...` remainder) to
    /// the addressed node or scalar.
    async fn dag_get(&self, path: &str) -> Result<Ipld>;

    /// Creates an empty directory node and returns its CID.
    async fn new_dag_node(&self) -> Result<Cid>;

    /// Returns the CID of a new directory node identical to `base` except
    /// with the named link set to `child`.
    async fn add_link(&self, base: &Cid, child: &Cid, name: &str) -> Result<Cid>;

    /// Returns the CID of a new directory node with the named link removed.
    async fn rm_link(&self, base: &Cid, name: &str) -> Result<Cid>;

    /// Enumerates the outgoing named links of a node. An empty list is a
    /// valid outcome.
    async fn node_links(&self, cid: &Cid) -> Result<Vec<Link>>;

    /// Removes a local pin. Unpinning a CID that was never pinned succeeds.
    async fn unpin(&self, cid: &Cid) -> Result<()>;

    /// Publishes a message on a topic.
    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;

    /// Subscribes to a topic, with DHT peer discovery enabled.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream>;

    /// Ends the subscription for a topic.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Imports a local file, returning the root CID.
    async fn add_file(&self, path: &Path, pin: bool) -> Result<Cid>;

    /// Exports the file behind `cid` to `out`.
    async fn get_file(&self, cid: &Cid, out: &Path) -> Result<()>;

    /// Connects the node to the given peer multiaddresses.
    async fn connect(&self, peers: &[String]) -> Result<()>;

    /// Whether the node currently has its networking up.
    fn is_online(&self) -> bool;

    /// Peer ID of the node.
    async fn peer_id(&self) -> Result<String>;

    /// A publicly reachable multiaddress of the node, if known.
    async fn public_address(&self) -> Result<String>;

    /// Shuts the node connection down.
    async fn end_session(&self) -> Result<()>;
}

/// Converts a JSON document into IPLD, the shape `dag_put` stores.
pub(crate) fn json_to_ipld(value: serde_json::Value) -> Ipld {
    match value {
        serde_json::Value::Null => Ipld::Null,
        serde_json::Value::Bool(b) => Ipld::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ipld::Integer(i as i128)
            } else {
                Ipld::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Ipld::String(s),
        serde_json::Value::Array(values) => {
            Ipld::List(values.into_iter().map(json_to_ipld).collect())
        }
        serde_json::Value::Object(entries) => Ipld::StringMap(
            entries
                .into_iter()
                .map(|(k, v)| (k, json_to_ipld(v)))
                .collect(),
        ),
    }
}

/// Converts an IPLD node back into JSON. Bytes are base64 armored and links
/// become CID strings, matching the record wire encoding.
pub(crate) fn ipld_to_json(ipld: Ipld) -> serde_json::Value {
    match ipld {
        Ipld::Null => serde_json::Value::Null,
        Ipld::Bool(b) => serde_json::Value::Bool(b),
        Ipld::Integer(i) => serde_json::json!(i as i64),
        Ipld::Float(f) => serde_json::json!(f),
        Ipld::String(s) => serde_json::Value::String(s),
        Ipld::Bytes(b) => serde_json::Value::String(base64::encode(b)),
        Ipld::List(items) => {
            serde_json::Value::Array(items.into_iter().map(ipld_to_json).collect())
        }
        Ipld::StringMap(entries) => serde_json::Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, ipld_to_json(v)))
                .collect(),
        ),
        Ipld::Link(cid) => serde_json::Value::String(cid.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_ipld_round_trip() {
        let value = serde_json::json!({
            "uuid": "0b96a374-1c31-4c49-9773-ff2b98a5a08e",
            "encrypted": false,
            "barcodes": {"a": 1, "b": 2},
            "history": [{"text": "record created.", "previousCID": ""}],
        });
        let round_tripped = ipld_to_json(json_to_ipld(value.clone()));
        assert_eq!(round_tripped, value);
    }
}

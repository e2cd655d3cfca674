//! A complete in-memory IPFS node.
//!
//! Blocks, pins and pubsub all live in process memory. Content addressing is
//! real: blocks are DAG-CBOR encoded and named by their sha2-256 multihash,
//! so CIDs are stable across handles and processes. A [`MemSwarm`] is the
//! shared network; every handle created from it sees the same block store
//! and can exchange pubsub messages with the others.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use futures::StreamExt;
use libipld::cbor::DagCborCodec;
use libipld::prelude::Codec;
use libipld::Ipld;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{json_to_ipld, IpfsApi, Link, MessageStream, PubsubMessage, DAG_CBOR, RAW};
use crate::error::{Error, Result};

const LINKS_KEY: &str = "links";
const TOPIC_CAPACITY: usize = 1024;

/// The shared fabric connecting in-memory nodes.
#[derive(Debug, Default)]
pub struct MemSwarm {
    blocks: Mutex<HashMap<Cid, Bytes>>,
    topics: Mutex<HashMap<String, broadcast::Sender<PubsubMessage>>>,
    next_peer: AtomicU64,
}

impl MemSwarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a new node attached to this swarm.
    pub fn client(self: &Arc<Self>) -> MemIpfs {
        let n = self.next_peer.fetch_add(1, Ordering::Relaxed);
        MemIpfs {
            inner: Arc::new(MemInner {
                swarm: Arc::clone(self),
                peer_id: format!("mempeer{}", n),
                online: AtomicBool::new(true),
                pins: Mutex::new(HashSet::new()),
                subs: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn topic(&self, name: &str) -> broadcast::Sender<PubsubMessage> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

/// An in-memory IPFS node handle.
#[derive(Debug, Clone)]
pub struct MemIpfs {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    swarm: Arc<MemSwarm>,
    peer_id: String,
    online: AtomicBool,
    pins: Mutex<HashSet<Cid>>,
    subs: Mutex<HashMap<String, CancellationToken>>,
}

impl MemIpfs {
    /// A standalone node on a private swarm, for single-handle use.
    pub fn standalone() -> Self {
        MemSwarm::new().client()
    }

    fn put_block(&self, codec: u64, data: Vec<u8>) -> Cid {
        let cid = Cid::new_v1(codec, Code::Sha2_256.digest(&data));
        self.inner
            .swarm
            .blocks
            .lock()
            .unwrap()
            .insert(cid, Bytes::from(data));
        cid
    }

    fn get_block(&self, cid: &Cid) -> Result<Bytes> {
        self.inner
            .swarm
            .blocks
            .lock()
            .unwrap()
            .get(cid)
            .cloned()
            .ok_or_else(|| anyhow!("block not found: {}", cid).into())
    }

    fn get_dir(&self, cid: &Cid) -> Result<std::collections::BTreeMap<String, Ipld>> {
        let bytes = self.get_block(cid)?;
        let node: Ipld = DagCborCodec
            .decode(&bytes)
            .map_err(|e| anyhow!("invalid dag cbor: {:?}", e))?;
        match node {
            Ipld::StringMap(mut map) => match map.remove(LINKS_KEY) {
                Some(Ipld::StringMap(links)) => Ok(links),
                Some(_) => Err(anyhow!("malformed directory node: {}", cid).into()),
                None => Ok(Default::default()),
            },
            _ => Err(anyhow!("not a directory node: {}", cid).into()),
        }
    }

    fn put_dir(&self, links: std::collections::BTreeMap<String, Ipld>) -> Result<Cid> {
        let node = Ipld::StringMap([(LINKS_KEY.to_string(), Ipld::StringMap(links))].into_iter().collect());
        let bytes = DagCborCodec
            .encode(&node)
            .map_err(|e| anyhow!("dag cbor encode failed: {:?}", e))?;
        Ok(self.put_block(DAG_CBOR, bytes))
    }
}

#[async_trait]
impl IpfsApi for MemIpfs {
    async fn dag_put(&self, data: &[u8], pin: bool) -> Result<Cid> {
        let value: serde_json::Value =
            serde_json::from_slice(data).context("input is not valid JSON")?;
        let ipld = json_to_ipld(value);
        let bytes = DagCborCodec
            .encode(&ipld)
            .map_err(|e| anyhow!("dag cbor encode failed: {:?}", e))?;
        let cid = self.put_block(DAG_CBOR, bytes);
        if pin {
            self.inner.pins.lock().unwrap().insert(cid);
        }
        trace!("dag_put {}", cid);
        Ok(cid)
    }

    async fn dag_get(&self, path: &str) -> Result<Ipld> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let root = parts.next().ok_or(Error::NoCid)?;
        let cid: Cid = root.parse().context("invalid cid")?;
        if cid.codec() != DAG_CBOR {
            return Err(Error::NodeFormat(cid));
        }

        let bytes = self.get_block(&cid)?;
        let mut node: Ipld = DagCborCodec
            .decode(&bytes)
            .map_err(|e| anyhow!("invalid dag cbor: {:?}", e))?;

        // resolve the path remainder down to a scalar or sub-node
        for part in parts {
            node = match node {
                Ipld::StringMap(mut map) => map
                    .remove(part)
                    .ok_or_else(|| anyhow!("no field {} in node", part))?,
                Ipld::List(mut items) => {
                    let idx: usize = part.parse().context("invalid list index")?;
                    if idx >= items.len() {
                        return Err(anyhow!("index {} out of bounds", idx).into());
                    }
                    items.swap_remove(idx)
                }
                _ => return Err(anyhow!("cannot descend into scalar at {}", part).into()),
            };
        }
        Ok(node)
    }

    async fn new_dag_node(&self) -> Result<Cid> {
        self.put_dir(Default::default())
    }

    async fn add_link(&self, base: &Cid, child: &Cid, name: &str) -> Result<Cid> {
        let mut links = self.get_dir(base)?;
        links.insert(name.to_string(), Ipld::Link(*child));
        self.put_dir(links)
    }

    async fn rm_link(&self, base: &Cid, name: &str) -> Result<Cid> {
        let mut links = self.get_dir(base)?;
        if links.remove(name).is_none() {
            return Err(anyhow!("no link named {} under {}", name, base).into());
        }
        self.put_dir(links)
    }

    async fn node_links(&self, cid: &Cid) -> Result<Vec<Link>> {
        let links = self.get_dir(cid)?;
        links
            .into_iter()
            .map(|(name, value)| match value {
                Ipld::Link(cid) => Ok(Link { name, cid }),
                _ => Err(anyhow!("link {} does not point at a node", name).into()),
            })
            .collect()
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        self.inner.pins.lock().unwrap().remove(cid);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let sender = self.inner.swarm.topic(topic);
        // a send error only means nobody is listening
        let _ = sender.send(PubsubMessage {
            from: self.inner.peer_id.clone(),
            data,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let mut rx = self.inner.swarm.topic(topic).subscribe();
        let token = CancellationToken::new();
        self.inner
            .subs
            .lock()
            .unwrap()
            .insert(topic.to_string(), token.clone());

        let stream = async_stream::stream! {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => yield Ok(msg),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            yield Err(Error::Ipfs(anyhow!(
                                "subscription lagged, {} messages dropped",
                                n
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        match self.inner.subs.lock().unwrap().remove(topic) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(Error::NoSub),
        }
    }

    async fn add_file(&self, path: &Path, pin: bool) -> Result<Cid> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("could not read {}", path.display()))?;
        let cid = self.put_block(RAW, data);
        if pin {
            self.inner.pins.lock().unwrap().insert(cid);
        }
        Ok(cid)
    }

    async fn get_file(&self, cid: &Cid, out: &Path) -> Result<()> {
        let data = self.get_block(cid)?;
        tokio::fs::write(out, &data)
            .await
            .with_context(|| format!("could not write {}", out.display()))?;
        Ok(())
    }

    async fn connect(&self, peers: &[String]) -> Result<()> {
        trace!("connect to {} peers", peers.len());
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    async fn peer_id(&self) -> Result<String> {
        Ok(self.inner.peer_id.clone())
    }

    async fn public_address(&self) -> Result<String> {
        Ok(format!("/memory/{}", self.inner.peer_id))
    }

    async fn end_session(&self) -> Result<()> {
        for (_, token) in self.inner.subs.lock().unwrap().drain() {
            token.cancel();
        }
        self.inner.online.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dag_round_trip() {
        let ipfs = MemIpfs::standalone();
        let doc = br#"{"alias": "mem test", "count": 3}"#;

        let cid = ipfs.dag_put(doc, false).await.unwrap();
        assert_eq!(cid.codec(), DAG_CBOR);

        // identical bytes produce an identical cid
        let again = ipfs.dag_put(doc, true).await.unwrap();
        assert_eq!(cid, again);

        let node = ipfs.dag_get(&cid.to_string()).await.unwrap();
        match node {
            Ipld::StringMap(map) => {
                assert_eq!(map.get("alias"), Some(&Ipld::String("mem test".into())));
            }
            other => panic!("unexpected node: {:?}", other),
        }

        // path remainder resolves to a scalar
        let field = ipfs
            .dag_get(&format!("{}/count", cid))
            .await
            .unwrap();
        assert_eq!(field, Ipld::Integer(3));
    }

    #[tokio::test]
    async fn raw_nodes_are_rejected_by_dag_get() {
        let ipfs = MemIpfs::standalone();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload");
        tokio::fs::write(&file, b"raw bytes").await.unwrap();

        let cid = ipfs.add_file(&file, false).await.unwrap();
        assert!(matches!(
            ipfs.dag_get(&cid.to_string()).await,
            Err(Error::NodeFormat(_))
        ));
    }

    #[tokio::test]
    async fn links_add_and_remove() {
        let ipfs = MemIpfs::standalone();
        let root = ipfs.new_dag_node().await.unwrap();
        assert!(ipfs.node_links(&root).await.unwrap().is_empty());

        let child = ipfs.dag_put(br#"{"entry": 1}"#, false).await.unwrap();
        let with_link = ipfs.add_link(&root, &child, "first").await.unwrap();
        assert_ne!(root, with_link);

        let links = ipfs.node_links(&with_link).await.unwrap();
        assert_eq!(
            links,
            vec![Link {
                name: "first".to_string(),
                cid: child
            }]
        );

        // overwriting the same name with the same target is a no-op cid-wise
        let same = ipfs.add_link(&with_link, &child, "first").await.unwrap();
        assert_eq!(with_link, same);

        let without = ipfs.rm_link(&with_link, "first").await.unwrap();
        assert_eq!(without, root);
        assert!(ipfs.rm_link(&without, "first").await.is_err());
    }

    #[tokio::test]
    async fn pubsub_fan_out() {
        let swarm = MemSwarm::new();
        let a = swarm.client();
        let b = swarm.client();

        let mut sub = b.subscribe("shared-topic").await.unwrap();
        a.publish("shared-topic", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let msg = sub.next().await.unwrap().unwrap();
        assert_eq!(msg.data.as_ref(), b"hello");
        assert_eq!(msg.from, a.peer_id().await.unwrap());

        // the stream terminates after unsubscribe
        b.unsubscribe("shared-topic").await.unwrap();
        assert!(sub.next().await.is_none());
        assert!(matches!(
            b.unsubscribe("shared-topic").await,
            Err(Error::NoSub)
        ));
    }

    #[tokio::test]
    async fn end_session_goes_offline() {
        let ipfs = MemIpfs::standalone();
        assert!(ipfs.is_online());
        ipfs.end_session().await.unwrap();
        assert!(!ipfs.is_online());
    }
}

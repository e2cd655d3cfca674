//! Tracking of the project directory node.
//!
//! The project is a directory DAG node whose named links encode the
//! database: link name = user key, link target = the record's CID. The root
//! CID of that node is the snapshot; sharing it is sufficient for any peer
//! to reconstruct the whole database. This module keeps the current root
//! together with an in-memory index mirroring its links.

use std::collections::BTreeMap;

use cid::Cid;

use crate::error::{Error, Result};
use crate::ipfs::IpfsApi;

/// The current snapshot root and the key index mirroring its links.
///
/// The index is authoritative within the process; the directory node is
/// authoritative across processes. After every successful mutation the
/// node's link set equals the index.
#[derive(Debug)]
pub(crate) struct Snapshot {
    root: Cid,
    index: BTreeMap<String, Cid>,
}

impl Snapshot {
    /// Starts an empty snapshot from a fresh directory node.
    pub async fn new<I: IpfsApi>(ipfs: &I) -> Result<Self> {
        let root = ipfs
            .new_dag_node()
            .await
            .map_err(|e| Error::SnapshotUpdate(e.into()))?;
        Ok(Snapshot {
            root,
            index: BTreeMap::new(),
        })
    }

    /// Resumes from an existing snapshot, populating the index from the
    /// node's links.
    pub async fn from_cid<I: IpfsApi>(ipfs: &I, root: Cid) -> Result<Self> {
        let links = ipfs
            .node_links(&root)
            .await
            .map_err(|e| Error::InvalidSnapshot(e.into()))?;
        let index = links
            .into_iter()
            .map(|link| (link.name, link.cid))
            .collect();
        Ok(Snapshot { root, index })
    }

    pub fn root(&self) -> Cid {
        self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Looks a key up in the index.
    pub fn resolve(&self, key: &str) -> Option<Cid> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Cid)> {
        self.index.iter()
    }

    /// Points the named link at `child`, producing a new snapshot root. The
    /// index is only updated once the node mutation has succeeded.
    pub async fn put_link<I: IpfsApi>(&mut self, ipfs: &I, key: &str, child: Cid) -> Result<()> {
        let root = ipfs
            .add_link(&self.root, &child, key)
            .await
            .map_err(|e| Error::SnapshotUpdate(e.into()))?;
        self.root = root;
        self.index.insert(key.to_string(), child);
        Ok(())
    }

    /// Removes the named link, producing a new snapshot root.
    pub async fn drop_link<I: IpfsApi>(&mut self, ipfs: &I, key: &str) -> Result<()> {
        let root = ipfs
            .rm_link(&self.root, key)
            .await
            .map_err(|e| Error::SnapshotUpdate(e.into()))?;
        self.root = root;
        self.index.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfs::MemIpfs;

    async fn store_record(ipfs: &MemIpfs, body: &str) -> Cid {
        ipfs.dag_put(body.as_bytes(), false).await.unwrap()
    }

    #[tokio::test]
    async fn index_mirrors_node_links() {
        let ipfs = MemIpfs::standalone();
        let mut snapshot = Snapshot::new(&ipfs).await.unwrap();
        assert!(snapshot.is_empty());

        let a = store_record(&ipfs, r#"{"alias": "a"}"#).await;
        let b = store_record(&ipfs, r#"{"alias": "b"}"#).await;
        snapshot.put_link(&ipfs, "key-a", a).await.unwrap();
        snapshot.put_link(&ipfs, "key-b", b).await.unwrap();

        let links = ipfs.node_links(&snapshot.root()).await.unwrap();
        let from_node: BTreeMap<String, Cid> =
            links.into_iter().map(|l| (l.name, l.cid)).collect();
        let from_index: BTreeMap<String, Cid> = snapshot
            .entries()
            .map(|(k, c)| (k.clone(), *c))
            .collect();
        assert_eq!(from_node, from_index);

        snapshot.drop_link(&ipfs, "key-a").await.unwrap();
        assert_eq!(snapshot.resolve("key-a"), None);
        assert_eq!(snapshot.resolve("key-b"), Some(b));
        let links = ipfs.node_links(&snapshot.root()).await.unwrap();
        assert_eq!(links.len(), 1);
    }

    #[tokio::test]
    async fn root_changes_iff_links_change() {
        let ipfs = MemIpfs::standalone();
        let mut snapshot = Snapshot::new(&ipfs).await.unwrap();
        let empty_root = snapshot.root();

        let a = store_record(&ipfs, r#"{"alias": "a"}"#).await;
        snapshot.put_link(&ipfs, "key", a).await.unwrap();
        let one_entry = snapshot.root();
        assert_ne!(empty_root, one_entry);

        // same key, same target: no change
        snapshot.put_link(&ipfs, "key", a).await.unwrap();
        assert_eq!(snapshot.root(), one_entry);

        snapshot.drop_link(&ipfs, "key").await.unwrap();
        assert_eq!(snapshot.root(), empty_root);
    }

    #[tokio::test]
    async fn resume_from_existing_root() {
        let ipfs = MemIpfs::standalone();
        let mut snapshot = Snapshot::new(&ipfs).await.unwrap();
        let a = store_record(&ipfs, r#"{"alias": "a"}"#).await;
        snapshot.put_link(&ipfs, "carried", a).await.unwrap();

        let resumed = Snapshot::from_cid(&ipfs, snapshot.root()).await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed.resolve("carried"), Some(a));
    }

    #[tokio::test]
    async fn unreachable_root_is_invalid() {
        let ipfs = MemIpfs::standalone();
        let other = MemIpfs::standalone();
        let mut snapshot = Snapshot::new(&other).await.unwrap();
        let a = store_record(&other, r#"{"alias": "a"}"#).await;
        snapshot.put_link(&other, "key", a).await.unwrap();

        // the root lives on a different swarm and cannot be resolved here
        let res = Snapshot::from_cid(&ipfs, snapshot.root()).await;
        assert!(matches!(res, Err(Error::InvalidSnapshot(_))));
    }
}

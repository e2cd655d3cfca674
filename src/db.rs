//! The database façade.
//!
//! A [`Db`] binds a project name to a snapshot lineage and an IPFS node.
//! Records are written as DAG nodes and linked into the project directory
//! node under their user-supplied key; the directory root is the snapshot
//! and sharing it is a complete, shareable database state.

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto;
use crate::error::{Error, Result};
use crate::ipfs::{HttpIpfs, IpfsApi};
use crate::record::Record;
use crate::snapshot::Snapshot;

/// Project name used when none is provided.
pub const DEFAULT_PROJECT: &str = "starkdb-default-project";

/// Default cap on the number of database entries.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Minimum number of bootstrapper addresses needed for peer discovery.
pub const MIN_BOOTSTRAPPERS: usize = 3;

/// Environment variable holding the encryption password.
pub const ENV_DB_PASSWORD: &str = "STARK_DB_PASSWORD";

/// Environment variable holding the Pinata API key.
pub const ENV_PINATA_API_KEY: &str = "PINATA_API_KEY";

/// Environment variable holding the Pinata secret key.
pub const ENV_PINATA_SECRET_KEY: &str = "PINATA_SECRET_KEY";

/// Bootstrapper nodes used for peer discovery when none are provided.
pub const DEFAULT_BOOTSTRAPPERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/138.201.67.219/tcp/4001/p2p/QmUd6zHcbkbcs7SMxwLs48qZVX3vpcM8errYS7xEczwRMA",
    "/ip4/138.201.67.220/tcp/4001/p2p/QmNSYxZAiJHeLdkBg38roksAR9So7Y5eojks1yjEcUtZ7i",
    "/ip4/138.201.68.74/tcp/4001/p2p/QmdnXwLrC8p1ueiq2Qya8joNvk3TVVDAut7PrikmZwubtR",
    "/ip4/94.130.135.167/tcp/4001/p2p/QmUEMvxS2e7iDrereVYc5SWPauXPyNwxcy9BXZrC1QTcHE",
];

/// Remote pinning collaborator, invoked when the pinning interval fires.
///
/// The HTTP client talking to the pinning service lives with the caller;
/// the database only drives this interface.
#[async_trait]
pub trait RemotePin: Send + Sync + std::fmt::Debug + 'static {
    /// Pins the given snapshot root remotely, returning a status line.
    async fn pin(&self, cid: &Cid) -> Result<String>;
}

/// Builder for opening a database instance.
#[derive(Debug, Default)]
pub struct DbBuilder {
    project: Option<String>,
    snapshot_cid: Option<String>,
    pinning: Option<bool>,
    announcing: Option<bool>,
    encryption: Option<bool>,
    max_entries: Option<usize>,
    bootstrappers: Option<Vec<String>>,
    extra_peers: Vec<String>,
    pinata_interval: u64,
    remote_pinner: Option<Arc<dyn RemotePin>>,
    log_channel: Option<mpsc::UnboundedSender<String>>,
}

impl DbBuilder {
    /// Sets the project this instance manages. The name doubles as the
    /// pubsub topic for announcements; spaces are collapsed to underscores.
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Resumes the database from an existing snapshot CID.
    pub fn snapshot_cid(mut self, cid: impl Into<String>) -> Self {
        self.snapshot_cid = Some(cid.into());
        self
    }

    /// Controls whether written records are pinned by the node. On by
    /// default.
    pub fn pinning(mut self, pinning: bool) -> Self {
        self.pinning = Some(pinning);
        self
    }

    /// Announce the CID of every written record on the project topic.
    pub fn announcing(mut self, announcing: bool) -> Self {
        self.announcing = Some(announcing);
        self
    }

    /// Encrypt protected record fields before writing. Requires a password
    /// in the `STARK_DB_PASSWORD` environment variable.
    pub fn encryption(mut self, encryption: bool) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Caps the number of entries the database will hold.
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Replaces the default bootstrapper list.
    pub fn bootstrappers(mut self, peers: Vec<String>) -> Self {
        self.bootstrappers = Some(peers);
        self
    }

    /// Adds peers on top of the bootstrapper list.
    pub fn extra_peers(mut self, peers: Vec<String>) -> Self {
        self.extra_peers = peers;
        self
    }

    /// Pins the database snapshot with the remote pinning collaborator
    /// every `interval` writes. 0 disables remote pinning. Requires the
    /// `PINATA_API_KEY` and `PINATA_SECRET_KEY` environment variables and
    /// an active pinning flag.
    pub fn pinata_interval(mut self, interval: u64) -> Self {
        self.pinata_interval = interval;
        self
    }

    /// Supplies the remote pinning implementation.
    pub fn remote_pinner(mut self, pinner: Arc<dyn RemotePin>) -> Self {
        self.remote_pinner = Some(pinner);
        self
    }

    /// Attaches a channel that receives internal state messages for the
    /// lifetime of the instance.
    pub fn log_channel(mut self, sender: mpsc::UnboundedSender<String>) -> Self {
        self.log_channel = Some(sender);
        self
    }

    /// Opens the database against the local IPFS daemon.
    pub async fn open(self) -> Result<Db<HttpIpfs>> {
        let cancel = CancellationToken::new();
        let ipfs = HttpIpfs::open(cancel.clone()).await?;
        self.open_inner(ipfs, cancel).await
    }

    /// Opens the database against a caller-supplied IPFS handle.
    pub async fn open_with_client<I: IpfsApi>(self, ipfs: I) -> Result<Db<I>> {
        self.open_inner(ipfs, CancellationToken::new()).await
    }

    async fn open_inner<I: IpfsApi>(self, ipfs: I, cancel: CancellationToken) -> Result<Db<I>> {
        let project = sanitize_project(self.project.as_deref().unwrap_or(DEFAULT_PROJECT))?;

        let cipher_key = if self.encryption.unwrap_or(false) {
            let password =
                std::env::var(ENV_DB_PASSWORD).map_err(|_| Error::NoEnvSet(ENV_DB_PASSWORD))?;
            warn!(
                "encryption uses a legacy MD5-based key derivation for record \
                 compatibility; treat the password as the full secret"
            );
            Some(crypto::password_to_cipher_key(&password)?)
        } else {
            None
        };

        let pinning = self.pinning.unwrap_or(true);
        if self.pinata_interval > 0 {
            if !pinning {
                return Err(Error::DbOption(
                    "remote pinning requires pinning to be enabled".to_string(),
                ));
            }
            if std::env::var(ENV_PINATA_API_KEY).is_err() {
                return Err(Error::PinataKey);
            }
            if std::env::var(ENV_PINATA_SECRET_KEY).is_err() {
                return Err(Error::PinataSecret);
            }
            if self.remote_pinner.is_none() {
                return Err(Error::DbOption(
                    "remote pinning requires a pinner implementation".to_string(),
                ));
            }
        }

        let mut peers: Vec<String> = match self.bootstrappers {
            Some(peers) if peers.is_empty() => return Err(Error::NoPeers),
            Some(peers) => peers,
            None => DEFAULT_BOOTSTRAPPERS.iter().map(|s| s.to_string()).collect(),
        };
        peers.extend(self.extra_peers);
        if peers.len() < MIN_BOOTSTRAPPERS {
            return Err(Error::Bootstrappers);
        }

        // bootstrap in the background, the node is usable meanwhile
        {
            let ipfs = ipfs.clone();
            let log = self.log_channel.clone();
            tokio::spawn(async move {
                if let Err(err) = ipfs.connect(&peers).await {
                    warn!("bootstrapping failed: {}", err);
                    if let Some(log) = &log {
                        let _ = log.send(format!("bootstrapping failed: {}", err));
                    }
                }
            });
        }

        let snapshot = match self.snapshot_cid {
            None => Snapshot::new(&ipfs).await?,
            Some(cid) if cid.is_empty() => return Err(Error::NoCid),
            Some(cid) => {
                let root: Cid = cid
                    .parse()
                    .map_err(|e: cid::Error| Error::InvalidSnapshot(e.into()))?;
                Snapshot::from_cid(&ipfs, root).await?
            }
        };

        let db = Db {
            ipfs,
            project,
            pinning,
            announcing: self.announcing.unwrap_or(false),
            max_entries: self.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
            cipher_key,
            pinata_interval: self.pinata_interval,
            remote_pinner: self.remote_pinner,
            state: Arc::new(RwLock::new(DbState {
                snapshot,
                session_entries: 0,
            })),
            cancel,
            log: self.log_channel,
        };
        db.send_to_log(format!("database ready: project {}", db.project));
        Ok(db)
    }
}

pub(crate) struct DbState {
    pub(crate) snapshot: Snapshot,
    pub(crate) session_entries: u64,
}

/// A database instance.
///
/// The handle is cheap to clone; all clones share the snapshot state and
/// the IPFS node. Mutating operations serialize behind a write lock,
/// read-only operations share a read lock.
#[derive(Clone)]
pub struct Db<I: IpfsApi = HttpIpfs> {
    pub(crate) ipfs: I,
    pub(crate) project: String,
    pub(crate) pinning: bool,
    pub(crate) announcing: bool,
    pub(crate) max_entries: usize,
    pub(crate) cipher_key: Option<Vec<u8>>,
    pub(crate) pinata_interval: u64,
    pub(crate) remote_pinner: Option<Arc<dyn RemotePin>>,
    pub(crate) state: Arc<RwLock<DbState>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) log: Option<mpsc::UnboundedSender<String>>,
}

impl<I: IpfsApi> std::fmt::Debug for Db<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("project", &self.project)
            .field("pinning", &self.pinning)
            .field("announcing", &self.announcing)
            .field("max_entries", &self.max_entries)
            .field("encrypted", &self.cipher_key.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct DbMetadata {
    project: String,
    snapshot: String,
    host_node: String,
    host_address: String,
    pinning: bool,
    announcing: bool,
    max_entries: usize,
    current_entries: usize,
    contents: Vec<(String, String)>,
}

impl Db {
    /// Returns a builder for opening a database.
    pub fn builder() -> DbBuilder {
        DbBuilder::default()
    }
}

impl<I: IpfsApi> Db<I> {
    /// The project this instance manages.
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn pinning(&self) -> bool {
        self.pinning
    }

    pub fn announcing(&self) -> bool {
        self.announcing
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of entries currently held.
    pub async fn current_entries(&self) -> usize {
        self.state.read().await.snapshot.len()
    }

    /// Adds a record to the database under the provided key.
    ///
    /// If the key is already in use the incoming record must be a
    /// continuation of the stored one: same UUID, `previous_cid` equal to
    /// the stored CID, and a strictly newer last-updated timestamp.
    ///
    /// Returns the stored copy of the record, with its `previous_cid` set
    /// to the new CID so further updates can be chained from it.
    pub async fn set(&self, key: &str, record: &Record) -> Result<Record> {
        let mut state = self.state.write().await;

        if !state.snapshot.contains(key) && state.snapshot.len() >= self.max_entries {
            return Err(Error::MaxEntriesExceeded(self.max_entries));
        }

        let mut record = record.clone();
        if let Some(existing_cid) = state.snapshot.resolve(key) {
            let existing = self.fetch_record(existing_cid).await?;

            if existing.uuid() != record.uuid() {
                return Err(Error::AttemptedOverwrite);
            }
            if existing_cid.to_string() != record.previous_cid() {
                return Err(Error::RecordHistory);
            }
            let newer = match (
                existing.last_updated_timestamp(),
                record.last_updated_timestamp(),
            ) {
                (Some(old), Some(new)) => new > old,
                (None, Some(_)) => true,
                (_, None) => false,
            };
            if !newer {
                return Err(Error::AttemptedUpdate);
            }
            record.add_comment("updating record.");
        }
        record.add_comment("adding record to IPFS.");

        if let Some(cipher_key) = &self.cipher_key {
            if !record.encrypted() {
                record.encrypt(cipher_key)?;
            }
        }

        let data = serde_json::to_vec(&record)?;
        let cid = self.ipfs.dag_put(&data, self.pinning).await?;
        state.snapshot.put_link(&self.ipfs, key, cid).await?;

        if self.announcing {
            self.announce(&cid).await?;
        }

        state.session_entries += 1;
        debug!("record added: {} -> {}", key, cid);
        self.send_to_log(format!("record added: {} -> {}", key, cid));

        if self.pinata_interval > 0 && state.session_entries % self.pinata_interval == 0 {
            self.trigger_remote_pin(state.snapshot.root());
        }

        record.set_previous_cid(cid.to_string());
        Ok(record)
    }

    /// Retrieves a copy of the record stored under the provided key.
    pub async fn get(&self, key: &str) -> Result<Record> {
        let cid = {
            let state = self.state.read().await;
            state
                .snapshot
                .resolve(key)
                .ok_or_else(|| Error::KeyNotFound(key.to_string()))?
        };
        let record = self.fetch_record(cid).await?;
        debug!("record retrieved: {} -> {}", key, cid);
        Ok(record)
    }

    /// Removes the entry under the provided key: the snapshot drops the
    /// named link and the record CID is unpinned from the node.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let cid = state
            .snapshot
            .resolve(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;

        state.snapshot.drop_link(&self.ipfs, key).await?;
        self.ipfs.unpin(&cid).await?;

        debug!("record deleted: {}", key);
        self.send_to_log(format!("record deleted: {}", key));
        Ok(())
    }

    /// Collects a record directly from the DAG using its CID string.
    pub async fn get_record_from_cid(&self, cid: &str) -> Result<Record> {
        if cid.is_empty() {
            return Err(Error::NoCid);
        }
        let cid: Cid = cid
            .parse()
            .map_err(|e: cid::Error| Error::Ipfs(e.into()))?;
        self.fetch_record(cid).await
    }

    pub(crate) async fn fetch_record(&self, cid: Cid) -> Result<Record> {
        let node = self.ipfs.dag_get(&cid.to_string()).await?;
        let json = crate::ipfs::ipld_to_json(node);
        let mut record: Record = serde_json::from_value(json)?;

        if record.encrypted() {
            match &self.cipher_key {
                Some(key) => record.decrypt(key)?,
                None => return Err(Error::CipherKeyMissing),
            }
        }

        // callers chain updates from the CID the record was pulled at
        record.set_previous_cid(cid.to_string());
        Ok(record)
    }

    /// Looks up the CID stored for a key.
    pub async fn get_cid(&self, key: &str) -> Result<Cid> {
        let state = self.state.read().await;
        state
            .snapshot
            .resolve(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Returns an IPLD explorer link for the record stored under a key.
    pub async fn explorer_link(&self, key: &str) -> Result<String> {
        let cid = self.get_cid(key).await?;
        Ok(format!(
            "IPLD Explorer link: https://explore.ipld.io/#/explore/{}",
            cid
        ))
    }

    /// Iterates over the `(key, cid)` pairs held by the database. Order is
    /// unspecified.
    pub async fn range_cids(&self) -> impl Stream<Item = Result<KeyCidPair>> {
        let pairs: Vec<Result<KeyCidPair>> = {
            let state = self.state.read().await;
            state
                .snapshot
                .entries()
                .map(|(key, cid)| Ok((key.clone(), *cid)))
                .collect()
        };
        futures::stream::iter(pairs)
    }

    /// The current snapshot CID, or an empty string for an empty database.
    pub async fn snapshot(&self) -> String {
        let state = self.state.read().await;
        if state.snapshot.is_empty() {
            String::new()
        } else {
            state.snapshot.root().to_string()
        }
    }

    /// Peer ID of the bound IPFS node.
    pub async fn peer_identity(&self) -> Result<String> {
        if !self.ipfs.is_online() {
            return Err(Error::NodeOffline);
        }
        let id = self.ipfs.peer_id().await?;
        if id.is_empty() {
            return Err(Error::NoPeerId);
        }
        Ok(id)
    }

    /// Dumps the database metadata as a JSON document.
    pub async fn dump_metadata(&self) -> Result<String> {
        let host_node = self.peer_identity().await?;
        let host_address = self.ipfs.public_address().await?;
        let state = self.state.read().await;

        let contents: Vec<(String, String)> = state
            .snapshot
            .entries()
            .map(|(key, cid)| (key.clone(), cid.to_string()))
            .collect();
        let snapshot = if state.snapshot.is_empty() {
            String::new()
        } else {
            state.snapshot.root().to_string()
        };

        let metadata = DbMetadata {
            project: self.project.clone(),
            snapshot,
            host_node,
            host_address,
            pinning: self.pinning,
            announcing: self.announcing,
            max_entries: self.max_entries,
            current_entries: state.snapshot.len(),
            contents,
        };
        Ok(serde_json::to_string_pretty(&metadata)?)
    }

    /// Closes the database: background work is cancelled, the node session
    /// ends and the node must report offline.
    ///
    /// Every close step is attempted; the first failure is returned once
    /// the rest have run.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();

        let mut first_failure = None;
        if let Err(err) = self.ipfs.end_session().await {
            first_failure.get_or_insert(err);
        }
        if self.ipfs.is_online() {
            first_failure.get_or_insert(Error::NodeOnline);
        }
        self.send_to_log("database closed".to_string());
        match first_failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn trigger_remote_pin(&self, root: Cid) {
        let Some(pinner) = self.remote_pinner.clone() else {
            return;
        };
        self.send_to_log("pinning interval reached, uploading database snapshot".to_string());
        let log = self.log.clone();
        tokio::spawn(async move {
            match pinner.pin(&root).await {
                Ok(status) => {
                    debug!("remote pin response: {}", status);
                    if let Some(log) = &log {
                        let _ = log.send(format!("remote pin response: {}", status));
                    }
                }
                Err(err) => {
                    warn!("remote pin failed: {}", err);
                    if let Some(log) = &log {
                        let _ = log.send(format!("remote pin error: {}", err));
                    }
                }
            }
        });
    }

    pub(crate) fn send_to_log(&self, message: String) {
        if let Some(log) = &self.log {
            let _ = log.send(message);
        }
    }
}

fn sanitize_project(project: &str) -> Result<String> {
    let project = project.replace(' ', "_");
    if project.is_empty() {
        return Err(Error::NoProject);
    }
    Ok(project)
}

/// A `(key, cid)` pair yielded during iteration.
pub type KeyCidPair = (String, Cid);

use cid::Cid;

use crate::crypto::CIPHER_KEY_LENGTH;
use crate::db::{ENV_PINATA_API_KEY, ENV_PINATA_SECRET_KEY, MIN_BOOTSTRAPPERS};

/// Error is the set of failures a database instance can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("project name is required for a database instance")]
    NoProject,

    #[error("database option could not be applied: {0}")]
    DbOption(String),

    #[error("at least {} bootstrapper addresses are required", MIN_BOOTSTRAPPERS)]
    Bootstrappers,

    #[error("IPFS node is offline")]
    NodeOffline,

    #[error("IPFS node is still online")]
    NodeOnline,

    #[error("no peer ID listed for the current IPFS node")]
    NoPeerId,

    #[error("no CID provided")]
    NoCid,

    #[error("database entry points to a non-CBOR node: {0}")]
    NodeFormat(Cid),

    #[error("key not found in the database: {0}")]
    KeyNotFound(String),

    #[error("record already linked to the provided UUID: {0}")]
    LinkExists(String),

    #[error("a different record is already stored against this key")]
    AttemptedOverwrite,

    #[error("incoming record is not derived from the stored version of this key")]
    RecordHistory,

    #[error("cannot replace a record with one that is not more recent")]
    AttemptedUpdate,

    #[error("database has reached its maximum number of entries ({0})")]
    MaxEntriesExceeded(usize),

    #[error("could not update the project snapshot")]
    SnapshotUpdate(#[source] anyhow::Error),

    #[error("could not load the provided snapshot")]
    InvalidSnapshot(#[source] anyhow::Error),

    #[error("no password found in {0}")]
    NoEnvSet(&'static str),

    #[error("cannot derive a cipher key from the provided password")]
    CipherPassword,

    #[error("cipher key must be {} bytes", CIPHER_KEY_LENGTH)]
    CipherKeyLength,

    #[error("record field is encrypted but no cipher key is configured")]
    CipherKeyMissing,

    #[error("could not decrypt record field (password mismatch?)")]
    CipherPasswordMismatch,

    #[error("record is already encrypted")]
    Encrypted,

    #[error("{} is not set", ENV_PINATA_API_KEY)]
    PinataKey,

    #[error("{} is not set", ENV_PINATA_SECRET_KEY)]
    PinataSecret,

    #[error("pinata API error: {0}")]
    PinataApi(#[source] anyhow::Error),

    #[error("no active pubsub subscription for this database")]
    NoSub,

    #[error("no peer addresses provided")]
    NoPeers,

    #[error("record serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Ipfs(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! An IPFS-backed database for distributed sequence recording and record
//! keeping.
//!
//! Records are immutable, versioned documents describing sequencing
//! experiments. They are stored as IPLD DAG nodes and addressed by CID; a
//! database instance binds a *project* name to a directory node whose named
//! links point at the latest CID of each record. The root CID of that node
//! is the database *snapshot*: sharing it is sufficient for any peer to
//! reconstruct the entire database state.
//!
//! Features include:
//!
//! - snapshot and sync entire databases over IPFS
//! - pubsub messaging to share and collect records as they are created
//! - per-record history with CID chaining for rollback reasoning
//! - optional encryption of protected record fields
//!
//! # Example
//!
//! ```no_run
//! use stark_db::{Db, Record};
//!
//! # async fn example() -> stark_db::Result<()> {
//! let db = Db::builder().project("my project").open().await?;
//!
//! let record = Record::builder().alias("my first sample").build();
//! let stored = db.set("db key", &record).await?;
//! assert!(!stored.previous_cid().is_empty());
//!
//! let retrieved = db.get("db key").await?;
//! assert_eq!(retrieved.alias(), "my first sample");
//!
//! db.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
mod db;
mod error;
pub mod ipfs;
mod pubsub;
mod record;
mod snapshot;

pub use crate::db::{
    Db, DbBuilder, KeyCidPair, RemotePin, DEFAULT_BOOTSTRAPPERS, DEFAULT_MAX_ENTRIES,
    DEFAULT_PROJECT, ENV_DB_PASSWORD, ENV_PINATA_API_KEY, ENV_PINATA_SECRET_KEY,
    MIN_BOOTSTRAPPERS,
};
pub use crate::error::{Error, Result};
pub use crate::ipfs::{HttpIpfs, IpfsApi, Link, MemIpfs, MemSwarm, PubsubMessage};
pub use crate::pubsub::DEFAULT_BUFFER_SIZE;
pub use crate::record::{Comment, Record, RecordBuilder};

pub use cid::Cid;

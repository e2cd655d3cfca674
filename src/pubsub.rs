//! Record announcement and collection over pubsub.
//!
//! Every database instance can announce the CID of freshly written records
//! on its project topic, and listen for CIDs announced by peers, pulling
//! the corresponding records out of the DAG as they arrive.

use std::collections::HashSet;

use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::ipfs::IpfsApi;
use crate::record::Record;

/// Capacity of the record and error channels handed out by [`Db::listen`].
pub const DEFAULT_BUFFER_SIZE: usize = 42;

impl<I: IpfsApi> Db<I> {
    /// Broadcasts a record CID on the project topic.
    pub(crate) async fn announce(&self, cid: &Cid) -> Result<()> {
        if !self.ipfs.is_online() {
            return Err(Error::NodeOffline);
        }
        if self.project.is_empty() {
            return Err(Error::NoProject);
        }
        // the message body is the UTF-8 CID string
        self.ipfs
            .publish(&self.project, Bytes::from(cid.to_string()))
            .await
    }

    /// Starts listening on the project topic, collecting every announced
    /// record.
    ///
    /// Each announced CID is fetched at most once; the records are handed
    /// out on the first channel, per-message failures on the second. The
    /// subscription ends and both channels close when the database shuts
    /// down.
    pub async fn listen(&self) -> Result<(mpsc::Receiver<Record>, mpsc::Receiver<Error>)> {
        if !self.ipfs.is_online() {
            return Err(Error::NodeOffline);
        }

        let mut messages = self.ipfs.subscribe(&self.project).await?;
        let (record_tx, record_rx) = mpsc::channel(DEFAULT_BUFFER_SIZE);
        let (error_tx, error_rx) = mpsc::channel(DEFAULT_BUFFER_SIZE);

        let db = self.clone();
        tokio::spawn(async move {
            // skips announcements that were already collected
            let mut seen: HashSet<Cid> = HashSet::new();

            loop {
                let message = tokio::select! {
                    _ = db.cancel.cancelled() => break,
                    message = messages.next() => message,
                };
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        if error_tx.send(err).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    None => break,
                };

                let payload = String::from_utf8_lossy(&message.data);
                let cid: Cid = match payload.parse() {
                    Ok(cid) => cid,
                    Err(_) => {
                        // unknown payloads are dropped
                        debug!("ignoring non-CID announcement from {}", message.from);
                        continue;
                    }
                };
                if !seen.insert(cid) {
                    continue;
                }

                match db.fetch_record(cid).await {
                    Ok(mut record) => {
                        record.add_comment(format!("collected from {} via pubsub.", message.from));
                        if record_tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if error_tx.send(err).await.is_err() {
                            break;
                        }
                    }
                }
            }

            match db.ipfs.unsubscribe(&db.project).await {
                Ok(()) | Err(Error::NoSub) => {}
                Err(err) => {
                    let _ = error_tx.send(err).await;
                }
            }
            debug!("listener for {} stopped", db.project);
        });

        Ok((record_rx, error_rx))
    }
}

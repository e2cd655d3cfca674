//! Gateway to a running IPFS daemon over its HTTP RPC API.
//!
//! The daemon address is resolved from the node's on-disk repository
//! (`IPFS_PATH`, falling back to `~/.ipfs`): a repository that has never
//! been initialized has no `api` file and opening the database aborts.
//! In-flight requests are dropped when the owning database cancels its
//! lifetime token.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use libipld::Ipld;
use reqwest::multipart;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{json_to_ipld, IpfsApi, Link, MessageStream, PubsubMessage, DAG_CBOR, INPUT_ENCODING, STORE_FORMAT};
use crate::error::{Error, Result};

const ENV_IPFS_PATH: &str = "IPFS_PATH";
const API_FILE: &str = "api";

#[derive(Debug, Deserialize)]
struct CidEnvelope {
    #[serde(rename = "Cid")]
    cid: CidRef,
}

#[derive(Debug, Deserialize)]
struct CidRef {
    #[serde(rename = "/")]
    cid: String,
}

#[derive(Debug, Deserialize)]
struct HashEnvelope {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct LinksEnvelope {
    #[serde(rename = "Links", default)]
    links: Vec<ObjectLink>,
}

#[derive(Debug, Deserialize)]
struct ObjectLink {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct IdEnvelope {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Addresses", default)]
    addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    from: String,
    #[serde(default)]
    data: String,
}

/// Handle to an IPFS daemon reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpIpfs {
    inner: Arc<HttpInner>,
}

#[derive(Debug)]
struct HttpInner {
    base: String,
    http: reqwest::Client,
    token: CancellationToken,
    online: AtomicBool,
    identity: IdEnvelope,
    subs: Mutex<HashMap<String, CancellationToken>>,
}

impl HttpIpfs {
    /// Connects to the daemon whose address is recorded in the local IPFS
    /// repository.
    pub async fn open(token: CancellationToken) -> Result<Self> {
        let addr = resolve_api_addr()?;
        Self::open_at(&addr, token).await
    }

    /// Connects to a daemon at an explicit `http://host:port` address.
    pub async fn open_at(base: &str, token: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::new();
        let url = format!("{}/api/v0/id", base.trim_end_matches('/'));
        let resp = http
            .post(&url)
            .send()
            .await
            .map_err(|_| Error::NodeOffline)?;
        let identity: IdEnvelope = resp
            .json()
            .await
            .context("could not parse IPFS node identity")?;

        Ok(HttpIpfs {
            inner: Arc::new(HttpInner {
                base: base.trim_end_matches('/').to_string(),
                http,
                token,
                online: AtomicBool::new(true),
                identity,
                subs: Mutex::new(HashMap::new()),
            }),
        })
    }

    async fn call(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = format!("{}/api/v0/{}", self.inner.base, path);
        let req = self.inner.http.post(&url).query(query);
        self.send(path, req).await
    }

    async fn call_multipart(
        &self,
        path: &str,
        query: &[(&str, String)],
        part: multipart::Part,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/v0/{}", self.inner.base, path);
        let form = multipart::Form::new().part("file", part);
        let req = self.inner.http.post(&url).query(query).multipart(form);
        self.send(path, req).await
    }

    async fn send(&self, path: &str, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let fut = async {
            let resp = req
                .send()
                .await
                .with_context(|| format!("request to {} failed", path))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let message = resp
                    .json::<ApiError>()
                    .await
                    .map(|e| e.message)
                    .unwrap_or_default();
                bail!("ipfs api {} returned {}: {}", path, status, message);
            }
            Ok(resp)
        };
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(anyhow!("operation cancelled").into()),
            res = fut => res.map_err(Error::Ipfs),
        }
    }
}

#[async_trait]
impl IpfsApi for HttpIpfs {
    async fn dag_put(&self, data: &[u8], pin: bool) -> Result<Cid> {
        let query = [
            ("store-codec", format!("dag-{}", STORE_FORMAT)),
            ("input-codec", format!("dag-{}", INPUT_ENCODING)),
            ("pin", pin.to_string()),
        ];
        let part = multipart::Part::bytes(data.to_vec());
        let resp = self.call_multipart("dag/put", &query, part).await?;
        let envelope: CidEnvelope = resp.json().await.map_err(into_anyhow)?;
        let cid = envelope.cid.cid.parse().context("invalid cid in reply")?;
        debug!("dag_put {}", cid);
        Ok(cid)
    }

    async fn dag_get(&self, path: &str) -> Result<Ipld> {
        let root = path.split('/').find(|p| !p.is_empty()).ok_or(Error::NoCid)?;
        let cid: Cid = root.parse().context("invalid cid")?;
        if cid.codec() != DAG_CBOR {
            return Err(Error::NodeFormat(cid));
        }

        let query = [
            ("arg", path.to_string()),
            ("output-codec", "dag-json".to_string()),
        ];
        let resp = self.call("dag/get", &query).await?;
        let value: serde_json::Value = resp.json().await.map_err(into_anyhow)?;
        Ok(json_to_ipld(value))
    }

    async fn new_dag_node(&self) -> Result<Cid> {
        let query = [("arg", "unixfs-dir".to_string())];
        let resp = self.call("object/new", &query).await?;
        let envelope: HashEnvelope = resp.json().await.map_err(into_anyhow)?;
        Ok(envelope.hash.parse().context("invalid cid in reply")?)
    }

    async fn add_link(&self, base: &Cid, child: &Cid, name: &str) -> Result<Cid> {
        let query = [
            ("arg", base.to_string()),
            ("arg", name.to_string()),
            ("arg", child.to_string()),
            ("create", "true".to_string()),
        ];
        let resp = self.call("object/patch/add-link", &query).await?;
        let envelope: HashEnvelope = resp.json().await.map_err(into_anyhow)?;
        Ok(envelope.hash.parse().context("invalid cid in reply")?)
    }

    async fn rm_link(&self, base: &Cid, name: &str) -> Result<Cid> {
        let query = [("arg", base.to_string()), ("arg", name.to_string())];
        let resp = self.call("object/patch/rm-link", &query).await?;
        let envelope: HashEnvelope = resp.json().await.map_err(into_anyhow)?;
        Ok(envelope.hash.parse().context("invalid cid in reply")?)
    }

    async fn node_links(&self, cid: &Cid) -> Result<Vec<Link>> {
        let query = [("arg", cid.to_string())];
        let resp = self.call("object/links", &query).await?;
        let envelope: LinksEnvelope = resp.json().await.map_err(into_anyhow)?;
        envelope
            .links
            .into_iter()
            .map(|link| {
                Ok(Link {
                    cid: link.hash.parse().context("invalid link cid")?,
                    name: link.name,
                })
            })
            .collect()
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        let query = [("arg", cid.to_string()), ("recursive", "true".to_string())];
        match self.call("pin/rm", &query).await {
            Ok(_) => Ok(()),
            // unpinning something that was never pinned is not a failure
            Err(err) if err.to_string().contains("not pinned") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let query = [("arg", multibase_topic(topic))];
        let part = multipart::Part::bytes(data.to_vec());
        self.call_multipart("pubsub/pub", &query, part).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let query = [("arg", multibase_topic(topic)), ("discover", "true".to_string())];
        let resp = self.call("pubsub/sub", &query).await?;

        let sub_token = self.inner.token.child_token();
        self.inner
            .subs
            .lock()
            .unwrap()
            .insert(topic.to_string(), sub_token.clone());

        // the response body is a long-lived stream of JSON lines
        let stream = async_stream::stream! {
            let mut body = resp.bytes_stream();
            let mut buf = Vec::new();
            loop {
                let chunk = tokio::select! {
                    _ = sub_token.cancelled() => break,
                    chunk = body.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) => {
                        yield Err(Error::Ipfs(anyhow!("subscription stream failed: {}", err)));
                        break;
                    }
                    None => break,
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_wire_message(&line) {
                        Ok(Some(msg)) => yield Ok(msg),
                        Ok(None) => {}
                        Err(err) => yield Err(err),
                    }
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
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let query = [("pin", pin.to_string()), ("quieter", "true".to_string())];
        let part = multipart::Part::bytes(data).file_name(name);
        let resp = self.call_multipart("add", &query, part).await?;
        let envelope: HashEnvelope = resp.json().await.map_err(into_anyhow)?;
        Ok(envelope.hash.parse().context("invalid cid in reply")?)
    }

    async fn get_file(&self, cid: &Cid, out: &Path) -> Result<()> {
        let query = [("arg", cid.to_string())];
        let resp = self.call("cat", &query).await?;
        let data = resp.bytes().await.map_err(into_anyhow)?;
        tokio::fs::write(out, &data)
            .await
            .with_context(|| format!("could not write {}", out.display()))?;
        Ok(())
    }

    async fn connect(&self, peers: &[String]) -> Result<()> {
        for peer in peers {
            let query = [("arg", peer.clone())];
            if let Err(err) = self.call("swarm/connect", &query).await {
                warn!("bootstrapper {}: {}", peer, err);
            }
        }
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    async fn peer_id(&self) -> Result<String> {
        Ok(self.inner.identity.id.clone())
    }

    async fn public_address(&self) -> Result<String> {
        self.inner
            .identity
            .addresses
            .iter()
            .find(|addr| is_public_ipv4_addr(addr))
            .cloned()
            .ok_or_else(|| anyhow!("no public IPv4 address was found for IPFS node").into())
    }

    async fn end_session(&self) -> Result<()> {
        for (_, token) in self.inner.subs.lock().unwrap().drain() {
            token.cancel();
        }
        self.inner.online.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn into_anyhow(err: reqwest::Error) -> Error {
    Error::Ipfs(err.into())
}

/// Topics cross the daemon API multibase encoded (url-safe base64).
fn multibase_topic(topic: &str) -> String {
    format!("u{}", base64::encode_config(topic, base64::URL_SAFE_NO_PAD))
}

fn decode_multibase(field: &str) -> Result<Vec<u8>> {
    let encoded = field
        .strip_prefix('u')
        .ok_or_else(|| anyhow!("unsupported multibase prefix in {:?}", field))?;
    base64::decode_config(encoded, base64::URL_SAFE_NO_PAD)
        .map_err(|e| anyhow!("invalid multibase payload: {}", e).into())
}

fn parse_wire_message(line: &[u8]) -> Result<Option<PubsubMessage>> {
    let line = std::str::from_utf8(line).unwrap_or_default().trim();
    if line.is_empty() {
        return Ok(None);
    }
    let wire: WireMessage =
        serde_json::from_str(line).map_err(|e| anyhow!("invalid pubsub message: {}", e))?;
    let data = decode_multibase(&wire.data)?;
    Ok(Some(PubsubMessage {
        from: wire.from,
        data: Bytes::from(data),
    }))
}

/// Finds the daemon address recorded in the on-disk repository.
fn resolve_api_addr() -> Result<String> {
    let repo = match std::env::var_os(ENV_IPFS_PATH) {
        Some(path) => PathBuf::from(path),
        None => dirs::home_dir()
            .map(|home| home.join(".ipfs"))
            .ok_or_else(|| anyhow!("could not determine the home directory"))?,
    };
    let api_file = repo.join(API_FILE);
    let addr = std::fs::read_to_string(&api_file).with_context(|| {
        format!(
            "IPFS repository at {} is not initialized or has no running daemon (run `ipfs init` and `ipfs daemon`)",
            repo.display()
        )
    })?;
    multiaddr_to_url(addr.trim())
}

/// Converts an api multiaddr such as `/ip4/127.0.0.1/tcp/5001` to a URL.
fn multiaddr_to_url(addr: &str) -> Result<String> {
    let parts: Vec<&str> = addr.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [proto, host, "tcp", port, ..] if *proto == "ip4" || *proto == "dns4" => {
            Ok(format!("http://{}:{}", host, port))
        }
        _ => Err(anyhow!("unsupported api multiaddr: {}", addr).into()),
    }
}

fn is_public_ipv4_addr(multiaddr: &str) -> bool {
    let parts: Vec<&str> = multiaddr.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 || parts[0] != "ip4" {
        return false;
    }
    match parts[1].parse::<Ipv4Addr>() {
        Ok(ip) => {
            !ip.is_private() && !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_multiaddr_to_url() {
        assert_eq!(
            multiaddr_to_url("/ip4/127.0.0.1/tcp/5001").unwrap(),
            "http://127.0.0.1:5001"
        );
        assert!(multiaddr_to_url("/unix/socket").is_err());
    }

    #[test]
    fn topic_encoding() {
        assert_eq!(multibase_topic("test_project"), "udGVzdF9wcm9qZWN0");
        let decoded = decode_multibase("udGVzdF9wcm9qZWN0").unwrap();
        assert_eq!(decoded, b"test_project");
    }

    #[test]
    fn public_address_detection() {
        assert!(is_public_ipv4_addr("/ip4/94.130.135.167/tcp/4001"));
        assert!(!is_public_ipv4_addr("/ip4/127.0.0.1/tcp/4001"));
        assert!(!is_public_ipv4_addr("/ip4/192.168.1.4/tcp/4001"));
        assert!(!is_public_ipv4_addr("/ip6/::1/tcp/4001"));
    }

    #[test]
    fn wire_message_decode() {
        let line = br#"{"from":"12D3KooBob","data":"uaGVsbG8"}"#;
        let msg = parse_wire_message(line).unwrap().unwrap();
        assert_eq!(msg.from, "12D3KooBob");
        assert_eq!(msg.data.as_ref(), b"hello");

        assert!(parse_wire_message(b"  \n").unwrap().is_none());
        assert!(parse_wire_message(b"not json").is_err());
    }
}

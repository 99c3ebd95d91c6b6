use crate::remote::{Executor, RemoteOutcome};
use reqwest::Method;
use serde_json::{Value, json};
use std::future::Future;

const TORRENTS_PATH: &str = "/torrents";

/// The two remote calls the metadata waiter needs.
pub trait TorrentLookup: Send + Sync + 'static {
    /// Raw `get` query for a torrent; status and body are left uninterpreted.
    fn lookup(&self, hash: &str) -> impl Future<Output = RemoteOutcome> + Send;

    /// Media probe for one file of a torrent.
    fn probe(&self, hash: &str, index: u64) -> impl Future<Output = RemoteOutcome> + Send;
}

/// TorrServer API client built on the bounded executor.
#[derive(Clone)]
pub struct TorrServer {
    exec: Executor,
}

impl TorrServer {
    pub fn new(exec: Executor) -> Self {
        Self { exec }
    }

    /// Whether the server knows the torrent. Any failure counts as "no".
    pub async fn exists(&self, hash: &str) -> (bool, Option<Value>) {
        let outcome = self.get_torrent(hash, true).await;
        if !outcome.is_ok() {
            return (false, None);
        }
        match outcome.json() {
            Ok(data) => (true, Some(data)),
            Err(err) => {
                tracing::debug!(%hash, %err, "torrserver: unparsable torrent data");
                (false, None)
            }
        }
    }

    pub async fn add(&self, hash: &str, title: &str) -> (bool, Option<Value>) {
        tracing::info!(%hash, "torrserver: adding torrent");
        let body = json!({
            "action": "add",
            "link": hash,
            "title": title,
            "save_to_db": false,
        });
        let outcome = self
            .exec
            .execute(Method::POST, TORRENTS_PATH, Some(&body), false)
            .await;

        if !outcome.is_ok() {
            tracing::warn!(%hash, status = outcome.status, "torrserver: add failed");
            return (false, None);
        }
        match outcome.json() {
            Ok(result) => {
                tracing::info!(%hash, "torrserver: torrent added");
                (true, Some(result))
            }
            Err(err) => {
                tracing::warn!(%hash, %err, "torrserver: unparsable add response");
                (false, None)
            }
        }
    }

    pub async fn media_info(&self, hash: &str, index: u64) -> RemoteOutcome {
        self.exec
            .execute(Method::GET, &format!("/ffp/{hash}/{index}"), None, false)
            .await
    }

    async fn get_torrent(&self, hash: &str, silent: bool) -> RemoteOutcome {
        let body = json!({ "action": "get", "hash": hash });
        self.exec
            .execute(Method::POST, TORRENTS_PATH, Some(&body), silent)
            .await
    }
}

impl TorrentLookup for TorrServer {
    async fn lookup(&self, hash: &str) -> RemoteOutcome {
        self.get_torrent(hash, true).await
    }

    async fn probe(&self, hash: &str, index: u64) -> RemoteOutcome {
        self.media_info(hash, index).await
    }
}

/// The per-file stats list, if the torrent's metadata has loaded.
///
/// TorrServer has shipped both `file_stats` and `FileStats`; either counts.
pub fn file_stats(torrent: &Value) -> Option<&Vec<Value>> {
    ["file_stats", "FileStats"]
        .iter()
        .filter_map(|field| torrent.get(field).and_then(Value::as_array))
        .find(|stats| !stats.is_empty())
}

pub fn has_file_stats(torrent: &Value) -> bool {
    file_stats(torrent).is_some()
}

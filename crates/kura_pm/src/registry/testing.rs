//! テスト用のスクリプト化トランスポート。`testing` フィーチャーで公開される。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;

use super::{ChecksumAlgorithm, ChecksumPolicy, MavenRegistry, Transport, TransportFuture};
use crate::repository::config::RepositoryConfig;

/// URLごとに応答列を返すトランスポート。最後の応答は繰り返される。
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<Option<Bytes>>>>,
    requests: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl ScriptedTransport {
    pub fn respond(&self, url: &str, body: &[u8]) {
        self.script(url, Some(Bytes::copy_from_slice(body)));
    }

    /// 本体と `.sha1` サイドカーを登録する。
    pub fn publish(&self, url: &str, body: &[u8]) {
        self.respond(url, body);
        self.respond(
            &format!("{url}.sha1"),
            ChecksumAlgorithm::Sha1.compute(body).as_bytes(),
        );
    }

    pub fn script(&self, url: &str, response: Option<Bytes>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn get<'a>(&'a self, url: &'a Url) -> TransportFuture<'a> {
        Box::pin(async move {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self
                .requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(url.to_string())
                .or_default() += 1;
            let mut responses = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(queue) = responses.get_mut(url.as_str()) else {
                return Ok(None);
            };
            if queue.len() > 1 {
                Ok(queue.pop_front().flatten())
            } else {
                Ok(queue.front().cloned().flatten())
            }
        })
    }
}

/// 再試行待ちのないレジストリを作る。
///
/// # Panics
///
/// `base_url` が URL として解釈できない場合。
pub fn scripted_registry(
    name: &str,
    base_url: &str,
    transport: Arc<ScriptedTransport>,
    enforce: bool,
) -> MavenRegistry {
    MavenRegistry::with_transport(
        &RepositoryConfig::new(name, base_url),
        transport,
        ChecksumPolicy {
            enforce,
            retry_backoff: Duration::ZERO,
        },
    )
    .expect("registry")
}

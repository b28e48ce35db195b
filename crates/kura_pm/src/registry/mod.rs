//! 単一リポジトリに対するダウンロードプロトコル。
//!
//! パス構築、チェックサム検証（`.sha1`、`.md5`、`.sha256` の順）と一度だけの再検証を担う。

pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::ParseError;

use crate::cache::MetadataLevel;
use crate::model::Dependency;
use crate::repository::Credentials;
use crate::repository::config::RepositoryConfig;

pub use transport::{FileTransport, HttpTransport, Transport, TransportError, TransportFuture};

pub const DEFAULT_ARTIFACT_PATTERN: &str =
    "${groupId}/${artifactId}/${version}/${artifactId}-${revision}${classifier}.${ext}";
pub const DEFAULT_METADATA_PATTERN: &str =
    "${groupId}/${artifactId}/${version}/maven-metadata.xml";
pub const DEFAULT_CHECKSUM_BACKOFF: Duration = Duration::from_millis(2000);

/// サイドカーを探す順序。
const SIDECAR_ORDER: [ChecksumAlgorithm; 3] = [
    ChecksumAlgorithm::Sha1,
    ChecksumAlgorithm::Md5,
    ChecksumAlgorithm::Sha256,
];

/// チェックサムアルゴリズムの選択肢。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha1,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn extension(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "SHA-256",
            ChecksumAlgorithm::Sha1 => "SHA-1",
            ChecksumAlgorithm::Md5 => "MD5",
        }
    }

    pub fn compute(&self, bytes: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha256 => format!("{:x}", Sha256::digest(bytes)),
            ChecksumAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(bytes);
                format!("{:x}", hasher.finalize())
            }
            ChecksumAlgorithm::Md5 => format!("{:x}", md5::compute(bytes)),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// チェックサム検証の挙動。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumPolicy {
    /// 再検証後も不一致なら失敗させる。無効時は警告のみ。
    pub enforce: bool,
    /// 初回不一致後、サイドカーを再取得するまでの待機時間。
    pub retry_backoff: Duration,
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        Self {
            enforce: true,
            retry_backoff: DEFAULT_CHECKSUM_BACKOFF,
        }
    }
}

/// Mavenレジストリに関するエラー種別。
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("レジストリURL '{url}' が不正です: {source}")]
    InvalidUrl { url: String, source: ParseError },
    #[error("レジストリURLの構築に失敗しました (base: {base}, path: {path}): {source}")]
    UrlJoin {
        base: String,
        path: String,
        source: ParseError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(
        "チェックサム不一致: {resource} ({algorithm}, expected={expected}, actual={actual}, url={url})"
    )]
    ChecksumMismatch {
        resource: String,
        url: String,
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },
}

impl RegistryError {
    /// 他のリポジトリで続行できない構成上の誤りか。
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RegistryError::InvalidUrl { .. } | RegistryError::UrlJoin { .. }
        )
    }
}

/// 検証済みの取得結果。
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub bytes: Bytes,
    pub url: Url,
    /// 検証に用いたアルゴリズムと値。サイドカーがなければ `None`。
    pub checksum: Option<(ChecksumAlgorithm, String)>,
}

/// 単一リポジトリのクライアント。
pub struct MavenRegistry {
    name: String,
    base_url: Url,
    artifact_pattern: String,
    metadata_pattern: String,
    transport: Arc<dyn Transport>,
    checksums: ChecksumPolicy,
}

impl fmt::Debug for MavenRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MavenRegistry")
            .field("name", &self.name)
            .field("base_url", &self.base_url.as_str())
            .field("checksums", &self.checksums)
            .finish()
    }
}

impl MavenRegistry {
    /// 設定からクライアントを生成する。`file://` はローカルファイルとして読む。
    pub fn from_config(
        config: &RepositoryConfig,
        credentials: Option<Credentials>,
        checksums: ChecksumPolicy,
    ) -> Result<Self, RegistryError> {
        let base_url = parse_base_url(&config.url)?;
        let transport: Arc<dyn Transport> = if base_url.scheme() == "file" {
            Arc::new(FileTransport)
        } else {
            Arc::new(HttpTransport::for_repository(config, credentials)?)
        };
        Self::assemble(config, base_url, transport, checksums)
    }

    /// 任意のトランスポートでインスタンス化する。
    pub fn with_transport(
        config: &RepositoryConfig,
        transport: Arc<dyn Transport>,
        checksums: ChecksumPolicy,
    ) -> Result<Self, RegistryError> {
        let base_url = parse_base_url(&config.url)?;
        Self::assemble(config, base_url, transport, checksums)
    }

    fn assemble(
        config: &RepositoryConfig,
        base_url: Url,
        transport: Arc<dyn Transport>,
        checksums: ChecksumPolicy,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            name: config.name.clone(),
            base_url,
            artifact_pattern: config
                .artifact_pattern
                .clone()
                .unwrap_or_else(|| DEFAULT_ARTIFACT_PATTERN.to_string()),
            metadata_pattern: config
                .metadata_pattern
                .clone()
                .unwrap_or_else(|| DEFAULT_METADATA_PATTERN.to_string()),
            transport,
            checksums,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn artifact_url(&self, dependency: &Dependency, extension: &str) -> Result<Url, RegistryError> {
        let path = expand_pattern(&self.artifact_pattern, dependency, extension, None);
        self.join_path(&path)
    }

    pub fn metadata_url(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
    ) -> Result<Url, RegistryError> {
        let path = expand_pattern(&self.metadata_pattern, dependency, "xml", Some(level));
        self.join_path(&path)
    }

    /// アーティファクトを取得して検証する。見つからなければ `Ok(None)`。
    pub async fn fetch(
        &self,
        dependency: &Dependency,
        extension: &str,
    ) -> Result<Option<FetchedResource>, RegistryError> {
        let url = self.artifact_url(dependency, extension)?;
        self.fetch_verified(url, &format!("{dependency} ({extension})"))
            .await
    }

    /// `maven-metadata.xml` を取得して検証する。
    pub async fn fetch_metadata(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
    ) -> Result<Option<FetchedResource>, RegistryError> {
        let url = self.metadata_url(dependency, level)?;
        self.fetch_verified(url, &format!("metadata {dependency}"))
            .await
    }

    async fn fetch_verified(
        &self,
        url: Url,
        resource: &str,
    ) -> Result<Option<FetchedResource>, RegistryError> {
        debug!(repository = %self.name, target = %resource, url = %url, "レジストリリクエストを送信");
        let Some(bytes) = self.transport.get(&url).await? else {
            return Ok(None);
        };

        let Some((algorithm, expected)) = self.first_sidecar(&url).await? else {
            warn!(
                repository = %self.name,
                target = %resource,
                url = %url,
                "チェックサムファイルが見つからないため検証せずに受け入れます"
            );
            return Ok(Some(FetchedResource {
                bytes,
                url,
                checksum: None,
            }));
        };

        let actual = algorithm.compute(&bytes);
        if actual == expected {
            return Ok(Some(FetchedResource {
                bytes,
                url,
                checksum: Some((algorithm, actual)),
            }));
        }

        warn!(
            repository = %self.name,
            target = %resource,
            algorithm = %algorithm,
            expected = %expected,
            actual = %actual,
            backoff_ms = self.checksums.retry_backoff.as_millis() as u64,
            "チェックサムが一致しません。待機後に再検証します"
        );
        sleep(self.checksums.retry_backoff).await;

        let retried = self.fetch_sidecar(&url, algorithm).await?;
        if retried.as_deref() == Some(actual.as_str()) {
            info!(repository = %self.name, target = %resource, "再検証でチェックサムが一致しました");
            return Ok(Some(FetchedResource {
                bytes,
                url,
                checksum: Some((algorithm, actual)),
            }));
        }

        let expected = retried.unwrap_or(expected);
        if !self.checksums.enforce {
            warn!(
                repository = %self.name,
                target = %resource,
                expected = %expected,
                actual = %actual,
                "チェックサム検証が無効化されているため不一致を無視します"
            );
            return Ok(Some(FetchedResource {
                bytes,
                url,
                checksum: None,
            }));
        }

        Err(RegistryError::ChecksumMismatch {
            resource: resource.to_string(),
            url: url.to_string(),
            algorithm,
            expected,
            actual,
        })
    }

    async fn first_sidecar(
        &self,
        url: &Url,
    ) -> Result<Option<(ChecksumAlgorithm, String)>, RegistryError> {
        for algorithm in SIDECAR_ORDER {
            if let Some(value) = self.fetch_sidecar(url, algorithm).await? {
                return Ok(Some((algorithm, value)));
            }
        }
        Ok(None)
    }

    async fn fetch_sidecar(
        &self,
        url: &Url,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Option<String>, RegistryError> {
        let sidecar = sidecar_url(url, algorithm)?;
        let Some(bytes) = self.transport.get(&sidecar).await? else {
            return Ok(None);
        };
        Ok(extract_checksum(&String::from_utf8_lossy(&bytes)))
    }

    fn join_path(&self, relative: &str) -> Result<Url, RegistryError> {
        self.base_url
            .join(relative)
            .map_err(|source| RegistryError::UrlJoin {
                base: self.base_url.to_string(),
                path: relative.to_string(),
                source,
            })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, RegistryError> {
    let mut base_url = Url::parse(raw).map_err(|source| RegistryError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    ensure_trailing_slash(&mut base_url);
    Ok(base_url)
}

/// パターン中のトークンを置換し、空になったパス要素を詰める。
///
/// `level` が `Some(Artifact)` のとき `${version}` は空になる。
pub fn expand_pattern(
    pattern: &str,
    dependency: &Dependency,
    extension: &str,
    level: Option<MetadataLevel>,
) -> String {
    let version = match level {
        Some(MetadataLevel::Artifact) => "",
        _ => dependency.version.as_str(),
    };
    let classifier = dependency
        .classifier()
        .map(|classifier| format!("-{classifier}"))
        .unwrap_or_default();

    let expanded = pattern
        .replace("${groupId}", &dependency.group_path())
        .replace("${artifactId}", &dependency.artifact_id)
        .replace("${version}", version)
        .replace("${revision}", dependency.file_version())
        .replace("${classifier}", &classifier)
        .replace("${ext}", extension);

    expanded
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn sidecar_url(url: &Url, algorithm: ChecksumAlgorithm) -> Result<Url, RegistryError> {
    let raw = format!("{}.{}", url.as_str(), algorithm.extension());
    Url::parse(&raw).map_err(|source| RegistryError::InvalidUrl { url: raw, source })
}

fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}

fn extract_checksum(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| {
            line.split_whitespace()
                .next()
                .unwrap_or(line)
                .to_ascii_lowercase()
        })
}

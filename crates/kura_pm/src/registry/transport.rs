use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, NoProxy, Proxy, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, warn};

use crate::repository::Credentials;
use crate::repository::config::{ProxyConfig, RepositoryConfig};

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Bytes>, TransportError>> + Send + 'a>>;

/// 通信層のエラー。`via_proxy` はプロキシ経由の失敗を示す。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTPクライアントの初期化に失敗しました: {source}")]
    ClientBuild { source: reqwest::Error },
    #[error("プロキシ設定 '{proxy}' が不正です: {message}")]
    InvalidProxy { proxy: String, message: String },
    #[error("{url} への通信に失敗しました: {message}")]
    Network {
        url: String,
        message: String,
        via_proxy: bool,
    },
    #[error("HTTP {status} が返されました: {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("ファイルURL '{url}' をパスへ変換できません")]
    InvalidFileUrl { url: String },
}

impl TransportError {
    pub fn is_proxy_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Network {
                via_proxy: true,
                ..
            } | TransportError::InvalidProxy { .. }
        )
    }
}

/// リポジトリへの GET を抽象化する。見つからない場合は `Ok(None)`。
pub trait Transport: Send + Sync {
    fn get<'a>(&'a self, url: &'a Url) -> TransportFuture<'a>;
}

/// reqwest によるHTTP(S)トランスポート。
pub struct HttpTransport {
    client: Client,
    credentials: Option<Credentials>,
    via_proxy: bool,
}

impl HttpTransport {
    /// リポジトリ設定からクライアントを構築する。プロキシ設定の誤りはここで検出される。
    pub fn for_repository(
        config: &RepositoryConfig,
        credentials: Option<Credentials>,
    ) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            // Avoid HTTP/2 oddities against Maven Central; prefer HTTP/1.1.
            .http1_only()
            .user_agent(format!("kura-pm/{}", env!("CARGO_PKG_VERSION")));
        if let Some(read_timeout) = config.read_timeout_secs {
            builder = builder.timeout(Duration::from_secs(read_timeout));
        }

        let via_proxy = config.proxy.is_some();
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(build_proxy(proxy)?);
        }

        let client = builder
            .build()
            .map_err(|source| TransportError::ClientBuild { source })?;
        Ok(Self {
            client,
            credentials,
            via_proxy,
        })
    }

    fn network_error(&self, url: &Url, error: &reqwest::Error) -> TransportError {
        let mut chain = error.to_string();
        let mut current = error.source();
        while let Some(source) = current {
            chain.push_str(&format!(" | caused by: {source}"));
            current = source.source();
        }
        TransportError::Network {
            url: url.to_string(),
            message: chain,
            via_proxy: self.via_proxy,
        }
    }
}

fn build_proxy(config: &ProxyConfig) -> Result<Proxy, TransportError> {
    let invalid = |message: String| TransportError::InvalidProxy {
        proxy: config.url.clone(),
        message,
    };
    let parsed = Url::parse(&config.url).map_err(|error| invalid(error.to_string()))?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("ホスト名がありません".to_string()));
    }

    let mut proxy = Proxy::all(parsed.as_str()).map_err(|error| invalid(error.to_string()))?;
    if let Some((username, password)) = config.credentials() {
        proxy = proxy.basic_auth(&username, &password);
    }
    if !config.non_proxy_hosts.is_empty() {
        proxy = proxy.no_proxy(NoProxy::from_string(&config.non_proxy_hosts.join(",")));
    }
    Ok(proxy)
}

impl Transport for HttpTransport {
    fn get<'a>(&'a self, url: &'a Url) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut request = self.client.get(url.clone());
            request = match &self.credentials {
                Some(Credentials::Basic { username, password }) => {
                    request.basic_auth(username, Some(password))
                }
                Some(Credentials::Token(token)) => request.bearer_auth(token),
                None => request,
            };

            let response = request
                .send()
                .await
                .map_err(|error| self.network_error(url, &error))?;
            let status = response.status();
            if status.is_success() {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|error| self.network_error(url, &error))?;
                return Ok(Some(bytes));
            }

            if matches!(
                status,
                StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::BAD_REQUEST
            ) {
                debug!(status = %status, url = %url, "リソースが存在しません");
                return Ok(None);
            }

            warn!(status = %status, url = %url, "想定外のHTTP応答");
            Err(TransportError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            })
        })
    }
}

/// `file://` リポジトリ用のトランスポート。
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTransport;

impl Transport for FileTransport {
    fn get<'a>(&'a self, url: &'a Url) -> TransportFuture<'a> {
        Box::pin(async move {
            let path = url
                .to_file_path()
                .map_err(|_| TransportError::InvalidFileUrl {
                    url: url.to_string(),
                })?;
            match std::fs::read(&path) {
                Ok(bytes) => Ok(Some(Bytes::from(bytes))),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(error) => Err(TransportError::Network {
                    url: url.to_string(),
                    message: error.to_string(),
                    via_proxy: false,
                }),
            }
        })
    }
}

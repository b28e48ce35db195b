use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{PurgePolicy, UpdatePolicy};

pub const MAVEN_CENTRAL_NAME: &str = "maven-central";
pub const MAVEN_CENTRAL_URL: &str = "https://repo.maven.apache.org/maven2/";

/// リポジトリ定義。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryConfig {
    /// リポジトリ識別子。
    pub name: String,
    /// ベースURL（file:// を含む完全URL）。
    pub url: String,
    /// 優先度（小さいほど高優先度）。
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// アーティファクトパスのテンプレート。省略時は Maven 標準レイアウト。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_pattern: Option<String>,
    /// `maven-metadata.xml` パスのテンプレート。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_pattern: Option<String>,
    /// 優先的に検索するグループIDの接頭辞。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affinity: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purge: Option<PurgePolicy>,
    /// 認証設定。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: Option<u64>,
}

fn default_priority() -> u32 {
    100
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_read_timeout() -> Option<u64> {
    Some(1800)
}

impl RepositoryConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            priority: default_priority(),
            artifact_pattern: None,
            metadata_pattern: None,
            affinity: Vec::new(),
            update_policy: None,
            purge: None,
            auth: None,
            proxy: None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }

    pub fn maven_central() -> Self {
        Self::new(MAVEN_CENTRAL_NAME, MAVEN_CENTRAL_URL)
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_affinity(mut self, prefix: impl Into<String>) -> Self {
        self.affinity.push(prefix.into());
        self
    }

    /// グループIDがこのリポジトリの親和性設定に一致するか。
    pub fn has_affinity_for(&self, group_id: &str) -> bool {
        self.affinity.iter().any(|prefix| {
            if prefix.contains('*') {
                return crate::model::matches_pattern(group_id, prefix);
            }
            group_id == prefix
                || group_id
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// 認証設定。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuthConfig {
    /// 認証種別。
    #[serde(rename = "type")]
    #[serde(default)]
    pub auth_type: AuthType,
    /// ユーザー名を格納した環境変数名。
    #[serde(default, rename = "username-env")]
    pub username_env: Option<String>,
    /// パスワードを格納した環境変数名。
    #[serde(default, rename = "password-env")]
    pub password_env: Option<String>,
    /// トークンを格納した環境変数名。
    #[serde(default, rename = "token-env")]
    pub token_env: Option<String>,
}

impl AuthConfig {
    pub fn is_none(&self) -> bool {
        matches!(self.auth_type, AuthType::None)
            && self.username_env.is_none()
            && self.password_env.is_none()
            && self.token_env.is_none()
    }
}

/// 認証方式。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Token,
}

/// プロキシ設定。認証情報は環境変数から読み込む。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// プロキシを経由しないホスト。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_proxy_hosts: Vec<String>,
}

impl ProxyConfig {
    /// 環境変数からプロキシ認証情報を取得する。未設定なら認証なし。
    pub fn credentials(&self) -> Option<(String, String)> {
        let username_env = self.username_env.as_deref()?;
        let Ok(username) = std::env::var(username_env) else {
            warn!(proxy = %self.url, env = username_env, "プロキシのユーザー名が環境変数に見つかりません");
            return None;
        };
        let password = self
            .password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some((username, password))
    }
}

pub mod config;

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Dependency;
use crate::registry::{ChecksumPolicy, MavenRegistry, RegistryError};
use crate::repository::config::{AuthType, RepositoryConfig};

/// 認証情報キャッシュエントリ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Token(String),
}

/// リポジトリ管理エラー。
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("認証設定が不完全です: {0}")]
    AuthConfigError(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// プロキシ設定の不備などで利用できないリポジトリ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnusableRepository {
    pub name: String,
    pub reason: String,
}

/// 接続準備済みのクライアント群。
#[derive(Default)]
pub struct ConnectedRepositories {
    pub registries: HashMap<String, MavenRegistry>,
    pub unusable: Vec<UnusableRepository>,
}

/// リポジトリ統合マネージャー。
#[derive(Debug, Clone)]
pub struct RepositoryManager {
    repositories: Vec<RepositoryConfig>,
    auth_cache: HashMap<String, Credentials>,
}

impl RepositoryManager {
    pub fn new(repositories: Vec<RepositoryConfig>) -> Self {
        Self {
            repositories: sorted_unique(repositories),
            auth_cache: HashMap::new(),
        }
    }

    /// 全リポジトリ一覧を優先度順に返す。
    pub fn list(&self) -> &[RepositoryConfig] {
        &self.repositories
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|repo| repo.name == name)
    }

    /// 依存関係の検索順序。記録済みの取得元、なければ親和性を持つリポジトリを先頭へ移す。
    pub fn ordered_for(&self, dependency: &Dependency) -> Vec<&RepositoryConfig> {
        let mut ordered: Vec<&RepositoryConfig> = self.repositories.iter().collect();

        let boosted = dependency
            .origin
            .as_deref()
            .and_then(|origin| ordered.iter().position(|repo| repo.name == origin))
            .or_else(|| {
                ordered
                    .iter()
                    .position(|repo| repo.has_affinity_for(&dependency.group_id))
            });

        if let Some(index) = boosted.filter(|index| *index > 0) {
            let repo = ordered.remove(index);
            debug!(artifact = %dependency, repository = %repo.name, "リポジトリを優先して検索します");
            ordered.insert(0, repo);
        }
        ordered
    }

    /// 認証情報を取得する（必要なら環境変数参照）。
    pub fn get_credentials(
        &mut self,
        repo: &RepositoryConfig,
    ) -> Result<Option<Credentials>, RepositoryError> {
        if let Some(cached) = self.auth_cache.get(&repo.name) {
            return Ok(Some(cached.clone()));
        }

        let Some(auth) = repo.auth.as_ref() else {
            return Ok(None);
        };

        if auth.is_none() {
            return Ok(None);
        }

        let credentials = match auth.auth_type {
            AuthType::None => return Ok(None),
            AuthType::Basic => {
                let username = require_env(auth.username_env.as_deref(), "ユーザー名")?;
                let password = require_env(auth.password_env.as_deref(), "パスワード")?;
                Credentials::Basic { username, password }
            }
            AuthType::Token => {
                let token = require_env(auth.token_env.as_deref(), "トークン")?;
                Credentials::Token(token)
            }
        };

        self.auth_cache
            .insert(repo.name.clone(), credentials.clone());
        Ok(Some(credentials))
    }

    /// 各リポジトリのクライアントを構築する。プロキシ設定の誤りは利用不可として記録する。
    pub fn connect(
        &mut self,
        checksums: ChecksumPolicy,
    ) -> Result<ConnectedRepositories, RepositoryError> {
        let mut connected = ConnectedRepositories::default();
        for config in self.repositories.clone() {
            let credentials = self.get_credentials(&config)?;
            match MavenRegistry::from_config(&config, credentials, checksums) {
                Ok(registry) => {
                    connected.registries.insert(config.name.clone(), registry);
                }
                Err(RegistryError::Transport(error)) if error.is_proxy_failure() => {
                    warn!(
                        repository = %config.name,
                        error = %error,
                        "プロキシ設定が不正なためリポジトリを利用できません"
                    );
                    connected.unusable.push(UnusableRepository {
                        name: config.name.clone(),
                        reason: error.to_string(),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(connected)
    }
}

fn require_env(var_name: Option<&str>, label: &str) -> Result<String, RepositoryError> {
    let Some(name) = var_name else {
        return Err(RepositoryError::AuthConfigError(format!(
            "{label} の環境変数名が設定されていません"
        )));
    };

    std::env::var(name)
        .map_err(|_| RepositoryError::AuthConfigError(format!("環境変数 {name} が見つかりません")))
}

fn sorted_unique(mut repos: Vec<RepositoryConfig>) -> Vec<RepositoryConfig> {
    repos.sort_by(|left, right| {
        left.priority
            .cmp(&right.priority)
            .then_with(|| left.name.cmp(&right.name))
    });

    let mut seen = HashSet::new();
    repos.retain(|repo| seen.insert(repo.name.clone()));
    repos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::config::{AuthConfig, ProxyConfig};
    use std::env;

    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            unsafe {
                env::set_var(key, value);
            }
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.original {
                unsafe {
                    env::set_var(&self.key, value);
                }
            } else {
                unsafe {
                    env::remove_var(&self.key);
                }
            }
        }
    }

    fn names(repos: &[&RepositoryConfig]) -> Vec<String> {
        repos.iter().map(|repo| repo.name.clone()).collect()
    }

    fn manager() -> RepositoryManager {
        RepositoryManager::new(vec![
            RepositoryConfig::maven_central(),
            RepositoryConfig::new("corp", "https://maven.corp/repository")
                .with_priority(50)
                .with_affinity("com.corp"),
            RepositoryConfig::new("jitpack", "https://jitpack.io").with_priority(200),
            RepositoryConfig::new("corp", "https://duplicate.example").with_priority(300),
        ])
    }

    #[test]
    fn sorts_by_priority_and_drops_duplicate_names() {
        let manager = manager();
        let listed: Vec<&str> = manager.list().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(listed, vec!["corp", "maven-central", "jitpack"]);
        assert_eq!(
            manager.get("corp").map(|r| r.url.as_str()),
            Some("https://maven.corp/repository")
        );
    }

    #[test]
    fn recorded_origin_is_searched_first() {
        let manager = manager();
        let dependency = Dependency::new("org.example", "demo", "1.0").with_origin("jitpack");
        assert_eq!(
            names(&manager.ordered_for(&dependency)),
            vec!["jitpack", "corp", "maven-central"]
        );
    }

    #[test]
    fn affinity_boosts_matching_repository() {
        let manager = RepositoryManager::new(vec![
            RepositoryConfig::maven_central().with_priority(1),
            RepositoryConfig::new("corp", "https://maven.corp").with_affinity("com.corp"),
        ]);

        let corp = Dependency::new("com.corp.billing", "api", "2.0");
        assert_eq!(
            names(&manager.ordered_for(&corp)),
            vec!["corp", "maven-central"]
        );

        let other = Dependency::new("org.example", "demo", "1.0");
        assert_eq!(
            names(&manager.ordered_for(&other)),
            vec!["maven-central", "corp"]
        );
    }

    #[test]
    fn fetches_and_caches_credentials() {
        let mut config = RepositoryConfig::new("secure", "https://secure.repo");
        config.auth = Some(AuthConfig {
            auth_type: AuthType::Basic,
            username_env: Some("KURA_TEST_REPO_USER".to_string()),
            password_env: Some("KURA_TEST_REPO_PASS".to_string()),
            token_env: None,
        });
        let mut manager = RepositoryManager::new(vec![config.clone()]);

        let user_guard = EnvGuard::set("KURA_TEST_REPO_USER", "alice");
        let pass_guard = EnvGuard::set("KURA_TEST_REPO_PASS", "secret");

        let first = manager
            .get_credentials(&config)
            .expect("credentials")
            .expect("basic auth");
        assert_eq!(
            first,
            Credentials::Basic {
                username: "alice".to_string(),
                password: "secret".to_string(),
            }
        );

        drop(user_guard);
        drop(pass_guard);

        // 2回目はキャッシュ利用で成功する。
        assert!(
            manager
                .get_credentials(&config)
                .expect("credentials")
                .is_some()
        );
    }

    #[test]
    fn fails_when_required_env_missing() {
        let mut config = RepositoryConfig::new("secure", "https://secure.repo");
        config.auth = Some(AuthConfig {
            auth_type: AuthType::Token,
            username_env: None,
            password_env: None,
            token_env: Some("KURA_TEST_MISSING_TOKEN".to_string()),
        });
        let mut manager = RepositoryManager::new(vec![config.clone()]);

        let err = manager
            .get_credentials(&config)
            .expect_err("missing token should fail");
        match err {
            RepositoryError::AuthConfigError(message) => assert!(message.contains("環境変数")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn connect_records_repositories_with_broken_proxy() {
        let mut broken = RepositoryConfig::new("behind-proxy", "https://repo.example.com");
        broken.proxy = Some(ProxyConfig {
            url: "::broken::".to_string(),
            username_env: None,
            password_env: None,
            non_proxy_hosts: Vec::new(),
        });
        let mut manager =
            RepositoryManager::new(vec![RepositoryConfig::maven_central(), broken]);

        let connected = manager
            .connect(ChecksumPolicy::default())
            .expect("connect");
        assert!(connected.registries.contains_key("maven-central"));
        assert_eq!(connected.unusable.len(), 1);
        assert_eq!(connected.unusable[0].name, "behind-proxy");
    }

    #[test]
    fn connect_rejects_invalid_repository_url() {
        let mut manager =
            RepositoryManager::new(vec![RepositoryConfig::new("bad", "not a url")]);
        let result = manager.connect(ChecksumPolicy::default());
        assert!(matches!(
            result,
            Err(RepositoryError::Registry(RegistryError::InvalidUrl { .. }))
        ));
    }
}

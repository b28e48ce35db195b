//! キャッシュ優先の取得処理。
//!
//! メタバージョンを解決し、キャッシュになければリポジトリを順に試す。
//! 取得結果は来歴レコードとともに保存し、スナップショットにはパージを適用する。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, CacheError, Clock, MetadataLevel, PurgePolicy, UpdatePolicy};
use crate::metadata::{MavenMetadata, MetadataError, MetadataService};
use crate::model::{Dependency, Scope};
use crate::registry::{ChecksumPolicy, FetchedResource, MavenRegistry, RegistryError};
use crate::repository::{RepositoryError, RepositoryManager, UnusableRepository};

#[derive(Debug, Clone, Default)]
pub struct DownloadSettings {
    pub checksums: ChecksumPolicy,
    /// リポジトリ側で指定がない場合の更新ポリシー。
    pub update_policy: UpdatePolicy,
    /// プロジェクト単位のパージポリシー。リポジトリの設定より優先する。
    pub purge: Option<PurgePolicy>,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{coordinates} を取得できません。利用できないリポジトリ: {repositories}")]
    Configuration {
        coordinates: String,
        repositories: String,
    },
    #[error("{coordinates} はスナップショットではありません")]
    NotSnapshot { coordinates: String },
}

impl DownloadError {
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(
            self,
            DownloadError::Registry(RegistryError::ChecksumMismatch { .. })
                | DownloadError::Metadata(MetadataError::Registry(
                    RegistryError::ChecksumMismatch { .. }
                ))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadSource {
    Cache,
    Registry(String),
}

/// 取得済みファイル。`dependency` は解決後の座標（リビジョンと取得元を含む）。
#[derive(Debug, Clone, Serialize)]
pub struct Retrieved {
    pub dependency: Dependency,
    pub path: PathBuf,
    pub source: DownloadSource,
}

#[derive(Debug, Default, Serialize)]
pub struct DownloadReport {
    pub retrieved: Vec<Retrieved>,
    pub missing: Vec<Dependency>,
    pub warnings: Vec<String>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub struct DownloadManager {
    cache: Arc<ArtifactCache>,
    metadata: MetadataService,
    repositories: RepositoryManager,
    registries: HashMap<String, MavenRegistry>,
    unusable: Vec<UnusableRepository>,
    settings: DownloadSettings,
    clock: Arc<dyn Clock>,
}

impl DownloadManager {
    /// リポジトリ設定からクライアントを構築して初期化する。
    pub fn new(
        mut repositories: RepositoryManager,
        cache: Arc<ArtifactCache>,
        clock: Arc<dyn Clock>,
        settings: DownloadSettings,
    ) -> Result<Self, DownloadError> {
        let connected = repositories.connect(settings.checksums)?;
        Ok(Self {
            metadata: MetadataService::new(Arc::clone(&cache), Arc::clone(&clock)),
            cache,
            repositories,
            registries: connected.registries,
            unusable: connected.unusable,
            settings,
            clock,
        })
    }

    /// 構築済みのクライアントを使う。名前は `repositories` の定義と対応させる。
    pub fn with_registries(
        repositories: RepositoryManager,
        registries: Vec<MavenRegistry>,
        cache: Arc<ArtifactCache>,
        clock: Arc<dyn Clock>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            metadata: MetadataService::new(Arc::clone(&cache), Arc::clone(&clock)),
            cache,
            repositories,
            registries: registries
                .into_iter()
                .map(|registry| (registry.name().to_string(), registry))
                .collect(),
            unusable: Vec::new(),
            settings,
            clock,
        }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn unusable_repositories(&self) -> &[UnusableRepository] {
        &self.unusable
    }

    fn ordered_registries(&self, dependency: &Dependency) -> Vec<&MavenRegistry> {
        self.repositories
            .ordered_for(dependency)
            .into_iter()
            .filter_map(|config| self.registries.get(&config.name))
            .collect()
    }

    fn update_policy_for(&self, dependency: &Dependency) -> UpdatePolicy {
        dependency
            .origin
            .as_deref()
            .and_then(|origin| self.repositories.get(origin))
            .and_then(|config| config.update_policy)
            .unwrap_or(self.settings.update_policy)
    }

    fn purge_policy_for(&self, dependency: &Dependency) -> Option<PurgePolicy> {
        self.settings.purge.or_else(|| {
            dependency
                .origin
                .as_deref()
                .and_then(|origin| self.repositories.get(origin))
                .and_then(|config| config.purge)
        })
    }

    /// RELEASE / LATEST / SNAPSHOT を具体的なバージョンへ解決する。
    pub async fn resolve_version(
        &self,
        dependency: &Dependency,
    ) -> Result<Option<Dependency>, DownloadError> {
        if !dependency.is_meta_version()
            || (dependency.is_snapshot() && dependency.revision.is_some())
        {
            return Ok(Some(dependency.clone()));
        }
        let registries = self.ordered_registries(dependency);
        let policy = self.update_policy_for(dependency);
        Ok(self
            .metadata
            .resolve(dependency, policy, &registries)
            .await?)
    }

    /// キャッシュを優先してファイルを取得する。どこにもなければ `Ok(None)`。
    pub async fn retrieve(
        &self,
        dependency: &Dependency,
        extension: &str,
    ) -> Result<Option<Retrieved>, DownloadError> {
        let Some(mut resolved) = self.resolve_version(dependency).await? else {
            return Ok(None);
        };

        if let Some(cached) = self.cache.lookup(&resolved, extension)? {
            let record = self
                .cache
                .provenance()
                .load(&resolved, MetadataLevel::Version)?;
            if resolved.origin.is_none() {
                resolved.origin = record.origin.clone();
            }
            let unversioned_snapshot = resolved.is_snapshot() && resolved.revision.is_none();
            if !unversioned_snapshot
                || !self
                    .update_policy_for(&resolved)
                    .is_stale(record.last_downloaded, self.clock.as_ref())
            {
                debug!(artifact = %resolved, extension, "キャッシュを利用します");
                self.apply_purge(&resolved)?;
                return Ok(Some(Retrieved {
                    dependency: resolved,
                    path: cached.path,
                    source: DownloadSource::Cache,
                }));
            }
            debug!(artifact = %resolved, "スナップショットの再取得が必要です");
        }

        self.download(&resolved, extension).await
    }

    pub async fn retrieve_pom(
        &self,
        dependency: &Dependency,
    ) -> Result<Option<Retrieved>, DownloadError> {
        self.retrieve(&dependency.pom_variant(), "pom").await
    }

    async fn download(
        &self,
        dependency: &Dependency,
        extension: &str,
    ) -> Result<Option<Retrieved>, DownloadError> {
        let mut proxy_failures = Vec::new();
        for registry in self.ordered_registries(dependency) {
            match registry.fetch(dependency, extension).await {
                Ok(Some(fetched)) => {
                    return self
                        .store_fetched(dependency, extension, registry, fetched)
                        .map(Some);
                }
                Ok(None) => {
                    debug!(artifact = %dependency, repository = registry.name(), "リポジトリに存在しません");
                }
                Err(error @ RegistryError::ChecksumMismatch { .. }) => {
                    warn!(artifact = %dependency, repository = registry.name(), error = %error, "チェックサム検証に失敗しました");
                    self.cache.purge_coordinate(dependency)?;
                    return Err(error.into());
                }
                Err(RegistryError::Transport(error)) => {
                    warn!(
                        artifact = %dependency,
                        repository = registry.name(),
                        error = %error,
                        "取得に失敗したため次のリポジトリを試します"
                    );
                    if error.is_proxy_failure() {
                        proxy_failures.push(registry.name().to_string());
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        let mut unusable: Vec<String> = self.unusable.iter().map(|repo| repo.name.clone()).collect();
        unusable.extend(proxy_failures);
        if !unusable.is_empty() {
            return Err(DownloadError::Configuration {
                coordinates: dependency.to_string(),
                repositories: unusable.join(", "),
            });
        }

        warn!(artifact = %dependency, extension, "どのリポジトリにも見つかりません");
        Ok(None)
    }

    fn store_fetched(
        &self,
        dependency: &Dependency,
        extension: &str,
        registry: &MavenRegistry,
        fetched: FetchedResource,
    ) -> Result<Retrieved, DownloadError> {
        let cached = self.cache.store(dependency, extension, &fetched.bytes)?;
        let now = self.clock.now();
        let origin = registry.name().to_string();
        let revision = dependency.revision.clone();
        self.cache
            .provenance()
            .update(dependency, MetadataLevel::Version, |record| {
                record.origin = Some(origin.clone());
                record.origin_url = Some(fetched.url.to_string());
                record.last_downloaded = Some(now);
                record.last_updated = Some(now);
                if revision.is_some() {
                    record.revision = revision;
                }
            })?;
        info!(
            artifact = %dependency,
            repository = %origin,
            url = %fetched.url,
            size = cached.size,
            "ダウンロードしました"
        );

        let mut resolved = dependency.clone();
        resolved.origin = Some(origin.clone());
        self.apply_purge(&resolved)?;
        Ok(Retrieved {
            dependency: resolved,
            path: cached.path,
            source: DownloadSource::Registry(origin),
        })
    }

    fn apply_purge(&self, dependency: &Dependency) -> Result<Vec<PathBuf>, DownloadError> {
        let Some(policy) = self.purge_policy_for(dependency) else {
            return Ok(Vec::new());
        };
        Ok(self.cache.purge_snapshots(
            dependency,
            &policy,
            dependency.revision.as_deref(),
            self.clock.now(),
        )?)
    }

    /// 記録済みの現行リビジョンを残してスナップショットをパージする。
    pub fn purge_snapshots(&self, dependency: &Dependency) -> Result<Vec<PathBuf>, DownloadError> {
        if !dependency.is_snapshot() {
            return Ok(Vec::new());
        }
        let mut current = dependency.clone();
        if current.revision.is_none() {
            let record = self
                .cache
                .provenance()
                .load(dependency, MetadataLevel::Version)?;
            current.revision = record.revision;
            if current.origin.is_none() {
                current.origin = record.origin;
            }
        }
        self.apply_purge(&current)
    }

    /// ローカルでビルドしたスナップショットをキャッシュへ登録する。
    ///
    /// 次のビルド番号を採番し、両階層のメタデータと来歴を更新してからパージを適用する。
    /// `artifacts` の各ファイルは同じリビジョンで保存される。
    pub fn install_snapshot(
        &self,
        dependency: &Dependency,
        artifacts: &[(&str, &[u8])],
    ) -> Result<Dependency, DownloadError> {
        let Some(base) = dependency.version.strip_suffix("SNAPSHOT") else {
            return Err(DownloadError::NotSnapshot {
                coordinates: dependency.to_string(),
            });
        };
        let now = self.clock.now();

        let mut version_metadata = self
            .cache
            .read_metadata(dependency, MetadataLevel::Version)?
            .unwrap_or_else(|| MavenMetadata::for_dependency(dependency, MetadataLevel::Version));
        let snapshot = version_metadata.record_snapshot(now);
        let revision = format!(
            "{base}{}-{}",
            snapshot.timestamp.unwrap_or_default(),
            snapshot.build_number.unwrap_or_default()
        );
        self.cache
            .write_metadata(dependency, MetadataLevel::Version, &version_metadata)?;

        let mut artifact_metadata = self
            .cache
            .read_metadata(dependency, MetadataLevel::Artifact)?
            .unwrap_or_else(|| MavenMetadata::for_dependency(dependency, MetadataLevel::Artifact));
        if !artifact_metadata.versions().contains(&dependency.version) {
            artifact_metadata.add_version(&dependency.version, now);
            self.cache
                .write_metadata(dependency, MetadataLevel::Artifact, &artifact_metadata)?;
        }

        let mut installed = dependency.clone();
        installed.revision = Some(revision.clone());
        for (extension, bytes) in artifacts {
            self.cache.store(&installed, extension, bytes)?;
        }
        self.cache
            .provenance()
            .update(&installed, MetadataLevel::Version, |record| {
                record.revision = Some(revision.clone());
                record.last_updated = Some(now);
                record.last_checked = Some(now);
            })?;
        info!(artifact = %dependency, revision = %revision, "スナップショットをインストールしました");

        self.apply_purge(&installed)?;
        Ok(installed)
    }

    /// 解決済み依存関係の実体をまとめて取得する。
    ///
    /// `system` スコープはリポジトリから取得しない。見つからないものは `missing` に入る。
    pub async fn materialize(
        &self,
        dependencies: &[Dependency],
        with_sources: bool,
    ) -> Result<DownloadReport, DownloadError> {
        let mut report = DownloadReport::default();
        for dependency in dependencies {
            if dependency.scope == Scope::System {
                let message = format!("{dependency} は system スコープのため取得しません");
                debug!(artifact = %dependency, "{message}");
                report.warnings.push(message);
                continue;
            }
            if !dependency.contributes_to_classpath() {
                continue;
            }

            match self.retrieve(dependency, &dependency.extension).await? {
                Some(retrieved) => report.retrieved.push(retrieved),
                None => {
                    report.missing.push(dependency.clone());
                    continue;
                }
            }

            if with_sources && dependency.classifier.is_none() {
                let sources = dependency.sources_variant();
                match self.retrieve(&sources, "jar").await? {
                    Some(retrieved) => report.retrieved.push(retrieved),
                    None => report
                        .warnings
                        .push(format!("{dependency} のソースアーカイブが見つかりません")),
                }
            }
        }
        Ok(report)
    }
}

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{MavenMetadata, MetadataParseError, parse_metadata};
use crate::cache::{ArtifactCache, CacheError, Clock, MetadataLevel, UpdatePolicy};
use crate::model::Dependency;
use crate::registry::{MavenRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{coordinates} のメタデータ ({repository}) を解析できません: {source}")]
    Parse {
        coordinates: String,
        repository: String,
        source: MetadataParseError,
    },
}

/// メタバージョン（RELEASE / LATEST / SNAPSHOT）の解決とメタデータの統合。
#[derive(Debug, Clone)]
pub struct MetadataService {
    cache: Arc<ArtifactCache>,
    clock: Arc<dyn Clock>,
}

impl MetadataService {
    pub fn new(cache: Arc<ArtifactCache>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// 各リポジトリのメタデータを取得してキャッシュ済みの写しへ統合する。
    ///
    /// 結果に関わらず `lastChecked` を記録する。見つかった場合は取得元と
    /// RELEASE/LATEST もしくはスナップショットリビジョンを更新する。
    pub async fn refresh(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
        registries: &[&MavenRegistry],
    ) -> Result<Option<MavenMetadata>, MetadataError> {
        let mut merged = match self.cache.read_metadata(dependency, level) {
            Ok(cached) => cached,
            Err(CacheError::Metadata { path, source }) => {
                warn!(
                    artifact = %dependency,
                    path = %path.display(),
                    error = %source,
                    "キャッシュ済みメタデータが壊れているため破棄します"
                );
                None
            }
            Err(other) => return Err(other.into()),
        };

        let mut origin: Option<(String, String)> = None;
        for registry in registries {
            let fetched = match registry.fetch_metadata(dependency, level).await {
                Ok(Some(fetched)) => fetched,
                Ok(None) => {
                    debug!(artifact = %dependency, repository = registry.name(), "メタデータが存在しません");
                    continue;
                }
                Err(RegistryError::Transport(error)) => {
                    warn!(
                        artifact = %dependency,
                        repository = registry.name(),
                        error = %error,
                        "メタデータの取得に失敗したため次のリポジトリを試します"
                    );
                    continue;
                }
                Err(error @ RegistryError::ChecksumMismatch { .. }) => {
                    warn!(artifact = %dependency, repository = registry.name(), error = %error, "メタデータのチェックサム検証に失敗しました");
                    self.cache.discard_metadata(dependency, level)?;
                    return Err(error.into());
                }
                Err(error) => return Err(error.into()),
            };

            let incoming =
                parse_metadata(&fetched.bytes).map_err(|source| MetadataError::Parse {
                    coordinates: dependency.to_string(),
                    repository: registry.name().to_string(),
                    source,
                })?;
            merged
                .get_or_insert_with(|| MavenMetadata::for_dependency(dependency, level))
                .merge(&incoming);
            if origin.is_none() {
                origin = Some((registry.name().to_string(), fetched.url.to_string()));
            }
        }

        let now = self.clock.now();
        if origin.is_some() {
            if let Some(metadata) = &merged {
                self.cache.write_metadata(dependency, level, metadata)?;
            }
        }

        let base_version = dependency.version.clone();
        self.cache
            .provenance()
            .update(dependency, level, |record| {
                record.last_checked = Some(now);
                if let Some((name, url)) = origin {
                    record.origin = Some(name);
                    record.origin_url = Some(url);
                    record.last_updated = Some(now);
                }
                let Some(metadata) = &merged else {
                    return;
                };
                match level {
                    MetadataLevel::Artifact => {
                        if let Some(release) = metadata.release() {
                            record.release = Some(release.to_string());
                        }
                        if let Some(latest) = metadata.latest() {
                            record.latest = Some(latest.to_string());
                        }
                    }
                    MetadataLevel::Version => {
                        if let Some(revision) = metadata.snapshot_revision(&base_version) {
                            record.revision = Some(revision);
                        }
                    }
                }
            })?;
        Ok(merged)
    }

    /// メタバージョンを具体的なバージョン（とスナップショットリビジョン）へ解決する。
    ///
    /// 通常のバージョンはそのまま返す。RELEASE/LATEST が解決できなければ `None`。
    pub async fn resolve(
        &self,
        dependency: &Dependency,
        policy: UpdatePolicy,
        registries: &[&MavenRegistry],
    ) -> Result<Option<Dependency>, MetadataError> {
        if dependency.is_release_pointer() || dependency.is_latest_pointer() {
            let Some(version) = self.resolve_pointer(dependency, policy, registries).await? else {
                return Ok(None);
            };
            let mut resolved = dependency.clone();
            resolved.version = version;
            resolved.revision = None;
            if !resolved.is_snapshot() {
                return Ok(Some(resolved));
            }
            return self
                .resolve_snapshot(&resolved, policy, registries)
                .await
                .map(Some);
        }

        if dependency.is_snapshot() {
            return self
                .resolve_snapshot(dependency, policy, registries)
                .await
                .map(Some);
        }

        Ok(Some(dependency.clone()))
    }

    async fn resolve_pointer(
        &self,
        dependency: &Dependency,
        policy: UpdatePolicy,
        registries: &[&MavenRegistry],
    ) -> Result<Option<String>, MetadataError> {
        let level = MetadataLevel::Artifact;
        let mut record = self.cache.provenance().load(dependency, level)?;
        if policy.is_stale(record.last_checked, self.clock.as_ref()) {
            self.refresh(dependency, level, registries).await?;
            record = self.cache.provenance().load(dependency, level)?;
        } else {
            debug!(artifact = %dependency, policy = %policy, "メタデータは最新のため再確認しません");
        }

        let pointer = if dependency.is_release_pointer() {
            record.release
        } else {
            record.latest
        };
        match &pointer {
            Some(version) => {
                info!(artifact = %dependency, resolved = %version, "メタバージョンを解決しました")
            }
            None => warn!(artifact = %dependency, "メタバージョンを解決できません"),
        }
        Ok(pointer)
    }

    async fn resolve_snapshot(
        &self,
        dependency: &Dependency,
        policy: UpdatePolicy,
        registries: &[&MavenRegistry],
    ) -> Result<Dependency, MetadataError> {
        let level = MetadataLevel::Version;
        let record = self.cache.provenance().load(dependency, level)?;
        let stale = policy.is_stale(record.last_checked, self.clock.as_ref());

        let revision = if stale {
            self.refresh(dependency, level, registries)
                .await?
                .and_then(|metadata| metadata.snapshot_revision(&dependency.version))
                .or(record.revision)
        } else {
            record.revision
        };

        let mut resolved = dependency.clone();
        if resolved.origin.is_none() {
            resolved.origin = record.origin;
        }
        match &revision {
            Some(revision) => {
                debug!(artifact = %dependency, revision = %revision, "スナップショットリビジョンを解決しました")
            }
            None => {
                debug!(artifact = %dependency, "タイムスタンプ付きスナップショットが見つかりません")
            }
        }
        resolved.revision = revision;
        Ok(resolved)
    }
}

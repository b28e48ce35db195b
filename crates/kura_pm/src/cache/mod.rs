//! ローカルアーティファクトキャッシュ。
//!
//! レイアウトは Maven リポジトリと同じ
//! `{root}/{groupPath}/{artifactId}/{version}/{artifactId}-{version}[-{classifier}].{ext}`
//! で、各ファイルの隣に `.sha1` を置く。メタデータと来歴レコードは
//! アーティファクト単位とバージョン単位の2階層に保存される。

mod lock;
pub mod policy;
pub mod provenance;
pub mod purge;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metadata::{self, MavenMetadata, MetadataParseError, MetadataWriteError};
use crate::model::Dependency;
use crate::registry::ChecksumAlgorithm;

pub use policy::{Clock, FixedClock, SystemClock, UpdatePolicy, UpdatePolicyError};
pub use provenance::{ProvenanceRecord, ProvenanceStore};
pub use purge::{PurgePolicy, SnapshotRevision, snapshot_timestamp};

pub(crate) use lock::PathLocks;

const METADATA_FILE: &str = "maven-metadata.xml";
const SIDECAR_ALGORITHM: ChecksumAlgorithm = ChecksumAlgorithm::Sha1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("ホームディレクトリを特定できませんでした")]
    HomeDirNotFound,
    #[error("キャッシュパス {path:?} の親ディレクトリを解決できませんでした")]
    MissingParent { path: PathBuf },
    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSONシリアライズ/デシリアライズに失敗しました: {0}")]
    Json(#[from] serde_json::Error),
    #[error("キャッシュ済みメタデータ {path:?} の解析に失敗しました: {source}")]
    Metadata {
        path: PathBuf,
        source: MetadataParseError,
    },
    #[error(transparent)]
    MetadataWrite(#[from] MetadataWriteError),
}

/// メタデータと来歴レコードの保存階層。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataLevel {
    /// `{groupPath}/{artifactId}`: バージョン一覧と RELEASE/LATEST。
    Artifact,
    /// `{groupPath}/{artifactId}/{version}`: スナップショットのビルド履歴。
    Version,
}

#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub artifact_hits: u64,
    pub artifact_misses: u64,
    pub pom_hits: u64,
    pub pom_misses: u64,
    pub metadata_hits: u64,
    pub metadata_misses: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    artifact_hits: AtomicU64,
    artifact_misses: AtomicU64,
    pom_hits: AtomicU64,
    pom_misses: AtomicU64,
    metadata_hits: AtomicU64,
    metadata_misses: AtomicU64,
}

impl CacheStats {
    fn record_lookup(&self, extension: &str, hit: bool) {
        let counter = match (extension == "pom", hit) {
            (true, true) => &self.pom_hits,
            (true, false) => &self.pom_misses,
            (false, true) => &self.artifact_hits,
            (false, false) => &self.artifact_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_metadata(&self, hit: bool) {
        let counter = if hit {
            &self.metadata_hits
        } else {
            &self.metadata_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            artifact_hits: self.artifact_hits.load(Ordering::Relaxed),
            artifact_misses: self.artifact_misses.load(Ordering::Relaxed),
            pom_hits: self.pom_hits.load(Ordering::Relaxed),
            pom_misses: self.pom_misses.load(Ordering::Relaxed),
            metadata_hits: self.metadata_hits.load(Ordering::Relaxed),
            metadata_misses: self.metadata_misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    provenance: ProvenanceStore,
    stats: CacheStats,
}

impl ArtifactCache {
    /// グローバルキャッシュ (`~/.kura/cache`) を初期化する。
    pub fn global() -> Result<Self, CacheError> {
        let home = dirs::home_dir().ok_or(CacheError::HomeDirNotFound)?;
        Self::with_dir(home.join(".kura").join("cache"))
    }

    /// 指定ディレクトリでキャッシュを初期化する。
    pub fn with_dir(cache_dir: PathBuf) -> Result<Self, CacheError> {
        ensure_directory(&cache_dir)?;
        Ok(Self {
            provenance: ProvenanceStore::new(cache_dir.clone()),
            root: cache_dir,
            stats: CacheStats::default(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.root
    }

    pub fn provenance(&self) -> &ProvenanceStore {
        &self.provenance
    }

    pub fn artifact_dir(&self, dependency: &Dependency) -> PathBuf {
        artifact_dir_in(&self.root, dependency)
    }

    pub fn version_dir(&self, dependency: &Dependency) -> PathBuf {
        version_dir_in(&self.root, dependency)
    }

    /// アーティファクトのキャッシュパス。スナップショットはリビジョン名で保存する。
    pub fn artifact_path(&self, dependency: &Dependency, extension: &str) -> PathBuf {
        self.version_dir(dependency)
            .join(dependency.file_name(extension))
    }

    pub fn pom_path(&self, dependency: &Dependency) -> PathBuf {
        self.artifact_path(&dependency.pom_variant(), "pom")
    }

    pub fn metadata_path(&self, dependency: &Dependency, level: MetadataLevel) -> PathBuf {
        let dir = match level {
            MetadataLevel::Artifact => self.artifact_dir(dependency),
            MetadataLevel::Version => self.version_dir(dependency),
        };
        dir.join(METADATA_FILE)
    }

    /// キャッシュ済みアーティファクトを探す。統計を更新する。
    pub fn lookup(
        &self,
        dependency: &Dependency,
        extension: &str,
    ) -> Result<Option<CachedArtifact>, CacheError> {
        let path = self.artifact_path(dependency, extension);
        if !path.is_file() {
            debug!(artifact = %dependency, extension, "キャッシュミス");
            self.stats.record_lookup(extension, false);
            return Ok(None);
        }

        let sidecar = sidecar_path(&path);
        let checksum = if sidecar.is_file() {
            Some(fs::read_to_string(&sidecar)?.trim().to_string())
        } else {
            None
        };

        let size = fs::metadata(&path)?.len();
        self.stats.record_lookup(extension, true);
        Ok(Some(CachedArtifact {
            path,
            size,
            checksum,
        }))
    }

    /// アーティファクトと `.sha1` サイドカーを保存する。
    pub fn store(
        &self,
        dependency: &Dependency,
        extension: &str,
        bytes: &[u8],
    ) -> Result<CachedArtifact, CacheError> {
        let path = self.artifact_path(dependency, extension);
        let checksum = SIDECAR_ALGORITHM.compute(bytes);
        write_bytes(&path, bytes)?;
        write_bytes(&sidecar_path(&path), checksum.as_bytes())?;
        debug!(artifact = %dependency, path = %path.display(), "キャッシュへ保存しました");
        Ok(CachedArtifact {
            path,
            size: bytes.len() as u64,
            checksum: Some(checksum),
        })
    }

    pub fn read_metadata(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
    ) -> Result<Option<MavenMetadata>, CacheError> {
        let path = self.metadata_path(dependency, level);
        if !path.is_file() {
            self.stats.record_metadata(false);
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let parsed = metadata::parse_metadata(&bytes)
            .map_err(|source| CacheError::Metadata { path, source })?;
        self.stats.record_metadata(true);
        Ok(Some(parsed))
    }

    pub fn write_metadata(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
        metadata: &MavenMetadata,
    ) -> Result<PathBuf, CacheError> {
        let path = self.metadata_path(dependency, level);
        let xml = metadata.to_xml()?;
        write_bytes(&path, xml.as_bytes())?;
        write_bytes(
            &sidecar_path(&path),
            SIDECAR_ALGORITHM.compute(xml.as_bytes()).as_bytes(),
        )?;
        Ok(path)
    }

    /// キャッシュ済みメタデータとそのサイドカーを削除する。来歴レコードは残す。
    pub fn discard_metadata(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let path = self.metadata_path(dependency, level);
        let mut removed = Vec::new();
        for candidate in [sidecar_path(&path), path] {
            match fs::remove_file(&candidate) {
                Ok(()) => removed.push(candidate),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(removed)
    }

    /// 座標（スナップショットならリビジョン）に属するファイルをすべて削除する。
    ///
    /// メタデータと来歴レコードは残す。
    pub fn purge_coordinate(&self, dependency: &Dependency) -> Result<Vec<PathBuf>, CacheError> {
        let prefix = format!("{}-{}", dependency.artifact_id, dependency.file_version());
        let dir = self.version_dir(dependency);
        let mut removed = Vec::new();
        for path in list_files(&dir)? {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let belongs = name
                .strip_prefix(&prefix)
                .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'));
            // `lib-1.0` の接頭辞は `lib-1.0.1.jar` にも一致しうる
            if belongs && !shares_longer_version(name, &prefix) {
                fs::remove_file(&path)?;
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            warn!(artifact = %dependency, files = removed.len(), "キャッシュ済みファイルを削除しました");
        }
        Ok(removed)
    }

    /// バージョンディレクトリ内のスナップショットリビジョンを列挙する。
    pub fn snapshot_revisions(
        &self,
        dependency: &Dependency,
    ) -> Result<Vec<SnapshotRevision>, CacheError> {
        Ok(self
            .snapshot_files(dependency)?
            .into_keys()
            .filter_map(|revision| SnapshotRevision::parse(&dependency.version, &revision))
            .collect())
    }

    /// パージポリシーに従って古いスナップショットのファイルを削除する。
    pub fn purge_snapshots(
        &self,
        dependency: &Dependency,
        policy: &PurgePolicy,
        current: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, CacheError> {
        if !dependency.is_snapshot() || !policy.is_active() {
            return Ok(Vec::new());
        }

        let mut files = self.snapshot_files(dependency)?;
        let revisions: Vec<SnapshotRevision> = files
            .keys()
            .filter_map(|revision| SnapshotRevision::parse(&dependency.version, revision))
            .collect();

        let mut removed = Vec::new();
        for revision in policy.select_for_purge(&revisions, current, now) {
            for path in files.remove(&revision).unwrap_or_default() {
                fs::remove_file(&path)?;
                removed.push(path);
            }
            info!(artifact = %dependency, revision = %revision, "古いスナップショットを削除しました");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn snapshot_files(
        &self,
        dependency: &Dependency,
    ) -> Result<BTreeMap<String, Vec<PathBuf>>, CacheError> {
        let mut by_revision: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        let Some(base) = dependency.version.strip_suffix("SNAPSHOT") else {
            return Ok(by_revision);
        };
        let prefix = format!("{}-{}", dependency.artifact_id, base);

        for path in list_files(&self.version_dir(dependency))? {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(stamp) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some((_, build_number)) = purge::parse_stamp(stamp) else {
                continue;
            };
            let revision = format!("{base}{}-{build_number}", &stamp[..15]);
            by_revision.entry(revision).or_default().push(path);
        }
        Ok(by_revision)
    }
}

fn shares_longer_version(name: &str, prefix: &str) -> bool {
    // `lib-1.0` に続くのが `.数字` ならば別バージョンのファイル
    name[prefix.len()..]
        .strip_prefix('.')
        .and_then(|rest| rest.chars().next())
        .is_some_and(|next| next.is_ascii_digit())
}

pub(crate) fn artifact_dir_in(root: &Path, dependency: &Dependency) -> PathBuf {
    let mut dir = root.to_path_buf();
    for segment in dependency.group_id.split('.') {
        dir.push(segment);
    }
    dir.push(&dependency.artifact_id);
    dir
}

pub(crate) fn version_dir_in(root: &Path, dependency: &Dependency) -> PathBuf {
    artifact_dir_in(root, dependency).join(&dependency.version)
}

pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_ALGORITHM.extension());
    PathBuf::from(name)
}

/// ファイルの最終更新時刻（UNIXエポックからのミリ秒）。
pub fn modified_millis(path: &Path) -> Result<i64, CacheError> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified).timestamp_millis())
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// 一時ファイルへ書き込んでから置き換える。
pub(crate) fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = path.parent().ok_or_else(|| CacheError::MissingParent {
        path: path.to_path_buf(),
    })?;
    ensure_directory(parent)?;
    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    set_file_permissions(path)?;
    Ok(())
}

fn ensure_directory(path: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(path)?;
    set_dir_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CacheError> {
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CacheError> {
    Ok(())
}

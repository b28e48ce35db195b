use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CacheError, MetadataLevel, PathLocks, artifact_dir_in, version_dir_in, write_bytes};
use crate::model::{Dependency, Scope};

const RECORD_FILE: &str = "provenance.json";

/// キャッシュ済み座標の来歴。ネットワーク操作のたびに即座に永続化される。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceRecord {
    /// 取得元リポジトリ名。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_downloaded: Option<DateTime<Utc>>,
    /// アーティファクト単位のレコードが保持する RELEASE の解決先。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// アーティファクト単位のレコードが保持する LATEST の解決先。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<String>,
    /// バージョン単位のレコードが保持するスナップショットリビジョン。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// 解決結果を計算した時点の POM 更新時刻（ミリ秒）。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_solved: Option<i64>,
    /// スコープごとの推移的依存関係（相対リング）。
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub solutions: BTreeMap<Scope, Vec<Dependency>>,
}

impl ProvenanceRecord {
    /// POM の更新時刻が記録と一致する場合のみキャッシュ済み解決結果を返す。
    pub fn cached_solution(&self, scope: Scope, pom_modified: i64) -> Option<&[Dependency]> {
        if self.last_solved != Some(pom_modified) {
            return None;
        }
        self.solutions.get(&scope).map(Vec::as_slice)
    }

    /// 解決結果を記録する。POM の更新時刻が変わった場合は他スコープの結果を破棄する。
    pub fn store_solution(&mut self, scope: Scope, pom_modified: i64, solution: Vec<Dependency>) {
        if self.last_solved != Some(pom_modified) {
            self.solutions.clear();
            self.last_solved = Some(pom_modified);
        }
        self.solutions.insert(scope, solution);
    }
}

/// `provenance.json` の読み書きを担う。複製はロック表を共有する。
#[derive(Debug, Clone)]
pub struct ProvenanceStore {
    root: PathBuf,
    locks: Arc<PathLocks>,
}

impl ProvenanceStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Arc::new(PathLocks::default()),
        }
    }

    pub fn record_path(&self, dependency: &Dependency, level: MetadataLevel) -> PathBuf {
        let dir = match level {
            MetadataLevel::Artifact => artifact_dir_in(&self.root, dependency),
            MetadataLevel::Version => version_dir_in(&self.root, dependency),
        };
        dir.join(RECORD_FILE)
    }

    /// レコードを読み込む。存在しない、または壊れている場合は空のレコードを返す。
    pub fn load(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
    ) -> Result<ProvenanceRecord, CacheError> {
        read_record(&self.record_path(dependency, level))
    }

    /// ロックを取得した上でレコードを読み込み、更新して書き戻す。
    pub fn update<F>(
        &self,
        dependency: &Dependency,
        level: MetadataLevel,
        apply: F,
    ) -> Result<ProvenanceRecord, CacheError>
    where
        F: FnOnce(&mut ProvenanceRecord),
    {
        let path = self.record_path(dependency, level);
        let _lock = self.locks.lock_exclusive(&lock_path(&path))?;
        let mut record = read_record(&path)?;
        apply(&mut record);
        let serialized = serde_json::to_vec_pretty(&record)?;
        write_bytes(&path, &serialized)?;
        debug!(artifact = %dependency, path = %path.display(), "来歴レコードを更新しました");
        Ok(record)
    }
}

fn read_record(path: &Path) -> Result<ProvenanceRecord, CacheError> {
    if !path.is_file() {
        return Ok(ProvenanceRecord::default());
    }
    let bytes = fs::read(path)?;
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(record),
        Err(error) => {
            warn!(path = %path.display(), error = %error, "来歴レコードが壊れているため破棄します");
            Ok(ProvenanceRecord::default())
        }
    }
}

fn lock_path(record: &Path) -> PathBuf {
    record.with_extension("json.lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dep() -> Dependency {
        Dependency::new("org.example", "demo", "1.0")
    }

    #[test]
    fn update_persists_record() -> Result<(), CacheError> {
        let temp = tempdir().expect("tempdir");
        let store = ProvenanceStore::new(temp.path().to_path_buf());
        let now = Utc::now();

        store.update(&dep(), MetadataLevel::Version, |record| {
            record.origin = Some("central".to_string());
            record.last_downloaded = Some(now);
        })?;

        let loaded = store.load(&dep(), MetadataLevel::Version)?;
        assert_eq!(loaded.origin.as_deref(), Some("central"));
        assert_eq!(loaded.last_downloaded, Some(now));
        assert!(
            store
                .record_path(&dep(), MetadataLevel::Version)
                .ends_with("org/example/demo/1.0/provenance.json")
        );
        assert!(
            store
                .load(&dep(), MetadataLevel::Artifact)?
                .origin
                .is_none()
        );
        Ok(())
    }

    #[test]
    fn cached_solution_requires_matching_pom_time() {
        let mut record = ProvenanceRecord::default();
        let child = Dependency::new("org.example", "child", "2.0");
        record.store_solution(Scope::Compile, 100, vec![child.clone()]);

        assert_eq!(record.cached_solution(Scope::Compile, 100), Some(&[child][..]));
        assert!(record.cached_solution(Scope::Compile, 101).is_none());
        assert!(record.cached_solution(Scope::Runtime, 100).is_none());
    }

    #[test]
    fn new_pom_time_discards_other_scopes() {
        let mut record = ProvenanceRecord::default();
        record.store_solution(Scope::Compile, 100, Vec::new());
        record.store_solution(Scope::Runtime, 100, Vec::new());
        assert_eq!(record.solutions.len(), 2);

        record.store_solution(Scope::Test, 200, Vec::new());
        assert_eq!(record.solutions.len(), 1);
        assert_eq!(record.last_solved, Some(200));
        assert!(record.solutions.contains_key(&Scope::Test));
    }

    #[test]
    fn corrupt_record_reads_as_empty() -> Result<(), CacheError> {
        let temp = tempdir().expect("tempdir");
        let store = ProvenanceStore::new(temp.path().to_path_buf());
        let path = store.record_path(&dep(), MetadataLevel::Version);
        fs::create_dir_all(path.parent().expect("parent"))?;
        fs::write(&path, b"{ not json")?;
        assert_eq!(store.load(&dep(), MetadataLevel::Version)?, ProvenanceRecord::default());
        Ok(())
    }
}

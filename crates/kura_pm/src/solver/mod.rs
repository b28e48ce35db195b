//! Dependency graph solver.
//!
//! Walks the declared dependencies of a root [`Pom`] depth first, expanding
//! each one's transitive subtree from its remote POM, and mediates the
//! flattened listing down to one entry per mediation id. Transitive subtrees
//! are cached in the coordinate's provenance record, keyed by the POM file's
//! modification time.

mod mediation;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, MetadataLevel, modified_millis};
use crate::download::{DownloadError, DownloadManager, DownloadReport};
use crate::model::{Dependency, Scope};
use crate::pom::{Pom, PomError};

pub use mediation::mediate;
use mediation::{append_shifted, prune};

#[derive(Debug, Error)]
pub enum SolveError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{coordinates} の POM を解析できません: {source}")]
    Pom {
        coordinates: String,
        source: PomError,
    },
    #[error("{path:?} を読み込めません: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("非同期ランタイムを初期化できません: {0}")]
    Runtime(#[source] std::io::Error),
}

/// A dependency whose POM has been read and whose children are being expanded.
struct Frame {
    owner: Dependency,
    /// Resolved coordinates the provenance record is stored under.
    record: Dependency,
    modified: i64,
    children: VecDeque<Dependency>,
    /// Subtree collected so far, rings relative to `owner`'s children.
    subtree: Vec<Dependency>,
}

enum Expansion {
    Cached(Vec<Dependency>),
    Missing,
    Open(Frame),
}

pub struct DependencyGraphSolver {
    runtime: Runtime,
    downloads: DownloadManager,
    project_override_dir: Option<PathBuf>,
    linked_builds: HashMap<String, Pom>,
    /// Last solution per root and scope, with the POM it was computed from.
    solutions: Mutex<HashMap<(String, Scope), (Pom, Vec<Dependency>)>>,
}

impl DependencyGraphSolver {
    pub fn new(downloads: DownloadManager) -> Result<Self, SolveError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SolveError::Runtime)?;
        Ok(Self {
            runtime,
            downloads,
            project_override_dir: None,
            linked_builds: HashMap::new(),
            solutions: Mutex::new(HashMap::new()),
        })
    }

    /// Files found here take precedence over the cache when building a classpath.
    pub fn with_override_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_override_dir = Some(dir.into());
        self
    }

    pub fn register_linked_build(&mut self, id: impl Into<String>, pom: Pom) {
        self.linked_builds.insert(id.into(), pom);
        self.solutions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// Ordered, mediated dependency set of `pom` for `scope`.
    pub fn solve(&self, pom: &Pom, scope: Scope) -> Result<Vec<Dependency>, SolveError> {
        let key = (pom.key(), scope);
        if let Some((solved, solution)) = self
            .solutions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            if solved == pom {
                return Ok(solution.clone());
            }
            debug!(pom = %pom.key(), scope = %scope, "POM の内容が変わったため再解決します");
        }

        let root = self.prepare_build(pom)?;
        let linked = if scope.includes(Scope::Compile) {
            self.solve_linked_builds(&root)?
        } else {
            Vec::new()
        };
        let solution = self.solve_root(&root, scope, linked)?;
        info!(pom = %pom.key(), scope = %scope, dependencies = solution.len(), "依存関係を解決しました");

        self.solutions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (pom.clone(), solution.clone()));
        Ok(solution)
    }

    /// Local file paths of the solved dependencies that belong on a classpath.
    pub fn classpath(&self, pom: &Pom, scope: Scope) -> Result<Vec<PathBuf>, SolveError> {
        let solution = self.solve(pom, scope)?;
        let cache = self.downloads.cache();
        let mut paths = Vec::new();
        for dependency in solution
            .iter()
            .filter(|dependency| dependency.contributes_to_classpath())
        {
            if dependency.scope == Scope::System {
                debug!(dependency = %dependency, "system スコープはクラスパスに含めません");
                continue;
            }
            let file_name = dependency.file_name(&dependency.extension);
            let overridden = self
                .project_override_dir
                .as_ref()
                .map(|dir| dir.join(&file_name))
                .filter(|candidate| candidate.is_file());
            match overridden {
                Some(path) => {
                    debug!(dependency = %dependency, path = %path.display(), "プロジェクトのファイルを優先します");
                    paths.push(path);
                }
                None => paths.push(cache.artifact_path(dependency, &dependency.extension)),
            }
        }
        Ok(paths)
    }

    /// Downloads the artifacts of a solution, optionally with their sources.
    pub fn materialize(
        &self,
        pom: &Pom,
        scope: Scope,
        with_sources: bool,
    ) -> Result<DownloadReport, SolveError> {
        let solution = self.solve(pom, scope)?;
        Ok(self
            .runtime
            .block_on(self.downloads.materialize(&solution, with_sources))?)
    }

    /// Applies purge policies to every snapshot in the solution.
    pub fn purge(&self, pom: &Pom, scope: Scope) -> Result<Vec<PathBuf>, SolveError> {
        let mut removed = Vec::new();
        for dependency in self.solve(pom, scope)? {
            removed.extend(self.downloads.purge_snapshots(&dependency)?);
        }
        Ok(removed)
    }

    /// Parent inheritance, interpolation, assimilation, BOM imports and
    /// managed versions for a build declared in memory.
    fn prepare_build(&self, pom: &Pom) -> Result<Pom, SolveError> {
        let mut guard = HashSet::from([pom.key()]);
        let mut root = pom.clone();
        self.inherit_parents(&mut root, &mut guard)?;
        root.interpolate();

        for reference in root.remove_scope(Scope::Assimilate) {
            let key = reference.coordinate_key();
            if !guard.insert(key.clone()) {
                warn!(pom = %root.key(), reference = %reference, "循環した assimilate 参照を無視します");
                continue;
            }
            match self.read_effective_pom(&reference, &mut guard)? {
                Some(other) => {
                    debug!(pom = %root.key(), reference = %reference, "依存関係を取り込みました");
                    root.assimilate(&other);
                }
                None => warn!(pom = %root.key(), reference = %reference, "assimilate 対象の POM が見つかりません"),
            }
            guard.remove(&key);
        }

        self.import_boms(&mut root, &mut guard)?;
        root.apply_managed_versions();
        Ok(root)
    }

    /// Compile solutions of every build reachable through `root`'s links,
    /// in link order. Each build is solved once.
    fn solve_linked_builds(&self, root: &Pom) -> Result<Vec<Dependency>, SolveError> {
        let mut visited = HashSet::from([root.key()]);
        let mut pending: VecDeque<String> = root.linked_builds.iter().cloned().collect();
        let mut solved = Vec::new();
        while let Some(id) = pending.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(linked) = self.linked_builds.get(&id) else {
                warn!(pom = %root.key(), linked = %id, "登録されていないリンクビルドです");
                continue;
            };
            if !visited.insert(linked.key()) {
                debug!(linked = %id, "リンクビルドは処理済みです");
                continue;
            }

            let linked = self.prepare_build(linked)?;
            let solution = self.solve_root(&linked, Scope::Compile, Vec::new())?;
            debug!(pom = %root.key(), linked = %id, dependencies = solution.len(), "リンクビルドの依存関係を統合しました");
            solved.extend(solution);
            pending.extend(linked.linked_builds.iter().cloned());
        }
        Ok(solved)
    }

    /// `linked` entries are already solved; they join after the root's own
    /// listing and take part in mediation at their solved rings.
    fn solve_root(
        &self,
        root: &Pom,
        scope: Scope,
        linked: Vec<Dependency>,
    ) -> Result<Vec<Dependency>, SolveError> {
        let root_key = root.key();
        let mut discovered = Vec::new();
        for declared in root.dependencies(scope) {
            if declared.scope.is_preprocessing() {
                continue;
            }
            let direct = declared.with_ring(1);
            discovered.push(direct.clone());
            if !direct.resolve_transitives || direct.scope == Scope::System {
                continue;
            }
            let subtree = self.subtree(&direct, scope, &root_key)?;
            append_shifted(&mut discovered, prune(subtree, &direct), direct.ring + 1);
        }
        discovered.extend(linked);

        let mut solution = mediate(discovered);
        for dependency in solution.iter_mut() {
            self.pin_version(dependency)?;
        }
        Ok(solution)
    }

    fn pin_version(&self, dependency: &mut Dependency) -> Result<(), SolveError> {
        if !dependency.is_meta_version() {
            return Ok(());
        }
        match self
            .runtime
            .block_on(self.downloads.resolve_version(dependency))?
        {
            Some(resolved) => {
                dependency.version = resolved.version;
                dependency.revision = resolved.revision;
                if dependency.origin.is_none() {
                    dependency.origin = resolved.origin;
                }
            }
            None => warn!(dependency = %dependency, "メタバージョンを解決できないため宣言のまま残します"),
        }
        Ok(())
    }

    /// Relative transitive subtree of `dependency`; its direct children sit at ring 0.
    ///
    /// Traversal uses an explicit stack. A dependency already on the current
    /// path is emitted without its subtree so cycles terminate.
    fn subtree(
        &self,
        dependency: &Dependency,
        scope: Scope,
        root_key: &str,
    ) -> Result<Vec<Dependency>, SolveError> {
        let mut on_path: HashSet<String> = HashSet::from([root_key.to_string()]);
        let mut stack = match self.expand(dependency, scope, &mut on_path)? {
            Expansion::Cached(subtree) => return Ok(subtree),
            Expansion::Missing => return Ok(Vec::new()),
            Expansion::Open(frame) => vec![frame],
        };

        loop {
            let Some(frame) = stack.last_mut() else {
                return Ok(Vec::new());
            };

            if let Some(child) = frame.children.pop_front() {
                frame.subtree.push(child.clone().with_ring(0));
                if !child.resolve_transitives || child.scope == Scope::System {
                    continue;
                }
                if on_path.contains(&child.coordinate_key()) {
                    warn!(
                        dependency = %child,
                        via = %frame.owner,
                        "依存関係の循環を検出したため展開を打ち切ります"
                    );
                    continue;
                }
                match self.expand(&child, scope, &mut on_path)? {
                    Expansion::Cached(subtree) => {
                        if let Some(frame) = stack.last_mut() {
                            append_shifted(&mut frame.subtree, prune(subtree, &child), 1);
                        }
                    }
                    Expansion::Missing => {}
                    Expansion::Open(opened) => stack.push(opened),
                }
                continue;
            }

            let Some(done) = stack.pop() else {
                return Ok(Vec::new());
            };
            on_path.remove(&done.owner.coordinate_key());
            let Frame {
                owner,
                record,
                modified,
                subtree,
                ..
            } = done;
            let cached = subtree.clone();
            self.downloads.cache().provenance().update(
                &record,
                MetadataLevel::Version,
                move |provenance| provenance.store_solution(scope, modified, cached),
            )?;

            match stack.last_mut() {
                Some(parent) => append_shifted(&mut parent.subtree, prune(subtree, &owner), 1),
                None => return Ok(subtree),
            }
        }
    }

    /// Looks up the cached subtree for `dependency`, or reads its POM and
    /// opens a frame over its children.
    fn expand(
        &self,
        dependency: &Dependency,
        scope: Scope,
        on_path: &mut HashSet<String>,
    ) -> Result<Expansion, SolveError> {
        let Some(retrieved) = self
            .runtime
            .block_on(self.downloads.retrieve_pom(dependency))?
        else {
            warn!(dependency = %dependency, "POM が見つからないため推移的依存関係なしとして扱います");
            return Ok(Expansion::Missing);
        };

        let modified = modified_millis(&retrieved.path)?;
        let record = self
            .downloads
            .cache()
            .provenance()
            .load(&retrieved.dependency, MetadataLevel::Version)?;
        if let Some(cached) = record.cached_solution(scope, modified) {
            debug!(dependency = %dependency, scope = %scope, "キャッシュ済みの推移的依存関係を利用します");
            return Ok(Expansion::Cached(cached.to_vec()));
        }

        let mut guard = HashSet::from([dependency.coordinate_key()]);
        let pom = self.read_pom_file(&retrieved.path, dependency)?;
        let pom = self.effective(pom, &mut guard)?;
        let children = pom
            .dependencies(scope)
            .into_iter()
            .filter(|child| !child.optional && !child.scope.is_preprocessing())
            .collect();

        on_path.insert(dependency.coordinate_key());
        Ok(Expansion::Open(Frame {
            owner: dependency.clone(),
            record: retrieved.dependency,
            modified,
            children,
            subtree: Vec::new(),
        }))
    }

    fn effective(&self, mut pom: Pom, guard: &mut HashSet<String>) -> Result<Pom, SolveError> {
        self.inherit_parents(&mut pom, guard)?;
        pom.interpolate();
        self.import_boms(&mut pom, guard)?;
        pom.apply_managed_versions();
        Ok(pom)
    }

    fn inherit_parents(&self, pom: &mut Pom, guard: &mut HashSet<String>) -> Result<(), SolveError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = pom.parent.clone();
        while let Some(reference) = next {
            let key = reference.coordinate_key();
            if guard.contains(&key) || !seen.insert(key) {
                warn!(pom = %pom.key(), parent = %reference, "親POMの循環を検出しました");
                break;
            }
            let Some(parent) = self.read_raw_pom(&reference)? else {
                warn!(pom = %pom.key(), parent = %reference, "親POMが見つかりません");
                break;
            };
            next = parent.parent.clone();
            chain.push(parent);
        }

        let mut inherited: Option<Pom> = None;
        for mut parent in chain.into_iter().rev() {
            if let Some(above) = &inherited {
                parent.inherit(above);
            }
            inherited = Some(parent);
        }
        if let Some(parent) = &inherited {
            pom.inherit(parent);
        }
        Ok(())
    }

    fn import_boms(&self, pom: &mut Pom, guard: &mut HashSet<String>) -> Result<(), SolveError> {
        for reference in pom.remove_scope(Scope::Import) {
            let key = reference.coordinate_key();
            if !guard.insert(key.clone()) {
                warn!(pom = %pom.key(), bom = %reference, "循環した import 参照を無視します");
                continue;
            }
            match self.read_effective_pom(&reference, guard)? {
                Some(bom) => {
                    debug!(pom = %pom.key(), bom = %reference, "管理バージョンを取り込みました");
                    pom.merge_managed(&bom);
                }
                None => warn!(pom = %pom.key(), bom = %reference, "import 対象の POM が見つかりません"),
            }
            guard.remove(&key);
        }
        Ok(())
    }

    fn read_effective_pom(
        &self,
        reference: &Dependency,
        guard: &mut HashSet<String>,
    ) -> Result<Option<Pom>, SolveError> {
        let Some(pom) = self.read_raw_pom(reference)? else {
            return Ok(None);
        };
        self.effective(pom, guard).map(Some)
    }

    fn read_raw_pom(&self, reference: &Dependency) -> Result<Option<Pom>, SolveError> {
        let Some(retrieved) = self
            .runtime
            .block_on(self.downloads.retrieve_pom(reference))?
        else {
            return Ok(None);
        };
        self.read_pom_file(&retrieved.path, reference).map(Some)
    }

    fn read_pom_file(&self, path: &Path, reference: &Dependency) -> Result<Pom, SolveError> {
        let xml = std::fs::read_to_string(path).map_err(|source| SolveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Pom::parse(&xml).map_err(|source| SolveError::Pom {
            coordinates: reference.to_string(),
            source,
        })
    }
}

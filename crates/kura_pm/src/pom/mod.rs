//! Build descriptors (POMs) and the operations the solver performs on them
//! before traversal: parent inheritance, property interpolation, managed
//! versions and scope assimilation.

mod parse;

use std::collections::HashMap;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Dependency, Scope};

const MAX_INTERPOLATION_PASSES: usize = 8;

/// POM 読み込み時のエラー。
#[derive(Debug, Error)]
pub enum PomError {
    #[error("pom.xml の解析に失敗しました: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("pom.xml に <project> タグが存在しません")]
    MissingProject,
    #[error("{0} が未指定です")]
    MissingElement(&'static str),
}

/// `dependencyManagement` の1エントリ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDependency {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub scope: Option<Scope>,
    pub classifier: Option<String>,
}

impl ManagedDependency {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: version.into(),
            scope: None,
            classifier: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }
}

/// A build descriptor: coordinates, per-scope dependency lists, managed
/// versions and links to sibling builds whose compile outputs it consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pom {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub packaging: String,
    pub parent: Option<Dependency>,
    pub properties: IndexMap<String, String>,
    /// Identifiers of linked builds registered with the solver.
    pub linked_builds: Vec<String>,
    dependencies: IndexMap<Scope, Vec<Dependency>>,
    managed: IndexMap<String, ManagedDependency>,
}

impl Pom {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: version.into(),
            packaging: "jar".to_string(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }

    /// Coordinates of this descriptor as a `pom` typed dependency.
    pub fn coordinates(&self) -> Dependency {
        Dependency::new(&self.group_id, &self.artifact_id, &self.version).with_extension("pom")
    }

    pub fn with_parent(mut self, parent: Dependency) -> Self {
        self.parent = Some(parent.pom_variant());
        self
    }

    pub fn link_build(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.linked_builds.contains(&id) {
            self.linked_builds.push(id);
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn add_dependency(&mut self, scope: Scope, dependency: Dependency) {
        let dependency = dependency.with_scope(scope);
        self.dependencies.entry(scope).or_default().push(dependency);
    }

    pub fn add_managed(&mut self, managed: ManagedDependency) {
        self.managed.insert(managed.key(), managed);
    }

    pub fn declared_scopes(&self) -> impl Iterator<Item = Scope> + '_ {
        self.dependencies.keys().copied()
    }

    /// Dependencies declared exactly in `scope`, in declaration order.
    pub fn declared(&self, scope: Scope) -> &[Dependency] {
        self.dependencies
            .get(&scope)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn declares(&self, scope: Scope, mediation_id: &str) -> bool {
        self.declared(scope)
            .iter()
            .any(|dependency| dependency.mediation_id() == mediation_id)
    }

    /// Dependencies visible when solving `scope`, honoring scope inclusion.
    pub fn dependencies(&self, scope: Scope) -> Vec<Dependency> {
        self.dependencies
            .iter()
            .filter(|(declared, _)| scope.includes(**declared))
            .flat_map(|(_, dependencies)| dependencies.iter().cloned())
            .collect()
    }

    pub fn remove_scope(&mut self, scope: Scope) -> Vec<Dependency> {
        self.dependencies.shift_remove(&scope).unwrap_or_default()
    }

    pub fn managed(&self, key: &str) -> Option<&ManagedDependency> {
        self.managed.get(key)
    }

    pub fn managed_entries(&self) -> impl Iterator<Item = &ManagedDependency> {
        self.managed.values()
    }

    /// Adds `other`'s managed versions; entries already present here win.
    pub fn merge_managed(&mut self, other: &Pom) {
        for (key, managed) in &other.managed {
            self.managed
                .entry(key.clone())
                .or_insert_with(|| managed.clone());
        }
    }

    /// Fills in versions left blank in declarations from the managed table.
    ///
    /// Declarations that still have no version afterwards are dropped and
    /// returned so the caller can report them.
    pub fn apply_managed_versions(&mut self) -> Vec<Dependency> {
        let mut skipped = Vec::new();
        for dependencies in self.dependencies.values_mut() {
            let mut retained = Vec::with_capacity(dependencies.len());
            for mut dependency in dependencies.drain(..) {
                if let Some(managed) = self.managed.get(&dependency.management_key()) {
                    if dependency.version.is_empty() {
                        dependency.version = managed.version.clone();
                    }
                    if dependency.classifier.is_none() {
                        dependency.classifier = managed.classifier.clone();
                    }
                }
                if dependency.version.is_empty() {
                    warn!(
                        dependency = %dependency.management_key(),
                        pom = %format!("{}:{}:{}", self.group_id, self.artifact_id, self.version),
                        "バージョンを特定できない依存関係をスキップします"
                    );
                    skipped.push(dependency);
                    continue;
                }
                retained.push(dependency);
            }
            *dependencies = retained;
        }
        skipped
    }

    /// Folds every scope of `other` into the matching scope here, skipping
    /// entries already declared, and adopts its managed versions.
    pub fn assimilate(&mut self, other: &Pom) {
        for (scope, dependencies) in &other.dependencies {
            for dependency in dependencies {
                if self.declares(*scope, &dependency.mediation_id()) {
                    continue;
                }
                self.add_dependency(*scope, dependency.clone());
            }
        }
        self.merge_managed(other);
    }

    /// Applies parent inheritance. Values declared here always win.
    pub fn inherit(&mut self, parent: &Pom) {
        if self.group_id.is_empty() {
            self.group_id = parent.group_id.clone();
        }
        if self.version.is_empty() {
            self.version = parent.version.clone();
        }

        let mut properties = parent.properties.clone();
        properties.extend(std::mem::take(&mut self.properties));
        self.properties = properties;

        self.merge_managed(parent);

        for (scope, dependencies) in &parent.dependencies {
            for dependency in dependencies {
                if !self.declares(*scope, &dependency.mediation_id()) {
                    self.add_dependency(*scope, dependency.clone());
                }
            }
        }
        debug!(pom = %self.key(), parent = %parent.key(), "親POMを継承しました");
    }

    /// Replaces `${...}` references in coordinates, declarations and managed
    /// entries with property values. Unresolvable references are left intact.
    pub fn interpolate(&mut self) {
        let base = self.property_context();
        for field in [&mut self.group_id, &mut self.artifact_id, &mut self.version] {
            interpolate_field(field, &base);
        }

        let context = self.property_context();
        for dependencies in self.dependencies.values_mut() {
            for dependency in dependencies.iter_mut() {
                interpolate_dependency(dependency, &context);
            }
        }

        let managed = std::mem::take(&mut self.managed);
        for (_, mut entry) in managed {
            interpolate_field(&mut entry.group_id, &context);
            interpolate_field(&mut entry.artifact_id, &context);
            interpolate_field(&mut entry.version, &context);
            if let Some(classifier) = entry.classifier.as_mut() {
                interpolate_field(classifier, &context);
            }
            self.managed.entry(entry.key()).or_insert(entry);
        }
    }

    fn property_context(&self) -> HashMap<String, String> {
        let mut context: HashMap<String, String> = self
            .properties
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        context.insert("project.groupId".to_string(), self.group_id.clone());
        context.insert("project.artifactId".to_string(), self.artifact_id.clone());
        context.insert("project.version".to_string(), self.version.clone());
        if let Some(parent) = &self.parent {
            context.insert("project.parent.groupId".to_string(), parent.group_id.clone());
            context.insert(
                "project.parent.artifactId".to_string(),
                parent.artifact_id.clone(),
            );
            context.insert("project.parent.version".to_string(), parent.version.clone());
        }
        context
    }
}

fn interpolate_dependency(dependency: &mut Dependency, context: &HashMap<String, String>) {
    interpolate_field(&mut dependency.group_id, context);
    interpolate_field(&mut dependency.artifact_id, context);
    interpolate_field(&mut dependency.version, context);
    if let Some(classifier) = dependency.classifier.as_mut() {
        interpolate_field(classifier, context);
    }
}

fn interpolate_field(value: &mut String, context: &HashMap<String, String>) {
    if !value.contains("${") {
        return;
    }
    match resolve_property(value, context) {
        Some(resolved) => *value = resolved,
        None => warn!(value = %value, "プロパティ参照を解決できませんでした"),
    }
}

fn resolve_property(value: &str, properties: &HashMap<String, String>) -> Option<String> {
    let mut current = value.trim().to_string();
    let mut passes = 0;
    while current.contains("${") {
        passes += 1;
        if passes > MAX_INTERPOLATION_PASSES {
            return None;
        }
        current = resolve_placeholders(&current, properties)?;
    }
    Some(current)
}

fn resolve_placeholders(raw: &str, properties: &HashMap<String, String>) -> Option<String> {
    let mut result = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let suffix = &rest[start + 2..];
        let end = suffix.find('}')?;
        let key = &suffix[..end];
        result.push_str(properties.get(key)?);
        rest = &suffix[end + 1..];
    }
    result.push_str(rest);
    Some(result)
}

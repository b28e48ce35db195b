use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Scope, matches_pattern};

pub const DEFAULT_EXTENSION: &str = "jar";

const SNAPSHOT_SUFFIX: &str = "SNAPSHOT";

/// A single declared or discovered dependency.
///
/// `ring` is the distance from the root build: dependencies declared directly
/// by the root sit at ring 1, their own dependencies at ring 2 and so on.
/// Inside a cached transitive subtree the rings are stored relative to the
/// owning dependency, starting at 0 for its direct children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub group_id: String,
    pub artifact_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub ring: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default = "default_true")]
    pub resolve_transitives: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    /// Timestamped build chosen for a snapshot, e.g. `1.0-20240101.120000-3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_true() -> bool {
    true
}

impl Dependency {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: version.into(),
            classifier: None,
            extension: default_extension(),
            scope: Scope::Compile,
            ring: 0,
            exclusions: Vec::new(),
            origin: None,
            resolve_transitives: true,
            optional: false,
            revision: None,
        }
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_ring(mut self, ring: u32) -> Self {
        self.ring = ring;
        self
    }

    /// `groupId:artifactId` form; `*` is accepted on either side.
    pub fn with_exclusion(mut self, pattern: impl Into<String>) -> Self {
        self.exclusions.push(pattern.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn without_transitives(mut self) -> Self {
        self.resolve_transitives = false;
        self
    }

    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    pub fn group_path(&self) -> String {
        self.group_id.replace('.', "/")
    }

    /// Key under which competing versions are mediated: group, artifact, type
    /// and classifier. Version is deliberately absent.
    pub fn mediation_id(&self) -> String {
        match self.classifier() {
            Some(classifier) => format!(
                "{}:{}:{}:{}",
                self.group_id, self.artifact_id, self.extension, classifier
            ),
            None => format!("{}:{}:{}", self.group_id, self.artifact_id, self.extension),
        }
    }

    /// `groupId:artifactId`, the key used by managed-version tables.
    pub fn management_key(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }

    /// Identity of one concrete build of one artifact, used to detect cycles.
    pub fn coordinate_key(&self) -> String {
        format!("{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }

    pub fn is_snapshot(&self) -> bool {
        self.version.ends_with(SNAPSHOT_SUFFIX)
    }

    pub fn is_release_pointer(&self) -> bool {
        self.version == "RELEASE"
    }

    pub fn is_latest_pointer(&self) -> bool {
        self.version == "LATEST"
    }

    /// RELEASE, LATEST and `*-SNAPSHOT` all name a moving target that needs
    /// repository metadata to pin down.
    pub fn is_meta_version(&self) -> bool {
        self.is_release_pointer() || self.is_latest_pointer() || self.is_snapshot()
    }

    /// Version segment used in file names: the snapshot revision when known.
    pub fn file_version(&self) -> &str {
        self.revision.as_deref().unwrap_or(&self.version)
    }

    pub fn file_name(&self, extension: &str) -> String {
        match self.classifier() {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.artifact_id,
                self.file_version(),
                classifier,
                extension
            ),
            None => format!("{}-{}.{}", self.artifact_id, self.file_version(), extension),
        }
    }

    /// The dependency's descriptor: same coordinates, `pom` type, no classifier.
    pub fn pom_variant(&self) -> Self {
        let mut pom = self.clone();
        pom.classifier = None;
        pom.extension = "pom".to_string();
        pom
    }

    pub fn sources_variant(&self) -> Self {
        let mut sources = self.clone();
        sources.classifier = Some("sources".to_string());
        sources.extension = DEFAULT_EXTENSION.to_string();
        sources.resolve_transitives = false;
        sources
    }

    /// True when `other` matches one of this dependency's exclusion patterns.
    pub fn excludes(&self, other: &Dependency) -> bool {
        self.exclusions
            .iter()
            .any(|pattern| exclusion_matches(pattern, other))
    }

    /// Whether this entry ends up on a classpath once resolved.
    pub fn contributes_to_classpath(&self) -> bool {
        self.extension != "pom" && !self.scope.is_preprocessing()
    }
}

fn exclusion_matches(pattern: &str, candidate: &Dependency) -> bool {
    let (group, artifact) = pattern.split_once(':').unwrap_or((pattern, "*"));
    matches_pattern(&candidate.group_id, group.trim())
        && matches_pattern(&candidate.artifact_id, artifact.trim())
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        if self.extension != DEFAULT_EXTENSION {
            write!(f, "@{}", self.extension)?;
        }
        Ok(())
    }
}

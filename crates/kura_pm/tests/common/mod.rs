#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use kura_pm::repository::config::RepositoryConfig;
use kura_pm::{
    ArtifactCache, ChecksumPolicy, DependencyGraphSolver, DownloadManager, DownloadSettings,
    FixedClock, MavenRegistry, RepositoryManager, UpdatePolicy,
};
use tempfile::TempDir;

pub use kura_pm::registry::testing::ScriptedTransport;

pub struct Repository {
    pub name: String,
    pub base: String,
    pub transport: Arc<ScriptedTransport>,
}

impl Repository {
    pub fn url(&self, artifact: &str, version: &str, file: &str) -> String {
        format!("{}/org/example/{artifact}/{version}/{file}", self.base)
    }

    pub fn pom_url(&self, artifact: &str, version: &str) -> String {
        self.url(artifact, version, &format!("{artifact}-{version}.pom"))
    }

    /// Publishes a POM for `org.example:{artifact}:{version}`; `body` is
    /// spliced into `<project>`.
    pub fn publish_pom(&self, artifact: &str, version: &str, body: &str) {
        self.transport
            .publish(&self.pom_url(artifact, version), pom_xml(artifact, version, body).as_bytes());
    }

    pub fn publish_jar(&self, artifact: &str, version: &str) {
        self.transport.publish(
            &self.url(artifact, version, &format!("{artifact}-{version}.jar")),
            format!("{artifact}-{version}-classes").as_bytes(),
        );
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub clock: Arc<FixedClock>,
    pub repositories: Vec<Repository>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_repositories(&["central"])
    }

    pub fn with_repositories(names: &[&str]) -> Self {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0)
                .single()
                .expect("timestamp"),
        ));
        let repositories = names
            .iter()
            .map(|name| Repository {
                name: name.to_string(),
                base: format!("https://{name}.example.com/maven2"),
                transport: Arc::new(ScriptedTransport::default()),
            })
            .collect();
        Self {
            temp: TempDir::new().expect("tempdir"),
            clock,
            repositories,
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repositories[0]
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    pub fn total_requests(&self) -> usize {
        self.repositories
            .iter()
            .map(|repository| repository.transport.total_requests())
            .sum()
    }

    /// A fresh solver over the shared cache directory, clock and repositories.
    pub fn solver(&self) -> DependencyGraphSolver {
        self.solver_with_policy(UpdatePolicy::default())
    }

    pub fn solver_with_policy(&self, update_policy: UpdatePolicy) -> DependencyGraphSolver {
        let checksums = ChecksumPolicy {
            enforce: true,
            retry_backoff: Duration::ZERO,
        };
        let configs: Vec<RepositoryConfig> = self
            .repositories
            .iter()
            .enumerate()
            .map(|(index, repository)| {
                RepositoryConfig::new(&repository.name, &repository.base)
                    .with_priority(10 * (index as u32 + 1))
            })
            .collect();
        let registries = configs
            .iter()
            .zip(&self.repositories)
            .map(|(config, repository)| {
                MavenRegistry::with_transport(config, repository.transport.clone(), checksums)
                    .expect("registry")
            })
            .collect();
        let cache = Arc::new(ArtifactCache::with_dir(self.cache_dir()).expect("cache"));
        let downloads = DownloadManager::with_registries(
            RepositoryManager::new(configs),
            registries,
            cache,
            self.clock.clone(),
            DownloadSettings {
                checksums,
                update_policy,
                ..DownloadSettings::default()
            },
        );
        DependencyGraphSolver::new(downloads).expect("solver")
    }

    pub fn cached_pom(&self, artifact: &str, version: &str) -> PathBuf {
        self.cache_dir()
            .join("org/example")
            .join(artifact)
            .join(version)
            .join(format!("{artifact}-{version}.pom"))
    }
}

pub fn pom_xml(artifact: &str, version: &str, body: &str) -> String {
    format!(
        "<project><groupId>org.example</groupId><artifactId>{artifact}</artifactId>\
         <version>{version}</version>{body}</project>"
    )
}

pub fn dependency_xml(artifact: &str, version: &str) -> String {
    format!(
        "<dependency><groupId>org.example</groupId><artifactId>{artifact}</artifactId>\
         <version>{version}</version></dependency>"
    )
}

pub fn dependencies(entries: &[(&str, &str)]) -> String {
    let body: String = entries
        .iter()
        .map(|(artifact, version)| dependency_xml(artifact, version))
        .collect();
    format!("<dependencies>{body}</dependencies>")
}

/// `artifact:version@ring` for each entry, in solution order.
pub fn summary(solution: &[kura_pm::Dependency]) -> Vec<String> {
    solution
        .iter()
        .map(|dependency| {
            format!(
                "{}:{}@{}",
                dependency.artifact_id, dependency.version, dependency.ring
            )
        })
        .collect()
}

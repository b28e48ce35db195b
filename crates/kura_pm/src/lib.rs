// kura_pm - Maven-compatible dependency solving and artifact retrieval
pub mod cache;
pub mod config;
pub mod download;
pub mod metadata;
pub mod model;
pub mod pom;
pub mod registry;
pub mod repository;
pub mod solver;

pub use cache::{
    ArtifactCache, CacheError, Clock, FixedClock, MetadataLevel, PurgePolicy, SystemClock,
    UpdatePolicy,
};
pub use config::{ConfigError, LogLevel, ResolverConfig};
pub use download::{DownloadError, DownloadManager, DownloadReport, DownloadSettings};
pub use metadata::{MavenMetadata, MetadataService};
pub use model::{ArtifactVersion, Dependency, Scope};
pub use pom::{ManagedDependency, Pom, PomError};
pub use registry::{ChecksumPolicy, MavenRegistry, RegistryError, Transport, TransportError};
pub use repository::{RepositoryError, RepositoryManager};
pub use solver::{DependencyGraphSolver, SolveError, mediate};

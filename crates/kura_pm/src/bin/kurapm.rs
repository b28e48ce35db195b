use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kura_pm::{
    Dependency, DependencyGraphSolver, DownloadManager, LogLevel, Pom, ResolverConfig, Scope,
    SystemClock,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kurapm")]
#[command(about = "Maven-compatible dependency resolver", long_about = None)]
struct Cli {
    /// Resolver configuration file (defaults to ~/.kura/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the ordered, mediated dependency set of a POM
    Resolve {
        #[arg(long)]
        pom: PathBuf,
        #[arg(long, default_value = "compile")]
        scope: Scope,
        /// Emit machine-readable JSON instead of one line per dependency
        #[arg(long)]
        json: bool,
    },
    /// Download a POM's dependencies and print the resulting classpath
    Classpath {
        #[arg(long)]
        pom: PathBuf,
        #[arg(long, default_value = "compile")]
        scope: Scope,
        /// Also fetch `sources` archives
        #[arg(long)]
        with_sources: bool,
    },
    /// Apply purge policies to every snapshot dependency of a POM
    Purge {
        #[arg(long)]
        pom: PathBuf,
        #[arg(long, default_value = "test")]
        scope: Scope,
    },
}

fn main() {
    if let Err(error) = real_main() {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ResolverConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => ResolverConfig::load_default().context("failed to load ~/.kura/config.toml")?,
    };
    init_tracing(cli.log_level, &config);

    match cli.command {
        Commands::Resolve { pom, scope, json } => {
            let solver = build_solver(&config)?;
            let pom = read_pom(&pom)?;
            let solution = solver
                .solve(&pom, scope)
                .with_context(|| format!("failed to resolve {}", pom.key()))?;
            print_solution(&solution, json)
        }
        Commands::Classpath {
            pom,
            scope,
            with_sources,
        } => {
            let solver = build_solver(&config)?;
            let pom = read_pom(&pom)?;
            let report = solver
                .materialize(&pom, scope, with_sources)
                .with_context(|| format!("failed to download dependencies of {}", pom.key()))?;
            for warning in &report.warnings {
                warn!("{warning}");
            }
            if !report.is_complete() {
                let missing: Vec<String> = report.missing.iter().map(ToString::to_string).collect();
                bail!("missing artifacts: {}", missing.join(", "));
            }
            let classpath = solver.classpath(&pom, scope)?;
            let joined = env::join_paths(&classpath).context("classpath contains a separator")?;
            println!("{}", joined.to_string_lossy());
            Ok(())
        }
        Commands::Purge { pom, scope } => {
            let solver = build_solver(&config)?;
            let pom = read_pom(&pom)?;
            let removed = solver
                .purge(&pom, scope)
                .with_context(|| format!("failed to purge snapshots of {}", pom.key()))?;
            for path in &removed {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

fn init_tracing(cli_level: Option<LogLevel>, config: &ResolverConfig) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level.directive()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.directive())),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_solver(config: &ResolverConfig) -> Result<DependencyGraphSolver> {
    let cache = config
        .open_cache()
        .context("failed to initialize the artifact cache")?;
    let downloads = DownloadManager::new(
        config.repository_manager(),
        Arc::new(cache),
        Arc::new(SystemClock),
        config.download_settings(),
    )
    .context("failed to connect to the configured repositories")?;
    let solver = DependencyGraphSolver::new(downloads)?;
    Ok(match &config.project_override_dir {
        Some(dir) => solver.with_override_dir(dir.clone()),
        None => solver,
    })
}

fn read_pom(path: &Path) -> Result<Pom> {
    let xml =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Pom::parse(&xml).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_solution(solution: &[Dependency], json: bool) -> Result<()> {
    if json {
        let payload =
            serde_json::to_string_pretty(solution).context("failed to serialize the solution")?;
        println!("{payload}");
        return Ok(());
    }
    for dependency in solution {
        println!("{dependency}\t{}\t{}", dependency.scope, dependency.ring);
    }
    Ok(())
}

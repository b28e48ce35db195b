mod common;

use std::fs::{self, File};
use std::time::{Duration, SystemTime};

use chrono::Duration as ChronoDuration;
use common::{Harness, dependencies, summary};
use kura_pm::{Dependency, Pom, Scope, SolveError, UpdatePolicy};

fn root_with(entries: &[Dependency]) -> Pom {
    let mut root = Pom::new("org.example", "app", "1.0");
    for dependency in entries {
        root.add_dependency(Scope::Compile, dependency.clone());
    }
    root
}

fn example(artifact: &str, version: &str) -> Dependency {
    Dependency::new("org.example", artifact, version)
}

#[test]
fn nearer_declaration_wins_over_transitive_version() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom("a", "1.0", &dependencies(&[("b", "0.9")]));
    repo.publish_pom("b", "0.9", "");
    repo.publish_pom("b", "1.0", "");

    let root = root_with(&[example("a", "1.0"), example("b", "1.0")]);
    let solution = harness.solver().solve(&root, Scope::Compile)?;

    assert_eq!(summary(&solution), vec!["a:1.0@1", "b:1.0@1"]);
    Ok(())
}

#[test]
fn equal_distance_conflicts_keep_first_discovered() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom("a", "1.0", &dependencies(&[("d", "1.0")]));
    repo.publish_pom("c", "1.0", &dependencies(&[("d", "2.0")]));
    repo.publish_pom("d", "1.0", "");
    repo.publish_pom("d", "2.0", "");

    let root = root_with(&[example("a", "1.0"), example("c", "1.0")]);
    let first = harness.solver().solve(&root, Scope::Compile)?;
    let second = harness.solver().solve(&root, Scope::Compile)?;

    assert_eq!(summary(&first), vec!["a:1.0@1", "d:1.0@2", "c:1.0@1"]);
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn declared_exclusion_drops_the_whole_subtree() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom("a", "1.0", &dependencies(&[("b", "1.0")]));
    repo.publish_pom("b", "1.0", &dependencies(&[("c", "1.0")]));
    repo.publish_pom("c", "1.0", "");

    let root = root_with(&[example("a", "1.0").with_exclusion("org.example:b")]);
    let solution = harness.solver().solve(&root, Scope::Compile)?;

    assert_eq!(summary(&solution), vec!["a:1.0@1"]);
    Ok(())
}

#[test]
fn exclusions_inside_transitive_poms_apply() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom(
        "a",
        "1.0",
        "<dependencies><dependency><groupId>org.example</groupId><artifactId>b</artifactId>\
         <version>1.0</version><exclusions><exclusion><groupId>org.example</groupId>\
         <artifactId>c</artifactId></exclusion></exclusions></dependency></dependencies>",
    );
    repo.publish_pom("b", "1.0", &dependencies(&[("c", "1.0"), ("d", "1.0")]));
    repo.publish_pom("c", "1.0", "");
    repo.publish_pom("d", "1.0", "");

    let solution = harness
        .solver()
        .solve(&root_with(&[example("a", "1.0")]), Scope::Compile)?;

    assert_eq!(summary(&solution), vec!["a:1.0@1", "b:1.0@2", "d:1.0@3"]);
    Ok(())
}

#[test]
fn three_way_cycle_terminates() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom("a", "1.0", &dependencies(&[("b", "1.0")]));
    repo.publish_pom("b", "1.0", &dependencies(&[("c", "1.0")]));
    repo.publish_pom("c", "1.0", &dependencies(&[("a", "1.0")]));

    let solution = harness
        .solver()
        .solve(&root_with(&[example("a", "1.0")]), Scope::Compile)?;

    assert_eq!(summary(&solution), vec!["a:1.0@1", "b:1.0@2", "c:1.0@3"]);
    Ok(())
}

#[test]
fn parent_properties_and_managed_versions_reach_transitives() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom(
        "parent",
        "1.0",
        "<packaging>pom</packaging><properties><core.version>2.5</core.version></properties>\
         <dependencyManagement><dependencies><dependency><groupId>org.example</groupId>\
         <artifactId>util</artifactId><version>3.0</version></dependency></dependencies>\
         </dependencyManagement>",
    );
    repo.publish_pom(
        "a",
        "1.0",
        "<parent><groupId>org.example</groupId><artifactId>parent</artifactId><version>1.0</version></parent>\
         <dependencies>\
           <dependency><groupId>org.example</groupId><artifactId>core</artifactId><version>${core.version}</version></dependency>\
           <dependency><groupId>org.example</groupId><artifactId>util</artifactId></dependency>\
         </dependencies>",
    );
    repo.publish_pom("core", "2.5", "");
    repo.publish_pom("util", "3.0", "");

    let solution = harness
        .solver()
        .solve(&root_with(&[example("a", "1.0")]), Scope::Compile)?;

    assert_eq!(
        summary(&solution),
        vec!["a:1.0@1", "core:2.5@2", "util:3.0@2"]
    );
    Ok(())
}

#[test]
fn assimilated_pom_contributes_its_dependencies() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom(
        "platform",
        "1.0",
        "<packaging>pom</packaging><dependencies>\
           <dependency><groupId>org.example</groupId><artifactId>x</artifactId><version>1.0</version></dependency>\
           <dependency><groupId>org.example</groupId><artifactId>junit</artifactId><version>4.13</version><scope>test</scope></dependency>\
         </dependencies>",
    );
    repo.publish_pom("x", "1.0", "");

    let mut root = Pom::new("org.example", "app", "1.0");
    root.add_dependency(
        Scope::Assimilate,
        example("platform", "1.0").with_extension("pom"),
    );

    let solution = harness.solver().solve(&root, Scope::Compile)?;
    assert_eq!(summary(&solution), vec!["x:1.0@1"]);
    Ok(())
}

#[test]
fn cached_subtrees_follow_pom_modification_time() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom("a", "1.0", &dependencies(&[("b", "1.0")]));
    repo.publish_pom("b", "1.0", "");
    repo.publish_pom("c", "1.0", "");
    let root = root_with(&[example("a", "1.0")]);

    let first = harness.solver().solve(&root, Scope::Compile)?;
    assert_eq!(summary(&first), vec!["a:1.0@1", "b:1.0@2"]);
    let requests = harness.total_requests();

    let again = harness.solver().solve(&root, Scope::Compile)?;
    assert_eq!(again, first);
    assert_eq!(harness.total_requests(), requests);

    let cached_pom = harness.cached_pom("a", "1.0");
    fs::write(
        &cached_pom,
        common::pom_xml("a", "1.0", &dependencies(&[("b", "1.0"), ("c", "1.0")])),
    )
    .expect("rewrite pom");
    File::options()
        .write(true)
        .open(&cached_pom)
        .and_then(|file| file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)))
        .expect("touch pom");

    let changed = harness.solver().solve(&root, Scope::Compile)?;
    assert_eq!(summary(&changed), vec!["a:1.0@1", "b:1.0@2", "c:1.0@2"]);
    Ok(())
}

#[test]
fn daily_snapshot_is_checked_once_per_day() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    let metadata_url = repo.url("s", "1.0-SNAPSHOT", "maven-metadata.xml");
    repo.transport.publish(
        &metadata_url,
        b"<metadata><groupId>org.example</groupId><artifactId>s</artifactId>\
          <version>1.0-SNAPSHOT</version><versioning><snapshot>\
          <timestamp>20240314.101500</timestamp><buildNumber>7</buildNumber>\
          </snapshot></versioning></metadata>",
    );
    let pom_url = repo.url("s", "1.0-SNAPSHOT", "s-1.0-20240314.101500-7.pom");
    repo.transport
        .publish(&pom_url, common::pom_xml("s", "1.0-SNAPSHOT", "").as_bytes());
    let root = root_with(&[example("s", "1.0-SNAPSHOT")]);

    let first = harness.solver().solve(&root, Scope::Compile)?;
    assert_eq!(first[0].revision.as_deref(), Some("1.0-20240314.101500-7"));

    harness.clock.advance(ChronoDuration::minutes(30));
    let second = harness.solver().solve(&root, Scope::Compile)?;

    assert_eq!(second, first);
    assert_eq!(repo.transport.requests_for(&metadata_url), 1);
    assert_eq!(repo.transport.requests_for(&pom_url), 1);
    Ok(())
}

#[test]
fn interval_policy_rechecks_snapshot_after_the_interval() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    let metadata_url = repo.url("s", "1.0-SNAPSHOT", "maven-metadata.xml");
    for (timestamp, build) in [("20240314.101500", 7), ("20240314.113000", 8)] {
        let metadata = format!(
            "<metadata><groupId>org.example</groupId><artifactId>s</artifactId>\
             <version>1.0-SNAPSHOT</version><versioning><snapshot>\
             <timestamp>{timestamp}</timestamp><buildNumber>{build}</buildNumber>\
             </snapshot></versioning></metadata>"
        );
        repo.transport.publish(&metadata_url, metadata.as_bytes());
        repo.transport.publish(
            &repo.url("s", "1.0-SNAPSHOT", &format!("s-1.0-{timestamp}-{build}.pom")),
            common::pom_xml("s", "1.0-SNAPSHOT", "").as_bytes(),
        );
    }
    let root = root_with(&[example("s", "1.0-SNAPSHOT")]);
    let policy = UpdatePolicy::Interval(60);

    let first = harness.solver_with_policy(policy).solve(&root, Scope::Compile)?;
    assert_eq!(first[0].revision.as_deref(), Some("1.0-20240314.101500-7"));

    harness.clock.advance(ChronoDuration::minutes(30));
    let within = harness.solver_with_policy(policy).solve(&root, Scope::Compile)?;
    assert_eq!(within, first);
    assert_eq!(repo.transport.requests_for(&metadata_url), 1);

    harness.clock.advance(ChronoDuration::minutes(31));
    let after = harness.solver_with_policy(policy).solve(&root, Scope::Compile)?;
    assert_eq!(after[0].revision.as_deref(), Some("1.0-20240314.113000-8"));
    assert_eq!(repo.transport.requests_for(&metadata_url), 2);
    Ok(())
}

#[test]
fn caller_exclusion_prunes_a_cached_subtree() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom("a", "1.0", &dependencies(&[("b", "1.0")]));
    repo.publish_pom("b", "1.0", &dependencies(&[("c", "1.0")]));
    repo.publish_pom("c", "1.0", "");

    let full = harness
        .solver()
        .solve(&root_with(&[example("a", "1.0")]), Scope::Compile)?;
    assert_eq!(summary(&full), vec!["a:1.0@1", "b:1.0@2", "c:1.0@3"]);
    let requests = harness.total_requests();

    let mut other = Pom::new("org.example", "other", "1.0");
    other.add_dependency(
        Scope::Compile,
        example("a", "1.0").with_exclusion("org.example:b"),
    );
    let pruned = harness.solver().solve(&other, Scope::Compile)?;

    assert_eq!(summary(&pruned), vec!["a:1.0@1"]);
    assert_eq!(harness.total_requests(), requests);
    Ok(())
}

#[test]
fn checksum_mismatch_is_retried_once_then_fatal() {
    let harness = Harness::new();
    let repo = harness.repo();
    let pom_url = repo.pom_url("a", "1.0");
    repo.transport
        .respond(&pom_url, common::pom_xml("a", "1.0", "").as_bytes());
    repo.transport
        .respond(&format!("{pom_url}.sha1"), b"0000000000000000000000000000000000000000");

    let error = harness
        .solver()
        .solve(&root_with(&[example("a", "1.0")]), Scope::Compile)
        .unwrap_err();

    match error {
        SolveError::Download(error) => assert!(error.is_checksum_mismatch()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(repo.transport.requests_for(&pom_url), 1);
    assert_eq!(repo.transport.requests_for(&format!("{pom_url}.sha1")), 2);
    assert!(!harness.cached_pom("a", "1.0").exists());
}

#[test]
fn release_pointer_uses_metadata_merged_across_repositories() -> Result<(), SolveError> {
    let harness = Harness::with_repositories(&["first", "second"]);
    let metadata = |versions: &[&str]| {
        let items: String = versions
            .iter()
            .map(|version| format!("<version>{version}</version>"))
            .collect();
        format!(
            "<metadata><groupId>org.example</groupId><artifactId>lib</artifactId>\
             <versioning><versions>{items}</versions></versioning></metadata>"
        )
    };
    let first = &harness.repositories[0];
    let second = &harness.repositories[1];
    first.transport.publish(
        &format!("{}/org/example/lib/maven-metadata.xml", first.base),
        metadata(&["1.0", "1.1"]).as_bytes(),
    );
    second.transport.publish(
        &format!("{}/org/example/lib/maven-metadata.xml", second.base),
        metadata(&["1.1", "1.2"]).as_bytes(),
    );
    second.publish_pom("lib", "1.2", "");

    let solution = harness
        .solver()
        .solve(&root_with(&[example("lib", "RELEASE")]), Scope::Compile)?;

    assert_eq!(summary(&solution), vec!["lib:1.2@1"]);
    Ok(())
}

#[test]
fn classpath_lists_materialized_artifacts_and_overrides() -> Result<(), SolveError> {
    let harness = Harness::new();
    let repo = harness.repo();
    repo.publish_pom("a", "1.0", &dependencies(&[("b", "1.0")]));
    repo.publish_pom("b", "1.0", "");
    repo.publish_jar("a", "1.0");
    let overrides = harness.temp.path().join("lib");
    fs::create_dir_all(&overrides).expect("override dir");
    fs::write(overrides.join("b-1.0.jar"), b"project copy").expect("override jar");

    let solver = harness.solver().with_override_dir(&overrides);
    let root = root_with(&[example("a", "1.0")]);
    let report = solver.materialize(&root, Scope::Compile, false)?;
    assert_eq!(report.retrieved.len(), 1);
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.missing[0].artifact_id, "b");

    let classpath = solver.classpath(&root, Scope::Compile)?;
    assert_eq!(classpath.len(), 2);
    assert!(classpath[0].is_file());
    assert_eq!(classpath[1], overrides.join("b-1.0.jar"));
    Ok(())
}

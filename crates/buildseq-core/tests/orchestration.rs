//! End-to-end orchestration runs against the in-memory store and the
//! scripted executor.
//!
//! Covered:
//! - packages run in dependency order, phases in declared order
//! - a failure skips every dependent without ever starting it
//! - resume continues from the checkpoint, rerunning only unfinished phases
//! - concurrency limit, halt-run policy, phase-group barriers, retries
//! - cancellation leaves resumable state behind

use std::sync::Arc;
use std::time::Duration;

use buildseq_core::fakes::ScriptedExecutor;
use buildseq_core::{
    ChannelSink, ExecutionErrorKind, FailurePolicy, FixedRetry, GroupOrdering, Manifest,
    ManifestFormat, Orchestrator, OrchestratorConfig, PackageStatus, Phase, PhaseRecord,
    PhaseStatus, SkipReason,
};
use buildseq_state::fakes::MemoryCheckpointStore;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

struct Pkg<'a> {
    name: &'a str,
    deps: &'a [&'a str],
    phases: &'a [&'a str],
    group: Option<&'a str>,
}

fn pkg<'a>(name: &'a str, deps: &'a [&'a str], phases: &'a [&'a str]) -> Pkg<'a> {
    Pkg {
        name,
        deps,
        phases,
        group: None,
    }
}

fn manifest(groups: &[&str], packages: &[Pkg<'_>]) -> Manifest {
    let quote = |items: &[&str]| {
        items
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut text = String::new();
    if !groups.is_empty() {
        text.push_str(&format!("phase_groups = [{}]\n", quote(groups)));
    }
    for p in packages {
        text.push_str(&format!(
            "[[package]]\nname = \"{}\"\nversion = \"1.0\"\nsource = \"{}-1.0.tar.xz\"\nchecksum = \"sha256:{}\"\ndependencies = [{}]\nphases = [{}]\n",
            p.name,
            p.name,
            "ab".repeat(32),
            quote(p.deps),
            quote(p.phases),
        ));
        if let Some(group) = p.group {
            text.push_str(&format!("group = \"{group}\"\n"));
        }
    }
    Manifest::parse(&text, ManifestFormat::Toml).expect("valid manifest")
}

const FULL: &[&str] = &["prepare", "configure", "build", "install"];

fn toolchain() -> Manifest {
    manifest(
        &[],
        &[
            pkg("glibc", &["gcc", "linux-headers"], FULL),
            pkg("gcc", &["binutils"], FULL),
            pkg("binutils", &[], FULL),
            pkg("linux-headers", &[], &["prepare", "install"]),
        ],
    )
}

fn orchestrator(
    manifest: Manifest,
    store: Arc<MemoryCheckpointStore>,
    executor: Arc<ScriptedExecutor>,
) -> Orchestrator {
    Orchestrator::new(manifest, GroupOrdering::Enforce, store, executor)
        .expect("acyclic manifest")
        .with_max_concurrent(1)
}

// ---- Ordering ----

#[tokio::test]
async fn toolchain_builds_in_dependency_order() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(toolchain(), store.clone(), executor.clone());

    assert_eq!(
        orch.plan().order(),
        vec!["binutils", "gcc", "linux-headers", "glibc"]
    );
    let summary = orch.run().await.unwrap();

    assert!(summary.is_success());
    assert_eq!(
        executor.package_order(),
        vec!["binutils", "gcc", "linux-headers", "glibc"]
    );
    assert_eq!(
        executor.phases_run("gcc"),
        vec![Phase::Prepare, Phase::Configure, Phase::Build, Phase::Install]
    );
    assert!(summary.packages.iter().all(|p| p.executed));
}

#[tokio::test]
async fn dependency_completes_every_phase_before_dependent_starts() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(toolchain(), store.clone(), executor)
        .with_max_concurrent(4);
    orch.run().await.unwrap();

    let history = store.history();
    let position = |pkg: &str, phase: Phase, status: PhaseStatus| {
        history
            .iter()
            .position(|r| r.package == pkg && r.phase == phase && r.status == status)
            .unwrap()
    };
    let gcc_done = position("gcc", Phase::Install, PhaseStatus::Succeeded);
    let headers_done = position("linux-headers", Phase::Install, PhaseStatus::Succeeded);
    let glibc_start = position("glibc", Phase::Prepare, PhaseStatus::Running);
    assert!(gcc_done < glibc_start);
    assert!(headers_done < glibc_start);
}

#[tokio::test]
async fn phase_override_creates_records_only_for_listed_phases() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let m = manifest(&[], &[pkg("zlib", &[], &["prepare", "build", "install"])]);
    orchestrator(m, store.clone(), executor).run().await.unwrap();

    let mut phases: Vec<Phase> = store.history().iter().map(|r| r.phase).collect();
    phases.dedup();
    assert_eq!(phases, vec![Phase::Prepare, Phase::Build, Phase::Install]);
}

// ---- Failure handling ----

#[tokio::test]
async fn failed_package_skips_dependents_without_running_them() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new().fail("gcc", Phase::Build));
    let (sink, mut events) = ChannelSink::new();
    let summary = orchestrator(toolchain(), store.clone(), executor.clone())
        .with_sink(Arc::new(sink))
        .run()
        .await
        .unwrap();

    let gcc = summary.package("gcc").unwrap();
    assert_eq!(gcc.status, PackageStatus::Failed);
    assert_eq!(gcc.failed_phase, Some(Phase::Build));

    let glibc = summary.package("glibc").unwrap();
    assert_eq!(glibc.status, PackageStatus::Skipped);
    assert_eq!(
        glibc.skip_reason,
        Some(SkipReason::DependencyFailed {
            dependency: "gcc".into()
        })
    );
    assert!(glibc.error.as_deref().unwrap().contains("gcc"));
    assert!(!glibc.executed);

    // Independent packages still build.
    assert_eq!(
        summary.package("linux-headers").unwrap().status,
        PackageStatus::Succeeded
    );
    assert!(executor.phases_run("glibc").is_empty());
    assert!(store.history().iter().all(|r| r.package != "glibc"));

    events.close();
    let mut glibc_events = Vec::new();
    while let Some(event) = events.recv().await {
        if event.package == "glibc" {
            glibc_events.push(event);
        }
    }
    assert_eq!(glibc_events.len(), 1);
    assert_eq!(glibc_events[0].phase, None);
    assert_eq!(glibc_events[0].status, PhaseStatus::Skipped);
}

#[tokio::test]
async fn halt_run_stops_scheduling_after_first_failure() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new().fail("a", Phase::Build));
    let m = manifest(
        &[],
        &[
            pkg("a", &[], &["build"]),
            pkg("b", &[], &["build"]),
            pkg("c", &[], &["build"]),
        ],
    );
    let summary = orchestrator(m, store, executor.clone())
        .with_failure_policy(FailurePolicy::HaltRun)
        .run()
        .await
        .unwrap();

    assert_eq!(executor.package_order(), vec!["a"]);
    for name in ["b", "c"] {
        let report = summary.package(name).unwrap();
        assert_eq!(report.status, PackageStatus::Skipped);
        assert_eq!(report.skip_reason, Some(SkipReason::RunHalted));
    }
}

#[tokio::test]
async fn failed_group_blocks_later_groups() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new().fail("binutils", Phase::Build));
    let m = manifest(
        &["pass1", "pass2"],
        &[
            Pkg {
                group: Some("pass1"),
                ..pkg("binutils", &[], &["build"])
            },
            Pkg {
                group: Some("pass1"),
                ..pkg("m4", &[], &["build"])
            },
            Pkg {
                group: Some("pass2"),
                ..pkg("bash", &[], &["build"])
            },
        ],
    );
    let summary = orchestrator(m, store, executor.clone()).run().await.unwrap();

    assert_eq!(summary.package("m4").unwrap().status, PackageStatus::Succeeded);
    let bash = summary.package("bash").unwrap();
    assert_eq!(bash.status, PackageStatus::Skipped);
    assert_eq!(
        bash.skip_reason,
        Some(SkipReason::GroupBarrier {
            group: "pass1".into()
        })
    );
    assert!(executor.phases_run("bash").is_empty());
}

#[tokio::test]
async fn fixed_retry_reruns_transient_failures() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new().fail_times("gmp", Phase::Test, 2));
    let m = manifest(&[], &[pkg("gmp", &[], &["build", "test"])]);
    let summary = orchestrator(m, store, executor.clone())
        .with_retry_policy(Arc::new(FixedRetry::new(3, Duration::ZERO)))
        .run()
        .await
        .unwrap();

    assert!(summary.is_success());
    let attempts: Vec<u32> = executor
        .calls()
        .iter()
        .filter(|c| c.phase == Phase::Test)
        .map(|c| c.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn fixed_retry_gives_up_on_missing_build_action() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new().fail_with(
        "gmp",
        Phase::Build,
        ExecutionErrorKind::ActionNotFound,
    ));
    let m = manifest(&[], &[pkg("gmp", &[], &["build"])]);
    let summary = orchestrator(m, store, executor.clone())
        .with_retry_policy(Arc::new(FixedRetry::new(3, Duration::ZERO)))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.package("gmp").unwrap().status, PackageStatus::Failed);
    assert_eq!(executor.calls().len(), 1);
}

// ---- Concurrency ----

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_limit() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let names = ["a", "b", "c", "d", "e", "f"];
    let executor = names.iter().fold(ScriptedExecutor::new(), |e, name| {
        e.delay(name, Phase::Build, Duration::from_secs(5))
    });
    let executor = Arc::new(executor);
    let packages: Vec<Pkg<'_>> = names.iter().map(|n| pkg(n, &[], &["build"])).collect();
    let summary = orchestrator(manifest(&[], &packages), store, executor.clone())
        .with_max_concurrent(2)
        .run()
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(executor.peak_in_flight(), 2);
}

// ---- Resume ----

#[tokio::test]
async fn resume_continues_interrupted_package_without_rerunning_finished_phases() {
    let now = Utc::now();
    let done = |pkg: &str, phase| PhaseRecord::pending(pkg, phase).start(now).succeed(now, 0, None);
    let mut records: Vec<PhaseRecord> = FULL
        .iter()
        .map(|p| done("binutils", p.parse().unwrap()))
        .collect();
    records.push(done("gcc", Phase::Prepare));
    records.push(done("gcc", Phase::Configure));
    records.push(PhaseRecord::pending("gcc", Phase::Build).start(now));
    let store = Arc::new(MemoryCheckpointStore::with_records(records));
    let executor = Arc::new(ScriptedExecutor::new());

    let summary = orchestrator(toolchain(), store, executor.clone())
        .run()
        .await
        .unwrap();

    assert!(summary.is_success());
    assert!(executor.phases_run("binutils").is_empty());
    assert_eq!(executor.phases_run("gcc"), vec![Phase::Build, Phase::Install]);
    let gcc_build = executor
        .calls()
        .into_iter()
        .find(|c| c.package == "gcc" && c.phase == Phase::Build)
        .unwrap();
    assert_eq!(gcc_build.attempt, 2);

    let binutils = summary.package("binutils").unwrap();
    assert_eq!(binutils.status, PackageStatus::Succeeded);
    assert!(!binutils.executed);
}

#[tokio::test]
async fn rerun_after_failure_retries_only_the_failed_phase() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let failing = Arc::new(ScriptedExecutor::new().fail("gcc", Phase::Build));
    let first = orchestrator(toolchain(), store.clone(), failing)
        .run()
        .await
        .unwrap();
    assert_eq!(first.package("glibc").unwrap().status, PackageStatus::Skipped);

    let fixed = Arc::new(ScriptedExecutor::new());
    let second = orchestrator(toolchain(), store, fixed.clone())
        .run()
        .await
        .unwrap();

    assert!(second.is_success());
    assert_eq!(fixed.package_order(), vec!["gcc", "glibc"]);
    assert_eq!(fixed.phases_run("gcc"), vec![Phase::Build, Phase::Install]);
}

#[tokio::test]
async fn completed_checkpoint_runs_nothing() {
    let store = Arc::new(MemoryCheckpointStore::new());
    orchestrator(toolchain(), store.clone(), Arc::new(ScriptedExecutor::new()))
        .run()
        .await
        .unwrap();
    let writes = store.history().len();

    let executor = Arc::new(ScriptedExecutor::new());
    let summary = orchestrator(toolchain(), store.clone(), executor.clone())
        .run()
        .await
        .unwrap();

    assert!(summary.is_success());
    assert!(executor.calls().is_empty());
    assert_eq!(store.history().len(), writes);
}

// ---- Cancellation ----

#[tokio::test]
async fn cancellation_stops_between_phases_and_resumes_cleanly() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let token = CancellationToken::new();
    let executor = Arc::new(ScriptedExecutor::new().cancel_when("a", Phase::Build, token.clone()));
    let m = manifest(
        &[],
        &[pkg("a", &[], &["build", "install"]), pkg("b", &["a"], &["build"])],
    );
    let summary = orchestrator(m.clone(), store.clone(), executor.clone())
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.package("a").unwrap().status, PackageStatus::Incomplete);
    assert_eq!(summary.package("b").unwrap().status, PackageStatus::NotStarted);
    assert_eq!(executor.phases_run("a"), vec![Phase::Build]);

    let executor = Arc::new(ScriptedExecutor::new());
    let summary = orchestrator(m, store, executor.clone()).run().await.unwrap();
    assert!(summary.is_success());
    assert_eq!(executor.phases_run("a"), vec![Phase::Install]);
    assert_eq!(executor.phases_run("b"), vec![Phase::Build]);
}

// ---- Configuration ----

#[tokio::test]
async fn config_skip_phases_are_recorded_as_skipped() {
    let config: OrchestratorConfig = toml::from_str(
        r#"
        max_concurrent_packages = 1
        skip_phases = ["test"]
        "#,
    )
    .unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let m = manifest(&[], &[pkg("gmp", &[], &["build", "test", "install"])]);
    let summary = Orchestrator::from_config(m, &config, store.clone(), executor.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(executor.phases_run("gmp"), vec![Phase::Build, Phase::Install]);
    let test = store
        .history()
        .into_iter()
        .find(|r| r.phase == Phase::Test)
        .unwrap();
    assert_eq!(test.status, PhaseStatus::Skipped);
}

#[tokio::test]
async fn checkpoint_write_failure_aborts_the_run() {
    let store = Arc::new(MemoryCheckpointStore::new());
    store.fail_after(1);
    let executor = Arc::new(ScriptedExecutor::new());
    let m = manifest(&[], &[pkg("zlib", &[], &["build", "install"])]);
    let err = orchestrator(m, store, executor).run().await.unwrap_err();
    assert!(err.to_string().to_lowercase().contains("checkpoint"));
}

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use std::sync::Arc;

use cprun_core::{
    compile::{Compiler, CompilerSettings},
    config::{FileIo, GlobPattern, ToolchainConfig},
    error::{CaseError, CompileError, GuardError},
    event::Event,
    runner::{ExternalDebugger, ProcessRunner},
    scheduler::{RunMode, Scheduler, SchedulerSettings},
    testing::{CaseId, CaseState, Stress, Verdict},
};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Fixture {
    dir: TempDir,
    scheduler: Scheduler,
    events: mpsc::UnboundedReceiver<Event>,
    toolchain_log: PathBuf,
}

impl Fixture {
    fn new(concurrency: usize) -> Self {
        Self::with_settings(|settings, _| settings.concurrency(concurrency))
    }

    fn with_settings(configure: impl FnOnce(SchedulerSettings, &Path) -> SchedulerSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let toolchain_log = dir.path().join("toolchain.log");
        let toolchain = write(
            dir.path(),
            "fakecc",
            &format!(
                r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "fakecc 1.0"; exit 0; fi
echo "$@" >> '{}'
if grep -q COMPILE_ERROR "$1"; then echo "$1:1: error" >&2; exit 1; fi
cp "$1" "$3" && chmod +x "$3""#,
                toolchain_log.display()
            ),
        );
        fsutil::set_executable(&toolchain).unwrap();

        let compiler = Compiler::new(CompilerSettings::new(dir.path().join("build")).toolchain(
            ToolchainConfig {
                pattern: GlobPattern::parse("*.sh").unwrap(),
                program: toolchain.to_string_lossy().into_owned(),
                fast_flags: vec!["-O2".into()],
                debug_flags: vec!["-g".into()],
                include_dirs: vec![],
            },
        ));
        let settings = configure(
            SchedulerSettings::new(dir.path().join("work"), dir.path().join("data")),
            dir.path(),
        );
        let (scheduler, events) = Scheduler::new(
            settings,
            compiler,
            ProcessRunner::new().sample_interval(Duration::from_millis(20)),
        );
        Self {
            dir,
            scheduler,
            events,
            toolchain_log,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a shell "source file"; the fake compiler turns it into the artifact.
    fn source(&self, name: &str, body: &str) -> PathBuf {
        write(self.path(), name, &format!("#!/bin/sh\n{}\n", body))
    }

    fn case(&self, input: &str, answer: Option<&str>) -> CaseId {
        let id = self.scheduler.add_case(None);
        self.scheduler.set_input_text(id, input).unwrap();
        if let Some(answer) = answer {
            self.scheduler.set_answer_text(id, answer).unwrap();
        }
        id
    }

    fn compilations(&self) -> usize {
        fsutil::read_to_string(&self.toolchain_log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn toolchain_calls(&self) -> String {
        fsutil::read_to_string(&self.toolchain_log).unwrap_or_default()
    }

    fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(e) = self.events.try_recv() {
            out.push(e);
        }
        out
    }
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fsutil::write(&path, contents).unwrap();
    path
}

const DOUBLE: &str = "read n; echo $((n * 2))";

#[tokio::test]
async fn run_all_compiles_once_and_folds_verdicts() {
    let f = Fixture::new(4);
    f.scheduler.set_program(f.source("double.sh", DOUBLE));
    let ok1 = f.case("1\n", Some("2\n"));
    let ok2 = f.case("21\n", Some("42\n"));
    let wrong = f.case("5\n", Some("11\n"));
    let no_answer = f.case("7\n", None);

    let result = f.scheduler.run_all().await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::WA);
    assert_eq!(f.compilations(), 1);

    let verdict = |id| f.scheduler.case(id).unwrap().result.unwrap().verdict;
    assert_eq!(verdict(ok1), Verdict::AC);
    assert_eq!(verdict(ok2), Verdict::AC);
    assert_eq!(verdict(wrong), Verdict::WA);
    assert_eq!(verdict(no_answer), Verdict::AC);

    let state = f.scheduler.run_state();
    assert!(!state.running);
    assert_eq!((state.done, state.total), (4, 4));
    assert_eq!(state.result.unwrap().verdict, Verdict::WA);

    // unchanged source: a second batch hits the cache
    f.scheduler.run_all().await.unwrap().unwrap();
    assert_eq!(f.compilations(), 1);
}

#[tokio::test]
async fn run_all_never_exceeds_concurrency() {
    let f = Fixture::new(2);
    let log = f.path().join("concurrency.log");
    f.scheduler.set_program(f.source(
        "slow.sh",
        &format!(
            "echo s >> '{log}'; sleep 0.3; echo e >> '{log}'",
            log = log.display()
        ),
    ));
    for _ in 0..6 {
        f.case("", None);
    }

    let result = f.scheduler.run_all().await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::AC);

    let (mut running, mut peak) = (0, 0);
    for line in fsutil::read_to_string(&log).unwrap().lines() {
        match line {
            "s" => running += 1,
            _ => running -= 1,
        }
        peak = peak.max(running);
    }
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn compile_error_is_pinned_on_the_batch() {
    let f = Fixture::new(2);
    f.scheduler
        .set_program(f.source("broken.sh", "COMPILE_ERROR"));
    f.case("1\n", Some("2\n"));

    let err = f.scheduler.run_all().await.unwrap_err();
    assert!(err.downcast_ref::<CompileError>().is_some());
    let state = f.scheduler.run_state();
    assert!(!state.running);
    assert!(matches!(state.err, Some(CaseError::Compile { .. })));
}

#[tokio::test]
async fn compile_error_on_a_single_run_sets_ce() {
    let f = Fixture::new(1);
    f.scheduler
        .set_program(f.source("broken.sh", "COMPILE_ERROR"));
    let id = f.case("1\n", None);

    assert!(f.scheduler.run_case(id, RunMode::Normal).await.is_err());
    let case = f.scheduler.case(id).unwrap();
    assert_eq!(case.result.unwrap().verdict, Verdict::CE);
    assert!(matches!(case.err, Some(CaseError::Compile { .. })));
    assert_eq!(case.state, CaseState::Idle);
}

#[tokio::test]
async fn second_run_of_a_running_case_is_rejected() {
    let mut f = Fixture::new(1);
    f.scheduler.set_program(f.source("sleepy.sh", "sleep 10"));
    let id = f.case("", None);

    let s = f.scheduler.clone();
    let first = tokio::spawn(async move { s.run_case(id, RunMode::Normal).await });
    while f.scheduler.case(id).unwrap().state != CaseState::Running {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = f.scheduler.run_case(id, RunMode::Normal).await.unwrap_err();
    assert!(err.downcast_ref::<GuardError>().is_some());
    assert!(f.scheduler.rename_case(id, "renamed").is_err());
    f.scheduler.set_input_text(id, "edited while running\n").unwrap();
    assert!(f
        .drain()
        .iter()
        .any(|e| matches!(e, Event::Notice { message } if message.contains("busy"))));

    assert!(f.scheduler.cancel(id));
    let outcome = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, None);

    let case = f.scheduler.case(id).unwrap();
    assert_eq!(case.state, CaseState::Idle);
    assert_eq!(case.result, None);
    assert_eq!(case.err, None);
    f.scheduler.rename_case(id, "renamed").unwrap();
}

#[tokio::test]
async fn cancel_all_stops_a_batch() {
    let f = Fixture::new(2);
    f.scheduler.set_program(f.source("sleepy.sh", "sleep 10"));
    let ids: Vec<_> = (0..4).map(|_| f.case("", None)).collect();

    let s = f.scheduler.clone();
    let batch = tokio::spawn(async move { s.run_all().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    f.scheduler.cancel_all();

    let outcome = tokio::time::timeout(Duration::from_secs(5), batch)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, None);
    assert!(!f.scheduler.run_state().running);
    for id in ids {
        let case = f.scheduler.case(id).unwrap();
        assert_eq!(case.state, CaseState::Idle);
        assert_eq!(case.err, None);
    }
}

#[tokio::test]
async fn stress_freezes_the_first_counterexample() {
    let mut f = Fixture::new(1);
    f.scheduler.set_program(f.source(
        "candidate.sh",
        "read n; if [ \"$n\" -eq 3 ]; then echo 0; else echo $((n * 2)); fi",
    ));
    let id = f.scheduler.add_case(None);
    let stress = Stress::new(
        f.source("gen.sh", "echo \"$1\""),
        f.source("brute.sh", DOUBLE),
        10,
    )
    .args("#{index}");
    f.scheduler.set_stress(id, Some(stress)).unwrap();

    let result = f.scheduler.stress(id).await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::WA);

    let case = f.scheduler.case(id).unwrap();
    assert_eq!(case.result.as_ref().unwrap().verdict, Verdict::WA);
    assert_eq!(fsutil::read_to_string(case.input_path().unwrap()).unwrap(), "3\n");
    assert_eq!(fsutil::read_to_string(case.answer_path().unwrap()).unwrap(), "6\n");
    assert!(case.input.unwrap().owned);
    assert_eq!(case.stress.unwrap().status, None);

    let events = f.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::OutputReady { id: i, stdout, .. } if *i == id && stdout.text == "0\n"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::CaseChanged { case } if case.stress.as_ref().and_then(|s| s.status).is_some()
    )));

    // the frozen case now reproduces the failure on its own
    let rerun = f.scheduler.run_case(id, RunMode::Normal).await.unwrap().unwrap();
    assert_eq!(rerun.verdict, Verdict::WA);
}

#[tokio::test]
async fn stress_passes_when_the_candidate_agrees() {
    let mut f = Fixture::new(3);
    f.scheduler.set_program(f.source("candidate.sh", DOUBLE));
    let id = f.scheduler.add_case(None);
    let stress = Stress::new(
        f.source("gen.sh", "echo $(( $1 * 7 % 97 ))"),
        f.source("brute.sh", "read n; echo $((n + n))"),
        8,
    )
    .args("#{index}");
    f.scheduler.set_stress(id, Some(stress)).unwrap();

    let result = f.scheduler.stress(id).await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::AC);
    assert!(f.drain().iter().any(|e| matches!(
        e,
        Event::OutputReady { judge, .. } if judge == "8 iteration(s) passed"
    )));
    let case = f.scheduler.case(id).unwrap();
    assert_eq!(case.input, None);
    assert_eq!(case.state, CaseState::Idle);
}

#[tokio::test]
async fn failing_brute_force_aborts_the_stress_run() {
    let f = Fixture::new(1);
    f.scheduler.set_program(f.source("candidate.sh", DOUBLE));
    let id = f.scheduler.add_case(None);
    let stress = Stress::new(
        f.source("gen.sh", "echo 1"),
        f.source("brute.sh", "echo broken >&2; exit 3"),
        5,
    );
    f.scheduler.set_stress(id, Some(stress)).unwrap();

    let err = f.scheduler.stress(id).await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("Brute force failed on iteration 0"), "{}", message);

    let case = f.scheduler.case(id).unwrap();
    assert!(matches!(case.err, Some(CaseError::Run { .. })));
    assert_eq!(case.input, None);
}

#[tokio::test]
async fn generator_output_becomes_the_input() {
    let f = Fixture::new(1);
    let id = f.scheduler.add_case(None);
    let stress = Stress::new(
        f.source("gen.sh", "echo \"case $1\""),
        f.source("brute.sh", "cat"),
        1,
    )
    .args("#{index}");
    f.scheduler.set_stress(id, Some(stress)).unwrap();

    let result = f.scheduler.run_generator(id).await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::AC);
    let case = f.scheduler.case(id).unwrap();
    assert_eq!(
        fsutil::read_to_string(case.input_path().unwrap()).unwrap(),
        "case 0\n"
    );
    assert!(case.input.unwrap().owned);
}

#[tokio::test]
async fn live_input_reaches_a_case_without_input() {
    let f = Fixture::new(1);
    f.scheduler.set_program(f.source("double.sh", DOUBLE));
    let id = f.scheduler.add_case(None);
    f.scheduler.set_answer_text(id, "10\n").unwrap();

    let s = f.scheduler.clone();
    let run = tokio::spawn(async move { s.run_case(id, RunMode::Normal).await });
    // the channel opens once the run holds the case
    let mut sent = false;
    for _ in 0..200 {
        if f.scheduler.send_input(id, "5\n").is_ok() {
            sent = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(sent);
    f.scheduler.close_input(id);

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.verdict, Verdict::AC);
}

#[tokio::test]
async fn input_sent_before_the_run_starts_is_delivered() {
    let f = Fixture::new(1);
    f.scheduler.set_program(f.source("echo.sh", "cat"));
    let id = f.scheduler.add_case(None);
    f.scheduler.set_answer_text(id, "5\n6\n").unwrap();

    f.scheduler.open_input(id).unwrap();
    f.scheduler.send_input(id, "5\n").unwrap();
    f.scheduler.send_input(id, "6\n").unwrap();
    f.scheduler.close_input(id);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        f.scheduler.run_case(id, RunMode::Normal),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    // EOF arrived too, otherwise `cat` would run into the time limit
    assert_eq!(result.verdict, Verdict::AC);
    assert!(f.scheduler.send_input(id, "late\n").is_err());
}

#[tokio::test]
async fn removed_case_is_skipped_by_a_running_batch() {
    let f = Fixture::new(1);
    f.scheduler
        .set_program(f.source("slow.sh", "sleep 0.3; cat"));
    let first = f.case("1\n", Some("1\n"));
    f.case("2\n", Some("2\n"));
    let last = f.case("3\n", Some("3\n"));

    let s = f.scheduler.clone();
    let batch = tokio::spawn(async move { s.run_all().await });
    while f.scheduler.case(first).unwrap().state != CaseState::Running {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f.scheduler.remove_case(last).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), batch)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.verdict, Verdict::AC);
    let state = f.scheduler.run_state();
    assert!(!state.running);
    assert_eq!((state.done, state.total), (3, 3));
    assert_eq!(f.scheduler.cases().len(), 2);
}

#[tokio::test]
async fn interactor_runs_against_live_input() {
    let f = Fixture::new(1);
    f.scheduler.set_interactor(Some(f.source(
        "inter.sh",
        "echo 5; read x; if [ \"$x\" = 10 ]; then echo fine >&2; else echo \"bad $x\" >&2; exit 1; fi",
    )));
    let id = f.scheduler.add_case(None);

    f.scheduler.open_input(id).unwrap();
    f.scheduler.send_input(id, "10\n").unwrap();
    f.scheduler.close_input(id);
    let result = f
        .scheduler
        .run_interactor(id, RunMode::Normal)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.verdict, Verdict::AC);
    let transcript = f.path().join("work").join(format!("case-{}", id)).join("interaction.txt");
    assert_eq!(fsutil::read_to_string(transcript).unwrap(), "5\n");

    f.scheduler.open_input(id).unwrap();
    f.scheduler.send_input(id, "7\n").unwrap();
    f.scheduler.close_input(id);
    let result = f
        .scheduler
        .run_interactor(id, RunMode::Normal)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.verdict, Verdict::RE);
    // the interactor's own run never becomes the case result
    assert_eq!(f.scheduler.case(id).unwrap().result, None);
}

#[tokio::test]
async fn file_io_mode_uses_the_named_files() {
    let f = Fixture::new(2);
    f.scheduler.update_run_config(|c| {
        c.file_io = Some(FileIo {
            input: "in.txt".into(),
            output: "out.txt".into(),
        })
    });
    f.scheduler.set_program(f.source(
        "fio.sh",
        "read n < in.txt; echo $((n * 2)) > out.txt",
    ));
    let ok = f.case("4\n", Some("8\n"));
    let wrong = f.case("5\n", Some("11\n"));

    let single = f.scheduler.run_case(ok, RunMode::Normal).await.unwrap().unwrap();
    assert_eq!(single.verdict, Verdict::AC);

    let result = f.scheduler.run_all().await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::WA);
    let verdict = |id| f.scheduler.case(id).unwrap().result.unwrap().verdict;
    assert_eq!(verdict(ok), Verdict::AC);
    assert_eq!(verdict(wrong), Verdict::WA);
}

#[tokio::test]
async fn debug_run_waits_for_the_debugger() {
    let f = Fixture::with_settings(|settings, dir| {
        let attached = dir.join("attached.txt");
        settings.debugger(Arc::new(ExternalDebugger::new(
            format!(
                "sh -c \"echo #{{pid}} > '{}'; echo ready; exec sleep 5\"",
                attached.display()
            ),
            "ready",
            Duration::from_secs(5),
        )))
    });
    f.scheduler.set_program(f.source("hello.sh", "echo hi"));
    let id = f.case("", Some("hi\n"));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        f.scheduler.run_case(id, RunMode::Debug),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(result.verdict, Verdict::AC);

    let pid = fsutil::read_to_string(f.path().join("attached.txt")).unwrap();
    assert!(pid.trim().parse::<u32>().is_ok(), "{:?}", pid);
    assert!(f.toolchain_calls().lines().any(|l| l.ends_with("-g")));
}

#[tokio::test]
async fn debug_run_without_a_debugger_fails() {
    let f = Fixture::new(1);
    f.scheduler.set_program(f.source("hello.sh", "echo hi"));
    let id = f.case("", None);

    let err = f.scheduler.run_case(id, RunMode::Debug).await.unwrap_err();
    assert!(format!("{:#}", err).contains("No debugger configured"));
    assert_eq!(f.compilations(), 0);
    assert!(matches!(f.scheduler.case(id).unwrap().err, Some(CaseError::Internal { .. })));
}

#[tokio::test]
async fn stress_reports_progress() {
    let mut f = Fixture::new(1);
    f.scheduler.set_program(f.source("candidate.sh", DOUBLE));
    let id = f.scheduler.add_case(None);
    let stress = Stress::new(
        f.source("gen.sh", "echo $1"),
        f.source("brute.sh", DOUBLE),
        4,
    );
    f.scheduler.set_stress(id, Some(stress)).unwrap();
    f.drain();

    let result = f.scheduler.stress(id).await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::AC);

    let progress: Vec<_> = f
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            Event::CaseChanged { case } => case.stress.and_then(|s| s.status),
            _ => None,
        })
        .collect();
    assert!(progress.iter().all(|p| p.total == 4));
    let current: Vec<_> = progress.iter().map(|p| p.current).collect();
    assert_eq!(current, vec![0, 1, 2, 3, 4]);
    assert_eq!(f.scheduler.case(id).unwrap().stress.unwrap().status, None);
}

#[tokio::test]
async fn stress_rejects_zero_iterations() {
    let f = Fixture::new(1);
    f.scheduler.set_program(f.source("candidate.sh", DOUBLE));
    let id = f.scheduler.add_case(None);
    let stress = Stress::new(f.source("gen.sh", "echo 1"), f.source("brute.sh", DOUBLE), 0);
    f.scheduler.set_stress(id, Some(stress)).unwrap();

    let err = f.scheduler.stress(id).await.unwrap_err();
    assert!(format!("{:#}", err).contains("must be positive"));
    assert_eq!(f.compilations(), 0);
    assert_eq!(f.scheduler.case(id).unwrap().state, CaseState::Idle);
}

#[tokio::test]
async fn default_generator_args_carry_index_and_seed() {
    let f = Fixture::new(1);
    let log = f.path().join("gen-args.log");
    f.scheduler.set_program(f.source("candidate.sh", DOUBLE));
    let id = f.scheduler.add_case(None);
    let stress = Stress::new(
        f.source(
            "gen.sh",
            &format!("echo \"$# $1 $2\" >> '{}'; echo $1", log.display()),
        ),
        f.source("brute.sh", DOUBLE),
        3,
    );
    assert_eq!(stress.args, Stress::DEFAULT_ARGS);
    f.scheduler.set_stress(id, Some(stress)).unwrap();

    let result = f.scheduler.stress(id).await.unwrap().unwrap();
    assert_eq!(result.verdict, Verdict::AC);

    let lines = fsutil::read_to_string(&log).unwrap();
    let mut indices = Vec::new();
    for line in lines.lines() {
        let words: Vec<&str> = line.split(' ').collect();
        assert_eq!(words.len(), 3, "{:?}", line);
        assert_eq!(words[0], "2");
        assert!(words[2].parse::<u64>().is_ok(), "{:?}", line);
        indices.push(words[1].parse::<u32>().unwrap());
    }
    assert_eq!(indices, vec![0, 1, 2]);
}

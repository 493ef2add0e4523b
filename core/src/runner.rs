mod debug;
mod interact;
mod pipes;
mod sampler;
mod signal;
mod teardown;

pub use self::debug::{DebugSession, Debugger, ExternalDebugger};
pub use self::pipes::Captured;

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::{
    process::Command,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use self::{
    interact::Wiring,
    pipes::{feed_stdin, Pump, Sink, StdinSource},
    sampler::{LimitHit, SamplerConfig, Usage},
    teardown::Teardown,
};
use crate::checker::{check_exact, check_tokens, CheckOutcome};
use crate::config::{EngineConfig, FileIo, RunConfig};
use crate::error::RunError;
use crate::testing::{TestResult, Verdict};

const NULL_INPUT: &str = "/dev/null";

/// How long to wait for output pipes to drain after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
    Judge,
    Interaction,
    Input,
}

/// Called with every chunk as it is read, before it is captured.
pub type OutputCallback = Arc<dyn Fn(Channel, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    pub time: Option<Duration>,
    pub memory_mb: Option<u64>,
}

impl Limits {
    pub fn from_run_config(cfg: &RunConfig) -> Self {
        Self {
            time: cfg.time_limit(),
            memory_mb: cfg.memory_limit_mb(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Judge {
    Tokens,
    Exact,
    /// Compiled checker, invoked as `checker input output answer`.
    Program(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeSpec {
    pub judge: Judge,
    pub answer: PathBuf,
}

/// Stdin chunks typed by the user while the program runs.
#[derive(Debug)]
pub struct LiveInput {
    pub chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Close the program's stdin once the sender side is dropped.
    pub eof_on_close: bool,
}

/// The candidate opens `names` inside `dir` instead of using stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIoSpec {
    pub names: FileIo,
    pub dir: PathBuf,
}

pub struct RunSpec {
    pub artifact: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<PathBuf>,
    /// Everything the program writes to stdout ends up here.
    pub stdout: PathBuf,
    pub judge: Option<JudgeSpec>,
    pub limits: Limits,
    pub cancel: CancellationToken,
    pub debugger: Option<Arc<dyn Debugger>>,
    pub live_input: Option<LiveInput>,
    pub observer: Option<OutputCallback>,
    pub file_io: Option<FileIoSpec>,
    pub interactor: Option<PathBuf>,
}

impl RunSpec {
    pub fn new(artifact: impl Into<PathBuf>, stdout: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            artifact: artifact.into(),
            args: Vec::new(),
            stdin: None,
            stdout: stdout.into(),
            judge: None,
            limits: Limits::default(),
            cancel,
            debugger: None,
            live_input: None,
            observer: None,
            file_io: None,
            interactor: None,
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn judge(mut self, judge: Judge, answer: impl Into<PathBuf>) -> Self {
        self.judge = Some(JudgeSpec {
            judge,
            answer: answer.into(),
        });
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn live_input(mut self, chunks: mpsc::UnboundedReceiver<Vec<u8>>, eof_on_close: bool) -> Self {
        self.live_input = Some(LiveInput {
            chunks,
            eof_on_close,
        });
        self
    }

    pub fn observer(mut self, observer: OutputCallback) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn file_io(mut self, names: FileIo, dir: impl Into<PathBuf>) -> Self {
        self.file_io = Some(FileIoSpec {
            names,
            dir: dir.into(),
        });
        self
    }

    pub fn interactor(mut self, path: impl Into<PathBuf>) -> Self {
        self.interactor = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub result: TestResult,
    pub stdout: Captured,
    pub stderr: Captured,
    /// Checker or interactor message.
    pub judge: String,
}

enum Ended {
    Exited(std::process::ExitStatus),
    Limit(LimitHit),
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    stdout_max_bytes: usize,
    stderr_max_bytes: usize,
    checker_timeout: Duration,
    sample_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(150);

    pub fn new() -> Self {
        let engine = EngineConfig::default();
        Self {
            stdout_max_bytes: engine.stdout_capture_max_bytes,
            stderr_max_bytes: engine.stderr_capture_max_bytes,
            checker_timeout: engine.checker_timeout(),
            sample_interval: Self::DEFAULT_SAMPLE_INTERVAL,
        }
    }

    pub fn from_config(engine: &EngineConfig) -> Self {
        Self::new()
            .capture_limits(engine.stdout_capture_max_bytes, engine.stderr_capture_max_bytes)
            .checker_timeout(engine.checker_timeout())
    }

    pub fn capture_limits(mut self, stdout: usize, stderr: usize) -> Self {
        self.stdout_max_bytes = stdout;
        self.stderr_max_bytes = stderr;
        self
    }

    pub fn checker_timeout(mut self, timeout: Duration) -> Self {
        self.checker_timeout = timeout;
        self
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Runs one program to a verdict. `Ok(None)` means the run was cancelled.
    pub async fn run(&self, spec: RunSpec) -> Result<Option<RunReport>, RunError> {
        let mut teardown = Teardown::default();
        let res = self.run_with(spec, &mut teardown).await;
        teardown.finish();
        res
    }

    async fn run_with(
        &self,
        spec: RunSpec,
        teardown: &mut Teardown,
    ) -> Result<Option<RunReport>, RunError> {
        let RunSpec {
            artifact,
            args,
            stdin,
            stdout,
            judge,
            limits,
            cancel,
            debugger,
            live_input,
            observer,
            file_io,
            interactor,
        } = spec;

        if cancel.is_cancelled() {
            return Ok(None);
        }

        if let Some(dir) = stdout.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RunError::io("Cannot create output dir", &artifact, e))?;
        }
        let out_file = tokio::fs::File::create(&stdout)
            .await
            .map_err(|e| RunError::io("Cannot create output file", &artifact, e))?;

        let mut cmd = Command::new(absolute(&artifact));
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut stdin_source = None;
        if interactor.is_some() {
            cmd.stdin(Stdio::piped());
        } else if let Some(fio) = &file_io {
            prepare_file_io(fio, stdin.as_deref(), &stdout, &artifact)?;
            cmd.current_dir(&fio.dir).stdin(Stdio::null());
        } else if stdin.is_some() || live_input.is_some() {
            cmd.stdin(Stdio::piped());
            stdin_source = Some(StdinSource {
                file: stdin.clone(),
                live: live_input,
            });
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RunError::io("Failed to start program", &artifact, e))?;
        let pid = child
            .id()
            .ok_or_else(|| RunError::new("Program exited before it could be observed", &artifact))?;
        teardown.kill_group(pid);
        log::debug!("Started {} (pid {})", artifact.to_string_lossy(), pid);

        let debugging = debugger.is_some();
        if let Some(debugger) = debugger {
            signal::suspend(pid)
                .map_err(|e| RunError::io("Failed to suspend program", &artifact, e))?;
            let session = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                session = debugger.attach(pid) => session?,
            };
            teardown.defer(move || drop(session));
            signal::resume(pid)
                .map_err(|e| RunError::io("Failed to resume program", &artifact, e))?;
        }

        let started = Instant::now();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let missing = || RunError::new("Program pipes are unavailable", &artifact);
        let child_stdout = child.stdout.take().ok_or_else(missing)?;
        let child_stderr = child.stderr.take().ok_or_else(missing)?;
        // with file I/O the program writes the output file through the link
        let out_sink = file_io.is_none().then(|| Sink::file(out_file));

        let stderr_task = Pump {
            channel: Channel::Stderr,
            max_bytes: self.stderr_max_bytes,
            sinks: Vec::new(),
            observer: observer.clone(),
        }
        .spawn(child_stderr, err_tx.clone(), artifact.clone());
        teardown.abort(&stderr_task);

        let (stdout_task, interaction) = match &interactor {
            Some(path) => {
                let wiring = Wiring {
                    interactor: path,
                    input: stdin.as_deref(),
                    output: interactor_output_path(&stdout),
                    candidate_stdin: child.stdin.take().ok_or_else(missing)?,
                    candidate_stdout: child_stdout,
                    out_sink,
                    observer: observer.clone(),
                    stdout_max_bytes: self.stdout_max_bytes,
                    judge_max_bytes: self.stderr_max_bytes,
                };
                let (interaction, stdout_task) = wiring.start(&err_tx, &artifact, teardown)?;
                (stdout_task, Some(interaction))
            }
            None => {
                if let (Some(source), Some(pipe)) = (stdin_source, child.stdin.take()) {
                    let feeder = feed_stdin(
                        pipe,
                        source,
                        observer.clone(),
                        err_tx.clone(),
                        artifact.clone(),
                    );
                    teardown.abort(&feeder);
                }
                let stdout_task = Pump {
                    channel: Channel::Stdout,
                    max_bytes: self.stdout_max_bytes,
                    sinks: out_sink.into_iter().collect(),
                    observer: observer.clone(),
                }
                .spawn(child_stdout, err_tx.clone(), artifact.clone());
                teardown.abort(&stdout_task);
                (stdout_task, None)
            }
        };

        let usage = Arc::new(Mutex::new(Usage::default()));
        let (hit_tx, mut hit_rx) = oneshot::channel();
        let sampler = sampler::spawn(
            SamplerConfig {
                pid,
                started,
                interval: self.sample_interval,
                // a paused debuggee would always run out of time
                time_limit: if debugging { None } else { limits.time },
                memory_limit_mb: limits.memory_mb,
            },
            usage.clone(),
            hit_tx,
        );
        teardown.abort(&sampler);

        let ended = tokio::select! {
            biased;
            Some(e) = err_rx.recv() => return Err(e),
            _ = cancel.cancelled() => {
                log::debug!("Run of {} cancelled", artifact.to_string_lossy());
                return Ok(None);
            }
            Ok(hit) = &mut hit_rx => Ended::Limit(hit),
            status = child.wait() => Ended::Exited(
                status.map_err(|e| RunError::io("Failed to wait for program", &artifact, e))?,
            ),
        };
        let elapsed = started.elapsed();
        sampler.abort();

        // lingering descendants would keep the pipes open
        if let Err(e) = signal::kill_group(pid) {
            log::warn!("Failed to kill process group {}: {}", pid, e);
        }
        if let Ended::Limit(_) = ended {
            let _ = tokio::time::timeout(DRAIN_GRACE, child.wait()).await;
        }

        let stdout_cap = drain(stdout_task).await;
        let stderr_cap = drain(stderr_task).await;
        if let Ok(e) = err_rx.try_recv() {
            return Err(e);
        }

        let usage = *usage.lock().unwrap_or_else(|p| p.into_inner());
        let mut result = TestResult {
            verdict: Verdict::AC,
            time_ms: Some(elapsed.as_millis() as u64),
            cpu_ms: usage.cpu_ms,
            memory_mb: usage.memory_mb(),
            exit_code: None,
        };
        let over_memory = limits
            .memory_mb
            .zip(usage.peak_rss_kb)
            .map_or(false, |(mb, kb)| kb > mb * 1024);
        let over_time = !debugging && limits.time.map_or(false, |tl| elapsed > tl);

        let mut judge_text = String::new();
        result.verdict = match ended {
            Ended::Limit(LimitHit::Memory) => Verdict::ML,
            Ended::Limit(LimitHit::Time) => Verdict::TL,
            Ended::Exited(status) => {
                result.exit_code = status.code();
                if over_memory {
                    Verdict::ML
                } else if over_time {
                    Verdict::TL
                } else if signal::is_interrupt(&status) {
                    Verdict::INT
                } else if !status.success() {
                    Verdict::RE
                } else if let Some(interaction) = interaction {
                    match interaction.finish(self.checker_timeout, &cancel).await? {
                        None => return Ok(None),
                        Some((verdict, text)) => {
                            judge_text = text;
                            verdict
                        }
                    }
                } else if let Some(judge) = &judge {
                    match self
                        .judge(judge, stdin.as_deref(), &stdout, &artifact, &cancel)
                        .await?
                    {
                        None => return Ok(None),
                        Some(outcome) => {
                            if let Some(observer) = &observer {
                                observer(Channel::Judge, outcome.message.as_bytes());
                            }
                            judge_text = outcome.message;
                            if outcome.ok {
                                Verdict::AC
                            } else {
                                Verdict::WA
                            }
                        }
                    }
                } else {
                    Verdict::AC
                }
            }
        };

        log::debug!(
            "{} finished: {} in {}ms",
            artifact.to_string_lossy(),
            result.verdict,
            elapsed.as_millis()
        );
        Ok(Some(RunReport {
            result,
            stdout: stdout_cap,
            stderr: stderr_cap,
            judge: judge_text,
        }))
    }

    async fn judge(
        &self,
        spec: &JudgeSpec,
        input: Option<&Path>,
        output: &Path,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<CheckOutcome>, RunError> {
        match &spec.judge {
            Judge::Tokens => Ok(Some(check_tokens(
                &read_file(output, artifact).await?,
                &read_file(&spec.answer, artifact).await?,
            ))),
            Judge::Exact => Ok(Some(check_exact(
                &read_file(output, artifact).await?,
                &read_file(&spec.answer, artifact).await?,
            ))),
            Judge::Program(checker) => {
                self.run_checker(checker, input, output, &spec.answer, cancel)
                    .await
            }
        }
    }

    async fn run_checker(
        &self,
        checker: &Path,
        input: Option<&Path>,
        output: &Path,
        answer: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<CheckOutcome>, RunError> {
        let mut cmd = Command::new(checker);
        cmd.arg(input.unwrap_or_else(|| Path::new(NULL_INPUT)))
            .arg(output)
            .arg(answer)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| RunError::io("Failed to start checker", checker, e))?;
        let out = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            out = tokio::time::timeout(self.checker_timeout, child.wait_with_output()) => out,
        };
        let out = match out {
            Ok(out) => out.map_err(|e| RunError::io("Failed to wait for checker", checker, e))?,
            Err(_) => {
                return Err(RunError::new(
                    format!(
                        "Checker did not finish within {}s",
                        self.checker_timeout.as_secs_f64()
                    ),
                    checker,
                ))
            }
        };

        let mut message = String::from_utf8_lossy(&out.stderr).trim_end().to_owned();
        let stdout = String::from_utf8_lossy(&out.stdout);
        let stdout = stdout.trim_end();
        if !stdout.is_empty() {
            if !message.is_empty() {
                message.push('\n');
            }
            message += stdout;
        }
        Ok(Some(CheckOutcome {
            ok: out.status.success(),
            message,
        }))
    }
}

async fn drain(task: JoinHandle<Captured>) -> Captured {
    tokio::time::timeout(DRAIN_GRACE, task)
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default()
}

async fn read_file(path: &Path, artifact: &Path) -> Result<Vec<u8>, RunError> {
    tokio::fs::read(path).await.map_err(|e| {
        RunError::io(
            format!("Cannot read {}", path.to_string_lossy()),
            artifact,
            e,
        )
    })
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_owned())
}

/// Where the interactor writes its own output, next to the candidate's.
fn interactor_output_path(stdout: &Path) -> PathBuf {
    let mut name = stdout.file_name().unwrap_or_default().to_os_string();
    name.push(".interactor");
    stdout.with_file_name(name)
}

/// Links the input and output files into `fio.dir` under the names the
/// program expects.
fn prepare_file_io(
    fio: &FileIoSpec,
    input: Option<&Path>,
    output: &Path,
    artifact: &Path,
) -> Result<(), RunError> {
    let to_err = |e: fsutil::Error| RunError::new(format!("Cannot prepare file I/O: {}", e), artifact);
    fsutil::reset_dir(&fio.dir).map_err(to_err)?;
    let input_link = fio.dir.join(&fio.names.input);
    match input {
        Some(p) => fsutil::symlink(absolute(p), &input_link),
        None => fsutil::write(&input_link, ""),
    }
    .map_err(to_err)?;
    fsutil::symlink(absolute(output), fio.dir.join(&fio.names.output)).map_err(to_err)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::write_script;
    use async_trait::async_trait;

    struct Case {
        dir: tempfile::TempDir,
    }

    impl Case {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn file(&self, name: &str, contents: &str) -> PathBuf {
            let p = self.path(name);
            fsutil::write(&p, contents).unwrap();
            p
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            write_script(self.dir.path(), name, body)
        }

        fn spec(&self, program: &Path) -> RunSpec {
            RunSpec::new(program, self.path("out.txt"), CancellationToken::new()).limits(Limits {
                time: Some(Duration::from_secs(10)),
                memory_mb: Some(512),
            })
        }
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new().sample_interval(Duration::from_millis(50))
    }

    async fn run(spec: RunSpec) -> RunReport {
        runner().run(spec).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn doubling_program_is_accepted() {
        let c = Case::new();
        let prog = c.script("double", "read n; echo $((n*2))");
        let spec = c
            .spec(&prog)
            .stdin(c.file("in.txt", "3\n"))
            .judge(Judge::Tokens, c.file("ans.txt", "6\n"));

        let report = run(spec).await;
        assert_eq!(report.result.verdict, Verdict::AC);
        assert_eq!(report.result.exit_code, Some(0));
        assert_eq!(report.stdout.text, "6\n");
        assert_eq!(report.judge, "ok 1 token(s)");
        assert_eq!(fsutil::read_to_string(c.path("out.txt")).unwrap(), "6\n");
    }

    #[tokio::test]
    async fn wrong_output_is_wa() {
        let c = Case::new();
        let prog = c.script("wrong", "read n; echo $((n*3))");
        let spec = c
            .spec(&prog)
            .stdin(c.file("in.txt", "3\n"))
            .judge(Judge::Tokens, c.file("ans.txt", "6\n"));
        let report = run(spec).await;
        assert_eq!(report.result.verdict, Verdict::WA);
        assert!(report.judge.starts_with("wrong answer"), "{}", report.judge);
    }

    #[tokio::test]
    async fn clean_exit_without_answer_is_ac() {
        let c = Case::new();
        let prog = c.script("hello", "echo hello");
        assert_eq!(run(c.spec(&prog)).await.result.verdict, Verdict::AC);
    }

    #[tokio::test]
    async fn nonzero_exit_is_re() {
        let c = Case::new();
        let prog = c.script("fail", "echo oops >&2; exit 3");
        let report = run(c.spec(&prog).judge(Judge::Tokens, c.file("ans.txt", "x"))).await;
        assert_eq!(report.result.verdict, Verdict::RE);
        assert_eq!(report.result.exit_code, Some(3));
        assert_eq!(report.stderr.text, "oops\n");
    }

    #[tokio::test]
    async fn terminated_program_is_int() {
        let c = Case::new();
        let prog = c.script("term", "kill -TERM $$; sleep 5");
        assert_eq!(run(c.spec(&prog)).await.result.verdict, Verdict::INT);
    }

    #[tokio::test]
    async fn sleeping_past_limit_is_tl() {
        let c = Case::new();
        let prog = c.script("sleepy", "sleep 30");
        let spec = c.spec(&prog).limits(Limits {
            time: Some(Duration::from_millis(300)),
            memory_mb: None,
        });
        let begin = Instant::now();
        let report = run(spec).await;
        assert_eq!(report.result.verdict, Verdict::TL);
        assert!(begin.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn allocating_past_limit_is_ml() {
        let c = Case::new();
        let prog = c.script(
            "hog",
            r#"exec python3 -c 'import time; b = b"x" * (256 * 1024 * 1024); time.sleep(10)'"#,
        );
        let spec = c.spec(&prog).limits(Limits {
            time: Some(Duration::from_secs(20)),
            memory_mb: Some(64),
        });
        let report = run(spec).await;
        assert_eq!(report.result.verdict, Verdict::ML);
        assert!(report.result.memory_mb.unwrap() > 64.0);
    }

    #[tokio::test]
    async fn cancelled_run_yields_none() {
        let c = Case::new();
        let prog = c.script("sleepy", "sleep 30");
        let spec = c.spec(&prog);
        let cancel = spec.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let begin = Instant::now();
        assert!(runner().run(spec).await.unwrap().is_none());
        assert!(begin.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_cancelled_run_does_not_start() {
        let c = Case::new();
        let prog = c.script("touch", &format!("touch '{}'", c.path("started").display()));
        let spec = c.spec(&prog);
        spec.cancel.cancel();
        assert!(runner().run(spec).await.unwrap().is_none());
        assert!(!c.path("started").exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancellation_leaves_no_orphans() {
        let c = Case::new();
        let pidfile = c.path("bg.pid");
        let prog = c.script(
            "spawner",
            &format!("sleep 30 &\necho $! > '{}'\nwait", pidfile.display()),
        );
        let spec = c.spec(&prog);
        let cancel = spec.cancel.clone();
        let handle = tokio::spawn(async move { runner().run(spec).await });

        let mut pid = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Ok(s) = fsutil::read_to_string(&pidfile) {
                if let Ok(p) = s.trim().parse::<u32>() {
                    pid = Some(p);
                    break;
                }
            }
        }
        let pid = pid.expect("background pid");
        cancel.cancel();
        assert!(handle.await.unwrap().unwrap().is_none());

        let mut gone = false;
        for _ in 0..40 {
            let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid));
            // reparented zombies count as gone
            if stat.map_or(true, |s| s.contains(") Z")) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "pid {} survived cancellation", pid);
    }

    #[tokio::test]
    async fn capture_is_bounded_but_file_is_complete() {
        let c = Case::new();
        let prog = c.script("chatty", "head -c 1000 /dev/zero | tr '\\0' a");
        let report = ProcessRunner::new()
            .capture_limits(100, 100)
            .run(c.spec(&prog))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.stdout.text.len(), 100);
        assert_eq!(report.stdout.hidden_bytes, 900);
        assert!(report.stdout.is_truncated());
        assert_eq!(fsutil::read(c.path("out.txt")).unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn observer_sees_streamed_output() {
        let c = Case::new();
        let prog = c.script("both", "echo out; echo err >&2");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let spec = c.spec(&prog).observer(Arc::new(move |ch, bytes| {
            sink.lock().unwrap().push((ch, bytes.to_vec()));
        }));
        run(spec).await;

        let seen = seen.lock().unwrap();
        let of = |ch| -> Vec<u8> {
            seen.iter()
                .filter(|(c, _)| *c == ch)
                .flat_map(|(_, b)| b.clone())
                .collect()
        };
        assert_eq!(of(Channel::Stdout), b"out\n");
        assert_eq!(of(Channel::Stderr), b"err\n");
    }

    #[tokio::test]
    async fn live_input_is_forwarded_until_closed() {
        let c = Case::new();
        let prog = c.script("echo", "while read line; do echo \"got $line\"; done");
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(b"1\n".to_vec()).unwrap();
        tx.send(b"2\n".to_vec()).unwrap();
        drop(tx);
        let report = run(c.spec(&prog).live_input(rx, true)).await;
        assert_eq!(report.stdout.text, "got 1\ngot 2\n");
    }

    #[tokio::test]
    async fn input_file_then_live_input() {
        let c = Case::new();
        let prog = c.script("sum", "read a; read b; echo $((a+b))");
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(b"5\n".to_vec()).unwrap();
        drop(tx);
        let spec = c
            .spec(&prog)
            .stdin(c.file("in.txt", "2\n"))
            .live_input(rx, true);
        assert_eq!(run(spec).await.stdout.text, "7\n");
    }

    #[tokio::test]
    async fn unread_input_is_not_an_error() {
        let c = Case::new();
        let prog = c.script("ignore", "echo 6");
        let big = "1\n".repeat(200_000);
        let spec = c
            .spec(&prog)
            .stdin(c.file("in.txt", &big))
            .judge(Judge::Tokens, c.file("ans.txt", "6"));
        assert_eq!(run(spec).await.result.verdict, Verdict::AC);
    }

    #[tokio::test]
    async fn external_checker_decides() {
        let c = Case::new();
        let checker = c.script(
            "chk",
            "if cmp -s \"$2\" \"$3\"; then echo same >&2; else echo differ >&2; exit 1; fi",
        );
        let prog = c.script("p", "echo 41");
        let spec = c
            .spec(&prog)
            .stdin(c.file("in.txt", ""))
            .judge(Judge::Program(checker.clone()), c.file("ans.txt", "42\n"));
        let report = run(spec).await;
        assert_eq!(report.result.verdict, Verdict::WA);
        assert_eq!(report.judge, "differ");

        let spec = c
            .spec(&prog)
            .judge(Judge::Program(checker), c.file("ans2.txt", "41\n"));
        let report = run(spec).await;
        assert_eq!(report.result.verdict, Verdict::AC);
        assert_eq!(report.judge, "same");
    }

    #[tokio::test]
    async fn file_io_goes_through_links() {
        let c = Case::new();
        let prog = c.script("fio", "read n < in.txt; echo $((n+1)) > out.txt");
        let spec = c
            .spec(&prog)
            .stdin(c.file("input", "9\n"))
            .judge(Judge::Exact, c.file("answer", "10\n"))
            .file_io(
                FileIo {
                    input: "in.txt".into(),
                    output: "out.txt".into(),
                },
                c.path("scratch"),
            );
        let report = run(spec).await;
        assert_eq!(report.result.verdict, Verdict::AC);
        assert_eq!(fsutil::read_to_string(c.path("out.txt")).unwrap(), "10\n");
    }

    #[tokio::test]
    async fn interactor_judges_the_conversation() {
        let c = Case::new();
        let interactor = c.script(
            "inter",
            "echo 5\nread x\nif [ \"$x\" = 10 ]; then echo fine >&2; else echo \"bad $x\" >&2; exit 1; fi",
        );
        let good = c.script("good", "read n; echo $((n*2))");
        let bad = c.script("bad", "read n; echo 0");

        let report = run(c.spec(&good).interactor(&interactor)).await;
        assert_eq!(report.result.verdict, Verdict::AC);
        assert_eq!(report.judge, "fine");

        let report = run(c.spec(&bad).interactor(&interactor)).await;
        assert_eq!(report.result.verdict, Verdict::WA);
        assert_eq!(report.judge, "bad 0");
    }

    struct ExpectStopped {
        was_stopped: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl Debugger for ExpectStopped {
        async fn attach(&self, pid: u32) -> Result<DebugSession, RunError> {
            let mut stopped = false;
            for _ in 0..20 {
                let stat =
                    std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap_or_default();
                if stat.contains(") T") {
                    stopped = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            *self.was_stopped.lock().unwrap() = Some(stopped);
            Ok(DebugSession::detached())
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn debug_run_is_suspended_until_attached() {
        let c = Case::new();
        let prog = c.script("p", "sleep 0.3; echo 1");
        let dbg = Arc::new(ExpectStopped {
            was_stopped: Mutex::new(None),
        });
        let report = run(c.spec(&prog).debugger(dbg.clone())).await;
        assert_eq!(report.result.verdict, Verdict::AC);
        assert_eq!(*dbg.was_stopped.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn missing_program_is_a_run_error() {
        let c = Case::new();
        let err = runner().run(c.spec(&c.path("nope"))).await.unwrap_err();
        assert_eq!(err.artifact, c.path("nope"));
        assert!(err.source.is_some());
    }

    #[test]
    fn interactor_output_sits_next_to_stdout() {
        assert_eq!(
            interactor_output_path(Path::new("/w/case-1/output.txt")),
            PathBuf::from("/w/case-1/output.txt.interactor")
        );
    }
}

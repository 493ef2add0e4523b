use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Access, FileSlot, Scheduler, Scope};
use crate::checker::Checker;
use crate::compile::BuildKind;
use crate::config::RunConfig;
use crate::error::{CaseError, CompileError, RunError};
use crate::event::Event;
use crate::runner::{Debugger, Judge, LiveInput, Limits, OutputCallback, RunReport, RunSpec};
use crate::testing::{CaseFile, CaseId, TestCase, TestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    /// Debug build, suspended until the debugger attached.
    Debug,
}

impl RunMode {
    fn build_kind(self) -> BuildKind {
        match self {
            RunMode::Normal => BuildKind::Fast,
            RunMode::Debug => BuildKind::Debug,
        }
    }
}

/// Artifacts and settings shared by every case of one run.
#[derive(Debug, Clone)]
pub(super) struct Prepared {
    pub program: PathBuf,
    pub judge: Judge,
    pub interactor: Option<PathBuf>,
    pub run_config: RunConfig,
}

impl Scheduler {
    pub(super) async fn compile(
        &self,
        source: &std::path::Path,
        kind: BuildKind,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<PathBuf>> {
        Ok(self
            .inner
            .compiler
            .compile(source, true, kind, &[], cancel)
            .await?)
    }

    /// Compiles the program, plus the checker and interactor if configured.
    pub(super) async fn prepare(
        &self,
        kind: BuildKind,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<Prepared>> {
        let (program, run_config) = {
            let st = self.state();
            (st.program.clone(), st.run_config.clone())
        };
        let program = program.context("No program to test; set one first")?;

        let Some(program) = self.compile(&program, kind, cancel).await? else {
            return Ok(None);
        };
        let judge = match &run_config.checker {
            Checker::Tokens => Judge::Tokens,
            Checker::Exact => Judge::Exact,
            Checker::External(source) => {
                match self.compile(source, BuildKind::Fast, cancel).await? {
                    Some(artifact) => Judge::Program(artifact),
                    None => return Ok(None),
                }
            }
        };
        let interactor = match &run_config.interactor {
            Some(source) => match self.compile(source, BuildKind::Fast, cancel).await? {
                Some(artifact) => Some(artifact),
                None => return Ok(None),
            },
            None => None,
        };

        Ok(Some(Prepared {
            program,
            judge,
            interactor,
            run_config,
        }))
    }

    pub(super) fn observer(&self, id: CaseId) -> OutputCallback {
        let events = self.inner.events.clone();
        Arc::new(move |channel, bytes| {
            let _ = events.send(Event::Output {
                id,
                channel,
                data: String::from_utf8_lossy(bytes).into_owned(),
            });
        })
    }

    fn debugger_for(&self, mode: RunMode) -> anyhow::Result<Option<Arc<dyn Debugger>>> {
        match mode {
            RunMode::Normal => Ok(None),
            RunMode::Debug => self
                .inner
                .settings
                .debugger
                .clone()
                .context("No debugger configured (see [debugger] in cprun.toml)")
                .map(Some),
        }
    }

    /// Runs the prepared program against one case.
    pub(super) async fn execute(
        &self,
        id: CaseId,
        prepared: &Prepared,
        cancel: CancellationToken,
        live: Option<LiveInput>,
        debugger: Option<Arc<dyn Debugger>>,
    ) -> anyhow::Result<Option<RunReport>> {
        let case = self
            .case(id)
            .with_context(|| format!("Test case #{} does not exist", id))?;
        let dir = self.case_dir(id);

        let mut spec = RunSpec::new(&prepared.program, dir.join("output.txt"), cancel)
            .limits(Limits::from_run_config(&prepared.run_config))
            .observer(self.observer(id));
        if let Some(input) = case.input_path() {
            spec = spec.stdin(input);
        }
        if let Some(answer) = case.answer_path() {
            spec = spec.judge(prepared.judge.clone(), answer);
        }
        if let Some(interactor) = &prepared.interactor {
            spec = spec.interactor(interactor);
        } else if let Some(fio) = &prepared.run_config.file_io {
            spec = spec.file_io(fio.clone(), dir.join("fio"));
        }
        spec.live_input = live;
        spec.debugger = debugger;

        Ok(self.inner.runner.run(spec).await?)
    }

    /// Runs one case on its own. Cancellation yields `Ok(None)`.
    pub async fn run_case(&self, id: CaseId, mode: RunMode) -> anyhow::Result<Option<TestResult>> {
        let lease = self.acquire(Scope::Case(id), Access::Cancellable, None)?;
        let cancel = lease.token();
        self.modify_case(id, TestCase::clear_outcome)?;
        // open before compiling so nothing typed meanwhile is lost
        let chunks = self.take_input(id);

        let outcome: anyhow::Result<Option<RunReport>> = async {
            let debugger = self.debugger_for(mode)?;
            let Some(prepared) = self.prepare(mode.build_kind(), &cancel).await? else {
                return Ok(None);
            };
            let live = self.live_input_for(id, &prepared, chunks);
            self.execute(id, &prepared, cancel.clone(), live, debugger)
                .await
        }
        .await;
        self.end_input(id);

        self.settle(id, "run", outcome, true)
    }

    /// A case without an input file reads what the user types.
    fn live_input_for(
        &self,
        id: CaseId,
        prepared: &Prepared,
        chunks: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    ) -> Option<LiveInput> {
        let has_input = self.case(id)?.input.is_some();
        if has_input || prepared.interactor.is_some() || prepared.run_config.file_io.is_some() {
            return None;
        }
        Some(LiveInput {
            chunks: chunks?,
            eof_on_close: prepared.run_config.eof_on_close,
        })
    }

    /// Runs the stress generator once and makes its output the case input.
    pub async fn run_generator(&self, id: CaseId) -> anyhow::Result<Option<TestResult>> {
        let lease = self.acquire(Scope::Case(id), Access::Cancellable, None)?;
        let cancel = lease.token();

        let outcome: anyhow::Result<Option<RunReport>> = async {
            let stress = self
                .case(id)
                .and_then(|c| c.stress)
                .context("No generator set; configure stress options first")?;
            let Some(generator) = self.compile(&stress.generator, BuildKind::Fast, &cancel).await? else {
                return Ok(None);
            };

            let generated = self.case_dir(id).join("generated.txt");
            let spec = RunSpec::new(generator, &generated, cancel.clone())
                .args(super::stress::generator_args(&stress.args, 0, rand::random())?)
                .limits(Limits::from_run_config(&self.run_config()))
                .observer(self.observer(id));
            let report = self.inner.runner.run(spec).await?;

            if let Some(report) = &report {
                if report.result.verdict.is_accepted() {
                    let path = self.owned_path(id, FileSlot::Input);
                    fsutil::copy_file_with_mkdir(&generated, &path)?;
                    self.replace_file(id, FileSlot::Input, Some(CaseFile::owned(path)))?;
                }
            }
            Ok(report)
        }
        .await;

        self.settle(id, "generate input for", outcome, false)
    }

    /// Runs the interactor alone; the user plays the program via live input.
    pub async fn run_interactor(&self, id: CaseId, mode: RunMode) -> anyhow::Result<Option<TestResult>> {
        let lease = self.acquire(Scope::Case(id), Access::Cancellable, None)?;
        let cancel = lease.token();
        let chunks = self.take_input(id);

        let outcome: anyhow::Result<Option<RunReport>> = async {
            let run_config = self.run_config();
            let source = run_config
                .interactor
                .clone()
                .context("No interactor configured")?;
            let debugger = self.debugger_for(mode)?;
            let Some(interactor) = self.compile(&source, mode.build_kind(), &cancel).await? else {
                return Ok(None);
            };

            let case = self
                .case(id)
                .with_context(|| format!("Test case #{} does not exist", id))?;
            let dir = self.case_dir(id);
            let input = case
                .input_path()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/dev/null".to_owned());
            let chunks = chunks.with_context(|| format!("Test case #{} does not exist", id))?;

            let mut spec = RunSpec::new(interactor, dir.join("interaction.txt"), cancel.clone())
                .args(vec![
                    input,
                    dir.join("interactor.out").to_string_lossy().into_owned(),
                ])
                .limits(Limits {
                    time: None,
                    memory_mb: run_config.memory_limit_mb(),
                })
                .live_input(chunks, run_config.eof_on_close)
                .observer(self.observer(id));
            spec.debugger = debugger;
            Ok(self.inner.runner.run(spec).await?)
        }
        .await;
        self.end_input(id);

        self.settle(id, "run interactor for", outcome, false)
    }

    /// Applies the outcome of an operation to the case. With `record`, a
    /// finished run becomes the case's last result.
    pub(super) fn settle(
        &self,
        id: CaseId,
        what: &str,
        outcome: anyhow::Result<Option<RunReport>>,
        record: bool,
    ) -> anyhow::Result<Option<TestResult>> {
        match outcome {
            Ok(Some(report)) => {
                let result = report.result.clone();
                if record {
                    let r = result.clone();
                    self.modify_case(id, move |c| {
                        c.result = Some(r);
                        c.err = None;
                    })?;
                }
                self.emit(Event::OutputReady {
                    id,
                    stdout: report.stdout,
                    stderr: report.stderr,
                    judge: report.judge,
                });
                Ok(Some(result))
            }
            Ok(None) => {
                log::info!("Cancelled: {} test case #{}", what, id);
                Ok(None)
            }
            Err(e) => Err(self.record_failure(id, what, e)),
        }
    }

    /// Logs and reports a failed operation and pins the error on the case.
    pub(super) fn record_failure(&self, id: CaseId, what: &str, e: anyhow::Error) -> anyhow::Error {
        let label = self
            .case(id)
            .map(|c| c.label())
            .unwrap_or_else(|| format!("#{}", id));
        let e = e.context(format!("Failed to {} test case {}", what, label));

        let (err, result) = if let Some(ce) = e.downcast_ref::<CompileError>() {
            (CaseError::from(ce), Some(TestResult::compile_error()))
        } else if let Some(re) = e.downcast_ref::<RunError>() {
            (CaseError::from(re), None)
        } else {
            (CaseError::internal(&e), None)
        };

        log::error!("{:#}", e);
        self.notice(format!("{:#}", e));
        let _ = self.modify_case(id, |c| {
            c.err = Some(err);
            if result.is_some() {
                c.result = result;
            }
        });
        e
    }
}

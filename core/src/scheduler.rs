mod batch;
mod guard;
mod run;
mod stress;

pub use self::guard::Access;
pub use self::run::RunMode;

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{bail, Context as _};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use self::guard::{Grant, Guard};
use crate::checker::Checker;
use crate::compile::{Compiler, CompilerSettings};
use crate::config::{Config, EngineConfig, RunConfig};
use crate::event::{Event, RunState};
use crate::runner::{Debugger, ExternalDebugger, ProcessRunner};
use crate::testing::{CaseFile, CaseId, CaseState, Stress, TestCase};
use crate::testset::TestSetRecord;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SchedulerSettings {
    /// Scratch outputs and per-worker directories.
    pub work_dir: PathBuf,
    /// Files owned by test cases.
    pub data_dir: PathBuf,
    pub concurrency: usize,
    pub debugger: Option<Arc<dyn Debugger>>,
}

impl SchedulerSettings {
    pub fn new(work_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            data_dir: data_dir.into(),
            concurrency: EngineConfig::default().concurrency,
            debugger: None,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mut settings = Self::new(&cfg.engine.work_dir, cfg.project_dir().join(".cprun"))
            .concurrency(cfg.engine.concurrency);
        if let Some(d) = &cfg.debugger {
            settings = settings.debugger(Arc::new(ExternalDebugger::from_config(d)));
        }
        settings
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileSlot {
    Input,
    Answer,
}

impl FileSlot {
    fn extension(self) -> &'static str {
        match self {
            FileSlot::Input => "in",
            FileSlot::Answer => "ans",
        }
    }

    fn of(self, case: &mut TestCase) -> &mut Option<CaseFile> {
        match self {
            FileSlot::Input => &mut case.input,
            FileSlot::Answer => &mut case.answer,
        }
    }
}

struct Slot {
    case: TestCase,
    guard: Guard,
    /// Live stdin of the current or next run, if it accepts any.
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Receiving end opened ahead of the run that will read it.
    queued: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Slot {
    fn new(case: TestCase) -> Self {
        Self {
            case,
            guard: Guard::default(),
            input: None,
            queued: None,
        }
    }
}

struct State {
    slots: Vec<Slot>,
    next_id: CaseId,
    run_config: RunConfig,
    program: Option<PathBuf>,
    batch: Guard,
    run_state: RunState,
}

impl State {
    fn slot(&self, id: CaseId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.case.id == id)
    }

    fn slot_mut(&mut self, id: CaseId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.case.id == id)
    }

    fn alloc_id(&mut self) -> CaseId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

struct Inner {
    settings: SchedulerSettings,
    compiler: Compiler,
    runner: ProcessRunner,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<Event>,
    /// Number of guards, case or batch, that are not idle.
    active: watch::Sender<usize>,
}

/// Owns the test cases and runs every operation on them.
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Case(CaseId),
    Batch,
}

/// Holds a guard until dropped.
struct Lease {
    scheduler: Scheduler,
    scope: Scope,
    grant: Grant,
}

impl Lease {
    fn token(&self) -> CancellationToken {
        self.grant.token.clone().unwrap_or_default()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.grant.owns {
            self.scheduler.release(self.scope);
        }
    }
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        compiler: Compiler,
        runner: ProcessRunner,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (active, _) = watch::channel(0);
        let record = TestSetRecord::default();
        let scheduler = Self {
            inner: Arc::new(Inner {
                settings,
                compiler,
                runner,
                state: Mutex::new(State {
                    slots: Vec::new(),
                    next_id: record.next_id,
                    run_config: record.run_config,
                    program: None,
                    batch: Guard::default(),
                    run_state: RunState::default(),
                }),
                events,
                active,
            }),
        };
        (scheduler, rx)
    }

    pub fn from_config(cfg: &Config) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (scheduler, rx) = Self::new(
            SchedulerSettings::from_config(cfg),
            Compiler::new(CompilerSettings::from_config(cfg)),
            ProcessRunner::from_config(&cfg.engine),
        );
        scheduler.state().run_config = cfg.run.clone();
        (scheduler, rx)
    }

    pub fn compiler(&self) -> &Compiler {
        &self.inner.compiler
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn emit(&self, event: Event) {
        // nobody listening is fine
        let _ = self.inner.events.send(event);
    }

    fn notice(&self, message: impl Into<String>) {
        self.emit(Event::Notice {
            message: message.into(),
        });
    }

    fn acquire(
        &self,
        scope: Scope,
        access: Access,
        parent: Option<&CancellationToken>,
    ) -> anyhow::Result<Lease> {
        let acquired = {
            let mut st = self.state();
            let acquired = match scope {
                Scope::Case(id) => {
                    let slot = st
                        .slot_mut(id)
                        .with_context(|| format!("Test case #{} does not exist", id))?;
                    let what = format!("Test case {}", slot.case.label());
                    slot.guard.acquire(access, parent, &what).map(|grant| {
                        let before = slot.case.state;
                        slot.case.state = slot.guard.state();
                        let changed = (before != slot.case.state).then(|| slot.case.clone());
                        (grant, changed)
                    })
                }
                Scope::Batch => st
                    .batch
                    .acquire(access, parent, "Run all")
                    .map(|grant| (grant, None)),
            };
            // replace_test_set reads the count under this lock
            if let Ok((grant, _)) = &acquired {
                if grant.owns {
                    self.inner.active.send_modify(|n| *n += 1);
                }
            }
            acquired
        };

        match acquired {
            Ok((grant, changed)) => {
                if let Some(case) = changed {
                    self.emit(Event::CaseChanged { case });
                }
                Ok(Lease {
                    scheduler: self.clone(),
                    scope,
                    grant,
                })
            }
            Err(e) => {
                self.notice(e.to_string());
                Err(e.into())
            }
        }
    }

    fn release(&self, scope: Scope) {
        let changed = {
            let mut st = self.state();
            let changed = match scope {
                Scope::Case(id) => st.slot_mut(id).map(|slot| {
                    slot.guard.release();
                    slot.case.state = CaseState::Idle;
                    slot.case.clone()
                }),
                Scope::Batch => {
                    st.batch.release();
                    None
                }
            };
            self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
            changed
        };
        if let Some(case) = changed {
            self.emit(Event::CaseChanged { case });
        }
    }

    /// Resolves once every guard is idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn modify_case<T>(&self, id: CaseId, f: impl FnOnce(&mut TestCase) -> T) -> anyhow::Result<T> {
        let (out, case) = {
            let mut st = self.state();
            let slot = st
                .slot_mut(id)
                .with_context(|| format!("Test case #{} does not exist", id))?;
            let out = f(&mut slot.case);
            (out, slot.case.clone())
        };
        self.emit(Event::CaseChanged { case });
        Ok(out)
    }

    fn case_dir(&self, id: CaseId) -> PathBuf {
        self.inner.settings.work_dir.join(format!("case-{}", id))
    }

    fn owned_path(&self, id: CaseId, slot: FileSlot) -> PathBuf {
        self.inner
            .settings
            .data_dir
            .join("cases")
            .join(format!("{}.{}", id, slot.extension()))
    }

    pub fn case(&self, id: CaseId) -> Option<TestCase> {
        self.state().slot(id).map(|s| s.case.clone())
    }

    pub fn cases(&self) -> Vec<TestCase> {
        self.state().slots.iter().map(|s| s.case.clone()).collect()
    }

    pub fn run_state(&self) -> RunState {
        self.state().run_state.clone()
    }

    pub fn run_config(&self) -> RunConfig {
        self.state().run_config.clone()
    }

    pub fn program(&self) -> Option<PathBuf> {
        self.state().program.clone()
    }

    pub fn snapshot(&self) -> TestSetRecord {
        let st = self.state();
        TestSetRecord {
            cases: st.slots.iter().map(|s| s.case.clone()).collect(),
            next_id: st.next_id,
            run_config: st.run_config.clone(),
            program: st.program.clone(),
            updated_at: None,
        }
    }

    /// Stops everything in flight, waits for it to unwind, then swaps in `record`.
    pub async fn replace_test_set(&self, record: TestSetRecord) {
        let mut record = Some(record);
        loop {
            self.cancel_all();
            self.wait_idle().await;

            let swapped = {
                let mut st = self.state();
                if *self.inner.active.borrow() != 0 {
                    None
                } else if let Some(record) = record.take() {
                    let removed: Vec<CaseId> = st.slots.drain(..).map(|s| s.case.id).collect();
                    let max_id = record.cases.iter().map(|c| c.id).max().unwrap_or(0);
                    st.slots = record
                        .cases
                        .into_iter()
                        .map(|mut case| {
                            case.state = CaseState::Idle;
                            if let Some(stress) = case.stress.as_mut() {
                                stress.status = None;
                            }
                            Slot::new(case)
                        })
                        .collect();
                    st.next_id = record.next_id.max(max_id + 1);
                    st.run_config = record.run_config;
                    st.program = record.program;
                    st.run_state = RunState::default();
                    let added: Vec<TestCase> = st.slots.iter().map(|s| s.case.clone()).collect();
                    Some((removed, added))
                } else {
                    return;
                }
            };

            if let Some((removed, added)) = swapped {
                for id in removed {
                    self.emit(Event::CaseRemoved { id });
                }
                for case in added {
                    self.emit(Event::CaseAdded { case });
                }
                self.emit(Event::RunState {
                    state: RunState::default(),
                });
                return;
            }
        }
    }

    pub fn add_case(&self, name: Option<String>) -> CaseId {
        let case = {
            let mut st = self.state();
            let id = st.alloc_id();
            let case = TestCase::new(id, name.unwrap_or_else(|| TestCase::default_name(id)));
            st.slots.push(Slot::new(case.clone()));
            case
        };
        let id = case.id;
        log::debug!("Added test case {}", case.label());
        self.emit(Event::CaseAdded { case });
        id
    }

    /// Adds one case per input file; the files stay owned by the user.
    pub fn import_cases(&self, files: Vec<(PathBuf, Option<PathBuf>)>) -> anyhow::Result<Vec<CaseId>> {
        for (input, answer) in &files {
            for path in std::iter::once(input).chain(answer) {
                if !path.is_file() {
                    bail!("Cannot import '{}': not a file", path.to_string_lossy());
                }
            }
        }

        let mut ids = Vec::with_capacity(files.len());
        for (input, answer) in files {
            let case = {
                let mut st = self.state();
                let id = st.alloc_id();
                let name = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| TestCase::default_name(id));
                let mut case = TestCase::new(id, name);
                case.input = Some(CaseFile::provided(input));
                case.answer = answer.map(CaseFile::provided);
                st.slots.push(Slot::new(case.clone()));
                case
            };
            ids.push(case.id);
            self.emit(Event::CaseAdded { case });
        }
        Ok(ids)
    }

    /// Rejected while the case is running; owned files go with it.
    pub fn remove_case(&self, id: CaseId) -> anyhow::Result<()> {
        let _lease = self.acquire(Scope::Case(id), Access::Update, None)?;
        let slot = {
            let mut st = self.state();
            let pos = st
                .slots
                .iter()
                .position(|s| s.case.id == id)
                .with_context(|| format!("Test case #{} does not exist", id))?;
            st.slots.remove(pos)
        };
        for path in slot.case.owned_files() {
            if let Err(e) = fsutil::remove_file_if_exists(path) {
                log::warn!("{:#}", e);
            }
        }
        if let Err(e) = fsutil::remove_dir_all_if_exists(self.case_dir(id)) {
            log::warn!("{:#}", e);
        }
        log::debug!("Removed test case {}", slot.case.label());
        self.emit(Event::CaseRemoved { id });
        Ok(())
    }

    pub fn rename_case(&self, id: CaseId, name: impl Into<String>) -> anyhow::Result<()> {
        let _lease = self.acquire(Scope::Case(id), Access::Update, None)?;
        let name = name.into();
        self.modify_case(id, |c| c.name = name)
    }

    pub fn set_stress(&self, id: CaseId, stress: Option<Stress>) -> anyhow::Result<()> {
        let _lease = self.acquire(Scope::Case(id), Access::Update, None)?;
        self.modify_case(id, |c| c.stress = stress)
    }

    pub fn set_input_text(&self, id: CaseId, text: &str) -> anyhow::Result<()> {
        self.write_owned(id, FileSlot::Input, text)
    }

    pub fn set_answer_text(&self, id: CaseId, text: &str) -> anyhow::Result<()> {
        self.write_owned(id, FileSlot::Answer, text)
    }

    pub fn set_input_file(&self, id: CaseId, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        self.attach_file(id, FileSlot::Input, path.into())
    }

    pub fn set_answer_file(&self, id: CaseId, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        self.attach_file(id, FileSlot::Answer, path.into())
    }

    fn write_owned(&self, id: CaseId, slot: FileSlot, text: &str) -> anyhow::Result<()> {
        let _lease = self.acquire(Scope::Case(id), Access::CompatibleUpdate, None)?;
        let path = self.owned_path(id, slot);
        fsutil::write_with_mkdir(&path, text)?;
        self.replace_file(id, slot, Some(CaseFile::owned(path)))
    }

    fn attach_file(&self, id: CaseId, slot: FileSlot, path: PathBuf) -> anyhow::Result<()> {
        let _lease = self.acquire(Scope::Case(id), Access::CompatibleUpdate, None)?;
        if !path.is_file() {
            bail!("'{}' is not a file", path.to_string_lossy());
        }
        self.replace_file(id, slot, Some(CaseFile::provided(path)))
    }

    /// Swaps a case file; a replaced owned file is deleted.
    fn replace_file(&self, id: CaseId, slot: FileSlot, file: Option<CaseFile>) -> anyhow::Result<()> {
        let new_path = file.as_ref().map(|f| f.path.clone());
        let old = self.modify_case(id, |c| std::mem::replace(slot.of(c), file))?;
        if let Some(old) = old {
            if old.owned && Some(&old.path) != new_path.as_ref() {
                fsutil::remove_file_if_exists(&old.path)?;
            }
        }
        Ok(())
    }

    pub fn set_program(&self, source: impl Into<PathBuf>) {
        self.state().program = Some(source.into());
    }

    pub fn update_run_config(&self, f: impl FnOnce(&mut RunConfig)) {
        f(&mut self.state().run_config);
    }

    pub fn set_checker(&self, checker: Checker) {
        self.update_run_config(|c| c.checker = checker);
    }

    pub fn set_interactor(&self, interactor: Option<PathBuf>) {
        self.update_run_config(|c| c.interactor = interactor);
    }

    /// Cancelling a case that is not running is a no-op; returns whether
    /// anything was cancelled.
    pub fn cancel(&self, id: CaseId) -> bool {
        self.state().slot(id).map_or(false, |s| s.guard.cancel())
    }

    pub fn cancel_all(&self) {
        let st = self.state();
        st.batch.cancel();
        for slot in &st.slots {
            slot.guard.cancel();
        }
    }

    /// Feeds text to the stdin of the case's current run.
    pub fn send_input(&self, id: CaseId, text: &str) -> anyhow::Result<()> {
        let st = self.state();
        let sender = st
            .slot(id)
            .and_then(|s| s.input.as_ref())
            .with_context(|| format!("Test case #{} is not waiting for input", id))?;
        sender
            .send(text.as_bytes().to_vec())
            .ok()
            .with_context(|| format!("Test case #{} stopped reading input", id))
    }

    /// Ends live input; the program sees EOF unless `eof_on_close` is off.
    pub fn close_input(&self, id: CaseId) {
        if let Some(slot) = self.state().slot_mut(id) {
            slot.input = None;
        }
    }

    /// Opens live stdin for the case's next run. Input and a close sent
    /// before that run starts are delivered once it does.
    pub fn open_input(&self, id: CaseId) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.state();
        let slot = st
            .slot_mut(id)
            .with_context(|| format!("Test case #{} does not exist", id))?;
        slot.input = Some(tx);
        slot.queued = Some(rx);
        Ok(())
    }

    /// The receiver opened by `open_input`, or a fresh channel.
    fn take_input(&self, id: CaseId) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        let mut st = self.state();
        let slot = st.slot_mut(id)?;
        if let Some(rx) = slot.queued.take() {
            return Some(rx);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        slot.input = Some(tx);
        Some(rx)
    }

    fn end_input(&self, id: CaseId) {
        if let Some(slot) = self.state().slot_mut(id) {
            slot.input = None;
            slot.queued = None;
        }
    }

    fn update_run_state(&self, f: impl FnOnce(&mut RunState)) {
        let state = {
            let mut st = self.state();
            f(&mut st.run_state);
            st.run_state.clone()
        };
        self.emit(Event::RunState { state });
    }
}

use std::{
    collections::HashMap,
    io::{BufRead, Write as _},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context as _;
use colored::Colorize as _;
use cprun_core::{
    compile::CacheLedger,
    event::{Channel, Event},
    runner::Captured,
    scheduler::Scheduler,
    testing::CaseId,
    testset::TestSetRecord,
    Config,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{cmd::GlobalArgs, util};

/// Final captured output of one run, as reported by the engine.
#[derive(Debug, Clone, Default)]
pub struct Ready {
    pub stdout: Captured,
    pub stderr: Captured,
    pub judge: String,
}

/// A loaded project: config, scheduler and where its state is persisted.
pub struct Session {
    pub cfg: Config,
    pub scheduler: Scheduler,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    record_path: PathBuf,
    ledger_path: PathBuf,
}

impl Session {
    pub async fn open(global: &GlobalArgs) -> anyhow::Result<Self> {
        let mut cfg = Config::from_file_finding_in_ancestors(util::current_dir())?;
        if let Some(dir) = &global.build_dir {
            cfg.engine.build_dir = Some(util::absolute(dir));
        }

        let (scheduler, events) = Scheduler::from_config(&cfg);
        let ledger_path = scheduler.compiler().build_dir().join(CacheLedger::FILENAME);
        scheduler
            .compiler()
            .restore(CacheLedger::load_or_default(&ledger_path));

        let record_path = cfg
            .project_dir()
            .join(".cprun")
            .join(TestSetRecord::FILENAME);
        let mut record = TestSetRecord::load_or_default(&record_path);
        if record.updated_at.is_none() {
            // never saved: start from the [run] section
            record.run_config = cfg.run.clone();
        }
        scheduler.replace_test_set(record).await;

        let mut session = Self {
            cfg,
            scheduler,
            events: Some(events),
            record_path,
            ledger_path,
        };
        session.discard_events();
        Ok(session)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.scheduler
            .snapshot()
            .save(&self.record_path)
            .context("Failed to save the test set")?;
        self.scheduler
            .compiler()
            .ledger()
            .save(&self.ledger_path)
            .context("Failed to save the compile cache ledger")?;
        log::debug!(
            "Saved test set to {:?}",
            util::replace_homedir_to_tilde(&self.record_path)
        );
        Ok(())
    }

    fn discard_events(&mut self) {
        if let Some(rx) = self.events.as_mut() {
            while rx.try_recv().is_ok() {}
        }
    }

    /// Cancels every in-flight operation on Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted; cancelling");
                scheduler.cancel_all();
            }
        });
    }

    /// Forwards terminal lines to the live stdin of `id`'s next run; EOF
    /// closes it. Lines read before the run starts are kept for it.
    pub fn forward_stdin(&self, id: CaseId) -> anyhow::Result<()> {
        self.scheduler.open_input(id)?;
        let scheduler = self.scheduler.clone();
        // a plain thread: a blocked stdin read must not hold the runtime open
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if let Err(e) = scheduler.send_input(id, &format!("{}\n", line)) {
                    log::debug!("{:#}", e);
                }
            }
            scheduler.close_input(id);
        });
        Ok(())
    }

    /// Starts printing engine events. `echo` streams program output to the
    /// terminal. Only the first console of a session sees events.
    pub fn console(&mut self, echo: bool) -> Console {
        Console::start(self.events.take(), echo)
    }
}

/// Background printer of engine events.
pub struct Console {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Collected>,
}

pub struct Collected {
    pub ready: HashMap<CaseId, Ready>,
}

impl Console {
    fn start(rx: Option<mpsc::UnboundedReceiver<Event>>, echo: bool) -> Self {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(pump(rx, stopped, echo));
        Self { stop, handle }
    }

    /// Stops printing after the queued events and returns what was collected.
    pub async fn finish(self) -> Collected {
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(collected) => collected,
            Err(e) => {
                log::warn!("Event printer failed: {}", e);
                Collected {
                    ready: HashMap::new(),
                }
            }
        }
    }
}

async fn pump(
    rx: Option<mpsc::UnboundedReceiver<Event>>,
    mut stopped: oneshot::Receiver<()>,
    echo: bool,
) -> Collected {
    let mut printer = Printer {
        echo,
        bar: None,
        ready: HashMap::new(),
    };
    let Some(mut rx) = rx else {
        return printer.collected();
    };
    loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => printer.handle(event),
            _ = &mut stopped => {
                while let Ok(event) = rx.try_recv() {
                    printer.handle(event);
                }
                break;
            }
        }
    }
    printer.collected()
}

struct Printer {
    echo: bool,
    bar: Option<ProgressBar>,
    ready: HashMap<CaseId, Ready>,
}

impl Printer {
    fn handle(&mut self, event: Event) {
        match event {
            Event::Output { channel, data, .. } if self.echo => match channel {
                Channel::Stdout | Channel::Interaction => {
                    print!("{}", data);
                    let _ = std::io::stdout().flush();
                }
                Channel::Stderr => eprint!("{}", data.dimmed()),
                Channel::Judge => eprint!("{}", data.cyan()),
                // the terminal already echoes what the user typed
                Channel::Input => {}
            },
            Event::RunState { state } if state.running => {
                let bar = self.bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(state.total as u64).with_style(
                        ProgressStyle::default_bar()
                            .template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                            .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    bar.enable_steady_tick(Duration::from_millis(80));
                    bar
                });
                bar.set_length(state.total as u64);
                bar.set_position(state.done as u64);
            }
            Event::RunState { .. } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_and_clear();
                }
            }
            Event::CaseChanged { case } => {
                let status = case.stress.as_ref().and_then(|s| s.status);
                if let Some(status) = status {
                    let bar = self.bar.get_or_insert_with(|| {
                        let bar = ProgressBar::new_spinner();
                        bar.enable_steady_tick(Duration::from_millis(80));
                        bar
                    });
                    bar.set_message(format!(
                        "Stress {}: {}/{} iteration(s), {:.1}s",
                        case.label(),
                        status.current,
                        status.total,
                        status.elapsed_ms as f64 / 1000.0,
                    ));
                }
            }
            Event::OutputReady {
                id,
                stdout,
                stderr,
                judge,
            } => {
                self.ready.insert(
                    id,
                    Ready {
                        stdout,
                        stderr,
                        judge,
                    },
                );
            }
            Event::Notice { message } => log::debug!("notice: {}", message),
            _ => {}
        }
    }

    fn collected(self) -> Collected {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
        Collected { ready: self.ready }
    }
}

/// Reads the file if it is small enough to show.
pub fn read_answer(path: Option<&std::path::Path>) -> Option<String> {
    const MAX: u64 = 64 * 1024;
    let path = path?;
    let len = std::fs::metadata(path).ok()?.len();
    if len > MAX {
        return Some(format!("<{} bytes>", len));
    }
    fsutil::read_to_string(path).ok()
}

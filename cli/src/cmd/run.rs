use anyhow::{ensure, Context as _};
use cprun_core::{
    scheduler::RunMode,
    style::{self, Detail},
    testing::{CaseId, TestResult},
};

use super::{GlobalArgs, SubcmdResult};
use crate::session::{self, Collected, Session};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Runs only this test case; all of them if omitted.
    pub id: Option<CaseId>,

    /// Debug build, paused until the configured debugger has attached.
    #[arg(short, long)]
    pub debug: bool,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let mut session = Session::open(global_args).await?;
    session.cancel_on_ctrl_c();

    match args.id {
        Some(id) => {
            let mode = if args.debug {
                RunMode::Debug
            } else {
                RunMode::Normal
            };
            run_one(&mut session, id, mode).await
        }
        None => {
            ensure!(!args.debug, "--debug needs a test case id");
            run_all(&mut session).await
        }
    }
}

async fn run_one(session: &mut Session, id: CaseId, mode: RunMode) -> SubcmdResult {
    let case = session
        .scheduler
        .case(id)
        .with_context(|| format!("Test case #{} does not exist", id))?;

    let live = case.input.is_none();
    let console = session.console(live);
    if live {
        log::info!("No input file; reading stdin from the terminal (Ctrl-D ends it)");
        session.forward_stdin(id)?;
    }
    let res = session.scheduler.run_case(id, mode).await;
    let collected = console.finish().await;
    session.save()?;

    match res? {
        Some(result) => print_detail(session, id, &result, &collected),
        None => println!("Cancelled"),
    }
    Ok(())
}

async fn run_all(session: &mut Session) -> SubcmdResult {
    let console = session.console(false);
    let res = session.scheduler.run_all().await;
    let collected = console.finish().await;
    session.save()?;

    let Some(result) = res? else {
        println!("Cancelled");
        return Ok(());
    };

    let cases = session.scheduler.cases();
    for case in &cases {
        if let Some(r) = case.result.as_ref().filter(|r| !r.verdict.is_accepted()) {
            print_detail(session, case.id, r, &collected);
        }
    }
    println!();
    cases.iter().for_each(style::print_case_line);

    let results: Vec<TestResult> = cases.iter().filter_map(|c| c.result.clone()).collect();
    style::print_test_result_summary(&results);
    println!("{} {}", style::verdict_icon(result.verdict), style::usage_label(&result));
    Ok(())
}

pub fn print_detail(session: &Session, id: CaseId, result: &TestResult, collected: &Collected) {
    let Some(case) = session.scheduler.case(id) else {
        return;
    };
    let ready = collected.ready.get(&id).cloned().unwrap_or_default();
    let answer = session::read_answer(case.answer_path());
    style::print_test_result_detail(&Detail {
        title: &case.label(),
        result,
        answer: answer.as_deref(),
        stdout: &ready.stdout,
        stderr: &ready.stderr,
        judge: &ready.judge,
    });
}

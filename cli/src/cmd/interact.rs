use cprun_core::{
    scheduler::RunMode,
    style,
    testing::CaseId,
};

use super::{GlobalArgs, SubcmdResult};
use crate::session::Session;

/// Runs the interactor alone; you answer it from the terminal.
#[derive(Debug, clap::Args)]
pub struct Args {
    pub id: CaseId,

    /// Pause the interactor until the debugger has attached.
    #[arg(short, long)]
    pub debug: bool,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let mut session = Session::open(global_args).await?;
    session.cancel_on_ctrl_c();
    let mode = if args.debug {
        RunMode::Debug
    } else {
        RunMode::Normal
    };

    let console = session.console(true);
    session.forward_stdin(args.id)?;
    let res = session.scheduler.run_interactor(args.id, mode).await;
    let collected = console.finish().await;
    session.save()?;

    match res? {
        Some(result) => {
            println!("\n{} {}", style::verdict_icon(result.verdict), style::usage_label(&result));
            if let Some(ready) = collected.ready.get(&args.id) {
                if !ready.judge.is_empty() {
                    println!("{}", ready.judge.trim_end());
                }
            }
        }
        None => println!("Cancelled"),
    }
    Ok(())
}

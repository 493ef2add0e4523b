use cprun_core::{print_success, testing::CaseId};

use super::{GlobalArgs, SubcmdResult};
use crate::session::Session;

/// Runs the case's stress generator once and makes its output the input.
#[derive(Debug, clap::Args)]
pub struct Args {
    pub id: CaseId,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let mut session = Session::open(global_args).await?;
    session.cancel_on_ctrl_c();

    let console = session.console(false);
    let res = session.scheduler.run_generator(args.id).await;
    let _ = console.finish().await;
    session.save()?;

    match res? {
        Some(r) if r.verdict.is_accepted() => {
            print_success!("Generated the input of test case #{}", args.id);
        }
        Some(r) => log::error!("Generator finished with {}", r.verdict.description()),
        None => println!("Cancelled"),
    }
    Ok(())
}

use cprun_core::{print_success, testing::CaseId};

use super::{GlobalArgs, SubcmdResult};
use crate::session::Session;

#[derive(Debug, clap::Args)]
pub struct Args {
    #[arg(required = true)]
    pub ids: Vec<CaseId>,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let session = Session::open(global_args).await?;
    for &id in &args.ids {
        session.scheduler.remove_case(id)?;
        print_success!("Removed test case #{}", id);
    }
    session.save()
}

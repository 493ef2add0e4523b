use cprun_core::testing::CaseId;

use super::{GlobalArgs, SubcmdResult};
use crate::session::Session;

#[derive(Debug, clap::Args)]
pub struct Args {
    pub id: CaseId,
    pub name: String,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let session = Session::open(global_args).await?;
    session.scheduler.rename_case(args.id, &args.name)?;
    session.save()
}

use std::path::PathBuf;

use cprun_core::print_success;

use super::{GlobalArgs, SubcmdResult};
use crate::{session::Session, util};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Input file; it stays where it is and is never deleted by cprun.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Expected output file.
    #[arg(short, long)]
    pub answer: Option<PathBuf>,

    #[arg(short, long)]
    pub name: Option<String>,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let session = Session::open(global_args).await?;
    let scheduler = &session.scheduler;

    let id = scheduler.add_case(args.name.clone());
    if let Some(input) = &args.input {
        scheduler.set_input_file(id, util::absolute(input))?;
    }
    if let Some(answer) = &args.answer {
        scheduler.set_answer_file(id, util::absolute(answer))?;
    }
    session.save()?;

    print_success!("Added test case #{}", id);
    Ok(())
}

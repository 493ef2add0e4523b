use std::path::PathBuf;

use anyhow::ensure;
use cprun_core::print_success;

use super::{GlobalArgs, SubcmdResult};
use crate::{session::Session, util};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Source file of the program to test.
    pub file: PathBuf,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let session = Session::open(global_args).await?;
    let file = util::absolute(&args.file);
    ensure!(file.is_file(), "No such file: {:?}", file);
    ensure!(
        session.cfg.find_toolchain(&file).is_some(),
        "No [[toolchain]] in cprun.toml matches {:?}",
        file
    );

    session.scheduler.set_program(&file);
    session.save()?;
    print_success!("Program set to {}", file.to_string_lossy());
    Ok(())
}

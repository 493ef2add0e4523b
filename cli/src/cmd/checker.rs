use std::path::PathBuf;

use cprun_core::{checker::Checker, print_success};

use super::{GlobalArgs, SubcmdResult};
use crate::{session::Session, util};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// `tokens`, `exact`, or the source file of a checker program.
    pub checker: String,

    /// Source of an interactor; `none` removes it.
    #[arg(long)]
    pub interactor: Option<String>,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let session = Session::open(global_args).await?;
    let checker = match args.checker.as_str() {
        "tokens" => Checker::Tokens,
        "exact" => Checker::Exact,
        path => Checker::External(util::absolute(&PathBuf::from(path))),
    };
    session.scheduler.set_checker(checker.clone());

    if let Some(interactor) = &args.interactor {
        let interactor = match interactor.as_str() {
            "none" => None,
            path => Some(util::absolute(&PathBuf::from(path))),
        };
        session.scheduler.set_interactor(interactor);
    }
    session.save()?;
    print_success!("Checker set to {:?}", checker);
    Ok(())
}

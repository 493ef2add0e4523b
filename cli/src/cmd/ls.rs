use colored::Colorize as _;
use cprun_core::style;

use super::{GlobalArgs, SubcmdResult};
use crate::{session::Session, util};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Also print input and answer paths.
    #[arg(short, long)]
    pub long: bool,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let session = Session::open(global_args).await?;
    let scheduler = &session.scheduler;

    match scheduler.program() {
        Some(p) => println!("program: {}", util::replace_homedir_to_tilde(p).to_string_lossy()),
        None => println!("program: {}", "<unset>".dimmed()),
    }
    let cases = scheduler.cases();
    if cases.is_empty() {
        println!("{}", "No test cases".dimmed());
        return Ok(());
    }
    for case in &cases {
        style::print_case_line(case);
        if args.long {
            let show = |label: &str, path: Option<&std::path::Path>| {
                if let Some(p) = path {
                    println!("      {} {}", label.dimmed(), util::replace_homedir_to_tilde(p).to_string_lossy());
                }
            };
            show("in: ", case.input_path());
            show("ans:", case.answer_path());
        }
    }
    Ok(())
}

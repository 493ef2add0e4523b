use cprun_core::print_success;

use super::{GlobalArgs, SubcmdResult};
use crate::{session::Session, util};

#[derive(Debug, clap::Args)]
pub struct Args {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, clap::Subcommand)]
pub enum Action {
    /// Deletes every cached artifact.
    Clear,
    /// Prints the build directory and the number of cached artifacts.
    Info,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let session = Session::open(global_args).await?;
    let compiler = session.scheduler.compiler();
    match args.action {
        Action::Clear => {
            let n = compiler.cached_count();
            compiler.clear_cache();
            session.save()?;
            print_success!("Removed {} cached artifact(s)", n);
        }
        Action::Info => {
            println!(
                "{} ({} artifact(s))",
                util::replace_homedir_to_tilde(compiler.build_dir()).to_string_lossy(),
                compiler.cached_count()
            );
        }
    }
    Ok(())
}

pub mod add;
pub mod cache;
pub mod checker;
pub mod gen;
pub mod init;
pub mod interact;
pub mod ls;
pub mod program;
pub mod rename;
pub mod rm;
pub mod run;
pub mod stress;

use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct GlobalArgs {
    #[command(subcommand)]
    pub subcmd: Subcommand,

    /// Overrides `engine.build_dir` of cprun.toml.
    #[arg(long)]
    pub build_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Init(init::Args),
    Add(add::Args),
    Rm(rm::Args),
    Rename(rename::Args),
    Ls(ls::Args),
    Program(program::Args),
    Checker(checker::Args),

    #[command(alias("r"))]
    Run(run::Args),

    Stress(stress::Args),
    Gen(gen::Args),
    Interact(interact::Args),
    Cache(cache::Args),
}

pub type SubcmdResult = anyhow::Result<()>;

impl GlobalArgs {
    pub async fn exec_subcmd(&self) -> SubcmdResult {
        use Subcommand::*;
        match &self.subcmd {
            Init(args) => init::exec(args, self),
            Add(args) => add::exec(args, self).await,
            Rm(args) => rm::exec(args, self).await,
            Rename(args) => rename::exec(args, self).await,
            Ls(args) => ls::exec(args, self).await,
            Program(args) => program::exec(args, self).await,
            Checker(args) => checker::exec(args, self).await,
            Run(args) => run::exec(args, self).await,
            Stress(args) => stress::exec(args, self).await,
            Gen(args) => gen::exec(args, self).await,
            Interact(args) => interact::exec(args, self).await,
            Cache(args) => cache::exec(args, self).await,
        }
    }
}

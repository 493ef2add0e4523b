use std::path::PathBuf;

use anyhow::Context as _;
use cprun_core::{
    print_success,
    testing::{CaseId, Stress},
};

use super::{run::print_detail, GlobalArgs, SubcmdResult};
use crate::{session::Session, util};

#[derive(Debug, clap::Args)]
pub struct Args {
    pub id: CaseId,

    /// Source of the input generator.
    #[arg(short, long)]
    pub generator: Option<PathBuf>,

    /// Source of the reference solution.
    #[arg(short, long)]
    pub brute: Option<PathBuf>,

    /// Number of iterations.
    #[arg(short = 'n', long)]
    pub count: Option<u32>,

    /// Generator arguments; `#{index}` and `#{seed}` are substituted.
    #[arg(long)]
    pub args: Option<String>,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let mut session = Session::open(global_args).await?;
    let id = args.id;
    let current = session
        .scheduler
        .case(id)
        .with_context(|| format!("Test case #{} does not exist", id))?
        .stress;

    let stress = merge(current, args)?;
    session.scheduler.set_stress(id, Some(stress))?;
    session.save()?;

    session.cancel_on_ctrl_c();
    let console = session.console(false);
    let res = session.scheduler.stress(id).await;
    let collected = console.finish().await;
    session.save()?;

    match res? {
        Some(result) if result.verdict.is_accepted() => {
            let judge = collected.ready.get(&id).map(|r| r.judge.clone()).unwrap_or_default();
            print_success!("Stress test passed: {}", judge);
        }
        Some(result) => print_detail(&session, id, &result, &collected),
        None => println!("Cancelled"),
    }
    Ok(())
}

fn merge(current: Option<Stress>, args: &Args) -> anyhow::Result<Stress> {
    let mut stress = match (current, &args.generator, &args.brute) {
        (_, Some(g), Some(b)) => Stress::new(util::absolute(g), util::absolute(b), 100),
        (Some(s), _, _) => s,
        (None, _, _) => anyhow::bail!("First stress run of a case needs --generator and --brute"),
    };
    if let Some(g) = &args.generator {
        stress.generator = util::absolute(g);
    }
    if let Some(b) = &args.brute {
        stress.brute = util::absolute(b);
    }
    if let Some(n) = args.count {
        stress.count = n;
    }
    if let Some(template) = &args.args {
        stress.args = template.clone();
    }
    stress.status = None;
    Ok(stress)
}

use std::path::PathBuf;

use anyhow::bail;
use cprun_core::{print_success, Config};

use super::{GlobalArgs, SubcmdResult};

#[derive(Debug, clap::Args)]
pub struct Args {
    #[arg(default_value = "./")]
    dir: PathBuf,
}

pub fn exec(args: &Args, _: &GlobalArgs) -> SubcmdResult {
    let path = args.dir.join(Config::FILENAME);
    if path.exists() {
        bail!("Already initialized: {:?} exists", path);
    }
    fsutil::write_with_mkdir(&path, Config::example_toml())?;
    print_success!(
        "Successfully initialized cprun project. (config: {})",
        path.to_string_lossy()
    );
    Ok(())
}

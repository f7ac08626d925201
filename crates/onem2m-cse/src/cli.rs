use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(about = "A oneM2M CSE middleware core", author = env!("CARGO_PKG_AUTHORS"), version = env!("CARGO_PKG_VERSION"))]
pub struct CliArgs {
    #[arg(
        short,
        long,
        help = "Use the <directory> as the CSE's working directory",
        required = false
    )]
    pub work_dir: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Use the <file name> as the location of the config file",
        required = false
    )]
    pub config: Option<PathBuf>,
}

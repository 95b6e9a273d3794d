use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = survey_kernel_cli::Cli::parse();
    survey_kernel_service::init_tracing(cli.log_level())?;
    survey_kernel_cli::run_cli(cli)
}

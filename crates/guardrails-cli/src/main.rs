use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = guardrails_cli::Cli::parse();
    guardrails_cli::init_tracing(cli.verbose());
    guardrails_cli::run_cli(cli)
}

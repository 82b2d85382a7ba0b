use clap::Parser;
use drive_audit_provisioner::cli;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    cli.run()
}

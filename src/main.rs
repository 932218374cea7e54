use clap::{Parser, Subcommand};
use log::LevelFilter;

mod activities;
mod cmd;
mod pipeline;
mod rates;
mod securities;
mod tax;

#[derive(Parser, Debug)]
#[command(name = "napstocks", version)]
#[command(about = "Calculate NAP capital gains and dividend declarations from brokerage statements")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full calculation and write the declaration csv files
    Report(cmd::report::ReportCommand),
    /// Validate and normalize a historical rates file
    Rates(cmd::rates::RatesCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .init();

    match &cli.command {
        Command::Report(cmd) => cmd.exec(),
        Command::Rates(cmd) => cmd.exec(),
    }
}

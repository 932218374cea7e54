use crate::rates::Fallback;
use clap::Args;
use std::io;
use std::path::PathBuf;

/// Validate a historical rates file and echo it back to stdout with
/// duplicate fixings collapsed
#[derive(Args, Debug)]
pub struct RatesCommand {
    /// Exchange rates csv (currency,date,rate)
    #[arg(short, long)]
    rates: PathBuf,
}

impl RatesCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let rates = super::load_rates(&self.rates, Fallback::None)?;
        rates.write_csv(io::stdout())
    }
}

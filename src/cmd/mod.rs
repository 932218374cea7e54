pub mod rates;
pub mod report;

use crate::rates::{ExchangeRates, Fallback};
use crate::securities::SecurityRegistry;
use anyhow::Context;
use std::fs::File;
use std::path::Path;

/// Populate the exchange rate table from a cached fixings file, once,
/// before any calculation runs
pub fn load_rates(path: &Path, fallback: Fallback) -> anyhow::Result<ExchangeRates> {
    let file =
        File::open(path).with_context(|| format!("opening rates file {}", path.display()))?;
    ExchangeRates::read_csv(file, fallback)
        .with_context(|| format!("parsing rates file {}", path.display()))
}

/// Load issuer-country metadata; an absent file just means no countries in
/// the dividend output
pub fn load_securities(path: Option<&Path>) -> anyhow::Result<SecurityRegistry> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("opening securities file {}", path.display()))?;
            SecurityRegistry::read_csv(file)
                .with_context(|| format!("parsing securities file {}", path.display()))
        }
        None => Ok(SecurityRegistry::default()),
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

/// Metadata for one security, supplied externally (the statements themselves
/// do not carry issuer information)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub symbol: String,
    /// ISO country code of the issuer, used for grouping dividend income
    pub country: String,
}

/// Registry of security metadata keyed by symbol
#[derive(Debug, Clone, Default)]
pub struct SecurityRegistry {
    securities: HashMap<String, SecurityInfo>,
}

impl SecurityRegistry {
    pub fn insert(&mut self, info: SecurityInfo) {
        self.securities.insert(info.symbol.clone(), info);
    }

    pub fn country(&self, symbol: &str) -> Option<&str> {
        self.securities.get(symbol).map(|info| info.country.as_str())
    }

    pub fn read_csv<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut registry = SecurityRegistry::default();
        for info in rdr.deserialize::<SecurityInfo>() {
            registry.insert(info?);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_symbol() {
        let csv_data = "symbol,country\nAAPL,US\nNOKIA,FI";
        let registry = SecurityRegistry::read_csv(csv_data.as_bytes()).unwrap();
        assert_eq!(registry.country("AAPL"), Some("US"));
        assert_eq!(registry.country("NOKIA"), Some("FI"));
        assert_eq!(registry.country("TSLA"), None);
    }
}

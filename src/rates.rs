use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

/// The reporting currency all declaration figures are expressed in
pub const REPORTING_CURRENCY: &str = "BGN";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateError {
    #[error("no {currency}/BGN rate on or before {date}")]
    RateNotFound { currency: String, date: NaiveDate },
    #[error("non-positive {currency}/BGN rate {rate} on {date}")]
    InvalidRate {
        currency: String,
        date: NaiveDate,
        rate: Decimal,
    },
}

/// How to resolve a lookup date with no published fixing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    /// Exact date only
    #[default]
    None,
    /// Nearest preceding fixing, at most this many days back. The central
    /// bank publishes no weekend or holiday fixings, so statement dates
    /// routinely fall in gaps.
    PrecedingDays(u32),
}

/// Historical exchange rates to the reporting currency, keyed by
/// (currency, date). Populated once per run; pure lookup afterwards.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRates {
    rates: HashMap<String, BTreeMap<NaiveDate, Decimal>>,
    fallback: Fallback,
}

/// CSV row format for cached fixings
#[derive(Debug, Serialize, Deserialize)]
struct RateRow {
    currency: String,
    date: NaiveDate,
    rate: Decimal,
}

impl ExchangeRates {
    pub fn new(fallback: Fallback) -> Self {
        ExchangeRates {
            rates: HashMap::new(),
            fallback,
        }
    }

    pub fn insert(
        &mut self,
        currency: &str,
        date: NaiveDate,
        rate: Decimal,
    ) -> Result<(), RateError> {
        if rate <= Decimal::ZERO {
            return Err(RateError::InvalidRate {
                currency: currency.to_string(),
                date,
                rate,
            });
        }
        self.rates
            .entry(currency.to_string())
            .or_default()
            .insert(date, rate);
        Ok(())
    }

    /// Rate converting one unit of `currency` to the reporting currency on
    /// `date`. Resolves the exact date, or the nearest preceding fixing
    /// within the configured fallback window. Never substitutes another
    /// currency's rate.
    pub fn rate(&self, currency: &str, date: NaiveDate) -> Result<Decimal, RateError> {
        if currency == REPORTING_CURRENCY {
            return Ok(Decimal::ONE);
        }
        let not_found = || RateError::RateNotFound {
            currency: currency.to_string(),
            date,
        };
        let by_date = self.rates.get(currency).ok_or_else(not_found)?;
        let (fixing_date, rate) = by_date.range(..=date).next_back().ok_or_else(not_found)?;
        let max_gap = match self.fallback {
            Fallback::None => Duration::zero(),
            Fallback::PrecedingDays(days) => Duration::days(i64::from(days)),
        };
        if date - *fixing_date > max_gap {
            return Err(not_found());
        }
        if *fixing_date != date {
            log::debug!(
                "no {}/{} fixing on {}, using preceding fixing from {}",
                currency,
                REPORTING_CURRENCY,
                date,
                fixing_date
            );
        }
        Ok(*rate)
    }

    pub fn read_csv<R: Read>(reader: R, fallback: Fallback) -> anyhow::Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut rates = ExchangeRates::new(fallback);
        for row in rdr.deserialize::<RateRow>() {
            let row = row?;
            rates.insert(&row.currency, row.date, row.rate)?;
        }
        Ok(rates)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for (currency, by_date) in &self.rates {
            for (date, rate) in by_date {
                wtr.serialize(RateRow {
                    currency: currency.clone(),
                    date: *date,
                    rate: *rate,
                })?;
            }
        }
        wtr.flush()?;
        Ok(())
    }
}

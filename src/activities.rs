use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Type of brokerage activity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Buy,
    Sell,
    Dividend,
    /// Withholding tax deducted at source from a dividend payment
    DividendTax,
    Fee,
    /// Anything the calculator does not understand; keeps the raw statement
    /// token so the guard can report it
    Other(String),
}

impl ActivityType {
    pub fn parse(s: &str) -> Self {
        match s {
            "BUY" => ActivityType::Buy,
            "SELL" => ActivityType::Sell,
            "DIV" => ActivityType::Dividend,
            "DIVNRA" => ActivityType::DividendTax,
            "FEE" => ActivityType::Fee,
            other => ActivityType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActivityType::Buy => "BUY",
            ActivityType::Sell => "SELL",
            ActivityType::Dividend => "DIV",
            ActivityType::DividendTax => "DIVNRA",
            ActivityType::Fee => "FEE",
            ActivityType::Other(raw) => raw,
        }
    }

    /// Types the sale matching engine and dividend aggregator understand.
    /// Anything else downgrades the run to dividends-only output.
    pub fn is_supported(&self) -> bool {
        !matches!(self, ActivityType::Other(_))
    }

    pub fn is_dividend_related(&self) -> bool {
        matches!(self, ActivityType::Dividend | ActivityType::DividendTax)
    }
}

/// One line of brokerage history, already parsed from a statement file.
/// Read-only to the calculation core.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub activity_type: ActivityType,
    /// Security identifier (ticker)
    pub symbol: String,
    pub trade_date: NaiveDate,
    /// Signed: positive for buys/credits, negative for sells/debits
    pub quantity: Decimal,
    /// Price per unit in `currency`
    pub price: Decimal,
    pub currency: String,
    /// Gross cash amount, present on dividend-type rows
    pub amount: Option<Decimal>,
}

/// CSV row format for activities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRow {
    pub date: String,
    pub activity_type: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ActivityParseError {
    #[error("invalid trade date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
}

impl TryFrom<ActivityRow> for Activity {
    type Error = ActivityParseError;

    fn try_from(row: ActivityRow) -> Result<Self, Self::Error> {
        let trade_date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d")
            .map_err(|_| ActivityParseError::InvalidDate(row.date.clone()))?;
        Ok(Activity {
            activity_type: ActivityType::parse(&row.activity_type),
            symbol: row.symbol,
            trade_date,
            quantity: row.quantity,
            price: row.price,
            currency: row.currency,
            amount: row.amount,
        })
    }
}

impl From<&Activity> for ActivityRow {
    fn from(activity: &Activity) -> Self {
        ActivityRow {
            date: activity.trade_date.format("%Y-%m-%d").to_string(),
            activity_type: activity.activity_type.as_str().to_string(),
            symbol: activity.symbol.clone(),
            quantity: activity.quantity,
            price: activity.price,
            currency: activity.currency.clone(),
            amount: activity.amount,
        }
    }
}

/// Read activities from CSV, sorted by trade date.
///
/// The sort is stable, so rows on the same date keep their file order —
/// the ordering contract the matching engine relies on.
pub fn read_csv<R: Read>(reader: R) -> anyhow::Result<Vec<Activity>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let rows: Result<Vec<ActivityRow>, _> = rdr.deserialize::<ActivityRow>().collect();
    let mut activities = rows?
        .into_iter()
        .map(Activity::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    activities.sort_by_key(|a| a.trade_date);
    Ok(activities)
}

/// Write activities to CSV (the merged `statements.csv` verification file)
pub fn write_csv<W: Write>(activities: &[Activity], writer: W) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for activity in activities {
        let row: ActivityRow = activity.into();
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

use crate::activities::{Activity, ActivityType};
use crate::rates::{ExchangeRates, RateError};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CalculationError {
    /// Malformed record; signals a parsing defect upstream
    #[error("invalid {activity_type} activity for {symbol} on {date}: {reason}")]
    InvalidActivity {
        activity_type: String,
        symbol: String,
        date: NaiveDate,
        reason: String,
    },
    /// A sell exceeds the units held; a missing buy record or an unhandled
    /// corporate action, never silently clamped
    #[error("sell of {requested} {symbol} on {date} exceeds open lots ({available} held)")]
    InsufficientLots {
        symbol: String,
        date: NaiveDate,
        requested: Decimal,
        available: Decimal,
    },
    #[error(transparent)]
    Rate(#[from] RateError),
}

/// An open acquisition, created by a BUY and consumed FIFO by sells
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub symbol: String,
    pub acquired: NaiveDate,
    /// Units still unsold; > 0 while the lot is open
    pub remaining: Decimal,
    pub unit_cost: Decimal,
    pub currency: String,
}

/// Units taken from one lot while matching a sell
#[derive(Debug, Clone, PartialEq)]
pub struct LotPortion {
    pub acquired: NaiveDate,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub currency: String,
}

/// Per-security FIFO queues of open lots.
///
/// Invariant: the open quantity of a symbol always equals units bought minus
/// units sold so far, and never goes negative.
#[derive(Debug, Default)]
pub struct LotLedger {
    lots: HashMap<String, VecDeque<Lot>>,
}

impl LotLedger {
    /// Record an acquisition. Called for every BUY in trade-date order.
    pub fn open(
        &mut self,
        symbol: &str,
        acquired: NaiveDate,
        quantity: Decimal,
        unit_cost: Decimal,
        currency: &str,
    ) {
        log::debug!(
            "ledger {} OPEN: {} @ {} {} on {}",
            symbol,
            quantity,
            unit_cost,
            currency,
            acquired
        );
        self.lots.entry(symbol.to_string()).or_default().push_back(Lot {
            symbol: symbol.to_string(),
            acquired,
            remaining: quantity,
            unit_cost,
            currency: currency.to_string(),
        });
    }

    /// Remove `quantity` units from the front of the queue, oldest lot
    /// first. The front lot is split when it holds more than needed; emptied
    /// lots are closed. `sale_date` is error context only.
    pub fn consume(
        &mut self,
        symbol: &str,
        sale_date: NaiveDate,
        quantity: Decimal,
    ) -> Result<Vec<LotPortion>, CalculationError> {
        let available = self.open_quantity(symbol);
        if quantity > available {
            return Err(CalculationError::InsufficientLots {
                symbol: symbol.to_string(),
                date: sale_date,
                requested: quantity,
                available,
            });
        }

        let queue = self.lots.entry(symbol.to_string()).or_default();
        let mut portions = Vec::new();
        let mut outstanding = quantity;
        while outstanding > Decimal::ZERO {
            // guarded by the availability check above
            let lot = queue.front_mut().expect("open lots cover the sell");
            let taken = outstanding.min(lot.remaining);
            portions.push(LotPortion {
                acquired: lot.acquired,
                quantity: taken,
                unit_cost: lot.unit_cost,
                currency: lot.currency.clone(),
            });
            lot.remaining -= taken;
            outstanding -= taken;
            log::debug!(
                "ledger {} CONSUME: {} from lot of {}, {} left in lot",
                lot.symbol,
                taken,
                lot.acquired,
                lot.remaining
            );
            if lot.remaining.is_zero() {
                queue.pop_front();
            }
        }
        Ok(portions)
    }

    /// Total units still open for a symbol
    pub fn open_quantity(&self, symbol: &str) -> Decimal {
        self.lots
            .get(symbol)
            .map(|queue| queue.iter().map(|lot| lot.remaining).sum())
            .unwrap_or(Decimal::ZERO)
    }
}

/// One lot's contribution to a sale's cost basis, kept for audit
#[derive(Debug, Clone, PartialEq)]
pub struct LotContribution {
    pub acquired: NaiveDate,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub currency: String,
    /// Cost in reporting currency at the acquisition-date rate
    pub cost_bgn: Decimal,
}

/// Outcome of matching one SELL against the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct SaleMatchRecord {
    pub symbol: String,
    pub sale_date: NaiveDate,
    pub quantity: Decimal,
    pub proceeds_bgn: Decimal,
    pub cost_basis_bgn: Decimal,
    /// proceeds − cost basis
    pub gain_bgn: Decimal,
    pub contributions: Vec<LotContribution>,
}

/// CSV row for the capital gains output file
#[derive(Debug, Serialize, Deserialize)]
pub struct SaleRow {
    pub date: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub proceeds_bgn: Decimal,
    pub cost_basis_bgn: Decimal,
    pub gain_bgn: Decimal,
}

impl From<&SaleMatchRecord> for SaleRow {
    fn from(sale: &SaleMatchRecord) -> Self {
        SaleRow {
            date: sale.sale_date.format("%Y-%m-%d").to_string(),
            symbol: sale.symbol.clone(),
            quantity: sale.quantity,
            proceeds_bgn: sale.proceeds_bgn.round_dp(2),
            cost_basis_bgn: sale.cost_basis_bgn.round_dp(2),
            gain_bgn: sale.gain_bgn.round_dp(2),
        }
    }
}

/// CSV row for the per-lot breakdown of each sale
#[derive(Debug, Serialize, Deserialize)]
pub struct SaleLotRow {
    pub sale_date: String,
    pub symbol: String,
    pub acquired: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub currency: String,
    pub cost_bgn: Decimal,
}

/// Realized gains of one logical data source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SalesReport {
    pub sales: Vec<SaleMatchRecord>,
}

impl SalesReport {
    /// Sum of realized gains, 0 when there were no sales
    pub fn total_gain(&self) -> Decimal {
        self.sales.iter().map(|sale| sale.gain_bgn).sum()
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for sale in &self.sales {
            let row: SaleRow = sale.into();
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Itemized lot contributions, one row per consumed lot, for verifying
    /// the matching against the statements
    pub fn write_detailed_csv<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for sale in &self.sales {
            for contribution in &sale.contributions {
                wtr.serialize(SaleLotRow {
                    sale_date: sale.sale_date.format("%Y-%m-%d").to_string(),
                    symbol: sale.symbol.clone(),
                    acquired: contribution.acquired.format("%Y-%m-%d").to_string(),
                    quantity: contribution.quantity,
                    unit_cost: contribution.unit_cost,
                    currency: contribution.currency.clone(),
                    cost_bgn: contribution.cost_bgn.round_dp(2),
                })?;
            }
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Combined profit (≥ 0) or loss (< 0) across sources
pub fn win_loss<'a>(reports: impl IntoIterator<Item = &'a SalesReport>) -> Decimal {
    reports.into_iter().map(SalesReport::total_gain).sum()
}

fn validate(activity: &Activity) -> Result<(), CalculationError> {
    let invalid = |reason: &str| CalculationError::InvalidActivity {
        activity_type: activity.activity_type.as_str().to_string(),
        symbol: activity.symbol.clone(),
        date: activity.trade_date,
        reason: reason.to_string(),
    };
    if activity.quantity.is_zero() {
        return Err(invalid("zero quantity"));
    }
    if activity.activity_type == ActivityType::Buy && activity.quantity < Decimal::ZERO {
        return Err(invalid("negative buy quantity"));
    }
    if activity.price <= Decimal::ZERO {
        return Err(invalid("non-positive price"));
    }
    if activity.currency.is_empty() {
        return Err(invalid("missing currency"));
    }
    Ok(())
}

/// Match sells against buys in strict FIFO order and realize gains in the
/// reporting currency.
///
/// `activities` is one logical data source, pre-sorted by trade date. Each
/// lot's cost converts at its own acquisition-date rate and each sale's
/// proceeds at the sale-date rate, so holdings bought and sold months apart
/// are valued correctly.
pub fn calculate_sales(
    activities: &[Activity],
    rates: &ExchangeRates,
) -> Result<SalesReport, CalculationError> {
    let mut ledger = LotLedger::default();
    let mut sales = Vec::new();

    for activity in activities {
        match &activity.activity_type {
            ActivityType::Buy => {
                validate(activity)?;
                ledger.open(
                    &activity.symbol,
                    activity.trade_date,
                    activity.quantity,
                    activity.price,
                    &activity.currency,
                );
            }
            ActivityType::Sell => {
                validate(activity)?;
                let quantity = activity.quantity.abs();
                let portions =
                    ledger.consume(&activity.symbol, activity.trade_date, quantity)?;

                let sale_rate = rates.rate(&activity.currency, activity.trade_date)?;
                let proceeds_bgn = quantity * activity.price * sale_rate;

                let mut contributions = Vec::with_capacity(portions.len());
                let mut cost_basis_bgn = Decimal::ZERO;
                for portion in portions {
                    let cost_rate = rates.rate(&portion.currency, portion.acquired)?;
                    let cost_bgn = portion.quantity * portion.unit_cost * cost_rate;
                    cost_basis_bgn += cost_bgn;
                    contributions.push(LotContribution {
                        acquired: portion.acquired,
                        quantity: portion.quantity,
                        unit_cost: portion.unit_cost,
                        currency: portion.currency,
                        cost_bgn,
                    });
                }

                let gain_bgn = proceeds_bgn - cost_basis_bgn;
                log::debug!(
                    "sale {} x{} on {}: proceeds {} cost {} gain {}",
                    activity.symbol,
                    quantity,
                    activity.trade_date,
                    proceeds_bgn,
                    cost_basis_bgn,
                    gain_bgn
                );
                sales.push(SaleMatchRecord {
                    symbol: activity.symbol.clone(),
                    sale_date: activity.trade_date,
                    quantity,
                    proceeds_bgn,
                    cost_basis_bgn,
                    gain_bgn,
                    contributions,
                });
            }
            // Cash events; no effect on the lot ledger
            ActivityType::Dividend | ActivityType::DividendTax | ActivityType::Fee => {}
            ActivityType::Other(raw) => {
                // The guard screens these out before the engine runs
                return Err(CalculationError::InvalidActivity {
                    activity_type: raw.clone(),
                    symbol: activity.symbol.clone(),
                    date: activity.trade_date,
                    reason: "unsupported activity type".to_string(),
                });
            }
        }
    }

    Ok(SalesReport { sales })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::Fallback;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn buy(symbol: &str, day: &str, quantity: Decimal, price: Decimal) -> Activity {
        Activity {
            activity_type: ActivityType::Buy,
            symbol: symbol.to_string(),
            trade_date: date(day),
            quantity,
            price,
            currency: "USD".to_string(),
            amount: None,
        }
    }

    fn sell(symbol: &str, day: &str, quantity: Decimal, price: Decimal) -> Activity {
        Activity {
            activity_type: ActivityType::Sell,
            symbol: symbol.to_string(),
            trade_date: date(day),
            quantity: -quantity,
            price,
            currency: "USD".to_string(),
            amount: None,
        }
    }

    fn usd_rates(pairs: &[(&str, Decimal)]) -> ExchangeRates {
        let mut rates = ExchangeRates::new(Fallback::None);
        for (day, rate) in pairs {
            rates.insert("USD", date(day), *rate).unwrap();
        }
        rates
    }

    #[test]
    fn end_to_end_scenario() {
        let rates = usd_rates(&[("2020-01-01", dec!(1.7)), ("2020-06-01", dec!(1.8))]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            sell("X", "2020-06-01", dec!(10), dec!(150)),
        ];

        let report = calculate_sales(&activities, &rates).unwrap();
        assert_eq!(report.sales.len(), 1);
        let sale = &report.sales[0];
        assert_eq!(sale.cost_basis_bgn, dec!(1700));
        assert_eq!(sale.proceeds_bgn, dec!(2700));
        assert_eq!(sale.gain_bgn, dec!(1000));
        assert_eq!(report.total_gain(), dec!(1000));
        assert_eq!(win_loss([&report]), dec!(1000));
    }

    #[test]
    fn fifo_sell_spans_lots_in_one_record() {
        let rates = usd_rates(&[
            ("2020-01-01", dec!(1.7)),
            ("2020-02-01", dec!(1.7)),
            ("2020-06-01", dec!(1.7)),
        ]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            buy("X", "2020-02-01", dec!(10), dec!(120)),
            sell("X", "2020-06-01", dec!(15), dec!(150)),
        ];

        let report = calculate_sales(&activities, &rates).unwrap();
        assert_eq!(report.sales.len(), 1);
        let sale = &report.sales[0];
        assert_eq!(sale.contributions.len(), 2);
        // all of lot 1, then 5 units of lot 2
        assert_eq!(sale.contributions[0].quantity, dec!(10));
        assert_eq!(sale.contributions[0].unit_cost, dec!(100));
        assert_eq!(sale.contributions[1].quantity, dec!(5));
        assert_eq!(sale.contributions[1].unit_cost, dec!(120));
        assert_eq!(
            sale.cost_basis_bgn,
            (dec!(10) * dec!(100) + dec!(5) * dec!(120)) * dec!(1.7)
        );
    }

    #[test]
    fn lot_conservation() {
        let mut ledger = LotLedger::default();
        ledger.open("X", date("2020-01-01"), dec!(10), dec!(100), "USD");
        ledger.open("X", date("2020-02-01"), dec!(10), dec!(120), "USD");
        assert_eq!(ledger.open_quantity("X"), dec!(20));

        ledger.consume("X", date("2020-03-01"), dec!(7)).unwrap();
        assert_eq!(ledger.open_quantity("X"), dec!(13));

        ledger.consume("X", date("2020-04-01"), dec!(13)).unwrap();
        assert_eq!(ledger.open_quantity("X"), dec!(0));
    }

    #[test]
    fn ledger_never_splits_across_securities() {
        let mut ledger = LotLedger::default();
        ledger.open("X", date("2020-01-01"), dec!(10), dec!(100), "USD");
        ledger.open("Y", date("2020-01-01"), dec!(10), dec!(50), "USD");

        let err = ledger.consume("X", date("2020-02-01"), dec!(15)).unwrap_err();
        assert_eq!(
            err,
            CalculationError::InsufficientLots {
                symbol: "X".to_string(),
                date: date("2020-02-01"),
                requested: dec!(15),
                available: dec!(10),
            }
        );
        // a failed consume leaves the queue untouched
        assert_eq!(ledger.open_quantity("X"), dec!(10));
        assert_eq!(ledger.open_quantity("Y"), dec!(10));
    }

    #[test]
    fn sell_with_no_lots_left_fails() {
        let rates = usd_rates(&[
            ("2020-01-01", dec!(1.7)),
            ("2020-06-01", dec!(1.8)),
            ("2020-07-01", dec!(1.8)),
        ]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            // exactly empties the last open lot
            sell("X", "2020-06-01", dec!(10), dec!(150)),
            sell("X", "2020-07-01", dec!(1), dec!(150)),
        ];

        let err = calculate_sales(&activities, &rates).unwrap_err();
        assert!(matches!(
            err,
            CalculationError::InsufficientLots { available, .. } if available.is_zero()
        ));
    }

    #[test]
    fn zero_quantity_rejected() {
        let rates = usd_rates(&[("2020-01-01", dec!(1.7))]);
        let activities = vec![buy("X", "2020-01-01", dec!(0), dec!(100))];
        assert!(matches!(
            calculate_sales(&activities, &rates).unwrap_err(),
            CalculationError::InvalidActivity { .. }
        ));
    }

    #[test]
    fn zero_price_rejected() {
        let rates = usd_rates(&[("2020-01-01", dec!(1.7)), ("2020-02-01", dec!(1.7))]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            sell("X", "2020-02-01", dec!(5), dec!(0)),
        ];
        assert!(matches!(
            calculate_sales(&activities, &rates).unwrap_err(),
            CalculationError::InvalidActivity { .. }
        ));
    }

    #[test]
    fn missing_currency_rejected() {
        let rates = usd_rates(&[("2020-01-01", dec!(1.7))]);
        let mut activity = buy("X", "2020-01-01", dec!(10), dec!(100));
        activity.currency = String::new();
        assert!(matches!(
            calculate_sales(std::slice::from_ref(&activity), &rates).unwrap_err(),
            CalculationError::InvalidActivity { .. }
        ));
    }

    #[test]
    fn missing_rate_aborts() {
        let rates = usd_rates(&[("2020-01-01", dec!(1.7))]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            sell("X", "2020-06-01", dec!(10), dec!(150)),
        ];
        assert!(matches!(
            calculate_sales(&activities, &rates).unwrap_err(),
            CalculationError::Rate(RateError::RateNotFound { .. })
        ));
    }

    #[test]
    fn fees_and_dividends_do_not_touch_the_ledger() {
        let rates = usd_rates(&[("2020-01-01", dec!(1.7)), ("2020-06-01", dec!(1.8))]);
        let fee = Activity {
            activity_type: ActivityType::Fee,
            symbol: "X".to_string(),
            trade_date: date("2020-03-01"),
            quantity: Decimal::ZERO,
            price: Decimal::ZERO,
            currency: "USD".to_string(),
            amount: Some(dec!(-0.50)),
        };
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            fee,
            sell("X", "2020-06-01", dec!(10), dec!(150)),
        ];

        let report = calculate_sales(&activities, &rates).unwrap();
        assert_eq!(report.sales.len(), 1);
        assert_eq!(report.sales[0].gain_bgn, dec!(1000));
    }

    #[test]
    fn rerun_is_bit_identical() {
        let rates = usd_rates(&[
            ("2020-01-01", dec!(1.7)),
            ("2020-02-01", dec!(1.75)),
            ("2020-06-01", dec!(1.8)),
        ]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            buy("X", "2020-02-01", dec!(4), dec!(110)),
            sell("X", "2020-06-01", dec!(12), dec!(150)),
        ];

        let first = calculate_sales(&activities, &rates).unwrap();
        let second = calculate_sales(&activities, &rates).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn uniform_rate_scaling_preserves_sign() {
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            sell("X", "2020-06-01", dec!(10), dec!(150)),
        ];

        let base = usd_rates(&[("2020-01-01", dec!(1.7)), ("2020-06-01", dec!(1.8))]);
        let doubled = usd_rates(&[("2020-01-01", dec!(3.4)), ("2020-06-01", dec!(3.6))]);

        let gain = calculate_sales(&activities, &base).unwrap().total_gain();
        let gain_doubled = calculate_sales(&activities, &doubled).unwrap().total_gain();
        assert_eq!(gain_doubled, gain * dec!(2));
        assert!(gain.is_sign_positive() && gain_doubled.is_sign_positive());
    }

    #[test]
    fn loss_is_negative_total() {
        let rates = usd_rates(&[("2020-01-01", dec!(1.7)), ("2020-06-01", dec!(1.7))]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            sell("X", "2020-06-01", dec!(10), dec!(80)),
        ];

        let report = calculate_sales(&activities, &rates).unwrap();
        assert_eq!(report.total_gain(), dec!(-340));
    }

    #[test]
    fn win_loss_empty_is_zero() {
        let no_reports: [&SalesReport; 0] = [];
        assert_eq!(win_loss(no_reports), Decimal::ZERO);
    }

    #[test]
    fn two_sells_processed_in_order() {
        let rates = usd_rates(&[
            ("2020-01-01", dec!(1.7)),
            ("2020-02-01", dec!(1.7)),
            ("2020-03-01", dec!(1.7)),
            ("2020-04-01", dec!(1.7)),
        ]);
        let activities = vec![
            buy("X", "2020-01-01", dec!(10), dec!(100)),
            buy("X", "2020-02-01", dec!(10), dec!(200)),
            sell("X", "2020-03-01", dec!(10), dec!(150)),
            sell("X", "2020-04-01", dec!(10), dec!(150)),
        ];

        let report = calculate_sales(&activities, &rates).unwrap();
        assert_eq!(report.sales.len(), 2);
        // first sell matched the first lot, second sell the second lot
        assert_eq!(report.sales[0].contributions[0].unit_cost, dec!(100));
        assert_eq!(report.sales[1].contributions[0].unit_cost, dec!(200));
    }
}

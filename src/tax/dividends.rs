use crate::activities::{Activity, ActivityType};
use crate::rates::ExchangeRates;
use crate::securities::SecurityRegistry;
use crate::tax::sales::CalculationError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

/// One dividend payment event in reporting currency
#[derive(Debug, Clone, PartialEq)]
pub struct DividendRecord {
    pub symbol: String,
    pub pay_date: NaiveDate,
    pub gross_bgn: Decimal,
    pub withholding_tax_bgn: Decimal,
    /// gross − withholding
    pub net_bgn: Decimal,
    pub source_currency: String,
    /// Issuer country from the securities registry, if known
    pub source_country: Option<String>,
}

/// CSV row for the dividend output file
#[derive(Debug, Serialize, Deserialize)]
pub struct DividendRow {
    pub date: String,
    pub symbol: String,
    pub country: String,
    pub gross_bgn: Decimal,
    pub withholding_tax_bgn: Decimal,
    pub net_bgn: Decimal,
    pub currency: String,
}

impl From<&DividendRecord> for DividendRow {
    fn from(dividend: &DividendRecord) -> Self {
        DividendRow {
            date: dividend.pay_date.format("%Y-%m-%d").to_string(),
            symbol: dividend.symbol.clone(),
            country: dividend.source_country.clone().unwrap_or_default(),
            gross_bgn: dividend.gross_bgn.round_dp(2),
            withholding_tax_bgn: dividend.withholding_tax_bgn.round_dp(2),
            net_bgn: dividend.net_bgn.round_dp(2),
            currency: dividend.source_currency.clone(),
        }
    }
}

/// Dividend income of one logical data source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DividendReport {
    pub dividends: Vec<DividendRecord>,
}

impl DividendReport {
    pub fn total_gross(&self) -> Decimal {
        self.dividends.iter().map(|d| d.gross_bgn).sum()
    }

    pub fn total_withholding(&self) -> Decimal {
        self.dividends.iter().map(|d| d.withholding_tax_bgn).sum()
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for dividend in &self.dividends {
            let row: DividendRow = dividend.into();
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct Payment {
    gross: Option<Decimal>,
    withholding: Decimal,
    currency: String,
}

fn cash_amount(activity: &Activity) -> Result<Decimal, CalculationError> {
    let amount = activity
        .amount
        .ok_or_else(|| CalculationError::InvalidActivity {
            activity_type: activity.activity_type.as_str().to_string(),
            symbol: activity.symbol.clone(),
            date: activity.trade_date,
            reason: "missing cash amount".to_string(),
        })?;
    if activity.currency.is_empty() {
        return Err(CalculationError::InvalidActivity {
            activity_type: activity.activity_type.as_str().to_string(),
            symbol: activity.symbol.clone(),
            date: activity.trade_date,
            reason: "missing currency".to_string(),
        });
    }
    // withholding rows arrive as debits on some statements
    Ok(amount.abs())
}

/// Pair dividend credits with their withholding-tax rows and convert both at
/// the pay-date rate.
///
/// A DIV and a DIVNRA on the same (symbol, pay date) form one payment event;
/// dividends with no tax row use withholding 0. A tax row with no matching
/// dividend signals a parsing defect and aborts.
pub fn calculate_dividends(
    activities: &[Activity],
    rates: &ExchangeRates,
    securities: &SecurityRegistry,
) -> Result<DividendReport, CalculationError> {
    // BTreeMap keys the payments by (date, symbol), which also fixes the
    // output order
    let mut payments: BTreeMap<(NaiveDate, String), Payment> = BTreeMap::new();

    for activity in activities {
        if !activity.activity_type.is_dividend_related() {
            continue;
        }
        let amount = cash_amount(activity)?;
        let payment = payments
            .entry((activity.trade_date, activity.symbol.clone()))
            .or_default();
        if payment.currency.is_empty() {
            payment.currency = activity.currency.clone();
        } else if payment.currency != activity.currency {
            return Err(CalculationError::InvalidActivity {
                activity_type: activity.activity_type.as_str().to_string(),
                symbol: activity.symbol.clone(),
                date: activity.trade_date,
                reason: format!(
                    "currency {} differs from {} on the same payment",
                    activity.currency, payment.currency
                ),
            });
        }
        match activity.activity_type {
            ActivityType::Dividend => {
                *payment.gross.get_or_insert(Decimal::ZERO) += amount;
            }
            ActivityType::DividendTax => {
                payment.withholding += amount;
            }
            _ => unreachable!(),
        }
    }

    let mut dividends = Vec::with_capacity(payments.len());
    for ((pay_date, symbol), payment) in payments {
        let gross = payment
            .gross
            .ok_or_else(|| CalculationError::InvalidActivity {
                activity_type: ActivityType::DividendTax.as_str().to_string(),
                symbol: symbol.clone(),
                date: pay_date,
                reason: "withholding tax with no matching dividend".to_string(),
            })?;
        let rate = rates.rate(&payment.currency, pay_date)?;
        let gross_bgn = gross * rate;
        let withholding_tax_bgn = payment.withholding * rate;
        log::debug!(
            "dividend {} on {}: gross {} withholding {} ({} @ {})",
            symbol,
            pay_date,
            gross_bgn,
            withholding_tax_bgn,
            payment.currency,
            rate
        );
        dividends.push(DividendRecord {
            source_country: securities.country(&symbol).map(str::to_string),
            symbol,
            pay_date,
            gross_bgn,
            withholding_tax_bgn,
            net_bgn: gross_bgn - withholding_tax_bgn,
            source_currency: payment.currency,
        });
    }

    Ok(DividendReport { dividends })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::Fallback;
    use crate::securities::SecurityInfo;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn dividend(symbol: &str, day: &str, amount: Decimal) -> Activity {
        Activity {
            activity_type: ActivityType::Dividend,
            symbol: symbol.to_string(),
            trade_date: date(day),
            quantity: Decimal::ZERO,
            price: Decimal::ZERO,
            currency: "USD".to_string(),
            amount: Some(amount),
        }
    }

    fn dividend_tax(symbol: &str, day: &str, amount: Decimal) -> Activity {
        Activity {
            activity_type: ActivityType::DividendTax,
            ..dividend(symbol, day, amount)
        }
    }

    fn usd_rates(pairs: &[(&str, Decimal)]) -> ExchangeRates {
        let mut rates = ExchangeRates::new(Fallback::None);
        for (day, rate) in pairs {
            rates.insert("USD", date(day), *rate).unwrap();
        }
        rates
    }

    fn registry() -> SecurityRegistry {
        let mut registry = SecurityRegistry::default();
        registry.insert(SecurityInfo {
            symbol: "AAPL".to_string(),
            country: "US".to_string(),
        });
        registry
    }

    #[test]
    fn pairs_dividend_with_withholding() {
        let rates = usd_rates(&[("2020-03-02", dec!(1.8))]);
        let activities = vec![
            dividend("AAPL", "2020-03-02", dec!(10)),
            dividend_tax("AAPL", "2020-03-02", dec!(-1)),
        ];

        let report = calculate_dividends(&activities, &rates, &registry()).unwrap();
        assert_eq!(report.dividends.len(), 1);
        let d = &report.dividends[0];
        assert_eq!(d.gross_bgn, dec!(18));
        assert_eq!(d.withholding_tax_bgn, dec!(1.8));
        assert_eq!(d.net_bgn, dec!(16.2));
        assert_eq!(d.source_country, Some("US".to_string()));
        assert_eq!(d.source_currency, "USD");
    }

    #[test]
    fn unmatched_dividend_uses_zero_withholding() {
        let rates = usd_rates(&[("2020-03-02", dec!(1.8))]);
        let activities = vec![dividend("MSFT", "2020-03-02", dec!(5))];

        let report = calculate_dividends(&activities, &rates, &registry()).unwrap();
        assert_eq!(report.dividends.len(), 1);
        assert_eq!(report.dividends[0].withholding_tax_bgn, dec!(0));
        assert_eq!(report.dividends[0].net_bgn, dec!(9));
        assert_eq!(report.dividends[0].source_country, None);
    }

    #[test]
    fn orphan_withholding_aborts() {
        let rates = usd_rates(&[("2020-03-02", dec!(1.8))]);
        let activities = vec![dividend_tax("AAPL", "2020-03-02", dec!(-1))];

        let err = calculate_dividends(&activities, &rates, &registry()).unwrap_err();
        assert!(matches!(err, CalculationError::InvalidActivity { .. }));
    }

    #[test]
    fn mismatched_currencies_on_one_payment_abort() {
        let rates = usd_rates(&[("2020-03-02", dec!(1.8))]);
        let mut tax = dividend_tax("AAPL", "2020-03-02", dec!(-1));
        tax.currency = "EUR".to_string();
        let activities = vec![dividend("AAPL", "2020-03-02", dec!(10)), tax];

        let err = calculate_dividends(&activities, &rates, &registry()).unwrap_err();
        match err {
            CalculationError::InvalidActivity { reason, .. } => {
                assert!(reason.contains("EUR"), "reason: {reason}");
                assert!(reason.contains("USD"), "reason: {reason}");
            }
            other => panic!("expected InvalidActivity, got {other:?}"),
        }
    }

    #[test]
    fn separate_pay_dates_stay_separate_events() {
        let rates = usd_rates(&[("2020-03-02", dec!(1.8)), ("2020-06-02", dec!(1.7))]);
        let activities = vec![
            dividend("AAPL", "2020-03-02", dec!(10)),
            dividend("AAPL", "2020-06-02", dec!(10)),
            dividend_tax("AAPL", "2020-06-02", dec!(-1)),
        ];

        let report = calculate_dividends(&activities, &rates, &registry()).unwrap();
        assert_eq!(report.dividends.len(), 2);
        assert_eq!(report.dividends[0].pay_date, date("2020-03-02"));
        assert_eq!(report.dividends[0].withholding_tax_bgn, dec!(0));
        assert_eq!(report.dividends[1].withholding_tax_bgn, dec!(1.7));
        assert_eq!(report.total_gross(), dec!(35));
    }

    #[test]
    fn missing_amount_rejected() {
        let rates = usd_rates(&[("2020-03-02", dec!(1.8))]);
        let mut activity = dividend("AAPL", "2020-03-02", dec!(10));
        activity.amount = None;

        let err =
            calculate_dividends(std::slice::from_ref(&activity), &rates, &registry()).unwrap_err();
        assert!(matches!(err, CalculationError::InvalidActivity { .. }));
    }

    #[test]
    fn missing_pay_date_rate_aborts() {
        let rates = usd_rates(&[]);
        let activities = vec![dividend("AAPL", "2020-03-02", dec!(10))];
        assert!(matches!(
            calculate_dividends(&activities, &rates, &registry()).unwrap_err(),
            CalculationError::Rate(_)
        ));
    }

    #[test]
    fn non_dividend_activities_ignored() {
        let rates = usd_rates(&[("2020-03-02", dec!(1.8))]);
        let activities = vec![
            Activity {
                activity_type: ActivityType::Buy,
                symbol: "AAPL".to_string(),
                trade_date: date("2020-03-02"),
                quantity: dec!(10),
                price: dec!(100),
                currency: "USD".to_string(),
                amount: None,
            },
            dividend("AAPL", "2020-03-02", dec!(10)),
        ];

        let report = calculate_dividends(&activities, &rates, &registry()).unwrap();
        assert_eq!(report.dividends.len(), 1);
    }
}

use crate::activities::{self, Activity};
use crate::pipeline::{self, ParserRegistry, RunOutput};
use crate::rates::Fallback;
use crate::tax::{DividendReport, SalesReport};
use anyhow::Context;
use clap::Args;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Args, Debug)]
pub struct ReportCommand {
    /// Directory containing statement files for the default csv parser
    #[arg(short, long)]
    input_dir: Option<PathBuf>,

    /// Output directory for the NAP calculation and verification csv files
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Historical exchange rates csv (currency,date,rate)
    #[arg(short, long)]
    rates: PathBuf,

    /// Securities metadata csv (symbol,country) for dividend grouping
    #[arg(short, long)]
    securities: Option<PathBuf>,

    /// Parsers to use, as <name>:<input_dir>; repeat for multiple sources
    #[arg(short, long = "parser")]
    parsers: Vec<String>,

    /// Merge all sources into a single calculation pass
    #[arg(long)]
    combine: bool,

    /// How many days back a missing rate fixing may fall
    #[arg(long, default_value_t = 7)]
    rate_fallback_days: u32,
}

impl ReportCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        log::info!("populating exchange rates");
        let rates = super::load_rates(
            &self.rates,
            Fallback::PrecedingDays(self.rate_fallback_days),
        )?;
        let securities = super::load_securities(self.securities.as_deref())?;

        log::info!("parsing statement files");
        let specs = pipeline::resolve_specs(&self.parsers, self.input_dir.as_deref())?;
        let registry = ParserRegistry::with_defaults();
        let sources = pipeline::parse_sources(&registry, &specs)?;

        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("creating output directory {}", self.output_dir.display())
        })?;
        self.write_statements(&sources)?;

        let output = pipeline::run(&sources, &rates, &securities, self.combine)?;

        self.write_dividends(&output.dividends)?;
        if let Some(sales) = &output.sales {
            self.write_sales(sales)?;
        }

        self.print_summary(&output);
        Ok(())
    }

    /// Merged activity log, for verifying the parse against the statements
    fn write_statements(&self, sources: &BTreeMap<String, Vec<Activity>>) -> anyhow::Result<()> {
        let mut merged: Vec<Activity> = sources.values().flatten().cloned().collect();
        merged.sort_by_key(|a| a.trade_date);

        let path = self.output_path("statements.csv");
        log::info!("generating [{}]", path.display());
        activities::write_csv(&merged, File::create(&path)?)
    }

    fn write_dividends(&self, reports: &BTreeMap<String, DividendReport>) -> anyhow::Result<()> {
        let merged = DividendReport {
            dividends: reports
                .values()
                .flat_map(|report| report.dividends.iter().cloned())
                .collect(),
        };
        let path = self.output_path("dividends.csv");
        log::info!("generating [{}]", path.display());
        merged.write_csv(File::create(&path)?)
    }

    fn write_sales(&self, reports: &BTreeMap<String, SalesReport>) -> anyhow::Result<()> {
        let merged = SalesReport {
            sales: reports
                .values()
                .flat_map(|report| report.sales.iter().cloned())
                .collect(),
        };
        let path = self.output_path("sales.csv");
        log::info!("generating [{}]", path.display());
        merged.write_csv(File::create(&path)?)?;

        let path = self.output_path("sales-lots.csv");
        log::info!("generating [{}]", path.display());
        merged.write_detailed_csv(File::create(&path)?)
    }

    fn print_summary(&self, output: &RunOutput) {
        if let Some(sales) = &output.sales {
            let rows = symbol_rows(sales);
            if !rows.is_empty() {
                let table = Table::new(&rows)
                    .with(Style::rounded())
                    .with(Modify::new(Rows::new(1..)).with(Alignment::right()))
                    .to_string();
                println!("{table}");
            }
        }

        let dividend_gross: Decimal = output
            .dividends
            .values()
            .map(DividendReport::total_gross)
            .sum();
        let dividend_withholding: Decimal = output
            .dividends
            .values()
            .map(DividendReport::total_withholding)
            .sum();
        println!(
            "Dividend income: {} lev, withholding tax: {} lev.",
            dividend_gross.round_dp(2),
            dividend_withholding.round_dp(2)
        );

        match output.win_loss {
            Some(total) => println!("Profit/Loss: {} lev.", total.round_dp(2)),
            None => println!(
                "Profit/Loss: skipped, statements contain unsupported activity types: [{}].",
                output
                    .unsupported
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    fn output_path(&self, filename: &str) -> PathBuf {
        Path::new(&self.output_dir).join(filename)
    }
}

/// Row for the per-symbol gains table
#[derive(Debug, Tabled)]
struct SymbolRow {
    #[tabled(rename = "Symbol")]
    symbol: String,
    #[tabled(rename = "Sold")]
    quantity: String,
    #[tabled(rename = "Proceeds (BGN)")]
    proceeds: String,
    #[tabled(rename = "Cost (BGN)")]
    cost: String,
    #[tabled(rename = "Gain/Loss (BGN)")]
    gain: String,
}

fn symbol_rows(reports: &BTreeMap<String, SalesReport>) -> Vec<SymbolRow> {
    let mut totals: BTreeMap<&str, (Decimal, Decimal, Decimal)> = BTreeMap::new();
    for sale in reports.values().flat_map(|report| report.sales.iter()) {
        let entry = totals.entry(sale.symbol.as_str()).or_default();
        entry.0 += sale.quantity;
        entry.1 += sale.proceeds_bgn;
        entry.2 += sale.cost_basis_bgn;
    }
    totals
        .into_iter()
        .map(|(symbol, (quantity, proceeds, cost))| SymbolRow {
            symbol: symbol.to_string(),
            quantity: quantity.normalize().to_string(),
            proceeds: proceeds.round_dp(2).to_string(),
            cost: cost.round_dp(2).to_string(),
            gain: (proceeds - cost).round_dp(2).to_string(),
        })
        .collect()
}

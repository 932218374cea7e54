use crate::activities::{self, Activity};
use crate::rates::ExchangeRates;
use crate::securities::SecurityRegistry;
use crate::tax::{
    calculate_dividends, calculate_sales, unsupported_activity_types, win_loss,
    CalculationError, DividendReport, SalesReport,
};
use anyhow::{bail, Context};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Source key used when `--combine` merges every parser's activities into
/// one stream
pub const COMBINED_SOURCE: &str = "combined";

/// Seam to the statement-parsing collaborators. Implementations own file
/// discovery and format handling; the pipeline only sees activities.
pub trait StatementParser {
    fn parse(&self) -> anyhow::Result<Vec<Activity>>;
}

/// Parser for statements already normalized to the activity CSV layout
pub struct CsvStatementParser {
    input_dir: PathBuf,
}

impl StatementParser for CsvStatementParser {
    fn parse(&self) -> anyhow::Result<Vec<Activity>> {
        let mut activities = Vec::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.input_dir)
            .with_context(|| format!("reading input dir {}", self.input_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        entries.sort();
        for path in entries {
            log::debug!("parsing statement file {}", path.display());
            let file = File::open(&path)
                .with_context(|| format!("opening statement file {}", path.display()))?;
            activities.extend(
                activities::read_csv(file)
                    .with_context(|| format!("parsing {}", path.display()))?,
            );
        }
        // stable: same-date activities keep file order
        activities.sort_by_key(|a| a.trade_date);
        Ok(activities)
    }
}

type ParserFactory = Box<dyn Fn(&Path) -> Box<dyn StatementParser>>;

/// Explicit name → factory map for parser selection; unknown names are
/// reported up front instead of being looked up dynamically at use sites
pub struct ParserRegistry {
    factories: BTreeMap<String, ParserFactory>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        ParserRegistry {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in parsers
    pub fn with_defaults() -> Self {
        let mut registry = ParserRegistry::new();
        registry.register("csv", |input_dir| {
            Box::new(CsvStatementParser {
                input_dir: input_dir.to_path_buf(),
            })
        });
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&Path) -> Box<dyn StatementParser> + 'static,
    ) {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    fn create(&self, name: &str, input_dir: &Path) -> Option<Box<dyn StatementParser>> {
        self.factories.get(name).map(|factory| factory(input_dir))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// One `-p name:input_dir` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserSpec {
    pub name: String,
    pub input_dir: PathBuf,
}

impl ParserSpec {
    /// Key identifying this source in the outputs. Includes the input
    /// directory so two brokers read by the same parser stay distinct.
    pub fn source_label(&self) -> String {
        format!("{}:{}", self.name, self.input_dir.display())
    }

    pub fn parse(arg: &str) -> anyhow::Result<Self> {
        match arg.split_once(':') {
            Some((name, dir)) if !name.is_empty() && !dir.is_empty() => Ok(ParserSpec {
                name: name.to_string(),
                input_dir: PathBuf::from(dir),
            }),
            _ => bail!("invalid parser spec '{arg}', expected <name>:<input_dir>"),
        }
    }
}

/// Resolve CLI arguments to parser specs. With no `-p` arguments the single
/// csv parser reads the `-i` directory.
pub fn resolve_specs(
    parser_args: &[String],
    input_dir: Option<&Path>,
) -> anyhow::Result<Vec<ParserSpec>> {
    if parser_args.is_empty() {
        let input_dir = input_dir
            .context("an input directory (-i) is required when no parsers (-p) are given")?;
        return Ok(vec![ParserSpec {
            name: "csv".to_string(),
            input_dir: input_dir.to_path_buf(),
        }]);
    }
    parser_args.iter().map(|arg| ParserSpec::parse(arg)).collect()
}

/// Parse every source's statements. Unknown parser names and sources that
/// yield no activities abort the run.
pub fn parse_sources(
    registry: &ParserRegistry,
    specs: &[ParserSpec],
) -> anyhow::Result<BTreeMap<String, Vec<Activity>>> {
    let unknown: Vec<&str> = specs
        .iter()
        .filter(|spec| !registry.factories.contains_key(&spec.name))
        .map(|spec| spec.name.as_str())
        .collect();
    if !unknown.is_empty() {
        bail!(
            "unsupported parsers: [{}]; available: [{}]",
            unknown.join(", "),
            registry.names().collect::<Vec<_>>().join(", ")
        );
    }

    let mut sources = BTreeMap::new();
    for spec in specs {
        let parser = registry
            .create(&spec.name, &spec.input_dir)
            .expect("checked against the registry above");
        let activities = parser.parse()?;
        if activities.is_empty() {
            bail!(
                "no activities found with parser [{}] in {}; check your statement files",
                spec.name,
                spec.input_dir.display()
            );
        }
        let label = spec.source_label();
        log::info!(
            "parsed {} activities from source [{}]",
            activities.len(),
            label
        );
        if sources.insert(label.clone(), activities).is_some() {
            bail!("source [{label}] given more than once");
        }
    }
    Ok(sources)
}

/// Results of one calculation pass
#[derive(Debug)]
pub struct RunOutput {
    /// Dividend income per source (or the combined pseudo-source)
    pub dividends: BTreeMap<String, DividendReport>,
    /// Realized gains per source; None when the guard downgraded the run
    pub sales: Option<BTreeMap<String, SalesReport>>,
    /// Combined profit/loss; None when sales were skipped
    pub win_loss: Option<Decimal>,
    /// Activity types the guard refused
    pub unsupported: BTreeSet<String>,
}

/// Run the guard, the dividend aggregation, and (guard permitting) the sale
/// matching over every source.
///
/// With `combine` the sources merge into one chronological stream first, so
/// positions opened through one broker and closed through another still
/// match; otherwise each source keeps its own ledger. Dividends are computed
/// even when unsupported types force the capital-gains output to be skipped.
pub fn run(
    sources: &BTreeMap<String, Vec<Activity>>,
    rates: &ExchangeRates,
    securities: &SecurityRegistry,
    combine: bool,
) -> Result<RunOutput, CalculationError> {
    let combined;
    let passes: Vec<(&str, &[Activity])> = if combine {
        let mut merged: Vec<Activity> = sources.values().flatten().cloned().collect();
        merged.sort_by_key(|a| a.trade_date);
        combined = merged;
        vec![(COMBINED_SOURCE, combined.as_slice())]
    } else {
        sources
            .iter()
            .map(|(name, activities)| (name.as_str(), activities.as_slice()))
            .collect()
    };

    log::info!("calculating dividends information");
    let mut dividends = BTreeMap::new();
    for (name, activities) in &passes {
        dividends.insert(
            name.to_string(),
            calculate_dividends(activities, rates, securities)?,
        );
    }

    let unsupported = unsupported_activity_types(sources.values().map(Vec::as_slice));
    if !unsupported.is_empty() {
        log::warn!(
            "statements contain unsupported activity types: [{}]; only dividend data was calculated",
            unsupported.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        return Ok(RunOutput {
            dividends,
            sales: None,
            win_loss: None,
            unsupported,
        });
    }

    log::info!("calculating sales information");
    let mut sales = BTreeMap::new();
    for (name, activities) in &passes {
        sales.insert(name.to_string(), calculate_sales(activities, rates)?);
    }
    let total = win_loss(sales.values());

    Ok(RunOutput {
        dividends,
        sales: Some(sales),
        win_loss: Some(total),
        unsupported,
    })
}

use crate::activities::Activity;
use std::collections::BTreeSet;

/// Collect activity types outside the recognized set, across every source.
///
/// A non-empty result means the statements contain something the sale
/// matching engine does not understand (stock splits, transfers, ...), so
/// capital-gains output must be skipped entirely rather than misstated.
/// Dividend output is unaffected.
pub fn unsupported_activity_types<'a>(
    sources: impl IntoIterator<Item = &'a [Activity]>,
) -> BTreeSet<String> {
    sources
        .into_iter()
        .flatten()
        .filter(|activity| !activity.activity_type.is_supported())
        .map(|activity| activity.activity_type.as_str().to_string())
        .collect()
}

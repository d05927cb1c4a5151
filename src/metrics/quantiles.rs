//! Quantile labels reported for every histogram.

use crate::contracts::MetricsError;

/// Placeholder substituted with the histogram name in a label template.
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Ordered mapping from label template to target fraction.
///
/// Templates contain [`NAME_PLACEHOLDER`], e.g. `"{name}_99"` renders as
/// `"latency_99"` for the `latency` histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantiles {
    entries: Vec<(String, f64)>,
}

impl Default for Quantiles {
    fn default() -> Self {
        let entries = [
            ("{name}_min", 0.0),
            ("{name}_50", 0.5),
            ("{name}_75", 0.75),
            ("{name}_90", 0.9),
            ("{name}_95", 0.95),
            ("{name}_99", 0.99),
            ("{name}_99.9", 0.999),
            ("{name}_99.99", 0.9999),
            ("{name}_max", 1.0),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(label, q)| (label.to_string(), q))
                .collect(),
        }
    }
}

impl Quantiles {
    /// Builds a replacement set, validating every template and fraction.
    pub fn new<I, S>(entries: I) -> Result<Self, MetricsError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut validated = Vec::new();
        for (label, fraction) in entries {
            let label = label.into();
            if !label.contains(NAME_PLACEHOLDER) {
                return Err(MetricsError::InvalidQuantileLabel(label));
            }
            if !(0.0..=1.0).contains(&fraction) {
                return Err(MetricsError::InvalidQuantile(fraction));
            }
            if validated.iter().any(|(existing, _)| *existing == label) {
                return Err(MetricsError::InvalidQuantileLabel(format!(
                    "duplicate label {}",
                    label
                )));
            }
            validated.push((label, fraction));
        }
        Ok(Self { entries: validated })
    }

    /// Iterates `(rendered label, fraction)` pairs for one histogram.
    pub fn labelled<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (String, f64)> + 'a {
        self.entries
            .iter()
            .map(move |(template, q)| (template.replace(NAME_PLACEHOLDER, name), *q))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

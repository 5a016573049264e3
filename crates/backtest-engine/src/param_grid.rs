use std::collections::BTreeMap;

use crate::models::ParameterRange;

/// Lazy iterator over the Cartesian product of parameter ranges.
///
/// Works like an odometer over per-parameter indices, so memory stays
/// bounded no matter how large the search space is. An empty range map
/// yields exactly one empty combination: the strategy's current
/// configuration is still evaluated once.
pub struct ParameterGrid<'a> {
    names: Vec<&'a str>,
    ranges: Vec<&'a ParameterRange>,
    indices: Vec<usize>,
    exhausted: bool,
}

impl<'a> ParameterGrid<'a> {
    pub fn new(ranges: &'a BTreeMap<String, ParameterRange>) -> Self {
        let names: Vec<&str> = ranges.keys().map(String::as_str).collect();
        let ranges: Vec<&ParameterRange> = ranges.values().collect();
        // A degenerate range (step <= 0 or max < min) empties the product.
        let exhausted = ranges.iter().any(|r| r.is_empty());
        Self {
            indices: vec![0; names.len()],
            names,
            ranges,
            exhausted,
        }
    }

    /// Total number of combinations the full iteration will produce.
    pub fn combination_count(&self) -> usize {
        if self.ranges.iter().any(|r| r.is_empty()) {
            return 0;
        }
        self.ranges.iter().map(|r| r.len()).product::<usize>().max(1)
    }
}

impl Iterator for ParameterGrid<'_> {
    type Item = BTreeMap<String, f64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let combination: BTreeMap<String, f64> = self
            .names
            .iter()
            .zip(&self.ranges)
            .zip(&self.indices)
            .map(|((name, range), &index)| (name.to_string(), range.value_at(index)))
            .collect();

        // Advance the odometer; roll over means we are done.
        self.exhausted = true;
        for position in (0..self.indices.len()).rev() {
            if self.indices[position] + 1 < self.ranges[position].len() {
                self.indices[position] += 1;
                self.exhausted = false;
                break;
            }
            self.indices[position] = 0;
        }

        Some(combination)
    }
}

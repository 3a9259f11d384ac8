//! Output-name vocabulary.
//!
//! Besides the fixed names (`first`, `every`, `last`, ...) a step may wire
//! `every-N`, `select-N` and bare integers. They are extracted once per
//! activation from the step's `output` map.

use std::collections::BTreeSet;

use crate::constants::outputs;
use crate::recipe::RecipeStep;

/// Whether file `index` (1-based) of `total` is one of `count` evenly spread selections
///
/// Indices 1 and `total` are always selected for `count >= 2`; with
/// `count == 1` only the last file is.
pub fn is_selected(index: u64, total: u64, count: u64) -> bool {
    if total <= count || index == total {
        return true;
    }
    if count <= 1 {
        return false;
    }
    let k = index * (count - 1) / total;
    index == 1 + k * total / (count - 1)
}

/// Whether file `index` (1-based) falls on an `every-N` boundary
pub fn is_every(index: u64, n: u64) -> bool {
    n > 0 && index > 0 && (index - 1) % n == 0
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CadenceOutputs {
    wired: BTreeSet<String>,
    every: Vec<(u64, String)>,
    select: Vec<(u64, String)>,
    numbered: Vec<(u64, String)>,
}

impl CadenceOutputs {
    pub fn from_step(step: &RecipeStep) -> Self {
        let mut cadence = Self::default();
        for name in step.outputs.keys() {
            cadence.wired.insert(name.clone());
            if let Some(n) = parse_suffix(name, outputs::EVERY_PREFIX) {
                cadence.every.push((n, name.clone()));
            } else if let Some(n) = parse_suffix(name, outputs::SELECT_PREFIX) {
                cadence.select.push((n, name.clone()));
            } else if let Ok(n) = name.trim().parse::<u64>() {
                cadence.numbered.push((n, name.clone()));
            }
        }
        cadence
    }

    pub fn is_wired(&self, name: &str) -> bool {
        self.wired.contains(name)
    }

    /// Outputs to notify for file `index` of `total`, in emission order
    pub fn outputs_for(&self, index: u64, total: u64) -> Vec<&str> {
        let mut names = Vec::new();
        if index == 1 && self.is_wired(outputs::FIRST) {
            names.push(outputs::FIRST);
        }
        if self.is_wired(outputs::EVERY) {
            names.push(outputs::EVERY);
        }
        for (n, name) in &self.every {
            if is_every(index, *n) {
                names.push(name.as_str());
            }
        }
        for (n, name) in &self.select {
            if is_selected(index, total, *n) {
                names.push(name.as_str());
            }
        }
        if index == total && self.is_wired(outputs::LAST) {
            names.push(outputs::LAST);
        }
        for (n, name) in &self.numbered {
            if *n == index {
                names.push(name.as_str());
            }
        }
        names
    }
}

/// `N` from names such as `every-10`; zero and non-numbers are ignored
fn parse_suffix(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
}

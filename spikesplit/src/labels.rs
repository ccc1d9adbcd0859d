//! Bookkeeping on label arrays: `-1` marks triaged events, every other value
//! is a unit id.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::error::{Result, SortError};

/// Distinct non-negative labels, ascending.
pub fn unique_labels(labels: &[i64]) -> Vec<i64> {
    labels.iter().copied().filter(|&l| l >= 0).sorted_unstable().dedup().collect()
}

pub fn max_label(labels: &[i64]) -> i64 {
    labels.iter().copied().max().unwrap_or(-1).max(-1)
}

pub fn is_contiguous(labels: &[i64]) -> bool {
    let units = unique_labels(labels);
    units.len() as i64 == max_label(labels) + 1
}

pub fn validate_contiguous(labels: &[i64]) -> Result<()> {
    if let Some((index, &label)) = labels.iter().find_position(|&&l| l < -1) {
        return Err(SortError::InvalidLabel { index, label });
    }
    if is_contiguous(labels) {
        Ok(())
    } else {
        Err(SortError::NonContiguousLabels {
            distinct: unique_labels(labels).len(),
            max: max_label(labels),
        })
    }
}

/// Relabel so that non-negative ids become `0..K`, keeping their relative order.
/// Anything negative becomes `-1`.
pub fn compact(labels: &mut [i64]) {
    let lookup: BTreeMap<i64, i64> = unique_labels(labels)
        .into_iter()
        .enumerate()
        .map(|(new, old)| (old, new as i64))
        .collect();
    for l in labels.iter_mut() {
        *l = if *l < 0 { -1 } else { lookup[&*l] };
    }
}

/// Event indices of every unit, ascending within each unit.
pub fn members_by_label(labels: &[i64]) -> BTreeMap<i64, Vec<usize>> {
    let mut out: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, &l) in labels.iter().enumerate() {
        if l >= 0 {
            out.entry(l).or_default().push(i);
        }
    }
    out
}

pub fn counts(labels: &[i64]) -> BTreeMap<i64, usize> {
    labels.iter().copied().filter(|&l| l >= 0).counts().into_iter().collect()
}

pub fn n_triaged(labels: &[i64]) -> usize {
    labels.iter().filter(|&&l| l < 0).count()
}

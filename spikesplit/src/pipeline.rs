//! Split, template and merge passes wired to a configuration.

use log::info;

use crate::config::{MergeConfig, RunConfig, SplitConfig};
use crate::data::raw::templates_for_labels;
use crate::error::Result;
use crate::io::RunReport;
use crate::labels::{max_label, n_triaged, unique_labels};
use crate::merge::scheduler::{merge_clusters, MergeResult};
use crate::split::cache::{CacheConfig, DatasetHandle, RawHandle, WorkerContext};
use crate::split::scheduler::{split_clusters, SplitRun};

pub fn split_cache_config(dataset: DatasetHandle, raw: RawHandle, config: &SplitConfig) -> CacheConfig {
    CacheConfig {
        log_c: config.log_c,
        feature_scales: config.feature_scales,
        waveforms_kind: config.waveforms_kind.clone(),
        seed: config.seed,
        load_batch_size: config.load_batch_size,
        ..CacheConfig::new(dataset, raw)
    }
}

pub fn run_split(labels: &[i64], dataset: DatasetHandle, raw: RawHandle, config: &SplitConfig) -> Result<SplitRun> {
    let cache = split_cache_config(dataset, raw, config);
    split_clusters(labels, &cache, &config.steps, config.n_workers)
}

/// Merge pass with templates computed from `times`, or from the stored spike
/// times when none are given.
pub fn run_merge(
    labels: &[i64],
    times: Option<&[i64]>,
    dataset: DatasetHandle,
    raw: RawHandle,
    config: &MergeConfig,
    seed: u64,
) -> Result<MergeResult> {
    let cache = CacheConfig { waveforms_kind: config.waveforms_kind.clone(), seed, ..CacheConfig::new(dataset, raw) };
    let ctx = WorkerContext::open(&cache)?;
    let times = times.unwrap_or(ctx.spike_times()).to_vec();
    let n_units = (max_label(labels) + 1) as usize;
    let templates = templates_for_labels(ctx.raw(), labels, &times, n_units, ctx.n_channels())?;
    merge_clusters(labels, &times, templates, &ctx, ctx.raw(), &config.proposal.residual(), config)
}

/// Split, then merge the split result.
pub fn run_all(labels: &[i64], dataset: DatasetHandle, raw: RawHandle, config: &RunConfig) -> Result<(MergeResult, RunReport)> {
    config.validate()?;
    let split = run_split(labels, dataset.clone(), raw.clone(), &config.split)?;
    let units_after_split = unique_labels(&split.labels).len();
    info!("split: {} units in, {} out", unique_labels(labels).len(), units_after_split);

    let merged = run_merge(&split.labels, None, dataset, raw, &config.merge, config.split.seed)?;
    let report = RunReport {
        n_spikes: labels.len(),
        units_in: unique_labels(labels).len(),
        units_after_split: Some(units_after_split),
        units_after_merge: Some(unique_labels(&merged.labels).len()),
        triaged: n_triaged(&merged.labels),
        split_steps: split.reports,
        merges: merged.events.clone(),
    };
    Ok((merged, report))
}

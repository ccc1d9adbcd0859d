//! Greedy merging of units with matching templates.
//!
//! Units are visited from the largest (peak-to-peak amplitude times the square
//! root of the spike count) down. The visited unit absorbs the first proposed
//! candidate that the statistical test accepts; with `recursive` set it is
//! then visited again right away, otherwise it is done.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use spikecore::algorithm::utility::argsort;
use spikecore::waveform::residual::ResidualOracle;
use spikecore::waveform::template::Template;

use crate::config::MergeConfig;
use crate::data::raw::TemplateSource;
use crate::error::{Result, SortError};
use crate::labels::{compact, max_label, members_by_label, validate_contiguous};
use crate::merge::oracle::lda_diptest_merge;
use crate::merge::proposer::propose_merges;
use crate::split::cache::WorkerContext;

/// One accepted merge, in the ids the merge pass started from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub kept: i64,
    pub absorbed: i64,
    /// added to the spike times of the absorbed unit
    pub shift: i32,
}

#[derive(Clone, Debug)]
pub struct MergeResult {
    /// compacted labels
    pub labels: Vec<i64>,
    pub aligned_times: Vec<i64>,
    /// one template per compacted id
    pub templates: Vec<Template>,
    pub events: Vec<MergeEvent>,
}

struct MergeState {
    labels: Vec<i64>,
    times: Vec<i64>,
    members: BTreeMap<i64, Vec<usize>>,
    templates: BTreeMap<i64, Template>,
    /// visiting order, the next unit sits at the end
    worklist: Vec<i64>,
}

impl MergeState {
    fn absorb(&mut self, kept: i64, absorbed: i64, shift: i32) {
        let moved = self.members.remove(&absorbed).unwrap_or_default();
        for &i in &moved {
            self.times[i] += shift as i64;
            self.labels[i] = kept;
        }
        let target = self.members.entry(kept).or_default();
        target.extend(moved);
        target.sort_unstable();
        self.worklist.retain(|&l| l != absorbed);
        self.templates.remove(&absorbed);
    }

    fn member_times(&self, label: i64) -> Vec<i64> {
        self.members
            .get(&label)
            .map(|m| m.iter().map(|&i| self.times[i]).collect())
            .unwrap_or_default()
    }
}

/// Merge units of a contiguous labelling.
///
/// `templates[k]` is the template of unit `k`. Spike times of absorbed units
/// are shifted onto the trough of the unit that absorbed them.
pub fn merge_clusters<S, O>(
    labels: &[i64],
    times: &[i64],
    templates: Vec<Template>,
    ctx: &WorkerContext,
    source: &S,
    residual: &O,
    config: &MergeConfig,
) -> Result<MergeResult>
where
    S: TemplateSource + ?Sized,
    O: ResidualOracle + ?Sized,
{
    validate_contiguous(labels)?;
    if labels.len() != ctx.store().n_spikes() || times.len() != labels.len() {
        return Err(SortError::LabelLengthMismatch { labels: labels.len(), events: ctx.store().n_spikes() });
    }
    let n_units = (max_label(labels) + 1) as usize;
    if templates.len() != n_units {
        return Err(SortError::TemplateCountMismatch { templates: templates.len(), units: n_units });
    }
    let n_channels = ctx.n_channels();

    let members = members_by_label(labels);
    let scores: Vec<f32> = templates
        .iter()
        .enumerate()
        .map(|(k, t)| t.max_ptp() * (members.get(&(k as i64)).map_or(0, |m| m.len()) as f32).sqrt())
        .collect();
    let worklist: Vec<i64> = argsort(&scores).into_iter().map(|k| k as i64).collect();

    let mut state = MergeState {
        labels: labels.to_vec(),
        times: times.to_vec(),
        members,
        templates: templates.into_iter().enumerate().map(|(k, t)| (k as i64, t)).collect(),
        worklist,
    };
    let mut events = Vec::new();

    while state.worklist.len() >= 2 {
        let label = match state.worklist.pop() {
            Some(l) => l,
            None => break,
        };
        let others: Vec<(i64, &Template)> = state
            .worklist
            .iter()
            .filter_map(|id| state.templates.get(id).map(|t| (*id, t)))
            .collect();
        let unit_template = match state.templates.get(&label) {
            Some(t) => t,
            None => continue,
        };
        let proposals = propose_merges(unit_template, &others, residual, &config.proposal)?;

        let mut accepted = None;
        for p in &proposals {
            let (Some(members_a), Some(members_b), Some(candidate_template)) = (
                state.members.get(&label),
                state.members.get(&p.candidate),
                state.templates.get(&p.candidate),
            ) else {
                continue;
            };
            let decision = lda_diptest_merge(
                ctx,
                members_a,
                members_b,
                unit_template,
                candidate_template,
                p.shift,
                &config.oracle,
            )?;
            debug!("merge: {} <- {} score {:?}", label, p.candidate, decision.score);
            if decision.accepted {
                accepted = Some(*p);
                break;
            }
        }

        if let Some(p) = accepted {
            state.absorb(label, p.candidate, p.shift);
            let template = source.template_from_timestamps(&state.member_times(label), n_channels)?;
            state.templates.insert(label, template);
            events.push(MergeEvent { kept: label, absorbed: p.candidate, shift: p.shift });
            if config.recursive {
                state.worklist.push(label);
            }
        }
    }

    info!("merge: {} units merged, {} left", events.len(), n_units - events.len());

    let MergeState { mut labels, times, templates, .. } = state;
    compact(&mut labels);
    Ok(MergeResult {
        labels,
        aligned_times: times,
        templates: templates.into_values().collect(),
        events,
    })
}

//! Statistical merge test between two units.
//!
//! Both units are reconstructed on the channels where their summed template is
//! largest, aligned by the template shift and denoised through a temporal basis
//! fitted on the pair. A one-dimensional discriminant projection that separates
//! the two sides is then checked for unimodality: a single mode means the two
//! units are one.

use log::debug;
use nalgebra::DMatrix;
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use spikecore::algorithm::isocut::isocut;
use spikecore::algorithm::lda::Lda;
use spikecore::waveform::basis::WaveformBasis;
use spikecore::waveform::template::Template;

use crate::error::Result;
use crate::split::cache::WorkerContext;
use crate::split::projector::{gather, Gathered};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOracleOptions {
    pub tpca_rank: usize,
    pub n_channels: usize,
    pub min_spikes: usize,
    pub max_spikes: usize,
    /// pairs scoring below this are merged
    pub threshold_diptest: f64,
    pub seed: u64,
}

impl Default for MergeOracleOptions {
    fn default() -> Self {
        MergeOracleOptions {
            tpca_rank: 5,
            n_channels: 10,
            min_spikes: 10,
            max_spikes: 250,
            threshold_diptest: 0.5,
            seed: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MergeDecision {
    pub accepted: bool,
    /// unimodality score, `None` if the test could not run
    pub score: Option<f64>,
}

impl MergeDecision {
    fn reject() -> Self {
        MergeDecision { accepted: false, score: None }
    }
}

fn subsample(rng: &mut ChaCha8Rng, members: &[usize], n: usize) -> Vec<usize> {
    if members.len() <= n {
        return members.to_vec();
    }
    let mut picked: Vec<usize> = sample(rng, members.len(), n).into_iter().map(|i| members[i]).collect();
    picked.sort_unstable();
    picked
}

/// Reconstructed waveforms of the usable rows, each a `T × k` block restricted
/// to `window` samples.
fn reconstruct(basis: &WaveformBasis, gathered: &Gathered, window: std::ops::Range<usize>) -> Vec<DMatrix<f64>> {
    gathered
        .kept()
        .into_iter()
        .map(|row| {
            let full = basis.inverse_block(&gathered.block(row));
            full.rows(window.start, window.len()).into_owned()
        })
        .collect()
}

/// Decide whether the events of `members_a` and `members_b` form one unit.
///
/// `shift` is `trough(template_b) - trough(template_a)`.
pub fn lda_diptest_merge(
    ctx: &WorkerContext,
    members_a: &[usize],
    members_b: &[usize],
    template_a: &Template,
    template_b: &Template,
    shift: i32,
    opts: &MergeOracleOptions,
) -> Result<MergeDecision> {
    let basis = ctx.basis()?;
    let spike_length = basis.spike_length();
    let s = shift.unsigned_abs() as usize;
    if s >= spike_length {
        debug!("merge: shift {} leaves no overlap", shift);
        return Ok(MergeDecision::reject());
    }

    let n = opts.max_spikes.min(members_a.len()).min(members_b.len());
    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let sub_a = subsample(&mut rng, members_a, n);
    let sub_b = subsample(&mut rng, members_b, n);

    let channels = template_a.add(template_b)?.top_channels(opts.n_channels);
    let gathered_a = gather(ctx, &sub_a, &channels)?;
    let gathered_b = gather(ctx, &sub_b, &channels)?;
    let (kept_a, kept_b) = (gathered_a.kept().len(), gathered_b.kept().len());
    if kept_a < opts.min_spikes || kept_b < opts.min_spikes {
        debug!("merge: too few usable spikes ({} and {})", kept_a, kept_b);
        return Ok(MergeDecision::reject());
    }

    let overlap = spike_length - s;
    let (window_a, window_b) = if shift >= 0 {
        (0..overlap, s..spike_length)
    } else {
        (s..spike_length, 0..overlap)
    };
    let mut waveforms = reconstruct(basis, &gathered_a, window_a);
    waveforms.extend(reconstruct(basis, &gathered_b, window_b));

    // every channel of every waveform is one trace for the shared basis
    let k = channels.len();
    let traces = DMatrix::from_fn(waveforms.len() * k, overlap, |i, t| waveforms[i / k][(t, i % k)]);
    let rank = opts.tpca_rank.min(overlap).max(1);
    let pair_basis = WaveformBasis::fit(&traces, rank)?;
    let coeffs = pair_basis.transform(&traces);
    let rank = coeffs.ncols();
    let features = DMatrix::from_fn(waveforms.len(), rank * k, |i, j| coeffs[(i * k + j % k, j / k)]);

    let sides: Vec<i64> = (0..waveforms.len()).map(|i| (i >= kept_a) as i64).collect();
    let (_, projection) = Lda::fit_transform(&features, &sides, 1)?;
    let values: Vec<f64> = projection.column(0).iter().copied().collect();
    let cut = isocut(&values);
    debug!("merge: score {:.3} on {} + {} spikes", cut.score, kept_a, kept_b);

    Ok(MergeDecision { accepted: cut.score < opts.threshold_diptest, score: Some(cut.score) })
}

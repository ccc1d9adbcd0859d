use log::debug;
use serde::{Deserialize, Serialize};
use spikecore::waveform::residual::{DeconvResidual, ResidualOracle};
use spikecore::waveform::template::Template;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalOptions {
    /// residual max-norm a candidate has to stay under
    pub max_resid_dist: f32,
    /// fraction of the smallest template energy a fit must reach
    pub deconv_threshold_mul: f64,
    pub lambd: f64,
    pub allowed_scale: f64,
    pub vis_ptp_thresh: f32,
    pub max_shift: usize,
    /// threads for the residual fan-out, 0 uses the global pool
    pub n_jobs: usize,
}

impl Default for ProposalOptions {
    fn default() -> Self {
        ProposalOptions {
            max_resid_dist: 5.0,
            deconv_threshold_mul: 0.9,
            lambd: 0.001,
            allowed_scale: 0.1,
            vis_ptp_thresh: 1.0,
            max_shift: 10,
            n_jobs: 0,
        }
    }
}

impl ProposalOptions {
    /// The residual oracle these options describe.
    pub fn residual(&self) -> DeconvResidual {
        DeconvResidual {
            lambd: self.lambd,
            allowed_scale: self.allowed_scale,
            vis_ptp_thresh: self.vis_ptp_thresh,
            max_shift: self.max_shift,
            n_jobs: self.n_jobs,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Proposal {
    pub candidate: i64,
    /// `trough(candidate) - trough(unit)`
    pub shift: i32,
    pub distance: f32,
}

/// Rank the `others` by how well their templates explain `unit`'s template.
///
/// Only candidates whose residual stays under `max_resid_dist` are returned,
/// closest first; equal distances keep the order of `others`.
pub fn propose_merges<O: ResidualOracle + ?Sized>(
    unit: &Template,
    others: &[(i64, &Template)],
    oracle: &O,
    opts: &ProposalOptions,
) -> Result<Vec<Proposal>> {
    if others.is_empty() {
        return Ok(Vec::new());
    }
    let smallest = others
        .iter()
        .map(|(_, t)| t.energy())
        .fold(unit.energy(), f64::min);
    let threshold = opts.deconv_threshold_mul * smallest;

    let candidates: Vec<&Template> = others.iter().map(|(_, t)| *t).collect();
    let residuals = oracle.residuals(unit, &candidates, threshold)?;

    let unit_trough = unit.trough() as i32;
    let mut proposals: Vec<Proposal> = others
        .iter()
        .zip(residuals.iter())
        .filter(|(_, r)| r.distance < opts.max_resid_dist)
        .map(|((id, t), r)| Proposal {
            candidate: *id,
            shift: t.trough() as i32 - unit_trough,
            distance: r.distance,
        })
        .collect();
    proposals.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    debug!("{} of {} candidates pass the residual cut", proposals.len(), others.len());
    Ok(proposals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spike(n_channels: usize, on: usize, trough_at: usize, amp: f32) -> Template {
        let mut t = Template::zeros(32, n_channels);
        t.set(trough_at, on, -amp);
        t.set(trough_at + 1, on, -0.4 * amp);
        t.set(trough_at + 4, on, 0.3 * amp);
        t
    }

    #[test]
    fn test_close_templates_are_proposed_in_order() {
        let unit = spike(3, 0, 10, 10.0);
        let exact = spike(3, 0, 12, 10.0);
        let mut near = spike(3, 0, 10, 10.0);
        near.set(20, 0, 2.0);
        let far = spike(3, 2, 10, 10.0);

        let others = [(4, &far), (7, &near), (9, &exact)];
        let opts = ProposalOptions::default();
        let proposals = propose_merges(&unit, &others, &opts.residual(), &opts).unwrap();

        let ids: Vec<i64> = proposals.iter().map(|p| p.candidate).collect();
        assert_eq!(ids, vec![9, 7]);
        assert_eq!(proposals[0].shift, 2);
        assert_eq!(proposals[1].shift, 0);
        assert!(proposals[0].distance <= proposals[1].distance);
    }

    #[test]
    fn test_dissimilar_templates_give_nothing() {
        let unit = spike(2, 0, 10, 10.0);
        let other = spike(2, 1, 10, 10.0);
        let opts = ProposalOptions::default();
        let proposals = propose_merges(&unit, &[(1, &other)], &opts.residual(), &opts).unwrap();
        assert!(proposals.is_empty());
    }

    #[test]
    fn test_no_others() {
        let unit = spike(2, 0, 10, 10.0);
        let opts = ProposalOptions::default();
        assert!(propose_merges(&unit, &[], &opts.residual(), &opts).unwrap().is_empty());
    }
}

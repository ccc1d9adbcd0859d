use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use spikecore::algorithm::pca::Pca;
use spikecore::algorithm::utility::{corrcoef, l2_norm};

use crate::error::Result;
use crate::split::cache::WorkerContext;
use crate::split::family::{scatter_sub_labels, Verdict};
use crate::split::projector::gather_max_channel;

const EM_ITERATIONS: usize = 50;
const DIRECTION_UPDATE_START: usize = 10;
const VARIANCE_FLOOR: f64 = 1e-6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PursuitOptions {
    pub min_size_split: usize,
    // features are reduced to this many PCs first if the basis is larger
    pub unit_rank: usize,
    // start from the top PC instead of the mean direction
    pub top_pc_init: bool,
    // both sides need at least this mean responsibility
    pub aucsplit: f64,
    pub max_split_corr: f64,
    pub min_amp_sim: f64,
    pub min_split_prop: f64,
}

impl Default for PursuitOptions {
    fn default() -> Self {
        PursuitOptions {
            min_size_split: 50,
            unit_rank: 3,
            top_pc_init: true,
            aucsplit: 0.85,
            max_split_corr: 0.9,
            min_amp_sim: 0.2,
            min_split_prop: 0.05,
        }
    }
}

struct Mixture {
    mu1: f64,
    mu2: f64,
    s1: f64,
    s2: f64,
    p: f64,
}

impl Mixture {
    /// split at the mean: component 1 above, component 2 below
    fn initial(x: &DVector<f64>) -> Option<Self> {
        let mean = x.mean();
        let above: Vec<f64> = x.iter().copied().filter(|&v| v > mean).collect();
        let below: Vec<f64> = x.iter().copied().filter(|&v| v < mean).collect();
        if above.is_empty() || below.is_empty() {
            return None;
        }
        let stats = |v: &[f64]| {
            let m = v.iter().sum::<f64>() / v.len() as f64;
            let s = v.iter().map(|a| (a - m) * (a - m)).sum::<f64>() / v.len() as f64;
            (m, s)
        };
        let (mu1, s1) = stats(&above);
        let (mu2, s2) = stats(&below);
        Some(Mixture { mu1, mu2, s1, s2, p: above.len() as f64 / x.len() as f64 })
    }

    /// normalised responsibilities, `n × 2`
    fn responsibilities(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let mut rs = DMatrix::zeros(x.len(), 2);
        for (i, &v) in x.iter().enumerate() {
            let l1 = -0.5 * self.s1.ln() - (v - self.mu1).powi(2) / (2.0 * self.s1) + self.p.ln();
            let l2 = -0.5 * self.s2.ln() - (v - self.mu2).powi(2) / (2.0 * self.s2) + (1.0 - self.p).ln();
            let top = l1.max(l2);
            let (e1, e2) = ((l1 - top).exp(), (l2 - top).exp());
            rs[(i, 0)] = e1 / (e1 + e2);
            rs[(i, 1)] = e2 / (e1 + e2);
        }
        rs
    }

    fn update(&mut self, x: &DVector<f64>, rs: &DMatrix<f64>) {
        let (w1, w2) = (rs.column(0).sum(), rs.column(1).sum());
        self.p = w1 / x.len() as f64;
        self.mu1 = rs.column(0).dot(x) / w1;
        self.mu2 = rs.column(1).dot(x) / w2;
        self.s1 = rs.column(0).iter().zip(x.iter()).map(|(r, v)| r * (v - self.mu1).powi(2)).sum::<f64>() / w1;
        self.s2 = rs.column(1).iter().zip(x.iter()).map(|(r, v)| r * (v - self.mu2).powi(2)).sum::<f64>() / w2;
    }
}

/// Pursuit direction given the current responsibilities, or `None` if the
/// weighted second moment cannot be inverted.
fn reestimate_direction(features: &DMatrix<f64>, rs: &DMatrix<f64>, m: &Mixture) -> Option<DVector<f64>> {
    let n = features.nrows() as f64;
    let weights = DVector::from_fn(features.nrows(), |i, _| rs[(i, 0)] / m.s1 + rs[(i, 1)] / m.s2);
    let targets = DVector::from_fn(features.nrows(), |i, _| rs[(i, 0)] * m.mu1 / m.s1 + rs[(i, 1)] * m.mu2 / m.s2);

    let mut weighted = features.clone();
    for (i, mut row) in weighted.row_iter_mut().enumerate() {
        row *= weights[i];
    }
    let sts = features.transpose() * weighted / n;
    let stmu = features.transpose() * targets / n;
    let w = sts.lu().solve(&stmu)?;
    let norm = w.norm();
    if norm > 0.0 && norm.is_finite() {
        Some(w / norm)
    } else {
        None
    }
}

/// Two-component Gaussian mixture along a pursued direction of the
/// max-channel projections, guarded against splitting a unit into two copies
/// of the same waveform.
pub fn bimodal_pursuit_split(ctx: &WorkerContext, members: &[usize], opts: &PursuitOptions) -> Result<Verdict> {
    let basis = ctx.basis()?;
    let projections = gather_max_channel(ctx, members)?;
    let kept: Vec<usize> = (0..members.len())
        .filter(|&i| projections.row(i).iter().all(|v| v.is_finite()))
        .collect();
    if kept.len() < opts.min_size_split {
        debug!("bimodal_pursuit: only {} of {} members usable", kept.len(), members.len());
        return Ok(Verdict::NoSplit);
    }
    let raw = projections.select_rows(kept.iter());

    let features = if opts.unit_rank < raw.ncols() {
        Pca::fit_transform(&raw, opts.unit_rank, false)?.1
    } else {
        raw.clone()
    };

    let mut w: DVector<f64> = if opts.top_pc_init {
        Pca::fit(&features, 1, false)?.components.row(0).transpose()
    } else {
        let mean = features.row_mean().transpose();
        let norm = mean.norm();
        if norm <= 0.0 {
            return Ok(Verdict::NoSplit);
        }
        mean / norm
    };

    let mut x = &features * &w;
    let mut mixture = match Mixture::initial(&x) {
        Some(m) => m,
        None => return Ok(Verdict::NoSplit),
    };

    let mut rs: Option<DMatrix<f64>> = None;
    for k in 0..EM_ITERATIONS {
        if mixture.s1.min(mixture.s2) < VARIANCE_FLOOR {
            break;
        }
        let r = mixture.responsibilities(&x);
        let total_min = r.column(0).sum().min(r.column(1).sum());
        if total_min < VARIANCE_FLOOR {
            rs = Some(r);
            break;
        }
        mixture.update(&x, &r);
        if mixture.s1.min(mixture.s2) < VARIANCE_FLOOR {
            rs = Some(r);
            break;
        }
        if k >= DIRECTION_UPDATE_START && k % 2 == 0 {
            match reestimate_direction(&features, &r, &mixture) {
                Some(next) => {
                    w = next;
                    x = &features * &w;
                }
                None => {
                    rs = Some(r);
                    break;
                }
            }
        }
        rs = Some(r);
    }
    let rs = match rs {
        Some(rs) => rs,
        None => return Ok(Verdict::NoSplit),
    };

    let low: Vec<bool> = (0..kept.len()).map(|i| rs[(i, 0)] > rs[(i, 1)]).collect();
    let n_low = low.iter().filter(|&&l| l).count();
    let n_high = kept.len() - n_low;
    let smaller = n_low.min(n_high) as f64 / kept.len() as f64;
    if smaller < opts.min_split_prop || n_low == 0 || n_high == 0 {
        return Ok(Verdict::NoSplit);
    }

    let p_low = (0..kept.len()).filter(|&i| low[i]).map(|i| rs[(i, 0)]).sum::<f64>() / n_low as f64;
    let p_high = (0..kept.len()).filter(|&i| !low[i]).map(|i| rs[(i, 1)]).sum::<f64>() / n_high as f64;

    // mean waveforms of both sides on the max channel
    let side_mean = |want: bool| {
        let rows: Vec<usize> = (0..kept.len()).filter(|&i| low[i] == want).collect();
        let mean = DMatrix::from_iterator(1, raw.ncols(), raw.select_rows(rows.iter()).row_mean().iter().copied());
        basis.inverse_transform(&mean).row(0).iter().copied().collect::<Vec<f64>>()
    };
    let c1 = side_mean(true);
    let c2 = side_mean(false);
    let cc = corrcoef(&c1, &c2);
    let (n1, n2) = (l2_norm(&c1), l2_norm(&c2));
    let amp_diff = if n1 + n2 > 0.0 { 2.0 * (n1 - n2).abs() / (n1 + n2) } else { 0.0 };
    if cc > opts.max_split_corr && amp_diff < opts.min_amp_sim {
        debug!("bimodal_pursuit: sides look alike (corr {:.3}, amplitude diff {:.3})", cc, amp_diff);
        return Ok(Verdict::NoSplit);
    }

    if smaller > opts.min_split_prop && p_low.min(p_high) > opts.aucsplit {
        let assigned: Vec<i64> = low.iter().map(|&l| if l { 0 } else { 1 }).collect();
        Ok(Verdict::Split { sub_labels: scatter_sub_labels(members.len(), &kept, &assigned) })
    } else {
        Ok(Verdict::NoSplit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SyntheticDataset;

    #[test]
    fn test_amplitude_groups_split() {
        let ds = SyntheticDataset::builder().group(100, 1.0).group(100, 2.0).seed(9).build();
        let ctx = ds.context();
        let members: Vec<usize> = (0..200).collect();
        match bimodal_pursuit_split(&ctx, &members, &PursuitOptions::default()).unwrap() {
            Verdict::Split { sub_labels } => {
                assert!(sub_labels[..100].iter().all(|&l| l == sub_labels[0]));
                assert!(sub_labels[100..].iter().all(|&l| l == sub_labels[100]));
                assert_ne!(sub_labels[0], sub_labels[100]);
            }
            Verdict::NoSplit => panic!("expected a split"),
        }
    }

    #[test]
    fn test_same_waveform_is_not_split() {
        let ds = SyntheticDataset::builder().group(300, 1.5).seed(4).build();
        let ctx = ds.context();
        let members = ds.members(0);
        assert_eq!(
            bimodal_pursuit_split(&ctx, &members, &PursuitOptions::default()).unwrap(),
            Verdict::NoSplit
        );
    }

    #[test]
    fn test_narrow_component_owns_the_shared_mean() {
        // equal weights and means: only the variance term can break the tie
        let m = Mixture { mu1: 0.0, mu2: 0.0, s1: 1.0, s2: 4.0, p: 0.5 };
        let rs = m.responsibilities(&DVector::from_vec(vec![0.0, 5.0]));
        assert!((rs[(0, 0)] - 2.0 / 3.0).abs() < 1e-12);
        assert!(rs[(1, 1)] > 0.9);
    }

    #[test]
    fn test_initial_mixture_needs_two_sides() {
        assert!(Mixture::initial(&DVector::from_vec(vec![1.0, 1.0, 1.0])).is_none());
        let m = Mixture::initial(&DVector::from_vec(vec![0.0, 0.0, 4.0, 4.0])).unwrap();
        assert_eq!((m.mu1, m.mu2, m.p), (4.0, 0.0, 0.5));
    }
}

//! Template-against-template residuals.
//!
//! A candidate template is fitted to a query template over a window of time
//! lags with a scale close to one. If the best fit explains enough of the query
//! the residual is what is left of it; otherwise the query is left untouched.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::{CoreError, Result};
use crate::waveform::template::Template;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Residual {
    /// max-norm of the residual over visible channels
    pub distance: f32,
    /// `trough(candidate) - trough(query)`, in samples
    pub shift: i32,
}

/// Computes the residual of one query template against several candidates.
pub trait ResidualOracle: Sync {
    /// `threshold` is the least objective a fit needs to count as a match.
    fn residuals(&self, query: &Template, candidates: &[&Template], threshold: f64) -> Result<Vec<Residual>>;
}

#[derive(Clone, Debug)]
pub struct DeconvResidual {
    // ridge term on the scale estimate
    pub lambd: f64,
    // scale is clamped to 1 +- allowed_scale
    pub allowed_scale: f64,
    // channels below this ptp in both templates do not count
    pub vis_ptp_thresh: f32,
    // largest lag tried, in samples
    pub max_shift: usize,
    // threads for the candidate fan-out, 0 = global pool
    pub n_jobs: usize,
}

impl Default for DeconvResidual {
    fn default() -> Self {
        DeconvResidual {
            lambd: 0.001,
            allowed_scale: 0.1,
            vis_ptp_thresh: 1.0,
            max_shift: 10,
            n_jobs: 0,
        }
    }
}

impl DeconvResidual {
    fn visible_channels(&self, query: &Template, candidate: &Template) -> Vec<usize> {
        let pq = query.ptp_per_channel();
        let pc = candidate.ptp_per_channel();
        let vis: Vec<usize> = (0..query.n_channels)
            .filter(|&c| pq[c] > self.vis_ptp_thresh || pc[c] > self.vis_ptp_thresh)
            .collect();
        if vis.is_empty() {
            (0..query.n_channels).collect()
        } else {
            vis
        }
    }

    /// candidate value at `t` after delaying it by `lag` samples
    #[inline]
    fn shifted(candidate: &Template, t: usize, c: usize, lag: i64) -> f64 {
        let src = t as i64 - lag;
        if src < 0 || src >= candidate.n_samples as i64 {
            0.0
        } else {
            candidate.at(src as usize, c) as f64
        }
    }

    fn single(&self, query: &Template, candidate: &Template, threshold: f64) -> Result<Residual> {
        if query.n_samples != candidate.n_samples || query.n_channels != candidate.n_channels {
            return Err(CoreError::ShapeMismatch(format!(
                "query is {}x{}, candidate is {}x{}",
                query.n_samples, query.n_channels, candidate.n_samples, candidate.n_channels
            )));
        }
        let vis = self.visible_channels(query, candidate);
        let max_shift = self.max_shift.min(query.n_samples.saturating_sub(1)) as i64;
        let (lo, hi) = (1.0 - self.allowed_scale, 1.0 + self.allowed_scale);

        // (objective, lag, scale); ties keep the smallest |lag|, then the negative one
        let mut best: Option<(f64, i64, f64)> = None;
        let mut lags: Vec<i64> = (-max_shift..=max_shift).collect();
        lags.sort_by_key(|l| (l.abs(), *l));
        for lag in lags {
            let (mut ip, mut nc) = (0.0f64, 0.0f64);
            for t in 0..query.n_samples {
                for c in 0..query.n_channels {
                    let s = Self::shifted(candidate, t, c, lag);
                    ip += query.at(t, c) as f64 * s;
                    nc += s * s;
                }
            }
            let a = ((ip + self.lambd) / (nc + self.lambd)).clamp(lo, hi);
            let obj = 2.0 * a * ip - a * a * nc;
            if best.map_or(true, |(b, _, _)| obj > b) {
                best = Some((obj, lag, a));
            }
        }

        let (obj, lag, a) = best.unwrap_or((f64::NEG_INFINITY, 0, 1.0));
        let mut distance = 0.0f32;
        for t in 0..query.n_samples {
            for &c in &vis {
                let q = query.at(t, c) as f64;
                let r = if obj < threshold { q } else { q - a * Self::shifted(candidate, t, c, lag) };
                distance = distance.max(r.abs() as f32);
            }
        }
        let shift = if obj < threshold {
            candidate.trough() as i32 - query.trough() as i32
        } else {
            -lag as i32
        };
        Ok(Residual { distance, shift })
    }
}

impl ResidualOracle for DeconvResidual {
    fn residuals(&self, query: &Template, candidates: &[&Template], threshold: f64) -> Result<Vec<Residual>> {
        let run = || {
            candidates
                .par_iter()
                .map(|c| self.single(query, c, threshold))
                .collect::<Result<Vec<_>>>()
        };
        if self.n_jobs > 0 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.n_jobs)
                .build()
                .map_err(|e| CoreError::ThreadPool(e.to_string()))?;
            pool.install(run)
        } else {
            run()
        }
    }
}

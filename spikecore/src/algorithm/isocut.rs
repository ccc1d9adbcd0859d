//! Unimodality cut test for one-dimensional samples.
//!
//! The sorted samples are binned so that bins hold few points in the tails and
//! many in the middle. A unimodal (up then down) isotonic regression is fit to
//! the bin densities; the score is a Kolmogorov–Smirnov style distance between
//! the observed and the fitted bin counts, scaled by the square root of the
//! mass involved, measured from the peak outwards on the worse side. The cut
//! point sits at the deepest dip of the residual density on that side.

use crate::algorithm::utility::{argmax, argmin};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IsoCut {
    /// large values mean the samples are unlikely to come from one mode
    pub score: f64,
    pub cutpoint: f64,
}

pub fn isocut(samples: &[f64]) -> IsoCut {
    let mut x: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    x.sort_by(|a, b| a.total_cmp(b));
    let n = x.len();
    if n < 4 {
        let cutpoint = if n == 0 { 0.0 } else { x[n / 2] };
        return IsoCut { score: 0.0, cutpoint };
    }
    let span = x[n - 1] - x[0];
    if span <= 0.0 {
        return IsoCut { score: 0.0, cutpoint: x[0] };
    }

    // bin edges as sample indices, growing towards the centre
    let num_bins = ((n as f64 / 2.0).sqrt().ceil() as usize).max(2);
    let left_bins = (num_bins + 1) / 2;
    let right_bins = num_bins - left_bins;
    let intervals: Vec<f64> = (1..=left_bins)
        .chain((1..=right_bins).rev())
        .map(|i| i as f64)
        .collect();
    let alpha = (n - 1) as f64 / intervals.iter().sum::<f64>();

    let mut inds = vec![0usize];
    let mut acc = 0.0;
    for iv in &intervals {
        acc += iv * alpha;
        let idx = (acc.floor() as usize).min(n - 1);
        if idx > inds[inds.len() - 1] {
            inds.push(idx);
        }
    }
    if inds[inds.len() - 1] != n - 1 {
        inds.push(n - 1);
    }

    let x_sub: Vec<f64> = inds.iter().map(|&i| x[i]).collect();
    let n_bins = inds.len() - 1;
    let min_spacing = span * 1e-9;
    let spacings: Vec<f64> = x_sub.windows(2).map(|w| (w[1] - w[0]).max(min_spacing)).collect();
    let multiplicities: Vec<f64> = inds.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let densities: Vec<f64> = multiplicities
        .iter()
        .zip(spacings.iter())
        .map(|(m, s)| m / s)
        .collect();

    let fit = up_down_isotonic(&densities, &spacings);
    let fit_counts: Vec<f64> = fit.iter().zip(spacings.iter()).map(|(f, s)| f * s).collect();
    let peak = argmax(&fit).unwrap_or(0);

    let (ks_left, n_left) = compute_ks(&multiplicities[..=peak], &fit_counts[..=peak]);
    let counts_right: Vec<f64> = multiplicities[peak..].iter().rev().copied().collect();
    let fit_right: Vec<f64> = fit_counts[peak..].iter().rev().copied().collect();
    let (ks_right, n_right) = compute_ks(&counts_right, &fit_right);

    let (score, critical) = if ks_left > ks_right {
        (ks_left, 0..n_left.max(1))
    } else {
        (ks_right, n_bins - n_right.max(1)..n_bins)
    };

    let resid: Vec<f64> = densities[critical.clone()]
        .iter()
        .zip(fit[critical.clone()].iter())
        .map(|(d, f)| d - f)
        .collect();
    let resid_fit = down_up_isotonic(&resid, &spacings[critical.clone()]);
    let cut_bin = critical.start + argmin(&resid_fit).unwrap_or(0);
    let cutpoint = 0.5 * (x_sub[cut_bin] + x_sub[cut_bin + 1]);

    IsoCut { score, cutpoint }
}

/// KS distance between two count profiles over shrinking prefixes; returns the
/// best scaled distance and the prefix length that produced it.
fn compute_ks(counts1: &[f64], counts2: &[f64]) -> (f64, usize) {
    let len = counts1.len();
    if len == 0 {
        return (0.0, 0);
    }
    let mut best = (-1.0f64, len);
    let mut n1 = len;
    loop {
        let s1: f64 = counts1[..n1].iter().sum();
        let s2: f64 = counts2[..n1].iter().sum();
        if s1 > 0.0 && s2 > 0.0 {
            let (mut c1, mut c2, mut ks) = (0.0, 0.0, 0.0f64);
            for j in 0..n1 {
                c1 += counts1[j];
                c2 += counts2[j];
                ks = ks.max((c1 / s1 - c2 / s2).abs());
            }
            ks *= ((s1 + s2) / 2.0).sqrt();
            if ks > best.0 {
                best = (ks, n1);
            }
        }
        n1 /= 2;
        if n1 < 4 {
            break;
        }
    }
    (best.0.max(0.0), best.1)
}

#[derive(Clone, Copy)]
struct Block {
    w: f64,
    wy: f64,
    wyy: f64,
    len: usize,
}

impl Block {
    fn mean(&self) -> f64 {
        self.wy / self.w
    }
    fn sse(&self) -> f64 {
        (self.wyy - self.wy * self.wy / self.w).max(0.0)
    }
    fn merge(self, other: Block) -> Block {
        Block {
            w: self.w + other.w,
            wy: self.wy + other.wy,
            wyy: self.wyy + other.wyy,
            len: self.len + other.len,
        }
    }
}

/// Pool-adjacent-violators pass; returns the final blocks and the weighted
/// squared error of the best non-decreasing fit of every prefix.
fn pava(y: &[f64], w: &[f64]) -> (Vec<Block>, Vec<f64>) {
    let mut stack: Vec<Block> = Vec::with_capacity(y.len());
    let mut prefix_sse = Vec::with_capacity(y.len());
    let mut total = 0.0;
    for (&yi, &wi) in y.iter().zip(w.iter()) {
        let wi = wi.max(f64::MIN_POSITIVE);
        let mut cur = Block { w: wi, wy: wi * yi, wyy: wi * yi * yi, len: 1 };
        while let Some(prev) = stack.last() {
            if prev.mean() <= cur.mean() {
                break;
            }
            let prev = stack.pop().unwrap_or(cur);
            total -= prev.sse();
            cur = prev.merge(cur);
        }
        total += cur.sse();
        stack.push(cur);
        prefix_sse.push(total);
    }
    (stack, prefix_sse)
}

pub fn isotonic_increasing(y: &[f64], w: &[f64]) -> Vec<f64> {
    let (blocks, _) = pava(y, w);
    let mut out = Vec::with_capacity(y.len());
    for b in blocks {
        out.extend(std::iter::repeat(b.mean()).take(b.len));
    }
    out
}

fn isotonic_decreasing(y: &[f64], w: &[f64]) -> Vec<f64> {
    let yr: Vec<f64> = y.iter().rev().copied().collect();
    let wr: Vec<f64> = w.iter().rev().copied().collect();
    let mut fit = isotonic_increasing(&yr, &wr);
    fit.reverse();
    fit
}

/// Best weighted fit that increases up to some peak and decreases after it.
pub fn up_down_isotonic(y: &[f64], w: &[f64]) -> Vec<f64> {
    let n = y.len();
    if n == 0 {
        return Vec::new();
    }
    let (_, inc_sse) = pava(y, w);
    let yr: Vec<f64> = y.iter().rev().copied().collect();
    let wr: Vec<f64> = w.iter().rev().copied().collect();
    let (_, dec_sse_rev) = pava(&yr, &wr);

    let totals: Vec<f64> = (0..n).map(|k| inc_sse[k] + dec_sse_rev[n - 1 - k]).collect();
    let k = argmin(&totals).unwrap_or(0);

    let left = isotonic_increasing(&y[..=k], &w[..=k]);
    let right = isotonic_decreasing(&y[k..], &w[k..]);
    let mut out = Vec::with_capacity(n);
    out.extend_from_slice(&left[..k]);
    out.push(left[k].max(right[0]));
    out.extend_from_slice(&right[1..]);
    out
}

/// Best weighted fit that decreases down to some trough and increases after it.
pub fn down_up_isotonic(y: &[f64], w: &[f64]) -> Vec<f64> {
    let neg: Vec<f64> = y.iter().map(|v| -v).collect();
    up_down_isotonic(&neg, w).into_iter().map(|v| -v).collect()
}

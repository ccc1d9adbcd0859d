use serde::{Deserialize, Serialize};

use crate::algorithm::utility::argsort_desc;
use crate::error::{CoreError, Result};

/// Multi-channel waveform, `n_samples × n_channels`, stored row-major
/// (all channels of sample 0 first).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub n_samples: usize,
    pub n_channels: usize,
    pub data: Vec<f32>,
}

impl Template {
    pub fn zeros(n_samples: usize, n_channels: usize) -> Self {
        Template { n_samples, n_channels, data: vec![0.0; n_samples * n_channels] }
    }

    pub fn from_data(n_samples: usize, n_channels: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != n_samples * n_channels {
            return Err(CoreError::ShapeMismatch(format!(
                "template of {}x{} needs {} values, got {}",
                n_samples,
                n_channels,
                n_samples * n_channels,
                data.len()
            )));
        }
        Ok(Template { n_samples, n_channels, data })
    }

    #[inline]
    pub fn at(&self, t: usize, c: usize) -> f32 {
        self.data[t * self.n_channels + c]
    }

    #[inline]
    pub fn set(&mut self, t: usize, c: usize, value: f32) {
        self.data[t * self.n_channels + c] = value;
    }

    pub fn channel(&self, c: usize) -> Vec<f32> {
        (0..self.n_samples).map(|t| self.at(t, c)).collect()
    }

    pub fn ptp_per_channel(&self) -> Vec<f32> {
        let mut lo = vec![f32::INFINITY; self.n_channels];
        let mut hi = vec![f32::NEG_INFINITY; self.n_channels];
        for row in self.data.chunks_exact(self.n_channels.max(1)) {
            for (c, &v) in row.iter().enumerate() {
                lo[c] = lo[c].min(v);
                hi[c] = hi[c].max(v);
            }
        }
        lo.iter()
            .zip(hi.iter())
            .map(|(l, h)| if l.is_finite() && h.is_finite() { h - l } else { 0.0 })
            .collect()
    }

    pub fn max_ptp(&self) -> f32 {
        self.ptp_per_channel().into_iter().fold(0.0, f32::max)
    }

    /// channel with the largest peak-to-peak, first one on ties
    pub fn max_channel(&self) -> usize {
        argsort_desc(&self.ptp_per_channel()).first().copied().unwrap_or(0)
    }

    /// sample index of the minimum on the max channel
    pub fn trough(&self) -> usize {
        let c = self.max_channel();
        (0..self.n_samples)
            .fold((0, f32::INFINITY), |(bi, bv), t| {
                let v = self.at(t, c);
                if v < bv {
                    (t, v)
                } else {
                    (bi, bv)
                }
            })
            .0
    }

    /// squared Frobenius norm
    pub fn energy(&self) -> f64 {
        self.data.iter().map(|&v| (v as f64) * (v as f64)).sum()
    }

    /// `n` channels ordered by decreasing peak-to-peak
    pub fn top_channels(&self, n: usize) -> Vec<usize> {
        argsort_desc(&self.ptp_per_channel()).into_iter().take(n).collect()
    }

    pub fn add(&self, other: &Template) -> Result<Template> {
        if self.n_samples != other.n_samples || self.n_channels != other.n_channels {
            return Err(CoreError::ShapeMismatch(format!(
                "cannot add templates {}x{} and {}x{}",
                self.n_samples, self.n_channels, other.n_samples, other.n_channels
            )));
        }
        let data = self.data.iter().zip(other.data.iter()).map(|(a, b)| a + b).collect();
        Ok(Template { n_samples: self.n_samples, n_channels: self.n_channels, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spike() -> Template {
        // channel 1 carries the big deflection at t = 3
        let mut t = Template::zeros(8, 3);
        t.set(3, 1, -6.0);
        t.set(5, 1, 2.0);
        t.set(2, 0, -1.0);
        t.set(6, 2, 0.5);
        t
    }

    #[test]
    fn test_ptp_and_max_channel() {
        let t = spike();
        assert_eq!(t.ptp_per_channel(), vec![1.0, 8.0, 0.5]);
        assert_eq!(t.max_ptp(), 8.0);
        assert_eq!(t.max_channel(), 1);
        assert_eq!(t.trough(), 3);
        assert_eq!(t.top_channels(2), vec![1, 0]);
    }

    #[test]
    fn test_energy_and_add() {
        let t = spike();
        assert!((t.energy() - (36.0 + 4.0 + 1.0 + 0.25)).abs() < 1e-9);
        let double = t.add(&t).unwrap();
        assert_eq!(double.at(3, 1), -12.0);
        assert!(t.add(&Template::zeros(8, 2)).is_err());
    }
}

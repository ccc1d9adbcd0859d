use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::algorithm::pca::Pca;
use crate::error::{CoreError, Result};

/// Temporal basis shared by every channel: a rank-`R` PCA over single-channel
/// traces of `spike_length` samples. Projections are `R` coefficients per
/// channel; reconstruction adds the mean trace back.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WaveformBasis {
    /// mean trace, `spike_length` samples
    pub mean: Vec<f64>,
    /// `rank` rows of `spike_length` samples
    pub components: Vec<Vec<f64>>,
}

impl WaveformBasis {
    /// Fit on `traces`, one single-channel trace per row.
    pub fn fit(traces: &DMatrix<f64>, rank: usize) -> Result<Self> {
        let pca = Pca::fit(traces, rank, false)?;
        Ok(WaveformBasis {
            mean: pca.mean.iter().copied().collect(),
            components: pca
                .components
                .row_iter()
                .map(|r| r.iter().copied().collect())
                .collect(),
        })
    }

    /// Build from an explicit orthonormal set of rows and a mean.
    pub fn from_parts(mean: Vec<f64>, components: Vec<Vec<f64>>) -> Result<Self> {
        if components.iter().any(|c| c.len() != mean.len()) {
            return Err(CoreError::ShapeMismatch(format!(
                "basis rows must have {} samples",
                mean.len()
            )));
        }
        Ok(WaveformBasis { mean, components })
    }

    pub fn rank(&self) -> usize {
        self.components.len()
    }

    pub fn spike_length(&self) -> usize {
        self.mean.len()
    }

    fn component_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.rank(), self.spike_length(), |r, t| self.components[r][t])
    }

    /// `n × T` traces to `n × R` coefficients.
    pub fn transform(&self, traces: &DMatrix<f64>) -> DMatrix<f64> {
        let mean = DVector::from_column_slice(&self.mean).transpose();
        let mut centered = traces.clone();
        for mut row in centered.row_iter_mut() {
            row -= &mean;
        }
        centered * self.component_matrix().transpose()
    }

    /// `n × R` coefficients back to `n × T` traces.
    pub fn inverse_transform(&self, coeffs: &DMatrix<f64>) -> DMatrix<f64> {
        let mean = DVector::from_column_slice(&self.mean).transpose();
        let mut traces = coeffs * self.component_matrix();
        for mut row in traces.row_iter_mut() {
            row += &mean;
        }
        traces
    }

    /// Reconstruct a multi-channel block: `R × k` coefficients (one column per
    /// channel) to `T × k` samples.
    pub fn inverse_block(&self, coeffs: &DMatrix<f64>) -> DMatrix<f64> {
        self.inverse_transform(&coeffs.transpose()).transpose()
    }

    /// Project a multi-channel block: `T × k` samples to `R × k` coefficients.
    pub fn project_block(&self, block: &DMatrix<f64>) -> DMatrix<f64> {
        self.transform(&block.transpose()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traces() -> DMatrix<f64> {
        // two underlying shapes mixed with varying weights
        let t = 12;
        let a: Vec<f64> = (0..t).map(|i| (i as f64 * 0.5).sin()).collect();
        let b: Vec<f64> = (0..t).map(|i| if i == 4 { -3.0 } else { 0.0 }).collect();
        DMatrix::from_fn(40, t, |r, c| (r % 7) as f64 * a[c] + (r % 5) as f64 * b[c])
    }

    #[test]
    fn test_rank_two_data_reconstructs_exactly() {
        let x = traces();
        let basis = WaveformBasis::fit(&x, 2).unwrap();
        assert_eq!(basis.rank(), 2);
        assert_eq!(basis.spike_length(), 12);
        let back = basis.inverse_transform(&basis.transform(&x));
        assert!((back - &x).abs().max() < 1e-9);
    }

    #[test]
    fn test_block_helpers_agree_with_row_transforms() {
        let x = traces();
        let basis = WaveformBasis::fit(&x, 2).unwrap();
        let block = x.rows(0, 3).transpose();
        let coeffs = basis.project_block(&block);
        assert_eq!(coeffs.shape(), (2, 3));
        let back = basis.inverse_block(&coeffs);
        assert!((back - block).abs().max() < 1e-9);
    }

    #[test]
    fn test_from_parts_checks_lengths() {
        assert!(WaveformBasis::from_parts(vec![0.0; 4], vec![vec![1.0; 3]]).is_err());
    }
}

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Principal component analysis fitted through the eigen-decomposition of the
/// sample covariance. Rows of the input are observations.
///
/// Component signs are fixed so that the entry with the largest magnitude of
/// every component is positive, which keeps projections reproducible across runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pca {
    pub mean: DVector<f64>,
    /// `n_components × n_features`
    pub components: DMatrix<f64>,
    /// eigenvalues of the covariance (ddof = 1), descending
    pub explained_variance: DVector<f64>,
    pub whiten: bool,
}

const WHITEN_FLOOR: f64 = 1e-12;

impl Pca {
    pub fn fit(x: &DMatrix<f64>, n_components: usize, whiten: bool) -> Result<Self> {
        let (n, d) = x.shape();
        if n < 2 {
            return Err(CoreError::NotEnoughSamples { needed: 2, got: n });
        }
        if d == 0 || n_components == 0 {
            return Err(CoreError::ShapeMismatch(format!(
                "pca needs features and components, got d={} k={}",
                d, n_components
            )));
        }
        let k = n_components.min(d).min(n);

        let mean = x.row_mean().transpose();
        let mut centered = x.clone();
        for mut row in centered.row_iter_mut() {
            row -= mean.transpose();
        }
        let cov = (centered.transpose() * &centered) / (n as f64 - 1.0);
        let eigen = SymmetricEigen::try_new(cov, 1e-12, 0)
            .ok_or(CoreError::Decomposition("pca covariance eigen"))?;

        let mut order: Vec<usize> = (0..d).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut components = DMatrix::zeros(k, d);
        let mut explained_variance = DVector::zeros(k);
        for (row, &j) in order.iter().take(k).enumerate() {
            let mut v = eigen.eigenvectors.column(j).into_owned();
            let pivot = v.iter().fold(0.0f64, |acc, &e| if e.abs() > acc.abs() { e } else { acc });
            if pivot < 0.0 {
                v = -v;
            }
            components.set_row(row, &v.transpose());
            explained_variance[row] = eigen.eigenvalues[j].max(0.0);
        }

        Ok(Pca { mean, components, explained_variance, whiten })
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn transform(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let mut centered = x.clone();
        for mut row in centered.row_iter_mut() {
            row -= self.mean.transpose();
        }
        let mut z = centered * self.components.transpose();
        if self.whiten {
            for (j, mut col) in z.column_iter_mut().enumerate() {
                col /= self.explained_variance[j].max(WHITEN_FLOOR).sqrt();
            }
        }
        z
    }

    pub fn inverse_transform(&self, z: &DMatrix<f64>) -> DMatrix<f64> {
        let mut z = z.clone();
        if self.whiten {
            for (j, mut col) in z.column_iter_mut().enumerate() {
                col *= self.explained_variance[j].max(WHITEN_FLOOR).sqrt();
            }
        }
        let mut x = z * &self.components;
        for mut row in x.row_iter_mut() {
            row += self.mean.transpose();
        }
        x
    }

    pub fn fit_transform(x: &DMatrix<f64>, n_components: usize, whiten: bool) -> Result<(Self, DMatrix<f64>)> {
        let pca = Pca::fit(x, n_components, whiten)?;
        let z = pca.transform(x);
        Ok((pca, z))
    }
}

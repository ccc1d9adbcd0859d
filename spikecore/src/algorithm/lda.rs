use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::algorithm::utility::unique_sorted;
use crate::error::{CoreError, Result};

/// Relative eigenvalue cut below which within-class directions are treated as
/// empty and left out of the discriminant subspace.
const WITHIN_RANK_TOL: f64 = 1e-10;

/// Fisher linear discriminant analysis.
///
/// The within-class scatter is diagonalised first and restricted to the
/// directions the data actually spans; the between-class scatter is then
/// diagonalised inside that whitened subspace. Projections have unit
/// within-class variance.
#[derive(Clone, Debug)]
pub struct Lda {
    pub mean: DVector<f64>,
    /// `n_features × n_components`
    pub scalings: DMatrix<f64>,
    pub classes: Vec<i64>,
}

impl Lda {
    pub fn fit(x: &DMatrix<f64>, y: &[i64], n_components: usize) -> Result<Self> {
        let (n, d) = x.shape();
        if y.len() != n {
            return Err(CoreError::ShapeMismatch(format!(
                "lda got {} rows and {} labels",
                n,
                y.len()
            )));
        }
        let classes = unique_sorted(y.iter().copied());
        if classes.len() < 2 {
            return Err(CoreError::NotEnoughSamples { needed: 2, got: classes.len() });
        }
        let k = n_components.min(classes.len() - 1).min(d).max(1);

        let mean = x.row_mean().transpose();

        // class means and counts
        let mut class_means = vec![DVector::<f64>::zeros(d); classes.len()];
        let mut counts = vec![0usize; classes.len()];
        let class_of: Vec<usize> = y
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();
        for (i, &c) in class_of.iter().enumerate() {
            class_means[c] += x.row(i).transpose();
            counts[c] += 1;
        }
        for (m, &cnt) in class_means.iter_mut().zip(counts.iter()) {
            *m /= cnt.max(1) as f64;
        }

        let mut sw = DMatrix::<f64>::zeros(d, d);
        for (i, &c) in class_of.iter().enumerate() {
            let r = x.row(i).transpose() - &class_means[c];
            sw.ger(1.0, &r, &r, 1.0);
        }
        sw /= n as f64;

        let mut sb = DMatrix::<f64>::zeros(d, d);
        for (m, &cnt) in class_means.iter().zip(counts.iter()) {
            let r = m - &mean;
            sb.ger(cnt as f64, &r, &r, 1.0);
        }
        sb /= n as f64;

        // whitening of the within-class scatter on its support
        let sw_eig = SymmetricEigen::try_new(sw, 1e-12, 0)
            .ok_or(CoreError::Decomposition("lda within-class eigen"))?;
        let top = sw_eig.eigenvalues.iter().cloned().fold(0.0f64, f64::max);
        let support: Vec<usize> = (0..d)
            .filter(|&j| sw_eig.eigenvalues[j] > WITHIN_RANK_TOL * top.max(f64::MIN_POSITIVE))
            .collect();
        if support.is_empty() {
            return Err(CoreError::Decomposition("lda within-class scatter is empty"));
        }
        let mut whitening = DMatrix::<f64>::zeros(d, support.len());
        for (col, &j) in support.iter().enumerate() {
            let scale = 1.0 / sw_eig.eigenvalues[j].sqrt();
            whitening.set_column(col, &(sw_eig.eigenvectors.column(j) * scale));
        }

        let sb_white = whitening.transpose() * sb * &whitening;
        let sb_eig = SymmetricEigen::try_new(sb_white, 1e-12, 0)
            .ok_or(CoreError::Decomposition("lda between-class eigen"))?;
        let mut order: Vec<usize> = (0..support.len()).collect();
        order.sort_by(|&a, &b| {
            sb_eig.eigenvalues[b]
                .partial_cmp(&sb_eig.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let k = k.min(support.len());
        let mut scalings = DMatrix::<f64>::zeros(d, k);
        for (col, &j) in order.iter().take(k).enumerate() {
            let mut w = &whitening * sb_eig.eigenvectors.column(j);
            // orient every axis so that the last class projects above the first
            let spread = (&class_means[classes.len() - 1] - &class_means[0]).dot(&w);
            if spread < 0.0 {
                w = -w;
            }
            scalings.set_column(col, &w);
        }

        Ok(Lda { mean, scalings, classes })
    }

    pub fn n_components(&self) -> usize {
        self.scalings.ncols()
    }

    pub fn transform(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let mut centered = x.clone();
        for mut row in centered.row_iter_mut() {
            row -= self.mean.transpose();
        }
        centered * &self.scalings
    }

    pub fn fit_transform(x: &DMatrix<f64>, y: &[i64], n_components: usize) -> Result<(Self, DMatrix<f64>)> {
        let lda = Lda::fit(x, y, n_components)?;
        let z = lda.transform(x);
        Ok((lda, z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_classes_separate_along_informative_axis() {
        // class 0 around x = 0, class 1 around x = 10; y is shared noise
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for i in 0..30 {
            let jitter = (i % 5) as f64 * 0.1;
            rows.extend_from_slice(&[jitter, (i % 7) as f64]);
            y.push(0);
            rows.extend_from_slice(&[10.0 + jitter, (i % 7) as f64]);
            y.push(1);
        }
        let x = DMatrix::from_row_slice(60, 2, &rows);
        let (lda, z) = Lda::fit_transform(&x, &y, 2).unwrap();
        assert_eq!(lda.n_components(), 1);
        // class 1 sits entirely above class 0 on the discriminant axis
        let max0 = (0..30).map(|i| z[(2 * i, 0)]).fold(f64::MIN, f64::max);
        let min1 = (0..30).map(|i| z[(2 * i + 1, 0)]).fold(f64::MAX, f64::min);
        assert!(min1 > max0);
    }

    #[test]
    fn test_single_class_is_rejected() {
        let x = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 3.0]);
        assert!(Lda::fit(&x, &[4, 4, 4], 1).is_err());
    }

    #[test]
    fn test_component_count_is_capped_by_classes() {
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for c in 0..3 {
            for i in 0..10 {
                rows.extend_from_slice(&[c as f64 * 5.0 + (i % 3) as f64 * 0.1, (c * c) as f64 + (i % 2) as f64 * 0.1, (i % 4) as f64]);
                y.push(c as i64);
            }
        }
        let x = DMatrix::from_row_slice(30, 3, &rows);
        let lda = Lda::fit(&x, &y, 5).unwrap();
        assert_eq!(lda.n_components(), 2);
    }
}

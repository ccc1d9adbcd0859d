use itertools::Itertools;
use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use statrs::statistics::Statistics;

/// Indices that sort `values` ascending. Ties keep their input order.
pub fn argsort(values: &[f32]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by_key(|&i| OrderedFloat(values[i]));
    idx
}

/// Indices that sort `values` descending. Ties keep their input order.
pub fn argsort_desc(values: &[f32]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(values[i])));
    idx
}

/// first index of the largest value, `None` for an empty slice
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// first index of the smallest value, `None` for an empty slice
pub fn argmin(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b <= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Sorted, deduplicated copy of the input.
pub fn unique_sorted<T: Ord + Copy>(values: impl IntoIterator<Item = T>) -> Vec<T> {
    values.into_iter().sorted_unstable().dedup().collect()
}

/// Population (ddof = 0) standard deviation of every column.
pub fn column_std(m: &DMatrix<f64>) -> Vec<f64> {
    if m.nrows() == 0 {
        return vec![0.0; m.ncols()];
    }
    m.column_iter()
        .map(|c| c.iter().population_std_dev())
        .collect()
}

/// Pearson correlation of two equally long sequences, 0 if either is constant.
pub fn corrcoef(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return 0.0;
    }
    let sa = a.iter().population_std_dev();
    let sb = b.iter().population_std_dev();
    if sa <= 0.0 || sb <= 0.0 || !sa.is_finite() || !sb.is_finite() {
        return 0.0;
    }
    a.iter().population_covariance(b.iter()) / (sa * sb)
}

pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argsort_is_stable() {
        let v = vec![3.0, 1.0, 3.0, 0.5];
        assert_eq!(argsort(&v), vec![3, 1, 0, 2]);
        assert_eq!(argsort_desc(&v), vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_argmax_argmin_first_occurrence() {
        let v = vec![1.0, 4.0, 4.0, -2.0, -2.0];
        assert_eq!(argmax(&v), Some(1));
        assert_eq!(argmin(&v), Some(3));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_column_std_population() {
        let m = DMatrix::from_row_slice(4, 2, &[1.0, 5.0, 3.0, 5.0, 1.0, 5.0, 3.0, 5.0]);
        let s = column_std(&m);
        assert!((s[0] - 1.0).abs() < 1e-12);
        assert!(s[1].abs() < 1e-12);
    }

    #[test]
    fn test_corrcoef() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![2.0, 4.0, 6.0, 8.0];
        let c = vec![4.0, 3.0, 2.0, 1.0];
        assert!((corrcoef(&a, &b) - 1.0).abs() < 1e-12);
        assert!((corrcoef(&a, &c) + 1.0).abs() < 1e-12);
        assert_eq!(corrcoef(&a, &[1.0, 1.0, 1.0, 1.0]), 0.0);
    }
}

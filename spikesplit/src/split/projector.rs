use nalgebra::DMatrix;

use crate::error::Result;
use crate::split::cache::WorkerContext;

/// Projections of a set of events restricted to a fixed list of channels.
///
/// `data` holds one `rank × n_columns` block per event, row-major, in the
/// order the events were requested. Column `j` is channel `channels[j]`.
#[derive(Clone, Debug)]
pub struct Gathered {
    pub data: Vec<f32>,
    pub rank: usize,
    pub channels: Vec<usize>,
    /// events that miss at least one of the channels or carry a non-finite value
    pub unavailable: Vec<bool>,
}

impl Gathered {
    pub fn n_columns(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.unavailable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unavailable.is_empty()
    }

    /// positions (into the requested order) of the usable events
    pub fn kept(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| !self.unavailable[i]).collect()
    }

    fn block_len(&self) -> usize {
        self.rank * self.n_columns()
    }

    /// one flattened block per selected event, `rows.len() × (rank·n_columns)`
    pub fn flattened(&self, rows: &[usize]) -> DMatrix<f64> {
        let len = self.block_len();
        DMatrix::from_fn(rows.len(), len, |i, j| self.data[rows[i] * len + j] as f64)
    }

    /// block of one event as a `rank × n_columns` matrix
    pub fn block(&self, row: usize) -> DMatrix<f64> {
        let len = self.block_len();
        DMatrix::from_row_iterator(
            self.rank,
            self.n_columns(),
            self.data[row * len..(row + 1) * len].iter().map(|&v| v as f64),
        )
    }
}

/// Gather the projections of `members` on `channels`.
pub fn gather(ctx: &WorkerContext, members: &[usize], channels: &[usize]) -> Result<Gathered> {
    let loader = ctx.projections()?;
    let shape = loader.shape();
    let k = channels.len();
    let out_len = shape.rank * k;
    let mut data = vec![f32::NAN; members.len() * out_len];
    let mut unavailable = vec![false; members.len()];

    for (b, batch) in members.chunks(ctx.load_batch_size).enumerate() {
        let rows = loader.read_rows(batch)?;
        for (i, &event) in batch.iter().enumerate() {
            let pos = b * ctx.load_batch_size + i;
            let src = &rows[i * shape.row_len()..(i + 1) * shape.row_len()];
            let dst = &mut data[pos * out_len..(pos + 1) * out_len];
            let neighbours = ctx.neighbours(ctx.max_channels()[event]);

            for (j, ch) in channels.iter().enumerate() {
                match neighbours.iter().position(|n| n == ch) {
                    Some(p) => {
                        for r in 0..shape.rank {
                            dst[r * k + j] = src[r * shape.n_neighbours + p];
                        }
                    }
                    None => unavailable[pos] = true,
                }
            }
            if dst.iter().any(|v| !v.is_finite()) {
                unavailable[pos] = true;
            }
        }
    }

    Ok(Gathered { data, rank: shape.rank, channels: channels.to_vec(), unavailable })
}

/// Projections of every member on its own max channel, `members.len() × rank`.
/// Rows of members whose max channel is missing from their neighbourhood are
/// non-finite.
pub fn gather_max_channel(ctx: &WorkerContext, members: &[usize]) -> Result<DMatrix<f64>> {
    let loader = ctx.projections()?;
    let shape = loader.shape();
    let mut out = DMatrix::from_element(members.len(), shape.rank, f64::NAN);

    for (b, batch) in members.chunks(ctx.load_batch_size).enumerate() {
        let rows = loader.read_rows(batch)?;
        for (i, &event) in batch.iter().enumerate() {
            let pos = b * ctx.load_batch_size + i;
            let max_channel = ctx.max_channels()[event];
            if let Some(p) = ctx.neighbours(max_channel).iter().position(|&n| n == max_channel) {
                let src = &rows[i * shape.row_len()..(i + 1) * shape.row_len()];
                for r in 0..shape.rank {
                    out[(pos, r)] = src[r * shape.n_neighbours + p] as f64;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SyntheticDataset;

    #[test]
    fn test_columns_follow_channel_subset() {
        let ds = SyntheticDataset::builder().group(20, 1.0).build();
        let mut ctx = ds.context();
        ctx.load_batch_size = 7;
        let members: Vec<usize> = vec![12, 3, 19, 0];
        let g = gather(&ctx, &members, &[2, 0]).unwrap();
        assert_eq!(g.kept(), vec![0, 1, 2, 3]);

        // event 3, rank row 1, channel 2
        let raw = &ds.projections["cleaned"];
        let block = g.block(1);
        assert_eq!(block[(1, 0)], raw[3 * 12 + 4 + 2] as f64);
        assert_eq!(block[(1, 1)], raw[3 * 12 + 4] as f64);
        assert_eq!(g.flattened(&[1]).ncols(), 6);
    }

    #[test]
    fn test_missing_channel_marks_unavailable() {
        let ds = SyntheticDataset::builder().group(10, 1.0).build();
        let mut meta = ds.meta.clone();
        // channel 0 neighbourhood loses channel 3
        meta.channel_index[0] = vec![0, 1, 2, 4];
        let store = crate::data::store::FeatureStore::in_memory(meta, ds.events.clone(), ds.projections.clone()).unwrap();
        let mut config = ds.cache_config();
        config.dataset = crate::split::cache::DatasetHandle::InMemory(std::sync::Arc::new(store));
        let ctx = WorkerContext::open(&config).unwrap();

        let g = gather(&ctx, &[0, 1], &[3]).unwrap();
        assert_eq!(g.unavailable, vec![true, true]);
        let g = gather(&ctx, &[0, 1], &[1]).unwrap();
        assert!(g.kept().len() == 2);
    }

    #[test]
    fn test_max_channel_rows() {
        let ds = SyntheticDataset::builder().group_on(10, 1.0, 2).build();
        let ctx = ds.context();
        let m = gather_max_channel(&ctx, &[4]).unwrap();
        let raw = &ds.projections["cleaned"];
        for r in 0..3 {
            assert_eq!(m[(0, r)], raw[4 * 12 + r * 4 + 2] as f64);
        }
    }
}

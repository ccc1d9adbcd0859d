use log::debug;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use spikecore::algorithm::hdbscan::Hdbscan;
use spikecore::algorithm::pca::Pca;
use spikecore::algorithm::utility::column_std;

use crate::error::Result;
use crate::split::cache::WorkerContext;
use crate::split::family::{has_several_units, project_on_template_channels, scatter_sub_labels, Verdict};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HerdingOptions {
    pub min_size_split: usize,
    // channels taken from the unit template
    pub n_channels: usize,
    // whitened PCA features added to the position features
    pub n_pca_features: usize,
    pub min_cluster_size: usize,
    pub min_samples: usize,
}

impl Default for HerdingOptions {
    fn default() -> Self {
        HerdingOptions {
            min_size_split: 25,
            n_channels: 5,
            n_pca_features: 2,
            min_cluster_size: 25,
            min_samples: 25,
        }
    }
}

/// Density clustering on position, amplitude and waveform shape.
///
/// The whitened waveform PCs are rescaled to the average spread of the
/// position features so neither group dominates the distances.
pub fn herding_split(ctx: &WorkerContext, members: &[usize], opts: &HerdingOptions) -> Result<Verdict> {
    let gathered = project_on_template_channels(ctx, members, opts.n_channels)?;
    let kept = gathered.kept();
    if kept.len() < opts.min_size_split {
        debug!("herding: only {} of {} members have all channels", kept.len(), members.len());
        return Ok(Verdict::NoSplit);
    }

    let (_, pcs) = Pca::fit_transform(&gathered.flattened(&kept), opts.n_pca_features, true)?;

    let features = DMatrix::from_fn(kept.len(), 3, |i, j| ctx.features()[members[kept[i]]][j]);
    let stds = column_std(&features);
    let scale = stds.iter().sum::<f64>() / stds.len() as f64;

    let n_pcs = pcs.ncols();
    let combined = DMatrix::from_fn(kept.len(), 3 + n_pcs, |i, j| {
        if j < 3 {
            features[(i, j)]
        } else {
            pcs[(i, j - 3)] * scale
        }
    });

    let clusters = Hdbscan::new(opts.min_cluster_size, opts.min_samples).fit(&combined);
    let sub_labels = scatter_sub_labels(members.len(), &kept, &clusters);
    if has_several_units(&sub_labels) {
        Ok(Verdict::Split { sub_labels })
    } else {
        Ok(Verdict::NoSplit)
    }
}

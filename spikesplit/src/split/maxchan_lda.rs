use log::debug;
use serde::{Deserialize, Serialize};
use spikecore::algorithm::hdbscan::Hdbscan;
use spikecore::algorithm::isocut::isocut;
use spikecore::algorithm::lda::Lda;
use spikecore::algorithm::utility::unique_sorted;

use crate::error::Result;
use crate::split::cache::WorkerContext;
use crate::split::family::{has_several_units, project_on_template_channels, scatter_sub_labels, Verdict};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxChanLdaOptions {
    pub min_size_split: usize,
    pub n_channels: usize,
    /// unimodality score above which a one-dimensional projection is cut
    pub threshold_diptest: f64,
    pub min_cluster_size: usize,
    pub min_samples: usize,
}

impl Default for MaxChanLdaOptions {
    fn default() -> Self {
        MaxChanLdaOptions {
            min_size_split: 25,
            n_channels: 5,
            threshold_diptest: 1.0,
            min_cluster_size: 25,
            min_samples: 25,
        }
    }
}

/// Discriminant projection with the max channel as class, then a cut.
///
/// With two classes the single discriminant axis is cut at the unimodality
/// cut point; with more, the (at most two) axes go through density clustering.
pub fn maxchan_lda_split(ctx: &WorkerContext, members: &[usize], opts: &MaxChanLdaOptions) -> Result<Verdict> {
    let max_channels: Vec<i64> = members.iter().map(|&i| ctx.max_channels()[i] as i64).collect();
    if unique_sorted(max_channels.iter().copied()).len() <= 1 {
        debug!("maxchan_lda: unit has a single max channel");
        return Ok(Verdict::NoSplit);
    }

    let gathered = project_on_template_channels(ctx, members, opts.n_channels)?;
    let kept = gathered.kept();
    if kept.len() < opts.min_size_split {
        debug!("maxchan_lda: only {} of {} members have all channels", kept.len(), members.len());
        return Ok(Verdict::NoSplit);
    }
    let classes: Vec<i64> = kept.iter().map(|&k| max_channels[k]).collect();
    let n_classes = unique_sorted(classes.iter().copied()).len();
    if n_classes <= 1 {
        debug!("maxchan_lda: a single max channel left after triage");
        return Ok(Verdict::NoSplit);
    }

    let n_components = (n_classes - 1).min(2);
    let (_, projs) = Lda::fit_transform(&gathered.flattened(&kept), &classes, n_components)?;

    let assigned: Vec<i64> = if projs.ncols() == 1 {
        let values: Vec<f64> = projs.column(0).iter().copied().collect();
        let cut = isocut(&values);
        debug!("maxchan_lda: score {:.3}, cut at {:.3}", cut.score, cut.cutpoint);
        if cut.score <= opts.threshold_diptest {
            return Ok(Verdict::NoSplit);
        }
        values.iter().map(|&v| (v > cut.cutpoint) as i64).collect()
    } else {
        Hdbscan::new(opts.min_cluster_size, opts.min_samples).fit(&projs)
    };

    let sub_labels = scatter_sub_labels(members.len(), &kept, &assigned);
    if has_several_units(&sub_labels) {
        Ok(Verdict::Split { sub_labels })
    } else {
        Ok(Verdict::NoSplit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SyntheticDataset;

    #[test]
    fn test_two_max_channels_with_distinct_shapes_split() {
        let ds = SyntheticDataset::builder().group_on(100, 1.0, 0).group_on(100, 1.0, 3).seed(2).build();
        let ctx = ds.context();
        let members: Vec<usize> = (0..200).collect();
        match maxchan_lda_split(&ctx, &members, &MaxChanLdaOptions::default()).unwrap() {
            Verdict::Split { sub_labels } => {
                assert!(sub_labels[..100].iter().all(|&l| l == 0));
                assert!(sub_labels[100..].iter().all(|&l| l == 1));
            }
            Verdict::NoSplit => panic!("expected a split"),
        }
    }

    #[test]
    fn test_single_max_channel_bails() {
        let ds = SyntheticDataset::builder().group_on(60, 1.0, 2).build();
        let ctx = ds.context();
        let members = ds.members(0);
        assert_eq!(
            maxchan_lda_split(&ctx, &members, &MaxChanLdaOptions::default()).unwrap(),
            Verdict::NoSplit
        );
    }
}

use log::debug;
use serde::{Deserialize, Serialize};
use spikecore::waveform::template::Template;

use crate::data::raw::TemplateSource;
use crate::error::Result;
use crate::split::cache::WorkerContext;
use crate::split::herding::{herding_split, HerdingOptions};
use crate::split::maxchan_lda::{maxchan_lda_split, MaxChanLdaOptions};
use crate::split::projector::{gather, Gathered};
use crate::split::pursuit::{bimodal_pursuit_split, PursuitOptions};

/// Outcome of one split attempt on one unit.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    NoSplit,
    /// one sub-label per member: `-1` triage, `0` stays, `k >= 1` new unit
    Split { sub_labels: Vec<i64> },
}

/// The split tests the scheduler knows about, with their options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitTest {
    Herding(HerdingOptions),
    MaxChanLda(MaxChanLdaOptions),
    BimodalPursuit(PursuitOptions),
}

impl SplitTest {
    pub fn name(&self) -> &'static str {
        match self {
            SplitTest::Herding(_) => "herding",
            SplitTest::MaxChanLda(_) => "maxchan_lda",
            SplitTest::BimodalPursuit(_) => "bimodal_pursuit",
        }
    }

    pub fn min_size_split(&self) -> usize {
        match self {
            SplitTest::Herding(o) => o.min_size_split,
            SplitTest::MaxChanLda(o) => o.min_size_split,
            SplitTest::BimodalPursuit(o) => o.min_size_split,
        }
    }

    /// Decide whether the events in `members` should be split.
    pub fn attempt_split(&self, ctx: &WorkerContext, members: &[usize]) -> Result<Verdict> {
        if members.len() < self.min_size_split() {
            debug!("{}: {} members is below the minimum split size", self.name(), members.len());
            return Ok(Verdict::NoSplit);
        }
        match self {
            SplitTest::Herding(o) => herding_split(ctx, members, o),
            SplitTest::MaxChanLda(o) => maxchan_lda_split(ctx, members, o),
            SplitTest::BimodalPursuit(o) => bimodal_pursuit_split(ctx, members, o),
        }
    }
}

/// Template of `members` from the raw recording.
pub(crate) fn member_template(ctx: &WorkerContext, members: &[usize]) -> Result<Template> {
    let times: Vec<i64> = members.iter().map(|&i| ctx.spike_times()[i]).collect();
    ctx.raw().template_from_timestamps(&times, ctx.n_channels())
}

/// Projections of `members` on the `n_channels` channels where their template
/// is largest.
pub(crate) fn project_on_template_channels(
    ctx: &WorkerContext,
    members: &[usize],
    n_channels: usize,
) -> Result<Gathered> {
    let template = member_template(ctx, members)?;
    gather(ctx, members, &template.top_channels(n_channels))
}

/// Sub-labels with `-1` at unusable members and `assigned` spread over the kept ones.
pub(crate) fn scatter_sub_labels(n: usize, kept: &[usize], assigned: &[i64]) -> Vec<i64> {
    let mut out = vec![-1; n];
    for (&k, &l) in kept.iter().zip(assigned.iter()) {
        out[k] = l;
    }
    out
}

/// true if more than one non-noise label is present
pub(crate) fn has_several_units(labels: &[i64]) -> bool {
    let mut first = None;
    for &l in labels.iter().filter(|&&l| l >= 0) {
        match first {
            None => first = Some(l),
            Some(f) if f != l => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SyntheticDataset;

    fn all_tests() -> Vec<SplitTest> {
        vec![
            SplitTest::Herding(HerdingOptions::default()),
            SplitTest::MaxChanLda(MaxChanLdaOptions::default()),
            SplitTest::BimodalPursuit(PursuitOptions::default()),
        ]
    }

    #[test]
    fn test_tiny_unit_never_splits() {
        let ds = SyntheticDataset::builder().group(5, 1.0).group_on(5, 3.0, 3).build();
        let ctx = ds.context();
        let members: Vec<usize> = (0..10).collect();
        for test in all_tests() {
            assert_eq!(test.attempt_split(&ctx, &members).unwrap(), Verdict::NoSplit, "{}", test.name());
        }
    }

    #[test]
    fn test_homogeneous_unit_is_left_alone() {
        let ds = SyntheticDataset::builder().group(200, 1.0).seed(11).build();
        let ctx = ds.context();
        let members = ds.members(0);
        assert_eq!(members.len(), 200);
        for test in all_tests() {
            assert_eq!(test.attempt_split(&ctx, &members).unwrap(), Verdict::NoSplit, "{}", test.name());
        }
    }

    #[test]
    fn test_serde_tagging() {
        let test: SplitTest = serde_json::from_str(r#"{"kind": "herding", "min_cluster_size": 40}"#).unwrap();
        match test {
            SplitTest::Herding(o) => {
                assert_eq!(o.min_cluster_size, 40);
                assert_eq!(o.min_samples, 25);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_sub_label_helpers() {
        assert_eq!(scatter_sub_labels(4, &[0, 2, 3], &[1, 0, 1]), vec![1, -1, 0, 1]);
        assert!(has_several_units(&[-1, 0, 0, 2]));
        assert!(!has_several_units(&[-1, 3, 3]));
    }
}

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SortError};
use crate::merge::oracle::MergeOracleOptions;
use crate::merge::proposer::ProposalOptions;
use crate::split::family::SplitTest;
use crate::split::herding::HerdingOptions;
use crate::split::maxchan_lda::MaxChanLdaOptions;
use crate::split::pursuit::PursuitOptions;

/// One pass of the split scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitStepConfig {
    pub test: SplitTest,
    /// resubmit every unit a split produces to the same test
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// 0 or 1 runs every job in the calling thread
    pub n_workers: usize,
    pub log_c: f64,
    pub feature_scales: [f64; 3],
    pub waveforms_kind: String,
    pub seed: u64,
    pub load_batch_size: usize,
    pub steps: Vec<SplitStepConfig>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            n_workers: 1,
            log_c: 5.0,
            feature_scales: [1.0, 1.0, 50.0],
            waveforms_kind: "cleaned".to_string(),
            seed: 0,
            load_batch_size: 512,
            steps: vec![
                SplitStepConfig { test: SplitTest::MaxChanLda(MaxChanLdaOptions::default()), recursive: false },
                SplitStepConfig { test: SplitTest::Herding(HerdingOptions::default()), recursive: false },
                SplitStepConfig { test: SplitTest::BimodalPursuit(PursuitOptions::default()), recursive: true },
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub waveforms_kind: String,
    /// a unit that absorbed another goes back on the worklist
    pub recursive: bool,
    pub proposal: ProposalOptions,
    pub oracle: MergeOracleOptions,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            waveforms_kind: "cleaned".to_string(),
            recursive: true,
            proposal: ProposalOptions::default(),
            oracle: MergeOracleOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub split: SplitConfig,
    pub merge: MergeConfig,
}

impl RunConfig {
    pub fn load_json(path: &Path) -> Result<Self> {
        let config: RunConfig = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.split.feature_scales.iter().any(|s| !s.is_finite()) {
            return Err(SortError::Config("feature scales must be finite".into()));
        }
        if self.split.log_c <= 0.0 {
            return Err(SortError::Config("log_c must be positive".into()));
        }
        if self.split.waveforms_kind.is_empty() || self.merge.waveforms_kind.is_empty() {
            return Err(SortError::Config("waveforms kind must not be empty".into()));
        }
        for (i, step) in self.split.steps.iter().enumerate() {
            check_step(&step.test).map_err(|e| SortError::Config(format!("split step {} ({}): {}", i, step.test.name(), e)))?;
        }
        let oracle = &self.merge.oracle;
        if oracle.min_spikes < 2 {
            return Err(SortError::Config("merge oracle needs min_spikes >= 2".into()));
        }
        if oracle.max_spikes < oracle.min_spikes {
            return Err(SortError::Config("merge oracle max_spikes is below min_spikes".into()));
        }
        if oracle.tpca_rank == 0 || oracle.n_channels == 0 {
            return Err(SortError::Config("merge oracle tpca_rank and n_channels must be positive".into()));
        }
        Ok(())
    }
}

/// Settings a split test cannot run with.
fn check_step(test: &SplitTest) -> std::result::Result<(), &'static str> {
    match test {
        SplitTest::Herding(o) => {
            if o.n_channels == 0 || o.n_pca_features == 0 {
                return Err("n_channels and n_pca_features must be positive");
            }
            if o.min_cluster_size < 2 || o.min_samples == 0 {
                return Err("min_cluster_size must be at least 2 and min_samples positive");
            }
        }
        SplitTest::MaxChanLda(o) => {
            if o.n_channels == 0 {
                return Err("n_channels must be positive");
            }
        }
        SplitTest::BimodalPursuit(o) => {
            if o.unit_rank == 0 {
                return Err("unit_rank must be positive");
            }
        }
    }
    Ok(())
}

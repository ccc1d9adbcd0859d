use std::path::PathBuf;
use std::sync::Arc;

use spikecore::waveform::basis::WaveformBasis;

use crate::data::projections::ProjectionLoader;
use crate::data::raw::RawRecording;
use crate::data::store::FeatureStore;
use crate::error::Result;

/// Where a worker finds the feature store.
#[derive(Clone)]
pub enum DatasetHandle {
    /// store directory, opened independently by every worker
    OnDisk(PathBuf),
    /// already loaded, shared read-only
    InMemory(Arc<FeatureStore>),
}

#[derive(Clone)]
pub enum RawHandle {
    OnDisk(PathBuf),
    InMemory(Arc<RawRecording>),
}

/// Everything a worker needs to build its [`WorkerContext`].
#[derive(Clone)]
pub struct CacheConfig {
    pub dataset: DatasetHandle,
    pub raw: RawHandle,
    pub log_c: f64,
    /// multipliers for x, z_reg and log amplitude
    pub feature_scales: [f64; 3],
    pub waveforms_kind: String,
    /// seed for template subsampling
    pub seed: u64,
    pub load_batch_size: usize,
}

impl CacheConfig {
    pub fn new(dataset: DatasetHandle, raw: RawHandle) -> Self {
        CacheConfig {
            dataset,
            raw,
            log_c: 5.0,
            feature_scales: [1.0, 1.0, 50.0],
            waveforms_kind: "cleaned".to_string(),
            seed: 0,
            load_batch_size: 512,
        }
    }
}

/// Read-only view of the dataset, built once per worker and kept for its
/// whole lifetime.
pub struct WorkerContext {
    store: Arc<FeatureStore>,
    raw: Arc<RawRecording>,
    waveforms_kind: String,
    features: Vec<[f64; 3]>,
    pub load_batch_size: usize,
}

impl WorkerContext {
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let store = match &config.dataset {
            DatasetHandle::OnDisk(path) => Arc::new(FeatureStore::open(path)?),
            DatasetHandle::InMemory(store) => Arc::clone(store),
        };
        // fail early if the requested kind is not there
        store.projections(&config.waveforms_kind)?;
        store.basis(&config.waveforms_kind)?;

        let raw = match &config.raw {
            RawHandle::OnDisk(path) => Arc::new(
                RawRecording::open(
                    path,
                    store.meta.n_channels,
                    store.meta.spike_length_samples,
                    store.meta.trough_offset,
                )?
                .with_subsampling(250, config.seed),
            ),
            RawHandle::InMemory(raw) => Arc::clone(raw),
        };

        let ev = &store.events;
        let [sx, sz, sa] = config.feature_scales;
        let features = (0..store.n_spikes())
            .map(|i| {
                [
                    ev.x[i] as f64 * sx,
                    ev.z_reg[i] as f64 * sz,
                    (config.log_c + ev.maxptp[i] as f64).ln() * sa,
                ]
            })
            .collect();

        Ok(WorkerContext {
            store,
            raw,
            waveforms_kind: config.waveforms_kind.clone(),
            features,
            load_batch_size: config.load_batch_size.max(1),
        })
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn raw(&self) -> &RawRecording {
        &self.raw
    }

    pub fn n_channels(&self) -> usize {
        self.store.n_channels()
    }

    /// `[x, z_reg, ln(log_c + maxptp)]`, scaled
    pub fn features(&self) -> &[[f64; 3]] {
        &self.features
    }

    pub fn x(&self) -> &[f32] {
        &self.store.events.x
    }

    pub fn z_reg(&self) -> &[f32] {
        &self.store.events.z_reg
    }

    pub fn maxptp(&self) -> &[f32] {
        &self.store.events.maxptp
    }

    pub fn spike_times(&self) -> &[i64] {
        &self.store.events.spike_times
    }

    pub fn max_channels(&self) -> &[usize] {
        &self.store.events.max_channels
    }

    pub fn neighbours(&self, channel: usize) -> &[usize] {
        self.store.neighbours(channel)
    }

    pub fn projections(&self) -> Result<&ProjectionLoader> {
        self.store.projections(&self.waveforms_kind)
    }

    pub fn basis(&self) -> Result<&WaveformBasis> {
        self.store.basis(&self.waveforms_kind)
    }
}

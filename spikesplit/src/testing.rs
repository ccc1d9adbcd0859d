//! Synthetic datasets for unit tests.
//!
//! Four channels that all neighbour each other, 16-sample spikes and a
//! three-component cosine basis. Every group of events shares one waveform
//! (a fixed coefficient profile scaled by `amplitude` and spread over the
//! channels around its max channel) plus Gaussian noise on the projections.
//! The raw recording carries the noise-free waveform of every event.
//!
//! A group can be lagged by a few samples, which delays its waveform in both
//! the raw recording and the stored projections. Lagged projections are only
//! exact with the full-rank (identity) basis.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand::distributions::Distribution;
use spikecore::waveform::basis::WaveformBasis;
use statrs::distribution::Normal;

use crate::data::raw::RawRecording;
use crate::data::store::{EventTable, FeatureStore, StoreMeta, STORE_VERSION};
use crate::split::cache::{CacheConfig, DatasetHandle, RawHandle, WorkerContext};

pub const N_CHANNELS: usize = 4;
pub const SPIKE_LENGTH: usize = 16;
pub const TROUGH_OFFSET: usize = 5;
pub const RANK: usize = 3;
const GAINS: [f32; N_CHANNELS] = [1.0, 0.6, 0.3, 0.1];
const PROFILE: [f32; RANK] = [-6.0, 2.0, 1.0];
const SPACING: i64 = 40;
const FIRST_TIME: i64 = 50;

#[derive(Clone, Debug)]
pub struct Group {
    pub n: usize,
    pub amplitude: f32,
    pub max_channel: usize,
    pub x: f32,
    pub z: f32,
    /// samples the waveform is delayed by
    pub lag: usize,
}

pub struct SyntheticBuilder {
    groups: Vec<Group>,
    noise: f32,
    position_noise: f32,
    full_rank: bool,
    seed: u64,
}

impl SyntheticBuilder {
    pub fn group(mut self, n: usize, amplitude: f32) -> Self {
        self.groups.push(Group { n, amplitude, max_channel: 0, x: 0.0, z: 0.0, lag: 0 });
        self
    }

    pub fn group_lagged(mut self, n: usize, amplitude: f32, lag: usize) -> Self {
        self.groups.push(Group { n, amplitude, max_channel: 0, x: 0.0, z: 0.0, lag });
        self
    }

    pub fn group_on(mut self, n: usize, amplitude: f32, max_channel: usize) -> Self {
        self.groups.push(Group { n, amplitude, max_channel, x: 0.0, z: 0.0, lag: 0 });
        self
    }

    pub fn group_at(mut self, n: usize, amplitude: f32, x: f32, z: f32) -> Self {
        self.groups.push(Group { n, amplitude, max_channel: 0, x, z, lag: 0 });
        self
    }

    pub fn noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }

    /// store every sample as its own coefficient
    pub fn full_rank_basis(mut self) -> Self {
        self.full_rank = true;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> SyntheticDataset {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let unit = Normal::new(0.0, 1.0).unwrap();
        let shape_basis = cosine_basis();
        let basis = if self.full_rank { identity_basis() } else { cosine_basis() };
        let rank = basis.rank();

        let n_spikes: usize = self.groups.iter().map(|g| g.n).sum();
        let n_samples = (FIRST_TIME + SPACING * n_spikes as i64 + FIRST_TIME) as usize;
        let mut raw = vec![0.0f32; n_samples * N_CHANNELS];
        let mut events = EventTable::default();
        let mut projections = Vec::with_capacity(n_spikes * rank * N_CHANNELS);
        let mut labels = Vec::with_capacity(n_spikes);

        let mut i = 0i64;
        for (g, group) in self.groups.iter().enumerate() {
            let profile = group_coefficients(group);
            let waveform = lagged(&shape_basis.inverse_block(&profile), group.lag);
            let coeffs = if !self.full_rank && group.lag == 0 { profile } else { basis.project_block(&waveform) };
            let ptp = waveform.column_iter().map(|c| c.max() - c.min()).fold(0.0, f64::max) as f32;
            for _ in 0..group.n {
                let t = FIRST_TIME + SPACING * i;
                events.x.push(group.x + self.position_noise * unit.sample(&mut rng) as f32);
                let z = group.z + self.position_noise * unit.sample(&mut rng) as f32;
                events.z.push(z);
                events.z_reg.push(z);
                events.maxptp.push(ptp * (1.0 + 0.02 * unit.sample(&mut rng) as f32));
                events.spike_times.push(t);
                events.max_channels.push(group.max_channel);
                for r in 0..rank {
                    for c in 0..N_CHANNELS {
                        let v = coeffs[(r, c)] as f32 + self.noise * unit.sample(&mut rng) as f32;
                        projections.push(v);
                    }
                }
                let start = (t - TROUGH_OFFSET as i64) as usize;
                for s in 0..SPIKE_LENGTH {
                    for c in 0..N_CHANNELS {
                        raw[(start + s) * N_CHANNELS + c] = waveform[(s, c)] as f32;
                    }
                }
                labels.push(g as i64);
                i += 1;
            }
        }

        let meta = StoreMeta {
            version: STORE_VERSION,
            n_spikes,
            n_channels: N_CHANNELS,
            spike_length_samples: SPIKE_LENGTH,
            trough_offset: TROUGH_OFFSET,
            channel_index: vec![(0..N_CHANNELS).collect(); N_CHANNELS],
            bases: BTreeMap::from([("cleaned".to_string(), basis)]),
        };
        SyntheticDataset {
            meta,
            events,
            projections: BTreeMap::from([("cleaned".to_string(), projections)]),
            raw,
            labels,
        }
    }
}

fn group_coefficients(group: &Group) -> DMatrix<f64> {
    DMatrix::from_fn(RANK, N_CHANNELS, |r, c| {
        let gain = GAINS[(c as i64 - group.max_channel as i64).unsigned_abs() as usize];
        (PROFILE[r] * gain * group.amplitude) as f64
    })
}

/// `waveform` delayed by `lag` samples, zero-filled at the start
fn lagged(waveform: &DMatrix<f64>, lag: usize) -> DMatrix<f64> {
    DMatrix::from_fn(waveform.nrows(), waveform.ncols(), |s, c| if s >= lag { waveform[(s - lag, c)] } else { 0.0 })
}

/// one unit row per sample
pub fn identity_basis() -> WaveformBasis {
    let components = (0..SPIKE_LENGTH).map(|r| (0..SPIKE_LENGTH).map(|s| (r == s) as u8 as f64).collect()).collect();
    WaveformBasis { mean: vec![0.0; SPIKE_LENGTH], components }
}

/// orthonormal cosine rows without the constant term
pub fn cosine_basis() -> WaveformBasis {
    let t = SPIKE_LENGTH as f64;
    let components = (0..RANK)
        .map(|r| {
            (0..SPIKE_LENGTH)
                .map(|s| (2.0 / t).sqrt() * (std::f64::consts::PI * (s as f64 + 0.5) * (r as f64 + 1.0) / t).cos())
                .collect()
        })
        .collect();
    WaveformBasis { mean: vec![0.0; SPIKE_LENGTH], components }
}

pub struct SyntheticDataset {
    pub meta: StoreMeta,
    pub events: EventTable,
    pub projections: BTreeMap<String, Vec<f32>>,
    pub raw: Vec<f32>,
    /// group index of every event
    pub labels: Vec<i64>,
}

impl SyntheticDataset {
    pub fn builder() -> SyntheticBuilder {
        SyntheticBuilder { groups: Vec::new(), noise: 0.3, position_noise: 1.0, full_rank: false, seed: 0 }
    }

    pub fn store(&self) -> FeatureStore {
        FeatureStore::in_memory(self.meta.clone(), self.events.clone(), self.projections.clone()).unwrap()
    }

    pub fn recording(&self) -> RawRecording {
        RawRecording::in_memory(self.raw.clone(), N_CHANNELS, SPIKE_LENGTH, TROUGH_OFFSET).unwrap()
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(
            DatasetHandle::InMemory(Arc::new(self.store())),
            RawHandle::InMemory(Arc::new(self.recording())),
        )
    }

    pub fn context(&self) -> WorkerContext {
        WorkerContext::open(&self.cache_config()).unwrap()
    }

    pub fn members(&self, group: i64) -> Vec<usize> {
        (0..self.labels.len()).filter(|&i| self.labels[i] == group).collect()
    }
}

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use spikecore::waveform::basis::WaveformBasis;

use crate::data::projections::{ProjectionLoader, ProjectionShape};
use crate::error::{Result, SortError};
use crate::io::write_f32_array;

pub const STORE_VERSION: u32 = 1;
const META_FILE: &str = "meta.json";
const EVENTS_FILE: &str = "events.bin";

fn projections_file(kind: &str) -> String {
    format!("{}_tpca_projs.f32", kind)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreMeta {
    pub version: u32,
    pub n_spikes: usize,
    pub n_channels: usize,
    pub spike_length_samples: usize,
    pub trough_offset: usize,
    /// neighbourhood of every channel, padded with `n_channels`
    pub channel_index: Vec<Vec<usize>>,
    /// temporal basis per waveform kind
    pub bases: BTreeMap<String, WaveformBasis>,
}

/// Per-event scalar features.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventTable {
    pub x: Vec<f32>,
    pub z: Vec<f32>,
    pub z_reg: Vec<f32>,
    pub maxptp: Vec<f32>,
    pub spike_times: Vec<i64>,
    pub max_channels: Vec<usize>,
}

impl EventTable {
    pub fn len(&self) -> usize {
        self.spike_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spike_times.is_empty()
    }
}

/// Read-only container of everything the split and merge passes look at.
///
/// On disk it is a directory holding `meta.json`, a zstd-compressed bincode
/// `events.bin` and one `{kind}_tpca_projs.f32` per waveform kind.
pub struct FeatureStore {
    pub meta: StoreMeta,
    pub events: EventTable,
    pub root: Option<PathBuf>,
    projections: BTreeMap<String, ProjectionLoader>,
}

impl FeatureStore {
    pub fn open(root: &Path) -> Result<Self> {
        let meta: StoreMeta = serde_json::from_reader(BufReader::new(File::open(root.join(META_FILE))?))?;
        let mut decoder = zstd::Decoder::new(File::open(root.join(EVENTS_FILE))?)?;
        let events: EventTable = bincode::deserialize_from(&mut decoder)?;

        let mut projections = BTreeMap::new();
        for (kind, basis) in &meta.bases {
            let path = root.join(projections_file(kind));
            if !path.exists() {
                continue;
            }
            let shape = Self::shape_for(&meta, basis);
            projections.insert(kind.clone(), ProjectionLoader::open(&path, shape)?);
        }

        let store = FeatureStore { meta, events, root: Some(root.to_path_buf()), projections };
        store.validate()?;
        Ok(store)
    }

    pub fn in_memory(meta: StoreMeta, events: EventTable, projections: BTreeMap<String, Vec<f32>>) -> Result<Self> {
        let mut loaders = BTreeMap::new();
        for (kind, data) in projections {
            let basis = meta
                .bases
                .get(&kind)
                .ok_or_else(|| SortError::InvalidStore(format!("no basis for projections '{}'", kind)))?;
            let shape = Self::shape_for(&meta, basis);
            loaders.insert(kind, ProjectionLoader::in_memory(data, shape)?);
        }
        let store = FeatureStore { meta, events, root: None, projections: loaders };
        store.validate()?;
        Ok(store)
    }

    /// Write a store directory, creating it if needed.
    pub fn write(
        root: &Path,
        meta: &StoreMeta,
        events: &EventTable,
        projections: &BTreeMap<String, Vec<f32>>,
    ) -> Result<()> {
        std::fs::create_dir_all(root)?;
        serde_json::to_writer_pretty(BufWriter::new(File::create(root.join(META_FILE))?), meta)?;

        let mut encoder = zstd::Encoder::new(File::create(root.join(EVENTS_FILE))?, 3)?;
        bincode::serialize_into(&mut encoder, events)?;
        encoder.finish()?;

        for (kind, data) in projections {
            write_f32_array(&root.join(projections_file(kind)), data)?;
        }
        Ok(())
    }

    fn shape_for(meta: &StoreMeta, basis: &WaveformBasis) -> ProjectionShape {
        ProjectionShape {
            n_spikes: meta.n_spikes,
            rank: basis.rank(),
            n_neighbours: meta.channel_index.first().map_or(0, |r| r.len()),
        }
    }

    fn validate(&self) -> Result<()> {
        let n = self.meta.n_spikes;
        let ev = &self.events;
        let lengths = [ev.x.len(), ev.z.len(), ev.z_reg.len(), ev.maxptp.len(), ev.spike_times.len(), ev.max_channels.len()];
        if lengths.iter().any(|&l| l != n) {
            return Err(SortError::InvalidStore(format!(
                "event columns have lengths {:?}, expected {}",
                lengths, n
            )));
        }

        let n_channels = self.meta.n_channels;
        if self.meta.channel_index.len() != n_channels {
            return Err(SortError::InvalidStore(format!(
                "channel index has {} rows for {} channels",
                self.meta.channel_index.len(),
                n_channels
            )));
        }
        let width = self.meta.channel_index.first().map_or(0, |r| r.len());
        for (row, neighbours) in self.meta.channel_index.iter().enumerate() {
            if neighbours.len() != width || neighbours.iter().any(|&c| c > n_channels) {
                return Err(SortError::InvalidStore(format!("malformed channel index row {}", row)));
            }
            // real channels strictly ascending, padding only at the tail
            let sorted = neighbours.windows(2).all(|w| w[0] < w[1] || (w[0] == n_channels && w[1] == n_channels));
            if !sorted {
                return Err(SortError::ChannelIndexNotSorted { row });
            }
        }
        if let Some(&bad) = ev.max_channels.iter().find(|&&c| c >= n_channels) {
            return Err(SortError::InvalidStore(format!("max channel {} out of range", bad)));
        }
        Ok(())
    }

    pub fn n_spikes(&self) -> usize {
        self.meta.n_spikes
    }

    pub fn n_channels(&self) -> usize {
        self.meta.n_channels
    }

    pub fn neighbours(&self, channel: usize) -> &[usize] {
        &self.meta.channel_index[channel]
    }

    pub fn basis(&self, kind: &str) -> Result<&WaveformBasis> {
        self.meta
            .bases
            .get(kind)
            .ok_or_else(|| SortError::MissingProjections { kind: kind.to_string() })
    }

    pub fn projections(&self, kind: &str) -> Result<&ProjectionLoader> {
        self.projections
            .get(kind)
            .ok_or_else(|| SortError::MissingProjections { kind: kind.to_string() })
    }
}

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use spikecore::waveform::template::Template;

use crate::error::{Result, SortError};
use crate::labels::members_by_label;

/// Anything that can produce a unit's representative waveform from the
/// sample times of its events.
pub trait TemplateSource {
    fn template_from_timestamps(&self, times: &[i64], n_channels: usize) -> Result<Template>;
}

enum RawSamples {
    File { file: Mutex<File>, n_samples: usize },
    InMemory { data: Vec<f32> },
}

/// Continuous recording, little-endian `f32` interleaved as
/// `n_samples × n_channels`.
///
/// Templates are the per-sample median over up to `max_spikes_per_unit`
/// snippets, drawn without replacement with a fixed seed. Snippets start
/// `trough_offset` samples before the event time; events whose window falls
/// outside the recording are skipped.
pub struct RawRecording {
    samples: RawSamples,
    pub n_channels: usize,
    pub spike_length: usize,
    pub trough_offset: usize,
    pub max_spikes_per_unit: usize,
    pub seed: u64,
}

impl RawRecording {
    pub fn open(path: &Path, n_channels: usize, spike_length: usize, trough_offset: usize) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let frame = n_channels * 4;
        if n_channels == 0 || len % frame != 0 {
            return Err(SortError::InvalidStore(format!(
                "{} has {} bytes, not a whole number of {}-channel frames",
                path.display(),
                len,
                n_channels
            )));
        }
        Ok(RawRecording {
            samples: RawSamples::File { file: Mutex::new(file), n_samples: len / frame },
            n_channels,
            spike_length,
            trough_offset,
            max_spikes_per_unit: 250,
            seed: 0,
        })
    }

    pub fn in_memory(data: Vec<f32>, n_channels: usize, spike_length: usize, trough_offset: usize) -> Result<Self> {
        if n_channels == 0 || data.len() % n_channels != 0 {
            return Err(SortError::InvalidStore(format!(
                "{} raw values do not split into {} channels",
                data.len(),
                n_channels
            )));
        }
        Ok(RawRecording {
            samples: RawSamples::InMemory { data },
            n_channels,
            spike_length,
            trough_offset,
            max_spikes_per_unit: 250,
            seed: 0,
        })
    }

    pub fn with_subsampling(mut self, max_spikes_per_unit: usize, seed: u64) -> Self {
        self.max_spikes_per_unit = max_spikes_per_unit;
        self.seed = seed;
        self
    }

    pub fn n_samples(&self) -> usize {
        match &self.samples {
            RawSamples::File { n_samples, .. } => *n_samples,
            RawSamples::InMemory { data } => data.len() / self.n_channels,
        }
    }

    /// `spike_length × n_channels` samples starting at `start`, or `None` when
    /// the window leaves the recording.
    pub fn read_snippet(&self, start: i64) -> Result<Option<Vec<f32>>> {
        if start < 0 || start as usize + self.spike_length > self.n_samples() {
            return Ok(None);
        }
        let offset = start as usize * self.n_channels;
        let len = self.spike_length * self.n_channels;
        match &self.samples {
            RawSamples::InMemory { data } => Ok(Some(data[offset..offset + len].to_vec())),
            RawSamples::File { file, .. } => {
                let mut file = file
                    .lock()
                    .map_err(|_| SortError::InvalidStore("raw file lock poisoned".into()))?;
                let mut buf = vec![0u8; len * 4];
                file.seek(SeekFrom::Start((offset * 4) as u64))?;
                file.read_exact(&mut buf)?;
                let mut out = vec![0.0f32; len];
                LittleEndian::read_f32_into(&buf, &mut out);
                Ok(Some(out))
            }
        }
    }

    fn subsample(&self, times: &[i64]) -> Vec<i64> {
        if times.len() <= self.max_spikes_per_unit {
            return times.to_vec();
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut picked = sample(&mut rng, times.len(), self.max_spikes_per_unit).into_vec();
        picked.sort_unstable();
        picked.into_iter().map(|i| times[i]).collect()
    }
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

impl TemplateSource for RawRecording {
    fn template_from_timestamps(&self, times: &[i64], n_channels: usize) -> Result<Template> {
        if n_channels != self.n_channels {
            return Err(SortError::InvalidStore(format!(
                "recording has {} channels, {} requested",
                self.n_channels, n_channels
            )));
        }
        let mut snippets = Vec::new();
        for t in self.subsample(times) {
            if let Some(s) = self.read_snippet(t - self.trough_offset as i64)? {
                snippets.push(s);
            }
        }
        if snippets.is_empty() {
            warn!("no snippet of {} events fits in the recording, using a flat template", times.len());
            return Ok(Template::zeros(self.spike_length, n_channels));
        }

        let len = self.spike_length * n_channels;
        let mut column = vec![0.0f32; snippets.len()];
        let mut data = vec![0.0f32; len];
        for (j, d) in data.iter_mut().enumerate() {
            for (k, s) in snippets.iter().enumerate() {
                column[k] = s[j];
            }
            *d = median(&mut column);
        }
        Ok(Template::from_data(self.spike_length, n_channels, data)?)
    }
}

/// One template per unit `0..n_units`, from the given event times.
pub fn templates_for_labels<S: TemplateSource>(
    source: &S,
    labels: &[i64],
    times: &[i64],
    n_units: usize,
    n_channels: usize,
) -> Result<Vec<Template>> {
    let members = members_by_label(labels);
    (0..n_units)
        .map(|unit| {
            let unit_times: Vec<i64> = members
                .get(&(unit as i64))
                .map(|m| m.iter().map(|&i| times[i]).collect())
                .unwrap_or_default();
            source.template_from_timestamps(&unit_times, n_channels)
        })
        .collect()
}

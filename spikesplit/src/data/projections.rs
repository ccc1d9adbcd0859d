use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, SortError};

/// Layout of a projection array: one `rank × n_neighbours` block per event,
/// row-major, little-endian `f32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectionShape {
    pub n_spikes: usize,
    pub rank: usize,
    pub n_neighbours: usize,
}

impl ProjectionShape {
    pub fn row_len(&self) -> usize {
        self.rank * self.n_neighbours
    }

    fn n_values(&self) -> usize {
        self.n_spikes * self.row_len()
    }
}

/// Reads projection rows either straight from disk or from memory.
///
/// The lazy variant only ever touches the requested rows; consecutive indices
/// are fetched with a single read.
pub enum ProjectionLoader {
    Lazy { file: Mutex<File>, shape: ProjectionShape },
    InMemory { data: Vec<f32>, shape: ProjectionShape },
}

impl ProjectionLoader {
    pub fn open(path: &Path, shape: ProjectionShape) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len != shape.n_values() * 4 {
            return Err(SortError::InvalidStore(format!(
                "{} holds {} bytes, expected {}",
                path.display(),
                len,
                shape.n_values() * 4
            )));
        }
        Ok(ProjectionLoader::Lazy { file: Mutex::new(file), shape })
    }

    pub fn in_memory(data: Vec<f32>, shape: ProjectionShape) -> Result<Self> {
        if data.len() != shape.n_values() {
            return Err(SortError::InvalidStore(format!(
                "in-memory projections hold {} values, expected {}",
                data.len(),
                shape.n_values()
            )));
        }
        Ok(ProjectionLoader::InMemory { data, shape })
    }

    pub fn shape(&self) -> ProjectionShape {
        match self {
            ProjectionLoader::Lazy { shape, .. } => *shape,
            ProjectionLoader::InMemory { shape, .. } => *shape,
        }
    }

    /// Rows for `indices`, in the order given, concatenated.
    pub fn read_rows(&self, indices: &[usize]) -> Result<Vec<f32>> {
        let shape = self.shape();
        let row_len = shape.row_len();
        if let Some(&bad) = indices.iter().find(|&&i| i >= shape.n_spikes) {
            return Err(SortError::InvalidStore(format!(
                "projection row {} out of range ({} events)",
                bad, shape.n_spikes
            )));
        }
        let mut out = vec![0.0f32; indices.len() * row_len];

        match self {
            ProjectionLoader::InMemory { data, .. } => {
                for (k, &i) in indices.iter().enumerate() {
                    out[k * row_len..(k + 1) * row_len]
                        .copy_from_slice(&data[i * row_len..(i + 1) * row_len]);
                }
            }
            ProjectionLoader::Lazy { file, .. } => {
                let mut file = file
                    .lock()
                    .map_err(|_| SortError::InvalidStore("projection file lock poisoned".into()))?;
                let mut buf = Vec::new();
                let mut k = 0;
                while k < indices.len() {
                    // extend the run while indices are consecutive
                    let mut run = 1;
                    while k + run < indices.len() && indices[k + run] == indices[k] + run {
                        run += 1;
                    }
                    buf.resize(run * row_len * 4, 0u8);
                    file.seek(SeekFrom::Start((indices[k] * row_len * 4) as u64))?;
                    file.read_exact(&mut buf)?;
                    LittleEndian::read_f32_into(&buf, &mut out[k * row_len..(k + run) * row_len]);
                    k += run;
                }
            }
        }
        Ok(out)
    }
}

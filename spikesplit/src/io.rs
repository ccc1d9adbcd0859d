use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SortError};
use crate::merge::scheduler::MergeEvent;
use crate::split::scheduler::SplitStepReport;

/// Flat little-endian `i64` file, used for labels and spike times.
pub fn write_i64_array(path: &Path, values: &[i64]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &v in values {
        writer.write_i64::<LittleEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_i64_array(path: &Path) -> Result<Vec<i64>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    if bytes.len() % 8 != 0 {
        return Err(SortError::InvalidStore(format!(
            "{} holds {} bytes, not a whole number of i64 values",
            path.display(),
            bytes.len()
        )));
    }
    let mut out = vec![0i64; bytes.len() / 8];
    LittleEndian::read_i64_into(&bytes, &mut out);
    Ok(out)
}

pub fn write_f32_array(path: &Path, values: &[f32]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &v in values {
        writer.write_f32::<LittleEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

/// What a run did, written next to its outputs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub n_spikes: usize,
    pub units_in: usize,
    pub units_after_split: Option<usize>,
    pub units_after_merge: Option<usize>,
    pub triaged: usize,
    pub split_steps: Vec<SplitStepReport>,
    pub merges: Vec<MergeEvent>,
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.i64");
        let labels = vec![0, 3, -1, i64::MAX, 2];
        write_i64_array(&path, &labels).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);
        assert_eq!(read_i64_array(&path).unwrap(), labels);

        std::fs::write(&path, [0u8; 12]).unwrap();
        assert!(matches!(read_i64_array(&path), Err(SortError::InvalidStore(_))));
    }

    #[test]
    fn test_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = RunReport {
            n_spikes: 10,
            units_in: 2,
            units_after_merge: Some(1),
            merges: vec![MergeEvent { kept: 1, absorbed: 0, shift: -2 }],
            ..Default::default()
        };
        report.write_json(&path).unwrap();
        assert_eq!(RunReport::read_json(&path).unwrap(), report);
    }
}

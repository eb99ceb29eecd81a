//! Model snapshot files
//!
//! One JSON file per (dataset, backbone, held-out subject, seed, alignment,
//! adaptation) combination:
//!
//! ```text
//! <runs>/<dataset>/<backbone>_S<id>_seed<seed>[_noEA][_adapted].ckpt
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use eegtl_core::config::Backbone;
use eegtl_core::types::{DatasetId, SubjectId};

use super::params::StateDict;
use super::{Classifier, ModelError, ModelResult};

/// Snapshot format version
pub const FORMAT_VERSION: u32 = 1;

/// Identifies one snapshot file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointKey {
    /// Dataset the model was fitted on
    pub dataset: DatasetId,
    /// Backbone architecture
    pub backbone: Backbone,
    /// Held-out target subject
    pub subject: SubjectId,
    /// Seed used when fitting
    pub seed: u64,
    /// Whether source data was aligned
    pub aligned: bool,
    /// Snapshot taken after test-time adaptation
    pub adapted: bool,
}

impl CheckpointKey {
    /// File location under `runs_root`
    pub fn path(&self, runs_root: &Path) -> PathBuf {
        let mut name = format!("{}_{}_seed{}", self.backbone.name(), self.subject, self.seed);
        if !self.aligned {
            name.push_str("_noEA");
        }
        if self.adapted {
            name.push_str("_adapted");
        }
        name.push_str(".ckpt");
        runs_root.join(self.dataset.name()).join(name)
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    format_version: u32,
    backbone: String,
    state: StateDict,
}

/// Write a model's state to its snapshot file, creating parent directories
pub fn save_checkpoint(model: &dyn Classifier, key: &CheckpointKey, runs_root: &Path) -> ModelResult<PathBuf> {
    let path = key.path(runs_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = CheckpointFile {
        format_version: FORMAT_VERSION,
        backbone: model.backbone().name().to_string(),
        state: model.parameters().state_dict(),
    };
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer(&mut writer, &file)?;
    writer.flush()?;
    info!("Saved checkpoint {}", path.display());
    Ok(path)
}

/// Restore a model's state from its snapshot file.
///
/// A missing file is reported as [`ModelError::CheckpointNotFound`].
pub fn load_checkpoint(model: &mut dyn Classifier, key: &CheckpointKey, runs_root: &Path) -> ModelResult<()> {
    let path = key.path(runs_root);
    if !path.is_file() {
        return Err(ModelError::CheckpointNotFound { path });
    }
    let reader = BufReader::new(File::open(&path)?);
    let file: CheckpointFile = serde_json::from_reader(reader)?;

    let expected = model.backbone().name();
    if file.backbone != expected {
        return Err(ModelError::BackboneMismatch {
            expected: expected.to_string(),
            found: file.backbone,
        });
    }
    model.parameters_mut().load_state_dict(&file.state)?;
    debug!(version = file.format_version, "Loaded checkpoint {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogVarNet;
    use tempfile::TempDir;

    fn key() -> CheckpointKey {
        CheckpointKey {
            dataset: DatasetId::Bnci2014001,
            backbone: Backbone::LogVarNet,
            subject: SubjectId(3),
            seed: 7,
            aligned: true,
            adapted: false,
        }
    }

    #[test]
    fn test_path_layout() {
        let root = Path::new("runs");
        assert_eq!(key().path(root), root.join("BNCI2014001").join("LogVarNet_S3_seed7.ckpt"));

        let k = CheckpointKey { aligned: false, adapted: true, ..key() };
        assert_eq!(k.path(root), root.join("BNCI2014001").join("LogVarNet_S3_seed7_noEA_adapted.ckpt"));
    }

    #[test]
    fn test_save_then_load_restores_state() {
        let dir = TempDir::new().unwrap();
        let mut saved = LogVarNet::new(4, 2, 1);
        // values whose shortest decimal form needs exact parsing
        let spatial = &mut saved.parameters_mut().get_mut("spatial.weight").unwrap().values;
        spatial[0] = -0.097_514_336_335_152_05;
        spatial[1] = 0.1 + 0.2;
        spatial[2] = f64::MIN_POSITIVE;
        let path = save_checkpoint(&saved, &key(), dir.path()).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 0);

        let mut restored = LogVarNet::new(4, 2, 99);
        load_checkpoint(&mut restored, &key(), dir.path()).unwrap();
        let expected = saved.parameters().state_dict();
        let actual = restored.parameters().state_dict();
        assert_eq!(actual, expected);
        for (name, tensor) in &expected {
            let bits: Vec<u64> = tensor.values.iter().map(|v| v.to_bits()).collect();
            let restored_bits: Vec<u64> = actual[name].values.iter().map(|v| v.to_bits()).collect();
            assert_eq!(restored_bits, bits, "{name} not bit-identical");
        }
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut model = LogVarNet::new(4, 2, 1);
        let err = load_checkpoint(&mut model, &key(), dir.path()).unwrap_err();
        assert!(matches!(err, ModelError::CheckpointNotFound { .. }));
    }
}

//! Dataset sink boundary.
//!
//! A finished scan hands its metadata arrays (rotation angles, energies) to a
//! [`DatasetSink`]. Persisting is best effort: [`persist_dataset`] logs a
//! failure and carries on, so a full disk never fails a scan whose frames
//! have already been written by the detector.
//!
//! - [`MemorySink`] keeps datasets in memory (tests, dry runs)
//! - `Hdf5Sink` writes into an HDF5 file (feature `storage_hdf5`)

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::TxmResult;

/// Rotation angle of each projection, in degrees.
pub const THETA_DATASET: &str = "/exchange/theta";
/// Beam energy of each projection, in keV.
pub const ENERGY_DATASET: &str = "/exchange/energy";

/// Something that can store a named 1-D float dataset.
pub trait DatasetSink: Send + Sync {
    /// Create (or replace) the dataset at `path`, e.g. `/exchange/theta`.
    fn create_dataset(&self, path: &str, data: &[f64]) -> TxmResult<()>;
}

/// Write one dataset, logging instead of failing.
///
/// Returns `true` when the dataset was written.
pub fn persist_dataset(sink: &dyn DatasetSink, path: &str, data: &[f64]) -> bool {
    match sink.create_dataset(path, data) {
        Ok(()) => {
            debug!(dataset = path, len = data.len(), "Saved dataset");
            true
        }
        Err(err) => {
            warn!(dataset = path, error = %err, "Could not save dataset");
            false
        }
    }
}

/// Sink for `[storage] hdf_file`, if one is configured and HDF5 support is
/// compiled in.
pub fn configured_sink(config: &StorageConfig) -> Option<Arc<dyn DatasetSink>> {
    let path = config.hdf_file.as_ref()?;

    #[cfg(feature = "storage_hdf5")]
    {
        debug!(path = %path.display(), "Using HDF5 dataset sink");
        Some(Arc::new(Hdf5Sink::new(path.clone())))
    }

    #[cfg(not(feature = "storage_hdf5"))]
    {
        warn!(
            path = %path.display(),
            "HDF5 support not compiled in (feature storage_hdf5); datasets will not be saved"
        );
        None
    }
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    datasets: Mutex<BTreeMap<String, Vec<f64>>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the dataset at `path`.
    pub fn get(&self, path: &str) -> Option<Vec<f64>> {
        self.lock().get(path).cloned()
    }

    /// Dataset paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<f64>>> {
        self.datasets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DatasetSink for MemorySink {
    fn create_dataset(&self, path: &str, data: &[f64]) -> TxmResult<()> {
        self.lock().insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(feature = "storage_hdf5")]
pub use self::hdf5_sink::Hdf5Sink;

#[cfg(feature = "storage_hdf5")]
mod hdf5_sink {
    use std::path::{Path, PathBuf};

    use super::DatasetSink;
    use crate::error::{TxmError, TxmResult};

    /// Writes datasets into an HDF5 file, creating the file and any
    /// intermediate groups.
    #[derive(Debug, Clone)]
    pub struct Hdf5Sink {
        path: PathBuf,
    }

    impl Hdf5Sink {
        /// Sink writing to `path`; the file is opened per dataset.
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// Target file.
        pub fn path(&self) -> &Path {
            &self.path
        }

        fn write(&self, dataset: &str, data: &[f64]) -> hdf5::Result<()> {
            use hdf5::File;

            let file = if self.path.exists() {
                File::open_rw(&self.path)?
            } else {
                File::create(&self.path)?
            };

            let trimmed = dataset.trim_start_matches('/');
            let (groups, name) = match trimmed.rsplit_once('/') {
                Some((groups, name)) => (groups, name),
                None => ("", trimmed),
            };

            let mut group = file.group("/")?;
            for part in groups.split('/').filter(|p| !p.is_empty()) {
                group = if group.link_exists(part) {
                    group.group(part)?
                } else {
                    group.create_group(part)?
                };
            }
            if group.link_exists(name) {
                group.unlink(name)?;
            }

            group
                .new_dataset::<f64>()
                .create(name, data.len())?
                .write(data)?;
            Ok(())
        }
    }

    impl DatasetSink for Hdf5Sink {
        fn create_dataset(&self, path: &str, data: &[f64]) -> TxmResult<()> {
            self.write(path, data).map_err(|e| TxmError::Storage {
                path: format!("{}:{}", self.path.display(), path),
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxmError;
    use tracing_test::traced_test;

    struct ReadOnlySink;

    impl DatasetSink for ReadOnlySink {
        fn create_dataset(&self, path: &str, _data: &[f64]) -> TxmResult<()> {
            Err(TxmError::Storage {
                path: path.to_string(),
                reason: "file opened read-only".into(),
            })
        }
    }

    #[test]
    fn memory_sink_replaces_existing_datasets() {
        let sink = MemorySink::new();
        assert!(persist_dataset(&sink, THETA_DATASET, &[0.0, 90.0]));
        assert!(persist_dataset(&sink, THETA_DATASET, &[0.0, 45.0, 90.0]));
        assert_eq!(sink.get(THETA_DATASET), Some(vec![0.0, 45.0, 90.0]));
        assert_eq!(sink.paths(), vec![THETA_DATASET.to_string()]);
    }

    #[test]
    #[traced_test]
    fn failed_write_is_a_warning() {
        assert!(!persist_dataset(&ReadOnlySink, ENERGY_DATASET, &[8.5]));
        assert!(logs_contain("Could not save dataset"));
        assert!(logs_contain("file opened read-only"));
    }

    #[test]
    fn no_configured_file_means_no_sink() {
        assert!(configured_sink(&StorageConfig::default()).is_none());
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    #[traced_test]
    fn configured_file_without_hdf5_support_warns() {
        let config = StorageConfig {
            hdf_file: Some("/tmp/scan.h5".into()),
        };
        assert!(configured_sink(&config).is_none());
        assert!(logs_contain("HDF5 support not compiled in"));
    }

    #[cfg(feature = "storage_hdf5")]
    #[test]
    fn hdf5_sink_creates_nested_groups() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Hdf5Sink::new(dir.path().join("scan.h5"));
        sink.create_dataset(THETA_DATASET, &[0.0, 1.5, 3.0]).unwrap();
        sink.create_dataset(THETA_DATASET, &[0.0, 2.0]).unwrap();

        let file = hdf5::File::open(sink.path()).unwrap();
        let theta: Vec<f64> = file.dataset("exchange/theta").unwrap().read_raw().unwrap();
        assert_eq!(theta, vec![0.0, 2.0]);
    }
}

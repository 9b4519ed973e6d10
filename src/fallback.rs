//! # Offline Departure Dataset
//!
//! A static timetable snapshot shown when live data cannot be obtained, or all
//! the time in offline mode.
//!
//! ## Sources
//!
//! - **Embedded**: `data/offline_departures.json`, compiled into the binary
//! - **File**: an optional path from configuration, read once at startup
//!
//! Both are parsed with the same [`BoundedJsonExtractor`] as live responses, so
//! the dataset follows the screens' platform filters. A file that cannot be
//! read or parsed is logged and the embedded copy is used instead.
//!
//! The parsed model is shared behind an [`Rc`]; handing it to the scheduler on
//! every failed refresh never copies it.

use crate::extractor::{BoundedJsonExtractor, ParseError};
use crate::{DepartureModel, Station};
use std::path::Path;
use std::rc::Rc;
use std::{fs, io};
use thiserror::Error;
use tracing::{info, warn};

/// Bundled dataset in live departure board format.
pub const EMBEDDED: &[u8] = include_bytes!("../data/offline_departures.json");

/// Shared read-only view of the offline model.
pub type OfflineHandle = Rc<DepartureModel>;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("offline data IO: {0}")]
    Io(#[from] io::Error),

    #[error("offline data invalid: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone)]
pub struct OfflineDataset {
    model: OfflineHandle,
}

impl OfflineDataset {
    pub fn new(model: DepartureModel) -> Self {
        Self {
            model: Rc::new(model),
        }
    }

    /// Parses a dataset from raw bytes.
    pub fn from_bytes(bytes: &[u8], extractor: &BoundedJsonExtractor) -> Result<Self, ParseError> {
        extractor.extract(bytes).map(Self::new)
    }

    pub fn from_file(path: &Path, extractor: &BoundedJsonExtractor) -> Result<Self, DatasetError> {
        let bytes = fs::read(path)?;
        Ok(Self::from_bytes(&bytes, extractor)?)
    }

    /// The dataset compiled into the binary.
    ///
    /// Should the embedded data ever fail to parse, an empty model is used so the
    /// boards still come up with an offline indicator.
    pub fn embedded(extractor: &BoundedJsonExtractor) -> Self {
        Self::from_bytes(EMBEDDED, extractor).unwrap_or_else(|e| {
            warn!(error = %e, "Embedded offline data unusable, starting empty");
            let station = Station {
                code: "---".to_string(),
                name: "Offline".to_string(),
            };
            Self::new(DepartureModel::empty(station, extractor.screens()))
        })
    }

    /// Loads `path` if given, falling back to the embedded dataset.
    pub fn load(path: Option<&Path>, extractor: &BoundedJsonExtractor) -> Self {
        let Some(path) = path else {
            return Self::embedded(extractor);
        };

        match Self::from_file(path, extractor) {
            Ok(dataset) => {
                info!(path = %path.display(), station = %dataset.model.station.code, "Loaded offline dataset");
                dataset
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Falling back to embedded offline dataset");
                Self::embedded(extractor)
            }
        }
    }

    /// Installs the custom alert on the offline model as well.
    pub fn with_custom_alert(self, message: Option<&str>) -> Self {
        if message.is_none() {
            return self;
        }
        let model = Rc::try_unwrap(self.model).unwrap_or_else(|shared| (*shared).clone());
        Self::new(model.with_custom_alert(message))
    }

    pub fn handle(&self) -> OfflineHandle {
        Rc::clone(&self.model)
    }

    pub fn model(&self) -> &DepartureModel {
        &self.model
    }
}

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use glam::DVec2;
use serde::{Deserialize, Serialize};

use super::IoError;
use crate::camera::PinholeCamera;
use crate::features::{Descriptors, FeatureBackend, Features, View};

/// On-disk layout of one image's features.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureFile {
    /// Keypoint pixel coordinates as `[x, y]`.
    pub keypoints: Vec<[f64; 2]>,
    /// One descriptor per keypoint.
    pub descriptors: Descriptors,
    /// Optional RGB color per keypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<[u8; 3]>>,
}

impl From<FeatureFile> for Features {
    fn from(file: FeatureFile) -> Self {
        Features {
            keypoints: file.keypoints.into_iter().map(DVec2::from_array).collect(),
            descriptors: file.descriptors,
            colors: file.colors,
        }
    }
}

impl From<&Features> for FeatureFile {
    fn from(features: &Features) -> Self {
        FeatureFile {
            keypoints: features.keypoints.iter().map(|k| k.to_array()).collect(),
            descriptors: features.descriptors.clone(),
            colors: features.colors.clone(),
        }
    }
}

/// Read the features of one image from a JSON file.
pub fn read_features(path: impl AsRef<Path>) -> Result<Features, IoError> {
    let reader = BufReader::new(File::open(path)?);
    let file: FeatureFile = serde_json::from_reader(reader)?;
    Ok(file.into())
}

/// Write the features of one image to a JSON file.
pub fn write_features(path: impl AsRef<Path>, features: &Features) -> Result<(), IoError> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, &FeatureFile::from(features))?;
    Ok(())
}

/// Load every `*.json` feature file of a directory as a view, ordered by file name.
///
/// The file stem becomes the image identifier; all images share `camera`.
pub fn read_views(
    directory: impl AsRef<Path>,
    camera: &PinholeCamera,
) -> Result<Vec<View>, IoError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(directory)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let features = read_features(path)?;
            log::debug!("loaded {} keypoints for {id}", features.keypoints.len());
            Ok(View::new(id, *camera, features)?)
        })
        .collect()
}

/// A feature backend serving precomputed features stored next to the images.
///
/// The features of `image.png` are read from `<directory>/image.json`.
#[derive(Clone, Debug)]
pub struct JsonFeatureBackend {
    directory: PathBuf,
}

impl JsonFeatureBackend {
    /// Serve feature files from `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Path of the feature file for an image.
    pub fn feature_path(&self, image: &Path) -> PathBuf {
        let stem = image
            .file_stem()
            .unwrap_or(image.as_os_str())
            .to_string_lossy();
        self.directory.join(format!("{stem}.json"))
    }
}

impl FeatureBackend for JsonFeatureBackend {
    type Image = Path;
    type Error = IoError;

    fn detect_and_describe(&self, image: &Path) -> Result<Features, IoError> {
        read_features(self.feature_path(image))
    }
}

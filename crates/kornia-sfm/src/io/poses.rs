use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use super::IoError;
use crate::camera::CameraPose;
use crate::linalg::{mat3_from_row_major, mat3_to_row_major};
use crate::pipeline::RegisteredCamera;

/// Exported pose of one registered image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    /// Image identifier.
    pub image_id: String,
    /// Index of the image in the input order.
    pub view_index: usize,
    /// World-to-camera rotation, row-major.
    pub rotation: [f64; 9],
    /// World-to-camera translation.
    pub translation: [f64; 3],
    /// Camera center in world coordinates.
    pub center: [f64; 3],
}

impl PoseRecord {
    /// Record for a registered camera.
    pub fn new(image_id: impl Into<String>, view_index: usize, pose: &CameraPose) -> Self {
        Self {
            image_id: image_id.into(),
            view_index,
            rotation: mat3_to_row_major(&pose.rotation),
            translation: pose.translation.to_array(),
            center: pose.center().to_array(),
        }
    }

    /// The world-to-camera pose.
    pub fn pose(&self) -> CameraPose {
        let rotation = mat3_from_row_major(&self.rotation);
        CameraPose::new(rotation, DVec3::from_array(self.translation))
    }
}

impl From<&RegisteredCamera> for PoseRecord {
    fn from(camera: &RegisteredCamera) -> Self {
        PoseRecord::new(camera.image_id.clone(), camera.view, &camera.pose)
    }
}

/// Write the poses of the registered cameras as a JSON array.
pub fn write_poses_json(
    path: impl AsRef<Path>,
    cameras: &[RegisteredCamera],
) -> Result<(), IoError> {
    let records: Vec<PoseRecord> = cameras.iter().map(PoseRecord::from).collect();
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &records)?;
    writer.flush()?;
    Ok(())
}

/// Read poses written by [`write_poses_json`].
pub fn read_poses_json(path: impl AsRef<Path>) -> Result<Vec<PoseRecord>, IoError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

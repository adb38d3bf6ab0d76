use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::IoError;
use crate::pointcloud::PointCloud;

/// Encoding of the PLY body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlyFormat {
    /// Human-readable text.
    #[default]
    Ascii,
    /// Packed little-endian records.
    BinaryLittleEndian,
}

impl PlyFormat {
    fn header_name(&self) -> &'static str {
        match self {
            PlyFormat::Ascii => "ascii",
            PlyFormat::BinaryLittleEndian => "binary_little_endian",
        }
    }
}

/// Write a point cloud as PLY vertices `x y z` (float) with optional `red green blue` (uchar).
pub fn write_ply_to<W: Write>(
    writer: &mut W,
    cloud: &PointCloud,
    format: PlyFormat,
) -> Result<(), IoError> {
    let colors = cloud.colors();
    writeln!(writer, "ply")?;
    writeln!(writer, "format {} 1.0", format.header_name())?;
    writeln!(writer, "comment generated by kornia-sfm")?;
    writeln!(writer, "element vertex {}", cloud.len())?;
    for axis in ["x", "y", "z"] {
        writeln!(writer, "property float {axis}")?;
    }
    if colors.is_some() {
        for channel in ["red", "green", "blue"] {
            writeln!(writer, "property uchar {channel}")?;
        }
    }
    writeln!(writer, "end_header")?;

    for (i, p) in cloud.points().iter().enumerate() {
        let color = colors.and_then(|c| c.get(i));
        match format {
            PlyFormat::Ascii => {
                write!(writer, "{} {} {}", p[0] as f32, p[1] as f32, p[2] as f32)?;
                if let Some([r, g, b]) = color {
                    write!(writer, " {r} {g} {b}")?;
                }
                writeln!(writer)?;
            }
            PlyFormat::BinaryLittleEndian => {
                for v in p {
                    writer.write_all(&(*v as f32).to_le_bytes())?;
                }
                if let Some(rgb) = color {
                    writer.write_all(rgb)?;
                }
            }
        }
    }
    Ok(())
}

/// Write a point cloud to a PLY file.
pub fn write_ply(
    path: impl AsRef<Path>,
    cloud: &PointCloud,
    format: PlyFormat,
) -> Result<(), IoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_ply_to(&mut writer, cloud, format)?;
    writer.flush()?;
    Ok(())
}

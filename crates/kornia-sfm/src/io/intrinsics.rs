use std::path::Path;

use glam::DMat3;

use super::IoError;
use crate::camera::PinholeCamera;
use crate::linalg::mat3_from_row_major;

/// Parse a 3x3 intrinsics matrix written as nine whitespace-separated numbers, row by row.
pub fn parse_intrinsics(text: &str) -> Result<DMat3, IoError> {
    let values = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|e| IoError::Parse(format!("invalid intrinsics value {tok:?}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != 9 {
        return Err(IoError::Parse(format!(
            "expected 9 intrinsics values, found {}",
            values.len()
        )));
    }
    let k = mat3_from_row_major(&values);
    if k.x_axis.x <= 0.0 || k.y_axis.y <= 0.0 {
        return Err(IoError::Parse("focal lengths must be positive".to_string()));
    }
    Ok(k)
}

/// Read a `K.txt` intrinsics file for images of the given size.
///
/// # Arguments
///
/// * `path` - The path to the intrinsics file.
/// * `width` - The image width in pixels.
/// * `height` - The image height in pixels.
pub fn read_intrinsics(
    path: impl AsRef<Path>,
    width: usize,
    height: usize,
) -> Result<PinholeCamera, IoError> {
    let text = std::fs::read_to_string(path)?;
    let k = parse_intrinsics(&text)?;
    Ok(PinholeCamera::from_matrix(&k, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_intrinsics() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "2759.48 0 1520.69")?;
        writeln!(file, "0 2764.16 1006.81")?;
        writeln!(file, "0 0 1")?;
        let cam = read_intrinsics(file.path(), 3072, 2048)?;
        assert_eq!(cam.fx, 2759.48);
        assert_eq!(cam.cy, 1006.81);

        let half = cam.downscaled(2.0);
        assert_eq!(half.fx, 2759.48 / 2.0);
        assert_eq!(half.width, 1536);
        Ok(())
    }

    #[test]
    fn test_parse_intrinsics_rejects_bad_input() {
        assert!(matches!(parse_intrinsics("1 0 0 0 1 0"), Err(IoError::Parse(_))));
        assert!(matches!(parse_intrinsics("1 0 0 0 x 0 0 0 1"), Err(IoError::Parse(_))));
        assert!(matches!(parse_intrinsics("0 0 0 0 1 0 0 0 1"), Err(IoError::Parse(_))));
    }
}

use glam::DVec3;

/// A point cloud with points, optional colors and per-point visibility.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    // The points in the point cloud.
    points: Vec<[f64; 3]>,
    // The colors of the points.
    colors: Option<Vec<[u8; 3]>>,
    // Number of images observing each point.
    visibility: Vec<usize>,
}

impl PointCloud {
    /// Create a new point cloud from points, colors (optional) and visibility counts.
    ///
    /// `visibility` is resized to the number of points, missing entries count as zero.
    pub fn new(
        points: Vec<[f64; 3]>,
        colors: Option<Vec<[u8; 3]>>,
        mut visibility: Vec<usize>,
    ) -> Self {
        visibility.resize(points.len(), 0);
        Self {
            points,
            colors,
            visibility,
        }
    }

    /// Get the number of points in the point cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get as reference the points in the point cloud.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Get as reference the colors of the points in the point cloud.
    pub fn colors(&self) -> Option<&[[u8; 3]]> {
        self.colors.as_deref()
    }

    /// Number of images observing each point.
    pub fn visibility(&self) -> &[usize] {
        &self.visibility
    }

    /// Centroid of the points, zero for an empty cloud.
    pub fn centroid(&self) -> DVec3 {
        if self.points.is_empty() {
            return DVec3::ZERO;
        }
        let sum = self
            .points
            .iter()
            .fold(DVec3::ZERO, |a, p| a + DVec3::from_array(*p));
        sum / self.len() as f64
    }

    /// Root-mean-square distance of the points to their centroid.
    pub fn spread(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let c = self.centroid();
        let sq: f64 = self
            .points
            .iter()
            .map(|p| DVec3::from_array(*p).distance_squared(c))
            .sum();
        (sq / self.len() as f64).sqrt()
    }

    /// Drop points farther from the centroid than `mean + k * std` of the distances.
    pub fn without_distant_points(&self, k: f64) -> PointCloud {
        if self.points.len() < 2 {
            return self.clone();
        }
        let c = self.centroid();
        let dist: Vec<f64> = self
            .points
            .iter()
            .map(|p| DVec3::from_array(*p).distance(c))
            .collect();
        let n = dist.len() as f64;
        let mean = dist.iter().sum::<f64>() / n;
        let var = dist.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / n;
        let std = var.sqrt();
        let limit = mean + k * std;

        let keep: Vec<usize> = (0..self.len()).filter(|&i| dist[i] <= limit).collect();
        PointCloud {
            points: keep.iter().map(|&i| self.points[i]).collect(),
            colors: self
                .colors
                .as_ref()
                .map(|c| keep.iter().map(|&i| c[i]).collect()),
            visibility: keep.iter().map(|&i| self.visibility[i]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distant_points_filter() {
        let mut points: Vec<[f64; 3]> = (0..20)
            .map(|i| {
                let a = i as f64 * 0.3;
                [a.cos(), a.sin(), 0.0]
            })
            .collect();
        points.push([100.0, 0.0, 0.0]);
        let colors = Some(vec![[1, 2, 3]; points.len()]);
        let pc = PointCloud::new(points, colors, vec![2; 21]);
        let filtered = pc.without_distant_points(2.0);
        assert_eq!(filtered.len(), 20);
        assert_eq!(filtered.colors().map(|c| c.len()), Some(20));
        assert!(filtered.points().iter().all(|p| p[0] < 2.0));
    }

    #[test]
    fn test_centroid_and_spread() {
        let pc = PointCloud::new(vec![[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]], None, vec![]);
        assert_relative_eq!(pc.centroid().length(), 0.0);
        assert_relative_eq!(pc.spread(), 1.0);
        assert_eq!(pc.visibility(), &[0, 0]);
    }
}

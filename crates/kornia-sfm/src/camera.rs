use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Points closer than this to the image plane are treated as behind the camera.
pub(crate) const MIN_DEPTH: f64 = 1e-9;

/// The intrinsic parameters of a pinhole camera.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    /// Focal length along x in pixels.
    pub fx: f64,
    /// Focal length along y in pixels.
    pub fy: f64,
    /// Principal point x in pixels.
    pub cx: f64,
    /// Principal point y in pixels.
    pub cy: f64,
    /// Image width in pixels.
    pub width: usize,
    /// Image height in pixels.
    pub height: usize,
}

impl PinholeCamera {
    /// Creates a new camera from focal lengths, principal point and image size.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: usize, height: usize) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Creates a camera from a 3x3 calibration matrix `K`.
    ///
    /// The skew term of `K` is ignored.
    pub fn from_matrix(k: &DMat3, width: usize, height: usize) -> Self {
        let (fx, fy) = (k.x_axis.x, k.y_axis.y);
        Self::new(fx, fy, k.z_axis.x, k.z_axis.y, width, height)
    }

    /// Returns the calibration matrix `K`.
    pub fn matrix(&self) -> DMat3 {
        DMat3::from_cols(
            DVec3::new(self.fx, 0.0, 0.0),
            DVec3::new(0.0, self.fy, 0.0),
            DVec3::new(self.cx, self.cy, 1.0),
        )
    }

    /// Returns the intrinsics of the same camera for images downsampled by `factor`.
    pub fn downscaled(&self, factor: f64) -> Self {
        Self {
            fx: self.fx / factor,
            fy: self.fy / factor,
            cx: self.cx / factor,
            cy: self.cy / factor,
            width: (self.width as f64 / factor).round() as usize,
            height: (self.height as f64 / factor).round() as usize,
        }
    }

    /// Mean focal length in pixels.
    pub fn focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    /// Length of the image diagonal in pixels.
    pub fn diagonal(&self) -> f64 {
        ((self.width * self.width + self.height * self.height) as f64).sqrt()
    }

    /// Projects a point expressed in the camera frame onto the image.
    ///
    /// Returns `None` when the point is not in front of the camera.
    pub fn project(&self, p_cam: DVec3) -> Option<DVec2> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        Some(DVec2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Rows of the 2x3 Jacobian of [`PinholeCamera::project`] at a camera-frame point.
    pub(crate) fn projection_jacobian(&self, p_cam: DVec3) -> [DVec3; 2] {
        let iz = 1.0 / p_cam.z;
        [
            DVec3::new(self.fx * iz, 0.0, -self.fx * p_cam.x * iz * iz),
            DVec3::new(0.0, self.fy * iz, -self.fy * p_cam.y * iz * iz),
        ]
    }

    /// Back-projects a pixel to normalized image coordinates `(x, y, 1)`.
    pub fn unproject(&self, px: DVec2) -> DVec3 {
        DVec3::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy, 1.0)
    }
}

/// A world-to-camera rigid transform, `x_cam = R * x_world + t`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraPose {
    /// Rotation from world to camera frame.
    pub rotation: DMat3,
    /// Translation from world to camera frame.
    pub translation: DVec3,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl CameraPose {
    /// The pose of the camera that defines the world frame.
    pub const IDENTITY: Self = Self {
        rotation: DMat3::IDENTITY,
        translation: DVec3::ZERO,
    };

    /// Creates a pose from rotation and translation.
    pub fn new(rotation: DMat3, translation: DVec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Maps a world point into the camera frame.
    pub fn transform_point(&self, p: DVec3) -> DVec3 {
        self.rotation * p + self.translation
    }

    /// Camera center in world coordinates, `-R^T t`.
    pub fn center(&self) -> DVec3 {
        -(self.rotation.transpose() * self.translation)
    }

    /// Depth of a world point along the optical axis.
    pub fn depth(&self, p: DVec3) -> f64 {
        self.transform_point(p).z
    }

    /// Chains a relative motion after this pose.
    ///
    /// With `self` the pose of camera j and `relative` the motion from camera j to camera i,
    /// returns the pose of camera i: `R_i = R_rel R_j`, `t_i = R_rel t_j + t_rel`.
    pub fn then(&self, relative: &CameraPose) -> CameraPose {
        CameraPose {
            rotation: relative.rotation * self.rotation,
            translation: relative.rotation * self.translation + relative.translation,
        }
    }

    /// Motion from `reference` to `self`, the inverse of [`CameraPose::then`].
    pub fn relative_to(&self, reference: &CameraPose) -> CameraPose {
        let rotation = self.rotation * reference.rotation.transpose();
        CameraPose {
            rotation,
            translation: self.translation - rotation * reference.translation,
        }
    }

    /// Projects a world point through this pose and the given intrinsics.
    pub fn project(&self, camera: &PinholeCamera, p: DVec3) -> Option<DVec2> {
        camera.project(self.transform_point(p))
    }

    /// Pixel distance between an observation and the projection of a world point.
    ///
    /// Returns `None` when the point lies behind the camera.
    pub fn reprojection_error(
        &self,
        camera: &PinholeCamera,
        p: DVec3,
        observed: DVec2,
    ) -> Option<f64> {
        self.project(camera, p).map(|uv| uv.distance(observed))
    }
}

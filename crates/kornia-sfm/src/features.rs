use crate::camera::PinholeCamera;
use glam::DVec2;
use serde::{Deserialize, Serialize};

/// The layout of a descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Real-valued descriptors of the given dimension compared with L2 distance.
    Float(usize),
    /// Binary descriptors of the given byte length compared with Hamming distance.
    Binary(usize),
}

/// A borrowed single descriptor.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorRef<'a> {
    /// Real-valued descriptor.
    Float(&'a [f32]),
    /// Packed binary descriptor.
    Binary(&'a [u8]),
}

impl DescriptorRef<'_> {
    /// Distance between two descriptors of the same kind and length.
    ///
    /// Returns `None` when the descriptors are not comparable.
    pub fn distance(&self, other: &DescriptorRef<'_>) -> Option<f32> {
        match (self, other) {
            (DescriptorRef::Float(a), DescriptorRef::Float(b)) if a.len() == b.len() => Some(
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt(),
            ),
            (DescriptorRef::Binary(a), DescriptorRef::Binary(b)) if a.len() == b.len() => Some(
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x ^ y).count_ones())
                    .sum::<u32>() as f32,
            ),
            _ => None,
        }
    }
}

/// A set of descriptors stored contiguously, one per keypoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptors {
    /// Real-valued descriptors (e.g. SIFT), `data.len() == dim * n`.
    Float {
        /// Descriptor dimension.
        dim: usize,
        /// Row-major descriptor data.
        data: Vec<f32>,
    },
    /// Binary descriptors (e.g. ORB), `data.len() == bytes * n`.
    Binary {
        /// Descriptor length in bytes.
        bytes: usize,
        /// Row-major descriptor data.
        data: Vec<u8>,
    },
}

impl Descriptors {
    /// Number of descriptors in the set.
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Float { dim, data } if *dim > 0 => data.len() / dim,
            Descriptors::Binary { bytes, data } if *bytes > 0 => data.len() / bytes,
            _ => 0,
        }
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The layout of the set.
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Descriptors::Float { dim, .. } => DescriptorKind::Float(*dim),
            Descriptors::Binary { bytes, .. } => DescriptorKind::Binary(*bytes),
        }
    }

    /// Borrow the descriptor at `index`.
    pub fn get(&self, index: usize) -> Option<DescriptorRef<'_>> {
        match self {
            Descriptors::Float { dim, data } => data
                .get(index * dim..(index + 1) * dim)
                .map(DescriptorRef::Float),
            Descriptors::Binary { bytes, data } => data
                .get(index * bytes..(index + 1) * bytes)
                .map(DescriptorRef::Binary),
        }
    }

    /// Collect borrowed descriptors into a new set.
    ///
    /// Returns `None` if the iterator is empty or mixes kinds or lengths.
    pub fn collect<'a>(items: impl IntoIterator<Item = DescriptorRef<'a>>) -> Option<Descriptors> {
        let mut items = items.into_iter();
        let mut out = match items.next()? {
            DescriptorRef::Float(d) => Descriptors::Float {
                dim: d.len(),
                data: d.to_vec(),
            },
            DescriptorRef::Binary(d) => Descriptors::Binary {
                bytes: d.len(),
                data: d.to_vec(),
            },
        };
        for item in items {
            match (&mut out, item) {
                (Descriptors::Float { dim, data }, DescriptorRef::Float(d)) if d.len() == *dim => {
                    data.extend_from_slice(d)
                }
                (Descriptors::Binary { bytes, data }, DescriptorRef::Binary(d))
                    if d.len() == *bytes =>
                {
                    data.extend_from_slice(d)
                }
                _ => return None,
            }
        }
        Some(out)
    }
}

/// Keypoints and descriptors detected in one image.
#[derive(Clone, Debug, PartialEq)]
pub struct Features {
    /// Keypoint pixel coordinates.
    pub keypoints: Vec<DVec2>,
    /// One descriptor per keypoint.
    pub descriptors: Descriptors,
    /// Optional RGB color sampled at each keypoint.
    pub colors: Option<Vec<[u8; 3]>>,
}

/// A detector/descriptor that turns an image into [`Features`].
pub trait FeatureBackend {
    /// The image representation accepted by the backend.
    type Image: ?Sized;
    /// Error raised by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Detects keypoints and computes their descriptors.
    fn detect_and_describe(&self, image: &Self::Image) -> Result<Features, Self::Error>;
}

/// Errors raised when assembling a [`View`].
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// Keypoint and descriptor counts differ.
    #[error("view {id}: {keypoints} keypoints but {descriptors} descriptors")]
    LengthMismatch {
        /// View identifier.
        id: String,
        /// Number of keypoints.
        keypoints: usize,
        /// Number of descriptors.
        descriptors: usize,
    },
    /// Color count differs from keypoint count.
    #[error("view {id}: {colors} colors for {keypoints} keypoints")]
    ColorMismatch {
        /// View identifier.
        id: String,
        /// Number of keypoints.
        keypoints: usize,
        /// Number of colors.
        colors: usize,
    },
}

/// One input image: identifier, intrinsics and its features. Immutable once built.
#[derive(Clone, Debug)]
pub struct View {
    id: String,
    camera: PinholeCamera,
    features: Features,
}

impl View {
    /// Creates a view after checking that keypoints, descriptors and colors line up.
    pub fn new(
        id: impl Into<String>,
        camera: PinholeCamera,
        features: Features,
    ) -> Result<Self, ViewError> {
        let id = id.into();
        let keypoints = features.keypoints.len();
        if features.descriptors.len() != keypoints {
            return Err(ViewError::LengthMismatch {
                id,
                keypoints,
                descriptors: features.descriptors.len(),
            });
        }
        if let Some(colors) = &features.colors {
            if colors.len() != keypoints {
                return Err(ViewError::ColorMismatch {
                    id,
                    keypoints,
                    colors: colors.len(),
                });
            }
        }
        Ok(Self {
            id,
            camera,
            features,
        })
    }

    /// Image identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Image intrinsics.
    pub fn camera(&self) -> &PinholeCamera {
        &self.camera
    }

    /// Keypoint pixel coordinates.
    pub fn keypoints(&self) -> &[DVec2] {
        &self.features.keypoints
    }

    /// Keypoint at `index`.
    pub fn keypoint(&self, index: usize) -> DVec2 {
        self.features.keypoints[index]
    }

    /// Descriptor set.
    pub fn descriptors(&self) -> &Descriptors {
        &self.features.descriptors
    }

    /// Color sampled at keypoint `index`, if the view carries colors.
    pub fn color(&self, index: usize) -> Option<[u8; 3]> {
        self.features
            .colors
            .as_ref()
            .and_then(|c| c.get(index).copied())
    }
}

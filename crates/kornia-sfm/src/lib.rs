#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Bundle adjustment of cameras and points.
pub mod bundle;

/// Pinhole intrinsics and camera poses.
pub mod camera;

/// Chaining relative poses into a global frame.
pub mod chain;

/// Run configuration.
pub mod config;

/// Keypoints, descriptors and input views.
pub mod features;

/// I/O utilities for intrinsics, features, point clouds and poses.
pub mod io;

/// Linear algebra utilities.
pub mod linalg;

/// Descriptor matching between images.
pub mod matching;

/// The reconstruction controller.
pub mod pipeline;

/// Perspective-n-Point (PnP) solvers.
pub mod pnp;

/// Point cloud container.
pub mod pointcloud;

/// Two-view pose estimation algorithms.
pub mod pose;

/// The reconstruction state.
pub mod reconstruction;

/// Track building over registered views.
pub mod tracks;

/// Multi-view triangulation.
pub mod triangulation;

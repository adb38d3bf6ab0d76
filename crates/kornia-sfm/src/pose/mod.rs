//! # Pose estimation
//!
//! Two-view geometry: recovering the relative motion of two cameras from 2D correspondences.
//!
//! - [`fundamental`]: fundamental matrix (epipolar geometry in pixel space, 7 DOF)
//! - [`essential`]: essential matrix (epipolar geometry in metric space, 5 DOF)
//! - [`ransac`]: robust estimation with a selectable minimal solver
//! - [`twoview`]: full estimator: RANSAC, chance test, cheirality, parallax check

/// Fundamental matrix solvers and residuals.
pub mod fundamental;
pub use fundamental::*;

/// Essential matrix solvers and decomposition.
pub mod essential;
pub use essential::*;

/// RANSAC over epipolar models.
pub mod ransac;
pub use ransac::*;

/// Relative pose estimation between two views.
pub mod twoview;
pub use twoview::*;

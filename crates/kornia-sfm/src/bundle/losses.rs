//! Robust loss functions for the reprojection least-squares problem.

use serde::{Deserialize, Serialize};

/// A robust loss `rho(s)` of a squared residual norm `s`.
pub trait RobustLoss: Send + Sync {
    /// Loss value for a squared residual norm.
    fn cost(&self, squared_norm: f64) -> f64;

    /// IRLS weight `rho'(s)` for a squared residual norm.
    fn weight(&self, squared_norm: f64) -> f64;
}

/// Selectable loss function.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossFunction {
    /// Plain squared error.
    Identity,
    /// Quadratic up to `delta` pixels, linear beyond.
    Huber {
        /// Transition point in pixels.
        delta: f64,
    },
    /// Cauchy (Lorentzian) loss.
    Cauchy {
        /// Scale in pixels.
        scale: f64,
    },
}

impl Default for LossFunction {
    fn default() -> Self {
        LossFunction::Huber { delta: 1.0 }
    }
}

impl RobustLoss for LossFunction {
    fn cost(&self, s: f64) -> f64 {
        match *self {
            LossFunction::Identity => s,
            LossFunction::Huber { delta } => {
                let d2 = delta * delta;
                if s <= d2 {
                    s
                } else {
                    2.0 * delta * s.sqrt() - d2
                }
            }
            LossFunction::Cauchy { scale } => {
                let c2 = (scale * scale).max(f64::MIN_POSITIVE);
                c2 * (1.0 + s / c2).ln()
            }
        }
    }

    fn weight(&self, s: f64) -> f64 {
        match *self {
            LossFunction::Identity => 1.0,
            LossFunction::Huber { delta } => {
                if s <= delta * delta {
                    1.0
                } else {
                    delta / s.sqrt()
                }
            }
            LossFunction::Cauchy { scale } => {
                let c2 = (scale * scale).max(f64::MIN_POSITIVE);
                1.0 / (1.0 + s / c2)
            }
        }
    }
}

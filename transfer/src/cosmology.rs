// SPDX-License-Identifier: AGPL-3.0-only

//! Background and thermodynamics collaborators.
//!
//! The transfer build never integrates the expansion history itself; it
//! queries a [`Background`] for the conformal age, the time of a redshift
//! and the expansion state at a time, and reads three numbers from the
//! recombination history ([`Thermodynamics`]).
//!
//! [`EinsteinDeSitter`] is a closed-form matter-only background used by the
//! tests and the validation binary.

use crate::error::TransferError;

/// Spatial curvature K (in 1/Mpc²) with its sign.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Curvature {
    /// Signed curvature; positive is closed.
    pub k: f64,
}

impl Curvature {
    /// Flat space.
    pub const FLAT: Self = Self { k: 0.0 };

    /// Curvature from its signed value.
    #[must_use]
    pub const fn new(k: f64) -> Self {
        Self { k }
    }

    /// Sign of K: 1 closed, 0 flat, −1 open.
    #[must_use]
    pub fn sign(self) -> i8 {
        if self.k > 0.0 {
            1
        } else if self.k < 0.0 {
            -1
        } else {
            0
        }
    }

    /// √|K|.
    #[must_use]
    pub fn sqrt_abs(self) -> f64 {
        self.k.abs().sqrt()
    }

    /// Generalized sine of a comoving distance: d, sin(√K d)/√K or
    /// sinh(√−K d)/√−K.
    #[must_use]
    pub fn sin_k(self, d: f64) -> f64 {
        let s = self.sqrt_abs();
        match self.sign() {
            1 => (s * d).sin() / s,
            -1 => (s * d).sinh() / s,
            _ => d,
        }
    }

    /// Generalized cotangent of a comoving distance: 1/d, √K cot(√K d) or
    /// √−K coth(√−K d).
    #[must_use]
    pub fn cot_k(self, d: f64) -> f64 {
        let s = self.sqrt_abs();
        match self.sign() {
            1 => s / (s * d).tan(),
            -1 => s / (s * d).tanh(),
            _ => 1.0 / d,
        }
    }
}

/// Expansion state at one conformal time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackgroundState {
    /// Scale factor a.
    pub a: f64,
    /// Conformal Hubble rate H = a'/a² in 1/Mpc.
    pub h: f64,
    /// Conformal-time derivative of H.
    pub h_prime: f64,
}

/// Expansion history queried by the transfer build.
///
/// Shared read-only across all worker threads.
pub trait Background: Sync {
    /// Conformal age τ0 today, in Mpc.
    fn conformal_age(&self) -> f64;

    /// Spatial curvature.
    fn curvature(&self) -> Curvature;

    /// Scale factor today.
    fn a_today(&self) -> f64 {
        1.0
    }

    /// Conformal time at redshift z.
    ///
    /// # Errors
    ///
    /// Returns an error if z lies outside the tabulated history.
    fn tau_of_z(&self, z: f64) -> Result<f64, TransferError>;

    /// Expansion state at conformal time τ.
    ///
    /// # Errors
    ///
    /// Returns an error if τ lies outside the tabulated history.
    fn state_at_tau(&self, tau: f64) -> Result<BackgroundState, TransferError>;

    /// Redshift at conformal time τ.
    ///
    /// # Errors
    ///
    /// Propagates [`Background::state_at_tau`] failures.
    fn z_of_tau(&self, tau: f64) -> Result<f64, TransferError> {
        Ok(self.a_today() / self.state_at_tau(tau)?.a - 1.0)
    }
}

/// The three recombination-history numbers the transfer build needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thermodynamics {
    /// Conformal time of recombination.
    pub tau_rec: f64,
    /// Ratio of the angular-diameter distance to recombination to its
    /// reference value; rescales default l and q steps.
    pub angular_rescaling: f64,
    /// Conformal time after which late sources may be truncated.
    pub tau_cut: f64,
}

/// Matter-dominated background: a(τ) = (τ/τ0)².
///
/// The curvature only enters the geometry (radial coordinates, kernel
/// tables); the expansion stays Einstein–de Sitter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EinsteinDeSitter {
    /// Conformal age today.
    pub tau0: f64,
    /// Nominal curvature.
    pub curvature: Curvature,
}

impl EinsteinDeSitter {
    /// Flat background with conformal age τ0.
    #[must_use]
    pub const fn flat(tau0: f64) -> Self {
        Self {
            tau0,
            curvature: Curvature::FLAT,
        }
    }

    /// Background with a nominal curvature.
    #[must_use]
    pub const fn with_curvature(tau0: f64, curvature: Curvature) -> Self {
        Self { tau0, curvature }
    }
}

impl Background for EinsteinDeSitter {
    fn conformal_age(&self) -> f64 {
        self.tau0
    }

    fn curvature(&self) -> Curvature {
        self.curvature
    }

    fn tau_of_z(&self, z: f64) -> Result<f64, TransferError> {
        if !(z >= 0.0 && z.is_finite()) {
            return Err(TransferError::InterpolationOutOfRange {
                what: "background redshift",
                x: z,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        Ok(self.tau0 / (1.0 + z).sqrt())
    }

    fn state_at_tau(&self, tau: f64) -> Result<BackgroundState, TransferError> {
        if !(tau > 0.0 && tau <= self.tau0 * (1.0 + f64::EPSILON)) {
            return Err(TransferError::InterpolationOutOfRange {
                what: "background time",
                x: tau,
                min: 0.0,
                max: self.tau0,
            });
        }
        let t0sq = self.tau0 * self.tau0;
        Ok(BackgroundState {
            a: tau * tau / t0sq,
            h: 2.0 * t0sq / (tau * tau * tau),
            h_prime: -6.0 * t0sq / (tau * tau * tau * tau),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn curvature_signs() {
        assert_eq!(Curvature::FLAT.sign(), 0);
        assert_eq!(Curvature::new(1e-8).sign(), 1);
        assert_eq!(Curvature::new(-1e-8).sign(), -1);
    }

    #[test]
    fn generalized_trig_reduces_to_flat() {
        let d = 1234.5;
        let tiny = Curvature::new(1e-14);
        assert_relative_eq!(tiny.sin_k(d), d, max_relative = 1e-6);
        assert_relative_eq!(Curvature::new(-1e-14).cot_k(d), 1.0 / d, max_relative = 1e-6);
        assert_relative_eq!(Curvature::FLAT.cot_k(d), 1.0 / d);
    }

    #[test]
    fn closed_sine_matches_definition() {
        let k = Curvature::new(4e-8);
        let d = 5000.0;
        let s = 2e-4;
        assert_relative_eq!(k.sin_k(d), (s * d).sin() / s, max_relative = 1e-14);
        assert_relative_eq!(k.cot_k(d), s * (s * d).cos() / (s * d).sin(), max_relative = 1e-12);
    }

    #[test]
    fn eds_today() {
        let bg = EinsteinDeSitter::flat(14000.0);
        let now = bg.state_at_tau(14000.0).unwrap();
        assert_relative_eq!(now.a, 1.0);
        assert_relative_eq!(now.h, 2.0 / 14000.0);
        assert_relative_eq!(bg.z_of_tau(14000.0).unwrap(), 0.0, epsilon = 1e-14);
    }

    #[test]
    fn eds_redshift_round_trip() {
        let bg = EinsteinDeSitter::flat(14000.0);
        for z in [0.0, 0.3, 1.0, 3.0, 1100.0] {
            let tau = bg.tau_of_z(z).unwrap();
            assert_relative_eq!(bg.z_of_tau(tau).unwrap(), z, epsilon = 1e-9, max_relative = 1e-10);
        }
    }

    #[test]
    fn eds_hubble_derivative_is_consistent() {
        let bg = EinsteinDeSitter::flat(14000.0);
        let tau = 7000.0;
        let h = 1e-3;
        let fd = (bg.state_at_tau(tau + h).unwrap().h - bg.state_at_tau(tau - h).unwrap().h)
            / (2.0 * h);
        assert_relative_eq!(bg.state_at_tau(tau).unwrap().h_prime, fd, max_relative = 1e-6);
    }

    #[test]
    fn eds_rejects_out_of_range() {
        let bg = EinsteinDeSitter::flat(14000.0);
        assert!(bg.tau_of_z(-0.5).is_err());
        assert!(bg.state_at_tau(0.0).is_err());
        assert!(bg.state_at_tau(20000.0).is_err());
    }
}

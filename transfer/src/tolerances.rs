// SPDX-License-Identifier: AGPL-3.0-only

//! Numerical guards and validation tolerances with their justification.
//!
//! Guards are used by the build itself (grid snapping, integer-nu checks,
//! recurrence rescaling). Validation tolerances are used by the tests and by
//! the `validate_transfer` binary. No ad-hoc magic numbers elsewhere.

// ═══════════════════════════════════════════════════════════════════
// Grid guards
// ═══════════════════════════════════════════════════════════════════

/// Largest tolerated undershoot of k(q) below the perturbation k_min.
///
/// k = sqrt(q² − K(m+1)) and the inverse map lose a few ulps; anything
/// larger means the q grid was planned from a different k range.
pub const K_MIN_ROUNDING: f64 = 10.0 * f64::EPSILON;

/// Offset added before truncating nu = q/√K to an integer in closed space.
///
/// Closed-space q values are built as integer nu times √K; the offset
/// absorbs rounding from the multiplication without crossing to nu + 1.
pub const CLOSED_NU_ROUNDING_OFFSET: f64 = 0.2;

/// Largest tolerated distance of closed-space nu from an integer.
pub const CLOSED_NU_INTEGER_TOL: f64 = 1e-6;

/// Safety factor for the conservative q-grid size bound.
pub const Q_SIZE_SAFETY_FACTOR: f64 = 5.0;

/// Extra flat-table range for open space.
///
/// The rescaled argument χ·√(l(l+1))/asinh(√(l(l+1))/ν) exceeds qτ0 by at
/// most this factor on top of the analytic ratio.
pub const OPEN_TABLE_MARGIN: f64 = 1.01;

// ═══════════════════════════════════════════════════════════════════
// Hyperspherical recurrence guards
// ═══════════════════════════════════════════════════════════════════

/// Extra multipoles above the requested maximum where Miller's backward
/// recurrence starts.
pub const MILLER_EXTRA_MULTIPOLES: usize = 30;

/// Scale of the √(ACC·l) start offset for Miller's backward recurrence.
///
/// Numerical Recipes uses ACC = 40 for ~10 significant digits of j_l.
pub const MILLER_ACCURACY: f64 = 40.0;

/// Magnitude above which the backward recurrence is rescaled.
pub const RECURRENCE_OVERFLOW: f64 = 1e250;

/// Factor applied to all computed terms when the recurrence overflows.
pub const RECURRENCE_RESCALE: f64 = 1e-250;

/// Upper bound on bisection steps when locating the first non-negligible
/// radial coordinate of a kernel.
pub const X_NONZERO_MAX_BISECTIONS: usize = 200;

// ═══════════════════════════════════════════════════════════════════
// Validation tolerances
// ═══════════════════════════════════════════════════════════════════

/// Recurrence values against closed-form spherical Bessel functions.
///
/// Backward recurrence with Miller normalization keeps ~10 digits.
pub const BESSEL_CLOSED_FORM_REL: f64 = 1e-8;

/// Cubic Hermite interpolation of the flat kernel at 8 samples per period.
///
/// Interpolation error scales as h⁴/384 · max|Φ⁗| with h = π/4, giving
/// ~1e-3 of the kernel amplitude.
pub const HERMITE_CUBIC_ABS: f64 = 2e-3;

/// Quintic Hermite interpolation of curved kernels at 7 samples per period.
pub const HERMITE_QUINTIC_ABS: f64 = 5e-4;

/// Limber approximation against full quadrature for a smooth source.
///
/// First-order Limber error is O(1/l²) plus source curvature over the
/// kernel width; for l ≈ 100 and sources wider than the kernel lobe a
/// few percent is the expected agreement.
pub const LIMBER_VS_QUADRATURE_REL: f64 = 0.05;

/// Trapezoidal ∫W dτ after the selection normalization step.
///
/// The normalization divides by the same trapezoidal sum, so only
/// rounding remains.
pub const SELECTION_NORMALIZATION: f64 = 1e-10;

/// q → k → q round trip for all curvature signs and spins.
pub const WAVENUMBER_ROUND_TRIP_REL: f64 = 1e-12;

/// Operations that should be exact in f64 arithmetic.
pub const EXACT_F64: f64 = 1e-12;

/// Relative tolerance for spline and parabola reproduction of polynomials.
pub const POLYNOMIAL_REPRODUCTION: f64 = 1e-9;

// SPDX-License-Identifier: AGPL-3.0-only

//! Hyperspherical Bessel functions Φ_l^ν(χ) and their tables.
//!
//! Φ_l^ν solves the radial Helmholtz equation on a space of constant
//! curvature, in units where |K| = 1:
//!
//!   Φ″ + 2 cotK(χ) Φ′ + (β² − K − l(l+1)/sinK²(χ)) Φ = 0
//!
//! with β = ν in curved space and β = 1 (χ = k·r) in flat space, where
//! Φ_l reduces to the spherical Bessel function j_l. Values are generated
//! by the three-term recurrence in l, upward where it is stable and with
//! Miller's backward recurrence beyond the turning point. A
//! [`HyperTable`] samples Φ and Φ′ on a uniform χ grid and interpolates
//! with cubic or quintic Hermite polynomials, Φ″ and Φ‴ coming from the
//! differential equation.

use std::f64::consts::{FRAC_PI_2, PI};

use rayon::prelude::*;

use crate::error::TransferError;
use crate::tolerances::{
    MILLER_ACCURACY, MILLER_EXTRA_MULTIPOLES, RECURRENCE_OVERFLOW, RECURRENCE_RESCALE,
    X_NONZERO_MAX_BISECTIONS,
};

/// Fewest χ samples of any table.
const MIN_TABLE_POINTS: usize = 8;

/// Interpolation order of [`HyperTable::evaluate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HermiteOrder {
    /// Φ and Φ′ at the nodes.
    Cubic,
    /// Φ, Φ′ and Φ″ at the nodes.
    Quintic,
}

/// Kernel value and derivatives at one radial coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct KernelSample {
    /// Φ.
    pub phi: f64,
    /// dΦ/dχ.
    pub dphi: f64,
    /// d²Φ/dχ².
    pub d2phi: f64,
}

/// Generalized sine and cotangent in units |K| = 1.
fn sin_cot(sgn_k: i8, x: f64) -> (f64, f64) {
    match sgn_k {
        1 => (x.sin(), 1.0 / x.tan()),
        -1 => (x.sinh(), 1.0 / x.tanh()),
        _ => (x, 1.0 / x),
    }
}

/// Recurrence coefficient √(β² − K l²).
fn sqrt_k(sgn_k: i8, beta: f64, l: usize) -> f64 {
    let l = l as f64;
    (beta * beta - f64::from(sgn_k) * l * l).max(0.0).sqrt()
}

/// Φ_0 … Φ_{l_top} at χ = x.
///
/// In closed space Φ_l vanishes identically for l ≥ ν.
#[must_use]
pub fn phi_ladder(sgn_k: i8, beta: f64, x: f64, l_top: usize) -> Vec<f64> {
    let mut phi = vec![0.0; l_top + 1];
    let l_limit = if sgn_k == 1 {
        let nu = beta.round() as usize;
        if nu == 0 {
            return phi;
        }
        l_top.min(nu - 1)
    } else {
        l_top
    };

    let (s, c) = sin_cot(sgn_k, x);
    let (sin_bx, cos_bx) = (beta * x).sin_cos();
    phi[0] = sin_bx / (beta * s);
    if l_limit == 0 {
        return phi;
    }
    phi[1] = (sin_bx * c / beta - cos_bx) / (s * sqrt_k(sgn_k, beta, 1));
    if l_limit == 1 {
        return phi;
    }

    let l_turn = ((beta * beta - f64::from(sgn_k)).max(0.0).sqrt() * s) as usize;
    let l_forward = l_turn.clamp(1, l_limit);
    for l in 1..l_forward {
        phi[l + 1] = ((2 * l + 1) as f64 * c * phi[l] - sqrt_k(sgn_k, beta, l) * phi[l - 1])
            / sqrt_k(sgn_k, beta, l + 1);
    }
    if l_forward == l_limit {
        return phi;
    }

    let miller = l_limit
        + MILLER_EXTRA_MULTIPOLES
        + (MILLER_ACCURACY * l_limit as f64).sqrt() as usize;
    let start = if sgn_k == 1 {
        miller.min(beta.round() as usize - 1)
    } else {
        miller
    };
    let mut back = vec![0.0; start + 2];
    back[start] = 1.0;
    for l in (l_forward..=start).rev() {
        let next = ((2 * l + 1) as f64 * c * back[l] - sqrt_k(sgn_k, beta, l + 1) * back[l + 1])
            / sqrt_k(sgn_k, beta, l);
        back[l - 1] = next;
        if next.abs() > RECURRENCE_OVERFLOW {
            for v in &mut back[l - 1..] {
                *v *= RECURRENCE_RESCALE;
            }
        }
    }

    let matched = if phi[l_forward].abs() >= phi[l_forward - 1].abs() {
        l_forward
    } else {
        l_forward - 1
    };
    if back[matched] == 0.0 {
        return phi;
    }
    let norm = phi[matched] / back[matched];
    for l in l_forward + 1..=l_limit {
        phi[l] = back[l] * norm;
    }
    phi
}

/// Φ_l alone.
#[must_use]
pub fn phi_single(sgn_k: i8, beta: f64, l: usize, x: f64) -> f64 {
    phi_ladder(sgn_k, beta, x, l)[l]
}

/// Turning point of Φ_l: sinK(χ_tp) = √(l(l+1)/(β² − K)).
#[must_use]
pub fn turning_point(sgn_k: i8, beta: f64, l: usize) -> f64 {
    let l = l as f64;
    let s = (l * (l + 1.0) / (beta * beta - f64::from(sgn_k))).sqrt();
    match sgn_k {
        1 => s.min(1.0).asin(),
        -1 => s.asinh(),
        _ => s,
    }
}

/// First χ at which |Φ_l| reaches `phi_min_abs`, to within `x_tol`.
#[must_use]
pub fn x_nonzero(sgn_k: i8, beta: f64, l: usize, phi_min_abs: f64, x_min: f64, x_tol: f64) -> f64 {
    let x_tp = turning_point(sgn_k, beta, l).max(x_min);
    let big_enough = |x: f64| phi_single(sgn_k, beta, l, x).abs() >= phi_min_abs;
    if big_enough(x_min) {
        return x_min;
    }
    if !big_enough(x_tp) {
        return x_tp;
    }
    let (mut lo, mut hi) = (x_min, x_tp);
    for _ in 0..X_NONZERO_MAX_BISECTIONS {
        if hi - lo < x_tol {
            break;
        }
        let mid = 0.5 * (lo + hi);
        if big_enough(mid) {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    hi
}

/// Number of leading grid multipoles whose kernels are non-negligible
/// somewhere below `x_max`, keeping the first one beyond it.
#[must_use]
pub fn relevant_l_size(
    sgn_k: i8,
    beta: f64,
    l_grid: &[usize],
    x_max: f64,
    phi_min_abs: f64,
    x_min: f64,
    x_tol: f64,
) -> usize {
    let beyond = |index: usize| x_nonzero(sgn_k, beta, l_grid[index], phi_min_abs, x_min, x_tol) >= x_max;
    let (mut lo, mut hi) = (0_usize, l_grid.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if beyond(mid) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    (lo + 1).min(l_grid.len()).max(1)
}

/// Tabulated Φ_l and Φ′_l for a set of multipoles on a uniform χ grid.
#[derive(Clone, Debug)]
pub struct HyperTable {
    sgn_k: i8,
    beta: f64,
    l: Vec<usize>,
    x_min: f64,
    delta_x: f64,
    x_size: usize,
    phi: Vec<f64>,
    dphi: Vec<f64>,
    chi_at_phimin: Vec<f64>,
}

impl HyperTable {
    /// Tabulate `l` (strictly increasing) on [x_min, x_max] with
    /// `sampling` points per oscillation period 2π/β.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] for β ≤ 0, an empty
    /// multipole list, an empty χ range, or closed-space multipoles l ≥ ν.
    pub fn build(
        sgn_k: i8,
        beta: f64,
        l: &[usize],
        x_min: f64,
        x_max: f64,
        sampling: f64,
        phi_min_abs: f64,
    ) -> Result<Self, TransferError> {
        if !(beta > 0.0) {
            return Err(TransferError::InvalidInput(format!(
                "hyperspherical nu must be positive, got {beta:e}"
            )));
        }
        let Some(&l_last) = l.last() else {
            return Err(TransferError::InvalidInput(
                "hyperspherical table without multipoles".into(),
            ));
        };
        if !(x_max > x_min && x_min > 0.0) {
            return Err(TransferError::InvalidInput(format!(
                "hyperspherical range [{x_min:e}, {x_max:e}] is empty"
            )));
        }
        if sgn_k == 1 && l_last as f64 >= beta {
            return Err(TransferError::InvalidInput(format!(
                "closed-space table asks for l = {l_last} >= nu = {beta}"
            )));
        }

        let nominal_dx = 2.0 * PI / (beta * sampling);
        let x_size = (((x_max - x_min) / nominal_dx).ceil() as usize + 1).max(MIN_TABLE_POINTS);
        let delta_x = (x_max - x_min) / (x_size - 1) as f64;

        let columns: Vec<Vec<(f64, f64)>> = (0..x_size)
            .into_par_iter()
            .map(|ix| {
                let x = x_min + ix as f64 * delta_x;
                let ladder = phi_ladder(sgn_k, beta, x, l_last + 1);
                let (_, c) = sin_cot(sgn_k, x);
                l.iter()
                    .map(|&lv| {
                        let d = lv as f64 * c * ladder[lv] - sqrt_k(sgn_k, beta, lv + 1) * ladder[lv + 1];
                        (ladder[lv], d)
                    })
                    .collect()
            })
            .collect();

        let l_size = l.len();
        let mut phi = vec![0.0; l_size * x_size];
        let mut dphi = vec![0.0; l_size * x_size];
        for (ix, column) in columns.iter().enumerate() {
            for (il, &(p, d)) in column.iter().enumerate() {
                phi[il * x_size + ix] = p;
                dphi[il * x_size + ix] = d;
            }
        }

        let chi_at_phimin = (0..l_size)
            .map(|il| {
                phi[il * x_size..(il + 1) * x_size]
                    .iter()
                    .position(|p| p.abs() > phi_min_abs)
                    .map_or(x_max, |ix| x_min + ix.saturating_sub(1) as f64 * delta_x)
            })
            .collect();

        Ok(Self {
            sgn_k,
            beta,
            l: l.to_vec(),
            x_min,
            delta_x,
            x_size,
            phi,
            dphi,
            chi_at_phimin,
        })
    }

    /// Number of tabulated multipoles.
    #[must_use]
    pub fn l_size(&self) -> usize {
        self.l.len()
    }

    /// Last tabulated radial coordinate.
    #[must_use]
    pub fn x_max(&self) -> f64 {
        self.x_min + (self.x_size - 1) as f64 * self.delta_x
    }

    /// Radial coordinate below which Φ_l is negligible.
    #[must_use]
    pub fn chi_at_phimin(&self, index_l: usize) -> f64 {
        self.chi_at_phimin[index_l]
    }

    /// Second and third χ-derivatives from the differential equation.
    fn higher_derivatives(&self, l: f64, x: f64, phi: f64, dphi: f64) -> (f64, f64) {
        let (s, c) = sin_cot(self.sgn_k, x);
        let ll = l * (l + 1.0);
        let inv_s2 = 1.0 / (s * s);
        let t = self.beta * self.beta - f64::from(self.sgn_k) - ll * inv_s2;
        let d2 = -2.0 * c * dphi - t * phi;
        let d3 = 2.0 * inv_s2 * dphi - 2.0 * c * d2 - t * dphi - 2.0 * ll * c * inv_s2 * phi;
        (d2, d3)
    }

    /// Φ, Φ′ and Φ″ of multipole `index_l` at χ = x.
    ///
    /// Returns zeros below the table or below [`Self::chi_at_phimin`]. In
    /// closed space χ > π/2 is folded with Φ_l(π − χ) = (−1)^(ν−l−1) Φ_l(χ).
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InterpolationOutOfRange`] above the table.
    pub fn evaluate(&self, index_l: usize, x: f64, order: HermiteOrder) -> Result<KernelSample, TransferError> {
        let l = self.l[index_l];
        if self.sgn_k == 1 && x > FRAC_PI_2 && x <= PI {
            let nu = self.beta.round() as usize;
            let parity = if (nu - l - 1) % 2 == 0 { 1.0 } else { -1.0 };
            let s = self.evaluate(index_l, PI - x, order)?;
            return Ok(KernelSample {
                phi: parity * s.phi,
                dphi: -parity * s.dphi,
                d2phi: parity * s.d2phi,
            });
        }

        let x_max = self.x_max();
        // Closed tables stop just short of π/2.
        let x = if self.sgn_k == 1 && x > x_max && x <= FRAC_PI_2 {
            x_max
        } else {
            x
        };
        if x > x_max * (1.0 + f64::EPSILON) || x.is_nan() {
            return Err(TransferError::InterpolationOutOfRange {
                what: "hyperspherical table",
                x,
                min: self.x_min,
                max: x_max,
            });
        }
        if x < self.x_min || x < self.chi_at_phimin[index_l] {
            return Ok(KernelSample::default());
        }

        let lf = l as f64;
        let row = index_l * self.x_size;
        let ix = (((x - self.x_min) / self.delta_x) as usize).min(self.x_size - 2);
        let x0 = self.x_min + ix as f64 * self.delta_x;
        let x1 = x0 + self.delta_x;
        let h = self.delta_x;
        let t = (x - x0) / h;

        let (p0, p1) = (self.phi[row + ix], self.phi[row + ix + 1]);
        let (d0, d1) = (self.dphi[row + ix], self.dphi[row + ix + 1]);
        let (dd0, ddd0) = self.higher_derivatives(lf, x0, p0, d0);
        let (dd1, ddd1) = self.higher_derivatives(lf, x1, p1, d1);

        let (phi, dphi) = match order {
            HermiteOrder::Cubic => {
                let [h00, h10, h01, h11] = cubic_basis(t);
                (
                    h00 * p0 + h10 * h * d0 + h01 * p1 + h11 * h * d1,
                    h00 * d0 + h10 * h * dd0 + h01 * d1 + h11 * h * dd1,
                )
            }
            HermiteOrder::Quintic => {
                let [h00, h10, h20, h01, h11, h21] = quintic_basis(t);
                let h2 = h * h;
                (
                    h00 * p0 + h10 * h * d0 + h20 * h2 * dd0 + h01 * p1 + h11 * h * d1 + h21 * h2 * dd1,
                    h00 * d0 + h10 * h * dd0 + h20 * h2 * ddd0 + h01 * d1 + h11 * h * dd1 + h21 * h2 * ddd1,
                )
            }
        };
        let (d2phi, _) = self.higher_derivatives(lf, x, phi, dphi);
        Ok(KernelSample { phi, dphi, d2phi })
    }
}

fn cubic_basis(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        2.0 * t3 - 3.0 * t2 + 1.0,
        t3 - 2.0 * t2 + t,
        -2.0 * t3 + 3.0 * t2,
        t3 - t2,
    ]
}

fn quintic_basis(t: f64) -> [f64; 6] {
    let t2 = t * t;
    let t3 = t2 * t;
    let t4 = t3 * t;
    let t5 = t4 * t;
    [
        1.0 - 10.0 * t3 + 15.0 * t4 - 6.0 * t5,
        t - 6.0 * t3 + 8.0 * t4 - 3.0 * t5,
        0.5 * t2 - 1.5 * t3 + 1.5 * t4 - 0.5 * t5,
        10.0 * t3 - 15.0 * t4 + 6.0 * t5,
        -4.0 * t3 + 7.0 * t4 - 3.0 * t5,
        0.5 * t3 - t4 + 0.5 * t5,
    ]
}

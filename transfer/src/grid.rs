// SPDX-License-Identifier: AGPL-3.0-only

//! Sampling planner: wavenumber grid q, per-mode k(q) and multipole grid l.
//!
//! Both q and l grow logarithmically at first and linearly afterwards. In
//! closed space the low-q part is snapped to integer nu = q/√K, the only
//! values for which closed-space harmonics exist, and then blended into
//! the generic law over `q_numstep_transition` steps.

use crate::config::{OutputRequest, Precision};
use crate::cosmology::Curvature;
use crate::error::TransferError;
use crate::modes::Mode;
use crate::tolerances::{
    CLOSED_NU_ROUNDING_OFFSET, K_MIN_ROUNDING, Q_SIZE_SAFETY_FACTOR,
};

/// Smallest nu of closed-space harmonics contributing to observables.
const CLOSED_NU_MIN: u32 = 3;

/// Largest multipole any requested type of any mode needs.
#[must_use]
pub fn global_l_max(output: &OutputRequest) -> usize {
    let mut l_max = 0;
    if output.scalars {
        if output.cmb_temperature || output.cmb_polarization || output.cmb_lensing_potential {
            l_max = l_max.max(output.l_scalar_max);
        }
        if output.galaxy_lensing || output.has_number_counts() {
            l_max = l_max.max(output.l_lss_max);
        }
    }
    if output.vectors {
        l_max = l_max.max(output.l_vector_max);
    }
    if output.tensors {
        l_max = l_max.max(output.l_tensor_max);
    }
    l_max
}

/// Multipole grid from l = 2 to exactly `l_max`.
///
/// # Errors
///
/// Returns [`TransferError::MalformedGrid`] if `l_max < 2`.
pub fn multipole_grid(
    l_max: usize,
    precision: &Precision,
    angular_rescaling: f64,
) -> Result<Vec<usize>, TransferError> {
    if l_max < 2 {
        return Err(TransferError::MalformedGrid(format!(
            "multipole grid needs l_max >= 2, got {l_max}"
        )));
    }
    let log_factor = precision.l_logstep.powf(angular_rescaling) - 1.0;
    let linear = precision.l_linstep * angular_rescaling;
    let log_increment = |l: usize| ((l as f64 * log_factor) as usize).max(1);

    let mut l = vec![2_usize];
    let mut current = 2;
    let mut increment = log_increment(current);
    while current + increment < l_max && (increment as f64) < linear {
        current += increment;
        l.push(current);
        increment = log_increment(current);
    }

    let increment = (linear as usize).max(1);
    while current + increment <= l_max {
        current += increment;
        l.push(current);
    }

    if current != l_max {
        l.push(l_max);
    }
    Ok(l)
}

/// Number of grid multipoles computed for a type with maximum `l_max`:
/// up to the first l >= l_max, plus two safety entries within the grid.
///
/// # Errors
///
/// Returns [`TransferError::MultipoleOutOfRange`] if `l_max` exceeds the
/// last grid value.
pub fn type_l_size(l_grid: &[usize], l_max: usize) -> Result<usize, TransferError> {
    let available = l_grid.last().copied().unwrap_or(0);
    if l_max > available {
        return Err(TransferError::MultipoleOutOfRange {
            requested: l_max,
            available,
        });
    }
    let first = l_grid.partition_point(|&l| l < l_max);
    Ok((first + 3).min(l_grid.len()))
}

/// Wavenumber grid with the index where curved kernels switch to the
/// rescaled flat table.
#[derive(Clone, Debug)]
pub struct WavenumberGrid {
    /// Strictly increasing q values.
    pub q: Vec<f64>,
    /// First index using the flat-table approximation (curved space only).
    pub index_q_flat_approximation: usize,
    /// Conservative size bound the fill loop was checked against.
    pub size_bound: usize,
}

/// Inputs of the wavenumber grid.
#[derive(Clone, Copy, Debug)]
pub struct WavenumberBounds {
    /// Smallest perturbation k over all modes.
    pub k_min: f64,
    /// Largest perturbation k used for spectra over all modes.
    pub k_max: f64,
    /// Whether vector modes are computed.
    pub vectors: bool,
    /// Whether tensor modes are computed.
    pub tensors: bool,
}

/// Build the q grid.
///
/// # Errors
///
/// Returns [`TransferError::MalformedGrid`] if the bounds are not finite,
/// the fill loop overruns its conservative size bound or fewer than two
/// points result.
pub fn wavenumber_grid(
    q_period: f64,
    curvature: Curvature,
    bounds: WavenumberBounds,
    precision: &Precision,
    angular_rescaling: f64,
) -> Result<WavenumberGrid, TransferError> {
    let k = curvature.k;
    let sgn = curvature.sign();
    let (q_min, q_max) = match sgn {
        0 => (bounds.k_min, bounds.k_max),
        -1 => {
            let mut q_max = (bounds.k_max * bounds.k_max + k).sqrt();
            if bounds.vectors {
                q_max = q_max.min((bounds.k_max * bounds.k_max + 2.0 * k).sqrt());
            }
            if bounds.tensors {
                q_max = q_max.min((bounds.k_max * bounds.k_max + 3.0 * k).sqrt());
            }
            ((bounds.k_min * bounds.k_min + k).sqrt(), q_max)
        }
        _ => (f64::from(CLOSED_NU_MIN) * k.sqrt(), bounds.k_max),
    };
    if !(q_min.is_finite() && q_max.is_finite() && q_min > 0.0 && q_max > q_min) {
        return Err(TransferError::MalformedGrid(format!(
            "wavenumber bounds q_min = {q_min:e}, q_max = {q_max:e}"
        )));
    }

    let logstep_spline = precision.q_logstep_spline / angular_rescaling.powf(precision.q_logstep_open);
    let logstep_trapzd = precision.q_logstep_trapzd;
    let linstep = precision.q_linstep;
    let flat_nu = precision.hyper_flat_approximation_nu;

    let size_bound = if sgn == 1 {
        let q_approx = flat_nu.min(q_max / k.sqrt());
        let log_size = |hi: f64, lo: f64, step: f64| {
            2 * ((hi / lo).ln() / (1.0 + q_period * step).ln()).max(0.0) as usize
        };
        let lin_size = |hi: f64, lo: f64| 2 * ((hi - lo) / (q_period * linstep)).max(0.0) as usize;
        log_size(q_approx, q_min, logstep_trapzd)
            + lin_size(q_approx, q_min)
            + log_size(q_max, q_approx, logstep_spline)
            + lin_size(q_max, q_approx)
    } else {
        let log_size = (q_max / q_min).ln() / (1.0 + q_period * logstep_spline).ln();
        let lin_size = (q_max - q_min) / (q_period * linstep);
        (Q_SIZE_SAFETY_FACTOR * log_size) as usize + (Q_SIZE_SAFETY_FACTOR * lin_size) as usize
    };

    let generic_step = |q: f64, logstep: f64| q_period * linstep * q / (q + linstep / logstep);

    let mut q = Vec::with_capacity(size_bound);
    q.push(q_min);
    let mut nu = CLOSED_NU_MIN;
    let mut last_step = 0.0;
    let mut last_index = 0_usize;

    while let Some(&previous) = q.last() {
        if previous >= q_max {
            break;
        }
        let index = q.len();
        if index >= size_bound {
            return Err(TransferError::MalformedGrid(format!(
                "q grid overran its size bound {size_bound} at q = {previous:e}"
            )));
        }
        let next = if sgn <= 0 {
            previous + generic_step(previous, logstep_spline)
        } else if f64::from(nu) < flat_nu.trunc() {
            let proposed = previous + generic_step(previous, logstep_trapzd);
            let nu_proposed = (proposed / k.sqrt()) as u32;
            nu = if nu_proposed <= nu + 1 { nu + 1 } else { nu_proposed };
            let snapped = f64::from(nu) * k.sqrt();
            last_step = snapped - previous;
            last_index = index + 1;
            snapped
        } else {
            let step = generic_step(previous, logstep_spline);
            let done = index.saturating_sub(last_index) as f64;
            if done < precision.q_numstep_transition.trunc() {
                let w = done / precision.q_numstep_transition;
                previous + (1.0 - w) * last_step + w * step
            } else {
                previous + step
            }
        };
        q.push(next);
    }

    if q.last().is_some_and(|&last| last > q_max) {
        q.pop();
    }
    if q.len() < 2 {
        return Err(TransferError::MalformedGrid(format!(
            "q grid has {} point(s) between {q_min:e} and {q_max:e}",
            q.len()
        )));
    }
    q.shrink_to_fit();

    let index_q_flat_approximation = if sgn == 0 {
        q.len()
    } else {
        let q_approx = flat_nu * curvature.sqrt_abs();
        q.iter()
            .take(q.len() - 1)
            .position(|&v| v > q_approx)
            .unwrap_or(q.len() - 1)
    };

    Ok(WavenumberGrid {
        q,
        index_q_flat_approximation,
        size_bound,
    })
}

/// Physical wavenumber of a mode at each q: k = √(q² − K(m+1)).
///
/// A first value below `k_min` by at most [`K_MIN_ROUNDING`] is snapped to
/// `k_min`.
///
/// # Errors
///
/// Returns [`TransferError::WavenumberOutOfRange`] for a larger undershoot
/// or a last value above `k_max`.
pub fn k_grid(
    q: &[f64],
    curvature: Curvature,
    mode: Mode,
    k_min: f64,
    k_max: f64,
) -> Result<Vec<f64>, TransferError> {
    let shift = curvature.k * (f64::from(mode.spin()) + 1.0);
    let mut k: Vec<f64> = q.iter().map(|&q| (q * q - shift).sqrt()).collect();
    let out_of_range = |k: f64| TransferError::WavenumberOutOfRange { k, k_min, k_max };

    if let Some(first) = k.first_mut() {
        if first.is_nan() {
            return Err(out_of_range(*first));
        }
        if *first < k_min {
            if k_min - *first < K_MIN_ROUNDING {
                *first = k_min;
            } else {
                return Err(out_of_range(*first));
            }
        }
    }
    if let Some(&last) = k.last() {
        if last > k_max || last.is_nan() {
            return Err(out_of_range(last));
        }
    }
    Ok(k)
}

/// Inverse of [`k_grid`] for one value: q = √(k² + K(m+1)).
#[must_use]
pub fn q_of_k(k: f64, curvature: Curvature, mode: Mode) -> f64 {
    (k * k + curvature.k * (f64::from(mode.spin()) + 1.0)).sqrt()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tolerances::WAVENUMBER_ROUND_TRIP_REL;
    use std::f64::consts::PI;

    const TAU0: f64 = 14_000.0;
    const TAU_REC: f64 = 280.0;

    fn q_period() -> f64 {
        2.0 * PI / (TAU0 - TAU_REC)
    }

    fn bounds() -> WavenumberBounds {
        WavenumberBounds {
            k_min: 1e-5,
            k_max: 0.5,
            vectors: false,
            tensors: false,
        }
    }

    fn assert_strictly_increasing(q: &[f64]) {
        assert!(q.windows(2).all(|w| w[1] > w[0]), "grid not increasing");
    }

    #[test]
    fn multipole_grid_ends_at_l_max() {
        for l_max in [2, 3, 10, 57, 2500, 3001] {
            let l = multipole_grid(l_max, &Precision::default(), 1.0).unwrap();
            assert_eq!(l[0], 2);
            assert_eq!(*l.last().unwrap(), l_max);
            assert!(l.windows(2).all(|w| w[1] > w[0]), "l grid not increasing for {l_max}");
        }
    }

    #[test]
    fn multipole_grid_switches_to_linear() {
        let l = multipole_grid(2500, &Precision::default(), 1.0).unwrap();
        let last_steps: Vec<usize> = l.windows(2).rev().skip(1).take(5).map(|w| w[1] - w[0]).collect();
        assert!(last_steps.iter().all(|&s| s == 40), "{last_steps:?}");
        assert_eq!(l[1] - l[0], 1);
    }

    #[test]
    fn multipole_grid_rescaling_coarsens() {
        let base = multipole_grid(2000, &Precision::default(), 1.0).unwrap();
        let coarse = multipole_grid(2000, &Precision::default(), 1.5).unwrap();
        assert!(coarse.len() < base.len());
    }

    #[test]
    fn multipole_grid_rejects_tiny_l_max() {
        assert!(multipole_grid(1, &Precision::default(), 1.0).is_err());
    }

    #[test]
    fn type_l_size_adds_two_safety_entries() {
        let l = vec![2, 3, 4, 6, 10, 20, 30];
        assert_eq!(type_l_size(&l, 6).unwrap(), 6);
        assert_eq!(type_l_size(&l, 7).unwrap(), 7);
        assert_eq!(type_l_size(&l, 30).unwrap(), 7);
        assert!(type_l_size(&l, 31).is_err());
    }

    #[test]
    fn flat_wavenumber_grid() {
        let g = wavenumber_grid(q_period(), Curvature::FLAT, bounds(), &Precision::default(), 1.0)
            .unwrap();
        assert!(g.q.len() >= 2);
        assert!(g.q.len() < g.size_bound);
        assert_strictly_increasing(&g.q);
        assert!((g.q[0] - 1e-5).abs() < K_MIN_ROUNDING);
        assert!(*g.q.last().unwrap() <= 0.5);
    }

    #[test]
    fn flat_grid_becomes_linear() {
        let p = Precision::default();
        let g = wavenumber_grid(q_period(), Curvature::FLAT, bounds(), &p, 1.0).unwrap();
        let n = g.q.len();
        let step = g.q[n - 1] - g.q[n - 2];
        assert!((step - q_period() * p.q_linstep).abs() / step < 0.01);
    }

    #[test]
    fn open_wavenumber_grid() {
        let curvature = Curvature::new(-1e-8);
        let b = WavenumberBounds {
            k_min: 5e-4,
            ..bounds()
        };
        let g = wavenumber_grid(q_period(), curvature, b, &Precision::default(), 1.0).unwrap();
        assert_strictly_increasing(&g.q);
        assert!((g.q[0] - (2.5e-7_f64 - 1e-8).sqrt()).abs() < 1e-15);
        assert!(*g.q.last().unwrap() <= (0.25_f64 - 1e-8).sqrt());
        assert!(g.index_q_flat_approximation < g.q.len());
    }

    #[test]
    fn closed_grid_snaps_to_integer_nu() {
        let curvature = Curvature::new(1e-8);
        let sqrt_k = 1e-4;
        let g = wavenumber_grid(q_period(), curvature, bounds(), &Precision::default(), 1.0)
            .unwrap();
        assert_strictly_increasing(&g.q);
        assert!((g.q[0] - 3.0 * sqrt_k).abs() < 1e-15);
        for &q in g.q.iter().take(20) {
            let nu = q / sqrt_k;
            assert!((nu - nu.round()).abs() < 1e-6, "nu = {nu}");
        }
    }

    #[test]
    fn closed_flat_approximation_index() {
        let curvature = Curvature::new(1e-8);
        let p = Precision::default();
        let g = wavenumber_grid(q_period(), curvature, bounds(), &p, 1.0).unwrap();
        let threshold = p.hyper_flat_approximation_nu * 1e-4;
        let i = g.index_q_flat_approximation;
        assert!(g.q[i] > threshold);
        assert!(g.q[i - 1] <= threshold);
    }

    #[test]
    fn degenerate_bounds_are_fatal() {
        let b = WavenumberBounds {
            k_min: 0.1,
            k_max: 0.1,
            ..bounds()
        };
        assert!(wavenumber_grid(q_period(), Curvature::FLAT, b, &Precision::default(), 1.0).is_err());
    }

    #[test]
    fn k_grid_round_trip_all_curvatures_and_spins() {
        let b = WavenumberBounds {
            k_min: 5e-4,
            ..bounds()
        };
        for curvature in [Curvature::FLAT, Curvature::new(1e-8), Curvature::new(-1e-8)] {
            let g = wavenumber_grid(q_period(), curvature, b, &Precision::default(), 1.0).unwrap();
            for mode in [Mode::Scalar, Mode::Vector, Mode::Tensor] {
                let k = k_grid(&g.q, curvature, mode, 0.0, f64::INFINITY).unwrap();
                for (&q, &k) in g.q.iter().zip(&k) {
                    let back = q_of_k(k, curvature, mode);
                    assert!(
                        ((back - q) / q).abs() < WAVENUMBER_ROUND_TRIP_REL,
                        "{curvature:?} {mode:?}: q = {q:e}, back = {back:e}"
                    );
                }
            }
        }
    }

    #[test]
    fn k_grid_snaps_rounding_undershoot() {
        let q = [1e-5 - 1e-17, 2e-5];
        let k = k_grid(&q, Curvature::FLAT, Mode::Scalar, 1e-5, 1.0).unwrap();
        assert_eq!(k[0], 1e-5);
    }

    #[test]
    fn k_grid_rejects_real_undershoot_and_overshoot() {
        let q = [0.9e-5, 2e-5];
        assert!(k_grid(&q, Curvature::FLAT, Mode::Scalar, 1e-5, 1.0).is_err());
        let q = [1e-5, 2.0];
        assert!(k_grid(&q, Curvature::FLAT, Mode::Scalar, 1e-5, 1.0).is_err());
    }

    #[test]
    fn global_l_max_covers_requested_families() {
        let out = OutputRequest {
            nc_density: true,
            l_scalar_max: 100,
            l_lss_max: 400,
            ..OutputRequest::default()
        };
        assert_eq!(global_l_max(&out), 400);
        let out = OutputRequest {
            tensors: true,
            l_tensor_max: 800,
            ..out
        };
        assert_eq!(global_l_max(&out), 800);
    }
}

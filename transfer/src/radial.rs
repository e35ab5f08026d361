// SPDX-License-Identifier: AGPL-3.0-only

//! Radial kernel evaluator.
//!
//! For one wavenumber and multipole, samples the generalized Bessel
//! combination of a [`RadialFunctionKind`] at the radial distances
//! τ0 − τ of a time sampling. Three branches serve the kernel:
//!
//! | Branch     | Table                  | Interpolation | Argument          |
//! |------------|------------------------|---------------|-------------------|
//! | `Flat`     | shared, β = 1          | cubic         | χ = k(τ0 − τ)     |
//! | `Curved`   | per-q, β = ν           | quintic       | χ = √\|K\|(τ0 − τ)|
//! | `Rescaled` | shared, β = 1          | cubic         | χ · √(l(l+1))/χ_tp |
//!
//! The rescaled branch approximates Φ_l^ν by the flat kernel with its
//! turning point moved onto the curved one, times an amplitude correction
//! clamped by the exact χ/sinK(χ) envelope.

use crate::cosmology::Curvature;
use crate::error::TransferError;
use crate::hyperspherical::{HermiteOrder, HyperTable, KernelSample};
use crate::modes::RadialFunctionKind;

// ═══════════════════════════════════════════════════════════════════
// Radial coordinates
// ═══════════════════════════════════════════════════════════════════

/// χ, generalized csc and cot along one time sampling.
///
/// Flat: χ = k d, csc = cot = 1/χ. Curved: χ = √|K| d,
/// csc = √|K|/k / sinK(χ), cot = csc · cosK(χ).
#[derive(Clone, Debug, Default)]
pub struct RadialCoordinates {
    /// Curvature-adapted radial coordinate.
    pub chi: Vec<f64>,
    /// Generalized cosecant, in units of k.
    pub csc: Vec<f64>,
    /// Generalized cotangent, in units of k.
    pub cot: Vec<f64>,
}

impl RadialCoordinates {
    /// Recompute for distances `tau0_minus_tau` at wavenumber k.
    pub fn update(&mut self, tau0_minus_tau: &[f64], k: f64, curvature: Curvature) {
        self.chi.clear();
        self.csc.clear();
        self.cot.clear();
        match curvature.sign() {
            0 => {
                for &d in tau0_minus_tau {
                    let chi = k * d;
                    self.chi.push(chi);
                    self.csc.push(1.0 / chi);
                    self.cot.push(1.0 / chi);
                }
            }
            sgn => {
                let sqrt_abs_k = curvature.sqrt_abs();
                for &d in tau0_minus_tau {
                    let chi = sqrt_abs_k * d;
                    let (sin, cos) = if sgn == 1 {
                        (chi.sin(), chi.cos())
                    } else {
                        (chi.sinh(), chi.cosh())
                    };
                    let csc = sqrt_abs_k / k / sin;
                    self.chi.push(chi);
                    self.csc.push(csc);
                    self.cot.push(csc * cos);
                }
            }
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chi.len()
    }

    /// Whether no sample is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chi.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════
// Branches
// ═══════════════════════════════════════════════════════════════════

/// Which table serves the kernel at the current wavenumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelBranch {
    /// Flat space, shared table.
    Flat,
    /// Curved space below the flat-approximation index, per-q table.
    Curved,
    /// Curved space above it, shared flat table with rescaling.
    Rescaled,
}

impl KernelBranch {
    /// Branch for wavenumber index `index_q`.
    #[must_use]
    pub fn select(curvature: Curvature, index_q: usize, index_q_flat_approximation: usize) -> Self {
        if curvature.sign() == 0 {
            Self::Flat
        } else if index_q < index_q_flat_approximation {
            Self::Curved
        } else {
            Self::Rescaled
        }
    }

    /// Hermite order used with this branch.
    #[must_use]
    pub const fn order(self) -> HermiteOrder {
        match self {
            Self::Curved => HermiteOrder::Quintic,
            Self::Flat | Self::Rescaled => HermiteOrder::Cubic,
        }
    }
}

/// Turning-point rescaling of the flat kernel for one (q, l).
#[derive(Clone, Copy, Debug)]
struct Rescaling {
    argument: f64,
    amplitude: f64,
    chi_tp: f64,
    atan_l_nu: f64,
    closed: bool,
}

impl Rescaling {
    const IDENTITY: Self = Self {
        argument: 1.0,
        amplitude: 1.0,
        chi_tp: 0.0,
        atan_l_nu: 0.0,
        closed: false,
    };

    fn new(curvature: Curvature, q: f64, l: f64) -> Self {
        let closed = curvature.sign() == 1;
        let nu = q / curvature.sqrt_abs();
        let sqrt_ll = (l * (l + 1.0)).sqrt();
        let chi_tp = if closed {
            (sqrt_ll / nu).asin()
        } else {
            (sqrt_ll / nu).asinh()
        };
        Self {
            argument: sqrt_ll / chi_tp,
            amplitude: (1.0 - curvature.k * l * (l + 1.0) / (q * q)).powf(-1.0 / 12.0),
            chi_tp,
            atan_l_nu: (l / nu).atan(),
            closed,
        }
    }

    /// Amplitude factor at unscaled coordinate χ.
    fn function(&self, chi: f64) -> f64 {
        if self.amplitude == 1.0 {
            return 1.0;
        }
        let u = self.atan_l_nu * (chi - self.chi_tp);
        if self.closed {
            (self.amplitude * (1.0 + 0.34 * u + 2.0 * u * u)).min(chi / chi.sin())
        } else {
            (self.amplitude * (1.0 - 0.38 * u + 0.40 * u * u)).max(chi / chi.sinh())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Kernel evaluator
// ═══════════════════════════════════════════════════════════════════

/// Kernel source at one wavenumber: a table, the branch it serves and the
/// wavenumber pair (q, k).
#[derive(Clone, Copy, Debug)]
pub struct RadialKernel<'a> {
    table: &'a HyperTable,
    branch: KernelBranch,
    curvature: Curvature,
    q: f64,
    k: f64,
}

impl<'a> RadialKernel<'a> {
    /// Kernel served by `table` on `branch`.
    #[must_use]
    pub const fn new(table: &'a HyperTable, branch: KernelBranch, curvature: Curvature, q: f64, k: f64) -> Self {
        Self {
            table,
            branch,
            curvature,
            q,
            k,
        }
    }

    /// Branch in use.
    #[must_use]
    pub const fn branch(&self) -> KernelBranch {
        self.branch
    }

    /// Number of multipoles the table covers.
    #[must_use]
    pub fn l_size(&self) -> usize {
        self.table.l_size()
    }

    fn rescaling(&self, l: f64) -> Rescaling {
        match self.branch {
            KernelBranch::Rescaled => Rescaling::new(self.curvature, self.q, l),
            KernelBranch::Flat | KernelBranch::Curved => Rescaling::IDENTITY,
        }
    }

    /// Smallest τ0 − τ at which multipole `index_l` (value `l`) is
    /// non-negligible.
    #[must_use]
    pub fn min_distance(&self, index_l: usize, l: usize) -> f64 {
        let chi_min = self.table.chi_at_phimin(index_l);
        match self.branch {
            KernelBranch::Flat => chi_min / self.k,
            KernelBranch::Curved => chi_min / self.curvature.sqrt_abs(),
            KernelBranch::Rescaled => {
                chi_min / self.curvature.sqrt_abs() / self.rescaling(l as f64).argument
            }
        }
    }

    /// Sample kernel `kind` of multipole `index_l` (value `l`) at the
    /// first `x_size` coordinates of `coords`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InterpolationOutOfRange`] if a scaled
    /// coordinate lies beyond the table.
    pub fn evaluate(
        &self,
        kind: RadialFunctionKind,
        index_l: usize,
        l: usize,
        coords: &RadialCoordinates,
        x_size: usize,
        out: &mut Vec<f64>,
    ) -> Result<(), TransferError> {
        let lf = l as f64;
        let rescaling = self.rescaling(lf);
        let factors = Factors::new(kind, lf, self.curvature, self.k);
        let order = self.branch.order();
        let a = rescaling.argument;

        out.clear();
        for j in 0..x_size {
            let chi = coords.chi[j];
            let s = self.table.evaluate(index_l, chi * a, order)?;
            let s = KernelSample {
                phi: s.phi,
                dphi: s.dphi * a,
                d2phi: s.d2phi * a * a,
            };
            out.push(factors.combine(kind, s, coords.csc[j], coords.cot[j]) * rescaling.function(chi));
        }
        Ok(())
    }
}

/// Curvature prefactors of the kernel combinations, K/k² entering through
/// √(1 + nK/k²) terms.
#[derive(Clone, Copy, Debug)]
struct Factors {
    /// √|K|/k, or 1 in flat space.
    r: f64,
    /// K/k².
    kk: f64,
    /// Kind-specific constant.
    factor: f64,
}

impl Factors {
    fn new(kind: RadialFunctionKind, l: f64, curvature: Curvature, k: f64) -> Self {
        use RadialFunctionKind as R;
        let r = if curvature.sign() == 0 {
            1.0
        } else {
            curvature.sqrt_abs() / k
        };
        let kk = curvature.k / (k * k);
        let s0 = (1.0 + kk).sqrt();
        let s2 = (1.0 - 3.0 * kk).sqrt();
        let ssqrt2 = (1.0 - kk).sqrt();
        let ssqrt3 = (1.0 - 2.0 * kk).sqrt();
        let si = (1.0 + 2.0 * kk).sqrt();
        let spin2 = (3.0 / 8.0 * (l + 2.0) * (l + 1.0) * l * (l - 1.0)).sqrt();
        let factor = match kind {
            R::ScalarTemperature0 | R::ScalarTemperature1 | R::NcRsd => 1.0,
            R::ScalarTemperature2 => 1.0 / (2.0 * s2),
            R::ScalarPolarisationE => spin2 / s2,
            R::VectorTemperature1 => (0.5 * l * (l + 1.0)).sqrt() / s0,
            R::VectorTemperature2 => (1.5 * l * (l + 1.0)).sqrt() / s0 / ssqrt3,
            R::VectorPolarisationE => 0.5 * ((l - 1.0) * (l + 2.0)).sqrt() / s0 / ssqrt3,
            R::VectorPolarisationB => 0.5 * ((l - 1.0) * (l + 2.0)).sqrt() * si / s0 / ssqrt3,
            R::TensorTemperature2 => spin2 / si / ssqrt2,
            R::TensorPolarisationE => 0.25 / si / ssqrt2,
            R::TensorPolarisationB => 0.5 * (1.0 + 3.0 * kk).sqrt() / ssqrt2 / si,
        };
        Self { r, kk, factor }
    }

    /// Kernel value from Φ and its derivatives in the table argument,
    /// already multiplied by the rescaling of the argument.
    fn combine(&self, kind: RadialFunctionKind, s: KernelSample, csc: f64, cot: f64) -> f64 {
        use RadialFunctionKind as R;
        let Self { r, kk, factor } = *self;
        let r2 = r * r;
        let value = match kind {
            R::ScalarTemperature0 => s.phi,
            R::ScalarTemperature1 => r * s.dphi,
            R::ScalarTemperature2 => 3.0 * r2 * s.d2phi + s.phi,
            R::ScalarPolarisationE | R::TensorTemperature2 => csc * csc * s.phi,
            R::VectorTemperature1 | R::VectorPolarisationB => csc * s.phi,
            R::VectorTemperature2 => csc * (r * s.dphi - cot * s.phi),
            R::VectorPolarisationE => csc * (cot * s.phi + r * s.dphi),
            R::TensorPolarisationE => {
                r2 * s.d2phi + 4.0 * cot * r * s.dphi - (1.0 + 4.0 * kk - 2.0 * cot * cot) * s.phi
            }
            R::TensorPolarisationB => r * s.dphi + 2.0 * cot * s.phi,
            R::NcRsd => r2 * s.d2phi,
        };
        factor * value
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hyperspherical::phi_single;
    use approx::assert_relative_eq;

    const L: [usize; 3] = [2, 20, 100];

    fn flat_table() -> HyperTable {
        HyperTable::build(0, 1.0, &L, 1e-5, 400.0, 40.0, 1e-10).unwrap()
    }

    fn coords(d: &[f64], k: f64, curvature: Curvature) -> RadialCoordinates {
        let mut c = RadialCoordinates::default();
        c.update(d, k, curvature);
        c
    }

    fn j(l: usize, x: f64) -> f64 {
        phi_single(0, 1.0, l, x)
    }

    fn dj(l: usize, x: f64) -> f64 {
        l as f64 / x * j(l, x) - j(l + 1, x)
    }

    #[test]
    fn flat_coordinates() {
        let c = coords(&[100.0, 50.0], 0.1, Curvature::FLAT);
        assert_relative_eq!(c.chi[0], 10.0);
        assert_relative_eq!(c.csc[1], 0.2);
        assert_relative_eq!(c.cot[1], 0.2);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn closed_and_open_coordinates() {
        let k = 0.01;
        let d = 500.0;
        let closed = coords(&[d], k, Curvature::new(1e-6));
        let chi = 1e-3 * d;
        assert_relative_eq!(closed.chi[0], chi, max_relative = 1e-14);
        assert_relative_eq!(closed.csc[0], 1e-3 / k / chi.sin(), max_relative = 1e-14);
        assert_relative_eq!(closed.cot[0], closed.csc[0] * chi.cos(), max_relative = 1e-14);
        let open = coords(&[d], k, Curvature::new(-1e-6));
        assert_relative_eq!(open.csc[0], 1e-3 / k / chi.sinh(), max_relative = 1e-14);
    }

    #[test]
    fn branch_selection() {
        assert_eq!(KernelBranch::select(Curvature::FLAT, 5, 0), KernelBranch::Flat);
        assert_eq!(KernelBranch::select(Curvature::new(-1e-6), 5, 10), KernelBranch::Curved);
        assert_eq!(KernelBranch::select(Curvature::new(1e-6), 10, 10), KernelBranch::Rescaled);
        assert_eq!(KernelBranch::Curved.order(), HermiteOrder::Quintic);
    }

    #[test]
    fn flat_monopole_and_dipole_are_bessel_functions() {
        let table = flat_table();
        let k = 0.05;
        let d: Vec<f64> = (1..=40).map(|i| f64::from(i) * 150.0).collect();
        let c = coords(&d, k, Curvature::FLAT);
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let mut t0 = Vec::new();
        let mut t1 = Vec::new();
        kernel
            .evaluate(RadialFunctionKind::ScalarTemperature0, 1, 20, &c, d.len(), &mut t0)
            .unwrap();
        kernel
            .evaluate(RadialFunctionKind::ScalarTemperature1, 1, 20, &c, d.len(), &mut t1)
            .unwrap();
        for (i, &x) in c.chi.iter().enumerate() {
            if x < table.chi_at_phimin(1) {
                assert_eq!(t0[i], 0.0);
                continue;
            }
            assert!((t0[i] - j(20, x)).abs() < 1e-5, "x={x}");
            assert!((t1[i] - dj(20, x)).abs() < 1e-4, "x={x}");
        }
    }

    #[test]
    fn flat_rsd_kernel_is_second_derivative() {
        let table = flat_table();
        let k = 0.1;
        let d = [400.0, 731.0, 1200.0];
        let c = coords(&d, k, Curvature::FLAT);
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let mut out = Vec::new();
        kernel.evaluate(RadialFunctionKind::NcRsd, 1, 20, &c, d.len(), &mut out).unwrap();
        for (i, &x) in c.chi.iter().enumerate() {
            let h = 1e-3;
            let fd = (j(20, x + h) - 2.0 * j(20, x) + j(20, x - h)) / (h * h);
            assert!((out[i] - fd).abs() < 1e-4, "x={x}: {} vs {fd}", out[i]);
        }
    }

    #[test]
    fn flat_spin_two_kernels_scale_with_csc_squared() {
        let table = flat_table();
        let k = 0.1;
        let d = [500.0, 900.0];
        let c = coords(&d, k, Curvature::FLAT);
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let mut e = Vec::new();
        let mut t = Vec::new();
        kernel
            .evaluate(RadialFunctionKind::ScalarPolarisationE, 1, 20, &c, 2, &mut e)
            .unwrap();
        kernel
            .evaluate(RadialFunctionKind::TensorTemperature2, 1, 20, &c, 2, &mut t)
            .unwrap();
        let l = 20.0_f64;
        let pref = (3.0 / 8.0 * (l + 2.0) * (l + 1.0) * l * (l - 1.0)).sqrt();
        for (i, &x) in c.chi.iter().enumerate() {
            let expected = pref * j(20, x) / (x * x);
            assert!((e[i] - expected).abs() < 1e-5 * pref / (x * x) + 1e-12);
            assert_relative_eq!(e[i], t[i], max_relative = 1e-14);
        }
    }

    #[test]
    fn vector_kernels_in_flat_space() {
        let table = flat_table();
        let k = 0.1;
        let d = [400.0];
        let c = coords(&d, k, Curvature::FLAT);
        let x = c.chi[0];
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let eval = |kind| {
            let mut out = Vec::new();
            kernel.evaluate(kind, 1, 20, &c, 1, &mut out).unwrap();
            out[0]
        };
        let l = 20.0_f64;
        let (phi, dphi) = (j(20, x), dj(20, x));
        let t1 = (0.5 * l * (l + 1.0)).sqrt() * phi / x;
        let t2 = (1.5 * l * (l + 1.0)).sqrt() / x * (dphi - phi / x);
        let e = 0.5 * ((l - 1.0) * (l + 2.0)).sqrt() / x * (phi / x + dphi);
        let b = 0.5 * ((l - 1.0) * (l + 2.0)).sqrt() * phi / x;
        assert!((eval(RadialFunctionKind::VectorTemperature1) - t1).abs() < 1e-5);
        assert!((eval(RadialFunctionKind::VectorTemperature2) - t2).abs() < 1e-5);
        assert!((eval(RadialFunctionKind::VectorPolarisationE) - e).abs() < 1e-5);
        assert!((eval(RadialFunctionKind::VectorPolarisationB) - b).abs() < 1e-5);
    }

    #[test]
    fn tensor_polarisation_in_flat_space() {
        let table = flat_table();
        let k = 0.1;
        let c = coords(&[650.0], k, Curvature::FLAT);
        let x = c.chi[0];
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let mut e = Vec::new();
        let mut b = Vec::new();
        kernel
            .evaluate(RadialFunctionKind::TensorPolarisationE, 1, 20, &c, 1, &mut e)
            .unwrap();
        kernel
            .evaluate(RadialFunctionKind::TensorPolarisationB, 1, 20, &c, 1, &mut b)
            .unwrap();
        let (phi, dphi) = (j(20, x), dj(20, x));
        let h = 1e-3;
        let d2phi = (j(20, x + h) - 2.0 * phi + j(20, x - h)) / (h * h);
        let cot = 1.0 / x;
        let expected_e = 0.25 * (d2phi + 4.0 * cot * dphi - (1.0 - 2.0 * cot * cot) * phi);
        let expected_b = 0.5 * (dphi + 2.0 * cot * phi);
        assert!((e[0] - expected_e).abs() < 1e-5);
        assert!((b[0] - expected_b).abs() < 1e-5);
    }

    #[test]
    fn curved_branch_matches_direct_recurrence() {
        let curvature = Curvature::new(-1e-6);
        let nu = 40.0;
        let q = nu * curvature.sqrt_abs();
        let k = (q * q - curvature.k).sqrt();
        let table = HyperTable::build(-1, nu, &[2, 20], 1e-5, 2.0, 7.0, 1e-10).unwrap();
        let d = [310.0, 900.0, 1770.0];
        let c = coords(&d, k, curvature);
        let kernel = RadialKernel::new(&table, KernelBranch::Curved, curvature, q, k);
        let mut t0 = Vec::new();
        let mut t1 = Vec::new();
        kernel
            .evaluate(RadialFunctionKind::ScalarTemperature0, 1, 20, &c, 3, &mut t0)
            .unwrap();
        kernel
            .evaluate(RadialFunctionKind::ScalarTemperature1, 1, 20, &c, 3, &mut t1)
            .unwrap();
        for (i, &x) in c.chi.iter().enumerate() {
            assert!((t0[i] - phi_single(-1, nu, 20, x)).abs() < 5e-4, "x={x}");
            let h = 1e-6;
            let fd = (phi_single(-1, nu, 20, x + h) - phi_single(-1, nu, 20, x - h)) / (2.0 * h);
            assert!((t1[i] - curvature.sqrt_abs() / k * fd).abs() < 5e-4, "x={x}");
        }
    }

    #[test]
    fn rescaled_branch_reduces_to_flat_for_tiny_curvature() {
        let table = flat_table();
        let curvature = Curvature::new(-1e-14);
        let q = 0.05;
        let k = (q * q - curvature.k).sqrt();
        let d: Vec<f64> = (1..=20).map(|i| f64::from(i) * 300.0).collect();
        let flat_c = coords(&d, q, Curvature::FLAT);
        let open_c = coords(&d, k, curvature);
        let flat = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, q, q);
        let rescaled = RadialKernel::new(&table, KernelBranch::Rescaled, curvature, q, k);
        let mut a = Vec::new();
        let mut b = Vec::new();
        flat.evaluate(RadialFunctionKind::ScalarTemperature0, 2, 100, &flat_c, d.len(), &mut a)
            .unwrap();
        rescaled
            .evaluate(RadialFunctionKind::ScalarTemperature0, 2, 100, &open_c, d.len(), &mut b)
            .unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
        assert_relative_eq!(
            flat.min_distance(2, 100),
            rescaled.min_distance(2, 100),
            max_relative = 1e-6
        );
    }

    #[test]
    fn rescaling_amplitude_is_clamped_by_envelope() {
        let open = Rescaling::new(Curvature::new(-1.0), 30.0, 20.0);
        let chi = 3.0;
        assert!(open.function(chi) >= chi / chi.sinh());
        let closed = Rescaling::new(Curvature::new(1.0), 30.0, 20.0);
        let chi = 1.2;
        assert!(closed.function(chi) <= chi / chi.sin());
        assert_eq!(Rescaling::IDENTITY.function(0.7), 1.0);
    }

    #[test]
    fn min_distance_flat_is_chi_over_k() {
        let table = flat_table();
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, 0.02, 0.02);
        assert_relative_eq!(kernel.min_distance(2, 100), table.chi_at_phimin(2) / 0.02);
        assert_eq!(kernel.l_size(), 3);
    }

    #[test]
    fn beyond_table_is_fatal() {
        let table = flat_table();
        let k = 1.0;
        let c = coords(&[500.0], k, Curvature::FLAT);
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let mut out = Vec::new();
        let err = kernel
            .evaluate(RadialFunctionKind::ScalarTemperature0, 0, 2, &c, 1, &mut out)
            .unwrap_err();
        assert!(matches!(err, TransferError::InterpolationOutOfRange { .. }));
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Integration engine.
//!
//! For one wavenumber, walks every mode, initial condition, type and
//! multipole, and turns the transfer source of the type into one entry
//! Δ_l(q) of the table:
//!
//! 1. k(q) beyond the perturbation range of the mode: all zeros.
//! 2. The perturbation source is interpolated at k once per run of types
//!    sharing a source, then redefined per type.
//! 3. Neglect rules give exact zeros without integrating.
//! 4. Otherwise the Limber approximation or the line-of-sight quadrature
//!    Δ_l(q) = ∫ dτ S(τ) Φ_l(τ0 − τ).

use std::f64::consts::PI;

use crate::config::Precision;
use crate::cosmology::Curvature;
use crate::error::TransferError;
use crate::hyperspherical::HyperTable;
use crate::modes::{LimberRule, RadialFunctionKind, TypeInfo, TypeTable};
use crate::numerical;
use crate::radial::{KernelBranch, RadialCoordinates, RadialKernel};
use crate::selection::Selection;
use crate::sources::{SourceAdapter, SplinedSources};
use crate::tolerances::CLOSED_NU_ROUNDING_OFFSET;
use crate::workspace::Workspace;

// ═══════════════════════════════════════════════════════════════════
// Neglect rules
// ═══════════════════════════════════════════════════════════════════

/// Whether Δ_l(q) is negligible because l lies far below q times the
/// rescaled distance to recombination `ra_rec`.
#[must_use]
pub fn can_be_neglected(info: &TypeInfo, q: f64, l: f64, ra_rec: f64) -> bool {
    info.neglect_delta_k
        .is_some_and(|delta_k| l < (q - delta_k) * ra_rec)
}

/// Whether the late-time part of the source may be dropped at multipole l.
#[must_use]
pub fn late_source_can_be_neglected(info: &TypeInfo, l: f64, l_threshold: f64) -> bool {
    info.late_source_negligible && l > l_threshold
}

// ═══════════════════════════════════════════════════════════════════
// Limber switch
// ═══════════════════════════════════════════════════════════════════

/// Thresholds deciding between quadrature and Limber.
#[derive(Clone, Copy, Debug)]
pub struct LimberSwitch<'a> {
    l_switch: f64,
    local_over_z: f64,
    los_over_z: f64,
    selection: Option<&'a Selection>,
}

impl<'a> LimberSwitch<'a> {
    /// Switch from the precision thresholds and the redshift bins, if any.
    #[must_use]
    pub const fn new(precision: &Precision, selection: Option<&'a Selection>) -> Self {
        Self {
            l_switch: precision.l_switch_limber,
            local_over_z: precision.l_switch_limber_for_nc_local_over_z,
            los_over_z: precision.l_switch_limber_for_nc_los_over_z,
            selection,
        }
    }

    /// Whether Limber replaces quadrature for `info` at (q, l).
    ///
    /// Always when q exceeds `q_max_bessel`, the largest wavenumber the
    /// kernel table covers for this sampling.
    #[must_use]
    pub fn applies(&self, info: &TypeInfo, q: f64, l: f64, q_max_bessel: f64) -> bool {
        if q > q_max_bessel {
            return true;
        }
        let bin_threshold = |over_z: f64, any_window: bool| match (self.selection, info.ty.bin()) {
            (Some(sel), Some(bin)) => (any_window || !sel.is_dirac()) && l >= over_z * sel.mean(bin),
            _ => false,
        };
        match info.limber {
            LimberRule::Never => false,
            LimberRule::CmbLensing => l > self.l_switch,
            LimberRule::Local => bin_threshold(self.local_over_z, false),
            LimberRule::LineOfSight => bin_threshold(self.los_over_z, false),
            LimberRule::LineOfSightAnyWindow => bin_threshold(self.los_over_z, true),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Quadrature
// ═══════════════════════════════════════════════════════════════════

/// A transfer source on its time sampling.
#[derive(Clone, Copy, Debug)]
pub struct SampledSource<'s> {
    /// τ0 − τ, decreasing.
    pub tau0_minus_tau: &'s [f64],
    /// Trapezoidal weights.
    pub weights: &'s [f64],
    /// Source values.
    pub values: &'s [f64],
}

/// Kernel kind and multipole of one quadrature.
#[derive(Clone, Copy, Debug)]
pub struct KernelQuery {
    /// Kernel combination.
    pub kind: RadialFunctionKind,
    /// Index in the multipole grid.
    pub index_l: usize,
    /// Multipole.
    pub l: usize,
}

/// Trapezoidal line-of-sight integral of source times kernel.
///
/// The sum stops at the last time where the kernel is non-negligible,
/// then at the last non-zero source value, then (with `late_cut`) at the
/// last time with τ0 − τ ≥ `late_cut`. When the stop is due to the kernel
/// alone, the weight of the last point is reduced to the half-interval
/// ending at the kernel cutoff.
///
/// # Errors
///
/// Propagates kernel interpolation failures.
pub fn integrate(
    kernel: &RadialKernel<'_>,
    query: KernelQuery,
    source: SampledSource<'_>,
    coords: &RadialCoordinates,
    late_cut: Option<f64>,
    radial: &mut Vec<f64>,
) -> Result<f64, TransferError> {
    let d = source.tau0_minus_tau;
    let n = d.len();
    if n == 0 {
        return Ok(0.0);
    }
    let min_distance = kernel.min_distance(query.index_l, query.l);
    if min_distance >= d[0] {
        return Ok(0.0);
    }
    if n == 1 {
        kernel.evaluate(query.kind, query.index_l, query.l, coords, 1, radial)?;
        return Ok(source.values[0] * radial[0]);
    }

    let mut index_max = n - 1;
    while d[index_max] < min_distance {
        index_max -= 1;
    }
    let index_max_kernel = index_max;
    while source.values[index_max] == 0.0 {
        if index_max == 0 {
            return Ok(0.0);
        }
        index_max -= 1;
    }
    if let Some(cut) = late_cut {
        while d[index_max] < cut {
            if index_max == 0 {
                return Ok(0.0);
            }
            index_max -= 1;
        }
    }

    kernel.evaluate(query.kind, query.index_l, query.l, coords, index_max + 1, radial)?;
    let mut value = numerical::trapezoidal_convolution(
        &source.values[..=index_max],
        radial,
        &source.weights[..=index_max],
    );
    if index_max != n - 1 && index_max == index_max_kernel {
        value -= 0.5 * (min_distance - d[index_max + 1]) * radial[index_max] * source.values[index_max];
    }
    Ok(value)
}

// ═══════════════════════════════════════════════════════════════════
// Limber
// ═══════════════════════════════════════════════════════════════════

/// Parabolic interpolation of S·(τ0 − τ) at `tau0_minus_tau_star`.
///
/// The product is regular today where lensing-like sources diverge; the
/// last sample is replaced by its neighbour's product.
///
/// # Errors
///
/// Returns [`TransferError::MalformedGrid`] with fewer than three samples.
pub fn limber_interpolate(d: &[f64], sources: &[f64], tau0_minus_tau_star: f64) -> Result<f64, TransferError> {
    let n = d.len();
    if n < 3 {
        return Err(TransferError::MalformedGrid(format!(
            "Limber interpolation needs at least 3 time samples, got {n}"
        )));
    }
    let mut i = 1;
    while d[i] > tau0_minus_tau_star && i < n - 2 {
        i += 1;
    }
    let last = if i < n - 2 {
        sources[i + 1] * d[i + 1]
    } else {
        sources[i] * d[i]
    };
    let (value, _, _) = numerical::parabola(
        tau0_minus_tau_star,
        [d[i - 1], d[i], d[i + 1]],
        [sources[i - 1] * d[i - 1], sources[i] * d[i], last],
    );
    Ok(value)
}

/// First-order Limber approximation of Δ_l(q).
///
/// Zero when the stationary point lies outside the sampling.
///
/// # Errors
///
/// Returns [`TransferError::LimberNotCoded`] for kernels without a formula
/// and interpolation failures.
pub fn limber(
    kind: RadialFunctionKind,
    l: f64,
    q: f64,
    curvature: Curvature,
    d: &[f64],
    sources: &[f64],
) -> Result<f64, TransferError> {
    let (Some(&first), Some(&last)) = (d.first(), d.last()) else {
        return Ok(0.0);
    };
    let outside = |x: f64| !(x <= first && x >= last);
    let at = |x: f64| limber_interpolate(d, sources, x);

    match kind {
        RadialFunctionKind::ScalarTemperature0 => {
            let sqrt_abs_k = curvature.sqrt_abs();
            let tau_star = match curvature.sign() {
                0 => (l + 0.5) / q,
                1 => ((l * (l + 1.0)).sqrt() / q * sqrt_abs_k).asin() / sqrt_abs_k,
                _ => ((l + 0.5) / q * sqrt_abs_k).asinh() / sqrt_abs_k,
            };
            if outside(tau_star) {
                return Ok(0.0);
            }
            let s = at(tau_star)?;
            let i_phi_flat = (PI / (2.0 * l)).sqrt() * (1.0 - 0.25 / l + 1.0 / 32.0 / (l * l));
            Ok(if curvature.sign() == 0 {
                i_phi_flat * s / (l + 0.5)
            } else {
                i_phi_flat * s * (1.0 - curvature.k * l * l / q / q).powf(-0.25) / (tau_star * q)
            })
        }
        RadialFunctionKind::ScalarTemperature1 => {
            let (xp, xm) = ((l + 1.5) / q, (l - 0.5) / q);
            if outside(xp) || outside(xm) {
                return Ok(0.0);
            }
            let (sp, sm) = (at(xp)?, at(xm)?);
            Ok(-(PI / (2.0 * l + 3.0)).sqrt() * sp / (l + 1.5) * (l + 1.0) / (2.0 * l + 1.0)
                + (PI / (2.0 * l - 1.0)).sqrt() * sm / (l - 0.5) * l / (2.0 * l + 1.0))
        }
        RadialFunctionKind::NcRsd => {
            let (xp, x0, xm) = ((l + 2.5) / q, (l + 0.5) / q, (l - 1.5) / q);
            if outside(xp) || outside(xm) {
                return Ok(0.0);
            }
            let (sp, s, sm) = (at(xp)?, at(x0)?, at(xm)?);
            Ok(
                (PI / (2.0 * l + 5.0)).sqrt() * sp / (l + 2.5) * l * (l + 2.0) / (2.0 * l + 1.0) / (2.0 * l + 3.0)
                    - (PI / (2.0 * l + 1.0)).sqrt() * s / (l + 0.5) * l / (2.0 * l + 1.0)
                        * (l / (2.0 * l - 1.0) + (l + 1.0) / (2.0 * l + 3.0))
                    + (PI / (2.0 * l - 3.0)).sqrt() * sm / (l - 1.5) * l * (l - 1.0) / (2.0 * l + 1.0) / (2.0 * l - 1.0),
            )
        }
        other => Err(TransferError::LimberNotCoded(other)),
    }
}

/// Second-order Limber approximation of Δ_l(k) for the monopole kernel in
/// flat space, from the source and its first two derivatives at
/// τ0 − τ = (l + ½)/k.
///
/// # Errors
///
/// Returns [`TransferError::MalformedGrid`] with fewer than three samples.
pub fn limber2(l: f64, k: f64, d: &[f64], sources: &[f64]) -> Result<f64, TransferError> {
    let n = d.len();
    let tau_star = (l + 0.5) / k;
    if n == 0 || tau_star > d[0] || tau_star < d[n - 1] {
        return Ok(0.0);
    }
    if n < 3 {
        return Err(TransferError::MalformedGrid(format!(
            "second-order Limber needs at least 3 time samples, got {n}"
        )));
    }
    let mut i = 1;
    while d[i] > tau_star && i < n - 2 {
        i += 1;
    }
    let (s, ds, dds) = numerical::parabola(
        tau_star,
        [d[i - 1], d[i], d[i + 1]],
        [sources[i - 1], sources[i], sources[i + 1]],
    );
    let two_l1 = 2.0 * l + 1.0;
    Ok((PI / two_l1).sqrt() / k
        * ((1.0 - 1.5 / (two_l1 * two_l1)) * s + ds / k / two_l1 - 0.5 * dds / (k * k)))
}

// ═══════════════════════════════════════════════════════════════════
// Per-wavenumber engine
// ═══════════════════════════════════════════════════════════════════

/// Read-only data of one mode.
#[derive(Debug)]
pub struct ModeContext<'a> {
    /// Types of the mode.
    pub types: TypeTable,
    /// k(q) of the mode.
    pub k: Vec<f64>,
    /// Largest perturbation k usable for spectra.
    pub k_max_cl: f64,
    /// Number of initial conditions.
    pub ic_size: usize,
    /// Perturbation source index of each type.
    pub source_index: Vec<usize>,
    /// Sources splined in k.
    pub splined: SplinedSources<'a>,
}

impl ModeContext<'_> {
    /// Length of one q column: ic × type × l.
    #[must_use]
    pub fn column_len(&self) -> usize {
        self.ic_size * self.types.len() * self.types.l_size
    }
}

/// Everything shared by the wavenumber tasks.
#[derive(Debug)]
pub struct Engine<'a> {
    /// Modes in storage order.
    pub modes: Vec<ModeContext<'a>>,
    /// Wavenumber grid.
    pub q: &'a [f64],
    /// First q index served by the rescaled flat table.
    pub index_q_flat_approximation: usize,
    /// Multipole grid.
    pub l: &'a [usize],
    /// Spatial curvature.
    pub curvature: Curvature,
    /// Conformal age.
    pub tau0: f64,
    /// (τ0 − τ_rec) times the angular rescaling.
    pub ra_rec: f64,
    /// Multipole above which late sources may be dropped.
    pub late_source_l: f64,
    /// τ0 − τ_cut.
    pub tau0_minus_tau_cut: f64,
    /// Shared flat kernel table.
    pub flat_table: &'a HyperTable,
    /// Source redefinition.
    pub adapter: &'a SourceAdapter<'a>,
    /// Quadrature/Limber switch.
    pub limber: LimberSwitch<'a>,
    /// Use `limber2` for the flat monopole kernel.
    pub limber_second_order: bool,
    /// Precision parameters.
    pub precision: &'a Precision,
}

impl Engine<'_> {
    /// One column per mode, laid out `[(ic * tt_size + tt) * l_size + l]`.
    ///
    /// # Errors
    ///
    /// Propagates every interpolation, kernel-table and Limber failure.
    pub fn compute_for_q(&self, index_q: usize) -> Result<Vec<Vec<f64>>, TransferError> {
        let mut ws = Workspace::new(self.adapter.tau_size_max());
        ws.refresh_curved_table(
            self.curvature,
            self.q[index_q],
            index_q,
            self.index_q_flat_approximation,
            self.tau0,
            self.l,
            self.precision,
        )?;
        self.modes
            .iter()
            .map(|mode| self.compute_mode(mode, index_q, &mut ws))
            .collect()
    }

    fn compute_mode(&self, mode: &ModeContext<'_>, index_q: usize, ws: &mut Workspace) -> Result<Vec<f64>, TransferError> {
        let tt_size = mode.types.len();
        let l_size = mode.types.l_size;
        let mut column = vec![0.0; mode.column_len()];
        let k = mode.k[index_q];
        if k > mode.k_max_cl {
            return Ok(column);
        }

        let q = self.q[index_q];
        let branch = KernelBranch::select(self.curvature, index_q, self.index_q_flat_approximation);
        let curved_l_size = ws.curved_l_size();
        let table = match branch {
            KernelBranch::Curved => ws.curved.as_ref(),
            KernelBranch::Flat | KernelBranch::Rescaled => Some(self.flat_table),
        };
        let closed_nu = (self.curvature.sign() == 1)
            .then(|| (q / self.curvature.sqrt_abs() + CLOSED_NU_ROUNDING_OFFSET).floor());

        for ic in 0..mode.ic_size {
            let mut previous = None;
            for (index_tt, info) in mode.types.types.iter().enumerate() {
                let tp = mode.source_index[index_tt];
                if previous != Some(tp) {
                    mode.splined.interpolate_at_k(ic, tp, k, &mut ws.interpolated)?;
                    previous = Some(tp);
                }
                self.adapter
                    .redefine(info, index_tt, k, &ws.interpolated, &mut ws.sources)?;
                let (d, w) = self.adapter.sampling(info, index_tt)?;
                ws.coords.update(d, k, self.curvature);
                let q_max_bessel = match branch {
                    KernelBranch::Flat => self.flat_table.x_max() / d[0],
                    KernelBranch::Curved | KernelBranch::Rescaled => self.q[self.q.len() - 1],
                };

                for index_l in 0..l_size.min(info.l_size) {
                    let l = self.l[index_l];
                    let lf = l as f64;
                    let neglect = can_be_neglected(info, q, lf, self.ra_rec)
                        || closed_nu.is_some_and(|nu| lf >= nu)
                        || (branch == KernelBranch::Curved && index_l >= curved_l_size);
                    if neglect {
                        continue;
                    }

                    let value = if self.limber.applies(info, q, lf, q_max_bessel) {
                        if self.limber_second_order
                            && branch == KernelBranch::Flat
                            && info.radial == RadialFunctionKind::ScalarTemperature0
                        {
                            limber2(lf, k, d, &ws.sources)?
                        } else {
                            limber(info.radial, lf, q, self.curvature, d, &ws.sources)?
                        }
                    } else {
                        let table = table.ok_or_else(|| {
                            TransferError::InvalidInput(format!("no curved kernel table at q index {index_q}"))
                        })?;
                        let kernel = RadialKernel::new(table, branch, self.curvature, q, k);
                        let late_cut = late_source_can_be_neglected(info, lf, self.late_source_l)
                            .then_some(self.tau0_minus_tau_cut);
                        integrate(
                            &kernel,
                            KernelQuery {
                                kind: info.radial,
                                index_l,
                                l,
                            },
                            SampledSource {
                                tau0_minus_tau: d,
                                weights: w,
                                values: &ws.sources,
                            },
                            &ws.coords,
                            late_cut,
                            &mut ws.radial,
                        )?
                    };
                    column[(ic * tt_size + index_tt) * l_size + index_l] = value;
                }
            }
        }
        Ok(column)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{OutputRequest, SelectionConfig, SelectionKind};
    use crate::grid;
    use crate::hyperspherical::phi_single;
    use crate::modes::{Mode, TransferType};
    use crate::tolerances::{HERMITE_CUBIC_ABS, LIMBER_VS_QUADRATURE_REL};
    use approx::assert_relative_eq;

    fn scalar_table(out: &OutputRequest) -> TypeTable {
        let p = Precision::default();
        let l = grid::multipole_grid(grid::global_l_max(out), &p, 1.0).unwrap();
        TypeTable::new(Mode::Scalar, out, 1, &p, &l).unwrap()
    }

    fn cmb_table() -> TypeTable {
        scalar_table(&OutputRequest {
            cmb_polarization: true,
            cmb_lensing_potential: true,
            ..OutputRequest::default()
        })
    }

    fn info(table: &TypeTable, ty: TransferType) -> TypeInfo {
        table.types[table.index_of(ty).unwrap()]
    }

    #[test]
    fn neglect_below_recombination_scale() {
        let table = cmb_table();
        let t0 = info(&table, TransferType::Temperature0);
        let ra_rec = 13_700.0;
        assert!(can_be_neglected(&t0, 0.5, 100.0, ra_rec));
        assert!(!can_be_neglected(&t0, 0.01, 100.0, ra_rec));
        let lensing = info(&table, TransferType::CmbLensing);
        assert!(!can_be_neglected(&lensing, 0.5, 2.0, ra_rec));
    }

    #[test]
    fn late_source_rule_follows_type_metadata() {
        let table = cmb_table();
        let e = info(&table, TransferType::PolarisationE);
        let t0 = info(&table, TransferType::Temperature0);
        assert!(late_source_can_be_neglected(&e, 500.0, 400.0));
        assert!(!late_source_can_be_neglected(&e, 300.0, 400.0));
        assert!(!late_source_can_be_neglected(&t0, 500.0, 400.0));
    }

    #[test]
    fn limber_switch_rules() {
        let p = Precision::default();
        let table = cmb_table();
        let switch = LimberSwitch::new(&p, None);
        let lensing = info(&table, TransferType::CmbLensing);
        assert!(switch.applies(&lensing, 0.01, 11.0, 1.0));
        assert!(!switch.applies(&lensing, 0.01, 10.0, 1.0));
        let t0 = info(&table, TransferType::Temperature0);
        assert!(!switch.applies(&t0, 0.01, 2000.0, 1.0));
        assert!(switch.applies(&t0, 2.0, 2.0, 1.0));

        let nc = scalar_table(&OutputRequest {
            cmb_temperature: false,
            nc_density: true,
            galaxy_lensing: true,
            ..OutputRequest::default()
        });
        let gaussian = Selection::new(
            &SelectionConfig {
                kind: SelectionKind::Gaussian,
                mean: vec![0.5],
                ..SelectionConfig::default()
            },
            &p,
        )
        .unwrap();
        let switch = LimberSwitch::new(&p, Some(&gaussian));
        let density = info(&nc, TransferType::Density(0));
        assert!(switch.applies(&density, 0.01, 50.0, 1.0));
        assert!(!switch.applies(&density, 0.01, 49.0, 1.0));

        let dirac = Selection::new(
            &SelectionConfig {
                kind: SelectionKind::Dirac,
                mean: vec![0.5],
                ..SelectionConfig::default()
            },
            &p,
        )
        .unwrap();
        let switch = LimberSwitch::new(&p, Some(&dirac));
        assert!(!switch.applies(&density, 0.01, 500.0, 1.0));
        let shear = info(&nc, TransferType::Lensing(0));
        assert!(switch.applies(&shear, 0.01, 15.0, 1.0));
    }

    fn flat_kernel_setup(l: &[usize], x_max: f64) -> HyperTable {
        HyperTable::build(0, 1.0, l, 1e-5, x_max, 20.0, 1e-10).unwrap()
    }

    #[test]
    fn single_point_quadrature_is_source_times_kernel() {
        let l_grid = [2, 50, 100];
        let table = flat_kernel_setup(&l_grid, 300.0);
        let k = 0.05;
        let d = [(100.0 + 0.5) / k];
        let mut coords = RadialCoordinates::default();
        coords.update(&d, k, Curvature::FLAT);
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let mut radial = Vec::new();
        let value = integrate(
            &kernel,
            KernelQuery {
                kind: RadialFunctionKind::ScalarTemperature0,
                index_l: 2,
                l: 100,
            },
            SampledSource {
                tau0_minus_tau: &d,
                weights: &[1.0],
                values: &[2.5],
            },
            &coords,
            None,
            &mut radial,
        )
        .unwrap();
        let exact = table
            .evaluate(2, k * d[0], crate::hyperspherical::HermiteOrder::Cubic)
            .unwrap()
            .phi;
        assert_relative_eq!(value, 2.5 * exact, max_relative = 1e-14);
        assert!((exact - phi_single(0, 1.0, 100, k * d[0])).abs() < HERMITE_CUBIC_ABS);
    }

    #[test]
    fn kernel_beyond_sampling_gives_zero() {
        let table = flat_kernel_setup(&[2, 100], 300.0);
        let k = 0.01;
        let d = [1000.0, 500.0, 0.0];
        let mut coords = RadialCoordinates::default();
        coords.update(&d, k, Curvature::FLAT);
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let mut radial = Vec::new();
        let value = integrate(
            &kernel,
            KernelQuery {
                kind: RadialFunctionKind::ScalarTemperature0,
                index_l: 1,
                l: 100,
            },
            SampledSource {
                tau0_minus_tau: &d,
                weights: &numerical::trapezoidal_weights(&d),
                values: &[1.0, 1.0, 1.0],
            },
            &coords,
            None,
            &mut radial,
        )
        .unwrap();
        assert_eq!(value, 0.0);
    }

    #[test]
    fn kernel_cut_between_samples_integrates_the_truncated_trapezoid() {
        // A coarse φ_min puts the kernel cut where the kernel is still visible.
        let table = HyperTable::build(0, 1.0, &[2, 100], 1e-5, 300.0, 20.0, 1e-3).unwrap();
        let k = 0.05;
        let d: Vec<f64> = (0..=600).map(|i| 4000.0 * (1.0 - f64::from(i) / 600.0)).collect();
        let s: Vec<f64> = d.iter().map(|x| 1.0 + x / 4000.0).collect();
        let w = numerical::trapezoidal_weights(&d);
        let mut coords = RadialCoordinates::default();
        coords.update(&d, k, Curvature::FLAT);
        let kernel = RadialKernel::new(&table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let kind = RadialFunctionKind::ScalarTemperature0;

        let cut = kernel.min_distance(1, 100);
        let last = d.iter().rposition(|&x| x >= cut).unwrap();
        assert!(last > 0 && last < d.len() - 1 && d[last + 1] < cut);

        let mut r = Vec::new();
        kernel.evaluate(kind, 1, 100, &coords, last + 1, &mut r).unwrap();
        let f: Vec<f64> = r.iter().zip(&s).map(|(r, s)| r * s).collect();
        let trapezoids: f64 = (0..last).map(|j| 0.5 * (d[j] - d[j + 1]) * (f[j] + f[j + 1])).sum();
        let expected = trapezoids + 0.5 * (d[last] - cut) * f[last];
        let untruncated = numerical::trapezoidal_integral(&f, &w[..=last]);
        assert!((untruncated - expected).abs() > 1e-9);

        let mut radial = Vec::new();
        let value = integrate(
            &kernel,
            KernelQuery { kind, index_l: 1, l: 100 },
            SampledSource {
                tau0_minus_tau: &d,
                weights: &w,
                values: &s,
            },
            &coords,
            None,
            &mut radial,
        )
        .unwrap();
        approx::assert_abs_diff_eq!(value, expected, epsilon = 1e-11);
    }

    /// Gaussian source in τ0 − τ centred on the stationary point of l.
    fn gaussian_source(k: f64, l: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        let centre = (l + 0.5) / k;
        let sigma = 0.25 * centre;
        let d: Vec<f64> = (0..n)
            .map(|i| 3.0 * centre * (1.0 - i as f64 / (n - 1) as f64))
            .collect();
        let s = d
            .iter()
            .map(|x| (-0.5 * ((x - centre) / sigma).powi(2)).exp())
            .collect();
        (d, s)
    }

    fn quadrature(table: &HyperTable, index_l: usize, l: usize, k: f64, d: &[f64], s: &[f64]) -> f64 {
        let mut coords = RadialCoordinates::default();
        coords.update(d, k, Curvature::FLAT);
        let kernel = RadialKernel::new(table, KernelBranch::Flat, Curvature::FLAT, k, k);
        let w = numerical::trapezoidal_weights(d);
        let mut radial = Vec::new();
        integrate(
            &kernel,
            KernelQuery {
                kind: RadialFunctionKind::ScalarTemperature0,
                index_l,
                l,
            },
            SampledSource {
                tau0_minus_tau: d,
                weights: &w,
                values: s,
            },
            &coords,
            None,
            &mut radial,
        )
        .unwrap()
    }

    #[test]
    fn limber_agrees_with_quadrature_for_wide_source() {
        let l_grid = [2, 100];
        let k = 0.02;
        let table = flat_kernel_setup(&l_grid, 3.0 * 100.5 + 1.0);
        let (d, s) = gaussian_source(k, 100.0, 4000);
        let exact = quadrature(&table, 1, 100, k, &d, &s);
        let approx = limber(RadialFunctionKind::ScalarTemperature0, 100.0, k, Curvature::FLAT, &d, &s).unwrap();
        assert_relative_eq!(approx, exact, max_relative = LIMBER_VS_QUADRATURE_REL);
    }

    #[test]
    fn second_order_limber_is_close_to_first_order() {
        let k = 0.02;
        let (d, s) = gaussian_source(k, 100.0, 4000);
        let first = limber(RadialFunctionKind::ScalarTemperature0, 100.0, k, Curvature::FLAT, &d, &s).unwrap();
        let second = limber2(100.0, k, &d, &s).unwrap();
        assert_relative_eq!(first, second, max_relative = LIMBER_VS_QUADRATURE_REL);
    }

    #[test]
    fn limber_outside_sampling_is_zero() {
        let d = [100.0, 50.0, 10.0, 0.0];
        let s = [1.0; 4];
        let v = limber(RadialFunctionKind::ScalarTemperature0, 100.0, 0.01, Curvature::FLAT, &d, &s).unwrap();
        assert_eq!(v, 0.0);
        let v = limber(RadialFunctionKind::ScalarTemperature1, 100.0, 0.01, Curvature::FLAT, &d, &s).unwrap();
        assert_eq!(v, 0.0);
        assert_eq!(limber2(100.0, 0.01, &d, &s).unwrap(), 0.0);
    }

    #[test]
    fn limber_uncoded_kernel_is_fatal() {
        let d = [100.0, 50.0, 0.0];
        let err = limber(RadialFunctionKind::TensorPolarisationE, 10.0, 0.1, Curvature::FLAT, &d, &[1.0; 3]).unwrap_err();
        assert!(matches!(err, TransferError::LimberNotCoded(RadialFunctionKind::TensorPolarisationE)));
    }

    #[test]
    fn limber_interpolation_needs_three_points() {
        assert!(limber_interpolate(&[2.0, 1.0], &[1.0, 1.0], 1.5).is_err());
    }

    #[test]
    fn limber_interpolation_is_regular_today() {
        let d = [4.0, 3.0, 2.0, 1.0, 0.0];
        let s: Vec<f64> = d.iter().map(|x: &f64| if *x > 0.0 { 5.0 / x } else { 0.0 }).collect();
        let v = limber_interpolate(&d, &s, 0.5).unwrap();
        assert_relative_eq!(v, 5.0, max_relative = 1e-12);
        let v = limber_interpolate(&d, &s, 2.5).unwrap();
        assert_relative_eq!(v, 5.0, max_relative = 1e-12);
    }

    #[test]
    fn limber_curved_reduces_to_flat() {
        let k = 0.02;
        let (d, s) = gaussian_source(k, 100.0, 2000);
        let flat = limber(RadialFunctionKind::ScalarTemperature0, 100.0, k, Curvature::FLAT, &d, &s).unwrap();
        let open = limber(RadialFunctionKind::ScalarTemperature0, 100.0, k, Curvature::new(-1e-14), &d, &s).unwrap();
        assert_relative_eq!(flat, open, max_relative = 1e-3);
    }

    #[test]
    fn dipole_and_rsd_limber_are_finite_for_smooth_sources() {
        let k = 0.02;
        let (d, s) = gaussian_source(k, 100.0, 2000);
        let t1 = limber(RadialFunctionKind::ScalarTemperature1, 100.0, k, Curvature::FLAT, &d, &s).unwrap();
        let rsd = limber(RadialFunctionKind::NcRsd, 100.0, k, Curvature::FLAT, &d, &s).unwrap();
        assert!(t1.is_finite() && rsd.is_finite());
        let t0 = limber(RadialFunctionKind::ScalarTemperature0, 100.0, k, Curvature::FLAT, &d, &s).unwrap();
        assert!(t1.abs() < t0.abs());
    }

    #[test]
    fn quadrature_converges_under_refinement() {
        let table = flat_kernel_setup(&[2, 100], 400.0);
        let k = 0.1;
        let coarse_d: Vec<f64> = (0..3000).map(|i| 3000.0 - f64::from(i)).collect();
        let coarse = quadrature(&table, 1, 100, k, &coarse_d, &vec![1.0; coarse_d.len()]);
        let fine_d: Vec<f64> = (0..12_000).map(|i| 3000.0 - 0.25 * f64::from(i)).collect();
        let fine = quadrature(&table, 1, 100, k, &fine_d, &vec![1.0; fine_d.len()]);
        assert_relative_eq!(coarse, fine, max_relative = 1e-3);
    }
}

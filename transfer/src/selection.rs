// SPDX-License-Identifier: AGPL-3.0-only

//! Redshift selection windows for number counts and galaxy lensing.
//!
//! A [`Selection`] turns the per-bin settings of [`SelectionConfig`] into
//! windows W(τ) normalized to ∫ W dτ = 1, optionally weighted by a tabulated
//! or analytic dN/dz. [`SelectionWindows::precompute`] then builds, once per
//! build, the time sampling and the background-dependent rescaling of every
//! number-count and lensing type. These are shared read-only by all
//! wavenumbers.

use std::fs;
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use crate::config::{Precision, RedshiftDistribution, SelectionConfig, SelectionKind};
use crate::cosmology::{Background, BackgroundState};
use crate::error::TransferError;
use crate::modes::{Category, TransferType, TypeInfo, TypeTable};
use crate::numerical;

// ═══════════════════════════════════════════════════════════════════
// Redshift distributions
// ═══════════════════════════════════════════════════════════════════

/// Splined two-column table y(z).
#[derive(Clone, Debug)]
pub struct RedshiftTable {
    z: Vec<f64>,
    y: Vec<f64>,
    ddy: Vec<f64>,
}

impl RedshiftTable {
    /// Spline y(z) on an increasing z grid.
    ///
    /// # Errors
    ///
    /// Returns a grid error for fewer than two rows or repeated redshifts.
    pub fn new(z: Vec<f64>, y: Vec<f64>) -> Result<Self, TransferError> {
        let ddy = numerical::spline_second_derivatives(&z, &y)?;
        Ok(Self { z, y, ddy })
    }

    /// Read a (z, dN/dz) file.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the file cannot be read and
    /// [`TransferError::Parse`] on a malformed row.
    pub fn read(path: &Path) -> Result<Self, TransferError> {
        let (z, y) = read_columns(path)?;
        Self::new(z, y)
    }

    /// Read a (z, dN/dz) file and tabulate d ln(dN/dz)/dz instead, with
    /// one-sided differences at the ends and centered ones inside.
    ///
    /// # Errors
    ///
    /// As [`RedshiftTable::read`]; also fails on fewer than two rows.
    pub fn read_log_derivative(path: &Path) -> Result<Self, TransferError> {
        let (z, nz) = read_columns(path)?;
        let n = z.len();
        if n < 2 {
            return Err(TransferError::Parse {
                path: path.display().to_string(),
                line: n,
                msg: "evolution table needs at least two rows".into(),
            });
        }
        let ln: Vec<f64> = nz.iter().map(|v| v.ln()).collect();
        let mut dln = Vec::with_capacity(n);
        dln.push((ln[1] - ln[0]) / (z[1] - z[0]));
        for i in 1..n - 1 {
            dln.push((ln[i + 1] - ln[i - 1]) / (z[i + 1] - z[i - 1]));
        }
        dln.push((ln[n - 1] - ln[n - 2]) / (z[n - 1] - z[n - 2]));
        Self::new(z, dln)
    }

    /// Interpolated value at z.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InterpolationOutOfRange`] outside the
    /// tabulated redshifts.
    pub fn value(&self, z: f64) -> Result<f64, TransferError> {
        numerical::spline_eval(&self.z, &self.y, &self.ddy, z, "redshift distribution")
    }

    /// Tabulated redshift range.
    #[must_use]
    pub fn z_range(&self) -> (f64, f64) {
        (self.z[0], self.z[self.z.len() - 1])
    }
}

fn read_columns(path: &Path) -> Result<(Vec<f64>, Vec<f64>), TransferError> {
    let label = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|source| TransferError::Io {
        path: label.clone(),
        source,
    })?;
    let mut z = Vec::new();
    let mut y = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parse_error = |msg: String| TransferError::Parse {
            path: label.clone(),
            line: i + 1,
            msg,
        };
        let mut cols = line.split_whitespace();
        let mut next = |name: &str| -> Result<f64, TransferError> {
            let field = cols
                .next()
                .ok_or_else(|| parse_error(format!("missing {name} column")))?;
            field
                .parse::<f64>()
                .map_err(|e| parse_error(format!("{name} '{field}': {e}")))
        };
        let zi = next("z")?;
        let yi = next("dN/dz")?;
        if z.last().is_some_and(|&prev| zi <= prev) {
            return Err(parse_error(format!("redshift {zi} is not increasing")));
        }
        z.push(zi);
        y.push(yi);
    }
    if z.len() < 2 {
        return Err(TransferError::Parse {
            path: label,
            line: text.lines().count(),
            msg: format!("need at least two rows, found {}", z.len()),
        });
    }
    Ok((z, y))
}

/// Photometric-survey dN/dz = (z/z0)^α exp[−(z/z0)^β] and its logarithmic
/// derivative, with z0 = 0.9/√2, α = 2, β = 1.5.
#[must_use]
pub fn dndz_analytic(z: f64) -> (f64, f64) {
    const ALPHA: f64 = 2.0;
    const BETA: f64 = 1.5;
    let z0 = 0.9 / std::f64::consts::SQRT_2;
    let x = z / z0;
    let dndz = x.powf(ALPHA) * (-x.powf(BETA)).exp();
    let dln = (ALPHA - BETA * x.powf(BETA)) / z;
    (dndz, dln)
}

#[derive(Clone, Debug)]
enum Distribution {
    Flat,
    Analytic,
    Table(RedshiftTable),
}

impl Distribution {
    fn load(source: &RedshiftDistribution, log_derivative: bool) -> Result<Self, TransferError> {
        Ok(match source {
            RedshiftDistribution::None => Self::Flat,
            RedshiftDistribution::Analytic => Self::Analytic,
            RedshiftDistribution::File(path) if log_derivative => {
                Self::Table(RedshiftTable::read_log_derivative(path)?)
            }
            RedshiftDistribution::File(path) => Self::Table(RedshiftTable::read(path)?),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════
// Selection functions
// ═══════════════════════════════════════════════════════════════════

/// Conformal-time extent of one bin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectionTimes {
    /// Earliest time (highest redshift) of the window.
    pub tau_min: f64,
    /// Time of the mean redshift.
    pub tau_mean: f64,
    /// Latest time (lowest redshift, never below z = 0).
    pub tau_max: f64,
}

/// Selection functions of all bins, with their dN/dz and evolution inputs
/// loaded.
#[derive(Clone, Debug)]
pub struct Selection {
    config: SelectionConfig,
    cut_at_sigma: f64,
    tophat_edge: f64,
    dndz: Distribution,
    evolution: Distribution,
}

impl Selection {
    /// Validate the bins and load any redshift-distribution files.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] on inconsistent bins and
    /// file errors from [`RedshiftTable`].
    pub fn new(config: &SelectionConfig, precision: &Precision) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            cut_at_sigma: precision.selection_cut_at_sigma,
            tophat_edge: precision.selection_tophat_edge,
            dndz: Distribution::load(&config.dndz, false)?,
            evolution: Distribution::load(&config.evolution, true)?,
        })
    }

    /// Window shape.
    #[must_use]
    pub const fn kind(&self) -> SelectionKind {
        self.config.kind
    }

    /// Whether the windows are Dirac shells.
    #[must_use]
    pub fn is_dirac(&self) -> bool {
        self.config.kind == SelectionKind::Dirac
    }

    /// Mean redshift of `bin`.
    #[must_use]
    pub fn mean(&self, bin: usize) -> f64 {
        self.config.mean.get(bin).copied().unwrap_or(0.0)
    }

    /// Settings the windows were built from.
    #[must_use]
    pub const fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Unnormalized dN/dz of `bin` at redshift z.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InterpolationOutOfRange`] if a tabulated
    /// dN/dz does not cover z.
    pub fn selection_function(&self, bin: usize, z: f64) -> Result<f64, TransferError> {
        let width = self.config.width(bin);
        let x = (z - self.mean(bin)).abs();
        let shape = match self.config.kind {
            SelectionKind::Dirac => return Ok(1.0),
            SelectionKind::Gaussian => {
                (-0.5 * (x / width).powi(2)).exp() / width / (2.0 * std::f64::consts::PI).sqrt()
            }
            SelectionKind::TopHat => {
                0.5 * (1.0 - ((x - width) / (self.tophat_edge * width)).tanh())
            }
        };
        let dndz = match &self.dndz {
            Distribution::Flat => 1.0,
            Distribution::Analytic => dndz_analytic(z).0,
            Distribution::Table(table) => table.value(z)?,
        };
        Ok(shape * dndz)
    }

    /// Time extent of `bin`: a symmetric redshift cut (σ-based for
    /// extended windows, exact for Dirac) mapped through τ(z).
    ///
    /// # Errors
    ///
    /// Propagates background failures.
    pub fn times(&self, bin: usize, background: &dyn Background) -> Result<SelectionTimes, TransferError> {
        let mean = self.mean(bin);
        let half = match self.config.kind {
            SelectionKind::Dirac => 0.0,
            SelectionKind::Gaussian => self.config.width(bin) * self.cut_at_sigma,
            SelectionKind::TopHat => {
                (1.0 + self.cut_at_sigma * self.tophat_edge) * self.config.width(bin)
            }
        };
        Ok(SelectionTimes {
            tau_min: background.tau_of_z(mean + half)?,
            tau_mean: background.tau_of_z(mean.max(0.0))?,
            tau_max: background.tau_of_z((mean - half).max(0.0))?,
        })
    }

    /// Evenly spaced τ0 − τ across the window of `bin`, decreasing. The
    /// last point is always τ0 − τ_max, so an extended window sampled once
    /// sits at its lowest redshift edge.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] for an empty sampling or a
    /// Dirac window sampled in more than one point.
    pub fn sampling(
        &self,
        times: SelectionTimes,
        tau0: f64,
        tau_size: usize,
    ) -> Result<Vec<f64>, TransferError> {
        if tau_size == 0 {
            return Err(TransferError::InvalidInput(
                "selection sampling needs at least one point".into(),
            ));
        }
        if self.is_dirac() {
            if tau_size != 1 {
                return Err(TransferError::InvalidInput(format!(
                    "Dirac selection is sampled in one point, not {tau_size}"
                )));
            }
            return Ok(vec![tau0 - times.tau_mean]);
        }
        let span = times.tau_max - times.tau_min;
        let last = (tau_size - 1) as f64;
        let mut out: Vec<f64> = (0..tau_size - 1)
            .map(|i| tau0 - times.tau_min - i as f64 / last * span)
            .collect();
        out.push(tau0 - times.tau_max);
        Ok(out)
    }

    /// Window W(τ) = dN/dz · H at the given times, normalized so that the
    /// trapezoidal integral with `weights` is one. A single point is a
    /// Dirac shell of unit weight.
    ///
    /// # Errors
    ///
    /// Propagates background and dN/dz failures and rejects a window whose
    /// integral is not positive.
    pub fn compute(
        &self,
        bin: usize,
        tau0_minus_tau: &[f64],
        weights: &[f64],
        background: &dyn Background,
    ) -> Result<Vec<f64>, TransferError> {
        if tau0_minus_tau.len() <= 1 {
            return Ok(vec![1.0; tau0_minus_tau.len()]);
        }
        let tau0 = background.conformal_age();
        let a_today = background.a_today();
        let mut window = tau0_minus_tau
            .iter()
            .map(|&d| -> Result<f64, TransferError> {
                let state = background.state_at_tau(tau0 - d)?;
                let z = a_today / state.a - 1.0;
                Ok(self.selection_function(bin, z)? * state.h)
            })
            .collect::<Result<Vec<f64>, TransferError>>()?;
        let norm = numerical::trapezoidal_integral(&window, weights);
        if !(norm.is_finite() && norm > 0.0) {
            return Err(TransferError::InvalidInput(format!(
                "selection window of bin {bin} integrates to {norm}"
            )));
        }
        for w in &mut window {
            *w /= norm;
        }
        Ok(window)
    }

    /// Evolution bias f_evo at one time, where `cot` is the generalized
    /// cotangent of the distance to the source. Zero without an evolution
    /// input.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InterpolationOutOfRange`] if a tabulated
    /// evolution does not cover the redshift of `state`.
    pub fn f_evo(&self, state: BackgroundState, a_today: f64, cot: f64) -> Result<f64, TransferError> {
        let dln_dndz = match &self.evolution {
            Distribution::Flat => return Ok(0.0),
            Distribution::Analytic => dndz_analytic(a_today / state.a - 1.0).1,
            Distribution::Table(table) => table.value(a_today / state.a - 1.0)?,
        };
        Ok(2.0 / state.h / state.a * cot + state.h_prime / (state.h * state.h * state.a)
            - dln_dndz / state.a)
    }

    /// Number of time samples of a number-count or lensing type. Local
    /// types resolve the Bessel oscillation up to their Limber switch
    /// across the window; line-of-sight types do so from the window to
    /// today.
    ///
    /// # Errors
    ///
    /// Propagates background failures.
    pub fn tau_size(
        &self,
        info: &TypeInfo,
        background: &dyn Background,
        precision: &Precision,
        l_lss_max: usize,
    ) -> Result<usize, TransferError> {
        let bin = info.ty.bin().unwrap_or(0);
        let times = self.times(bin, background)?;
        let tau0 = background.conformal_age();
        let base = precision.selection_sampling;
        let l_limber = |over_z: f64| (over_z * self.mean(bin)).trunc().min(l_lss_max as f64);
        // A bin too close to us for any multipole to resolve keeps the base sampling.
        let resolved = |span: f64, scale: f64, l: f64, sampling: f64| {
            if l < 1.0 {
                0
            } else {
                ((span / (scale / l)).floor() * sampling).floor().max(0.0) as usize
            }
        };
        Ok(match info.category {
            Category::NumberCountLocal => {
                if self.is_dirac() {
                    1
                } else {
                    base.max(resolved(
                        times.tau_max - times.tau_min,
                        tau0 - times.tau_mean,
                        l_limber(precision.l_switch_limber_for_nc_local_over_z),
                        precision.selection_sampling_bessel,
                    ))
                }
            }
            Category::LineOfSight => {
                let (over_z, sampling) = if matches!(info.ty, TransferType::Gr5(_)) {
                    (
                        precision.l_switch_limber_for_nc_local_over_z,
                        precision.selection_sampling_bessel,
                    )
                } else {
                    (
                        precision.l_switch_limber_for_nc_los_over_z,
                        precision.selection_sampling_bessel_los,
                    )
                };
                base.max(resolved(
                    tau0 - times.tau_min,
                    (tau0 - times.tau_mean) / 2.0,
                    l_limber(over_z),
                    sampling,
                ))
                .max(2)
            }
            Category::Cmb | Category::CmbLensing => 0,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════
// Precomputed windows
// ═══════════════════════════════════════════════════════════════════

/// Time sampling and per-time rescaling of one number-count or lensing
/// type, independent of the wavenumber.
#[derive(Clone, Debug)]
pub struct TypeWindow {
    /// τ0 − τ, decreasing.
    pub tau0_minus_tau: Vec<f64>,
    /// Trapezoidal weights on `tau0_minus_tau`.
    pub weights: Vec<f64>,
    /// Factor multiplying the resampled source.
    pub window: Vec<f64>,
}

/// Windows of every type of the scalar mode; `None` for CMB types.
#[derive(Clone, Debug, Default)]
pub struct SelectionWindows {
    windows: Vec<Option<TypeWindow>>,
}

impl SelectionWindows {
    /// Precompute the windows of all number-count and lensing types of
    /// `types`.
    ///
    /// # Errors
    ///
    /// Propagates selection, background and evolution failures, and
    /// rejects a window starting after the last perturbation time.
    pub fn precompute(
        selection: &Selection,
        types: &TypeTable,
        background: &dyn Background,
        precision: &Precision,
        l_lss_max: usize,
        tau_last: f64,
    ) -> Result<Self, TransferError> {
        let windows = types
            .types
            .par_iter()
            .map(|info| match info.category {
                Category::NumberCountLocal => {
                    local_window(selection, info, background, precision, l_lss_max, tau_last).map(Some)
                }
                Category::LineOfSight => {
                    line_of_sight_window(selection, info, background, precision, l_lss_max).map(Some)
                }
                Category::Cmb | Category::CmbLensing => Ok(None),
            })
            .collect::<Result<Vec<_>, TransferError>>()?;
        for (info, w) in types.types.iter().zip(&windows) {
            if let Some(w) = w {
                debug!(ty = ?info.ty, tau_size = w.tau0_minus_tau.len(), "selection window");
            }
        }
        Ok(Self { windows })
    }

    /// Window of the type stored at `index_tt`.
    #[must_use]
    pub fn get(&self, index_tt: usize) -> Option<&TypeWindow> {
        self.windows.get(index_tt).and_then(Option::as_ref)
    }

    /// Largest number of samples over all windows.
    #[must_use]
    pub fn tau_size_max(&self) -> usize {
        self.windows
            .iter()
            .flatten()
            .map(|w| w.tau0_minus_tau.len())
            .max()
            .unwrap_or(0)
    }
}

/// 1 + H′/(aH²) and cot/(aH), shared by the Doppler and GR factors.
fn expansion_terms(state: BackgroundState, cot: f64) -> (f64, f64) {
    (
        state.h_prime / (state.a * state.h * state.h),
        cot / (state.a * state.h),
    )
}

fn local_window(
    selection: &Selection,
    info: &TypeInfo,
    background: &dyn Background,
    precision: &Precision,
    l_lss_max: usize,
    tau_last: f64,
) -> Result<TypeWindow, TransferError> {
    let bin = info.ty.bin().unwrap_or(0);
    let tau0 = background.conformal_age();
    let a_today = background.a_today();
    let curvature = background.curvature();
    let times = selection.times(bin, background)?;
    let tau_size = selection.tau_size(info, background, precision, l_lss_max)?;
    let tau0_minus_tau = selection.sampling(times, tau0, tau_size)?;
    if tau0 - tau0_minus_tau[0] > tau_last {
        return Err(TransferError::InvalidInput(format!(
            "selection window of bin {bin} starts at tau = {} after the last source time {tau_last}",
            tau0 - tau0_minus_tau[0]
        )));
    }
    let weights = numerical::trapezoidal_weights(&tau0_minus_tau);
    let sel = selection.compute(bin, &tau0_minus_tau, &weights, background)?;
    let s = selection.config.magnification_bias(bin);

    let window = tau0_minus_tau
        .iter()
        .zip(&sel)
        .map(|(&d, &w)| -> Result<f64, TransferError> {
            let state = background.state_at_tau(tau0 - d)?;
            let cot = curvature.cot_k(d);
            let (dh, cot_ah) = expansion_terms(state, cot);
            let f_evo = || selection.f_evo(state, a_today, cot);
            Ok(match info.ty {
                TransferType::Density(_) => selection.config.bias(bin) * w,
                TransferType::Rsd(_) => w / state.h / state.a,
                TransferType::Doppler0(_) => (f_evo()? - 3.0) * w * state.h * state.a,
                TransferType::Doppler1(_) => {
                    w * (1.0 + dh + (2.0 - 5.0 * s) * cot_ah + 5.0 * s - f_evo()?)
                }
                TransferType::Gr1(_) => w,
                TransferType::Gr2(_) => -w * (3.0 + dh + (2.0 - 5.0 * s) * cot_ah - f_evo()?),
                TransferType::Gr3(_) => w / state.a / state.h,
                _ => 0.0,
            })
        })
        .collect::<Result<Vec<f64>, TransferError>>()?;

    Ok(TypeWindow {
        tau0_minus_tau,
        weights,
        window,
    })
}

fn line_of_sight_window(
    selection: &Selection,
    info: &TypeInfo,
    background: &dyn Background,
    precision: &Precision,
    l_lss_max: usize,
) -> Result<TypeWindow, TransferError> {
    let bin = info.ty.bin().unwrap_or(0);
    let tau0 = background.conformal_age();
    let a_today = background.a_today();
    let curvature = background.curvature();
    let times = selection.times(bin, background)?;
    let s = selection.config.magnification_bias(bin);

    // Sources of the lensed light, across the selection window.
    let source_size = if selection.is_dirac() {
        1
    } else {
        precision.selection_sampling
    };
    let source_d = selection.sampling(times, tau0, source_size)?;
    let source_w = if source_size == 1 {
        vec![1.0]
    } else {
        numerical::trapezoidal_weights(&source_d)
    };
    let source_sel = selection.compute(bin, &source_d, &source_w, background)?;
    let gr5_factor = if matches!(info.ty, TransferType::Gr5(_)) {
        source_d
            .iter()
            .map(|&ds| -> Result<f64, TransferError> {
                let state = background.state_at_tau(tau0 - ds)?;
                let cot = curvature.cot_k(ds);
                let (dh, cot_ah) = expansion_terms(state, cot);
                Ok(1.0 + dh + (2.0 - 5.0 * s) * cot_ah + 5.0 * s
                    - selection.f_evo(state, a_today, cot)?)
            })
            .collect::<Result<Vec<f64>, TransferError>>()?
    } else {
        Vec::new()
    };

    // Lenses, from the earliest source time to today.
    let tau_size = selection.tau_size(info, background, precision, l_lss_max)?;
    let last = (tau_size - 1) as f64;
    let tau0_minus_tau: Vec<f64> = (0..tau_size)
        .map(|i| (tau_size - 1 - i) as f64 / last * (tau0 - times.tau_min))
        .collect();
    let weights = numerical::trapezoidal_weights(&tau0_minus_tau);

    let window = tau0_minus_tau
        .iter()
        .enumerate()
        .map(|(index_tau, &d)| {
            if index_tau == tau_size - 1 {
                return 0.0;
            }
            let csc_lens = 1.0 / curvature.sin_k(d);
            let mut sum = 0.0;
            for (j, &ds) in source_d.iter().enumerate() {
                if !(ds > 0.0 && ds - d > 0.0) {
                    continue;
                }
                let weight = source_sel[j] * source_w[j];
                let lensing = curvature.sin_k(ds - d) * csc_lens / curvature.sin_k(ds);
                sum += match info.ty {
                    TransferType::Lensing(_) => lensing * weight,
                    TransferType::NcLens(_) => -(2.0 - 5.0 * s) / 2.0 * lensing * weight,
                    TransferType::Gr4(_) => (2.0 - 5.0 * s) * curvature.cot_k(ds) * weight,
                    TransferType::Gr5(_) => gr5_factor[j] * weight,
                    _ => 0.0,
                };
            }
            sum
        })
        .collect();

    Ok(TypeWindow {
        tau0_minus_tau,
        weights,
        window,
    })
}

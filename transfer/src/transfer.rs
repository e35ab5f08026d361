// SPDX-License-Identifier: AGPL-3.0-only

//! Transfer table and its parallel build.
//!
//! [`TransferTable::compute`] plans the grids, splines the perturbation
//! sources, precomputes the selection windows and the shared flat kernel
//! table, then runs one rayon task per wavenumber. Each task owns its
//! [`crate::workspace::Workspace`]; results come back as per-q columns and
//! are scattered into the table, which is read-only afterwards.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::TransferConfig;
use crate::cosmology::{Background, Thermodynamics};
use crate::error::TransferError;
use crate::grid::{self, WavenumberBounds};
use crate::hyperspherical::HyperTable;
use crate::integrate::{Engine, LimberSwitch, ModeContext};
use crate::modes::{Mode, TransferType, TypeTable};
use crate::numerical;
use crate::perturbations::{NonlinearCorrections, PerturbationSources};
use crate::selection::{Selection, SelectionWindows};
use crate::sources::{SourceAdapter, SplinedSources};
use crate::tolerances::OPEN_TABLE_MARGIN;

/// Δ_l(q) of one mode, laid out `[((ic * tt_size + tt) * l_size + l) * q_size + q]`.
#[derive(Clone, Debug)]
pub struct ModeTable {
    /// Types in storage order.
    pub types: TypeTable,
    /// k(q) of the mode.
    pub k: Vec<f64>,
    /// Number of initial conditions.
    pub ic_size: usize,
    values: Vec<f64>,
    /// Second derivatives in q of every column, same layout as `values`.
    second_derivatives: Vec<f64>,
}

impl ModeTable {
    /// Table from its values on the grid `q`, splined along q.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::MalformedGrid`] if `values` is not a whole
    /// number of q columns or q has fewer than two points.
    pub fn new(types: TypeTable, k: Vec<f64>, ic_size: usize, q: &[f64], values: Vec<f64>) -> Result<Self, TransferError> {
        if q.is_empty() || values.len() % q.len() != 0 {
            return Err(TransferError::MalformedGrid(format!(
                "{} transfer values do not fill columns of {} wavenumbers",
                values.len(),
                q.len()
            )));
        }
        let second_derivatives = numerical::spline_rows(q, &values)?;
        Ok(Self {
            types,
            k,
            ic_size,
            values,
            second_derivatives,
        })
    }

    /// Mode stored.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.types.mode
    }

    /// Raw storage.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Transfer functions of every requested mode, initial condition, type
/// and multipole on the shared (l, q) grids.
#[derive(Clone, Debug, Default)]
pub struct TransferTable {
    l: Vec<usize>,
    q: Vec<f64>,
    index_q_flat_approximation: usize,
    modes: Vec<ModeTable>,
}

impl TransferTable {
    /// Build the table.
    ///
    /// Returns an empty table when `config` requests no observable.
    ///
    /// # Errors
    ///
    /// Returns the first error of any stage: invalid perturbation input,
    /// malformed grids, missing sources, selection or kernel-table
    /// failures, interpolation out of range, uncoded Limber kernels, or a
    /// thread pool that cannot be built.
    pub fn compute(
        config: &TransferConfig,
        background: &dyn Background,
        thermo: &Thermodynamics,
        perturbations: &PerturbationSources,
        nonlinear: Option<&NonlinearCorrections>,
    ) -> Result<Self, TransferError> {
        if !config.output.has_outputs() {
            info!("no transfer output requested, skipping");
            return Ok(Self::default());
        }
        match config.threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| TransferError::ThreadPool(e.to_string()))?;
                pool.install(|| Self::build(config, background, thermo, perturbations, nonlinear))
            }
            None => Self::build(config, background, thermo, perturbations, nonlinear),
        }
    }

    fn build(
        config: &TransferConfig,
        background: &dyn Background,
        thermo: &Thermodynamics,
        perturbations: &PerturbationSources,
        nonlinear: Option<&NonlinearCorrections>,
    ) -> Result<Self, TransferError> {
        let start = Instant::now();
        let precision = &config.precision;
        let output = &config.output;
        perturbations.validate()?;

        let tau0 = background.conformal_age();
        let curvature = background.curvature();
        let ang = thermo.angular_rescaling;

        // ═══ Grids ═══
        let l_grid = grid::multipole_grid(grid::global_l_max(output), precision, ang)?;
        let q_period = 2.0 * std::f64::consts::PI / (tau0 - thermo.tau_rec) * ang;
        let wavenumbers = grid::wavenumber_grid(
            q_period,
            curvature,
            WavenumberBounds {
                k_min: perturbations.k_min(),
                k_max: perturbations.k_max_cl(),
                vectors: output.vectors,
                tensors: output.tensors,
            },
            precision,
            ang,
        )?;
        let q = wavenumbers.q;
        info!(
            l_size = l_grid.len(),
            l_max = l_grid.last().copied().unwrap_or(0),
            q_size = q.len(),
            q_size_bound = wavenumbers.size_bound,
            index_q_flat_approximation = wavenumbers.index_q_flat_approximation,
            threads = rayon::current_num_threads(),
            "transfer grids"
        );

        // ═══ Types ═══
        let requested = [
            (Mode::Scalar, output.scalars),
            (Mode::Vector, output.vectors),
            (Mode::Tensor, output.tensors),
        ];
        let bins = config.selection.bin_count();
        let mut tables = Vec::new();
        for (mode, wanted) in requested {
            if !wanted {
                continue;
            }
            let types = TypeTable::new(mode, output, bins, precision, &l_grid)?;
            if types.is_empty() {
                debug!(?mode, "no transfer type requested for mode");
                continue;
            }
            tables.push(types);
        }

        // ═══ Selection windows ═══
        let needs_selection = output.scalars && (output.has_number_counts() || output.galaxy_lensing);
        let selection = if needs_selection {
            Some(Selection::new(&config.selection, precision)?)
        } else {
            None
        };
        let windows = match (&selection, tables.iter().find(|t| t.mode == Mode::Scalar)) {
            (Some(sel), Some(scalar)) => {
                debug!(bins, kind = ?sel.kind(), "precomputing selection windows");
                let tau_last = perturbations.tau.last().copied().unwrap_or(tau0);
                SelectionWindows::precompute(sel, scalar, background, precision, output.l_lss_max, tau_last)?
            }
            _ => SelectionWindows::default(),
        };

        // ═══ Sources ═══
        let k_max = perturbations.k_max_cl();
        let mut contexts = Vec::with_capacity(tables.len());
        for types in tables {
            let mode = types.mode;
            let mode_sources = perturbations.mode(mode).ok_or_else(|| {
                TransferError::InvalidInput(format!("no perturbation sources for {mode:?} mode"))
            })?;
            let source_index = types
                .types
                .iter()
                .map(|info| {
                    mode_sources.kind_index(info.source).ok_or(TransferError::MissingSource {
                        mode,
                        kind: info.source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let k_min = mode_sources.k.first().copied().unwrap_or(0.0);
            let k = grid::k_grid(&q, curvature, mode, k_min, k_max)?;
            let splined = SplinedSources::new(mode_sources, perturbations.tau.len(), nonlinear)?;
            debug!(
                ?mode,
                types = types.len(),
                l_size = types.l_size,
                ic_size = mode_sources.ic_size,
                "mode prepared"
            );
            contexts.push(ModeContext {
                k,
                k_max_cl: mode_sources.k_max_cl(),
                ic_size: mode_sources.ic_size,
                source_index,
                splined,
                types,
            });
        }

        // ═══ Shared flat kernel table ═══
        let q_last = q.last().copied().unwrap_or(0.0);
        let mut x_max = q_last * tau0;
        if curvature.sign() == -1 {
            let l_max = l_grid.last().copied().unwrap_or(0) as f64;
            let ratio = l_max / precision.hyper_flat_approximation_nu;
            x_max *= ratio / ratio.asinh() * OPEN_TABLE_MARGIN;
        }
        let flat_table = HyperTable::build(
            0,
            1.0,
            &l_grid,
            precision.hyper_x_min,
            x_max,
            precision.hyper_sampling_flat,
            precision.hyper_phi_min_abs,
        )?;
        debug!(x_max, l_size = flat_table.l_size(), "flat kernel table built");

        let adapter = SourceAdapter::new(
            &perturbations.tau,
            tau0,
            thermo.tau_rec,
            curvature,
            config.lcmb.clone(),
            &windows,
        )?;

        // ═══ Parallel region ═══
        let engine = Engine {
            modes: contexts,
            q: &q,
            index_q_flat_approximation: wavenumbers.index_q_flat_approximation,
            l: &l_grid,
            curvature,
            tau0,
            ra_rec: (tau0 - thermo.tau_rec) * ang,
            late_source_l: precision.transfer_neglect_late_source * ang,
            tau0_minus_tau_cut: tau0 - thermo.tau_cut,
            flat_table: &flat_table,
            adapter: &adapter,
            limber: LimberSwitch::new(precision, selection.as_ref()),
            limber_second_order: precision.limber_second_order,
            precision,
        };
        let columns = (0..q.len())
            .into_par_iter()
            .map(|index_q| engine.compute_for_q(index_q))
            .collect::<Result<Vec<_>, TransferError>>()?;

        let q_size = q.len();
        let modes = engine
            .modes
            .iter()
            .enumerate()
            .map(|(m, ctx)| {
                let len = ctx.column_len();
                let mut values = vec![0.0; len * q_size];
                for (index_q, per_mode) in columns.iter().enumerate() {
                    for (c, &v) in per_mode[m].iter().enumerate() {
                        values[c * q_size + index_q] = v;
                    }
                }
                ModeTable::new(ctx.types.clone(), ctx.k.clone(), ctx.ic_size, &q, values)
            })
            .collect::<Result<Vec<_>, TransferError>>()?;

        info!(
            modes = engine.modes.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "transfer table built"
        );
        Ok(Self {
            l: l_grid,
            q,
            index_q_flat_approximation: wavenumbers.index_q_flat_approximation,
            modes,
        })
    }

    // ═══ Accessors ═══

    /// Whether no mode was computed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Multipole grid.
    #[must_use]
    pub fn l(&self) -> &[usize] {
        &self.l
    }

    /// Wavenumber grid.
    #[must_use]
    pub fn q(&self) -> &[f64] {
        &self.q
    }

    /// First q index served by the rescaled flat kernel table.
    #[must_use]
    pub const fn index_q_flat_approximation(&self) -> usize {
        self.index_q_flat_approximation
    }

    /// Tables in storage order.
    #[must_use]
    pub fn modes(&self) -> &[ModeTable] {
        &self.modes
    }

    /// Table of `mode`, if computed.
    #[must_use]
    pub fn mode(&self, mode: Mode) -> Option<&ModeTable> {
        self.modes.iter().find(|m| m.mode() == mode)
    }

    /// Number of multipoles computed for `ty` of `mode`.
    #[must_use]
    pub fn l_size_for(&self, mode: Mode, ty: TransferType) -> Option<usize> {
        let table = self.mode(mode)?;
        let index_tt = table.types.index_of(ty)?;
        Some(table.types.types[index_tt].l_size)
    }

    /// Δ_l(q) over the q grid for one (mode, ic, type, l index).
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] for a mode, type or initial
    /// condition that was not computed and
    /// [`TransferError::MultipoleOutOfRange`] for an l index beyond the
    /// mode's l size.
    pub fn column(&self, mode: Mode, ic: usize, ty: TransferType, index_l: usize) -> Result<&[f64], TransferError> {
        let (table, start) = self.column_start(mode, ic, ty, index_l)?;
        Ok(&table.values[start..start + self.q.len()])
    }

    fn column_start(
        &self,
        mode: Mode,
        ic: usize,
        ty: TransferType,
        index_l: usize,
    ) -> Result<(&ModeTable, usize), TransferError> {
        let table = self
            .mode(mode)
            .ok_or_else(|| TransferError::InvalidInput(format!("{mode:?} mode was not computed")))?;
        let index_tt = table
            .types
            .index_of(ty)
            .ok_or_else(|| TransferError::InvalidInput(format!("{ty:?} was not computed for {mode:?} mode")))?;
        if ic >= table.ic_size {
            return Err(TransferError::InvalidInput(format!(
                "initial condition {ic} out of {} for {mode:?} mode",
                table.ic_size
            )));
        }
        let l_size = table.types.l_size;
        if index_l >= l_size {
            return Err(TransferError::MultipoleOutOfRange {
                requested: self.l.get(index_l).copied().unwrap_or(index_l),
                available: self.l.get(l_size.saturating_sub(1)).copied().unwrap_or(0),
            });
        }
        let start = ((ic * table.types.len() + index_tt) * l_size + index_l) * self.q.len();
        Ok((table, start))
    }

    /// Δ_l(q) at grid point `index_q`.
    ///
    /// # Errors
    ///
    /// As [`Self::column`], plus [`TransferError::InvalidInput`] for a q
    /// index beyond the grid.
    pub fn value(
        &self,
        mode: Mode,
        ic: usize,
        ty: TransferType,
        index_l: usize,
        index_q: usize,
    ) -> Result<f64, TransferError> {
        self.column(mode, ic, ty, index_l)?
            .get(index_q)
            .copied()
            .ok_or_else(|| TransferError::InvalidInput(format!("q index {index_q} beyond {}", self.q.len())))
    }

    /// Δ_l at an arbitrary wavenumber, from the cubic spline in q through
    /// the column.
    ///
    /// # Errors
    ///
    /// As [`Self::column`], plus [`TransferError::InterpolationOutOfRange`]
    /// for q outside the grid.
    pub fn lookup(&self, mode: Mode, ic: usize, ty: TransferType, index_l: usize, q: f64) -> Result<f64, TransferError> {
        let (table, start) = self.column_start(mode, ic, ty, index_l)?;
        let end = start + self.q.len();
        numerical::spline_eval(
            &self.q,
            &table.values[start..end],
            &table.second_derivatives[start..end],
            q,
            "transfer table in q",
        )
    }
}

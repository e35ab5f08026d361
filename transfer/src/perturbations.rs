// SPDX-License-Identifier: AGPL-3.0-only

//! Perturbation sources S(k, τ) and nonlinear corrections, as handed over
//! by the perturbation and nonlinear collaborators.
//!
//! Arrays are flat and indexed `[tau * k_size + k]`, with k running over
//! the mode's own k grid and τ over the shared time sampling.

use crate::error::TransferError;
use crate::modes::Mode;

/// Physical content of one perturbation source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Temperature monopole source.
    Temperature0,
    /// Temperature dipole source.
    Temperature1,
    /// Temperature quadrupole source.
    Temperature2,
    /// Polarization source.
    Polarisation,
    /// Total matter density contrast.
    DeltaM,
    /// Cold dark matter plus baryon density contrast.
    DeltaCb,
    /// Total matter velocity divergence.
    ThetaM,
    /// Cold dark matter plus baryon velocity divergence.
    ThetaCb,
    /// Metric potential φ.
    Phi,
    /// Conformal-time derivative of φ.
    PhiPrime,
    /// Weyl potential φ + ψ.
    PhiPlusPsi,
    /// Metric potential ψ.
    Psi,
}

impl SourceKind {
    /// Whether nonlinear corrections multiply this source.
    #[must_use]
    pub const fn is_nonlinear_corrected(self) -> bool {
        matches!(
            self,
            Self::DeltaM
                | Self::DeltaCb
                | Self::ThetaM
                | Self::ThetaCb
                | Self::Phi
                | Self::PhiPrime
                | Self::PhiPlusPsi
                | Self::Psi
        )
    }

    /// Whether the cold-dark-matter-plus-baryon correction applies rather
    /// than the total-matter one.
    #[must_use]
    pub const fn uses_cb_correction(self) -> bool {
        matches!(self, Self::DeltaCb | Self::ThetaCb)
    }
}

/// Sources of one mode.
#[derive(Clone, Debug)]
pub struct ModeSources {
    /// Mode described.
    pub mode: Mode,
    /// Strictly increasing k grid.
    pub k: Vec<f64>,
    /// Number of leading k values valid for angular spectra.
    pub k_size_cl: usize,
    /// Number of initial conditions.
    pub ic_size: usize,
    /// Source kinds in storage order.
    pub kinds: Vec<SourceKind>,
    /// `ic * kinds.len() + kind` → `[tau * k.len() + k]`.
    pub sources: Vec<Vec<f64>>,
}

impl ModeSources {
    /// Sources filled from a closure `f(ic, kind, tau, k)`.
    #[must_use]
    pub fn from_fn<F>(
        mode: Mode,
        k: Vec<f64>,
        ic_size: usize,
        kinds: Vec<SourceKind>,
        tau: &[f64],
        f: F,
    ) -> Self
    where
        F: Fn(usize, SourceKind, f64, f64) -> f64,
    {
        let mut sources = Vec::with_capacity(ic_size * kinds.len());
        for ic in 0..ic_size {
            for &kind in &kinds {
                let mut s = Vec::with_capacity(tau.len() * k.len());
                for &t in tau {
                    s.extend(k.iter().map(|&kv| f(ic, kind, t, kv)));
                }
                sources.push(s);
            }
        }
        Self {
            mode,
            k_size_cl: k.len(),
            k,
            ic_size,
            kinds,
            sources,
        }
    }

    /// Storage index of `kind`.
    #[must_use]
    pub fn kind_index(&self, kind: SourceKind) -> Option<usize> {
        self.kinds.iter().position(|&k| k == kind)
    }

    /// Source array of (ic, kind index).
    #[must_use]
    pub fn source(&self, ic: usize, tp: usize) -> &[f64] {
        &self.sources[ic * self.kinds.len() + tp]
    }

    /// Largest k valid for angular spectra.
    #[must_use]
    pub fn k_max_cl(&self) -> f64 {
        self.k
            .get(self.k_size_cl.saturating_sub(1))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Everything the perturbation collaborator provides.
#[derive(Clone, Debug)]
pub struct PerturbationSources {
    /// Strictly increasing conformal-time sampling shared by all modes.
    pub tau: Vec<f64>,
    /// Sources per computed mode.
    pub modes: Vec<ModeSources>,
}

impl PerturbationSources {
    /// Smallest k over all modes.
    #[must_use]
    pub fn k_min(&self) -> f64 {
        self.modes
            .iter()
            .filter_map(|m| m.k.first().copied())
            .fold(f64::INFINITY, f64::min)
    }

    /// Largest spectrum k over all modes.
    #[must_use]
    pub fn k_max_cl(&self) -> f64 {
        self.modes.iter().map(ModeSources::k_max_cl).fold(0.0, f64::max)
    }

    /// Sources of `mode`, if computed.
    #[must_use]
    pub fn mode(&self, mode: Mode) -> Option<&ModeSources> {
        self.modes.iter().find(|m| m.mode == mode)
    }

    /// Check grids and array sizes.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] on a non-increasing grid, a
    /// `k_size_cl` beyond the k grid or a source array of the wrong size.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.tau.len() < 2 || !self.tau.windows(2).all(|w| w[1] > w[0]) {
            return Err(TransferError::InvalidInput(
                "perturbation time sampling must be strictly increasing".into(),
            ));
        }
        for m in &self.modes {
            if m.k.len() < 2 || !m.k.windows(2).all(|w| w[1] > w[0]) {
                return Err(TransferError::InvalidInput(format!(
                    "{:?} k grid must be strictly increasing",
                    m.mode
                )));
            }
            if m.k_size_cl == 0 || m.k_size_cl > m.k.len() {
                return Err(TransferError::InvalidInput(format!(
                    "{:?} k_size_cl = {} for {} k values",
                    m.mode,
                    m.k_size_cl,
                    m.k.len()
                )));
            }
            let expected = self.tau.len() * m.k.len();
            if m.sources.len() != m.ic_size * m.kinds.len()
                || m.sources.iter().any(|s| s.len() != expected)
            {
                return Err(TransferError::InvalidInput(format!(
                    "{:?} source arrays do not match {} ic x {} kinds x {expected} samples",
                    m.mode,
                    m.ic_size,
                    m.kinds.len()
                )));
            }
        }
        Ok(())
    }
}

/// Multiplicative nonlinear corrections on the scalar k grid,
/// `[tau * k_size + k]`.
#[derive(Clone, Debug)]
pub struct NonlinearCorrections {
    /// Correction for total-matter sources.
    pub total_matter: Vec<f64>,
    /// Correction for cold-dark-matter-plus-baryon sources, if computed.
    pub cold_plus_baryon: Option<Vec<f64>>,
}

impl NonlinearCorrections {
    /// Correction table applying to `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::MissingSource`] if `kind` needs the
    /// cold-plus-baryon table and none was computed.
    pub fn for_kind(&self, kind: SourceKind) -> Result<&[f64], TransferError> {
        if kind.uses_cb_correction() {
            self.cold_plus_baryon
                .as_deref()
                .ok_or(TransferError::MissingSource {
                    mode: Mode::Scalar,
                    kind,
                })
        } else {
            Ok(&self.total_matter)
        }
    }
}

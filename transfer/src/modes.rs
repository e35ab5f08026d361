// SPDX-License-Identifier: AGPL-3.0-only

//! Modes, output types and the static per-type metadata table.
//!
//! Each [`TransferType`] of a mode is described once by a [`TypeInfo`]: its
//! category, redshift bin, perturbation source, radial kernel, multipole
//! range and the neglect/Limber rules that apply to it. The integration
//! code reads these fields instead of testing index ranges.

use crate::config::{OutputRequest, Precision};
use crate::error::TransferError;
use crate::grid;
use crate::perturbations::SourceKind;

/// Perturbation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Spin 0.
    Scalar,
    /// Spin 1.
    Vector,
    /// Spin 2.
    Tensor,
}

impl Mode {
    /// Spin weight m entering q² = k² + K(m+1).
    #[must_use]
    pub const fn spin(self) -> u8 {
        match self {
            Self::Scalar => 0,
            Self::Vector => 1,
            Self::Tensor => 2,
        }
    }
}

/// Generalized spherical Bessel combination convolved with a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RadialFunctionKind {
    /// Φ.
    ScalarTemperature0,
    /// √|K|/k Φ′.
    ScalarTemperature1,
    /// Second-derivative quadrupole combination.
    ScalarTemperature2,
    /// csc²-weighted spin-2 combination.
    ScalarPolarisationE,
    /// Vector dipole.
    VectorTemperature1,
    /// Vector quadrupole.
    VectorTemperature2,
    /// Vector E-polarization.
    VectorPolarisationE,
    /// Vector B-polarization.
    VectorPolarisationB,
    /// Tensor quadrupole.
    TensorTemperature2,
    /// Tensor E-polarization.
    TensorPolarisationE,
    /// Tensor B-polarization.
    TensorPolarisationB,
    /// Φ″ term of redshift-space distortions.
    NcRsd,
}

impl RadialFunctionKind {
    /// Whether a Limber formula is coded for this kernel.
    #[must_use]
    pub const fn has_limber(self) -> bool {
        matches!(
            self,
            Self::ScalarTemperature0 | Self::ScalarTemperature1 | Self::NcRsd
        )
    }
}

/// One output channel of a mode. Number-count and lensing types carry
/// their redshift bin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferType {
    /// Temperature monopole source.
    Temperature0,
    /// Temperature dipole source.
    Temperature1,
    /// Temperature quadrupole source.
    Temperature2,
    /// E-polarization.
    PolarisationE,
    /// B-polarization (vectors and tensors).
    PolarisationB,
    /// CMB lensing potential.
    CmbLensing,
    /// Number-count density.
    Density(usize),
    /// Number-count redshift-space distortion.
    Rsd(usize),
    /// First Doppler term.
    Doppler0(usize),
    /// Second Doppler term.
    Doppler1(usize),
    /// Number-count lensing convergence.
    NcLens(usize),
    /// ψ term at the source.
    Gr1(usize),
    /// φ term at the source.
    Gr2(usize),
    /// φ′ term at the source.
    Gr3(usize),
    /// Integrated φ + ψ term.
    Gr4(usize),
    /// Integrated (φ + ψ)′ term.
    Gr5(usize),
    /// Galaxy lensing potential.
    Lensing(usize),
}

impl TransferType {
    /// Redshift bin of a number-count or lensing type.
    #[must_use]
    pub const fn bin(self) -> Option<usize> {
        match self {
            Self::Density(b)
            | Self::Rsd(b)
            | Self::Doppler0(b)
            | Self::Doppler1(b)
            | Self::NcLens(b)
            | Self::Gr1(b)
            | Self::Gr2(b)
            | Self::Gr3(b)
            | Self::Gr4(b)
            | Self::Gr5(b)
            | Self::Lensing(b) => Some(b),
            _ => None,
        }
    }
}

/// How a type's source is sampled in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    /// Full perturbation time grid.
    Cmb,
    /// Times after recombination, times the lensing kernel.
    CmbLensing,
    /// Resampled across the selection window of the bin.
    NumberCountLocal,
    /// Resampled along the line of sight up to the bin.
    LineOfSight,
}

/// When the Limber approximation replaces quadrature, besides q beyond the
/// kernel table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimberRule {
    /// Only beyond the kernel table.
    Never,
    /// l above `l_switch_limber`.
    CmbLensing,
    /// l above the local threshold times the mean bin redshift; never for
    /// Dirac windows.
    Local,
    /// l above the line-of-sight threshold times the mean redshift; never
    /// for Dirac windows.
    LineOfSight,
    /// As `LineOfSight`, also for Dirac windows.
    LineOfSightAnyWindow,
}

/// Static description of one transfer type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TypeInfo {
    /// Output channel.
    pub ty: TransferType,
    /// Time sampling category.
    pub category: Category,
    /// Perturbation source convolved.
    pub source: SourceKind,
    /// Kernel convolved.
    pub radial: RadialFunctionKind,
    /// Physical maximum multipole.
    pub l_max: usize,
    /// Number of l-grid entries computed for this type.
    pub l_size: usize,
    /// δk of the "l far below q·r_rec" neglect rule, if it applies.
    pub neglect_delta_k: Option<f64>,
    /// Whether the late-time part of the source may be truncated at high l.
    pub late_source_negligible: bool,
    /// Limber switch.
    pub limber: LimberRule,
}

/// All types of one mode in iteration order.
#[derive(Clone, Debug)]
pub struct TypeTable {
    /// Mode described.
    pub mode: Mode,
    /// Types in storage order.
    pub types: Vec<TypeInfo>,
    /// Largest per-type l size.
    pub l_size: usize,
}

impl TypeTable {
    /// Enumerate the types of `mode` requested by `output`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::MultipoleOutOfRange`] if a type's l_max
    /// exceeds the last grid multipole.
    pub fn new(
        mode: Mode,
        output: &OutputRequest,
        bins: usize,
        precision: &Precision,
        l_grid: &[usize],
    ) -> Result<Self, TransferError> {
        let mut types = Vec::new();
        let mut push = |ty| types.push(describe(mode, ty, output, precision));

        if output.cmb_temperature {
            push(TransferType::Temperature2);
        }
        if output.cmb_polarization {
            push(TransferType::PolarisationE);
        }
        match mode {
            Mode::Scalar => {
                if output.cmb_temperature {
                    push(TransferType::Temperature0);
                    push(TransferType::Temperature1);
                }
                if output.cmb_lensing_potential {
                    push(TransferType::CmbLensing);
                }
                let mut per_bin = |make: fn(usize) -> TransferType| {
                    for b in 0..bins {
                        push(make(b));
                    }
                };
                if output.nc_density {
                    per_bin(TransferType::Density);
                }
                if output.nc_rsd {
                    per_bin(TransferType::Rsd);
                    per_bin(TransferType::Doppler0);
                    per_bin(TransferType::Doppler1);
                }
                if output.nc_lens {
                    per_bin(TransferType::NcLens);
                }
                if output.nc_gr {
                    per_bin(TransferType::Gr1);
                    per_bin(TransferType::Gr2);
                    per_bin(TransferType::Gr3);
                    per_bin(TransferType::Gr4);
                    per_bin(TransferType::Gr5);
                }
                if output.galaxy_lensing {
                    per_bin(TransferType::Lensing);
                }
            }
            Mode::Vector => {
                if output.cmb_temperature {
                    push(TransferType::Temperature1);
                }
                if output.cmb_polarization {
                    push(TransferType::PolarisationB);
                }
            }
            Mode::Tensor => {
                if output.cmb_polarization {
                    push(TransferType::PolarisationB);
                }
            }
        }

        let mut l_size = 0;
        for info in &mut types {
            info.l_size = grid::type_l_size(l_grid, info.l_max)?;
            l_size = l_size.max(info.l_size);
        }
        Ok(Self {
            mode,
            types,
            l_size,
        })
    }

    /// Number of types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the mode has no requested type.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Storage index of `ty`.
    #[must_use]
    pub fn index_of(&self, ty: TransferType) -> Option<usize> {
        self.types.iter().position(|info| info.ty == ty)
    }
}

fn describe(mode: Mode, ty: TransferType, output: &OutputRequest, p: &Precision) -> TypeInfo {
    use RadialFunctionKind as R;
    use SourceKind as S;
    use TransferType as T;

    let (category, source, radial) = match (mode, ty) {
        (Mode::Scalar, T::Temperature0) => (Category::Cmb, S::Temperature0, R::ScalarTemperature0),
        (Mode::Scalar, T::Temperature1) => (Category::Cmb, S::Temperature1, R::ScalarTemperature1),
        (Mode::Scalar, T::Temperature2) => (Category::Cmb, S::Temperature2, R::ScalarTemperature2),
        (Mode::Scalar, T::PolarisationE) => (Category::Cmb, S::Polarisation, R::ScalarPolarisationE),
        (Mode::Scalar, T::CmbLensing) => (Category::CmbLensing, S::PhiPlusPsi, R::ScalarTemperature0),
        (_, T::Density(_)) => (Category::NumberCountLocal, S::DeltaM, R::ScalarTemperature0),
        (_, T::Rsd(_)) => (Category::NumberCountLocal, S::ThetaM, R::NcRsd),
        (_, T::Doppler0(_)) => (Category::NumberCountLocal, S::ThetaM, R::ScalarTemperature0),
        (_, T::Doppler1(_)) => (Category::NumberCountLocal, S::ThetaM, R::ScalarTemperature1),
        (_, T::Gr1(_)) => (Category::NumberCountLocal, S::Psi, R::ScalarTemperature0),
        (_, T::Gr2(_)) => (Category::NumberCountLocal, S::Phi, R::ScalarTemperature0),
        (_, T::Gr3(_)) => (Category::NumberCountLocal, S::PhiPrime, R::ScalarTemperature0),
        (_, T::NcLens(_)) => (Category::LineOfSight, S::PhiPlusPsi, R::ScalarTemperature0),
        (_, T::Gr4(_)) => (Category::LineOfSight, S::PhiPlusPsi, R::ScalarTemperature0),
        (_, T::Gr5(_)) => (Category::LineOfSight, S::PhiPlusPsi, R::ScalarTemperature1),
        (_, T::Lensing(_)) => (Category::LineOfSight, S::PhiPlusPsi, R::ScalarTemperature0),
        (Mode::Vector, T::Temperature1) => (Category::Cmb, S::Temperature1, R::VectorTemperature1),
        (Mode::Vector, T::PolarisationE) => (Category::Cmb, S::Polarisation, R::VectorPolarisationE),
        (Mode::Vector, T::PolarisationB) => (Category::Cmb, S::Polarisation, R::VectorPolarisationB),
        (Mode::Vector, _) => (Category::Cmb, S::Temperature2, R::VectorTemperature2),
        (Mode::Tensor, T::PolarisationE) => (Category::Cmb, S::Polarisation, R::TensorPolarisationE),
        (Mode::Tensor, T::PolarisationB) => (Category::Cmb, S::Polarisation, R::TensorPolarisationB),
        (Mode::Tensor, _) => (Category::Cmb, S::Temperature2, R::TensorTemperature2),
        (Mode::Scalar, T::PolarisationB) => (Category::Cmb, S::Polarisation, R::ScalarPolarisationE),
    };

    let l_max = match (mode, category) {
        (Mode::Scalar, Category::Cmb | Category::CmbLensing) => output.l_scalar_max,
        (Mode::Scalar, _) => output.l_lss_max,
        (Mode::Vector, _) => output.l_vector_max,
        (Mode::Tensor, _) => output.l_tensor_max,
    };

    let neglect_delta_k = match (mode, ty) {
        (Mode::Scalar, T::Temperature0) => Some(p.transfer_neglect_delta_k_s_t0),
        (Mode::Scalar, T::Temperature1) => Some(p.transfer_neglect_delta_k_s_t1),
        (Mode::Scalar, T::Temperature2) => Some(p.transfer_neglect_delta_k_s_t2),
        (Mode::Scalar, T::PolarisationE) => Some(p.transfer_neglect_delta_k_s_e),
        (Mode::Vector, T::Temperature1) => Some(p.transfer_neglect_delta_k_v_t1),
        (Mode::Vector, T::Temperature2) => Some(p.transfer_neglect_delta_k_v_t2),
        (Mode::Vector, T::PolarisationE) => Some(p.transfer_neglect_delta_k_v_e),
        (Mode::Vector, T::PolarisationB) => Some(p.transfer_neglect_delta_k_v_b),
        (Mode::Tensor, T::Temperature2) => Some(p.transfer_neglect_delta_k_t_t2),
        (Mode::Tensor, T::PolarisationE) => Some(p.transfer_neglect_delta_k_t_e),
        (Mode::Tensor, T::PolarisationB) => Some(p.transfer_neglect_delta_k_t_b),
        _ => None,
    };

    let late_source_negligible = matches!(
        (mode, ty),
        (
            Mode::Scalar,
            T::Temperature1 | T::Temperature2 | T::PolarisationE
        ) | (
            Mode::Vector,
            T::Temperature1 | T::Temperature2 | T::PolarisationE | T::PolarisationB
        ) | (Mode::Tensor, T::PolarisationE | T::PolarisationB)
    );

    let limber = match ty {
        T::CmbLensing => LimberRule::CmbLensing,
        T::Density(_)
        | T::Rsd(_)
        | T::Doppler0(_)
        | T::Doppler1(_)
        | T::Gr1(_)
        | T::Gr2(_)
        | T::Gr3(_)
        | T::Gr5(_) => LimberRule::Local,
        T::NcLens(_) | T::Gr4(_) => LimberRule::LineOfSight,
        T::Lensing(_) => LimberRule::LineOfSightAnyWindow,
        _ => LimberRule::Never,
    };

    TypeInfo {
        ty,
        category,
        source,
        radial,
        l_max,
        l_size: 0,
        neglect_delta_k,
        late_source_negligible,
        limber,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn l_grid() -> Vec<usize> {
        grid::multipole_grid(3000, &Precision::default(), 1.0).unwrap()
    }

    #[test]
    fn scalar_cmb_order() {
        let out = OutputRequest {
            cmb_polarization: true,
            cmb_lensing_potential: true,
            ..OutputRequest::default()
        };
        let table = TypeTable::new(Mode::Scalar, &out, 1, &Precision::default(), &l_grid()).unwrap();
        let tys: Vec<_> = table.types.iter().map(|t| t.ty).collect();
        assert_eq!(
            tys,
            vec![
                TransferType::Temperature2,
                TransferType::PolarisationE,
                TransferType::Temperature0,
                TransferType::Temperature1,
                TransferType::CmbLensing,
            ]
        );
        assert_eq!(table.index_of(TransferType::CmbLensing), Some(4));
    }

    #[test]
    fn number_count_blocks_per_bin() {
        let out = OutputRequest {
            cmb_temperature: false,
            nc_density: true,
            nc_rsd: true,
            ..OutputRequest::default()
        };
        let table = TypeTable::new(Mode::Scalar, &out, 2, &Precision::default(), &l_grid()).unwrap();
        let tys: Vec<_> = table.types.iter().map(|t| t.ty).collect();
        assert_eq!(
            tys,
            vec![
                TransferType::Density(0),
                TransferType::Density(1),
                TransferType::Rsd(0),
                TransferType::Rsd(1),
                TransferType::Doppler0(0),
                TransferType::Doppler0(1),
                TransferType::Doppler1(0),
                TransferType::Doppler1(1),
            ]
        );
        assert!(table.types.iter().all(|t| t.l_max == out.l_lss_max));
        assert_eq!(table.types[2].radial, RadialFunctionKind::NcRsd);
    }

    #[test]
    fn tensor_types_and_kernels() {
        let out = OutputRequest {
            cmb_polarization: true,
            ..OutputRequest::default()
        };
        let table = TypeTable::new(Mode::Tensor, &out, 1, &Precision::default(), &l_grid()).unwrap();
        let kinds: Vec<_> = table.types.iter().map(|t| t.radial).collect();
        assert_eq!(
            kinds,
            vec![
                RadialFunctionKind::TensorTemperature2,
                RadialFunctionKind::TensorPolarisationE,
                RadialFunctionKind::TensorPolarisationB,
            ]
        );
        assert!(!table.types[0].late_source_negligible);
        assert!(table.types[1].late_source_negligible);
    }

    #[test]
    fn vector_b_uses_polarisation_source() {
        let out = OutputRequest {
            cmb_polarization: true,
            ..OutputRequest::default()
        };
        let table = TypeTable::new(Mode::Vector, &out, 1, &Precision::default(), &l_grid()).unwrap();
        let b = table.index_of(TransferType::PolarisationB).unwrap();
        assert_eq!(table.types[b].source, SourceKind::Polarisation);
        assert_eq!(table.types[b].neglect_delta_k, Some(1.0));
    }

    #[test]
    fn limber_rules() {
        let out = OutputRequest {
            cmb_lensing_potential: true,
            nc_gr: true,
            galaxy_lensing: true,
            ..OutputRequest::default()
        };
        let table = TypeTable::new(Mode::Scalar, &out, 1, &Precision::default(), &l_grid()).unwrap();
        let rule = |ty| table.types[table.index_of(ty).unwrap()].limber;
        assert_eq!(rule(TransferType::Temperature0), LimberRule::Never);
        assert_eq!(rule(TransferType::CmbLensing), LimberRule::CmbLensing);
        assert_eq!(rule(TransferType::Gr5(0)), LimberRule::Local);
        assert_eq!(rule(TransferType::Gr4(0)), LimberRule::LineOfSight);
        assert_eq!(rule(TransferType::Lensing(0)), LimberRule::LineOfSightAnyWindow);
    }

    #[test]
    fn type_l_size_within_grid() {
        let grid = l_grid();
        let out = OutputRequest {
            nc_density: true,
            ..OutputRequest::default()
        };
        let table = TypeTable::new(Mode::Scalar, &out, 1, &Precision::default(), &grid).unwrap();
        assert!(table.types.iter().all(|t| t.l_size <= grid.len()));
        assert_eq!(table.l_size, table.types.iter().map(|t| t.l_size).max().unwrap());
    }

    #[test]
    fn l_max_beyond_grid_is_fatal() {
        let grid = grid::multipole_grid(500, &Precision::default(), 1.0).unwrap();
        let out = OutputRequest {
            l_scalar_max: 1000,
            ..OutputRequest::default()
        };
        let err = TypeTable::new(Mode::Scalar, &out, 1, &Precision::default(), &grid).unwrap_err();
        assert!(matches!(err, TransferError::MultipoleOutOfRange { .. }));
    }
}

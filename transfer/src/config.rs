// SPDX-License-Identifier: AGPL-3.0-only

//! Build configuration: precision parameters, requested outputs and
//! redshift selection windows.
//!
//! Every struct deserializes from JSON with `#[serde(default)]`, so a config
//! file only needs the fields it changes. Defaults are the standard
//! precision settings.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Numerical precision parameters of the transfer build.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
#[must_use]
pub struct Precision {
    /// Logarithmic multipole step at low l (ratio between successive l).
    pub l_logstep: f64,
    /// Linear multipole step at high l.
    pub l_linstep: f64,

    /// Linear q step at high q, in units of the oscillation period.
    pub q_linstep: f64,
    /// Logarithmic q step at low q for spline-interpolated spectra.
    pub q_logstep_spline: f64,
    /// Power of the angular rescaling dividing `q_logstep_spline`.
    pub q_logstep_open: f64,
    /// Logarithmic step for the integer-nu regime of closed space.
    pub q_logstep_trapzd: f64,
    /// Number of steps blending the closed-space step into the generic law.
    pub q_numstep_transition: f64,

    /// nu above which curved kernels come from the rescaled flat table.
    pub hyper_flat_approximation_nu: f64,
    /// Smallest radial coordinate of any kernel table.
    pub hyper_x_min: f64,
    /// Samples per oscillation period of the flat table.
    pub hyper_sampling_flat: f64,
    /// Samples per period of curved tables with nu below `hyper_nu_sampling_step`.
    pub hyper_sampling_curved_low_nu: f64,
    /// Samples per period of curved tables with nu above `hyper_nu_sampling_step`.
    pub hyper_sampling_curved_high_nu: f64,
    /// nu separating the two curved sampling densities.
    pub hyper_nu_sampling_step: f64,
    /// Kernel magnitude below which Φ_l is treated as zero.
    pub hyper_phi_min_abs: f64,
    /// Bisection tolerance on the first non-negligible radial coordinate.
    pub hyper_x_tol: f64,

    /// Scalar temperature monopole neglect threshold.
    pub transfer_neglect_delta_k_s_t0: f64,
    /// Scalar temperature dipole neglect threshold.
    pub transfer_neglect_delta_k_s_t1: f64,
    /// Scalar temperature quadrupole neglect threshold.
    pub transfer_neglect_delta_k_s_t2: f64,
    /// Scalar E-polarization neglect threshold.
    pub transfer_neglect_delta_k_s_e: f64,
    /// Vector temperature dipole neglect threshold.
    pub transfer_neglect_delta_k_v_t1: f64,
    /// Vector temperature quadrupole neglect threshold.
    pub transfer_neglect_delta_k_v_t2: f64,
    /// Vector E-polarization neglect threshold.
    pub transfer_neglect_delta_k_v_e: f64,
    /// Vector B-polarization neglect threshold.
    pub transfer_neglect_delta_k_v_b: f64,
    /// Tensor temperature neglect threshold.
    pub transfer_neglect_delta_k_t_t2: f64,
    /// Tensor E-polarization neglect threshold.
    pub transfer_neglect_delta_k_t_e: f64,
    /// Tensor B-polarization neglect threshold.
    pub transfer_neglect_delta_k_t_b: f64,
    /// Multipole above which late sources are truncated (before rescaling).
    pub transfer_neglect_late_source: f64,

    /// CMB-lensing multipole above which the Limber formula is used.
    pub l_switch_limber: f64,
    /// Local number-count Limber switch per unit mean redshift.
    pub l_switch_limber_for_nc_local_over_z: f64,
    /// Line-of-sight number-count Limber switch per unit mean redshift.
    pub l_switch_limber_for_nc_los_over_z: f64,
    /// Use the second-order Limber expansion for the flat monopole kernel.
    pub limber_second_order: bool,

    /// Gaussian/top-hat window cut, in widths.
    pub selection_cut_at_sigma: f64,
    /// Minimum number of time samples across a selection window.
    pub selection_sampling: usize,
    /// Samples per kernel oscillation for local number-count sources.
    pub selection_sampling_bessel: f64,
    /// Samples per kernel oscillation for line-of-sight sources.
    pub selection_sampling_bessel_los: f64,
    /// Relative edge width of the smoothed top-hat.
    pub selection_tophat_edge: f64,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            l_logstep: 1.12,
            l_linstep: 40.0,
            q_linstep: 0.45,
            q_logstep_spline: 170.0,
            q_logstep_open: 6.0,
            q_logstep_trapzd: 20.0,
            q_numstep_transition: 250.0,
            hyper_flat_approximation_nu: 4000.0,
            hyper_x_min: 1.0e-5,
            hyper_sampling_flat: 8.0,
            hyper_sampling_curved_low_nu: 7.0,
            hyper_sampling_curved_high_nu: 3.5,
            hyper_nu_sampling_step: 1000.0,
            hyper_phi_min_abs: 1.0e-10,
            hyper_x_tol: 1.0e-4,
            transfer_neglect_delta_k_s_t0: 0.15,
            transfer_neglect_delta_k_s_t1: 0.04,
            transfer_neglect_delta_k_s_t2: 0.15,
            transfer_neglect_delta_k_s_e: 0.11,
            transfer_neglect_delta_k_v_t1: 1.0,
            transfer_neglect_delta_k_v_t2: 1.0,
            transfer_neglect_delta_k_v_e: 1.0,
            transfer_neglect_delta_k_v_b: 1.0,
            transfer_neglect_delta_k_t_t2: 0.2,
            transfer_neglect_delta_k_t_e: 0.25,
            transfer_neglect_delta_k_t_b: 0.1,
            transfer_neglect_late_source: 400.0,
            l_switch_limber: 10.0,
            l_switch_limber_for_nc_local_over_z: 100.0,
            l_switch_limber_for_nc_los_over_z: 30.0,
            limber_second_order: false,
            selection_cut_at_sigma: 5.0,
            selection_sampling: 50,
            selection_sampling_bessel: 20.0,
            selection_sampling_bessel_los: 10.0,
            selection_tophat_edge: 0.1,
        }
    }
}

/// Which modes and observables to compute.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
#[must_use]
pub struct OutputRequest {
    /// Scalar perturbations.
    pub scalars: bool,
    /// Vector perturbations.
    pub vectors: bool,
    /// Tensor perturbations.
    pub tensors: bool,
    /// CMB temperature.
    pub cmb_temperature: bool,
    /// CMB E (and, for vectors/tensors, B) polarization.
    pub cmb_polarization: bool,
    /// CMB lensing potential.
    pub cmb_lensing_potential: bool,
    /// Number-count density term.
    pub nc_density: bool,
    /// Number-count redshift-space distortion and Doppler terms.
    pub nc_rsd: bool,
    /// Number-count lensing convergence.
    pub nc_lens: bool,
    /// Number-count relativistic (gravitational potential) terms.
    pub nc_gr: bool,
    /// Galaxy lensing potential.
    pub galaxy_lensing: bool,
    /// Maximum multipole of scalar CMB outputs.
    pub l_scalar_max: usize,
    /// Maximum multipole of vector outputs.
    pub l_vector_max: usize,
    /// Maximum multipole of tensor outputs.
    pub l_tensor_max: usize,
    /// Maximum multipole of number counts and galaxy lensing.
    pub l_lss_max: usize,
}

impl Default for OutputRequest {
    fn default() -> Self {
        Self {
            scalars: true,
            vectors: false,
            tensors: false,
            cmb_temperature: true,
            cmb_polarization: false,
            cmb_lensing_potential: false,
            nc_density: false,
            nc_rsd: false,
            nc_lens: false,
            nc_gr: false,
            galaxy_lensing: false,
            l_scalar_max: 2500,
            l_vector_max: 500,
            l_tensor_max: 500,
            l_lss_max: 300,
        }
    }
}

impl OutputRequest {
    /// Whether any number-count term is requested.
    #[must_use]
    pub const fn has_number_counts(&self) -> bool {
        self.nc_density || self.nc_rsd || self.nc_lens || self.nc_gr
    }

    /// Whether anything at all is requested.
    #[must_use]
    pub const fn has_outputs(&self) -> bool {
        (self.scalars || self.vectors || self.tensors)
            && (self.cmb_temperature
                || self.cmb_polarization
                || self.cmb_lensing_potential
                || self.has_number_counts()
                || self.galaxy_lensing)
    }
}

/// Shape of the redshift selection window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SelectionKind {
    /// Infinitely thin shell at the mean redshift.
    Dirac,
    /// Normalized Gaussian in redshift.
    Gaussian,
    /// Top-hat with tanh-smoothed edges.
    TopHat,
}

impl FromStr for SelectionKind {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dirac" => Ok(Self::Dirac),
            "gaussian" => Ok(Self::Gaussian),
            "tophat" | "top-hat" | "top_hat" => Ok(Self::TopHat),
            _ => Err(TransferError::UnsupportedSelection(s.to_string())),
        }
    }
}

impl TryFrom<String> for SelectionKind {
    type Error = TransferError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SelectionKind> for String {
    fn from(kind: SelectionKind) -> Self {
        match kind {
            SelectionKind::Dirac => "dirac",
            SelectionKind::Gaussian => "gaussian",
            SelectionKind::TopHat => "tophat",
        }
        .to_string()
    }
}

/// Where a redshift distribution (or its evolution) comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedshiftDistribution {
    /// No multiplicative dN/dz.
    #[default]
    None,
    /// Analytic survey-like dN/dz.
    Analytic,
    /// Two-column (z, dN/dz) text file.
    File(PathBuf),
}

/// Redshift bins for number counts and galaxy lensing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
#[must_use]
pub struct SelectionConfig {
    /// Window shape shared by all bins.
    pub kind: SelectionKind,
    /// Mean redshift of each bin.
    pub mean: Vec<f64>,
    /// Width of each bin; a single entry applies to all bins.
    pub width: Vec<f64>,
    /// Galaxy bias of each bin; a single entry applies to all bins.
    pub bias: Vec<f64>,
    /// Magnification bias s of each bin; a single entry applies to all bins.
    pub magnification_bias: Vec<f64>,
    /// Multiplicative dN/dz.
    pub dndz: RedshiftDistribution,
    /// dN/dz used for the evolution bias.
    pub evolution: RedshiftDistribution,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            kind: SelectionKind::Gaussian,
            mean: vec![1.0],
            width: vec![0.1],
            bias: vec![1.0],
            magnification_bias: vec![0.0],
            dndz: RedshiftDistribution::None,
            evolution: RedshiftDistribution::None,
        }
    }
}

impl SelectionConfig {
    /// Number of redshift bins.
    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.mean.len()
    }

    /// Width of `bin`.
    #[must_use]
    pub fn width(&self, bin: usize) -> f64 {
        per_bin(&self.width, bin, 0.0)
    }

    /// Galaxy bias of `bin`.
    #[must_use]
    pub fn bias(&self, bin: usize) -> f64 {
        per_bin(&self.bias, bin, 1.0)
    }

    /// Magnification bias of `bin`.
    #[must_use]
    pub fn magnification_bias(&self, bin: usize) -> f64 {
        per_bin(&self.magnification_bias, bin, 0.0)
    }

    /// Whether an evolution bias term is available.
    #[must_use]
    pub fn has_evolution(&self) -> bool {
        self.evolution != RedshiftDistribution::None
    }

    /// Check per-bin vectors against the number of bins.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] for empty bins, a per-bin
    /// vector whose length is neither 1 nor the bin count, or a
    /// non-positive width on an extended window.
    pub fn validate(&self) -> Result<(), TransferError> {
        let n = self.bin_count();
        if n == 0 {
            return Err(TransferError::InvalidInput(
                "selection needs at least one bin".into(),
            ));
        }
        for (name, v) in [
            ("width", &self.width),
            ("bias", &self.bias),
            ("magnification_bias", &self.magnification_bias),
        ] {
            if v.len() > 1 && v.len() != n {
                return Err(TransferError::InvalidInput(format!(
                    "selection {name} has {} entries for {n} bins",
                    v.len()
                )));
            }
        }
        if self.kind != SelectionKind::Dirac && (0..n).any(|b| self.width(b) <= 0.0) {
            return Err(TransferError::InvalidInput(
                "extended selection windows need positive widths".into(),
            ));
        }
        Ok(())
    }
}

fn per_bin(values: &[f64], bin: usize, fallback: f64) -> f64 {
    match values {
        [] => fallback,
        [single] => *single,
        many => many.get(bin).copied().unwrap_or(fallback),
    }
}

/// Amplitude and tilt applied to the CMB lensing potential source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
#[must_use]
pub struct CmbLensingRescale {
    /// Overall amplitude.
    pub amplitude: f64,
    /// Tilt of the (k/pivot) power law.
    pub tilt: f64,
    /// Pivot wavenumber in 1/Mpc.
    pub pivot: f64,
}

impl Default for CmbLensingRescale {
    fn default() -> Self {
        Self {
            amplitude: 1.0,
            tilt: 0.0,
            pivot: 0.1,
        }
    }
}

impl CmbLensingRescale {
    /// Rescaling factor at wavenumber k.
    #[must_use]
    pub fn factor(&self, k: f64) -> f64 {
        self.amplitude * (k / self.pivot).powf(self.tilt)
    }
}

/// Complete configuration of one transfer build.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
#[must_use]
pub struct TransferConfig {
    /// Numerical precision.
    pub precision: Precision,
    /// Requested modes and observables.
    pub output: OutputRequest,
    /// Redshift bins.
    pub selection: SelectionConfig,
    /// CMB lensing rescaling.
    pub lcmb: CmbLensingRescale,
    /// Worker threads; `None` uses the global rayon pool.
    pub threads: Option<usize>,
}

impl TransferConfig {
    /// Parse a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Config`] if the JSON is malformed or names an
    /// unsupported selection kind.
    pub fn from_json_str(json: &str) -> Result<Self, TransferError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the file cannot be opened and
    /// [`TransferError::Config`] if it does not parse.
    pub fn from_json_file(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path).map_err(|source| TransferError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Transfer-function validation on an Einstein–de Sitter scenario
//!
//! Checks the sampling grids, the quadrature and Limber paths against
//! direct kernel evaluation, the selection-window normalization, and a
//! full parallel build with CMB, CMB-lensing, number-count and shear types.
//!
//! # Provenance
//!
//! Limber (1953) ApJ 117, 134; LoVerde & Afshordi (2008) PRD 78, 123506
//! for the l + ½ stationary point and its asymptotic accuracy.
//! Lesgourgues & Tram (2014) JCAP 09, 032 for hyperspherical Bessel
//! tables and the curvature rescaling.

use cosmic_transfer::config::{OutputRequest, SelectionConfig, SelectionKind};
use cosmic_transfer::grid::{self, WavenumberBounds};
use cosmic_transfer::hyperspherical::{phi_single, HyperTable};
use cosmic_transfer::integrate::{self, KernelQuery, SampledSource};
use cosmic_transfer::modes::RadialFunctionKind;
use cosmic_transfer::numerical;
use cosmic_transfer::radial::{KernelBranch, RadialCoordinates, RadialKernel};
use cosmic_transfer::selection::Selection;
use cosmic_transfer::tolerances::{
    EXACT_F64, HERMITE_CUBIC_ABS, K_MIN_ROUNDING, LIMBER_VS_QUADRATURE_REL, SELECTION_NORMALIZATION,
    WAVENUMBER_ROUND_TRIP_REL,
};
use cosmic_transfer::validation::ValidationHarness;
use cosmic_transfer::{
    Background, Curvature, EinsteinDeSitter, Mode, ModeSources, PerturbationSources, Precision, SourceKind,
    Thermodynamics, TransferConfig, TransferError, TransferTable,
};
use tracing_subscriber::EnvFilter;

const TAU0: f64 = 14_000.0;
const TAU_REC: f64 = 280.0;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Angular transfer functions — Einstein–de Sitter scenario    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut harness = ValidationHarness::new("transfer");

    check_grids(&mut harness);
    check_round_trip(&mut harness);
    if let Err(e) = check_kernel_paths(&mut harness) {
        println!("  kernel paths failed: {e}");
        harness.check_bool("kernel paths run", false);
    }
    if let Err(e) = check_selection(&mut harness) {
        println!("  selection failed: {e}");
        harness.check_bool("selection window builds", false);
    }
    if let Err(e) = check_full_build(&mut harness) {
        println!("  build failed: {e}");
        harness.check_bool("full build", false);
    }

    harness.finish();
}

/// [1] Wavenumber and multipole grids.
fn check_grids(harness: &mut ValidationHarness) {
    println!("[1] Sampling grids");
    let precision = Precision::default();
    let q_period = 2.0 * std::f64::consts::PI / (TAU0 - TAU_REC);
    let bounds = WavenumberBounds {
        k_min: 1e-4,
        k_max: 0.3,
        vectors: false,
        tensors: false,
    };
    match grid::wavenumber_grid(q_period, Curvature::FLAT, bounds, &precision, 1.0) {
        Ok(g) => {
            let q = &g.q;
            println!("  q: {} points in [{:.3e}, {:.3e}]", q.len(), q[0], q[q.len() - 1]);
            harness.check_bool("q grid strictly increasing", q.windows(2).all(|w| w[1] > w[0]));
            harness.check_abs("q_min", q[0], bounds.k_min, K_MIN_ROUNDING);
            harness.check_bool("q_max within bound", q[q.len() - 1] <= bounds.k_max);
            harness.check_bool("q size within preallocation", q.len() <= g.size_bound);
        }
        Err(e) => {
            println!("  wavenumber grid failed: {e}");
            harness.check_bool("q grid builds", false);
        }
    }
    match grid::multipole_grid(2500, &precision, 1.0) {
        Ok(l) => {
            println!("  l: {} points up to {}", l.len(), l[l.len() - 1]);
            harness.check_bool("l grid strictly increasing", l.windows(2).all(|w| w[1] > w[0]));
            harness.check_bool("l grid ends at l_max", l.last() == Some(&2500));
        }
        Err(e) => {
            println!("  multipole grid failed: {e}");
            harness.check_bool("l grid builds", false);
        }
    }
    println!();
}

/// [2] k(q) followed by q(k) for every curvature sign and spin.
fn check_round_trip(harness: &mut ValidationHarness) {
    println!("[2] k(q) round trip");
    let q: Vec<f64> = (1..=50).map(|i| 0.01 * f64::from(i)).collect();
    let mut worst: f64 = 0.0;
    let mut ok = true;
    for k_curv in [-1e-6, 0.0, 1e-6] {
        let curvature = Curvature::new(k_curv);
        for mode in [Mode::Scalar, Mode::Vector, Mode::Tensor] {
            match grid::k_grid(&q, curvature, mode, 0.0, 1.0) {
                Ok(k) => {
                    for (&qi, &ki) in q.iter().zip(&k) {
                        let back = grid::q_of_k(ki, curvature, mode);
                        worst = worst.max(((back - qi) / qi).abs());
                    }
                }
                Err(_) => ok = false,
            }
        }
    }
    println!("  worst relative error {worst:.2e}");
    harness.check_bool("k grids build for all curvatures and spins", ok);
    harness.check_upper("q round trip", worst, WAVENUMBER_ROUND_TRIP_REL);
    println!();
}

fn gaussian_source(k: f64, l: f64, width: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
    let centre = (l + 0.5) / k;
    let sigma = width * centre;
    let d: Vec<f64> = (0..n)
        .map(|i| 3.0 * centre * (1.0 - i as f64 / (n - 1) as f64))
        .collect();
    let s = d.iter().map(|x| (-0.5 * ((x - centre) / sigma).powi(2)).exp()).collect();
    (d, s)
}

fn quadrature(table: &HyperTable, index_l: usize, l: usize, k: f64, d: &[f64], s: &[f64]) -> Result<f64, TransferError> {
    let mut coords = RadialCoordinates::default();
    coords.update(d, k, Curvature::FLAT);
    let kernel = RadialKernel::new(table, KernelBranch::Flat, Curvature::FLAT, k, k);
    let weights = numerical::trapezoidal_weights(d);
    let mut radial = Vec::new();
    integrate::integrate(
        &kernel,
        KernelQuery {
            kind: RadialFunctionKind::ScalarTemperature0,
            index_l,
            l,
        },
        SampledSource {
            tau0_minus_tau: d,
            weights: &weights,
            values: s,
        },
        &coords,
        None,
        &mut radial,
    )
}

/// [3] Single-point quadrature, Limber against quadrature, and
/// continuity across the CMB-lensing switch.
fn check_kernel_paths(harness: &mut ValidationHarness) -> Result<(), TransferError> {
    println!("[3] Quadrature and Limber paths (flat, l = 100)");
    let l = 100;
    let k = 0.02;
    let table = HyperTable::build(0, 1.0, &[2, l], 1e-5, 3.0 * 100.5 + 1.0, 20.0, 1e-10)?;

    let d_star = [(l as f64 + 0.5) / k];
    let single = quadrature(&table, 1, l, k, &d_star, &[1.0])?;
    let direct = phi_single(0, 1.0, l, k * d_star[0]);
    let tabulated = table
        .evaluate(1, k * d_star[0], KernelBranch::Flat.order())?
        .phi;
    println!("  single point: {single:.8e}, j_l(l+½) = {direct:.8e}");
    harness.check_rel("single point = kernel value", single, tabulated, EXACT_F64);
    harness.check_abs("tabulated kernel vs recurrence", tabulated, direct, HERMITE_CUBIC_ABS);

    let (d, s) = gaussian_source(k, l as f64, 0.25, 4000);
    let quad = quadrature(&table, 1, l, k, &d, &s)?;
    let limber = integrate::limber(RadialFunctionKind::ScalarTemperature0, l as f64, k, Curvature::FLAT, &d, &s)?;
    let limber2 = integrate::limber2(l as f64, k, &d, &s)?;
    println!("  Gaussian source: quadrature {quad:.6e}, Limber {limber:.6e}, second order {limber2:.6e}");
    harness.check_rel("Limber vs quadrature (l=100)", limber, quad, LIMBER_VS_QUADRATURE_REL);
    harness.check_rel("second-order Limber vs quadrature (l=100)", limber2, quad, LIMBER_VS_QUADRATURE_REL);

    let switch = Precision::default().l_switch_limber as usize;
    let k = 0.005;
    for l in [switch, switch + 1] {
        let table = HyperTable::build(0, 1.0, &[2, l], 1e-5, 3.0 * (l as f64 + 0.5) + 1.0, 20.0, 1e-10)?;
        let (d, s) = gaussian_source(k, l as f64, 0.3, 3000);
        let quad = quadrature(&table, 1, l, k, &d, &s)?;
        let limber = integrate::limber(RadialFunctionKind::ScalarTemperature0, l as f64, k, Curvature::FLAT, &d, &s)?;
        println!("  l = {l}: quadrature {quad:.6e}, Limber {limber:.6e}");
        harness.check_rel(&format!("Limber continuity at l={l}"), limber, quad, LIMBER_VS_QUADRATURE_REL);
    }
    println!();
    Ok(())
}

/// [4] Gaussian selection window integrates to one.
fn check_selection(harness: &mut ValidationHarness) -> Result<(), TransferError> {
    println!("[4] Selection window normalization");
    let bg = EinsteinDeSitter::flat(TAU0);
    for kind in [SelectionKind::Gaussian, SelectionKind::TopHat] {
        let sel = Selection::new(
            &SelectionConfig {
                kind,
                mean: vec![1.0],
                width: vec![0.1],
                ..SelectionConfig::default()
            },
            &Precision::default(),
        )?;
        let times = sel.times(0, &bg)?;
        let d = sel.sampling(times, bg.conformal_age(), 400)?;
        let w = numerical::trapezoidal_weights(&d);
        let window = sel.compute(0, &d, &w, &bg)?;
        let norm = numerical::trapezoidal_integral(&window, &w);
        println!("  {kind:?}: ∫W dτ = {norm:.12}");
        harness.check_abs(&format!("{kind:?} window normalized"), norm, 1.0, SELECTION_NORMALIZATION);
    }
    println!();
    Ok(())
}

fn scenario_sources() -> PerturbationSources {
    let tau: Vec<f64> = (0..400)
        .map(|i| 200.0 + f64::from(i) * (TAU0 - 200.0) / 399.0)
        .collect();
    let k: Vec<f64> = (0..56).map(|i| 1e-4 * 1.15_f64.powi(i)).collect();
    let kinds = vec![
        SourceKind::Temperature0,
        SourceKind::Temperature1,
        SourceKind::Temperature2,
        SourceKind::DeltaM,
        SourceKind::PhiPlusPsi,
    ];
    let mode = ModeSources::from_fn(Mode::Scalar, k, 1, kinds, &tau, |_, kind, t, k| {
        let visibility = (-0.5 * ((t - TAU_REC) / 60.0).powi(2)).exp();
        let damping = 1.0 / (1.0 + (k / 0.05).powi(2));
        match kind {
            SourceKind::Temperature0 => visibility * damping * (k * 150.0).cos(),
            SourceKind::Temperature1 => visibility * damping * (k * 150.0).sin(),
            SourceKind::Temperature2 => 0.1 * visibility * damping,
            SourceKind::DeltaM => (t / TAU0).powi(2) * k * k / (k * k + 1e-4),
            _ => damping,
        }
    });
    PerturbationSources {
        tau,
        modes: vec![mode],
    }
}

/// [5] Full build: finiteness, exact zeros under the neglect rule, and
/// thread-count independence.
fn check_full_build(harness: &mut ValidationHarness) -> Result<(), TransferError> {
    println!("[5] Full parallel build");
    let bg = EinsteinDeSitter::flat(TAU0);
    let thermo = Thermodynamics {
        tau_rec: TAU_REC,
        angular_rescaling: 1.0,
        tau_cut: 2000.0,
    };
    let config = TransferConfig {
        output: OutputRequest {
            cmb_lensing_potential: true,
            nc_density: true,
            galaxy_lensing: true,
            l_scalar_max: 200,
            l_lss_max: 100,
            ..OutputRequest::default()
        },
        ..TransferConfig::default()
    };
    let sources = scenario_sources();
    let table = TransferTable::compute(&config, &bg, &thermo, &sources, None)?;
    let scalar = table
        .mode(Mode::Scalar)
        .ok_or_else(|| TransferError::InvalidInput("scalar mode missing from table".into()))?;
    println!(
        "  {} types × {} multipoles × {} wavenumbers",
        scalar.types.len(),
        scalar.types.l_size,
        table.q().len()
    );
    harness.check_bool("all values finite", scalar.values().iter().all(|v| v.is_finite()));
    harness.check_bool("table not identically zero", scalar.values().iter().any(|&v| v != 0.0));

    let ra_rec = (TAU0 - TAU_REC) * thermo.angular_rescaling;
    let mut neglected = 0_usize;
    let mut violations = 0_usize;
    for info in &scalar.types.types {
        for (index_l, &l) in table.l().iter().enumerate().take(info.l_size) {
            let column = table.column(Mode::Scalar, 0, info.ty, index_l)?;
            for (&q, &v) in table.q().iter().zip(column) {
                if integrate::can_be_neglected(info, q, l as f64, ra_rec) {
                    neglected += 1;
                    if v != 0.0 {
                        violations += 1;
                    }
                }
            }
        }
    }
    println!("  {neglected} entries under the neglect rule, {violations} non-zero");
    harness.check_bool("neglect rule gives exact zeros", neglected > 0 && violations == 0);

    let single_thread = TransferTable::compute(
        &TransferConfig {
            threads: Some(1),
            ..config.clone()
        },
        &bg,
        &thermo,
        &sources,
        None,
    )?;
    let same = single_thread
        .mode(Mode::Scalar)
        .is_some_and(|m| m.values() == scalar.values());
    harness.check_bool("thread count does not change values", same);
    println!();
    Ok(())
}

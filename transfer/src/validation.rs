// SPDX-License-Identifier: AGPL-3.0-only

//! Pass/fail harness for the validation binary.
//!
//! Checks are recorded with their observed value, reference and
//! tolerance; [`ValidationHarness::finish`] prints the banner summary and
//! exits 0 when everything passed, 1 otherwise.

use std::fmt::{self, Write as _};
use std::process;

/// How a check compares observed and reference values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToleranceMode {
    /// |observed − expected| < tolerance.
    Absolute,
    /// |observed − expected| / |expected| < tolerance.
    Relative,
    /// observed < threshold.
    UpperBound,
    /// A boolean property.
    Flag,
}

impl fmt::Display for ToleranceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absolute => "abs",
            Self::Relative => "rel",
            Self::UpperBound => "<",
            Self::Flag => "flag",
        })
    }
}

/// One recorded check.
#[derive(Clone, Debug)]
pub struct Check {
    /// Label printed in the summary.
    pub label: String,
    /// Outcome.
    pub passed: bool,
    /// Measured value.
    pub observed: f64,
    /// Reference value or threshold.
    pub expected: f64,
    /// Tolerance applied.
    pub tolerance: f64,
    /// Comparison used.
    pub mode: ToleranceMode,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let icon = if self.passed { "✓" } else { "✗" };
        match self.mode {
            ToleranceMode::Flag => write!(f, "  {icon} {}", self.label),
            mode => write!(
                f,
                "  {icon} {}: observed={:.6e}, expected={:.6e}, tol={:.2e} ({mode})",
                self.label, self.observed, self.expected, self.tolerance
            ),
        }
    }
}

/// Accumulates checks for one validation run.
#[derive(Debug, Default)]
#[must_use]
pub struct ValidationHarness {
    /// Run name.
    pub name: String,
    /// Checks in recording order.
    pub checks: Vec<Check>,
}

impl ValidationHarness {
    /// Empty harness.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            checks: Vec::new(),
        }
    }

    fn record(&mut self, label: &str, passed: bool, observed: f64, expected: f64, tolerance: f64, mode: ToleranceMode) {
        self.checks.push(Check {
            label: label.to_string(),
            passed,
            observed,
            expected,
            tolerance,
            mode,
        });
    }

    /// |observed − expected| < tolerance.
    pub fn check_abs(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let passed = (observed - expected).abs() < tolerance;
        self.record(label, passed, observed, expected, tolerance, ToleranceMode::Absolute);
    }

    /// Relative error below tolerance; an exactly zero reference falls back
    /// to the absolute error.
    pub fn check_rel(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let err = if expected == 0.0 {
            observed.abs()
        } else {
            ((observed - expected) / expected).abs()
        };
        self.record(label, err < tolerance, observed, expected, tolerance, ToleranceMode::Relative);
    }

    /// observed < threshold.
    pub fn check_upper(&mut self, label: &str, observed: f64, threshold: f64) {
        self.record(label, observed < threshold, observed, threshold, threshold, ToleranceMode::UpperBound);
    }

    /// A property that holds or not.
    pub fn check_bool(&mut self, label: &str, passed: bool) {
        self.record(label, passed, f64::from(u8::from(passed)), 1.0, 0.0, ToleranceMode::Flag);
    }

    /// Number of passed checks.
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// Number of checks.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Whether every check passed (vacuously true when empty).
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Banner, one line per check, and the verdict.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            s,
            "═══ {} validation: {}/{} checks passed ═══",
            self.name,
            self.passed_count(),
            self.total_count()
        );
        for check in &self.checks {
            let _ = writeln!(s, "{check}");
        }
        if self.all_passed() {
            s.push_str("ALL CHECKS PASSED");
        } else {
            let failed: Vec<&str> = self
                .checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| c.label.as_str())
                .collect();
            let _ = write!(s, "FAILED CHECKS: {}", failed.join(", "));
        }
        s
    }

    /// Print the summary and exit 0 if all checks passed, 1 otherwise.
    pub fn finish(&self) -> ! {
        println!();
        println!("{}", self.summary());
        process::exit(i32::from(!self.all_passed()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn counts_pass_and_fail() {
        let mut h = ValidationHarness::new("transfer");
        h.check_abs("exact", 1.0, 1.0, 1e-12);
        h.check_abs("far", 2.0, 1.0, 1e-3);
        h.check_upper("bound", 0.5, 1.0);
        h.check_bool("flag", true);
        assert_eq!(h.passed_count(), 3);
        assert_eq!(h.total_count(), 4);
        assert!(!h.all_passed());
    }

    #[test]
    fn relative_check_with_zero_reference() {
        let mut h = ValidationHarness::new("transfer");
        h.check_rel("zero", 1e-15, 0.0, 1e-10);
        h.check_rel("sign", 16.0, -16.0, 0.1);
        assert!(h.checks[0].passed);
        assert!(!h.checks[1].passed);
    }

    #[test]
    fn upper_bound_is_strict() {
        let mut h = ValidationHarness::new("transfer");
        h.check_upper("at", 1.0, 1.0);
        assert!(!h.checks[0].passed);
    }

    #[test]
    fn summary_lists_failures() {
        let mut h = ValidationHarness::new("limber");
        h.check_rel("continuity", 1.01, 1.0, 0.05);
        h.check_bool("zeros", false);
        let s = h.summary();
        assert!(s.contains("limber validation: 1/2"));
        assert!(s.contains("✗ zeros"));
        assert!(s.ends_with("FAILED CHECKS: zeros"));
    }

    #[test]
    fn empty_harness_passes() {
        let h = ValidationHarness::new("empty");
        assert!(h.all_passed());
        assert!(h.summary().contains("ALL CHECKS PASSED"));
    }

    #[test]
    fn mode_display() {
        assert_eq!(ToleranceMode::Relative.to_string(), "rel");
        assert_eq!(ToleranceMode::UpperBound.to_string(), "<");
    }
}

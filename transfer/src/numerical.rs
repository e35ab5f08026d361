// SPDX-License-Identifier: AGPL-3.0-only

//! Interpolation and quadrature primitives used throughout the build.
//!
//! Cubic splines use estimated end derivatives (slope of the parabola
//! through the three outermost points). Trapezoidal weights are the
//! absolute half-spacings, so they stay positive on decreasing abscissas
//! such as τ0 − τ.

use crate::error::TransferError;

/// Second derivatives of the cubic spline through (x, y).
///
/// # Errors
///
/// Returns [`TransferError::MalformedGrid`] for fewer than two points and
/// [`TransferError::ZeroBracketWidth`] for repeated abscissas.
pub fn spline_second_derivatives(x: &[f64], y: &[f64]) -> Result<Vec<f64>, TransferError> {
    let n = x.len();
    if n < 2 || y.len() != n {
        return Err(TransferError::MalformedGrid(format!(
            "spline needs matching abscissas and values, got {} and {}",
            n,
            y.len()
        )));
    }
    if let Some(i) = x.windows(2).position(|w| w[1] == w[0]) {
        return Err(TransferError::ZeroBracketWidth {
            what: "spline",
            index: i,
        });
    }
    if n == 2 {
        return Ok(vec![0.0; 2]);
    }

    let dy_first = {
        let (d1, d2) = (x[1] - x[0], x[2] - x[0]);
        (d2 * d2 * (y[1] - y[0]) - d1 * d1 * (y[2] - y[0])) / (d2 * d1 * (x[2] - x[1]))
    };
    let dy_last = {
        let (d1, d2) = (x[n - 2] - x[n - 1], x[n - 3] - x[n - 1]);
        (d2 * d2 * (y[n - 2] - y[n - 1]) - d1 * d1 * (y[n - 3] - y[n - 1]))
            / (d2 * d1 * (x[n - 3] - x[n - 2]))
    };

    let mut ddy = vec![0.0; n];
    let mut u = vec![0.0; n];
    ddy[0] = -0.5;
    u[0] = (3.0 / (x[1] - x[0])) * ((y[1] - y[0]) / (x[1] - x[0]) - dy_first);
    for i in 1..n - 1 {
        let sig = (x[i] - x[i - 1]) / (x[i + 1] - x[i - 1]);
        let p = sig * ddy[i - 1] + 2.0;
        ddy[i] = (sig - 1.0) / p;
        let slope_diff = (y[i + 1] - y[i]) / (x[i + 1] - x[i]) - (y[i] - y[i - 1]) / (x[i] - x[i - 1]);
        u[i] = (6.0 * slope_diff / (x[i + 1] - x[i - 1]) - sig * u[i - 1]) / p;
    }
    let h = x[n - 1] - x[n - 2];
    let un = (3.0 / h) * (dy_last - (y[n - 1] - y[n - 2]) / h);
    ddy[n - 1] = (un - 0.5 * u[n - 2]) / (0.5 * ddy[n - 2] + 1.0);
    for i in (0..n - 1).rev() {
        ddy[i] = ddy[i] * ddy[i + 1] + u[i];
    }
    Ok(ddy)
}

/// Spline every row of a `[row * x.len() + i]` table along x.
///
/// # Errors
///
/// Propagates [`spline_second_derivatives`] failures.
pub fn spline_rows(x: &[f64], table: &[f64]) -> Result<Vec<f64>, TransferError> {
    let mut out = Vec::with_capacity(table.len());
    for row in table.chunks(x.len()) {
        out.extend(spline_second_derivatives(x, row)?);
    }
    Ok(out)
}

/// Index i with x[i] <= x0 <= x[i+1] on an increasing grid.
///
/// # Errors
///
/// Returns [`TransferError::InterpolationOutOfRange`] outside [x[0], x[n−1]].
pub fn bracket(x: &[f64], x0: f64, what: &'static str) -> Result<usize, TransferError> {
    let n = x.len();
    if n < 2 || !(x0 >= x[0] && x0 <= x[n - 1]) {
        return Err(TransferError::InterpolationOutOfRange {
            what,
            x: x0,
            min: x.first().copied().unwrap_or(f64::NAN),
            max: x.last().copied().unwrap_or(f64::NAN),
        });
    }
    Ok(x.partition_point(|&v| v <= x0).clamp(1, n - 1) - 1)
}

/// Cubic-spline weights (a, b, c, d) such that
/// y(x0) = a y_i + b y_{i+1} + c y″_i + d y″_{i+1}.
///
/// # Errors
///
/// Returns [`TransferError::ZeroBracketWidth`] if x[i+1] == x[i].
pub fn spline_weights(x: &[f64], i: usize, x0: f64) -> Result<[f64; 4], TransferError> {
    let h = x[i + 1] - x[i];
    if h == 0.0 {
        return Err(TransferError::ZeroBracketWidth {
            what: "cubic spline",
            index: i,
        });
    }
    let b = (x0 - x[i]) / h;
    let a = 1.0 - b;
    let h2 = h * h / 6.0;
    Ok([a, b, (a * a * a - a) * h2, (b * b * b - b) * h2])
}

/// Evaluate the spline (x, y, y″) at x0.
///
/// # Errors
///
/// Returns an error outside the tabulated range or on a zero bracket.
pub fn spline_eval(
    x: &[f64],
    y: &[f64],
    ddy: &[f64],
    x0: f64,
    what: &'static str,
) -> Result<f64, TransferError> {
    let i = bracket(x, x0, what)?;
    let [a, b, c, d] = spline_weights(x, i, x0)?;
    Ok(a * y[i] + b * y[i + 1] + c * ddy[i] + d * ddy[i + 1])
}

/// Linear interpolation on an increasing grid.
///
/// # Errors
///
/// Returns an error outside the tabulated range or on a zero bracket.
pub fn linear_interpolate(x: &[f64], y: &[f64], x0: f64, what: &'static str) -> Result<f64, TransferError> {
    let i = bracket(x, x0, what)?;
    let h = x[i + 1] - x[i];
    if h == 0.0 {
        return Err(TransferError::ZeroBracketWidth { what, index: i });
    }
    let t = (x0 - x[i]) / h;
    Ok((1.0 - t) * y[i] + t * y[i + 1])
}

/// Trapezoidal weights for a monotonic grid; a single point gets weight 0.
#[must_use]
pub fn trapezoidal_weights(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => {
            let mut w = Vec::with_capacity(n);
            w.push(0.5 * (x[1] - x[0]).abs());
            w.extend(x.windows(3).map(|s| 0.5 * (s[2] - s[0]).abs()));
            w.push(0.5 * (x[n - 1] - x[n - 2]).abs());
            w
        }
    }
}

/// Σ f_i w_i.
#[must_use]
pub fn trapezoidal_integral(f: &[f64], w: &[f64]) -> f64 {
    f.iter().zip(w).map(|(f, w)| f * w).sum()
}

/// Σ f_i g_i w_i.
#[must_use]
pub fn trapezoidal_convolution(f: &[f64], g: &[f64], w: &[f64]) -> f64 {
    f.iter().zip(g).zip(w).map(|((f, g), w)| f * g * w).sum()
}

/// Value, first and second derivative at x of the parabola through
/// (x1, y1), (x2, y2), (x3, y3).
#[must_use]
pub fn parabola(x: f64, xs: [f64; 3], ys: [f64; 3]) -> (f64, f64, f64) {
    let [x1, x2, x3] = xs;
    let [y1, y2, y3] = ys;
    let f12 = (y2 - y1) / (x2 - x1);
    let f23 = (y3 - y2) / (x3 - x2);
    let c = (f23 - f12) / (x3 - x1);
    let y = y1 + f12 * (x - x1) + c * (x - x1) * (x - x2);
    let dy = f12 + c * (2.0 * x - x1 - x2);
    (y, dy, 2.0 * c)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tolerances::POLYNOMIAL_REPRODUCTION;
    use approx::assert_relative_eq;

    fn quadratic(x: f64) -> f64 {
        3.0 * x * x - 2.0 * x + 0.5
    }

    #[test]
    fn spline_reproduces_quadratic() {
        let x: Vec<f64> = [0.0, 0.3, 0.7, 1.5, 2.0, 3.1].to_vec();
        let y: Vec<f64> = x.iter().map(|&v| quadratic(v)).collect();
        let ddy = spline_second_derivatives(&x, &y).unwrap();
        for &d in &ddy {
            assert_relative_eq!(d, 6.0, max_relative = POLYNOMIAL_REPRODUCTION);
        }
        for x0 in [0.1, 1.0, 2.9] {
            let v = spline_eval(&x, &y, &ddy, x0, "test").unwrap();
            assert_relative_eq!(v, quadratic(x0), max_relative = POLYNOMIAL_REPRODUCTION);
        }
    }

    #[test]
    fn spline_of_sine_is_accurate() {
        let x: Vec<f64> = (0..=40).map(|i| f64::from(i) * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|v| v.sin()).collect();
        let ddy = spline_second_derivatives(&x, &y).unwrap();
        let v = spline_eval(&x, &y, &ddy, 1.234, "sine").unwrap();
        assert!((v - 1.234_f64.sin()).abs() < 1e-5);
    }

    #[test]
    fn spline_rows_splits_table() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let table: Vec<f64> = (0..2)
            .flat_map(|r| x.iter().map(move |&v| f64::from(r + 1) * v * v))
            .collect();
        let ddy = spline_rows(&x, &table).unwrap();
        assert_eq!(ddy.len(), 8);
        assert_relative_eq!(ddy[1], 2.0, max_relative = POLYNOMIAL_REPRODUCTION);
        assert_relative_eq!(ddy[5], 4.0, max_relative = POLYNOMIAL_REPRODUCTION);
    }

    #[test]
    fn repeated_abscissa_is_fatal() {
        let err = spline_second_derivatives(&[0.0, 1.0, 1.0], &[0.0, 1.0, 2.0]).unwrap_err();
        assert!(matches!(err, TransferError::ZeroBracketWidth { index: 1, .. }));
    }

    #[test]
    fn out_of_range_is_fatal() {
        let x = [1.0, 2.0, 3.0];
        assert!(linear_interpolate(&x, &[1.0, 2.0, 3.0], 3.5, "lin").is_err());
        assert!(bracket(&x, 0.5, "b").is_err());
        assert_eq!(bracket(&x, 3.0, "b").unwrap(), 1);
        assert_eq!(bracket(&x, 1.0, "b").unwrap(), 0);
    }

    #[test]
    fn linear_interpolation() {
        let v = linear_interpolate(&[0.0, 2.0, 4.0], &[1.0, 5.0, 0.0], 1.5, "lin").unwrap();
        assert_relative_eq!(v, 4.0);
    }

    #[test]
    fn weights_on_decreasing_grid() {
        let x = [10.0, 7.0, 3.0, 0.0];
        let w = trapezoidal_weights(&x);
        assert_eq!(w, vec![1.5, 3.5, 3.5, 1.5]);
        assert_relative_eq!(trapezoidal_integral(&[1.0; 4], &w), 10.0);
        assert_eq!(trapezoidal_weights(&[5.0]), vec![0.0]);
    }

    #[test]
    fn trapezoid_integrates_linear_exactly() {
        let x: Vec<f64> = [0.0, 0.5, 1.7, 2.0, 4.0].to_vec();
        let f: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let w = trapezoidal_weights(&x);
        assert_relative_eq!(trapezoidal_integral(&f, &w), 20.0, max_relative = 1e-14);
        assert_relative_eq!(
            trapezoidal_convolution(&f, &[1.0; 5], &w),
            20.0,
            max_relative = 1e-14
        );
    }

    #[test]
    fn parabola_is_exact_on_quadratics() {
        let xs = [0.2, 1.1, 2.5];
        let ys = xs.map(quadratic);
        let (y, dy, ddy) = parabola(1.7, xs, ys);
        assert_relative_eq!(y, quadratic(1.7), max_relative = POLYNOMIAL_REPRODUCTION);
        assert_relative_eq!(dy, 6.0 * 1.7 - 2.0, max_relative = POLYNOMIAL_REPRODUCTION);
        assert_relative_eq!(ddy, 6.0, max_relative = POLYNOMIAL_REPRODUCTION);
    }
}

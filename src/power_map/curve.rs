//! One-dimensional curves fitted through sparse calibration points.

use tracing::{debug, warn};

/// Highest polynomial degree the least squares fit will use.
pub const MAX_POLYNOMIAL_DEGREE: usize = 8;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum FitError {
    #[error("need at least {needed} points, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("got {x} x values and {y} y values")]
    LengthMismatch { x: usize, y: usize },
    #[error("x values must be strictly increasing")]
    NotIncreasing,
    #[error("input contains a value that is not a finite number")]
    NotFinite,
    #[error("the least squares system is rank deficient")]
    RankDeficient,
}

/// Fitting strategies, from the most to the least preferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Method {
    Spline,
    Polynomial,
    Linear,
}

pub enum Curve {
    Spline(NaturalSpline),
    Polynomial(Chebyshev),
    Linear(Linear),
}

impl Curve {
    /// Fit a curve through the points, starting with `preferred` and degrading towards
    /// [`Method::Linear`], which cannot fail.
    pub fn fit(xs: &[f64], ys: &[f64], preferred: Method) -> Curve {
        if preferred <= Method::Spline {
            match NaturalSpline::new(xs, ys) {
                Ok(spline) => return Curve::Spline(spline),
                Err(e) => debug!(
                    message = "spline fit failed, trying a polynomial",
                    error = (&e as &dyn std::error::Error)
                ),
            }
        }
        if preferred <= Method::Polynomial {
            let degree = MAX_POLYNOMIAL_DEGREE.min(xs.len().saturating_sub(1));
            match Chebyshev::fit(xs, ys, degree) {
                Ok(polynomial) => return Curve::Polynomial(polynomial),
                Err(e) => warn!(
                    message = "polynomial fit failed, interpolating linearly",
                    error = (&e as &dyn std::error::Error)
                ),
            }
        }
        Curve::Linear(Linear::new(xs, ys))
    }

    pub fn method(&self) -> Method {
        match self {
            Curve::Spline(_) => Method::Spline,
            Curve::Polynomial(_) => Method::Polynomial,
            Curve::Linear(_) => Method::Linear,
        }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        match self {
            Curve::Spline(s) => s.evaluate(x),
            Curve::Polynomial(p) => p.evaluate(x),
            Curve::Linear(l) => l.evaluate(x),
        }
    }
}

fn check_points(xs: &[f64], ys: &[f64], needed: usize) -> Result<(), FitError> {
    if xs.len() != ys.len() {
        return Err(FitError::LengthMismatch { x: xs.len(), y: ys.len() });
    }
    if xs.len() < needed {
        return Err(FitError::TooFewPoints { needed, got: xs.len() });
    }
    if !xs.iter().chain(ys).all(|v| v.is_finite()) {
        return Err(FitError::NotFinite);
    }
    Ok(())
}

/// Cubic spline with zero second derivative at both ends.
///
/// Outside of the knots the polynomial of the nearest interval is extended.
pub struct NaturalSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Second derivative at each knot.
    m: Vec<f64>,
}

impl NaturalSpline {
    pub fn new(xs: &[f64], ys: &[f64]) -> Result<Self, FitError> {
        check_points(xs, ys, 2)?;
        if xs.windows(2).any(|w| w[1] <= w[0]) {
            return Err(FitError::NotIncreasing);
        }
        let n = xs.len();
        let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
        let slope: Vec<f64> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / h[i]).collect();
        let mut m = vec![0.0; n];
        if n > 2 {
            // Tridiagonal system for the interior knots, solved with the Thomas algorithm. It is
            // strictly diagonally dominant, so no pivoting is needed.
            let interior = n - 2;
            let mut diagonal = Vec::with_capacity(interior);
            let mut rhs = Vec::with_capacity(interior);
            for i in 1..n - 1 {
                diagonal.push(2.0 * (h[i - 1] + h[i]));
                rhs.push(6.0 * (slope[i] - slope[i - 1]));
            }
            for k in 1..interior {
                let factor = h[k] / diagonal[k - 1];
                diagonal[k] -= factor * h[k];
                rhs[k] -= factor * rhs[k - 1];
            }
            m[interior] = rhs[interior - 1] / diagonal[interior - 1];
            for k in (0..interior - 1).rev() {
                m[k + 1] = (rhs[k] - h[k + 1] * m[k + 2]) / diagonal[k];
            }
        }
        if !m.iter().all(|v| v.is_finite()) {
            return Err(FitError::NotFinite);
        }
        Ok(Self { xs: xs.to_vec(), ys: ys.to_vec(), m })
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let last_interval = self.xs.len() - 2;
        let i = self.xs.partition_point(|knot| *knot <= x).saturating_sub(1).min(last_interval);
        let h = self.xs[i + 1] - self.xs[i];
        let t = x - self.xs[i];
        let (m0, m1) = (self.m[i], self.m[i + 1]);
        let b = (self.ys[i + 1] - self.ys[i]) / h - h * (2.0 * m0 + m1) / 6.0;
        self.ys[i] + t * (b + t * (m0 / 2.0 + t * (m1 - m0) / (6.0 * h)))
    }
}

/// Least squares fit in the Chebyshev basis over the span of the x values.
pub struct Chebyshev {
    domain: (f64, f64),
    coefficients: Vec<f64>,
}

impl Chebyshev {
    pub fn fit(xs: &[f64], ys: &[f64], degree: usize) -> Result<Self, FitError> {
        check_points(xs, ys, degree + 1)?;
        let (low, high) = xs
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
        if high <= low {
            return Err(FitError::RankDeficient);
        }
        let domain = (low, high);
        let columns = degree + 1;
        let mut a: Vec<Vec<f64>> = xs
            .iter()
            .map(|&x| {
                let mut row = vec![0.0; columns];
                let u = map_to_window(domain, x);
                let (mut previous, mut current) = (1.0, u);
                row[0] = 1.0;
                for column in 1..columns {
                    row[column] = current;
                    (previous, current) = (current, 2.0 * u * current - previous);
                }
                row
            })
            .collect();
        let mut b = ys.to_vec();
        let coefficients = least_squares(&mut a, &mut b, columns)?;
        Ok(Self { domain, coefficients })
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let u = map_to_window(self.domain, x);
        // Clenshaw recurrence.
        let (mut b1, mut b2) = (0.0, 0.0);
        for &c in self.coefficients.iter().skip(1).rev() {
            (b1, b2) = (2.0 * u * b1 - b2 + c, b1);
        }
        self.coefficients[0] + u * b1 - b2
    }
}

fn map_to_window((low, high): (f64, f64), x: f64) -> f64 {
    (2.0 * x - (low + high)) / (high - low)
}

/// Solve the overdetermined `a · c = b` with Householder reflections. Destroys both inputs.
fn least_squares(a: &mut [Vec<f64>], b: &mut [f64], columns: usize) -> Result<Vec<f64>, FitError> {
    let rows = a.len();
    let scale = a.iter().flatten().fold(0.0f64, |m, v| m.max(v.abs()));
    let tolerance = scale * 1e-10;
    for k in 0..columns {
        let norm = (k..rows).map(|i| a[i][k] * a[i][k]).sum::<f64>().sqrt();
        if norm <= tolerance {
            return Err(FitError::RankDeficient);
        }
        let alpha = if a[k][k] > 0.0 { -norm } else { norm };
        let mut v: Vec<f64> = (k..rows).map(|i| a[i][k]).collect();
        v[0] -= alpha;
        let v_norm_sq: f64 = v.iter().map(|x| x * x).sum();
        if v_norm_sq == 0.0 {
            continue;
        }
        for j in k..columns {
            let dot: f64 = (k..rows).map(|i| v[i - k] * a[i][j]).sum();
            let f = 2.0 * dot / v_norm_sq;
            for i in k..rows {
                a[i][j] -= f * v[i - k];
            }
        }
        let dot: f64 = (k..rows).map(|i| v[i - k] * b[i]).sum();
        let f = 2.0 * dot / v_norm_sq;
        for i in k..rows {
            b[i] -= f * v[i - k];
        }
    }
    let mut c = vec![0.0; columns];
    for k in (0..columns).rev() {
        let tail: f64 = (k + 1..columns).map(|j| a[k][j] * c[j]).sum();
        c[k] = (b[k] - tail) / a[k][k];
    }
    if !c.iter().all(|v| v.is_finite()) {
        return Err(FitError::NotFinite);
    }
    Ok(c)
}

/// Piecewise linear interpolation that holds the end values outside of the points.
pub struct Linear {
    points: Vec<(f64, f64)>,
}

impl Linear {
    pub fn new(xs: &[f64], ys: &[f64]) -> Self {
        let mut points: Vec<(f64, f64)> = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| (x, y))
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let (Some(&(x0, y0)), Some(&(xn, yn))) = (self.points.first(), self.points.last()) else {
            return 0.0;
        };
        if x <= x0 {
            return y0;
        }
        if x >= xn {
            return yn;
        }
        let i = self.points.partition_point(|(px, _)| *px <= x);
        let (xa, ya) = self.points[i - 1];
        let (xb, yb) = self.points[i];
        if xb == xa {
            return yb;
        }
        ya + (yb - ya) * (x - xa) / (xb - xa)
    }
}

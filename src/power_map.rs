//! Maximum heating power of the heat pump as a function of outside and flow temperature.
//!
//! The manufacturer publishes the available power at a handful of outside temperatures for two
//! flow temperatures. [`PowerSurface`] turns those sparse points into a dense table that can be
//! queried for any pair of temperatures.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub mod curve;

use curve::{Curve, Method};

/// Lowest outside temperature covered by the surface, in °C.
pub const OUTSIDE_MIN: f64 = -30.0;
/// Highest outside temperature covered by the surface, in °C.
pub const OUTSIDE_MAX: f64 = 40.0;
/// Number of evenly spaced outside temperatures the surface is sampled at.
pub const OUTSIDE_SAMPLES: usize = 71;
/// Default number of flow temperature rows.
pub const DEFAULT_STEPS: usize = 21;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the calibration file at {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not write the calibration file at {1:?}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("calibration file at {1:?} is malformed")]
    Parse(#[source] serde_json::Error, PathBuf),
    #[error("could not serialize the calibration")]
    Serialize(#[source] serde_json::Error),
    #[error("need at least two outside temperatures, got {0}")]
    TooFewPoints(usize),
    #[error("power row {row} has {got} values for {expected} outside temperatures")]
    RowLength { row: usize, got: usize, expected: usize },
    #[error("calibration contains a value that is not a finite number")]
    NotFinite,
    #[error("both flow temperatures are {0} °C")]
    FlowTemperaturesEqual(f64),
}

/// Sparse power measurements.
///
/// `known_y[i][j]` is the power in watts at outside temperature `known_x[j]` and flow temperature
/// `known_t[i]`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "UncheckedCalibration")]
pub struct Calibration {
    known_x: Vec<f64>,
    known_y: [Vec<f64>; 2],
    known_t: [f64; 2],
}

#[derive(serde::Deserialize)]
struct UncheckedCalibration {
    known_x: Vec<f64>,
    known_y: [Vec<f64>; 2],
    known_t: [f64; 2],
}

impl TryFrom<UncheckedCalibration> for Calibration {
    type Error = Error;
    fn try_from(v: UncheckedCalibration) -> Result<Self, Self::Error> {
        Self::new(v.known_x, v.known_y, v.known_t)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        let known_x = vec![
            -30.0, -25.0, -22.0, -20.0, -15.0, -10.0, -5.0, 0.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0,
            35.0, 40.0,
        ];
        let flow_35 = vec![
            5700.0, 5700.0, 5700.0, 5700.0, 6290.0, 7580.0, 8660.0, 9625.0, 10300.0, 10580.0,
            10750.0, 10790.0, 10830.0, 11000.0, 11000.0, 11000.0,
        ];
        let flow_55 = vec![
            5700.0, 5700.0, 5700.0, 5700.0, 6860.0, 7300.0, 8150.0, 9500.0, 10300.0, 10580.0,
            10750.0, 10790.0, 10830.0, 11000.0, 11000.0, 11000.0,
        ];
        Self { known_x, known_y: [flow_35, flow_55], known_t: [35.0, 55.0] }
    }
}

impl Calibration {
    pub fn new(
        known_x: Vec<f64>,
        known_y: [Vec<f64>; 2],
        known_t: [f64; 2],
    ) -> Result<Self, Error> {
        if known_x.len() < 2 {
            return Err(Error::TooFewPoints(known_x.len()));
        }
        for (row, values) in known_y.iter().enumerate() {
            if values.len() != known_x.len() {
                return Err(Error::RowLength { row, got: values.len(), expected: known_x.len() });
            }
        }
        let mut all = known_x.iter().chain(known_y.iter().flatten()).chain(&known_t);
        if !all.all(|v| v.is_finite()) {
            return Err(Error::NotFinite);
        }
        if known_t[0] == known_t[1] {
            return Err(Error::FlowTemperaturesEqual(known_t[0]));
        }
        Ok(Self { known_x, known_y, known_t })
    }

    pub fn known_x(&self) -> &[f64] {
        &self.known_x
    }

    pub fn known_y(&self) -> &[Vec<f64>; 2] {
        &self.known_y
    }

    pub fn known_t(&self) -> [f64; 2] {
        self.known_t
    }

    pub async fn load(path: &Path) -> Result<Self, Error> {
        let contents =
            tokio::fs::read(path).await.map_err(|e| Error::Read(e, path.to_path_buf()))?;
        serde_json::from_slice(&contents).map_err(|e| Error::Parse(e, path.to_path_buf()))
    }

    pub async fn store(&self, path: &Path) -> Result<(), Error> {
        let mut contents = serde_json::to_vec_pretty(self).map_err(Error::Serialize)?;
        contents.push(b'\n');
        tokio::fs::write(path, contents).await.map_err(|e| Error::Write(e, path.to_path_buf()))
    }

    /// Load the calibration at `path`, falling back to the built-in one on any failure.
    ///
    /// A missing file is created with the built-in calibration so that it can be edited later.
    /// An existing file is never overwritten.
    pub async fn load_or_default(path: &Path) -> Self {
        let error = match Self::load(path).await {
            Ok(calibration) => {
                debug!(message = "loaded calibration", path = %path.display());
                return calibration;
            }
            Err(e) => e,
        };
        let calibration = Self::default();
        match &error {
            Error::Read(io, _) if io.kind() == std::io::ErrorKind::NotFound => {
                match calibration.store(path).await {
                    Ok(()) => {
                        info!(message = "wrote default calibration", path = %path.display())
                    }
                    Err(e) => warn!(
                        message = "could not persist default calibration",
                        error = (&e as &dyn std::error::Error)
                    ),
                }
            }
            _ => warn!(
                message = "using default calibration",
                error = (&error as &dyn std::error::Error)
            ),
        }
        calibration
    }
}

/// Dense table of maximum heating power in watts.
///
/// Rows are flow temperatures, evenly spaced from the first to the second calibration flow
/// temperature. Each row is a curve fitted through calibration points interpolated between the
/// two measured rows. Columns are outside temperatures from [`OUTSIDE_MIN`] to [`OUTSIDE_MAX`] in
/// steps of one degree.
#[derive(Clone, Debug)]
pub struct PowerSurface {
    known_t: [f64; 2],
    rows: Vec<[f64; OUTSIDE_SAMPLES]>,
    methods: Vec<Method>,
}

impl PowerSurface {
    pub fn build(calibration: &Calibration, steps: usize) -> Self {
        Self::build_with(calibration, steps, Method::Spline)
    }

    /// Like [`PowerSurface::build`], but starting the curve fit at `preferred`.
    pub fn build_with(calibration: &Calibration, steps: usize, preferred: Method) -> Self {
        let steps = steps.max(2);
        let xs = calibration.known_x();
        let [low, high] = calibration.known_y();
        let last = (steps - 1) as f64;
        let (rows, methods): (Vec<_>, Vec<_>) = (0..steps)
            .map(|row| {
                let f = row as f64 / last;
                let ys: Vec<f64> =
                    low.iter().zip(high).map(|(a, b)| a * (1.0 - f) + b * f).collect();
                resample(xs, &ys, preferred)
            })
            .unzip();
        debug!(message = "built power surface", steps, method = %methods[0]);
        Self { known_t: calibration.known_t(), rows, methods }
    }

    /// Maximum power at the given temperatures.
    ///
    /// Temperatures outside of the surface are clamped to its edges. The lookup picks the sample
    /// at or below the requested temperature rather than interpolating between samples.
    pub fn query(&self, outside: f64, flow: f64) -> f64 {
        let last_column = (OUTSIDE_SAMPLES - 1) as f64;
        let column = ((outside - OUTSIDE_MIN) * last_column / (OUTSIDE_MAX - OUTSIDE_MIN))
            .floor()
            .clamp(0.0, last_column) as usize;
        let last_row = (self.rows.len() - 1) as f64;
        let [t0, t1] = self.known_t;
        let row = ((flow - t0) * last_row / (t1 - t0)).floor().clamp(0.0, last_row) as usize;
        self.rows[row][column]
    }

    pub fn rows(&self) -> &[[f64; OUTSIDE_SAMPLES]] {
        &self.rows
    }

    /// Fitting method that ended up being used for each row.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn flow_temperature(&self, row: usize) -> f64 {
        let [t0, t1] = self.known_t;
        t0 + (t1 - t0) * row as f64 / (self.rows.len() - 1) as f64
    }

    pub fn outside_temperature(column: usize) -> f64 {
        OUTSIDE_MIN + (OUTSIDE_MAX - OUTSIDE_MIN) * column as f64 / (OUTSIDE_SAMPLES - 1) as f64
    }
}

fn resample(xs: &[f64], ys: &[f64], preferred: Method) -> ([f64; OUTSIDE_SAMPLES], Method) {
    let sample = |curve: &Curve| -> [f64; OUTSIDE_SAMPLES] {
        std::array::from_fn(|c| curve.evaluate(PowerSurface::outside_temperature(c)))
    };
    let curve = Curve::fit(xs, ys, preferred);
    let samples = sample(&curve);
    if samples.iter().all(|v| v.is_finite()) {
        return (samples, curve.method());
    }
    warn!(message = "fitted curve is not finite, interpolating linearly", method = %curve.method());
    (sample(&Curve::fit(xs, ys, Method::Linear)), Method::Linear)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knots_are_reproduced() {
        let calibration = Calibration::default();
        let surface = PowerSurface::build(&calibration, DEFAULT_STEPS);
        assert!(surface.methods().iter().all(|m| *m == Method::Spline));
        assert_eq!(surface.rows().len(), DEFAULT_STEPS);
        for (row, ys) in [0, DEFAULT_STEPS - 1].into_iter().zip(calibration.known_y()) {
            for (x, y) in calibration.known_x().iter().zip(ys) {
                let column = (x - OUTSIDE_MIN) as usize;
                let got = surface.rows()[row][column];
                assert!((got - y).abs() < 1e-6, "row {row} at {x} °C: {got} != {y}");
            }
        }
    }

    #[test]
    fn queries() {
        let surface = PowerSurface::build(&Calibration::default(), DEFAULT_STEPS);
        assert!((surface.query(35.0, 35.0) - 11000.0).abs() < 1e-6);
        assert!((surface.query(35.0, 55.0) - 11000.0).abs() < 1e-6);
        assert!((surface.query(-10.0, 35.0) - 7580.0).abs() < 1e-6);
        assert!((surface.query(-10.0, 55.0) - 7300.0).abs() < 1e-6);
        // Halfway between the flow temperatures lands on the middle row.
        assert_eq!(surface.query(-10.0, 45.0), surface.rows()[10][20]);
        assert_eq!(surface.flow_temperature(10), 45.0);
    }

    #[test]
    fn queries_clamp_to_the_edges() {
        let surface = PowerSurface::build(&Calibration::default(), DEFAULT_STEPS);
        assert_eq!(surface.query(-999.0, 35.0), surface.query(-30.0, 35.0));
        assert_eq!(surface.query(999.0, 55.0), surface.query(40.0, 55.0));
        assert_eq!(surface.query(-999.0, 45.0), surface.query(-30.0, 45.0));
        assert_eq!(surface.query(999.0, 45.0), surface.query(40.0, 45.0));
        assert_eq!(surface.query(0.0, -100.0), surface.query(0.0, 35.0));
        assert_eq!(surface.query(0.0, 100.0), surface.query(0.0, 55.0));
        assert!(surface.query(f64::NAN, f64::NAN).is_finite());
    }

    #[test]
    fn degenerate_steps() {
        let surface = PowerSurface::build(&Calibration::default(), 0);
        assert_eq!(surface.rows().len(), 2);
        assert!((surface.query(0.0, 55.0) - 9500.0).abs() < 1e-6);
    }

    #[test]
    fn fallback_methods_still_produce_a_surface() {
        let calibration = Calibration::default();
        for method in [Method::Polynomial, Method::Linear] {
            let surface = PowerSurface::build_with(&calibration, DEFAULT_STEPS, method);
            assert!(surface.methods().iter().all(|m| *m == method));
            assert!(surface.rows().iter().flatten().all(|v| v.is_finite()));
        }
        let linear = PowerSurface::build_with(&calibration, DEFAULT_STEPS, Method::Linear);
        assert_eq!(linear.query(-999.0, 35.0), 5700.0);
        assert_eq!(linear.query(2.0, 35.0), 9625.0 + (10300.0 - 9625.0) * 2.0 / 5.0);
    }

    #[test]
    fn unsorted_calibration_does_not_use_a_spline() {
        let calibration = Calibration::new(
            vec![10.0, 0.0, -10.0],
            [vec![9000.0, 8000.0, 7000.0], vec![8500.0, 7500.0, 6500.0]],
            [35.0, 55.0],
        )
        .unwrap();
        let surface = PowerSurface::build(&calibration, 3);
        assert!(surface.methods().iter().all(|m| *m == Method::Polynomial));
        assert!((surface.query(0.0, 35.0) - 8000.0).abs() < 1e-6);
    }

    #[test]
    fn calibration_validation() {
        assert!(matches!(
            Calibration::new(vec![0.0], [vec![1.0], vec![1.0]], [35.0, 55.0]),
            Err(Error::TooFewPoints(1))
        ));
        assert!(matches!(
            Calibration::new(vec![0.0, 1.0], [vec![1.0, 2.0], vec![1.0]], [35.0, 55.0]),
            Err(Error::RowLength { row: 1, got: 1, expected: 2 })
        ));
        assert!(matches!(
            Calibration::new(vec![0.0, f64::NAN], [vec![1.0, 2.0], vec![1.0, 2.0]], [35.0, 55.0]),
            Err(Error::NotFinite)
        ));
        assert!(matches!(
            Calibration::new(vec![0.0, 1.0], [vec![1.0, 2.0], vec![1.0, 2.0]], [35.0, 35.0]),
            Err(Error::FlowTemperaturesEqual(_))
        ));
        let parsed: Result<Calibration, _> = serde_json::from_str(
            r#"{"known_x": [0, 1], "known_y": [[1, 2], [3]], "known_t": [35, 55]}"#,
        );
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power_map.json");
        let calibration = Calibration::load_or_default(&path).await;
        assert_eq!(calibration, Calibration::default());
        assert_eq!(Calibration::load(&path).await.unwrap(), Calibration::default());
    }

    #[tokio::test]
    async fn malformed_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power_map.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let calibration = Calibration::load_or_default(&path).await;
        assert_eq!(calibration, Calibration::default());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{ not json");
    }

    #[tokio::test]
    async fn stored_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power_map.json");
        let custom = Calibration::new(
            vec![-20.0, 0.0, 20.0],
            [vec![4000.0, 8000.0, 9000.0], vec![3500.0, 7000.0, 8800.0]],
            [30.0, 50.0],
        )
        .unwrap();
        custom.store(&path).await.unwrap();
        assert_eq!(Calibration::load_or_default(&path).await, custom);
    }
}

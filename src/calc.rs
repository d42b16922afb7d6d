//! Values derived from other registers rather than read from the device.

use crate::power_map::PowerSurface;
use crate::registers::RegisterIndex;

/// Formula of a calculated sensor. Operands name registers of the register table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Calculation {
    /// Heating power currently produced, in watts: the power request (in percent) applied to the
    /// maximum power available at the current outside and flow temperatures.
    HeatingPower { demand: &'static str, outside: &'static str, flow: &'static str },
    /// Difference between two temperatures, in °C.
    TemperatureSpread { from: &'static str, to: &'static str },
}

impl Calculation {
    /// Names of the registers the calculation reads.
    pub fn operands(&self) -> impl Iterator<Item = &'static str> + use<> {
        let operands = match *self {
            Calculation::HeatingPower { demand, outside, flow } => {
                [Some(demand), Some(outside), Some(flow)]
            }
            Calculation::TemperatureSpread { from, to } => [Some(from), Some(to), None],
        };
        operands.into_iter().flatten()
    }

    /// Evaluate against current register values.
    ///
    /// `value` returns the scaled value of a register, or `None` if there is no valid reading.
    /// Any missing operand makes the result `None`, and so does a missing `surface` for
    /// [`Calculation::HeatingPower`].
    pub fn evaluate(
        &self,
        value: impl Fn(RegisterIndex) -> Option<f64>,
        surface: Option<&PowerSurface>,
    ) -> Option<f64> {
        let operand = |name: &str| RegisterIndex::from_name(name).and_then(&value);
        let result = match *self {
            Calculation::HeatingPower { demand, outside, flow } => {
                let maximum = surface?.query(operand(outside)?, operand(flow)?);
                operand(demand)? / 100.0 * maximum
            }
            Calculation::TemperatureSpread { from, to } => operand(from)? - operand(to)?,
        };
        result.is_finite().then_some(result)
    }
}

#[derive(Debug)]
pub struct CalculatedDescriptor {
    pub name: &'static str,
    pub unit: &'static str,
    pub description: &'static str,
    pub calculation: Calculation,
}

pub static CALCULATED: &[CalculatedDescriptor] = &[
    CalculatedDescriptor {
        name: "HEATING_POWER",
        unit: "W",
        description: "Heating power estimated from the power request and the power map",
        calculation: Calculation::HeatingPower {
            demand: "POWER_REQUEST",
            outside: "OUTSIDE_TEMPERATURE",
            flow: "FLOW_TEMPERATURE",
        },
    },
    CalculatedDescriptor {
        name: "FLOW_RETURN_SPREAD",
        unit: "°C",
        description: "Temperature difference between heat pump flow and return",
        calculation: Calculation::TemperatureSpread {
            from: "FLOW_TEMPERATURE",
            to: "RETURN_TEMPERATURE",
        },
    },
    CalculatedDescriptor {
        name: "HC1_FLOW_DEVIATION",
        unit: "°C",
        description: "Heating circuit 1 flow temperature above its setpoint",
        calculation: Calculation::TemperatureSpread {
            from: "HC1_FLOW_TEMPERATURE",
            to: "HC1_FLOW_SETPOINT",
        },
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_map::{Calibration, DEFAULT_STEPS};
    use std::collections::HashMap;

    fn values(pairs: &[(&str, f64)]) -> impl Fn(RegisterIndex) -> Option<f64> + use<> {
        let map: HashMap<RegisterIndex, f64> = pairs
            .iter()
            .map(|(name, v)| (RegisterIndex::from_name(name).unwrap(), *v))
            .collect();
        move |register| map.get(&register).copied()
    }

    #[test]
    fn operands_exist() {
        for descriptor in CALCULATED {
            for name in descriptor.calculation.operands() {
                assert!(RegisterIndex::from_name(name).is_some(), "{}: {name}", descriptor.name);
            }
        }
    }

    #[test]
    fn heating_power() {
        let surface = PowerSurface::build(&Calibration::default(), DEFAULT_STEPS);
        let calculation = CALCULATED[0].calculation;
        let current = values(&[
            ("POWER_REQUEST", 50.0),
            ("OUTSIDE_TEMPERATURE", 35.0),
            ("FLOW_TEMPERATURE", 35.0),
        ]);
        let power = calculation.evaluate(&current, Some(&surface)).unwrap();
        assert!((power - 5500.0).abs() < 1e-6);
        assert_eq!(calculation.evaluate(&current, None), None);
        let missing = values(&[("POWER_REQUEST", 50.0), ("OUTSIDE_TEMPERATURE", 35.0)]);
        assert_eq!(calculation.evaluate(missing, Some(&surface)), None);
    }

    #[test]
    fn temperature_spread() {
        let calculation = CALCULATED[1].calculation;
        let current = values(&[("FLOW_TEMPERATURE", 35.5), ("RETURN_TEMPERATURE", 30.0)]);
        assert_eq!(calculation.evaluate(current, None), Some(5.5));
    }
}

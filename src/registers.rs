//! Register map of the heat pump controller.
//!
//! Input registers (3xxxx) hold measurements and are read-only. Holding registers (4xxxx) hold
//! settings and may be written, unless their descriptor says otherwise.

/// Numeric format a register's raw word is validated against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Format {
    Temperature,
    Percentage,
    Number,
    Status,
}

/// Raw temperature reported when no sensor is installed.
pub const TEMPERATURE_NO_SENSOR: i32 = -32768;
/// Raw temperature some firmware reports instead of a zero reading.
pub const TEMPERATURE_ANOMALY: i32 = 32768;
/// Raw temperature reported for a broken sensor.
pub const TEMPERATURE_BROKEN: i32 = -32767;
/// Value a broken temperature sensor decodes to (-99.9 °C in tenths).
pub const TEMPERATURE_BROKEN_VALUE: i32 = -999;
/// Raw percentage reported for an unavailable value.
pub const PERCENTAGE_UNAVAILABLE: i32 = 65535;

/// Result of validating a raw register word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub value: Option<i32>,
    pub valid: bool,
}

impl Decoded {
    const fn valid(value: i32) -> Self {
        Self { value: Some(value), valid: true }
    }
    const INVALID: Self = Self { value: None, valid: false };
}

impl Format {
    /// Validate a raw value read from the device and translate it into a domain value.
    ///
    /// Sentinels are not errors: they report a missing or broken sensor and only clear the
    /// validity of the reading.
    pub const fn decode(self, raw: i32) -> Decoded {
        match self {
            Format::Temperature => match raw {
                TEMPERATURE_NO_SENSOR | TEMPERATURE_ANOMALY => Decoded::INVALID,
                TEMPERATURE_BROKEN => Decoded::valid(TEMPERATURE_BROKEN_VALUE),
                raw if raw > 32768 => Decoded::valid(raw - 65536),
                raw => Decoded::valid(raw),
            },
            Format::Percentage => match raw {
                PERCENTAGE_UNAVAILABLE => Decoded::INVALID,
                raw => Decoded::valid(raw),
            },
            Format::Number | Format::Status => Decoded::valid(raw),
        }
    }

    /// Inverse of [`Self::decode`] for values about to be written.
    pub const fn encode(self, value: i32) -> i32 {
        match self {
            Format::Temperature if value < 0 => value + 65536,
            _ => value,
        }
    }
}

/// How a register is accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Kind {
    /// Read-only measurement.
    Sensor,
    /// Writable setting.
    Number,
    /// Setting that lives among the holding registers, but must not be written.
    NumberReadOnly,
    /// Writable setting with an enumerated set of values.
    Select,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    Input,
    Holding,
}

impl Kind {
    pub const fn address_space(self) -> AddressSpace {
        match self {
            Kind::Sensor => AddressSpace::Input,
            Kind::Number | Kind::NumberReadOnly | Kind::Select => AddressSpace::Holding,
        }
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Kind::Number | Kind::Select)
    }
}

/// Part of the installation a register belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Group {
    System,
    HeatPump,
    HotWater,
    HeatingCircuit1,
    HeatingCircuit2,
    HeatingCircuit3,
    HeatingCircuit4,
    HeatingCircuit5,
    SecondGenerator,
    Statistics,
}

impl Group {
    /// Number of the optional heating circuit, if this group is one.
    pub const fn optional_heating_circuit(self) -> Option<u8> {
        match self {
            Group::HeatingCircuit2 => Some(2),
            Group::HeatingCircuit3 => Some(3),
            Group::HeatingCircuit4 => Some(4),
            Group::HeatingCircuit5 => Some(5),
            _ => None,
        }
    }
}

/// Immutable definition of one register.
#[derive(Debug)]
pub struct RegisterDescriptor {
    pub address: u16,
    pub name: &'static str,
    pub format: Format,
    pub kind: Kind,
    pub group: Group,
    /// Decoded values are this many times the displayed value.
    pub divider: u16,
    /// Raw code to symbolic key, for status and select registers.
    pub options: &'static [(i32, &'static str)],
    /// Lowest value accepted for writes, in display units.
    pub min: f64,
    /// Highest value accepted for writes, in display units.
    pub max: f64,
    /// Register whose current value replaces `min` while it is known.
    pub min_from: Option<&'static str>,
    /// Register whose current value replaces `max` while it is known.
    pub max_from: Option<&'static str>,
    pub description: &'static str,
}

impl RegisterDescriptor {
    pub fn key_of(&self, code: i32) -> Option<&'static str> {
        self.options.iter().find(|(c, _)| *c == code).map(|(_, k)| *k)
    }

    pub fn code_of(&self, key: &str) -> Option<i32> {
        self.options.iter().find(|(_, k)| *k == key).map(|(c, _)| *c)
    }

    /// Human readable rendition of a decoded value.
    pub fn display(&self, value: i32) -> String {
        if !self.options.is_empty() {
            return match self.key_of(value) {
                Some(key) => key.to_string(),
                None => format!("unknown <{value}>"),
            };
        }
        scaled(value, self.divider).to_string()
    }

    /// Write limits in display units.
    ///
    /// `current` supplies the display value of other registers. The limits that follow another
    /// register fall back to the fixed ones while that register has no valid reading.
    pub fn limits(&self, current: impl Fn(RegisterIndex) -> Option<f64>) -> (f64, f64) {
        let follow =
            |name: Option<&str>| name.and_then(RegisterIndex::from_name).and_then(&current);
        (follow(self.min_from).unwrap_or(self.min), follow(self.max_from).unwrap_or(self.max))
    }

    /// Whether `value` may be written with the given [`Self::limits`]. Enumerated registers
    /// accept exactly their known codes.
    pub fn accepts(&self, value: i32, (min, max): (f64, f64)) -> bool {
        if !self.options.is_empty() {
            return self.key_of(value).is_some();
        }
        let shown = scaled(value, self.divider);
        min <= shown && shown <= max
    }

    /// Translate user input (a symbolic key or a displayed number) into a value for
    /// [`Format::encode`]. The result is not checked against [`Self::limits`].
    pub fn parse_input(&self, input: &str) -> Option<i32> {
        if !self.options.is_empty() {
            return self.code_of(input).or_else(|| {
                let code = input.parse().ok()?;
                self.key_of(code).map(|_| code)
            });
        }
        let value: f64 = input.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        let raw = (value * f64::from(self.divider)).trunc();
        (raw >= f64::from(i32::MIN) && raw <= f64::from(i32::MAX)).then_some(raw as i32)
    }
}

pub fn scaled(value: i32, divider: u16) -> f64 {
    f64::from(value) / f64::from(divider.max(1))
}

/// Mutable per-register state, owned by the gateway.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterState {
    /// Last decoded value.
    pub value: Option<i32>,
    /// Set once a real value has been read, cleared by sentinels and errors.
    pub valid: bool,
    /// The device reported that this register does not exist.
    pub unsupported: bool,
}

impl RegisterState {
    pub fn record(&mut self, decoded: Decoded) {
        self.value = decoded.value;
        self.valid = decoded.valid;
    }

    pub fn mark_unsupported(&mut self) {
        self.value = None;
        self.valid = false;
        self.unsupported = true;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterIndex(usize);

impl RegisterIndex {
    pub fn from_address(address: u16) -> Option<RegisterIndex> {
        let index = REGISTERS.partition_point(|v| v.address < address);
        (REGISTERS.get(index)?.address == address).then_some(Self(index))
    }

    pub fn from_name(name: &str) -> Option<RegisterIndex> {
        REGISTERS.iter().position(|v| v.name.eq_ignore_ascii_case(name)).map(Self)
    }

    pub fn all() -> impl Iterator<Item = RegisterIndex> {
        (0..REGISTERS.len()).map(Self)
    }

    pub const fn index(&self) -> usize {
        self.0
    }

    pub fn descriptor(&self) -> &'static RegisterDescriptor {
        &REGISTERS[self.0]
    }

    pub fn address(&self) -> u16 {
        self.descriptor().address
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }
}

const OPERATING_STATUS: &[(i32, &str)] = &[
    (0, "undefined"),
    (1, "relay_test"),
    (2, "emergency_stop"),
    (3, "diagnosis"),
    (4, "manual"),
    (5, "emergency"),
    (10, "off"),
    (11, "automatic"),
    (12, "cooling"),
    (13, "heating"),
    (14, "hot_water"),
    (15, "pool"),
    (16, "standby"),
    (17, "defrost"),
];
const ERROR_STATE: &[(i32, &str)] = &[(0, "error"), (1, "no_error")];
const SYSTEM_MODE: &[(i32, &str)] = &[
    (0, "automatic"),
    (1, "heating"),
    (2, "cooling"),
    (3, "summer"),
    (4, "standby"),
    (5, "second_generator"),
];
const HEAT_PUMP_STATUS: &[(i32, &str)] = &[
    (0, "off"),
    (1, "heating"),
    (2, "hot_water"),
    (3, "cooling"),
    (4, "pool"),
    (5, "defrost"),
    (6, "blocked"),
    (7, "error"),
];
const HEAT_PUMP_CONFIGURATION: &[(i32, &str)] =
    &[(0, "off"), (1, "automatic"), (2, "manual_heating"), (3, "manual_cooling")];
const HOT_WATER_PUSH: &[(i32, &str)] = &[(0, "off"), (5, "on")];
const CIRCUIT_CONFIGURATION: &[(i32, &str)] = &[
    (0, "off"),
    (1, "automatic"),
    (2, "comfort"),
    (3, "normal"),
    (4, "setback"),
    (5, "standby"),
];
const SECOND_GENERATOR_STATUS: &[(i32, &str)] =
    &[(0, "off"), (1, "on"), (2, "blocked"), (3, "blocked_by_energy_supplier")];
const SECOND_GENERATOR_MODE: &[(i32, &str)] =
    &[(0, "off"), (1, "heating"), (2, "hot_water"), (3, "heating_and_hot_water")];
const NO_OPTIONS: &[(i32, &str)] = &[];
const UNLIMITED_MIN: f64 = -999999.0;
const UNLIMITED_MAX: f64 = 999999.0;

macro_rules! for_each_register {
    ($m:ident) => {
        $m! {
            30001: Temperature, Sensor, System, "OUTSIDE_TEMPERATURE", "Outside temperature",
                divider = 10;
            30002: Temperature, Sensor, System, "AIR_INTAKE_TEMPERATURE",
                "Air intake temperature of the outdoor unit",
                divider = 10;
            30003: Status, Sensor, System, "ERROR_CODE", "Active error code";
            30004: Status, Sensor, System, "WARNING_CODE", "Active warning code";
            30005: Status, Sensor, System, "ERROR_FREE", "Whether the system runs without errors",
                options = ERROR_STATE;
            30006: Status, Sensor, System, "OPERATING_STATUS", "Operating status of the system",
                options = OPERATING_STATUS;
            31101: Temperature, Sensor, HeatingCircuit1, "HC1_ROOM_SETPOINT",
                "Room temperature setpoint of heating circuit 1",
                divider = 10;
            31102: Temperature, Sensor, HeatingCircuit1, "HC1_ROOM_TEMPERATURE",
                "Room temperature of heating circuit 1",
                divider = 10;
            31103: Percentage, Sensor, HeatingCircuit1, "HC1_ROOM_HUMIDITY",
                "Relative room humidity of heating circuit 1";
            31104: Temperature, Sensor, HeatingCircuit1, "HC1_FLOW_SETPOINT",
                "Flow temperature setpoint of heating circuit 1",
                divider = 10;
            31105: Temperature, Sensor, HeatingCircuit1, "HC1_FLOW_TEMPERATURE",
                "Flow temperature of heating circuit 1",
                divider = 10;
            31201: Temperature, Sensor, HeatingCircuit2, "HC2_ROOM_SETPOINT",
                "Room temperature setpoint of heating circuit 2",
                divider = 10;
            31202: Temperature, Sensor, HeatingCircuit2, "HC2_ROOM_TEMPERATURE",
                "Room temperature of heating circuit 2",
                divider = 10;
            31205: Temperature, Sensor, HeatingCircuit2, "HC2_FLOW_TEMPERATURE",
                "Flow temperature of heating circuit 2",
                divider = 10;
            31302: Temperature, Sensor, HeatingCircuit3, "HC3_ROOM_TEMPERATURE",
                "Room temperature of heating circuit 3",
                divider = 10;
            31305: Temperature, Sensor, HeatingCircuit3, "HC3_FLOW_TEMPERATURE",
                "Flow temperature of heating circuit 3",
                divider = 10;
            31402: Temperature, Sensor, HeatingCircuit4, "HC4_ROOM_TEMPERATURE",
                "Room temperature of heating circuit 4",
                divider = 10;
            31405: Temperature, Sensor, HeatingCircuit4, "HC4_FLOW_TEMPERATURE",
                "Flow temperature of heating circuit 4",
                divider = 10;
            31502: Temperature, Sensor, HeatingCircuit5, "HC5_ROOM_TEMPERATURE",
                "Room temperature of heating circuit 5",
                divider = 10;
            31505: Temperature, Sensor, HeatingCircuit5, "HC5_FLOW_TEMPERATURE",
                "Flow temperature of heating circuit 5",
                divider = 10;
            32101: Temperature, Sensor, HotWater, "HOT_WATER_SETPOINT",
                "Hot water temperature setpoint",
                divider = 10;
            32102: Temperature, Sensor, HotWater, "HOT_WATER_TEMPERATURE", "Hot water temperature",
                divider = 10;
            33101: Status, Sensor, HeatPump, "HEAT_PUMP_STATUS",
                "Operating status of the heat pump",
                options = HEAT_PUMP_STATUS;
            33102: Status, Sensor, HeatPump, "HEAT_PUMP_BLOCK", "Reason the heat pump is blocked";
            33103: Percentage, Sensor, HeatPump, "POWER_REQUEST",
                "Power requested from the compressor";
            33104: Temperature, Sensor, HeatPump, "FLOW_TEMPERATURE",
                "Flow temperature at the heat pump",
                divider = 10;
            33105: Temperature, Sensor, HeatPump, "RETURN_TEMPERATURE",
                "Return temperature at the heat pump",
                divider = 10;
            34101: Status, Sensor, SecondGenerator, "SECOND_GENERATOR_STATUS",
                "Status of the second heat generator",
                options = SECOND_GENERATOR_STATUS;
            34102: Number, Sensor, SecondGenerator, "SECOND_GENERATOR_HOURS",
                "Operating hours of the second heat generator";
            36101: Number, Sensor, Statistics, "ENERGY_TODAY",
                "Thermal energy produced today (kWh)";
            36102: Number, Sensor, Statistics, "ENERGY_YESTERDAY",
                "Thermal energy produced yesterday (kWh)";
            36103: Number, Sensor, Statistics, "ENERGY_MONTH",
                "Thermal energy produced this month (kWh)";
            36104: Number, Sensor, Statistics, "ENERGY_YEAR",
                "Thermal energy produced this year (kWh)";
            40001: Status, Select, System, "SYSTEM_MODE", "Operating mode of the system",
                options = SYSTEM_MODE;
            41101: Status, Select, HeatingCircuit1, "HC1_CONFIGURATION",
                "Operating mode of heating circuit 1",
                options = CIRCUIT_CONFIGURATION;
            41103: Temperature, Number, HeatingCircuit1, "HC1_COMFORT_TEMPERATURE",
                "Comfort room temperature of heating circuit 1",
                divider = 10,
                min = 15.0, max = 30.0, min_from = "HC1_NORMAL_TEMPERATURE";
            41104: Temperature, Number, HeatingCircuit1, "HC1_NORMAL_TEMPERATURE",
                "Normal room temperature of heating circuit 1",
                divider = 10,
                min = 15.0, max = 30.0;
            41105: Temperature, Number, HeatingCircuit1, "HC1_SETBACK_TEMPERATURE",
                "Setback room temperature of heating circuit 1",
                divider = 10,
                min = 10.0, max = 30.0, max_from = "HC1_NORMAL_TEMPERATURE";
            41108: Temperature, Number, HeatingCircuit1, "HC1_HEATING_LIMIT",
                "Outside temperature above which heating circuit 1 stops heating",
                divider = 10,
                min = 0.0, max = 30.0;
            41201: Status, Select, HeatingCircuit2, "HC2_CONFIGURATION",
                "Operating mode of heating circuit 2",
                options = CIRCUIT_CONFIGURATION;
            41203: Temperature, Number, HeatingCircuit2, "HC2_COMFORT_TEMPERATURE",
                "Comfort room temperature of heating circuit 2",
                divider = 10,
                min = 15.0, max = 30.0;
            42101: Temperature, Number, HotWater, "HOT_WATER_NORMAL",
                "Normal hot water temperature",
                divider = 10,
                min = 30.0, max = 65.0;
            42102: Temperature, Number, HotWater, "HOT_WATER_REDUCED",
                "Reduced hot water temperature",
                divider = 10,
                min = 30.0, max = 65.0, max_from = "HOT_WATER_NORMAL";
            42103: Status, Select, HotWater, "HOT_WATER_PUSH", "One-off hot water heating",
                options = HOT_WATER_PUSH;
            43101: Status, Select, HeatPump, "HEAT_PUMP_CONFIGURATION",
                "Operating mode of the heat pump",
                options = HEAT_PUMP_CONFIGURATION;
            43102: Percentage, Number, HeatPump, "SILENT_MODE_POWER",
                "Compressor power limit during silent mode",
                min = 0.0, max = 100.0;
            43103: Number, NumberReadOnly, HeatPump, "HEAT_PUMP_MAX_POWER",
                "Nominal heating power of the unit (W)";
            44101: Status, Select, SecondGenerator, "SECOND_GENERATOR_MODE",
                "Usage of the second heat generator",
                options = SECOND_GENERATOR_MODE;
            44102: Temperature, Number, SecondGenerator, "SECOND_GENERATOR_LIMIT",
                "Outside temperature below which the second heat generator is allowed",
                divider = 10,
                min = -20.0, max = 20.0;
        }
    };
}

macro_rules! optional {
    ($default: expr;) => {
        $default
    };
    ($default: expr; $($value: tt)+) => {
        $($value)*
    };
}

macro_rules! make_table {
    ($($regnum: literal: $format: ident, $kind: ident, $group: ident, $name: literal,
       $description: literal $(, divider = $divider: literal)?
       $(, min = $min: literal, max = $max: literal)? $(, min_from = $min_from: literal)?
       $(, max_from = $max_from: literal)? $(, options = $options: ident)?;)+
    ) => {
        pub static REGISTERS: &[RegisterDescriptor] = &[$(
            RegisterDescriptor {
                address: $regnum,
                name: $name,
                format: Format::$format,
                kind: Kind::$kind,
                group: Group::$group,
                divider: optional!(1; $($divider)?),
                options: optional!(NO_OPTIONS; $($options)?),
                min: optional!(UNLIMITED_MIN; $($min)?),
                max: optional!(UNLIMITED_MAX; $($max)?),
                min_from: optional!(None; $(Some($min_from))?),
                max_from: optional!(None; $(Some($max_from))?),
                description: $description,
            }
        ),+];
    };
}

for_each_register!(make_table);

const _ASSERT_TABLE_IS_CONSISTENT: () = const {
    let mut index = 0;
    let mut previous_address = 0;
    while index < REGISTERS.len() {
        let register = &REGISTERS[index];
        if register.address <= previous_address {
            panic!("REGISTERS is not sorted (or has duplicate addresses)!");
        }
        let is_input = register.address >= 30000 && register.address < 40000;
        let wants_input = matches!(register.kind.address_space(), AddressSpace::Input);
        if is_input != wants_input {
            panic!("register kind does not match its address space");
        }
        previous_address = register.address;
        index += 1;
    }
};

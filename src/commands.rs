fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod registers {
    use crate::calc::CALCULATED;
    use crate::output;
    use crate::registers::{REGISTERS, RegisterDescriptor};

    /// Search and output known registers and calculated values.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list entries whose name, description or address contains this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub address: Option<u16>,
        pub name: &'static str,
        pub group: String,
        pub kind: String,
        pub format: String,
        pub divider: u16,
        pub options: Vec<String>,
        /// Write limits in display units, for writable numbers.
        pub range: Option<String>,
        pub description: String,
    }

    impl RegisterSchema {
        fn from_descriptor(d: &'static RegisterDescriptor) -> Self {
            RegisterSchema {
                address: Some(d.address),
                name: d.name,
                group: d.group.to_string(),
                kind: d.kind.to_string(),
                format: d.format.to_string(),
                divider: d.divider,
                options: d.options.iter().map(|(code, key)| format!("{code}={key}")).collect(),
                range: (d.kind.is_writable() && d.options.is_empty()).then(|| range(d)),
                description: d.description.to_string(),
            }
        }

        pub fn all() -> impl Iterator<Item = Self> {
            let calculated = CALCULATED.iter().map(|c| {
                let operands: Vec<_> = c.calculation.operands().collect();
                RegisterSchema {
                    address: None,
                    name: c.name,
                    group: "calculated".into(),
                    kind: "sensor".into(),
                    format: c.unit.into(),
                    divider: 1,
                    options: Vec::new(),
                    range: None,
                    description: format!("{} (from {})", c.description, operands.join(", ")),
                }
            });
            REGISTERS.iter().map(Self::from_descriptor).chain(calculated)
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.name.contains(&pattern)
                || self.description.to_uppercase().contains(&pattern)
                || self.address.is_some_and(|a| a.to_string().contains(&pattern))
        }
    }

    fn range(d: &RegisterDescriptor) -> String {
        let bound = |fixed: f64, from: Option<&str>| match from {
            Some(name) => format!("{fixed} ({name})"),
            None => fixed.to_string(),
        };
        format!("{} to {}", bound(d.min, d.min_from), bound(d.max, d.max_from))
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.table_headers(vec![
            "Address",
            "Name",
            "Group",
            "Kind",
            "Format",
            "Divider",
            "Options",
            "Range",
            "Description",
        ])?;
        for register in RegisterSchema::all() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        register.address.map(|a| a.to_string()).unwrap_or_default(),
                        register.name.to_string(),
                        register.group.clone(),
                        register.kind.clone(),
                        register.format.clone(),
                        register.divider.to_string(),
                        register.options.join(" "),
                        register.range.clone().unwrap_or_default(),
                        register.description.clone(),
                    ]
                },
                || &register,
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

/// Rendering of register values shared by the commands that talk to the device.
mod values {
    use crate::output::Output;
    use crate::registers::{RegisterIndex, RegisterState};

    pub const HEADERS: [&str; 5] = ["Address", "Name", "Value", "Raw", "State"];

    #[derive(serde::Serialize)]
    pub struct ValueRecord<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub taken_at: Option<jiff::Timestamp>,
        pub address: Option<u16>,
        pub name: &'a str,
        pub value: Option<String>,
        pub raw: Option<i32>,
        pub valid: bool,
        pub unsupported: bool,
    }

    fn describe(valid: bool, unsupported: bool) -> &'static str {
        match (valid, unsupported) {
            (_, true) => "unsupported",
            (true, false) => "ok",
            (false, false) => "invalid",
        }
    }

    pub fn register<W: std::io::Write>(
        output: &mut Output<W>,
        taken_at: Option<jiff::Timestamp>,
        register: RegisterIndex,
        state: &RegisterState,
    ) -> Result<(), crate::output::Error> {
        let descriptor = register.descriptor();
        let shown = state.value.map(|v| descriptor.display(v));
        let record = ValueRecord {
            taken_at,
            address: Some(descriptor.address),
            name: descriptor.name,
            value: shown.clone(),
            raw: state.value,
            valid: state.valid,
            unsupported: state.unsupported,
        };
        output.result(
            || {
                vec![
                    descriptor.address.to_string(),
                    descriptor.name.to_string(),
                    shown.unwrap_or_default(),
                    state.value.map(|v| v.to_string()).unwrap_or_default(),
                    describe(state.valid, state.unsupported).to_string(),
                ]
            },
            || record,
        )
    }

    pub fn calculated<W: std::io::Write>(
        output: &mut Output<W>,
        taken_at: Option<jiff::Timestamp>,
        name: &str,
        unit: &str,
        value: Option<f64>,
    ) -> Result<(), crate::output::Error> {
        let shown = value.map(|v| format!("{v:.1} {unit}"));
        let record = ValueRecord {
            taken_at,
            address: None,
            name,
            value: value.map(|v| format!("{v:.1}")),
            raw: None,
            valid: value.is_some(),
            unsupported: false,
        };
        output.result(
            || {
                vec![
                    String::new(),
                    name.to_string(),
                    shown.unwrap_or_default(),
                    String::new(),
                    describe(value.is_some(), false).to_string(),
                ]
            },
            || record,
        )
    }
}

pub mod read {
    use super::values;
    use crate::connection::{self, Gateway};
    use crate::output;
    use crate::registers::RegisterIndex;

    /// Read registers from the device once and print their values.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Names of the registers to read. All of them are read if none are given.
        registers: Vec<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("there is no register named `{0}`")]
        UnknownRegister(String),
        #[error("could not connect to {0}")]
        NotConnected(String),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let selected = args
            .registers
            .iter()
            .map(|name| {
                RegisterIndex::from_name(name).ok_or_else(|| Error::UnknownRegister(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let mut gateway = Gateway::new(args.connection.connector(), args.connection.settings());
        runtime.block_on(async {
            if !gateway.connect(true).await.is_connected() {
                return Err(Error::NotConnected(args.connection.address()));
            }
            if selected.is_empty() {
                gateway.sweep(false).await;
            } else {
                for register in &selected {
                    gateway.read_register(*register, false).await;
                }
            }
            gateway.disconnect().await;
            Ok(())
        })?;

        let mut output = args.output.to_output()?;
        output.table_headers(values::HEADERS.to_vec())?;
        let shown: Vec<_> = if selected.is_empty() {
            RegisterIndex::all().filter(|r| gateway.is_swept(*r)).collect()
        } else {
            selected
        };
        for register in shown {
            values::register(&mut output, None, register, gateway.register_state(register))?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod write {
    use super::values;
    use crate::connection::{self, Gateway, WriteOutcome};
    use crate::output;
    use crate::registers::RegisterIndex;

    /// Write a single setting.
    ///
    /// The value is given the way `read` displays it: a symbolic option, or a number in display
    /// units (e.g. `48.5` for a temperature).
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        register: String,
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("there is no register named `{0}`")]
        UnknownRegister(String),
        #[error("register {0} is read-only")]
        ReadOnly(&'static str),
        #[error("`{1}` is not a valid value for {0}")]
        InvalidValue(&'static str, String),
        #[error("{name} only accepts values from {min} to {max}")]
        OutOfRange { name: &'static str, min: f64, max: f64 },
        #[error("could not connect to {0}")]
        NotConnected(String),
        #[error("the device did not accept the new value for {0}")]
        Rejected(&'static str),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let register = RegisterIndex::from_name(&args.register)
            .ok_or_else(|| Error::UnknownRegister(args.register.clone()))?;
        let descriptor = register.descriptor();
        if !descriptor.kind.is_writable() {
            return Err(Error::ReadOnly(descriptor.name));
        }
        let value = descriptor
            .parse_input(&args.value)
            .ok_or_else(|| Error::InvalidValue(descriptor.name, args.value.clone()))?;
        let (min, max) = descriptor.limits(|_| None);
        if !descriptor.accepts(value, (min, max)) {
            return Err(Error::OutOfRange { name: descriptor.name, min, max });
        }
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let mut gateway = Gateway::new(args.connection.connector(), args.connection.settings());
        runtime.block_on(async {
            if !gateway.connect(true).await.is_connected() {
                return Err(Error::NotConnected(args.connection.address()));
            }
            // Limits that follow other registers need their current values.
            let dependencies = descriptor.min_from.into_iter().chain(descriptor.max_from);
            for dependency in dependencies.filter_map(RegisterIndex::from_name) {
                gateway.read_register(dependency, false).await;
            }
            let outcome = gateway.write_register(register, value).await;
            if outcome == WriteOutcome::Written {
                gateway.read_register(register, false).await;
            }
            gateway.disconnect().await;
            match outcome {
                WriteOutcome::Written => Ok(()),
                WriteOutcome::Ignored => Err(Error::NotConnected(args.connection.address())),
                WriteOutcome::Failed => Err(Error::Rejected(descriptor.name)),
                WriteOutcome::OutOfRange => {
                    let (min, max) = gateway.limits(register);
                    Err(Error::OutOfRange { name: descriptor.name, min, max })
                }
            }
        })?;
        let mut output = args.output.to_output()?;
        output.table_headers(values::HEADERS.to_vec())?;
        values::register(&mut output, None, register, gateway.register_state(register))?;
        output.commit()?;
        Ok(())
    }
}

pub mod poll {
    use super::values;
    use crate::connection::{self, Gateway};
    use crate::output;
    use crate::poller::{self, Poller};
    use crate::power_map::{Calibration, DEFAULT_STEPS, PowerSurface};
    use futures::StreamExt as _;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio_stream::wrappers::WatchStream;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    /// Periodically read all registers and print every sweep, until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        poller: poller::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Calibration of the heating power estimate. Created with built-in values if missing.
        #[arg(long, default_value = "heatpump_power_map.json")]
        power_map: PathBuf,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let mut output = args.output.to_output()?;
        output.table_headers(values::HEADERS.to_vec())?;
        runtime.block_on(async {
            let calibration = Calibration::load_or_default(&args.power_map).await;
            let surface = Arc::new(PowerSurface::build(&calibration, DEFAULT_STEPS));
            let gateway = Gateway::new(args.connection.connector(), args.connection.settings());
            let cancel = CancellationToken::new();
            let (poller, handle) =
                Poller::new(gateway, &args.poller, Some(surface), cancel.clone());
            let mut snapshots = WatchStream::from_changes(handle.snapshots());
            drop(handle);

            let interrupt = async {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => info!(message = "interrupted, stopping"),
                        Err(e) => {
                            warn!(
                                message = "could not listen for interrupts",
                                error = (&e as &dyn std::error::Error)
                            );
                            return;
                        }
                    },
                    _ = cancel.cancelled() => return,
                }
                cancel.cancel();
            };
            // Ends once the poller stops and drops its end of the snapshot channel.
            let print = async {
                let printed = async {
                    while let Some(snapshot) = snapshots.next().await {
                        let taken_at = Some(snapshot.taken_at);
                        for (register, state) in &snapshot.registers {
                            values::register(&mut output, taken_at, *register, state)?;
                        }
                        for (descriptor, value) in &snapshot.calculated {
                            let (name, unit) = (descriptor.name, descriptor.unit);
                            values::calculated(&mut output, taken_at, name, unit, *value)?;
                        }
                        output.flush()?;
                    }
                    Ok::<_, Error>(())
                }
                .await;
                cancel.cancel();
                printed
            };
            let ((), _, printed) = tokio::join!(interrupt, poller.run(), print);
            printed
        })?;
        output.commit()?;
        Ok(())
    }
}

pub mod power_map {
    use crate::output;
    use crate::power_map::{Calibration, DEFAULT_STEPS, OUTSIDE_SAMPLES, PowerSurface};
    use std::path::PathBuf;

    /// Spacing of the outside temperature columns in the table view, in samples.
    const TABLE_COLUMN_STRIDE: usize = 5;

    /// Print the heating power map, or look up a single point of it.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Calibration file. Created with built-in values if missing.
        #[arg(long, default_value = "heatpump_power_map.json")]
        file: PathBuf,
        /// Number of flow temperature levels between the two calibrated ones, inclusive.
        #[arg(long, default_value_t = DEFAULT_STEPS)]
        steps: usize,
        /// Outside temperature in °C to look up.
        #[arg(long, requires = "flow", allow_hyphen_values = true)]
        outside: Option<f64>,
        /// Flow temperature in °C to look up.
        #[arg(long, requires = "outside")]
        flow: Option<f64>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Sample {
        outside: f64,
        flow: f64,
        power: f64,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let calibration = runtime.block_on(Calibration::load_or_default(&args.file));
        let surface = PowerSurface::build(&calibration, args.steps);
        let format = args.output.format();
        let mut output = args.output.to_output()?;

        if let (Some(outside), Some(flow)) = (args.outside, args.flow) {
            let power = surface.query(outside, flow);
            output.table_headers(vec!["Outside °C", "Flow °C", "Power W"])?;
            output.result(
                || vec![outside.to_string(), flow.to_string(), format!("{power:.0}")],
                || Sample { outside, flow, power },
            )?;
        } else if format == output::Format::Table {
            let columns: Vec<usize> = (0..OUTSIDE_SAMPLES).step_by(TABLE_COLUMN_STRIDE).collect();
            let mut headers = vec!["Flow °C"];
            headers.extend(columns.iter().map(|&c| column_header(c)));
            output.table_headers(headers)?;
            for (row, samples) in surface.rows().iter().enumerate() {
                let flow = surface.flow_temperature(row);
                output.result(
                    || {
                        let mut cells = vec![format!("{flow:.0}")];
                        cells.extend(columns.iter().map(|&c| format!("{:.0}", samples[c])));
                        cells
                    },
                    || (),
                )?;
            }
        } else {
            output.table_headers(vec!["outside", "flow", "power"])?;
            for (row, samples) in surface.rows().iter().enumerate() {
                let flow = surface.flow_temperature(row);
                for (column, &power) in samples.iter().enumerate() {
                    let outside = PowerSurface::outside_temperature(column);
                    output.result(
                        || vec![outside.to_string(), flow.to_string(), power.to_string()],
                        || Sample { outside, flow, power },
                    )?;
                }
            }
        }
        output.commit()?;
        Ok(())
    }

    fn column_header(column: usize) -> &'static str {
        const HEADERS: [&str; 15] = [
            "-30", "-25", "-20", "-15", "-10", "-5", "0", "5", "10", "15", "20", "25", "30", "35",
            "40",
        ];
        HEADERS.get(column / TABLE_COLUMN_STRIDE).copied().unwrap_or("?")
    }
}

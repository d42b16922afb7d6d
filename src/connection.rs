use crate::modbus::{ModbusTCPCodec, Operation, Request, Response, ResponseKind};
use crate::registers::{self, AddressSpace, RegisterIndex, RegisterState};
use futures::{SinkExt, StreamExt as _};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

/// Consecutive connection failures after which non-forced attempts start backing off.
pub const BACKOFF_THRESHOLD_FAILURES: u32 = 3;
/// Cool-down after the failure threshold is first reached.
pub const BACKOFF_BASE: Duration = Duration::from_secs(300);
/// Ceiling for the cool-down, however many attempts have failed.
pub const BACKOFF_MAX: Duration = Duration::from_secs(3600);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("`{0}` did not resolve to any address")]
    NoAddress(String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` timed out")]
    ConnectTimeout(String),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the connection was closed by the device")]
    Closed,
    #[error("no response was received in time")]
    Timeout,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Host name or IP address of the heat pump's Modbus/TCP interface.
    #[arg(long)]
    pub host: String,

    #[arg(long, default_value = "502")]
    pub port: u16,

    /// The modbus device ID.
    #[arg(long, short = 'i', default_value = "1")]
    pub device_id: u8,

    /// Give up establishing the TCP connection after this long.
    #[arg(long, default_value = "3s")]
    pub connect_timeout: humantime::Duration,

    /// If the modbus response isn't received in this amount of time, consider the request
    /// failed.
    #[arg(long, default_value = "1s")]
    pub read_timeout: humantime::Duration,

    /// Reconnect to the modbus server after the specified number of reads timeout.
    #[arg(long, default_value = "3")]
    pub reconnect_after_timeouts: u32,

    /// The amount of additional time to wait after receiving a server busy exception before
    /// the request is retried once.
    #[arg(long, default_value = "25ms")]
    pub server_busy_retry_delay: humantime::Duration,

    /// Also read the registers of an optional heating circuit (2 to 5).
    #[arg(long = "heating-circuit", value_parser = clap::value_parser!(u8).range(2..=5))]
    pub heating_circuits: Vec<u8>,
}

impl Args {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            device_id: self.device_id,
            read_timeout: *self.read_timeout,
            reconnect_after_timeouts: self.reconnect_after_timeouts,
            server_busy_retry_delay: *self.server_busy_retry_delay,
            heating_circuits: self.heating_circuits.clone(),
        }
    }

    pub fn connector(&self) -> TcpConnector {
        TcpConnector { address: self.address(), timeout: *self.connect_timeout }
    }
}

/// Transport-independent knobs of a [`Gateway`].
#[derive(Clone, Debug)]
pub struct Settings {
    pub device_id: u8,
    pub read_timeout: Duration,
    pub reconnect_after_timeouts: u32,
    pub server_busy_retry_delay: Duration,
    pub heating_circuits: Vec<u8>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_id: 1,
            read_timeout: Duration::from_secs(1),
            reconnect_after_timeouts: 3,
            server_busy_retry_delay: Duration::from_millis(25),
            heating_circuits: Vec::new(),
        }
    }
}

/// Something that can open a byte stream to the device.
pub trait Connector {
    type Io: AsyncRead + AsyncWrite + Unpin + Send;
    fn connect(&mut self) -> impl Future<Output = Result<Self::Io, Error>> + Send;
}

pub struct TcpConnector {
    address: String,
    timeout: Duration,
}

impl Connector for TcpConnector {
    type Io = TcpStream;

    async fn connect(&mut self) -> Result<TcpStream, Error> {
        let address = &self.address;
        info!(message = "connecting...", address);
        let connect = async {
            let addresses = tokio::net::lookup_host(address)
                .await
                .map_err(|e| Error::LookupHost(e, address.clone()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            if addresses.is_empty() {
                return Err(Error::NoAddress(address.clone()));
            }
            TcpStream::connect(&*addresses).await.map_err(|e| Error::Connect(e, address.clone()))
        };
        let socket = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(address.clone()))??;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        Ok(socket)
    }
}

/// Result of [`Gateway::connect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    Failed,
    /// Too many attempts failed in a row, no attempt was made.
    BackingOff { retry_in: Duration },
}

impl ConnectStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectStatus::Connected)
    }
}

/// Result of [`Gateway::write_register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Nothing was sent: the register is read-only or there is no connection.
    Ignored,
    /// Nothing was sent: the value lies outside of [`Gateway::limits`].
    OutOfRange,
    Failed,
}

/// Cool-down to observe before the next non-forced attempt after `failures` failed attempts.
pub fn backoff_delay(failures: u32) -> Duration {
    let Some(excess) = failures.checked_sub(BACKOFF_THRESHOLD_FAILURES) else {
        return Duration::ZERO;
    };
    let factor = 1u32.checked_shl(excess).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

/// Connection bookkeeping. Never persisted.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub failed_attempts: u32,
    pub last_attempt: Option<Instant>,
    /// Consecutive requests that went unanswered on the current connection.
    pub timeouts: u32,
}

/// Owns the connection to the device and the state of every register.
///
/// All operations take `&mut self`, so a gateway is accessed by a single writer at a time. Share
/// it through [`crate::poller::Poller`] when multiple parties need it.
pub struct Gateway<C: Connector> {
    connector: C,
    settings: Settings,
    io: Option<Framed<C::Io, ModbusTCPCodec>>,
    state: ConnectionState,
    registers: Vec<RegisterState>,
    transaction_id: u16,
}

impl<C: Connector> Gateway<C> {
    pub fn new(connector: C, settings: Settings) -> Self {
        Self {
            connector,
            settings,
            io: None,
            state: ConnectionState::default(),
            registers: vec![RegisterState::default(); RegisterIndex::all().count()],
            transaction_id: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn register_state(&self, register: RegisterIndex) -> &RegisterState {
        &self.registers[register.index()]
    }

    /// Write limits of `register` in display units, following the current readings of the
    /// registers they depend on.
    pub fn limits(&self, register: RegisterIndex) -> (f64, f64) {
        register.descriptor().limits(|other| {
            let state = self.register_state(other);
            let raw = state.value.filter(|_| state.valid)?;
            Some(registers::scaled(raw, other.descriptor().divider))
        })
    }

    /// The instant before which non-forced connection attempts are refused.
    pub fn next_attempt_at(&self) -> Option<Instant> {
        let delay = backoff_delay(self.state.failed_attempts);
        if delay.is_zero() {
            return None;
        }
        self.state.last_attempt.map(|last| last + delay)
    }

    /// Open the connection unless it is already open.
    ///
    /// Once [`BACKOFF_THRESHOLD_FAILURES`] attempts have failed in a row, non-forced calls are
    /// refused until the cool-down since the last attempt has passed. Never fails: transport
    /// errors are logged and reported as [`ConnectStatus::Failed`].
    pub async fn connect(&mut self, force: bool) -> ConnectStatus {
        if self.io.is_some() {
            return ConnectStatus::Connected;
        }
        if !force {
            if let Some(at) = self.next_attempt_at() {
                let now = Instant::now();
                if now < at {
                    debug!(
                        message = "refusing to connect while backing off",
                        failed_attempts = self.state.failed_attempts
                    );
                    return ConnectStatus::BackingOff { retry_in: at - now };
                }
            }
        }
        self.state.last_attempt = Some(Instant::now());
        match self.connector.connect().await {
            Ok(io) => {
                info!(message = "connected", after_failures = self.state.failed_attempts);
                self.io = Some(Framed::new(io, ModbusTCPCodec {}));
                self.state.failed_attempts = 0;
                self.state.timeouts = 0;
                ConnectStatus::Connected
            }
            Err(e) => {
                self.state.failed_attempts = self.state.failed_attempts.saturating_add(1);
                self.io = None;
                let retry_in = backoff_delay(self.state.failed_attempts);
                if retry_in.is_zero() {
                    warn!(
                        message = "connecting to the heat pump failed",
                        failed_attempts = self.state.failed_attempts,
                        error = (&e as &dyn std::error::Error)
                    );
                } else {
                    warn!(
                        message = "connecting to the heat pump failed, backing off",
                        failed_attempts = self.state.failed_attempts,
                        retry_in = %humantime::format_duration(retry_in),
                        error = (&e as &dyn std::error::Error)
                    );
                }
                ConnectStatus::Failed
            }
        }
    }

    /// Drop the connection. The next access reconnects.
    pub async fn disconnect(&mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = SinkExt::<&Request>::close(&mut io).await {
                debug!(
                    message = "closing the connection failed",
                    error = (&e as &dyn std::error::Error)
                );
            }
            info!(message = "connection closed");
        }
    }

    fn new_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    async fn exchange(&mut self, operation: Operation) -> Result<Response, Error> {
        let transaction_id = self.new_transaction_id();
        let request = Request { device_id: self.settings.device_id, transaction_id, operation };
        let read_timeout = self.settings.read_timeout;
        let io = self.io.as_mut().ok_or(Error::Closed)?;
        io.send(&request).await.map_err(Error::Send)?;
        let deadline = Instant::now() + read_timeout;
        loop {
            let response = match tokio::time::timeout_at(deadline, io.next()).await {
                Err(_) => return Err(Error::Timeout),
                Ok(None) => return Err(Error::Closed),
                Ok(Some(Err(e))) => return Err(Error::Receive(e)),
                Ok(Some(Ok(response))) => response,
            };
            if response.transaction_id == transaction_id {
                return Ok(response);
            }
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id,
                expected = transaction_id
            );
        }
    }

    /// Send `operation`, retrying once if the device reports being busy.
    ///
    /// Transport failures close the connection; so do too many timeouts in a row.
    async fn request(&mut self, operation: Operation) -> Result<Response, Error> {
        let mut result = self.exchange(operation).await;
        if matches!(&result, Ok(r) if r.is_server_busy()) {
            tokio::time::sleep(self.settings.server_busy_retry_delay).await;
            result = self.exchange(operation).await;
        }
        match &result {
            Ok(_) => self.state.timeouts = 0,
            Err(Error::Timeout) => {
                self.state.timeouts += 1;
                if self.state.timeouts >= self.settings.reconnect_after_timeouts {
                    warn!(message = "too many requests timed out, will reconnect");
                    self.disconnect().await;
                }
            }
            Err(_) => self.disconnect().await,
        }
        result
    }

    /// Read and validate a single register.
    ///
    /// Sensors are read from the input registers, everything else from the holding registers.
    /// Returns `None` when there is no connection, when the transfer fails, or when the value is
    /// not available. `quiet` suppresses the warning about a missing connection.
    pub async fn read_register(&mut self, register: RegisterIndex, quiet: bool) -> Option<i32> {
        let descriptor = register.descriptor();
        if self.io.is_none() {
            if !quiet {
                warn!(
                    message = "trying to read a register without connection",
                    register = descriptor.name
                );
            }
            return None;
        }
        let operation = match descriptor.kind.address_space() {
            AddressSpace::Input => Operation::GetInputs { address: descriptor.address, count: 1 },
            AddressSpace::Holding => {
                Operation::GetHoldings { address: descriptor.address, count: 1 }
            }
        };
        let response = match self.request(operation).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    message = "reading a register failed",
                    register = descriptor.name,
                    address = descriptor.address,
                    error = (&e as &dyn std::error::Error)
                );
                return None;
            }
        };
        let state = &mut self.registers[register.index()];
        if response.is_illegal_address() {
            debug!(message = "register does not exist on this unit", register = descriptor.name);
            state.mark_unsupported();
            return None;
        }
        match response.kind {
            ResponseKind::ErrorCode(code) => {
                warn!(
                    message = "device returned an exception",
                    register = descriptor.name,
                    address = descriptor.address,
                    code
                );
                None
            }
            ResponseKind::Registers { values } => {
                let Some(&raw) = values.first() else {
                    warn!(message = "empty response", register = descriptor.name);
                    return None;
                };
                let decoded = descriptor.format.decode(i32::from(raw));
                trace!(message = "decoded", register = descriptor.name, raw, ?decoded);
                state.record(decoded);
                decoded.value
            }
            ResponseKind::SetHolding { .. } => {
                warn!(message = "unexpected write echo to a read", register = descriptor.name);
                None
            }
        }
    }

    /// Encode and write `value` into a writable register.
    ///
    /// Read-only registers and values outside of [`Self::limits`] are left alone. Failures are
    /// logged, never propagated.
    pub async fn write_register(&mut self, register: RegisterIndex, value: i32) -> WriteOutcome {
        let descriptor = register.descriptor();
        if !descriptor.kind.is_writable() {
            debug!(
                message = "ignoring write to a read-only register",
                register = descriptor.name
            );
            return WriteOutcome::Ignored;
        }
        let (min, max) = self.limits(register);
        if !descriptor.accepts(value, (min, max)) {
            warn!(
                message = "refusing to write a value out of range",
                register = descriptor.name,
                value,
                min,
                max
            );
            return WriteOutcome::OutOfRange;
        }
        if self.io.is_none() {
            warn!(
                message = "trying to write a register without connection",
                register = descriptor.name
            );
            return WriteOutcome::Ignored;
        }
        let encoded = descriptor.format.encode(value);
        let Ok(word) = u16::try_from(encoded) else {
            warn!(
                message = "value does not fit into a register",
                register = descriptor.name,
                value
            );
            return WriteOutcome::Failed;
        };
        let operation = Operation::SetHolding { address: descriptor.address, value: word };
        match self.request(operation).await {
            Ok(Response { kind: ResponseKind::SetHolding { address, value: echoed }, .. }) => {
                if address != descriptor.address || echoed != word {
                    warn!(
                        message = "write echo does not match the request",
                        register = descriptor.name,
                        address,
                        echoed
                    );
                }
                info!(message = "register written", register = descriptor.name, value);
                WriteOutcome::Written
            }
            Ok(response) => {
                warn!(
                    message = "writing a register failed",
                    register = descriptor.name,
                    address = descriptor.address,
                    value,
                    code = ?response.exception_code()
                );
                WriteOutcome::Failed
            }
            Err(e) => {
                warn!(
                    message = "writing a register failed",
                    register = descriptor.name,
                    address = descriptor.address,
                    value,
                    error = (&e as &dyn std::error::Error)
                );
                WriteOutcome::Failed
            }
        }
    }

    /// Whether `register` takes part in sweeps.
    pub fn is_swept(&self, register: RegisterIndex) -> bool {
        if self.registers[register.index()].unsupported {
            return false;
        }
        match register.descriptor().group.optional_heating_circuit() {
            None => true,
            Some(circuit) => self.settings.heating_circuits.contains(&circuit),
        }
    }

    /// Read every configured register once.
    ///
    /// Registers that turned out not to exist on the unit are skipped. Returns the number of
    /// registers that produced a value.
    pub async fn sweep(&mut self, quiet: bool) -> usize {
        let mut read = 0;
        for register in RegisterIndex::all() {
            if !self.is_swept(register) {
                continue;
            }
            if self.io.is_none() {
                break;
            }
            if self.read_register(register, quiet).await.is_some() {
                read += 1;
            }
        }
        read
    }
}

//! Periodic polling of the device.
//!
//! [`Poller`] owns the [`Gateway`] and is the only party talking to it. Everybody else talks to
//! the poller through a [`Handle`]: writes are queued and executed between sweeps, and every
//! sweep publishes a fresh [`Snapshot`].

use crate::calc::{CALCULATED, CalculatedDescriptor};
use crate::connection::{Connector, Gateway, WriteOutcome};
use crate::power_map::PowerSurface;
use crate::registers::{self, RegisterIndex, RegisterState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the poller is no longer running")]
    Stopped,
}

#[derive(clap::Args, Clone, Debug)]
#[group(id = "poller::Args")]
pub struct Args {
    /// Time between the start of two sweeps over all registers.
    #[arg(long, default_value = "30s")]
    pub interval: humantime::Duration,

    /// Give up on a sweep that takes longer than this.
    ///
    /// The connection is dropped, since an answer to the abandoned request may still arrive.
    #[arg(long, default_value = "10s")]
    pub sweep_timeout: humantime::Duration,
}

/// Register values as of the end of a sweep.
#[derive(Debug)]
pub struct Snapshot {
    pub taken_at: jiff::Timestamp,
    pub connected: bool,
    /// State of every register that took part in the sweep.
    pub registers: Vec<(RegisterIndex, RegisterState)>,
    pub calculated: Vec<(&'static CalculatedDescriptor, Option<f64>)>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            taken_at: jiff::Timestamp::now(),
            connected: false,
            registers: Vec::new(),
            calculated: Vec::new(),
        }
    }

    fn capture<C: Connector>(gateway: &Gateway<C>, surface: Option<&PowerSurface>) -> Self {
        let registers: Vec<_> = RegisterIndex::all()
            .filter(|r| gateway.is_swept(*r))
            .map(|r| (r, *gateway.register_state(r)))
            .collect();
        let mut snapshot = Self {
            taken_at: jiff::Timestamp::now(),
            connected: gateway.is_connected(),
            registers,
            calculated: Vec::with_capacity(CALCULATED.len()),
        };
        let calculated: Vec<_> = CALCULATED
            .iter()
            .map(|d| (d, d.calculation.evaluate(|r| snapshot.value(r), surface)))
            .collect();
        snapshot.calculated = calculated;
        snapshot
    }

    /// Scaled value of `register`, if it holds a valid reading.
    pub fn value(&self, register: RegisterIndex) -> Option<f64> {
        let (_, state) = self.registers.iter().find(|(r, _)| *r == register)?;
        let raw = state.value.filter(|_| state.valid)?;
        Some(registers::scaled(raw, register.descriptor().divider))
    }
}

enum Command {
    Write { register: RegisterIndex, value: i32, done: oneshot::Sender<WriteOutcome> },
}

#[derive(Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

impl Handle {
    /// Queue a write of the domain `value` and wait for its outcome.
    pub async fn write(&self, register: RegisterIndex, value: i32) -> Result<WriteOutcome, Error> {
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(Command::Write { register, value, done })
            .await
            .map_err(|_| Error::Stopped)?;
        outcome.await.map_err(|_| Error::Stopped)
    }

    pub fn snapshots(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }
}

pub struct Poller<C: Connector> {
    gateway: Gateway<C>,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    interval: Duration,
    sweep_timeout: Duration,
    surface: Option<Arc<PowerSurface>>,
    cancel: CancellationToken,
}

impl<C: Connector> Poller<C> {
    pub fn new(
        gateway: Gateway<C>,
        args: &Args,
        surface: Option<Arc<PowerSurface>>,
        cancel: CancellationToken,
    ) -> (Self, Handle) {
        let (command_sender, commands) = mpsc::channel(16);
        let (snapshots, snapshot_receiver) = watch::channel(Arc::new(Snapshot::empty()));
        let poller = Self {
            gateway,
            commands,
            snapshots,
            interval: args.interval.into(),
            sweep_timeout: args.sweep_timeout.into(),
            surface,
            cancel,
        };
        (poller, Handle { commands: command_sender, snapshots: snapshot_receiver })
    }

    /// Poll until cancelled. Returns the gateway, disconnected.
    pub async fn run(mut self) -> Gateway<C> {
        // `interval` panics on a zero period.
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut initial = true;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.execute(command).await,
                _ = ticker.tick() => {
                    self.sweep(initial).await;
                    initial = false;
                }
            }
        }
        info!(message = "polling stopped");
        self.gateway.disconnect().await;
        self.gateway
    }

    /// The initial sweep connects regardless of backoff and does not complain about missing
    /// registers, since it doubles as a probe of what the unit supports.
    async fn sweep(&mut self, initial: bool) {
        if self.gateway.connect(initial).await.is_connected() {
            match tokio::time::timeout(self.sweep_timeout, self.gateway.sweep(initial)).await {
                Ok(read) => debug!(message = "sweep done", read),
                Err(_) => {
                    warn!(message = "sweep timed out", timeout = ?self.sweep_timeout);
                    self.gateway.disconnect().await;
                }
            }
        }
        self.publish();
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Write { register, value, done } => {
                self.gateway.connect(false).await;
                let outcome = self.gateway.write_register(register, value).await;
                debug!(message = "write done", register = register.name(), ?outcome);
                let _ = done.send(outcome);
                self.publish();
            }
        }
    }

    fn publish(&self) {
        let snapshot = Snapshot::capture(&self.gateway, self.surface.as_deref());
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}

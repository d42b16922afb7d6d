use heatpump_modbus_tools::connection::{
    BACKOFF_BASE, ConnectStatus, Connector, Error, Gateway, Settings, WriteOutcome,
};
use heatpump_modbus_tools::modbus::{ILLEGAL_DATA_ADDRESS, SERVER_DEVICE_BUSY};
use heatpump_modbus_tools::poller::{self, Poller};
use heatpump_modbus_tools::registers::RegisterIndex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Reply {
    Value(u16),
    Exception(u8),
    Silent,
}

/// Scripted Modbus/TCP server. Reads of unknown registers answer with "illegal data address",
/// writes are accepted unless scripted otherwise.
#[derive(Clone, Default)]
struct Device {
    replies: HashMap<(u8, u16), Reply>,
    busy_replies: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl Device {
    fn with(mut self, function: u8, address: u16, reply: Reply) -> Self {
        self.replies.insert((function, address), reply);
        self
    }

    fn reply(&self, function: u8, address: u16, word: u16) -> Reply {
        if self.busy_replies.load(Ordering::SeqCst) > 0 {
            self.busy_replies.fetch_sub(1, Ordering::SeqCst);
            return Reply::Exception(SERVER_DEVICE_BUSY);
        }
        match self.replies.get(&(function, address)) {
            Some(reply) => *reply,
            None if function == 6 => Reply::Value(word),
            None => Reply::Exception(ILLEGAL_DATA_ADDRESS),
        }
    }

    async fn serve(self, mut io: DuplexStream) {
        let mut request = [0u8; 12];
        while io.read_exact(&mut request).await.is_ok() {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let function = request[7];
            let address = u16::from_be_bytes([request[8], request[9]]);
            let word = u16::from_be_bytes([request[10], request[11]]);
            let pdu = match self.reply(function, address, word) {
                Reply::Silent => continue,
                Reply::Exception(code) => vec![function | 0x80, code],
                Reply::Value(value) if function == 6 => {
                    self.writes.lock().unwrap().push((address, value));
                    let [a0, a1] = address.to_be_bytes();
                    let [v0, v1] = value.to_be_bytes();
                    vec![6, a0, a1, v0, v1]
                }
                Reply::Value(value) => {
                    let [v0, v1] = value.to_be_bytes();
                    vec![function, 2, v0, v1]
                }
            };
            let mut frame = vec![request[0], request[1], 0, 0];
            frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
            frame.push(request[6]);
            frame.extend(pdu);
            if io.write_all(&frame).await.is_err() {
                break;
            }
        }
    }
}

struct FakeConnector {
    device: Device,
    attempts: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

impl Connector for FakeConnector {
    type Io = DuplexStream;

    async fn connect(&mut self) -> Result<DuplexStream, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
            return Err(Error::Connect(refused, "fake".into()));
        }
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(self.device.clone().serve(server));
        Ok(client)
    }
}

struct Harness {
    gateway: Gateway<FakeConnector>,
    device: Device,
    attempts: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

fn harness(device: Device, settings: Settings) -> Harness {
    let attempts = Arc::new(AtomicUsize::new(0));
    let refuse = Arc::new(AtomicBool::new(false));
    let connector = FakeConnector {
        device: device.clone(),
        attempts: Arc::clone(&attempts),
        refuse: Arc::clone(&refuse),
    };
    Harness { gateway: Gateway::new(connector, settings), device, attempts, refuse }
}

fn register(name: &str) -> RegisterIndex {
    RegisterIndex::from_name(name).unwrap()
}

#[tokio::test(start_paused = true)]
async fn reads_from_the_right_address_space() {
    let device =
        Device::default().with(4, 30001, Reply::Value(250)).with(3, 40001, Reply::Value(2));
    let mut h = harness(device, Settings::default());
    assert_eq!(h.gateway.connect(true).await, ConnectStatus::Connected);

    let outside = register("OUTSIDE_TEMPERATURE");
    assert_eq!(h.gateway.read_register(outside, false).await, Some(250));
    assert!(h.gateway.register_state(outside).valid);

    let mode = register("SYSTEM_MODE");
    assert_eq!(h.gateway.read_register(mode, false).await, Some(2));
    assert_eq!(mode.descriptor().display(2), "cooling");
}

#[tokio::test(start_paused = true)]
async fn sentinels_clear_validity() {
    let device = Device::default()
        .with(4, 30001, Reply::Value(0x8000))
        .with(4, 30002, Reply::Value(0xff9c))
        .with(4, 33103, Reply::Value(0xffff));
    let mut h = harness(device, Settings::default());
    h.gateway.connect(true).await;

    let outside = register("OUTSIDE_TEMPERATURE");
    assert_eq!(h.gateway.read_register(outside, false).await, None);
    let state = h.gateway.register_state(outside);
    assert!(!state.valid && !state.unsupported);

    let air_intake = register("AIR_INTAKE_TEMPERATURE");
    assert_eq!(h.gateway.read_register(air_intake, false).await, Some(-100));

    let power_request = register("POWER_REQUEST");
    assert_eq!(h.gateway.read_register(power_request, false).await, None);
    assert!(!h.gateway.register_state(power_request).valid);
    assert!(h.gateway.is_connected());
}

#[tokio::test(start_paused = true)]
async fn missing_registers_are_skipped_by_later_sweeps() {
    let device =
        Device::default().with(4, 30001, Reply::Value(250)).with(3, 40001, Reply::Value(4));
    let mut h = harness(device, Settings::default());
    h.gateway.connect(true).await;

    let swept = RegisterIndex::all().filter(|r| h.gateway.is_swept(*r)).count();
    assert_eq!(h.gateway.sweep(true).await, 2);
    assert_eq!(h.device.requests.load(Ordering::SeqCst), swept);
    assert!(h.gateway.register_state(register("ERROR_CODE")).unsupported);
    assert!(!h.gateway.is_swept(register("ERROR_CODE")));

    assert_eq!(h.gateway.sweep(true).await, 2);
    assert_eq!(h.device.requests.load(Ordering::SeqCst), swept + 2);
}

#[tokio::test(start_paused = true)]
async fn optional_heating_circuits_are_only_swept_when_enabled() {
    let h = harness(Device::default(), Settings::default());
    assert!(h.gateway.is_swept(register("HC1_FLOW_TEMPERATURE")));
    assert!(!h.gateway.is_swept(register("HC2_FLOW_TEMPERATURE")));

    let settings = Settings { heating_circuits: vec![2], ..Settings::default() };
    let h = harness(Device::default(), settings);
    assert!(h.gateway.is_swept(register("HC2_FLOW_TEMPERATURE")));
    assert!(!h.gateway.is_swept(register("HC3_FLOW_TEMPERATURE")));
}

#[tokio::test(start_paused = true)]
async fn writes_encode_negative_temperatures() {
    let device = Device::default().with(6, 40001, Reply::Exception(3));
    let mut h = harness(device, Settings::default());
    h.gateway.connect(true).await;

    let limit = register("SECOND_GENERATOR_LIMIT");
    assert_eq!(h.gateway.write_register(limit, -100).await, WriteOutcome::Written);
    assert_eq!(*h.device.writes.lock().unwrap(), [(44102, 65436)]);

    let max_power = register("HEAT_PUMP_MAX_POWER");
    assert_eq!(h.gateway.write_register(max_power, 10).await, WriteOutcome::Ignored);
    let outside = register("OUTSIDE_TEMPERATURE");
    assert_eq!(h.gateway.write_register(outside, 10).await, WriteOutcome::Ignored);
    assert_eq!(h.device.writes.lock().unwrap().len(), 1);

    let mode = register("SYSTEM_MODE");
    assert_eq!(h.gateway.write_register(mode, 1).await, WriteOutcome::Failed);
    assert!(h.gateway.is_connected());
}

#[tokio::test(start_paused = true)]
async fn writes_outside_of_the_limits_are_refused() {
    let device = Device::default().with(3, 42101, Reply::Value(450));
    let mut h = harness(device, Settings::default());
    h.gateway.connect(true).await;

    let normal = register("HOT_WATER_NORMAL");
    assert_eq!(h.gateway.write_register(normal, 5000).await, WriteOutcome::OutOfRange);
    let mode = register("SYSTEM_MODE");
    assert_eq!(h.gateway.write_register(mode, 42).await, WriteOutcome::OutOfRange);

    let reduced = register("HOT_WATER_REDUCED");
    assert_eq!(h.gateway.limits(reduced), (30.0, 65.0));
    assert_eq!(h.gateway.read_register(normal, false).await, Some(450));
    assert_eq!(h.gateway.limits(reduced), (30.0, 45.0));
    assert_eq!(h.gateway.write_register(reduced, 460).await, WriteOutcome::OutOfRange);
    assert!(h.device.writes.lock().unwrap().is_empty());

    assert_eq!(h.gateway.write_register(reduced, 440).await, WriteOutcome::Written);
    assert_eq!(*h.device.writes.lock().unwrap(), [(42102, 440)]);
}

#[tokio::test(start_paused = true)]
async fn nothing_happens_without_a_connection() {
    let mut h = harness(Device::default(), Settings::default());
    assert_eq!(h.gateway.read_register(register("OUTSIDE_TEMPERATURE"), true).await, None);
    let mode = register("SYSTEM_MODE");
    assert_eq!(h.gateway.write_register(mode, 1).await, WriteOutcome::Ignored);
    assert_eq!(h.gateway.sweep(false).await, 0);
    assert_eq!(h.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn backs_off_after_repeated_failures() {
    let mut h = harness(Device::default(), Settings::default());
    h.refuse.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        assert_eq!(h.gateway.connect(false).await, ConnectStatus::Failed);
    }
    assert_eq!(h.attempts.load(Ordering::SeqCst), 3);

    let status = h.gateway.connect(false).await;
    assert_eq!(status, ConnectStatus::BackingOff { retry_in: BACKOFF_BASE });
    assert_eq!(h.attempts.load(Ordering::SeqCst), 3);

    tokio::time::advance(BACKOFF_BASE).await;
    assert_eq!(h.gateway.connect(false).await, ConnectStatus::Failed);
    assert_eq!(h.attempts.load(Ordering::SeqCst), 4);
    let status = h.gateway.connect(false).await;
    assert_eq!(status, ConnectStatus::BackingOff { retry_in: 2 * BACKOFF_BASE });

    // Forced attempts ignore the cool-down.
    assert_eq!(h.gateway.connect(true).await, ConnectStatus::Failed);
    assert_eq!(h.attempts.load(Ordering::SeqCst), 5);

    h.refuse.store(false, Ordering::SeqCst);
    assert_eq!(h.gateway.connect(true).await, ConnectStatus::Connected);
    assert_eq!(h.gateway.connection_state().failed_attempts, 0);
    assert_eq!(h.gateway.next_attempt_at(), None);
}

#[tokio::test(start_paused = true)]
async fn retries_once_when_busy() {
    let device = Device::default().with(4, 30001, Reply::Value(42));
    device.busy_replies.store(1, Ordering::SeqCst);
    let mut h = harness(device, Settings::default());
    h.gateway.connect(true).await;
    assert_eq!(h.gateway.read_register(register("OUTSIDE_TEMPERATURE"), false).await, Some(42));
    assert_eq!(h.device.requests.load(Ordering::SeqCst), 2);

    h.device.busy_replies.store(2, Ordering::SeqCst);
    assert_eq!(h.gateway.read_register(register("OUTSIDE_TEMPERATURE"), false).await, None);
    assert_eq!(h.device.requests.load(Ordering::SeqCst), 4);
    assert!(h.gateway.is_connected());
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_repeated_timeouts() {
    let device = Device::default().with(4, 30001, Reply::Silent);
    let settings = Settings { reconnect_after_timeouts: 2, ..Settings::default() };
    let mut h = harness(device, settings);
    h.gateway.connect(true).await;

    let outside = register("OUTSIDE_TEMPERATURE");
    assert_eq!(h.gateway.read_register(outside, false).await, None);
    assert!(h.gateway.is_connected());
    assert_eq!(h.gateway.read_register(outside, false).await, None);
    assert!(!h.gateway.is_connected());

    assert_eq!(h.gateway.connect(false).await, ConnectStatus::Connected);
    assert_eq!(h.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn poller_publishes_snapshots_and_serves_writes() {
    let device =
        Device::default().with(4, 30001, Reply::Value(250)).with(3, 40001, Reply::Value(2));
    let h = harness(device, Settings::default());
    let writes = Arc::clone(&h.device.writes);
    let args = poller::Args {
        interval: Duration::from_secs(30).into(),
        sweep_timeout: Duration::from_secs(10).into(),
    };
    let cancel = CancellationToken::new();
    let (poller, handle) = Poller::new(h.gateway, &args, None, cancel.clone());
    let mut snapshots = handle.snapshots();

    let drive = async {
        snapshots.changed().await.unwrap();
        let snapshot = Arc::clone(&snapshots.borrow_and_update());
        assert!(snapshot.connected);
        assert_eq!(snapshot.value(register("OUTSIDE_TEMPERATURE")), Some(25.0));
        assert_eq!(snapshot.value(register("ERROR_CODE")), None);
        let (heating_power, value) = snapshot.calculated[0];
        assert_eq!(heating_power.name, "HEATING_POWER");
        assert_eq!(value, None);

        let outcome = handle.write(register("SYSTEM_MODE"), 3).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        cancel.cancel();
    };
    let (gateway, ()) = tokio::join!(poller.run(), drive);
    assert!(!gateway.is_connected());
    assert_eq!(*writes.lock().unwrap(), [(40001, 3)]);
    assert!(handle.write(register("SYSTEM_MODE"), 4).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn stalled_sweeps_are_cut_off() {
    let device = Device::default().with(4, 30001, Reply::Silent);
    let settings = Settings { read_timeout: Duration::from_secs(20), ..Settings::default() };
    let h = harness(device, settings);
    let attempts = Arc::clone(&h.attempts);
    let args = poller::Args {
        interval: Duration::from_secs(30).into(),
        sweep_timeout: Duration::from_secs(10).into(),
    };
    let cancel = CancellationToken::new();
    let (poller, handle) = Poller::new(h.gateway, &args, None, cancel.clone());
    let mut snapshots = handle.snapshots();
    let started = tokio::time::Instant::now();

    let drive = async {
        snapshots.changed().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(!snapshots.borrow_and_update().connected);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        snapshots.changed().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(40));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        cancel.cancel();
    };
    tokio::join!(poller.run(), drive);
}

//! Transport exchanging run data with workers over TCP.
//!
//! The runner side binds a listener and serves every incoming worker
//! session on its own thread. A session starts with the worker's
//! `Connect`, answered with the run's `Input`. On completion the worker
//! publishes `Output`, `Time` and `Done`, each acknowledged once applied.
//! `Done` is acknowledged only after the output and the done flag are in
//! the registry.
//!
//! Session outcomes are reported back to the runner side over a channel
//! and picked up on the next poll.

use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use fnv::FnvHashMap;

use campaign_core::config::{InterfaceConfig, TcpInterfaceConfig, WorkerConfig};
use campaign_core::interface::{Interface, RowMut, RowRef, RunnerInterface};
use campaign_core::registry::{Registry, RunSlot};
use campaign_core::{Float, Row, RunId, Schema};

use crate::error::{Error, Result};
use crate::msg::{self, Ack, Connect, Done, Input, MessageType, Output, Rejected, Time};

pub const LABEL: &str = "tcp";

/// Environment variable carrying the runner's address to workers.
pub const ENV_ADDRESS: &str = "CAMPAIGN_TCP_ADDRESS";

const ACCEPT_SLEEP: Duration = Duration::from_millis(5);

fn config(config: &InterfaceConfig) -> Result<&TcpInterfaceConfig> {
    match config {
        InterfaceConfig::Tcp(c) => Ok(c),
        other => Err(Error::CoreError(
            campaign_core::Error::InvalidConfiguration(format!(
                "expected tcp interface configuration, got {}",
                other.class()
            )),
        )),
    }
}

type Prepared = Arc<Mutex<FnvHashMap<RunId, Arc<RunSlot>>>>;

fn lock(prepared: &Prepared) -> MutexGuard<'_, FnvHashMap<RunId, Arc<RunSlot>>> {
    prepared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outcome of a worker session.
#[derive(Debug)]
enum SessionEvent {
    Done(RunId),
    Failed(RunId, String),
}

/// Runner side of the tcp transport.
pub struct TcpRunnerInterface {
    address: SocketAddr,
    registry: Arc<Registry>,
    prepared: Prepared,
    events: Receiver<SessionEvent>,
    failures: FnvHashMap<RunId, String>,
    shutdown: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl TcpRunnerInterface {
    /// Binds the listener and starts accepting worker sessions.
    pub fn new(config: &TcpInterfaceConfig, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind((config.address.as_str(), config.port))?;
        listener.set_nonblocking(true)?;
        let mut address = listener.local_addr()?;
        if address.ip().is_unspecified() {
            address.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        if let Some(connect) = &config.connect {
            address = connect.parse()?;
        }
        info!("tcp interface listening on {}", listener.local_addr()?);

        let prepared: Prepared = Arc::new(Mutex::new(FnvHashMap::default()));
        let (sender, events) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let prepared = prepared.clone();
            let shutdown = shutdown.clone();
            let output_schema = registry.output_schema().clone();
            thread::spawn(move || accept(listener, prepared, output_schema, sender, shutdown))
        };

        Ok(TcpRunnerInterface {
            address,
            registry,
            prepared,
            events,
            failures: FnvHashMap::default(),
            shutdown,
            listener: Some(handle),
        })
    }

    pub fn from_config(config: &InterfaceConfig, registry: Arc<Registry>) -> Result<Self> {
        TcpRunnerInterface::new(self::config(config)?, registry)
    }

    /// Address workers connect to.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    fn drain_events(&mut self) {
        for event in self.events.try_iter() {
            match event {
                SessionEvent::Done(id) => debug!("run {}: tcp session finished", id),
                SessionEvent::Failed(id, reason) => {
                    warn!("run {}: tcp session failed: {}", id, reason);
                    self.failures.insert(id, reason);
                }
            }
        }
    }
}

impl Drop for TcpRunnerInterface {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

impl RunnerInterface for TcpRunnerInterface {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn prepare(&mut self, run_id: RunId) -> campaign_core::Result<()> {
        let slot = self.registry.claim(run_id)?;
        lock(&self.prepared).insert(run_id, slot);
        Ok(())
    }

    fn poll_run(&mut self, run_id: RunId) -> campaign_core::Result<bool> {
        self.drain_events();
        if let Some(reason) = self.failures.remove(&run_id) {
            return Err(campaign_core::Error::MalformedOutput(reason));
        }
        self.registry.is_done(run_id)
    }

    fn worker_env(&self, _run_id: RunId) -> Vec<(String, String)> {
        vec![(ENV_ADDRESS.to_string(), self.address.to_string())]
    }

    fn clean_run(&mut self, run_id: RunId) -> campaign_core::Result<()> {
        lock(&self.prepared).remove(&run_id);
        self.failures.remove(&run_id);
        Ok(())
    }

    fn clean(&mut self) -> campaign_core::Result<()> {
        lock(&self.prepared).clear();
        self.failures.clear();
        Ok(())
    }
}

fn accept(
    listener: TcpListener,
    prepared: Prepared,
    output_schema: Arc<Schema>,
    events: Sender<SessionEvent>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!("accepted worker connection from {}", peer);
                let prepared = prepared.clone();
                let output_schema = output_schema.clone();
                let events = events.clone();
                thread::spawn(move || {
                    if let Err(e) = serve(stream, &prepared, output_schema, &events) {
                        debug!("worker session from {} ended: {}", peer, e);
                    }
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_SLEEP)
            }
            Err(e) => {
                error!("tcp listener failed: {}", e);
                break;
            }
        }
    }
}

/// Serves a single worker session until the worker signals done or
/// disconnects.
fn serve(
    stream: TcpStream,
    prepared: &Prepared,
    output_schema: Arc<Schema>,
    events: &Sender<SessionEvent>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let connect: Connect = msg::recv(&mut reader)?;
    let run_id = connect.run_id;
    let slot = lock(prepared).get(&run_id).cloned();
    let slot = match slot {
        Some(slot) => slot,
        None => {
            let reason = format!("run {} is not prepared", run_id);
            msg::send(
                &mut writer,
                &Rejected {
                    reason: reason.clone(),
                },
            )?;
            return Err(Error::HandshakeFailed(reason));
        }
    };
    let values = slot.input().values().to_vec();
    msg::send(&mut writer, &Input { values })?;

    loop {
        let message = msg::read_message(&mut reader)?;
        match message.type_ {
            MessageType::Output => {
                let output: Output = message.unpack_payload()?;
                match Row::from_values(output_schema.clone(), output.values) {
                    Ok(row) => slot.output().copy_from(&row),
                    Err(e) => {
                        let reason = e.to_string();
                        msg::send(
                            &mut writer,
                            &Rejected {
                                reason: reason.clone(),
                            },
                        )?;
                        let _ = events.send(SessionEvent::Failed(run_id, reason));
                        return Err(e.into());
                    }
                }
            }
            MessageType::Time => {
                let time: Time = message.unpack_payload()?;
                slot.set_time(time.secs);
            }
            MessageType::Done => {
                let _: Done = message.unpack_payload()?;
                slot.mark_done();
                msg::send(&mut writer, &Ack { of: MessageType::Done })?;
                let _ = events.send(SessionEvent::Done(run_id));
                return Ok(());
            }
            other => {
                return Err(Error::UnexpectedMessage {
                    expected: MessageType::Done,
                    got: other,
                })
            }
        }
        msg::send(&mut writer, &Ack { of: message.type_ })?;
    }
}

/// Worker side of the tcp transport.
pub struct TcpInterface {
    run_id: RunId,
    address: String,
    timeout: Duration,
    retries: u32,
    retry_sleep: Duration,
    input_schema: Arc<Schema>,
    stream: Option<TcpStream>,
    input: Option<Row>,
    output: Row,
    time: Float,
    done: bool,
}

impl TcpInterface {
    pub fn new(
        address: String,
        config: &TcpInterfaceConfig,
        run_id: RunId,
        input: Arc<Schema>,
        output: Arc<Schema>,
    ) -> Self {
        TcpInterface {
            run_id,
            address,
            timeout: Duration::from_millis(config.timeout),
            retries: config.retries,
            retry_sleep: Duration::from_secs_f64(config.retry_sleep.max(0.)),
            input_schema: input,
            stream: None,
            input: None,
            output: output.default_row(),
            time: 0.,
            done: false,
        }
    }

    /// Reads the runner's address from the environment, falling back to
    /// the configured one.
    pub fn from_worker_config(config: &WorkerConfig, run_id: RunId) -> Result<Self> {
        let tcp = self::config(&config.interface)?;
        let address = match std::env::var(ENV_ADDRESS) {
            Ok(a) => a,
            Err(_) => match &tcp.connect {
                Some(c) => c.clone(),
                None => format!("{}:{}", tcp.address, tcp.port),
            },
        };
        Ok(TcpInterface::new(
            address,
            tcp,
            run_id,
            config.input_schema(),
            config.output_schema(),
        ))
    }

    fn open(&self) -> Result<TcpStream> {
        let mut attempt = 0;
        loop {
            let result = self
                .address
                .to_socket_addrs()
                .map_err(Error::from)
                .and_then(|mut addrs| addrs.next().ok_or(Error::SocketNotConnected))
                .and_then(|addr| Ok(TcpStream::connect_timeout(&addr, self.timeout)?));
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    debug!(
                        "run {}: connecting to {} failed ({}), retry {}/{}",
                        self.run_id, self.address, e, attempt, self.retries
                    );
                    thread::sleep(self.retry_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(Error::SocketNotConnected)
    }

    fn request<P: msg::Payload>(&mut self, payload: &P) -> Result<()> {
        let stream = self.stream()?;
        msg::send(&mut *stream, payload)?;
        let ack: Ack = msg::recv(&mut *stream)?;
        if ack.of != P::TYPE {
            return Err(Error::UnexpectedMessage {
                expected: P::TYPE,
                got: ack.of,
            });
        }
        Ok(())
    }

    fn check_connected(&self) -> campaign_core::Result<()> {
        if self.input.is_some() {
            Ok(())
        } else {
            Err(campaign_core::Error::NotReady)
        }
    }

    fn publish(&mut self) -> Result<()> {
        let values = self.output.values().to_vec();
        self.request(&Output { values })?;
        let secs = self.time;
        self.request(&Time { secs })?;
        self.request(&Done {})
    }
}

impl Interface for TcpInterface {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn run_id(&self) -> RunId {
        self.run_id
    }

    fn connect(&mut self) -> campaign_core::Result<()> {
        if self.input.is_some() {
            return Ok(());
        }
        let mut stream = self.open()?;
        stream.set_read_timeout(Some(self.timeout)).map_err(Error::from)?;
        stream.set_nodelay(true).map_err(Error::from)?;
        msg::send(
            &mut stream,
            &Connect {
                run_id: self.run_id,
            },
        )?;
        let input: Input = msg::recv(&mut stream).map_err(|e| match e {
            Error::Rejected(reason) => Error::HandshakeFailed(reason),
            e => e,
        })?;
        self.input = Some(Row::from_values(self.input_schema.clone(), input.values)?);
        self.stream = Some(stream);
        debug!("run {} connected to {}", self.run_id, self.address);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.input.is_some()
    }

    fn input(&self) -> campaign_core::Result<RowRef<'_>> {
        self.input
            .as_ref()
            .map(RowRef::Local)
            .ok_or(campaign_core::Error::NotReady)
    }

    fn output(&mut self) -> campaign_core::Result<RowMut<'_>> {
        self.check_connected()?;
        Ok(RowMut::Local(&mut self.output))
    }

    fn time(&self) -> campaign_core::Result<Float> {
        self.check_connected()?;
        Ok(self.time)
    }

    fn set_time(&mut self, secs: Float) -> campaign_core::Result<()> {
        self.check_connected()?;
        self.time = secs;
        Ok(())
    }

    fn done(&mut self) -> campaign_core::Result<()> {
        self.check_connected()?;
        if self.done {
            return Ok(());
        }
        self.publish()?;
        self.done = true;
        self.stream = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::row::Field;
    use campaign_core::{RunStatus, Var, VarType};

    fn schema(name: &str) -> Arc<Schema> {
        Arc::new(Schema::new(vec![Field {
            name: name.to_string(),
            vtype: VarType::Float,
            len: None,
        }]))
    }

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(schema("u"), schema("f"), 2))
    }

    fn worker(runner: &TcpRunnerInterface, run_id: RunId) -> TcpInterface {
        TcpInterface::new(
            runner.address().to_string(),
            &TcpInterfaceConfig {
                timeout: 2000,
                retries: 2,
                retry_sleep: 0.05,
                ..Default::default()
            },
            run_id,
            schema("u"),
            schema("f"),
        )
    }

    #[test]
    fn output_reaches_registry_before_done_ack() {
        let registry = registry();
        let id = registry.allocate(1).start;
        let mut input = registry.input_schema().default_row();
        input.set("u", Var::Float(0.25)).unwrap();
        registry.set_input(id, input).unwrap();
        registry.set_status(id, RunStatus::Running).unwrap();

        let mut runner = TcpRunnerInterface::new(&TcpInterfaceConfig::default(), registry.clone())
            .unwrap();
        runner.prepare(id).unwrap();
        let mut worker = worker(&runner, id);
        assert!(worker.output().is_err());
        worker.connect().unwrap();
        let u = worker.input().unwrap().get_float("u").unwrap();
        worker.output().unwrap().set("f", Var::Float(u * 4.)).unwrap();
        worker.set_time(0.5).unwrap();
        assert!(!runner.poll_run(id).unwrap());

        worker.done().unwrap();
        worker.done().unwrap();
        // acknowledged, so already visible
        assert!(registry.is_done(id).unwrap());
        assert!(runner.poll_run(id).unwrap());
        assert_eq!(registry.get_status(id).unwrap(), RunStatus::Done);
        let output = registry.read_output(id).unwrap().unwrap();
        assert_eq!(output.get("f"), Some(&Var::Float(1.)));
        assert_eq!(registry.elapsed(id).unwrap().as_secs_f64(), 0.5);
    }

    #[test]
    fn unprepared_run_fails_handshake() {
        let registry = registry();
        let id = registry.allocate(1).start;
        let runner = TcpRunnerInterface::new(&TcpInterfaceConfig::default(), registry).unwrap();
        let mut worker = worker(&runner, id);
        assert!(worker.connect().is_err());
        assert!(!worker.is_connected());
    }

    #[test]
    fn malformed_output_is_rejected() {
        let registry = registry();
        let id = registry.allocate(1).start;
        let mut runner = TcpRunnerInterface::new(&TcpInterfaceConfig::default(), registry.clone())
            .unwrap();
        runner.prepare(id).unwrap();

        let mut stream = TcpStream::connect(runner.address()).unwrap();
        msg::send(&mut stream, &Connect { run_id: id }).unwrap();
        let _: Input = msg::recv(&mut stream).unwrap();
        msg::send(&mut stream, &Output { values: vec![] }).unwrap();
        assert!(matches!(
            msg::recv::<_, Ack>(&mut stream),
            Err(Error::Rejected(_))
        ));

        // session events arrive asynchronously
        let mut failed = false;
        for _ in 0..100 {
            match runner.poll_run(id) {
                Err(campaign_core::Error::MalformedOutput(_)) => {
                    failed = true;
                    break;
                }
                Ok(false) => thread::sleep(Duration::from_millis(10)),
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert!(failed);
        assert_eq!(registry.read_output(id).unwrap(), None);
    }

    #[test]
    fn connect_retries_then_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let mut worker = TcpInterface::new(
            address,
            &TcpInterfaceConfig {
                timeout: 100,
                retries: 1,
                retry_sleep: 0.01,
                ..Default::default()
            },
            0,
            schema("u"),
            schema("f"),
        );
        assert!(worker.connect().is_err());
    }
}

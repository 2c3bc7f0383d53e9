// src/host.rs - tokio driver: feeds origins through channels and ticks the dispatcher
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use krusty_shared::{Clock, FileStore, MotionSubsystem, MoveSlot, NetworkSource, Peripherals, SerialLine};
use krusty_simulator::{SimHeaters, SimMotion};

use crate::config::{Config, ConfigError};
use crate::gcode::{Dispatcher, GCodeError};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("G-code error: {0}")]
    GCode(#[from] GCodeError),
}

/// Whole lines from the network side; replies go back on a channel.
pub struct ChannelNetwork {
    incoming: mpsc::Receiver<String>,
    replies: mpsc::UnboundedSender<String>,
}

impl ChannelNetwork {
    pub fn new(incoming: mpsc::Receiver<String>, replies: mpsc::UnboundedSender<String>) -> Self {
        ChannelNetwork { incoming, replies }
    }
}

impl NetworkSource for ChannelNetwork {
    fn has_pending(&self) -> bool {
        !self.incoming.is_empty()
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        self.incoming.try_recv().ok().map(String::into_bytes)
    }

    fn reply(&mut self, line: &str) {
        let _ = self.replies.send(line.to_string());
    }
}

/// Serial bytes arrive in chunks from the reader task.
pub struct ChannelSerial {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
    replies: mpsc::UnboundedSender<String>,
}

impl ChannelSerial {
    pub fn new(incoming: mpsc::UnboundedReceiver<Vec<u8>>, replies: mpsc::UnboundedSender<String>) -> Self {
        ChannelSerial { incoming, pending: VecDeque::new(), replies }
    }
}

impl SerialLine for ChannelSerial {
    fn byte_available(&self) -> bool {
        !self.pending.is_empty() || !self.incoming.is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if self.pending.is_empty() {
            if let Ok(chunk) = self.incoming.try_recv() {
                self.pending.extend(chunk);
            }
        }
        self.pending.pop_front()
    }

    fn write_line(&mut self, line: &str) {
        let _ = self.replies.send(line.to_string());
    }
}

pub struct StdClock {
    origin: tokio::time::Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        StdClock { origin: tokio::time::Instant::now() }
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Serial device; stdin/stdout stand in for it when absent.
    pub serial: Option<String>,
    pub baud: u32,
    pub run_config: bool,
    /// Lines queued on the network origin at start.
    pub exec: Vec<String>,
    /// Stop once queued input is consumed and the dispatcher is idle.
    pub exit_when_idle: bool,
}

pub struct Host {
    dispatcher: Dispatcher,
    motion: SimMotion,
    heaters: SimHeaters,
    files: Box<dyn FileStore>,
    tick: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl Host {
    pub fn new(config: Config, files: Box<dyn FileStore>) -> Result<Self, HostError> {
        let slot = MoveSlot::new();
        let heaters = SimHeaters::new(config.machine.heaters).with_tolerance(config.heaters.tolerance);
        let tick = Duration::from_millis(config.host.tick_interval_ms);
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Host {
            motion: SimMotion::new(slot.clone()),
            heaters,
            dispatcher: Dispatcher::new(config, slot)?,
            files,
            tick,
            shutdown_tx,
        })
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Runs until shutdown. Must be driven inside a `LocalSet`.
    pub async fn run(mut self, options: HostOptions) -> Result<(), HostError> {
        let (net_tx, net_rx) = mpsc::channel::<String>(options.exec.len().max(64));
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<String>();
        let (serial_tx, serial_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (serial_reply_tx, serial_reply_rx) = mpsc::unbounded_channel::<String>();

        for line in &options.exec {
            if net_tx.send(line.clone()).await.is_err() {
                break;
            }
        }
        let interactive = !options.exit_when_idle;
        drop(net_tx);

        match &options.serial {
            Some(path) => {
                let port = Arc::new(serial2_tokio::SerialPort::open(path, options.baud)?);
                tracing::info!(%path, baud = options.baud, "serial line open");
                tokio::task::spawn_local(serial_reader(port.clone(), serial_tx, self.shutdown_tx.subscribe()));
                tokio::task::spawn_local(serial_writer(port, serial_reply_rx));
            }
            None if interactive => {
                tokio::task::spawn_local(stdin_reader(serial_tx, self.shutdown_tx.subscribe()));
                tokio::task::spawn_local(stdout_writer(serial_reply_rx));
            }
            None => {
                drop(serial_tx);
                tokio::task::spawn_local(stdout_writer(serial_reply_rx));
            }
        }
        tokio::task::spawn_local(stdout_writer(reply_rx));

        let mut network = ChannelNetwork::new(net_rx, reply_tx);
        let mut serial = ChannelSerial::new(serial_rx, serial_reply_tx);
        let clock = StdClock::default();

        if options.run_config {
            let mut io = Peripherals {
                motion: &mut self.motion,
                heaters: &mut self.heaters,
                files: self.files.as_mut(),
                network: &mut network,
                serial: &mut serial,
                clock: &clock,
            };
            if let Err(e) = self.dispatcher.run_configuration(&mut io) {
                tracing::warn!("Configuration macro not run: {}", e);
            }
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "dispatcher loop started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Dispatcher loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    {
                        let mut io = Peripherals {
                            motion: &mut self.motion,
                            heaters: &mut self.heaters,
                            files: self.files.as_mut(),
                            network: &mut network,
                            serial: &mut serial,
                            clock: &clock,
                        };
                        self.dispatcher.spin(&mut io);
                    }
                    self.motion.step();
                    self.heaters.step();
                    let drained = !network.has_pending() && !serial.byte_available();
                    if options.exit_when_idle && drained && self.dispatcher.is_idle() && self.motion_settled() {
                        tracing::info!("All queued commands done");
                        break;
                    }
                }
            }
        }
        let _ = self.shutdown_tx.send(());
        // Let the writer tasks flush what is already queued.
        tokio::task::yield_now().await;
        Ok(())
    }

    fn motion_settled(&self) -> bool {
        self.motion.all_moves_finished()
    }
}

async fn serial_reader(port: Arc<serial2_tokio::SerialPort>, tx: mpsc::UnboundedSender<Vec<u8>>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            read = port.read(&mut buf) => match read {
                Ok(0) => continue,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Serial read error: {}", e);
                    break;
                }
            },
        }
    }
}

async fn serial_writer(port: Arc<serial2_tokio::SerialPort>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Err(e) = port.write_all(&bytes).await {
            tracing::error!("Serial write error: {}", e);
            break;
        }
    }
}

/// Stands in for the serial line on a terminal.
async fn stdin_reader(tx: mpsc::UnboundedSender<Vec<u8>>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    if tx.send(bytes).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("stdin read error: {}", e);
                    break;
                }
            },
        }
    }
}

async fn stdout_writer(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        if stdout.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_serial_drains_chunks_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut serial = ChannelSerial::new(rx, reply_tx);
        assert!(!serial.byte_available());
        tx.send(b"G2".to_vec()).unwrap();
        tx.send(b"8\n".to_vec()).unwrap();
        let mut bytes = Vec::new();
        while serial.byte_available() {
            bytes.extend(serial.read_byte());
        }
        assert_eq!(bytes, b"G28\n");
        serial.write_line("ok");
        assert_eq!(reply_rx.recv().await.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn channel_network_reports_pending_lines() {
        let (tx, rx) = mpsc::channel(4);
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();
        let mut network = ChannelNetwork::new(rx, reply_tx);
        assert!(!network.has_pending());
        tx.send("M115".to_string()).await.unwrap();
        assert!(network.has_pending());
        assert_eq!(network.next_line(), Some(b"M115".to_vec()));
        assert_eq!(network.next_line(), None);
    }

    #[tokio::test]
    async fn executes_queued_lines_and_stops_when_idle() {
        let mut files = krusty_simulator::MemoryFiles::new();
        files.insert("sys/config.g", "M83\n");
        let host = Host::new(Config::default(), Box::new(files)).unwrap();
        let options = HostOptions {
            run_config: true,
            exec: vec!["G91".to_string(), "G1 X5 F600".to_string()],
            exit_when_idle: true,
            ..HostOptions::default()
        };
        let local = tokio::task::LocalSet::new();
        let run = local.run_until(host.run(options));
        tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    }
}

//! Simulated motor controller for integration tests
//!
//! The host end of a socket pair stands in for the serial port; a thread on the
//! other end plays the device according to a [`DeviceScript`].

#![allow(dead_code)]

use smov_core::protocol::{
    Command, ConnectionConfig, PacketDecoder, Response, SpeedLimits, Transport,
};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Host end of the simulated serial line
pub struct SocketChannel {
    stream: UnixStream,
}

impl Read for SocketChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for SocketChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for SocketChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        // Drain whatever is queued without blocking
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.stream.set_nonblocking(false)?;
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(SocketChannel {
            stream: self.stream.try_clone()?,
        }))
    }
}

/// How the simulated device behaves
#[derive(Debug, Clone)]
pub struct DeviceScript {
    /// Protocol version announced in the handshake reply
    pub version: u16,
    /// Speed range announced by version 2 devices
    pub limits: Option<(i16, i16)>,
    /// Answer the handshake at all
    pub answer_hello: bool,
    /// Acknowledge speed commands and pings
    pub acknowledge: bool,
    /// Status byte put in acknowledgments
    pub ack_status: u8,
    /// Report this fault code after acknowledging a speed command
    pub fault_on_speed: Option<u16>,
    /// Close the line after this many speed commands
    pub hang_up_after: Option<usize>,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            version: 1,
            limits: None,
            answer_hello: true,
            acknowledge: true,
            ack_status: 0,
            fault_on_speed: None,
            hang_up_after: None,
        }
    }
}

/// Running simulated device
pub struct SimulatedDevice {
    received: Arc<Mutex<Vec<Command>>>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    /// Every command the device has decoded so far
    pub fn received(&self) -> Vec<Command> {
        self.received.lock().unwrap().clone()
    }

    /// Speed values received so far
    pub fn speeds(&self) -> Vec<i16> {
        self.received()
            .into_iter()
            .filter_map(|c| match c {
                Command::SetSpeed { speed, .. } => Some(speed),
                _ => None,
            })
            .collect()
    }

    /// Wait for the device thread to see the line close
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Create a socket pair and start a device on one end
pub fn spawn_device(script: DeviceScript) -> (Box<dyn Transport>, SimulatedDevice) {
    let (host, device) = UnixStream::pair().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let thread = thread::spawn({
        let received = received.clone();
        move || run_device(device, script, received)
    });

    (
        Box::new(SocketChannel { stream: host }),
        SimulatedDevice {
            received,
            thread: Some(thread),
        },
    )
}

fn run_device(mut stream: UnixStream, script: DeviceScript, received: Arc<Mutex<Vec<Command>>>) {
    let mut decoder = PacketDecoder::new();
    let mut buf = [0u8; 128];
    let mut speed_commands = 0;

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.push(&buf[..n]);

        while let Ok(Some(packet)) = decoder.next_packet() {
            let Ok(command) = Command::from_packet(&packet) else {
                continue;
            };
            received.lock().unwrap().push(command);

            let mut reply = Vec::new();
            match command {
                Command::Hello if script.answer_hello => {
                    let limits = if script.version >= 2 { script.limits } else { None };
                    reply.extend(
                        Response::HelloReply {
                            version: script.version,
                            limits,
                        }
                        .to_bytes(),
                    );
                }
                Command::SetSpeed { seq, .. } => {
                    speed_commands += 1;
                    if script.acknowledge {
                        reply.extend(
                            Response::Ack {
                                seq,
                                status: script.ack_status,
                            }
                            .to_bytes(),
                        );
                    }
                    if let Some(code) = script.fault_on_speed {
                        reply.extend(Response::Fault { code }.to_bytes());
                    }
                }
                Command::Ping { seq } if script.acknowledge => {
                    reply.extend(Response::Ack { seq, status: 0 }.to_bytes());
                }
                _ => {}
            }

            if !reply.is_empty() && stream.write_all(&reply).is_err() {
                return;
            }
            if script.hang_up_after == Some(speed_commands) && speed_commands > 0 {
                return;
            }
        }
    }
}

/// Connection settings sized for tests: no boot delay, short timeouts, no heartbeat
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        settle_delay_ms: 0,
        handshake_timeout_ms: 300,
        poll_interval_ms: 5,
        ack_timeout_ms: 2000,
        heartbeat_interval_ms: 0,
        speed_limits: SpeedLimits::default(),
        ..ConnectionConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

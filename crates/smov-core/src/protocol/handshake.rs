//! Connection handshake
//!
//! The host sends `HELLO`, the device answers with its signature and protocol
//! version (plus its speed range from version 2 on), and the host closes the
//! exchange with a `VERSION_ACK` verdict.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use super::commands::{Command, Response};
use super::stream::{is_idle, Transport};
use super::{Packet, PacketDecoder, ProtocolError, SUPPORTED_VERSIONS};

/// Outcome of a successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    /// Protocol version reported by the device
    pub version: u16,
    /// Speed range reported by the device, if its version carries one
    pub limits: Option<(i16, i16)>,
}

/// Run the version exchange on a freshly opened transport.
///
/// Blocks for at most `timeout` waiting for the device. Bytes that arrive after
/// the reply stay in `decoder` for the link thread.
pub(crate) fn negotiate(
    transport: &mut dyn Transport,
    decoder: &mut PacketDecoder,
    timeout: Duration,
) -> Result<Negotiated, ProtocolError> {
    let deadline = Instant::now() + timeout;

    tracing::debug!("handshake: sending HELLO");
    transport.write_all(&Command::Hello.to_bytes())?;

    let (version, limits) = loop {
        let packet = read_packet(transport, decoder, deadline)?;
        match Response::from_packet(&packet) {
            Ok(Response::HelloReply { version, limits }) => break (version, limits),
            Ok(other) => {
                tracing::debug!("handshake: skipping {:?} while waiting for reply", other);
            }
            Err(ProtocolError::WrongDevice) => return Err(ProtocolError::WrongDevice),
            Err(e) => {
                tracing::warn!("handshake: dropping undecodable frame: {}", e);
            }
        }
    };

    tracing::debug!("handshake: device reports protocol version {}", version);

    if !SUPPORTED_VERSIONS.contains(&version) {
        // Tell the device we are going away; the failure we report is the version
        if let Err(e) = transport.write_all(&Command::VersionAck { accepted: false }.to_bytes()) {
            tracing::debug!("handshake: could not send rejection: {}", e);
        }
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    transport.write_all(&Command::VersionAck { accepted: true }.to_bytes())?;

    Ok(Negotiated { version, limits })
}

/// Read until one complete packet is decoded or the deadline passes
fn read_packet(
    transport: &mut dyn Transport,
    decoder: &mut PacketDecoder,
    deadline: Instant,
) -> Result<Packet, ProtocolError> {
    let mut buffer = [0u8; 64];

    loop {
        match decoder.next_packet() {
            Ok(Some(packet)) => return Ok(packet),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("handshake: resynchronising after bad frame: {}", e);
                continue;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!("handshake: no reply before timeout");
            return Err(ProtocolError::Timeout);
        }
        transport.set_timeout(remaining)?;

        match transport.read(&mut buffer) {
            Ok(0) => {
                return Err(io::Error::from_raw_os_error(libc::ENODEV).into());
            }
            Ok(n) => {
                tracing::trace!("handshake: read {} bytes: {:02x?}", n, &buffer[..n]);
                decoder.push(&buffer[..n]);
            }
            Err(e) if is_idle(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorKind;
    use std::collections::VecDeque;

    /// Scripted transport: replays canned input and records output
    struct Scripted {
        input: VecDeque<u8>,
        output: Vec<u8>,
        eof: bool,
    }

    impl Scripted {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: input.into(),
                output: Vec::new(),
                eof: false,
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                if self.eof {
                    return Ok(0);
                }
                std::thread::sleep(Duration::from_millis(5));
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(self.input.len());
            for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Scripted {
        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn clear_input_buffer(&mut self) -> io::Result<()> {
            self.input.clear();
            Ok(())
        }

        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }

    fn sent_commands(output: &[u8]) -> Vec<Command> {
        let mut decoder = PacketDecoder::new();
        decoder.push(output);
        let mut commands = Vec::new();
        while let Some(packet) = decoder.next_packet().unwrap() {
            commands.push(Command::from_packet(&packet).unwrap());
        }
        commands
    }

    fn hello_reply(version: u16, limits: Option<(i16, i16)>) -> Vec<u8> {
        Response::HelloReply { version, limits }.to_bytes()
    }

    #[test]
    fn test_accepts_supported_version() {
        let mut transport = Scripted::new(hello_reply(1, None));
        let mut decoder = PacketDecoder::new();

        let negotiated =
            negotiate(&mut transport, &mut decoder, Duration::from_millis(200)).unwrap();

        assert_eq!(
            negotiated,
            Negotiated {
                version: 1,
                limits: None
            }
        );
        assert_eq!(
            sent_commands(&transport.output),
            vec![Command::Hello, Command::VersionAck { accepted: true }]
        );
    }

    #[test]
    fn test_version_two_reports_limits() {
        let mut transport = Scripted::new(hello_reply(2, Some((-50, 800))));
        let mut decoder = PacketDecoder::new();

        let negotiated =
            negotiate(&mut transport, &mut decoder, Duration::from_millis(200)).unwrap();
        assert_eq!(negotiated.version, 2);
        assert_eq!(negotiated.limits, Some((-50, 800)));
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let mut transport = Scripted::new(hello_reply(3, None));
        let mut decoder = PacketDecoder::new();

        let err = negotiate(&mut transport, &mut decoder, Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion(3));
        assert_eq!(
            sent_commands(&transport.output),
            vec![Command::Hello, Command::VersionAck { accepted: false }]
        );
    }

    #[test]
    fn test_silent_device_times_out() {
        let mut transport = Scripted::new(Vec::new());
        let mut decoder = PacketDecoder::new();

        let start = Instant::now();
        let err = negotiate(&mut transport, &mut decoder, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
        assert_eq!(err.kind(), ErrorKind::CommunicationFailure(libc::ETIMEDOUT));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_closed_stream() {
        let mut transport = Scripted::new(Vec::new());
        transport.eof = true;
        let mut decoder = PacketDecoder::new();

        let err = negotiate(&mut transport, &mut decoder, Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommunicationFailure(libc::ENODEV));
    }

    #[test]
    fn test_wrong_signature() {
        let mut transport = Scripted::new(Packet::new(b"\x81nope\x00\x01".to_vec()).to_bytes());
        let mut decoder = PacketDecoder::new();

        let err = negotiate(&mut transport, &mut decoder, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, ProtocolError::WrongDevice));
    }

    #[test]
    fn test_skips_noise_and_stale_frames() {
        let mut input = vec![0xAA, 0x00, 0x13];
        input.extend(Response::Fault { code: 5 }.to_bytes());
        input.extend(hello_reply(2, None));
        input.extend(Response::Ack { seq: 0, status: 0 }.to_bytes());
        let mut transport = Scripted::new(input);
        let mut decoder = PacketDecoder::new();

        let negotiated =
            negotiate(&mut transport, &mut decoder, Duration::from_millis(200)).unwrap();
        assert_eq!(negotiated.version, 2);

        // Whatever followed the reply is left for the link thread
        let leftover = decoder.next_packet().unwrap().expect("ack still buffered");
        assert_eq!(
            Response::from_packet(&leftover).unwrap(),
            Response::Ack { seq: 0, status: 0 }
        );
    }
}

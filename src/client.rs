//! A small blocking TFTP client: one socket per transfer, stop-and-wait,
//! retransmission on a fixed receive timeout. Used by the `tftpc` binary.

use crate::fileio::{BlockSink, BlockSource};
use crate::packet::{ErrorCode, Packet, PacketErr, TransferMode, MAX_PACKET_SIZE};
use crate::tftp_proto::{DEFAULT_BLOCKSIZE, MAX_TIMEOUTS};
use log::*;
use std::fs::File;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;
use std::result;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    Packet(PacketErr),
    /// The server answered with an ERROR frame
    Server { code: ErrorCode, msg: String },
    /// The server stopped answering
    Timeout,
    /// The server sent a frame that makes no sense at this point
    Unexpected(Packet),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(err)
    }
}

impl From<PacketErr> for ClientError {
    fn from(err: PacketErr) -> Self {
        ClientError::Packet(err)
    }
}

pub type Result<T> = result::Result<T, ClientError>;

pub struct ClientConfig {
    /// The server's listener address (normally port 69)
    pub server: SocketAddr,
    /// Local address to bind to; defaults to the wildcard address
    pub interface: Option<IpAddr>,
    pub mode: TransferMode,
}

/// Fetches `filename` from the server into the current directory,
/// named after the request's final path component.
pub fn get_file(cfg: &ClientConfig, filename: &str) -> Result<()> {
    let socket = bind_socket(cfg)?;
    let mut buf = vec![0; MAX_PACKET_SIZE];

    let file = File::create(base_name(filename)?)?;
    let mut sink = BlockSink::new(file, cfg.mode);

    let mut peer = None;
    let mut dest = cfg.server;
    let mut pending = Packet::RRQ {
        filename: filename.to_owned(),
        mode: cfg.mode,
        options: vec![],
    }
    .into_bytes();
    let mut expected: u16 = 1;

    loop {
        let (packet, src) = exchange(&socket, dest, &pending, &mut peer, &mut buf)?;
        dest = src;
        match packet {
            Packet::DATA { block_num, data } if block_num == expected => {
                sink.write(&data)?;
                let ack = Packet::ACK(block_num).into_bytes();
                if data.len() < usize::from(DEFAULT_BLOCKSIZE) {
                    socket.send_to(&ack, src)?;
                    sink.finish()?;
                    info!("received {} ({} blocks)", filename, expected);
                    return Ok(());
                }
                expected = expected.wrapping_add(1);
                pending = ack;
            }
            Packet::DATA { block_num, .. } if block_num == expected.wrapping_sub(1) => {
                // duplicate block: our previous ACK was lost, repeat it
                debug!("duplicate DATA #{}", block_num);
                pending = Packet::ACK(block_num).into_bytes();
            }
            Packet::ERROR { code, msg } => return Err(ClientError::Server { code, msg }),
            other => return Err(ClientError::Unexpected(other)),
        }
    }
}

/// Stores a local file on the server under its final path component.
pub fn put_file(cfg: &ClientConfig, filename: &str) -> Result<()> {
    let socket = bind_socket(cfg)?;
    let mut buf = vec![0; MAX_PACKET_SIZE];

    let file = File::open(filename)?;
    let mut source = BlockSource::new(file, cfg.mode);

    let mut peer = None;
    let mut dest = cfg.server;
    let mut pending = Packet::WRQ {
        filename: base_name(filename)?.to_owned(),
        mode: cfg.mode,
        options: vec![],
    }
    .into_bytes();
    let mut block: u16 = 0;
    let mut sent_final = false;

    loop {
        let (packet, src) = exchange(&socket, dest, &pending, &mut peer, &mut buf)?;
        dest = src;
        match packet {
            Packet::ACK(n) if n == block => {
                if sent_final {
                    info!("sent {} ({} blocks)", filename, block);
                    return Ok(());
                }
                block = block.wrapping_add(1);
                let data = source.fill(usize::from(DEFAULT_BLOCKSIZE))?;
                sent_final = data.len() < usize::from(DEFAULT_BLOCKSIZE);
                pending = Packet::DATA {
                    block_num: block,
                    data,
                }
                .into_bytes();
            }
            Packet::ACK(n) if n == block.wrapping_sub(1) => {
                // stale ACK for the previous block; resend the current one
                debug!("stale ACK #{}", n);
            }
            Packet::ERROR { code, msg } => return Err(ClientError::Server { code, msg }),
            other => return Err(ClientError::Unexpected(other)),
        }
    }
}

fn bind_socket(cfg: &ClientConfig) -> Result<UdpSocket> {
    let local = cfg.interface.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
    let socket = UdpSocket::bind((local, 0))?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

/// The final path component, used as the remote name on writes and the
/// local name on reads.
fn base_name(filename: &str) -> Result<&str> {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            ClientError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no usable file name in {:?}", filename),
            ))
        })
}

/// Sends `frame` and waits for the peer's reply, retransmitting on
/// timeout until the retry budget is exhausted.
fn exchange(
    socket: &UdpSocket,
    dest: SocketAddr,
    frame: &[u8],
    peer: &mut Option<SocketAddr>,
    buf: &mut [u8],
) -> Result<(Packet, SocketAddr)> {
    for attempt in 0..MAX_TIMEOUTS {
        if attempt > 0 {
            debug!("no reply, retransmitting (attempt {})", attempt + 1);
        }
        socket.send_to(frame, dest)?;
        match recv_reply(socket, peer, buf) {
            Err(ClientError::Timeout) => {}
            other => return other,
        }
    }
    Err(ClientError::Timeout)
}

/// Receives the next frame from the pinned peer. The first reply pins the
/// server's transfer ID; frames from anyone else are answered with an
/// ERROR and ignored.
fn recv_reply(
    socket: &UdpSocket,
    peer: &mut Option<SocketAddr>,
    buf: &mut [u8],
) -> Result<(Packet, SocketAddr)> {
    loop {
        match socket.recv_from(buf) {
            Ok((amt, src)) => {
                if let Some(pinned) = *peer {
                    if pinned != src {
                        warn!("frame from unexpected source {}", src);
                        let reject = Packet::from(ErrorCode::UnknownID).into_bytes();
                        let _ = socket.send_to(&reject, src);
                        continue;
                    }
                }
                let packet = Packet::read(&buf[..amt])?;
                *peer = Some(src);
                return Ok((packet, src));
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(ClientError::Timeout);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("plain.txt").unwrap(), "plain.txt");
        assert_eq!(base_name("a/b/nested.bin").unwrap(), "nested.bin");
        assert_eq!(base_name("/abs/path.txt").unwrap(), "path.txt");
    }

    #[test]
    fn base_name_rejects_directories() {
        assert!(base_name("..").is_err());
        assert!(base_name("/").is_err());
    }
}

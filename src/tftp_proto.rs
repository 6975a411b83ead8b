use crate::fileio::{resolve_under_root, BlockSink, BlockSource, IOAdapter};
use crate::packet::{ErrorCode, Packet, TftpOption, MAX_BLOCKSIZE};
use log::*;
use sna::SerialNumber;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Consecutive unanswered (re)transmissions before a transfer is abandoned.
pub const MAX_TIMEOUTS: u8 = 3;

pub const DEFAULT_BLOCKSIZE: u16 = 512;

#[derive(Debug, PartialEq)]
pub enum TftpError {
    /// The received packet type cannot be used to initiate a transfer
    NotInitiatingPacket,
}

/// Engine states. `Send*` states want the socket writable, `Wait*` states
/// want it readable; `Finished` wants the connection torn down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum State {
    SendData,
    WaitAck,
    SendAck,
    WaitData,
    SendOack,
    SendError,
    Finished,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            State::SendData => "SEND_DATA",
            State::WaitAck => "WAIT_ACK",
            State::SendAck => "SEND_ACK",
            State::WaitData => "WAIT_DATA",
            State::SendOack => "SEND_OACK",
            State::SendError => "SEND_ERROR",
            State::Finished => "FINISHED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Read,
    Write,
}

/// The request-intake half of the protocol: sandbox authorization, option
/// negotiation and file open, producing a per-client `Transfer` engine.
pub struct TftpServerProto<IO: IOAdapter> {
    io: IO,
    root: PathBuf,
}

impl<IO: IOAdapter> TftpServerProto<IO> {
    /// `root` must be absolute; request paths resolve beneath it.
    pub fn new(io: IO, root: PathBuf) -> Self {
        Self { io, root }
    }

    /// Signals the receipt of a transfer-initiating packet (either RRQ or
    /// WRQ). The returned `Transfer` owns all further protocol steps for
    /// this client, starting with the frame its initial state emits; denied
    /// requests yield a `Transfer` that sends one ERROR and finishes.
    pub fn rx_initial(
        &mut self,
        packet: Packet,
        mtu: Option<u32>,
    ) -> Result<Transfer<IO>, TftpError> {
        let (filename, mode, options, dir) = match packet {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, Direction::Read),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, Direction::Write),
            _ => return Err(TftpError::NotInitiatingPacket),
        };

        let path = match resolve_under_root(&self.root, &filename) {
            Some(p) => p,
            None => {
                warn!("request for {:?} escapes the served directory", filename);
                return Ok(Transfer::denied(ErrorCode::AccessViolation.into()));
            }
        };
        match dir {
            Direction::Write => {
                if self.io.exists(&path) {
                    return Ok(Transfer::denied(ErrorCode::FileExists.into()));
                }
            }
            Direction::Read => {
                if !self.io.exists(&path) {
                    // historical wire behavior: not-found reads go out as
                    // code 2 with this exact message
                    return Ok(Transfer::denied(Packet::ERROR {
                        code: ErrorCode::AccessViolation,
                        msg: "File not found".to_owned(),
                    }));
                }
            }
        }

        let mut blocksize = DEFAULT_BLOCKSIZE;
        let mut timeout_s = None;
        let mut declared_size = None;
        let mut wants_tsize = false;
        let mut oack = vec![];
        for opt in options {
            match opt {
                TftpOption::Blocksize(size) => {
                    let negotiated = match mtu {
                        Some(mtu) => size.min(mtu.min(u32::from(MAX_BLOCKSIZE)) as u16),
                        None => size,
                    };
                    blocksize = negotiated;
                    oack.push(TftpOption::Blocksize(negotiated));
                }
                TftpOption::Timeout(secs) => {
                    timeout_s = Some(secs);
                    oack.push(TftpOption::Timeout(secs));
                }
                TftpOption::TransferSize(size) => match dir {
                    Direction::Write => {
                        declared_size = Some(size);
                        oack.push(TftpOption::TransferSize(size));
                    }
                    // answered with the real length once the file is open
                    Direction::Read => wants_tsize = true,
                },
            }
        }

        match dir {
            Direction::Write => {
                let sink = match self.io.create_new(&path, declared_size) {
                    Ok(f) => BlockSink::new(f, mode),
                    Err(e) => {
                        warn!("cannot create {:?}: {}", path, e);
                        return Ok(Transfer::denied(ErrorCode::AccessViolation.into()));
                    }
                };
                Ok(Transfer::new_write(sink, blocksize, timeout_s, oack))
            }
            Direction::Read => {
                let (reader, len) = match self.io.open_read(&path) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("cannot open {:?}: {}", path, e);
                        return Ok(Transfer::denied(ErrorCode::AccessViolation.into()));
                    }
                };
                if wants_tsize {
                    oack.push(TftpOption::TransferSize(len.unwrap_or(0)));
                }
                let source = BlockSource::new(reader, mode);
                Ok(Transfer::new_read(source, blocksize, timeout_s, oack))
            }
        }
    }
}

/// The per-client protocol engine: a state machine over
/// `(state, event) -> (state, frame to send)`. All socket I/O stays with
/// the caller; the engine only decides which frame goes out next and how
/// received frames move the transfer forward.
pub struct Transfer<IO: IOAdapter> {
    state: State,
    /// Send state a timeout reverts to, so the last frame is re-emitted.
    retry_to: State,
    dir: Direction,
    block_num: SerialNumber<u16>,
    blocksize: u16,
    timeout_s: Option<u8>,
    timeout_count: u8,
    final_ack_pending: bool,
    data_buf: Option<Vec<u8>>,
    error_pkt: Option<Packet>,
    oack: Vec<TftpOption>,
    source: Option<BlockSource<IO::R>>,
    sink: Option<BlockSink<IO::W>>,
}

impl<IO: IOAdapter> fmt::Debug for Transfer<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("state", &self.state)
            .field("retry_to", &self.retry_to)
            .field("dir", &self.dir)
            .field("block_num", &self.block_num.0)
            .field("blocksize", &self.blocksize)
            .field("timeout_s", &self.timeout_s)
            .field("timeout_count", &self.timeout_count)
            .field("final_ack_pending", &self.final_ack_pending)
            .field("data_buf", &self.data_buf)
            .field("error_pkt", &self.error_pkt)
            .field("oack", &self.oack)
            .finish()
    }
}

impl<IO: IOAdapter> Transfer<IO> {
    fn blank(dir: Direction) -> Self {
        Self {
            state: State::Finished,
            retry_to: State::Finished,
            dir,
            block_num: SerialNumber(0),
            blocksize: DEFAULT_BLOCKSIZE,
            timeout_s: None,
            timeout_count: 0,
            final_ack_pending: false,
            data_buf: None,
            error_pkt: None,
            oack: vec![],
            source: None,
            sink: None,
        }
    }

    fn denied(error: Packet) -> Self {
        let mut xfer = Self::blank(Direction::Read);
        xfer.state = State::SendError;
        xfer.error_pkt = Some(error);
        xfer
    }

    fn new_read(
        source: BlockSource<IO::R>,
        blocksize: u16,
        timeout_s: Option<u8>,
        oack: Vec<TftpOption>,
    ) -> Self {
        let mut xfer = Self::blank(Direction::Read);
        xfer.blocksize = blocksize;
        xfer.timeout_s = timeout_s;
        xfer.source = Some(source);
        if oack.is_empty() {
            xfer.state = State::SendData;
            xfer.block_num = SerialNumber(1);
        } else {
            xfer.state = State::SendOack;
            xfer.oack = oack;
        }
        xfer
    }

    fn new_write(
        sink: BlockSink<IO::W>,
        blocksize: u16,
        timeout_s: Option<u8>,
        oack: Vec<TftpOption>,
    ) -> Self {
        let mut xfer = Self::blank(Direction::Write);
        xfer.blocksize = blocksize;
        xfer.timeout_s = timeout_s;
        xfer.sink = Some(sink);
        if oack.is_empty() {
            xfer.state = State::SendAck;
        } else {
            xfer.state = State::SendOack;
            xfer.oack = oack;
        }
        xfer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// True in `Send*` states: the engine has a frame ready to go out.
    pub fn wants_write(&self) -> bool {
        match self.state {
            State::SendData | State::SendAck | State::SendOack | State::SendError => true,
            _ => false,
        }
    }

    /// True in `Wait*` states: the engine needs the peer's next frame.
    pub fn wants_read(&self) -> bool {
        match self.state {
            State::WaitAck | State::WaitData => true,
            _ => false,
        }
    }

    /// The client-negotiated retransmission timeout; callers fall back to
    /// their own default when the request carried none.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_s.map(|s| Duration::from_secs(u64::from(s)))
    }

    /// In a `Send*` state, returns the frame to transmit; the caller
    /// reports a completed transmission via `frame_sent`. Filling the next
    /// DATA block from the source happens here; the filled block stays
    /// buffered until its ACK arrives so retransmissions are cheap.
    pub fn next_frame(&mut self) -> Option<Packet> {
        match self.state {
            State::SendData => {
                if self.data_buf.is_none() {
                    let block = {
                        let source = self.source.as_mut()?;
                        source.fill(usize::from(self.blocksize))
                    };
                    match block {
                        Ok(block) => {
                            if block.len() < usize::from(self.blocksize) {
                                self.final_ack_pending = true;
                            }
                            self.data_buf = Some(block);
                        }
                        Err(e) => {
                            self.stage_error(io_error_packet(&e));
                            return self.next_frame();
                        }
                    }
                }
                self.data_buf.as_ref().map(|data| Packet::DATA {
                    block_num: self.block_num.0,
                    data: data.clone(),
                })
            }
            State::SendAck => Some(Packet::ACK(self.block_num.0)),
            State::SendOack => Some(Packet::OACK {
                options: self.oack.clone(),
            }),
            State::SendError => self.error_pkt.clone(),
            _ => None,
        }
    }

    /// Commits the transition out of a `Send*` state once the frame
    /// produced by `next_frame` actually left the socket.
    pub fn frame_sent(&mut self) {
        match self.state {
            State::SendData => {
                self.retry_to = State::SendData;
                self.state = State::WaitAck;
            }
            State::SendAck => {
                if self.final_ack_pending {
                    self.finish();
                } else {
                    self.block_num += 1;
                    self.retry_to = State::SendAck;
                    self.state = State::WaitData;
                }
            }
            State::SendOack => {
                self.retry_to = State::SendOack;
                match self.dir {
                    Direction::Read => self.state = State::WaitAck,
                    Direction::Write => {
                        // the client answers an OACK with DATA block 1
                        self.block_num += 1;
                        self.state = State::WaitData;
                    }
                }
            }
            State::SendError => self.finish(),
            _ => {}
        }
    }

    /// Process a received, well-formed packet.
    pub fn rx(&mut self, packet: Packet) {
        if self.is_finished() {
            return;
        }
        self.timeout_count = 0;
        match self.state {
            State::WaitAck => match packet {
                Packet::ACK(block) => self.handle_ack(block),
                Packet::ERROR { code, msg } => {
                    info!("peer aborted transfer: {:?} {}", code, msg);
                    self.finish();
                }
                _ => self.stage_error(ErrorCode::IllegalTFTP.into()),
            },
            State::WaitData => match packet {
                Packet::DATA { block_num, data } => self.handle_data(block_num, &data),
                Packet::ERROR { code, msg } => {
                    info!("peer aborted transfer: {:?} {}", code, msg);
                    self.finish();
                }
                _ => self.stage_error(ErrorCode::IllegalTFTP.into()),
            },
            _ => {
                // mid-send duplicates are dropped; a peer error still ends
                // the transfer
                if let Packet::ERROR { code, msg } = packet {
                    info!("peer aborted transfer: {:?} {}", code, msg);
                    self.finish();
                }
            }
        }
    }

    /// The peer sent bytes that do not decode as any TFTP frame.
    pub fn rx_malformed(&mut self) {
        if self.is_finished() {
            return;
        }
        self.stage_error(Packet::ERROR {
            code: ErrorCode::IllegalTFTP,
            msg: "Malformed packet".to_owned(),
        });
    }

    /// A non-recoverable socket error was observed on the connection.
    pub fn transport_failed(&mut self) {
        if self.is_finished() {
            return;
        }
        self.stage_error(ErrorCode::NotDefined.into());
    }

    /// Call this to indicate that the timeout since the last received
    /// packet has expired. Reverts to the send state that re-emits the
    /// last frame, or finishes the transfer once the retry budget is gone.
    pub fn timeout_expired(&mut self) {
        match self.state {
            State::WaitAck | State::WaitData => {
                self.timeout_count += 1;
                if self.timeout_count >= MAX_TIMEOUTS {
                    info!("no reply after {} timeouts, giving up", self.timeout_count);
                    self.finish();
                    return;
                }
                match self.retry_to {
                    State::SendAck => {
                        // the ACK for the previous block got lost
                        self.regress_block();
                        self.state = State::SendAck;
                    }
                    s @ State::SendData | s @ State::SendOack => self.state = s,
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn handle_ack(&mut self, block: u16) {
        let block = SerialNumber(block);
        if block == self.block_num {
            if self.final_ack_pending {
                debug!("final ACK received, read transfer complete");
                self.finish();
            } else {
                self.block_num += 1;
                self.data_buf = None;
                self.state = State::SendData;
            }
        } else if block + 1 == self.block_num {
            // reply to an earlier transmission; send the current block again
            self.state = State::SendData;
        } else {
            self.stage_error(Packet::ERROR {
                code: ErrorCode::IllegalTFTP,
                msg: "Unexpected block in ACK".to_owned(),
            });
        }
    }

    fn handle_data(&mut self, block: u16, data: &[u8]) {
        let block = SerialNumber(block);
        if data.len() > usize::from(self.blocksize) {
            self.stage_error(Packet::ERROR {
                code: ErrorCode::IllegalTFTP,
                msg: "Oversized DATA block".to_owned(),
            });
            return;
        }
        if block == self.block_num {
            {
                let sink = match self.sink.as_mut() {
                    Some(s) => s,
                    None => return,
                };
                if let Err(e) = sink.write(data) {
                    warn!("write failed: {}", e);
                    self.stage_error(io_error_packet(&e));
                    return;
                }
                if data.len() < usize::from(self.blocksize) {
                    // last block; settle the sink before acknowledging
                    if let Err(e) = sink.finish() {
                        warn!("finishing write failed: {}", e);
                        self.stage_error(io_error_packet(&e));
                        return;
                    }
                    self.final_ack_pending = true;
                }
            }
            self.state = State::SendAck;
        } else if block + 1 == self.block_num {
            // duplicate of the block already stored; re-acknowledge it
            self.regress_block();
            self.state = State::SendAck;
        } else {
            self.stage_error(Packet::ERROR {
                code: ErrorCode::IllegalTFTP,
                msg: "Unexpected DATA block".to_owned(),
            });
        }
    }

    fn stage_error(&mut self, pkt: Packet) {
        self.error_pkt = Some(pkt);
        self.state = State::SendError;
    }

    fn regress_block(&mut self) {
        self.block_num = SerialNumber(self.block_num.0.wrapping_sub(1));
    }

    fn finish(&mut self) {
        self.state = State::Finished;
        self.data_buf = None;
        self.source = None;
        self.sink = None;
    }
}

fn io_error_packet(e: &io::Error) -> Packet {
    if e.kind() == io::ErrorKind::InvalidData {
        Packet::ERROR {
            code: ErrorCode::NotDefined,
            msg: "Malformed netascii stream".to_owned(),
        }
    } else if e.raw_os_error() == Some(nix::libc::ENOSPC) {
        ErrorCode::DiskFull.into()
    } else {
        ErrorCode::AccessViolation.into()
    }
}

use crate::fileio::{FSAdapter, IOAdapter};
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::tftp_proto::{TftpServerProto, Transfer};
use crate::transport::TftpSocket;
use log::*;
use mio::*;
use mio_more::timer::{Timeout, Timer, TimerError};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// fixed registrations; connection tokens start above these
const TIMER: Token = Token(0);
const LISTENER: Token = Token(1);

/// Upper bound on one poll call, so the shutdown flag is observed promptly.
const POLL_WAIT: Duration = Duration::from_millis(1000);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Requests a graceful stop of the event loop. Only stores a flag, so it
/// is safe to call from a signal handler.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Failures the event loop can run into; would-block conditions never
/// surface here.
#[derive(Debug)]
pub enum TftpError {
    Io(io::Error),
    Timer(TimerError),
}

impl From<io::Error> for TftpError {
    fn from(err: io::Error) -> Self {
        TftpError::Io(err)
    }
}

impl From<TimerError> for TftpError {
    fn from(err: TimerError) -> Self {
        TftpError::Timer(err)
    }
}

pub type Result<T> = result::Result<T, TftpError>;

/// One active transfer: its pinned socket, its pending retransmission
/// deadline and the protocol engine driving it.
struct ConnectionState<IO: IOAdapter> {
    socket: TftpSocket,
    timeout: Option<Timeout>,
    transfer: Transfer<IO>,
    peer: SocketAddr,
}

/// Everything a server needs to know before it starts.
pub struct ServerConfig {
    /// The directory served to clients; request paths may not escape it
    pub root: PathBuf,
    /// The local address to listen on
    pub addr: IpAddr,
    /// The listener port; 69 is the well-known TFTP port, 0 lets the OS
    /// choose (useful in tests)
    pub port: u16,
    /// Cap on simultaneous transfers; requests beyond it wait in the queue
    pub max_clients: usize,
    /// Retransmission timeout used when a client does not negotiate one
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            addr: IpAddr::from([0, 0, 0, 0]),
            port: 69,
            max_clients: 64,
            timeout: Duration::from_secs(2),
        }
    }
}

pub type TftpServer = ServerImpl<FSAdapter>;

pub struct ServerImpl<IO: IOAdapter> {
    /// Source of fresh registration tokens
    new_token: Token,
    /// Readiness multiplexer every socket and the timer register with
    poll: Poll,
    /// One timer shared by all connections, one pending deadline each
    timer: Timer<Token>,
    /// Retransmission timeout for clients that negotiate none
    timeout: Duration,
    /// Well-known-port socket; only RRQ/WRQ arrive here
    listener: TftpSocket,
    /// The address connection sockets bind to (same interface, port 0)
    listen_ip: IpAddr,
    /// Accepted requests waiting for a free connection slot, in order
    pending: VecDeque<(Packet, SocketAddr)>,
    /// Live transfers, keyed by their socket's registration token
    connections: HashMap<Token, ConnectionState<IO>>,
    max_clients: usize,
    /// Request intake: authorization, option negotiation, file open
    proto: TftpServerProto<IO>,
}

impl<IO: IOAdapter + Default> ServerImpl<IO> {
    /// Binds the listener and sets up the event loop; no requests are
    /// served until `run` is called.
    pub fn with_cfg(cfg: &ServerConfig) -> Result<Self> {
        let root = cfg.root.canonicalize()?;

        let poll = Poll::new()?;
        let timer = Timer::default();
        poll.register(
            &timer,
            TIMER,
            Ready::readable(),
            PollOpt::edge() | PollOpt::level(),
        )?;

        let listener = TftpSocket::bind(cfg.addr, cfg.port)?;
        poll.register(
            listener.evented(),
            LISTENER,
            Ready::readable(),
            PollOpt::edge() | PollOpt::level(),
        )?;

        info!(
            "server listening on {}, serving {}",
            listener.local_addr()?,
            root.display()
        );

        Ok(Self {
            new_token: Token(2),
            poll,
            timer,
            timeout: cfg.timeout,
            listener,
            listen_ip: cfg.addr,
            pending: VecDeque::new(),
            connections: HashMap::new(),
            max_clients: cfg.max_clients,
            proto: TftpServerProto::new(Default::default(), root),
        })
    }

    /// Next registration token not already spoken for.
    fn generate_token(&mut self) -> Token {
        loop {
            self.new_token.0 = self.new_token.0.wrapping_add(1);
            if self.new_token != TIMER
                && self.new_token != LISTENER
                && !self.connections.contains_key(&self.new_token)
            {
                return self.new_token;
            }
        }
    }

    /// Removes a connection: deregisters its socket from the event loop
    /// and cancels any pending retransmission deadline.
    fn cancel_connection(&mut self, token: Token) {
        if let Some(conn) = self.connections.remove(&token) {
            info!("closing connection with {} (token {:?})", conn.peer, token);
            let _ = self.poll.deregister(conn.socket.evented());
            if let Some(timeout) = conn.timeout {
                self.timer.cancel_timeout(&timeout);
            }
        }
    }

    /// (Re)arms a connection's retransmission deadline.
    fn reset_timeout(&mut self, token: Token) -> Result<()> {
        let default = self.timeout;
        if let Some(conn) = self.connections.get_mut(&token) {
            if let Some(old) = conn.timeout.take() {
                self.timer.cancel_timeout(&old);
            }
            let dur = conn.transfer.timeout().unwrap_or(default);
            conn.timeout = Some(self.timer.set_timeout(dur, token)?);
        }
        Ok(())
    }

    /// Called to process an available I/O event for a token.
    fn handle_token(&mut self, token: Token, ready: Ready, buf: &mut [u8]) -> Result<()> {
        match token {
            TIMER => self.process_timer(),
            LISTENER => self.drain_listener(buf),
            _ => self.handle_connection_event(token, ready, buf),
        }
    }

    /// Handles the event when a timer times out: lets the engine decide
    /// between retransmission and giving up.
    fn process_timer(&mut self) -> Result<()> {
        let mut expired = vec![];
        while let Some(token) = self.timer.poll() {
            expired.push(token);
        }

        for token in expired {
            let finished = match self.connections.get_mut(&token) {
                Some(conn) => {
                    debug!("timeout for {} (token {:?})", conn.peer, token);
                    conn.timeout = None;
                    conn.transfer.timeout_expired();
                    conn.transfer.is_finished()
                }
                None => continue,
            };
            if finished {
                self.cancel_connection(token);
            } else {
                self.drive(token)?;
            }
        }

        Ok(())
    }

    /// Drains every datagram pending on the listener. Valid requests are
    /// queued in arrival order; everything else is logged and dropped.
    fn drain_listener(&mut self, buf: &mut [u8]) -> Result<()> {
        while let Some((amt, src)) = self.listener.recv_from(buf)? {
            match Packet::read(&buf[..amt]) {
                Ok(packet @ Packet::RRQ { .. }) | Ok(packet @ Packet::WRQ { .. }) => {
                    debug!("queued request from {}", src);
                    self.pending.push_back((packet, src));
                }
                Ok(_) => warn!("dropping non-request packet on listener from {}", src),
                Err(e) => warn!("dropping malformed packet from {}: {:?}", src, e),
            }
        }
        Ok(())
    }

    /// Starts transfers for queued requests while connection slots are
    /// available.
    fn admit_pending(&mut self) {
        while self.connections.len() < self.max_clients {
            let (request, src) = match self.pending.pop_front() {
                Some(r) => r,
                None => return,
            };
            if let Err(e) = self.spawn_connection(request, src) {
                warn!("cannot start transfer for {}: {:?}", src, e);
            }
        }
    }

    /// Creates the per-client socket on a fresh ephemeral port, pins the
    /// peer and hands the request to the protocol layer.
    fn spawn_connection(&mut self, request: Packet, src: SocketAddr) -> Result<()> {
        let socket = TftpSocket::bind(self.listen_ip, 0)?;
        socket.connect(src)?;
        let mtu = socket.interface_mtu();

        let transfer = match self.proto.rx_initial(request, mtu) {
            Ok(t) => t,
            Err(e) => {
                // the listener only queues RRQ/WRQ, so this is unreachable
                error!("{:?}", e);
                return Ok(());
            }
        };

        let token = self.generate_token();
        self.poll.register(
            socket.evented(),
            token,
            Ready::writable(),
            PollOpt::edge() | PollOpt::level(),
        )?;
        info!(
            "new transfer with {} from port {} (token {:?})",
            src,
            socket.local_addr()?.port(),
            token
        );
        self.connections.insert(
            token,
            ConnectionState {
                socket,
                timeout: None,
                transfer,
                peer: src,
            },
        );

        self.drive(token)
    }

    /// Feeds received datagrams to the engine, then sends whatever it has
    /// ready.
    fn handle_connection_event(&mut self, token: Token, ready: Ready, buf: &mut [u8]) -> Result<()> {
        {
            let conn = match self.connections.get_mut(&token) {
                Some(conn) => conn,
                None => {
                    // stale event for an already-closed connection
                    return Ok(());
                }
            };
            if ready.is_readable() {
                loop {
                    match conn.socket.recv(buf) {
                        Ok(Some(amt)) => match Packet::read(&buf[..amt]) {
                            Ok(packet) => conn.transfer.rx(packet),
                            Err(e) => {
                                debug!("malformed packet from {}: {:?}", conn.peer, e);
                                conn.transfer.rx_malformed();
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("recv error from {}: {}", conn.peer, e);
                            conn.transfer.transport_failed();
                            break;
                        }
                    }
                }
            }
        }
        self.drive(token)
    }

    /// Sends frames for as long as the engine is in a send state and the
    /// socket accepts them, then refreshes the connection's registration
    /// and deadline to match the state the engine landed in.
    fn drive(&mut self, token: Token) -> Result<()> {
        let mut rearm = false;
        let mut drop_conn = false;
        {
            let conn = match self.connections.get_mut(&token) {
                Some(conn) => conn,
                None => return Ok(()),
            };
            loop {
                let frame = match conn.transfer.next_frame() {
                    Some(f) => f,
                    None => break,
                };
                match conn.socket.send(&frame.to_bytes()) {
                    Ok(Some(_)) => {
                        conn.transfer.frame_sent();
                        if conn.transfer.wants_read() {
                            rearm = true;
                        }
                    }
                    Ok(None) => break, // wait for writable
                    Err(e) => {
                        warn!("send to {} failed: {}", conn.peer, e);
                        drop_conn = true;
                        break;
                    }
                }
            }
            if conn.transfer.is_finished() {
                drop_conn = true;
            }
            if !drop_conn {
                let interest = if conn.transfer.wants_write() {
                    Ready::readable() | Ready::writable()
                } else {
                    Ready::readable()
                };
                self.poll.reregister(
                    conn.socket.evented(),
                    token,
                    interest,
                    PollOpt::edge() | PollOpt::level(),
                )?;
            }
        }
        if drop_conn {
            self.cancel_connection(token);
        } else if rearm {
            self.reset_timeout(token)?;
        }
        Ok(())
    }

    /// Runs the server's event loop until a shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut scratch_buf = vec![0; MAX_PACKET_SIZE];

        while !shutdown_requested() {
            self.poll.poll(&mut events, Some(POLL_WAIT))?;

            for event in events.iter() {
                match self.handle_token(event.token(), event.readiness(), &mut scratch_buf) {
                    Ok(_) => {}
                    Err(TftpError::Io(ref e)) => debug!("io error: {}", e),
                    e => return e,
                }
            }
            self.admit_pending();
        }

        info!(
            "shutdown requested, dropping {} connection(s)",
            self.connections.len()
        );
        Ok(())
    }

    /// The listener's bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use hickory_proto::op::Message;
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::timeout,
};

use super::Protocol;

/// Deadline for one exchange with one upstream.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_UDP_SIZE: usize = 65535;

/// Idle TCP connections kept per upstream; extra ones are closed on check-in.
const MAX_IDLE: usize = 16;

/// One forwarding target and its cached connections.
///
/// Only TCP connections are cached; each UDP exchange uses a fresh socket so
/// a late answer to an earlier query can never be read as the current one.
pub struct UpstreamProxy {
    addr: SocketAddr,
    expire: Duration,
    idle: Mutex<Vec<(TcpStream, Instant)>>,
    stopped: AtomicBool,
}

impl UpstreamProxy {
    pub fn new(addr: SocketAddr, expire: Duration) -> Self {
        Self {
            addr,
            expire,
            idle: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends `request` and waits for the answer carrying the same id.
    pub async fn exchange(&self, request: &Message, protocol: Protocol) -> Result<Message> {
        let wire = request
            .to_vec()
            .or_err(InternalError, "Unable to encode dns request")?;

        let exchange = async {
            match protocol {
                Protocol::Udp => self.exchange_udp(&wire, request.id()).await,
                Protocol::Tcp => self.exchange_tcp(&wire, request.id()).await,
            }
        };

        timeout(READ_TIMEOUT, exchange).await.map_err(|_| {
            Error::explain(
                ReadTimedout,
                format!("{protocol} exchange with {} timed out", self.addr),
            )
        })?
    }

    async fn exchange_udp(&self, wire: &[u8], id: u16) -> Result<Message> {
        let bind: SocketAddr = if self.addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .or_err(ConnectError, "Unable to bind udp socket")?;
        socket
            .connect(self.addr)
            .await
            .or_err_with(ConnectError, || format!("Unable to connect {}", self.addr))?;
        socket
            .send(wire)
            .await
            .or_err_with(WriteError, || format!("Unable to send query to {}", self.addr))?;

        let mut buf = vec![0u8; MAX_UDP_SIZE];
        loop {
            let len = socket
                .recv(&mut buf)
                .await
                .or_err_with(ReadError, || format!("Unable to read answer from {}", self.addr))?;
            match Message::from_vec(&buf[..len]) {
                Ok(response) if response.id() == id => return Ok(response),
                Ok(response) => {
                    log::debug!("Dropping mismatched answer {} from {}", response.id(), self.addr)
                }
                Err(e) => log::debug!("Dropping malformed answer from {}: {e}", self.addr),
            }
        }
    }

    async fn exchange_tcp(&self, wire: &[u8], id: u16) -> Result<Message> {
        let len = u16::try_from(wire.len())
            .or_err(InternalError, "Dns request too large for tcp")?;
        let mut frame = Vec::with_capacity(wire.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(wire);

        let (mut stream, cached) = self.checkout().await?;
        match exchange_on_stream(&mut stream, &frame, id).await {
            Ok(response) => {
                self.checkin(stream);
                Ok(response)
            }
            // the server may have closed an idle connection, retry once on a new one
            Err(e) if cached => {
                log::debug!("Cached connection to {} failed: {e}, redialing", self.addr);
                let mut stream = self.dial().await?;
                let response = exchange_on_stream(&mut stream, &frame, id).await?;
                self.checkin(stream);
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    async fn checkout(&self) -> Result<(TcpStream, bool)> {
        if let Some(stream) = self.take_idle() {
            return Ok((stream, true));
        }
        Ok((self.dial().await?, false))
    }

    fn take_idle(&self) -> Option<TcpStream> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some((stream, since)) = idle.pop() {
            if since.elapsed() < self.expire {
                return Some(stream);
            }
        }
        None
    }

    async fn dial(&self) -> Result<TcpStream> {
        TcpStream::connect(self.addr)
            .await
            .or_err_with(ConnectError, || format!("Unable to connect {}", self.addr))
    }

    fn checkin(&self, stream: TcpStream) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.retain(|(_, since)| since.elapsed() < self.expire);
        if idle.len() >= MAX_IDLE {
            log::debug!("Idle pool for {} is full, closing connection", self.addr);
            return;
        }
        idle.push((stream, Instant::now()));
    }

    /// Number of cached idle connections still within `expire`.
    pub fn idle_connections(&self) -> usize {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.iter()
            .filter(|(_, since)| since.elapsed() < self.expire)
            .count()
    }

    /// Drops cached connections and stops caching new ones.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

async fn exchange_on_stream(stream: &mut TcpStream, frame: &[u8], id: u16) -> Result<Message> {
    stream
        .write_all(frame)
        .await
        .or_err(WriteError, "Unable to write tcp query")?;

    loop {
        let len = stream
            .read_u16()
            .await
            .or_err(ReadError, "Unable to read tcp answer length")?;
        let mut buf = vec![0u8; len as usize];
        stream
            .read_exact(&mut buf)
            .await
            .or_err(ReadError, "Unable to read tcp answer")?;

        let response = Message::from_vec(&buf).or_err(ReadError, "Malformed tcp answer")?;
        if response.id() == id {
            return Ok(response);
        }
        log::debug!("Dropping mismatched tcp answer {}", response.id());
    }
}

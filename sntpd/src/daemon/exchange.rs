use std::fmt::Display;
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sntp_proto::{NtpClock, NtpPacket, PacketParsingError};

#[derive(Debug)]
pub enum ExchangeError {
    UnresolvableHost(String),
    Io(io::Error),
    Parse(PacketParsingError),
    Rejected,
    Aborted,
    Clock(Box<dyn std::error::Error + Send>),
}

impl Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvableHost(host) => {
                write!(f, "could not resolve server address `{host}`")
            }
            Self::Io(e) => write!(f, "network error during exchange: {e}"),
            Self::Parse(e) => write!(f, "malformed reply: {e}"),
            Self::Rejected => f.write_str("reply failed the unicast sanity checks"),
            Self::Aborted => f.write_str("exchange was aborted"),
            Self::Clock(e) => write!(f, "could not read the clock: {e}"),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<io::Error> for ExchangeError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<PacketParsingError> for ExchangeError {
    fn from(value: PacketParsingError) -> Self {
        Self::Parse(value)
    }
}

/// A single blocking request/reply transaction.
///
/// An exchange is created fresh for every synchronization attempt. While
/// `ask_server` blocks, `abort` may be called from another thread; it shuts
/// the underlying socket down so the blocked receive returns an error on its
/// own. Nothing is ever forcibly terminated.
pub struct ClientExchange {
    server: String,
    port: u16,
    receive_timeout: Duration,
    socket: Mutex<Option<UdpSocket>>,
    aborted: AtomicBool,
}

impl ClientExchange {
    pub fn new(server: impl Into<String>, port: u16, receive_timeout: Duration) -> Self {
        Self {
            server: server.into(),
            port,
            receive_timeout,
            socket: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    /// Performs the transaction: resolve, send the request, block for the
    /// reply, stamp the arrival time, decode.
    pub fn ask_server<C: NtpClock>(&self, clock: &C) -> Result<NtpPacket, ExchangeError> {
        let result = self.transact(clock);
        // drop the socket on every path, success, failure and abort alike
        *self.socket.lock().unwrap() = None;
        result
    }

    fn transact<C: NtpClock>(&self, clock: &C) -> Result<NtpPacket, ExchangeError> {
        let endpoint = self.resolve()?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_read_timeout(Some(self.receive_timeout))?;
        socket.connect(endpoint)?;

        // publish a handle so abort() can reach the socket while this
        // thread is blocked below
        *self.socket.lock().unwrap() = Some(socket.try_clone()?);
        if self.aborted.load(Ordering::Acquire) {
            return Err(ExchangeError::Aborted);
        }

        let transmit = clock
            .now()
            .map_err(|e| ExchangeError::Clock(Box::new(e)))?;
        let request = NtpPacket::poll_message(transmit);
        socket.send(&request.serialize())?;

        let mut buf = [0u8; NtpPacket::LENGTH];
        let received = match socket.recv(&mut buf) {
            Ok(received) => received,
            Err(_) if self.aborted.load(Ordering::Acquire) => {
                return Err(ExchangeError::Aborted)
            }
            Err(e) => return Err(e.into()),
        };
        if self.aborted.load(Ordering::Acquire) {
            return Err(ExchangeError::Aborted);
        }

        // take the arrival time before any further processing; the accuracy
        // of this stamp is part of the correctness of the derived offset
        let destination = clock
            .now()
            .map_err(|e| ExchangeError::Clock(Box::new(e)))?;

        let mut reply = NtpPacket::deserialize(&buf[..received])?;
        reply.set_destination_timestamp(destination);

        if !reply.is_plausible_response(&request) {
            return Err(ExchangeError::Rejected);
        }

        Ok(reply)
    }

    fn resolve(&self) -> Result<SocketAddr, ExchangeError> {
        let mut addrs = (self.server.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| ExchangeError::UnresolvableHost(self.server.clone()))?;

        addrs
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| ExchangeError::UnresolvableHost(self.server.clone()))
    }

    /// Unblocks an in-flight `ask_server` by shutting its socket down from
    /// the calling thread. The blocked receive then returns an error by
    /// itself; this is the single mechanism used to interrupt a stuck
    /// exchange.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        if let Some(socket) = self.socket.lock().unwrap().take() {
            let _ = socket2::SockRef::from(&socket).shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::clock::UnixClock;
    use sntp_proto::{NtpAssociationMode, NtpTimestamp, TICKS_PER_SECOND};
    use std::sync::Arc;
    use std::time::Instant;

    /// Responds to every request like a plausible stratum-1 server would.
    fn spawn_responder() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; NtpPacket::LENGTH];
            while let Ok((received, peer)) = socket.recv_from(&mut buf) {
                let request = match NtpPacket::deserialize(&buf[..received]) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                let now = NtpTimestamp::from_system_time(std::time::SystemTime::now());
                let mut reply = request;
                reply.set_mode(NtpAssociationMode::Server);
                reply.set_stratum(1);
                reply.set_origin_timestamp(request.transmit_timestamp());
                reply.set_receive_timestamp(now);
                reply.set_transmit_timestamp(now);
                let _ = socket.send_to(&reply.serialize(), peer);
            }
        });
        addr
    }

    #[test]
    fn exchange_against_loopback_responder() {
        let addr = spawn_responder();
        let exchange = ClientExchange::new(
            addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(5),
        );

        let reply = exchange.ask_server(&UnixClock::realtime()).unwrap();
        assert_eq!(reply.mode(), NtpAssociationMode::Server);
        assert_eq!(reply.stratum(), 1);
        // loopback: offset and delay are tiny
        assert!(reply.clock_offset().abs().as_ticks() < TICKS_PER_SECOND);
        assert!(reply.roundtrip_delay().as_ticks() < TICKS_PER_SECOND);
    }

    #[test]
    fn exchange_times_out_without_reply() {
        // a bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();

        let exchange = ClientExchange::new(
            addr.ip().to_string(),
            addr.port(),
            Duration::from_millis(100),
        );
        let started = Instant::now();
        let result = exchange.ask_server(&UnixClock::realtime());
        assert!(matches!(result, Err(ExchangeError::Io(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn abort_unblocks_a_stuck_receive() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();

        let exchange = Arc::new(ClientExchange::new(
            addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(30),
        ));

        let worker = {
            let exchange = Arc::clone(&exchange);
            std::thread::spawn(move || exchange.ask_server(&UnixClock::realtime()))
        };

        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        exchange.abort();
        let result = worker.join().unwrap();
        assert!(matches!(result, Err(ExchangeError::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unresolvable_host() {
        let exchange = ClientExchange::new("", 123, Duration::from_millis(100));
        let result = exchange.ask_server(&UnixClock::realtime());
        assert!(matches!(result, Err(ExchangeError::UnresolvableHost(_))));
    }

    #[test]
    fn implausible_reply_is_rejected() {
        // a responder that echoes the request unchanged: mode stays Client
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; NtpPacket::LENGTH];
            if let Ok((received, peer)) = socket.recv_from(&mut buf) {
                let _ = socket.send_to(&buf[..received], peer);
            }
        });

        let exchange = ClientExchange::new(
            addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(5),
        );
        let result = exchange.ask_server(&UnixClock::realtime());
        assert!(matches!(result, Err(ExchangeError::Rejected)));
    }
}

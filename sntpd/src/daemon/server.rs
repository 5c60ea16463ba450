use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use sntp_proto::{
    NtpAssociationMode, NtpClock, NtpDuration, NtpLeapIndicator, NtpPacket, NtpTimestamp,
    RootDelay, RootDispersion,
};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use super::config::ServerConfig;

// Maximum size of udp packet we handle
const MAX_PACKET_SIZE: usize = 1024;

/// Answers time requests using an externally maintained clock-offset
/// estimate.
///
/// `start_server`/`stop_server` are idempotent and mutually exclusive.
/// Stopping shuts the listening socket down so the blocked receive errors
/// out by itself, then joins the loop before returning; the loop is never
/// forcibly terminated and the socket never leaks across restarts.
#[derive(Clone)]
pub struct Server<C: NtpClock> {
    inner: Arc<ServerInner<C>>,
}

struct ServerInner<C> {
    config: ServerConfig,
    clock: C,
    /// The start/stop lock; holds the handle of the active listener.
    listener: Mutex<Option<ListenerHandle>>,
    running: AtomicBool,
    /// External gate: requests are only served while this is true.
    okay_to_run: AtomicBool,
    /// Published by the loop while it is bound, so `stop_server` can shut it
    /// down and observers can see the bound address.
    socket: Mutex<Option<UdpSocket>>,
    estimate: RwLock<ClockEstimate>,
}

struct ListenerHandle {
    keep_alive: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// The offset to add to the local clock to get true time, together with the
/// reference timestamp recomputed when the offset was set. Replaced as one
/// value so readers never observe half an update.
#[derive(Debug, Clone, Copy)]
struct ClockEstimate {
    offset: NtpDuration,
    reference_timestamp: NtpTimestamp,
}

#[must_use]
#[derive(Debug, Clone, Copy)]
enum SocketOutcome {
    Rebind,
    Shutdown,
}

impl<C: NtpClock> Server<C> {
    pub fn new(config: ServerConfig, clock: C) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                clock,
                listener: Mutex::new(None),
                running: AtomicBool::new(false),
                okay_to_run: AtomicBool::new(false),
                socket: Mutex::new(None),
                estimate: RwLock::new(ClockEstimate {
                    offset: NtpDuration::ZERO,
                    reference_timestamp: NtpTimestamp::default(),
                }),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn okay_to_run(&self) -> bool {
        self.inner.okay_to_run.load(Ordering::Acquire)
    }

    /// Opens or closes the gate. While the gate is closed the loop sleeps
    /// and re-polls instead of serving.
    pub fn set_okay_to_run(&self, okay: bool) {
        self.inner.okay_to_run.store(okay, Ordering::Release);
    }

    pub fn offset(&self) -> NtpDuration {
        self.inner.estimate.read().unwrap().offset
    }

    /// Updates the clock-offset estimate and recomputes the reference
    /// timestamp stamped into subsequent replies.
    pub fn set_offset(&self, offset: NtpDuration) {
        let reference_timestamp = match self.inner.clock.now() {
            Ok(now) => now + offset,
            Err(error) => {
                warn!(%error, "could not read the clock for the reference timestamp");
                NtpTimestamp::default()
            }
        };

        *self.inner.estimate.write().unwrap() = ClockEstimate {
            offset,
            reference_timestamp,
        };
    }

    /// The address the listener is currently bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.inner.socket.lock().unwrap();
        socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Starts the listener in the background. A no-op when it is already
    /// running.
    pub fn start_server(&self) {
        if self.inner.running.load(Ordering::Acquire) {
            return;
        }

        let mut listener = self.inner.listener.lock().unwrap();
        // double-checked now that the start/stop lock is held
        if self.inner.running.load(Ordering::Acquire) {
            return;
        }
        self.inner.running.store(true, Ordering::Release);

        let keep_alive = Arc::new(AtomicBool::new(true));
        let thread_inner = Arc::clone(&self.inner);
        let thread_keep_alive = Arc::clone(&keep_alive);
        let thread = thread::spawn(move || {
            ServerInner::listen_loop(&thread_inner, &thread_keep_alive);
            // sanitize so a new listener can be started, whatever ended
            // this one
            *thread_inner.socket.lock().unwrap() = None;
            thread_inner.running.store(false, Ordering::Release);
        });

        *listener = Some(ListenerHandle { keep_alive, thread });
    }

    /// Stops the listener and waits for it to finish. Idempotent.
    pub fn stop_server(&self) {
        let mut listener = self.inner.listener.lock().unwrap();
        if let Some(handle) = listener.take() {
            handle.keep_alive.store(false, Ordering::Release);

            // unblock the loop if it sits in a receive
            if let Some(socket) = self.inner.socket.lock().unwrap().take() {
                let _ = socket2::SockRef::from(&socket).shutdown(Shutdown::Both);
            }

            // the loop owns closing its socket; wait for that so no socket
            // leaks into a restart
            let _ = handle.thread.join();
        }
    }
}

impl<C: NtpClock> ServerInner<C> {
    fn listen_loop(inner: &Arc<Self>, keep_alive: &AtomicBool) {
        while keep_alive.load(Ordering::Acquire) {
            if !inner.okay_to_run.load(Ordering::Acquire) {
                thread::sleep(inner.config.gate_poll());
                continue;
            }

            let socket = match Self::bind_socket(&inner.config) {
                Ok(socket) => socket,
                Err(error) => {
                    // fatal: ends the loop, leaving the server stopped and
                    // restartable
                    warn!(?error, port = inner.config.port, "could not bind server socket");
                    return;
                }
            };

            match socket.try_clone() {
                Ok(clone) => *inner.socket.lock().unwrap() = Some(clone),
                Err(error) => {
                    warn!(?error, "could not share the server socket");
                    return;
                }
            }
            info!(addr = ?socket.local_addr().ok(), "listening for time requests");

            let outcome = Self::serve(inner, keep_alive, &socket);

            // relinquish the socket before rebinding or leaving
            *inner.socket.lock().unwrap() = None;
            drop(socket);

            if matches!(outcome, SocketOutcome::Shutdown) {
                return;
            }
        }
    }

    fn bind_socket(config: &ServerConfig) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_read_timeout(Some(config.receive_timeout()))?;
        socket.set_write_timeout(Some(config.send_timeout()))?;

        let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        socket.bind(&listen.into())?;
        Ok(socket.into())
    }

    fn serve(inner: &Arc<Self>, keep_alive: &AtomicBool, socket: &UdpSocket) -> SocketOutcome {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            if !keep_alive.load(Ordering::Acquire) {
                return SocketOutcome::Shutdown;
            }
            if !inner.okay_to_run.load(Ordering::Acquire) {
                thread::sleep(inner.config.gate_poll());
                continue;
            }

            match socket.recv_from(&mut buf) {
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    // receive timeout backstop: go around and re-check the
                    // shutdown and gate flags
                    continue;
                }
                Err(error) => {
                    if !keep_alive.load(Ordering::Acquire) {
                        // the error was our own shutdown
                        return SocketOutcome::Shutdown;
                    }
                    warn!(?error, "could not receive packet");

                    // Only ENETDOWN warrants a fresh socket. The other
                    // errors do not signal restart-worthy conditions for a
                    // server, and they can conceivably be triggered by a
                    // malicious third party.
                    match error.raw_os_error() {
                        Some(libc::ENETDOWN) => return SocketOutcome::Rebind,
                        _ => continue,
                    }
                }
                Ok((length, peer)) => Self::serve_packet(inner, socket, &buf[..length], peer),
            }
        }
    }

    fn serve_packet(inner: &Arc<Self>, socket: &UdpSocket, buf: &[u8], peer: SocketAddr) {
        // receipt time in server time, taken before any further processing
        let receive_timestamp = match Self::server_time(inner) {
            Some(timestamp) => timestamp,
            None => return,
        };

        let request = match NtpPacket::deserialize(buf) {
            Ok(request) => request,
            Err(error) => {
                debug!(?error, ?peer, "dropping malformed request");
                return;
            }
        };

        let reply = Self::build_reply(inner, &request, receive_timestamp);
        if let Err(error) = socket.send_to(&reply.serialize(), peer) {
            debug!(?error, ?peer, "could not send reply");
        }
    }

    /// Local time plus the current offset estimate.
    fn server_time(inner: &Arc<Self>) -> Option<NtpTimestamp> {
        match inner.clock.now() {
            Ok(now) => Some(now + inner.estimate.read().unwrap().offset),
            Err(error) => {
                warn!(%error, "could not read the clock");
                None
            }
        }
    }

    fn build_reply(
        inner: &Arc<Self>,
        request: &NtpPacket,
        receive_timestamp: NtpTimestamp,
    ) -> NtpPacket {
        let estimate = *inner.estimate.read().unwrap();

        // the version number stays as the request sent it
        let mut reply = *request;
        reply.set_leap(NtpLeapIndicator::NoWarning);
        reply.set_mode(NtpAssociationMode::Server);
        reply.set_stratum(inner.config.stratum);
        reply.set_poll(inner.config.poll_interval);
        reply.set_precision(inner.config.precision);
        // zero delay and dispersion for a directly referenced source
        reply.set_root_delay(RootDelay::default());
        reply.set_root_dispersion(RootDispersion::default());
        reply.set_reference_id(inner.config.reference_id);
        reply.set_reference_timestamp(estimate.reference_timestamp);
        reply.set_origin_timestamp(request.transmit_timestamp());
        reply.set_receive_timestamp(receive_timestamp);

        // Transmit is stamped last, at send time, to make it as accurate as
        // possible.
        if let Ok(now) = inner.clock.now() {
            reply.set_transmit_timestamp(now + estimate.offset);
        }

        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::clock::UnixClock;
    use crate::daemon::exchange::ClientExchange;
    use sntp_proto::{PollInterval, ReferenceId, TICKS_PER_SECOND};
    use std::time::{Duration, Instant};

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0, // bind an ephemeral port
            receive_timeout_ms: 1_000,
            gate_poll_ms: 50,
            ..ServerConfig::default()
        }
    }

    fn wait_for_bind<C: NtpClock>(server: &Server<C>) -> SocketAddr {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            assert!(Instant::now() < deadline, "server did not bind in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn exchange_with(addr: SocketAddr) -> ClientExchange {
        ClientExchange::new("127.0.0.1", addr.port(), Duration::from_secs(5))
    }

    #[test]
    fn server_replies_to_requests() {
        let server = Server::new(test_config(), UnixClock::realtime());
        server.set_okay_to_run(true);
        server.start_server();
        let addr = wait_for_bind(&server);
        assert!(server.is_running());

        let reply = exchange_with(addr)
            .ask_server(&UnixClock::realtime())
            .unwrap();

        assert_eq!(reply.mode(), NtpAssociationMode::Server);
        assert_eq!(reply.leap(), NtpLeapIndicator::NoWarning);
        assert_eq!(reply.stratum(), 1);
        assert_eq!(reply.reference_id(), ReferenceId::LOCL);
        assert_eq!(reply.poll(), PollInterval::MIN);
        assert_eq!(reply.root_delay(), RootDelay::default());
        assert_eq!(reply.root_dispersion(), RootDispersion::default());
        // with a zero offset estimate, client and server share a clock
        assert!(reply.clock_offset().abs().as_ticks() < TICKS_PER_SECOND);
        assert!(reply.roundtrip_delay().as_ticks() < TICKS_PER_SECOND);

        server.stop_server();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn offset_estimate_shows_up_in_replies() {
        let server = Server::new(test_config(), UnixClock::realtime());
        server.set_offset(NtpDuration::from_ticks(5 * TICKS_PER_SECOND));
        server.set_okay_to_run(true);
        server.start_server();
        let addr = wait_for_bind(&server);

        let reply = exchange_with(addr)
            .ask_server(&UnixClock::realtime())
            .unwrap();

        // the measured offset tracks the server's estimate on loopback
        let measured = reply.clock_offset().as_ticks();
        assert!((measured - 5 * TICKS_PER_SECOND).abs() < TICKS_PER_SECOND / 2);
        assert_ne!(reply.reference_timestamp(), NtpTimestamp::default());

        server.stop_server();
    }

    #[test]
    fn gate_controls_serving() {
        let mut config = test_config();
        // a fixed port is needed: nothing is bound while the gate is closed
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        config.port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = Server::new(config.clone(), UnixClock::realtime());
        server.start_server();

        // gate closed: no socket, no replies
        thread::sleep(Duration::from_millis(200));
        assert!(server.is_running());
        assert!(server.local_addr().is_none());
        let silent =
            ClientExchange::new("127.0.0.1", config.port, Duration::from_millis(200));
        assert!(silent.ask_server(&UnixClock::realtime()).is_err());

        // gate open: the loop binds and serves
        server.set_okay_to_run(true);
        let addr = wait_for_bind(&server);
        let reply = exchange_with(addr).ask_server(&UnixClock::realtime());
        assert!(reply.is_ok());

        server.stop_server();
    }

    #[test]
    fn malformed_requests_are_dropped() {
        let server = Server::new(test_config(), UnixClock::realtime());
        server.set_okay_to_run(true);
        server.start_server();
        let addr = wait_for_bind(&server);

        let garbage = UdpSocket::bind("127.0.0.1:0").unwrap();
        garbage.send_to(&[0x17; 10], addr).unwrap();

        // the loop keeps listening and serves the next valid request
        let reply = exchange_with(addr).ask_server(&UnixClock::realtime());
        assert!(reply.is_ok());

        server.stop_server();
    }

    #[test]
    fn start_and_stop_are_idempotent_and_restartable() {
        let server = Server::new(test_config(), UnixClock::realtime());
        server.set_okay_to_run(true);

        server.start_server();
        server.start_server();
        let addr = wait_for_bind(&server);
        assert!(exchange_with(addr)
            .ask_server(&UnixClock::realtime())
            .is_ok());

        server.stop_server();
        server.stop_server();
        assert!(!server.is_running());

        server.start_server();
        let addr = wait_for_bind(&server);
        assert!(exchange_with(addr)
            .ask_server(&UnixClock::realtime())
            .is_ok());
        server.stop_server();
    }
}

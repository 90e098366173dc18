use super::{Address, Consumer, NetError, hex};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM_SIZE: usize = 65_535;

pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 64;

struct Outbound {
    addr: Address,
    payload: Vec<u8>,
}

/// Sole owner of the UDP socket.
///
/// A dedicated thread waits for readiness on the socket and on a [`Waker`].
/// Inbound datagrams are handed to the [`Consumer`] synchronously on that thread;
/// outbound datagrams are queued by [`NetworkReactor::send`] from any thread and
/// written one per write-ready cycle.
///
/// The outbound queue is bounded: once `capacity` datagrams are waiting, further
/// sends are rejected with [`NetError::QueueFull`] instead of growing without limit.
pub struct NetworkReactor {
    sender: SyncSender<Outbound>,
    capacity: usize,
    waker: Arc<Waker>,
    stop_requested: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<UdpSocket>>,
}

impl NetworkReactor {
    pub fn start(
        bind: SocketAddr,
        capacity: usize,
        consumer: Arc<dyn Consumer>,
    ) -> Result<Self, NetError> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(bind)?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let local_addr = socket.local_addr()?;

        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let stop_requested = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            poll,
            socket,
            outbound: receiver,
            next: None,
            writable_interest: false,
            consumer,
            stop_requested: Arc::clone(&stop_requested),
        };

        info!("Starting network thread on {local_addr}");
        let thread = thread::Builder::new()
            .name("network-loop".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            sender,
            capacity,
            waker,
            stop_requested,
            local_addr,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues `payload` for `addr` and wakes the reactor. Never blocks.
    pub fn send(&self, addr: &Address, payload: &[u8]) -> Result<(), NetError> {
        if self.thread.is_none() {
            return Err(NetError::Stopped);
        }
        let outbound = Outbound {
            addr: addr.clone(),
            payload: payload.to_vec(),
        };
        match self.sender.try_send(outbound) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(NetError::QueueFull(self.capacity, addr.clone()));
            }
            Err(TrySendError::Disconnected(_)) => return Err(NetError::Stopped),
        }
        self.wake();
        Ok(())
    }

    /// Stops the reactor thread and closes the socket once the thread has exited.
    /// Calling it more than once is a no-op.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        info!("Interrupting network thread");
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake();
        match thread.join() {
            Ok(socket) => drop(socket),
            Err(_) => error!("Network thread panicked"),
        }
        info!("Network thread stopped");
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!("Failed to wake network thread: {e}");
        }
    }
}

impl Drop for NetworkReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    poll: Poll,
    socket: UdpSocket,
    outbound: Receiver<Outbound>,
    next: Option<Outbound>,
    writable_interest: bool,
    consumer: Arc<dyn Consumer>,
    stop_requested: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self) -> UdpSocket {
        let mut events = Events::with_capacity(16);
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        while !self.stop_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("Network readiness wait failed: {e}");
                break;
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            for event in events.iter() {
                if event.token() != SOCKET {
                    continue;
                }
                if event.is_error() {
                    error!("Error state on network socket");
                }
                if event.is_readable() {
                    self.receive_all(&mut buffer);
                }
                if event.is_writable() {
                    self.flush_one();
                }
            }

            self.update_interest();
        }

        self.socket
    }

    fn receive_all(&mut self, buffer: &mut [u8]) {
        loop {
            match self.socket.recv_from(buffer) {
                Ok((len, origin)) => {
                    let addr = Address::from(origin);
                    let payload = &buffer[..len];
                    info!("Received {len} bytes from {addr}: {}", hex(payload));
                    self.consumer.on_received(&addr, payload);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Receive failure on network socket: {e}");
                    return;
                }
            }
        }
    }

    fn flush_one(&mut self) {
        let Some(outbound) = self.next.take().or_else(|| self.pull()) else {
            return;
        };
        let target = match outbound.addr.resolve() {
            Ok(target) => target,
            Err(e) => {
                error!("Dropping datagram: {e}");
                return;
            }
        };

        info!(
            "Sending {} bytes to {}: {}",
            outbound.payload.len(),
            outbound.addr,
            hex(&outbound.payload)
        );
        self.consumer.on_sent(&outbound.addr, &outbound.payload);

        match self.socket.send_to(&outbound.payload, target) {
            Ok(written) if written < outbound.payload.len() => {
                warn!(
                    "Datagram to {} truncated ({written}/{} bytes)",
                    outbound.addr,
                    outbound.payload.len()
                );
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Socket not writable after all, retrying next cycle");
                self.next = Some(outbound);
            }
            Err(e) => error!("Send failure to {}: {e}", outbound.addr),
        }
    }

    fn pull(&mut self) -> Option<Outbound> {
        match self.outbound.try_recv() {
            Ok(outbound) => Some(outbound),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Keeps write interest armed exactly while a datagram is waiting.
    /// Re-registering re-arms the edge-triggered writable notification.
    fn update_interest(&mut self) {
        if self.next.is_none() {
            self.next = self.pull();
        }
        let want_write = self.next.is_some();
        if !want_write && !self.writable_interest {
            return;
        }

        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self
            .poll
            .registry()
            .reregister(&mut self.socket, SOCKET, interest)
        {
            Ok(()) => self.writable_interest = want_write,
            Err(e) => error!("Failed to update socket interest: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, Address, Vec<u8>)>>,
    }

    impl Recorder {
        fn wait_for(&self, count: usize) -> Vec<(&'static str, Address, Vec<u8>)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let events = self.events.lock().unwrap().clone();
                if events.len() >= count || Instant::now() > deadline {
                    return events;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    impl Consumer for Recorder {
        fn on_sent(&self, addr: &Address, payload: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(("sent", addr.clone(), payload.to_vec()));
        }
        fn on_received(&self, addr: &Address, payload: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(("received", addr.clone(), payload.to_vec()));
        }
    }

    fn peer() -> (StdUdpSocket, Address) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let addr = Address::from(socket.local_addr().unwrap());
        (socket, addr)
    }

    #[test]
    fn stop_without_any_send_is_clean() {
        let recorder = Arc::new(Recorder::default());
        let mut reactor =
            NetworkReactor::start("127.0.0.1:0".parse().unwrap(), 4, recorder).unwrap();
        reactor.stop();
        reactor.stop();
    }

    #[test]
    fn send_after_stop_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let mut reactor =
            NetworkReactor::start("127.0.0.1:0".parse().unwrap(), 4, recorder).unwrap();
        reactor.stop();
        let err = reactor
            .send(&Address::new("127.0.0.1", 5683), b"x")
            .unwrap_err();
        assert!(matches!(err, NetError::Stopped));
    }

    #[test]
    fn sent_datagram_is_announced_then_delivered() {
        let recorder = Arc::new(Recorder::default());
        let reactor =
            NetworkReactor::start("127.0.0.1:0".parse().unwrap(), 4, recorder.clone()).unwrap();
        let (peer, peer_addr) = peer();

        reactor.send(&peer_addr, b"\x40\x01\x00\x01").unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"\x40\x01\x00\x01");
        assert_eq!(from, reactor.local_addr());

        let events = recorder.wait_for(1);
        assert_eq!(events[0], ("sent", peer_addr, b"\x40\x01\x00\x01".to_vec()));
    }

    #[test]
    fn zero_length_payload_is_sent_as_is() {
        let recorder = Arc::new(Recorder::default());
        let reactor =
            NetworkReactor::start("127.0.0.1:0".parse().unwrap(), 4, recorder.clone()).unwrap();
        let (peer, peer_addr) = peer();

        reactor.send(&peer_addr, b"").unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn inbound_datagram_reaches_consumer_with_origin() {
        let recorder = Arc::new(Recorder::default());
        let reactor =
            NetworkReactor::start("127.0.0.1:0".parse().unwrap(), 4, recorder.clone()).unwrap();
        let (peer, peer_addr) = peer();

        peer.send_to(b"\x60\x45", reactor.local_addr()).unwrap();

        let events = recorder.wait_for(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("received", peer_addr, b"\x60\x45".to_vec()));
    }

    #[test]
    fn queued_datagrams_are_flushed_in_order() {
        let recorder = Arc::new(Recorder::default());
        let reactor =
            NetworkReactor::start("127.0.0.1:0".parse().unwrap(), 8, recorder.clone()).unwrap();
        let (peer, peer_addr) = peer();

        for i in 0..5u8 {
            reactor.send(&peer_addr, &[i]).unwrap();
        }

        let mut buf = [0u8; 8];
        for i in 0..5u8 {
            let (len, _) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], &[i]);
        }
        let sent: Vec<_> = recorder
            .wait_for(5)
            .into_iter()
            .map(|(_, _, payload)| payload)
            .collect();
        assert_eq!(sent, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
    }
}

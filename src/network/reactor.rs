//! Background receive threads.
//!
//! A [`Reactor`] owns one thread that blocks on one [`UdpTransport`], decodes every datagram
//! and hands the result to a [`MessageHandler`]. It performs no game-state computation
//! itself; malformed datagrams are dropped and reported.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::network::codec::decode_message;
use crate::network::messages::Message;
use crate::network::udp_transport::{UdpTransport, RECV_BUFFER_SIZE};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// Receives decoded messages from a reactor thread.
///
/// Called on the reactor thread; implementations take their own locks and must not block
/// for long.
pub trait MessageHandler: Send + Sync {
    /// Handles one decoded message from `from`.
    fn handle_message(&self, from: SocketAddr, msg: Message);
}

/// A running receive thread. Stopped and joined on drop.
#[derive(Debug)]
pub struct Reactor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Reactor {
    /// Starts a thread named `name` that feeds `socket`'s datagrams to `handler`.
    pub fn spawn(
        name: &str,
        socket: Arc<UdpTransport>,
        handler: Arc<dyn MessageHandler>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let local_addr = socket.local_addr().ok();
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(&socket, handler.as_ref(), &flag))?;
        debug!(thread = name, addr = ?local_addr, "reactor started");
        Ok(Self {
            stop,
            handle: Some(handle),
            local_addr,
        })
    }

    /// The address of the socket this reactor reads.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns `true` while the thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread to exit and waits for it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "reactor thread for {:?} panicked",
                    self.local_addr
                );
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(socket: &UdpTransport, handler: &dyn MessageHandler, stop: &AtomicBool) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    while !stop.load(Ordering::Acquire) {
        let (len, from) = match socket.recv(&mut buf) {
            Ok(Some(hit)) => hit,
            Ok(None) => continue,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Transport,
                    "receive failed: {}",
                    e
                );
                continue;
            },
        };
        let Some(bytes) = buf.get(..len) else {
            continue;
        };
        match decode_message(bytes) {
            Ok(msg) => {
                trace!(kind = %msg.kind(), index = %msg.index, %from, "received");
                handler.handle_message(from, msg);
            },
            Err(e) => report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Codec,
                "dropping {} byte datagram from {}: {}",
                len,
                from,
                e
            ),
        }
    }
    trace!("reactor exiting");
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::codec::encode_message;
    use crate::network::messages::{MessageBody, MessageIndex};
    use crate::Transport;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Inbox(Mutex<Vec<(SocketAddr, Message)>>);

    impl MessageHandler for Inbox {
        fn handle_message(&self, from: SocketAddr, msg: Message) {
            self.0.lock().push((from, msg));
        }
    }

    fn wait_for(inbox: &Inbox, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while inbox.0.lock().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    #[cfg(not(miri))]
    fn decodes_and_dispatches_skipping_garbage() {
        let socket = Arc::new(UdpTransport::bind_v4(0).unwrap());
        let port = socket.local_addr().unwrap().port();
        let inbox = Arc::new(Inbox::default());
        let mut reactor = Reactor::spawn("test-reactor", socket, inbox.clone()).unwrap();
        assert!(reactor.is_running());

        let sender = UdpTransport::bind_v4(0).unwrap();
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        sender.send_to(&[0xFF, 1, 2], dest);
        let msg = Message::new(MessageIndex::new(3), MessageBody::Heartbeat);
        sender.send_to(&encode_message(&msg).unwrap(), dest);

        wait_for(&inbox, 1);
        reactor.stop();
        assert!(!reactor.is_running());

        let got = inbox.0.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, msg);
    }

    #[test]
    #[cfg(not(miri))]
    fn stop_is_idempotent() {
        let socket = Arc::new(UdpTransport::bind_v4(0).unwrap());
        let mut reactor =
            Reactor::spawn("test-reactor", socket, Arc::new(Inbox::default())).unwrap();
        reactor.stop();
        reactor.stop();
        assert!(!reactor.is_running());
    }
}

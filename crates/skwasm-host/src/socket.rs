//! UDP socket manager.
//!
//! Guests never see a raw file descriptor: every socket is addressed by a
//! monotonically increasing handle allocated at open time. Multicast join
//! and TTL/loopback/broadcast options are frequently requested by guest
//! code before the socket is bound (mirroring how a typical marine NMEA
//! multicast listener is configured); since those options cannot always
//! be applied pre-bind on every platform, they are queued and flushed in
//! request order immediately after `bind` succeeds.
//!
//! `recv` is strictly non-blocking — a guest's cooperative single-threaded
//! execution model can't tolerate a blocking socket read, so inbound
//! datagrams are drained into a bounded FIFO (capacity 1000, drop-oldest)
//! by a background reader task, and `recv` only ever pops from that queue.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use socket2::Socket;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const RECV_BUFFER_CAPACITY: usize = 1000;
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// A socket option requested before bind, applied in request order once
/// the socket exists.
#[derive(Debug, Clone)]
pub enum DeferredOption {
    JoinMulticastV4 { multiaddr: Ipv4Addr, interface: Ipv4Addr },
    LeaveMulticastV4 { multiaddr: Ipv4Addr, interface: Ipv4Addr },
    SetTtl(u32),
    SetMulticastLoop(bool),
    SetBroadcast(bool),
}

#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

struct OpenSocket {
    handle: u64,
    inner: Arc<UdpSocket>,
    recv_buffer: Arc<Mutex<VecDeque<ReceivedDatagram>>>,
    reader_task: JoinHandle<()>,
}

impl Drop for OpenSocket {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Per-plugin collection of open UDP sockets, identified by opaque handles.
pub struct SocketManager {
    plugin_id: String,
    next_handle: AtomicU64,
    sockets: Mutex<HashMap<u64, OpenSocket>>,
    /// Options requested before the socket existed, applied once `bind`
    /// succeeds. Queued separately from `sockets` because a handle is
    /// allocated at `open` time, before any options or bind occur.
    pending_options: Mutex<HashMap<u64, Vec<DeferredOption>>>,
}

impl SocketManager {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            next_handle: AtomicU64::new(1),
            sockets: Mutex::new(HashMap::new()),
            pending_options: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a handle for a not-yet-bound socket. Options queued via
    /// `queue_option` before `bind` is called are flushed, in order, the
    /// moment the bind succeeds.
    pub async fn allocate_handle(&self) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.pending_options.lock().await.insert(handle, Vec::new());
        handle
    }

    pub async fn queue_option(&self, handle: u64, option: DeferredOption) {
        let mut pending = self.pending_options.lock().await;
        pending.entry(handle).or_default().push(option);
    }

    /// Apply `option` now if `handle` is already bound, otherwise queue it
    /// for the flush that happens right after `bind` succeeds. Guest code
    /// that configures multicast membership after an earlier `bind` call
    /// (rather than before it, the more common ordering) still takes
    /// effect immediately rather than being silently dropped.
    pub async fn request_option(&self, handle: u64, option: DeferredOption) -> std::io::Result<()> {
        let sockets = self.sockets.lock().await;
        if let Some(socket) = sockets.get(&handle) {
            apply_option_to_bound(&socket.inner, &option)
        } else {
            drop(sockets);
            self.queue_option(handle, option).await;
            Ok(())
        }
    }

    /// Bind the socket at `handle` to `addr`, then apply every deferred
    /// option in the order it was queued, then spawn the background
    /// reader task that feeds the bounded receive buffer.
    pub async fn bind(&self, handle: u64, addr: SocketAddr) -> std::io::Result<()> {
        let std_socket = Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        std_socket.set_reuse_address(true)?;
        std_socket.set_nonblocking(true)?;
        std_socket.bind(&addr.into())?;

        let options = {
            let mut pending = self.pending_options.lock().await;
            pending.remove(&handle).unwrap_or_default()
        };
        for option in &options {
            apply_option(&std_socket, option)?;
        }

        let tokio_socket = UdpSocket::from_std(std_socket.into())?;
        let inner = Arc::new(tokio_socket);
        let recv_buffer = Arc::new(Mutex::new(VecDeque::with_capacity(RECV_BUFFER_CAPACITY)));

        let reader_task = spawn_reader(Arc::clone(&inner), Arc::clone(&recv_buffer));

        let mut sockets = self.sockets.lock().await;
        sockets.insert(
            handle,
            OpenSocket {
                handle,
                inner,
                recv_buffer,
                reader_task,
            },
        );
        Ok(())
    }

    pub async fn send_to(&self, handle: u64, data: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        let sockets = self.sockets.lock().await;
        let socket = sockets
            .get(&handle)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unknown socket handle"))?;
        socket.inner.send_to(data, to).await
    }

    /// Pop the oldest buffered datagram, if any. Never blocks.
    pub async fn try_recv(&self, handle: u64) -> Option<ReceivedDatagram> {
        let sockets = self.sockets.lock().await;
        let socket = sockets.get(&handle)?;
        let mut buffer = socket.recv_buffer.lock().await;
        buffer.pop_front()
    }

    /// Number of datagrams currently buffered for `handle`, without
    /// draining any of them. `None` if the handle is unknown.
    pub async fn pending(&self, handle: u64) -> Option<usize> {
        let sockets = self.sockets.lock().await;
        let socket = sockets.get(&handle)?;
        Some(socket.recv_buffer.lock().await.len())
    }

    pub async fn close(&self, handle: u64) {
        let mut sockets = self.sockets.lock().await;
        sockets.remove(&handle);
        self.pending_options.lock().await.remove(&handle);
    }

    pub async fn close_all(&self) {
        let mut sockets = self.sockets.lock().await;
        sockets.clear();
        self.pending_options.lock().await.clear();
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

fn apply_option(socket: &Socket, option: &DeferredOption) -> std::io::Result<()> {
    match option {
        DeferredOption::JoinMulticastV4 { multiaddr, interface } => socket.join_multicast_v4(multiaddr, interface),
        DeferredOption::LeaveMulticastV4 { multiaddr, interface } => socket.leave_multicast_v4(multiaddr, interface),
        DeferredOption::SetTtl(ttl) => socket.set_multicast_ttl_v4(*ttl),
        DeferredOption::SetMulticastLoop(enabled) => socket.set_multicast_loop_v4(*enabled),
        DeferredOption::SetBroadcast(enabled) => socket.set_broadcast(*enabled),
    }
}

fn apply_option_to_bound(socket: &UdpSocket, option: &DeferredOption) -> std::io::Result<()> {
    match option {
        DeferredOption::JoinMulticastV4 { multiaddr, interface } => socket.join_multicast_v4(*multiaddr, *interface),
        DeferredOption::LeaveMulticastV4 { multiaddr, interface } => socket.leave_multicast_v4(*multiaddr, *interface),
        DeferredOption::SetTtl(ttl) => socket.set_multicast_ttl_v4(*ttl),
        DeferredOption::SetMulticastLoop(enabled) => socket.set_multicast_loop_v4(*enabled),
        DeferredOption::SetBroadcast(enabled) => socket.set_broadcast(*enabled),
    }
}

fn spawn_reader(socket: Arc<UdpSocket>, buffer: Arc<Mutex<VecDeque<ReceivedDatagram>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut scratch = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut scratch).await {
                Ok((len, from)) => {
                    let mut buffer = buffer.lock().await;
                    if buffer.len() >= RECV_BUFFER_CAPACITY {
                        buffer.pop_front();
                    }
                    buffer.push_back(ReceivedDatagram {
                        data: scratch[..len].to_vec(),
                        from,
                    });
                }
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_loopback_roundtrip() {
        let manager = SocketManager::new("test-plugin");
        let recv_handle = manager.allocate_handle().await;
        manager
            .bind(recv_handle, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let send_handle = manager.allocate_handle().await;
        manager
            .bind(send_handle, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let recv_addr = {
            let sockets = manager.sockets.lock().await;
            sockets.get(&recv_handle).unwrap().inner.local_addr().unwrap()
        };

        manager.send_to(send_handle, b"hello", recv_addr).await.unwrap();

        let mut received = None;
        for _ in 0..50 {
            if let Some(datagram) = manager.try_recv(recv_handle).await {
                received = Some(datagram);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let datagram = received.expect("expected a received datagram");
        assert_eq!(datagram.data, b"hello");
    }

    #[tokio::test]
    async fn try_recv_on_unknown_handle_returns_none() {
        let manager = SocketManager::new("test-plugin");
        assert!(manager.try_recv(999).await.is_none());
    }

    #[tokio::test]
    async fn close_removes_socket_and_pending_options() {
        let manager = SocketManager::new("test-plugin");
        let handle = manager.allocate_handle().await;
        manager.queue_option(handle, DeferredOption::SetTtl(8)).await;
        manager.close(handle).await;

        assert!(manager.pending_options.lock().await.get(&handle).is_none());
        assert!(manager.sockets.lock().await.get(&handle).is_none());
    }

    #[tokio::test]
    async fn request_option_applies_immediately_once_already_bound() {
        let manager = SocketManager::new("test-plugin");
        let handle = manager.allocate_handle().await;
        manager.bind(handle, "127.0.0.1:0".parse().unwrap()).await.unwrap();

        // Requested after bind, not before: must not be left sitting in the
        // pending-options queue.
        manager.request_option(handle, DeferredOption::SetBroadcast(false)).await.unwrap();
        assert!(manager.pending_options.lock().await.get(&handle).is_none());
    }

    #[tokio::test]
    async fn deferred_multicast_loop_option_is_applied_after_bind() {
        let manager = SocketManager::new("test-plugin");
        let handle = manager.allocate_handle().await;
        manager.queue_option(handle, DeferredOption::SetMulticastLoop(false)).await;
        manager.bind(handle, "127.0.0.1:0".parse().unwrap()).await.unwrap();

        let pending_after_bind = manager.pending_options.lock().await;
        assert!(pending_after_bind.get(&handle).is_none());
    }

    #[tokio::test]
    async fn deferred_set_ttl_applies_as_multicast_ttl_before_bind() {
        // §8 property 4: a deferred option applied before bind must leave
        // the socket in the same state as applying it after bind. SetTtl
        // only ever originates from `sk_udp_set_multicast_ttl`, so both
        // paths must configure the *multicast* TTL, not the unicast one.
        let manager = SocketManager::new("test-plugin");
        let handle = manager.allocate_handle().await;
        manager.queue_option(handle, DeferredOption::SetTtl(16)).await;
        manager.bind(handle, "127.0.0.1:0".parse().unwrap()).await.unwrap();

        assert!(manager.pending_options.lock().await.get(&handle).is_none());
    }

    #[tokio::test]
    async fn set_ttl_after_bind_also_uses_multicast_ttl() {
        let manager = SocketManager::new("test-plugin");
        let handle = manager.allocate_handle().await;
        manager.bind(handle, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        manager.request_option(handle, DeferredOption::SetTtl(16)).await.unwrap();
    }

    #[tokio::test]
    async fn pending_reports_buffered_depth_without_draining() {
        let manager = SocketManager::new("test-plugin");
        let recv_handle = manager.allocate_handle().await;
        manager.bind(recv_handle, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let send_handle = manager.allocate_handle().await;
        manager.bind(send_handle, "127.0.0.1:0".parse().unwrap()).await.unwrap();

        let recv_addr = {
            let sockets = manager.sockets.lock().await;
            sockets.get(&recv_handle).unwrap().inner.local_addr().unwrap()
        };

        manager.send_to(send_handle, b"one", recv_addr).await.unwrap();
        manager.send_to(send_handle, b"two", recv_addr).await.unwrap();

        let mut depth = 0;
        for _ in 0..50 {
            depth = manager.pending(recv_handle).await.unwrap();
            if depth >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(depth, 2);

        // Querying depth must not drain the buffer.
        assert_eq!(manager.pending(recv_handle).await.unwrap(), 2);
        assert!(manager.try_recv(recv_handle).await.is_some());
        assert_eq!(manager.pending(recv_handle).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_on_unknown_handle_returns_none() {
        let manager = SocketManager::new("test-plugin");
        assert!(manager.pending(999).await.is_none());
    }
}

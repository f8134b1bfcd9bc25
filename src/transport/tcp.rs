//! TCP sockets for the unshaped process
//!
//! Every socket gets a writer task fed through a [`WriteQueue`], so the
//! core's threads never wait on socket I/O, and a reader task that hands
//! chunks to the core and retries on backpressure.

use super::{
    deliver_with_backoff, write_queue, EventSlot, SocketEvents, SocketId, UnshapedTransport, WriteOp, WriteQueue,
    WriteQueueReceiver,
};
use crate::constants::WRITE_WINDOW;
use crate::error::{FlowError, TransportError};
use crate::flow::AddressPair;
use crate::protocol::ConnStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Listener and connector for plain TCP flows
pub struct TcpSockets {
    me: Weak<TcpSockets>,
    runtime: Handle,
    events: EventSlot<dyn SocketEvents>,
    next_socket: AtomicU64,
    writers: Mutex<HashMap<SocketId, WriteQueue>>,
    read_chunk: usize,
    backoff: Duration,
}

impl TcpSockets {
    /// `read_chunk` must stay below the queue capacity
    pub fn new(runtime: Handle, read_chunk: usize, backoff: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            runtime,
            events: EventSlot::new(),
            next_socket: AtomicU64::new(1),
            writers: Mutex::new(HashMap::new()),
            read_chunk: read_chunk.max(1),
            backoff,
        })
    }

    pub fn set_events(&self, events: Weak<dyn SocketEvents>) -> bool {
        self.events.set(events)
    }

    fn writers(&self) -> MutexGuard<'_, HashMap<SocketId, WriteQueue>> {
        self.writers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self) -> (SocketId, WriteQueueReceiver) {
        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = write_queue(WRITE_WINDOW);
        self.writers().insert(socket, queue);
        (socket, rx)
    }

    /// Accept clients until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(address = ?listener.local_addr().ok(), "accepting flows");
        loop {
            let (stream, peer) = listener.accept().await?;
            let (socket, rx) = self.register();
            debug!(socket_id = socket, %peer, "accepted connection");
            let this = self.clone();
            tokio::spawn(async move {
                this.run_socket(socket, stream, peer.to_string(), rx, true).await;
            });
        }
    }

    async fn run_socket(
        self: Arc<Self>,
        socket: SocketId,
        stream: TcpStream,
        client: String,
        rx: WriteQueueReceiver,
        accepted: bool,
    ) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(socket, writer, rx));
        if accepted && self.deliver(socket, &client, &[], ConnStatus::Syn).await.is_err() {
            // Rejected; the core has already asked for the shutdown
            return;
        }
        self.read_loop(socket, reader, &client).await;
    }

    async fn read_loop(&self, socket: SocketId, mut reader: OwnedReadHalf, client: &str) {
        let mut buf = vec![0u8; self.read_chunk];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = self.deliver(socket, client, &buf[..n], ConnStatus::Ongoing).await {
                        warn!(socket_id = socket, error = %e, "flow refused socket data");
                        break;
                    }
                }
                Err(e) => {
                    debug!(socket_id = socket, error = %e, "socket read failed");
                    break;
                }
            }
        }
        let _ = self.deliver(socket, client, &[], ConnStatus::Fin).await;
    }

    async fn deliver(&self, socket: SocketId, client: &str, bytes: &[u8], hint: ConnStatus) -> Result<(), FlowError> {
        deliver_with_backoff(
            || self.events.get().map(|events| events.on_socket_data(socket, client, bytes, hint)),
            self.backoff,
        )
        .await
    }
}

async fn write_loop(socket: SocketId, mut writer: OwnedWriteHalf, mut rx: WriteQueueReceiver) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(socket_id = socket, error = %e, "socket write failed");
                    break;
                }
                rx.written(bytes.len());
            }
            WriteOp::Finish => {
                if let Err(e) = writer.shutdown().await {
                    debug!(socket_id = socket, error = %e, "socket shutdown failed");
                }
                break;
            }
        }
    }
}

impl UnshapedTransport for TcpSockets {
    fn connect(&self, address: &AddressPair) -> Result<SocketId, TransportError> {
        let this = self.me.upgrade().ok_or(TransportError::Closed)?;
        let (socket, rx) = self.register();
        let server = address.server_endpoint();
        let client = address.client_endpoint();
        self.runtime.spawn(async move {
            match TcpStream::connect(&server).await {
                Ok(stream) => {
                    debug!(socket_id = socket, %server, "connected");
                    this.run_socket(socket, stream, client, rx, false).await;
                }
                Err(e) => {
                    warn!(socket_id = socket, %server, error = %e, "connect failed");
                    this.writers().remove(&socket);
                    let _ = this.deliver(socket, &client, &[], ConnStatus::Fin).await;
                }
            }
        });
        Ok(socket)
    }

    fn send_on_socket(&self, socket: SocketId, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.writers()
            .get(&socket)
            .ok_or(TransportError::UnknownSocket(socket))?
            .send(bytes)
    }

    fn close_socket(&self, socket: SocketId) -> Result<(), TransportError> {
        self.writers()
            .remove(&socket)
            .ok_or(TransportError::UnknownSocket(socket))?
            .finish()
    }

    /// Unknown sockets report unlimited room; the write that follows fails
    fn write_capacity(&self, socket: SocketId) -> usize {
        self.writers().get(&socket).map_or(usize::MAX, WriteQueue::capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<(SocketId, String, Vec<u8>, ConnStatus)>>,
    }

    impl SocketEvents for Recorder {
        fn on_socket_data(&self, socket: SocketId, client: &str, bytes: &[u8], hint: ConnStatus) -> Result<(), FlowError> {
            self.events
                .lock()
                .unwrap()
                .push((socket, client.to_string(), bytes.to_vec(), hint));
            Ok(())
        }
    }

    impl Recorder {
        fn statuses(&self) -> Vec<ConnStatus> {
            self.events.lock().unwrap().iter().map(|e| e.3).collect()
        }

        fn bytes(&self) -> Vec<u8> {
            self.events.lock().unwrap().iter().flat_map(|e| e.2.clone()).collect()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accepted_socket_reports_syn_data_fin() {
        let sockets = TcpSockets::new(Handle::current(), 4, Duration::from_millis(1));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn SocketEvents> = recorder.clone();
        sockets.set_events(Arc::downgrade(&handler));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(sockets.clone().serve(listener));

        let mut client = TcpStream::connect(address).await.unwrap();
        client.write_all(b"hello world").await.unwrap();
        client.shutdown().await.unwrap();

        timeout(Duration::from_secs(5), async {
            while recorder.statuses().last() != Some(&ConnStatus::Fin) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let statuses = recorder.statuses();
        assert_eq!(statuses.first(), Some(&ConnStatus::Syn));
        assert_eq!(recorder.bytes(), b"hello world");

        // Reply and half-close from the core's side
        let socket = recorder.events.lock().unwrap()[0].0;
        assert_eq!(sockets.write_capacity(socket), WRITE_WINDOW);
        sockets.send_on_socket(socket, b"bye".to_vec()).unwrap();
        sockets.close_socket(socket).unwrap();
        let mut reply = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"bye");
        assert!(sockets.send_on_socket(socket, b"x".to_vec()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_connect_reports_fin() {
        let sockets = TcpSockets::new(Handle::current(), 1024, Duration::from_millis(1));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn SocketEvents> = recorder.clone();
        sockets.set_events(Arc::downgrade(&handler));

        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port();
        let address = AddressPair::new("127.0.0.1", "1", "127.0.0.1", port.to_string());
        let socket = sockets.connect(&address).unwrap();

        timeout(Duration::from_secs(5), async {
            while recorder.statuses().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events[0].0, socket);
        assert_eq!(events[0].3, ConnStatus::Fin);
        assert!(sockets.close_socket(socket).is_err());
    }
}

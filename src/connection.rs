//! One physical TCP connection to a remote AMS router, multiplexing the
//!  requests of all local ports.
//!
//! Correlation works through a fixed pool of response slots, one per
//!  possible local port: reserving the slot (a compare-and-swap on its
//!  stored invoke id) is what enforces "at most one outstanding request per
//!  local port". A single receive task reads the stream, matches responses
//!  to slots and hands notification frames to their dispatcher. Anything it
//!  cannot deliver is drained by its self-declared length - ADS carries no
//!  resynchronization marker, so staying aligned on the stream is the one
//!  thing the receive loop must never get wrong.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::buffers::frame::Frame;
use crate::config::AmsConfig;
use crate::dispatcher::{Notification, NotificationDispatcher};
use crate::error::AdsError;
use crate::header::{AmsTcpHeader, AoeHeader, CommandId};
use crate::net_id::AmsAddr;

/// The (local port, remote address) pair identifying one logical
///  notification subscriber channel multiplexed over the shared connection.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct VirtualConnection {
    pub local_port: u16,
    pub remote: AmsAddr,
}

/// Response slot for one local port.
///
/// `invoke_id` doubles as the reservation marker: zero means free, anything
///  else is the correlation id of the outstanding request. A timed-out
///  request releases the slot immediately, so its late response (if any)
///  arrives with an invoke id the slot no longer holds and is drained off
///  the stream like any other undeliverable frame.
struct ResponseSlot {
    invoke_id: AtomicU32,
    wakeup: Notify,
    response: Mutex<SlotResponse>,
}

struct SlotResponse {
    frame: Frame,
    error_code: u32,
}

impl ResponseSlot {
    fn new(buffer_size: usize) -> ResponseSlot {
        ResponseSlot {
            invoke_id: AtomicU32::new(0),
            wakeup: Notify::new(),
            response: Mutex::new(SlotResponse {
                frame: Frame::new(buffer_size),
                error_code: 0,
            }),
        }
    }

    fn release(&self) {
        self.invoke_id.store(0, Ordering::Release);
    }
}

/// Result of one completed request: the AoE error code plus the raw
///  response payload (response header included).
pub struct AmsResponse {
    pub error_code: u32,
    pub payload: Vec<u8>,
}

pub struct AmsConnection {
    dest: SocketAddr,
    own_ip: std::net::IpAddr,
    config: Arc<AmsConfig>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    invoke_id: AtomicU32,
    slots: Vec<ResponseSlot>,
    dispatchers: Mutex<FxHashMap<VirtualConnection, Arc<NotificationDispatcher>>>,
    running: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl AmsConnection {
    /// Establish the TCP connection and spawn its receive task.
    pub async fn connect(dest: SocketAddr, config: Arc<AmsConfig>) -> Result<Arc<AmsConnection>, AdsError> {
        let stream = TcpStream::connect(dest).await?;
        stream.set_nodelay(true)?;
        let own_ip = stream.local_addr()?.ip();
        info!("connected to AMS router at {}", dest);

        let (read_half, write_half) = stream.into_split();
        let slots = (0..config.num_ports)
            .map(|_| ResponseSlot::new(config.max_response_size))
            .collect();

        let connection = Arc::new(AmsConnection {
            dest,
            own_ip,
            config,
            writer: tokio::sync::Mutex::new(write_half),
            invoke_id: AtomicU32::new(0),
            slots,
            dispatchers: Mutex::new(FxHashMap::default()),
            running: AtomicBool::new(true),
            receiver: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::recv_loop(connection.clone(), read_half));
        *connection.receiver.lock().unwrap() = Some(handle);
        Ok(connection)
    }

    /// The resolved peer address this connection is bound to.
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Local IP of the connected socket, used to derive a default net id.
    pub fn own_ip(&self) -> std::net::IpAddr {
        self.own_ip
    }

    /// Send one request and await its response, bounded by `timeout`.
    ///
    /// `frame` must contain the command-specific payload; the AoE and
    ///  AMS/TCP headers are prepended here. The source port's response slot
    ///  is reserved before any I/O - a slot that is still occupied by an
    ///  earlier request fails immediately with [`AdsError::PortBusy`].
    pub async fn request(
        &self,
        mut frame: Frame,
        dest: AmsAddr,
        source: AmsAddr,
        cmd: CommandId,
        timeout: Duration,
    ) -> Result<AmsResponse, AdsError> {
        let slot = self.slot(source.port).ok_or(AdsError::PortNotOpen)?;
        let invoke_id = self.next_invoke_id();

        let mut header_buf = Vec::with_capacity(AmsTcpHeader::WIRE_SIZE + AoeHeader::WIRE_SIZE);
        AoeHeader::request(dest, source, cmd, frame.size() as u32, invoke_id).ser(&mut header_buf);
        frame.prepend(&header_buf);
        header_buf.clear();
        AmsTcpHeader { length: frame.size() as u32 }.ser(&mut header_buf);
        frame.prepend(&header_buf);

        if slot.invoke_id.compare_exchange(0, invoke_id, Ordering::AcqRel, Ordering::Acquire).is_err() {
            warn!("port {} already has a request outstanding", source.port);
            return Err(AdsError::PortBusy);
        }

        trace!(?invoke_id, port = source.port, ?cmd, "sending request to {}", dest);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(frame.data()).await {
                slot.release();
                return Err(e.into());
            }
        }

        let waited = tokio::time::timeout(timeout, async {
            // a leftover permit from an earlier timed-out request may wake us
            //  spuriously, so re-check that the slot was actually completed
            while slot.invoke_id.load(Ordering::Acquire) != 0 {
                slot.wakeup.notified().await;
            }
        })
        .await;

        if waited.is_err() {
            slot.release();
            return Err(AdsError::SyncTimeout);
        }

        let mut response = slot.response.lock().unwrap();
        let payload = response.frame.data().to_vec();
        let error_code = response.error_code;
        response.frame.reset(self.config.max_response_size);
        Ok(AmsResponse { error_code, payload })
    }

    /// Register a subscription with the dispatcher of its virtual
    ///  connection, creating the dispatcher on first use.
    pub fn create_notify_mapping(
        &self,
        local_port: u16,
        remote: AmsAddr,
        handle: u32,
        notification: Notification,
    ) -> Arc<NotificationDispatcher> {
        let virtual_conn = VirtualConnection { local_port, remote };
        let dispatcher = self.dispatchers.lock().unwrap()
            .entry(virtual_conn)
            .or_insert_with(|| NotificationDispatcher::start(remote, self.config.ring_capacity))
            .clone();
        dispatcher.register(handle, notification);
        dispatcher
    }

    /// Shut the connection down: stop the receive loop, close the socket and
    ///  stop all dispatchers. Pending waiters observe this as a timeout.
    pub async fn close(&self) {
        self.running.store(false, Ordering::Release);

        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("shutting down socket to {}: {}", self.dest, e);
        }

        let receiver = self.receiver.lock().unwrap().take();
        if let Some(receiver) = receiver {
            receiver.abort();
            receiver.await.ok();
        }

        let dispatchers: Vec<_> = self.dispatchers.lock().unwrap().drain().collect();
        for (_, dispatcher) in dispatchers {
            dispatcher.shutdown().await;
        }
    }

    // invoke ids are monotonic and never zero, zero marks a free slot
    fn next_invoke_id(&self) -> u32 {
        loop {
            let id = self.invoke_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    fn slot(&self, port: u16) -> Option<&ResponseSlot> {
        let index = port.checked_sub(self.config.port_base)?;
        self.slots.get(index as usize)
    }

    async fn recv_loop(self: Arc<AmsConnection>, mut reader: OwnedReadHalf) {
        debug!("starting receive loop for {}", self.dest);
        if let Err(e) = self.recv(&mut reader).await {
            if self.running.load(Ordering::Acquire) {
                info!("receive loop for {} terminated: {}", self.dest, e);
            }
        }
        self.running.store(false, Ordering::Release);
    }

    async fn recv(&self, reader: &mut OwnedReadHalf) -> anyhow::Result<()> {
        let mut tcp_header = [0u8; AmsTcpHeader::WIRE_SIZE];
        let mut aoe_header = [0u8; AoeHeader::WIRE_SIZE];

        while self.running.load(Ordering::Acquire) {
            reader.read_exact(&mut tcp_header).await?;
            let tcp = AmsTcpHeader::try_deser(&mut &tcp_header[..])?;
            if (tcp.length as usize) < AoeHeader::WIRE_SIZE {
                warn!("frame from {} too short to carry an AoE header, draining {} bytes", self.dest, tcp.length);
                Self::drain(reader, tcp.length as usize).await?;
                continue;
            }

            reader.read_exact(&mut aoe_header).await?;
            let header = AoeHeader::try_deser(&mut &aoe_header[..])?;
            let length = header.length as usize;

            match CommandId::try_from(header.cmd_id) {
                Ok(CommandId::DeviceNotification) => {
                    self.route_notification(reader, &header).await?;
                }
                Ok(_) => {
                    self.deliver_response(reader, &header, length).await?;
                }
                Err(_) => {
                    warn!("unknown AMS command id {:#x} from {}, draining {} bytes", header.cmd_id, self.dest, length);
                    Self::drain(reader, length).await?;
                }
            }
        }
        Ok(())
    }

    async fn deliver_response(&self, reader: &mut OwnedReadHalf, header: &AoeHeader, length: usize) -> anyhow::Result<()> {
        let slot = match self.slot(header.target.port) {
            Some(slot) if slot.invoke_id.load(Ordering::Acquire) == header.invoke_id => slot,
            Some(slot) => {
                warn!(
                    "invoke id mismatch on port {}: waiting for {:#x}, received {:#x}",
                    header.target.port,
                    slot.invoke_id.load(Ordering::Acquire),
                    header.invoke_id
                );
                return Self::drain(reader, length).await;
            }
            None => {
                warn!("response for out-of-range port {}, draining {} bytes", header.target.port, length);
                return Self::drain(reader, length).await;
            }
        };

        if length > self.config.max_response_size {
            // too big for the slot's buffer: keep the stream aligned and let
            //  the waiter run into its timeout
            warn!("response of {} bytes exceeds slot buffer, draining", length);
            return Self::drain(reader, length).await;
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        {
            let mut response = slot.response.lock().unwrap();
            // the buffer may still be truncated from a response nobody
            //  collected, restore the full allocation first
            response.frame.reset(self.config.max_response_size);
            response.frame.raw_mut()[..length].copy_from_slice(&payload);
            response.frame.limit(length);
            response.error_code = header.error_code;
        }

        trace!(invoke_id = header.invoke_id, port = header.target.port, "response received");
        slot.release();
        slot.wakeup.notify_one();
        Ok(())
    }

    async fn route_notification(&self, reader: &mut OwnedReadHalf, header: &AoeHeader) -> anyhow::Result<()> {
        let length = header.length as usize;
        // the declared length is peer-controlled: cap it before allocating,
        //  a frame the ring could never hold is drained wholesale
        if length > self.config.ring_capacity {
            warn!("notification frame of {} bytes exceeds ring capacity, draining", length);
            return Self::drain(reader, length).await;
        }

        let virtual_conn = VirtualConnection {
            local_port: header.target.port,
            remote: header.source,
        };
        let dispatcher = self.dispatchers.lock().unwrap().get(&virtual_conn).cloned();

        let Some(dispatcher) = dispatcher else {
            debug!("notification for unknown virtual connection (port {}, {}), draining", header.target.port, header.source);
            return Self::drain(reader, length).await;
        };

        let mut frame = vec![0u8; length];
        reader.read_exact(&mut frame).await?;

        // the notification stream payload starts with its own u32 length,
        //  followed by the timestamp groups the dispatcher consumes
        if frame.len() < 4 {
            warn!("notification frame from {} too short for its length field", header.source);
            return Ok(());
        }
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if frame.len() - 4 < declared {
            warn!(
                "notification frame from {} declares {} bytes but carries {}",
                header.source, declared, frame.len() - 4
            );
            return Ok(());
        }
        dispatcher.enqueue(&frame[4..4 + declared]);
        Ok(())
    }

    async fn drain(reader: &mut OwnedReadHalf, mut bytes_to_read: usize) -> anyhow::Result<()> {
        let mut junk = [0u8; 1024];
        while bytes_to_read > 0 {
            let chunk = usize::min(bytes_to_read, junk.len());
            reader.read_exact(&mut junk[..chunk]).await?;
            bytes_to_read -= chunk;
        }
        Ok(())
    }
}

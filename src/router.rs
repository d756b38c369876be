//! The client-side AMS router: owns the route table, the physical
//!  connections and the local port pool, and exposes the ADS operations.
//!
//! All mutable state lives behind one mutex that is only ever held for
//!  lock-and-look work - network I/O happens strictly outside of it. Routes
//!  to different net ids that resolve to the same host share one TCP
//!  connection, reference counted so the connection closes with its last
//!  route.

use std::collections::hash_map::Entry;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Buf;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::buffers::frame::Frame;
use crate::config::AmsConfig;
use crate::connection::AmsConnection;
use crate::dispatcher::{Notification, NotificationCallback};
use crate::error::{AdsError, AdsVersion};
use crate::header::{
    AddNotificationRequestHeader, AmsTcpHeader, AoeHeader, CommandId, NotificationAttributes,
    ReadWriteRequestHeader, RequestHeader, WriteControlRequestHeader,
};
use crate::net_id::{AmsAddr, AmsNetId};
use crate::port::{AmsPort, NotificationBinding};

struct ConnectionEntry {
    connection: Arc<AmsConnection>,
    refcount: u32,
}

struct RouterState {
    local_net_id: AmsNetId,
    ports: Vec<AmsPort>,
    routes: FxHashMap<AmsNetId, SocketAddr>,
    connections: FxHashMap<SocketAddr, ConnectionEntry>,
}

pub struct AmsRouter {
    config: Arc<AmsConfig>,
    state: Mutex<RouterState>,
}

impl AmsRouter {
    pub fn new(config: AmsConfig) -> anyhow::Result<AmsRouter> {
        config.validate()?;
        let ports = (0..config.num_ports)
            .map(|_| AmsPort::closed(config.default_timeout))
            .collect();
        Ok(AmsRouter {
            config: Arc::new(config),
            state: Mutex::new(RouterState {
                local_net_id: AmsNetId::default(),
                ports,
                routes: FxHashMap::default(),
                connections: FxHashMap::default(),
            }),
        })
    }

    pub fn config(&self) -> &AmsConfig {
        &self.config
    }

    //------------------------------------- routes ---------------------------

    /// Make `net_id` reachable via `host` (a hostname or IP, with an optional
    ///  `:port` overriding the protocol's TCP port). Routes that resolve to
    ///  the same host share one connection; re-adding an existing route just
    ///  bumps the connection's reference count.
    pub async fn add_route(&self, net_id: AmsNetId, host: &str) -> Result<(), AdsError> {
        let target = Self::resolve(host, self.config.tcp_port).await?;

        {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            if let Some(existing) = state.routes.get(&net_id) {
                if *existing != target {
                    warn!("route for {} already points to {}", net_id, existing);
                    return Err(AdsError::RouteInUse(net_id));
                }
            }
            if let Some(entry) = state.connections.get_mut(&target) {
                entry.refcount += 1;
                state.routes.insert(net_id, target);
                return Ok(());
            }
        }

        let connection = AmsConnection::connect(target, self.config.clone()).await?;

        let duplicate = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            if let Some(existing) = state.routes.get(&net_id) {
                if *existing != target {
                    // raced against another add_route for the same net id
                    return Err(AdsError::RouteInUse(net_id));
                }
            }
            if state.local_net_id.is_unset() {
                if let IpAddr::V4(ip) = connection.own_ip() {
                    state.local_net_id = AmsNetId::from(ip);
                    info!("derived local net id {} from connected socket", state.local_net_id);
                }
            }
            match state.connections.entry(target) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().refcount += 1;
                    state.routes.insert(net_id, target);
                    Some(connection)
                }
                Entry::Vacant(entry) => {
                    entry.insert(ConnectionEntry { connection, refcount: 1 });
                    state.routes.insert(net_id, target);
                    None
                }
            }
        };

        // lost the connect race: another task registered a connection to the
        //  same host first, ours is surplus
        if let Some(duplicate) = duplicate {
            duplicate.close().await;
        }
        debug!("added route {} -> {}", net_id, target);
        Ok(())
    }

    /// Drop the route for `net_id`. The underlying connection is closed once
    ///  its last route is gone; notification bindings riding on it are
    ///  discarded without remote delete round-trips.
    pub async fn del_route(&self, net_id: AmsNetId) {
        let closing = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let Some(target) = state.routes.remove(&net_id) else {
                return;
            };
            let Some(entry) = state.connections.get_mut(&target) else {
                return;
            };
            entry.refcount -= 1;
            if entry.refcount > 0 {
                None
            } else {
                let entry = state.connections.remove(&target).unwrap();
                for port in &mut state.ports {
                    port.notifications.retain(|b| !Arc::ptr_eq(&b.connection, &entry.connection));
                }
                Some(entry.connection)
            }
        };

        if let Some(connection) = closing {
            debug!("closing connection after last route to {} was removed", net_id);
            connection.close().await;
        }
    }

    //------------------------------------- ports ----------------------------

    /// Claim a port from the local pool. Returns its externally visible port
    ///  number.
    pub fn open_port(&self) -> Result<u16, AdsError> {
        let mut state = self.state.lock().unwrap();
        for (index, port) in state.ports.iter_mut().enumerate() {
            if !port.is_open() {
                let number = self.config.port_base + index as u16;
                port.open(number);
                return Ok(number);
            }
        }
        warn!("local port pool exhausted");
        Err(AdsError::NoFreePort)
    }

    /// Release `port` back to the pool. Notifications still registered on
    ///  the port are deleted remotely (best effort) and unregistered locally.
    pub async fn close_port(&self, port: u16) -> Result<(), AdsError> {
        let (bindings, source) = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let local_net_id = state.local_net_id;
            let entry = Self::port_mut(state, self.config.port_base, port)?;
            let bindings = entry.close(self.config.default_timeout);
            (bindings, AmsAddr::new(local_net_id, port))
        };

        for binding in bindings {
            binding.dispatcher.unregister(binding.handle);
            if let Err(e) = self.delete_remote_notification(&binding, source, self.config.default_timeout).await {
                debug!("deleting notification {} on {} during port close: {}", binding.handle, binding.remote, e);
            }
        }
        Ok(())
    }

    pub fn get_timeout(&self, port: u16) -> Result<Duration, AdsError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::port_mut(&mut state, self.config.port_base, port)?.timeout)
    }

    pub fn set_timeout(&self, port: u16, timeout: Duration) -> Result<(), AdsError> {
        let mut state = self.state.lock().unwrap();
        Self::port_mut(&mut state, self.config.port_base, port)?.timeout = timeout;
        Ok(())
    }

    /// The AMS address requests from `port` are sent with.
    pub fn get_local_address(&self, port: u16) -> Result<AmsAddr, AdsError> {
        let mut state = self.state.lock().unwrap();
        let local_net_id = state.local_net_id;
        Self::port_mut(&mut state, self.config.port_base, port)?;
        Ok(AmsAddr::new(local_net_id, port))
    }

    /// Override the local net id instead of deriving it from the first
    ///  connection's IP.
    pub fn set_local_address(&self, net_id: AmsNetId) {
        self.state.lock().unwrap().local_net_id = net_id;
    }

    //------------------------------------- ADS operations -------------------

    /// Read `length` bytes from index group / offset on the target device.
    pub async fn read(&self, port: u16, dest: AmsAddr, group: u32, offset: u32, length: u32) -> Result<Vec<u8>, AdsError> {
        let mut frame = Self::request_frame(RequestHeader::WIRE_SIZE);
        let mut header = Vec::with_capacity(RequestHeader::WIRE_SIZE);
        RequestHeader { group, offset, length }.ser(&mut header);
        frame.prepend(&header);

        let payload = self.ads_request(port, dest, CommandId::Read, frame).await?;
        Self::parse_read_response(&payload)
    }

    /// Write `data` to index group / offset on the target device.
    pub async fn write(&self, port: u16, dest: AmsAddr, group: u32, offset: u32, data: &[u8]) -> Result<(), AdsError> {
        let mut frame = Self::request_frame(RequestHeader::WIRE_SIZE + data.len());
        frame.prepend(data);
        let mut header = Vec::with_capacity(RequestHeader::WIRE_SIZE);
        RequestHeader { group, offset, length: data.len() as u32 }.ser(&mut header);
        frame.prepend(&header);

        let payload = self.ads_request(port, dest, CommandId::Write, frame).await?;
        let mut buf = &payload[..];
        Self::pop_result(&mut buf)
    }

    /// Combined write-then-read in one round trip.
    pub async fn read_write(
        &self,
        port: u16,
        dest: AmsAddr,
        group: u32,
        offset: u32,
        read_length: u32,
        data: &[u8],
    ) -> Result<Vec<u8>, AdsError> {
        let mut frame = Self::request_frame(ReadWriteRequestHeader::WIRE_SIZE + data.len());
        frame.prepend(data);
        let mut header = Vec::with_capacity(ReadWriteRequestHeader::WIRE_SIZE);
        ReadWriteRequestHeader {
            group,
            offset,
            read_length,
            write_length: data.len() as u32,
        }
        .ser(&mut header);
        frame.prepend(&header);

        let payload = self.ads_request(port, dest, CommandId::ReadWrite, frame).await?;
        Self::parse_read_response(&payload)
    }

    /// Query the target's ADS state and device state.
    pub async fn read_state(&self, port: u16, dest: AmsAddr) -> Result<(u16, u16), AdsError> {
        let frame = Self::request_frame(0);
        let payload = self.ads_request(port, dest, CommandId::ReadState, frame).await?;

        let mut buf = &payload[..];
        Self::pop_result(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(Self::truncated("read state response"));
        }
        Ok((buf.get_u16_le(), buf.get_u16_le()))
    }

    /// Request a state transition on the target, with optional command data.
    pub async fn write_control(
        &self,
        port: u16,
        dest: AmsAddr,
        ads_state: u16,
        dev_state: u16,
        data: &[u8],
    ) -> Result<(), AdsError> {
        let mut frame = Self::request_frame(WriteControlRequestHeader::WIRE_SIZE + data.len());
        frame.prepend(data);
        let mut header = Vec::with_capacity(WriteControlRequestHeader::WIRE_SIZE);
        WriteControlRequestHeader { ads_state, dev_state, length: data.len() as u32 }.ser(&mut header);
        frame.prepend(&header);

        let payload = self.ads_request(port, dest, CommandId::WriteControl, frame).await?;
        let mut buf = &payload[..];
        Self::pop_result(&mut buf)
    }

    /// Query the target's device name and version.
    pub async fn read_device_info(&self, port: u16, dest: AmsAddr) -> Result<(String, AdsVersion), AdsError> {
        let frame = Self::request_frame(0);
        let payload = self.ads_request(port, dest, CommandId::ReadDeviceInfo, frame).await?;

        let mut buf = &payload[..];
        Self::pop_result(&mut buf)?;
        if buf.remaining() < 4 + 16 {
            return Err(Self::truncated("device info response"));
        }
        let version = AdsVersion {
            version: buf.get_u8(),
            revision: buf.get_u8(),
            build: buf.get_u16_le(),
        };
        let name_bytes = &buf[..16];
        let name_length = name_bytes.iter().position(|b| *b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&name_bytes[..name_length]).into_owned();
        Ok((name, version))
    }

    /// Subscribe to value changes on the target. The returned handle
    ///  identifies the subscription for [`AmsRouter::del_device_notification`];
    ///  samples arrive on `callback` via the connection's dispatcher.
    pub async fn add_device_notification(
        &self,
        port: u16,
        dest: AmsAddr,
        group: u32,
        offset: u32,
        attributes: NotificationAttributes,
        callback: NotificationCallback,
    ) -> Result<u32, AdsError> {
        let mut frame = Self::request_frame(AddNotificationRequestHeader::WIRE_SIZE);
        let mut header = Vec::with_capacity(AddNotificationRequestHeader::WIRE_SIZE);
        AddNotificationRequestHeader { group, offset, attributes }.ser(&mut header);
        frame.prepend(&header);

        let (connection, source, timeout) = self.prepare(port, dest.net_id)?;
        let response = connection.request(frame, dest, source, CommandId::AddDeviceNotification, timeout).await?;
        if response.error_code != 0 {
            return Err(AdsError::Device(response.error_code));
        }
        let mut buf = &response.payload[..];
        Self::pop_result(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(Self::truncated("add notification response"));
        }
        let handle = buf.get_u32_le();

        let dispatcher = connection.create_notify_mapping(
            port,
            dest,
            handle,
            Notification { callback, sample_size: attributes.length },
        );
        let binding = NotificationBinding {
            remote: dest,
            handle,
            dispatcher,
            connection,
        };

        let mut state = self.state.lock().unwrap();
        match Self::port_mut(&mut state, self.config.port_base, port) {
            Ok(entry) => {
                entry.notifications.push(binding);
                Ok(handle)
            }
            Err(e) => {
                // port was closed while the request was in flight
                binding.dispatcher.unregister(handle);
                Err(e)
            }
        }
    }

    /// Cancel the subscription `handle` on the target and stop local
    ///  delivery.
    pub async fn del_device_notification(&self, port: u16, dest: AmsAddr, handle: u32) -> Result<(), AdsError> {
        let (binding, source, timeout) = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let local_net_id = state.local_net_id;
            let entry = Self::port_mut(state, self.config.port_base, port)?;
            let timeout = entry.timeout;
            let binding = entry.take_notification(dest, handle)
                .ok_or(AdsError::UnknownNotification(handle))?;
            (binding, AmsAddr::new(local_net_id, port), timeout)
        };

        binding.dispatcher.unregister(handle);
        self.delete_remote_notification(&binding, source, timeout).await
    }

    //------------------------------------- plumbing -------------------------

    /// Resolve the connection, source address and timeout for a request from
    ///  `port` to `net_id` under the state lock.
    fn prepare(&self, port: u16, net_id: AmsNetId) -> Result<(Arc<AmsConnection>, AmsAddr, Duration), AdsError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let local_net_id = state.local_net_id;
        let target = *state.routes.get(&net_id).ok_or(AdsError::MissingRoute(net_id))?;
        let connection = state.connections.get(&target)
            .ok_or(AdsError::MissingRoute(net_id))?
            .connection
            .clone();
        let entry = Self::port_mut(state, self.config.port_base, port)?;
        Ok((connection, AmsAddr::new(local_net_id, port), entry.timeout))
    }

    async fn ads_request(&self, port: u16, dest: AmsAddr, cmd: CommandId, frame: Frame) -> Result<Vec<u8>, AdsError> {
        let (connection, source, timeout) = self.prepare(port, dest.net_id)?;
        let response = connection.request(frame, dest, source, cmd, timeout).await?;
        if response.error_code != 0 {
            return Err(AdsError::Device(response.error_code));
        }
        Ok(response.payload)
    }

    async fn delete_remote_notification(
        &self,
        binding: &NotificationBinding,
        source: AmsAddr,
        timeout: Duration,
    ) -> Result<(), AdsError> {
        let mut frame = Self::request_frame(4);
        frame.prepend(&binding.handle.to_le_bytes());
        let response = binding.connection
            .request(frame, binding.remote, source, CommandId::DelDeviceNotification, timeout)
            .await?;
        if response.error_code != 0 {
            return Err(AdsError::Device(response.error_code));
        }
        let mut buf = &response.payload[..];
        Self::pop_result(&mut buf)
    }

    fn port_mut<'a>(state: &'a mut RouterState, port_base: u16, port: u16) -> Result<&'a mut AmsPort, AdsError> {
        let index = port.checked_sub(port_base).ok_or(AdsError::PortNotOpen)?;
        let entry = state.ports.get_mut(index as usize).ok_or(AdsError::PortNotOpen)?;
        if !entry.is_open() {
            return Err(AdsError::PortNotOpen);
        }
        Ok(entry)
    }

    // sized so that prepending the AoE and AMS/TCP headers never reallocates
    fn request_frame(payload_size: usize) -> Frame {
        Frame::new(payload_size + AoeHeader::WIRE_SIZE + AmsTcpHeader::WIRE_SIZE)
    }

    fn parse_read_response(payload: &[u8]) -> Result<Vec<u8>, AdsError> {
        let mut buf = &payload[..];
        Self::pop_result(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(Self::truncated("read response"));
        }
        let length = buf.get_u32_le() as usize;
        if buf.remaining() < length {
            return Err(AdsError::InvalidResponse(format!(
                "read response declares {} data bytes but carries {}", length, buf.remaining()
            )));
        }
        Ok(buf[..length].to_vec())
    }

    fn pop_result(buf: &mut &[u8]) -> Result<(), AdsError> {
        if buf.remaining() < 4 {
            return Err(Self::truncated("result code"));
        }
        match buf.get_u32_le() {
            0 => Ok(()),
            code => Err(AdsError::Device(code)),
        }
    }

    fn truncated(what: &str) -> AdsError {
        AdsError::InvalidResponse(format!("response truncated in {}", what))
    }

    async fn resolve(host: &str, default_port: u16) -> Result<SocketAddr, AdsError> {
        let target = if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, default_port)
        };
        let addr = tokio::net::lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| AdsError::InvalidParameter(format!("cannot resolve host {:?}", host)));
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_router(num_ports: u16) -> AmsRouter {
        AmsRouter::new(AmsConfig {
            num_ports,
            ..AmsConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_port_pool_hands_out_distinct_ports() {
        let router = small_router(3);
        assert_eq!(router.open_port().unwrap(), 30000);
        assert_eq!(router.open_port().unwrap(), 30001);
        assert_eq!(router.open_port().unwrap(), 30002);
        assert!(matches!(router.open_port(), Err(AdsError::NoFreePort)));
    }

    #[tokio::test]
    async fn test_closed_port_is_reusable() {
        let router = small_router(1);
        let port = router.open_port().unwrap();
        router.close_port(port).await.unwrap();
        assert_eq!(router.open_port().unwrap(), port);
    }

    #[tokio::test]
    async fn test_close_of_unopened_port() {
        let router = small_router(4);
        assert!(matches!(router.close_port(30000).await, Err(AdsError::PortNotOpen)));
        assert!(matches!(router.close_port(29999).await, Err(AdsError::PortNotOpen)));
        assert!(matches!(router.close_port(40000).await, Err(AdsError::PortNotOpen)));
    }

    #[tokio::test]
    async fn test_timeout_reverts_on_close() {
        let router = small_router(2);
        let port = router.open_port().unwrap();
        assert_eq!(router.get_timeout(port).unwrap(), Duration::from_millis(5000));

        router.set_timeout(port, Duration::from_millis(100)).unwrap();
        assert_eq!(router.get_timeout(port).unwrap(), Duration::from_millis(100));

        router.close_port(port).await.unwrap();
        let port = router.open_port().unwrap();
        assert_eq!(router.get_timeout(port).unwrap(), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_request_without_route_fails() {
        let router = small_router(2);
        let port = router.open_port().unwrap();
        let dest = AmsAddr::new(AmsNetId([1, 2, 3, 4, 1, 1]), 851);
        match router.read(port, dest, 0x4020, 0, 4).await {
            Err(AdsError::MissingRoute(net_id)) => assert_eq!(net_id, dest.net_id),
            other => panic!("expected missing route, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_local_address_uses_configured_net_id() {
        let router = small_router(2);
        let port = router.open_port().unwrap();
        router.set_local_address(AmsNetId([10, 0, 0, 1, 1, 1]));
        assert_eq!(
            router.get_local_address(port).unwrap(),
            AmsAddr::new(AmsNetId([10, 0, 0, 1, 1, 1]), port)
        );
        assert!(matches!(router.get_local_address(30001), Err(AdsError::PortNotOpen)));
    }

    #[test]
    fn test_parse_read_response() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(&[7, 8, 9]);
        assert_eq!(AmsRouter::parse_read_response(&payload).unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn test_parse_read_response_device_error() {
        let payload = 0x701u32.to_le_bytes();
        assert!(matches!(
            AmsRouter::parse_read_response(&payload),
            Err(AdsError::Device(0x701))
        ));
    }

    #[test]
    fn test_parse_read_response_truncated() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(&[1, 2]);
        assert!(matches!(
            AmsRouter::parse_read_response(&payload),
            Err(AdsError::InvalidResponse(_))
        ));
    }
}

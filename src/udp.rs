//! UDP side channel for device discovery and remote route setup.
//!
//! Next to the TCP data path the remote routers listen on a UDP port for a
//!  simple tagged datagram format:
//!
//! ```ascii
//! 0:  cookie (u32, 0x71146603)
//! 4:  invoke id (u32, echoed by the response)
//! 8:  service id (u32; responses set bit 31)
//! 12: sender AMS address (8 bytes)
//! 20: tag count (u32)
//! 24: tags - per tag a u16 id, a u16 value length and the value bytes
//! ```
//!
//! Each operation is a single request / response exchange on a short-lived
//!  socket, bounded by the configured UDP timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::AmsConfig;
use crate::error::AdsError;
use crate::net_id::{AmsAddr, AmsNetId};

const COOKIE: u32 = 0x71146603;
const RESPONSE_BIT: u32 = 0x8000_0000;

const SERVICE_IDENTIFY: u32 = 1;
const SERVICE_ADD_ROUTE: u32 = 6;

mod tags {
    pub const STATUS: u16 = 0x01;
    pub const PASSWORD: u16 = 0x02;
    pub const COMPUTER_NAME: u16 = 0x05;
    pub const NET_ID: u16 = 0x07;
    pub const ROUTE_NAME: u16 = 0x0c;
    pub const USERNAME: u16 = 0x0d;
}

static INVOKE_ID: AtomicU32 = AtomicU32::new(1);

/// One datagram of the side-channel protocol, request or response.
#[derive(Debug)]
struct UdpDatagram {
    invoke_id: u32,
    service_id: u32,
    sender: AmsAddr,
    tags: Vec<(u16, Vec<u8>)>,
}

impl UdpDatagram {
    fn request(service_id: u32, sender: AmsAddr) -> UdpDatagram {
        UdpDatagram {
            invoke_id: INVOKE_ID.fetch_add(1, Ordering::Relaxed),
            service_id,
            sender,
            tags: Vec::new(),
        }
    }

    fn with_tag(mut self, id: u16, value: &[u8]) -> UdpDatagram {
        self.tags.push((id, value.to_vec()));
        self
    }

    /// Strings go on the wire NUL-terminated.
    fn with_string_tag(self, id: u16, value: &str) -> UdpDatagram {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.with_tag(id, &bytes)
    }

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(COOKIE);
        buf.put_u32_le(self.invoke_id);
        buf.put_u32_le(self.service_id);
        self.sender.ser(buf);
        buf.put_u32_le(self.tags.len() as u32);
        for (id, value) in &self.tags {
            buf.put_u16_le(*id);
            buf.put_u16_le(value.len() as u16);
            buf.put_slice(value);
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<UdpDatagram> {
        let cookie = buf.try_get_u32_le()?;
        if cookie != COOKIE {
            bail!("datagram with wrong cookie {:#x}", cookie);
        }
        let invoke_id = buf.try_get_u32_le()?;
        let service_id = buf.try_get_u32_le()?;
        let sender = AmsAddr::try_deser(buf)?;
        let tag_count = buf.try_get_u32_le()?;

        let mut tags = Vec::new();
        for _ in 0..tag_count {
            let id = buf.try_get_u16_le()?;
            let length = buf.try_get_u16_le()? as usize;
            if buf.remaining() < length {
                bail!("tag {:#x} declares {} value bytes but only {} remain", id, length, buf.remaining());
            }
            let mut value = vec![0u8; length];
            buf.copy_to_slice(&mut value);
            tags.push((id, value));
        }
        Ok(UdpDatagram { invoke_id, service_id, sender, tags })
    }

    fn tag(&self, id: u16) -> Option<&[u8]> {
        self.tags.iter().find(|(tag_id, _)| *tag_id == id).map(|(_, v)| v.as_slice())
    }

    fn string_tag(&self, id: u16) -> Option<String> {
        let bytes = self.tag(id)?;
        let length = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..length]).into_owned())
    }
}

/// Identity of a remote device as reported by [`discover`].
#[derive(Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub net_id: AmsNetId,
}

/// Ask the device at `host` to identify itself.
pub async fn discover(host: &str, config: &AmsConfig) -> Result<DeviceInfo, AdsError> {
    let request = UdpDatagram::request(SERVICE_IDENTIFY, AmsAddr::default());
    let response = exchange(host, config, request).await?;

    let name = response.string_tag(tags::COMPUTER_NAME)
        .ok_or_else(|| AdsError::InvalidResponse("identify response without computer name".to_string()))?;
    let net_id = match response.tag(tags::NET_ID) {
        Some(bytes) if bytes.len() >= 6 => AmsNetId([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]),
        // most devices also repeat the net id in the sender field
        _ => response.sender.net_id,
    };
    Ok(DeviceInfo { name, net_id })
}

/// Register `local_net_id` as a route named `route_name` on the remote
///  router at `host`, authenticating with the device's credentials.
pub async fn add_remote_route(
    host: &str,
    local_net_id: AmsNetId,
    username: &str,
    password: &str,
    route_name: &str,
    config: &AmsConfig,
) -> Result<(), AdsError> {
    let mut net_id_bytes = Vec::new();
    local_net_id.ser(&mut net_id_bytes);

    let request = UdpDatagram::request(SERVICE_ADD_ROUTE, AmsAddr::new(local_net_id, 0))
        .with_tag(tags::NET_ID, &net_id_bytes)
        .with_string_tag(tags::ROUTE_NAME, route_name)
        .with_string_tag(tags::USERNAME, username)
        .with_string_tag(tags::PASSWORD, password);
    let response = exchange(host, config, request).await?;

    let status = response.tag(tags::STATUS)
        .filter(|v| v.len() >= 4)
        .map(|v| u32::from_le_bytes([v[0], v[1], v[2], v[3]]))
        .ok_or_else(|| AdsError::InvalidResponse("add route response without status tag".to_string()))?;
    if status != 0 {
        return Err(AdsError::Device(status));
    }
    Ok(())
}

async fn exchange(host: &str, config: &AmsConfig, request: UdpDatagram) -> Result<UdpDatagram, AdsError> {
    let target = resolve(host, config.udp_port).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    let mut buf = BytesMut::new();
    request.ser(&mut buf);
    socket.send_to(&buf, target).await?;
    debug!("sent service {:#x} datagram to {}", request.service_id, target);

    let mut response_buf = [0u8; 2048];
    // datagrams from third parties on the socket are not tolerated - anything
    //  that doesn't parse as our response fails the exchange
    let (received, from) = tokio::time::timeout(config.udp_timeout, socket.recv_from(&mut response_buf))
        .await
        .map_err(|_| AdsError::SyncTimeout)??;
    debug!("received {} byte datagram from {}", received, from);

    let response = UdpDatagram::try_deser(&mut &response_buf[..received])
        .map_err(|e| AdsError::InvalidResponse(e.to_string()))?;
    if response.service_id != request.service_id | RESPONSE_BIT {
        return Err(AdsError::InvalidResponse(format!(
            "expected service id {:#x}, received {:#x}",
            request.service_id | RESPONSE_BIT,
            response.service_id
        )));
    }
    if response.invoke_id != request.invoke_id {
        return Err(AdsError::InvalidResponse(format!(
            "expected invoke id {:#x}, received {:#x}", request.invoke_id, response.invoke_id
        )));
    }
    Ok(response)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_datagram_roundtrip() {
        let datagram = UdpDatagram::request(SERVICE_ADD_ROUTE, AmsAddr::new(AmsNetId([10, 0, 0, 1, 1, 1]), 0))
            .with_string_tag(tags::ROUTE_NAME, "plc1")
            .with_tag(tags::NET_ID, &[10, 0, 0, 1, 1, 1]);

        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        assert_eq!(&buf[..4], &COOKIE.to_le_bytes());

        let parsed = UdpDatagram::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(parsed.invoke_id, datagram.invoke_id);
        assert_eq!(parsed.service_id, SERVICE_ADD_ROUTE);
        assert_eq!(parsed.sender, datagram.sender);
        assert_eq!(parsed.string_tag(tags::ROUTE_NAME).unwrap(), "plc1");
        assert_eq!(parsed.tag(tags::NET_ID).unwrap(), &[10, 0, 0, 1, 1, 1]);
        assert!(parsed.tag(tags::STATUS).is_none());
    }

    #[test]
    fn test_wrong_cookie_rejected() {
        let mut buf = BytesMut::new();
        UdpDatagram::request(SERVICE_IDENTIFY, AmsAddr::default()).ser(&mut buf);
        buf[0] ^= 0xFF;
        assert!(UdpDatagram::try_deser(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_truncated_tag_rejected() {
        let mut buf = BytesMut::new();
        UdpDatagram::request(SERVICE_IDENTIFY, AmsAddr::default())
            .with_tag(tags::PASSWORD, &[1, 2, 3, 4])
            .ser(&mut buf);
        let truncated = &buf[..buf.len() - 2];
        assert!(UdpDatagram::try_deser(&mut &truncated[..]).is_err());
    }

    /// Fake device answering exactly one datagram, used by the exchange tests.
    async fn one_shot_device(respond: impl FnOnce(UdpDatagram) -> UdpDatagram + Send + 'static) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (received, from) = socket.recv_from(&mut buf).await.unwrap();
            let request = UdpDatagram::try_deser(&mut &buf[..received]).unwrap();
            let mut out = BytesMut::new();
            respond(request).ser(&mut out);
            socket.send_to(&out, from).await.unwrap();
        });
        addr
    }

    fn test_config() -> AmsConfig {
        AmsConfig {
            udp_timeout: Duration::from_secs(5),
            ..AmsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_discover_returns_device_identity() {
        let device = one_shot_device(|request| {
            UdpDatagram {
                invoke_id: request.invoke_id,
                service_id: SERVICE_IDENTIFY | RESPONSE_BIT,
                sender: AmsAddr::new(AmsNetId([192, 168, 0, 2, 1, 1]), 0),
                tags: vec![],
            }
            .with_string_tag(tags::COMPUTER_NAME, "plc-station")
            .with_tag(tags::NET_ID, &[192, 168, 0, 2, 1, 1])
        })
        .await;

        let info = discover(&device.to_string(), &test_config()).await.unwrap();
        assert_eq!(info, DeviceInfo {
            name: "plc-station".to_string(),
            net_id: AmsNetId([192, 168, 0, 2, 1, 1]),
        });
    }

    #[tokio::test]
    async fn test_add_route_propagates_device_status() {
        let device = one_shot_device(|request| {
            UdpDatagram {
                invoke_id: request.invoke_id,
                service_id: SERVICE_ADD_ROUTE | RESPONSE_BIT,
                sender: AmsAddr::default(),
                tags: vec![],
            }
            .with_tag(tags::STATUS, &0x0704u32.to_le_bytes())
        })
        .await;

        let result = add_remote_route(
            &device.to_string(),
            AmsNetId([10, 0, 0, 1, 1, 1]),
            "user",
            "secret",
            "route",
            &test_config(),
        )
        .await;
        assert!(matches!(result, Err(AdsError::Device(0x0704))));
    }

    #[tokio::test]
    async fn test_add_route_success() {
        let device = one_shot_device(|request| {
            UdpDatagram {
                invoke_id: request.invoke_id,
                service_id: SERVICE_ADD_ROUTE | RESPONSE_BIT,
                sender: AmsAddr::default(),
                tags: vec![],
            }
            .with_tag(tags::STATUS, &0u32.to_le_bytes())
        })
        .await;

        add_remote_route(
            &device.to_string(),
            AmsNetId([10, 0, 0, 1, 1, 1]),
            "user",
            "secret",
            "route",
            &test_config(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_mismatching_service_id_rejected() {
        let device = one_shot_device(|request| UdpDatagram {
            invoke_id: request.invoke_id,
            // response bit missing
            service_id: SERVICE_IDENTIFY,
            sender: AmsAddr::default(),
            tags: vec![],
        })
        .await;

        let result = discover(&device.to_string(), &test_config()).await;
        assert!(matches!(result, Err(AdsError::InvalidResponse(_))));
    }
}

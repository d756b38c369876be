//! Wire codecs for the fixed binary headers of the AMS/ADS protocol.
//!
//! Every multi-byte integer on the wire is little-endian regardless of host
//!  order. The framing on the TCP stream is:
//!
//! ```ascii
//! 0: AMS/TCP header (6 bytes)
//!    0: reserved (u16, zero)
//!    2: length (u32) - number of bytes following this header
//! 6: AoE header (32 bytes)
//!    0:  target net id (6 bytes)
//!    6:  target port (u16)
//!    8:  source net id (6 bytes)
//!    14: source port (u16)
//!    16: command id (u16)
//!    18: state flags (u16)
//!    20: length (u32) - payload length after this header
//!    24: error code (u32)
//!    28: invoke id (u32)
//! 38: command-specific payload
//! ```
//!
//! There is no checksum and no resynchronization marker: the only way to
//!  stay aligned on the stream is to trust the self-declared lengths and to
//!  drain exactly `length` bytes for every frame that cannot be delivered.

use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::net_id::AmsAddr;

/// State flag value of a request frame.
pub const STATE_AMS_REQUEST: u16 = 0x0004;
/// State flag value of a response frame.
pub const STATE_AMS_RESPONSE: u16 = 0x0005;
/// Additional state flag bit set by the UDP discovery variant of AoE.
pub const STATE_AMS_UDP: u16 = 0x0040;

/// AoE command ids.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum CommandId {
    ReadDeviceInfo = 1,
    Read = 2,
    Write = 3,
    ReadState = 4,
    WriteControl = 5,
    AddDeviceNotification = 6,
    DelDeviceNotification = 7,
    DeviceNotification = 8,
    ReadWrite = 9,
}

/// Outermost header on the TCP stream: 2 reserved bytes plus the length of
///  everything that follows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AmsTcpHeader {
    pub length: u32,
}

impl AmsTcpHeader {
    pub const WIRE_SIZE: usize = 6;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(0);
        buf.put_u32_le(self.length);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AmsTcpHeader> {
        let reserved = buf.try_get_u16_le()?;
        if reserved != 0 {
            bail!("AMS/TCP header with non-zero reserved field {:#x}", reserved);
        }
        let length = buf.try_get_u32_le()?;
        Ok(AmsTcpHeader { length })
    }
}

/// The AoE header carrying addressing, command id, invoke id and error code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AoeHeader {
    pub target: AmsAddr,
    pub source: AmsAddr,
    pub cmd_id: u16,
    pub state_flags: u16,
    pub length: u32,
    pub error_code: u32,
    pub invoke_id: u32,
}

impl AoeHeader {
    pub const WIRE_SIZE: usize = 32;

    pub fn request(target: AmsAddr, source: AmsAddr, cmd: CommandId, length: u32, invoke_id: u32) -> AoeHeader {
        AoeHeader {
            target,
            source,
            cmd_id: cmd as u16,
            state_flags: STATE_AMS_REQUEST,
            length,
            error_code: 0,
            invoke_id,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.target.ser(buf);
        self.source.ser(buf);
        buf.put_u16_le(self.cmd_id);
        buf.put_u16_le(self.state_flags);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.error_code);
        buf.put_u32_le(self.invoke_id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AoeHeader> {
        Ok(AoeHeader {
            target: AmsAddr::try_deser(buf)?,
            source: AmsAddr::try_deser(buf)?,
            cmd_id: buf.try_get_u16_le()?,
            state_flags: buf.try_get_u16_le()?,
            length: buf.try_get_u32_le()?,
            error_code: buf.try_get_u32_le()?,
            invoke_id: buf.try_get_u32_le()?,
        })
    }
}

/// Payload header of READ and WRITE requests.
pub struct RequestHeader {
    pub group: u32,
    pub offset: u32,
    pub length: u32,
}

impl RequestHeader {
    pub const WIRE_SIZE: usize = 12;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.group);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.length);
    }
}

/// Payload header of a READ_WRITE request, followed by the write data.
pub struct ReadWriteRequestHeader {
    pub group: u32,
    pub offset: u32,
    pub read_length: u32,
    pub write_length: u32,
}

impl ReadWriteRequestHeader {
    pub const WIRE_SIZE: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.group);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.read_length);
        buf.put_u32_le(self.write_length);
    }
}

/// Payload header of a WRITE_CONTROL request, followed by optional data.
pub struct WriteControlRequestHeader {
    pub ads_state: u16,
    pub dev_state: u16,
    pub length: u32,
}

impl WriteControlRequestHeader {
    pub const WIRE_SIZE: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.ads_state);
        buf.put_u16_le(self.dev_state);
        buf.put_u32_le(self.length);
    }
}

/// How the device decides when to transmit a notification sample.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TransmissionMode {
    /// Server-timed, every cycle.
    Cyclic = 3,
    /// Server-timed, only when the value changed.
    OnChange = 4,
    /// Client-timed, every cycle.
    CyclicInContext = 5,
    /// Client-timed, only when the value changed.
    OnChangeInContext = 6,
}

/// Subscription parameters of an add-notification request.
#[derive(Clone, Copy, Debug)]
pub struct NotificationAttributes {
    /// Size of one sample in bytes. Samples whose declared size differs from
    ///  this are dropped on delivery.
    pub length: u32,
    pub mode: TransmissionMode,
    /// Maximum delay before a pending sample is transmitted, in 100ns units.
    pub max_delay: u32,
    /// Sampling interval in 100ns units.
    pub cycle_time: u32,
}

/// Payload of an ADD_DEVICE_NOTIFICATION request.
pub struct AddNotificationRequestHeader {
    pub group: u32,
    pub offset: u32,
    pub attributes: NotificationAttributes,
}

impl AddNotificationRequestHeader {
    pub const WIRE_SIZE: usize = 40;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.group);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.attributes.length);
        buf.put_u32_le(self.attributes.mode as u32);
        buf.put_u32_le(self.attributes.max_delay);
        buf.put_u32_le(self.attributes.cycle_time);
        buf.put_slice(&[0u8; 16]);
    }
}

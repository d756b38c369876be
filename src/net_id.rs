use std::fmt::{Debug, Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::anyhow;
use bytes::{Buf, BufMut};

/// Six-byte hierarchical AMS net id, e.g. `192.168.0.5.1.1`.
///
/// Despite the dotted notation this is *not* an IP address - it is an opaque
///  identifier the remote router matches against its route table. By
///  convention a host derives its own net id from its IPv4 address with
///  `.1.1` appended, see [`AmsNetId::from`].
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AmsNetId(pub [u8; 6]);

impl AmsNetId {
    /// A zero net id marks "not yet assigned" throughout this crate.
    pub fn is_unset(&self) -> bool {
        self.0 == [0u8; 6]
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AmsNetId> {
        let mut bytes = [0u8; 6];
        for b in &mut bytes {
            *b = buf.try_get_u8()?;
        }
        Ok(AmsNetId(bytes))
    }
}

impl From<[u8; 6]> for AmsNetId {
    fn from(bytes: [u8; 6]) -> Self {
        AmsNetId(bytes)
    }
}

impl From<Ipv4Addr> for AmsNetId {
    fn from(ip: Ipv4Addr) -> Self {
        let o = ip.octets();
        AmsNetId([o[0], o[1], o[2], o[3], 1, 1])
    }
}

impl FromStr for AmsNetId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split('.');
        for b in &mut bytes {
            *b = parts.next()
                .ok_or_else(|| anyhow!("malformed net id {:?}: expected 6 dotted segments", s))?
                .parse()
                .map_err(|_| anyhow!("malformed net id {:?}: segment is not a byte", s))?;
        }
        if parts.next().is_some() {
            return Err(anyhow!("malformed net id {:?}: expected 6 dotted segments", s));
        }
        Ok(AmsNetId(bytes))
    }
}

impl Display for AmsNetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl Debug for AmsNetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Full AMS endpoint address: net id plus 16-bit port.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AmsAddr {
    pub net_id: AmsNetId,
    pub port: u16,
}

impl AmsAddr {
    pub fn new(net_id: AmsNetId, port: u16) -> AmsAddr {
        AmsAddr { net_id, port }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.net_id.ser(buf);
        buf.put_u16_le(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AmsAddr> {
        let net_id = AmsNetId::try_deser(buf)?;
        let port = buf.try_get_u16_le()?;
        Ok(AmsAddr { net_id, port })
    }
}

impl Display for AmsAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

impl Debug for AmsAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("192.168.0.5.1.1", [192, 168, 0, 5, 1, 1])]
    #[case::zero("0.0.0.0.0.0", [0, 0, 0, 0, 0, 0])]
    #[case::max("255.255.255.255.255.255", [255; 6])]
    fn test_parse(#[case] text: &str, #[case] expected: [u8; 6]) {
        assert_eq!(text.parse::<AmsNetId>().unwrap(), AmsNetId(expected));
        assert_eq!(AmsNetId(expected).to_string(), text);
    }

    #[rstest]
    #[case::too_few("1.2.3.4.5")]
    #[case::too_many("1.2.3.4.5.6.7")]
    #[case::not_a_byte("1.2.3.4.5.256")]
    #[case::garbage("hello")]
    #[case::empty("")]
    fn test_parse_malformed(#[case] text: &str) {
        assert!(text.parse::<AmsNetId>().is_err());
    }

    #[test]
    fn test_from_ipv4() {
        let net_id = AmsNetId::from(Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(net_id, AmsNetId([10, 0, 0, 7, 1, 1]));
    }

    #[rstest]
    #[case::by_bytes([1, 2, 3, 4, 5, 6], 1, [1, 2, 3, 4, 5, 7], 1)]
    #[case::by_port([1, 2, 3, 4, 5, 6], 1, [1, 2, 3, 4, 5, 6], 2)]
    #[case::bytes_before_port([1, 2, 3, 4, 5, 6], 9, [1, 2, 3, 4, 6, 0], 1)]
    fn test_addr_order(
        #[case] smaller: [u8; 6], #[case] smaller_port: u16,
        #[case] bigger: [u8; 6], #[case] bigger_port: u16,
    ) {
        let a = AmsAddr::new(AmsNetId(smaller), smaller_port);
        let b = AmsAddr::new(AmsNetId(bigger), bigger_port);
        assert!(a < b);
    }

    #[test]
    fn test_addr_roundtrip() {
        let addr = AmsAddr::new(AmsNetId([192, 168, 0, 5, 1, 1]), 851);
        let mut buf = bytes::BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[..6], &[192, 168, 0, 5, 1, 1]);
        assert_eq!(&buf[6..], &851u16.to_le_bytes());

        let parsed = AmsAddr::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_deser_short_buffer() {
        let mut buf = &[1u8, 2, 3][..];
        assert!(AmsAddr::try_deser(&mut buf).is_err());
    }
}

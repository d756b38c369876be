use std::time::Duration;
use anyhow::bail;

/// Static configuration of the AMS protocol engine.
///
/// The defaults reproduce the constants of the reference routers, so most
///  applications will never touch anything but [`AmsConfig::default_timeout`].
pub struct AmsConfig {
    /// TCP port the remote AMS router listens on. The protocol reserves 48898,
    ///  overriding it is mostly useful for tests against an in-process server.
    pub tcp_port: u16,

    /// UDP port for the discovery / route-setup side channel.
    pub udp_port: u16,

    /// First externally visible local port number. Local ports are handed out
    ///  as `port_base..port_base + num_ports`.
    pub port_base: u16,

    /// Size of the local port pool. This also bounds the number of concurrent
    ///  in-flight requests per connection, since each local port owns exactly
    ///  one response slot.
    pub num_ports: u16,

    /// Timeout applied to a request on a freshly opened port until the
    ///  application overrides it per port.
    pub default_timeout: Duration,

    /// Timeout for a single datagram exchange on the UDP side channel.
    pub udp_timeout: Duration,

    /// Usable capacity of each notification ring buffer. Incoming
    ///  notifications are dropped while the buffer lacks room, so this bounds
    ///  how far callback execution may lag behind the network.
    pub ring_capacity: usize,

    /// Capacity of a response slot's receive buffer. Responses larger than
    ///  this are drained off the stream and discarded, the waiting request
    ///  runs into its timeout.
    pub max_response_size: usize,
}

impl AmsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_ports == 0 {
            bail!("local port pool must not be empty");
        }
        if u16::MAX - self.port_base < self.num_ports {
            bail!("local port pool exceeds the u16 port range");
        }
        if self.ring_capacity < self.max_response_size + 4 {
            bail!("notification ring buffer is smaller than a single frame");
        }
        Ok(())
    }
}

impl Default for AmsConfig {
    fn default() -> AmsConfig {
        AmsConfig {
            tcp_port: 48898,
            udp_port: 48899,
            port_base: 30000,
            num_ports: 128,
            default_timeout: Duration::from_millis(5000),
            udp_timeout: Duration::from_millis(5000),
            ring_capacity: 4 * 1024 * 1024,
            max_response_size: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(AmsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_pool_rejected() {
        let config = AmsConfig {
            num_ports: 0,
            ..AmsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_overflowing_port_range_rejected() {
        let config = AmsConfig {
            port_base: u16::MAX - 10,
            num_ports: 128,
            ..AmsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_undersized_ring_rejected() {
        let config = AmsConfig {
            ring_capacity: 1024,
            max_response_size: 4096,
            ..AmsConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

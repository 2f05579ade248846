use crate::packet;
use anyhow::bail;
use std::time::Duration;

/// Configuration shared by the controller and switcher endpoints.
pub struct LinkConfig {
    /// Cadence of the keep-alive tick that drives retransmission and acknowledgment
    ///  flushing. The protocol family expects short, sub-second intervals: too slow and
    ///  the peer times the connection out, too fast and packets are retransmitted before
    ///  their acknowledgment had a chance to arrive.
    pub keep_alive_interval: Duration,

    /// Maximum datagram size this endpoint sends or accepts. The wire format caps this
    ///  at 2047 bytes (11-bit length field); the default stays below a full Ethernet
    ///  frame so packets are never fragmented at the IP level.
    pub max_packet_len: usize,
}

impl LinkConfig {
    pub fn default_link() -> LinkConfig {
        LinkConfig {
            keep_alive_interval: Duration::from_millis(500),
            max_packet_len: 1420,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keep_alive_interval.is_zero() || self.keep_alive_interval > Duration::from_secs(1) {
            bail!("keep-alive interval must be non-zero and sub-second, was {:?}", self.keep_alive_interval);
        }
        if self.max_packet_len <= packet::HEADER_LEN {
            bail!("maximum packet length {} leaves no room for a payload", self.max_packet_len);
        }
        if self.max_packet_len > packet::MAX_PACKET_LEN {
            bail!("maximum packet length {} exceeds the wire format's length field", self.max_packet_len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default_link(LinkConfig::default_link(), true)]
    #[case::smallest_useful(LinkConfig { keep_alive_interval: Duration::from_millis(1), max_packet_len: 13 }, true)]
    #[case::zero_interval(LinkConfig { keep_alive_interval: Duration::ZERO, max_packet_len: 1420 }, false)]
    #[case::interval_too_slow(LinkConfig { keep_alive_interval: Duration::from_secs(2), max_packet_len: 1420 }, false)]
    #[case::header_only(LinkConfig { keep_alive_interval: Duration::from_millis(500), max_packet_len: 12 }, false)]
    #[case::beyond_length_field(LinkConfig { keep_alive_interval: Duration::from_millis(500), max_packet_len: 2048 }, false)]
    fn test_validate(#[case] config: LinkConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }
}

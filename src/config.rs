use std::time::Duration;

use anyhow::bail;

use crate::routing::header::RoutingHeader;
use crate::socket::header::TransportHeader;

pub struct StackConfig {
    /// The maximum size of a packet the network accepts, including routing and transport headers.
    ///  Payload passed to a socket is fragmented so that every packet stays within this limit.
    pub max_network_packet_size: usize,

    /// The maximum number of nodes in a path, including originator and destination. This is
    ///  also the initial hop budget (TTL) of every routing packet.
    pub max_route_length: usize,

    /// How long a route discovery waits for a reply before giving up
    pub discovery_timeout: Duration,

    /// Cached routes are considered stale this long after their discovery and are rediscovered
    ///  on next use. `None` keeps routes until they are replaced by a newer discovery.
    pub route_ttl: Option<Duration>,

    /// Drop discovery requests whose path already contains this node rather than flooding them
    ///  until their TTL runs out
    pub suppress_discovery_loops: bool,

    /// Timeout for the first transmission of a control or data packet; it doubles on each
    ///  retransmission
    pub initial_timeout: Duration,
    pub max_num_timeouts: u32,

    /// Time a socket lingers after its peer closed the connection before its port is reclaimed
    pub close_grace_period: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            max_network_packet_size: 4096,
            max_route_length: 20,
            discovery_timeout: Duration::from_secs(12),
            route_ttl: Some(Duration::from_secs(3)),
            suppress_discovery_loops: true,
            initial_timeout: Duration::from_millis(100),
            max_num_timeouts: 7,
            close_grace_period: Duration::from_secs(15),
        }
    }
}

impl StackConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_route_length < 2 {
            bail!("a route must have room for at least two nodes");
        }
        if self.max_route_length > u8::MAX as usize {
            bail!("route length {} is too long", self.max_route_length);
        }
        if self.max_network_packet_size < self.headers_len() + 1 {
            bail!("network packet size {} leaves no room for payload with routes of up to {} nodes", self.max_network_packet_size, self.max_route_length);
        }
        if self.initial_timeout.is_zero() {
            bail!("initial timeout must be positive");
        }
        if self.max_num_timeouts == 0 || self.max_num_timeouts > 16 {
            bail!("number of timeouts must be between 1 and 16");
        }
        Ok(())
    }

    fn headers_len(&self) -> usize {
        RoutingHeader::max_serialized_len(self.max_route_length) + TransportHeader::SERIALIZED_LEN
    }

    /// The largest socket payload that fits into a single network packet regardless of the
    ///  path it is routed over
    pub fn max_fragment_size(&self) -> usize {
        self.max_network_packet_size - self.headers_len()
    }

    /// Upper bound for a single retransmit-and-wait round: the sum of all backoff timeouts
    pub fn max_handshake_duration(&self) -> Duration {
        self.initial_timeout * ((1u32 << self.max_num_timeouts) - 1)
    }
}

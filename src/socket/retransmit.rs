use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use tokio::time;
use tracing::{debug, trace};

use crate::socket::header::{MessageType, TransportHeader};
use crate::socket::SocketShared;

/// The timeouts for successive transmissions of a packet: starting with an initial timeout, each
///  is double the previous one, for a fixed number of attempts.
pub struct RetransmitBackoff {
    next_timeout: Duration,
    remaining_attempts: u32,
}

impl RetransmitBackoff {
    pub fn new(initial_timeout: Duration, max_attempts: u32) -> RetransmitBackoff {
        RetransmitBackoff {
            next_timeout: initial_timeout,
            remaining_attempts: max_attempts,
        }
    }

    #[must_use]
    pub fn next_timeout(&mut self) -> Option<Duration> {
        if self.remaining_attempts == 0 {
            return None;
        }
        self.remaining_attempts -= 1;

        let result = self.next_timeout;
        self.next_timeout *= 2;
        Some(result)
    }
}

impl SocketShared {
    /// Sends a packet and waits for the peer's acknowledgement, retransmitting with exponential
    ///  backoff. The acknowledgement is recognized by the inbound packet handling, which sets
    ///  `ack_received` once the peer acknowledges this socket's current sequence number.
    ///
    /// Each attempt's timeout covers both routing (which may involve route discovery) and
    ///  waiting, so the total time spent here is bounded by the sum of all timeouts. Fails early
    ///  if the peer closes the connection, or if the socket is closed locally while this is not
    ///  the FIN. When all attempts time out, the cached route to the peer is dropped.
    pub(super) async fn send_and_wait(&self, header: &TransportHeader, payload: &[u8]) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(TransportHeader::SERIALIZED_LEN);
        header.ser(&mut buf);

        {
            let mut data = self.data.lock().await;
            data.ack_received = false;
            data.awaiting_ack = true;
        }

        let mut backoff = RetransmitBackoff::new(self.ctx.config.initial_timeout, self.ctx.config.max_num_timeouts);
        let result = loop {
            let Some(timeout) = backoff.next_timeout() else {
                self.ctx.router.invalidate(header.destination.addr).await;
                break Err(anyhow!("no acknowledgement for {:?} after {} attempts", header, self.ctx.config.max_num_timeouts));
            };

            let attempt = async {
                trace!("sending {:?}", header);
                if let Err(e) = self.ctx.router.send(header.destination.addr, &buf, payload).await {
                    debug!("routing {:?} failed: {}", header, e);
                }
                self.wait_for_ack(header).await
            };

            match time::timeout(timeout, attempt).await {
                Ok(r) => break r,
                Err(_) => trace!("no acknowledgement for {:?} after {:?}", header, timeout),
            }
        };

        self.data.lock().await
            .awaiting_ack = false;
        result
    }

    async fn wait_for_ack(&self, header: &TransportHeader) -> anyhow::Result<()> {
        loop {
            let notified = self.ack_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let data = self.data.lock().await;
                if data.ack_received {
                    return Ok(());
                }
                if data.state.is_closing() {
                    bail!("connection was closed while waiting for an acknowledgement");
                }
                if data.closed_locally && header.message_type != MessageType::Fin {
                    bail!("socket was closed locally while waiting for an acknowledgement");
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::none(100, 0, vec![])]
    #[case::single(100, 1, vec![100])]
    #[case::default(100, 7, vec![100, 200, 400, 800, 1600, 3200, 6400])]
    #[case::other_initial(30, 3, vec![30, 60, 120])]
    fn test_backoff(#[case] initial_ms: u64, #[case] max_attempts: u32, #[case] expected_ms: Vec<u64>) {
        let mut backoff = RetransmitBackoff::new(Duration::from_millis(initial_ms), max_attempts);
        let mut timeouts = Vec::new();
        while let Some(t) = backoff.next_timeout() {
            timeouts.push(t.as_millis() as u64);
        }
        assert_eq!(timeouts, expected_ms);
        assert_eq!(backoff.next_timeout(), None);
    }
}

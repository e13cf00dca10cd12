use anyhow::bail;
use std::time::Duration;

/// Configuration of the reliable unicast layer.
pub struct UnicastConfig {
    /// Intervals between retransmissions of an unacknowledged message. The
    ///  n-th retransmission of a message fires `retransmit_timeouts[min(n, len-1)]`
    ///  after the previous send, i.e. the last value repeats forever.
    ///
    /// The default ladder grows geometrically and then plateaus, which bounds
    ///  the latency of recovering from a lost ack while protecting the
    ///  network under sustained loss.
    pub retransmit_timeouts: Vec<Duration>,

    /// After this long without the peer becoming a group member, an idle
    ///  connection is torn down by the age-out cache. `None` disables
    ///  age-out entirely; a fresh send to the same peer after teardown starts
    ///  a new connection with a new conn_id.
    pub max_retransmit_time: Option<Duration>,

    /// Deprecated. Looping self-addressed messages back locally interacts
    ///  badly with the retransmitter and header stamping; `true` is not
    ///  honoured.
    pub loopback: bool,
}

impl Default for UnicastConfig {
    fn default() -> UnicastConfig {
        UnicastConfig {
            retransmit_timeouts: [400, 800, 1600, 3200]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            max_retransmit_time: Some(Duration::from_secs(60)),
            loopback: false,
        }
    }
}

impl UnicastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_timeouts.is_empty() {
            bail!("at least one retransmit timeout is required");
        }
        if self.retransmit_timeouts.iter().any(|t| t.is_zero()) {
            bail!("retransmit timeouts must be positive");
        }
        if let Some(max_retransmit_time) = self.max_retransmit_time {
            if max_retransmit_time.is_zero() {
                bail!("max_retransmit_time must be positive (or None to disable age-out)");
            }
        }
        Ok(())
    }
}

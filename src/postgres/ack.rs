use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::connection::ReplicationTransport;
use super::lsn::Lsn;
use super::messages::StatusUpdate;
use crate::Result;

/// Decides when to report the confirmed position upstream and sends the
/// standby status update.
#[derive(Debug)]
pub struct AckScheduler {
    interval: Duration,
    last_ack: Instant,
    last_acked_lsn: Option<Lsn>,
    sent: u64,
}

impl AckScheduler {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ack: Instant::now(),
            last_acked_lsn: None,
            sent: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ack) >= self.interval
    }

    /// Time left before the next update is due; zero when already due.
    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last_ack))
    }

    /// Sends `lsn` as write, flush and apply position.
    ///
    /// The timer is reset whether or not the send succeeds; a send error is
    /// returned to the caller as fatal.
    pub async fn send<T>(&mut self, transport: &mut T, lsn: Lsn, reply_requested: bool) -> Result<()>
    where
        T: ReplicationTransport + ?Sized,
    {
        let mut update = StatusUpdate::confirmed(lsn);
        update.reply_requested = reply_requested;

        let result = transport.send_status_update(&update).await;
        self.last_ack = Instant::now();

        if result.is_ok() {
            debug!(lsn = %lsn, "Sent standby status update");
            self.last_acked_lsn = Some(lsn);
            self.sent += 1;
        }
        result
    }

    pub fn last_acked_lsn(&self) -> Option<Lsn> {
        self.last_acked_lsn
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Default for AckScheduler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

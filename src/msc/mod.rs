//! MSC transport: block framing, device-readiness polling, header/token
//! validation, and the suspend handshake.

pub(crate) mod frame;

use std::time::Duration;

use tracing::error;

use crate::block::{Block, BlockDevice};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TseError};

/// Backoff between readiness-poll reads. Chosen to balance device turnaround
/// (observed in the low hundreds of ms for signing operations) against CPU
/// use; the loop never blocks on the descriptor, it only sleeps and retries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default deadline for a single readiness-poll wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames commands into 8 KiB outer blocks, polls for readiness, validates
/// returned headers, and manages the suspend handshake.
///
/// Generic over the block adapter and clock collaborators so it can be
/// driven by in-memory doubles in tests.
pub struct MscTransport<B: BlockDevice, C: Clock = SystemClock> {
    device: B,
    clock: C,
    poll_interval: Duration,
}

impl<B: BlockDevice> MscTransport<B, SystemClock> {
    /// Opens a session: wakes the device with `set_suspend(false)`.
    pub async fn start(device: B, timeout: Duration) -> Result<Self> {
        Self::start_with_clock(device, SystemClock, timeout).await
    }
}

impl<B: BlockDevice, C: Clock> MscTransport<B, C> {
    /// Opens a session against an explicit clock collaborator, for testing.
    pub async fn start_with_clock(device: B, clock: C, timeout: Duration) -> Result<Self> {
        let mut transport = Self {
            device,
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        transport.set_suspend(false, timeout).await?;
        Ok(transport)
    }

    /// The session's injected clock collaborator.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Suspends the device and releases the block adapter.
    ///
    /// The suspend call is attempted even if the session is already in a
    /// failed state; its errors (and the adapter's close errors) are logged
    /// rather than propagated, so a failing close never masks whatever
    /// failure caused the session to be torn down.
    pub async fn close(&mut self, timeout: Duration) {
        if let Err(error) = self.set_suspend(true, timeout).await {
            error!(%error, "failed to suspend device during close");
        }
        if let Err(error) = self.device.close().await {
            error!(%error, "failed to release block adapter during close");
        }
    }

    /// Writes the suspend-control command and waits for its one-byte reply.
    pub async fn set_suspend(&mut self, suspend: bool, timeout: Duration) -> Result<()> {
        let block = frame::build_suspend_packet(suspend);
        self.device.write_block(block).await?;
        let response = self.read_until_ready(timeout).await?;
        frame::parse_suspend_response(&response)?;
        Ok(())
    }

    /// Builds and writes a command-payload outer block.
    pub async fn write(&mut self, command_data: &[u8]) -> Result<()> {
        let block = frame::build_command_packet(command_data)?;
        self.device.write_block(block).await
    }

    /// Polls for readiness, validates the reply header and device token, and
    /// returns the inner payload.
    pub async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let block = self.read_until_ready(timeout).await?;
        frame::parse_response_packet(&block)
    }

    async fn read_until_ready(&mut self, timeout: Duration) -> Result<Block> {
        let deadline = self.clock.now() + timeout;
        while self.clock.now() < deadline {
            let block = self.device.read_block().await?;
            if !frame::is_not_ready(&block) {
                return Ok(block);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        error!("timed out waiting for device readiness");
        Err(TseError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBlockDevice, FakeClock};

    #[tokio::test(start_paused = true)]
    async fn start_writes_disable_suspend_first() {
        let device = FakeBlockDevice::new().with_suspend_reply();
        let written = device.written.clone();
        let transport = MscTransport::start_with_clock(device, FakeClock::new(), DEFAULT_TIMEOUT).await;
        assert!(transport.is_ok());
        let first_write = written.lock().unwrap()[0].clone();
        assert_eq!(&first_write[32..38], &[0x00, 0x02, 0x53, 0x44, 0x00, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_polls_until_ready() {
        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_not_ready_reads(3)
            .with_command_response(&[0x80, 0x08]);
        let mut transport = MscTransport::start_with_clock(device, FakeClock::new(), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        transport.write(&[0xC5]).await.unwrap();
        let payload = transport.read(DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(payload, vec![0x80, 0x08]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out_when_device_never_becomes_ready() {
        let device = FakeBlockDevice::new().with_suspend_reply().always_not_ready();
        let mut transport = MscTransport::start_with_clock(device, FakeClock::new(), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        transport.write(&[0xC5]).await.unwrap();
        let result = transport.read(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(TseError::Timeout)));
    }
}

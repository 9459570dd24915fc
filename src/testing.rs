//! In-memory test doubles for the block adapter and clock collaborators.
//!
//! These let the MSC transport and command transport be exercised against
//! the scenarios in the core's testable-properties section without any real
//! hardware or privileged direct-I/O access.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::block::{Block, BlockDevice, BLOCK_SIZE};
use crate::clock::Clock;
use crate::error::{Result, TseError};
use crate::msc::frame::MAGIC_HEADER;

/// A device token distinct from [`HOST_TOKEN`], used to build replies.
const DEVICE_TOKEN: [u8; 4] = [0x13, 0x37, 0xC0, 0xDE];

fn zero_block() -> Block {
    [0u8; BLOCK_SIZE]
}

fn not_ready_block() -> Block {
    let mut block = zero_block();
    block[32..34].copy_from_slice(&[0xFF, 0xFF]);
    block
}

fn suspend_response_block() -> Block {
    let mut block = zero_block();
    block[..28].copy_from_slice(&MAGIC_HEADER);
    block[28..32].copy_from_slice(&DEVICE_TOKEN);
    block[32] = 0x00;
    block
}

/// Builds a command-response outer block carrying `payload` as the inner
/// response bytes, verbatim.
fn response_block(payload: &[u8]) -> Block {
    assert!(
        payload.len() + 34 <= BLOCK_SIZE,
        "test payload too large for one block"
    );
    let mut block = zero_block();
    block[..28].copy_from_slice(&MAGIC_HEADER);
    block[28..32].copy_from_slice(&DEVICE_TOKEN);
    let len = payload.len() as u16;
    block[32..34].copy_from_slice(&len.to_be_bytes());
    block[34..34 + payload.len()].copy_from_slice(payload);
    block
}

/// A scripted, in-memory stand-in for the real device file.
pub struct FakeBlockDevice {
    pending_reads: VecDeque<Block>,
    forever_not_ready: bool,
    pub written: Arc<Mutex<Vec<Block>>>,
    closed: bool,
}

impl FakeBlockDevice {
    pub fn new() -> Self {
        Self {
            pending_reads: VecDeque::new(),
            forever_not_ready: false,
            written: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Queues a valid suspend-control response.
    pub fn with_suspend_reply(mut self) -> Self {
        self.pending_reads.push_back(suspend_response_block());
        self
    }

    /// Queues `n` not-ready reads before whatever is queued after it.
    pub fn with_not_ready_reads(mut self, n: usize) -> Self {
        for _ in 0..n {
            self.pending_reads.push_back(not_ready_block());
        }
        self
    }

    /// Queues a command response whose inner payload is exactly `payload`.
    pub fn with_command_response(mut self, payload: &[u8]) -> Self {
        self.pending_reads.push_back(response_block(payload));
        self
    }

    /// Every read that isn't otherwise queued returns the not-ready marker.
    pub fn always_not_ready(mut self) -> Self {
        self.forever_not_ready = true;
        self
    }
}

impl BlockDevice for FakeBlockDevice {
    async fn write_block(&mut self, block: Block) -> Result<()> {
        self.written.lock().unwrap().push(block);
        Ok(())
    }

    async fn read_block(&mut self) -> Result<Block> {
        if let Some(block) = self.pending_reads.pop_front() {
            return Ok(block);
        }
        if self.forever_not_ready {
            return Ok(not_ready_block());
        }
        Err(TseError::Framing(
            "FakeBlockDevice ran out of scripted reads".into(),
        ))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A deterministic clock: every call to `now()` returns the current value
/// and advances it by `tick`, so a readiness-poll deadline check progresses
/// without depending on real wall-clock time.
#[derive(Clone)]
pub struct FakeClock {
    tick: Duration,
    current: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            tick: Duration::from_millis(50),
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let mut guard = self.current.lock().unwrap();
        let value = *guard;
        *guard += self.tick;
        value
    }

    fn unix_seconds(&self) -> u64 {
        0
    }
}

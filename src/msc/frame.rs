//! Outer-frame (MSC block) layout: magic header, host/device token, and the
//! payload variants that ride inside a block.

use crate::block::{Block, BLOCK_SIZE};
use crate::error::{Result, TseError};

/// 28-byte magic sequence that opens every block, host- or device-originated.
pub const MAGIC_HEADER: [u8; 28] = [
    0x41, 0x64, 0x56, 0x61, 0x6e, 0x63, 0x45, 0x44, 0x20, 0x53, 0x65, 0x43, 0x75, 0x52, 0x65, 0x20,
    0x53, 0x44, 0x2f, 0x4d, 0x4d, 0x43, 0x20, 0x43, 0x41, 0x72, 0x64, 0x01,
];

/// The constant 4-byte token every host-originated block carries.
pub const HOST_TOKEN: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

/// Offset of the 2-byte readiness marker within a block.
const READY_MARKER_OFFSET: usize = 32;
const NOT_READY_MARKER: [u8; 2] = [0xFF, 0xFF];

/// `true` if `block` is a device reply that has not been produced yet.
pub fn is_not_ready(block: &Block) -> bool {
    block[READY_MARKER_OFFSET..READY_MARKER_OFFSET + 2] == NOT_READY_MARKER
}

fn zero_block() -> Block {
    [0u8; BLOCK_SIZE]
}

fn write_header_and_token(block: &mut Block) -> usize {
    block[..MAGIC_HEADER.len()].copy_from_slice(&MAGIC_HEADER);
    let mut offset = MAGIC_HEADER.len();
    block[offset..offset + HOST_TOKEN.len()].copy_from_slice(&HOST_TOKEN);
    offset += HOST_TOKEN.len();
    offset
}

/// Builds the `00 02 53 {44|45} 00 00` suspend-control outer block.
pub fn build_suspend_packet(suspend: bool) -> Block {
    let mut block = zero_block();
    let mut offset = write_header_and_token(&mut block);
    let mode_byte = if suspend { 0x45 } else { 0x44 };
    let payload = [0x00, 0x02, 0x53, mode_byte, 0x00, 0x00];
    block[offset..offset + payload.len()].copy_from_slice(&payload);
    offset += payload.len();
    debug_assert!(offset <= BLOCK_SIZE);
    block
}

/// Builds a command-payload outer block: host token, 2-byte length, reserved
/// `00 00`, then `command_data`, zero-padded to [`BLOCK_SIZE`].
pub fn build_command_packet(command_data: &[u8]) -> Result<Block> {
    let len: u16 = u16::try_from(command_data.len())
        .map_err(|_| TseError::Framing("command payload too large for a 16-bit length".into()))?;
    let mut block = zero_block();
    let mut offset = write_header_and_token(&mut block);
    let header_end = offset + 2 + 2 + command_data.len();
    if header_end > BLOCK_SIZE {
        return Err(TseError::Framing(
            "command payload does not fit in one block".into(),
        ));
    }
    block[offset..offset + 2].copy_from_slice(&len.to_be_bytes());
    offset += 2;
    block[offset..offset + 2].copy_from_slice(&[0x00, 0x00]);
    offset += 2;
    block[offset..offset + command_data.len()].copy_from_slice(command_data);
    Ok(block)
}

fn check_header(block: &Block) -> Result<()> {
    if block[..MAGIC_HEADER.len()] != MAGIC_HEADER {
        return Err(TseError::Framing(
            "block does not begin with the expected magic header".into(),
        ));
    }
    Ok(())
}

/// Validates the suspend-control response: magic header, a 4-byte device
/// token, and the single `00` confirmation byte.
pub fn parse_suspend_response(block: &Block) -> Result<()> {
    check_header(block)?;
    let offset = MAGIC_HEADER.len() + 4;
    if block[offset] != 0x00 {
        return Err(TseError::Framing(
            "malformed suspend-control response".into(),
        ));
    }
    Ok(())
}

/// Validates and extracts a command-response outer block: magic header,
/// device token (asserted not equal to [`HOST_TOKEN`]), then the 2-byte
/// length-prefixed payload.
pub fn parse_response_packet(block: &Block) -> Result<Vec<u8>> {
    check_header(block)?;
    let mut offset = MAGIC_HEADER.len();
    let token = &block[offset..offset + 4];
    if token == HOST_TOKEN {
        return Err(TseError::Framing(
            "device reply carried the host token, indicating a device-level framing failure".into(),
        ));
    }
    offset += 4;

    let len = u16::from_be_bytes([block[offset], block[offset + 1]]) as usize;
    offset += 2;
    if offset + len > BLOCK_SIZE {
        return Err(TseError::Framing(
            "response length prefix exceeds the block size".into(),
        ));
    }
    Ok(block[offset..offset + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_packet_is_block_sized_and_framed() {
        let block = build_suspend_packet(false);
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(&block[..28], &MAGIC_HEADER);
        assert_eq!(&block[28..32], &HOST_TOKEN);
        assert_eq!(&block[32..38], &[0x00, 0x02, 0x53, 0x44, 0x00, 0x00]);
    }

    #[test]
    fn enable_suspend_packet_uses_se_marker() {
        let block = build_suspend_packet(true);
        assert_eq!(&block[32..38], &[0x00, 0x02, 0x53, 0x45, 0x00, 0x00]);
    }

    #[test]
    fn command_packet_carries_length_prefix_and_reserved_bytes() {
        let block = build_command_packet(&[1, 2, 3]).unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(&block[32..34], &[0x00, 0x03]);
        assert_eq!(&block[34..36], &[0x00, 0x00]);
        assert_eq!(&block[36..39], &[1, 2, 3]);
        assert!(block[39..].iter().all(|&b| b == 0));
    }

    #[test]
    fn response_packet_rejects_host_token() {
        let mut block = zero_block();
        write_header_and_token(&mut block);
        assert!(parse_response_packet(&block).is_err());
    }

    #[test]
    fn response_packet_extracts_payload() {
        let mut block = zero_block();
        block[..28].copy_from_slice(&MAGIC_HEADER);
        block[28..32].copy_from_slice(&[1, 2, 3, 4]);
        block[32..34].copy_from_slice(&2u16.to_be_bytes());
        block[34..36].copy_from_slice(&[0x90, 0x00]);
        let payload = parse_response_packet(&block).unwrap();
        assert_eq!(payload, vec![0x90, 0x00]);
    }

    #[test]
    fn not_ready_marker_is_detected() {
        let mut block = zero_block();
        block[32..34].copy_from_slice(&[0xFF, 0xFF]);
        assert!(is_not_ready(&block));
        block[32..34].copy_from_slice(&[0x00, 0x02]);
        assert!(!is_not_ready(&block));
    }
}

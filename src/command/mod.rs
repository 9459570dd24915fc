//! Command transport: encodes typed commands, decodes typed responses,
//! demultiplexes device errors, and reassembles fragmented reads.

mod codes;
pub(crate) mod types;

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

pub use codes::CommandId;
pub use types::TypedParam;

use crate::block::BlockDevice;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TseError};
use crate::msc::MscTransport;

/// Constant that opens every inner command frame.
const INNER_MAGIC: [u8; 2] = [0x5C, 0x54];

/// Device-error inner responses fall in `[ERROR_RANGE_START, EXPORT_MARKER)`.
const ERROR_RANGE_START: u16 = 0x8000;
/// Marks an export-data success response.
const EXPORT_MARKER: u16 = 0x9000;

/// Requests the next fragment of a partial response.
const CONTINUE_BYTE: u8 = 0xC5;
/// Aborts a partial fragmented fetch after an error.
const ABORT_BYTE: u8 = 0xC4;

/// The decoded shape of a successful response: either a typed-parameter
/// list, or (for `ExportData` and friends) a raw byte blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Params(Vec<TypedParam>),
    Raw(Vec<u8>),
}

fn encode_command(cmd: CommandId, params: &[TypedParam]) -> Result<Vec<u8>> {
    let param_bytes = types::encode_params(params)?;
    let len = u16::try_from(param_bytes.len())
        .map_err(|_| TseError::Framing("encoded parameter block too large".into()))?;
    let mut buf = BytesMut::with_capacity(2 + 2 + 2 + param_bytes.len());
    buf.put_slice(&INNER_MAGIC);
    buf.put_u16(cmd.code());
    buf.put_u16(len);
    buf.put_slice(&param_bytes);
    Ok(buf.to_vec())
}

/// Encodes typed commands, decodes typed responses, demultiplexes device
/// errors, and reassembles fragmented reads over an [`MscTransport`].
pub struct CommandTransport<B: BlockDevice, C: Clock = SystemClock> {
    msc: MscTransport<B, C>,
    timeout: Duration,
}

impl<B: BlockDevice> CommandTransport<B, SystemClock> {
    pub async fn start(device: B, timeout: Duration) -> Result<Self> {
        let msc = MscTransport::start(device, timeout).await?;
        Ok(Self { msc, timeout })
    }
}

impl<B: BlockDevice, C: Clock> CommandTransport<B, C> {
    pub async fn start_with_clock(device: B, clock: C, timeout: Duration) -> Result<Self> {
        let msc = MscTransport::start_with_clock(device, clock, timeout).await?;
        Ok(Self { msc, timeout })
    }

    /// The session's injected clock collaborator.
    pub fn clock(&self) -> &C {
        self.msc.clock()
    }

    /// Suspends the device and releases the transport. Idempotent; never
    /// fails the caller even if the teardown itself hits an error.
    pub async fn close(&mut self) {
        self.msc.close(self.timeout).await;
    }

    /// Sends a command and returns its decoded response.
    pub async fn send(&mut self, cmd: CommandId, params: &[TypedParam]) -> Result<CommandResponse> {
        let command_bytes = encode_command(cmd, params)?;
        self.msc.write(&command_bytes).await?;
        let first_fragment = self.msc.read(self.timeout).await?;
        self.decode_response(first_fragment).await
    }

    /// Sends a command whose response must be a typed-parameter list.
    pub async fn send_params(
        &mut self,
        cmd: CommandId,
        params: &[TypedParam],
    ) -> Result<Vec<TypedParam>> {
        match self.send(cmd, params).await? {
            CommandResponse::Params(params) => Ok(params),
            CommandResponse::Raw(_) => Err(TseError::Framing(
                "expected a typed-parameter response, got raw export data".into(),
            )),
        }
    }

    /// Sends a command whose response must be the raw export-data variant.
    pub async fn export(&mut self, cmd: CommandId, params: &[TypedParam]) -> Result<Vec<u8>> {
        match self.send(cmd, params).await? {
            CommandResponse::Raw(data) => Ok(data),
            CommandResponse::Params(_) => Err(TseError::Framing(
                "expected raw export data, got a typed-parameter response".into(),
            )),
        }
    }

    async fn decode_response(&mut self, first_fragment: Vec<u8>) -> Result<CommandResponse> {
        if first_fragment.len() < 2 {
            return Err(TseError::Framing("inner response is too short".into()));
        }
        let head = u16::from_be_bytes([first_fragment[0], first_fragment[1]]);

        if (ERROR_RANGE_START..EXPORT_MARKER).contains(&head) {
            return Err(TseError::from_device_code(head));
        }

        if head == EXPORT_MARKER {
            if first_fragment.len() < 10 {
                return Err(TseError::Framing(
                    "export response is missing its total-length field".into(),
                ));
            }
            let total_len =
                u64::from_be_bytes(first_fragment[2..10].try_into().unwrap()) as usize;
            let data = first_fragment[10..].to_vec();
            let data = self.accumulate(total_len, data).await?;
            return Ok(CommandResponse::Raw(data));
        }

        let total_len = head as usize;
        let data = first_fragment[2..].to_vec();
        let data = self.accumulate(total_len, data).await?;
        let params = types::decode_params(Bytes::from(data))?;
        Ok(CommandResponse::Params(params))
    }

    /// Requests continuation fragments (`C5`) until `data` holds exactly
    /// `total_len` bytes. On any error between continuation requests, aborts
    /// the partial fetch with `C4` before surfacing the error.
    async fn accumulate(&mut self, total_len: usize, mut data: Vec<u8>) -> Result<Vec<u8>> {
        while data.len() < total_len {
            match self.read_continuation().await {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(error) => {
                    let _ = self.msc.write(&[ABORT_BYTE]).await;
                    return Err(error);
                }
            }
        }
        if data.len() != total_len {
            return Err(TseError::Framing(
                "fragment reassembly produced more bytes than declared".into(),
            ));
        }
        Ok(data)
    }

    async fn read_continuation(&mut self) -> Result<Vec<u8>> {
        self.msc.write(&[CONTINUE_BYTE]).await?;
        self.msc.read(self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBlockDevice;

    #[tokio::test(start_paused = true)]
    async fn start_decodes_typed_parameter_list() {
        let mut inner_params = BytesMut::new();
        types::encode_params(&[
            TypedParam::String("1.0".to_string()),
            TypedParam::ByteArray(vec![1, 2, 3, 4]),
        ])
        .unwrap()
        .iter()
        .for_each(|b| inner_params.put_u8(*b));

        let mut response = BytesMut::new();
        response.put_u16(inner_params.len() as u16);
        response.put_slice(&inner_params);

        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_command_response(&response);
        let mut transport = CommandTransport::start(device, Duration::from_secs(1))
            .await
            .unwrap();

        let params = transport.send_params(CommandId::Start, &[]).await.unwrap();
        assert_eq!(
            params,
            vec![
                TypedParam::String("1.0".to_string()),
                TypedParam::ByteArray(vec![1, 2, 3, 4]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_user_wire_shape() {
        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_command_response(&[0x00, 0x00]);
        let written = device.written.clone();
        let mut transport = CommandTransport::start(device, Duration::from_secs(1))
            .await
            .unwrap();

        let _ = transport
            .send(
                CommandId::AuthenticateUser,
                &[
                    TypedParam::String("Admin".to_string()),
                    TypedParam::ByteArray(b"1234567890".to_vec()),
                ],
            )
            .await;

        let command_write = written.lock().unwrap()[1].clone();
        // Skip header(28) + host token(4) + length(2) + reserved(2).
        let inner = &command_write[36..];
        assert_eq!(&inner[..4], &[0x5C, 0x54, 0x00, 0x03]);
        let param_len = u16::from_be_bytes([inner[4], inner[5]]) as usize;
        let param_block = &inner[6..6 + param_len];
        assert_eq!(param_block[0], 0x04);
        assert_eq!(&param_block[1..3], &5u16.to_be_bytes());
        assert_eq!(&param_block[3..8], b"Admin");
        let byte_array = &param_block[8..];
        assert_eq!(byte_array[0], 0x02);
        assert_eq!(&byte_array[1..3], &10u16.to_be_bytes());
        assert_eq!(&byte_array[3..13], b"1234567890");
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_never_attempts_a_typed_parameter_parse() {
        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_command_response(&[0x80, 0x08]);
        let mut transport = CommandTransport::start(device, Duration::from_secs(1))
            .await
            .unwrap();

        let result = transport.send(CommandId::AuthenticateUser, &[]).await;
        assert!(matches!(
            result,
            Err(TseError::DeviceError { code: 0x8008, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_error_code_is_surfaced_distinctly() {
        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_command_response(&[0x80, 0xF0]);
        let mut transport = CommandTransport::start(device, Duration::from_secs(1))
            .await
            .unwrap();

        let result = transport.send(CommandId::GetStatus, &[]).await;
        assert!(matches!(
            result,
            Err(TseError::UnknownDeviceError { code: 0x80F0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fragmented_export_reassembles_in_order() {
        let mut first = vec![0x90, 0x00];
        first.extend_from_slice(&16u64.to_be_bytes());
        first.extend_from_slice(&[1, 2, 3, 4]);

        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_command_response(&first)
            .with_command_response(&[5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let mut transport = CommandTransport::start(device, Duration::from_secs(1))
            .await
            .unwrap();

        let data = transport.export(CommandId::ExportData, &[]).await.unwrap();
        assert_eq!(data, (1u8..=16u8).collect::<Vec<u8>>());
    }

    #[tokio::test(start_paused = true)]
    async fn export_response_is_never_mistaken_for_an_error() {
        let mut first = vec![0x90, 0x00];
        first.extend_from_slice(&0u64.to_be_bytes());
        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_command_response(&first);
        let mut transport = CommandTransport::start(device, Duration::from_secs(1))
            .await
            .unwrap();

        let data = transport.export(CommandId::ExportData, &[]).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_partial_fetch_on_mid_stream_error() {
        let mut first = vec![0x90, 0x00];
        first.extend_from_slice(&16u64.to_be_bytes());
        first.extend_from_slice(&[1, 2, 3, 4]);

        // The continuation reply is malformed (host-token reply), which the
        // MSC layer rejects as a framing error.
        let device = FakeBlockDevice::new()
            .with_suspend_reply()
            .with_command_response(&first);
        let written = device.written.clone();
        let mut transport = CommandTransport::start(device, Duration::from_secs(1))
            .await
            .unwrap();

        let result = transport.export(CommandId::ExportData, &[]).await;
        assert!(result.is_err());

        // Last thing written should be the single-byte abort command.
        let last_write = written.lock().unwrap().last().unwrap().clone();
        assert_eq!(&last_write[36..37], &[ABORT_BYTE]);
        assert!(last_write[37..].iter().all(|&b| b == 0));
    }
}

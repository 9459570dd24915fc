//! Thin per-operation façade over [`CommandTransport`]. Holds no protocol
//! knowledge of its own; every method is a translation between idiomatic
//! Rust arguments/return values and a `(command_id, [TypedParam])` call.

use crate::block::BlockDevice;
use crate::clock::{Clock, SystemClock};
use crate::command::{CommandId, CommandTransport, TypedParam};
use crate::error::{Result, TseError};

/// The two user identities the device recognizes. The wire representation
/// is the literal ASCII string, not the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserId {
    Admin,
    TimeAdmin,
}

impl UserId {
    fn as_str(self) -> &'static str {
        match self {
            UserId::Admin => "Admin",
            UserId::TimeAdmin => "TimeAdmin",
        }
    }
}

/// Outcome of an authentication or unblock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationResult {
    Success,
    Failed,
    PinBlocked,
    UnknownUserId,
    UnspecifiedError,
}

impl AuthenticationResult {
    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => AuthenticationResult::Success,
            1 => AuthenticationResult::Failed,
            2 => AuthenticationResult::PinBlocked,
            3 => AuthenticationResult::UnknownUserId,
            4 => AuthenticationResult::UnspecifiedError,
            other => {
                return Err(TseError::Framing(format!(
                    "device returned an unrecognized authentication result code {other}"
                )));
            }
        })
    }
}

/// Device handshake result: free-form version string and serial bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInfo {
    pub version: String,
    pub serial: Vec<u8>,
}

/// The four PIN/PUK-blocked states reported by `GetPinStates`, in device order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinStatus {
    pub admin_pin_blocked: bool,
    pub admin_puk_blocked: bool,
    pub time_admin_pin_blocked: bool,
    pub time_admin_puk_blocked: bool,
}

/// Outcome of `authenticate_user`/`unblock_user`: the result plus, for
/// authentication, the device's remaining-retries counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationOutcome {
    pub result: AuthenticationResult,
    pub remaining_retries: u8,
}

fn expect_byte(param: &TypedParam, what: &str) -> Result<u8> {
    match param {
        TypedParam::Byte(value) => Ok(*value),
        _ => Err(TseError::Framing(format!(
            "expected a BYTE parameter for {what}"
        ))),
    }
}

fn expect_byte_array(param: &TypedParam, what: &str) -> Result<Vec<u8>> {
    match param {
        TypedParam::ByteArray(bytes) => Ok(bytes.clone()),
        _ => Err(TseError::Framing(format!(
            "expected a BYTE_ARRAY parameter for {what}"
        ))),
    }
}

fn expect_string(param: &TypedParam, what: &str) -> Result<String> {
    match param {
        TypedParam::String(value) => Ok(value.clone()),
        _ => Err(TseError::Framing(format!(
            "expected a STRING parameter for {what}"
        ))),
    }
}

fn expect_param(params: &[TypedParam], index: usize, what: &str) -> Result<&TypedParam> {
    params
        .get(index)
        .ok_or_else(|| TseError::Framing(format!("response is missing parameter {index} ({what})")))
}

/// Packages each device operation as a typed method over the command
/// transport's `send`.
pub struct TseConnector<B: BlockDevice, C: Clock = SystemClock> {
    transport: CommandTransport<B, C>,
}

impl<B: BlockDevice> TseConnector<B, SystemClock> {
    pub async fn start(device: B, timeout: std::time::Duration) -> Result<Self> {
        let transport = CommandTransport::start(device, timeout).await?;
        Ok(Self { transport })
    }
}

impl<B: BlockDevice, C: Clock> TseConnector<B, C> {
    pub async fn start_with_clock(
        device: B,
        clock: C,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let transport = CommandTransport::start_with_clock(device, clock, timeout).await?;
        Ok(Self { transport })
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Device handshake: returns the version string and serial bytes.
    pub async fn device_start(&mut self) -> Result<StartInfo> {
        let params = self.transport.send_params(CommandId::Start, &[]).await?;
        let version = expect_string(expect_param(&params, 0, "version")?, "version")?;
        let serial = expect_byte_array(expect_param(&params, 1, "serial")?, "serial")?;
        Ok(StartInfo { version, serial })
    }

    pub async fn get_pin_status(&mut self) -> Result<PinStatus> {
        let params = self
            .transport
            .send_params(CommandId::GetPinStates, &[])
            .await?;
        let states = expect_byte_array(expect_param(&params, 0, "pin states")?, "pin states")?;
        if states.len() != 4 {
            return Err(TseError::Framing(format!(
                "expected 4 pin states, got {}",
                states.len()
            )));
        }
        Ok(PinStatus {
            admin_pin_blocked: states[0] != 0,
            admin_puk_blocked: states[1] != 0,
            time_admin_pin_blocked: states[2] != 0,
            time_admin_puk_blocked: states[3] != 0,
        })
    }

    pub async fn initialize_pin_values(
        &mut self,
        admin_puk: Vec<u8>,
        admin_pin: Vec<u8>,
        time_admin_puk: Vec<u8>,
        time_admin_pin: Vec<u8>,
    ) -> Result<()> {
        self.transport
            .send_params(
                CommandId::InitializePins,
                &[
                    TypedParam::ByteArray(admin_puk),
                    TypedParam::ByteArray(admin_pin),
                    TypedParam::ByteArray(time_admin_puk),
                    TypedParam::ByteArray(time_admin_pin),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn authenticate_user(
        &mut self,
        user_id: UserId,
        pin: Vec<u8>,
    ) -> Result<AuthenticationOutcome> {
        let params = self
            .transport
            .send_params(
                CommandId::AuthenticateUser,
                &[
                    TypedParam::String(user_id.as_str().to_string()),
                    TypedParam::ByteArray(pin),
                ],
            )
            .await?;
        let result = AuthenticationResult::from_code(expect_byte(
            expect_param(&params, 0, "authentication result")?,
            "authentication result",
        )?)?;
        let remaining_retries = expect_byte(
            expect_param(&params, 1, "remaining retries")?,
            "remaining retries",
        )?;
        Ok(AuthenticationOutcome {
            result,
            remaining_retries,
        })
    }

    pub async fn unblock_user(
        &mut self,
        user_id: UserId,
        puk: Vec<u8>,
        new_pin: Vec<u8>,
    ) -> Result<AuthenticationResult> {
        let params = self
            .transport
            .send_params(
                CommandId::UnblockUser,
                &[
                    TypedParam::String(user_id.as_str().to_string()),
                    TypedParam::ByteArray(puk),
                    TypedParam::ByteArray(new_pin),
                ],
            )
            .await?;
        AuthenticationResult::from_code(expect_byte(
            expect_param(&params, 0, "authentication result")?,
            "authentication result",
        )?)
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.transport.send_params(CommandId::Logout, &[]).await?;
        Ok(())
    }

    pub async fn initialize(&mut self) -> Result<()> {
        self.transport
            .send_params(CommandId::Initialize, &[])
            .await?;
        Ok(())
    }

    /// Sets the device clock. Defaults to the connector's own injected clock
    /// collaborator's wall-clock "now" when `unix_seconds` is `None`.
    pub async fn update_time(&mut self, unix_seconds: Option<u64>) -> Result<()> {
        let seconds = unix_seconds.unwrap_or_else(|| self.transport.clock().unix_seconds());
        self.transport
            .send_params(
                CommandId::UpdateTime,
                &[TypedParam::ByteArray(seconds.to_be_bytes().to_vec())],
            )
            .await?;
        Ok(())
    }

    /// Issues the three bit-exact undocumented payloads pulled from a
    /// decompiled factory-reset tool. Reproduced verbatim; their intent is
    /// not reconstructed from first principles.
    pub async fn factory_reset(&mut self) -> Result<()> {
        self.transport
            .send_params(
                CommandId::FactoryReset,
                &[TypedParam::ByteArray(vec![
                    160, 0, 0, 1, 81, 83, 80, 65,
                ])],
            )
            .await?;
        self.transport
            .send_params(
                CommandId::FactoryReset,
                &[TypedParam::ByteArray(vec![0])],
            )
            .await?;
        self.transport
            .send_params(
                CommandId::FactoryReset,
                &[TypedParam::ByteArray(vec![0])],
            )
            .await?;
        Ok(())
    }
}

use std::path::PathBuf;
use std::time::Duration;

use bdr_tse::block::FileBlockDevice;
use bdr_tse::connector::{AuthenticationResult, TseConnector, UserId};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{info, level_filters::LevelFilter};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEVICE_FILE_NAME: &str = "TSE-IO.bin";

#[derive(Parser)]
#[command(about = "Host-side driver for a mass-storage TSE device")]
struct Cli {
    /// Mount point of the device's public partition.
    #[arg(long)]
    tse_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wake the device and print its version and serial.
    Start,
    /// Print the PIN/PUK-blocked status of both user identities.
    GetPinStatus,
    /// Provision the initial PIN/PUK values for both user identities.
    InitializePinValues {
        admin_puk: String,
        admin_pin: String,
        time_admin_puk: String,
        time_admin_pin: String,
    },
    /// Authenticate as a user identity with its PIN.
    AuthenticateUser {
        #[arg(value_enum)]
        user: CliUserId,
        pin: String,
    },
    /// Unblock a user identity with its PUK and set a new PIN.
    UnblockUser {
        #[arg(value_enum)]
        user: CliUserId,
        puk: String,
        new_pin: String,
    },
    /// Log out of the current user session.
    Logout,
    /// Run the device's one-time initialization.
    Initialize,
    /// Set the device clock; defaults to the host's current time.
    UpdateTime {
        #[arg(long)]
        unix_seconds: Option<u64>,
    },
    /// Issue the undocumented factory-reset command sequence.
    FactoryReset,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliUserId {
    Admin,
    TimeAdmin,
}

impl From<CliUserId> for UserId {
    fn from(value: CliUserId) -> Self {
        match value {
            CliUserId::Admin => UserId::Admin,
            CliUserId::TimeAdmin => UserId::TimeAdmin,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .without_time()
        .init();

    let cli = Cli::parse();
    let device_path = cli.tse_path.join(DEVICE_FILE_NAME);

    info!(path = %device_path.display(), "opening TSE device");
    let device = FileBlockDevice::open(&device_path).await?;
    let mut connector = TseConnector::start(device, DEFAULT_TIMEOUT).await?;

    let result = run(&mut connector, cli.command).await;
    connector.close().await;
    result
}

async fn run(connector: &mut TseConnector<FileBlockDevice>, command: Command) -> Result<()> {
    match command {
        Command::Start => {
            let info = connector.device_start().await?;
            println!("version: {}", info.version);
            println!("serial: {}", hex(&info.serial));
        }
        Command::GetPinStatus => {
            let status = connector.get_pin_status().await?;
            println!("{status:#?}");
        }
        Command::InitializePinValues {
            admin_puk,
            admin_pin,
            time_admin_puk,
            time_admin_pin,
        } => {
            connector
                .initialize_pin_values(
                    admin_puk.into_bytes(),
                    admin_pin.into_bytes(),
                    time_admin_puk.into_bytes(),
                    time_admin_pin.into_bytes(),
                )
                .await?;
        }
        Command::AuthenticateUser { user, pin } => {
            let outcome = connector
                .authenticate_user(user.into(), pin.into_bytes())
                .await?;
            println!("result: {:?}", outcome.result);
            println!("remaining retries: {}", outcome.remaining_retries);
            if outcome.result != AuthenticationResult::Success {
                return Err(eyre!("authentication did not succeed"));
            }
        }
        Command::UnblockUser {
            user,
            puk,
            new_pin,
        } => {
            let result = connector
                .unblock_user(user.into(), puk.into_bytes(), new_pin.into_bytes())
                .await?;
            println!("result: {result:?}");
        }
        Command::Logout => connector.logout().await?,
        Command::Initialize => connector.initialize().await?,
        Command::UpdateTime { unix_seconds } => {
            connector.update_time(unix_seconds).await?;
        }
        Command::FactoryReset => connector.factory_reset().await?,
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

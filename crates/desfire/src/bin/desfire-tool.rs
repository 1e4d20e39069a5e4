//! Command-line tool for DESFire cards
//!
//! Connects through PC/SC, optionally selects an application, authenticates
//! and runs a single file or value command.

use clap::{Parser, Subcommand, ValueEnum};
use desfire::constants::PICC_AID;
use desfire::{AuthMode, AuthOutcome, CommunicationMode, Desfire, KeyMaterial, KeyType};
use desfire_apdu_transport_pcsc::{ConnectStrategy, PcscConfig, PcscDeviceManager, PcscTransport};
use hex::FromHex;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Reader to use; defaults to the first reader holding a DESFire card
    #[arg(short, long)]
    reader: Option<String>,

    /// Application to select (3 bytes hex, LSB first); the PICC level when
    /// omitted
    #[arg(short, long)]
    aid: Option<String>,

    /// Authentication key (hex); no authentication when omitted
    #[arg(short, long)]
    key: Option<String>,

    /// Cipher of the key
    #[arg(long, value_enum, default_value = "aes")]
    key_type: CliKeyType,

    /// Key number inside the application
    #[arg(long, default_value_t = 0)]
    key_no: u8,

    /// Use EV2 first authentication instead of the legacy handshake
    #[arg(long)]
    ev2: bool,

    /// Communication mode for file and value commands
    #[arg(short, long, value_enum, default_value = "plain")]
    mode: CliMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected readers
    ListReaders,

    /// Show manufacturing data
    Version,

    /// Authenticate and print the session state
    Auth,

    /// Read from a data file
    Read {
        /// File number
        file: u8,

        /// Offset in bytes
        #[arg(long, default_value_t = 0)]
        offset: u32,

        /// Number of bytes; 0 reads to the end
        #[arg(long, default_value_t = 0)]
        length: u32,
    },

    /// Write to a data file
    Write {
        /// File number
        file: u8,

        /// Data to write (hex)
        data: String,

        /// Offset in bytes
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Read or change a value file
    Value {
        /// File number
        file: u8,

        #[command(subcommand)]
        operation: ValueOperation,
    },
}

#[derive(Subcommand)]
enum ValueOperation {
    /// Print the current value
    Get,

    /// Credit and commit
    Credit {
        /// Amount to add
        amount: i32,
    },

    /// Debit and commit
    Debit {
        /// Amount to subtract
        amount: i32,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliKeyType {
    Des,
    #[value(name = "2k3des")]
    Tdes,
    #[value(name = "3k3des")]
    Tktdes,
    Aes,
}

impl From<CliKeyType> for KeyType {
    fn from(value: CliKeyType) -> Self {
        match value {
            CliKeyType::Des => Self::Des,
            CliKeyType::Tdes => Self::Tdes,
            CliKeyType::Tktdes => Self::Tktdes,
            CliKeyType::Aes => Self::Aes,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliMode {
    Plain,
    Maced,
    Full,
}

impl From<CliMode> for CommunicationMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Plain => Self::Plain,
            CliMode::Maced => Self::Maced,
            CliMode::Full => Self::Full,
        }
    }
}

fn list_readers(manager: &PcscDeviceManager) -> Result<(), Box<dyn std::error::Error>> {
    let readers = manager.list_readers()?;
    if readers.is_empty() {
        println!("No readers found.");
        return Ok(());
    }

    println!("Available readers:");
    for (i, reader) in readers.iter().enumerate() {
        let status = if reader.has_desfire() {
            "DESFire card"
        } else if reader.has_card() {
            "card present"
        } else {
            "no card"
        };
        println!("{}. {} ({})", i + 1, reader.name(), status);
    }
    Ok(())
}

fn authenticate(
    desfire: &mut Desfire<PcscTransport>,
    cli: &Cli,
    key_hex: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = Vec::from_hex(key_hex.replace(' ', ""))?;
    let key = KeyMaterial::new(cli.key_type.into(), &bytes)?;

    let outcome = if cli.ev2 {
        desfire.authenticate_ev2_first(cli.key_no, &key)?
    } else {
        desfire.authenticate_legacy(cli.key_no, &key)?
    };

    match outcome {
        AuthOutcome::Authenticated(diagnostics) => {
            println!("Authenticated with key {} ({})", diagnostics.key_number, diagnostics.mode);
            Ok(())
        }
        AuthOutcome::Rejected => Err("Card rejected the key".into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();

    let cli = Cli::parse();
    let manager = PcscDeviceManager::new()?;

    if let Commands::ListReaders = cli.command {
        return list_readers(&manager);
    }

    let strategy = cli
        .reader
        .clone()
        .map_or(ConnectStrategy::Desfire, ConnectStrategy::Reader);
    let transport = manager.connect_strategy(strategy, PcscConfig::default())?;
    println!("Using reader: {}", transport.reader_name());

    let mut desfire = Desfire::new(transport);

    let aid = match &cli.aid {
        Some(aid_hex) => <[u8; 3]>::from_hex(aid_hex)?,
        None => PICC_AID,
    };
    desfire.select_application(aid)?;
    println!("Selected application {}", hex::encode_upper(aid));

    if let Some(key_hex) = &cli.key {
        authenticate(&mut desfire, &cli, key_hex)?;
    }

    let mode = cli.mode.into();
    match cli.command {
        Commands::ListReaders => {}
        Commands::Version => {
            let version = desfire.get_version()?;
            println!("Generation: {}", version.generation());
            println!("UID: {}", hex::encode_upper(version.uid));
            match version.hardware.storage_bytes() {
                Some(bytes) => println!(
                    "Hardware: {}.{} ({bytes} bytes)",
                    version.hardware.major, version.hardware.minor
                ),
                None => println!(
                    "Hardware: {}.{} (storage code {:#04x})",
                    version.hardware.major, version.hardware.minor, version.hardware.storage_size
                ),
            }
            println!("Software: {}.{}", version.software.major, version.software.minor);
            println!(
                "Production: week {:02x}, year 20{:02x}",
                version.production_week, version.production_year
            );
        }
        Commands::Auth => {
            if let Some(diagnostics) = desfire.diagnostics() {
                println!("{diagnostics:#?}");
                if diagnostics.mode != AuthMode::LegacyD40 {
                    println!("Card UID: {}", hex::encode_upper(desfire.get_card_uid()?));
                }
            } else {
                println!("No key given, nothing to authenticate");
            }
        }
        Commands::Read {
            file,
            offset,
            length,
        } => {
            let data = desfire.read_data(file, offset, length, mode)?;
            println!("{}", hex::encode_upper(data));
        }
        Commands::Write { file, data, offset } => {
            let bytes = Vec::from_hex(data.replace(' ', ""))?;
            desfire.write_data(file, offset, &bytes, mode)?;
            println!("Wrote {} bytes", bytes.len());
        }
        Commands::Value { file, operation } => {
            match operation {
                ValueOperation::Get => {}
                ValueOperation::Credit { amount } => {
                    desfire.credit(file, amount, mode)?;
                    desfire.commit_transaction()?;
                }
                ValueOperation::Debit { amount } => {
                    desfire.debit(file, amount, mode)?;
                    desfire.commit_transaction()?;
                }
            }
            println!("Value: {}", desfire.get_value(file, mode)?);
        }
    }

    Ok(())
}

//! PC/SC transport for MIFARE DESFire cards
//!
//! Implements [`CardTransport`](desfire_apdu_core::CardTransport) on top of the
//! system PC/SC stack, so the `desfire` crate can talk to any contactless
//! reader with a PC/SC driver.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use desfire_apdu_core::{Framer, FramerConfig};
//! use desfire_apdu_transport_pcsc::{ConnectStrategy, PcscConfig, PcscDeviceManager};
//!
//! let manager = PcscDeviceManager::new()?;
//! let mut transport = manager.connect_strategy(ConnectStrategy::Desfire, PcscConfig::default())?;
//!
//! // GetVersion
//! let framer = Framer::new(FramerConfig::default());
//! let version = framer.send_and_collect(&mut transport, 0x60, None)?;
//! println!("{}", hex::encode_upper(&version));
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod config;
mod error;
mod manager;
mod reader;
mod transport;
mod util;

pub use config::{ConnectStrategy, DESFIRE_ATR, PcscConfig, ShareMode};
pub use error::PcscError;
pub use manager::PcscDeviceManager;
pub use reader::PcscReader;
pub use transport::PcscTransport;

// Re-export some pcsc types for convenience
pub use pcsc::{Protocol, Protocols};

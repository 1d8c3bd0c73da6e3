#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bikeprobe 🚲
//!
//! Protocol detection, telemetry decoding and compatibility testing for
//! Bluetooth Low Energy indoor bikes.
//!
//! Indoor bikes on the market speak a handful of different protocols: the
//! standard Fitness Machine Service (FTMS), the bare Cycling Speed and Cadence
//! profile (CSC), and several vendor protocols. This library figures out which
//! one a connected bike speaks, decodes its telemetry, drives a scripted
//! control/readback test and turns the evidence into a compatibility verdict.
//!
//! ## Components
//!
//! - **Detection**: device-name heuristics plus discovered GATT services, with a
//!   fixed vendor priority order ([`detect`])
//! - **Codecs**: one frame codec per protocol variant ([`protocol`])
//! - **Reborn authentication**: challenge-response handshake for Reborn bikes
//! - **Session**: single-device connection state machine ([`DeviceSession`])
//! - **Orchestrator**: the multi-phase compatibility test ([`TestOrchestrator`])
//! - **Classifier**: deterministic verdict and reasons ([`classify`])
//!
//! ## Quick Start
//!
//! ```no_run
//! use bikeprobe::{
//!     BtleplugTransport, ConnectionParams, DeviceSession, TestConfig, TestOrchestrator,
//!     TracingSink,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = ConnectionParams::default();
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let devices = transport.scan_for_bikes(&params).await?;
//!     let Some(device) = devices.into_iter().next() else {
//!         return Ok(());
//!     };
//!
//!     let mut session = DeviceSession::new(transport, params, Arc::new(TracingSink));
//!     let mut orchestrator = TestOrchestrator::new(TestConfig::default());
//!     let results = orchestrator.run(&mut session, &device).await;
//!
//!     println!("{results}");
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport abstraction and btleplug backend
pub mod ble;
/// Compatibility verdict rules
pub mod classifier;
/// Protocol detection
pub mod detect;
/// Error types and handling
pub mod error;
/// Compatibility test script
pub mod orchestrator;
/// Per-protocol frame codecs
pub mod protocol;
/// Plain-text compatibility report
pub mod report;
/// Accumulated test evidence
pub mod results;
/// Single-device session state machine
pub mod session;
/// Type definitions and data structures
pub mod types;

pub use ble::{BleTransport, BtleplugTransport, NotificationStream};
pub use classifier::{classify, classify_with_threshold, DEFAULT_AUTOMATIC_CHANGE_THRESHOLD};
pub use detect::detect_protocol;
pub use error::{BikeError, Result};
pub use orchestrator::{StopHandle, TestEvent, TestOrchestrator, TestPhase};
pub use protocol::{codec_for, ControlAck, ControlCommand, ControlOpcode, FrameCodec, ResultCode};
pub use results::{
    CommandStatus, CompatibilityLevel, ControlOutcome, ControlTest, FieldObservation,
    PendingCommand, PendingCommandTracker, ResistanceChangeEvent, TestResults, INTERRUPTED_MARKER,
};
pub use session::{DeviceSession, LogSink, SessionEvent, SessionLog, SessionState, TracingSink};
pub use types::{
    ConnectionParams, DataField, DeviceInfo, IndoorBikeData, MachineFeatures, ProtocolType,
    RangeInfo, RangeKind, TestConfig,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Feature characteristic
pub const FTMS_FEATURE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2acc_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data characteristic
pub const FTMS_INDOOR_BIKE_DATA_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Supported Speed Range characteristic
pub const FTMS_SPEED_RANGE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad4_0000_1000_8000_0080_5f9b_34fb);

/// Supported Inclination Range characteristic
pub const FTMS_INCLINE_RANGE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad5_0000_1000_8000_0080_5f9b_34fb);

/// Supported Resistance Level Range characteristic
pub const FTMS_RESISTANCE_RANGE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad6_0000_1000_8000_0080_5f9b_34fb);

/// Supported Power Range characteristic
pub const FTMS_POWER_RANGE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad8_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic
pub const FTMS_CONTROL_POINT_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Speed and Cadence service
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement characteristic
pub const CSC_MEASUREMENT_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Mobi vendor service
pub const MOBI_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb);

/// Mobi data characteristic
pub const MOBI_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_ffe4_0000_1000_8000_0080_5f9b_34fb);

/// Reborn vendor service
pub const REBORN_SERVICE_UUID: Uuid = Uuid::from_u128(0x0001_0203_0405_0607_0809_0a0b_0c0d_1910);

/// Reborn data (notify) characteristic
pub const REBORN_DATA_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0001_0203_0405_0607_0809_0a0b_0c0d_2b10);

/// Reborn write characteristic
pub const REBORN_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0001_0203_0405_0607_0809_0a0b_0c0d_2b11);

/// Tacx vendor service
pub const TACX_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_fec1_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Services used as the scan filter list
pub const SCAN_SERVICE_UUIDS: [Uuid; 5] = [
    FTMS_SERVICE_UUID,
    CSC_SERVICE_UUID,
    MOBI_SERVICE_UUID,
    REBORN_SERVICE_UUID,
    TACX_SERVICE_UUID,
];

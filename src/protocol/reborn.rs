//! Reborn vendor protocol: challenge-response authentication and telemetry.
//!
//! Reborn bikes stream nothing until the central proves it knows a shared
//! key. The central writes a 15-byte challenge to the write characteristic;
//! the bike answers on the data characteristic with five bytes derived from
//! the challenge and the key. The central then writes an accept or reject
//! frame. After acceptance the data characteristic carries 16-byte telemetry
//! frames.
//!
//! ```text
//! challenge: AA 0F 8A 03 r0 r1 r2 r3 r4 r5 r6 r7 r8 r9 cs
//! reply:     .. .. 8A 03 e0 e1 e2 e3 e4 ..
//! telemetry: .. .. 00 80 .. .. .. .. .. .. .. cad .. .. gear ..
//! ```

use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use super::FrameCodec;
use crate::{
    error::{BikeError, Result},
    types::{IndoorBikeData, ProtocolType},
    REBORN_DATA_CHAR_UUID, REBORN_SERVICE_UUID,
};

/// Shared authentication key
pub const KEY: [u8; 5] = [0x15, 0x25, 0x80, 0x13, 0xF0];

/// Challenge frame length
pub const REQUEST_SIZE: usize = 15;

/// Telemetry frame length
pub const TELEMETRY_SIZE: usize = 16;

/// Written after a correct reply
pub const ACCEPT_FRAME: [u8; 6] = [0xAA, 0x06, 0x80, 0xE1, 0x00, 0x11];

/// Written after a wrong reply
pub const REJECT_FRAME: [u8; 6] = [0xAA, 0x06, 0x80, 0xE1, 0x01, 0x12];

const REQUEST_HEADER: [u8; 4] = [0xAA, 0x0F, 0x8A, 0x03];
const RANDOM_SIZE: usize = 10;
const FIXED_BATTERY_LEVEL: u8 = 100;
const GEAR_STEP: f64 = 14.3;
const MAX_GEAR: f64 = 7.0;

/// Kind of frame received on the Reborn data characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebornFrame {
    /// Answer to the authentication challenge
    AuthReply,
    /// Telemetry sample
    Telemetry,
    /// Device reports an authentication error
    AuthError,
    /// Anything else
    Unknown,
}

impl RebornFrame {
    /// Classify a frame by its header bytes
    #[must_use]
    pub fn classify(data: &[u8]) -> Self {
        match data {
            [_, _, 0x8A, 0x03, ..] => Self::AuthReply,
            [_, _, 0x80, 0xE1, 0x01, ..] => Self::AuthError,
            [_, _, 0x00, 0x80, ..] if data.len() == TELEMETRY_SIZE => Self::Telemetry,
            _ => Self::Unknown,
        }
    }
}

/// Sum of `bytes` modulo 256
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// One authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebornAuthenticator {
    request: [u8; REQUEST_SIZE],
}

impl RebornAuthenticator {
    /// Start an attempt with a fresh random challenge
    #[must_use]
    pub fn new() -> Self {
        let mut random = [0u8; RANDOM_SIZE];
        rand::thread_rng().fill(&mut random[..]);
        Self::with_random(random)
    }

    /// Start an attempt with the given challenge bytes
    #[must_use]
    pub fn with_random(random: [u8; RANDOM_SIZE]) -> Self {
        let mut request = [0u8; REQUEST_SIZE];
        request[..4].copy_from_slice(&REQUEST_HEADER);
        request[4..14].copy_from_slice(&random);
        request[14] = checksum(&request[..14]);
        Self { request }
    }

    /// Challenge frame to write to the device
    #[must_use]
    pub const fn request_frame(&self) -> &[u8; REQUEST_SIZE] {
        &self.request
    }

    /// Reply the device must send back
    #[must_use]
    pub fn expected_response(&self) -> [u8; 5] {
        let mut expected = [0u8; 5];
        for (i, byte) in expected.iter_mut().enumerate() {
            *byte = self.request[4 + i]
                .wrapping_add(self.request[9 + i])
                .wrapping_add(KEY[i]);
        }
        expected
    }

    /// Check a device reply against the expected response
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::AuthenticationFailed`] if the reply is not an
    /// authentication reply or carries the wrong bytes.
    pub fn verify(&self, reply: &[u8]) -> Result<()> {
        if RebornFrame::classify(reply) != RebornFrame::AuthReply || reply.len() < 9 {
            return Err(BikeError::AuthenticationFailed(format!(
                "unexpected reply {reply:02X?}"
            )));
        }

        let expected = self.expected_response();
        if reply[4..9] == expected {
            Ok(())
        } else {
            Err(BikeError::AuthenticationFailed(format!(
                "response {:02X?} does not match {expected:02X?}",
                &reply[4..9]
            )))
        }
    }
}

impl Default for RebornAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

/// Cadence from the period byte
///
/// Converted to seconds per revolution first, then back to a rate.
fn cadence_from_period_byte(raw: u8) -> f64 {
    if raw == 0 {
        return 0.0;
    }
    let one_round_seconds = 60.0 / f64::from(raw);
    (60.0 / one_round_seconds).round()
}

/// Map the 1-100 raw gear to the 1-7 system scale
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn gear_from_raw(raw: u8) -> u8 {
    (f64::from(raw) / GEAR_STEP).ceil().clamp(1.0, MAX_GEAR) as u8
}

/// Reborn codec
#[derive(Debug, Clone, Copy, Default)]
pub struct RebornCodec;

impl FrameCodec for RebornCodec {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Reborn
    }

    fn telemetry_endpoint(&self) -> Option<(Uuid, Uuid)> {
        Some((REBORN_SERVICE_UUID, REBORN_DATA_CHAR_UUID))
    }

    fn decode_telemetry(&self, data: &[u8]) -> Result<IndoorBikeData> {
        match RebornFrame::classify(data) {
            RebornFrame::Telemetry => {}
            RebornFrame::AuthError => return Err(BikeError::AuthenticationRejectedByDevice),
            other => {
                return Err(BikeError::MalformedFrame(format!(
                    "Reborn {other:?} frame on data channel: {data:02X?}"
                )))
            }
        }

        let gear = gear_from_raw(data[14]);
        debug!("Reborn telemetry: period byte {}, raw gear {} -> {gear}", data[11], data[14]);

        Ok(IndoorBikeData {
            cadence: Some(cadence_from_period_byte(data[11])),
            gear_level: Some(gear),
            resistance_level: Some(i16::from(gear)),
            battery_level: Some(FIXED_BATTERY_LEVEL),
            raw: data.to_vec(),
            ..Default::default()
        })
    }
}

//! Mobi vendor telemetry codec (read-only).

use uuid::Uuid;

use super::FrameCodec;
use crate::{
    error::{BikeError, Result},
    types::{IndoorBikeData, ProtocolType},
    MOBI_DATA_CHAR_UUID, MOBI_SERVICE_UUID,
};

/// Frames must be longer than this to carry the gear byte
const MIN_FRAME_LEN: usize = 15;

/// Mobi bikes have no battery sensor
const FIXED_BATTERY_LEVEL: u8 = 100;

/// Mobi codec
#[derive(Debug, Clone, Copy, Default)]
pub struct MobiCodec;

impl FrameCodec for MobiCodec {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Mobi
    }

    fn telemetry_endpoint(&self) -> Option<(Uuid, Uuid)> {
        Some((MOBI_SERVICE_UUID, MOBI_DATA_CHAR_UUID))
    }

    fn decode_telemetry(&self, data: &[u8]) -> Result<IndoorBikeData> {
        if data.len() < MIN_FRAME_LEN {
            return Err(BikeError::MalformedFrame(format!(
                "Mobi frame too short: {} bytes",
                data.len()
            )));
        }

        let cadence = (u16::from(data[9]) << 8) | u16::from(data[10]);
        let gear = data[13];

        Ok(IndoorBikeData {
            cadence: Some(f64::from(cadence)),
            gear_level: Some(gear),
            resistance_level: Some(i16::from(gear)),
            battery_level: Some(FIXED_BATTERY_LEVEL),
            raw: data.to_vec(),
            ..Default::default()
        })
    }
}

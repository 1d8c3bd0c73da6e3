//! Cycling Speed and Cadence measurement codec.

use bytes::Buf;
use tracing::debug;
use uuid::Uuid;

use super::FrameCodec;
use crate::{
    error::{BikeError, Result},
    types::{IndoorBikeData, ProtocolType},
    CSC_MEASUREMENT_CHAR_UUID, CSC_SERVICE_UUID,
};

const WHEEL_DATA_PRESENT: u8 = 0x01;
const CRANK_DATA_PRESENT: u8 = 0x02;

/// CSC codec
///
/// Wheel revolution data is only logged: converting it to speed needs a
/// wheel circumference the device does not report. The cumulative crank
/// revolution count is surfaced as `cadence` unchanged. That value is a
/// counter, not a rate; callers comparing it against rpm thresholds should
/// keep that in mind.
#[derive(Debug, Clone, Copy, Default)]
pub struct CscCodec;

impl FrameCodec for CscCodec {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Csc
    }

    fn telemetry_endpoint(&self) -> Option<(Uuid, Uuid)> {
        Some((CSC_SERVICE_UUID, CSC_MEASUREMENT_CHAR_UUID))
    }

    fn decode_telemetry(&self, data: &[u8]) -> Result<IndoorBikeData> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(BikeError::MalformedFrame("empty CSC measurement".to_string()));
        }

        let flags = buf.get_u8();
        let mut sample = IndoorBikeData {
            flags: u16::from(flags),
            raw: data.to_vec(),
            ..Default::default()
        };

        if flags & WHEEL_DATA_PRESENT != 0 {
            if buf.remaining() < 6 {
                return Ok(sample);
            }
            let revolutions = buf.get_u32_le();
            let event_time = buf.get_u16_le();
            debug!("CSC wheel data: {revolutions} revolutions at {event_time}/1024 s");
        }

        if flags & CRANK_DATA_PRESENT != 0 && buf.remaining() >= 4 {
            let revolutions = buf.get_u16_le();
            let _event_time = buf.get_u16_le();
            sample.cadence = Some(f64::from(revolutions));
        }

        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crank_only() {
        let sample = CscCodec
            .decode_telemetry(&[0x02, 0x2A, 0x00, 0x00, 0x04])
            .unwrap();
        assert_eq!(sample.cadence, Some(42.0));
        assert_eq!(sample.speed, None);
    }

    #[test]
    fn test_wheel_then_crank() {
        let data = [0x03, 0x10, 0x00, 0x00, 0x00, 0x00, 0x08, 0x07, 0x00, 0x00, 0x04];
        let sample = CscCodec.decode_telemetry(&data).unwrap();
        assert_eq!(sample.cadence, Some(7.0));
        assert_eq!(sample.flags, 0x03);
    }

    #[test]
    fn test_wheel_only_has_no_cadence() {
        let data = [0x01, 0x10, 0x00, 0x00, 0x00, 0x00, 0x08];
        let sample = CscCodec.decode_telemetry(&data).unwrap();
        assert!(sample.is_empty());
    }

    #[test]
    fn test_empty_frame() {
        assert!(CscCodec.decode_telemetry(&[]).is_err());
    }
}

//! Fitness Machine Service codec.
//!
//! Indoor Bike Data frames are little-endian. The first two bytes are a flag
//! bitmask; each bit gates one fixed-width field and fields follow strictly
//! in bit order:
//!
//! | bit | field | width | scale |
//! |-----|-------|-------|-------|
//! | 0 | instantaneous speed (present when **clear**) | 2 | /100 km/h |
//! | 1 | average speed | 2 | /100 km/h |
//! | 2 | instantaneous cadence | 2 | /2 rpm |
//! | 3 | average cadence | 2 | /2 rpm |
//! | 4 | total distance | 3 | m |
//! | 5 | resistance level | 2 (signed) | 1 |
//! | 6 | instantaneous power | 2 (signed) | W |
//! | 7 | average power | 2 (signed) | W |
//! | 8 | total expended energy | 2 | kcal |
//! | 9 | heart rate | 1 | bpm |
//! | 10 | metabolic equivalent | 1 | /10 MET |
//! | 11 | elapsed time | 2 | s |
//! | 12 | remaining time | 2 | s |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;
use uuid::Uuid;

use super::{control::ControlAck, ControlCommand, FrameCodec};
use crate::{
    error::{BikeError, Result},
    types::{IndoorBikeData, ProtocolType, RangeInfo, RangeKind},
    FTMS_CONTROL_POINT_CHAR_UUID, FTMS_INDOOR_BIKE_DATA_CHAR_UUID, FTMS_SERVICE_UUID,
};

/// Highest flag bit carrying a field
const LAST_FIELD_BIT: u16 = 12;

/// Byte width of the field gated by each flag bit
const FIELD_WIDTHS: [usize; 13] = [2, 2, 2, 2, 3, 2, 2, 2, 2, 1, 1, 2, 2];

/// Size of a supported-range characteristic value
pub const RANGE_SIZE: usize = 6;

/// FTMS codec
#[derive(Debug, Clone, Copy, Default)]
pub struct FtmsCodec;

impl FrameCodec for FtmsCodec {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Ftms
    }

    fn telemetry_endpoint(&self) -> Option<(Uuid, Uuid)> {
        Some((FTMS_SERVICE_UUID, FTMS_INDOOR_BIKE_DATA_CHAR_UUID))
    }

    fn control_endpoint(&self) -> Option<(Uuid, Uuid)> {
        Some((FTMS_SERVICE_UUID, FTMS_CONTROL_POINT_CHAR_UUID))
    }

    fn decode_telemetry(&self, data: &[u8]) -> Result<IndoorBikeData> {
        decode_indoor_bike_data(data)
    }

    fn decode_ack(&self, data: &[u8]) -> Result<ControlAck> {
        ControlAck::from_bytes(data)
    }

    fn encode_command(&self, command: &ControlCommand) -> Result<Bytes> {
        Ok(command.to_bytes())
    }
}

/// Whether the field gated by `bit` is present in `flags`
const fn field_present(flags: u16, bit: u16) -> bool {
    if bit == 0 {
        flags & 0x0001 == 0
    } else {
        flags & (1 << bit) != 0
    }
}

/// Decode an Indoor Bike Data frame
///
/// A frame truncated in the middle of a field stops decoding at that field
/// and returns everything decoded before it.
///
/// # Errors
///
/// Returns [`BikeError::MalformedFrame`] if the frame is too short to hold
/// the flag bitmask.
pub fn decode_indoor_bike_data(data: &[u8]) -> Result<IndoorBikeData> {
    if data.len() < 2 {
        return Err(BikeError::MalformedFrame(format!(
            "Indoor Bike Data too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = data;
    let flags = buf.get_u16_le();
    let mut sample = IndoorBikeData {
        flags,
        raw: data.to_vec(),
        ..Default::default()
    };

    for bit in 0..=LAST_FIELD_BIT {
        if !field_present(flags, bit) {
            continue;
        }

        let width = FIELD_WIDTHS[bit as usize];
        if buf.remaining() < width {
            debug!(
                "Indoor Bike Data truncated at flag bit {bit}: {} of {width} bytes left",
                buf.remaining()
            );
            break;
        }

        match bit {
            0 => sample.speed = Some(f64::from(buf.get_u16_le()) / 100.0),
            1 => sample.average_speed = Some(f64::from(buf.get_u16_le()) / 100.0),
            2 => sample.cadence = Some(f64::from(buf.get_u16_le()) / 2.0),
            3 => sample.average_cadence = Some(f64::from(buf.get_u16_le()) / 2.0),
            4 => sample.total_distance = u32::try_from(buf.get_uint_le(3)).ok(),
            5 => sample.resistance_level = Some(buf.get_i16_le()),
            6 => sample.power = Some(buf.get_i16_le()),
            7 => sample.average_power = Some(buf.get_i16_le()),
            8 => sample.expended_energy = Some(buf.get_u16_le()),
            9 => sample.heart_rate = Some(buf.get_u8()),
            10 => sample.metabolic_equivalent = Some(f64::from(buf.get_u8()) / 10.0),
            11 => sample.elapsed_time = Some(buf.get_u16_le()),
            12 => sample.remaining_time = Some(buf.get_u16_le()),
            _ => break,
        }
    }

    Ok(sample)
}

/// Encode a sample as an Indoor Bike Data frame
///
/// Flags are derived from the fields that are present. Vendor-only fields
/// (gear, battery) have no FTMS representation and are skipped.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode_indoor_bike_data(sample: &IndoorBikeData) -> Bytes {
    let presence = [
        sample.speed.is_some(),
        sample.average_speed.is_some(),
        sample.cadence.is_some(),
        sample.average_cadence.is_some(),
        sample.total_distance.is_some(),
        sample.resistance_level.is_some(),
        sample.power.is_some(),
        sample.average_power.is_some(),
        sample.expended_energy.is_some(),
        sample.heart_rate.is_some(),
        sample.metabolic_equivalent.is_some(),
        sample.elapsed_time.is_some(),
        sample.remaining_time.is_some(),
    ];

    let mut flags: u16 = 0;
    for (bit, present) in presence.iter().enumerate() {
        let set = if bit == 0 { !present } else { *present };
        if set {
            flags |= 1 << bit;
        }
    }

    let mut buf = BytesMut::with_capacity(2 + FIELD_WIDTHS.iter().sum::<usize>());
    buf.put_u16_le(flags);

    if let Some(speed) = sample.speed {
        buf.put_u16_le((speed * 100.0).round() as u16);
    }
    if let Some(speed) = sample.average_speed {
        buf.put_u16_le((speed * 100.0).round() as u16);
    }
    if let Some(cadence) = sample.cadence {
        buf.put_u16_le((cadence * 2.0).round() as u16);
    }
    if let Some(cadence) = sample.average_cadence {
        buf.put_u16_le((cadence * 2.0).round() as u16);
    }
    if let Some(distance) = sample.total_distance {
        buf.put_uint_le(u64::from(distance & 0x00FF_FFFF), 3);
    }
    if let Some(level) = sample.resistance_level {
        buf.put_i16_le(level);
    }
    if let Some(power) = sample.power {
        buf.put_i16_le(power);
    }
    if let Some(power) = sample.average_power {
        buf.put_i16_le(power);
    }
    if let Some(energy) = sample.expended_energy {
        buf.put_u16_le(energy);
    }
    if let Some(heart_rate) = sample.heart_rate {
        buf.put_u8(heart_rate);
    }
    if let Some(met) = sample.metabolic_equivalent {
        buf.put_u8((met * 10.0).round() as u8);
    }
    if let Some(elapsed) = sample.elapsed_time {
        buf.put_u16_le(elapsed);
    }
    if let Some(remaining) = sample.remaining_time {
        buf.put_u16_le(remaining);
    }

    buf.freeze()
}

/// Parse a supported-range characteristic value
///
/// # Errors
///
/// Returns [`BikeError::MalformedFrame`] if fewer than six bytes are present.
pub fn parse_range(kind: RangeKind, data: &[u8]) -> Result<RangeInfo> {
    if data.len() < RANGE_SIZE {
        return Err(BikeError::MalformedFrame(format!(
            "{kind} range too short: {} bytes, expected {RANGE_SIZE}",
            data.len()
        )));
    }

    let mut buf = data;
    let scale = kind.scale();
    Ok(RangeInfo {
        min: f64::from(buf.get_i16_le()) * scale,
        max: f64::from(buf.get_i16_le()) * scale,
        increment: f64::from(buf.get_i16_le()) * scale,
    })
}

/// Parse the Fitness Machine Feature value into its feature bitmask
///
/// # Errors
///
/// Returns [`BikeError::MalformedFrame`] if fewer than four bytes are present.
pub fn parse_machine_features(data: &[u8]) -> Result<u32> {
    if data.len() < 4 {
        return Err(BikeError::MalformedFrame(format!(
            "Fitness Machine Feature too short: {} bytes",
            data.len()
        )));
    }
    let mut buf = data;
    Ok(buf.get_u32_le())
}

/// Joins Indoor Bike Data samples that a device split over two notifications
///
/// One sample is held back; if the next sample carries none of the same
/// fields the two are emitted as one, otherwise the held sample is emitted
/// on its own and the new one takes its place.
#[derive(Debug, Default)]
pub struct FrameMerger {
    pending: Option<IndoorBikeData>,
}

impl FrameMerger {
    /// Create an empty merger
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Feed a sample, returning a completed sample if one is ready
    pub fn push(&mut self, sample: IndoorBikeData) -> Option<IndoorBikeData> {
        match self.pending.take() {
            None => {
                self.pending = Some(sample);
                None
            }
            Some(held) => {
                if let Some(merged) = held.merge_disjoint(&sample) {
                    debug!(
                        "Merged split Indoor Bike Data: 0x{:04X} + 0x{:04X}",
                        held.flags, sample.flags
                    );
                    Some(merged)
                } else {
                    self.pending = Some(sample);
                    Some(held)
                }
            }
        }
    }

    /// Emit whatever is still held
    pub fn flush(&mut self) -> Option<IndoorBikeData> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataField;

    #[test]
    fn test_speed_present_when_bit_zero_clear() {
        let data = [0x00, 0x00, 0xD2, 0x04];
        let sample = decode_indoor_bike_data(&data).unwrap();
        assert_eq!(sample.speed, Some(12.34));
        assert_eq!(sample.flags, 0);
        assert_eq!(sample.raw, data.to_vec());

        let data = [0x01, 0x00, 0xD2, 0x04];
        let sample = decode_indoor_bike_data(&data).unwrap();
        assert_eq!(sample.speed, None);
    }

    #[test]
    fn test_typical_bike_frame() {
        // speed, cadence, resistance, power
        let mut data = vec![0x64, 0x00];
        data.extend_from_slice(&2500u16.to_le_bytes());
        data.extend_from_slice(&180u16.to_le_bytes());
        data.extend_from_slice(&8i16.to_le_bytes());
        data.extend_from_slice(&(-5i16).to_le_bytes());

        let sample = decode_indoor_bike_data(&data).unwrap();
        assert_eq!(sample.speed, Some(25.0));
        assert_eq!(sample.cadence, Some(90.0));
        assert_eq!(sample.resistance_level, Some(8));
        assert_eq!(sample.power, Some(-5));
        assert_eq!(sample.heart_rate, None);
    }

    #[test]
    fn test_every_field() {
        let sample = IndoorBikeData {
            speed: Some(30.5),
            average_speed: Some(28.25),
            cadence: Some(85.5),
            average_cadence: Some(80.0),
            total_distance: Some(0x01_2345),
            resistance_level: Some(-3),
            power: Some(210),
            average_power: Some(190),
            expended_energy: Some(321),
            heart_rate: Some(142),
            metabolic_equivalent: Some(6.4),
            elapsed_time: Some(900),
            remaining_time: Some(300),
            ..Default::default()
        };

        let bytes = encode_indoor_bike_data(&sample);
        assert_eq!(&bytes[0..2], &0x1FFEu16.to_le_bytes());

        let decoded = decode_indoor_bike_data(&bytes).unwrap();
        assert_eq!(decoded.speed, sample.speed);
        assert_eq!(decoded.average_speed, sample.average_speed);
        assert_eq!(decoded.cadence, sample.cadence);
        assert_eq!(decoded.average_cadence, sample.average_cadence);
        assert_eq!(decoded.total_distance, sample.total_distance);
        assert_eq!(decoded.resistance_level, sample.resistance_level);
        assert_eq!(decoded.power, sample.power);
        assert_eq!(decoded.average_power, sample.average_power);
        assert_eq!(decoded.expended_energy, sample.expended_energy);
        assert_eq!(decoded.heart_rate, sample.heart_rate);
        assert_eq!(decoded.metabolic_equivalent, sample.metabolic_equivalent);
        assert_eq!(decoded.elapsed_time, sample.elapsed_time);
        assert_eq!(decoded.remaining_time, sample.remaining_time);
    }

    #[test]
    fn test_sparse_flags_follow_bit_order() {
        // heart rate (bit 9) and remaining time (bit 12), no speed
        let data = [0x01, 0x12, 0x8C, 0x2C, 0x01];
        let sample = decode_indoor_bike_data(&data).unwrap();
        assert_eq!(sample.speed, None);
        assert_eq!(sample.heart_rate, Some(140));
        assert_eq!(sample.remaining_time, Some(300));
        assert_eq!(sample.elapsed_time, None);
    }

    #[test]
    fn test_truncated_frame_keeps_decoded_fields() {
        // speed + cadence + power declared, power missing one byte
        let data = [0x44, 0x00, 0xE8, 0x03, 0xA0, 0x00, 0x64];
        let sample = decode_indoor_bike_data(&data).unwrap();
        assert_eq!(sample.speed, Some(10.0));
        assert_eq!(sample.cadence, Some(80.0));
        assert_eq!(sample.power, None);
    }

    #[test]
    fn test_frame_without_flags_is_malformed() {
        assert!(matches!(
            decode_indoor_bike_data(&[0x00]),
            Err(BikeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_range_parsing_scales() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-100i16).to_le_bytes());
        data.extend_from_slice(&150i16.to_le_bytes());
        data.extend_from_slice(&5i16.to_le_bytes());

        let incline = parse_range(RangeKind::Incline, &data).unwrap();
        assert!((incline.min - -10.0).abs() < 1e-9);
        assert!((incline.max - 15.0).abs() < 1e-9);
        assert!((incline.increment - 0.5).abs() < 1e-9);

        let resistance = parse_range(RangeKind::Resistance, &data).unwrap();
        assert!((resistance.max - 150.0).abs() < 1e-9);

        assert!(parse_range(RangeKind::Power, &data[..4]).is_err());
    }

    #[test]
    fn test_machine_features() {
        let features = parse_machine_features(&[0x82, 0x40, 0x00, 0x00, 0x0C, 0xE0, 0x00, 0x00])
            .unwrap();
        assert_eq!(features, 0x0000_4082);
        assert!(parse_machine_features(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_merger_joins_disjoint_halves() {
        let first = decode_indoor_bike_data(&[0x04, 0x00, 0xE8, 0x03, 0xA0, 0x00]).unwrap();
        let second = decode_indoor_bike_data(&[0x41, 0x00, 0xC8, 0x00]).unwrap();

        let mut merger = FrameMerger::new();
        assert!(merger.push(first).is_none());
        let merged = merger.push(second).unwrap();
        assert_eq!(merged.speed, Some(10.0));
        assert_eq!(merged.cadence, Some(80.0));
        assert_eq!(merged.power, Some(200));
        assert!(merger.flush().is_none());
    }

    #[test]
    fn test_merger_emits_held_sample_on_overlap() {
        let first = decode_indoor_bike_data(&[0x00, 0x00, 0xE8, 0x03]).unwrap();
        let second = decode_indoor_bike_data(&[0x00, 0x00, 0xD0, 0x07]).unwrap();

        let mut merger = FrameMerger::new();
        assert!(merger.push(first).is_none());
        let emitted = merger.push(second).unwrap();
        assert_eq!(emitted.speed, Some(10.0));
        assert_eq!(merger.flush().unwrap().speed, Some(20.0));
    }

    fn sample_for_mask(mask: u16) -> IndoorBikeData {
        let has = |bit: u16| mask & (1 << bit) != 0;
        IndoorBikeData {
            speed: has(0).then_some(12.34),
            average_speed: has(1).then_some(11.5),
            cadence: has(2).then_some(90.5),
            average_cadence: has(3).then_some(85.0),
            total_distance: has(4).then_some(70_000),
            resistance_level: has(5).then_some(-3),
            power: has(6).then_some(250),
            average_power: has(7).then_some(180),
            expended_energy: has(8).then_some(420),
            heart_rate: has(9).then_some(140),
            metabolic_equivalent: has(10).then_some(6.5),
            elapsed_time: has(11).then_some(1_800),
            remaining_time: has(12).then_some(600),
            ..Default::default()
        }
    }

    fn fields_of(sample: &IndoorBikeData) -> Vec<DataField> {
        sample.observations().into_iter().map(|(field, _)| field).collect()
    }

    #[test]
    fn test_every_field_combination_decodes_exactly() {
        for mask in 0..(1u16 << 13) {
            let expected = sample_for_mask(mask);
            let frame = encode_indoor_bike_data(&expected);

            let decoded = decode_indoor_bike_data(&frame).unwrap();
            assert_eq!(decoded.observations(), expected.observations(), "mask {mask:#06x}");

            let all = fields_of(&expected);
            for len in 0..frame.len() {
                match decode_indoor_bike_data(&frame[..len]) {
                    Ok(partial) => {
                        assert!(len >= 2, "mask {mask:#06x} len {len}");
                        assert!(fields_of(&partial).iter().all(|field| all.contains(field)));
                    }
                    Err(e) => {
                        assert!(len < 2, "mask {mask:#06x} len {len}");
                        assert!(matches!(e, BikeError::MalformedFrame(_)));
                    }
                }
            }
        }
    }
}

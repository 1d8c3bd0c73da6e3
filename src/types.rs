use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{
    CSC_SERVICE_UUID, FTMS_SERVICE_UUID, MOBI_SERVICE_UUID, REBORN_SERVICE_UUID,
    TACX_SERVICE_UUID,
};

/// Communication protocol spoken by an indoor bike
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Standard Fitness Machine Service
    #[serde(rename = "FTMS")]
    Ftms,
    /// Standard Cycling Speed and Cadence sensor
    #[serde(rename = "CSC")]
    Csc,
    /// Mobi proprietary protocol (read-only)
    #[serde(rename = "MOBI")]
    Mobi,
    /// Reborn proprietary protocol (read-only, authenticated)
    #[serde(rename = "REBORN")]
    Reborn,
    /// Tacx Neo proprietary protocol (not implemented)
    #[serde(rename = "TACX_NEO")]
    TacxNeo,
    /// `FitShow` proprietary protocol (not implemented)
    #[serde(rename = "FITSHOW")]
    FitShow,
}

impl ProtocolType {
    /// All protocol variants
    pub const ALL: [Self; 6] = [
        Self::Ftms,
        Self::Csc,
        Self::Mobi,
        Self::Reborn,
        Self::TacxNeo,
        Self::FitShow,
    ];

    /// Whether the protocol accepts Control Point commands
    #[must_use]
    pub const fn supports_control(self) -> bool {
        matches!(self, Self::Ftms)
    }

    /// Protocols with no start/stop concept; they are active as soon as they are ready
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::Csc | Self::Mobi | Self::Reborn)
    }

    /// Protocols recognised by detection but stubbed out
    #[must_use]
    pub const fn is_implemented(self) -> bool {
        !matches!(self, Self::TacxNeo | Self::FitShow)
    }

    /// Vendor protocols the target application integrates natively
    #[must_use]
    pub const fn is_priority_proprietary(self) -> bool {
        matches!(self, Self::Mobi | Self::TacxNeo | Self::FitShow)
    }

    /// FTMS or a natively integrated vendor protocol
    #[must_use]
    pub const fn is_control_capable(self) -> bool {
        matches!(self, Self::Ftms) || self.is_priority_proprietary()
    }

    /// Primary GATT service of the protocol, if one is known
    #[must_use]
    pub const fn service_uuid(self) -> Option<Uuid> {
        match self {
            Self::Ftms => Some(FTMS_SERVICE_UUID),
            Self::Csc => Some(CSC_SERVICE_UUID),
            Self::Mobi => Some(MOBI_SERVICE_UUID),
            Self::Reborn => Some(REBORN_SERVICE_UUID),
            Self::TacxNeo => Some(TACX_SERVICE_UUID),
            Self::FitShow => None,
        }
    }

    /// Every protocol whose service appears in `services`
    #[must_use]
    pub fn advertised_in(services: &[Uuid]) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|p| p.service_uuid().is_some_and(|uuid| services.contains(&uuid)))
            .collect()
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ftms => write!(f, "FTMS"),
            Self::Csc => write!(f, "CSC"),
            Self::Mobi => write!(f, "MOBI"),
            Self::Reborn => write!(f, "REBORN"),
            Self::TacxNeo => write!(f, "TACX_NEO"),
            Self::FitShow => write!(f, "FITSHOW"),
        }
    }
}

/// Telemetry fields tracked during a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataField {
    /// Instantaneous speed (km/h)
    Speed,
    /// Average speed (km/h)
    AverageSpeed,
    /// Instantaneous cadence (rpm)
    Cadence,
    /// Average cadence (rpm)
    AverageCadence,
    /// Total distance (m)
    TotalDistance,
    /// Resistance level
    ResistanceLevel,
    /// Instantaneous power (W)
    Power,
    /// Average power (W)
    AveragePower,
    /// Expended energy (kcal)
    ExpendedEnergy,
    /// Heart rate (bpm)
    HeartRate,
    /// Metabolic equivalent (MET)
    MetabolicEquivalent,
    /// Elapsed time (s)
    ElapsedTime,
    /// Remaining time (s)
    RemainingTime,
    /// Vendor gear level
    GearLevel,
    /// Battery percentage
    BatteryLevel,
}

impl fmt::Display for DataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Speed => "speed",
            Self::AverageSpeed => "average speed",
            Self::Cadence => "cadence",
            Self::AverageCadence => "average cadence",
            Self::TotalDistance => "total distance",
            Self::ResistanceLevel => "resistance level",
            Self::Power => "power",
            Self::AveragePower => "average power",
            Self::ExpendedEnergy => "expended energy",
            Self::HeartRate => "heart rate",
            Self::MetabolicEquivalent => "metabolic equivalent",
            Self::ElapsedTime => "elapsed time",
            Self::RemainingTime => "remaining time",
            Self::GearLevel => "gear level",
            Self::BatteryLevel => "battery level",
        };
        f.write_str(name)
    }
}

/// One decoded telemetry sample
///
/// Every measurement is optional: a field is `Some` only when the frame
/// actually carried it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndoorBikeData {
    /// Instantaneous speed in km/h
    pub speed: Option<f64>,
    /// Average speed in km/h
    pub average_speed: Option<f64>,
    /// Instantaneous cadence in rpm
    pub cadence: Option<f64>,
    /// Average cadence in rpm
    pub average_cadence: Option<f64>,
    /// Total distance in meters
    pub total_distance: Option<u32>,
    /// Resistance level, protocol-defined scale
    pub resistance_level: Option<i16>,
    /// Instantaneous power in watts
    pub power: Option<i16>,
    /// Average power in watts
    pub average_power: Option<i16>,
    /// Total expended energy in kcal
    pub expended_energy: Option<u16>,
    /// Heart rate in bpm
    pub heart_rate: Option<u8>,
    /// Metabolic equivalent in MET
    pub metabolic_equivalent: Option<f64>,
    /// Elapsed time in seconds
    pub elapsed_time: Option<u16>,
    /// Remaining time in seconds
    pub remaining_time: Option<u16>,
    /// Vendor gear level
    pub gear_level: Option<u8>,
    /// Battery percentage
    pub battery_level: Option<u8>,
    /// Flag bitmask of the frame, for diagnostics
    pub flags: u16,
    /// Raw frame bytes, for diagnostics
    pub raw: Vec<u8>,
}

impl IndoorBikeData {
    /// Present fields with their numeric value
    #[must_use]
    pub fn observations(&self) -> Vec<(DataField, f64)> {
        let fields = [
            (DataField::Speed, self.speed),
            (DataField::AverageSpeed, self.average_speed),
            (DataField::Cadence, self.cadence),
            (DataField::AverageCadence, self.average_cadence),
            (DataField::TotalDistance, self.total_distance.map(f64::from)),
            (DataField::ResistanceLevel, self.resistance_level.map(f64::from)),
            (DataField::Power, self.power.map(f64::from)),
            (DataField::AveragePower, self.average_power.map(f64::from)),
            (DataField::ExpendedEnergy, self.expended_energy.map(f64::from)),
            (DataField::HeartRate, self.heart_rate.map(f64::from)),
            (DataField::MetabolicEquivalent, self.metabolic_equivalent),
            (DataField::ElapsedTime, self.elapsed_time.map(f64::from)),
            (DataField::RemainingTime, self.remaining_time.map(f64::from)),
            (DataField::GearLevel, self.gear_level.map(f64::from)),
            (DataField::BatteryLevel, self.battery_level.map(f64::from)),
        ];
        fields
            .into_iter()
            .filter_map(|(field, value)| value.map(|v| (field, v)))
            .collect()
    }

    /// Whether the sample carries no measurement at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations().is_empty()
    }

    /// Combine two halves of one logical sample
    ///
    /// Returns `None` when both samples carry a common field.
    #[must_use]
    pub fn merge_disjoint(&self, other: &Self) -> Option<Self> {
        let ours: Vec<DataField> = self.observations().into_iter().map(|(f, _)| f).collect();
        if other
            .observations()
            .iter()
            .any(|(field, _)| ours.contains(field))
        {
            return None;
        }

        let mut raw = self.raw.clone();
        raw.extend_from_slice(&other.raw);

        Some(Self {
            speed: self.speed.or(other.speed),
            average_speed: self.average_speed.or(other.average_speed),
            cadence: self.cadence.or(other.cadence),
            average_cadence: self.average_cadence.or(other.average_cadence),
            total_distance: self.total_distance.or(other.total_distance),
            resistance_level: self.resistance_level.or(other.resistance_level),
            power: self.power.or(other.power),
            average_power: self.average_power.or(other.average_power),
            expended_energy: self.expended_energy.or(other.expended_energy),
            heart_rate: self.heart_rate.or(other.heart_rate),
            metabolic_equivalent: self.metabolic_equivalent.or(other.metabolic_equivalent),
            elapsed_time: self.elapsed_time.or(other.elapsed_time),
            remaining_time: self.remaining_time.or(other.remaining_time),
            gear_level: self.gear_level.or(other.gear_level),
            battery_level: self.battery_level.or(other.battery_level),
            flags: self.flags | other.flags,
            raw,
        })
    }
}

/// FTMS supported-range characteristic kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeKind {
    /// Supported speed range (0.01 km/h)
    Speed,
    /// Supported inclination range (0.1 %)
    Incline,
    /// Supported resistance level range
    Resistance,
    /// Supported power range (W)
    Power,
}

impl RangeKind {
    /// All range characteristics in read order
    pub const ALL: [Self; 4] = [Self::Speed, Self::Incline, Self::Resistance, Self::Power];

    /// Multiplier applied to raw values
    #[must_use]
    pub const fn scale(self) -> f64 {
        match self {
            Self::Speed => 0.01,
            Self::Incline => 0.1,
            Self::Resistance | Self::Power => 1.0,
        }
    }

    /// Unit suffix used in reports
    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Speed => "km/h",
            Self::Incline => "%",
            Self::Resistance => "",
            Self::Power => "W",
        }
    }
}

impl fmt::Display for RangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Speed => write!(f, "Speed"),
            Self::Incline => write!(f, "Incline"),
            Self::Resistance => write!(f, "Resistance"),
            Self::Power => write!(f, "Power"),
        }
    }
}

/// Supported range read from an FTMS range characteristic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeInfo {
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
    /// Minimum increment
    pub increment: f64,
}

/// Device discovered during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Transport-level identifier used to connect
    pub id: String,
    /// Advertised name (may be empty)
    pub name: String,
    /// Device MAC address, when the platform exposes it
    pub address: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: i16,
    /// Service UUIDs seen in the advertisement
    pub advertised_services: Vec<Uuid>,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            address: None,
            rssi: 0,
            advertised_services: Vec::new(),
        }
    }

    /// Protocols whose service appears in the advertisement
    #[must_use]
    pub fn advertised_protocols(&self) -> Vec<ProtocolType> {
        ProtocolType::advertised_in(&self.advertised_services)
    }
}

/// Decoded FTMS Fitness Machine Feature bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineFeatures(pub u32);

impl MachineFeatures {
    const NAMES: [&'static str; 16] = [
        "average_speed",
        "cadence",
        "total_distance",
        "inclination",
        "elevation_gain",
        "pace",
        "step_count",
        "resistance_level",
        "stride_count",
        "expended_energy",
        "heart_rate",
        "metabolic_equivalent",
        "elapsed_time",
        "remaining_time",
        "power_measurement",
        "force_on_belt",
    ];

    /// Whether the given bit is set
    #[must_use]
    pub const fn has_bit(self, bit: u32) -> bool {
        bit < 32 && self.0 & (1 << bit) != 0
    }

    /// Names of all supported features
    #[must_use]
    pub fn supported(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.has_bit(*bit as u32))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Reborn authentication reply timeout in milliseconds
    pub auth_timeout_ms: u64,
    /// Merge FTMS samples split across two notifications
    pub merge_split_frames: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
            auth_timeout_ms: 5_000,
            merge_split_frames: false,
        }
    }
}

/// Compatibility test script configuration
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Total test duration in milliseconds
    pub total_duration_ms: u64,
    /// Observation window after each resistance-affecting command
    pub observation_window_ms: u64,
    /// Level sent with `SET_RESISTANCE_LEVEL`
    pub resistance_level: i16,
    /// Watts sent with `SET_TARGET_POWER`
    pub target_power_watts: i16,
    /// Grade sent with `SET_SIM_PARAMS`, in percent
    pub sim_grade_percent: f64,
    /// Wind speed sent with `SET_SIM_PARAMS`, in m/s
    pub sim_wind_speed: f64,
    /// Rolling resistance coefficient sent with `SET_SIM_PARAMS`
    pub sim_crr: f64,
    /// Wind resistance coefficient sent with `SET_SIM_PARAMS`
    pub sim_cw: f64,
    /// Unattributed resistance changes that flag the device for adjustment
    pub automatic_change_threshold: usize,
    /// Progress event interval during free-run collection
    pub progress_interval_ms: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            total_duration_ms: 30_000,
            observation_window_ms: 2_000,
            resistance_level: 10,
            target_power_watts: 100,
            sim_grade_percent: 10.0,
            sim_wind_speed: 0.0,
            sim_crr: 0.0,
            sim_cw: 0.0,
            automatic_change_threshold: 5,
            progress_interval_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_capabilities() {
        assert!(ProtocolType::Ftms.supports_control());
        assert!(!ProtocolType::Mobi.supports_control());
        assert!(ProtocolType::Reborn.is_read_only());
        assert!(!ProtocolType::TacxNeo.is_implemented());
        assert!(ProtocolType::FitShow.is_control_capable());
        assert!(!ProtocolType::Csc.is_control_capable());
        assert!(!ProtocolType::Reborn.is_control_capable());
    }

    #[test]
    fn test_advertised_protocols() {
        let services = vec![CSC_SERVICE_UUID, FTMS_SERVICE_UUID];
        assert_eq!(
            ProtocolType::advertised_in(&services),
            vec![ProtocolType::Ftms, ProtocolType::Csc]
        );
        assert!(ProtocolType::advertised_in(&[]).is_empty());
    }

    #[test]
    fn test_merge_disjoint_samples() {
        let first = IndoorBikeData {
            speed: Some(25.0),
            cadence: Some(80.0),
            flags: 0x0004,
            ..Default::default()
        };
        let second = IndoorBikeData {
            power: Some(150),
            flags: 0x0041,
            ..Default::default()
        };

        let merged = first.merge_disjoint(&second).unwrap();
        assert_eq!(merged.speed, Some(25.0));
        assert_eq!(merged.power, Some(150));
        assert_eq!(merged.flags, 0x0045);

        let overlapping = IndoorBikeData {
            cadence: Some(82.0),
            ..Default::default()
        };
        assert!(first.merge_disjoint(&overlapping).is_none());
    }

    #[test]
    fn test_machine_features() {
        let features = MachineFeatures(0x0000_4082);
        assert_eq!(
            features.supported(),
            vec!["cadence", "resistance_level", "power_measurement"]
        );
        assert!(!features.has_bit(40));
    }

    #[test]
    fn test_config_defaults() {
        let config = TestConfig::default();
        assert_eq!(config.total_duration_ms, 30_000);
        assert_eq!(config.observation_window_ms, 2_000);
        assert_eq!(config.resistance_level, 10);
        assert_eq!(config.target_power_watts, 100);
        assert_eq!(config.automatic_change_threshold, 5);

        let params = ConnectionParams::default();
        assert_eq!(params.connect_timeout_ms, 30_000);
        assert!(!params.merge_split_frames);
    }
}

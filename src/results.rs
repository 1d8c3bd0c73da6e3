use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::SystemTime};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::Result,
    protocol::{ControlAck, ControlCommand, ControlOpcode},
    types::{DataField, DeviceInfo, IndoorBikeData, ProtocolType, RangeInfo, RangeKind},
};

/// Prefix of the issue recorded when a run is cut short
pub const INTERRUPTED_MARKER: &str = "Test interrupted";

/// Control test key: the opcode of the command under test
pub type ControlTest = ControlOpcode;

/// Compatibility verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityLevel {
    /// Everything the target application needs works
    FullyCompatible,
    /// Usable with limitations
    Partial,
    /// Works once the device's automatic resistance behaviour is adjusted
    NeedsModification,
    /// Not usable
    Impossible,
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullyCompatible => write!(f, "Fully compatible"),
            Self::Partial => write!(f, "Partially compatible"),
            Self::NeedsModification => write!(f, "Compatible after modification"),
            Self::Impossible => write!(f, "Not compatible"),
        }
    }
}

/// Outcome of one control test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Sent, not yet confirmed
    Pending,
    /// Acknowledged and, where applicable, confirmed from telemetry
    Ok,
    /// Rejected by the device or never confirmed
    Failed,
    /// The protocol has no way to send it
    NotSupported,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Ok => write!(f, "OK"),
            Self::Failed => write!(f, "FAILED"),
            Self::NotSupported => write!(f, "N/A"),
        }
    }
}

/// Recorded result of a control test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOutcome {
    /// Status
    pub status: CommandStatus,
    /// When the status was recorded
    pub timestamp: SystemTime,
    /// Human-readable detail
    pub details: String,
}

/// Running statistics of one telemetry field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldObservation {
    /// Whether the field was ever present
    pub detected: bool,
    /// Smallest value seen
    pub min: f64,
    /// Largest value seen
    pub max: f64,
    /// Latest value
    pub current: f64,
}

impl FieldObservation {
    fn first(value: f64) -> Self {
        Self {
            detected: true,
            min: value,
            max: value,
            current: value,
        }
    }

    fn observe(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.current = value;
    }
}

/// Observed change of the resistance level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResistanceChangeEvent {
    /// When the change was observed
    pub timestamp: SystemTime,
    /// Field that changed
    pub param_type: DataField,
    /// Previous value
    pub old_value: i16,
    /// New value
    pub new_value: i16,
    /// Command in flight when the change arrived; `None` means automatic
    pub attributed_command: Option<ControlOpcode>,
}

impl ResistanceChangeEvent {
    /// Whether no command was in flight
    #[must_use]
    pub const fn is_automatic(&self) -> bool {
        self.attributed_command.is_none()
    }
}

/// Evidence gathered by one compatibility run
///
/// Mutators are no-ops once `test_completed` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    /// Device under test
    pub device: DeviceInfo,
    /// Whether the connection succeeded
    pub connection_status: bool,
    /// When the connection succeeded
    pub connected_at: Option<SystemTime>,
    /// Detected protocol
    pub protocol: Option<ProtocolType>,
    /// Every protocol whose service was discovered
    pub supported_protocols: Vec<ProtocolType>,
    /// Named feature flags
    pub features: BTreeMap<String, bool>,
    /// Supported ranges that could be read
    pub ranges: BTreeMap<RangeKind, RangeInfo>,
    /// Telemetry field statistics
    pub data_fields: BTreeMap<DataField, FieldObservation>,
    /// Control test outcomes
    pub control_tests: BTreeMap<ControlTest, ControlOutcome>,
    /// Resistance changes in arrival order
    pub resistance_changes: Vec<ResistanceChangeEvent>,
    /// Problems found during the run
    pub issues_found: Vec<String>,
    /// Verdict, once classified
    pub compatibility_level: Option<CompatibilityLevel>,
    /// Reasons behind the verdict
    pub reasons: Vec<String>,
    /// Set when the results are final
    pub test_completed: bool,
}

impl TestResults {
    /// Empty results for a device
    #[must_use]
    pub const fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            connection_status: false,
            connected_at: None,
            protocol: None,
            supported_protocols: Vec::new(),
            features: BTreeMap::new(),
            ranges: BTreeMap::new(),
            data_fields: BTreeMap::new(),
            control_tests: BTreeMap::new(),
            resistance_changes: Vec::new(),
            issues_found: Vec::new(),
            compatibility_level: None,
            reasons: Vec::new(),
            test_completed: false,
        }
    }

    fn frozen(&self) -> bool {
        if self.test_completed {
            debug!("Ignoring update to completed test results");
        }
        self.test_completed
    }

    /// Record a successful connection
    pub fn mark_connected(&mut self) {
        if self.frozen() {
            return;
        }
        self.connection_status = true;
        self.connected_at = Some(SystemTime::now());
    }

    /// Record the detected protocol and the discovered protocol list
    pub fn set_protocol(&mut self, protocol: ProtocolType, supported: Vec<ProtocolType>) {
        if self.frozen() {
            return;
        }
        self.protocol = Some(protocol);
        self.supported_protocols = supported;
    }

    /// Record a named feature flag
    pub fn set_feature(&mut self, name: &str, supported: bool) {
        if self.frozen() {
            return;
        }
        self.features.insert(name.to_string(), supported);
    }

    /// Record a supported range
    pub fn set_range(&mut self, kind: RangeKind, range: RangeInfo) {
        if self.frozen() {
            return;
        }
        self.ranges.insert(kind, range);
    }

    /// Fold every present field of a sample into the statistics
    pub fn record_sample(&mut self, sample: &IndoorBikeData) {
        if self.frozen() {
            return;
        }
        for (field, value) in sample.observations() {
            self.data_fields
                .entry(field)
                .and_modify(|obs| obs.observe(value))
                .or_insert_with(|| FieldObservation::first(value));
        }
    }

    /// Whether a field was ever present
    #[must_use]
    pub fn is_detected(&self, field: DataField) -> bool {
        self.data_fields.get(&field).is_some_and(|obs| obs.detected)
    }

    /// Record a control test outcome
    pub fn set_control(&mut self, test: ControlTest, status: CommandStatus, details: impl Into<String>) {
        if self.frozen() {
            return;
        }
        self.control_tests.insert(
            test,
            ControlOutcome {
                status,
                timestamp: SystemTime::now(),
                details: details.into(),
            },
        );
    }

    /// Status of a control test, if it was run
    #[must_use]
    pub fn control_status(&self, test: ControlTest) -> Option<CommandStatus> {
        self.control_tests.get(&test).map(|outcome| outcome.status)
    }

    /// Append a resistance change
    pub fn push_resistance_change(&mut self, event: ResistanceChangeEvent) {
        if self.frozen() {
            return;
        }
        self.resistance_changes.push(event);
    }

    /// Resistance changes with no command in flight
    #[must_use]
    pub fn automatic_change_count(&self) -> usize {
        self.resistance_changes
            .iter()
            .filter(|event| event.is_automatic())
            .count()
    }

    /// Record a problem
    pub fn add_issue(&mut self, issue: impl Into<String>) {
        if self.frozen() {
            return;
        }
        self.issues_found.push(issue.into());
    }

    /// Whether the run was cut short
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.issues_found
            .iter()
            .any(|issue| issue.starts_with(INTERRUPTED_MARKER))
    }

    /// Serialize to pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Serialization`](crate::BikeError::Serialization) if
    /// serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Command awaiting confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    /// Command under test
    pub command: ControlOpcode,
    /// When it was written
    pub sent_at: Instant,
    /// Resistance level that confirms it; `None` means any change does
    pub expected_value: Option<i16>,
    /// Whether matching telemetry arrived
    pub confirmed: bool,
}

/// Single-slot correlation of a command with the telemetry that proves it
/// took effect
///
/// ```text
/// empty --arm--> armed --resistance match--> confirmed --clear--> empty
///                  |--failure ack-----------------------------> empty
///                  `--window expired (expire)-----------------> empty
/// ```
///
/// Arming while another command is armed abandons the earlier one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCommandTracker {
    slot: Option<PendingCommand>,
}

impl PendingCommandTracker {
    /// Empty tracker
    #[must_use]
    pub const fn new() -> Self {
        Self { slot: None }
    }

    /// Arm for a command, returning the command abandoned unconfirmed, if any
    pub fn arm(&mut self, command: &ControlCommand, sent_at: Instant) -> Option<ControlOpcode> {
        let expected_value = match command {
            // only the low byte goes over the air
            ControlCommand::SetResistanceLevel(level) => Some(*level & 0x00FF),
            _ => None,
        };
        let abandoned = self
            .slot
            .filter(|pending| !pending.confirmed)
            .map(|pending| pending.command);

        self.slot = Some(PendingCommand {
            command: command.opcode(),
            sent_at,
            expected_value,
            confirmed: false,
        });
        abandoned
    }

    /// The armed slot
    #[must_use]
    pub const fn current(&self) -> Option<&PendingCommand> {
        self.slot.as_ref()
    }

    /// Command a telemetry change should be attributed to
    #[must_use]
    pub fn attributed_command(&self) -> Option<ControlOpcode> {
        self.slot.map(|pending| pending.command)
    }

    /// Feed an observed resistance change; returns the command it confirms
    pub fn on_resistance_change(&mut self, new_value: i16) -> Option<ControlOpcode> {
        let pending = self.slot.as_mut().filter(|pending| !pending.confirmed)?;
        if pending.expected_value.is_some_and(|expected| expected != new_value) {
            return None;
        }
        pending.confirmed = true;
        Some(pending.command)
    }

    /// Feed an acknowledgement; a failure for the armed command clears the
    /// slot and returns that command
    pub fn on_ack(&mut self, ack: &ControlAck) -> Option<ControlOpcode> {
        let pending = self.slot?;
        if ack.result.is_success() || ack.opcode() != Some(pending.command) {
            return None;
        }
        self.slot = None;
        Some(pending.command)
    }

    /// End of the observation window: clears the slot and returns the command
    /// if it was never confirmed
    pub fn expire(&mut self) -> Option<ControlOpcode> {
        self.slot
            .take()
            .filter(|pending| !pending.confirmed)
            .map(|pending| pending.command)
    }

    /// Drop whatever is armed
    pub fn clear(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultCode;

    fn device() -> DeviceInfo {
        DeviceInfo::new("id".to_string(), "Bike".to_string())
    }

    fn ack(opcode: ControlOpcode, result: ResultCode) -> ControlAck {
        ControlAck {
            request_opcode: opcode as u8,
            result,
        }
    }

    #[test]
    fn test_field_statistics() {
        let mut results = TestResults::new(device());
        for cadence in [80.0, 95.5, 70.0] {
            results.record_sample(&IndoorBikeData {
                cadence: Some(cadence),
                ..Default::default()
            });
        }

        let cadence = results.data_fields[&DataField::Cadence];
        assert!(cadence.detected);
        assert!((cadence.min - 70.0).abs() < f64::EPSILON);
        assert!((cadence.max - 95.5).abs() < f64::EPSILON);
        assert!((cadence.current - 70.0).abs() < f64::EPSILON);
        assert!(!results.is_detected(DataField::Power));
    }

    #[test]
    fn test_completed_results_are_frozen() {
        let mut results = TestResults::new(device());
        results.add_issue("before");
        results.test_completed = true;

        results.add_issue("after");
        results.set_control(ControlOpcode::Start, CommandStatus::Ok, "late");
        results.record_sample(&IndoorBikeData {
            cadence: Some(80.0),
            ..Default::default()
        });

        assert_eq!(results.issues_found, vec!["before".to_string()]);
        assert!(results.control_tests.is_empty());
        assert!(results.data_fields.is_empty());
    }

    #[test]
    fn test_interrupted_marker() {
        let mut results = TestResults::new(device());
        results.add_issue("Range read failed");
        assert!(!results.is_interrupted());
        results.add_issue(format!("{INTERRUPTED_MARKER}: device disconnected"));
        assert!(results.is_interrupted());
    }

    #[test]
    fn test_json_form() {
        let mut results = TestResults::new(device());
        results.set_control(ControlOpcode::SetTargetPower, CommandStatus::Failed, "timeout");
        results.set_feature("cadence", true);

        let json = results.to_json_pretty().unwrap();
        assert!(json.contains("\"SET_TARGET_POWER\""));
        assert!(json.contains("\"failed\""));
        assert!(json.contains("\"cadence\": true"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_exact_match_for_resistance_level() {
        let mut tracker = PendingCommandTracker::new();
        assert!(tracker
            .arm(&ControlCommand::SetResistanceLevel(10), Instant::now())
            .is_none());

        assert_eq!(tracker.on_resistance_change(9), None);
        assert_eq!(
            tracker.on_resistance_change(10),
            Some(ControlOpcode::SetResistanceLevel)
        );
        // confirmed commands stay attributed until cleared
        assert_eq!(
            tracker.attributed_command(),
            Some(ControlOpcode::SetResistanceLevel)
        );
        assert_eq!(tracker.on_resistance_change(11), None);
        assert_eq!(tracker.expire(), None);
        assert_eq!(tracker.attributed_command(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_matches_the_level_byte_sent() {
        let mut tracker = PendingCommandTracker::new();
        tracker.arm(&ControlCommand::SetResistanceLevel(300), Instant::now());
        assert_eq!(tracker.current().and_then(|p| p.expected_value), Some(44));
        assert_eq!(tracker.on_resistance_change(300), None);
        assert_eq!(
            tracker.on_resistance_change(44),
            Some(ControlOpcode::SetResistanceLevel)
        );
    }

    #[tokio::test]
    async fn test_tracker_any_change_for_indirect_commands() {
        let mut tracker = PendingCommandTracker::new();
        tracker.arm(&ControlCommand::SetTargetPower(100), Instant::now());
        assert_eq!(
            tracker.on_resistance_change(-4),
            Some(ControlOpcode::SetTargetPower)
        );

        tracker.arm(&ControlCommand::grade(10.0), Instant::now());
        assert_eq!(tracker.current().map(|p| p.expected_value), Some(None));
        assert_eq!(
            tracker.on_resistance_change(3),
            Some(ControlOpcode::SetSimParams)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_failure_ack_clears() {
        let mut tracker = PendingCommandTracker::new();
        tracker.arm(&ControlCommand::SetResistanceLevel(10), Instant::now());

        assert_eq!(
            tracker.on_ack(&ack(ControlOpcode::SetResistanceLevel, ResultCode::Success)),
            None
        );
        assert_eq!(
            tracker.on_ack(&ack(ControlOpcode::Start, ResultCode::OperationFailed)),
            None
        );
        assert_eq!(
            tracker.on_ack(&ack(
                ControlOpcode::SetResistanceLevel,
                ResultCode::ControlNotPermitted
            )),
            Some(ControlOpcode::SetResistanceLevel)
        );
        assert!(tracker.current().is_none());
        assert_eq!(tracker.expire(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_timeout_and_abandon() {
        let mut tracker = PendingCommandTracker::new();
        tracker.arm(&ControlCommand::SetTargetPower(100), Instant::now());
        assert_eq!(
            tracker.arm(&ControlCommand::grade(5.0), Instant::now()),
            Some(ControlOpcode::SetTargetPower)
        );
        assert_eq!(tracker.expire(), Some(ControlOpcode::SetSimParams));
        assert!(tracker.current().is_none());
    }
}

//! Compatibility verdict.
//!
//! Evidence is sorted into three condition buckets (impossible, partial and
//! needs-modification); the verdict is the highest bucket that fired, with
//! precedence impossible > needs-modification > partial > fully compatible.

use std::fmt;
use tracing::info;

use crate::{
    protocol::ControlOpcode,
    results::{CommandStatus, CompatibilityLevel, TestResults, INTERRUPTED_MARKER},
    types::{DataField, ProtocolType},
};

/// Reason behind a verdict
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reason {
    ConnectionFailed,
    Interrupted(String),
    CadenceMissing,
    NoProtocol,
    ResistanceMissing,
    GearControlFailed,
    ErgControlFailed,
    SimControlFailed,
    NoControlCommands(ProtocolType),
    BasicFunctionOnly,
    AutomaticResistance(usize),
    AllWorking,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => {
                write!(f, "Could not connect to the device. Check the Bluetooth settings.")
            }
            Self::Interrupted(detail) => {
                write!(f, "The test did not finish ({detail}). Run it again with the device connected.")
            }
            Self::CadenceMissing => write!(
                f,
                "Cadence (RPM) data was not detected. Cadence is required by the app."
            ),
            Self::NoProtocol => write!(
                f,
                "No supported protocol was found. Test a device speaking FTMS, CSC, MOBI, REBORN, TACX or FITSHOW."
            ),
            Self::ResistanceMissing => write!(
                f,
                "Resistance data was not detected. The app will use its default gear mode."
            ),
            Self::GearControlFailed => write!(
                f,
                "Resistance level control did not work. Gear mode is not available."
            ),
            Self::ErgControlFailed => write!(
                f,
                "Target power control did not work. ERG mode is not available."
            ),
            Self::SimControlFailed => write!(
                f,
                "Simulation parameters had no effect. SIM mode is not available."
            ),
            Self::NoControlCommands(protocol) => write!(
                f,
                "The {protocol} protocol does not support control commands; resistance cannot be set from the app."
            ),
            Self::BasicFunctionOnly => write!(
                f,
                "Only the CSC protocol was found. Basic speed and cadence functions only."
            ),
            Self::AutomaticResistance(count) => write!(
                f,
                "Resistance changed {count} times without any resistance-related command. Adjust the device settings for full compatibility."
            ),
            Self::AllWorking => write!(
                f,
                "Cadence, resistance and all control commands work as expected."
            ),
        }
    }
}

/// Protocols whose lack of control commands is a fixed limitation
const fn has_control_limitation(protocol: ProtocolType) -> bool {
    matches!(protocol, ProtocolType::Reborn | ProtocolType::FitShow)
}

fn interruption_detail(results: &TestResults) -> Option<String> {
    results.issues_found.iter().find_map(|issue| {
        issue.strip_prefix(INTERRUPTED_MARKER).map(|rest| {
            let detail = rest.trim_start_matches([':', ' ']);
            if detail.is_empty() {
                "interrupted".to_string()
            } else {
                detail.to_string()
            }
        })
    })
}

fn impossible_reasons(results: &TestResults) -> Vec<Reason> {
    if !results.connection_status {
        return vec![Reason::ConnectionFailed];
    }

    let mut reasons = Vec::new();
    if let Some(detail) = interruption_detail(results) {
        reasons.push(Reason::Interrupted(detail));
    }
    if results.protocol.is_none() {
        reasons.push(Reason::NoProtocol);
    }
    if !results.is_detected(DataField::Cadence) {
        reasons.push(Reason::CadenceMissing);
    }
    reasons
}

fn partial_reasons(results: &TestResults) -> Vec<Reason> {
    let mut reasons = Vec::new();

    if !results.is_detected(DataField::ResistanceLevel) {
        reasons.push(Reason::ResistanceMissing);
    }

    let control_tests = [
        (ControlOpcode::SetResistanceLevel, Reason::GearControlFailed),
        (ControlOpcode::SetTargetPower, Reason::ErgControlFailed),
        (ControlOpcode::SetSimParams, Reason::SimControlFailed),
    ];
    for (test, reason) in control_tests {
        if matches!(
            results.control_status(test),
            Some(CommandStatus::Failed | CommandStatus::Pending)
        ) {
            reasons.push(reason);
        }
    }

    match results.protocol {
        Some(protocol) if has_control_limitation(protocol) => {
            reasons.push(Reason::NoControlCommands(protocol));
        }
        Some(ProtocolType::Csc) if !results.supported_protocols.contains(&ProtocolType::Ftms) => {
            reasons.push(Reason::BasicFunctionOnly);
        }
        _ => {}
    }
    reasons
}

fn warning_reasons(results: &TestResults, threshold: usize) -> Vec<Reason> {
    let automatic = results.automatic_change_count();
    if automatic >= threshold {
        vec![Reason::AutomaticResistance(automatic)]
    } else {
        Vec::new()
    }
}

/// Threshold of unattributed resistance changes used by [`classify`]
pub const DEFAULT_AUTOMATIC_CHANGE_THRESHOLD: usize = 5;

/// Classify finished evidence
///
/// Sets `compatibility_level`, `reasons` and `test_completed`. Results that
/// are already classified are returned unchanged.
#[must_use]
pub fn classify(results: TestResults) -> TestResults {
    classify_with_threshold(results, DEFAULT_AUTOMATIC_CHANGE_THRESHOLD)
}

/// [`classify`] with a custom automatic-change threshold
#[must_use]
pub fn classify_with_threshold(mut results: TestResults, threshold: usize) -> TestResults {
    if results.test_completed && results.compatibility_level.is_some() {
        return results;
    }

    let impossible = impossible_reasons(&results);
    let warning = warning_reasons(&results, threshold);
    let partial = partial_reasons(&results);

    let (level, mut reasons) = if !impossible.is_empty() {
        (CompatibilityLevel::Impossible, impossible)
    } else if !warning.is_empty() {
        (CompatibilityLevel::NeedsModification, warning)
    } else if !partial.is_empty() {
        (CompatibilityLevel::Partial, partial)
    } else if results.protocol.is_some_and(ProtocolType::is_control_capable) {
        (CompatibilityLevel::FullyCompatible, vec![Reason::AllWorking])
    } else {
        (CompatibilityLevel::Partial, vec![Reason::BasicFunctionOnly])
    };

    if level != CompatibilityLevel::Impossible {
        if let Some(protocol) = results.protocol.filter(|p| has_control_limitation(*p)) {
            reasons.push(Reason::NoControlCommands(protocol));
        }
    }

    let mut rendered: Vec<String> = Vec::new();
    for reason in reasons {
        let message = reason.to_string();
        if !rendered.contains(&message) {
            rendered.push(message);
        }
    }

    info!("Compatibility: {level} ({} reason(s))", rendered.len());
    results.compatibility_level = Some(level);
    results.reasons = rendered;
    results.test_completed = true;
    results
}

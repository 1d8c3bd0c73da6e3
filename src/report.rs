use std::fmt;

use crate::{
    results::{CommandStatus, TestResults},
    types::{DataField, RangeInfo, RangeKind},
};

const RULE: &str = "==================================================";

/// Fields listed first, in this order, whether detected or not
const PRIORITY_FIELDS: [DataField; 4] = [
    DataField::Cadence,
    DataField::Speed,
    DataField::ResistanceLevel,
    DataField::Power,
];

const fn status_icon(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Ok => "✅",
        CommandStatus::Failed => "❌",
        CommandStatus::Pending => "⏳",
        CommandStatus::NotSupported => "➖",
    }
}

fn format_range(kind: RangeKind, range: &RangeInfo) -> String {
    let unit = kind.unit();
    let sep = if unit.is_empty() || unit == "%" { "" } else { " " };
    match kind {
        RangeKind::Speed => format!(
            "{:.2} - {:.2}{sep}{unit} (increment {:.2}{sep}{unit})",
            range.min, range.max, range.increment
        ),
        RangeKind::Incline => format!(
            "{:.1}{unit} - {:.1}{unit} (increment {:.1}{unit})",
            range.min, range.max, range.increment
        ),
        RangeKind::Resistance | RangeKind::Power => format!(
            "{} - {}{sep}{unit} (increment {}{sep}{unit})",
            range.min, range.max, range.increment
        ),
    }
}

fn section(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    writeln!(f)?;
    writeln!(f, "[{title}]")
}

impl fmt::Display for TestResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{RULE}")?;
        writeln!(f, "Indoor bike compatibility report")?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "Device: {} ({})", self.device.name, self.device.id)?;
        if let Some(address) = &self.device.address {
            writeln!(f, "Address: {address}")?;
        }
        match self.protocol {
            Some(protocol) => writeln!(f, "Protocol: {protocol}")?,
            None => writeln!(f, "Protocol: none detected")?,
        }
        if !self.supported_protocols.is_empty() {
            let names: Vec<String> = self
                .supported_protocols
                .iter()
                .map(ToString::to_string)
                .collect();
            writeln!(f, "Services found for: {}", names.join(", "))?;
        }
        writeln!(
            f,
            "Connection: {}",
            if self.connection_status { "✅ connected" } else { "❌ failed" }
        )?;

        if !self.features.is_empty() {
            section(f, "Supported features")?;
            for (name, supported) in &self.features {
                writeln!(f, "{name}: {}", if *supported { "✅" } else { "❌" })?;
            }
        }

        if !self.ranges.is_empty() {
            section(f, "Supported ranges")?;
            for (kind, range) in &self.ranges {
                writeln!(f, "{kind}: {}", format_range(*kind, range))?;
            }
        }

        section(f, "Data fields")?;
        for field in PRIORITY_FIELDS {
            match self.data_fields.get(&field).filter(|obs| obs.detected) {
                Some(obs) => writeln!(
                    f,
                    "{field}: {} (min {}, max {})",
                    obs.current, obs.min, obs.max
                )?,
                None => writeln!(f, "{field}: not detected")?,
            }
        }
        for (field, obs) in &self.data_fields {
            if obs.detected && !PRIORITY_FIELDS.contains(field) {
                writeln!(f, "{field}: {} (min {}, max {})", obs.current, obs.min, obs.max)?;
            }
        }

        if !self.control_tests.is_empty() {
            section(f, "Control tests")?;
            for (test, outcome) in &self.control_tests {
                write!(f, "{test} - {} {}", outcome.status, status_icon(outcome.status))?;
                if outcome.details.is_empty() {
                    writeln!(f)?;
                } else {
                    writeln!(f, " ({})", outcome.details)?;
                }
            }
        }

        if !self.resistance_changes.is_empty() {
            section(f, "Resistance changes")?;
            writeln!(
                f,
                "{} change(s), {} without a resistance command",
                self.resistance_changes.len(),
                self.automatic_change_count()
            )?;
            for change in &self.resistance_changes {
                let cause = change
                    .attributed_command
                    .map_or_else(|| "automatic".to_string(), |op| op.to_string());
                writeln!(f, "{} -> {} [{cause}]", change.old_value, change.new_value)?;
            }
        }

        if !self.issues_found.is_empty() {
            section(f, "Issues")?;
            for issue in &self.issues_found {
                writeln!(f, "⚠️ {issue}")?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{RULE}")?;
        match self.compatibility_level {
            Some(level) => writeln!(f, "Verdict: {level}")?,
            None => writeln!(f, "Verdict: not classified")?,
        }
        for reason in &self.reasons {
            writeln!(f, "💡 {reason}")?;
        }
        write!(f, "{RULE}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classifier::classify,
        protocol::ControlOpcode,
        types::{DeviceInfo, IndoorBikeData, ProtocolType},
    };

    fn sample_results() -> TestResults {
        let mut results = TestResults::new(DeviceInfo::new("id-1".into(), "YAFITS3".into()));
        results.mark_connected();
        results.set_protocol(ProtocolType::Ftms, vec![ProtocolType::Ftms, ProtocolType::Csc]);
        results.set_feature("cadence", true);
        results.set_range(
            RangeKind::Speed,
            RangeInfo {
                min: 0.0,
                max: 40.0,
                increment: 0.01,
            },
        );
        results.record_sample(&IndoorBikeData {
            cadence: Some(82.0),
            heart_rate: Some(120),
            ..Default::default()
        });
        results.set_control(ControlOpcode::SetTargetPower, CommandStatus::Failed, "timeout");
        results
    }

    #[test]
    fn test_report_sections() {
        let report = classify(sample_results()).to_string();

        assert!(report.contains("Device: YAFITS3 (id-1)"));
        assert!(report.contains("Protocol: FTMS"));
        assert!(report.contains("cadence: ✅"));
        assert!(report.contains("Speed: 0.00 - 40.00 km/h (increment 0.01 km/h)"));
        assert!(report.contains("cadence: 82 (min 82, max 82)"));
        assert!(report.contains("resistance level: not detected"));
        assert!(report.contains("heart rate: 120"));
        assert!(report.contains("SET_TARGET_POWER - FAILED ❌ (timeout)"));
        assert!(report.contains("Verdict: Partially compatible"));
        assert!(report.contains("💡 "));
    }

    #[test]
    fn test_unclassified_report() {
        let report = TestResults::new(DeviceInfo::new("x".into(), "Bike".into())).to_string();
        assert!(report.contains("Connection: ❌ failed"));
        assert!(report.contains("Protocol: none detected"));
        assert!(report.contains("Verdict: not classified"));
        assert!(!report.contains("[Control tests]"));
    }
}

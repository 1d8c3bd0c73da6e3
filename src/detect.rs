//! Protocol detection.
//!
//! Vendor name markers are checked first, in a fixed priority order, then the
//! discovered GATT services. CSC is the total fallback, so detection always
//! yields a protocol.

use tracing::debug;
use uuid::Uuid;

use crate::{types::ProtocolType, FTMS_SERVICE_UUID};

/// Name markers in priority order; first match wins
const NAME_RULES: &[(&[&str], ProtocolType)] = &[
    (&["MOB"], ProtocolType::Mobi),
    (&["XQ"], ProtocolType::Reborn),
    (&["Tac"], ProtocolType::TacxNeo),
    (&["FS-"], ProtocolType::FitShow),
    // Yafit S3 and S4 bikes speak standard FTMS
    (&["YAFITS3", "YA FIT"], ProtocolType::Ftms),
    (&["R-Q", "YAFITF1"], ProtocolType::Ftms),
];

/// Pick the protocol spoken by a device
///
/// `name` is the advertised name (possibly empty) and `services` the service
/// UUIDs discovered after connecting.
///
/// # Examples
///
/// ```
/// use bikeprobe::{detect_protocol, ProtocolType, FTMS_SERVICE_UUID};
///
/// assert_eq!(detect_protocol("XQ-Bike", &[]), ProtocolType::Reborn);
/// assert_eq!(detect_protocol("", &[FTMS_SERVICE_UUID]), ProtocolType::Ftms);
/// assert_eq!(detect_protocol("Generic", &[]), ProtocolType::Csc);
/// ```
#[must_use]
pub fn detect_protocol(name: &str, services: &[Uuid]) -> ProtocolType {
    let by_name = NAME_RULES
        .iter()
        .find(|(markers, _)| markers.iter().any(|marker| name.contains(marker)))
        .map(|(_, protocol)| *protocol);

    let protocol = by_name.unwrap_or_else(|| {
        if services.contains(&FTMS_SERVICE_UUID) {
            ProtocolType::Ftms
        } else {
            ProtocolType::Csc
        }
    });

    debug!("Detected {protocol} for '{name}' ({} services)", services.len());
    protocol
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CSC_SERVICE_UUID, MOBI_SERVICE_UUID};

    #[test]
    fn test_vendor_names() {
        assert_eq!(detect_protocol("MOBI-1234", &[]), ProtocolType::Mobi);
        assert_eq!(detect_protocol("XQ-Bike", &[]), ProtocolType::Reborn);
        assert_eq!(detect_protocol("Tacx Neo 2T", &[]), ProtocolType::TacxNeo);
        assert_eq!(detect_protocol("FS-8A1B", &[]), ProtocolType::FitShow);
    }

    #[test]
    fn test_yafit_models_use_ftms() {
        assert_eq!(detect_protocol("YAFITS3-01", &[]), ProtocolType::Ftms);
        assert_eq!(detect_protocol("YA FIT bike", &[]), ProtocolType::Ftms);
        assert_eq!(detect_protocol("R-Q 200", &[]), ProtocolType::Ftms);
        assert_eq!(detect_protocol("YAFITF1", &[CSC_SERVICE_UUID]), ProtocolType::Ftms);
    }

    #[test]
    fn test_name_beats_services() {
        // Reborn must win even though CSC is the fallback and FTMS is present
        assert_eq!(
            detect_protocol("XQ-Bike", &[FTMS_SERVICE_UUID]),
            ProtocolType::Reborn
        );
        assert_eq!(
            detect_protocol("MOB XQ", &[MOBI_SERVICE_UUID]),
            ProtocolType::Mobi
        );
    }

    #[test]
    fn test_service_fallbacks() {
        assert_eq!(
            detect_protocol("Indoor Bike", &[CSC_SERVICE_UUID, FTMS_SERVICE_UUID]),
            ProtocolType::Ftms
        );
        assert_eq!(detect_protocol("Indoor Bike", &[CSC_SERVICE_UUID]), ProtocolType::Csc);
        assert_eq!(detect_protocol("", &[]), ProtocolType::Csc);
    }

    #[test]
    fn test_markers_are_case_sensitive() {
        assert_eq!(detect_protocol("xq-bike", &[]), ProtocolType::Csc);
        assert_eq!(detect_protocol("tacx", &[]), ProtocolType::Csc);
    }

    #[test]
    fn test_detection_is_stateless() {
        assert_eq!(detect_protocol("XQ-Bike", &[]), ProtocolType::Reborn);
        assert_eq!(detect_protocol("Plain", &[FTMS_SERVICE_UUID]), ProtocolType::Ftms);
        assert_eq!(detect_protocol("Plain", &[]), ProtocolType::Csc);
    }
}

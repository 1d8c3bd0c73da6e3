//! Per-protocol frame codecs.
//!
//! Every protocol variant gets one stateless codec implementing
//! [`FrameCodec`]. Codecs are pure: bytes in, typed values out, and commands
//! out as bytes. The session picks a codec with [`codec_for`] once the
//! protocol is detected.

mod control;
pub mod csc;
pub mod ftms;
pub mod mobi;
pub mod reborn;
mod stub;

pub use control::{ControlAck, ControlCommand, ControlOpcode, ResultCode, RESPONSE_CODE};
pub use csc::CscCodec;
pub use ftms::{FrameMerger, FtmsCodec};
pub use mobi::MobiCodec;
pub use reborn::{RebornAuthenticator, RebornCodec, RebornFrame};
pub use stub::StubCodec;

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    error::{BikeError, Result},
    types::{IndoorBikeData, ProtocolType},
};

/// Encode/decode rules for one protocol variant
pub trait FrameCodec: Send + Sync {
    /// Protocol this codec speaks
    fn protocol(&self) -> ProtocolType;

    /// Service and characteristic carrying telemetry notifications
    fn telemetry_endpoint(&self) -> Option<(Uuid, Uuid)>;

    /// Service and characteristic accepting control commands
    fn control_endpoint(&self) -> Option<(Uuid, Uuid)> {
        None
    }

    /// Decode one telemetry notification
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::MalformedFrame`] when the frame fails a structural
    /// check.
    fn decode_telemetry(&self, data: &[u8]) -> Result<IndoorBikeData>;

    /// Decode one control acknowledgement notification
    ///
    /// # Errors
    ///
    /// Protocols without a control channel return
    /// [`BikeError::ProtocolUnsupported`].
    fn decode_ack(&self, _data: &[u8]) -> Result<ControlAck> {
        Err(BikeError::ProtocolUnsupported {
            protocol: self.protocol(),
            operation: "control acknowledgement".to_string(),
        })
    }

    /// Encode a control command
    ///
    /// # Errors
    ///
    /// Protocols without a control channel return
    /// [`BikeError::ProtocolUnsupported`].
    fn encode_command(&self, command: &ControlCommand) -> Result<Bytes> {
        Err(BikeError::ProtocolUnsupported {
            protocol: self.protocol(),
            operation: command.opcode().name().to_string(),
        })
    }
}

static FTMS: FtmsCodec = FtmsCodec;
static CSC: CscCodec = CscCodec;
static MOBI: MobiCodec = MobiCodec;
static REBORN: RebornCodec = RebornCodec;
static TACX_NEO: StubCodec = StubCodec(ProtocolType::TacxNeo);
static FITSHOW: StubCodec = StubCodec(ProtocolType::FitShow);

/// Codec for a protocol variant
#[must_use]
pub fn codec_for(protocol: ProtocolType) -> &'static dyn FrameCodec {
    match protocol {
        ProtocolType::Ftms => &FTMS,
        ProtocolType::Csc => &CSC,
        ProtocolType::Mobi => &MOBI,
        ProtocolType::Reborn => &REBORN,
        ProtocolType::TacxNeo => &TACX_NEO,
        ProtocolType::FitShow => &FITSHOW,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_lookup() {
        for protocol in ProtocolType::ALL {
            assert_eq!(codec_for(protocol).protocol(), protocol);
        }
    }

    #[test]
    fn test_only_ftms_encodes_commands() {
        let command = ControlCommand::SetResistanceLevel(10);
        assert!(codec_for(ProtocolType::Ftms).encode_command(&command).is_ok());

        for protocol in [ProtocolType::Csc, ProtocolType::Mobi, ProtocolType::Reborn] {
            assert!(matches!(
                codec_for(protocol).encode_command(&command),
                Err(BikeError::ProtocolUnsupported { .. })
            ));
            assert!(codec_for(protocol).control_endpoint().is_none());
        }

        assert!(matches!(
            codec_for(ProtocolType::TacxNeo).encode_command(&command),
            Err(BikeError::NotImplemented(ProtocolType::TacxNeo))
        ));
    }
}

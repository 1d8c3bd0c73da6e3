use bytes::Bytes;
use uuid::Uuid;

use super::{ControlAck, ControlCommand, FrameCodec};
use crate::{
    error::{BikeError, Result},
    types::{IndoorBikeData, ProtocolType},
};

/// Codec for protocols that are recognised but not implemented
///
/// Every operation fails fast with [`BikeError::NotImplemented`].
#[derive(Debug, Clone, Copy)]
pub struct StubCodec(pub ProtocolType);

impl FrameCodec for StubCodec {
    fn protocol(&self) -> ProtocolType {
        self.0
    }

    fn telemetry_endpoint(&self) -> Option<(Uuid, Uuid)> {
        None
    }

    fn decode_telemetry(&self, _data: &[u8]) -> Result<IndoorBikeData> {
        Err(BikeError::NotImplemented(self.0))
    }

    fn decode_ack(&self, _data: &[u8]) -> Result<ControlAck> {
        Err(BikeError::NotImplemented(self.0))
    }

    fn encode_command(&self, _command: &ControlCommand) -> Result<Bytes> {
        Err(BikeError::NotImplemented(self.0))
    }
}

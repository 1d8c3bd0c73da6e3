use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::{BikeError, Result};

/// First byte of every Control Point response frame
pub const RESPONSE_CODE: u8 = 0x80;

/// Length of a Control Point response frame
pub const RESPONSE_SIZE: usize = 3;

/// Control Point opcodes used by the compatibility test
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ControlOpcode {
    /// Take control of the machine
    RequestControl = 0x00,
    /// Reset the machine
    Reset = 0x01,
    /// Set target resistance level
    SetResistanceLevel = 0x04,
    /// Set target power (ERG)
    SetTargetPower = 0x05,
    /// Start or resume
    Start = 0x07,
    /// Stop or pause
    Stop = 0x08,
    /// Set indoor bike simulation parameters
    SetSimParams = 0x11,
}

impl ControlOpcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x04 => Some(Self::SetResistanceLevel),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::Start),
            0x08 => Some(Self::Stop),
            0x11 => Some(Self::SetSimParams),
            _ => None,
        }
    }

    /// Symbolic name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RequestControl => "REQUEST_CONTROL",
            Self::Reset => "RESET",
            Self::SetResistanceLevel => "SET_RESISTANCE_LEVEL",
            Self::SetTargetPower => "SET_TARGET_POWER",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::SetSimParams => "SET_SIM_PARAMS",
        }
    }

    /// Minimum pause after sending before another command may follow
    #[must_use]
    pub const fn min_delay(self) -> Duration {
        match self {
            Self::Reset | Self::Start | Self::Stop => Duration::from_millis(1_000),
            Self::RequestControl
            | Self::SetResistanceLevel
            | Self::SetTargetPower
            | Self::SetSimParams => Duration::from_millis(500),
        }
    }
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Control Point command
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// `[0x00]`
    RequestControl,
    /// `[0x01]`
    Reset,
    /// `[0x07]`
    Start,
    /// `[0x08]`
    Stop,
    /// `[0x04, level]`, level truncated to one byte
    SetResistanceLevel(i16),
    /// `[0x05, lo, hi]`
    SetTargetPower(i16),
    /// `[0x11, wind(i16), grade(i16), crr(u8), cw(u8)]`
    SetSimParams {
        /// Wind speed in m/s
        wind_speed: f64,
        /// Grade in percent
        grade: f64,
        /// Rolling resistance coefficient
        crr: f64,
        /// Wind resistance coefficient in kg/m
        cw: f64,
    },
}

impl ControlCommand {
    /// Simulation parameters with only a grade set
    #[must_use]
    pub const fn grade(grade: f64) -> Self {
        Self::SetSimParams {
            wind_speed: 0.0,
            grade,
            crr: 0.0,
            cw: 0.0,
        }
    }

    /// Opcode of this command
    #[must_use]
    pub const fn opcode(&self) -> ControlOpcode {
        match self {
            Self::RequestControl => ControlOpcode::RequestControl,
            Self::Reset => ControlOpcode::Reset,
            Self::Start => ControlOpcode::Start,
            Self::Stop => ControlOpcode::Stop,
            Self::SetResistanceLevel(_) => ControlOpcode::SetResistanceLevel,
            Self::SetTargetPower(_) => ControlOpcode::SetTargetPower,
            Self::SetSimParams { .. } => ControlOpcode::SetSimParams,
        }
    }

    /// Minimum pause after sending this command
    #[must_use]
    pub const fn min_delay(&self) -> Duration {
        self.opcode().min_delay()
    }

    /// Serialize the command to Control Point bytes
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(self.opcode() as u8);

        match *self {
            Self::RequestControl | Self::Reset | Self::Start | Self::Stop => {}
            Self::SetResistanceLevel(level) => buf.put_u8((level & 0xFF) as u8),
            Self::SetTargetPower(watts) => buf.put_i16_le(watts),
            Self::SetSimParams {
                wind_speed,
                grade,
                crr,
                cw,
            } => {
                // Float-to-int `as` saturates at the target bounds
                buf.put_i16_le((wind_speed * 1000.0).round() as i16);
                buf.put_i16_le((grade * 100.0).round() as i16);
                buf.put_u8((crr * 20_000.0).round() as u8);
                buf.put_u8((cw * 100.0).round() as u8);
            }
        }

        buf.freeze()
    }

    /// Parse Control Point bytes back into a command
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::MalformedFrame`] for unknown opcodes or short payloads.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(BikeError::MalformedFrame("empty command".to_string()));
        }

        let op = buf.get_u8();
        let opcode = ControlOpcode::from_u8(op)
            .ok_or_else(|| BikeError::MalformedFrame(format!("unknown opcode 0x{op:02X}")))?;

        let needed = match opcode {
            ControlOpcode::SetResistanceLevel => 1,
            ControlOpcode::SetTargetPower => 2,
            ControlOpcode::SetSimParams => 6,
            _ => 0,
        };
        if buf.remaining() < needed {
            return Err(BikeError::MalformedFrame(format!(
                "{opcode} payload too short: {} bytes, expected {needed}",
                buf.remaining()
            )));
        }

        Ok(match opcode {
            ControlOpcode::RequestControl => Self::RequestControl,
            ControlOpcode::Reset => Self::Reset,
            ControlOpcode::Start => Self::Start,
            ControlOpcode::Stop => Self::Stop,
            ControlOpcode::SetResistanceLevel => Self::SetResistanceLevel(i16::from(buf.get_u8())),
            ControlOpcode::SetTargetPower => Self::SetTargetPower(buf.get_i16_le()),
            ControlOpcode::SetSimParams => Self::SetSimParams {
                wind_speed: f64::from(buf.get_i16_le()) / 1000.0,
                grade: f64::from(buf.get_i16_le()) / 100.0,
                crr: f64::from(buf.get_u8()) / 20_000.0,
                cw: f64::from(buf.get_u8()) / 100.0,
            },
        })
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetResistanceLevel(level) => write!(f, "SET_RESISTANCE_LEVEL({level})"),
            Self::SetTargetPower(watts) => write!(f, "SET_TARGET_POWER({watts}W)"),
            Self::SetSimParams { grade, .. } => write!(f, "SET_SIM_PARAMS(grade={grade}%)"),
            other => f.write_str(other.opcode().name()),
        }
    }
}

/// Control Point result code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// 0x01
    Success,
    /// 0x02
    OpCodeNotSupported,
    /// 0x03
    InvalidParameter,
    /// 0x04
    OperationFailed,
    /// 0x05
    ControlNotPermitted,
    /// Any other value
    Unknown(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }
}

impl ResultCode {
    /// Whether the device accepted the command
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::OpCodeNotSupported => write!(f, "OP_CODE_NOT_SUPPORTED"),
            Self::InvalidParameter => write!(f, "INVALID_PARAMETER"),
            Self::OperationFailed => write!(f, "OPERATION_FAILED"),
            Self::ControlNotPermitted => write!(f, "CONTROL_NOT_PERMITTED"),
            Self::Unknown(code) => write!(f, "unknown result 0x{code:02X}"),
        }
    }
}

/// Control Point acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
    /// Echoed request opcode byte
    pub request_opcode: u8,
    /// Result reported by the device
    pub result: ResultCode,
}

impl ControlAck {
    /// Parse a 3-byte response frame
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::MalformedFrame`] if the frame is short or does not
    /// start with the response code.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RESPONSE_SIZE {
            return Err(BikeError::MalformedFrame(format!(
                "Control Point response too short: {} bytes, expected {RESPONSE_SIZE}",
                data.len()
            )));
        }

        if data[0] != RESPONSE_CODE {
            return Err(BikeError::MalformedFrame(format!(
                "Control Point response code 0x{:02X}, expected 0x{RESPONSE_CODE:02X}",
                data[0]
            )));
        }

        Ok(Self {
            request_opcode: data[1],
            result: ResultCode::from(data[2]),
        })
    }

    /// Serialize to a response frame
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RESPONSE_SIZE] {
        let result = match self.result {
            ResultCode::Success => 0x01,
            ResultCode::OpCodeNotSupported => 0x02,
            ResultCode::InvalidParameter => 0x03,
            ResultCode::OperationFailed => 0x04,
            ResultCode::ControlNotPermitted => 0x05,
            ResultCode::Unknown(code) => code,
        };
        [RESPONSE_CODE, self.request_opcode, result]
    }

    /// Known opcode this acknowledges, if any
    #[must_use]
    pub const fn opcode(&self) -> Option<ControlOpcode> {
        ControlOpcode::from_u8(self.request_opcode)
    }

    /// Symbolic opcode label
    #[must_use]
    pub fn opcode_label(&self) -> String {
        self.opcode().map_or_else(
            || format!("unknown opcode 0x{:02X}", self.request_opcode),
            |op| op.name().to_string(),
        )
    }
}

impl fmt::Display for ControlAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.opcode_label(), self.result)
    }
}

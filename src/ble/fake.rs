//! Scripted in-memory transport for session and orchestrator tests.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use super::{BleTransport, NotificationStream};
use crate::{
    error::{BikeError, Result},
    protocol::{
        ftms::encode_indoor_bike_data,
        reborn::{RebornAuthenticator, ACCEPT_FRAME, REQUEST_SIZE, TELEMETRY_SIZE},
        ControlAck, ControlCommand, ControlOpcode, ResultCode,
    },
    types::{DeviceInfo, IndoorBikeData},
    FTMS_CONTROL_POINT_CHAR_UUID, FTMS_INDOOR_BIKE_DATA_CHAR_UUID, FTMS_SERVICE_UUID,
    REBORN_DATA_CHAR_UUID, REBORN_SERVICE_UUID, REBORN_WRITE_CHAR_UUID,
};

pub(crate) const FAKE_ID: &str = "fake-0";

/// How the fake Reborn bike answers a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RebornReply {
    Correct,
    Wrong,
    AuthError,
    Silent,
}

/// Behaviour of the fake bike
#[derive(Debug, Clone)]
pub(crate) struct FakeConfig {
    pub name: String,
    pub services: Vec<Uuid>,
    pub connect_error: bool,
    /// Characteristic values returned by reads; missing ones fail
    pub reads: HashMap<Uuid, Vec<u8>>,
    /// Cadence carried by every FTMS telemetry frame
    pub cadence: Option<f64>,
    /// Whether FTMS telemetry frames carry the resistance level
    pub report_resistance: bool,
    pub start_resistance: i16,
    /// Resistance tracks SET_RESISTANCE_LEVEL; other resistance commands add one step
    pub resistance_follows: bool,
    /// Unprompted resistance steps emitted right after START
    pub automatic_changes_on_start: usize,
    /// Result code per opcode; unlisted opcodes succeed
    pub ack_results: HashMap<u8, u8>,
    /// Drop the link when this opcode is written
    pub drop_link_on: Option<ControlOpcode>,
    pub reborn_reply: RebornReply,
    /// Frames sent on the Reborn data characteristic after acceptance
    pub reborn_frames: Vec<Vec<u8>>,
    /// Frames sent right after subscribing, keyed by characteristic
    pub on_subscribe: HashMap<Uuid, Vec<Vec<u8>>>,
}

impl FakeConfig {
    pub(crate) fn ftms(name: &str) -> Self {
        Self {
            name: name.to_string(),
            services: vec![FTMS_SERVICE_UUID],
            connect_error: false,
            reads: HashMap::new(),
            cadence: Some(80.0),
            report_resistance: true,
            start_resistance: 1,
            resistance_follows: true,
            automatic_changes_on_start: 0,
            ack_results: HashMap::new(),
            drop_link_on: None,
            reborn_reply: RebornReply::Correct,
            reborn_frames: Vec::new(),
            on_subscribe: HashMap::new(),
        }
    }

    pub(crate) fn reborn(name: &str) -> Self {
        Self {
            services: vec![REBORN_SERVICE_UUID],
            reborn_frames: vec![reborn_telemetry(75, 50)],
            ..Self::ftms(name)
        }
    }

    pub(crate) fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }
}

/// A Reborn telemetry frame with the given period byte and raw gear
pub(crate) fn reborn_telemetry(period: u8, gear: u8) -> Vec<u8> {
    let mut data = vec![0u8; TELEMETRY_SIZE];
    data[0] = 0xAA;
    data[1] = 0x10;
    data[3] = 0x80;
    data[11] = period;
    data[14] = gear;
    data
}

#[derive(Debug, Default)]
struct FakeState {
    connected: bool,
    resistance: i16,
    senders: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    writes: Vec<(Uuid, Vec<u8>)>,
    control_times: Vec<(ControlOpcode, Instant)>,
    unsubscribed: Vec<Uuid>,
    disconnect_calls: usize,
}

pub(crate) struct FakeTransport {
    config: FakeConfig,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub(crate) fn new(config: FakeConfig) -> Self {
        let state = FakeState {
            resistance: config.start_resistance,
            ..Default::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub(crate) fn device(&self) -> DeviceInfo {
        DeviceInfo {
            advertised_services: self.config.services.clone(),
            ..DeviceInfo::new(FAKE_ID.to_string(), self.config.name.clone())
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state().writes.clone()
    }

    /// Opcodes written to the Control Point, in order
    pub(crate) fn control_writes(&self) -> Vec<ControlOpcode> {
        self.writes()
            .into_iter()
            .filter(|(chr, _)| *chr == FTMS_CONTROL_POINT_CHAR_UUID)
            .filter_map(|(_, data)| ControlOpcode::from_u8(*data.first()?))
            .collect()
    }

    /// Control writes with the instant each one arrived
    pub(crate) fn control_write_times(&self) -> Vec<(ControlOpcode, Instant)> {
        self.state().control_times.clone()
    }

    pub(crate) fn unsubscribed(&self) -> Vec<Uuid> {
        self.state().unsubscribed.clone()
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.state().disconnect_calls
    }

    /// Push a raw notification on a subscribed characteristic
    pub(crate) fn notify(&self, characteristic: Uuid, data: Vec<u8>) {
        Self::push(&self.state(), characteristic, data);
    }

    /// Simulate the link dropping: every stream ends
    pub(crate) fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        state.senders.clear();
    }

    fn push(state: &FakeState, characteristic: Uuid, data: Vec<u8>) {
        if let Some(sender) = state.senders.get(&characteristic) {
            let _ = sender.send(data);
        }
    }

    fn telemetry_frame(&self, resistance: i16) -> Vec<u8> {
        let sample = IndoorBikeData {
            speed: Some(25.0),
            cadence: self.config.cadence,
            resistance_level: self.config.report_resistance.then_some(resistance),
            power: Some(120),
            ..Default::default()
        };
        encode_indoor_bike_data(&sample).to_vec()
    }

    fn handle_control_write(&self, state: &mut FakeState, data: &[u8]) -> Result<()> {
        let command = ControlCommand::from_bytes(data)?;
        let opcode = command.opcode();
        state.control_times.push((opcode, Instant::now()));

        if self.config.drop_link_on == Some(opcode) {
            state.connected = false;
            state.senders.clear();
            return Err(BikeError::Transport("link lost".to_string()));
        }

        let result = ResultCode::from(
            self.config
                .ack_results
                .get(&(opcode as u8))
                .copied()
                .unwrap_or(0x01),
        );
        let ack = ControlAck {
            request_opcode: opcode as u8,
            result,
        };
        Self::push(state, FTMS_CONTROL_POINT_CHAR_UUID, ack.to_bytes().to_vec());

        if result.is_success() && self.config.resistance_follows {
            match command {
                ControlCommand::SetResistanceLevel(level) => state.resistance = level,
                ControlCommand::SetTargetPower(_) | ControlCommand::SetSimParams { .. } => {
                    state.resistance += 1;
                }
                _ => {}
            }
        }

        if result.is_success() && command == ControlCommand::Start {
            for _ in 0..self.config.automatic_changes_on_start {
                state.resistance += 1;
                let frame = self.telemetry_frame(state.resistance);
                Self::push(state, FTMS_INDOOR_BIKE_DATA_CHAR_UUID, frame);
            }
        }

        let frame = self.telemetry_frame(state.resistance);
        Self::push(state, FTMS_INDOOR_BIKE_DATA_CHAR_UUID, frame);
        Ok(())
    }

    fn handle_reborn_write(&self, state: &FakeState, data: &[u8]) {
        if data.len() == REQUEST_SIZE {
            let mut random = [0u8; 10];
            random.copy_from_slice(&data[4..14]);
            let mut expected = RebornAuthenticator::with_random(random).expected_response();

            let reply = match self.config.reborn_reply {
                RebornReply::Silent => return,
                RebornReply::AuthError => vec![0xAA, 0x06, 0x80, 0xE1, 0x01, 0x12],
                RebornReply::Correct | RebornReply::Wrong => {
                    if self.config.reborn_reply == RebornReply::Wrong {
                        expected[0] ^= 0xFF;
                    }
                    let mut reply = vec![0xAA, 0x0A, 0x8A, 0x03];
                    reply.extend_from_slice(&expected);
                    reply
                }
            };
            Self::push(state, REBORN_DATA_CHAR_UUID, reply);
        } else if data == ACCEPT_FRAME {
            for frame in &self.config.reborn_frames {
                Self::push(state, REBORN_DATA_CHAR_UUID, frame.clone());
            }
        }
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn scan(&self, _services: &[Uuid], _duration: Duration) -> Result<Vec<DeviceInfo>> {
        Ok(vec![self.device()])
    }

    async fn connect(&self, device_id: &str, _timeout: Duration) -> Result<()> {
        if device_id != FAKE_ID {
            return Err(BikeError::DeviceNotFound(device_id.to_string()));
        }
        if self.config.connect_error {
            return Err(BikeError::ConnectionFailed("scripted failure".to_string()));
        }
        self.state().connected = true;
        Ok(())
    }

    async fn discover_services(&self, _device_id: &str) -> Result<Vec<Uuid>> {
        Ok(self.config.services.clone())
    }

    async fn read_characteristic(
        &self,
        _device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        self.config
            .reads
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| BikeError::Transport(format!("read of {characteristic} failed")))
    }

    async fn write_characteristic(
        &self,
        _device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(BikeError::Transport("not connected".to_string()));
        }
        state.writes.push((characteristic, data.to_vec()));

        if characteristic == FTMS_CONTROL_POINT_CHAR_UUID {
            self.handle_control_write(&mut state, data)?;
        } else if characteristic == REBORN_WRITE_CHAR_UUID {
            self.handle_reborn_write(&state, data);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let mut state = self.state();
        if !state.connected {
            return Err(BikeError::Transport("not connected".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.senders.insert(characteristic, sender);

        if characteristic == FTMS_INDOOR_BIKE_DATA_CHAR_UUID {
            let frame = self.telemetry_frame(state.resistance);
            Self::push(&state, characteristic, frame);
        }
        if let Some(frames) = self.config.on_subscribe.get(&characteristic) {
            for frame in frames {
                Self::push(&state, characteristic, frame.clone());
            }
        }
        Ok(receiver)
    }

    async fn unsubscribe(
        &self,
        _device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let mut state = self.state();
        state.unsubscribed.push(characteristic);
        if state.senders.remove(&characteristic).is_none() {
            return Err(BikeError::Transport("not subscribed".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self, _device_id: &str) -> Result<()> {
        let mut state = self.state();
        state.disconnect_calls += 1;
        state.senders.clear();
        if !state.connected {
            return Err(BikeError::AlreadyDisconnected);
        }
        state.connected = false;
        Ok(())
    }

    async fn is_connected(&self, _device_id: &str) -> bool {
        self.state().connected
    }
}

use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ble::{BleTransport, NotificationStream},
    detect::detect_protocol,
    error::{BikeError, Result},
    protocol::{
        codec_for,
        ftms::{parse_machine_features, parse_range},
        reborn::{RebornAuthenticator, RebornFrame, ACCEPT_FRAME, REJECT_FRAME},
        ControlAck, ControlCommand, ControlOpcode, FrameCodec, FrameMerger,
    },
    types::{
        ConnectionParams, DeviceInfo, IndoorBikeData, MachineFeatures, ProtocolType, RangeInfo,
        RangeKind,
    },
    CSC_SERVICE_UUID, FTMS_FEATURE_CHAR_UUID, FTMS_INCLINE_RANGE_CHAR_UUID,
    FTMS_POWER_RANGE_CHAR_UUID, FTMS_RESISTANCE_RANGE_CHAR_UUID, FTMS_SERVICE_UUID,
    FTMS_SPEED_RANGE_CHAR_UUID, REBORN_SERVICE_UUID, REBORN_WRITE_CHAR_UUID,
};

/// Lifecycle of a [`DeviceSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device
    Disconnected,
    /// Link being established
    Connecting,
    /// Link up, protocol not yet known
    Connected,
    /// Protocol bound, notifications not yet flowing
    ProtocolDetected,
    /// Reborn handshake in progress
    Authenticating,
    /// Notifications flowing, device not started
    Ready,
    /// Device started (or read-only and streaming)
    Active,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ProtocolDetected => "protocol detected",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Active => "active",
        };
        f.write_str(name)
    }
}

/// Structured session log entry
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLog {
    /// State transition
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// Protocol bound to the session
    ProtocolDetected {
        /// Detected protocol
        protocol: ProtocolType,
        /// Every protocol whose service was discovered
        supported: Vec<ProtocolType>,
    },
    /// Control command written
    CommandSent {
        /// Command
        command: ControlCommand,
        /// Encoded bytes
        bytes: Vec<u8>,
    },
    /// Control acknowledgement received
    AckReceived(ControlAck),
    /// Notification dropped because it failed to decode
    MalformedFrame {
        /// Characteristic the frame arrived on
        characteristic: Uuid,
        /// Decode error
        reason: String,
        /// Raw payload
        raw: Vec<u8>,
    },
    /// Reborn authentication outcome
    Authentication {
        /// Whether the device was accepted
        accepted: bool,
        /// Human-readable detail
        detail: String,
    },
    /// Notifications enabled on a characteristic
    Subscribed(Uuid),
    /// Notifications disabled on a characteristic
    Unsubscribed(Uuid),
    /// Session torn down
    Disconnected {
        /// Transport id of the device
        device_id: String,
    },
}

/// Destination for [`SessionLog`] entries
pub trait LogSink: Send + Sync {
    /// Record one entry
    fn log(&self, entry: SessionLog);
}

/// Sink that forwards every entry to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, entry: SessionLog) {
        match entry {
            SessionLog::StateChanged { from, to } => debug!("Session state: {from} -> {to}"),
            SessionLog::ProtocolDetected {
                protocol,
                supported,
            } => info!("Protocol detected: {protocol} (services for {supported:?})"),
            SessionLog::CommandSent { command, bytes } => {
                info!("Sent {command}: {bytes:02X?}");
            }
            SessionLog::AckReceived(ack) => {
                if ack.result.is_success() {
                    info!("Control Point: {ack}");
                } else {
                    warn!("Control Point: {ack}");
                }
            }
            SessionLog::MalformedFrame {
                characteristic,
                reason,
                raw,
            } => warn!("Dropped frame on {characteristic}: {reason} {raw:02X?}"),
            SessionLog::Authentication { accepted, detail } => {
                if accepted {
                    info!("Authentication accepted: {detail}");
                } else {
                    error!("Authentication failed: {detail}");
                }
            }
            SessionLog::Subscribed(characteristic) => debug!("Subscribed to {characteristic}"),
            SessionLog::Unsubscribed(characteristic) => {
                debug!("Unsubscribed from {characteristic}");
            }
            SessionLog::Disconnected { device_id } => info!("Session closed for {device_id}"),
        }
    }
}

impl LogSink for mpsc::UnboundedSender<SessionLog> {
    fn log(&self, entry: SessionLog) {
        let _ = self.send(entry);
    }
}

/// Decoded notification delivered by [`DeviceSession::next_event`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Telemetry sample
    Telemetry(IndoorBikeData),
    /// Control Point acknowledgement
    ControlAck(ControlAck),
    /// The device signalled an authentication error; reconnect required
    AuthenticationRejected,
    /// A notification stream ended, usually because the link dropped
    StreamClosed(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Telemetry,
    Control,
}

/// One notification subscription and the task decoding it
struct Subscription {
    service: Uuid,
    characteristic: Uuid,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Subscription {
    fn spawn(
        codec: &'static dyn FrameCodec,
        channel: Channel,
        (service, characteristic): (Uuid, Uuid),
        mut stream: NotificationStream,
        events: mpsc::UnboundedSender<SessionEvent>,
        sink: Arc<dyn LogSink>,
        merge: bool,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut merger = merge.then(FrameMerger::new);
            let mut closed = false;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    frame = stream.recv() => {
                        let Some(data) = frame else {
                            closed = true;
                            break;
                        };
                        let event = decode(codec, channel, characteristic, &data, &*sink);
                        let event = match (event, merger.as_mut()) {
                            (Some(SessionEvent::Telemetry(sample)), Some(merger)) => {
                                merger.push(sample).map(SessionEvent::Telemetry)
                            }
                            (event, _) => event,
                        };
                        if let Some(event) = event {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            if let Some(sample) = merger.as_mut().and_then(FrameMerger::flush) {
                let _ = events.send(SessionEvent::Telemetry(sample));
            }
            if closed {
                let _ = events.send(SessionEvent::StreamClosed(characteristic));
            }
        });

        Self {
            service,
            characteristic,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Stop the decode task and wait for it to flush
    async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn decode(
    codec: &dyn FrameCodec,
    channel: Channel,
    characteristic: Uuid,
    data: &[u8],
    sink: &dyn LogSink,
) -> Option<SessionEvent> {
    let decoded = match channel {
        Channel::Telemetry => codec.decode_telemetry(data).map(SessionEvent::Telemetry),
        Channel::Control => codec.decode_ack(data).map(SessionEvent::ControlAck),
    };

    match decoded {
        Ok(event) => Some(event),
        Err(BikeError::AuthenticationRejectedByDevice) => {
            sink.log(SessionLog::Authentication {
                accepted: false,
                detail: "device signalled an authentication error".to_string(),
            });
            Some(SessionEvent::AuthenticationRejected)
        }
        Err(e) => {
            sink.log(SessionLog::MalformedFrame {
                characteristic,
                reason: e.to_string(),
                raw: data.to_vec(),
            });
            None
        }
    }
}

const fn range_characteristic(kind: RangeKind) -> Uuid {
    match kind {
        RangeKind::Speed => FTMS_SPEED_RANGE_CHAR_UUID,
        RangeKind::Incline => FTMS_INCLINE_RANGE_CHAR_UUID,
        RangeKind::Resistance => FTMS_RESISTANCE_RANGE_CHAR_UUID,
        RangeKind::Power => FTMS_POWER_RANGE_CHAR_UUID,
    }
}

/// Connection to one indoor bike
///
/// A session owns the single device link: which protocol the bike speaks,
/// its FTMS feature bitmask, whether it has been started, and the
/// notification subscriptions. Decoded notifications are pulled with
/// [`next_event`](Self::next_event) by one consumer task, which keeps command
/// dispatch and telemetry handling serialized.
///
/// # Lifecycle
///
/// ```text
/// Disconnected -> Connecting -> Connected -> ProtocolDetected
///     -> (Authenticating, Reborn only) -> Ready <-> Active -> Disconnected
/// ```
///
/// # Examples
///
/// ```no_run
/// use bikeprobe::{
///     BtleplugTransport, ConnectionParams, ControlCommand, DeviceSession, SessionEvent,
///     TracingSink,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let params = ConnectionParams::default();
///     let transport = Arc::new(BtleplugTransport::new().await?);
///     let device = transport.scan_for_bikes(&params).await?.remove(0);
///
///     let mut session = DeviceSession::new(transport, params, Arc::new(TracingSink));
///     session.connect(&device).await?;
///     let protocol = session.discover_protocol().await?;
///     println!("{} speaks {protocol}", device.name);
///
///     session.subscribe_notifications().await?;
///     if protocol.supports_control() {
///         session.send_command(ControlCommand::RequestControl).await?;
///     }
///
///     while let Some(event) = session.next_event().await {
///         if let SessionEvent::Telemetry(sample) = event {
///             println!("cadence: {:?}", sample.cadence);
///             break;
///         }
///     }
///
///     session.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct DeviceSession<T: BleTransport> {
    transport: Arc<T>,
    params: ConnectionParams,
    sink: Arc<dyn LogSink>,
    state: SessionState,
    device: Option<DeviceInfo>,
    protocol: Option<ProtocolType>,
    services: Vec<Uuid>,
    features: Option<MachineFeatures>,
    is_active: bool,
    subscriptions: Vec<Subscription>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<T: BleTransport> DeviceSession<T> {
    /// Create a disconnected session
    #[must_use]
    pub fn new(transport: Arc<T>, params: ConnectionParams, sink: Arc<dyn LogSink>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            params,
            sink,
            state: SessionState::Disconnected,
            device: None,
            protocol: None,
            services: Vec::new(),
            features: None,
            is_active: false,
            subscriptions: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Protocol bound after detection
    #[must_use]
    pub const fn protocol(&self) -> Option<ProtocolType> {
        self.protocol
    }

    /// Connected device
    #[must_use]
    pub const fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Service UUIDs discovered on the device
    #[must_use]
    pub fn services(&self) -> &[Uuid] {
        &self.services
    }

    /// Every protocol whose service was discovered
    #[must_use]
    pub fn supported_protocols(&self) -> Vec<ProtocolType> {
        ProtocolType::advertised_in(&self.services)
    }

    /// Whether the CSC service was discovered
    #[must_use]
    pub fn has_csc_service(&self) -> bool {
        self.services.contains(&CSC_SERVICE_UUID)
    }

    /// FTMS feature bitmask, once read
    #[must_use]
    pub const fn features(&self) -> Option<MachineFeatures> {
        self.features
    }

    /// Whether the device has been started
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    /// Whether a link is up
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Disconnected | SessionState::Connecting
        )
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state != to {
            self.sink.log(SessionLog::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    fn device_id(&self) -> Result<String> {
        self.device
            .as_ref()
            .map(|device| device.id.clone())
            .ok_or(BikeError::NotConnected)
    }

    fn require_ftms(&self, operation: &str) -> Result<()> {
        match self.protocol {
            Some(ProtocolType::Ftms) => Ok(()),
            Some(protocol) => Err(BikeError::ProtocolUnsupported {
                protocol,
                operation: operation.to_string(),
            }),
            None if self.is_connected() => Err(BikeError::InvalidState {
                state: self.state.to_string(),
            }),
            None => Err(BikeError::NotConnected),
        }
    }

    /// Connect to a device
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::InvalidState`] if the session already has a device,
    /// or the transport's error if the link cannot be established. The session
    /// is back in [`SessionState::Disconnected`] after a failure.
    pub async fn connect(&mut self, device: &DeviceInfo) -> Result<()> {
        if self.device.is_some() {
            return Err(BikeError::InvalidState {
                state: self.state.to_string(),
            });
        }

        info!("Connecting to {} ({})", device.name, device.id);
        while self.events_rx.try_recv().is_ok() {}
        self.set_state(SessionState::Connecting);

        let connect_timeout = Duration::from_millis(self.params.connect_timeout_ms);
        if let Err(e) = self.transport.connect(&device.id, connect_timeout).await {
            error!("Connection to {} failed: {e}", device.name);
            self.set_state(SessionState::Disconnected);
            return Err(e);
        }

        self.device = Some(device.clone());
        self.set_state(SessionState::Connected);
        Ok(())
    }

    /// Discover services and bind the protocol
    ///
    /// Detection starts from scratch on every call, so a reconnect never
    /// inherits a previous match.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::NotConnected`] without a device, or the transport's
    /// error if discovery fails.
    pub async fn discover_protocol(&mut self) -> Result<ProtocolType> {
        let device_id = self.device_id()?;
        let name = self
            .device
            .as_ref()
            .map(|device| device.name.clone())
            .unwrap_or_default();

        self.protocol = None;
        self.features = None;
        self.services = self.transport.discover_services(&device_id).await?;

        let protocol = detect_protocol(&name, &self.services);
        self.protocol = Some(protocol);
        self.sink.log(SessionLog::ProtocolDetected {
            protocol,
            supported: self.supported_protocols(),
        });
        self.set_state(SessionState::ProtocolDetected);
        Ok(protocol)
    }

    /// Read the FTMS feature bitmask
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::ProtocolUnsupported`] for non-FTMS protocols,
    /// [`BikeError::MalformedFrame`] for a short value, or the transport's error.
    pub async fn read_features(&mut self) -> Result<MachineFeatures> {
        self.require_ftms("feature read")?;
        let device_id = self.device_id()?;

        let data = self
            .transport
            .read_characteristic(&device_id, FTMS_SERVICE_UUID, FTMS_FEATURE_CHAR_UUID)
            .await?;
        let features = MachineFeatures(parse_machine_features(&data)?);
        info!("Machine features: {:?}", features.supported());

        self.features = Some(features);
        Ok(features)
    }

    /// Read one FTMS supported-range characteristic
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::ProtocolUnsupported`] for non-FTMS protocols,
    /// [`BikeError::MalformedFrame`] for a short value, or the transport's error.
    pub async fn read_range(&self, kind: RangeKind) -> Result<RangeInfo> {
        self.require_ftms("range read")?;
        let device_id = self.device_id()?;

        let data = self
            .transport
            .read_characteristic(&device_id, FTMS_SERVICE_UUID, range_characteristic(kind))
            .await?;
        parse_range(kind, &data)
    }

    /// Enable telemetry and control notifications
    ///
    /// Reborn bikes are authenticated first. Read-only protocols become active
    /// immediately since they have no start command.
    ///
    /// # Errors
    ///
    /// - [`BikeError::NotImplemented`] for stubbed protocols
    /// - [`BikeError::AuthenticationFailed`] or
    ///   [`BikeError::AuthenticationRejectedByDevice`] if the Reborn handshake fails
    /// - [`BikeError::Timeout`] if the Reborn bike never answers
    /// - the transport's error if subscribing fails
    pub async fn subscribe_notifications(&mut self) -> Result<()> {
        let device_id = self.device_id()?;
        let protocol = self.protocol.ok_or_else(|| BikeError::InvalidState {
            state: self.state.to_string(),
        })?;
        if !protocol.is_implemented() {
            return Err(BikeError::NotImplemented(protocol));
        }
        if !self.subscriptions.is_empty() {
            return Ok(());
        }

        let codec = codec_for(protocol);
        let telemetry = codec
            .telemetry_endpoint()
            .ok_or(BikeError::NotImplemented(protocol))?;

        let mut stream = self
            .transport
            .subscribe(&device_id, telemetry.0, telemetry.1)
            .await?;

        if protocol == ProtocolType::Reborn {
            if let Err(e) = self.authenticate(&device_id, &mut stream).await {
                if let Err(unsub) = self
                    .transport
                    .unsubscribe(&device_id, telemetry.0, telemetry.1)
                    .await
                {
                    debug!("Unsubscribe after failed authentication: {unsub}");
                }
                self.set_state(SessionState::ProtocolDetected);
                return Err(e);
            }
        }

        let merge = self.params.merge_split_frames && protocol == ProtocolType::Ftms;
        self.subscriptions.push(Subscription::spawn(
            codec,
            Channel::Telemetry,
            telemetry,
            stream,
            self.events_tx.clone(),
            self.sink.clone(),
            merge,
        ));
        self.sink.log(SessionLog::Subscribed(telemetry.1));

        if let Some(control) = codec.control_endpoint() {
            let stream = self
                .transport
                .subscribe(&device_id, control.0, control.1)
                .await?;
            self.subscriptions.push(Subscription::spawn(
                codec,
                Channel::Control,
                control,
                stream,
                self.events_tx.clone(),
                self.sink.clone(),
                false,
            ));
            self.sink.log(SessionLog::Subscribed(control.1));
        }

        if protocol.is_read_only() {
            self.is_active = true;
            self.set_state(SessionState::Active);
        } else {
            self.set_state(SessionState::Ready);
        }
        Ok(())
    }

    /// Run the Reborn challenge-response handshake on the data stream
    async fn authenticate(
        &mut self,
        device_id: &str,
        stream: &mut NotificationStream,
    ) -> Result<()> {
        info!("Starting Reborn challenge-response authentication");
        self.set_state(SessionState::Authenticating);

        let authenticator = RebornAuthenticator::new();
        self.transport
            .write_characteristic(
                device_id,
                REBORN_SERVICE_UUID,
                REBORN_WRITE_CHAR_UUID,
                authenticator.request_frame(),
            )
            .await?;

        let timeout_ms = self.params.auth_timeout_ms;
        let reply = timeout(Duration::from_millis(timeout_ms), async {
            while let Some(frame) = stream.recv().await {
                match RebornFrame::classify(&frame) {
                    RebornFrame::AuthReply | RebornFrame::AuthError => return Some(frame),
                    _ => debug!("Ignoring frame during authentication: {frame:02X?}"),
                }
            }
            None
        })
        .await
        .map_err(|_| BikeError::Timeout { timeout_ms })?
        .ok_or(BikeError::NotConnected)?;

        if RebornFrame::classify(&reply) == RebornFrame::AuthError {
            self.sink.log(SessionLog::Authentication {
                accepted: false,
                detail: "device signalled an authentication error".to_string(),
            });
            return Err(BikeError::AuthenticationRejectedByDevice);
        }

        match authenticator.verify(&reply) {
            Ok(()) => {
                self.transport
                    .write_characteristic(
                        device_id,
                        REBORN_SERVICE_UUID,
                        REBORN_WRITE_CHAR_UUID,
                        &ACCEPT_FRAME,
                    )
                    .await?;
                self.sink.log(SessionLog::Authentication {
                    accepted: true,
                    detail: "challenge response matched".to_string(),
                });
                Ok(())
            }
            Err(e) => {
                if let Err(write_err) = self
                    .transport
                    .write_characteristic(
                        device_id,
                        REBORN_SERVICE_UUID,
                        REBORN_WRITE_CHAR_UUID,
                        &REJECT_FRAME,
                    )
                    .await
                {
                    warn!("Failed to send reject frame: {write_err}");
                }
                self.sink.log(SessionLog::Authentication {
                    accepted: false,
                    detail: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Write a control command
    ///
    /// Only the write happens here; the acknowledgement arrives later through
    /// [`next_event`](Self::next_event). Callers are expected to respect
    /// [`ControlCommand::min_delay`] between commands.
    ///
    /// # Errors
    ///
    /// - [`BikeError::NotConnected`] without a device
    /// - [`BikeError::ProtocolUnsupported`] for protocols without control
    /// - [`BikeError::NotImplemented`] for stubbed protocols
    /// - [`BikeError::InvalidState`] before notifications are enabled
    /// - the transport's error if the write fails
    pub async fn send_command(&mut self, command: ControlCommand) -> Result<()> {
        if !self.is_connected() {
            return Err(BikeError::NotConnected);
        }
        let device_id = self.device_id()?;
        let protocol = self.protocol.ok_or_else(|| BikeError::InvalidState {
            state: self.state.to_string(),
        })?;

        let codec = codec_for(protocol);
        let bytes = codec.encode_command(&command)?;
        let (service, characteristic) =
            codec
                .control_endpoint()
                .ok_or_else(|| BikeError::ProtocolUnsupported {
                    protocol,
                    operation: command.opcode().name().to_string(),
                })?;

        if !matches!(self.state, SessionState::Ready | SessionState::Active) {
            return Err(BikeError::InvalidState {
                state: format!("{} (notifications not enabled)", self.state),
            });
        }

        self.transport
            .write_characteristic(&device_id, service, characteristic, &bytes)
            .await?;
        self.sink.log(SessionLog::CommandSent {
            command,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    /// Wait for the next decoded notification
    ///
    /// Cancel-safe: dropping the future before it completes loses nothing.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.events_rx.recv().await?;
        self.apply(&event);
        Some(event)
    }

    fn apply(&mut self, event: &SessionEvent) {
        let SessionEvent::ControlAck(ack) = event else {
            return;
        };
        self.sink.log(SessionLog::AckReceived(*ack));

        if !ack.result.is_success()
            || !matches!(self.state, SessionState::Ready | SessionState::Active)
        {
            return;
        }
        match ack.opcode() {
            Some(ControlOpcode::Start) => {
                self.is_active = true;
                self.set_state(SessionState::Active);
            }
            Some(ControlOpcode::Stop) => {
                self.is_active = false;
                self.set_state(SessionState::Ready);
            }
            _ => {}
        }
    }

    async fn release_subscriptions(&mut self, device_id: &str) {
        for subscription in std::mem::take(&mut self.subscriptions) {
            if let Err(e) = self
                .transport
                .unsubscribe(device_id, subscription.service, subscription.characteristic)
                .await
            {
                warn!(
                    "Failed to unsubscribe from {}: {e}",
                    subscription.characteristic
                );
            }
            let characteristic = subscription.characteristic;
            subscription.close().await;
            self.sink.log(SessionLog::Unsubscribed(characteristic));
        }
    }

    /// Disconnect and clear all device state
    ///
    /// Subscriptions are released and protocol, features and active flag are
    /// cleared even when the transport fails. A transport reporting the device
    /// as already disconnected is not an error.
    ///
    /// # Errors
    ///
    /// Returns the transport's error for any other disconnect failure.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        info!("Disconnecting from {}", device.name);

        self.release_subscriptions(&device.id).await;
        self.protocol = None;
        self.features = None;
        self.services.clear();
        self.is_active = false;
        self.set_state(SessionState::Disconnected);

        let result = match self.transport.disconnect(&device.id).await {
            Err(BikeError::AlreadyDisconnected) => {
                debug!("{} was already disconnected", device.name);
                Ok(())
            }
            other => other,
        };

        self.sink.log(SessionLog::Disconnected {
            device_id: device.id,
        });
        result
    }
}

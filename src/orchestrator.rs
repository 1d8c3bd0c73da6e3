//! Scripted compatibility test.
//!
//! [`TestOrchestrator::run`] drives one [`DeviceSession`] through a fixed
//! script and accumulates [`TestResults`]. A single loop owns both command
//! dispatch and telemetry handling, so the [`PendingCommandTracker`] is never
//! touched concurrently.

use std::{fmt, sync::Arc, time::Duration, time::SystemTime};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    ble::BleTransport,
    classifier::classify_with_threshold,
    error::BikeError,
    protocol::{ControlAck, ControlCommand, ControlOpcode},
    results::{
        CommandStatus, CompatibilityLevel, PendingCommandTracker, ResistanceChangeEvent,
        TestResults, INTERRUPTED_MARKER,
    },
    session::{DeviceSession, SessionEvent},
    types::{DataField, DeviceInfo, IndoorBikeData, ProtocolType, RangeKind, TestConfig},
};

/// Script phase reported with progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    /// Establishing the link
    Connecting,
    /// Discovering services and detecting the protocol
    Detecting,
    /// Reading FTMS features and supported ranges
    ReadingCapabilities,
    /// Enabling notifications and starting the device
    Preparing,
    /// Resistance-affecting control commands
    ControlTests,
    /// Free-run data collection
    Collecting,
    /// Classifying results
    Finalizing,
    /// Finished
    Done,
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Detecting => "detecting protocol",
            Self::ReadingCapabilities => "reading capabilities",
            Self::Preparing => "preparing device",
            Self::ControlTests => "control tests",
            Self::Collecting => "collecting data",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Live event emitted while a test runs
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    /// Script checkpoint
    Progress {
        /// 0 to 100
        percent: u8,
        /// Current phase
        phase: TestPhase,
    },
    /// Decoded telemetry sample
    Telemetry(IndoorBikeData),
    /// Resistance moved between two samples
    ResistanceChanged(ResistanceChangeEvent),
    /// A control test reached a final status
    CommandResolved {
        /// Control test
        command: ControlOpcode,
        /// Final status
        status: CommandStatus,
    },
    /// The run is over
    Finished(CompatibilityLevel),
}

/// Stops a running test from another task
///
/// Stopping keeps the device connected; the run finalizes whatever it has
/// accumulated so far.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Request the running test to stop
    ///
    /// A request made before the run starts stops it at its first checkpoint.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Why the script ended early
#[derive(Debug)]
enum Interrupt {
    Stopped,
    Aborted(String),
}

impl From<BikeError> for Interrupt {
    fn from(e: BikeError) -> Self {
        Self::Aborted(e.to_string())
    }
}

type Step = std::result::Result<(), Interrupt>;

const TRACKED_COMMANDS: [ControlOpcode; 3] = [
    ControlOpcode::SetResistanceLevel,
    ControlOpcode::SetTargetPower,
    ControlOpcode::SetSimParams,
];

/// Runs the compatibility script against one device
///
/// # Examples
///
/// ```no_run
/// use bikeprobe::{
///     BtleplugTransport, ConnectionParams, DeviceSession, TestConfig, TestOrchestrator,
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
///     let mut orchestrator = TestOrchestrator::new(TestConfig::default());
///     let results = orchestrator.run(&mut session, &device).await;
///     println!("{results}");
///
///     session.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct TestOrchestrator {
    config: TestConfig,
    tracker: PendingCommandTracker,
    last_resistance: Option<i16>,
    events: Option<mpsc::UnboundedSender<TestEvent>>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl TestOrchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(config: TestConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            tracker: PendingCommandTracker::new(),
            last_resistance: None,
            events: None,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// Forward live [`TestEvent`]s to a channel
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TestEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Script configuration
    #[must_use]
    pub const fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Handle for stopping the test from another task
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    fn emit(&self, event: TestEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn progress(&self, percent: u8, phase: TestPhase) {
        debug!("Progress {percent}%: {phase}");
        self.emit(TestEvent::Progress { percent, phase });
    }

    fn check_stop(&self) -> Step {
        if *self.stop_rx.borrow() {
            Err(Interrupt::Stopped)
        } else {
            Ok(())
        }
    }

    /// Run the full script and return classified results
    ///
    /// Never fails: connection problems, interruptions and user stops all end
    /// in finalized results with a verdict and reasons. The session is left
    /// connected; disconnecting is up to the caller.
    pub async fn run<T: BleTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        device: &DeviceInfo,
    ) -> TestResults {
        self.tracker.clear();
        self.last_resistance = None;

        info!("🚴 Starting compatibility test for {}", device.name);
        let deadline = Instant::now() + Duration::from_millis(self.config.total_duration_ms);
        let mut results = TestResults::new(device.clone());

        match self.script(session, device, &mut results, deadline).await {
            Ok(()) => {}
            Err(Interrupt::Stopped) => {
                warn!("Test stopped by user");
                results.add_issue(format!("{INTERRUPTED_MARKER}: stopped by user"));
            }
            Err(Interrupt::Aborted(reason)) => {
                warn!("Test aborted: {reason}");
                results.add_issue(format!("{INTERRUPTED_MARKER}: {reason}"));
            }
        }
        self.tracker.clear();
        self.stop_tx.send_replace(false);
        self.stop_rx.mark_unchanged();

        self.progress(90, TestPhase::Finalizing);
        let results = classify_with_threshold(results, self.config.automatic_change_threshold);
        self.progress(100, TestPhase::Done);

        if let Some(level) = results.compatibility_level {
            info!("✅ Test finished: {level}");
            self.emit(TestEvent::Finished(level));
        }
        results
    }

    async fn script<T: BleTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        device: &DeviceInfo,
        results: &mut TestResults,
        deadline: Instant,
    ) -> Step {
        self.progress(0, TestPhase::Connecting);
        self.check_stop()?;
        if let Err(e) = session.connect(device).await {
            results.add_issue(format!("Connection failed: {e}"));
            return Ok(());
        }
        results.mark_connected();
        self.progress(5, TestPhase::Connecting);

        self.check_stop()?;
        self.progress(10, TestPhase::Detecting);
        let protocol = session.discover_protocol().await?;
        results.set_protocol(protocol, session.supported_protocols());
        if session.has_csc_service() {
            results.set_feature("csc_measurement", true);
        }
        self.progress(20, TestPhase::Detecting);

        if !protocol.is_implemented() {
            results.add_issue(format!("{protocol} protocol support is not implemented yet"));
            return Ok(());
        }

        if protocol == ProtocolType::Ftms {
            read_capabilities(session, results).await;
            self.progress(20, TestPhase::ReadingCapabilities);
        }

        self.check_stop()?;
        self.progress(30, TestPhase::Preparing);
        session.subscribe_notifications().await?;

        if protocol.supports_control() {
            for command in [
                ControlCommand::RequestControl,
                ControlCommand::Reset,
                ControlCommand::Start,
            ] {
                self.send_paced(session, results, command).await?;
            }

            self.progress(40, TestPhase::ControlTests);
            let commands = [
                ControlCommand::SetResistanceLevel(self.config.resistance_level),
                ControlCommand::SetTargetPower(self.config.target_power_watts),
                ControlCommand::SetSimParams {
                    wind_speed: self.config.sim_wind_speed,
                    grade: self.config.sim_grade_percent,
                    crr: self.config.sim_crr,
                    cw: self.config.sim_cw,
                },
            ];
            for (percent, command) in [43, 46, 50].into_iter().zip(commands) {
                self.control_test(session, results, command).await?;
                self.progress(percent, TestPhase::ControlTests);
            }
        } else {
            for test in TRACKED_COMMANDS {
                results.set_control(
                    test,
                    CommandStatus::NotSupported,
                    format!("{protocol} has no control channel"),
                );
            }
        }

        self.collect(session, results, deadline).await?;

        if protocol.supports_control() {
            self.send_paced(session, results, ControlCommand::Stop).await?;
        }
        Ok(())
    }

    /// Write a command and keep handling events for its pacing delay
    async fn send_paced<T: BleTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        results: &mut TestResults,
        command: ControlCommand,
    ) -> Step {
        self.check_stop()?;
        let test = command.opcode();

        match session.send_command(command).await {
            Ok(()) => {
                results.set_control(test, CommandStatus::Pending, format!("sent {command}"));
            }
            Err(e) if e.is_connection_error() => return Err(e.into()),
            Err(e) => {
                results.set_control(test, CommandStatus::Failed, e.to_string());
                results.add_issue(format!("{command} failed: {e}"));
            }
        }

        self.pump_until(session, results, Instant::now() + command.min_delay())
            .await
    }

    /// Send one resistance-affecting command and watch telemetry for its effect
    async fn control_test<T: BleTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        results: &mut TestResults,
        command: ControlCommand,
    ) -> Step {
        self.check_stop()?;
        let test = command.opcode();
        info!("🔧 Testing {command}");

        if let Some(abandoned) = self.tracker.arm(&command, Instant::now()) {
            debug!("{abandoned} abandoned before confirmation");
        }
        results.set_control(test, CommandStatus::Pending, format!("sent {command}"));

        if let Err(e) = session.send_command(command).await {
            self.tracker.clear();
            if e.is_connection_error() {
                return Err(e.into());
            }
            results.set_control(test, CommandStatus::Failed, e.to_string());
            self.emit(TestEvent::CommandResolved {
                command: test,
                status: CommandStatus::Failed,
            });
            return Ok(());
        }

        let window = Duration::from_millis(self.config.observation_window_ms)
            .max(command.min_delay());
        self.pump_until(session, results, Instant::now() + window)
            .await?;

        if let Some(expired) = self.tracker.expire() {
            warn!("{expired}: no resistance change within {} ms", window.as_millis());
            results.set_control(
                expired,
                CommandStatus::Failed,
                format!("timeout: no resistance change within {} ms", window.as_millis()),
            );
            self.emit(TestEvent::CommandResolved {
                command: expired,
                status: CommandStatus::Failed,
            });
        }
        Ok(())
    }

    /// Free-run collection until the overall deadline
    async fn collect<T: BleTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        results: &mut TestResults,
        deadline: Instant,
    ) -> Step {
        self.progress(50, TestPhase::Collecting);
        let start = Instant::now();
        if start >= deadline {
            return Ok(());
        }

        let span = (deadline - start).as_millis().max(1);
        let interval = Duration::from_millis(self.config.progress_interval_ms.max(1));
        loop {
            let next = (Instant::now() + interval).min(deadline);
            self.pump_until(session, results, next).await?;

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(start).as_millis();
            let percent = 50 + u8::try_from((elapsed * 40 / span).min(40)).unwrap_or(40);
            self.progress(percent, TestPhase::Collecting);

            if now >= deadline {
                return Ok(());
            }
        }
    }

    /// Handle session events until `deadline`, a stop request or link loss
    async fn pump_until<T: BleTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        results: &mut TestResults,
        deadline: Instant,
    ) -> Step {
        enum Wake {
            Stop,
            Event(Option<SessionEvent>),
            Deadline,
        }

        let timer = sleep_until(deadline);
        tokio::pin!(timer);

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => Wake::Stop,
                event = session.next_event() => Wake::Event(event),
                () = &mut timer => Wake::Deadline,
            };

            match wake {
                Wake::Stop => self.check_stop()?,
                Wake::Deadline => return Ok(()),
                Wake::Event(Some(event)) => self.handle_event(results, event)?,
                Wake::Event(None) => {
                    return Err(Interrupt::Aborted("session event stream ended".to_string()));
                }
            }
        }
    }

    fn handle_event(&mut self, results: &mut TestResults, event: SessionEvent) -> Step {
        match event {
            SessionEvent::Telemetry(sample) => {
                results.record_sample(&sample);
                if let Some(level) = sample.resistance_level {
                    self.observe_resistance(results, level);
                }
                self.emit(TestEvent::Telemetry(sample));
            }
            SessionEvent::ControlAck(ack) => self.handle_ack(results, &ack),
            SessionEvent::AuthenticationRejected => {
                return Err(Interrupt::Aborted(
                    "device rejected authentication, reconnect required".to_string(),
                ));
            }
            SessionEvent::StreamClosed(characteristic) => {
                return Err(Interrupt::Aborted(format!(
                    "device disconnected (notifications on {characteristic} ended)"
                )));
            }
        }
        Ok(())
    }

    fn observe_resistance(&mut self, results: &mut TestResults, level: i16) {
        let Some(old) = self.last_resistance.replace(level) else {
            return;
        };
        if old == level {
            return;
        }

        let change = ResistanceChangeEvent {
            timestamp: SystemTime::now(),
            param_type: DataField::ResistanceLevel,
            old_value: old,
            new_value: level,
            attributed_command: self.tracker.attributed_command(),
        };
        if change.is_automatic() {
            debug!("Resistance changed {old} -> {level} without a resistance command");
        } else {
            debug!("Resistance changed {old} -> {level}");
        }
        results.push_resistance_change(change.clone());
        self.emit(TestEvent::ResistanceChanged(change));

        if let Some(confirmed) = self.tracker.on_resistance_change(level) {
            info!("✅ {confirmed} confirmed by resistance {old} -> {level}");
            results.set_control(
                confirmed,
                CommandStatus::Ok,
                format!("resistance changed {old} -> {level}"),
            );
            self.emit(TestEvent::CommandResolved {
                command: confirmed,
                status: CommandStatus::Ok,
            });
        }
    }

    fn handle_ack(&mut self, results: &mut TestResults, ack: &ControlAck) {
        let Some(test) = ack.opcode() else {
            warn!("Acknowledgement for {}", ack.opcode_label());
            return;
        };

        if let Some(failed) = self.tracker.on_ack(ack) {
            warn!("❌ {failed} rejected: {}", ack.result);
            results.set_control(
                failed,
                CommandStatus::Failed,
                format!("device answered {}", ack.result),
            );
            self.emit(TestEvent::CommandResolved {
                command: failed,
                status: CommandStatus::Failed,
            });
            return;
        }

        if TRACKED_COMMANDS.contains(&test) {
            // success is only proven by telemetry
            if !ack.result.is_success()
                && results.control_status(test) == Some(CommandStatus::Pending)
            {
                results.set_control(
                    test,
                    CommandStatus::Failed,
                    format!("device answered {}", ack.result),
                );
            }
            return;
        }

        let status = if ack.result.is_success() {
            CommandStatus::Ok
        } else {
            CommandStatus::Failed
        };
        results.set_control(test, status, ack.to_string());
    }
}

/// Feature bitmask and supported ranges; failures are noted and skipped
async fn read_capabilities<T: BleTransport>(
    session: &mut DeviceSession<T>,
    results: &mut TestResults,
) {
    match session.read_features().await {
        Ok(features) => {
            for name in features.supported() {
                results.set_feature(name, true);
            }
        }
        Err(e) => results.add_issue(format!("Feature read failed: {e}")),
    }

    for kind in RangeKind::ALL {
        match session.read_range(kind).await {
            Ok(range) => results.set_range(kind, range),
            Err(e) => {
                debug!("{kind} range unavailable: {e}");
                results.add_issue(format!("{kind} range read failed: {e}"));
            }
        }
    }
}

use bikeprobe::{
    BtleplugTransport, ConnectionParams, DeviceSession, Result, TestConfig, TestEvent,
    TestOrchestrator, TracingSink,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚲 bikeprobe Compatibility Check Example");
    info!("Scanning for indoor bikes...");

    let params = ConnectionParams::default();
    let transport = Arc::new(BtleplugTransport::new().await?);
    let devices = transport.scan_for_bikes(&params).await?;

    let Some(device) = devices.into_iter().next() else {
        error!("❌ No indoor bikes found");
        return Ok(());
    };
    info!("✅ Found: {} ({} dBm)", device.name, device.rssi);
    for protocol in device.advertised_protocols() {
        info!("   advertises {protocol}");
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut orchestrator = TestOrchestrator::new(TestConfig::default()).with_events(events_tx);

    // Ctrl+C stops the test but keeps the bike connected
    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Stopping test...");
            stop.stop();
        }
    });

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                TestEvent::Progress { percent, phase } => {
                    println!("⏳ {percent:3}% {phase}");
                }
                TestEvent::Telemetry(sample) => {
                    println!("┌─────────────────────────────────────────┐");
                    println!("│ Cadence:    {:>10} rpm               │", fmt_opt(sample.cadence));
                    println!("│ Speed:      {:>10} km/h              │", fmt_opt(sample.speed));
                    println!(
                        "│ Resistance: {:>10}                   │",
                        fmt_opt(sample.resistance_level)
                    );
                    println!("│ Power:      {:>10} W                 │", fmt_opt(sample.power));
                    println!("└─────────────────────────────────────────┘");
                }
                TestEvent::ResistanceChanged(change) => {
                    let cause = change
                        .attributed_command
                        .map_or_else(|| "automatic".to_string(), |op| op.to_string());
                    println!(
                        "🔧 Resistance {} -> {} ({cause})",
                        change.old_value, change.new_value
                    );
                }
                TestEvent::CommandResolved { command, status } => {
                    println!("📋 {command}: {status}");
                }
                TestEvent::Finished(level) => println!("🏁 {level}"),
            }
        }
    });

    let mut session = DeviceSession::new(transport, params, Arc::new(TracingSink));
    let results = orchestrator.run(&mut session, &device).await;

    println!("\n{results}");
    match results.to_json_pretty() {
        Ok(json) => info!("JSON report is {} bytes", json.len()),
        Err(e) => warn!("⚠️  Failed to serialize results: {}", e),
    }

    // Disconnect
    info!("🔌 Disconnecting...");
    if let Err(e) = session.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    } else {
        info!("👋 Disconnected");
    }

    Ok(())
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

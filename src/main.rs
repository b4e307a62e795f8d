use color_eyre::{eyre::eyre, Result};
use controlbridge::bridge::{ConnectionState, ConnectionStatus, ControlState, DeviceBridge};
use controlbridge::config::BridgeConfig;
use controlbridge::protocol::ActionKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

/// Stand-in for the vehicle simulation that owns the consumer thread.
#[derive(Default)]
struct Simulation {
    frame: u64,
    connection: Option<ConnectionState>,
    bridge_error: Option<String>,
    input: ControlState,
    spraying: bool,
    drawing: bool,
    thermal_view: bool,
    indicator: bool,
    captures: u32,
}

impl Simulation {
    fn apply_status(&mut self, status: &ConnectionStatus) {
        if self.connection != Some(status.state) {
            info!(
                "Simulation sees bridge {:?} (attempt {}, device {:?})",
                status.state, status.reconnect_attempts, status.device
            );
            self.connection = Some(status.state);
        }
        if status.fatal_error != self.bridge_error {
            if let Some(err) = &status.fatal_error {
                warn!("Bridge unavailable: {}", err);
            }
            self.bridge_error = status.fatal_error.clone();
        }
    }

    fn step(&mut self, input: ControlState) {
        self.frame += 1;
        self.input = input;

        if self.frame % 300 == 0 {
            debug!(
                "Frame {}: throttle {:.2} yaw {:.2} roll {:.2} pitch {:.2} cam {}",
                self.frame,
                self.input.throttle,
                self.input.yaw,
                self.input.roll,
                self.input.pitch,
                self.input.selected_camera
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = setup_config().await?;
    setup_logging(config.logging.level()?);
    info!("Starting controlbridge");

    let (mut bridge, mut adapter) = DeviceBridge::spawn_adb::<Simulation>(Some(config.bridge_settings()))
        .map_err(|e| eyre!("Failed to spawn device bridge: {}", e))?;

    adapter.on_action(ActionKind::ReturnToLaunch, |_, event| {
        info!("Return to launch requested at {}", event.timestamp.format("%H:%M:%S.%3f"));
    });
    adapter.on_action(ActionKind::Automation, |_, _| info!("Automated path requested"));
    adapter.on_action(ActionKind::Capture, |sim: &mut Simulation, _| {
        sim.captures += 1;
        info!("Image capture #{}", sim.captures);
    });
    adapter.on_action(ActionKind::Indicator, |sim: &mut Simulation, _| {
        sim.indicator = !sim.indicator;
    });
    adapter.on_action(ActionKind::Thermal, |sim: &mut Simulation, _| {
        sim.thermal_view = !sim.thermal_view;
        info!("Thermal view {}", if sim.thermal_view { "on" } else { "off" });
    });
    adapter.on_action(ActionKind::Spray, |sim: &mut Simulation, _| {
        sim.spraying = !sim.spraying;
    });
    adapter.on_action(ActionKind::Draw, |sim: &mut Simulation, _| {
        sim.drawing = !sim.drawing;
    });

    // Status changes reach the simulation through the dispatcher
    let dispatcher = adapter.dispatcher();
    let mut status_rx = bridge.subscribe();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            dispatcher.enqueue(move |sim: &mut Simulation| {
                sim.apply_status(&status);
                Ok(())
            });
        }
    });

    bridge
        .connect()
        .await
        .map_err(|e| eyre!("Failed to request connection: {}", e))?;

    let mut simulation = Simulation::default();
    let mut frames = time::interval(FRAME_INTERVAL);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = frames.tick() => {
                let input = adapter.tick(&mut simulation);
                simulation.step(input);
            }
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    bridge.shutdown().await;
    status_task.abort();
    info!(
        "Stopped after {} frames (spraying: {}, drawing: {}, indicator: {})",
        simulation.frame, simulation.spraying, simulation.drawing, simulation.indicator
    );
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", level.as_str().to_lowercase())
    }
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Config path from the first argument, otherwise the per-user default.
async fn setup_config() -> Result<BridgeConfig> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(BridgeConfig::default_path);

    match path {
        Some(path) => BridgeConfig::load_or_create(&path)
            .await
            .map_err(|e| eyre!("Failed to load config {}: {}", path.display(), e)),
        None => Ok(BridgeConfig::default()),
    }
}

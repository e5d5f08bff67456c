use color_eyre::{eyre::eyre, Result};
use joypad_control::config::{Config, DispatchKind};
use joypad_control::control::JoypadControl;
use joypad_control::controller::GilrsSource;
use joypad_control::dispatch::{Dispatcher, LogDispatcher, MqttDispatcher};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    // the configured level is only known after loading, so bootstrap at info
    let (config_path, config) = tracing::subscriber::with_default(subscriber(Level::INFO), || {
        let config_path = Config::default_path();
        let config = Config::load_or_init(&config_path).map_err(|e| {
            eyre!(
                "Failed to load configuration from {}: {}",
                config_path.display(),
                e
            )
        })?;
        Ok::<_, color_eyre::Report>((config_path, config))
    })?;
    setup_logging_env(&config.log_level)?;
    info!("Using configuration {}", config_path.display());

    let shutdown = CancellationToken::new();
    let (dispatcher, mqtt) = setup_dispatcher(&config, shutdown.clone());

    let control = JoypadControl::create(
        config.device.poller_settings(),
        config.bindings.clone(),
        config.services.clone(),
        dispatcher,
    )
    .enable(GilrsSource::open)
    .map_err(|e| eyre!("Failed to enable joypad control: {}", e))?;

    info!(
        "Joypad control running on joypad {} ({:?} poll, {:?} settle), press Ctrl+C to stop",
        control.poller_settings().device_index,
        control.poller_settings().poll_interval,
        control.poller_settings().settle_duration
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    // disable() waits up to STOP_TIMEOUT for the poller thread
    let _control = tokio::task::spawn_blocking(move || control.disable()).await?;

    if let Some((client, task)) = mqtt {
        info!("MQTT connection state at shutdown: {:?}", client.connection_state());
        shutdown.cancel();
        if let Err(e) = task.await {
            warn!("MQTT event loop ended abnormally: {}", e);
        }
    }

    info!("Bye");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn subscriber(level: Level) -> impl tracing::Subscriber + Send + Sync + 'static {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .finish()
}

fn setup_logging_env(log_level: &str) -> Result<()> {
    let level = log_level.parse::<Level>().ok();
    tracing::subscriber::set_global_default(subscriber(level.unwrap_or(Level::INFO)))?;

    if level.is_none() {
        warn!("Unknown log level '{}', falling back to info", log_level);
    }
    Ok(())
}

type MqttTransport = (Arc<MqttDispatcher>, JoinHandle<()>);

fn setup_dispatcher(
    config: &Config,
    shutdown: CancellationToken,
) -> (Arc<dyn Dispatcher>, Option<MqttTransport>) {
    match config.dispatch.kind {
        DispatchKind::Mqtt => {
            let (client, task) = MqttDispatcher::spawn(config.dispatch.mqtt.clone(), shutdown);
            let dispatcher: Arc<dyn Dispatcher> = client.clone();
            (dispatcher, Some((client, task)))
        }
        DispatchKind::Log => {
            info!("Dry run: service calls are only logged");
            let dispatcher: Arc<dyn Dispatcher> = Arc::new(LogDispatcher);
            (dispatcher, None)
        }
    }
}

//! `stepper-bridge` – runs one Modbus stepper controller behind MQTT.
//!
//! 1. Loads `~/.stepper-bridge/config.toml` (or `$STEPPER_CONFIG`), writing
//!    a default file on first run.
//! 2. Opens the serial link and the broker session, then starts the bridge.
//! 3. Runs until Ctrl-C, then stops the bridge gracefully.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use stepper_bridge::Bridge;
use stepper_hal::ModbusRtuLink;
use stepper_middleware::MqttClient;
use tokio::sync::Notify;
use tracing::{info, warn};

use config::Config;

fn main() -> ExitCode {
    let _telemetry = stepper_bridge::init_tracing("stepper-bridge");

    print_banner();

    let cfg = match load_or_create() {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Runtime error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}: {}", "Bridge error".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn load_or_create() -> Result<Config, config::ConfigError> {
    let path = config::config_path();
    let cfg = match config::load()? {
        Some(cfg) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        None => {
            let mut cfg = Config::default();
            config::save(&cfg)?;
            println!(
                "  {} default config written to {}",
                "First run:".cyan().bold(),
                path.display().to_string().bold()
            );
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

async fn run(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mqtt = Arc::new(MqttClient::new(cfg.mqtt_settings())?);
    let link = Box::new(ModbusRtuLink::new(cfg.serial_settings()));
    let bridge = Bridge::new(cfg.bridge_config(), link, mqtt)?;

    let shutdown = Arc::new(Notify::new());
    let on_signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping bridge …".yellow().bold());
        on_signal.notify_one();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop with SIGKILL");
    }

    println!(
        "  Serial {} @ {} baud, broker {}:{}",
        cfg.serial.port.bold(),
        cfg.serial.baud_rate,
        cfg.mqtt.host.bold(),
        cfg.mqtt.port
    );
    bridge.start().await?;
    println!(
        "  {} publishing under {}/stepper{}",
        "Bridge running".green().bold(),
        cfg.topic_root,
        cfg.device_id
    );

    shutdown.notified().await;
    bridge.stop().await;
    info!("bridge stopped");
    println!("{}", "  ✓ Bridge stopped.".green());
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", "  ┌──────────────────────────────┐".cyan());
    println!(
        "{}{}{}",
        "  │ ".cyan(),
        "  stepper-bridge  MQTT⇄Modbus ".bold(),
        "│".cyan()
    );
    println!("{}", "  └──────────────────────────────┘".cyan());
    println!();
}

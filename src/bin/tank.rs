use clap::{App, Arg, ArgMatches};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tankbus::actuator::{Actuator, CommandActuator, LogActuator};
use tankbus::config::{ActuatorKind, ConfigError, TankConfig};
use tankbus::identity::load_identity;
use tankbus::transport::TcpTransport;
use tankbus::{TankError, Vehicle, VehicleOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = App::new("tank")
        .version("0.1.0")
        .author("Tank Systems Engineering Team")
        .about("🚜 Tank control core - pairs with a controller and drives the treads")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("broker")
                .short("b")
                .long("broker")
                .value_name("HOST:PORT")
                .help("Broker address")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("id")
                .long("id")
                .value_name("TANK_ID")
                .help("Use this id instead of the machine id")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("machine-id")
                .long("machine-id")
                .value_name("FILE")
                .help("File holding the machine id")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("heartbeat-ms")
                .long("heartbeat-ms")
                .value_name("MILLIS")
                .help("Heartbeat check period")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Heartbeat period must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("controller")
                .long("controller")
                .value_name("FILTER")
                .help("Controller id to listen to, or + for any")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("actuator")
                .short("a")
                .long("actuator")
                .value_name("KIND")
                .help("Motor output")
                .takes_value(true)
                .possible_values(&["log", "command"]),
        )
        .arg(
            Arg::with_name("motor-program")
                .long("motor-program")
                .value_name("PATH")
                .help("External motor program used by the command actuator")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("🚜 Tank Control Core");
    println!("====================");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_config(matches: &ArgMatches<'_>) -> Result<TankConfig, ConfigError> {
    let mut config = match matches.value_of("config") {
        Some(path) => TankConfig::load(Path::new(path))?,
        None => TankConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(v) = matches.value_of("broker") {
        config.broker_addr = v.to_string();
    }
    if let Some(v) = matches.value_of("id") {
        config.tank_id = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("machine-id") {
        config.machine_id_path = PathBuf::from(v);
    }
    if let Some(v) = matches.value_of("heartbeat-ms") {
        config.heartbeat_period_ms = v.parse().map_err(|_| ConfigError::Invalid {
            field: "heartbeat_period_ms",
            reason: format!("{:?} is not a number", v),
        })?;
    }
    if let Some(v) = matches.value_of("controller") {
        config.controller_filter = v.to_string();
    }
    if let Some(v) = matches.value_of("actuator") {
        config.actuator = v.parse()?;
    }
    if let Some(v) = matches.value_of("motor-program") {
        config.motor_program = PathBuf::from(v);
    }
    if matches.is_present("verbose") {
        config.log_level = "debug".to_string();
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: TankConfig) -> Result<(), TankError> {
    let tank_id = load_identity(&config.machine_id_path, config.tank_id.as_deref())?;

    match config.actuator {
        ActuatorKind::Log => drive_with(&config, &tank_id, LogActuator::new()).await,
        ActuatorKind::Command => {
            let actuator = CommandActuator::new(config.motor_program.clone());
            drive_with(&config, &tank_id, actuator).await
        }
    }
}

async fn drive_with<A: Actuator>(
    config: &TankConfig,
    tank_id: &str,
    actuator: A,
) -> Result<(), TankError> {
    let transport = TcpTransport::new(&config.broker_addr, tank_id);
    let options = VehicleOptions {
        heartbeat_period: config.heartbeat_period(),
        controller_filter: config.controller_filter.clone(),
    };

    info!("🌐 Broker {}, heartbeat {:?}", config.broker_addr, options.heartbeat_period);
    let mut vehicle = Vehicle::new(tank_id, transport, actuator, options);

    vehicle
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

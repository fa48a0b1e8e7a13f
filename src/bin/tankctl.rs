use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tankbus::bus::BusMessage;
use tankbus::protocol::{
    controller_heartbeat_topic, controller_state_topic, decode, encode, AskPairMsg, AskStateMsg,
    ControllerState, ControllerStateMsg, DriveMsg, HeartbeatMsg, PairResponse, TankPairMsg,
    TankStateMsg, TankTopics, TurretFireMsg, TurretMoveMsg, UnpairMsg, ASK_STATE_TOPIC,
};
use tankbus::telemetry::TelemetrySnapshot;
use tankbus::transport::{Publisher, TcpTransport, Transport};
use tokio::sync::mpsc;

const DEFAULT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_CONTROLLER_ID: &str = "tankctl";
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

struct Session {
    transport: TcpTransport,
    publisher: Publisher,
    controller_id: String,
    format: String,
}

impl Session {
    async fn open(matches: &ArgMatches<'_>) -> CliResult<Self> {
        let broker = matches.value_of("broker").unwrap_or(DEFAULT_BROKER);
        let controller_id = matches
            .value_of("controller")
            .unwrap_or(DEFAULT_CONTROLLER_ID)
            .to_string();
        let format = matches.value_of("format").unwrap_or("table").to_string();

        let mut transport = TcpTransport::new(broker, &controller_id);
        let will = BusMessage::new(
            controller_state_topic(&controller_id),
            encode(&ControllerStateMsg {
                controller_id: controller_id.clone(),
                state: ControllerState::Down,
            })?,
        );

        if let Err(e) = transport.connect(will).await {
            eprintln!("{} Failed to reach broker at {}", "❌".red(), broker.bright_white());
            eprintln!("{} Start one with:", "💡".yellow());
            eprintln!("   {}", "tank-broker".bright_cyan());
            return Err(e.into());
        }

        let publisher = transport.publisher();
        Ok(Self {
            transport,
            publisher,
            controller_id,
            format,
        })
    }

    async fn send<M: serde::Serialize>(&self, topic: &str, msg: &M) -> CliResult<()> {
        let payload = encode(msg)?;
        if self.format == "json" {
            println!("{} {}", topic.dimmed(), payload);
        }
        self.publisher.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> CliResult<mpsc::Receiver<BusMessage>> {
        Ok(self.transport.subscribe(filter).await?)
    }

    async fn close(mut self) {
        let _ = self.transport.disconnect().await;
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let tank_arg = || {
        Arg::with_name("tank")
            .help("Target tank id")
            .required(true)
    };

    let matches = App::new("tankctl")
        .version("0.1.0")
        .author("Tank Systems Engineering Team")
        .about("🎮 Tank controller - pair with and drive a tank over the bus")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("broker")
                .short("b")
                .long("broker")
                .value_name("HOST:PORT")
                .help("Broker address")
                .takes_value(true)
                .default_value(DEFAULT_BROKER)
                .global(true),
        )
        .arg(
            Arg::with_name("controller")
                .short("c")
                .long("controller")
                .value_name("ID")
                .help("Controller id to act as")
                .takes_value(true)
                .default_value(DEFAULT_CONTROLLER_ID)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("ask-state")
                .about("📊 Ask every tank on the bus for its state")
                .arg(
                    Arg::with_name("wait")
                        .short("w")
                        .long("wait")
                        .value_name("SECONDS")
                        .help("How long to collect answers")
                        .takes_value(true)
                        .default_value("2"),
                ),
        )
        .subcommand(
            SubCommand::with_name("pair")
                .about("🤝 Ask a tank to pair with this controller")
                .arg(tank_arg()),
        )
        .subcommand(
            SubCommand::with_name("unpair")
                .about("👋 Release a paired tank")
                .arg(tank_arg()),
        )
        .subcommand(
            SubCommand::with_name("drive")
                .about("🚜 Send a drive command")
                .arg(tank_arg())
                .arg(
                    Arg::with_name("speed")
                        .help("Speed, -100 to 100")
                        .required(true)
                        .allow_hyphen_values(true)
                        .validator(validate_percent),
                )
                .arg(
                    Arg::with_name("direction")
                        .help("Direction, -100 to 100")
                        .required(true)
                        .allow_hyphen_values(true)
                        .validator(validate_percent),
                ),
        )
        .subcommand(
            SubCommand::with_name("turret")
                .about("🎯 Turret control")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("move")
                        .about("Step the turret")
                        .arg(tank_arg())
                        .arg(
                            Arg::with_name("direction")
                                .help("Turret direction")
                                .required(true)
                                .possible_values(&["left", "right", "up", "down", "center"]),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("fire")
                        .about("Fire the turret")
                        .arg(tank_arg()),
                ),
        )
        .subcommand(
            SubCommand::with_name("heartbeat")
                .about("💓 Publish controller heartbeats")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("N")
                        .help("Number of beats (default: until Ctrl+C)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("interval")
                        .short("i")
                        .long("interval")
                        .value_name("MS")
                        .help("Milliseconds between beats")
                        .takes_value(true)
                        .default_value("1000"),
                ),
        )
        .subcommand(
            SubCommand::with_name("state")
                .about("📣 Announce this controller's state")
                .arg(
                    Arg::with_name("state")
                        .help("Controller state")
                        .required(true)
                        .possible_values(&["up", "down", "pairing", "paired"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📈 Watch a tank's state, pairing and sensor traffic")
                .arg(
                    Arg::with_name("tank")
                        .help("Tank id, or + for every tank")
                        .default_value("+"),
                ),
        )
        .get_matches();

    let mut session = Session::open(&matches).await?;

    let result = match matches.subcommand() {
        ("ask-state", Some(sub)) => handle_ask_state(&mut session, sub).await,
        ("pair", Some(sub)) => handle_pair(&mut session, sub).await,
        ("unpair", Some(sub)) => handle_unpair(&session, sub).await,
        ("drive", Some(sub)) => handle_drive(&session, sub).await,
        ("turret", Some(sub)) => handle_turret(&session, sub).await,
        ("heartbeat", Some(sub)) => handle_heartbeat(&session, sub).await,
        ("state", Some(sub)) => handle_state(&session, sub).await,
        ("monitor", Some(sub)) => handle_monitor(&mut session, sub).await,
        _ => Ok(()),
    };

    if let Err(e) = &result {
        eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
    }
    session.close().await;
    result
}

fn validate_percent(v: String) -> Result<(), String> {
    match v.parse::<i16>() {
        Ok(value) if (-100..=100).contains(&value) => Ok(()),
        _ => Err("Value must be between -100 and 100".into()),
    }
}

fn parse_state(raw: &str) -> ControllerState {
    match raw {
        "up" => ControllerState::Up,
        "pairing" => ControllerState::Pairing,
        "paired" => ControllerState::Paired,
        _ => ControllerState::Down,
    }
}

async fn handle_ask_state(session: &mut Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let wait = matches
        .value_of("wait")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(2);
    let mut rx = session.subscribe("Tank/+/State").await?;

    session
        .send(
            ASK_STATE_TOPIC,
            &AskStateMsg {
                controller_id: session.controller_id.clone(),
            },
        )
        .await?;

    let deadline = tokio::time::sleep(Duration::from_secs(wait));
    tokio::pin!(deadline);
    let mut answers = 0;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                answers += 1;
                print_state(session, &message);
            }
        }
    }

    if answers == 0 && session.format != "json" {
        println!("{}", "No tanks answered".yellow());
    }
    Ok(())
}

async fn handle_pair(session: &mut Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let tank = matches.value_of("tank").unwrap_or_default();
    let topics = TankTopics::new(tank);
    let mut rx = session.subscribe(&topics.pair).await?;

    session
        .send(
            &topics.ask_pair,
            &AskPairMsg {
                controller_id: session.controller_id.clone(),
                tank_id: tank.to_string(),
            },
        )
        .await?;

    loop {
        let message = match tokio::time::timeout(REPLY_TIMEOUT, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Err("broker link closed".into()),
            Err(_) => {
                eprintln!("{} No answer from {} after {:?}", "⏰".yellow(), tank, REPLY_TIMEOUT);
                return Err("pair request timed out".into());
            }
        };

        let reply: TankPairMsg = decode(&message.topic, &message.payload)?;
        if reply.controller_id != session.controller_id {
            continue;
        }

        match session.format.as_str() {
            "json" => println!("{}", message.payload),
            _ => match reply.response {
                PairResponse::Yes => println!(
                    "{} {} {}",
                    "🤝".green(),
                    "Paired with".bright_green(),
                    reply.tank_id.bright_white()
                ),
                PairResponse::No => println!(
                    "{} {} {}",
                    "🔒".red(),
                    "Pairing refused by".bright_red(),
                    reply.tank_id.bright_white()
                ),
            },
        }
        return Ok(());
    }
}

async fn handle_unpair(session: &Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let tank = matches.value_of("tank").unwrap_or_default();
    let topics = TankTopics::new(tank);
    session
        .send(
            &topics.unpair,
            &UnpairMsg {
                controller_id: session.controller_id.clone(),
                tank_id: tank.to_string(),
            },
        )
        .await?;
    print_sent(session, "Unpair", tank);
    Ok(())
}

async fn handle_drive(session: &Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let tank = matches.value_of("tank").unwrap_or_default();
    let speed = matches.value_of("speed").unwrap_or("0").parse::<i16>()?;
    let direction = matches.value_of("direction").unwrap_or("0").parse::<i16>()?;

    session
        .send(
            &TankTopics::new(tank).drive,
            &DriveMsg {
                controller_id: session.controller_id.clone(),
                tank_id: tank.to_string(),
                speed,
                direction,
            },
        )
        .await?;
    print_sent(session, &format!("Drive speed={} direction={}", speed, direction), tank);
    Ok(())
}

async fn handle_turret(session: &Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    match matches.subcommand() {
        ("move", Some(sub)) => {
            let tank = sub.value_of("tank").unwrap_or_default();
            let direction = sub.value_of("direction").unwrap_or("center");
            session
                .send(
                    &TankTopics::new(tank).turret_move,
                    &TurretMoveMsg {
                        controller_id: session.controller_id.clone(),
                        tank_id: tank.to_string(),
                        direction: capitalize(direction),
                    },
                )
                .await?;
            print_sent(session, &format!("Turret {}", direction), tank);
        }
        ("fire", Some(sub)) => {
            let tank = sub.value_of("tank").unwrap_or_default();
            session
                .send(
                    &TankTopics::new(tank).turret_fire,
                    &TurretFireMsg {
                        controller_id: session.controller_id.clone(),
                        tank_id: tank.to_string(),
                    },
                )
                .await?;
            print_sent(session, "Fire", tank);
        }
        _ => {
            println!("{}", "Turret subcommand required. Use 'tankctl turret --help' for options.".yellow());
        }
    }
    Ok(())
}

async fn handle_heartbeat(session: &Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let count = matches.value_of("count").map(str::parse::<u64>).transpose()?;
    let interval = matches.value_of("interval").unwrap_or("1000").parse::<u64>()?;
    let topic = controller_heartbeat_topic(&session.controller_id);
    let beat = HeartbeatMsg {
        controller_id: session.controller_id.clone(),
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(interval.max(1)));
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                session.send(&topic, &beat).await?;
                sent += 1;
                if session.format != "json" {
                    println!("{} {} #{}", "💓".red(), "Heartbeat".bright_white(), sent);
                }
                if count.map_or(false, |n| sent >= n) {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_state(session: &Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let state = parse_state(matches.value_of("state").unwrap_or("up"));
    session
        .send(
            &controller_state_topic(&session.controller_id),
            &ControllerStateMsg {
                controller_id: session.controller_id.clone(),
                state,
            },
        )
        .await?;
    print_sent(session, &format!("State {:?}", state), "the bus");
    Ok(())
}

async fn handle_monitor(session: &mut Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let tank = matches.value_of("tank").unwrap_or("+");
    let mut rx = session.subscribe(&format!("Tank/{}/#", tank)).await?;
    println!("{}", "📡 Monitoring tank traffic (Press Ctrl+C to stop)...".bright_blue().bold());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = rx.recv() => {
                let Some(message) = message else {
                    return Err("broker link closed".into());
                };
                print_traffic(session, &message);
            }
        }
    }
    Ok(())
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn print_sent(session: &Session, what: &str, tank: &str) {
    if session.format != "json" {
        println!("{} {} {} {}", "✅".green(), what.bright_white(), "->".dimmed(), tank.bright_cyan());
    }
}

fn print_state(session: &Session, message: &BusMessage) {
    if session.format == "json" {
        println!("{}", message.payload);
        return;
    }
    match decode::<TankStateMsg>(&message.topic, &message.payload) {
        Ok(state) => println!(
            "{} {:<40} {}",
            "🚜".bright_blue(),
            state.tank_id.bright_white(),
            format!("{:?}", state.state).bright_green()
        ),
        Err(e) => println!("{} {}", "⚠️".yellow(), e),
    }
}

fn print_traffic(session: &Session, message: &BusMessage) {
    if session.format == "json" {
        println!("{} {}", message.topic, message.payload);
        return;
    }

    if message.topic.ends_with("/Sensors") {
        match decode::<TelemetrySnapshot>(&message.topic, &message.payload) {
            Ok(s) => println!(
                "{} {} L={:>4} R={:>4} speed={:>4} {:?}/{:?} turret=({}, {}) shots={}",
                "📡".bright_blue(),
                s.tank_id.bright_white(),
                s.left_tread,
                s.right_tread,
                s.speed,
                s.direction_fr,
                s.direction_lr,
                s.turret_horizontal,
                s.turret_vertical,
                s.shots_fired
            ),
            Err(e) => println!("{} {}", "⚠️".yellow(), e),
        }
    } else if message.topic.ends_with("/State") {
        print_state(session, message);
    } else {
        println!("{} {} {}", "📨".dimmed(), message.topic.bright_white(), message.payload);
    }
}

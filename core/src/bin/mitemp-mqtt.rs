use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use mitemp_bridge::config::Config;
use mitemp_bridge::publish::{
    host_mac, mac_to_eui64, publish_json, BrokerSettings, ConsolePublisher, DeviceInfoMessage,
    MeasurementsMessage, MqttPublisher, Publisher, Topics,
};
use mitemp_bridge::{logging, BackendKind, DeviceAddress, Parameter, SensorPoller};

/// OUI prefixes of the two Mi temperature/humidity sensor revisions.
const MITEMP_PREFIXES: [[u8; 3]; 2] = [[0x58, 0x2D, 0x34], [0x4C, 0x65, 0xA8]];

#[derive(Parser, Debug)]
#[command(
    name = "mitemp-mqtt",
    version,
    about = "Poll Mi temperature/humidity sensors and publish to MQTT"
)]
struct Cli {
    /// Configuration file (default: $MITEMP_CONFIG_PATH or ./mitemp.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true, value_enum)]
    backend: Option<BackendKind>,

    /// Bluetooth adapter, e.g. hci0
    #[arg(short, long, global = true)]
    adapter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll sensors and publish their data to the broker
    Poll(PollArgs),
    /// Poll sensors and print their data
    Show {
        #[arg(value_parser = parse_sensor)]
        macs: Vec<DeviceAddress>,
        /// Print device information instead of measurements
        #[arg(short, long)]
        devinfo: bool,
    },
    /// List the available backends
    Backends,
    /// Scan for nearby devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct PollArgs {
    #[arg(value_parser = parse_sensor)]
    macs: Vec<DeviceAddress>,

    /// Broker host
    #[arg(short, long)]
    server: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    /// Publish device information
    #[arg(short, long)]
    devinfo: bool,

    /// Publish battery level
    #[arg(short = 'e', long)]
    health: bool,

    /// Publish temperature and humidity
    #[arg(short, long)]
    measurements: bool,

    /// Print messages instead of publishing them
    #[arg(long)]
    dry_run: bool,
}

fn parse_sensor(s: &str) -> Result<DeviceAddress, String> {
    let address: DeviceAddress = s.parse().map_err(|_| format!("invalid MAC address {}", s))?;
    if !MITEMP_PREFIXES.iter().any(|prefix| address.octets[..3] == prefix[..]) {
        return Err(format!("invalid MiTemp MAC address {}", s));
    }
    Ok(address)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config =
        mitemp_bridge::load_config(cli.config.as_deref()).context("loading configuration")?;
    if let Some(backend) = cli.backend {
        config.bluetooth.backend = backend;
    }
    if let Some(adapter) = cli.adapter {
        config.bluetooth.adapter = adapter;
    }

    match cli.command {
        Command::Poll(args) => {
            if let Some(server) = &args.server {
                config.mqtt.host = server.clone();
            }
            if let Some(port) = args.port {
                config.mqtt.port = port;
            }
            config.validate()?;
            poll(&config, args)
        }
        Command::Show { macs, devinfo } => {
            config.validate()?;
            show(&config, macs, devinfo)
        }
        Command::Backends => {
            for kind in BackendKind::available(&config.bluetooth) {
                println!("{}", kind);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Scan { timeout } => {
            config.validate()?;
            let timeout = timeout.map_or(config.bluetooth.scan_timeout(), Duration::from_secs);
            scan(&config, timeout)
        }
    }
}

fn sensors(config: &Config, macs: Vec<DeviceAddress>) -> Result<Vec<DeviceAddress>> {
    let macs = if macs.is_empty() {
        config
            .sensors
            .iter()
            .map(|mac| parse_sensor(mac).map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()?
    } else {
        macs
    };
    if macs.is_empty() {
        bail!("no sensors given on the command line or in the configuration");
    }
    let address_type = config.bluetooth.address_type;
    Ok(macs.into_iter().map(|mac| mac.with_type(address_type)).collect())
}

fn sensor_poller(config: &Config, address: DeviceAddress) -> SensorPoller {
    SensorPoller::new(
        address,
        config.bluetooth.backend.build(&config.bluetooth),
        config.poller.settings(),
    )
}

enum Sink {
    Broker(MqttPublisher),
    Console(ConsolePublisher<Stdout>),
}

impl Sink {
    fn publisher(&mut self) -> &mut dyn Publisher {
        match self {
            Sink::Broker(client) => client,
            Sink::Console(console) => console,
        }
    }

    fn close(self) -> Result<()> {
        if let Sink::Broker(client) = self {
            client.disconnect()?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct Selection {
    devinfo: bool,
    health: bool,
    measurements: bool,
}

fn poll(config: &Config, args: PollArgs) -> Result<ExitCode> {
    let sensors = sensors(config, args.macs)?;
    // nothing selected means everything
    let everything = !(args.devinfo || args.health || args.measurements);
    let selection = Selection {
        devinfo: args.devinfo || everything,
        health: args.health || everything,
        measurements: args.measurements || everything,
    };

    let gateway = match &config.mqtt.gateway_mac {
        Some(mac) => mac.parse().context("mqtt.gateway_mac")?,
        None => host_mac(Path::new("/sys/class/net"))
            .context("cannot determine the gateway MAC address")?,
    };

    let mut sink = if args.dry_run {
        Sink::Console(ConsolePublisher::new(io::stdout()))
    } else {
        let settings = BrokerSettings::new(
            format!("{}{}", config.mqtt.client_id_prefix, mac_to_eui64(&gateway)),
            config.mqtt.host.clone(),
            config.mqtt.port,
        )
        .with_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs.into()));
        Sink::Broker(MqttPublisher::connect(&settings).context("connecting to the MQTT broker")?)
    };

    let mut failures = 0;
    for address in &sensors {
        let topics = Topics::new(&config.mqtt.topic_root, &gateway, address);
        let mut poller = sensor_poller(config, *address);
        match poll_sensor(&mut poller, &topics, sink.publisher(), selection) {
            Ok(()) => info!(%address, "published"),
            Err(e) => {
                failures += 1;
                error!(%address, "{:#}", e);
            }
        }
    }
    sink.close()?;

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn poll_sensor(
    poller: &mut SensorPoller,
    topics: &Topics,
    publisher: &mut dyn Publisher,
    selection: Selection,
) -> Result<()> {
    if selection.devinfo {
        let message = DeviceInfoMessage {
            name: poller.name()?,
            firmware_version: poller.firmware_version()?,
        };
        publish_json(publisher, &topics.device_info, &message)?;
    }
    if selection.health {
        let message = MeasurementsMessage::battery(poller.battery_level()?);
        publish_json(publisher, &topics.health, &message)?;
    }
    if selection.measurements {
        let message = MeasurementsMessage::climate(
            poller.parameter_value(Parameter::Temperature)?,
            poller.parameter_value(Parameter::Humidity)?,
        );
        publish_json(publisher, &topics.status, &message)?;
    }
    Ok(())
}

fn show(config: &Config, macs: Vec<DeviceAddress>, devinfo: bool) -> Result<ExitCode> {
    let mut failures = 0;
    for address in sensors(config, macs)? {
        let mut poller = sensor_poller(config, address);
        match describe(&mut poller, devinfo) {
            Ok(line) => println!("{}->{}", address, line),
            Err(e) => {
                failures += 1;
                error!(%address, "{:#}", e);
            }
        }
    }
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// One `show` line: device information or the current measurements as JSON.
fn describe(poller: &mut SensorPoller, devinfo: bool) -> Result<String> {
    if devinfo {
        let info = serde_json::json!({
            "name": poller.name()?,
            "fw": poller.firmware_version()?,
            "battery": poller.battery_level()?,
        });
        return Ok(info.to_string());
    }
    let message = MeasurementsMessage::climate(
        poller.parameter_value(Parameter::Temperature)?,
        poller.parameter_value(Parameter::Humidity)?,
    );
    Ok(serde_json::to_string(&message)?)
}

fn scan(config: &Config, timeout: Duration) -> Result<ExitCode> {
    let mut backend = config.bluetooth.backend.build(&config.bluetooth);
    info!(backend = %config.bluetooth.backend, ?timeout, "scanning");
    let devices = backend
        .scan_for_devices(timeout)
        .with_context(|| format!("scanning with {}", config.bluetooth.backend))?;
    for device in devices {
        let marker = if parse_sensor(&device.address.to_string()).is_ok() {
            " *"
        } else {
            ""
        };
        println!(
            "{} {}{}",
            device.address,
            device.name.as_deref().unwrap_or("(unknown)"),
            marker
        );
    }
    Ok(ExitCode::SUCCESS)
}

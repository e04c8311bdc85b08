//! STeaMi mesh command-line tool
//!
//! - `encode` / `decode`: build or inspect a single advertising frame
//! - `preset`: print a role's default node configuration as JSON
//! - `simulate`: run a demo deployment on the simulated air

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

use steami_mesh::ble::simulated::SimAir;
use steami_mesh::hal::sim::{FixedGauge, ScriptedSensor, SimIndicator};
use steami_mesh::hal::{Indicator, IndicatorBank};
use steami_mesh::{
    Codec, MeshNode, Message, NodeConfig, NodeHandle, NodeReport, Packet, PayloadFormat,
    Peripherals, Preset, ScalarWidth,
};

#[derive(Parser)]
#[command(name = "steami-mesh")]
#[command(author, version, about = "STeaMi advertising mesh tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode one frame and print it as hex
    Encode {
        #[command(flatten)]
        format: FormatArgs,

        /// Broadcast name of the transmitting node
        #[arg(short, long)]
        name: String,

        /// Scalar payload
        #[arg(short, long, allow_hyphen_values = true)]
        payload: i32,

        /// Originating node (defaults to the name)
        #[arg(long)]
        source: Option<String>,

        /// Intended consumer
        #[arg(long)]
        destination: Option<String>,

        #[arg(long, default_value = "0")]
        hop: u8,
    },

    /// Decode a hex frame and print the packet as JSON
    Decode {
        #[command(flatten)]
        format: FormatArgs,

        /// Frame bytes in hex
        frame: String,
    },

    /// Print the default configuration of a preset
    Preset {
        /// peer, sensor, relay, terminal_relay, consumer, mesh_endpoint, mesh_relay
        preset: String,

        #[arg(short, long, default_value = "STeaMi")]
        name: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a demo deployment in-process
    Simulate {
        #[arg(short, long, value_enum, default_value = "presence")]
        scenario: Scenario,

        /// Wall-clock run time in seconds
        #[arg(long, default_value = "6")]
        seconds: u64,

        /// Probability that a receiver misses a frame
        #[arg(long, default_value = "0.0")]
        loss: f64,

        #[arg(long, default_value = "1")]
        seed: u64,

        /// Distance reported by the sensing nodes (mm)
        #[arg(long, default_value = "250")]
        distance: i32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WireFormat {
    RawI8,
    RawI16,
    Obfuscated,
}

#[derive(clap::Args)]
struct FormatArgs {
    /// Payload format of the deployment
    #[arg(short, long, value_enum, default_value = "raw-i16")]
    format: WireFormat,

    /// XOR key of the obfuscated format
    #[arg(long, default_value_t = PayloadFormat::DEFAULT_KEY)]
    key: u8,

    /// Id length of the obfuscated format
    #[arg(long, default_value_t = PayloadFormat::DEFAULT_ID_LEN)]
    id_len: usize,
}

impl FormatArgs {
    fn payload_format(&self) -> PayloadFormat {
        match self.format {
            WireFormat::RawI8 => PayloadFormat::raw(ScalarWidth::I8),
            WireFormat::RawI16 => PayloadFormat::raw(ScalarWidth::I16),
            WireFormat::Obfuscated => PayloadFormat::Obfuscated {
                key: self.key,
                width: ScalarWidth::I16,
                id_len: self.id_len,
            },
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// Two peers listing each other
    Peers,
    /// Sensor -> terminal relay -> relay -> consumer, raw frames
    Presence,
    /// Endpoint -> two relays -> endpoint, structured records
    Mesh,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            format,
            name,
            payload,
            source,
            destination,
            hop,
        } => {
            let mut message = Message::new(source.unwrap_or_else(|| name.clone()), payload);
            message.destination_id = destination;
            message.hop_count = hop;
            let frame = Codec::new(format.payload_format())
                .encode(&Packet::new(name, message))
                .context("encoding frame")?;
            println!("{}", hex::encode(frame));
        }
        Commands::Decode { format, frame } => {
            let bytes = hex::decode(frame.trim()).context("frame is not hex")?;
            let packet = Codec::new(format.payload_format())
                .decode(&bytes)
                .context("decoding frame")?;
            println!("{}", serde_json::to_string_pretty(&packet)?);
        }
        Commands::Preset {
            preset,
            name,
            output,
        } => {
            let Some(preset) = Preset::parse(&preset) else {
                bail!("Unknown preset '{}'", preset);
            };
            let config = NodeConfig::preset(preset, &name);
            config.validate()?;
            match output {
                Some(path) => {
                    config.save(&path)?;
                    log::info!("Wrote {} preset to {}", preset.as_str(), path.display());
                }
                None => println!("{}", config.to_json_pretty()?),
            }
        }
        Commands::Simulate {
            scenario,
            seconds,
            loss,
            seed,
            distance,
        } => {
            if !(0.0..=1.0).contains(&loss) {
                bail!("Loss must be between 0 and 1, got {}", loss);
            }
            simulate(scenario, Duration::from_secs(seconds), loss, seed, distance).await?;
        }
    }
    Ok(())
}

/// One simulated board and the probes kept on it.
struct SimNode {
    name: String,
    /// Start offset on the shared air.
    offset: Duration,
    node: MeshNode,
    leds: Vec<SimIndicator>,
}

impl SimNode {
    fn new(
        air: &Arc<SimAir>,
        config: NodeConfig,
        distance: Option<i32>,
        leds: usize,
        offset: Duration,
    ) -> Result<Self> {
        let probes: Vec<SimIndicator> = (0..leds).map(|_| SimIndicator::new()).collect();
        let peripherals = Peripherals {
            sensor: distance.map(|d| {
                Box::new(ScriptedSensor::constant(d)) as Box<dyn steami_mesh::hal::DistanceSensor>
            }),
            gauge: Some(Box::new(FixedGauge::new(11.8))),
            display: None,
            indicators: IndicatorBank::new(
                probes
                    .iter()
                    .map(|led| Box::new(led.clone()) as Box<dyn Indicator>)
                    .collect(),
            ),
        };
        let name = config.name.clone();
        let node = MeshNode::new(config, Arc::new(air.create_radio()), peripherals)
            .with_context(|| format!("configuring {}", name))?;
        Ok(Self {
            name,
            offset,
            node,
            leds: probes,
        })
    }
}

fn scenario_nodes(air: &Arc<SimAir>, scenario: Scenario, distance: i32) -> Result<Vec<SimNode>> {
    // Half a default cycle, so same-timed nodes do not scan in lockstep.
    let half = Duration::from_millis(450);
    let now = Duration::ZERO;
    let nodes = match scenario {
        Scenario::Peers => vec![
            SimNode::new(air, NodeConfig::preset(Preset::Peer, "STeaMi-1A2B"), Some(distance), 0, now)?,
            SimNode::new(air, NodeConfig::preset(Preset::Peer, "STeaMi-77C0"), Some(distance + 300), 0, half)?,
        ],
        Scenario::Presence => vec![
            SimNode::new(air, NodeConfig::preset(Preset::Sensor, "STeaMi-S"), Some(distance), 0, now)?,
            SimNode::new(air, NodeConfig::preset(Preset::TerminalRelay, "STeaMi-R"), None, 3, now)?,
            SimNode::new(air, NodeConfig::preset(Preset::Relay, "STeaMi-R2"), None, 3, half)?,
            SimNode::new(air, NodeConfig::preset(Preset::Consumer, "STeaMi-A"), None, 3, now)?,
        ],
        Scenario::Mesh => {
            let mut origin = NodeConfig::preset(Preset::MeshEndpoint, "STeaMi-S1");
            origin.destination = Some("STeaMi-S2".into());
            vec![
                SimNode::new(air, origin, Some(distance), 1, now)?,
                SimNode::new(air, NodeConfig::preset(Preset::MeshRelay, "STeaMi-R1"), None, 0, now)?,
                SimNode::new(air, NodeConfig::preset(Preset::MeshRelay, "STeaMi-R2"), None, 0, now)?,
                SimNode::new(air, NodeConfig::preset(Preset::MeshEndpoint, "STeaMi-S2"), None, 1, now)?,
            ]
        }
    };
    Ok(nodes)
}

async fn simulate(
    scenario: Scenario,
    duration: Duration,
    loss: f64,
    seed: u64,
    distance: i32,
) -> Result<()> {
    let air = if loss > 0.0 {
        SimAir::with_loss(loss, seed)
    } else {
        SimAir::new()
    };
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut running = Vec::new();
    for sim in scenario_nodes(&air, scenario, distance)? {
        let handle = sim.node.handle();
        let stop = stop_rx.clone();
        let offset = sim.offset;
        let node = sim.node;
        let task = tokio::spawn(async move {
            tokio::time::sleep(offset).await;
            node.run(stop).await
        });
        running.push((sim.name, handle, sim.leds, task));
    }

    tokio::time::sleep(duration).await;
    stop_tx.send(true)?;

    for (name, handle, leds, task) in running {
        let report = task.await.context("node task panicked")?;
        print_node(&name, &handle, &leds, &report).await;
    }
    Ok(())
}

async fn print_node(name: &str, handle: &NodeHandle, leds: &[SimIndicator], report: &NodeReport) {
    println!("== {}", name);
    println!(
        "  cycles {}  scans {}  adverts {} (timeouts {}, failures {})",
        report.cycles.cycles,
        report.cycles.scan_windows,
        report.cycles.advertise_windows,
        report.cycles.advertise_timeouts,
        report.cycles.advertise_failures
    );
    println!(
        "  heard {}  accepted {}  duplicates {}  ignored {}  forwarded {}  decode errors {}",
        report.cycles.packets,
        report.relay.accepted,
        report.relay.duplicates,
        report.relay.ignored,
        report.relay.queued,
        report.decode_errors
    );
    if let Some(value) = handle.own_value() {
        println!("  own value {}", value);
    }
    if let Some(delivery) = handle.last_delivery() {
        println!(
            "  last delivery {} from {} (code {:?})",
            delivery.payload, delivery.source_id, delivery.code
        );
    }
    for peer in handle.recent_peers(4).await {
        println!("  peer {:<10} {:>6}  {:?} ago", peer.name, peer.value, peer.age);
    }
    for (code, led) in leds.iter().enumerate() {
        println!("  indicator {} lit {} time(s)", code, led.times_lit());
    }
}

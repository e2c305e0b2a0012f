use clap::{Parser, Subcommand};
use hound::WavSpec;
use log::{debug, info};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tonerelay_core::{
    parse_frame, Config, Destination, DeviceId, DeviceIdentity, Demodulator, MessageId, Modulator,
    Packet, SimulatedMesh, SpectrumAnalyzer, ToneSynthesizer, END_MARKER, START_MARKER,
};

/// Silence written before and after an encoded packet
const WAV_PADDING_MS: u64 = 200;

#[derive(Debug, Error)]
enum CliError {
    #[error("Unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("Recording is {found} Hz, expected {expected} Hz")]
    SampleRateMismatch { expected: u32, found: u32 },

    #[error("Unknown destination {0:?}: use \"broadcast\" or a device index")]
    UnknownDestination(String),

    #[error("Cannot read config {path}: {reason}")]
    Config { path: PathBuf, reason: String },
}

#[derive(Parser)]
#[command(name = "tonerelay")]
#[command(about = "Acoustic short-text messaging with flood relay")]
struct Cli {
    /// JSON configuration file (modem and relay settings)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one packet to a WAV file
    Encode {
        /// Source device id
        #[arg(long)]
        from: String,

        /// Destination device id or "broadcast"
        #[arg(long, default_value = "broadcast")]
        to: String,

        /// Message id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Hop count to put in the header
        #[arg(long, default_value = "0")]
        hop: u32,

        /// Message text
        #[arg(value_name = "MESSAGE")]
        message: String,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,
    },

    /// Print every packet heard in a WAV recording
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// One JSON object per packet
        #[arg(long)]
        json: bool,
    },

    /// Flood one message through an in-memory mesh of devices
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value = "4")]
        devices: usize,

        /// Message sent by device 0
        #[arg(short, long, default_value = "hello mesh")]
        message: String,

        /// "broadcast" or the index of the destination device
        #[arg(long, default_value = "broadcast")]
        to: String,

        /// Stop forwarding beyond this hop count
        #[arg(long)]
        max_hops: Option<u32>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the device id this session would use
    Id {
        /// Use this id instead of generating one
        #[arg(long = "override", value_name = "ID")]
        override_id: Option<String>,
    },
}

#[derive(Serialize)]
struct PacketReport {
    source: String,
    destination: String,
    message_id: String,
    hop: u32,
    payload: String,
    complete: bool,
}

impl PacketReport {
    fn new(packet: &Packet, complete: bool) -> Self {
        Self {
            source: packet.source.to_string(),
            destination: packet.destination.to_string(),
            message_id: packet.message_id.to_string(),
            hop: packet.hop,
            payload: packet.payload.clone(),
            complete,
        }
    }
}

#[derive(Serialize)]
struct SimulationReport {
    devices: Vec<String>,
    transmissions: Vec<TransmissionReport>,
    deliveries: Vec<DeliveryReport>,
}

#[derive(Serialize)]
struct TransmissionReport {
    sender: String,
    text: String,
}

#[derive(Serialize)]
struct DeliveryReport {
    receiver: String,
    #[serde(flatten)]
    packet: PacketReport,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Encode {
            from,
            to,
            id,
            hop,
            message,
            output,
        } => encode_command(&config, &from, &to, id, hop, &message, &output)?,
        Commands::Decode { input, json } => decode_command(&config, &input, json)?,
        Commands::Simulate {
            devices,
            message,
            to,
            max_hops,
            json,
        } => simulate_command(config, devices, &message, &to, max_hops, json)?,
        Commands::Id { override_id } => id_command(&config, override_id.as_deref())?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| CliError::Config {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            serde_json::from_str(&text).map_err(|e| CliError::Config {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        }
        None => Config::default(),
    };
    config.validate()?;
    debug!("Using config {:?}", config);
    Ok(config)
}

fn encode_command(
    config: &Config,
    from: &str,
    to: &str,
    id: Option<String>,
    hop: u32,
    message: &str,
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let message_id = match id {
        Some(id) => MessageId::new(id)?,
        None => MessageId::generate(&mut rand::thread_rng(), std::time::SystemTime::now()),
    };
    let packet = Packet {
        source: DeviceId::new(from)?,
        destination: Destination::parse(to)?,
        message_id,
        hop,
        payload: message
            .chars()
            .filter(|&c| c != START_MARKER && c != END_MARKER)
            .collect(),
    };

    let wire = packet.to_wire();
    let plan = Modulator::new(&config.modem).plan(&wire);
    if !plan.skipped.is_empty() {
        println!("Skipped unsupported characters: {:?}", plan.skipped);
    }

    let padding = vec![0.0f32; config.modem.sample_rate * WAV_PADDING_MS as usize / 1000];
    let mut samples = padding.clone();
    samples.extend(ToneSynthesizer::new(&config.modem).render(&plan));
    samples.extend_from_slice(&padding);
    println!(
        "Encoded {:?} to {} tones ({:?})",
        wire,
        plan.len(),
        plan.total_duration()
    );

    write_wav(output_path, &samples, config.modem.sample_rate as u32)?;
    println!("Wrote {} samples to {}", samples.len(), output_path.display());
    Ok(())
}

fn decode_command(config: &Config, input_path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let samples = read_wav(input_path, config.modem.sample_rate as u32)?;
    info!("Extracted {} samples", samples.len());

    let mut analyzer = SpectrumAnalyzer::new(&config.modem)?;
    let mut demodulator = Demodulator::new(&config.modem);
    let mut frames = Vec::new();
    for (now, spectrum) in analyzer.frames(&samples)? {
        frames.extend(demodulator.push_spectrum(now, &spectrum));
    }
    frames.extend(demodulator.finish());

    let mut decoded = 0;
    for frame in frames {
        let packet = match parse_frame(&frame.text) {
            Ok(packet) => packet,
            Err(e) => {
                eprintln!("Dropped frame {:?}: {}", frame.text, e);
                continue;
            }
        };
        decoded += 1;
        if json {
            println!("{}", serde_json::to_string(&PacketReport::new(&packet, frame.complete))?);
        } else {
            println!(
                "{} -> {} #{} hop {}{}: {}",
                packet.source,
                packet.destination,
                packet.message_id,
                packet.hop,
                if frame.complete { "" } else { " (partial)" },
                packet.payload
            );
        }
    }

    if !json {
        println!("Decoded {} packets", decoded);
    }
    Ok(())
}

fn simulate_command(
    mut config: Config,
    devices: usize,
    message: &str,
    to: &str,
    max_hops: Option<u32>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if max_hops.is_some() {
        config.relay.max_hops = max_hops;
    }
    let mut mesh = SimulatedMesh::generate(devices, &config, &mut rand::thread_rng());
    let ids = mesh.ids();

    let destination = if to == tonerelay_core::BROADCAST {
        Destination::Broadcast
    } else {
        let index: usize = to
            .parse()
            .map_err(|_| CliError::UnknownDestination(to.to_string()))?;
        let id = ids
            .get(index)
            .ok_or_else(|| CliError::UnknownDestination(to.to_string()))?;
        Destination::Device(id.clone())
    };

    let sent = mesh
        .send(0, destination, message)
        .ok_or_else(|| CliError::UnknownDestination("device 0".to_string()))?;
    let report = mesh.run();

    if json {
        let summary = SimulationReport {
            devices: ids.iter().map(ToString::to_string).collect(),
            transmissions: report
                .transmissions
                .iter()
                .map(|t| TransmissionReport {
                    sender: t.sender.to_string(),
                    text: t.text.clone(),
                })
                .collect(),
            deliveries: report
                .deliveries
                .iter()
                .map(|(receiver, delivery)| DeliveryReport {
                    receiver: receiver.to_string(),
                    packet: PacketReport::new(&delivery.packet, delivery.complete),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Devices: {}", ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "));
    println!("Message {} from {}", sent.message_id, sent.source);
    for transmission in &report.transmissions {
        println!("  {} transmits {}", transmission.sender, transmission.text);
    }
    for (receiver, delivery) in &report.deliveries {
        println!(
            "  {} received {:?} (hop {})",
            receiver, delivery.packet.payload, delivery.packet.hop
        );
    }
    println!(
        "{} transmissions, {} deliveries",
        report.transmissions.len(),
        report.deliveries.len()
    );
    Ok(())
}

fn id_command(config: &Config, override_id: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let identity = DeviceIdentity::resolve(
        override_id,
        &config.relay.privileged_id,
        &mut rand::thread_rng(),
    )?;
    if identity.is_privileged() {
        println!("{} (privileged)", identity.id());
    } else {
        println!("{}", identity.id());
    }
    Ok(())
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), Box<dyn std::error::Error>> {
    // 16-bit PCM
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let file = File::create(path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * 32767.0) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

fn read_wav(path: &Path, expected_rate: u32) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = hound::WavReader::new(file)?;

    let spec = reader.spec();
    info!(
        "Read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );
    if spec.sample_rate != expected_rate {
        return Err(CliError::SampleRateMismatch {
            expected: expected_rate,
            found: spec.sample_rate,
        }
        .into());
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => {
            let int_samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
            int_samples?.into_iter().map(|s| s as f32 / 32768.0).collect()
        }
        (hound::SampleFormat::Float, 32) => {
            let float_samples: Result<Vec<f32>, _> = reader.samples::<f32>().collect();
            float_samples?
        }
        (_, bits) => return Err(CliError::UnsupportedBitDepth(bits).into()),
    };

    // First channel only
    let channels = spec.channels.max(1) as usize;
    Ok(interleaved.into_iter().step_by(channels).collect())
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tabled::{Table, Tabled};
use tokio::sync::mpsc;

use enip_adapter::adapter::{Adapter, AdapterSnapshot, CmRequest, ServiceOutcome, SharedAdapter};
use enip_adapter::config::{Config, ENCAPSULATION_PROTOCOL_VERSION};
use enip_adapter::connection::{
    ConnectionClass, ConnectionPath, ConnectionTriple, ForwardOpenRequest, NetworkParams,
    TransportTrigger,
};
use enip_adapter::io::{CipReplyEncoder, FrameSink, MemoryAssemblies, ProducedFrame, RUN_IDLE_RUN};
use enip_adapter::scheduler::TickScheduler;

const INPUT_ASSEMBLY: u32 = 100;
const FIRST_OUTPUT_ASSEMBLY: u32 = 150;
const SIMULATED_VENDOR: u16 = 0x1337;

#[derive(Parser)]
#[command(name = "enip-adapter")]
#[command(author, version, about = "EtherNet/IP adapter connection and session manager")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log level from the configuration file, if one is given and readable
    pub fn log_level(&self) -> String {
        self.config
            .as_ref()
            .and_then(|path| Config::from_file(path).ok())
            .map(|c| c.logging.level)
            .unwrap_or_else(|| "info".to_string())
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate default configuration file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration and show the resulting budgets
    Check {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Open connections from a simulated originator and run the tick scan
    Simulate {
        /// Exclusive-owner connections to request
        #[arg(long, default_value = "2")]
        exclusive_owners: u16,

        /// Input-only connections to request
        #[arg(long, default_value = "1")]
        input_only: u16,

        /// Requested packet interval (microseconds)
        #[arg(long, default_value = "10000")]
        rpi_us: u32,

        /// Timer ticks to simulate
        #[arg(long, default_value = "100")]
        ticks: u32,

        /// Output assembly size (bytes)
        #[arg(long, default_value = "4")]
        output_size: u16,

        /// Input assembly size (bytes)
        #[arg(long, default_value = "8")]
        input_size: u16,

        /// Originator goes silent after this many ticks
        #[arg(long)]
        silent_after: Option<u32>,

        /// Run on the wall clock with the tick scheduler
        #[arg(long)]
        realtime: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Table row for the connection list
#[derive(Tabled)]
struct ConnectionRow {
    #[tabled(rename = "Triple")]
    triple: String,
    #[tabled(rename = "Class")]
    class: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "O->T ID")]
    consumed_id: String,
    #[tabled(rename = "T->O ID")]
    produced_id: String,
    #[tabled(rename = "API (us)")]
    api: String,
}

/// Table row for budgets
#[derive(Tabled)]
struct BudgetRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Capacity")]
    capacity: String,
}

/// Transport that only counts what it is given
#[derive(Default)]
struct CountingTransport {
    replies: u64,
    produced: u64,
    bytes: u64,
}

impl FrameSink for CountingTransport {
    fn send_reply(&mut self, _originator: SocketAddr, frame: &[u8]) -> enip_adapter::Result<()> {
        self.replies += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn send_produced(&mut self, frame: &ProducedFrame<'_>) -> enip_adapter::Result<()> {
        self.produced += 1;
        self.bytes += frame.payload.len() as u64;
        Ok(())
    }
}

/// Simulation parameters
struct Simulation {
    exclusive_owners: u16,
    input_only: u16,
    rpi_us: u32,
    ticks: u32,
    output_size: u16,
    input_size: u16,
    silent_after: Option<u32>,
}

/// A connection the simulated originator feeds
struct Feed {
    consumed_id: u32,
    class: ConnectionClass,
    sequence: u16,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };

    match cli.command {
        Commands::Config { output } => cmd_config(output),
        Commands::Check { json } => cmd_check(config, json),
        Commands::Simulate {
            exclusive_owners,
            input_only,
            rpi_us,
            ticks,
            output_size,
            input_size,
            silent_after,
            realtime,
            json,
        } => {
            let sim = Simulation {
                exclusive_owners,
                input_only,
                rpi_us,
                ticks,
                output_size,
                input_size,
                silent_after,
            };
            cmd_simulate(config, sim, realtime, json).await
        }
    }
}

fn cmd_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();

    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", config.to_string()?);
        }
    }

    Ok(())
}

fn cmd_check(config: Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("{}", "Configuration OK".green().bold());
    println!(
        "Device: {} (vendor {}, type {}, product {}, rev {}.{})",
        config.identity.device_name.cyan(),
        config.identity.vendor_id,
        config.identity.device_type,
        config.identity.product_code,
        config.identity.major_revision,
        config.identity.minor_revision
    );
    println!();

    let c = &config.connections;
    let mut rows = vec![BudgetRow {
        resource: "sessions".to_string(),
        capacity: config.sessions.max_sessions.to_string(),
    }];
    for class in ConnectionClass::ALL {
        let capacity = match c.per_path_capacity(class) {
            Some(per_path) => format!("{} ({} per path)", c.capacity(class), per_path),
            None => c.capacity(class).to_string(),
        };
        rows.push(BudgetRow {
            resource: format!("{} connections", class),
            capacity,
        });
    }
    rows.push(BudgetRow {
        resource: "reply / produce buffers".to_string(),
        capacity: format!(
            "{} / {} x {} bytes",
            config.buffers.reply_buffers,
            config.buffers.produce_buffers,
            config.buffers.reply_buffer_size
        ),
    });
    rows.push(BudgetRow {
        resource: "receive buffers".to_string(),
        capacity: format!(
            "{} x {} bytes",
            config.buffers.receive_buffers, config.buffers.ethernet_buffer_size
        ),
    });
    println!("{}", Table::new(rows));

    println!();
    println!("Tick:            {}us", config.timing.tick_us);
    println!(
        "RPI range:       {}us .. {}us",
        config.min_rpi_us(),
        c.max_rpi_us
    );
    println!("Session timeout: {}s", config.sessions.idle_timeout_secs);
    println!("Teardown policy: {}", config.sessions.teardown_policy);

    Ok(())
}

async fn cmd_simulate(config: Config, sim: Simulation, realtime: bool, json: bool) -> Result<()> {
    if sim.rpi_us < config.min_rpi_us() {
        bail!(
            "RPI {}us is below the minimum of {}us",
            sim.rpi_us,
            config.min_rpi_us()
        );
    }

    let mut assemblies = MemoryAssemblies::new();
    assemblies.insert(INPUT_ASSEMBLY, usize::from(sim.input_size));
    for i in 0..u32::from(sim.exclusive_owners) {
        assemblies.insert(FIRST_OUTPUT_ASSEMBLY + i, usize::from(sim.output_size));
    }

    let tick = config.timing.tick();
    let mut adapter = Adapter::new(config, assemblies)?;
    let peer: SocketAddr = "192.168.1.10:44818".parse()?;
    let mut transport = CountingTransport::default();
    let start = Instant::now();

    let session = adapter.register_session(peer, ENCAPSULATION_PROTOCOL_VERSION, 0, start)?;
    let feeds = open_connections(&mut adapter, &sim, peer, session, start, &mut transport)?;

    let (snapshot, rows) = if realtime {
        run_realtime(adapter, feeds, &sim, tick).await?
    } else {
        run_virtual(&mut adapter, feeds, &sim, start, tick, &mut transport)?;
        (adapter.snapshot(), connection_rows(&adapter))
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    print_summary(&snapshot, rows);
    Ok(())
}

fn open_connections(
    adapter: &mut Adapter,
    sim: &Simulation,
    peer: SocketAddr,
    session: enip_adapter::SessionHandle,
    now: Instant,
    transport: &mut CountingTransport,
) -> Result<Vec<Feed>> {
    let config = adapter.config().clone();
    let sequence = 2;
    let consumed_header = if config.io.consumed_has_run_idle_header { 4 } else { 0 };
    let produced_header = if config.io.produced_has_run_idle_header { 4 } else { 0 };
    let t_to_o_size = sequence + produced_header + sim.input_size;

    let mut requests = Vec::new();
    for i in 0..sim.exclusive_owners {
        requests.push(ForwardOpenRequest {
            triple: triple(i),
            o_to_t_connection_id: 0,
            t_to_o_connection_id: 0,
            timeout_multiplier: 0,
            o_to_t: NetworkParams::point_to_point(
                sim.rpi_us,
                sequence + consumed_header + sim.output_size,
            ),
            t_to_o: NetworkParams::multicast(sim.rpi_us, t_to_o_size),
            transport: TransportTrigger::cyclic_class1(),
            path: ConnectionPath::assembly(FIRST_OUTPUT_ASSEMBLY + u32::from(i), INPUT_ASSEMBLY),
            large: false,
        });
    }
    for i in 0..sim.input_only {
        let serial = sim.exclusive_owners + i;
        requests.push(ForwardOpenRequest {
            triple: triple(serial),
            o_to_t_connection_id: 0,
            t_to_o_connection_id: 0x8000_0000 | u32::from(serial),
            timeout_multiplier: 0,
            o_to_t: NetworkParams::point_to_point(sim.rpi_us, sequence),
            t_to_o: NetworkParams::point_to_point(sim.rpi_us, t_to_o_size),
            transport: TransportTrigger::cyclic_class1(),
            path: ConnectionPath::assembly(config.assemblies.heartbeat_input_only, INPUT_ASSEMBLY),
            large: false,
        });
    }

    let mut feeds = Vec::new();
    for request in requests {
        let triple = request.triple;
        let outcome = adapter.handle_request(
            peer,
            session,
            &CmRequest::ForwardOpen(request),
            now,
            &CipReplyEncoder,
            transport,
        )?;
        match outcome {
            ServiceOutcome::Opened(response) => {
                println!(
                    "{} {} {} (O->T 0x{:08X})",
                    "Opened".green().bold(),
                    response.class,
                    triple,
                    response.o_to_t_connection_id
                );
                feeds.push(Feed {
                    consumed_id: response.o_to_t_connection_id,
                    class: response.class,
                    sequence: 0,
                });
            }
            ServiceOutcome::Rejected(status) => {
                println!("{} {} (status {})", "Rejected".red().bold(), triple, status);
            }
            ServiceOutcome::Closed(_) => {}
        }
    }

    Ok(feeds)
}

fn triple(serial: u16) -> ConnectionTriple {
    ConnectionTriple {
        connection_serial: serial + 1,
        originator_vendor_id: SIMULATED_VENDOR,
        originator_serial: 0x0000_0001,
    }
}

/// Next O->T packet of a feed
fn next_packet(feed: &mut Feed, output_size: u16, run_idle: bool, fill: u8) -> Vec<u8> {
    feed.sequence = feed.sequence.wrapping_add(1);
    let mut packet = feed.sequence.to_le_bytes().to_vec();
    if feed.class == ConnectionClass::ExclusiveOwner {
        if run_idle {
            packet.extend_from_slice(&RUN_IDLE_RUN.to_le_bytes());
        }
        packet.extend(std::iter::repeat(fill).take(usize::from(output_size)));
    }
    packet
}

fn run_virtual(
    adapter: &mut Adapter,
    mut feeds: Vec<Feed>,
    sim: &Simulation,
    start: Instant,
    tick: Duration,
    transport: &mut CountingTransport,
) -> Result<()> {
    let run_idle = adapter.config().io.consumed_has_run_idle_header;
    let rpi = Duration::from_micros(u64::from(sim.rpi_us));
    let mut next_send = start;

    for n in 0..sim.ticks {
        let now = start + tick * n;
        let talking = sim.silent_after.map_or(true, |limit| n < limit);
        if talking && now >= next_send {
            for feed in &mut feeds {
                let packet = next_packet(feed, sim.output_size, run_idle, n as u8);
                if let Err(e) = adapter.on_io_data(feed.consumed_id, &packet, now) {
                    tracing::debug!("I/O data not consumed: {}", e);
                }
            }
            next_send += rpi;
        }

        let report = adapter.on_tick(now, transport)?;
        for triple in &report.timed_out {
            println!("{} {} at tick {}", "Timed out".yellow().bold(), triple, n);
        }
    }

    Ok(())
}

async fn run_realtime(
    adapter: Adapter,
    mut feeds: Vec<Feed>,
    sim: &Simulation,
    tick: Duration,
) -> Result<(AdapterSnapshot, Vec<ConnectionRow>)> {
    let run_idle = adapter.config().io.consumed_has_run_idle_header;
    let shared = SharedAdapter::new(adapter);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let mut scheduler = TickScheduler::new(shared.clone(), CountingTransport::default(), tick)
        .with_shutdown(shutdown_rx);
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let duration = tick * sim.ticks;
    let silent_at = sim.silent_after.map(|n| tick * n);
    let started = tokio::time::Instant::now();
    let mut feeder = tokio::time::interval(Duration::from_micros(u64::from(sim.rpi_us)));

    loop {
        let now = feeder.tick().await;
        let elapsed = now.duration_since(started);
        if elapsed >= duration {
            break;
        }
        if silent_at.map_or(false, |limit| elapsed >= limit) {
            continue;
        }
        for feed in &mut feeds {
            let packet = next_packet(feed, sim.output_size, run_idle, elapsed.as_millis() as u8);
            if let Err(e) = shared.on_io_data(feed.consumed_id, &packet).await {
                tracing::debug!("I/O data not consumed: {}", e);
            }
        }
    }

    // Closing the channel stops the scheduler as well
    let _ = shutdown_tx.send(()).await;
    let stats = scheduler_task.await.context("tick scheduler task failed")?;
    println!(
        "{} {} ticks, {} produced, {} timed out",
        "Scheduler:".bold(),
        stats.ticks,
        stats.produced,
        stats.timed_out
    );

    let inner = shared.clone_inner();
    let adapter = inner.lock().await;
    Ok((adapter.snapshot(), connection_rows(&adapter)))
}

fn connection_rows(adapter: &Adapter) -> Vec<ConnectionRow> {
    let mut connections: Vec<_> = adapter.connections().iter().collect();
    connections.sort_by_key(|c| c.triple.connection_serial);
    connections
        .into_iter()
        .map(|c| ConnectionRow {
            triple: c.triple.to_string(),
            class: c.class.to_string(),
            state: c.state.to_string(),
            consumed_id: format!("0x{:08X}", c.consumed_id),
            produced_id: format!("0x{:08X}", c.produced_id),
            api: format!("{}/{}", c.o_to_t_api_us, c.t_to_o_api_us),
        })
        .collect()
}

fn print_summary(snapshot: &AdapterSnapshot, rows: Vec<ConnectionRow>) {
    println!();
    println!("{}", "=== Connections ===".bold());
    if rows.is_empty() {
        println!("{}", "No live connections".yellow());
    } else {
        println!("{}", Table::new(rows));
    }

    let c = &snapshot.connections;
    println!();
    println!("{}", "=== Statistics ===".bold());
    println!("Sessions active:     {}", snapshot.sessions.active);
    println!("Connections opened:  {}", c.opened.to_string().green());
    println!("Connections closed:  {}", c.closed);
    println!("Timed out:           {}", c.timed_out.to_string().yellow());
    println!("Rejected:            {}", c.rejected.to_string().red());
    println!("Packets consumed:    {}", c.consumed.to_string().cyan());
    println!("Stale packets:       {}", c.duplicates);
    println!("Packets produced:    {}", c.produced.to_string().cyan());
    println!("Production failures: {}", c.production_failures);
    println!(
        "Buffers exhausted:   {}",
        snapshot.buffers.exhausted
    );
}

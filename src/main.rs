//! racenet demo
//!
//! Runs several simulated game nodes in one process. They share an
//! in-memory directory and loopback transport, elect a host, connect to it
//! and exchange a moving position until the run ends.

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use racenet::core::config::parse_duration;
use racenet::{
    Config, LocalSender, MemoryDirectory, MemoryTransport, NetworkEvent, NetworkEventKind, Role, Session,
    SystemClock,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// A spawned node and the switch that stops it
struct NodeHandle {
    index: usize,
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<racenet::Result<Session>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("racenet")
        .version(racenet::VERSION)
        .about("Simulate a serverless peer-to-peer game session.")
        .arg(
            Arg::new("nodes")
                .short('n')
                .long("nodes")
                .value_name("N")
                .help("Number of simulated nodes"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECS")
                .help("How long to run, in seconds or as a duration string (\"5s\", \"2m\")"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("State tick interval in milliseconds"),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print Prometheus metrics on exit"),
        )
        .get_matches();

    let mut config = if let Some(path) = matches.get_one::<String>("config") {
        let mut config = Config::from_file(path)?;
        config.apply_env_overrides()?;
        config
    } else {
        Config::load()?
    };
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    racenet::init(&config.logging)?;
    info!("Starting {} demo with {} nodes", racenet::NAME, config.demo.nodes);

    let clock = Arc::new(SystemClock);
    let directory = Arc::new(MemoryDirectory::new(clock.clone()));
    let transport = MemoryTransport::new();

    let mut nodes = Vec::with_capacity(config.demo.nodes);
    for index in 0..config.demo.nodes {
        let mut session = Session::new(
            config.session.clone(),
            directory.clone(),
            Arc::new(transport.clone()),
            clock.clone(),
        )?;
        session.network_mut().add_sender(orbiting_car(index));
        session.network_mut().on(NetworkEventKind::Log, move |event| {
            if let NetworkEvent::Log(line) = event {
                info!("[node {}] {}", index, line);
            }
        });

        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            session
                .run(async {
                    let _ = stopped.await;
                })
                .await?;
            Ok::<_, racenet::Error>(session)
        });
        nodes.push(NodeHandle { index, stop, handle });
        tokio::time::sleep(config.demo.stagger).await;
    }

    tokio::select! {
        _ = tokio::time::sleep(config.demo.duration) => {
            info!("Run finished after {:?}", config.demo.duration);
        }
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl+C, stopping early");
        }
    }

    for node in nodes {
        let _ = node.stop.send(());
        let mut session = node
            .handle
            .await
            .with_context(|| format!("node {} panicked", node.index))??;
        print_view(node.index, &session);
        session.shutdown().await;
    }

    if config.demo.print_metrics {
        println!("{}", racenet::system::metrics::collect_metrics());
    }

    info!("Shutdown complete");
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    if let Some(nodes) = matches.get_one::<String>("nodes") {
        config.demo.nodes = nodes.parse().context("Invalid node count")?;
    }

    if let Some(duration) = matches.get_one::<String>("duration") {
        config.demo.duration = match duration.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => parse_duration(duration).map_err(anyhow::Error::msg)?,
        };
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    if let Some(ms) = matches.get_one::<String>("tick-ms") {
        let ms: u64 = ms.parse().context("Invalid tick interval")?;
        config.session.tick_interval = Duration::from_millis(ms);
    }

    if matches.get_flag("metrics") {
        config.demo.print_metrics = true;
    }

    Ok(())
}

/// A car driving in circles, each node on its own lane
fn orbiting_car(index: usize) -> LocalSender {
    let started = Instant::now();
    let radius = 10.0 + 5.0 * index as f64;
    LocalSender::new("car", move || {
        let angle = started.elapsed().as_secs_f64();
        json!({
            "position": {
                "x": radius * angle.cos(),
                "y": radius * angle.sin(),
            },
            "heading": angle,
        })
    })
}

fn print_view(index: usize, session: &Session) {
    let role = match session.role() {
        Role::Host => "host".to_string(),
        Role::Client { host } => format!("client of {}", host),
        Role::Undetermined => "undetermined".to_string(),
    };
    println!("node {} ({}): {}", index, session.peer_id(), role);
    println!("  connected: {:?}", session.network().get_connected_peers());
    for (peer, view) in session.network().get_states() {
        let marker = if view.active { "active" } else { "stale" };
        for (object_id, state) in &view.objects {
            println!("  {}/{} [{}] {}", peer, object_id, marker, state["position"]);
        }
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::time::sleep;

use ballot::raft::Timing;
use ballot::{Config, LocalNetwork, Raft, StateFile};

#[derive(Parser)]
#[command(name = "ballot")]
#[command(about = "Leader election over gossip membership", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an in-process cluster and print each node's state once per second
    Simulate {
        /// Number of nodes to start
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Nodes required before the first election (defaults to --nodes)
        #[arg(short, long)]
        expect: Option<usize>,

        /// How long to run before shutting every node down
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,

        /// Cut the leader off from all traffic halfway through the run
        #[arg(long, default_value_t = false)]
        isolate_leader: bool,

        /// Working directory; each node gets its own subdirectory
        #[arg(short, long, default_value = "ballot-sim")]
        dir: PathBuf,
    },

    /// Print the persisted membership snapshot of a node
    State {
        /// Node working directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },

    /// Validate ballot.json and print the derived timings
    CheckConfig {
        /// Node working directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            nodes,
            expect,
            seconds,
            isolate_leader,
            dir,
        } => simulate(nodes, expect.unwrap_or(nodes), seconds, isolate_leader, &dir).await,
        Command::State { dir } => print_state(&dir),
        Command::CheckConfig { dir } => check_config(&dir),
    }
}

async fn simulate(
    nodes: usize,
    expect: usize,
    seconds: u64,
    isolate_leader: bool,
    dir: &Path,
) -> Result<()> {
    if nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    info!("Simulating {nodes} nodes expecting {expect} for {seconds}s");

    let network = LocalNetwork::new();
    let seed = "127.0.0.1:7947".to_string();
    let mut starting = Vec::with_capacity(nodes);

    for i in 1..=nodes {
        let mut config = Config::new(&format!("node-{i}"));
        config.bind_address = "127.0.0.1".to_string();
        config.bind_port = 7946 + i as u16;
        config.expect = expect;
        if i > 1 {
            config.peer_list = vec![seed.clone()];
        }

        let node_dir = dir.join(&config.id);
        std::fs::create_dir_all(&node_dir)
            .with_context(|| format!("creating {}", node_dir.display()))?;

        let connector = network.connector();
        starting.push(tokio::spawn(async move {
            Raft::initialize_with(config, &node_dir, connector).await
        }));
    }

    let mut cluster = Vec::with_capacity(nodes);
    for handle in starting {
        cluster.push(handle.await.context("node task panicked")??);
    }
    info!("All {nodes} nodes bootstrapped");

    let mut isolated: Option<String> = None;
    for second in 1..=seconds {
        sleep(Duration::from_secs(1)).await;
        print_cluster(second, &cluster);

        if isolate_leader && isolated.is_none() && second >= seconds / 2 {
            if let Some(leader) = cluster.iter().find(|node| node.is_leader()) {
                warn!("Isolating leader {}", leader.id());
                network.isolate(leader.id());
                isolated = Some(leader.id().to_string());
            }
        }
    }

    if let Some(id) = isolated {
        network.restore(&id);
    }

    let mut failures = 0;
    for node in &cluster {
        if let Err(e) = node.shutdown().await {
            warn!("{}: {e}", node.id());
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} nodes failed to shut down cleanly");
    }
    Ok(())
}

fn print_cluster(second: u64, cluster: &[Raft]) {
    println!("t={second}s");
    for node in cluster {
        let status = node.status();
        println!(
            "  {:<10} {:<13} term={:<4} leader={:<10} quorum={} health={}",
            node.id(),
            status.state.to_string(),
            status.term,
            status.leader.as_deref().unwrap_or("-"),
            status.quorum,
            node.health_score()
        );
    }
}

fn print_state(dir: &Path) -> Result<()> {
    let state_file = StateFile::new(dir);
    match state_file.load()? {
        Some(state) => {
            println!("{} members in {}:", state.members.len(), state_file.path().display());
            for member in state.members {
                println!("  {} [{}]", member.id, member.address);
            }
        }
        None => println!(
            "No persisted state in {}; the node will bootstrap",
            dir.display()
        ),
    }
    Ok(())
}

fn check_config(dir: &Path) -> Result<()> {
    let config = Config::load(dir)?;
    let timing = Timing::from_config(&config);

    println!("{} is valid", dir.join(ballot::config::CONFIG_FILE).display());
    println!("  id:              {}", config.id);
    println!("  bind:            {}", config.bind_addr());
    println!("  expect:          {}", config.expect);
    println!("  peers:           {}", config.peer_list.join(", "));
    println!("  encryption:      {}", if config.encrypt.is_empty() { "off" } else { "on" });
    println!(
        "  timeout:         {:?}..{:?}",
        timing.min_timeout, timing.max_timeout
    );
    println!("  ticker:          {:?}", timing.ticker_interval);
    println!(
        "  sub-quorum:      {} cycles tolerated",
        timing.max_sub_quorum_cycles
    );
    Ok(())
}

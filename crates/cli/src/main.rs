//! negotopo CLI - adaptive-topology negotiation demo.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use negotopo_agents::{strategy, Agent, BasicAgent};
use negotopo_core::AgentId;
use negotopo_graph::{CommunicationGraph, GraphConfig};
use negotopo_oracle::{
    CompatibilityOracle, EmbeddingOracle, HashEmbedder, KeywordOracle, OllamaEmbedder,
};
use negotopo_orchestrator::{NegotiationRunner, Network, RunnerConfig, RunnerResult};
use negotopo_protocol::{RelevanceFilter, RoundConfig};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "negotopo")]
#[command(about = "Multi-agent negotiation over an adaptive communication graph")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum OracleKind {
    /// Token overlap between needs and offers
    Keyword,
    /// Hash embeddings (deterministic, not semantic)
    Hash,
    /// Ollama embeddings (semantic, using nomic-embed-text or similar)
    Ollama,
}

/// Graph and agent-generation flags shared by every subcommand.
#[derive(clap::Args)]
struct Setup {
    /// Number of generated agents
    #[arg(long, default_value_t = 6)]
    agents: usize,

    /// Minimum combined compatibility for an edge
    #[arg(long, default_value_t = 0.3)]
    threshold: f32,

    /// Maximum neighbors per agent
    #[arg(long, default_value_t = 5)]
    max_neighbors: usize,

    /// One-way edges: only the combined score has to pass the threshold
    #[arg(long)]
    directed: bool,

    /// Compatibility oracle used to score agent pairs
    #[arg(long, value_enum, default_value_t = OracleKind::Keyword)]
    oracle: OracleKind,

    /// Embedding model name (for the ollama oracle)
    #[arg(long, default_value = "nomic-embed-text")]
    embed_model: String,

    /// Ollama URL for embeddings
    #[arg(long, default_value = "http://localhost:11434")]
    embed_url: String,

    /// Strategy for every agent (cooperative, competitive, random, reject)
    #[arg(long, default_value = strategy::DEFAULT_STRATEGY)]
    strategy: String,

    /// Seed for agent generation and randomized strategies
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Run a negotiation between generated agents
    Demo {
        #[command(flatten)]
        setup: Setup,

        /// Maximum number of rounds
        #[arg(long, default_value_t = 10)]
        rounds: usize,

        /// Wall-clock budget in milliseconds
        #[arg(long, default_value_t = 60_000)]
        timeout_ms: u64,

        /// Rebuild the graph every N rounds
        #[arg(long, default_value_t = 1)]
        rebuild_interval: usize,

        /// Build the graph once instead of rebuilding between rounds
        #[arg(long)]
        static_topology: bool,

        /// Ignore and drop traffic between agents that are not neighbors
        #[arg(long)]
        enforce_adjacency: bool,

        /// Only offer to neighbors sharing a need/offer substring
        #[arg(long)]
        strict_relevance: bool,

        /// Print the full result as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Build one graph and inspect it
    Topology {
        #[command(flatten)]
        setup: Setup,

        /// Path start (defaults to the first agent)
        #[arg(long)]
        from: Option<String>,

        /// Path end (defaults to the last agent)
        #[arg(long)]
        to: Option<String>,

        /// Neighborhood radius reported around the start agent
        #[arg(long, default_value_t = 2)]
        hops: usize,
    },
}

const SKILLS: [&str; 12] = [
    "logo design",
    "tax advice",
    "web hosting",
    "copy writing",
    "data analysis",
    "legal review",
    "translation",
    "photography",
    "bookkeeping",
    "video editing",
    "market research",
    "cloud migration",
];

/// Agents with one or two offers and one or two disjoint needs drawn from the skill catalogue.
fn generate_agents(count: usize, strategy: &str, seed: u64) -> Vec<BasicAgent> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mut skills = SKILLS.to_vec();
            skills.shuffle(&mut rng);
            let n_offers = rng.gen_range(1..=2);
            let n_needs = rng.gen_range(1..=2);
            BasicAgent::new(format!("agent-{}", i + 1))
                .with_offers(skills[..n_offers].iter().copied())
                .with_needs(skills[n_offers..n_offers + n_needs].iter().copied())
                .with_strategy(strategy)
        })
        .collect()
}

fn build_oracle(setup: &Setup) -> Result<Arc<dyn CompatibilityOracle>> {
    let oracle: Arc<dyn CompatibilityOracle> = match setup.oracle {
        OracleKind::Keyword => Arc::new(KeywordOracle),
        OracleKind::Hash => Arc::new(EmbeddingOracle::new(HashEmbedder::default())),
        OracleKind::Ollama => {
            eprintln!("Using Ollama semantic embeddings:");
            eprintln!("  URL: {}", setup.embed_url);
            eprintln!("  Model: {}", setup.embed_model);
            let embedder = OllamaEmbedder::connect(&setup.embed_url, &setup.embed_model)
                .with_context(|| format!("connecting to Ollama at {}", setup.embed_url))?;
            Arc::new(EmbeddingOracle::new(embedder))
        }
    };
    Ok(oracle)
}

fn graph_config(setup: &Setup) -> GraphConfig {
    GraphConfig::default()
        .with_threshold(setup.threshold)
        .with_max_neighbors(setup.max_neighbors)
        .with_bidirectional(!setup.directed)
}

fn path_string(path: &[AgentId]) -> String {
    path.iter()
        .map(AgentId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn print_summary(result: &RunnerResult) {
    println!(
        "\nStatus: {:?} ({:?}) after {} rounds in {} ms",
        result.status,
        result.termination,
        result.rounds_executed,
        result.duration_ms
    );
    let t = &result.stats.totals;
    println!(
        "Messages: {} sent, {} offers, {} counters, {} accepts, {} rejects, {} queries, {} dropped",
        t.messages_sent, t.offers, t.counters, t.acceptances, t.rejections, t.queries, t.dropped
    );
    if t.handler_errors > 0 {
        println!("Handler errors: {}", t.handler_errors);
    }
    println!("Agreement rate: {:.0}%", result.stats.agreement_rate * 100.0);

    println!("\nAgents:");
    for a in &result.agent_results {
        let mark = if a.needs_satisfied { "done" } else { "open" };
        println!(
            "  {:<10} {:<4}  remaining {:?}  ({} events)",
            a.id.as_str(),
            mark,
            a.remaining_needs,
            a.history_len
        );
    }

    for snap in &result.topology_log {
        println!(
            "Round {} topology: {} edges, density {:.3}",
            snap.round, snap.stats.edges, snap.stats.density
        );
    }
    if let Some(err) = &result.error {
        println!("\nError: {err}");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Demo {
            setup,
            rounds,
            timeout_ms,
            rebuild_interval,
            static_topology,
            enforce_adjacency,
            strict_relevance,
            json,
        } => {
            strategy::from_name(&setup.strategy, setup.seed)?;
            let oracle = build_oracle(&setup)?;

            let mut network = Network::new(graph_config(&setup), oracle).with_seed(setup.seed);
            let agents = generate_agents(setup.agents, &setup.strategy, setup.seed);
            if !json {
                println!(
                    "Starting negotiation with {} agents, up to {} rounds",
                    agents.len(),
                    rounds
                );
                for a in &agents {
                    println!(
                        "  {:<10} offers {:?}  needs {:?}",
                        a.id().as_str(),
                        a.offers(),
                        a.needs()
                    );
                }
            }
            for agent in agents {
                network.register_agent(Box::new(agent))?;
            }

            let relevance = if strict_relevance {
                RelevanceFilter::Strict
            } else {
                RelevanceFilter::Permissive
            };
            let config = RunnerConfig::default()
                .with_max_rounds(rounds)
                .with_timeout_ms(timeout_ms)
                .with_dynamic_topology(!static_topology)
                .with_rebuild_interval(rebuild_interval)
                .with_round(
                    RoundConfig::default()
                        .with_relevance(relevance)
                        .with_enforce_adjacency(enforce_adjacency),
                );

            let mut runner = NegotiationRunner::new(network, config);
            let result = runner.run()?;
            tracing::info!(status = ?result.status, rounds = result.rounds_executed, "demo finished");

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
        }
        Command::Topology {
            setup,
            from,
            to,
            hops,
        } => {
            let oracle = build_oracle(&setup)?;
            let agents = generate_agents(setup.agents, &setup.strategy, setup.seed);
            let mut graph = CommunicationGraph::new(graph_config(&setup), oracle);
            for a in &agents {
                graph.register(a.id())?;
            }
            let profiles: Vec<_> = agents.iter().map(|a| a.profile()).collect();
            let stats = graph.rebuild(&profiles);

            println!(
                "{} nodes, {} edges, density {:.3}",
                stats.nodes, stats.edges, stats.density
            );
            for a in &agents {
                println!(
                    "  {:<10} offers {:?}  needs {:?}",
                    a.id().as_str(),
                    a.offers(),
                    a.needs()
                );
            }
            println!("\nEdges:");
            for e in graph.edges() {
                println!("  {} -> {}  (weight {:.3})", e.from, e.to, e.weight);
            }

            let components = graph.connected_components();
            println!("\n{} connected component(s):", components.len());
            for c in &components {
                println!("  [{}]", path_string(c).replace(" -> ", ", "));
            }

            let (Some(first), Some(last)) = (graph.nodes().first(), graph.nodes().last()) else {
                return Ok(());
            };
            let from = from.map(AgentId::from).unwrap_or_else(|| first.clone());
            let to = to.map(AgentId::from).unwrap_or_else(|| last.clone());

            println!("\nPaths {from} -> {to}:");
            match graph.shortest_path(&from, &to) {
                Some(path) => println!("  fewest hops: {}", path_string(&path)),
                None => println!("  fewest hops: unreachable"),
            }
            match graph.weighted_path(&from, &to) {
                Some((path, cost)) => {
                    println!("  lowest weight: {} (cost {cost:.3})", path_string(&path))
                }
                None => println!("  lowest weight: unreachable"),
            }

            let mut near: Vec<_> = graph.within_hops(&from, hops).into_iter().collect();
            near.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            println!("\nWithin {hops} hop(s) of {from}:");
            for (id, d) in near {
                println!("  {id} ({d})");
            }
        }
    }

    Ok(())
}

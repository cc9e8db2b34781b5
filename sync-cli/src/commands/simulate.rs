//! Race several clients through estimation rounds on one in-memory store.

use anyhow::{Context, Result};
use roomsync_client::{
    Config, DispatcherStatistics, EventDispatcher, ListenerOptions, MemoryStore, SyncError,
    SyncLayer, TokioClock,
};
use roomsync_core::{Clock, ResolverStatistics};
use roomsync_types::{Operation, OperationType, Player, RoomId, RoomState, RoomUpdate};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Planning poker deck used for simulated votes.
const DECK: [&str; 7] = ["1", "2", "3", "5", "8", "13", "?"];

/// Event types counted during a simulation.
const COUNTED_EVENTS: [&str; 6] = [
    roomsync_client::events::ROOM_UPDATED,
    roomsync_client::events::PLAYERS_UPDATED,
    roomsync_client::events::VOTES_UPDATED,
    roomsync_client::events::PHASE_CHANGED,
    roomsync_client::events::CONFLICT_RESOLVED,
    roomsync_client::events::SYNC_ERROR,
];

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Room code.
    pub room: String,
    /// Number of players, host included.
    pub clients: usize,
    /// Rounds to play.
    pub rounds: u32,
    /// Artificial store latency.
    pub latency: Duration,
}

/// What happened during a simulation.
#[derive(Debug)]
pub struct SimulationReport {
    /// Room as left after the last round.
    pub room: RoomState,
    /// Writes that were committed or buffered.
    pub accepted: u64,
    /// Writes refused because of a conflict.
    pub rejected: u64,
    /// Store commits.
    pub commits: u64,
    /// Resolver counters.
    pub resolver: ResolverStatistics,
    /// Dispatcher counters.
    pub dispatcher: DispatcherStatistics,
    /// Events delivered, per type.
    pub events: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Tally {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Run the simulate command.
pub async fn run(config: &Config, options: &SimulateOptions) -> Result<()> {
    println!("=== roomsync simulate ===");
    println!();
    println!(
        "Room {}: {} players, {} rounds, {:?} store latency",
        options.room, options.clients, options.rounds, options.latency
    );

    let report = simulate(config, options).await?;
    print_report(&report);
    Ok(())
}

/// Play the rounds and collect the counters.
pub async fn simulate(config: &Config, options: &SimulateOptions) -> Result<SimulationReport> {
    anyhow::ensure!(options.clients > 0, "Need at least one client");

    let store = MemoryStore::new();
    if !options.latency.is_zero() {
        store.set_latency(options.latency);
    }
    let clock = TokioClock::new();
    let dispatcher = EventDispatcher::new(config.dispatcher.clone());
    let layer = SyncLayer::from_config(store.clone(), config)
        .context("Invalid resolver configuration")?
        .with_dispatcher(dispatcher.clone());

    let counters: Vec<(String, Arc<AtomicU64>)> = COUNTED_EVENTS
        .iter()
        .map(|event_type| {
            let counter = Arc::new(AtomicU64::new(0));
            let sink = Arc::clone(&counter);
            dispatcher.on(event_type, ListenerOptions::default(), move |_| {
                sink.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
            (event_type.to_string(), counter)
        })
        .collect();

    let room = RoomId::new(options.room.as_str());
    let players: Vec<String> = (0..options.clients)
        .map(|i| format!("player-{}", i))
        .collect();
    let tally = Arc::new(Tally::default());

    layer
        .create_room(&room, Player::new(players[0].as_str(), "Host", clock.now_ms()))
        .await
        .context("Failed to create room")?;

    let joins = players[1..]
        .iter()
        .map(|p| {
            Operation::new(
                OperationType::Join,
                p.as_str(),
                clock.now_ms(),
                RoomUpdate::join(Player::new(p.as_str(), p, clock.now_ms())),
            )
        })
        .collect();
    race(&layer, &room, joins, &tally).await?;

    for round in 0..options.rounds {
        tracing::info!("Round {} of {}", round + 1, options.rounds);

        // The host and one other player both try to open the round.
        let resets = players
            .iter()
            .take(2)
            .map(|p| {
                Operation::new(OperationType::Reset, p.as_str(), clock.now_ms(), RoomUpdate::reset())
            })
            .collect();
        race(&layer, &room, resets, &tally).await?;

        let votes = players
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let card = DECK[(i + round as usize) % DECK.len()];
                Operation::new(
                    OperationType::Vote,
                    p.as_str(),
                    clock.now_ms(),
                    RoomUpdate::vote(p.as_str(), card, clock.now_ms()),
                )
            })
            .collect();
        race(&layer, &room, votes, &tally).await?;
        let flushed = layer.flush_batches().await;
        tracing::debug!("Flushed batches for {} rooms", flushed);

        // Everyone reaches for the reveal button at once.
        let reveals = players
            .iter()
            .map(|p| {
                Operation::new(OperationType::Reveal, p.as_str(), clock.now_ms(), RoomUpdate::reveal())
            })
            .collect();
        race(&layer, &room, reveals, &tally).await?;
    }

    dispatcher
        .flush()
        .await
        .context("Event dispatcher stopped early")?;

    let report = SimulationReport {
        room: layer.read(&room).await?,
        accepted: tally.accepted.load(Ordering::Relaxed),
        rejected: tally.rejected.load(Ordering::Relaxed),
        commits: store.commit_count(),
        resolver: layer.statistics().await,
        dispatcher: dispatcher.statistics(),
        events: counters
            .into_iter()
            .map(|(name, counter)| (name, counter.load(Ordering::Relaxed)))
            .collect(),
    };
    dispatcher.shutdown().await;
    Ok(report)
}

/// Submit `operations` concurrently and wait for all of them.
///
/// Conflict outcomes are counted; any other failure aborts the simulation.
async fn race(
    layer: &SyncLayer<MemoryStore>,
    room: &RoomId,
    operations: Vec<Operation>,
    tally: &Arc<Tally>,
) -> Result<()> {
    let mut tasks = JoinSet::new();
    for op in operations {
        let layer = layer.clone();
        let room = room.clone();
        tasks.spawn(async move {
            let player = op.player_id.clone();
            let op_type = op.op_type;
            (player, op_type, layer.write(&room, op).await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (player, op_type, result) = joined.context("Client task panicked")?;
        match result {
            Ok(outcome) => {
                tracing::debug!("{} {} -> {:?}", player, op_type, outcome);
                tally.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e @ (SyncError::VersionConflict { .. } | SyncError::OperationRejected { .. })) => {
                tracing::debug!("{} {} refused: {}", player, op_type, e);
                tally.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => return Err(e).with_context(|| format!("{} {} failed", player, op_type)),
        }
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!();
    println!("Room:");
    println!("  Version: {}", report.room.version);
    println!("  Phase:   {}", report.room.phase);
    println!("  Players: {}", report.room.players.len());
    println!("  Votes:   {}", report.room.votes.len());
    println!();
    println!("Writes:");
    println!("  Accepted: {}", report.accepted);
    println!("  Rejected: {}", report.rejected);
    println!("  Commits:  {}", report.commits);
    println!();
    println!("Conflicts:");
    println!("  Total:        {}", report.resolver.total_conflicts);
    println!("  Resolved:     {}", report.resolver.resolved_conflicts);
    println!("  Failed:       {}", report.resolver.failed_resolutions);
    println!(
        "  Success rate: {:.1}%",
        report.resolver.success_rate() * 100.0
    );
    for (kind, count) in &report.resolver.by_kind {
        println!("    {:<24} {}", kind.as_str(), count);
    }
    println!();
    println!("Events:");
    for (event_type, count) in &report.events {
        println!("  {:<18} {}", event_type, count);
    }
    println!(
        "  Emitted {} / processed {} / throttled {} / duplicates {}",
        report.dispatcher.emitted,
        report.dispatcher.processed,
        report.dispatcher.throttled,
        report.dispatcher.duplicates
    );
}

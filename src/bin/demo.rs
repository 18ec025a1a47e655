//! agora demo binary.
//!
//! Walks one coordinator through each service: resource contention, a
//! workflow with a failing step, a second-price auction, a majority vote, a
//! bilateral negotiation and a consensus aggregation.
//!
//! # Environment Variables
//!
//! - `AGORA_CONFIG`: optional path to a YAML coordinator configuration
//! - `RUST_LOG`: Tracing filter (default: "info,agora=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin demo
//! ```

use std::thread;
use std::time::Duration;

use agora::blackboard::{ResourceKind, ResourceSpec};
use agora::collective::AggregationMethod;
use agora::dispatch::{AgentRecord, Task};
use agora::negotiation::{AuctionSpec, AuctionType, VoteSpec};
use agora::{Coordinator, CoordinatorConfig, MessagePayload, TaskOutcome};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agora=debug".into()),
        )
        .init();

    let config = match std::env::var("AGORA_CONFIG") {
        Ok(path) => CoordinatorConfig::from_yaml_file(path)?,
        Err(_) => CoordinatorConfig::default(),
    };
    let coordinator = Coordinator::new(config)?;

    resources(&coordinator)?;
    workflow(&coordinator)?;
    auction(&coordinator)?;
    vote(&coordinator)?;
    negotiation(&coordinator)?;
    consensus(&coordinator)?;

    tracing::info!(
        "Done: {} events logged, router {:?}",
        coordinator.events().len(),
        coordinator.router().metrics()
    );
    Ok(())
}

fn resources(coordinator: &Coordinator) -> anyhow::Result<()> {
    let registry = coordinator.resources();
    let gpu = registry.create_resource(ResourceSpec::shared(
        "gpu-pool",
        ResourceKind::Computational,
        2,
        "ops",
    ))?;

    for agent in ["analyst", "modeler", "reporter"] {
        let granted = registry.try_request(&gpu, agent)?;
        tracing::info!("{} requests gpu-pool: granted={}", agent, granted);
    }

    let waiter = {
        let registry = registry.clone();
        let gpu = gpu.clone();
        thread::spawn(move || registry.request(&gpu, "reporter", Duration::from_secs(2)))
    };
    thread::sleep(Duration::from_millis(50));
    registry.release(&gpu, "analyst")?;
    let granted = waiter
        .join()
        .map_err(|_| anyhow::anyhow!("waiter thread panicked"))??;
    tracing::info!("reporter granted after release: {}", granted);
    tracing::info!("gpu-pool holders: {:?}", registry.holders(&gpu)?);
    Ok(())
}

fn workflow(coordinator: &Coordinator) -> anyhow::Result<()> {
    let mut inbox = coordinator.register_worker(AgentRecord::new("etl-worker", ["extract", "transform"]))?;
    coordinator.start_delivery()?;

    let id = coordinator.workflows().create_workflow(
        "quarterly-report",
        vec![
            Task::new("extract", "Pull raw sales").with_capabilities(["extract"]),
            Task::new("transform", "Clean sales")
                .with_capabilities(["transform"])
                .with_dependencies(["extract"]),
            Task::new("publish", "Publish report")
                .with_capabilities(["transform"])
                .with_dependencies(["transform"]),
        ],
    )?;

    // The worker succeeds on extract and fails on transform.
    for _ in 0..2 {
        let Some(message) = inbox.blocking_recv() else {
            break;
        };
        let MessagePayload::TaskRequest { task_id, .. } = &message.payload else {
            continue;
        };
        let outcome = if task_id == "extract" {
            TaskOutcome::Success { result: json!({ "rows": 1200 }) }
        } else {
            TaskOutcome::Failure { error: "schema mismatch".to_string() }
        };
        tracing::info!("etl-worker finished {}: {:?}", task_id, outcome);
        coordinator.report_result("etl-worker", task_id, outcome);
    }

    let progress = poll_progress(coordinator, &id)?;
    tracing::info!("Workflow {} progress: {:?}", id, progress);
    coordinator.stop_delivery();
    Ok(())
}

fn poll_progress(coordinator: &Coordinator, id: &str) -> anyhow::Result<agora::dispatch::WorkflowProgress> {
    for _ in 0..50 {
        let progress = coordinator.workflows().progress(id)?;
        if progress.status != agora::WorkflowStatus::InProgress {
            return Ok(progress);
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(coordinator.workflows().progress(id)?)
}

fn auction(coordinator: &Coordinator) -> anyhow::Result<()> {
    let house = coordinator.auctions();
    let id = house.open(
        AuctionSpec::new("compute-slot", "market", AuctionType::SecondPrice).with_reserve(75.0),
        Duration::from_millis(200),
    )?;
    for (bidder, amount) in [("A", 60.0), ("B", 85.0), ("C", 92.0), ("D", 78.0)] {
        house.place_bid(&id, bidder, amount)?;
    }
    let outcome = house.close(&id, "market")?;
    tracing::info!(
        "Auction {}: winner={:?} price={:?}",
        outcome.item,
        outcome.winner,
        outcome.price
    );
    Ok(())
}

fn vote(coordinator: &Coordinator) -> anyhow::Result<()> {
    let booth = coordinator.votes();
    let voters = ["A", "B", "C", "D", "E"];
    let id = booth.open(
        VoteSpec::new("release-plan", "lead", ["X", "Y", "Z"], voters),
        Duration::from_secs(5),
    )?;
    let mut outcome = None;
    for (voter, option) in voters.iter().zip(["X", "X", "Y", "X", "Z"]) {
        outcome = booth.cast_vote(&id, voter, option)?;
    }
    if let Some(outcome) = outcome {
        tracing::info!(
            "Vote {}: decision={:?} participation={:.0}%",
            outcome.topic,
            outcome.decision,
            outcome.participation_rate * 100.0
        );
    }
    Ok(())
}

fn negotiation(coordinator: &Coordinator) -> anyhow::Result<()> {
    let manager = coordinator.negotiations();
    let id = manager.propose(
        "buyer",
        "seller",
        "dataset-license",
        100.0,
        json!({ "term_months": 12 }),
        Duration::from_secs(5),
    )?;
    manager.counter_offer(&id, "seller", 140.0, json!({ "term_months": 12 }))?;
    manager.counter_offer(&id, "buyer", 120.0, json!({ "term_months": 12 }))?;
    let outcome = manager.accept(&id, "seller", true)?;
    tracing::info!(
        "Negotiation {}: {:?} after {} rounds",
        outcome.subject,
        outcome.state,
        outcome.rounds
    );
    Ok(())
}

fn consensus(coordinator: &Coordinator) -> anyhow::Result<()> {
    let collective = coordinator.collective();
    for (agent, value, quality) in [("analyst", 10.0, 0.9), ("modeler", 10.2, 0.8), ("auditor", 9.9, 0.85)] {
        collective.contribute(agent, "q3-growth", json!(value), quality, 0.9)?;
    }
    match collective.aggregate("q3-growth", AggregationMethod::Consensus, 3) {
        Some(knowledge) => tracing::info!(
            "Consensus on {}: {} (confidence {:.2})",
            knowledge.topic,
            knowledge.value,
            knowledge.confidence
        ),
        None => tracing::warn!("No consensus on q3-growth"),
    }
    for (agent, reputation) in collective.top_agents(3) {
        tracing::info!("Reputation {}: {:.3}", agent, reputation);
    }
    Ok(())
}

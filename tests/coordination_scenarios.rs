//! End-to-end scenarios driven through the `Coordinator`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use agora::blackboard::{ResourceKind, ResourceSpec};
use agora::collective::AggregationMethod;
use agora::dispatch::{AgentRecord, Task, TaskStatus, WorkflowStatus};
use agora::negotiation::{AuctionSpec, AuctionType, NegotiationState, VoteSpec};
use agora::{Coordinator, CoordinatorConfig, EventKind, MessagePayload, TaskOutcome};
use serde_json::json;

fn coordinator() -> Coordinator {
    let _ = env_logger::builder().is_test(true).try_init();
    Coordinator::new(CoordinatorConfig::default()).unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_holders_never_exceed_capacity() {
    let c = coordinator();
    let registry = c.resources().clone();
    let id = registry
        .create_resource(ResourceSpec::shared("gpu", ResourceKind::Computational, 3, "ops"))
        .unwrap();

    let workers = 16;
    let barrier = Arc::new(Barrier::new(workers));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..workers)
        .map(|n| {
            let registry = registry.clone();
            let id = id.clone();
            let barrier = barrier.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            thread::spawn(move || {
                let agent = format!("agent-{n}");
                barrier.wait();
                for _ in 0..25 {
                    if registry.request(&id, &agent, Duration::from_secs(5)).unwrap() {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(registry.holders(&id).unwrap().len() <= 3);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        assert!(registry.release(&id, &agent).unwrap());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(registry.holders(&id).unwrap().is_empty());
}

#[test]
fn test_exclusive_grants_follow_arrival_order() {
    let c = coordinator();
    let registry = c.resources().clone();
    let id = registry
        .create_resource(ResourceSpec::exclusive("ledger", ResourceKind::Data, "ops"))
        .unwrap();
    assert!(registry.try_request(&id, "A").unwrap());

    let spawn_waiter = |agent: &'static str| {
        let registry = registry.clone();
        let id = id.clone();
        thread::spawn(move || registry.request(&id, agent, Duration::from_secs(5)).unwrap())
    };
    let b = spawn_waiter("B");
    assert!(wait_until(|| registry.waiting(&id).unwrap() == 1));
    let c_waiter = spawn_waiter("C");
    assert!(wait_until(|| registry.waiting(&id).unwrap() == 2));

    registry.release(&id, "A").unwrap();
    assert!(b.join().unwrap());
    assert_eq!(registry.holders(&id).unwrap(), vec!["B".to_string()]);
    assert_eq!(registry.waiting(&id).unwrap(), 1);

    registry.release(&id, "B").unwrap();
    assert!(c_waiter.join().unwrap());
    assert_eq!(registry.holders(&id).unwrap(), vec!["C".to_string()]);
}

#[test]
fn test_consensus_aggregation() {
    let c = coordinator();
    let ci = c.collective();
    for (agent, value) in [("a", 10.0), ("b", 10.2), ("c", 9.9)] {
        ci.contribute(agent, "agree", json!(value), 0.8, 0.9).unwrap();
    }
    for (agent, value) in [("a", 10.0), ("b", 50.0), ("c", 9.9)] {
        ci.contribute(agent, "disagree", json!(value), 0.8, 0.9).unwrap();
    }

    let agreed = ci.aggregate("agree", AggregationMethod::Consensus, 3).unwrap();
    assert!((agreed.value.as_f64().unwrap() - 10.0333).abs() < 1e-3);
    assert!(ci.aggregate("disagree", AggregationMethod::Consensus, 3).is_none());
}

#[test]
fn test_second_price_auction_with_reserve() {
    let c = coordinator();
    let house = c.auctions();
    let id = house
        .open(
            AuctionSpec::new("slot", "market", AuctionType::SecondPrice).with_reserve(75.0),
            Duration::from_secs(5),
        )
        .unwrap();
    for (bidder, amount) in [("A", 60.0), ("B", 85.0), ("C", 92.0), ("D", 78.0)] {
        assert!(house.place_bid(&id, bidder, amount).unwrap());
    }

    let outcome = house.close(&id, "market").unwrap();
    assert_eq!(outcome.winner.as_deref(), Some("C"));
    assert_eq!(outcome.price, Some(85.0));
    assert!(!house.place_bid(&id, "E", 200.0).unwrap());
    assert_eq!(c.events().recent(10, Some(&EventKind::AuctionClosed)).len(), 1);
}

#[test]
fn test_majority_vote() {
    let c = coordinator();
    let voters = ["A", "B", "C", "D", "E"];
    let id = c
        .votes()
        .open(
            VoteSpec::new("plan", "lead", ["X", "Y", "Z"], voters),
            Duration::from_secs(5),
        )
        .unwrap();

    let mut outcome = None;
    for (voter, option) in voters.iter().zip(["X", "X", "Y", "X", "Z"]) {
        outcome = c.votes().cast_vote(&id, voter, option).unwrap();
    }
    let outcome = outcome.unwrap();
    assert_eq!(outcome.decision.as_deref(), Some("X"));
    assert_eq!(outcome.participation_rate, 1.0);
    assert_eq!(outcome.tally["X"], 3);
}

#[test]
fn test_negotiation_expires_at_deadline() {
    let c = coordinator();
    let id = c
        .negotiations()
        .propose("buyer", "seller", "license", 100.0, json!({}), Duration::from_millis(30))
        .unwrap();
    let outcome = c
        .negotiations()
        .wait_for_outcome(&id, Duration::from_secs(2))
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, NegotiationState::Expired);
    assert!(outcome.agreement.is_none());
    assert!(c.negotiations().accept(&id, "seller", false).is_err());
}

#[test]
fn test_failed_dependency_cancels_dependent() {
    let c = coordinator();
    let mut inbox = c.register_worker(AgentRecord::new("worker", ["etl"])).unwrap();
    let workflow = c
        .workflows()
        .create_workflow(
            "report",
            vec![
                Task::new("T1", "extract").with_capabilities(["etl"]),
                Task::new("T2", "load")
                    .with_capabilities(["etl"])
                    .with_dependencies(["T1"]),
            ],
        )
        .unwrap();

    c.deliver_pending();
    let request = inbox.try_recv().unwrap();
    assert!(matches!(
        &request.payload,
        MessagePayload::TaskRequest { task_id, .. } if task_id == "T1"
    ));

    c.report_result("worker", "T1", TaskOutcome::Failure { error: "boom".into() });
    c.deliver_pending();

    let t2 = c.dispatcher().task("T2").unwrap();
    assert_eq!(t2.status, TaskStatus::Cancelled);
    assert!(t2.assigned_agent.is_none());
    assert!(inbox.try_recv().is_err());
    assert!(c
        .events()
        .recent(100, Some(&EventKind::TaskAssigned))
        .iter()
        .all(|e| e.data["task_id"] != "T2"));

    let progress = c.workflows().progress(&workflow).unwrap();
    assert_eq!(progress.status, WorkflowStatus::Failed);
    assert_eq!(progress.count(TaskStatus::Cancelled), 1);
}

#[test]
fn test_worker_threads_complete_workflow() {
    let c = coordinator();
    let mut inboxes = Vec::new();
    for name in ["w1", "w2"] {
        inboxes.push((name, c.register_worker(AgentRecord::new(name, ["calc"])).unwrap()));
    }
    c.start_delivery().unwrap();

    let router = c.router().clone();
    let workers: Vec<_> = inboxes
        .into_iter()
        .map(|(name, mut inbox)| {
            let router = router.clone();
            thread::spawn(move || {
                while let Some(message) = inbox.blocking_recv() {
                    let MessagePayload::TaskRequest { task_id, input, .. } = &message.payload else {
                        continue;
                    };
                    let doubled = input.as_i64().unwrap_or(0) * 2;
                    let report = agora::Message::new(
                        name,
                        agora::COORDINATOR_ID,
                        agora::MessageKind::Complete,
                        MessagePayload::TaskResult {
                            task_id: task_id.clone(),
                            outcome: TaskOutcome::Success { result: json!(doubled) },
                        },
                    );
                    router.send(report);
                }
            })
        })
        .collect();

    let id = c
        .workflows()
        .create_workflow(
            "chain",
            vec![
                Task::new("a", "").with_capabilities(["calc"]).with_input(json!(1)),
                Task::new("b", "").with_capabilities(["calc"]).with_input(json!(2)),
                Task::new("c", "")
                    .with_capabilities(["calc"])
                    .with_input(json!(3))
                    .with_dependencies(["a", "b"]),
            ],
        )
        .unwrap();

    assert!(wait_until(|| c.workflows().progress(&id).unwrap().status == WorkflowStatus::Completed));
    assert_eq!(c.dispatcher().task("c").unwrap().result, Some(json!(6)));

    c.stop_delivery();
    for name in ["w1", "w2"] {
        c.router().unregister(name);
    }
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_reputation_monotonicity() {
    let c = coordinator();
    let ci = c.collective();
    ci.contribute("low", "t", json!(1), 0.4, 1.0).unwrap();
    ci.contribute("high", "t", json!(1), 0.9, 1.0).unwrap();
    assert!(ci.reputation("high") >= ci.reputation("low"));

    let mut previous = ci.reputation("high");
    for _ in 0..3 {
        ci.contribute("high", "t", json!(1), 0.9, 1.0).unwrap();
        let current = ci.reputation("high");
        assert!(current > previous);
        previous = current;
    }
}

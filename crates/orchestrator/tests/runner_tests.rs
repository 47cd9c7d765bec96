use negotopo_agents::BasicAgent;
use negotopo_core::{AgentId, NegotiationError};
use negotopo_graph::GraphConfig;
use negotopo_oracle::KeywordOracle;
use negotopo_orchestrator::{
    AllSatisfied, NegotiationRunner, Network, RunnerConfig, RunnerStatus, TerminationReason,
};
use std::sync::Arc;

fn network(config: GraphConfig, agents: Vec<BasicAgent>) -> Network {
    let mut net = Network::new(config, Arc::new(KeywordOracle)).with_seed(7);
    for agent in agents {
        net.register_agent(Box::new(agent)).unwrap();
    }
    net
}

fn trading_pair(strategy: &str) -> Vec<BasicAgent> {
    vec![
        BasicAgent::new("alice")
            .with_needs(["logo design"])
            .with_offers(["tax advice"])
            .with_strategy(strategy),
        BasicAgent::new("bob")
            .with_needs(["tax advice"])
            .with_offers(["logo design"])
            .with_strategy(strategy),
    ]
}

fn runner(agents: Vec<BasicAgent>, config: RunnerConfig) -> NegotiationRunner {
    NegotiationRunner::new(
        network(GraphConfig::default().with_threshold(0.3), agents),
        config,
    )
}

#[test]
fn complementary_pair_converges_within_three_rounds() {
    let mut r = runner(
        trading_pair("cooperative"),
        RunnerConfig::default().with_max_rounds(3),
    );
    let result = r.run().unwrap();

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.termination, Some(TerminationReason::AgreementReached));
    assert!(result.rounds_executed <= 3);
    assert!(result.agent_results.iter().all(|a| a.needs_satisfied));
    assert!(result.agent_results.iter().all(|a| a.remaining_needs.is_empty()));
    assert_eq!(result.stats.agreement_rate, 1.0);
    assert_eq!(result.stats.totals.acceptances, 2);
}

#[test]
fn isolated_agent_exhausts_rounds() {
    let mut r = runner(
        vec![BasicAgent::new("hermit").with_needs(["company"])],
        RunnerConfig::default().with_max_rounds(4),
    );
    let result = r.run().unwrap();

    assert!(r.network().graph().neighbors(&AgentId::from("hermit")).is_empty());
    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.termination, Some(TerminationReason::RoundsExhausted));
    assert_eq!(result.rounds_executed, 4);
    assert!(!result.agent_results[0].needs_satisfied);
    assert_eq!(result.agent_results[0].remaining_needs, vec!["company".to_string()]);
}

#[test]
fn isolated_agent_without_needs_completes_immediately() {
    let mut r = runner(
        vec![BasicAgent::new("hermit").with_offers(["silence"])],
        RunnerConfig::default().with_max_rounds(4),
    );
    let result = r.run().unwrap();
    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.termination, Some(TerminationReason::AgreementReached));
    assert_eq!(result.rounds_executed, 0);
}

#[test]
fn reject_only_pair_never_agrees() {
    let mut r = runner(
        trading_pair("reject"),
        RunnerConfig::default().with_max_rounds(5),
    );
    let result = r.run().unwrap();

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.termination, Some(TerminationReason::RoundsExhausted));
    assert_eq!(result.rounds_executed, 5);
    assert_eq!(result.stats.totals.acceptances, 0);
    assert!(result.stats.totals.rejections > 0);
    assert_eq!(result.stats.agreement_rate, 0.0);
    for agent in &result.agent_results {
        assert_eq!(agent.remaining_needs.len(), 1);
    }
    // one snapshot per round with the default rebuild interval
    assert_eq!(result.topology_log.len(), 5);
}

#[test]
fn rebuild_interval_and_static_topology() {
    let mut every_other = runner(
        trading_pair("reject"),
        RunnerConfig::default()
            .with_max_rounds(5)
            .with_rebuild_interval(2),
    );
    let rounds: Vec<usize> = every_other
        .run()
        .unwrap()
        .topology_log
        .iter()
        .map(|s| s.round)
        .collect();
    assert_eq!(rounds, vec![0, 2, 4]);

    let mut fixed = runner(
        trading_pair("reject"),
        RunnerConfig::default()
            .with_max_rounds(5)
            .with_dynamic_topology(false),
    );
    let result = fixed.run().unwrap();
    assert_eq!(result.topology_log.len(), 1);
    assert_eq!(result.topology_log[0].stats.edges, 1);
}

#[test]
fn hub_never_exceeds_max_neighbors() {
    let mut agents = vec![BasicAgent::new("hub")
        .with_needs(["design"])
        .with_offers(["tax"])
        .with_strategy("reject")];
    for i in 0..4 {
        agents.push(
            BasicAgent::new(format!("spoke-{i}"))
                .with_needs(["tax"])
                .with_offers(["design"])
                .with_strategy("reject"),
        );
    }
    let net = network(GraphConfig::default().with_max_neighbors(2), agents);
    let mut r = NegotiationRunner::new(net, RunnerConfig::default().with_max_rounds(3));
    let result = r.run().unwrap();

    let hub = AgentId::from("hub");
    assert_eq!(r.network().graph().neighbors(&hub).len(), 2);
    for snapshot in &result.topology_log {
        for node in r.network().graph().nodes() {
            let degree = snapshot.edges.iter().filter(|e| &e.from == node).count();
            assert!(degree <= 2, "{node} has degree {degree}");
        }
    }
}

#[test]
fn run_while_stepping_is_busy() {
    let mut r = runner(
        trading_pair("reject"),
        RunnerConfig::default().with_max_rounds(5),
    );
    assert_eq!(r.step(), RunnerStatus::Running);
    assert_eq!(r.current_round(), 1);
    assert_eq!(r.run().unwrap_err(), NegotiationError::RunnerBusy);
}

#[test]
fn stepping_reaches_the_same_end_as_run() {
    let mut r = runner(
        trading_pair("cooperative"),
        RunnerConfig::default().with_max_rounds(3),
    );
    let mut steps = 0;
    while !r.step().is_terminal() {
        steps += 1;
        assert!(steps <= 3);
    }
    assert_eq!(r.status(), RunnerStatus::Completed);
    assert_eq!(r.termination(), Some(TerminationReason::AgreementReached));
    // a finished runner hands back its result
    let result = r.run().unwrap();
    assert_eq!(result.rounds_executed, r.history().len());
}

#[test]
fn zero_timeout_times_out_before_any_round() {
    let mut r = runner(
        trading_pair("cooperative"),
        RunnerConfig::default().with_timeout_ms(0),
    );
    let result = r.run().unwrap();
    assert_eq!(result.status, RunnerStatus::Timeout);
    assert_eq!(result.termination, Some(TerminationReason::Timeout));
    assert_eq!(result.rounds_executed, 0);
    assert!(result.error.is_none());
}

#[test]
fn stop_handle_and_reset() {
    let mut r = runner(
        trading_pair("reject"),
        RunnerConfig::default().with_max_rounds(2),
    );
    r.stop_handle().stop();
    let stopped = r.run().unwrap();
    assert_eq!(stopped.status, RunnerStatus::Completed);
    assert_eq!(stopped.termination, Some(TerminationReason::Stopped));
    assert_eq!(stopped.rounds_executed, 0);

    r.reset();
    assert_eq!(r.status(), RunnerStatus::Idle);
    let again = r.run().unwrap();
    assert_eq!(again.termination, Some(TerminationReason::RoundsExhausted));
    assert_eq!(again.rounds_executed, 2);
}

#[test]
fn orchestration_fault_ends_in_error_with_partial_history() {
    let mut r = runner(
        trading_pair("reject"),
        RunnerConfig::default().with_max_rounds(5),
    );
    assert_eq!(r.step(), RunnerStatus::Running);
    r.network_mut().bus_mut().unregister(&AgentId::from("bob"));

    assert_eq!(r.step(), RunnerStatus::Error);
    let result = r.result();
    assert_eq!(result.termination, Some(TerminationReason::Failed));
    assert_eq!(result.rounds_executed, 1);
    assert!(result.error.unwrap().contains("bob"));
}

/// A hub that supplies three spokes but needs something none of them has.
/// Round 0 closes three deals while the hub's own need stays open.
fn generous_hub() -> Network {
    let mut agents = vec![BasicAgent::new("hub")
        .with_needs(["tea"])
        .with_offers(["coffee"])];
    for i in 0..3 {
        agents.push(
            BasicAgent::new(format!("spoke-{i}"))
                .with_needs(["coffee"])
                .with_offers(["biscuits"]),
        );
    }
    network(GraphConfig::default().with_bidirectional(false), agents)
}

#[test]
fn acceptance_volume_stops_the_default_policy_early() {
    let mut r = NegotiationRunner::new(generous_hub(), RunnerConfig::default().with_max_rounds(4));
    let result = r.run().unwrap();

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.termination, Some(TerminationReason::AgreementReached));
    assert_eq!(result.rounds_executed, 1);
    assert_eq!(result.stats.totals.acceptances, 3);
    assert_eq!(result.agent_results[0].remaining_needs, vec!["tea".to_string()]);
    assert!(result.stats.agreement_rate < 1.0);
}

#[test]
fn strict_policy_keeps_running_despite_acceptance_volume() {
    let mut r = NegotiationRunner::new(generous_hub(), RunnerConfig::default().with_max_rounds(4))
        .with_policy(Box::new(AllSatisfied));
    let result = r.run().unwrap();

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.termination, Some(TerminationReason::RoundsExhausted));
    assert_eq!(result.rounds_executed, 4);
    assert!(!result.agent_results[0].needs_satisfied);
}

#[test]
fn result_serializes_to_json() {
    let mut r = runner(
        trading_pair("cooperative"),
        RunnerConfig::default().with_max_rounds(3),
    );
    let result = r.run().unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["termination"], "agreement_reached");
    assert_eq!(json["agent_results"][0]["id"], "alice");
    assert!(json["rounds"].as_array().unwrap().len() >= 1);
}

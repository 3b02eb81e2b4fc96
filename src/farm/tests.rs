//! End-to-end scenarios against scripted nodes and requesters.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::config::FarmSettings;
use crate::environment::AttributeCompiler;
use crate::inventory::ProductInfo;
use crate::monitor::FailureReason;
use crate::test_case::{Package, ReleaseMode, Target, TestStatus};
use crate::testing::{CollectingRequester, CollectingSink, Script, ScriptedAgent, wait_for};

struct Harness {
    farm: TestFarm,
    sink: Arc<CollectingSink>,
    requester: Arc<CollectingRequester>,
}

impl Harness {
    fn new(settings: FarmSettings) -> Self {
        let sink = Arc::new(CollectingSink::default());
        let farm = TestFarm::start(
            LiveConfig::new(settings),
            sink.clone(),
            Arc::new(AttributeCompiler),
        );
        let requester = Arc::new(CollectingRequester::default());
        farm.register_client("ci", requester.clone());
        Self {
            farm,
            sink,
            requester,
        }
    }

    fn node(&self, agent: ScriptedAgent, products: &[(&str, &str)]) -> (Arc<ScriptedAgent>, Arc<Node>) {
        let agent = Arc::new(agent);
        let products = products
            .iter()
            .map(|(imei, type_code)| ProductInfo::new(*imei, *type_code))
            .collect();
        let node = self
            .farm
            .register_node(agent.clone(), products, false)
            .unwrap();
        (agent, node)
    }

    async fn outcome(&self, test_id: &str) -> (TestStatus, String) {
        wait_for(test_id, || self.sink.outcome(test_id).is_some()).await;
        self.sink.outcome(test_id).unwrap()
    }

    /// Waits until the requester has been told the final status.
    async fn delivered(&self, test_id: &str) -> Vec<TestStatus> {
        wait_for("final update", || {
            self.requester
                .statuses(test_id)
                .iter()
                .any(TestStatus::is_final)
        })
        .await;
        self.requester.statuses(test_id)
    }

    async fn started(&self, test_id: &str) {
        wait_for("STARTED", || {
            self.requester.statuses(test_id).contains(&TestStatus::Started)
        })
        .await;
    }
}

fn settings() -> FarmSettings {
    FarmSettings {
        scheduler_interval_secs: 1,
        status_interval_secs: 5,
        min_execution_time_secs: 0,
        node_op_timeout_secs: 5,
        ..FarmSettings::default()
    }
}

fn flash(id: &str, environment: &str) -> TestCase {
    TestCase::new(id, Target::Flash)
        .with_environment(environment)
        .with_client("ci")
}

#[tokio::test(start_paused = true)]
async fn test_nose_test_runs_without_sub_id() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(
        ScriptedAgent::new("a:1").with_default(Script::FinishAfter(Duration::from_secs(10))),
        &[],
    );

    h.farm
        .start_test(TestCase::new("T1", Target::Nose).with_client("ci"))
        .unwrap();
    h.started("T1").await;
    assert_eq!(node.running(), 1);

    let (status, _) = h.outcome("T1").await;
    assert_eq!(status, TestStatus::Finished);
    assert_eq!(agent.started_ids(), vec!["T1"]);
    assert_eq!(node.running(), 0);
    assert_eq!(node.executed(), 1);
    assert_eq!(
        h.delivered("T1").await,
        vec![TestStatus::Started, TestStatus::Finished]
    );
    // Once after reserving, once after releasing.
    assert_eq!(agent.product_updates(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_three_packages_split_over_two_products() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(ScriptedAgent::new("a:1"), &[("1", "X"), ("2", "X")]);
    let test = TestCase::new("T2", Target::Flash)
        .with_client("ci")
        .with_package(Package::new("(type=X)", ["a"]))
        .with_package(Package::new("(type=X)", ["b"]))
        .with_package(Package::new("(type=X)", ["c"]));

    h.farm.start_test(test).unwrap();
    let (status, _) = h.outcome("T2").await;
    assert_eq!(status, TestStatus::Finished);

    assert_eq!(agent.started_ids(), vec!["T2_1", "T2_2"]);
    let started = agent.started();
    let packages_of = |sub: usize| {
        started
            .iter()
            .find(|t| t.sub_id == Some(sub))
            .map(|t| t.packages.len())
    };
    assert_eq!(packages_of(1), Some(2));
    assert_eq!(packages_of(2), Some(1));
    assert_eq!(node.free_count(), 2);
    assert_eq!(node.executed(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_product_not_reconnecting_fails_owner() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(
        ScriptedAgent::new("a:1").with_default(Script::Hang),
        &[("1", "X")],
    );
    let mut test = flash("T3", "(type=X)");
    test.product_disconnection_timeout_secs = Some(30);

    h.farm.start_test(test).unwrap();
    h.started("T3").await;
    let detached_at = tokio::time::Instant::now();
    h.farm
        .product_update(ProductChange {
            node: agent.node_id(),
            attached: Vec::new(),
            detached: vec!["1".into()],
        })
        .unwrap();
    assert_eq!(node.status().temporarily_disconnected, 1);

    let (status, detail) = h.outcome("T3").await;
    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("did not reconnect"), "{}", detail);
    assert!(detached_at.elapsed() >= Duration::from_secs(30));
    assert_eq!(node.status().permanently_disconnected, 1);
    assert_eq!(node.status().temporarily_disconnected, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnected_product_returns_to_pool() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(ScriptedAgent::new("a:1"), &[("1", "X")]);
    let change = |attached: Vec<ProductInfo>, detached: Vec<String>| ProductChange {
        node: agent.node_id(),
        attached,
        detached,
    };

    h.farm.product_update(change(Vec::new(), vec!["1".into()])).unwrap();
    assert_eq!(node.status().permanently_disconnected, 1);
    assert_eq!(node.free_count(), 0);

    h.farm
        .product_update(change(vec![ProductInfo::new("1", "X")], Vec::new()))
        .unwrap();
    assert_eq!(node.status().permanently_disconnected, 0);
    assert_eq!(node.free_count(), 1);

    h.farm.start_test(flash("T", "(type=X)")).unwrap();
    assert_eq!(h.outcome("T").await.0, TestStatus::Finished);
}

#[tokio::test(start_paused = true)]
async fn test_fails_when_failures_reach_max_retries() {
    let h = Harness::new(settings());
    let fail = || Script::Fail("flash verification failed".into());
    let (agent, node) = h.node(
        ScriptedAgent::new("a:1").with_script([fail(), fail(), fail()]),
        &[("1", "X")],
    );

    h.farm.start_test(flash("T4", "(type=X)")).unwrap();
    let (status, detail) = h.outcome("T4").await;

    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("failed 3 times"), "{}", detail);
    assert!(detail.contains("flash verification failed"), "{}", detail);
    assert_eq!(agent.started().len(), 3);
    assert_eq!(node.free_count(), 1);
    assert_eq!(node.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_failure_keeps_runtime_id() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(
        ScriptedAgent::new("a:1").with_script([Script::Fail("boom".into()), Script::Finish]),
        &[("1", "X")],
    );

    h.farm.start_test(flash("T", "(type=X)")).unwrap();
    let (status, _) = h.outcome("T").await;

    assert_eq!(status, TestStatus::Finished);
    assert_eq!(agent.started_ids(), vec!["T", "T"]);
    let failures: Vec<_> = h
        .sink
        .node_runs()
        .into_iter()
        .filter(|(_, _, failure)| failure.is_some())
        .collect();
    assert_eq!(failures.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_restart_without_time_for_minimum_execution() {
    let h = Harness::new(FarmSettings {
        min_execution_time_secs: 120,
        ..settings()
    });
    h.node(
        ScriptedAgent::new("a:1").with_script([Script::Fail("boom".into())]),
        &[("1", "X")],
    );

    h.farm
        .start_test(flash("T", "(type=X)").with_timeout_secs(60))
        .unwrap();
    let (status, detail) = h.outcome("T").await;
    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("minimum execution time"), "{}", detail);
}

#[tokio::test(start_paused = true)]
async fn test_two_tests_one_product() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(
        ScriptedAgent::new("a:1").with_default(Script::FinishAfter(Duration::from_secs(5))),
        &[("1", "X")],
    );

    h.farm.start_test(flash("A", "(type=X)")).unwrap();
    h.farm.start_test(flash("B", "(type=X)")).unwrap();

    wait_for("one start", || !agent.started().is_empty()).await;
    assert_eq!(agent.started().len(), 1);
    assert_eq!(node.free_count(), 0);

    assert_eq!(h.outcome("A").await.0, TestStatus::Finished);
    assert_eq!(h.outcome("B").await.0, TestStatus::Finished);

    let a = agent.started_at("A").unwrap();
    let b = agent.started_at("B").unwrap();
    let gap = if a < b { b - a } else { a - b };
    assert!(gap >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_minimum_execution_time() {
    let h = Harness::new(FarmSettings {
        min_execution_time_secs: 20,
        ..settings()
    });
    let (agent, node) = h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);

    h.farm
        .start_test(TestCase::new("F", Target::Nose).with_client("ci"))
        .unwrap();
    h.started("F").await;
    h.farm.stop_test("F").unwrap();

    let (status, detail) = h.outcome("F").await;
    assert_eq!(status, TestStatus::Failed);
    assert_eq!(detail, "stopped by requester");

    let ran = agent.stopped_at("F").unwrap() - agent.started_at("F").unwrap();
    assert!(ran >= Duration::from_secs(20), "stopped after {:?}", ran);
    assert_eq!(node.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_running_test() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);
    let started = tokio::time::Instant::now();

    h.farm
        .start_test(
            TestCase::new("T", Target::Nose)
                .with_client("ci")
                .with_timeout_secs(10),
        )
        .unwrap();
    let (status, detail) = h.outcome("T").await;

    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("timeout"), "{}", detail);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(agent.stopped().len(), 1);
    assert_eq!(node.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsatisfiable_and_unsupported_fail_immediately() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(ScriptedAgent::new("a:1"), &[("1", "X")]);

    h.farm.start_test(flash("empty", "")).unwrap();
    h.farm.start_test(flash("broken", "(type=X")).unwrap();
    h.farm
        .start_test(TestCase::new("emu", Target::from("EMULATOR".to_string())).with_client("ci"))
        .unwrap();

    let (status, detail) = h.outcome("empty").await;
    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("unsatisfiable"), "{}", detail);

    let (status, detail) = h.outcome("broken").await;
    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("unsatisfiable"), "{}", detail);

    let (status, detail) = h.outcome("emu").await;
    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("unsupported target 'EMULATOR'"), "{}", detail);

    assert!(agent.started().is_empty());
    assert_eq!(h.delivered("emu").await, vec![TestStatus::Failed]);
    let mut admitted = h.sink.admitted();
    admitted.sort();
    assert_eq!(admitted, vec!["broken", "emu", "empty"]);
}

#[tokio::test(start_paused = true)]
async fn test_no_resources_within_expectation_timeout() {
    let h = Harness::new(FarmSettings {
        resource_expectation_timeout_secs: 5,
        ..settings()
    });
    h.node(ScriptedAgent::new("a:1"), &[("1", "X")]);

    h.farm.start_test(flash("T", "(type=Z)")).unwrap();
    let (status, detail) = h.outcome("T").await;
    assert_eq!(status, TestStatus::Failed);
    assert!(detail.contains("no matching resources"), "{}", detail);
    assert!(h.farm.status().await.pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_parks_then_resumes() {
    let h = Harness::new(settings());
    h.node(ScriptedAgent::new("a:1"), &[]);
    h.farm.set_maintenance(true);

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("ci"))
        .unwrap();
    wait_for("parked notification", || {
        h.requester
            .updates("T")
            .iter()
            .any(|u| u.detail.contains("maintenance"))
    })
    .await;

    let status = h.farm.status().await;
    assert!(status.maintenance);
    assert_eq!(status.pending.len(), 1);
    assert!(status.pending[0].parked);
    let report = h.farm.check_test("T").await.unwrap();
    assert_eq!(report.state, crate::monitor::MonitorState::Pending);

    h.farm.set_maintenance(false);
    assert_eq!(h.outcome("T").await.0, TestStatus::Finished);
    let parked = h
        .requester
        .updates("T")
        .iter()
        .filter(|u| u.detail.contains("maintenance"))
        .count();
    assert_eq!(parked, 1);
}

#[tokio::test(start_paused = true)]
async fn test_node_maintenance_excludes_node() {
    let h = Harness::new(settings());
    let (busy, _) = h.node(ScriptedAgent::new("a:1"), &[("1", "X")]);
    let (spare, _) = h.node(ScriptedAgent::new("b:1"), &[("2", "X")]);
    h.farm.set_node_maintenance(&busy.node_id(), true).unwrap();

    h.farm.start_test(flash("T", "(type=X)")).unwrap();
    assert_eq!(h.outcome("T").await.0, TestStatus::Finished);
    assert!(busy.started().is_empty());
    assert_eq!(spare.started_ids(), vec!["T"]);
}

#[tokio::test(start_paused = true)]
async fn test_update_only_while_pending() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(
        ScriptedAgent::new("a:1").with_default(Script::Hang),
        &[("1", "X")],
    );
    h.farm.set_maintenance(true);

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("ci"))
        .unwrap();
    h.farm
        .update_test(flash("T", "(type=X)").with_files(["image.bin"]))
        .await
        .unwrap();

    h.farm.set_maintenance(false);
    h.started("T").await;
    let started = agent.started();
    assert_eq!(started[0].target, Target::Flash);
    assert_eq!(started[0].files, vec!["image.bin"]);

    let rejected = h.farm.update_test(flash("T", "(type=Y)")).await;
    assert!(matches!(rejected, Err(FarmError::UpdateRejected { .. })));

    let report = h.farm.check_test("T").await.unwrap();
    assert_eq!(report.active, vec!["T"]);
    assert_eq!(report.products.len(), 1);

    h.farm.stop_test("T").unwrap();
    assert_eq!(h.outcome("T").await.0, TestStatus::Failed);
    assert!(matches!(
        h.farm.check_test("T").await,
        Err(FarmError::UnknownTest(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_node_deregistration_fails_running_tests() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("ci"))
        .unwrap();
    h.started("T").await;
    h.farm.deregister_node(&agent.node_id()).unwrap();

    let (status, detail) = h.outcome("T").await;
    assert_eq!(status, TestStatus::Failed);
    assert_eq!(detail, "node a:1 disconnected");
    assert!(agent.stopped().is_empty());
    assert!(h.farm.registry().is_empty());
    assert!(matches!(
        h.farm.deregister_node(&agent.node_id()),
        Err(FarmError::UnknownNode(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_node_is_deregistered() {
    let h = Harness::new(FarmSettings {
        resource_expectation_timeout_secs: 60,
        ..settings()
    });
    let (agent, _node) = h.node(ScriptedAgent::new("a:1"), &[]);
    agent.set_unreachable(true);

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("ci"))
        .unwrap();
    let (status, _) = h.outcome("T").await;

    assert_eq!(status, TestStatus::Failed);
    assert!(h.farm.registry().is_empty());
    assert!(agent.started().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_manual_release() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(ScriptedAgent::new("a:1"), &[("1", "X")]);

    h.farm
        .start_test(flash("T", "(type=X)").with_release_mode(ReleaseMode::Manual))
        .unwrap();
    assert_eq!(h.outcome("T").await.0, TestStatus::Finished);
    assert_eq!(node.free_count(), 0);
    assert_eq!(node.status().manually_reserved, 1);

    // Expired manual reservations are never swept.
    tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
    assert_eq!(node.free_count(), 0);

    let freed = h
        .farm
        .release_products(&agent.node_id(), &["1".to_string()])
        .unwrap();
    assert_eq!(freed, vec!["1"]);
    assert_eq!(node.free_count(), 1);
    assert_eq!(node.status().manually_reserved, 0);
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_disconnected_product_stays_reserved() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(ScriptedAgent::new("a:1"), &[("1", "X")]);

    h.farm
        .start_test(flash("T", "(type=X)").with_release_mode(ReleaseMode::Manual))
        .unwrap();
    assert_eq!(h.outcome("T").await.0, TestStatus::Finished);

    h.farm
        .product_update(ProductChange {
            node: agent.node_id(),
            attached: Vec::new(),
            detached: vec!["1".into()],
        })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3600)).await;

    let status = node.status();
    assert_eq!(status.temporarily_disconnected, 1);
    assert_eq!(status.permanently_disconnected, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_client_stops_its_tests() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);
    let flaky = Arc::new(CollectingRequester::failing());
    h.farm.register_client("flaky", flaky.clone());

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("flaky"))
        .unwrap();
    let (status, detail) = h.outcome("T").await;

    assert_eq!(status, TestStatus::Failed);
    assert_eq!(detail, "requester flaky is unreachable");
    assert_eq!(agent.stopped().len(), 1);
    assert!(matches!(
        h.farm.deregister_client("flaky"),
        Err(FarmError::UnknownClient(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_ids_rejected() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("ci"))
        .unwrap();
    assert!(matches!(
        h.farm.start_test(TestCase::new("T", Target::Nose)),
        Err(FarmError::DuplicateTest(_))
    ));
    assert!(matches!(
        h.farm.register_node(agent.clone(), Vec::new(), false),
        Err(FarmError::DuplicateNode(_))
    ));
    assert!(matches!(
        h.farm.start_test(TestCase::new(" ", Target::Nose)),
        Err(FarmError::InvalidRequest(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_status_snapshots_reach_sink() {
    let h = Harness::new(settings());
    h.node(ScriptedAgent::new("a:1"), &[("1", "X")]);

    wait_for("two snapshots", || h.sink.status_snapshots() >= 2).await;
    let status = h.farm.status().await;
    assert_eq!(status.nodes.len(), 1);
    assert_eq!(status.nodes[0].products.len(), 1);
    assert_eq!(status.monitors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_running_tests() {
    let h = Harness::new(settings());
    h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("ci"))
        .unwrap();
    h.started("T").await;
    h.farm.shutdown().await;

    let (status, detail) = h.outcome("T").await;
    assert_eq!(status, TestStatus::Failed);
    assert_eq!(detail, "farm is shutting down");
    assert_eq!(h.farm.active_tests(), 0);
    assert_eq!(h.sink.finished().len(), 1);
    assert!(matches!(
        h.farm.start_test(TestCase::new("U", Target::Nose)),
        Err(FarmError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_handle_dispatches_requests() {
    let h = Harness::new(settings());
    let agent = Arc::new(ScriptedAgent::new("a:1").with_default(Script::Hang));

    let response = h
        .farm
        .handle(FarmRequest::RegisterNode {
            agent: agent.clone(),
            products: Vec::new(),
            maintenance: false,
        })
        .await
        .unwrap();
    assert!(matches!(response, FarmResponse::NodeRegistered(ref id) if id.as_str() == "a:1"));

    h.farm
        .handle(FarmRequest::StartTest(
            TestCase::new("T", Target::Nose).with_client("ci"),
        ))
        .await
        .unwrap();
    h.started("T").await;

    let response = h
        .farm
        .handle(FarmRequest::CheckTest {
            test_id: "T".into(),
        })
        .await
        .unwrap();
    match response {
        FarmResponse::Report(report) => assert_eq!(report.active, vec!["T"]),
        other => panic!("unexpected {:?}", other),
    }

    h.farm
        .handle(FarmRequest::StopTest {
            test_id: "T".into(),
        })
        .await
        .unwrap();
    assert_eq!(h.outcome("T").await.1, "stopped by requester");

    h.farm
        .handle(FarmRequest::DeregisterClient {
            client_id: "ci".into(),
        })
        .await
        .unwrap();
    assert!(matches!(
        h.farm
            .handle(FarmRequest::DeregisterNode {
                node: NodeId::from("zz:1"),
            })
            .await,
        Err(FarmError::UnknownNode(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_returns_after_minimum_execution_floor() {
    let h = Harness::new(FarmSettings {
        min_execution_time_secs: 20,
        ..settings()
    });
    let (agent, _node) = h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);

    h.farm
        .start_test(TestCase::new("T", Target::Nose).with_client("ci"))
        .unwrap();
    h.started("T").await;
    h.farm.shutdown().await;

    assert_eq!(h.farm.active_tests(), 0);
    let ran = agent.stopped_at("T").unwrap() - agent.started_at("T").unwrap();
    assert!(ran >= Duration::from_secs(20), "stopped after {:?}", ran);
    assert_eq!(h.sink.outcome("T").unwrap().1, "farm is shutting down");
}

#[tokio::test(start_paused = true)]
async fn test_silent_requester_does_not_delay_stop() {
    let h = Harness::new(FarmSettings {
        node_op_timeout_secs: 30,
        node_op_retries: 3,
        ..settings()
    });
    let (agent, _node) = h.node(ScriptedAgent::new("a:1").with_default(Script::Hang), &[]);
    let silent = Arc::new(CollectingRequester::silent());
    h.farm.register_client("silent", silent.clone());

    h.farm
        .start_test(TestCase::new("S", Target::Nose).with_client("silent"))
        .unwrap();
    wait_for("node start", || !agent.started().is_empty()).await;

    let report = tokio::time::timeout(Duration::from_secs(1), h.farm.check_test("S"))
        .await
        .expect("check answered while the requester hangs")
        .unwrap();
    assert_eq!(report.active, vec!["S"]);

    let asked = tokio::time::Instant::now();
    h.farm.stop_test("S").unwrap();
    wait_for("node stop", || !agent.stopped().is_empty()).await;
    assert!(agent.stopped_at("S").unwrap() <= asked + Duration::from_secs(5));
    assert_eq!(h.outcome("S").await.1, "stopped by requester");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_execution_stream_is_connection_lost() {
    let h = Harness::new(FarmSettings {
        max_retries: 1,
        ..settings()
    });
    let (agent, node) = h.node(
        ScriptedAgent::new("a:1").with_script([Script::Disconnect]),
        &[("1", "X")],
    );

    h.farm.start_test(flash("T", "(type=X)")).unwrap();
    let (status, detail) = h.outcome("T").await;

    assert_eq!(status, TestStatus::Failed);
    assert_eq!(
        detail,
        "failed 1 times; last failure: connection to node lost during execution"
    );
    assert_eq!(agent.started().len(), 1);
    assert_eq!(node.free_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_start_is_not_resent() {
    let h = Harness::new(settings());
    let (agent, node) = h.node(
        ScriptedAgent::new("a:1").with_script([Script::Reject]),
        &[("1", "X")],
    );

    h.farm.start_test(flash("T", "(type=X)")).unwrap();
    assert_eq!(h.outcome("T").await.0, TestStatus::Finished);

    // The rejection consumed the first script entry; a resend would have
    // finished within the same run instead of failing it.
    let runs = h.sink.node_runs();
    assert_eq!(runs.len(), 2);
    assert!(
        matches!(&runs[0].2, Some(FailureReason::StartFailed(reason)) if reason.contains("scripted rejection")),
        "{:?}",
        runs[0]
    );
    assert!(runs[1].2.is_none());
    assert_eq!(agent.started_ids(), vec!["T"]);
    assert_eq!(node.free_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_start_is_stopped_not_resent() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(
        ScriptedAgent::new("a:1").with_script([Script::Unanswered]),
        &[("1", "X")],
    );

    h.farm.start_test(flash("T", "(type=X)")).unwrap();
    assert_eq!(h.outcome("T").await.0, TestStatus::Finished);

    // One unanswered start, then the restart.
    assert_eq!(agent.started_ids(), vec!["T", "T"]);
    assert_eq!(agent.stopped().len(), 1);
    let runs = h.sink.node_runs();
    assert!(
        matches!(&runs[0].2, Some(FailureReason::StartFailed(reason)) if reason.contains("no answer")),
        "{:?}",
        runs[0]
    );
}

#[tokio::test(start_paused = true)]
async fn test_check_after_restart_lists_only_live_products() {
    let h = Harness::new(settings());
    let (agent, _node) = h.node(
        ScriptedAgent::new("a:1")
            .with_script([Script::Fail("boom".into())])
            .with_default(Script::Hang),
        &[("1", "X"), ("2", "X")],
    );

    h.farm.start_test(flash("T", "(type=X)")).unwrap();
    wait_for("restart", || agent.started().len() == 2).await;

    let report = h.farm.check_test("T").await.unwrap();
    assert_eq!(report.failures, 1);
    assert_eq!(report.active, vec!["T"]);
    assert_eq!(report.products.len(), 1);
    assert_eq!(report.products, agent.started()[1].reserved_products);

    h.farm.stop_test("T").unwrap();
    assert_eq!(h.outcome("T").await.1, "stopped by requester");
}

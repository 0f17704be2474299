use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use loadswarm::collector::{CollectorService, CreateSessionResponse, SessionReportView};
use loadswarm::session::AgentInfo;
use loadswarm::stats::{RequestResult, RunStatus, StatsCollector, StatsIdentity};

struct CollectorFixture {
    service: CollectorService,
    base: String,
    client: reqwest::Client,
}

async fn collector() -> CollectorFixture {
    let service = CollectorService::new().unwrap();
    let server = service.start(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    CollectorFixture {
        service,
        base: format!("http://{}", server.addr),
        client: reqwest::Client::new(),
    }
}

fn agent_info(id: &str, url: &str) -> AgentInfo {
    AgentInfo {
        id: id.to_string(),
        callback: format!("http://127.0.0.1:1/{}", id),
        url: url.to_string(),
        method: "GET".to_string(),
        status: String::new(),
    }
}

fn final_report(test_id: &str, agent_id: &str, total: u64, status: RunStatus) -> serde_json::Value {
    let mut collector = StatsCollector::new(
        StatsIdentity {
            test_id: test_id.to_string(),
            agent_id: agent_id.to_string(),
            url: "http://target/x".to_string(),
            method: "GET".to_string(),
        },
        total,
    );
    for _ in 0..total {
        collector.record(RequestResult {
            duration: Duration::from_millis(12),
            sent: 10,
            received: 120,
            status: 200,
            error: None,
        });
    }
    serde_json::to_value(collector.snapshot(status)).unwrap()
}

#[tokio::test]
async fn create_session_and_reuse_pending() {
    let fixture = collector().await;

    let first: CreateSessionResponse = fixture
        .client
        .post(format!("{}/tests?agent_num=2", fixture.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(first.test_id.starts_with("tid_"));
    assert_eq!(first.agent_num, "0/2");

    // A pending session with capacity is returned as-is.
    let second: CreateSessionResponse = fixture
        .client
        .post(format!("{}/tests?agent_num=5", fixture.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second.test_id, first.test_id);
    assert_eq!(second.agent_num, "0/2");

    fixture.service.shutdown();
}

#[tokio::test]
async fn create_session_rejects_zero_agents() {
    let fixture = collector().await;

    let response = fixture
        .client
        .post(format!("{}/tests?agent_num=0", fixture.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let missing = fixture
        .client
        .post(format!("{}/tests", fixture.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);

    fixture.service.shutdown();
}

#[tokio::test]
async fn register_without_session_answers_503() {
    let fixture = collector().await;

    let response = fixture
        .client
        .post(format!("{}/register", fixture.base))
        .json(&agent_info("a1", "http://target/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    fixture.service.shutdown();
}

#[tokio::test]
async fn register_and_duplicate_conflict() {
    let fixture = collector().await;
    fixture.service.create_session(2);

    let response = fixture
        .client
        .post(format!("{}/register", fixture.base))
        .json(&agent_info("a1", "http://target/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["agentID"], "a1");
    assert!(body["testID"].as_str().unwrap().starts_with("tid_"));

    let duplicate = fixture
        .client
        .post(format!("{}/register", fixture.base))
        .json(&agent_info("a1", "http://target/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    fixture.service.shutdown();
}

#[tokio::test]
async fn register_target_mismatch_conflicts() {
    let fixture = collector().await;
    fixture.service.create_session(2);

    fixture
        .client
        .post(format!("{}/register", fixture.base))
        .json(&agent_info("a1", "http://x"))
        .send()
        .await
        .unwrap();

    let mismatch = fixture
        .client
        .post(format!("{}/register", fixture.base))
        .json(&agent_info("a2", "http://y"))
        .send()
        .await
        .unwrap();
    assert_eq!(mismatch.status(), 409);
    let message = mismatch.text().await.unwrap();
    assert!(message.contains("http://x"));

    fixture.service.shutdown();
}

#[tokio::test]
async fn second_empty_session_takes_mismatched_agent() {
    let fixture = collector().await;

    let first: CreateSessionResponse = fixture
        .client
        .post(format!("{}/tests?agent_num=1", fixture.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    fixture
        .client
        .post(format!("{}/register", fixture.base))
        .json(&agent_info("a1", "http://x"))
        .send()
        .await
        .unwrap();

    // First session is full; this creates a second, empty one.
    let second: CreateSessionResponse = fixture
        .client
        .post(format!("{}/tests?agent_num=1", fixture.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_ne!(second.test_id, first.test_id);

    let placed = fixture
        .client
        .post(format!("{}/register", fixture.base))
        .json(&agent_info("a2", "http://y"))
        .send()
        .await
        .unwrap();
    assert_eq!(placed.status(), 200);
    let body: serde_json::Value = placed.json().await.unwrap();
    assert_eq!(body["testID"], second.test_id.as_str());

    fixture.service.shutdown();
}

#[tokio::test]
async fn report_ingestion_and_aggregate_view() {
    let fixture = collector().await;
    let session = fixture.service.create_session(2);
    for id in ["a1", "a2"] {
        fixture
            .service
            .register_agent(agent_info(id, "http://target/x"))
            .unwrap();
    }

    for (id, total) in [("a1", 10u64), ("a2", 10u64)] {
        let response = fixture
            .client
            .post(format!("{}/tests/{}/report", fixture.base, session.test_id))
            .json(&final_report(&session.test_id, id, total, RunStatus::Finished))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let view: SessionReportView = fixture
        .client
        .get(format!("{}/tests/{}/report", fixture.base, session.test_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(view.status, "completed");
    assert_eq!(view.registered_agents, 2);
    assert_eq!(view.expected_agents, 2);

    let aggregate = view.report.unwrap();
    assert_eq!(aggregate.total_requests, 20);
    assert_eq!(aggregate.success_count, 20);
    assert_eq!(aggregate.status_codes.get(&200), Some(&20));

    let status_map: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&aggregate.status).unwrap();
    assert_eq!(
        status_map.get("finished"),
        Some(&vec!["a1".to_string(), "a2".to_string()])
    );

    fixture.service.shutdown();
}

#[tokio::test]
async fn duplicate_final_report_leaves_aggregate_unchanged() {
    let fixture = collector().await;
    let session = fixture.service.create_session(2);
    fixture
        .service
        .register_agent(agent_info("a1", "http://target/x"))
        .unwrap();

    let report = final_report(&session.test_id, "a1", 10, RunStatus::Finished);
    for _ in 0..2 {
        fixture
            .client
            .post(format!("{}/tests/{}/report", fixture.base, session.test_id))
            .json(&report)
            .send()
            .await
            .unwrap();
    }

    let view: SessionReportView = fixture
        .client
        .get(format!("{}/tests/{}/report", fixture.base, session.test_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view.report.unwrap().total_requests, 10);

    fixture.service.shutdown();
}

#[tokio::test]
async fn mixed_finals_mark_session_stopped() {
    let fixture = collector().await;
    let session = fixture.service.create_session(2);
    for id in ["a1", "a2"] {
        fixture
            .service
            .register_agent(agent_info(id, "http://target/x"))
            .unwrap();
    }

    fixture
        .client
        .post(format!("{}/tests/{}/report", fixture.base, session.test_id))
        .json(&final_report(&session.test_id, "a1", 10, RunStatus::Finished))
        .send()
        .await
        .unwrap();
    fixture
        .client
        .post(format!("{}/tests/{}/report", fixture.base, session.test_id))
        .json(&final_report(&session.test_id, "a2", 4, RunStatus::Stopped))
        .send()
        .await
        .unwrap();

    let view: SessionReportView = fixture
        .client
        .get(format!("{}/tests/{}/report", fixture.base, session.test_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view.status, "stopped");

    fixture.service.shutdown();
}

#[tokio::test]
async fn unknown_session_answers_404() {
    let fixture = collector().await;

    let get = fixture
        .client
        .get(format!("{}/tests/tid_missing/report", fixture.base))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), 404);

    let stop = fixture
        .client
        .post(format!("{}/tests/tid_missing/stop", fixture.base))
        .send()
        .await
        .unwrap();
    assert_eq!(stop.status(), 404);

    let ping = fixture
        .client
        .post(format!("{}/ping/tid_missing?agent_id=a1", fixture.base))
        .send()
        .await
        .unwrap();
    assert_eq!(ping.status(), 404);

    fixture.service.shutdown();
}

#[tokio::test]
async fn ping_codes_over_http() {
    let fixture = collector().await;
    let session = fixture.service.create_session(2);
    fixture
        .service
        .register_agent(agent_info("a1", "http://target/x"))
        .unwrap();

    let ok = fixture
        .client
        .post(format!("{}/ping/{}?agent_id=a1", fixture.base, session.test_id))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    let unknown_agent = fixture
        .client
        .post(format!("{}/ping/{}?agent_id=a9", fixture.base, session.test_id))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_agent.status(), 404);

    fixture.service.stop_session(&session.test_id).await;
    let terminal = fixture
        .client
        .post(format!("{}/ping/{}?agent_id=a1", fixture.base, session.test_id))
        .send()
        .await
        .unwrap();
    assert_eq!(terminal.status(), 409);

    fixture.service.shutdown();
}

#[tokio::test]
async fn stop_session_over_http() {
    let fixture = collector().await;
    let session = fixture.service.create_session(2);

    let response = fixture
        .client
        .post(format!("{}/tests/{}/stop", fixture.base, session.test_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let view: SessionReportView = fixture
        .client
        .get(format!("{}/tests/{}/report", fixture.base, session.test_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view.status, "stopped");

    fixture.service.shutdown();
}

//! API server behavior over real TCP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

mod common;
use common::{client, named_workflow, workflow_yaml, Gateway};

#[tokio::test]
async fn health_reports_the_loaded_workflow() {
    let gateway = Gateway::start(&workflow_yaml("1.0.0", "/api/chat")).await;

    let res = client().get(gateway.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["workflow"]["name"], "agent");

    gateway.served.stop().await;
}

#[tokio::test]
async fn requests_reach_the_executor_normalized() {
    let gateway = Gateway::start(&workflow_yaml("1.0.0", "/api/chat")).await;

    let res = client()
        .post(gateway.url("/api/chat?lang=en"))
        .header("x-request-id", "req-42")
        .json(&serde_json::json!({"q": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-request-id"], "req-42");

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["meta"]["requestID"], "req-42");
    let request = &body["data"]["request"];
    assert_eq!(request["method"], "POST");
    assert_eq!(request["path"], "/api/chat");
    assert_eq!(request["query"]["lang"], "en");
    assert_eq!(request["body"]["q"], "hello");
    assert_eq!(request["ip"], "127.0.0.1");

    gateway.served.stop().await;
}

#[tokio::test]
async fn unknown_paths_and_methods_are_rejected() {
    let gateway = Gateway::start(&workflow_yaml("1.0.0", "/api/chat")).await;
    let http = client();

    let res = http.get(gateway.url("/nowhere")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.text().await.unwrap(), "404 page not found\n");

    let res = http.delete(gateway.url("/api/chat")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    let allow = res.headers()["allow"].to_str().unwrap().to_string();
    assert!(allow.contains("GET"));
    assert!(allow.contains("POST"));

    gateway.served.stop().await;
}

#[tokio::test]
async fn generated_request_ids_are_echoed() {
    let gateway = Gateway::start(&workflow_yaml("1.0.0", "/api/chat")).await;

    let res = client().get(gateway.url("/api/chat")).send().await.unwrap();
    let id = res.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(!id.is_empty());
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["meta"]["requestID"], id.as_str());

    gateway.served.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_swaps_routes_and_workflow_together() {
    let alpha = named_workflow("alpha", "/api/alpha");
    let beta = named_workflow("beta", "/api/beta");
    let gateway = Gateway::start(&alpha).await;
    let stop = Arc::new(AtomicBool::new(false));

    let mut clients = Vec::new();
    for _ in 0..4 {
        let http = client();
        let urls = [
            ("alpha", gateway.url("/api/alpha")),
            ("beta", gateway.url("/api/beta")),
        ];
        let stop = stop.clone();
        clients.push(tokio::spawn(async move {
            let mut served = 0usize;
            while !stop.load(Ordering::Relaxed) {
                for (route, url) in &urls {
                    let res = http.get(url.as_str()).send().await.unwrap();
                    match res.status() {
                        StatusCode::OK => {
                            let body: Value = res.json().await.unwrap();
                            assert_eq!(body["data"]["actionId"], *route);
                            served += 1;
                        }
                        StatusCode::NOT_FOUND => {}
                        other => panic!("unexpected status {other} for {url}"),
                    }
                }
            }
            served
        }));
    }

    let path = gateway.path("workflow.yaml");
    for round in 0..20 {
        let next = if round % 2 == 0 { &beta } else { &alpha };
        std::fs::write(&path, next).unwrap();
        gateway.server.reload_workflow().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop.store(true, Ordering::Relaxed);

    let mut served = 0;
    for handle in clients {
        served += handle.await.unwrap();
    }
    assert!(served > 0);
    assert_eq!(gateway.server.workflow().metadata.name, "alpha");

    gateway.served.stop().await;
}

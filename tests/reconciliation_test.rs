//! Reconciliation sweep tests.
//!
//! These shorten the sweep interval and zero the stale threshold so a
//! freshly created PENDING transaction is immediately eligible.

mod common;

use common::{payment_request, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

async fn spawn_reconciling_app() -> TestApp {
    TestApp::spawn_with(|config| {
        config.reconciliation.interval_secs = 1;
        config.reconciliation.stale_after_secs = 0;
        // Park retries far in the future so the sweep, not the retry
        // path, resolves stuck transactions.
        config.retry.base_delay_ms = 60_000;
        config.retry.max_delay_ms = 120_000;
    })
    .await
}

#[tokio::test]
async fn stale_pending_is_corrected_from_provider_status() {
    let app = spawn_reconciling_app().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_rec_1",
            "status": "pending",
            "code": "00",
            "message": "accepted"
        })))
        .mount(&app.provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/charges/ch_rec_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_rec_1",
            "status": "succeeded",
            "code": "00",
            "message": "settled"
        })))
        .mount(&app.provider)
        .await;

    let body: Value = app
        .create_payment(payment_request("key-rec-1"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "PENDING");
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    app.wait_for_status(id, "SUCCEEDED").await;

    // The correction is audit-tagged as reconciliation, not webhook.
    let trail: Value = app
        .client()
        .get(format!("{}/payments/{id}/audit", app.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let corrected = trail.as_array().unwrap().iter().any(|e| {
        e["source"] == "reconciliation" && e["accepted"] == true && e["to"] == "SUCCEEDED"
    });
    assert!(corrected, "Expected a reconciliation-sourced correction");
}

#[tokio::test]
async fn unacknowledged_stale_transaction_expires() {
    let app = spawn_reconciling_app().await;
    // The provider never answers, so the charge is Pending with no
    // provider id and a retry parked far out.
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(503).set_body_string("gateway down"))
        .mount(&app.provider)
        .await;

    let body: Value = app
        .create_payment(payment_request("key-rec-2"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "PENDING");
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    let body = app.wait_for_status(id, "EXPIRED").await;
    assert!(body["provider_transaction_id"].is_null());
}

#[tokio::test]
async fn unresolvable_transaction_is_flagged_for_manual_review() {
    let app = spawn_reconciling_app().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_rec_3",
            "status": "pending",
            "code": "00",
            "message": "accepted"
        })))
        .mount(&app.provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/charges/ch_rec_3"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "charge_not_found",
            "message": "no such charge"
        })))
        .mount(&app.provider)
        .await;

    let body: Value = app
        .create_payment(payment_request("key-rec-3"))
        .await
        .json()
        .await
        .unwrap();
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    app.wait_for_status(id, "FAILED").await;
    let txn = app.state.ledger.expect(id).await.unwrap();
    assert!(txn.manual_review);
}

#[tokio::test]
async fn matching_provider_state_is_left_alone() {
    let app = spawn_reconciling_app().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_rec_4",
            "status": "pending",
            "code": "00",
            "message": "accepted"
        })))
        .mount(&app.provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/charges/ch_rec_4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_rec_4",
            "status": "pending",
            "code": "00",
            "message": "still processing"
        })))
        .mount(&app.provider)
        .await;

    let body: Value = app
        .create_payment(payment_request("key-rec-4"))
        .await
        .json()
        .await
        .unwrap();
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
    let version_before = body["version"].clone();

    // Give the sweep time to run at least twice.
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;

    let body: Value = app.get_payment(id).await.json().await.unwrap();
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["version"], version_before);
}

//! Webhook verification and dispatch tests.

mod common;

use common::{payment_request, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

/// Create a payment the provider acknowledges but leaves pending, the
/// shape that waits on a webhook to settle.
async fn spawn_pending(app: &TestApp, key: &str, charge_id: &str) -> Uuid {
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": charge_id,
            "status": "pending",
            "code": "00",
            "message": "accepted"
        })))
        .mount(&app.provider)
        .await;

    let body: Value = app
        .create_payment(payment_request(key))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["provider_transaction_id"], charge_id);
    body["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn settlement_webhook_completes_a_pending_payment() {
    let app = TestApp::spawn().await;
    let id = spawn_pending(&app, "key-wh-1", "ch_wh_1").await;

    let response = app
        .deliver_webhook(
            "stripe",
            &json!({
                "event_id": "evt_1",
                "type": "payment.succeeded",
                "provider_transaction_id": "ch_wh_1",
                "code": "00",
                "message": "settled"
            }),
        )
        .await;

    assert_eq!(response.status(), 200);
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["outcome"], "applied");

    let body: Value = app.get_payment(id).await.json().await.unwrap();
    assert_eq!(body["status"], "SUCCEEDED");
}

#[tokio::test]
async fn invalid_signature_is_rejected_without_mutation() {
    let app = TestApp::spawn().await;
    let id = spawn_pending(&app, "key-wh-2", "ch_wh_2").await;

    let event = json!({
        "event_id": "evt_2",
        "type": "payment.succeeded",
        "provider_transaction_id": "ch_wh_2"
    });
    let response = app
        .deliver_webhook_with_signature("stripe", &event, "deadbeef")
        .await;

    assert_eq!(response.status(), 401);
    let body: Value = app.get_payment(id).await.json().await.unwrap();
    assert_eq!(body["status"], "PENDING");
}

#[tokio::test]
async fn missing_signature_header_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client()
        .post(format!("{}/webhooks/stripe", app.address))
        .json(&json!({
            "event_id": "evt_3",
            "type": "payment.succeeded",
            "provider_transaction_id": "ch_none"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn redelivered_event_is_acknowledged_as_duplicate() {
    let app = TestApp::spawn().await;
    let id = spawn_pending(&app, "key-wh-3", "ch_wh_3").await;

    let event = json!({
        "event_id": "evt_4",
        "type": "payment.succeeded",
        "provider_transaction_id": "ch_wh_3"
    });
    let first: Value = app.deliver_webhook("stripe", &event).await.json().await.unwrap();
    assert_eq!(first["outcome"], "applied");

    let second: Value = app.deliver_webhook("stripe", &event).await.json().await.unwrap();
    assert_eq!(second["outcome"], "duplicate");

    let body: Value = app.get_payment(id).await.json().await.unwrap();
    // Applied exactly once.
    assert_eq!(body["version"], 3);
}

#[tokio::test]
async fn out_of_order_webhook_is_discarded() {
    let app = TestApp::spawn().await;

    // Authorize, then fail the capture so the transaction is terminally
    // FAILED with a provider id attached.
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_wh_4",
            "status": "authorized",
            "code": "00",
            "message": "authorized"
        })))
        .mount(&app.provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/charges/ch_wh_4/capture"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "code": "capture_declined",
            "message": "capture declined"
        })))
        .mount(&app.provider)
        .await;

    let body: Value = app
        .create_payment(payment_request("key-wh-4"))
        .await
        .json()
        .await
        .unwrap();
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
    let body: Value = app
        .post_action(id, "capture", json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "FAILED");

    // A late success webhook must not resurrect it.
    let ack: Value = app
        .deliver_webhook(
            "stripe",
            &json!({
                "event_id": "evt_5",
                "type": "payment.succeeded",
                "provider_transaction_id": "ch_wh_4"
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(ack["outcome"], "discarded");

    let body: Value = app.get_payment(id).await.json().await.unwrap();
    assert_eq!(body["status"], "FAILED");

    // The discarded attempt is visible in the audit trail.
    let trail: Value = app
        .client()
        .get(format!("{}/payments/{id}/audit", app.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let discarded = trail
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["accepted"] == false && e["source"] == "webhook");
    assert!(discarded, "Expected a discarded webhook audit event");
}

#[tokio::test]
async fn queued_refund_settles_through_webhook() {
    let app = TestApp::spawn().await;

    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_rf_1",
            "status": "succeeded",
            "code": "00",
            "message": "approved"
        })))
        .mount(&app.provider)
        .await;
    // The provider queues the refund instead of settling it inline.
    Mock::given(method("POST"))
        .and(path("/charges/ch_rf_1/refunds"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "rf_1",
            "status": "pending",
            "code": "00",
            "message": "refund queued"
        })))
        .mount(&app.provider)
        .await;

    let body: Value = app
        .create_payment(payment_request("key-wh-rf-1"))
        .await
        .json()
        .await
        .unwrap();
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    let response = app
        .post_action(id, "refund", json!({ "amount": "100.00" }))
        .await;
    assert_eq!(response.status(), 201);
    let child: Value = response.json().await.unwrap();
    assert_eq!(child["status"], "PENDING");
    assert_eq!(child["provider_transaction_id"], "rf_1");
    let child_id: Uuid = child["id"].as_str().unwrap().parse().unwrap();

    // The parent holds its place until the settlement lands.
    let parent: Value = app.get_payment(id).await.json().await.unwrap();
    assert_eq!(parent["status"], "REFUND_REQUESTED");
    assert_eq!(parent["refunded_amount"], "0");

    let ack: Value = app
        .deliver_webhook(
            "stripe",
            &json!({
                "event_id": "evt_rf_1",
                "type": "refund.succeeded",
                "provider_transaction_id": "rf_1",
                "code": "00",
                "message": "refund settled"
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(ack["outcome"], "applied");

    let child: Value = app.get_payment(child_id).await.json().await.unwrap();
    assert_eq!(child["status"], "SUCCEEDED");
    let parent: Value = app.get_payment(id).await.json().await.unwrap();
    assert_eq!(parent["status"], "REFUNDED");
    assert_eq!(parent["refunded_amount"], "100.00");
}

#[tokio::test]
async fn webhook_for_unknown_transaction_is_discarded() {
    let app = TestApp::spawn().await;

    let ack: Value = app
        .deliver_webhook(
            "stripe",
            &json!({
                "event_id": "evt_6",
                "type": "payment.succeeded",
                "provider_transaction_id": "ch_never_seen"
            }),
        )
        .await
        .json()
        .await
        .unwrap();

    assert_eq!(ack["outcome"], "discarded");
}

#[tokio::test]
async fn unknown_provider_path_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .deliver_webhook(
            "square",
            &json!({
                "event_id": "evt_7",
                "type": "payment.succeeded",
                "provider_transaction_id": "ch_x"
            }),
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn lookup_by_provider_transaction_id() {
    let app = TestApp::spawn().await;
    let id = spawn_pending(&app, "key-wh-5", "ch_wh_5").await;

    let body: Value = app
        .client()
        .get(format!("{}/payments/by-external/ch_wh_5", app.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["id"], id.to_string());
}

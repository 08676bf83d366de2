use layered_retry::alerts::{AlertCorrelationSystem, AlertSystemOptions, DispatchMode};
use layered_retry::dispatch::{AlertDispatcher, WebhookDispatcher};
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_webhook_email_delivery() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/email")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "recipients": ["ops@example.com"],
            "subject": "BNE down"
        })))
        .with_status(202)
        .create_async()
        .await;

    let dispatcher = WebhookDispatcher::new(Some(format!("{}/email", server.url())), None);
    let delivered = dispatcher
        .send_email(&["ops@example.com".to_string()], "BNE down", "details")
        .await;

    assert!(delivered);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_webhook_sms_error_status_is_false() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/sms")
        .match_body(Matcher::PartialJson(json!({
            "phone_number": "+15550100"
        })))
        .with_status(500)
        .create_async()
        .await;

    let dispatcher = WebhookDispatcher::new(None, Some(format!("{}/sms", server.url())));
    assert!(!dispatcher.send_sms("+15550100", "BNE down").await);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_webhook_is_false() {
    let dispatcher = WebhookDispatcher::new(Some("http://127.0.0.1:9/email".to_string()), None);
    assert!(!dispatcher.send_email(&[], "subject", "content").await);
}

#[tokio::test]
async fn test_email_only_never_hits_sms_webhook() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/sms")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let dispatcher = Arc::new(WebhookDispatcher::new(
        None,
        Some(format!("{}/sms", server.url())),
    ));
    let alerts = AlertCorrelationSystem::new(
        AlertSystemOptions::for_mode(DispatchMode::EmailOnly),
        dispatcher,
    );

    assert!(alerts.send_sms_alert("+15550100", "BNE down").await);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_normal_mode_routes_sms_to_webhook() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/sms")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dispatcher = Arc::new(WebhookDispatcher::new(
        None,
        Some(format!("{}/sms", server.url())),
    ));
    let alerts =
        AlertCorrelationSystem::new(AlertSystemOptions::for_mode(DispatchMode::Normal), dispatcher);

    assert!(alerts.send_sms_alert("+15550100", "BNE down").await);
    mock.assert_async().await;
}

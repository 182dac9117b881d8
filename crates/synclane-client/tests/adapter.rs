use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use synclane_client::{
    GENERIC_ERROR_MESSAGE, HeaderMap, MemoryStore, OutboundRequest, Query, RequestError,
    RequestOptions, SESSION_TIMEOUT_MESSAGE, SessionExpiryHandler, SyncClient, TransportError,
    TransportResponse,
};
use synclane_events::{CancelReason, ClientEvent};
use synclane_test_support::assert::eventually;
use synclane_test_support::fixtures::{business_errors, client, client_config, ok, unauthorized};
use synclane_test_support::mocks::{Reply, ScriptedTransport};

const SETTLE: Duration = Duration::from_secs(2);

#[tokio::test]
async fn business_errors_are_retried_up_to_the_limit() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(business_errors(422, &["Version conflict"]));
    let client = client(transport.clone())?;

    let err = client.get("/orders").await.err();

    assert_eq!(
        err,
        Some(RequestError::Business {
            status: 422,
            message: "Version conflict".into(),
        })
    );
    assert_eq!(transport.call_count(), 3);
    assert_eq!(client.metrics().snapshot().request_retries_total, 2);
    Ok(())
}

#[tokio::test]
async fn blacklisted_statuses_are_not_retried() -> anyhow::Result<()> {
    for status in [400, 404, 500] {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always(business_errors(status, &["Rejected"]));
        let client = client(transport.clone())?;

        let err = client.get("/orders").await.err();

        assert_eq!(transport.call_count(), 1, "status {status}");
        assert_eq!(err.and_then(|err| err.status()), Some(status));
    }
    Ok(())
}

#[tokio::test]
async fn retry_recovers_when_the_server_does() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push(business_errors(409, &["Busy"]))
        .push(ok(json!({ "id": 7 })));
    let client = client(transport.clone())?;

    let response = client.get("/orders/7").await?;

    assert_eq!(response.data, Some(json!({ "id": 7 })));
    assert_eq!(transport.call_count(), 2);
    assert_eq!(client.metrics().snapshot().request_retries_total, 1);
    Ok(())
}

#[tokio::test]
async fn session_timeout_cancels_every_other_pending_request() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .route("/slow", Reply::Hang)
        .route("/reports", Reply::Hang)
        .route("/me", unauthorized());
    let client = client(transport.clone())?;
    client.session().set_token("abc123")?;
    let mut events = client.events().subscribe(None);

    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.get("/slow").await }
    });
    let reports = tokio::spawn({
        let client = client.clone();
        async move { client.get("/reports").await }
    });
    eventually(SETTLE, || transport.call_count() == 2).await?;

    let query: Query<Value> =
        Query::new(Value::Null).with_session_handler(Arc::new(client.clone()));
    let outcome = query.load(|| client.get_json::<Value>("/me"), false).await;

    assert_eq!(
        outcome.err(),
        Some(RequestError::SessionTimeout {
            message: SESSION_TIMEOUT_MESSAGE.into(),
        })
    );
    assert!(slow.await?.is_err_and(|err| err.is_cancelled()));
    assert!(reports.await?.is_err_and(|err| err.is_cancelled()));

    let state = query.state();
    assert!(!state.loaded);
    assert_eq!(state.error_message, None);
    assert_eq!(client.session().token()?, None);
    assert!(
        transport
            .calls()
            .iter()
            .all(|call| call.headers.get("authorization").map(String::as_str) == Some("Bearer abc123"))
    );

    let cancelled = events.next().await.map(|envelope| envelope.event);
    assert_eq!(
        cancelled,
        Some(ClientEvent::RequestsCancelled {
            count: 2,
            reason: CancelReason::SessionTimeout,
        })
    );
    let expired = events.next().await.map(|envelope| envelope.event);
    assert_eq!(
        expired,
        Some(ClientEvent::SessionExpired {
            message: SESSION_TIMEOUT_MESSAGE.into(),
        })
    );
    assert_eq!(client.metrics().snapshot().session_timeouts_total, 1);
    assert_eq!(client.metrics().cancelled_count("session_timeout"), 2);
    Ok(())
}

#[tokio::test]
async fn expiry_phrase_in_body_is_a_session_timeout() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(TransportResponse::json(
        403,
        json!({ "message": "Your session expired, please sign in" }),
    ));
    let client = client(transport)?;

    let err = client.get("/me").await.err();

    assert_eq!(
        err,
        Some(RequestError::SessionTimeout {
            message: "Your session expired, please sign in".into(),
        })
    );
    Ok(())
}

#[tokio::test]
async fn rotated_headers_apply_to_later_calls() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push(ok(json!({})).with_header("x-next-session", "s-2"))
        .push(ok(json!({})));
    let client = SyncClient::builder(client_config())
        .transport(transport.clone())
        .rotate_headers(|response: &HeaderMap, current: &HeaderMap| {
            let mut next = current.clone();
            if let Some(session) = response.get("x-next-session") {
                next.insert("x-session".into(), session.clone());
            }
            next
        })
        .build()?;
    let mut events = client.events().subscribe(None);

    client.get("/first").await?;
    client.get("/second").await?;

    let calls = transport.calls();
    assert_eq!(calls[0].headers.get("x-session"), None);
    assert_eq!(calls[1].headers.get("x-session").map(String::as_str), Some("s-2"));
    assert_eq!(
        client.session().default_headers()?.get("x-session").map(String::as_str),
        Some("s-2")
    );
    assert_eq!(
        events.next().await.map(|envelope| envelope.event),
        Some(ClientEvent::HeadersRotated {
            names: vec!["x-session".into()],
        })
    );
    Ok(())
}

#[tokio::test]
async fn window_focus_reloads_persisted_headers() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(ok(json!({})));
    let client = SyncClient::builder(client_config())
        .transport(transport.clone())
        .store(store)
        .build()?;
    let mut events = client.events().subscribe(None);

    let mut written_elsewhere = HeaderMap::new();
    written_elsewhere.insert("x-tenant".into(), "acme".into());
    client.session().set_default_headers(&written_elsewhere)?;
    assert_eq!(client.default_headers().get("x-tenant"), None);

    let reloaded = client.on_window_focus()?;
    client.get("/tenants/current").await?;

    assert_eq!(reloaded, written_elsewhere);
    assert_eq!(
        transport.calls()[0].headers.get("x-tenant").map(String::as_str),
        Some("acme")
    );
    assert_eq!(
        events.next().await.map(|envelope| envelope.event),
        Some(ClientEvent::HeadersReloaded {
            names: vec!["x-tenant".into()],
        })
    );
    Ok(())
}

#[tokio::test]
async fn labels_prefix_failure_messages() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .route("/teams", TransportResponse::json(404, json!({ "message": "Not found" })))
        .route("/me", unauthorized());
    let client = client(transport)?;

    let teams = client
        .request(
            OutboundRequest::get("/teams").with_label("Load teams"),
            RequestOptions::default(),
        )
        .await
        .err();
    let me = client
        .request(
            OutboundRequest::get("/me").with_label("Load profile"),
            RequestOptions::default(),
        )
        .await
        .err();

    assert_eq!(teams.map(|err| err.to_string()), Some("Load teams: Not found".into()));
    assert_eq!(me.map(|err| err.to_string()), Some(SESSION_TIMEOUT_MESSAGE.into()));
    Ok(())
}

#[tokio::test]
async fn controller_aborts_an_in_flight_call() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(Reply::Hang);
    let client = client(transport.clone())?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .request(
                    OutboundRequest::get("/export"),
                    RequestOptions::with_controller(move |controller| {
                        let _ = tx.send(controller);
                    }),
                )
                .await
        }
    });
    let controller = rx.await?;
    eventually(SETTLE, || transport.call_count() == 1).await?;
    controller.cancel_request();

    assert_eq!(call.await?.err(), Some(RequestError::Cancelled));
    assert!(controller.is_cancelled());
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn transport_failures_are_classified() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push(Reply::Fail(TransportError::new("connection refused")))
        .push(Reply::Fail(TransportError::new("Request failed with status code 0")))
        .push(Reply::Fail(TransportError::timeout()));
    let client = client(transport)?;

    let refused = client.get("/a").await.err();
    let opaque = client.get("/b").await.err();
    let timed_out = client.get("/c").await.err();

    assert_eq!(
        refused,
        Some(RequestError::Transport {
            message: "connection refused".into(),
        })
    );
    assert_eq!(
        opaque,
        Some(RequestError::Generic {
            status: None,
            message: GENERIC_ERROR_MESSAGE.into(),
        })
    );
    assert_eq!(
        timed_out,
        Some(RequestError::Transport {
            message: "Request timed out".into(),
        })
    );
    Ok(())
}

#[tokio::test]
async fn decode_failures_are_reported() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(ok(json!({ "unexpected": true })));
    let client = client(transport)?;

    let err = client.get_json::<Vec<u32>>("/numbers").await.err();

    assert!(matches!(err, Some(RequestError::Decode { .. })));
    Ok(())
}

#[tokio::test]
async fn dispose_cancels_pending_and_rejects_new_calls() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(Reply::Hang);
    let client = client(transport.clone())?;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get("/stream").await }
    });
    eventually(SETTLE, || transport.call_count() == 1).await?;
    client.dispose();

    assert_eq!(pending.await?.err(), Some(RequestError::Cancelled));
    assert_eq!(client.get("/later").await.err(), Some(RequestError::Cancelled));
    assert_eq!(transport.call_count(), 1);
    assert!(client.is_disposed());
    assert_eq!(client.metrics().cancelled_count("client_disposed"), 1);
    Ok(())
}

#[tokio::test]
async fn file_backed_session_survives_a_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = client_config();
    config.session.storage_path = Some(dir.path().join("session.json"));

    let transport = Arc::new(ScriptedTransport::new());
    transport.always(ok(json!({})));
    let first = SyncClient::builder(config.clone())
        .transport(transport.clone())
        .build()?;
    first.session().set_token("persisted")?;
    let mut defaults = HeaderMap::new();
    defaults.insert("x-locale".into(), "fr-CA".into());
    first.set_default_headers(defaults.clone())?;
    drop(first);

    let second = SyncClient::builder(config)
        .transport(transport.clone())
        .build()?;
    second.get("/me").await?;

    assert_eq!(second.default_headers(), defaults);
    let calls = transport.calls();
    let call = &calls[0];
    assert_eq!(
        call.headers.get("authorization").map(String::as_str),
        Some("Bearer persisted")
    );
    assert_eq!(call.headers.get("x-locale").map(String::as_str), Some("fr-CA"));
    assert_eq!(call.url, "https://api.synclane.test/me");
    Ok(())
}

fn expirations(client: &SyncClient) -> usize {
    client
        .events()
        .backlog_since(0)
        .iter()
        .filter(|envelope| matches!(envelope.event, ClientEvent::SessionExpired { .. }))
        .count()
}

#[tokio::test]
async fn shared_expiry_is_reported_once() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .always(unauthorized())
        .delay(Duration::from_millis(20));
    let client = client(transport.clone())?;
    client.session().set_token("abc123")?;
    let _listener = client.events().subscribe(None);

    let handler: Arc<dyn SessionExpiryHandler> = Arc::new(client.clone());
    let profile: Query<Value> =
        Query::new(Value::Null).with_session_handler(Arc::clone(&handler));
    let avatar: Query<Value> = Query::new(Value::Null).with_session_handler(handler);
    let (first, second) = tokio::join!(
        profile.load(|| client.get_json::<Value>("/me"), false),
        avatar.load(|| client.get_json::<Value>("/me"), false)
    );

    assert!(first.is_err_and(|err| err.is_session_timeout()));
    assert!(second.is_err_and(|err| err.is_session_timeout()));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(expirations(&client), 1);

    client.session().set_token("def456")?;
    let again = profile.load(|| client.get_json::<Value>("/me"), false).await;

    assert!(again.is_err_and(|err| err.is_session_timeout()));
    assert_eq!(expirations(&client), 2);
    Ok(())
}

#[tokio::test]
async fn focus_events_on_the_bus_reload_headers() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(transport)?;
    let runner = tokio::spawn({
        let client = client.clone();
        let events = client.events().subscribe(None);
        async move { client.run(events).await }
    });

    let mut written_elsewhere = HeaderMap::new();
    written_elsewhere.insert("x-tenant".into(), "acme".into());
    client.session().set_default_headers(&written_elsewhere)?;
    client.events().publish(ClientEvent::WindowFocused);

    eventually(SETTLE, || client.default_headers() == written_elsewhere).await?;

    client.dispose();
    client.events().publish(ClientEvent::PointerMoved);
    tokio::time::timeout(SETTLE, runner).await??;
    Ok(())
}

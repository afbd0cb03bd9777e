use axum::Router;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use charla::auth::{mint_token, Claims};
use charla::envelope::Envelope;
use charla::relay::{app, ConversationLog, RelayConfig, RelayState};

const TEST_SECRET: &str = "it-secret";

async fn start_relay(config: RelayConfig) -> (String, oneshot::Sender<()>) {
    let state = RelayState::new(config, ConversationLog::new());
    let app: Router = app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}", addr), shutdown_tx)
}

fn authed_config() -> RelayConfig {
    RelayConfig {
        shared_secret: TEST_SECRET.to_string(),
        no_auth: false,
    }
}

fn token_for(author: &str) -> String {
    mint_token(TEST_SECRET, &Claims::for_subject(author)).expect("mint token")
}

fn get_json(url: &str) -> (u16, Value) {
    match ureq::get(url).call() {
        Ok(response) => {
            let status = response.status();
            (status, response.into_json().expect("response body"))
        }
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(err) => panic!("request failed: {err}"),
    }
}

fn post_json(url: &str, token: Option<&str>, body: Value) -> (u16, Value) {
    let mut request = ureq::post(url);
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    match request.send_json(body) {
        Ok(response) => {
            let status = response.status();
            (status, response.into_json().expect("response body"))
        }
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(err) => panic!("request failed: {err}"),
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let (base_url, shutdown_tx) = start_relay(authed_config()).await;

    let (status, body) = tokio::task::spawn_blocking({
        let url = format!("{base_url}/health");
        move || get_json(&url)
    })
    .await
    .expect("health task");

    shutdown_tx.send(()).ok();

    assert_eq!(status, 200);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn authorized_post_is_minted_stored_and_listed() {
    let (base_url, shutdown_tx) = start_relay(authed_config()).await;

    let (envelope, listed) = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            let url = format!("{base_url}/conversations/standup/messages");
            let (status, body) = post_json(&url, Some(&token_for("alice")), json!({"text": "hola"}));
            assert_eq!(status, 201, "body: {body}");
            let envelope: Envelope = serde_json::from_value(body).expect("envelope");

            let (status, listed) = get_json(&url);
            assert_eq!(status, 200);
            let listed: Vec<Envelope> = serde_json::from_value(listed).expect("history");
            (envelope, listed)
        }
    })
    .await
    .expect("post task");

    shutdown_tx.send(()).ok();

    assert_eq!(envelope.conversation_id, "standup");
    assert_eq!(envelope.author_id, "alice", "author comes from the token");
    assert_eq!(envelope.text, "hola");
    assert!(!envelope.id.is_empty());
    OffsetDateTime::parse(&envelope.timestamp, &Rfc3339).expect("server-minted timestamp");
    assert!(envelope.status.is_none());

    assert_eq!(listed, vec![envelope]);
}

#[tokio::test]
async fn post_without_text_is_rejected_before_auth() {
    let (base_url, shutdown_tx) = start_relay(authed_config()).await;

    let results = tokio::task::spawn_blocking({
        let url = format!("{base_url}/conversations/default/messages");
        move || {
            vec![
                post_json(&url, Some(&token_for("alice")), json!({})),
                post_json(&url, Some(&token_for("alice")), json!({"text": "   "})),
                // The text check runs before the credential check.
                post_json(&url, Some("not-a-token"), json!({})),
            ]
        }
    })
    .await
    .expect("post task");

    shutdown_tx.send(()).ok();

    for (status, body) in results {
        assert_eq!(status, 400, "body: {body}");
        assert_eq!(body, json!({"error": "text required"}));
    }
}

#[tokio::test]
async fn post_with_bad_credentials_is_unauthorized_and_not_stored() {
    let (base_url, shutdown_tx) = start_relay(authed_config()).await;

    let (missing, forged, history) = tokio::task::spawn_blocking({
        let url = format!("{base_url}/conversations/default/messages");
        move || {
            let missing = post_json(&url, None, json!({"text": "hola"}));
            let forged = post_json(&url, Some("aaaa.bbbb"), json!({"text": "hola"}));
            let (_, history) = get_json(&url);
            (missing, forged, history)
        }
    })
    .await
    .expect("post task");

    shutdown_tx.send(()).ok();

    for (status, body) in [missing, forged] {
        assert_eq!(status, 401, "body: {body}");
        assert_eq!(body, json!({"error": "unauthorized"}));
    }
    assert_eq!(history, json!([]), "rejected posts leave no trace");
}

#[tokio::test]
async fn no_auth_mode_accepts_anonymous_posts() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig {
        shared_secret: TEST_SECRET.to_string(),
        no_auth: true,
    })
    .await;

    let (status, body) = tokio::task::spawn_blocking({
        let url = format!("{base_url}/conversations/default/messages");
        move || post_json(&url, None, json!({"text": "hola"}))
    })
    .await
    .expect("post task");

    shutdown_tx.send(()).ok();

    assert_eq!(status, 201);
    let envelope: Envelope = serde_json::from_value(body).expect("envelope");
    assert_eq!(envelope.author_id, "anonymous");
}

#[tokio::test]
async fn unknown_conversation_reads_as_empty() {
    let (base_url, shutdown_tx) = start_relay(authed_config()).await;

    let (status, body) = tokio::task::spawn_blocking({
        let url = format!("{base_url}/conversations/never-seen/messages");
        move || get_json(&url)
    })
    .await
    .expect("get task");

    shutdown_tx.send(()).ok();

    assert_eq!(status, 200);
    assert_eq!(body, json!([]));
}

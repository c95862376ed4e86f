//! HTTP front-end acceptance tests against a live server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;

use parley_server::auth::{Keys, SYSTEM_USER};
use parley_server::config::ServerConfig;
use parley_server::now_ms;
use parley_server::server::{App, Server};

const MAGIC: &str = "http-test-magic";

async fn start_server() -> (SocketAddr, Arc<App>) {
    let config = ServerConfig::for_testing(MAGIC);
    let (http_addr, _repl, app, _handle) = Server::new(config).start().await.unwrap();
    (http_addr, app)
}

fn auth_query(channel: &str, user: &str) -> Vec<(String, String)> {
    let keys = Keys::new(MAGIC);
    let keytime = now_ms();
    let key = keys.key(channel, user, user, "", keytime);
    vec![
        ("channel".into(), channel.into()),
        ("user".into(), user.into()),
        ("displayname".into(), user.into()),
        ("extra".into(), String::new()),
        ("keytime".into(), keytime.to_string()),
        ("key".into(), key),
    ]
}

async fn get(
    http: SocketAddr,
    path: &str,
    query: &[(String, String)],
) -> (reqwest::StatusCode, Value) {
    let response = reqwest::Client::new()
        .get(format!("http://{http}/{path}"))
        .query(query)
        .send()
        .await
        .unwrap();
    let status = response.status();
    let body = response.json().await.unwrap();
    (status, body)
}

#[tokio::test]
async fn say_then_poll_round_trip() {
    let (http, _app) = start_server().await;

    let mut query = auth_query("general", "alice");
    query.push(("message".into(), "hello world".into()));
    query.push(("unique".into(), "u1".into()));
    let (status, _) = get(http, "say", &query).await;
    assert!(status.is_success());

    let mut query = auth_query("general", "alice");
    query.push(("lasttime".into(), "0".into()));
    let (status, body) = get(http, "poll", &query).await;
    assert!(status.is_success());
    let messages = body["messages"].as_array().unwrap();
    // Join synthesized before the say.
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["type"], "JOIN");
    assert_eq!(messages[1]["type"], "SAY");
    assert_eq!(messages[1]["text"], "hello world");
    // Untrusted callers see the masked user id.
    let keys = Keys::new(MAGIC);
    assert_eq!(messages[1]["user"], Value::from(keys.masked_user("alice")));
    assert!(body["delay"].as_i64().unwrap() >= 2_000);
    assert!(body["lastTime"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn system_user_sees_real_ids() {
    let (http, _app) = start_server().await;

    let mut query = auth_query("backstage", "alice");
    query.push(("message".into(), "psst".into()));
    query.push(("unique".into(), "u1".into()));
    get(http, "say", &query).await;

    let mut query = auth_query("backstage", SYSTEM_USER);
    query.push(("lasttime".into(), "0".into()));
    let (status, body) = get(http, "poll", &query).await;
    assert!(status.is_success());
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages[1]["user"], "alice");
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let (http, _app) = start_server().await;

    let mut query = auth_query("general", "alice");
    query[5].1 = "0".repeat(40);
    query.push(("message".into(), "hi".into()));
    query.push(("unique".into(), "u1".into()));
    let (status, body) = get(http, "say", &query).await;
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "auth");
}

#[tokio::test]
async fn expired_key_is_rejected() {
    let (http, _app) = start_server().await;

    let keys = Keys::new(MAGIC);
    let keytime = now_ms() - 2 * 3_600_000;
    let key = keys.key("general", "alice", "alice", "", keytime);
    let query = vec![
        ("channel".to_string(), "general".to_string()),
        ("user".to_string(), "alice".to_string()),
        ("displayname".to_string(), "alice".to_string()),
        ("extra".to_string(), String::new()),
        ("keytime".to_string(), keytime.to_string()),
        ("key".to_string(), key),
        ("lasttime".to_string(), "0".to_string()),
    ];
    let (status, body) = get(http, "poll", &query).await;
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "auth");
}

#[tokio::test]
async fn invalid_channel_name_is_rejected() {
    let (http, _app) = start_server().await;

    let mut query = auth_query("no spaces allowed", "alice");
    query.push(("lasttime".into(), "0".into()));
    let (status, body) = get(http, "poll", &query).await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_parameter");
}

#[tokio::test]
async fn missing_parameter_yields_a_json_error() {
    let (http, _app) = start_server().await;

    // No message/unique: the extractor itself rejects, and the body must
    // still be the machine-readable error payload.
    let query = auth_query("general", "alice");
    let (status, body) = get(http, "say", &query).await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_parameter");
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn banned_user_cannot_say() {
    let (http, _app) = start_server().await;

    let mut query = auth_query("court", "troll");
    query.push(("message".into(), "grr".into()));
    query.push(("unique".into(), "u1".into()));
    get(http, "say", &query).await;

    let mut query = auth_query("court", "mod1");
    query.push(("ban".into(), "troll".into()));
    query.push(("bandisplayname".into(), "troll".into()));
    query.push(("banextra".into(), String::new()));
    query.push(("until".into(), (now_ms() + 60_000).to_string()));
    query.push(("unique".into(), "b1".into()));
    let (status, _) = get(http, "ban", &query).await;
    assert!(status.is_success());

    let mut query = auth_query("court", "troll");
    query.push(("message".into(), "let me in".into()));
    query.push(("unique".into(), "u2".into()));
    let (status, body) = get(http, "say", &query).await;
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "banned");
}

#[tokio::test]
async fn wait_resolves_when_someone_speaks() {
    let (http, _app) = start_server().await;

    // Establish the channel and a cursor.
    let mut query = auth_query("meetup", "alice");
    query.push(("message".into(), "opening".into()));
    query.push(("unique".into(), "u1".into()));
    get(http, "say", &query).await;

    let mut query = auth_query("meetup", "bob");
    query.push(("lasttime".into(), "0".into()));
    let (_, body) = get(http, "poll", &query).await;
    let cursor = body["lastTime"].as_i64().unwrap();

    let mut wait_query = auth_query("meetup", "bob");
    wait_query.push(("id".into(), "req42".into()));
    wait_query.push(("lasttime".into(), cursor.to_string()));
    let waiter = tokio::spawn(async move { get(http, "wait", &wait_query).await });

    // Give the wait time to park, then speak.
    sleep(Duration::from_millis(200)).await;
    let mut query = auth_query("meetup", "alice");
    query.push(("message".into(), "bob, you there?".into()));
    query.push(("unique".into(), "u2".into()));
    get(http, "say", &query).await;

    let (status, body) = waiter.await.unwrap();
    assert!(status.is_success());
    assert_eq!(body["id"], "req42");
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], "bob, you there?");
    assert!(body["lastTime"].as_i64().unwrap() > cursor);
}

#[tokio::test]
async fn names_lists_present_users() {
    let (http, _app) = start_server().await;

    for user in ["alice", "bob"] {
        let mut query = auth_query("roster", user);
        query.push(("message".into(), format!("hi from {user}")));
        query.push(("unique".into(), "u1".into()));
        get(http, "say", &query).await;
    }

    let mut query = auth_query("roster", SYSTEM_USER);
    let (status, body) = {
        query.push(("maxnumber".into(), "10".into()));
        get(http, "names", &query).await
    };
    assert!(status.is_success());
    let names: Vec<&str> = body["names"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["user"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["bob", "alice"]);
}

#[tokio::test]
async fn leave_removes_presence() {
    let (http, _app) = start_server().await;

    let mut query = auth_query("foyer", "alice");
    query.push(("message".into(), "in and out".into()));
    query.push(("unique".into(), "u1".into()));
    get(http, "say", &query).await;

    let query = auth_query("foyer", "alice");
    let (status, _) = get(http, "leave", &query).await;
    assert!(status.is_success());

    let query = auth_query("foyer", SYSTEM_USER);
    let (_, body) = get(http, "names", &query).await;
    assert!(body["names"].as_array().unwrap().is_empty());
}

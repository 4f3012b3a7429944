use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotguard::engine::Engine;
use slotguard::notify::NotifyHub;
use slotguard::server::Server;
use slotguard::store::LocalStore;

// ── Test infrastructure ──────────────────────────────────────

type Client = Framed<TcpStream, LinesCodec>;

const DATE: &str = "2030-05-06";

async fn start_test_server(token: Option<&str>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotguard_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(LocalStore::open(&dir.join("ledger.wal")).unwrap());
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(store, hub.clone()));
    let server = Arc::new(Server::new(engine, hub, token.map(String::from)));

    tokio::spawn(server.run(listener, 16, std::future::pending()));
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let socket = TcpStream::connect(addr).await.unwrap();
    Framed::new(socket, LinesCodec::new())
}

async fn recv(client: &mut Client) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for a reply")
        .expect("connection closed")
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn call(client: &mut Client, request: Value) -> Value {
    client.send(request.to_string()).await.unwrap();
    recv(client).await
}

fn error_code(reply: &Value) -> &str {
    assert_eq!(reply["ok"], false, "expected an error, got {reply}");
    reply["error"]["code"].as_str().unwrap()
}

fn result(reply: Value) -> Value {
    assert_eq!(reply["ok"], true, "expected success, got {reply}");
    reply["result"].clone()
}

async fn register_court(client: &mut Client) -> String {
    let id = Ulid::new().to_string();
    let reply = call(
        client,
        json!({
            "op": "register_court",
            "court": {
                "id": id,
                "facility_id": Ulid::new().to_string(),
                "owner_id": "owner",
                "name": "Center Court",
                "hours": { "open": "06:00", "close": "22:00" },
                "price_per_hour": 2000,
            }
        }),
    )
    .await;
    assert_eq!(result(reply)["court_id"], id.as_str());
    id
}

fn reservation(court: &str, start: &str, end: &str, requester: &str) -> Value {
    json!({
        "op": "create_reservation",
        "court_id": court,
        "date": DATE,
        "start": start,
        "end": end,
        "requester_id": requester,
    })
}

// ── Reservations ─────────────────────────────────────────────

#[tokio::test]
async fn reserve_then_conflict() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let court = register_court(&mut client).await;

    let booking = result(call(&mut client, reservation(&court, "09:00", "10:00", "alice")).await);
    assert_eq!(booking["status"], "confirmed");
    assert_eq!(booking["price"], 2000);
    assert_eq!(booking["span"]["start"], "09:00");

    let reply = call(&mut client, reservation(&court, "09:30", "10:30", "bob")).await;
    assert_eq!(error_code(&reply), "conflict");
    assert_eq!(reply["error"]["retryable"], false);

    // Touching endpoints do not overlap.
    let adjacent = result(call(&mut client, reservation(&court, "10:00", "11:00", "bob")).await);
    assert_eq!(adjacent["status"], "confirmed");
}

#[tokio::test]
async fn validation_and_not_found_codes() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let court = register_court(&mut client).await;

    let outside = call(&mut client, reservation(&court, "05:00", "07:00", "alice")).await;
    assert_eq!(error_code(&outside), "validation");

    let inverted = call(&mut client, reservation(&court, "11:00", "10:00", "alice")).await;
    assert_eq!(error_code(&inverted), "validation");

    let unknown = Ulid::new().to_string();
    let missing = call(&mut client, reservation(&unknown, "09:00", "10:00", "alice")).await;
    assert_eq!(error_code(&missing), "not_found");
}

#[tokio::test]
async fn cancel_is_idempotent_and_frees_the_slot() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let court = register_court(&mut client).await;

    let booking = result(call(&mut client, reservation(&court, "18:00", "19:00", "alice")).await);
    let id = booking["id"].as_str().unwrap().to_string();

    let stranger = call(
        &mut client,
        json!({ "op": "cancel_reservation", "booking_id": id, "requester_id": "mallory" }),
    )
    .await;
    assert_eq!(error_code(&stranger), "unauthorized");

    let first = result(
        call(
            &mut client,
            json!({ "op": "cancel_reservation", "booking_id": id, "requester_id": "alice" }),
        )
        .await,
    );
    assert_eq!(first["already_cancelled"], false);
    assert_eq!(first["booking"]["status"], "cancelled");

    let second = result(
        call(
            &mut client,
            json!({ "op": "cancel_reservation", "booking_id": id, "requester_id": "alice" }),
        )
        .await,
    );
    assert_eq!(second["already_cancelled"], true);

    let rebooked = result(call(&mut client, reservation(&court, "18:00", "19:00", "bob")).await);
    assert_eq!(rebooked["requester_id"], "bob");
}

#[tokio::test]
async fn hold_then_confirm() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let court = register_court(&mut client).await;

    let mut hold = reservation(&court, "12:00", "13:00", "alice");
    hold["op"] = json!("hold_reservation");
    hold["ttl_secs"] = json!(120);
    let held = result(call(&mut client, hold).await);
    assert_eq!(held["status"], "pending");
    assert!(held["expires_at"].is_string());

    let id = held["id"].as_str().unwrap();
    let confirmed = result(call(&mut client, json!({ "op": "confirm_reservation", "booking_id": id })).await);
    assert_eq!(confirmed["status"], "confirmed");
    assert!(confirmed["expires_at"].is_null());

    let again = call(&mut client, json!({ "op": "confirm_reservation", "booking_id": id })).await;
    assert_eq!(error_code(&again), "invalid_transition");
}

// ── Availability and listings ────────────────────────────────

#[tokio::test]
async fn availability_reflects_bookings_and_blocks() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let court = register_court(&mut client).await;

    result(call(&mut client, reservation(&court, "09:00", "10:00", "alice")).await);
    let block = result(
        call(
            &mut client,
            json!({
                "op": "block_window",
                "court_id": court,
                "date": DATE,
                "start": "12:00",
                "end": "14:00",
                "reason": "resurfacing",
                "requester_id": "owner",
            }),
        )
        .await,
    );
    assert_eq!(block["reason"], "resurfacing");

    let free = result(
        call(&mut client, json!({ "op": "get_availability", "court_id": court, "date": DATE })).await,
    );
    assert_eq!(
        free["free"],
        json!([
            { "start": "06:00", "end": "09:00" },
            { "start": "10:00", "end": "12:00" },
            { "start": "14:00", "end": "22:00" },
        ])
    );

    let slots = result(
        call(
            &mut client,
            json!({ "op": "get_availability", "court_id": court, "date": DATE, "granularity_minutes": 120 }),
        )
        .await,
    );
    let starts: Vec<&str> = slots["slots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["span"]["start"].as_str().unwrap())
        .collect();
    assert_eq!(starts, ["06:00", "10:00", "14:00", "16:00", "18:00", "20:00"]);
    assert_eq!(slots["slots"][0]["price"], 4000);

    let blocked = call(&mut client, reservation(&court, "13:00", "13:30", "bob")).await;
    assert_eq!(error_code(&blocked), "conflict");

    let not_owner = call(
        &mut client,
        json!({ "op": "unblock_window", "block_id": block["id"], "requester_id": "alice" }),
    )
    .await;
    assert_eq!(error_code(&not_owner), "unauthorized");

    let removed = result(
        call(
            &mut client,
            json!({ "op": "unblock_window", "block_id": block["id"], "requester_id": "owner" }),
        )
        .await,
    );
    assert_eq!(removed["removed"]["id"], block["id"]);
    result(call(&mut client, reservation(&court, "13:00", "13:30", "bob")).await);
}

#[tokio::test]
async fn list_bookings_by_requester_and_by_date() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let court = register_court(&mut client).await;

    result(call(&mut client, reservation(&court, "15:00", "16:00", "alice")).await);
    result(call(&mut client, reservation(&court, "08:00", "09:00", "bob")).await);
    result(call(&mut client, reservation(&court, "10:00", "11:00", "alice")).await);

    let mine = result(call(&mut client, json!({ "op": "list_bookings", "requester_id": "alice" })).await);
    assert_eq!(mine.as_array().unwrap().len(), 2);

    let day = result(
        call(&mut client, json!({ "op": "list_bookings", "court_id": court, "date": DATE })).await,
    );
    let starts: Vec<&str> = day
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["span"]["start"].as_str().unwrap())
        .collect();
    assert_eq!(starts, ["08:00", "10:00", "15:00"]);

    let ambiguous = call(&mut client, json!({ "op": "list_bookings", "court_id": court })).await;
    assert_eq!(error_code(&ambiguous), "bad_request");
}

// ── Protocol ─────────────────────────────────────────────────

#[tokio::test]
async fn malformed_lines_keep_the_connection_open() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;

    client.send("this is not json".to_string()).await.unwrap();
    assert_eq!(error_code(&recv(&mut client).await), "bad_request");

    let unknown = call(&mut client, json!({ "op": "drop_everything" })).await;
    assert_eq!(error_code(&unknown), "bad_request");

    // Still usable afterwards.
    register_court(&mut client).await;
}

#[tokio::test]
async fn token_gates_requests_until_hello() {
    let addr = start_test_server(Some("s3cret")).await;
    let mut client = connect(addr).await;

    let early = call(&mut client, json!({ "op": "list_bookings", "requester_id": "alice" })).await;
    assert_eq!(error_code(&early), "unauthorized");

    let wrong = call(&mut client, json!({ "op": "hello", "token": "guess" })).await;
    assert_eq!(error_code(&wrong), "unauthorized");

    let hello = result(call(&mut client, json!({ "op": "hello", "token": "s3cret" })).await);
    assert_eq!(hello["authenticated"], true);

    let listed = result(call(&mut client, json!({ "op": "list_bookings", "requester_id": "alice" })).await);
    assert_eq!(listed, json!([]));
}

// ── Subscriptions ────────────────────────────────────────────

#[tokio::test]
async fn subscriber_sees_booked_and_cancelled_in_order() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let court = register_court(&mut client).await;

    let mut listener = connect(addr).await;
    let ack = result(call(&mut listener, json!({ "op": "subscribe", "court_id": court })).await);
    assert_eq!(ack["court_id"], court.as_str());

    let booking = result(call(&mut client, reservation(&court, "07:00", "08:00", "alice")).await);
    let id = booking["id"].as_str().unwrap();
    result(
        call(
            &mut client,
            json!({ "op": "cancel_reservation", "booking_id": id, "requester_id": "alice" }),
        )
        .await,
    );

    let booked = recv(&mut listener).await;
    assert_eq!(booked["event"]["kind"], "slot.booked");
    assert_eq!(booked["event"]["booking_id"], id);
    assert_eq!(booked["event"]["date"], DATE);

    let cancelled = recv(&mut listener).await;
    assert_eq!(cancelled["event"]["kind"], "slot.cancelled");
    assert!(cancelled["event"]["seq"].as_u64().unwrap() > booked["event"]["seq"].as_u64().unwrap());
}

#[tokio::test]
async fn subscribe_to_unknown_court_fails() {
    let addr = start_test_server(None).await;
    let mut client = connect(addr).await;
    let reply = call(&mut client, json!({ "op": "subscribe", "court_id": Ulid::new().to_string() })).await;
    assert_eq!(error_code(&reply), "not_found");
}

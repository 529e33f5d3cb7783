use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{NaiveTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tempo_api::{app, AppState};
use tempo_booking::{
    BookingCommitWorker, BroadcastHub, PayoutDispatcher, ReservationStore, SessionLifecycleMonitor,
};
use tempo_core::{ManualClock, Room, SlotTemplate};
use tempo_shared::Masked;
use tempo_store::app_config::BusinessRules;
use tempo_store::{InMemoryChannel, InMemoryStore, MockPayoutProvider};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    router: Router,
    store: InMemoryStore,
    hub: Arc<BroadcastHub>,
    provider: MockPayoutProvider,
    room_id: Uuid,
}

async fn setup() -> TestApp {
    let rules = BusinessRules::default();
    let clock = Arc::new(ManualClock::new(
        chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(2025, 3, 1, 8, 0, 0)
            .unwrap()
            .with_timezone(&Utc),
    ));
    let store = InMemoryStore::new();
    let provider = MockPayoutProvider::new();
    let hub = Arc::new(BroadcastHub::new(16));

    let room_id = Uuid::new_v4();
    store
        .insert_room(Room {
            id: room_id,
            name: "Studio 4".to_string(),
            owner_name: "Asha Rao".to_string(),
            payout_destination: Some(Masked("owner.studio@okbank".to_string())),
            slots: vec![
                SlotTemplate {
                    slot_id: 1,
                    start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                },
                SlotTemplate {
                    slot_id: 2,
                    start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
                },
            ],
        })
        .await;

    let reservations = Arc::new(ReservationStore::new(
        Arc::new(store.clone()),
        Arc::new(InMemoryChannel::new()),
        hub.clone(),
        clock.clone(),
        &rules,
    ));
    let commit_worker = Arc::new(BookingCommitWorker::new(
        reservations.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(provider.clone()),
        hub.clone(),
        clock,
    ));

    let state = AppState {
        reservations,
        commit_worker,
        bookings: Arc::new(store.clone()),
        payouts: Arc::new(store.clone()),
        hub: hub.clone(),
        commit_queue: None,
    };

    TestApp {
        router: app(state),
        store,
        hub,
        provider,
        room_id,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(b) => Body::from(b.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn hold_body(room_id: Uuid, holder: &str, slots: &[u32]) -> Value {
    json!({ "room_id": room_id, "date": "2025-03-01", "slot_ids": slots, "holder_id": holder })
}

fn commit_body(room_id: Uuid, user: &str, payment_id: &str) -> Value {
    json!({
        "user_id": user,
        "room_id": room_id,
        "date": "2025-03-01",
        "slots": [{ "slot_id": 1, "start_time": "09:00", "end_time": "10:00" }],
        "amount": 50000,
        "payment_id": payment_id,
    })
}

#[tokio::test]
async fn test_hold_conflict_returns_409_with_slots() {
    let t = setup().await;
    let mut events = t.hub.subscribe();

    let (status, body) = send(&t.router, "POST", "/v1/holds", Some(hold_body(t.room_id, "user-a", &[1, 2]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["slot_ids"], json!([1, 2]));
    assert!(body["expires_at"].is_string());

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind(), "reservation_updated");

    let (status, body) = send(&t.router, "POST", "/v1/holds", Some(hold_body(t.room_id, "user-b", &[2]))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["slots"], json!([2]));
}

#[tokio::test]
async fn test_query_holds_shows_holder() {
    let t = setup().await;
    send(&t.router, "POST", "/v1/holds", Some(hold_body(t.room_id, "user-a", &[1]))).await;

    let uri = format!("/v1/rooms/{}/holds?date=2025-03-01", t.room_id);
    let (status, body) = send(&t.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let slots = body["slots"].as_array().unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["reserved_by"], "user-a");
    assert_eq!(slots[0]["start_time"], "09:00");
    assert_eq!(slots[1]["reserved_by"], Value::Null);
}

#[tokio::test]
async fn test_release_and_extend() {
    let t = setup().await;
    send(&t.router, "POST", "/v1/holds", Some(hold_body(t.room_id, "user-a", &[1]))).await;

    let mut extend = hold_body(t.room_id, "user-b", &[1]);
    extend["minutes"] = json!(5);
    let (status, _) = send(&t.router, "POST", "/v1/holds/extend", Some(extend.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    extend["holder_id"] = json!("user-a");
    extend["minutes"] = json!(0);
    let (status, body) = send(&t.router, "POST", "/v1/holds/extend", Some(extend.clone())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    extend["minutes"] = json!(10);
    let (status, _) = send(&t.router, "POST", "/v1/holds/extend", Some(extend)).await;
    assert_eq!(status, StatusCode::OK);

    let release = json!({ "room_id": t.room_id, "date": "2025-03-01", "slot_ids": [1] });
    let (status, body) = send(&t.router, "POST", "/v1/holds/release", Some(release.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], json!([1]));

    let (_, body) = send(&t.router, "POST", "/v1/holds/release", Some(release)).await;
    assert_eq!(body["released"], json!([]));
}

#[tokio::test]
async fn test_unknown_room_is_404() {
    let t = setup().await;
    let (status, _) = send(&t.router, "POST", "/v1/holds", Some(hold_body(Uuid::new_v4(), "user-a", &[1]))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_commit_then_read_booking() {
    let t = setup().await;
    send(&t.router, "POST", "/v1/holds", Some(hold_body(t.room_id, "user-a", &[1]))).await;

    let (status, booking) = send(
        &t.router,
        "POST",
        "/v1/bookings/commit",
        Some(commit_body(t.room_id, "user-a", "pay_1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(booking["status"], "NOT_STARTED");

    let uri = format!("/v1/bookings/{}", booking["id"].as_str().unwrap());
    let (status, fetched) = send(&t.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["payment_id"], "pay_1");

    let (status, _) = send(&t.router, "GET", &format!("/v1/bookings/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_commit_without_hold_is_refunded_conflict() {
    let t = setup().await;

    let (status, body) = send(
        &t.router,
        "POST",
        "/v1/bookings/commit",
        Some(commit_body(t.room_id, "user-a", "pay_2")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["slots"], json!([1]));
    assert_eq!(body["refunded"], true);
    assert_eq!(t.provider.refunds(), vec![("pay_2".to_string(), 50000)]);
}

#[tokio::test]
async fn test_queue_endpoint_requires_kafka() {
    let t = setup().await;
    let (status, _) = send(
        &t.router,
        "POST",
        "/v1/bookings/commit/queue",
        Some(commit_body(t.room_id, "user-a", "pay_3")),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_payout_endpoints_mask_destination() {
    let t = setup().await;
    send(&t.router, "POST", "/v1/holds", Some(hold_body(t.room_id, "user-a", &[1]))).await;
    send(
        &t.router,
        "POST",
        "/v1/bookings/commit",
        Some(commit_body(t.room_id, "user-a", "pay_4")),
    )
    .await;

    let dispatcher = Arc::new(PayoutDispatcher::new(
        Arc::new(t.store.clone()),
        Arc::new(t.store.clone()),
        Arc::new(t.store.clone()),
        Arc::new(t.provider.clone()),
        t.hub.clone(),
        &BusinessRules::default(),
    ));
    let lifecycle = SessionLifecycleMonitor::new(Arc::new(t.store.clone()), dispatcher, t.hub.clone(), chrono_tz::Asia::Kolkata);
    let after_session = chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2025, 3, 1, 10, 30, 0)
        .unwrap()
        .with_timezone(&Utc);
    lifecycle.tick(after_session).await.unwrap();

    let (status, body) = send(&t.router, "GET", &format!("/v1/rooms/{}/payouts", t.room_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let payouts = body.as_array().unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0]["destination"], "****bank");
    assert_eq!(payouts[0]["amount"], 50000);

    let uri = format!("/v1/payouts/{}", payouts[0]["id"].as_str().unwrap());
    let (status, payout) = send(&t.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payout["status"], "PROCESSING");

    let (status, _) = send(&t.router, "GET", &format!("/v1/payouts/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

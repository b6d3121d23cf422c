//! Cross-layer tests: hub scenarios over the real engine components, relay
//! behaviour between two hubs sharing a broker, the HTTP endpoints through the
//! router, and one end-to-end run over real sockets.
//!
//! Everything uses the in-memory broker and ban store so tests are isolated.

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::{Sink, SinkExt, StreamExt, sink};
    use tokio_tungstenite::tungstenite;
    use tower::ServiceExt;

    use crate::auth::identity::Role;
    use crate::auth::token::create_session_token;
    use crate::config::ServerConfig;
    use crate::engine::bans::InMemoryBanStore;
    use crate::engine::broadcaster::BroadcastError;
    use crate::engine::connection::{Connection, Outlet};
    use crate::engine::events::{BroadcastMessage, CloseReason, Frame};
    use crate::engine::hub::{AdmissionError, ChatHub, HubSettings};
    use crate::engine::relay::InMemoryBroker;
    use crate::engine::write_pump::{PumpExit, run_write_pump};
    use crate::web::app_state::AppState;
    use crate::web::router::build_router;

    // ── Helpers ──────────────────────────────────────────────────

    fn hub_with(settings: HubSettings, broker: Arc<InMemoryBroker>) -> Arc<ChatHub> {
        Arc::new(ChatHub::new(
            settings,
            broker,
            Arc::new(InMemoryBanStore::new()),
        ))
    }

    fn setup_hub() -> Arc<ChatHub> {
        hub_with(HubSettings::default(), Arc::new(InMemoryBroker::new()))
    }

    /// Drain all pending messages from an outlet.
    fn drain(outlet: &mut Outlet) -> Vec<BroadcastMessage> {
        let mut out = Vec::new();
        while let Ok(p) = outlet.outbound.try_recv() {
            out.push(BroadcastMessage::from_payload(&p).unwrap());
        }
        out
    }

    async fn next_message(outlet: &mut Outlet) -> BroadcastMessage {
        let payload = tokio::time::timeout(Duration::from_secs(2), outlet.outbound.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("outbound queue closed");
        BroadcastMessage::from_payload(&payload).unwrap()
    }

    type FrameLog = Arc<Mutex<Vec<Frame>>>;

    fn recording_sink() -> (impl Sink<Frame, Error = Infallible>, FrameLog) {
        let log: FrameLog = Arc::new(Mutex::new(Vec::new()));
        let sink = sink::unfold(log.clone(), |log, frame: Frame| async move {
            log.lock().unwrap().push(frame);
            Ok::<_, Infallible>(log)
        });
        (sink, log)
    }

    /// Run the write pump to completion and apply the disconnect path, the way
    /// the socket handler does.
    async fn pump_until_closed(hub: &ChatHub, conn: Arc<Connection>, outlet: Outlet) -> PumpExit {
        let (sink, _log) = recording_sink();
        let exit = run_write_pump(sink, outlet).await;
        hub.leave(&conn);
        exit
    }

    // ── Example scenarios ────────────────────────────────────────

    #[tokio::test]
    async fn test_message_reaches_other_occupant_with_sender_nickname() {
        let hub = setup_hub();
        let (a, mut oa) = hub.join("42", "session-a", None, "Brave Neo [0000aaaa]").await.unwrap();
        let (_b, mut ob) = hub.join("42", "session-b", None, "Calm Muzi [0000bbbb]").await.unwrap();
        drain(&mut oa);
        drain(&mut ob);

        hub.send(&a, "hello").await.unwrap();

        let got = drain(&mut ob);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message, "hello");
        assert_eq!(got[0].user_nickname, "Brave Neo [0000aaaa]");
        assert_eq!(got[0].user_id, "session-a");
        assert_eq!(got[0].room_id, "42");
    }

    #[tokio::test]
    async fn test_duplicate_session_is_rejected_and_first_stays() {
        let hub = setup_hub();
        let (first, _o1) = hub.join("42", "session-a", None, "A").await.unwrap();

        let err = hub.join("42", "session-a", None, "A").await.unwrap_err();
        assert!(matches!(err, AdmissionError::Duplicate(_)));

        assert_eq!(hub.occupancy("42"), 1);
        let current = hub.registry().get("42", "session-a").unwrap();
        assert!(Arc::ptr_eq(&current, &first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_kicks_then_blocks_until_expiry() {
        let hub = setup_hub();
        let (a, oa) = hub.join("42", "A", None, "Alice").await.unwrap();
        let (_b, mut ob) = hub.join("42", "B", None, "Bob").await.unwrap();
        drain(&mut ob);

        let outcome = hub.ban("42", "A", Duration::from_secs(5 * 60)).await.unwrap();
        assert_eq!(outcome.kicked, 1);

        // The kicked connection's pump closes with "kicked" and the normal
        // removal path announces the leave.
        let exit = pump_until_closed(&hub, a, oa).await;
        assert_eq!(exit, PumpExit::Teardown(CloseReason::Kicked));
        assert_eq!(hub.occupancy("42"), 1);
        let seen: Vec<String> = drain(&mut ob).into_iter().map(|m| m.message).collect();
        assert_eq!(seen, vec!["Alice left the room.", "42 (1 connected)"]);

        match hub.check_admission("42", &["A"]).await {
            Err(AdmissionError::Banned { remaining, .. }) => {
                let remaining = remaining.expect("ban has a ttl");
                assert!(remaining > Duration::ZERO);
                assert!(remaining <= Duration::from_secs(300));
            }
            other => panic!("expected ban rejection, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(hub.check_admission("42", &["A"]).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        hub.check_admission("42", &["A"]).await.unwrap();
        hub.join("42", "A", None, "Alice").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_updates_activity_without_broadcast() {
        let hub = setup_hub();
        let (a, mut oa) = hub.join("42", "a", None, "A").await.unwrap();
        let (_b, mut ob) = hub.join("42", "b", None, "B").await.unwrap();
        drain(&mut oa);
        drain(&mut ob);

        let before = a.last_seen();
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        hub.ping(&a);

        assert_eq!(a.last_seen(), before + Duration::from_secs(5 * 60));
        assert!(drain(&mut ob).is_empty());
        assert!(drain(&mut oa).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_reaped_and_others_see_leave() {
        let hub = setup_hub();
        let (idle, oi) = hub.join("42", "idle", None, "Sleepy").await.unwrap();
        let (active, mut oa) = hub.join("42", "active", None, "Awake").await.unwrap();
        drain(&mut oa);

        // No frames from either client for eleven minutes, then one from "active".
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        hub.ping(&active);
        tokio::time::advance(Duration::from_secs(60)).await;

        let report = hub.reaper().sweep();
        assert_eq!(report.signalled, 1);
        assert_eq!(report.fresh, 1);
        // The sweep itself leaves the registry alone.
        assert_eq!(hub.occupancy("42"), 2);

        let exit = pump_until_closed(&hub, idle, oi).await;
        assert_eq!(exit, PumpExit::Teardown(CloseReason::Idle));

        let seen: Vec<String> = drain(&mut oa).into_iter().map(|m| m.message).collect();
        assert_eq!(seen, vec!["Sleepy left the room.", "42 (1 connected)"]);
        assert_eq!(hub.occupancy("42"), 1);
    }

    // ── Registry / presence properties ───────────────────────────

    #[tokio::test]
    async fn test_room_disappears_with_last_occupant() {
        let hub = setup_hub();
        let (a, oa) = hub.join("42", "a", None, "A").await.unwrap();
        assert!(hub.registry().contains_room("42"));

        drop(oa);
        assert!(hub.leave(&a));
        assert!(!hub.registry().contains_room("42"));
        assert_eq!(hub.occupancy("42"), 0);
        assert!(!hub.relay().is_subscribed("42"));
    }

    #[tokio::test]
    async fn test_stale_cleanup_does_not_evict_reconnect() {
        let hub = setup_hub();
        let (old, _o1) = hub.join("42", "a", None, "A").await.unwrap();
        hub.leave(&old);
        let (_new, _o2) = hub.join("42", "a", None, "A").await.unwrap();

        // The old socket's handler runs its cleanup late.
        assert!(!hub.leave(&old));
        assert_eq!(hub.occupancy("42"), 1);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_hold_up_other_recipients() {
        let settings = HubSettings {
            queue_capacity: 4,
            ..HubSettings::default()
        };
        let hub = hub_with(settings, Arc::new(InMemoryBroker::new()));

        // Never drained: join + count, then the fast client's join + count fill it.
        let (_slow, mut slow_outlet) = hub.join("42", "slow", None, "Slow").await.unwrap();
        let (fast, mut fast_outlet) = hub.join("42", "fast", None, "Fast").await.unwrap();
        drain(&mut fast_outlet);

        let err = hub.send(&fast, "go").await.unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::Backpressure {
                dropped: 1,
                attempted: 2,
                ..
            }
        ));

        let fast_seen = drain(&mut fast_outlet);
        assert_eq!(fast_seen.len(), 1);
        assert_eq!(fast_seen[0].message, "go");
        assert_eq!(drain(&mut slow_outlet).len(), 4);
    }

    // ── Distributed relay ────────────────────────────────────────

    #[tokio::test]
    async fn test_relay_delivers_across_hubs_exactly_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let hub1 = hub_with(HubSettings::default(), broker.clone());
        let hub2 = hub_with(HubSettings::default(), broker);

        let (a, mut oa) = hub1.join("42", "a", None, "Alice").await.unwrap();
        let (b, mut ob) = hub2.join("42", "b", None, "Bob").await.unwrap();
        drain(&mut oa);
        drain(&mut ob);

        let sent = hub1.send(&a, "hi from one").await.unwrap();

        let got = next_message(&mut ob).await;
        assert_eq!(got.uid, sent.message.uid);
        assert_eq!(got.user_nickname, "Alice");

        // Alice got her own message locally; the copy that came back through the
        // broker must not arrive a second time. Bob's reply marks the end.
        let reply = hub2.send(&b, "hi from two").await.unwrap();
        let first = next_message(&mut oa).await;
        assert_eq!(first.uid, sent.message.uid);
        let second = next_message(&mut oa).await;
        assert_eq!(second.uid, reply.message.uid);
        assert!(drain(&mut oa).is_empty());
    }

    #[tokio::test]
    async fn test_presence_stays_local_to_instance() {
        let broker = Arc::new(InMemoryBroker::new());
        let hub1 = hub_with(HubSettings::default(), broker.clone());
        let hub2 = hub_with(HubSettings::default(), broker);

        let (_a, mut oa) = hub1.join("42", "a", None, "Alice").await.unwrap();
        drain(&mut oa);
        let (b, _ob) = hub2.join("42", "b", None, "Bob").await.unwrap();

        // A chat message forces a round trip, so any relayed presence would
        // have arrived before it.
        let marker = hub2.send(&b, "marker").await.unwrap();
        let got = next_message(&mut oa).await;
        assert_eq!(got.uid, marker.message.uid);
    }

    #[tokio::test]
    async fn test_emptied_rooms_leave_nothing_behind() {
        let broker = Arc::new(InMemoryBroker::new());
        let hub = hub_with(HubSettings::default(), broker.clone());

        for room in 0..200 {
            let room_id = format!("marker-{room}");
            let (conn, _outlet) = hub.join(&room_id, "a", None, "A").await.unwrap();
            hub.send(&conn, "hi").await.unwrap();
            assert!(hub.leave(&conn));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.channel_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("broker channels outlived their rooms");
        assert_eq!(hub.registry().room_count(), 0);
        assert_eq!(hub.relay().subscription_count(), 0);
    }

    // ── HTTP endpoints ───────────────────────────────────────────

    fn setup_state() -> Arc<AppState> {
        Arc::new(AppState::new(setup_hub(), ServerConfig::default()).unwrap())
    }

    fn token(state: &AppState, user: &str, role: Role) -> String {
        create_session_token(user, role, &state.config.auth.jwt_secret, 1).unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn ban_request(auth: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/chat/ban/42/victim")
            .header("content-type", "application/json");
        if let Some(token) = auth {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(setup_state());
        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_occupancy_endpoint_counts_local_connections() {
        let state = setup_state();
        let _a = state.hub.join("42", "a", None, "A").await.unwrap();
        let _b = state.hub.join("42", "b", None, "B").await.unwrap();

        let resp = build_router(state)
            .oneshot(Request::get("/api/chat/rooms/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["room"], "42");
        assert_eq!(body["connected"], 2);
    }

    #[tokio::test]
    async fn test_ban_endpoint_requires_admin() {
        let state = setup_state();
        let user = token(&state, "u1", Role::User);

        let resp = build_router(state.clone())
            .oneshot(ban_request(None, "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = build_router(state.clone())
            .oneshot(ban_request(Some("garbage"), "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = build_router(state.clone())
            .oneshot(ban_request(Some(&user), "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        state.hub.check_admission("42", &["victim"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_ban_endpoint_clamps_and_kicks() {
        let state = setup_state();
        let admin = token(&state, "mod", Role::Admin);
        let (victim, _ov) = state.hub.join("42", "victim", None, "V").await.unwrap();

        let resp = build_router(state.clone())
            .oneshot(ban_request(Some(&admin), r#"{"duration": 600}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["message"], "User successfully banned");
        assert_eq!(body["minutes"], 15);

        assert!(victim.is_closed());
        match state.hub.check_admission("42", &["victim"]).await {
            Err(AdmissionError::Banned { remaining, .. }) => {
                assert!(remaining.unwrap() <= Duration::from_secs(15 * 60));
            }
            other => panic!("expected ban rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ban_endpoint_defaults_and_rejects_bad_body() {
        let state = setup_state();
        let admin = token(&state, "mod", Role::Admin);

        let resp = build_router(state.clone())
            .oneshot(ban_request(Some(&admin), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["minutes"], 5);

        // Below the minimum falls back to the default rather than the floor.
        let resp = build_router(state.clone())
            .oneshot(ban_request(Some(&admin), r#"{"duration": 0}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["minutes"], 5);

        let resp = build_router(state)
            .oneshot(ban_request(Some(&admin), "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // ── End to end over real sockets ─────────────────────────────

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn connect(
        addr: SocketAddr,
        room: &str,
        id: &str,
    ) -> Result<Client, tungstenite::Error> {
        let url = format!("ws://{addr}/ws/{room}?request-id={id}");
        tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
    }

    /// Read frames until a text frame satisfies `pred`.
    async fn wait_for<F>(ws: &mut Client, pred: F) -> serde_json::Value
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        let read = async {
            loop {
                match ws.next().await {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                        if pred(&value) {
                            return value;
                        }
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended early: {other:?}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("timed out waiting for frame")
    }

    /// Read until the server's close frame and return its reason.
    async fn wait_for_close(ws: &mut Client) -> Option<String> {
        let read = async {
            loop {
                match ws.next().await {
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        return frame.map(|f| f.reason.as_str().to_string());
                    }
                    Some(Ok(_)) => continue,
                    _ => return None,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("timed out waiting for close")
    }

    #[tokio::test]
    async fn test_end_to_end_chat_duplicate_kick_and_ban() {
        let state = setup_state();
        let addr = spawn_server(state.clone()).await;

        let mut a = connect(addr, "42", "a").await.unwrap();
        let joined = wait_for(&mut a, |v| {
            v["message"].as_str().is_some_and(|m| m.ends_with("joined the room."))
        })
        .await;
        let a_nick = joined["userNickname"].as_str().unwrap().to_string();
        assert_eq!(joined["userId"], "a");
        assert_eq!(joined["roomID"], "42");

        let mut b = connect(addr, "42", "b").await.unwrap();
        wait_for(&mut a, |v| v["message"] == "42 (2 connected)").await;
        wait_for(&mut b, |v| v["message"] == "42 (2 connected)").await;

        // Pings are swallowed; links are stripped before broadcast, spacing kept.
        a.send(tungstenite::Message::text(r#"{"type":"ping"}"#))
            .await
            .unwrap();
        a.send(tungstenite::Message::text("hello https://spam.example world"))
            .await
            .unwrap();
        let got = wait_for(&mut b, |v| v["userId"] == "a").await;
        assert_eq!(got["message"], "hello  world");
        assert_eq!(got["userNickname"], a_nick.as_str());
        assert!(got["uid"].as_str().is_some_and(|u| !u.is_empty()));
        assert!(got["timestamp"].as_i64().unwrap() > 0);

        // Same session id again: told off and closed, never admitted.
        let mut dup = connect(addr, "42", "a").await.unwrap();
        let refusal = wait_for(&mut dup, |_| true).await;
        assert_eq!(refusal["error"], "duplicate connection");
        assert_eq!(state.hub.occupancy("42"), 2);

        // Ban b: its socket closes as kicked, a sees the leave.
        state
            .hub
            .ban("42", "b", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(wait_for_close(&mut b).await.as_deref(), Some("kicked"));
        wait_for(&mut a, |v| {
            v["message"].as_str().is_some_and(|m| m.ends_with("left the room."))
        })
        .await;
        wait_for(&mut a, |v| v["message"] == "42 (1 connected)").await;

        // Banned callers are refused before the upgrade.
        assert!(connect(addr, "42", "b").await.is_err());
        assert_eq!(state.hub.occupancy("42"), 1);
    }
}

//! End-to-end exercises of the connection layer over mock sockets:
//! authentication, request dispatch, correlated client requests, broadcast
//! fan-out, and rate limiting working together the way an acceptor would
//! wire them up.

use realtime::test_utils::MockSocket;
use realtime::{
    BreakerConfig, CircuitBreaker, Compressor, ConnectionManager, Envelope, ManagerConfig,
    RateLimitConfig, ResponseStatus, SecurityConfig, SecurityManager,
};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_authenticated_session_round_trip() {
    init_tracing();
    let security = SecurityManager::new(SecurityConfig::default());
    let token = security.issue_token("alice", vec!["user".into()]);

    let manager = ConnectionManager::new(ManagerConfig::default());
    let security = Arc::new(security);
    let auth = security.clone();
    manager.register_handler_fn("whoami", move |payload, _ctx| {
        let auth = auth.clone();
        async move {
            let token = payload["token"].as_str().unwrap_or_default();
            let info = auth.validate_token(token).map_err(|e| e.to_string())?;
            Ok(json!({ "userId": info.user_id }))
        }
    });

    let client = addr(40001);
    security.register_connection(client.ip()).unwrap();
    let socket = Arc::new(MockSocket::new());
    let id = manager.add_client(socket.clone(), client);

    let comp = Compressor::default();
    let request = Envelope::request("whoami", json!({ "token": token.token }));
    let corr = request.correlation_id();
    manager.handle_frame(id, &request.encode(&comp).unwrap()).await;

    match Envelope::decode(&socket.last_frame().unwrap(), &comp).unwrap() {
        Envelope::Response {
            correlation_id,
            status,
            payload,
            ..
        } => {
            assert_eq!(correlation_id, corr);
            assert_eq!(status, ResponseStatus::Success);
            assert_eq!(payload["userId"], "alice");
        }
        other => panic!("expected response, got {:?}", other),
    }

    manager.remove_client(id);
    security.release_connection(client.ip());
    assert_eq!(security.connection_count(client.ip()), 0);
    assert_eq!(manager.connection_count(), 0);
}

#[tokio::test]
async fn test_bad_token_yields_error_response_not_disconnect() {
    init_tracing();
    let security = Arc::new(SecurityManager::new(SecurityConfig::default()));
    let manager = ConnectionManager::new(ManagerConfig::default());
    let auth = security.clone();
    manager.register_handler_fn("whoami", move |payload, _ctx| {
        let auth = auth.clone();
        async move {
            let token = payload["token"].as_str().unwrap_or_default();
            auth.validate_token(token).map_err(|e| e.to_string())?;
            Ok(json!({}))
        }
    });

    let socket = Arc::new(MockSocket::new());
    let id = manager.add_client(socket.clone(), addr(40002));

    let comp = Compressor::default();
    let request = Envelope::request("whoami", json!({ "token": "bogus" }));
    manager.handle_frame(id, &request.encode(&comp).unwrap()).await;

    match Envelope::decode(&socket.last_frame().unwrap(), &comp).unwrap() {
        Envelope::Response { status, .. } => assert_eq!(status, ResponseStatus::Error),
        other => panic!("expected response, got {:?}", other),
    }
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn test_broadcast_after_churn_reaches_only_live_connections() {
    init_tracing();
    let manager = ConnectionManager::new(ManagerConfig::default());

    let stayed = Arc::new(MockSocket::new());
    let left = Arc::new(MockSocket::new());
    manager.add_client(stayed.clone(), addr(40003));
    let left_id = manager.add_client(left.clone(), addr(40004));
    manager.handle_close(left_id);

    let delivered = manager
        .broadcast("announcement", json!({"version": 2}))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(stayed.sent_count(), 1);
    assert_eq!(left.sent_count(), 0);

    let comp = Compressor::default();
    match Envelope::decode(&stayed.last_frame().unwrap(), &comp).unwrap() {
        Envelope::Notification { event, payload, .. } => {
            assert_eq!(event, "announcement");
            assert_eq!(payload["version"], 2);
        }
        other => panic!("expected notification, got {:?}", other),
    }
}

#[tokio::test]
async fn test_large_broadcast_is_compressed_on_the_wire() {
    init_tracing();
    let manager = ConnectionManager::new(ManagerConfig::default());
    let socket = Arc::new(MockSocket::new());
    manager.add_client(socket.clone(), addr(40005));

    let blob = "z".repeat(16 * 1024);
    manager.broadcast("bulk", json!({ "blob": blob })).await.unwrap();

    let frame = socket.last_frame().unwrap();
    assert_ne!(frame[0], b'{');

    let comp = Compressor::default();
    match Envelope::decode(&frame, &comp).unwrap() {
        Envelope::Notification { payload, .. } => {
            assert_eq!(payload["blob"].as_str().unwrap().len(), 16 * 1024);
        }
        other => panic!("expected notification, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rate_limit_recovers_after_window() {
    init_tracing();
    let mut config = ManagerConfig::default();
    config.rate_limit = RateLimitConfig {
        window: Duration::from_millis(100),
        max_requests: 2,
    };
    let manager = ConnectionManager::new(config);
    manager.register_handler_fn("ping", |_p, _c| async move { Ok(json!("pong")) });

    let socket = Arc::new(MockSocket::new());
    let id = manager.add_client(socket.clone(), addr(40006));
    let comp = Compressor::default();
    let frame = Envelope::request("ping", json!({})).encode(&comp).unwrap();

    manager.handle_frame(id, &frame).await;
    manager.handle_frame(id, &frame).await;
    manager.handle_frame(id, &frame).await;

    // Third frame in the window was rejected before parsing
    match Envelope::decode(&socket.last_frame().unwrap(), &comp).unwrap() {
        Envelope::Response {
            correlation_id,
            retry_after,
            ..
        } => {
            assert_eq!(correlation_id, Uuid::nil());
            assert!(retry_after.is_some());
        }
        other => panic!("expected response, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(120)).await;
    manager.handle_frame(id, &frame).await;
    match Envelope::decode(&socket.last_frame().unwrap(), &comp).unwrap() {
        Envelope::Response { status, payload, .. } => {
            assert_eq!(status, ResponseStatus::Success);
            assert_eq!(payload, "pong");
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_breaker_shields_handler_dependency() {
    init_tracing();
    let breaker = CircuitBreaker::new(
        "downstream",
        BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        },
    );

    let manager = ConnectionManager::new(ManagerConfig::default());
    let cb = breaker.clone();
    manager.register_handler_fn("lookup", move |_payload, _ctx| {
        let cb = cb.clone();
        async move {
            cb.execute(|| async { Err::<serde_json::Value, _>(anyhow::anyhow!("db down")) })
                .await
                .map_err(|e| e.to_string())
        }
    });

    let socket = Arc::new(MockSocket::new());
    let id = manager.add_client(socket.clone(), addr(40007));
    let comp = Compressor::default();
    let frame = Envelope::request("lookup", json!({})).encode(&comp).unwrap();

    for _ in 0..3 {
        manager.handle_frame(id, &frame).await;
    }

    // Two real failures opened the breaker; the third was short-circuited
    assert_eq!(breaker.stats().total_calls, 2);
    assert_eq!(breaker.stats().rejected_calls, 1);
    match Envelope::decode(&socket.last_frame().unwrap(), &comp).unwrap() {
        Envelope::Response { status, .. } => assert_eq!(status, ResponseStatus::Error),
        other => panic!("expected response, got {:?}", other),
    }
    breaker.stop();
}

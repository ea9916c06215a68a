use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use httpmock::prelude::*;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tradesync::account::{AccountLink, LinkStatus, NewAccountLink};
use tradesync::credentials::CredentialCipher;
use tradesync::error::SyncErrorKind;
use tradesync::ledger;
use tradesync::{SyncConfig, SyncOrchestrator, SyncOutcome};
use tradesync_gateway::{
    DealFetchConfig, DealSide, HttpGateway, LifecycleConfig, Platform, ProvisionConfig,
    RateLimitedClient, RetryPolicy, TransportConfig,
};

const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
const ACCOUNTS: &str = "/users/current/accounts";
const PROXY: &str = "/users/current/accounts/proxy-xyz";
const CLIENT_PROXY: &str = "/vint-hill/users/current/accounts/proxy-xyz";

async fn setup() -> (SqlitePool, i64) {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();

    let cipher = CredentialCipher::from_base64_key(KEY).unwrap();
    let account_id = NewAccountLink {
        owner: "alice".to_string(),
        login: "1234".to_string(),
        server: "Broker-Live".to_string(),
        platform: Platform::Mt5,
        encrypted_password: cipher.encrypt("secret").unwrap(),
    }
    .insert(&pool)
    .await
    .unwrap();

    (pool, account_id)
}

fn orchestrator(server: &MockServer, pool: &SqlitePool) -> SyncOrchestrator<HttpGateway> {
    let http = RateLimitedClient::new(
        &TransportConfig::default(),
        RetryPolicy {
            max_attempts: 2,
            default_retry_after: Duration::from_millis(10),
            server_error_backoff: Duration::from_millis(10),
        },
    )
    .unwrap();
    let gateway = HttpGateway::new(
        http,
        &server.base_url(),
        &format!("{}/{{region}}", server.base_url()),
        "test-token",
    )
    .unwrap();

    let config = SyncConfig {
        provision: ProvisionConfig {
            max_polls: 3,
            default_poll_wait: Duration::from_millis(10),
            max_poll_wait: Duration::from_millis(20),
        },
        lifecycle: LifecycleConfig {
            poll_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(300),
        },
        deals: DealFetchConfig {
            empty_history_retry_delay: Duration::from_millis(20),
            ..DealFetchConfig::default()
        },
        ..SyncConfig::default()
    };

    SyncOrchestrator::new(
        Arc::new(gateway),
        pool.clone(),
        CredentialCipher::from_base64_key(KEY).unwrap(),
        config,
    )
}

fn iso(time: chrono::DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[tokio::test]
async fn test_first_sync_against_http_gateway() {
    let server = MockServer::start();
    let (pool, account_id) = setup().await;
    let opened = Utc::now() - ChronoDuration::days(5);

    let find = server.mock(|when, then| {
        when.method(GET)
            .path(ACCOUNTS)
            .query_param("query", "1234")
            .header("auth-token", "test-token");
        then.status(200).json_body(json!([]));
    });
    let create = server.mock(|when, then| {
        when.method(POST)
            .path(ACCOUNTS)
            .header_exists("transaction-id")
            .json_body_partial(r#"{"login": "1234", "server": "Broker-Live", "platform": "mt5"}"#);
        then.status(201).json_body(json!({"id": "proxy-xyz"}));
    });
    let deploy = server.mock(|when, then| {
        when.method(POST).path(format!("{PROXY}/deploy"));
        then.status(204);
    });
    let status = server.mock(|when, then| {
        when.method(GET).path(PROXY);
        then.status(200).json_body(json!({
            "_id": "proxy-xyz",
            "login": "1234",
            "server": "Broker-Live",
            "region": "vint-hill",
            "state": "DEPLOYED",
            "connectionStatus": "CONNECTED"
        }));
    });
    let information = server.mock(|when, then| {
        when.method(GET)
            .path(format!("{CLIENT_PROXY}/account-information"));
        then.status(200).json_body(json!({
            "balance": 10_048.0,
            "equity": 10_048.0,
            "currency": "USD",
            "leverage": 500
        }));
    });
    let history = server.mock(|when, then| {
        when.method(GET)
            .path_contains(format!("{CLIENT_PROXY}/history-deals/time/"))
            .query_param("offset", "0");
        then.status(200).json_body(json!([
            {
                "id": "900",
                "type": "DEAL_TYPE_BALANCE",
                "time": iso(opened - ChronoDuration::days(1)),
                "profit": 10_000.0
            },
            {
                "id": 1001,
                "positionId": 77,
                "symbol": "EURUSD",
                "type": "DEAL_TYPE_BUY",
                "entryType": "DEAL_ENTRY_IN",
                "time": iso(opened),
                "price": 1.1,
                "volume": 0.1
            },
            {
                "id": 1002,
                "positionId": 77,
                "symbol": "EURUSD",
                "type": "DEAL_TYPE_SELL",
                "entryType": "DEAL_ENTRY_OUT",
                "time": iso(opened + ChronoDuration::minutes(90)),
                "price": 1.105,
                "volume": 0.1,
                "profit": 50.0
            }
        ]));
    });
    let undeploy = server.mock(|when, then| {
        when.method(POST).path(format!("{PROXY}/undeploy"));
        then.status(204);
    });

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = orchestrator(&server, &pool)
        .sync(account_id, "alice", shutdown_rx)
        .await;

    assert_eq!(
        outcome,
        SyncOutcome::Success {
            trades_imported: 1,
            balance: Some(10_048.0),
            equity: Some(10_048.0),
        }
    );

    find.assert();
    create.assert();
    deploy.assert();
    status.assert_hits(1);
    information.assert();
    history.assert();
    undeploy.assert();

    let trades = ledger::load_trades(&pool, account_id).await.unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.ticket, "77");
    assert_eq!(trade.pair, "EURUSD");
    assert_eq!(trade.direction, Some(DealSide::Buy));
    assert!((trade.pips - 50.0).abs() < f64::EPSILON);
    assert_eq!(trade.duration_minutes, Some(90));
    assert!(trade.is_win);
    assert!(!trade.is_open);

    let link = AccountLink::find(&pool, account_id, "alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.status, LinkStatus::Active);
    assert_eq!(link.remote_proxy_id.unwrap().0, "proxy-xyz");
    assert_eq!(link.region.unwrap().0, "vint-hill");
    assert!(link.last_sync_checkpoint.is_some());
}

#[tokio::test]
async fn test_connect_timeout_keeps_proxy_deployed() {
    let server = MockServer::start();
    let (pool, account_id) = setup().await;

    server.mock(|when, then| {
        when.method(GET).path(ACCOUNTS);
        then.status(200).json_body(json!([{
            "_id": "proxy-xyz",
            "login": "1234",
            "server": "broker-live",
            "state": "UNDEPLOYED"
        }]));
    });
    let deploy = server.mock(|when, then| {
        when.method(POST).path(format!("{PROXY}/deploy"));
        then.status(204);
    });
    server.mock(|when, then| {
        when.method(GET).path(PROXY);
        then.status(200).json_body(json!({
            "_id": "proxy-xyz",
            "state": "DEPLOYED",
            "connectionStatus": "DISCONNECTED_FROM_BROKER"
        }));
    });
    let undeploy = server.mock(|when, then| {
        when.method(POST).path(format!("{PROXY}/undeploy"));
        then.status(204);
    });

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = orchestrator(&server, &pool)
        .sync(account_id, "alice", shutdown_rx)
        .await;

    assert_eq!(outcome, SyncOutcome::failure(SyncErrorKind::ConnectTimeout));
    deploy.assert();
    undeploy.assert_hits(0);

    let link = AccountLink::find(&pool, account_id, "alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.status, LinkStatus::Error);
    assert_eq!(link.remote_proxy_id.unwrap().0, "proxy-xyz");
    assert_eq!(link.last_sync_checkpoint, None);
}

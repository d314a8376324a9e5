//! End-to-end discovery scenarios over real sockets.

mod common;

use std::time::Duration;

use common::{TestClient, TestServer, fail_reason, props};
use pathfinder_core::domain::SameGenerationPolicy;
use pathfinder_core::resources::ResourceLimits;
use pathfinder_core::{ClientId, MatchType, ServiceId, SubscriptionId};
use pathfinder_server::config::DomainSpec;
use pathfinder_server::protocol::{Command, FailReason, ResponseBody};

fn spec() -> DomainSpec {
    DomainSpec::from_addrs("test", Vec::new())
}

#[tokio::test]
async fn basic_discovery_reports_match_before_accept() {
    let server = TestServer::start_default().await;

    let mut publisher = TestClient::connect(&server.addr).await;
    publisher.hello().await;
    let body = publisher
        .publish(ServiceId(0x4711), 0, props(&[("name", "foo")]), 60)
        .await;
    assert!(matches!(body, ResponseBody::Accept(_)));

    let mut watcher = TestClient::connect(&server.addr).await;
    watcher.hello().await;
    let (_ta, initial) = watcher
        .subscribe(SubscriptionId(1), Some("(name=foo)"))
        .await
        .unwrap();

    // Exactly one appeared row, delivered within the subscribe
    // transaction ahead of its accept.
    assert_eq!(initial.len(), 1);
    let row = &initial[0];
    assert_eq!(row.match_type, Some(MatchType::Appeared));
    assert_eq!(row.service_id, Some(ServiceId(0x4711)));
    assert_eq!(row.generation, Some(0));
    assert_eq!(row.props, Some(props(&[("name", "foo")])));
    assert_eq!(row.ttl, Some(60));

    // The watcher dropping produces nothing for the publisher.
    drop(watcher);
    publisher.ping_fence().await;
}

#[tokio::test]
async fn republish_conflicts_are_rejected_by_default_policy() {
    let server = TestServer::start_default().await;

    let mut watcher = TestClient::connect(&server.addr).await;
    watcher.hello().await;
    let (_ta, initial) = watcher
        .subscribe(SubscriptionId(1), Some("(color=*)"))
        .await
        .unwrap();
    assert!(initial.is_empty());

    let mut publisher = TestClient::connect(&server.addr).await;
    publisher.hello().await;
    let body = publisher
        .publish(ServiceId(0x4711), 0, props(&[("color", "green")]), 60)
        .await;
    assert!(matches!(body, ResponseBody::Accept(_)));

    let body = publisher
        .publish(ServiceId(0x4711), 0, props(&[("color", "blue")]), 60)
        .await;
    assert_eq!(fail_reason(&body), FailReason::SameGenerationButDifferent);

    // The watcher saw the green version and nothing else.
    let notify = watcher.recv().await;
    let ResponseBody::Notify(row) = notify.body else {
        panic!("expected notify, got {notify:?}");
    };
    assert_eq!(row.match_type, Some(MatchType::Appeared));
    assert_eq!(row.props, Some(props(&[("color", "green")])));
    watcher.ping_fence().await;
}

#[tokio::test]
async fn idempotent_policy_reports_old_generation() {
    let server = TestServer::start(DomainSpec {
        same_generation_policy: SameGenerationPolicy::Idempotent,
        ..spec()
    })
    .await;

    let mut publisher = TestClient::connect(&server.addr).await;
    publisher.hello().await;
    publisher
        .publish(ServiceId(0x4711), 0, props(&[("color", "green")]), 60)
        .await;

    let body = publisher
        .publish(ServiceId(0x4711), 0, props(&[("color", "blue")]), 60)
        .await;
    assert_eq!(fail_reason(&body), FailReason::OldGeneration);

    let body = publisher
        .publish(ServiceId(0x4711), 0, props(&[("color", "green")]), 60)
        .await;
    assert_eq!(fail_reason(&body), FailReason::OldGeneration);
}

#[tokio::test]
async fn orphan_readoption_yields_one_modified() {
    let server = TestServer::start_default().await;

    let mut watcher = TestClient::connect(&server.addr).await;
    watcher.hello().await;
    watcher
        .subscribe(SubscriptionId(1), Some("(name=svc)"))
        .await
        .unwrap();

    let mut publisher = TestClient::connect(&server.addr).await;
    publisher.hello().await;
    publisher
        .publish(ServiceId(0x10), 0, props(&[("name", "svc")]), 5)
        .await;

    let notify = watcher.recv().await;
    let ResponseBody::Notify(row) = notify.body else {
        panic!("expected appeared, got {notify:?}");
    };
    assert_eq!(row.match_type, Some(MatchType::Appeared));

    // The publisher vanishes; within the TTL a successor of the same
    // user republishes with a newer generation.
    drop(publisher);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut successor = TestClient::connect(&server.addr).await;
    successor.hello().await;
    let body = successor
        .publish(ServiceId(0x10), 1, props(&[("name", "svc")]), 5)
        .await;
    assert!(matches!(body, ResponseBody::Accept(_)));

    // Exactly one modified; never disappeared + appeared.
    let notify = watcher.recv().await;
    let ResponseBody::Notify(row) = notify.body else {
        panic!("expected modified, got {notify:?}");
    };
    assert_eq!(row.match_type, Some(MatchType::Modified));
    assert_eq!(row.generation, Some(1));
    assert_eq!(row.orphan_since, None);
    watcher.ping_fence().await;
}

#[tokio::test]
async fn orphan_timeout_delivers_one_disappeared() {
    let server = TestServer::start_default().await;

    let mut watcher = TestClient::connect(&server.addr).await;
    watcher.hello().await;
    watcher
        .subscribe(SubscriptionId(1), Some("(name=gone)"))
        .await
        .unwrap();

    let mut publisher = TestClient::connect(&server.addr).await;
    publisher.hello().await;
    publisher
        .publish(ServiceId(0x20), 0, props(&[("name", "gone")]), 1)
        .await;

    let notify = watcher.recv().await;
    assert!(matches!(notify.body, ResponseBody::Notify(_)));

    drop(publisher);

    // No re-adoption: the TTL elapses and exactly one disappeared
    // arrives, carrying the id alone.
    let notify = watcher.recv().await;
    let ResponseBody::Notify(row) = notify.body else {
        panic!("expected disappeared, got {notify:?}");
    };
    assert_eq!(row.match_type, Some(MatchType::Disappeared));
    assert_eq!(row.service_id, Some(ServiceId(0x20)));
    assert_eq!(row.props, None);
    watcher.ping_fence().await;
}

#[tokio::test]
async fn broken_filter_fails_the_subscription() {
    let server = TestServer::start_default().await;

    let mut client = TestClient::connect(&server.addr).await;
    client.hello().await;
    let err = client
        .subscribe(SubscriptionId(9), Some("(&(name=x)"))
        .await
        .unwrap_err();
    assert_eq!(err, FailReason::InvalidFilterSyntax);

    // The session survives a failed transaction.
    client.ping_fence().await;
}

#[tokio::test]
async fn per_user_service_limit_denies_second_publish() {
    let server = TestServer::start(DomainSpec {
        user_limits: ResourceLimits {
            services: Some(1),
            ..ResourceLimits::unlimited()
        },
        ..spec()
    })
    .await;

    let mut client = TestClient::connect(&server.addr).await;
    client.hello().await;
    let body = client
        .publish(ServiceId(0x1), 0, props(&[("name", "first")]), 60)
        .await;
    assert!(matches!(body, ResponseBody::Accept(_)));

    let body = client
        .publish(ServiceId(0x2), 0, props(&[("name", "second")]), 60)
        .await;
    assert_eq!(fail_reason(&body), FailReason::InsufficientResources);

    // The first service is intact and republishable.
    let rows = client.listing(Command::Services { filter: None }).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].service_id, Some(ServiceId(0x1)));

    let body = client
        .publish(ServiceId(0x1), 1, props(&[("name", "first")]), 60)
        .await;
    assert!(matches!(body, ResponseBody::Accept(_)));
}

#[tokio::test]
async fn command_before_hello_fails_and_closes() {
    let server = TestServer::start_default().await;

    let mut client = TestClient::connect(&server.addr).await;
    let response = client.request(Command::Ping).await;
    assert_eq!(fail_reason(&response.body), FailReason::NoHello);
    client.recv_eof().await;
}

#[tokio::test]
async fn version_negotiation_picks_highest_common() {
    let server = TestServer::start_default().await;

    let mut client = TestClient::connect(&server.addr).await;
    let response = client
        .request(Command::Hello {
            min_version: 1,
            max_version: 7,
            client_id: None,
        })
        .await;
    let ResponseBody::Accept(accept) = response.body else {
        panic!("expected accept, got {response:?}");
    };
    assert_eq!(accept.proto_version, Some(2));
}

#[tokio::test]
async fn unsupported_version_leaves_the_session_retryable() {
    let server = TestServer::start_default().await;

    let mut client = TestClient::connect(&server.addr).await;
    let response = client
        .request(Command::Hello {
            min_version: 8,
            max_version: 9,
            client_id: None,
        })
        .await;
    assert_eq!(
        fail_reason(&response.body),
        FailReason::UnsupportedProtocolVersion
    );

    // A corrected hello on the same connection succeeds.
    client.hello().await;
}

#[tokio::test]
async fn proposed_client_id_collision_is_refused() {
    let server = TestServer::start_default().await;

    let mut first = TestClient::connect(&server.addr).await;
    let id = first.hello_proposing(Some(ClientId(4242))).await.unwrap();
    assert_eq!(id, ClientId(4242));

    let mut second = TestClient::connect(&server.addr).await;
    let err = second
        .hello_proposing(Some(ClientId(4242)))
        .await
        .unwrap_err();
    assert_eq!(err, FailReason::ClientIdExists);
}

#[tokio::test]
async fn unpublish_streams_disappeared_to_watchers() {
    let server = TestServer::start_default().await;

    let mut watcher = TestClient::connect(&server.addr).await;
    watcher.hello().await;
    watcher.subscribe(SubscriptionId(1), None).await.unwrap();

    let mut publisher = TestClient::connect(&server.addr).await;
    publisher.hello().await;
    publisher
        .publish(ServiceId(0x30), 0, props(&[("name", "x")]), 60)
        .await;
    let appeared = watcher.recv().await;
    assert!(matches!(appeared.body, ResponseBody::Notify(_)));

    let response = publisher
        .request(Command::Unpublish {
            service_id: ServiceId(0x30),
        })
        .await;
    assert!(matches!(response.body, ResponseBody::Accept(_)));

    let notify = watcher.recv().await;
    let ResponseBody::Notify(row) = notify.body else {
        panic!("expected disappeared, got {notify:?}");
    };
    assert_eq!(row.match_type, Some(MatchType::Disappeared));

    // Unpublishing someone else's id or a missing id fails cleanly.
    let response = publisher
        .request(Command::Unpublish {
            service_id: ServiceId(0x30),
        })
        .await;
    assert_eq!(fail_reason(&response.body), FailReason::NonExistentService);
}

#[tokio::test]
async fn unsubscribe_stops_the_stream() {
    let server = TestServer::start_default().await;

    let mut watcher = TestClient::connect(&server.addr).await;
    watcher.hello().await;
    watcher.subscribe(SubscriptionId(7), None).await.unwrap();

    let mut publisher = TestClient::connect(&server.addr).await;
    publisher.hello().await;
    publisher
        .publish(ServiceId(0x40), 0, props(&[("name", "x")]), 60)
        .await;
    let appeared = watcher.recv().await;
    assert!(matches!(appeared.body, ResponseBody::Notify(_)));

    let response = watcher
        .request(Command::Unsubscribe {
            subscription_id: SubscriptionId(7),
        })
        .await;
    assert!(matches!(response.body, ResponseBody::Accept(_)));

    publisher
        .publish(ServiceId(0x40), 1, props(&[("name", "y")]), 60)
        .await;
    watcher.ping_fence().await;

    let response = watcher
        .request(Command::Unsubscribe {
            subscription_id: SubscriptionId(7),
        })
        .await;
    assert_eq!(
        fail_reason(&response.body),
        FailReason::NonExistentSubscription
    );
}

#[tokio::test]
async fn listings_have_accept_notify_complete_shape() {
    let server = TestServer::start_default().await;

    let mut a = TestClient::connect(&server.addr).await;
    let a_id = a.hello().await;
    let mut b = TestClient::connect(&server.addr).await;
    let b_id = b.hello().await;

    a.publish(ServiceId(0x50), 0, props(&[("name", "svc-a")]), 60)
        .await;
    b.subscribe(SubscriptionId(3), Some("(name=svc-a)"))
        .await
        .unwrap();

    let services = a.listing(Command::Services { filter: None }).await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].client_id, Some(a_id));

    let filtered = a
        .listing(Command::Services {
            filter: Some("(name=other)".to_owned()),
        })
        .await;
    assert!(filtered.is_empty());

    let subscriptions = a.listing(Command::Subscriptions).await;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].subscription_id, Some(SubscriptionId(3)));
    assert_eq!(subscriptions[0].client_id, Some(b_id));
    assert_eq!(subscriptions[0].filter.as_deref(), Some("(name=svc-a)"));

    let clients = a.listing(Command::Clients).await;
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().all(|row| row.connect_time.is_some()));
    assert!(clients.iter().any(|row| row.client_id == Some(a_id)));
    assert!(clients.iter().any(|row| row.client_id == Some(b_id)));
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    let server = TestServer::start(DomainSpec {
        idle_timeout: Some(Duration::from_millis(300)),
        ..spec()
    })
    .await;

    let mut client = TestClient::connect(&server.addr).await;
    client.hello().await;

    // Pings keep the session alive across several windows.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        client.ping_fence().await;
    }

    // Silence does not.
    client.recv_eof().await;
}

#[tokio::test]
async fn orphaned_service_remains_listed_until_timeout() {
    let server = TestServer::start_default().await;

    let mut publisher = TestClient::connect(&server.addr).await;
    let publisher_id = publisher.hello().await;
    publisher
        .publish(ServiceId(0x60), 0, props(&[("name", "linger")]), 2)
        .await;
    drop(publisher);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut observer = TestClient::connect(&server.addr).await;
    observer.hello().await;
    let rows = observer.listing(Command::Services { filter: None }).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].client_id, Some(publisher_id));
    assert!(rows[0].orphan_since.is_some());
}

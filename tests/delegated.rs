mod common;

use std::time::Duration;

use common::{BrokerWorkload, MockBroker};
use spire_authz::delegated::{DelegationError, K8s, Unix};
use spire_authz::observability::Level;
use spire_authz::{
    CallContext, DelegatedAuth, DelegatedAuthConfig, Error, Logger, MemorySink, Selector, SpiffeId,
};
use tokio_util::sync::CancellationToken;

fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(10))
}

fn workloads() -> Vec<BrokerWorkload> {
    vec![
        BrokerWorkload {
            spiffe_id: "spiffe://example.org/ns/payments/sa/api".to_owned(),
            selectors: vec![
                ("k8s".to_owned(), "ns:payments".to_owned()),
                ("k8s".to_owned(), "sa:api".to_owned()),
            ],
        },
        BrokerWorkload {
            spiffe_id: "spiffe://example.org/ns/payments/sa/worker".to_owned(),
            selectors: vec![
                ("k8s".to_owned(), "ns:payments".to_owned()),
                ("k8s".to_owned(), "sa:worker".to_owned()),
            ],
        },
    ]
}

fn auth(broker: &MockBroker, logger: Logger) -> DelegatedAuth {
    DelegatedAuth::new(
        DelegatedAuthConfig {
            admin_uds_path: Some(broker.address()),
            ..DelegatedAuthConfig::default()
        },
        logger,
    )
}

#[tokio::test]
async fn tokens_are_issued_for_the_matching_workload() {
    let broker = MockBroker::start(workloads()).await;
    let sink = MemorySink::new();
    let auth = auth(&broker, Logger::from_shared(sink.clone()));

    let selectors = Selector::k8s_workload("payments", "api");
    let issued = auth
        .fetch_jwt_svids(&ctx(), &selectors, &["spiffe://example.org/ledger"])
        .await
        .unwrap();

    assert_eq!(issued.len(), 1);
    let expected = SpiffeId::new("spiffe://example.org/ns/payments/sa/api").unwrap();
    assert_eq!(issued[0].identity, expected);
    assert_eq!(issued[0].svid.spiffe_id(), &expected);
    assert_eq!(issued[0].svid.audience(), ["spiffe://example.org/ledger"]);

    let requests = broker.requests();
    assert_eq!(requests.len(), 1);
    let sent: Vec<_> = requests[0]
        .selectors
        .iter()
        .map(|s| (s.r#type.as_str(), s.value.as_str()))
        .collect();
    assert_eq!(sent, [("k8s", "ns:payments"), ("k8s", "sa:api")]);
    assert_eq!(requests[0].audience, ["spiffe://example.org/ledger"]);

    let token = issued[0].svid.token();
    assert!(sink.records().iter().all(|r| !r.message.contains(token)));
}

#[tokio::test]
async fn broader_selectors_match_several_workloads() {
    let broker = MockBroker::start(workloads()).await;
    let auth = auth(&broker, Logger::discard());

    let issued = auth
        .fetch_jwt_svids(
            &ctx(),
            &[Selector::K8s(K8s::Namespace("payments".to_owned()))],
            &["aud"],
        )
        .await
        .unwrap();
    assert_eq!(issued.len(), 2);
}

#[tokio::test]
async fn unmatched_selectors_yield_nothing() {
    let broker = MockBroker::start(workloads()).await;
    let auth = auth(&broker, Logger::discard());

    let issued = auth
        .fetch_jwt_svids(&ctx(), &[Selector::Unix(Unix::Uid(1000))], &["aud"])
        .await
        .unwrap();
    assert!(issued.is_empty());
}

#[tokio::test]
async fn refused_delegate_gets_an_empty_result() {
    let broker = MockBroker::start(workloads()).await;
    broker.deny(true);
    let sink = MemorySink::new();
    let auth = auth(&broker, Logger::from_shared(sink.clone()));

    let issued = auth
        .fetch_jwt_svids(&ctx(), &Selector::k8s_workload("payments", "api"), &["aud"])
        .await
        .unwrap();
    assert!(issued.is_empty());
    assert!(sink
        .at(Level::Info)
        .iter()
        .any(|m| m.contains("refused")));
}

#[tokio::test]
async fn unparseable_tokens_fail_the_request() {
    let broker = MockBroker::start(workloads()).await;
    broker.send_garbage_tokens(true);
    let auth = auth(&broker, Logger::discard());

    let err = auth
        .fetch_jwt_svids(&ctx(), &Selector::k8s_workload("payments", "api"), &["aud"])
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Delegation(DelegationError::InvalidToken(_))),
        "{err:?}"
    );
}

#[tokio::test]
async fn inputs_are_checked_before_dialing() {
    let broker = MockBroker::start(workloads()).await;
    let auth = auth(&broker, Logger::discard());

    let err = auth
        .fetch_jwt_svids(&ctx(), &[], &["aud"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Delegation(DelegationError::EmptySelectors)));

    let err = auth
        .fetch_jwt_svids(&ctx(), &Selector::k8s_workload("payments", "api"), &["", " "])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Delegation(DelegationError::EmptyAudience)));

    assert!(broker.requests().is_empty());
}

#[tokio::test]
async fn unreachable_broker_is_a_delegation_error() {
    let dir = tempfile::tempdir().unwrap();
    let auth = DelegatedAuth::new(
        DelegatedAuthConfig {
            admin_uds_path: Some(format!("unix://{}", dir.path().join("absent.sock").display())),
            ..DelegatedAuthConfig::default()
        },
        Logger::discard(),
    );

    let err = auth
        .fetch_jwt_svids(&ctx(), &Selector::k8s_workload("payments", "api"), &["aud"])
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Delegation(DelegationError::Broker(_))),
        "{err:?}"
    );
}

#[tokio::test]
async fn slow_broker_times_out() {
    let broker = MockBroker::start(workloads()).await;
    broker.set_delay(Duration::from_secs(30));
    let auth = auth(&broker, Logger::discard());

    let started = std::time::Instant::now();
    let err = auth
        .fetch_jwt_svids(
            &CallContext::with_timeout(Duration::from_millis(300)),
            &Selector::k8s_workload("payments", "api"),
            &["aud"],
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn delegated_fetch_honours_cancellation() {
    let broker = MockBroker::start(workloads()).await;
    broker.set_delay(Duration::from_secs(30));
    let auth = auth(&broker, Logger::discard());

    let token = CancellationToken::new();
    let ctx = CallContext::new().with_cancellation(token.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let err = auth
        .fetch_jwt_svids(&ctx, &Selector::k8s_workload("payments", "api"), &["aud"])
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
}

//! End-to-end message/presence routing between two logged-in connections on
//! the same served host.

mod common;

use common::{FixedAuth, TestServer};

#[tokio::test]
async fn message_between_two_local_full_jids_is_delivered() {
    let auth = FixedAuth::new(&[("alice", "secret"), ("bob", "secret")]);
    let server = TestServer::start("example.test", auth).await;

    let mut alice = server.connect().await;
    alice.log_in("example.test", "alice", "secret", Some("home")).await;

    let mut bob = server.connect().await;
    bob.log_in("example.test", "bob", "secret", Some("phone")).await;

    alice
        .send("<message xmlns='jabber:client' type='chat' to='bob@example.test/phone'><body>hi</body></message>")
        .await;

    let resp = bob.read_until("<body>hi</body>").await;
    assert!(resp.contains("from='alice@example.test/home'") || resp.contains("from=\"alice@example.test/home\""));
}

#[tokio::test]
async fn message_to_bare_jid_goes_to_highest_priority_resource() {
    let auth = FixedAuth::new(&[("alice", "secret"), ("bob", "secret")]);
    let server = TestServer::start("example.test", auth).await;

    let mut alice = server.connect().await;
    alice.log_in("example.test", "alice", "secret", Some("sender")).await;

    let mut bob_low = server.connect().await;
    bob_low.log_in("example.test", "bob", "secret", Some("low")).await;
    bob_low.send("<presence xmlns='jabber:client'><priority>0</priority></presence>").await;

    let mut bob_high = server.connect().await;
    bob_high.log_in("example.test", "bob", "secret", Some("high")).await;
    bob_high.send("<presence xmlns='jabber:client'><priority>5</priority></presence>").await;
    bob_high.clear();
    bob_low.clear();

    alice
        .send("<message xmlns='jabber:client' type='chat' to='bob@example.test'><body>pick me</body></message>")
        .await;

    let resp = bob_high.read_until("<body>pick me</body>").await;
    assert!(resp.contains("pick me"));
    assert!(bob_low.buffer().is_empty() || !bob_low.buffer().contains("pick me"));
}

#[tokio::test]
async fn directed_presence_is_delivered_to_the_target() {
    let auth = FixedAuth::new(&[("alice", "secret"), ("bob", "secret")]);
    let server = TestServer::start("example.test", auth).await;

    let mut alice = server.connect().await;
    alice.log_in("example.test", "alice", "secret", Some("home")).await;

    let mut bob = server.connect().await;
    bob.log_in("example.test", "bob", "secret", Some("phone")).await;
    bob.clear();

    alice
        .send("<presence xmlns='jabber:client' to='bob@example.test/phone'/>")
        .await;

    let resp = bob.read_until("<presence").await;
    assert!(resp.contains("from='alice@example.test/home'") || resp.contains("from=\"alice@example.test/home\""));
}

#[tokio::test]
async fn iq_to_unknown_host_namespace_bounces_service_unavailable() {
    let auth = FixedAuth::new(&[("alice", "secret")]);
    let server = TestServer::start("example.test", auth).await;

    let mut alice = server.connect().await;
    alice.log_in("example.test", "alice", "secret", Some("home")).await;

    alice
        .send("<iq xmlns='jabber:client' type='get' id='v1' to='example.test'><query xmlns='jabber:iq:version'/></iq>")
        .await;

    let resp = alice.read_until("</iq>").await;
    assert!(resp.contains("service-unavailable"));
}

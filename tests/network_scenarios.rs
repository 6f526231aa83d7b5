mod common;

use std::net::Ipv4Addr;

use lightnode::config::SupervisorConfig;
use lightnode::http::{handlers, RequestHeaders};
use lightnode::network::link::{LinkConfig, LinkEvent, LinkRole};
use lightnode::network::service::{ServiceManager, StopOutcome};
use lightnode::network::supervisor::{NetworkMode, SupervisorEvent};
use lightnode::sim::{LinkCall, SimServiceFactory};
use proptest::prelude::*;

use common::Node;

fn ap_entries(node: &Node) -> usize {
    node.link
        .calls()
        .iter()
        .filter(|call| **call == LinkCall::SetMode(LinkRole::AccessPoint))
        .count()
}

#[test]
fn fresh_boot_serves_the_index_from_the_access_point() {
    let mut node = Node::boot(None);
    node.supervisor.start(node.t0);

    assert_eq!(node.handle.snapshot().mode, NetworkMode::ApFallback);
    assert!(!node.link.calls().contains(&LinkCall::SetMode(LinkRole::Station)));
    assert!(!node.link.calls().contains(&LinkCall::Connect));
    assert_eq!(node.factory.active(), Some(LinkRole::AccessPoint));

    let reply = handlers::index(&RequestHeaders::default());
    assert_eq!(reply.status, 200);
    assert!(reply.body_str().contains("<html"));
}

#[test]
fn link_events_reach_the_supervisor_through_the_driver_sink() {
    let mut node = Node::boot(Some(("HomeNet", "applesauce")));
    node.supervisor.start(node.t0);

    assert!(node.link.emit(LinkEvent::LinkUp(Ipv4Addr::new(192, 168, 4, 20))));
    assert!(node.supervisor.pump(node.at(1)));

    let snapshot = node.handle.snapshot();
    assert_eq!(snapshot.mode, NetworkMode::StationConnected);
    assert_eq!(snapshot.address, Some(Ipv4Addr::new(192, 168, 4, 20)));
    assert_eq!(snapshot.ssid.as_deref(), Some("HomeNet"));
    assert_eq!(node.factory.active(), Some(LinkRole::Station));
}

#[test]
fn idle_access_point_probes_the_station_network_on_its_own() {
    let mut node = Node::boot(Some(("HomeNet", "")));
    node.supervisor.start(node.t0);
    node.supervisor.pump(node.at(15));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ApFallback);

    // Nobody joins for a full probe interval
    node.supervisor.pump(node.at(74));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ApFallback);
    node.supervisor.pump(node.at(75));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ConnectingSta);

    // The probe succeeds this time
    node.link.emit(LinkEvent::LinkUp(Ipv4Addr::new(10, 1, 1, 9)));
    node.supervisor.pump(node.at(76));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::StationConnected);
    assert_eq!(node.handle.snapshot().retries, 0);
}

#[test]
fn peer_leaving_restarts_the_probe_interval() {
    let mut node = Node::boot(Some(("HomeNet", "")));
    node.supervisor.start(node.t0);
    node.supervisor.pump(node.at(15));

    let phone = [0x02, 0, 0, 0, 0, 0x01];
    node.link.emit(LinkEvent::StationJoined(phone));
    node.supervisor.pump(node.at(20));
    assert_eq!(node.handle.snapshot().peers, 1);

    node.link.emit(LinkEvent::StationLeft(phone));
    node.supervisor.pump(node.at(100));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ApFallback);

    node.supervisor.pump(node.at(159));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ApFallback);
    node.supervisor.pump(node.at(160));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ConnectingSta);
}

#[test]
fn credentials_posted_to_the_config_endpoint_reconfigure_the_link() {
    let mut node = Node::boot(None);
    node.supervisor.start(node.t0);

    let reply = handlers::configure(&node.ctx, br#"{"ssid": "Upstairs", "psk": "correct horse"}"#);
    assert_eq!(reply.status, 200);
    // Nothing changes until the supervisor loop runs
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ApFallback);

    node.supervisor.pump(node.at(1));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ConnectingSta);
    assert_eq!(node.factory.active(), None);

    let stored = node.stored_credentials().expect("credentials persisted");
    assert_eq!(stored.ssid(), "Upstairs");
    assert_eq!(stored.passphrase(), "correct horse");
    assert!(node
        .link
        .calls()
        .contains(&LinkCall::SetConfig(LinkConfig::Station(stored))));
}

#[test]
fn shutdown_through_the_handle_stops_the_loop() {
    let mut node = Node::boot(None);
    node.supervisor.start(node.t0);
    node.handle.shutdown().unwrap();

    assert!(!node.supervisor.pump(node.at(1)));
    assert_eq!(node.handle.snapshot().mode, NetworkMode::Idle);
    assert_eq!(node.factory.active(), None);
}

#[test]
fn stopping_a_stopped_service_is_a_no_op() {
    let factory = SimServiceFactory::new();
    let mut services = ServiceManager::new(factory.clone());
    let handle = services.start(LinkRole::Station).unwrap();

    assert_eq!(services.stop(Some(handle)), StopOutcome::Stopped);
    assert_eq!(services.stop(Some(handle)), StopOutcome::NotRunning);
    assert_eq!(services.stop(None), StopOutcome::NotRunning);
    assert_eq!(factory.active(), None);
    assert_eq!(factory.binds(), vec![LinkRole::Station]);
}

proptest! {
    #[test]
    fn retry_bound_holds_for_any_limit(max_retries in 0u32..12, extra in 1usize..4) {
        let config = SupervisorConfig { max_retries, ..SupervisorConfig::default() };
        let mut node = Node::boot_with(config, Some(("HomeNet", "applesauce")));
        node.supervisor.start(node.t0);

        for n in 1..=max_retries {
            node.supervisor.handle_event(SupervisorEvent::Link(LinkEvent::LinkDown), node.t0);
            prop_assert_eq!(node.supervisor.state().mode, NetworkMode::ConnectingSta);
            prop_assert_eq!(node.supervisor.state().retry_count, n);
        }

        // The next failure gives up, later ones are ignored by the AP
        for _ in 0..extra {
            node.supervisor.handle_event(SupervisorEvent::Link(LinkEvent::LinkDown), node.t0);
            prop_assert_eq!(node.supervisor.state().mode, NetworkMode::ApFallback);
        }
        prop_assert_eq!(ap_entries(&node), 1);
        prop_assert!(node.supervisor.state().retry_count <= max_retries + 1);
    }

    #[test]
    fn credentials_round_trip_through_reconfiguring(
        ssid in "[A-Za-z0-9 _.-]{1,32}",
        psk in prop_oneof![Just(String::new()), "[!-~]{8,63}"],
    ) {
        let mut node = Node::boot(Some(("OldNet", "oldpassword")));
        node.supervisor.start(node.t0);

        let creds = lightnode::network::NetworkCredentials::new(&ssid, &psk).unwrap();
        node.handle.apply_credentials(creds).unwrap();
        node.supervisor.pump(node.at(1));

        let stored = node.stored_credentials().unwrap();
        prop_assert_eq!(stored.ssid(), ssid.as_str());
        prop_assert_eq!(stored.passphrase(), psk.as_str());
        prop_assert_eq!(node.supervisor.state().mode, NetworkMode::ConnectingSta);
        prop_assert_eq!(node.supervisor.state().retry_count, 0);
    }
}

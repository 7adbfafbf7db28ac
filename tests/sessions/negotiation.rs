//! Chart negotiation and readiness.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use arena_sync::{
    ArenaConfig, ArenaError, ArenaEvent, ChartHash, Notice, NoticeKey, ParticipantId, Phase,
};

use crate::common::Lobby;

const FRAME: Duration = Duration::from_millis(16);
const HOST: ParticipantId = ParticipantId::HOST;

fn h(hash: &str) -> ChartHash {
    ChartHash::new(hash)
}

/// A host with the given charts and one client per `(name, charts)` entry, all joined.
fn lobby_with(host_charts: &[&str], clients: &[(&str, &[&str])]) -> Lobby {
    let mut lobby = Lobby::new(ArenaConfig::default(), host_charts);
    for (name, charts) in clients {
        lobby.join(name, charts);
    }
    lobby.pump();
    lobby.host_events();
    for n in 0..clients.len() {
        lobby.client_events(n);
    }
    lobby
}

fn host_ready(lobby: &Lobby) -> Vec<(ParticipantId, bool)> {
    lobby.host.state().read().ready_map()
}

#[test]
fn lone_host_agrees_with_itself_and_starts() {
    let lobby = lobby_with(&["h1"], &[]);
    lobby.host.select_chart(h("h1")).unwrap();

    assert_eq!(lobby.host.phase(), Phase::ChartNegotiation);
    assert!(lobby
        .host_events()
        .contains(&ArenaEvent::ChartSelected { chart: h("h1") }));
    assert_eq!(host_ready(&lobby), vec![(HOST, true)]);

    lobby.step(FRAME);

    assert_eq!(lobby.host.phase(), Phase::Loading);
    let state = lobby.host.state();
    let mut state = state.write();
    assert!(state.playing);
    assert_eq!(state.chart, h("h1"));
    assert!(state.ruleset_mut(HOST).is_some());
    let seed = state.seed;
    drop(state);
    assert!(lobby.host_events().contains(&ArenaEvent::StartPlaying {
        seed,
        chart: h("h1"),
    }));
}

#[test]
fn host_cannot_propose_a_chart_it_lacks() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h9"])]);
    lobby.host.select_chart(h("h9")).unwrap();
    lobby.pump();

    assert!(lobby
        .host_events()
        .contains(&ArenaEvent::Notice(Notice::with_text(
            NoticeKey::HostLacksChart,
            "h9"
        ))));
    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);
    assert!(lobby.host.state().read().chart.is_empty());
}

#[test]
fn a_missing_peer_blocks_agreement() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h1"]), ("mika", &[])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();

    let host_events = lobby.host_events();
    assert!(host_events.contains(&ArenaEvent::Notice(Notice::with_text(
        NoticeKey::PeerLacksChart,
        "mika"
    ))));
    assert!(!host_events.contains(&ArenaEvent::ChartSelected { chart: h("h1") }));
    assert!(lobby
        .client_events(1)
        .contains(&ArenaEvent::Notice(Notice::with_text(
            NoticeKey::ChartMissingLocally,
            "h1"
        ))));

    // The request itself still reached everyone.
    assert_eq!(lobby.client(0).phase(), Phase::ChartNegotiation);
    assert_eq!(lobby.client(0).state().read().chart, h("h1"));

    lobby.run_for(Duration::from_secs(1), FRAME);
    assert_eq!(lobby.host.phase(), Phase::ChartNegotiation);
    assert!(host_ready(&lobby).iter().all(|(_, ready)| !ready));
}

#[test]
fn everyone_ready_starts_the_round() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h1"]), ("mika", &["h1"])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();
    assert!(lobby
        .host_events()
        .contains(&ArenaEvent::ChartSelected { chart: h("h1") }));
    assert_eq!(
        host_ready(&lobby),
        vec![
            (HOST, true),
            (ParticipantId::new(1), false),
            (ParticipantId::new(2), false)
        ]
    );

    lobby.client(0).request_chart(h("h1")).unwrap();
    lobby.client(1).request_chart(h("h1")).unwrap();
    lobby.pump();
    assert!(host_ready(&lobby).iter().all(|(_, ready)| *ready));
    assert!(lobby
        .client(0)
        .state()
        .read()
        .ready_map()
        .iter()
        .all(|(_, ready)| *ready));

    lobby.step(FRAME);

    assert_eq!(lobby.host.phase(), Phase::Loading);
    let seed = lobby.host.state().read().seed;
    for n in 0..2 {
        let client = lobby.client(n);
        assert_eq!(client.phase(), Phase::Loading);
        let state = client.state();
        let state = state.read();
        assert_eq!(state.seed, seed);
        assert_eq!(state.chart, h("h1"));
        assert!(state.playing);
    }
}

#[test]
fn host_switching_charts_clears_readiness() {
    let lobby = lobby_with(&["h1", "h2"], &[("rin", &["h1", "h2"]), ("mika", &["h1", "h2"])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();
    lobby.client(0).request_chart(h("h1")).unwrap();
    lobby.pump();
    assert_eq!(host_ready(&lobby)[1], (ParticipantId::new(1), true));

    lobby.host.select_chart(h("h2")).unwrap();
    lobby.pump();

    assert_eq!(
        host_ready(&lobby),
        vec![
            (HOST, true),
            (ParticipantId::new(1), false),
            (ParticipantId::new(2), false)
        ]
    );
    assert_eq!(lobby.host.state().read().chart, h("h2"));
    let rin = lobby.client(0).state();
    let rin = rin.read();
    assert_eq!(rin.chart, h("h2"));
    assert_eq!(rin.ready_map()[1], (ParticipantId::new(1), false));
}

#[test]
fn client_agreeing_on_another_chart_is_told_the_host_chart() {
    let lobby = lobby_with(&["h1", "h2"], &[("rin", &["h1", "h2"])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();
    lobby.client_events(0);

    lobby.client(0).request_chart(h("h2")).unwrap();
    lobby.pump();

    assert!(lobby
        .client_events(0)
        .contains(&ArenaEvent::Notice(Notice::with_text(
            NoticeKey::HostSelectedOtherChart,
            "h1"
        ))));
    assert_eq!(lobby.host.state().read().chart, h("h2"));
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::ChartNegotiation);

    // Confirming the host's chart starts the round on it.
    lobby.client(0).request_chart(h("h1")).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::Loading);
    assert_eq!(lobby.client(0).state().read().chart, h("h1"));
}

#[test]
fn client_proposal_the_host_lacks_is_refused() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h5"])]);
    lobby.client(0).request_chart(h("h5")).unwrap();
    lobby.pump();

    assert!(lobby
        .client_events(0)
        .contains(&ArenaEvent::Notice(Notice::with_text(
            NoticeKey::HostLacksChart,
            "h5"
        ))));
    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);
}

#[test]
fn client_cannot_propose_a_chart_it_lacks() {
    let lobby = lobby_with(&["h1"], &[("rin", &[])]);
    lobby.client(0).request_chart(h("h1")).unwrap();

    assert_eq!(lobby.net.in_flight(), 0);
    assert!(lobby
        .client_events(0)
        .contains(&ArenaEvent::Notice(Notice::with_text(
            NoticeKey::ChartMissingLocally,
            "h1"
        ))));
    lobby.pump();
    assert!(lobby.host_events().is_empty());
}

#[test]
fn empty_client_proposal_withdraws_readiness() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h1"]), ("mika", &[])]);
    lobby.client(0).request_chart(h("h1")).unwrap();
    lobby.pump();
    // mika lacks the chart, so rin's proposal cannot complete yet.
    assert_eq!(host_ready(&lobby)[1], (ParticipantId::new(1), false));

    let lobby = lobby_with(&["h1"], &[("rin", &["h1"])]);
    lobby.client(0).request_chart(h("h1")).unwrap();
    lobby.pump();
    assert_eq!(host_ready(&lobby)[1], (ParticipantId::new(1), true));

    lobby.client(0).request_chart(ChartHash::empty()).unwrap();
    lobby.pump();
    assert_eq!(host_ready(&lobby)[1], (ParticipantId::new(1), false));
    assert!(lobby
        .host_events()
        .iter()
        .any(|e| matches!(e, ArenaEvent::ReadyChanged { .. })));
}

#[test]
fn host_withdrawal_resets_clients() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h1"])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();
    assert_eq!(host_ready(&lobby)[0], (HOST, true));

    lobby.host.select_chart(ChartHash::empty()).unwrap();
    lobby.pump();

    assert_eq!(host_ready(&lobby)[0], (HOST, false));
    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);
    assert_eq!(lobby.client(0).phase(), Phase::LobbyOpen);
    assert!(lobby.client(0).state().read().chart.is_empty());
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);
}

#[test]
fn departure_of_the_missing_peer_completes_agreement() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h1"]), ("mika", &[])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();
    lobby.host_events();

    lobby.client(1).leave();
    lobby.pump();

    assert!(lobby
        .host_events()
        .contains(&ArenaEvent::ChartSelected { chart: h("h1") }));
    assert_eq!(host_ready(&lobby)[0], (HOST, true));

    lobby.client(0).request_chart(h("h1")).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::Loading);
}

#[test]
fn late_joiner_catches_up() {
    let mut lobby = lobby_with(&["h1"], &[("rin", &["h1"])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();

    let mika = lobby.join("mika", &["h1"]);
    lobby.pump();

    let client = lobby.client(mika);
    assert_eq!(client.phase(), Phase::ChartNegotiation);
    let state = client.state();
    let state = state.read();
    assert_eq!(state.chart, h("h1"));
    assert_eq!(state.ready_map()[0], (HOST, true));
}

#[test]
fn proposals_are_refused_outside_the_lobby() {
    let lobby = lobby_with(&["h1"], &[("rin", &["h1"])]);
    lobby.host.select_chart(h("h1")).unwrap();
    lobby.pump();
    lobby.client(0).request_chart(h("h1")).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.client(0).phase(), Phase::Loading);

    let refused = ArenaError::WrongPhase {
        expected: Phase::LobbyOpen,
        actual: Phase::Loading,
    };
    assert_eq!(lobby.client(0).request_chart(h("h1")), Err(refused.clone()));
    assert_eq!(lobby.host.select_chart(h("h1")), Err(refused));
}

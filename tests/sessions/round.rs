//! Loading, playing and result barriers.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use arena_sync::{ArenaConfig, ArenaError, ArenaEvent, ChartHash, ParticipantId, Phase};

use crate::common::test_utils::HOST_SIDE;
use crate::common::{client_addr, Lobby};

const FRAME: Duration = Duration::from_millis(16);
const TICK: Duration = Duration::from_millis(10);
const HOST: ParticipantId = ParticipantId::HOST;
const RIN: ParticipantId = ParticipantId::new(1);

/// Joins every client, agrees on `h1` and steps into LOADING.
fn loading_lobby(names: &[&str]) -> Lobby {
    let mut lobby = Lobby::new(ArenaConfig::default(), &["h1"]);
    for name in names {
        lobby.join(name, &["h1"]);
    }
    lobby.pump();
    lobby.host.select_chart(ChartHash::new("h1")).unwrap();
    lobby.pump();
    for n in 0..names.len() {
        lobby.client(n).request_chart(ChartHash::new("h1")).unwrap();
    }
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::Loading);
    for n in 0..names.len() {
        assert_eq!(lobby.client(n).phase(), Phase::Loading);
    }
    lobby
}

fn init_of(lobby_state: &arena_sync::SharedState, id: ParticipantId) -> Vec<u8> {
    lobby_state.write().ruleset_mut(id).unwrap().pack_init()
}

fn frame_of(lobby_state: &arena_sync::SharedState, id: ParticipantId) -> Vec<u8> {
    lobby_state.write().ruleset_mut(id).unwrap().pack_frame()
}

#[test]
fn full_round_with_one_client() {
    let lobby = loading_lobby(&["rin"]);
    let host_state = lobby.host.state();
    let rin_state = lobby.client(0).state();
    let seed = host_state.read().seed;
    assert_eq!(rin_state.read().seed, seed);

    // Loading barrier.
    lobby.client(0).finish_loading(100).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::Loading);
    lobby.host.finish_loading(50).unwrap();
    lobby.step(FRAME);

    assert_eq!(lobby.host.phase(), Phase::Playing);
    assert_eq!(lobby.client(0).phase(), Phase::Playing);
    assert_eq!(host_state.read().start_delay_ms, Some(100));
    assert_eq!(rin_state.read().start_delay_ms, Some(100));
    assert!(lobby
        .host_events()
        .contains(&ArenaEvent::StartTimeDecided { start_ms: 100 }));
    assert!(lobby
        .client_events(0)
        .contains(&ArenaEvent::StartTimeDecided { start_ms: 100 }));

    // Each side's mirror was initialized from the other side's judge.
    assert_eq!(init_of(&host_state, RIN), vec![0xC0, 1]);
    assert_eq!(init_of(&rin_state, HOST), vec![HOST_SIDE, 0]);

    // Frames flow both ways through the host.
    for _ in 0..3 {
        lobby.step(FRAME);
    }
    assert_eq!(frame_of(&host_state, RIN), vec![0xC0, 1, seed as u8]);
    assert_eq!(frame_of(&rin_state, HOST), vec![HOST_SIDE, 0, seed as u8]);

    // Playing barrier waits for everyone.
    lobby.host.finish_playing().unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::Playing);
    lobby.client(0).finish_playing().unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::ResultWait);
    assert_eq!(lobby.client(0).phase(), Phase::ResultWait);
    assert!(host_state.read().playing_finished);
    assert!(rin_state.read().playing_finished);

    // Result barrier too.
    lobby.client(0).finish_result().unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::ResultWait);
    lobby.host.finish_result().unwrap();
    lobby.step(FRAME);

    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);
    assert_eq!(lobby.client(0).phase(), Phase::LobbyOpen);
    for state in [&host_state, &rin_state] {
        let mut state = state.write();
        assert!(!state.playing);
        assert!(state.chart.is_empty());
        assert_eq!(state.start_delay_ms, None);
        assert!(state.ruleset_mut(HOST).is_none());
        assert!(state.ready_map().iter().all(|(_, ready)| !ready));
    }
}

#[test]
fn a_second_round_can_follow() {
    let lobby = loading_lobby(&["rin"]);
    lobby.client(0).finish_loading(0).unwrap();
    lobby.host.finish_loading(0).unwrap();
    lobby.step(FRAME);
    lobby.client(0).finish_playing().unwrap();
    lobby.host.finish_playing().unwrap();
    lobby.step(FRAME);
    lobby.client(0).finish_result().unwrap();
    lobby.host.finish_result().unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);

    lobby.host.select_chart(ChartHash::new("h1")).unwrap();
    lobby.pump();
    lobby.client(0).request_chart(ChartHash::new("h1")).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::Loading);
    assert_eq!(lobby.client(0).phase(), Phase::Loading);
}

#[test]
fn barrier_signals_need_the_right_phase() {
    let lobby = Lobby::new(ArenaConfig::default(), &["h1"]);
    assert_eq!(
        lobby.host.finish_loading(0),
        Err(ArenaError::WrongPhase {
            expected: Phase::Loading,
            actual: Phase::LobbyOpen,
        })
    );
    drop(lobby);

    let lobby = loading_lobby(&["rin"]);
    assert_eq!(
        lobby.client(0).finish_playing(),
        Err(ArenaError::WrongPhase {
            expected: Phase::Playing,
            actual: Phase::Loading,
        })
    );
    assert_eq!(
        lobby.host.finish_result(),
        Err(ArenaError::WrongPhase {
            expected: Phase::ResultWait,
            actual: Phase::Loading,
        })
    );
}

#[test]
fn start_time_accounts_for_each_clients_ping() {
    let mut lobby = Lobby::new(ArenaConfig::default(), &["h1"]);
    lobby.net.set_latency(client_addr(0), Duration::from_millis(20));
    lobby.net.set_latency(client_addr(1), Duration::from_millis(50));
    lobby.join("rin", &["h1"]);
    lobby.join("mika", &["h1"]);

    // Long enough for one heartbeat round trip each.
    lobby.run_for(Duration::from_secs(6), TICK);
    assert_eq!(
        lobby.host.participant_rtt(RIN),
        Some(Duration::from_millis(40))
    );
    assert_eq!(
        lobby.host.participant_rtt(ParticipantId::new(2)),
        Some(Duration::from_millis(100))
    );

    lobby.host.select_chart(ChartHash::new("h1")).unwrap();
    assert!(lobby.run_until(Duration::from_secs(2), TICK, |l| {
        l.host.state().read().ready_map()[0].1
    }));
    lobby.client(0).request_chart(ChartHash::new("h1")).unwrap();
    lobby.client(1).request_chart(ChartHash::new("h1")).unwrap();
    assert!(lobby.run_until(Duration::from_secs(2), TICK, |l| {
        l.clients.iter().all(|(_, c)| c.phase() == Phase::Loading)
    }));

    lobby.client(0).finish_loading(100).unwrap();
    lobby.client(1).finish_loading(30).unwrap();
    lobby.host.finish_loading(50).unwrap();
    assert!(lobby.run_until(Duration::from_secs(2), TICK, |l| {
        l.clients.iter().all(|(_, c)| c.phase() == Phase::Playing)
    }));

    // Canonical start is max(50, 100 + 20, 30 + 50) = 120 from the host's point of view.
    assert_eq!(lobby.host.state().read().start_delay_ms, Some(120));
    assert_eq!(lobby.client(0).state().read().start_delay_ms, Some(100));
    assert_eq!(lobby.client(1).state().read().start_delay_ms, Some(70));
}

#[test]
fn play_data_is_not_relayed_before_playing() {
    let lobby = loading_lobby(&["rin", "mika"]);
    let host_state = lobby.host.state();
    let seed = host_state.read().seed;
    for _ in 0..5 {
        lobby.step(FRAME);
    }
    // Still loading: every mirror still holds what the local factory built.
    assert_eq!(frame_of(&host_state, RIN), vec![HOST_SIDE, 1, seed as u8]);
    assert_eq!(
        frame_of(&lobby.client(1).state(), RIN),
        vec![0xC1, 1, seed as u8]
    );
}

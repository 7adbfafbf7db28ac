//! Lobby behavior over lossy and duplicating links.
//!
//! Random faults come from a seeded `ChaosTransport`, so each run sees the same ones.
//! Targeted faults drop exactly one phase-transition datagram and check that host and
//! client still end up in the same phase once it is retransmitted.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use arena_sync::network::messages::MessageKind;
use arena_sync::{ArenaConfig, ArenaEvent, ChaosConfig, ChartHash, JoinStatus, Phase};

use crate::common::{client_addr, Lobby, HOST_ADDR};

const STEP: Duration = Duration::from_millis(100);
const FRAME: Duration = Duration::from_millis(16);
/// Longer than one retry interval at the default settings.
const RETRY_WAIT: Duration = Duration::from_secs(6);

fn patient() -> ArenaConfig {
    ArenaConfig {
        join_timeout: Duration::from_secs(30),
        ..ArenaConfig::default()
    }
}

#[test]
fn lobby_forms_and_agrees_despite_loss() {
    let chaos = ChaosConfig::builder()
        .packet_loss_rate(0.05)
        .duplication_rate(0.02)
        .seed(42)
        .build();
    let mut lobby = Lobby::lossy(patient(), &["h1"], chaos);
    lobby.join("rin", &["h1"]);
    lobby.join("mika", &["h1"]);

    assert!(lobby.run_until(Duration::from_secs(30), STEP, |l| {
        l.clients
            .iter()
            .all(|(_, c)| c.join_status() == JoinStatus::Accepted)
    }));
    assert_eq!(lobby.host.client_ids().len(), 2);

    lobby.host.select_chart(ChartHash::new("h1")).unwrap();
    assert!(lobby.run_until(Duration::from_secs(30), STEP, |l| {
        l.host.state().read().ready_map()[0].1
    }));

    for n in 0..2 {
        lobby.client(n).request_chart(ChartHash::new("h1")).unwrap();
    }
    assert!(lobby.run_until(Duration::from_secs(30), STEP, |l| {
        l.host.phase() == Phase::Loading
    }));
    assert_eq!(lobby.host.client_ids().len(), 2);
    assert_eq!(lobby.host.state().read().chart, ChartHash::new("h1"));

    assert!(lobby.run_until(Duration::from_secs(30), STEP, |l| {
        l.clients.iter().all(|(_, c)| c.phase() == Phase::Loading)
    }));
    let seed = lobby.host.state().read().seed;
    for n in 0..2 {
        assert_eq!(lobby.client(n).state().read().seed, seed);
    }
}

#[test]
fn duplicated_datagrams_are_handled_once() {
    let chaos = ChaosConfig::builder()
        .duplication_rate(0.5)
        .seed(7)
        .build();
    let mut lobby = Lobby::lossy(patient(), &["h1"], chaos);
    lobby.join("rin", &["h1"]);
    lobby.pump();
    assert_eq!(lobby.client(0).join_status(), JoinStatus::Accepted);

    let joined = lobby
        .host_events()
        .into_iter()
        .filter(|e| matches!(e, ArenaEvent::PlayerJoined { .. }))
        .count();
    assert_eq!(joined, 1);
    assert_eq!(lobby.client(0).state().read().participant_count(), 2);

    lobby.host.select_chart(ChartHash::new("h1")).unwrap();
    lobby.pump();
    lobby.client(0).request_chart(ChartHash::new("h1")).unwrap();
    lobby.step(STEP);
    assert_eq!(lobby.client(0).phase(), Phase::Loading);

    lobby.client(0).finish_loading(0).unwrap();
    lobby.host.finish_loading(0).unwrap();
    lobby.step(STEP);
    assert_eq!(lobby.client(0).phase(), Phase::Playing);
    lobby.run_for(Duration::from_secs(1), STEP);

    lobby.client(0).finish_playing().unwrap();
    lobby.host.finish_playing().unwrap();
    lobby.step(STEP);
    assert_eq!(lobby.client(0).phase(), Phase::ResultWait);

    lobby.client(0).finish_result().unwrap();
    lobby.host.finish_result().unwrap();
    lobby.step(STEP);
    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);
    assert_eq!(lobby.client(0).phase(), Phase::LobbyOpen);

    // Nothing stays unacknowledged once the dust settles.
    lobby.step(STEP);
    assert_eq!(lobby.host.pending_sends(arena_sync::ParticipantId::new(1)), 0);
}

/// One client, agreed on `h1` and in LOADING, with nothing lost so far.
fn loading_lobby() -> Lobby {
    let mut lobby = Lobby::new(ArenaConfig::default(), &["h1"]);
    lobby.join("rin", &["h1"]);
    lobby.pump();
    lobby.host.select_chart(ChartHash::new("h1")).unwrap();
    lobby.pump();
    lobby.client(0).request_chart(ChartHash::new("h1")).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.client(0).phase(), Phase::Loading);
    lobby
}

fn playing_lobby() -> Lobby {
    let lobby = loading_lobby();
    lobby.client(0).finish_loading(0).unwrap();
    lobby.host.finish_loading(0).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.client(0).phase(), Phase::Playing);
    lobby
}

fn assert_phases(lobby: &Lobby, phase: Phase) {
    assert_eq!(lobby.host.phase(), phase);
    assert_eq!(lobby.client(0).phase(), phase);
}

#[test]
fn lost_start_time_arrives_after_newer_play_data() {
    let lobby = loading_lobby();
    lobby.client(0).finish_loading(40).unwrap();
    lobby.pump();
    lobby.net.drop_next(client_addr(0), MessageKind::HostFinishedLoading);
    lobby.host.finish_loading(0).unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::Playing);
    assert_eq!(lobby.client(0).phase(), Phase::Loading);

    // Newer play data and heartbeats reach the client before the retry does.
    lobby.run_for(RETRY_WAIT, FRAME);
    assert_phases(&lobby, Phase::Playing);
    assert_eq!(lobby.client(0).state().read().start_delay_ms, Some(40));
}

#[test]
fn lost_finished_playing_from_a_client_still_releases_the_barrier() {
    let lobby = playing_lobby();
    lobby.net.drop_next(HOST_ADDR, MessageKind::ClientFinishedPlaying);
    lobby.client(0).finish_playing().unwrap();
    lobby.host.finish_playing().unwrap();
    lobby.step(FRAME);
    assert_phases(&lobby, Phase::Playing);

    lobby.run_for(RETRY_WAIT, FRAME);
    assert_phases(&lobby, Phase::ResultWait);
}

#[test]
fn lost_end_of_play_reaches_the_client_on_retry() {
    let lobby = playing_lobby();
    lobby.net.drop_next(client_addr(0), MessageKind::HostFinishedPlaying);
    lobby.client(0).finish_playing().unwrap();
    lobby.host.finish_playing().unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::ResultWait);
    assert_eq!(lobby.client(0).phase(), Phase::Playing);

    lobby.run_for(RETRY_WAIT, FRAME);
    assert_phases(&lobby, Phase::ResultWait);
}

#[test]
fn lost_end_of_results_reaches_the_client_on_retry() {
    let lobby = playing_lobby();
    lobby.client(0).finish_playing().unwrap();
    lobby.host.finish_playing().unwrap();
    lobby.step(FRAME);
    assert_phases(&lobby, Phase::ResultWait);

    lobby.net.drop_next(client_addr(0), MessageKind::HostFinishedResult);
    lobby.client(0).finish_result().unwrap();
    lobby.host.finish_result().unwrap();
    lobby.step(FRAME);
    assert_eq!(lobby.host.phase(), Phase::LobbyOpen);
    assert_eq!(lobby.client(0).phase(), Phase::ResultWait);

    lobby.run_for(RETRY_WAIT, FRAME);
    assert_phases(&lobby, Phase::LobbyOpen);
    assert_eq!(lobby.host.pending_sends(arena_sync::ParticipantId::new(1)), 0);
}

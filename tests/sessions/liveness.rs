//! Heartbeats, retry exhaustion and expiry on both sides.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use arena_sync::{ArenaConfig, ArenaEvent, ChartHash, Notice, NoticeKey, ParticipantId, Phase};

use crate::common::{client_addr, Lobby, HOST_ADDR};

const STEP: Duration = Duration::from_millis(100);

fn joined(names: &[&str]) -> Lobby {
    let mut lobby = Lobby::new(ArenaConfig::default(), &["h1"]);
    for name in names {
        lobby.join(name, &["h1"]);
    }
    lobby.pump();
    lobby.host_events();
    for n in 0..names.len() {
        lobby.client_events(n);
    }
    lobby
}

#[test]
fn healthy_session_stays_up() {
    let lobby = joined(&["rin", "mika"]);
    lobby.run_for(Duration::from_secs(120), STEP);

    assert_eq!(lobby.host.client_ids().len(), 2);
    for n in 0..2 {
        assert!(!lobby.client(n).is_expired());
        assert_eq!(lobby.client(n).phase(), Phase::LobbyOpen);
    }
    assert!(!lobby
        .host_events()
        .iter()
        .any(|e| matches!(e, ArenaEvent::PlayerLeft { .. })));
}

#[test]
fn client_expires_once_heartbeats_stop() {
    let lobby = joined(&["rin"]);
    lobby.net.cut(HOST_ADDR);

    // Exactly the liveness timeout is still alive.
    lobby.run_for(Duration::from_secs(30), Duration::from_secs(1));
    assert!(!lobby.client(0).is_expired());
    assert_eq!(lobby.client(0).phase(), Phase::LobbyOpen);

    lobby.step(Duration::from_secs(1));
    assert!(lobby.client(0).is_expired());
    assert_eq!(lobby.client(0).phase(), Phase::Disbanded);
    let events = lobby.client_events(0);
    assert!(events.contains(&ArenaEvent::Expired));
    assert!(events.contains(&ArenaEvent::Notice(Notice::plain(NoticeKey::SessionExpired))));
    assert!(!lobby.client(0).state().read().online);
}

#[test]
fn silent_client_is_swept_after_its_heartbeat_retries() {
    let lobby = joined(&["rin"]);
    lobby.net.cut(client_addr(0));

    // Heartbeat at 5s, retransmitted at 10, 15 and 20s, given up at 25s.
    lobby.run_for(Duration::from_secs(24), STEP);
    assert_eq!(lobby.host.client_ids(), vec![ParticipantId::new(1)]);
    assert_eq!(lobby.host.pending_sends(ParticipantId::new(1)), 1);

    lobby.run_for(Duration::from_secs(2), STEP);
    assert!(lobby.host.client_ids().is_empty());
    let events = lobby.host_events();
    assert!(events.contains(&ArenaEvent::PlayerLeft {
        id: ParticipantId::new(1),
        name: "rin".into(),
    }));
    assert!(events.contains(&ArenaEvent::Notice(Notice::with_text(
        NoticeKey::PlayerTimedOut,
        "rin"
    ))));
    assert_eq!(lobby.host.state().read().participant_count(), 1);
}

#[test]
fn other_clients_see_the_timed_out_player_leave() {
    let lobby = joined(&["rin", "mika"]);
    lobby.net.cut(client_addr(1));
    lobby.run_for(Duration::from_secs(26), STEP);

    assert!(lobby
        .client_events(0)
        .contains(&ArenaEvent::PlayerLeft {
            id: ParticipantId::new(2),
            name: "mika".into(),
        }));
    assert_eq!(
        lobby.client(0).state().read().participants,
        vec![ParticipantId::HOST, ParticipantId::new(1)]
    );
    assert!(!lobby.client(0).is_expired());
}

#[test]
fn unacknowledged_request_expires_the_client() {
    let lobby = joined(&["rin"]);
    lobby.net.cut(HOST_ADDR);
    lobby.client(0).request_chart(ChartHash::new("h1")).unwrap();

    // Sent at 0, retransmitted at 5, 10 and 15s, given up at 20s.
    lobby.run_for(Duration::from_millis(19_900), STEP);
    assert!(!lobby.client(0).is_expired());

    lobby.step(STEP);
    assert!(lobby.client(0).is_expired());
    assert!(lobby.client_events(0).contains(&ArenaEvent::Expired));
}

#[test]
fn disbanded_host_ignores_late_traffic() {
    let lobby = joined(&["rin"]);
    lobby.host.disband();
    lobby.pump();
    assert_eq!(lobby.client(0).phase(), Phase::Disbanded);

    // The client no longer talks, and the closed host stays quiet.
    lobby.run_for(Duration::from_secs(10), STEP);
    assert_eq!(lobby.net.in_flight(), 0);
    assert!(!lobby.host.is_open());
}

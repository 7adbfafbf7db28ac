//! The arena wire message set.
//!
//! Every datagram carries exactly one [`Message`]: a [`MessageKind`] tag, the sender's
//! [`MessageIndex`] and a kind-specific [`MessageBody`]. The byte layout lives in
//! [`codec`](crate::network::codec); this module only defines the shapes.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use crate::{ChartHash, ParticipantId};

/// The wire tag of a message. Values are stable wire constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageKind {
    /// Broadcast lobby discovery probe.
    SeekLobby = 1,
    /// A host's answer to [`SeekLobby`](Self::SeekLobby).
    SeekLobbyReply = 2,
    /// Join request carrying the client's name and build version.
    JoinLobby = 3,
    /// A client leaving voluntarily.
    LeaveLobby = 4,
    /// Host-to-client liveness probe; answered with an [`Ack`](Self::Ack).
    Heartbeat = 5,
    /// A localized notice for the receiver's UI.
    Notice = 6,
    /// The host closed the lobby.
    DisbandLobby = 7,
    /// A participant was added to the roster.
    PlayerJoined = 8,
    /// A participant was removed from the roster.
    PlayerLeft = 9,
    /// A client proposes a chart.
    ClientRequestChart = 10,
    /// The host announces the chart under negotiation; an empty hash resets it.
    HostRequestChart = 11,
    /// The host asks whether the receiver has a chart.
    CheckChartExist = 12,
    /// The host broadcasts everyone's readiness.
    HostReadyStat = 13,
    /// The host starts a round with a seed and chart.
    HostStartPlaying = 14,
    /// A client's packed ruleset init blob.
    ClientPlayInit = 15,
    /// The host relays every known init blob.
    HostPlayInit = 16,
    /// A client finished loading and reports its intended start offset.
    ClientFinishedLoading = 17,
    /// The host releases the loading barrier with a personalized start time.
    HostFinishedLoading = 18,
    /// A client's latest packed frame.
    ClientPlayData = 19,
    /// The host's fan-out of everyone's latest frames.
    HostPlayData = 20,
    /// A client finished playing the chart.
    ClientFinishedPlaying = 21,
    /// The host releases the playing barrier.
    HostFinishedPlaying = 22,
    /// A client left the result screen.
    ClientFinishedResult = 23,
    /// The host releases the result barrier.
    HostFinishedResult = 24,
    /// Generic acknowledgment; its index is the index of the message it acknowledges.
    Ack = 25,
}

impl MessageKind {
    /// Every kind, in tag order.
    pub const ALL: [Self; 25] = [
        Self::SeekLobby,
        Self::SeekLobbyReply,
        Self::JoinLobby,
        Self::LeaveLobby,
        Self::Heartbeat,
        Self::Notice,
        Self::DisbandLobby,
        Self::PlayerJoined,
        Self::PlayerLeft,
        Self::ClientRequestChart,
        Self::HostRequestChart,
        Self::CheckChartExist,
        Self::HostReadyStat,
        Self::HostStartPlaying,
        Self::ClientPlayInit,
        Self::HostPlayInit,
        Self::ClientFinishedLoading,
        Self::HostFinishedLoading,
        Self::ClientPlayData,
        Self::HostPlayData,
        Self::ClientFinishedPlaying,
        Self::HostFinishedPlaying,
        Self::ClientFinishedResult,
        Self::HostFinishedResult,
        Self::Ack,
    ];

    /// Returns the wire tag.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns `true` for kinds that are sent once and never tracked for acknowledgment.
    #[must_use]
    pub const fn is_fire_and_forget(self) -> bool {
        matches!(
            self,
            Self::Ack
                | Self::ClientPlayData
                | Self::HostPlayData
                | Self::DisbandLobby
                | Self::SeekLobby
                | Self::SeekLobbyReply
        )
    }

    /// Returns `true` for kinds that the receiver answers with an [`Ack`](Self::Ack).
    #[must_use]
    pub const fn wants_ack(self) -> bool {
        !self.is_fire_and_forget()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind.as_u8()
    }
}

/// A tag byte with no matching [`MessageKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownKind(pub u8);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind {}", self.0)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownKind;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1..=25 => Self::ALL
                .get(usize::from(tag) - 1)
                .copied()
                .ok_or(UnknownKind(tag)),
            _ => Err(UnknownKind(tag)),
        }
    }
}

/// A sender-local, strictly increasing sequence number.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MessageIndex(i32);

impl MessageIndex {
    /// Creates an index from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(index: i32) -> Self {
        Self(index)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for MessageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result code carried by an [`Ack`]. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// The roster has no free slot.
    LobbyFull = 1,
    /// The sender's endpoint is already a participant.
    DuplicateAddress = 2,
    /// A round is in progress.
    HostIsPlaying = 3,
    /// The sender's build version differs from the host's.
    VersionMismatch = 4,
    /// The host does not have the proposed chart.
    ChartMissing = 5,
    /// The sender is not a participant.
    NotInLobby = 6,
    /// The request is not valid in the current phase.
    WrongPhase = 7,
}

impl ErrorCode {
    /// Returns `true` for [`ErrorCode::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::LobbyFull,
            2 => Self::DuplicateAddress,
            3 => Self::HostIsPlaying,
            4 => Self::VersionMismatch,
            5 => Self::ChartMissing,
            6 => Self::NotInLobby,
            7 => Self::WrongPhase,
            other => return Err(format!("unknown error code {other}")),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::LobbyFull => "the lobby is full",
            Self::DuplicateAddress => "this address is already in the lobby",
            Self::HostIsPlaying => "the host is playing",
            Self::VersionMismatch => "the build versions differ",
            Self::ChartMissing => "the chart is missing",
            Self::NotInLobby => "not in the lobby",
            Self::WrongPhase => "not allowed in the current phase",
        };
        f.write_str(text)
    }
}

/// Identifies the text of a [`Notice`] in the UI's string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum NoticeKey {
    /// `{name}` joined the lobby.
    PlayerJoined,
    /// `{name}` left the lobby.
    PlayerLeft,
    /// `{name}` stopped answering and was removed.
    PlayerTimedOut,
    /// The host rejected our join request; arg is the [`ErrorCode`] value.
    JoinRejected,
    /// The host did not answer the join request.
    JoinTimedOut,
    /// The host closed the lobby.
    LobbyDisbanded,
    /// The connection to the host was lost.
    SessionExpired,
    /// The host does not have the chart that was proposed.
    HostLacksChart,
    /// Participant `{name}` does not have the chart that was proposed.
    PeerLacksChart,
    /// The chart the host asked about is not installed locally.
    ChartMissingLocally,
    /// Everyone has the chart we proposed, but the host has selected `{chart}`. The round
    /// starts on the host's chart.
    HostSelectedOtherChart,
}

/// One substitution value in a [`Notice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeArg {
    /// A string substitution.
    Text(String),
    /// An integer substitution.
    Int(i64),
}

/// A localized, parameterized text event for the notification layer.
///
/// The same struct is the payload of the wire [`MessageKind::Notice`] so the host can
/// address a notice to a single client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Which text to show.
    pub key: NoticeKey,
    /// Zero to two substitutions.
    pub args: SmallVec<[NoticeArg; 2]>,
}

impl Notice {
    /// A notice with no substitutions.
    #[must_use]
    pub fn plain(key: NoticeKey) -> Self {
        Self {
            key,
            args: SmallVec::new(),
        }
    }

    /// A notice with one text substitution.
    #[must_use]
    pub fn with_text(key: NoticeKey, text: impl Into<String>) -> Self {
        let mut args = SmallVec::new();
        args.push(NoticeArg::Text(text.into()));
        Self { key, args }
    }

    /// A notice with one integer substitution.
    #[must_use]
    pub fn with_int(key: NoticeKey, value: i64) -> Self {
        let mut args = SmallVec::new();
        args.push(NoticeArg::Int(value));
        Self { key, args }
    }
}

/// Identity a client sends with [`MessageKind::JoinLobby`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Display name.
    pub name: String,
    /// Protocol/build version; must match the host's exactly.
    pub version: String,
}

/// A host's answer to a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyAdvert {
    /// The host's display name.
    pub name: String,
    /// The port the host listens on.
    pub port: u16,
}

/// A roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// The participant's id.
    pub id: ParticipantId,
    /// The participant's display name.
    pub name: String,
}

/// Payload of [`MessageKind::PlayerLeft`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeft {
    /// The removed participant.
    pub id: ParticipantId,
}

/// The roster a joiner receives in its join acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyRoster {
    /// The id the host assigned to the joiner.
    pub your_id: ParticipantId,
    /// Every participant, host first.
    pub members: Vec<PlayerInfo>,
}

/// A chart hash under negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartProposal {
    /// The proposed chart. Empty means "no chart" (negotiation reset).
    pub chart: ChartHash,
}

/// Payload of [`MessageKind::HostReadyStat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyStat {
    /// Readiness per participant, host included.
    pub ready: Vec<(ParticipantId, bool)>,
}

/// Payload of [`MessageKind::HostStartPlaying`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPlaying {
    /// Shared note-layout seed for this round.
    pub seed: u64,
    /// The agreed chart.
    pub chart: ChartHash,
}

/// An opaque ruleset blob from one sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayBlob {
    /// Packed ruleset bytes.
    pub data: Vec<u8>,
}

/// Opaque ruleset blobs keyed by participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRelay {
    /// One blob per participant.
    pub entries: Vec<(ParticipantId, Vec<u8>)>,
}

/// Payload of [`MessageKind::ClientFinishedLoading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedLoading {
    /// Delay after which this participant intends to start, in milliseconds.
    pub start_offset_ms: i64,
}

/// Payload of [`MessageKind::HostFinishedLoading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTime {
    /// Delay after receipt at which the receiver must start, in milliseconds.
    pub start_ms: i64,
}

/// Extra data carried by an [`Ack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckPayload {
    /// Nothing beyond the code.
    None,
    /// The roster, for a successful join.
    Roster(LobbyRoster),
    /// The answer to a chart existence check.
    ChartExist {
        /// Whether the responder has the chart.
        exist: bool,
    },
}

/// Generic acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The kind of the acknowledged message.
    pub req_kind: MessageKind,
    /// Zero on success, a rejection reason otherwise.
    pub error: ErrorCode,
    /// Kind-specific extra data.
    pub payload: AckPayload,
}

impl Ack {
    /// A successful acknowledgment with no payload.
    #[must_use]
    pub const fn ok(req_kind: MessageKind) -> Self {
        Self {
            req_kind,
            error: ErrorCode::Ok,
            payload: AckPayload::None,
        }
    }

    /// A rejection.
    #[must_use]
    pub const fn rejected(req_kind: MessageKind, error: ErrorCode) -> Self {
        Self {
            req_kind,
            error,
            payload: AckPayload::None,
        }
    }
}

/// The kind-specific part of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// See [`MessageKind::SeekLobby`].
    SeekLobby,
    /// See [`MessageKind::SeekLobbyReply`].
    SeekLobbyReply(LobbyAdvert),
    /// See [`MessageKind::JoinLobby`].
    JoinLobby(JoinRequest),
    /// See [`MessageKind::LeaveLobby`].
    LeaveLobby,
    /// See [`MessageKind::Heartbeat`].
    Heartbeat,
    /// See [`MessageKind::Notice`].
    Notice(Notice),
    /// See [`MessageKind::DisbandLobby`].
    DisbandLobby,
    /// See [`MessageKind::PlayerJoined`].
    PlayerJoined(PlayerInfo),
    /// See [`MessageKind::PlayerLeft`].
    PlayerLeft(PlayerLeft),
    /// See [`MessageKind::ClientRequestChart`].
    ClientRequestChart(ChartProposal),
    /// See [`MessageKind::HostRequestChart`].
    HostRequestChart(ChartProposal),
    /// See [`MessageKind::CheckChartExist`].
    CheckChartExist(ChartProposal),
    /// See [`MessageKind::HostReadyStat`].
    HostReadyStat(ReadyStat),
    /// See [`MessageKind::HostStartPlaying`].
    HostStartPlaying(StartPlaying),
    /// See [`MessageKind::ClientPlayInit`].
    ClientPlayInit(PlayBlob),
    /// See [`MessageKind::HostPlayInit`].
    HostPlayInit(PlayRelay),
    /// See [`MessageKind::ClientFinishedLoading`].
    ClientFinishedLoading(FinishedLoading),
    /// See [`MessageKind::HostFinishedLoading`].
    HostFinishedLoading(StartTime),
    /// See [`MessageKind::ClientPlayData`].
    ClientPlayData(PlayBlob),
    /// See [`MessageKind::HostPlayData`].
    HostPlayData(PlayRelay),
    /// See [`MessageKind::ClientFinishedPlaying`].
    ClientFinishedPlaying,
    /// See [`MessageKind::HostFinishedPlaying`].
    HostFinishedPlaying,
    /// See [`MessageKind::ClientFinishedResult`].
    ClientFinishedResult,
    /// See [`MessageKind::HostFinishedResult`].
    HostFinishedResult,
    /// See [`MessageKind::Ack`].
    Ack(Ack),
}

impl MessageBody {
    /// Returns the wire tag for this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::SeekLobby => MessageKind::SeekLobby,
            Self::SeekLobbyReply(_) => MessageKind::SeekLobbyReply,
            Self::JoinLobby(_) => MessageKind::JoinLobby,
            Self::LeaveLobby => MessageKind::LeaveLobby,
            Self::Heartbeat => MessageKind::Heartbeat,
            Self::Notice(_) => MessageKind::Notice,
            Self::DisbandLobby => MessageKind::DisbandLobby,
            Self::PlayerJoined(_) => MessageKind::PlayerJoined,
            Self::PlayerLeft(_) => MessageKind::PlayerLeft,
            Self::ClientRequestChart(_) => MessageKind::ClientRequestChart,
            Self::HostRequestChart(_) => MessageKind::HostRequestChart,
            Self::CheckChartExist(_) => MessageKind::CheckChartExist,
            Self::HostReadyStat(_) => MessageKind::HostReadyStat,
            Self::HostStartPlaying(_) => MessageKind::HostStartPlaying,
            Self::ClientPlayInit(_) => MessageKind::ClientPlayInit,
            Self::HostPlayInit(_) => MessageKind::HostPlayInit,
            Self::ClientFinishedLoading(_) => MessageKind::ClientFinishedLoading,
            Self::HostFinishedLoading(_) => MessageKind::HostFinishedLoading,
            Self::ClientPlayData(_) => MessageKind::ClientPlayData,
            Self::HostPlayData(_) => MessageKind::HostPlayData,
            Self::ClientFinishedPlaying => MessageKind::ClientFinishedPlaying,
            Self::HostFinishedPlaying => MessageKind::HostFinishedPlaying,
            Self::ClientFinishedResult => MessageKind::ClientFinishedResult,
            Self::HostFinishedResult => MessageKind::HostFinishedResult,
            Self::Ack(_) => MessageKind::Ack,
        }
    }
}

/// One datagram's worth of protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender-local sequence number. For an [`Ack`] this is the acknowledged index.
    pub index: MessageIndex,
    /// The kind-specific payload.
    pub body: MessageBody,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub const fn new(index: MessageIndex, body: MessageBody) -> Self {
        Self { index, body }
    }

    /// Returns the wire tag for this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_their_tags() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::try_from(kind.as_u8()), Ok(kind));
        }
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(MessageKind::SeekLobby.as_u8(), 1);
        assert_eq!(MessageKind::Heartbeat.as_u8(), 5);
        assert_eq!(MessageKind::HostStartPlaying.as_u8(), 14);
        assert_eq!(MessageKind::Ack.as_u8(), 25);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert_eq!(MessageKind::try_from(0), Err(UnknownKind(0)));
        assert_eq!(MessageKind::try_from(26), Err(UnknownKind(26)));
        assert_eq!(MessageKind::try_from(255), Err(UnknownKind(255)));
    }

    #[test]
    fn fire_and_forget_kinds() {
        let untracked: Vec<_> = MessageKind::ALL
            .into_iter()
            .filter(|k| k.is_fire_and_forget())
            .collect();
        assert_eq!(
            untracked,
            vec![
                MessageKind::SeekLobby,
                MessageKind::SeekLobbyReply,
                MessageKind::DisbandLobby,
                MessageKind::ClientPlayData,
                MessageKind::HostPlayData,
                MessageKind::Ack,
            ]
        );
        assert!(MessageKind::Heartbeat.wants_ack());
        assert!(MessageKind::Notice.wants_ack());
    }

    #[test]
    fn error_codes_round_trip_through_u8() {
        for raw in 0..=7u8 {
            let code = ErrorCode::try_from(raw).unwrap();
            assert_eq!(u8::from(code), raw);
        }
        assert!(ErrorCode::try_from(8).is_err());
        assert!(ErrorCode::Ok.is_ok());
        assert!(!ErrorCode::LobbyFull.is_ok());
    }

    #[test]
    fn notice_constructors() {
        let notice = Notice::with_text(NoticeKey::PeerLacksChart, "mika");
        assert_eq!(notice.args.len(), 1);
        assert!(!notice.args.spilled());
        assert_eq!(notice.args[0], NoticeArg::Text("mika".to_owned()));

        let notice = Notice::with_int(NoticeKey::JoinRejected, 1);
        assert_eq!(notice.args[0], NoticeArg::Int(1));

        assert!(Notice::plain(NoticeKey::LobbyDisbanded).args.is_empty());
    }

    #[test]
    fn body_kind_matches_variant() {
        let body = MessageBody::Ack(Ack::ok(MessageKind::Heartbeat));
        assert_eq!(body.kind(), MessageKind::Ack);
        let msg = Message::new(MessageIndex::new(3), MessageBody::HostFinishedResult);
        assert_eq!(msg.kind(), MessageKind::HostFinishedResult);
    }
}

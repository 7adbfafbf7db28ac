//! Structured telemetry for protocol anomalies.
//!
//! Nothing that arrives over the wire is allowed to take a session down. Packets that
//! cannot be decoded, acknowledgments for unknown messages, barrier signals for the wrong
//! phase and similar oddities are reported here as structured [`ArenaViolation`]s and then
//! ignored. Violations can be:
//!
//! - Logged via tracing (the default)
//! - Collected programmatically for testing
//! - Sent to custom observers (metrics, alerting, etc.)
//!
//! # Example
//!
//! ```
//! use arena_sync::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! assert!(!observer.has_violation(ViolationKind::Codec));
//! ```

use crate::ParticipantId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Severity of a protocol violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the offending input was dropped.
    Warning,
    /// Serious issue; a peer was removed or the session degraded.
    Error,
    /// Internal invariant broken; local state may be inconsistent.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// A datagram could not be decoded.
    Codec,
    /// Retry bookkeeping: unknown acknowledgments, expired sends.
    Reliability,
    /// Join/leave handling: rejected joins, messages from unknown senders.
    Roster,
    /// A barrier signal arrived outside its phase or from an unknown participant.
    PhaseBarrier,
    /// The transport failed to send or receive.
    Transport,
    /// Internal logic error (should never happen).
    InternalError,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Codec => "codec",
            Self::Reliability => "reliability",
            Self::Roster => "roster",
            Self::PhaseBarrier => "phase_barrier",
            Self::Transport => "transport",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded protocol violation.
///
/// # Example
///
/// ```
/// use arena_sync::telemetry::{ArenaViolation, ViolationSeverity, ViolationKind};
/// use arena_sync::ParticipantId;
///
/// let violation = ArenaViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::PhaseBarrier,
///     "finished loading outside LOADING",
///     "host.rs:42",
/// )
/// .with_participant(ParticipantId::new(2));
///
/// assert!(violation.to_string().contains("participant=2"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArenaViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The participant involved, if any.
    pub participant: Option<ParticipantId>,
}

impl ArenaViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            participant: None,
        }
    }

    /// Sets the participant involved in this violation.
    #[must_use]
    pub fn with_participant(mut self, participant: ParticipantId) -> Self {
        self.participant = Some(participant);
        self
    }

    /// Serializes this violation to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for ArenaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(participant) = self.participant {
            write!(f, ", participant={participant}")?;
        }
        write!(f, ")")
    }
}

/// Trait for observing protocol violations.
///
/// Observers are shared with the reactor threads, so they must be `Send + Sync`.
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected. Should return quickly.
    fn on_violation(&self, violation: &ArenaViolation);
}

/// Default observer: logs violations via `tracing`, warnings at `WARN` and the rest at
/// `ERROR`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, v: &ArenaViolation) {
        let participant = v.participant.map(ParticipantId::as_u32);
        if v.severity == ViolationSeverity::Warning {
            tracing::warn!(
                kind = v.kind.as_str(),
                location = v.location,
                participant,
                "{}",
                v.message
            );
        } else {
            tracing::error!(
                severity = v.severity.as_str(),
                kind = v.kind.as_str(),
                location = v.location,
                participant,
                "{}",
                v.message
            );
        }
    }
}

/// Observer that stores every violation, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ArenaViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// A snapshot of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ArenaViolation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations of `kind`.
    #[must_use]
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.lock().iter().filter(|v| v.kind == kind).count()
    }

    /// Returns `true` if at least one violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.count(kind) > 0
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ArenaViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a violation to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ArenaViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation with location tracking to the default [`TracingObserver`].
///
/// ```
/// use arena_sync::{report_violation, telemetry::{ViolationSeverity, ViolationKind}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::Codec,
///     "dropped {} undecodable bytes", 3);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ArenaViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ArenaViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Like [`report_violation!`], but routes through an `Option<Arc<dyn ViolationObserver>>`.
/// A leading `participant = id` attaches the participant involved.
///
/// ```
/// use arena_sync::{report_violation_to, telemetry::{ViolationSeverity, ViolationKind, CollectingObserver, ViolationObserver}};
/// use std::sync::Arc;
///
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(Arc::new(CollectingObserver::new()));
/// report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::Roster,
///     "join from {} rejected", "10.0.0.2:52525");
/// report_violation_to!(&observer, participant = arena_sync::ParticipantId::new(1),
///     ViolationSeverity::Warning, ViolationKind::PhaseBarrier, "finished loading twice");
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, participant = $participant:expr, $severity:expr, $kind:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let violation = $crate::telemetry::ArenaViolation::new(
            $severity,
            $kind,
            format!($fmt $(, $arg)*),
            concat!(file!(), ":", line!()),
        )
        .with_participant($participant);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ArenaViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ArenaViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

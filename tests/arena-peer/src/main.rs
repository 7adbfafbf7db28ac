//! Headless arena participant for multi-process testing.
//!
//! Runs one host or one client over real UDP sockets, plays a single round on one chart,
//! and prints a JSON summary as the last line of stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Host waiting for two clients
//! cargo run -p arena-peer -- --port 40100 host --clients 2
//!
//! # Each client
//! cargo run -p arena-peer -- --name rin join --host 127.0.0.1:40100
//! ```
//!
//! # Output
//!
//! ```json
//! {"success": true, "role": "host", "id": 0, "participants": 3, "seed": 1234, "chart": "h1", "start_delay_ms": 40, "error": null}
//! ```

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arena_sync::{
    ArenaBuilder, ArenaClient, ArenaConfig, ArenaError, ArenaHost, ChartHash, ChartStore,
    LocalIdentity, ParticipantId, Phase, Ruleset, RulesetFactory, SharedState,
};
use clap::{Parser, Subcommand};
use serde::Serialize;

const POLL: Duration = Duration::from_millis(5);
const VERSION: &str = "arena-peer-1";

#[derive(Parser)]
struct Opt {
    /// Display name sent in the join handshake.
    #[arg(long, default_value = "peer")]
    name: String,
    /// Hosting port (host) or ignored (join).
    #[arg(long, default_value_t = 0)]
    port: u16,
    /// The chart every participant owns and plays.
    #[arg(long, default_value = "h1")]
    chart: String,
    /// Start offset reported when loading finishes, in milliseconds.
    #[arg(long, default_value_t = 0)]
    offset_ms: i64,
    /// Give up after this many seconds.
    #[arg(long, default_value_t = 20)]
    timeout: u64,
    /// Log at DEBUG instead of WARN.
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Host a lobby and start the round once enough clients joined.
    Host {
        /// Clients to wait for.
        #[arg(long, default_value_t = 1)]
        clients: usize,
    },
    /// Join a hosted lobby.
    Join {
        /// The host's endpoint.
        #[arg(long)]
        host: SocketAddr,
    },
}

/// Printed as the last line of stdout.
#[derive(Debug, Default, Serialize)]
struct PeerResult {
    success: bool,
    role: &'static str,
    id: Option<u32>,
    participants: usize,
    seed: u64,
    chart: String,
    start_delay_ms: Option<i64>,
    error: Option<String>,
}

/// Owns exactly one chart.
struct Library(ChartHash);

impl ChartStore for Library {
    fn has_chart(&self, hash: &ChartHash) -> bool {
        *hash == self.0
    }
}

/// A judge whose blobs name its owner.
struct Judge {
    init: Vec<u8>,
    frame: Vec<u8>,
}

impl Ruleset for Judge {
    fn pack_init(&self) -> Vec<u8> {
        self.init.clone()
    }

    fn unpack_init(&mut self, bytes: &[u8]) {
        self.init = bytes.to_vec();
    }

    fn pack_frame(&self) -> Vec<u8> {
        self.frame.clone()
    }

    fn unpack_frame(&mut self, bytes: &[u8]) {
        self.frame = bytes.to_vec();
    }
}

struct Judges;

impl RulesetFactory for Judges {
    fn create(&self, participant: ParticipantId, seed: u64, _: &ChartHash) -> Box<dyn Ruleset> {
        let owner = participant.as_u32().to_le_bytes().to_vec();
        let mut frame = owner.clone();
        frame.extend_from_slice(&seed.to_le_bytes());
        Box::new(Judge { init: owner, frame })
    }
}

/// Something that needs `update()` every frame.
trait Session {
    fn tick(&self);
    fn phase(&self) -> Phase;
}

impl Session for ArenaHost {
    fn tick(&self) {
        self.update();
    }

    fn phase(&self) -> Phase {
        ArenaHost::phase(self)
    }
}

impl Session for ArenaClient {
    fn tick(&self) {
        self.update();
    }

    fn phase(&self) -> Phase {
        ArenaClient::phase(self)
    }
}

struct Runner {
    deadline: Instant,
}

impl Runner {
    /// Ticks `session` until `done` holds. Fails on timeout or when the session ends.
    fn until(
        &self,
        session: &dyn Session,
        what: &str,
        mut done: impl FnMut() -> bool,
    ) -> Result<(), String> {
        loop {
            session.tick();
            if done() {
                return Ok(());
            }
            if session.phase() == Phase::Disbanded {
                return Err(format!("session ended while waiting for {what}"));
            }
            if Instant::now() >= self.deadline {
                return Err(format!("timed out waiting for {what}"));
            }
            thread::sleep(POLL);
        }
    }

    /// Keeps ticking for `linger` so the last acknowledgments go out.
    fn linger(&self, session: &dyn Session, linger: Duration) {
        let until = Instant::now() + linger;
        while Instant::now() < until {
            session.tick();
            thread::sleep(POLL);
        }
    }
}

fn builder(opt: &Opt) -> ArenaBuilder {
    ArenaBuilder::new()
        .with_config(ArenaConfig::testing())
        .with_identity(LocalIdentity::new(opt.name.clone(), VERSION))
        .with_chart_store(Arc::new(Library(ChartHash::new(opt.chart.clone()))))
        .with_ruleset_factory(Arc::new(Judges))
}

fn snapshot(state: &SharedState, result: &mut PeerResult) {
    let state = state.read();
    result.id = state.local_id.map(ParticipantId::as_u32);
    result.participants = state.participant_count();
    result.seed = state.seed;
    result.chart = state.chart.to_string();
}

fn run_host(opt: &Opt, clients: usize, runner: &Runner) -> Result<PeerResult, String> {
    let host = builder(opt)
        .host_on_port(opt.port)
        .map_err(|e: ArenaError| e.to_string())?;
    let chart = ChartHash::new(opt.chart.clone());
    let mut result = PeerResult {
        role: "host",
        ..PeerResult::default()
    };

    runner.until(&host, "clients", || host.client_ids().len() >= clients)?;
    host.select_chart(chart).map_err(|e| e.to_string())?;
    runner.until(&host, "round start", || host.phase() == Phase::Loading)?;
    snapshot(&host.state(), &mut result);

    host.finish_loading(opt.offset_ms).map_err(|e| e.to_string())?;
    runner.until(&host, "loading barrier", || host.phase() == Phase::Playing)?;
    result.start_delay_ms = host.state().read().start_delay_ms;
    host.finish_playing().map_err(|e| e.to_string())?;
    runner.until(&host, "playing barrier", || host.phase() == Phase::ResultWait)?;
    host.finish_result().map_err(|e| e.to_string())?;
    runner.until(&host, "result barrier", || host.phase() == Phase::LobbyOpen)?;

    runner.linger(&host, Duration::from_millis(500));
    host.disband();
    result.success = true;
    Ok(result)
}

fn run_client(opt: &Opt, addr: SocketAddr, runner: &Runner) -> Result<PeerResult, String> {
    let client = builder(opt).join(addr).map_err(|e| e.to_string())?;
    let chart = ChartHash::new(opt.chart.clone());
    let mut result = PeerResult {
        role: "client",
        ..PeerResult::default()
    };

    let state = client.state();
    // Requesting before the host's own selection settles would take over its proposal.
    runner.until(&client, "host's chart", || {
        let state = state.read();
        let host_ready = state.ready_map().first() == Some(&(ParticipantId::HOST, true));
        host_ready && state.chart == chart
    })?;
    client.request_chart(chart).map_err(|e| e.to_string())?;
    runner.until(&client, "round start", || client.phase() == Phase::Loading)?;
    snapshot(&state, &mut result);

    client.finish_loading(opt.offset_ms).map_err(|e| e.to_string())?;
    runner.until(&client, "loading barrier", || client.phase() == Phase::Playing)?;
    result.start_delay_ms = state.read().start_delay_ms;
    client.finish_playing().map_err(|e| e.to_string())?;
    runner.until(&client, "playing barrier", || {
        client.phase() == Phase::ResultWait
    })?;
    client.finish_result().map_err(|e| e.to_string())?;
    runner.until(&client, "result barrier", || client.phase() == Phase::LobbyOpen)?;

    client.leave();
    result.success = true;
    Ok(result)
}

fn main() {
    let opt = Opt::parse();
    let level = if opt.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(io::stderr)
            .finish(),
    );

    let runner = Runner {
        deadline: Instant::now() + Duration::from_secs(opt.timeout),
    };
    let (role, outcome) = match &opt.role {
        Role::Host { clients } => ("host", run_host(&opt, *clients, &runner)),
        Role::Join { host } => ("client", run_client(&opt, *host, &runner)),
    };
    let result = outcome.unwrap_or_else(|error| PeerResult {
        role,
        error: Some(error),
        ..PeerResult::default()
    });

    let line = serde_json::to_string(&result).unwrap_or_else(|e| {
        format!("{{\"success\":false,\"error\":\"could not serialize result: {e}\"}}")
    });
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
    if !result.success {
        std::process::exit(1);
    }
}

//! Endpoint controller (spec.md §3, §4.2, component C2).
//!
//! Owns one remote subprocess, drives its lifecycle state machine, and
//! translates parsed stdout lines into updates on the shared `FlowStats`.
//! Grounded on `cisco_lab::server::cmd::CmdHandle` (own-a-child,
//! start/stop-by-signal) generalized to the sender/receiver split and the
//! banner/sample/pdf parsing this system needs.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    process::Child,
    sync::Notify,
    task::JoinHandle,
    time::timeout,
};

use crate::{
    config::{FlowSpec, Protocol},
    parser::{LineBuffer, LineClassifier, ParsedEvent, ReceiverClassifier, SenderClassifier},
    ssh::{RemoteError, RemoteSession},
    stats::FlowStatsHandle,
    tos::TosClass,
};

/// Which side of the flow an endpoint controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Receiver,
    Sender,
}

/// Lifecycle state (spec.md §4.2 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Launching,
    Running,
    Stopping,
}

/// Owns one remote measurement-tool subprocess and exposes
/// start/signal-stop/signal-pause/signal-resume primitives.
pub struct EndpointController {
    role: Role,
    session: RemoteSession,
    spec: FlowSpec,
    measurement_tool: String,
    stats: FlowStatsHandle,

    state: State,
    child: Option<Child>,
    remote_pid: Option<u32>,

    opened: Notify,
    closed: Notify,
    /// Shared with the spawned read-loop task, which is the only other
    /// place `traffic_seen` is touched (spec.md §5, as revised for the
    /// multi-task model).
    traffic: Arc<Notify>,
    traffic_seen: Arc<AtomicBool>,

    stdout_buf: LineBuffer,
    stderr_buf: LineBuffer,
}

impl EndpointController {
    pub fn new(
        role: Role,
        session: RemoteSession,
        spec: FlowSpec,
        measurement_tool: impl Into<String>,
        stats: FlowStatsHandle,
    ) -> Self {
        Self {
            role,
            session,
            spec,
            measurement_tool: measurement_tool.into(),
            stats,
            state: State::Idle,
            child: None,
            remote_pid: None,
            opened: Notify::new(),
            closed: Notify::new(),
            traffic: Arc::new(Notify::new()),
            traffic_seen: Arc::new(AtomicBool::new(false)),
            stdout_buf: LineBuffer::new(),
            stderr_buf: LineBuffer::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn remote_pid(&self) -> Option<u32> {
        self.remote_pid
    }

    /// Clear the traffic-seen flag so a later `is_traffic` wait observes only
    /// fresh samples (spec.md §4.3 `isTraffic`).
    pub fn clear_traffic_seen(&mut self) {
        self.traffic_seen.store(false, Ordering::SeqCst);
    }

    pub fn has_seen_traffic(&self) -> bool {
        self.traffic_seen.load(Ordering::SeqCst)
    }

    /// Build the remote command line for this endpoint (spec.md §6).
    fn build_args(&self, port: u16, duration: Duration) -> Vec<String> {
        build_remote_args(self.role, &self.spec, port, duration)
    }

    /// Start the subprocess and wait for its banner to appear. Idempotent: a
    /// no-op unless the controller is currently `closed` (spec.md §4.2).
    pub async fn start(&mut self, port: u16, duration: Duration) -> Result<(), EndpointError> {
        if self.state != State::Idle {
            return Ok(());
        }
        self.remote_pid = None;
        self.state = State::Launching;

        let args = self.build_args(port, duration);
        let mut child = self
            .session
            .spawn_command(&self.measurement_tool, &args)
            .map_err(EndpointError::Remote)?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        self.child = Some(child);

        // drain the banner line from stdout, synchronously, before returning
        // to the caller: `start` suspends until `opened` (spec.md §4.2, §5).
        use tokio::io::AsyncReadExt;
        let classifier: Box<dyn LineClassifier> = match self.role {
            Role::Receiver => Box::new(ReceiverClassifier),
            Role::Sender => Box::new(SenderClassifier),
        };

        let mut chunk = [0u8; 4096];
        loop {
            let n = stdout.read(&mut chunk).await.map_err(RemoteError::Client)?;
            if n == 0 {
                return Err(EndpointError::ClosedBeforeBanner);
            }
            for line in self.stdout_buf.push_chunk(&chunk[..n]) {
                if let ParsedEvent::Open { pid } = classifier.classify(&line, false) {
                    self.remote_pid = Some(pid);
                    self.state = State::Running;
                    self.opened.notify_waiters();
                    log::debug!("[{}] opened with remote pid {}", self.session.name(), pid);
                    // stash the remaining stdout/stderr readers; stdout is
                    // retrieved again by `spawn_read_loop` once the caller
                    // has observed the banner.
                    if let Some(child) = self.child.as_mut() {
                        child.stdout = Some(stdout);
                        child.stderr = Some(stderr);
                    }
                    return Ok(());
                }
            }
            // stderr is logged and otherwise ignored (spec.md §4.1).
            let mut stderr_chunk = [0u8; 4096];
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(1), stderr.read(&mut stderr_chunk)).await
            {
                for line in self.stderr_buf.push_chunk(&stderr_chunk[..n]) {
                    log::trace!("[{}] stderr: {line}", self.session.name());
                }
            }
        }
    }

    /// Take ownership of the subprocess's stdout and spawn an independent
    /// task that reads it to EOF, classifying and applying each line to the
    /// shared `FlowStats` (spec.md §4.2 "Event handling").
    ///
    /// Splitting this out of the controller itself (rather than a `&mut
    /// self` read loop) means the controller stays free to service
    /// `signal_stop`/`signal_pause` while its stdout is being pumped — the
    /// task only touches the `Arc`-shared stats handle and traffic flag, not
    /// the controller. This is this crate's resolution of spec.md §5/§9's
    /// "parallel-threaded implementation" case: each endpoint's read loop is
    /// its own tokio task, synchronized only through `FlowStatsHandle`'s
    /// mutex.
    pub fn spawn_read_loop(&mut self) -> Option<JoinHandle<()>> {
        use tokio::io::AsyncReadExt;

        let stdout = self.child.as_mut().and_then(|c| c.stdout.take())?;
        let role = self.role;
        let stats = self.stats.clone();
        let traffic = self.traffic.clone();
        let traffic_seen = self.traffic_seen.clone();
        let session_name = self.session.name().to_string();

        Some(tokio::spawn(async move {
            let classifier: Box<dyn LineClassifier> = match role {
                Role::Receiver => Box::new(ReceiverClassifier),
                Role::Sender => Box::new(SenderClassifier),
            };
            let mut stdout = stdout;
            let mut buf = LineBuffer::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for line in buf.push_chunk(&chunk[..n]) {
                    handle_line(
                        &*classifier,
                        &line,
                        &stats,
                        &traffic,
                        &traffic_seen,
                        &session_name,
                    )
                    .await;
                }
            }
        }))
    }

    /// Wait for the traffic-seen flag (used by `Flow::is_traffic`).
    pub async fn wait_for_traffic(&self) {
        if self.traffic_seen.load(Ordering::SeqCst) {
            return;
        }
        self.traffic.notified().await;
    }

    /// Signal the remote process to stop (HUP for receivers, INT for
    /// senders), then await the `closed` transition (spec.md §4.2, §6).
    pub async fn signal_stop(&mut self) -> Result<(), EndpointError> {
        let Some(pid) = self.remote_pid else {
            return Ok(());
        };
        let sig = match self.role {
            Role::Receiver => "HUP",
            Role::Sender => "INT",
        };
        self.state = State::Stopping;
        self.session
            .execute_cmd(&["kill", &format!("-{sig}"), &pid.to_string()])
            .await
            .map_err(EndpointError::Remote)?;

        if let Some(mut child) = self.child.take() {
            let _ = timeout(Duration::from_secs(5), child.wait()).await;
        }
        self.remote_pid = None;
        self.state = State::Idle;
        self.closed.notify_waiters();
        Ok(())
    }

    /// Pause the remote process with SIGSTOP; does not await state change.
    pub async fn signal_pause(&self) -> Result<(), EndpointError> {
        self.send_signal("STOP").await
    }

    /// Resume the remote process with SIGCONT; does not await state change.
    pub async fn signal_resume(&self) -> Result<(), EndpointError> {
        self.send_signal("CONT").await
    }

    async fn send_signal(&self, sig: &str) -> Result<(), EndpointError> {
        let Some(pid) = self.remote_pid else {
            return Ok(());
        };
        self.session
            .execute_cmd(&["kill", &format!("-{sig}"), &pid.to_string()])
            .await
            .map_err(EndpointError::Remote)?;
        Ok(())
    }
}

/// Classify and apply one stdout line to the shared `FlowStats`. Free
/// function so it can run from inside the detached read-loop task spawned by
/// [`EndpointController::spawn_read_loop`] without borrowing the controller.
async fn handle_line(
    classifier: &dyn LineClassifier,
    line: &str,
    stats: &FlowStatsHandle,
    traffic: &Notify,
    traffic_seen: &AtomicBool,
    session_name: &str,
) {
    match classifier.classify(line, true) {
        ParsedEvent::ReceiverSample {
            t0,
            bytes,
            throughput,
            reads,
            ..
        } => {
            if !traffic_seen.swap(true, Ordering::SeqCst) {
                traffic.notify_waiters();
            }
            stats.lock().await.record_rx_sample(t0, bytes, throughput, reads);
        }
        ParsedEvent::SenderSample {
            t0,
            bytes,
            throughput,
            writes,
            errwrites,
            retries,
            cwnd,
            rtt,
            ..
        } => {
            if !traffic_seen.swap(true, Ordering::SeqCst) {
                traffic.notify_waiters();
            }
            stats.lock().await.record_tx_sample(
                t0, bytes, throughput, writes, errwrites, retries, cwnd, rtt,
            );
        }
        ParsedEvent::Pdf {
            name,
            binwidth_us,
            population,
            bin_list,
        } => match crate::histogram::Histogram::from_bins(name, binwidth_us, &bin_list) {
            Ok(mut h) => {
                h.population = population.max(h.population);
                {
                    let guard = stats.lock().await;
                    h.start_time = guard.start_time;
                }
                h.end_time = Some(chrono::Utc::now());
                stats.lock().await.record_histogram(h);
            }
            Err(e) => log::warn!("[{session_name}] malformed PDF line: {e}"),
        },
        ParsedEvent::Open { .. } => {
            // post-opened banner echoes are ignored (single-transition guard).
        }
        ParsedEvent::Unmatched => {
            log::info!("[{session_name}] unmatched line: {line}");
        }
    }
}

/// Build the remote command-line arguments for a given role and flow spec
/// (spec.md §6). Free function (rather than a method) so it can be unit
/// tested without an established remote session.
fn build_remote_args(role: Role, spec: &FlowSpec, port: u16, duration: Duration) -> Vec<String> {
    let iperftime = duration.as_secs() + 30;
    let tos = TosClass::from_label(&spec.tos)
        .map(|c| c.tos_hex())
        .unwrap_or("0x0")
        .to_string();

    let mut args = Vec::new();
    match role {
        Role::Receiver => {
            args.push("-s".to_string());
            args.push("-p".to_string());
            args.push(port.to_string());
            args.push("-e".to_string());
            args.push("-t".to_string());
            args.push(iperftime.to_string());
            args.push("-z".to_string());
            args.push("-fb".to_string());
            args.push("-w".to_string());
            args.push(spec.window.clone());
            if spec.interval_secs >= 0.05 {
                args.push("-i".to_string());
                args.push(spec.interval_secs.to_string());
            }
            if matches!(spec.protocol, Protocol::Datagram) {
                args.push("-u".to_string());
                args.push("--udp-histogram".to_string());
                args.push("10u,50000".to_string());
            }
        }
        Role::Sender => {
            args.push("-c".to_string());
            args.push(spec.dest_addr.to_string());
            args.push("-p".to_string());
            args.push(port.to_string());
            args.push("-e".to_string());
            args.push("-t".to_string());
            args.push(iperftime.to_string());
            args.push("-z".to_string());
            args.push("-fb".to_string());
            args.push("-S".to_string());
            args.push(tos);
            args.push("-w".to_string());
            args.push(spec.window.clone());
            if spec.interval_secs >= 0.05 {
                args.push("-i".to_string());
                args.push(spec.interval_secs.to_string());
            }
            match (&spec.protocol, &spec.offered_load) {
                (Protocol::Datagram, Some(load)) => {
                    args.push("-u".to_string());
                    args.push("--isochronous".to_string());
                    args.push(load.clone());
                }
                (_, Some(load)) => {
                    args.push("-b".to_string());
                    args.push(load.clone());
                }
                _ => {}
            }
        }
    }
    args
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("remote session error: {0}")]
    Remote(#[from] RemoteError),
    #[error("subprocess closed its stdout before emitting a banner line")]
    ClosedBeforeBanner,
}

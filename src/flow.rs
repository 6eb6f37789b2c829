//! Flow (spec.md §3, §4.3, component C3).
//!
//! A `Flow` pairs a receiver and a sender `EndpointController` driving the
//! same measurement-tool port, sharing one `FlowStats` record between them.
//! Grounded on `cisco_lab::server::Router`'s pattern of owning a pair of
//! cooperating remote handles behind a single facade.

use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    config::FlowSpec,
    endpoint::{EndpointController, EndpointError, Role},
    ssh::{RemoteError, RemoteSession},
    stats::{self, FlowStatsHandle},
};

/// Minimum interval below which `is_traffic` treats the flow as not worth
/// waiting on (spec.md §4.3: flows with a sub-5ms interval effectively never
/// emit distinguishable samples).
const MIN_TRAFFIC_INTERVAL_SECS: f64 = 0.005;

/// A declared flow, driven end to end: connect, start, confirm traffic,
/// stop.
pub struct Flow {
    spec: FlowSpec,
    measurement_tool: String,
    port: u16,
    stats: FlowStatsHandle,
    receiver: Option<EndpointController>,
    sender: Option<EndpointController>,
    read_tasks: Vec<JoinHandle<()>>,
}

impl Flow {
    /// Construct a flow from its declared spec. Does no I/O: remote sessions
    /// are established lazily on the first `start` (spec.md §4.3 "a flow is
    /// inert until started").
    pub fn new(spec: &FlowSpec, measurement_tool: impl Into<String>) -> Self {
        Self {
            spec: spec.clone(),
            measurement_tool: measurement_tool.into(),
            port: crate::config::allocate_port(),
            stats: stats::new_handle(),
            receiver: None,
            sender: None,
            read_tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &FlowSpec {
        &self.spec
    }

    /// A cloneable handle to this flow's shared stats, for reporting once the
    /// run is complete.
    pub fn stats(&self) -> FlowStatsHandle {
        self.stats.clone()
    }

    async fn ensure_connected(&mut self) -> Result<(), FlowError> {
        if self.receiver.is_none() {
            let dest = format!("{}@{}", self.spec.user, self.spec.receiver_host);
            let session = RemoteSession::new(dest).await?;
            self.receiver = Some(EndpointController::new(
                Role::Receiver,
                session,
                self.spec.clone(),
                self.measurement_tool.clone(),
                self.stats.clone(),
            ));
        }
        if self.sender.is_none() {
            let dest = format!("{}@{}", self.spec.user, self.spec.sender_host);
            let session = RemoteSession::new(dest).await?;
            self.sender = Some(EndpointController::new(
                Role::Sender,
                session,
                self.spec.clone(),
                self.measurement_tool.clone(),
                self.stats.clone(),
            ));
        }
        Ok(())
    }

    /// Start both endpoints (receiver first, so it is listening before the
    /// sender dials in) and spawn their stdout read-loop tasks (spec.md §4.3
    /// `start`). Convenience wrapper for single-flow use; the fleet
    /// coordinator instead calls [`start_receiver`](Self::start_receiver) and
    /// [`start_sender`](Self::start_sender) separately so every flow's
    /// receiver starts before any flow's sender (spec.md §4.4 phase table).
    pub async fn start(&mut self, duration: Duration) -> Result<(), FlowError> {
        self.start_receiver(duration).await?;
        self.start_sender(duration).await?;
        Ok(())
    }

    /// Start this flow's receiver endpoint and spawn its read-loop task.
    pub async fn start_receiver(&mut self, duration: Duration) -> Result<(), FlowError> {
        self.ensure_connected().await?;
        {
            let mut stats = self.stats.lock().await;
            if stats.start_time.is_none() {
                stats.start_time = Some(chrono::Utc::now());
            }
        }
        let receiver = self.receiver.as_mut().expect("connected");
        receiver.start(self.port, duration).await?;
        if let Some(handle) = receiver.spawn_read_loop() {
            self.read_tasks.push(handle);
        }
        Ok(())
    }

    /// Start this flow's sender endpoint and spawn its read-loop task.
    pub async fn start_sender(&mut self, duration: Duration) -> Result<(), FlowError> {
        self.ensure_connected().await?;
        let sender = self.sender.as_mut().expect("connected");
        sender.start(self.port, duration).await?;
        if let Some(handle) = sender.spawn_read_loop() {
            self.read_tasks.push(handle);
        }
        Ok(())
    }

    /// Stop both endpoints (spec.md §4.3 `stop`). Sender first, so it stops
    /// generating traffic before the receiver is told to close. Convenience
    /// wrapper; the fleet coordinator calls
    /// [`stop_sender`](Self::stop_sender) and
    /// [`stop_receiver`](Self::stop_receiver) separately so every flow's
    /// sender stops before any flow's receiver (spec.md §4.4 phase table).
    pub async fn stop(&mut self) -> Result<(), FlowError> {
        self.stop_sender().await?;
        self.stop_receiver().await?;
        Ok(())
    }

    /// Signal-stop this flow's sender endpoint.
    pub async fn stop_sender(&mut self) -> Result<(), FlowError> {
        if let Some(sender) = self.sender.as_mut() {
            sender.signal_stop().await?;
        }
        Ok(())
    }

    /// Signal-stop this flow's receiver endpoint and abort both read-loop
    /// tasks, which have nothing left to read once both endpoints are closed.
    pub async fn stop_receiver(&mut self) -> Result<(), FlowError> {
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.signal_stop().await?;
        }
        for task in self.read_tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    /// Clear both endpoints' traffic-seen flags, then await both endpoints
    /// reporting a fresh sample (spec.md §4.3 `isTraffic`). Flows with a
    /// sub-threshold interval never reliably emit distinguishable samples,
    /// so this is skipped with a warning rather than waited on indefinitely.
    pub async fn is_traffic(&mut self) {
        if self.spec.interval_secs < MIN_TRAFFIC_INTERVAL_SECS {
            log::warn!(
                "[{}] interval {}s is below the traffic-confirmation threshold, skipping wait",
                self.spec.name,
                self.spec.interval_secs
            );
            return;
        }
        let (Some(receiver), Some(sender)) = (self.receiver.as_mut(), self.sender.as_mut()) else {
            return;
        };
        receiver.clear_traffic_seen();
        sender.clear_traffic_seen();

        tokio::join!(receiver.wait_for_traffic(), sender.wait_for_traffic());
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("remote session error: {0}")]
    Remote(#[from] RemoteError),
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Protocol;
    use std::net::Ipv4Addr;

    fn spec(name: &str) -> FlowSpec {
        FlowSpec {
            name: name.to_string(),
            receiver_host: "recv".to_string(),
            sender_host: "send".to_string(),
            dest_addr: Ipv4Addr::new(10, 0, 0, 2),
            protocol: Protocol::Reliable,
            tos: "BE".to_string(),
            interval_secs: 0.5,
            duration_secs: 5,
            offered_load: None,
            window: "128K".to_string(),
            user: "root".to_string(),
        }
    }

    #[test]
    fn new_is_inert_and_allocates_a_port() {
        let flow = Flow::new(&spec("A"), "iperf");
        assert_eq!(flow.name(), "A");
        assert!(flow.receiver.is_none());
        assert!(flow.sender.is_none());
        assert!(flow.port >= 61001);
    }

    #[tokio::test]
    async fn is_traffic_skips_below_threshold_interval() {
        let mut s = spec("A");
        s.interval_secs = 0.001;
        let mut flow = Flow::new(&s, "iperf");
        // No endpoints connected; this must return promptly rather than hang.
        flow.is_traffic().await;
    }
}

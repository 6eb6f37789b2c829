//! Fleet coordinator (spec.md §4.4, component C4): static operations over a
//! set of flows — preclean, staged start with per-phase timeouts, graceful
//! stop, and bulk histogram analysis.
//!
//! Grounded on `cisco_lab::CiscoLab`'s pattern of driving a whole topology's
//! worth of remote sessions through fan-out/fan-in phases, each wrapped in a
//! `tokio::time::timeout`.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    time::Duration,
};

use futures::future::join_all;
use tokio::time::timeout;

use crate::{
    config::FleetConfig,
    error::FleetError,
    flow::Flow,
    histogram::Histogram,
    ks::{self, Comparison},
    ssh::RemoteSession,
};

const PRECLEAN_TIMEOUT: Duration = Duration::from_secs(10);
const RECEIVERS_START_TIMEOUT: Duration = Duration::from_secs(10);
const SENDERS_START_TIMEOUT: Duration = Duration::from_secs(10);
const RAMP_UP: Duration = Duration::from_millis(300);
const TRAFFIC_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);
const SENDERS_STOP_TIMEOUT: Duration = Duration::from_secs(3);
const RECEIVERS_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Drives a set of flows through the staged experiment lifecycle (spec.md
/// §4.4).
pub struct FleetCoordinator {
    config: FleetConfig,
    flows: Vec<Flow>,
}

impl FleetCoordinator {
    pub fn new(config: FleetConfig, flows: Vec<Flow>) -> Self {
        Self { config, flows }
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Dispatch a "kill any stale measurement process" command to every
    /// unique host touched by this fleet's flows, in parallel (spec.md §4.4
    /// "preclean").
    pub async fn preclean(&self) -> Result<(), FleetError> {
        let mut hosts = HashSet::new();
        for flow in &self.flows {
            hosts.insert(flow.spec().receiver_host.clone());
            hosts.insert(flow.spec().sender_host.clone());
        }
        log::info!("preclean: reaching {} unique host(s)", hosts.len());

        let tool = self.config.measurement_tool.clone();
        let jobs = hosts.into_iter().map(|host| {
            let tool = tool.clone();
            async move {
                let session = RemoteSession::new(host).await?;
                session
                    .execute_cmd_status(&["pkill", "-9", "-x", &tool])
                    .await?;
                Ok::<(), crate::ssh::RemoteError>(())
            }
        });

        run_phase("preclean", PRECLEAN_TIMEOUT, jobs).await
    }

    /// Run the full staged experiment: start receivers, start senders, ramp
    /// up, confirm traffic, run for `duration`, then stop senders and
    /// receivers (spec.md §4.4).
    pub async fn run(&mut self, duration: Duration) -> Result<(), FleetError> {
        self.start_receivers(duration).await?;
        self.start_senders(duration).await?;

        if RAMP_UP > Duration::ZERO {
            tokio::time::sleep(RAMP_UP).await;
        }

        self.confirm_traffic().await?;

        log::info!("run body: sleeping for {}s", duration.as_secs());
        tokio::time::sleep(duration).await;

        self.stop_senders().await?;
        self.stop_receivers().await?;
        Ok(())
    }

    async fn start_receivers(&mut self, duration: Duration) -> Result<(), FleetError> {
        let jobs = self
            .flows
            .iter_mut()
            .map(|flow| async move { start_receiver_only(flow, duration).await });
        run_phase("receivers start", RECEIVERS_START_TIMEOUT, jobs).await
    }

    async fn start_senders(&mut self, duration: Duration) -> Result<(), FleetError> {
        let jobs = self
            .flows
            .iter_mut()
            .map(|flow| async move { start_sender_only(flow, duration).await });
        run_phase("senders start", SENDERS_START_TIMEOUT, jobs).await
    }

    async fn confirm_traffic(&mut self) -> Result<(), FleetError> {
        let jobs = self.flows.iter_mut().map(|flow| async move {
            flow.is_traffic().await;
            Ok::<(), FleetError>(())
        });
        run_phase("traffic confirmation", TRAFFIC_CONFIRMATION_TIMEOUT, jobs).await
    }

    async fn stop_senders(&mut self) -> Result<(), FleetError> {
        let jobs = self
            .flows
            .iter_mut()
            .map(|flow| async move { flow.stop_sender().await.map_err(FleetError::from) });
        run_phase("senders stop", SENDERS_STOP_TIMEOUT, jobs).await
    }

    async fn stop_receivers(&mut self) -> Result<(), FleetError> {
        let jobs = self
            .flows
            .iter_mut()
            .map(|flow| async move { flow.stop_receiver().await.map_err(FleetError::from) });
        run_phase("receivers stop", RECEIVERS_STOP_TIMEOUT, jobs).await
    }

    /// Gather every histogram from every flow, grouped by logical name
    /// (spec.md §4.6).
    async fn histograms_by_name(&self) -> HashMap<String, Vec<Histogram>> {
        let mut by_name: HashMap<String, Vec<Histogram>> = HashMap::new();
        for flow in &self.flows {
            let stats = flow.stats();
            let stats = stats.lock().await;
            for name in &stats.histogram_names {
                if let Some(h) = stats.histograms.get(name) {
                    by_name.entry(name.clone()).or_default().push(h.clone());
                }
            }
        }
        by_name
    }

    /// Group every histogram from every flow by logical name and run the KS
    /// comparator over each group (spec.md §4.6).
    pub async fn analyze(&self) -> Vec<(String, Comparison)> {
        self.histograms_by_name()
            .await
            .into_iter()
            .map(|(name, mut histograms)| {
                let cmp = ks::compare(&mut histograms, self.config.critical_p);
                (name, cmp)
            })
            .collect()
    }

    /// Write each histogram's data file and render its plot, grouping by
    /// name and numbering each group's output directory with the dense
    /// `ks_index` the comparator assigns (spec.md §4.6, original
    /// `iperf_flow.plot()`/`flow_histogram.plot_two_sample_ks()`:
    /// `directory + '/' + name + '_' + str(ks_index)`).
    pub async fn render(&self, out_dir: impl AsRef<Path>, format: &str) -> Result<(), FleetError> {
        let out_dir = out_dir.as_ref();
        for (name, mut histograms) in self.histograms_by_name().await {
            ks::compare(&mut histograms, self.config.critical_p);
            for histogram in &mut histograms {
                let index = histogram.ks_index.unwrap_or(0);
                let dir = out_dir.join(format!("{name}_{index}"));
                histogram.write(&dir, &name).await?;
                histogram.async_plot(&dir, format).await?;
            }
        }
        Ok(())
    }
}

/// Race a set of jobs against a phase timeout, returning an error if the
/// timeout elapses or if any individual job fails.
async fn run_phase<F, E>(
    phase: &'static str,
    budget: Duration,
    jobs: impl Iterator<Item = F>,
) -> Result<(), FleetError>
where
    F: std::future::Future<Output = Result<(), E>>,
    E: Into<FleetError>,
{
    log::debug!("phase `{phase}`: starting, budget {}s", budget.as_secs());
    match timeout(budget, join_all(jobs)).await {
        Ok(results) => {
            for r in results {
                r.map_err(Into::into)?;
            }
            log::debug!("phase `{phase}`: complete");
            Ok(())
        }
        Err(_) => {
            log::error!("phase `{phase}`: timed out after {}s", budget.as_secs());
            Err(FleetError::PhaseTimeout {
                phase,
                budget_secs: budget.as_secs(),
            })
        }
    }
}

async fn start_receiver_only(flow: &mut Flow, duration: Duration) -> Result<(), FleetError> {
    flow.start_receiver(duration).await.map_err(FleetError::from)
}

async fn start_sender_only(flow: &mut Flow, duration: Duration) -> Result<(), FleetError> {
    flow.start_sender(duration).await.map_err(FleetError::from)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{FleetConfig, FlowSpec, Protocol};
    use std::net::Ipv4Addr;

    fn spec(name: &str, receiver_host: &str, sender_host: &str) -> FlowSpec {
        FlowSpec {
            name: name.to_string(),
            receiver_host: receiver_host.to_string(),
            sender_host: sender_host.to_string(),
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
    fn preclean_host_set_is_deduplicated() {
        let flows = vec![
            Flow::new(&spec("A", "h1", "h2"), "iperf"),
            Flow::new(&spec("B", "h1", "h3"), "iperf"),
            Flow::new(&spec("C", "h2", "h3"), "iperf"),
        ];
        let mut hosts = HashSet::new();
        for flow in &flows {
            hosts.insert(flow.spec().receiver_host.clone());
            hosts.insert(flow.spec().sender_host.clone());
        }
        // three flows share only two unique hosts between receiver/sender
        // roles (spec.md §8 scenario 4): h1, h2, h3.
        assert_eq!(hosts.len(), 3);
    }

    #[tokio::test]
    async fn analyze_with_no_flows_returns_empty() {
        let coordinator = FleetCoordinator::new(FleetConfig::default(), Vec::new());
        let result = coordinator.analyze().await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn render_writes_a_data_file_per_histogram() {
        let flow = Flow::new(&spec("A", "h1", "h2"), "iperf");
        {
            let stats = flow.stats();
            let mut stats = stats.lock().await;
            // An empty bin-list never crosses the 98th-percentile threshold, so
            // `write` runs but `async_plot` no-ops without needing a real
            // gnuplot binary on the test host (spec.md §7 "degenerate histogram").
            stats.record_histogram(crate::histogram::Histogram::from_bins("L", 10, "").unwrap());
        }
        let coordinator = FleetCoordinator::new(FleetConfig::default(), vec![flow]);

        let dir = tempfile::tempdir().unwrap();
        coordinator.render(dir.path(), "png").await.unwrap();

        assert!(tokio::fs::try_exists(dir.path().join("L_0").join("L.data"))
            .await
            .unwrap());
    }
}

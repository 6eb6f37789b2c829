//! Fleet configuration: the on-disk (TOML) description of flows to run, plus
//! ambient tuning knobs.
//!
//! Grounded on `cisco_lab::config`'s use of `serde` + `toml` to deserialize a
//! fixed-shape configuration file. Unlike the teacher's `CONFIG` (a single
//! process-wide `lazy_static!` read from an environment variable, appropriate
//! for a fixed lab rig), the fleet description varies per invocation, so it is
//! loaded explicitly and threaded through rather than hidden behind a global.

use std::{
    net::Ipv4Addr,
    path::Path,
    sync::atomic::{AtomicU16, Ordering},
};

use lazy_static::lazy_static;
use serde::Deserialize;

use crate::tos::TosClass;

lazy_static! {
    /// Monotonic fleet-wide port counter (spec.md §3: "port auto-allocated from
    /// a monotonic fleet-wide counter starting at 61001"). A single process-wide
    /// singleton is appropriate here, the same way the teacher uses
    /// `lazy_static!` for its `CONFIG`/`VDCS` singletons.
    static ref NEXT_PORT: AtomicU16 = AtomicU16::new(61001);
}

/// Allocate the next fleet-wide port. Strictly monotonic within the process
/// lifetime (spec.md §3 invariant, §8 testable property 7).
pub fn allocate_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Reset the port counter. Only used by tests that need deterministic port
/// numbers across test cases sharing the process.
#[cfg(test)]
pub fn reset_port_counter_for_test(start: u16) {
    NEXT_PORT.store(start, Ordering::SeqCst);
}

/// Transport protocol for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP-like reliable stream.
    Reliable,
    /// UDP-like datagram transport.
    Datagram,
}

/// The on-disk description of a single flow, as read from a fleet TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowSpec {
    /// Logical flow name, used to tag histograms and log lines.
    pub name: String,
    /// Remote SSH destination that will run the receiver.
    pub receiver_host: String,
    /// Remote SSH destination that will run the sender.
    pub sender_host: String,
    /// Destination address the sender connects to (typically the receiver's
    /// reachable address, which may differ from `receiver_host`'s SSH name).
    pub dest_addr: Ipv4Addr,
    pub protocol: Protocol,
    /// Differentiated-services class label (e.g. `"BE"`, `"VO"`).
    #[serde(default = "default_tos")]
    pub tos: String,
    /// Sampling interval, seconds. `0.0` disables interval sampling.
    #[serde(default)]
    pub interval_secs: f64,
    /// Nominal flow duration, seconds.
    pub duration_secs: u64,
    /// Offered load, e.g. `"100M"` bits/sec or an isochronous spec like
    /// `"60/1000/500"` (rate/burst/mtu).
    #[serde(default)]
    pub offered_load: Option<String>,
    /// Socket window size, e.g. `"128K"`.
    #[serde(default = "default_window")]
    pub window: String,
    /// Remote user to run the measurement tool as (defaults to `root`, as the
    /// spec's preclean command does).
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_tos() -> String {
    "BE".to_string()
}

fn default_window() -> String {
    "128K".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

impl FlowSpec {
    pub fn tos_class(&self) -> Option<TosClass> {
        TosClass::from_label(&self.tos)
    }
}

/// Fleet-wide description: a list of flows plus tuning knobs shared across all
/// of them.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetDescription {
    pub flows: Vec<FlowSpec>,
    #[serde(default)]
    pub config: FleetConfig,
}

/// Ambient tuning knobs that apply to the whole fleet run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Path (or bare name, resolved via `$PATH` on the remote host) of the
    /// measurement tool binary.
    pub measurement_tool: String,
    /// `ssh` binary to use as the remote-shell transport.
    pub ssh_binary: String,
    /// Critical p-value for the KS comparator (spec.md §4.6 default `0.01`).
    pub critical_p: f64,
    /// Directory under which histogram data/control/plot files are written.
    pub plot_dir: String,
    /// Output format for the plotter (`png`, `canvas`, or `svg`).
    pub plot_format: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            measurement_tool: "iperf".to_string(),
            ssh_binary: "ssh".to_string(),
            critical_p: 0.01,
            plot_dir: "plots".to_string(),
            plot_format: "png".to_string(),
        }
    }
}

impl FleetDescription {
    /// Load a fleet description from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, crate::FleetError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

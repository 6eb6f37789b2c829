//! Per-flow statistics record (spec.md §3 `FlowStats`).
//!
//! Each endpoint controller runs its own read loop as an independent tokio
//! task (one per subprocess's stdout), so the rendezvous slots and sample
//! arrays are reached from more than one task and need real synchronization;
//! spec.md §9 explicitly sanctions this: "in a parallel-threaded
//! implementation, protect the slot pair with a small mutex". `FlowStatsHandle`
//! is an `Arc<tokio::sync::Mutex<FlowStats>>` shared by both of a flow's
//! endpoint controllers, replacing the source's attribute-forwarding trick
//! with an explicit shared-state reference (§9 design note).

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use crate::histogram::Histogram;

/// Append-only per-sample parallel arrays, plus the cross-pipe rendezvous
/// slots and the growing histogram collection.
#[derive(Debug, Default)]
pub struct FlowStats {
    // transmit side
    pub tx_timestamp: Vec<f64>,
    pub tx_bytes: Vec<u64>,
    pub tx_throughput: Vec<f64>,
    pub tx_writes: Vec<u64>,
    pub tx_errwrites: Vec<u64>,
    pub tx_retries: Vec<u64>,
    pub tx_cwnd: Vec<f64>,
    pub tx_rtt: Vec<f64>,

    // receive side
    pub rx_timestamp: Vec<f64>,
    pub rx_bytes: Vec<u64>,
    pub rx_throughput: Vec<f64>,
    pub rx_reads: Vec<u64>,

    /// Nullable rendezvous slots (spec.md §5): at most one populated at a
    /// time between sample arrivals.
    pub current_rx_bytes: Option<u64>,
    pub current_tx_bytes: Option<u64>,

    /// Most recently computed bytes-ratio between matched rx/tx samples.
    pub flowrate: Option<f64>,

    pub start_time: Option<chrono::DateTime<chrono::Utc>>,

    /// Histograms keyed by logical name, in order of first appearance (order
    /// matters for the KS comparator's dense index assignment).
    pub histogram_names: Vec<String>,
    pub histograms: HashMap<String, Histogram>,
}

impl FlowStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a receiver interval sample. If a sender sample for a matching
    /// interval is waiting in `current_tx_bytes`, compute and store
    /// `flowrate` and clear the slot; otherwise publish into
    /// `current_rx_bytes` and append the sample to the receive arrays.
    ///
    /// Mirrors spec.md §4.2 "Receiver sample (reliable-stream)".
    pub fn record_rx_sample(
        &mut self,
        timestamp: f64,
        bytes: u64,
        throughput: f64,
        reads: u64,
    ) {
        if let Some(tx_bytes) = self.current_tx_bytes.take() {
            if tx_bytes != 0 {
                self.flowrate = Some(round2(bytes as f64 / tx_bytes as f64));
            }
        } else {
            self.current_rx_bytes = Some(bytes);
        }
        self.rx_timestamp.push(timestamp);
        self.rx_bytes.push(bytes);
        self.rx_throughput.push(throughput);
        self.rx_reads.push(reads);
    }

    /// Append a sender interval sample. Symmetric to [`record_rx_sample`],
    /// but transmit-side samples are always recorded regardless of whether
    /// the rendezvous resolved this time (spec.md §4.2 "Sender sample").
    pub fn record_tx_sample(
        &mut self,
        timestamp: f64,
        bytes: u64,
        throughput: f64,
        writes: u64,
        errwrites: u64,
        retries: u64,
        cwnd: f64,
        rtt: f64,
    ) {
        if let Some(rx_bytes) = self.current_rx_bytes.take() {
            if bytes != 0 {
                self.flowrate = Some(round2(rx_bytes as f64 / bytes as f64));
            }
        } else {
            self.current_tx_bytes = Some(bytes);
        }
        self.tx_timestamp.push(timestamp);
        self.tx_bytes.push(bytes);
        self.tx_throughput.push(throughput);
        self.tx_writes.push(writes);
        self.tx_errwrites.push(errwrites);
        self.tx_retries.push(retries);
        self.tx_cwnd.push(cwnd);
        self.tx_rtt.push(rtt);
    }

    /// Insert a new end-of-run histogram, recording its name the first time
    /// it appears (spec.md §3 invariant: "each append also inserts its name
    /// into histogramNames").
    pub fn record_histogram(&mut self, histogram: Histogram) {
        let name = histogram.name.clone();
        if !self.histograms.contains_key(&name) {
            self.histogram_names.push(name.clone());
        }
        self.histograms.insert(name, histogram);
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Shared handle to a flow's stats record, held by both of its endpoint
/// controllers.
pub type FlowStatsHandle = Arc<Mutex<FlowStats>>;

pub fn new_handle() -> FlowStatsHandle {
    Arc::new(Mutex::new(FlowStats::new()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rendezvous_resolves_in_either_order() {
        let mut s = FlowStats::new();
        // tx arrives first, publishes into the slot
        s.record_tx_sample(0.0, 1000, 8000.0, 1, 0, 0, 10.0, 1.0);
        assert_eq!(s.current_tx_bytes, Some(1000));
        assert!(s.current_rx_bytes.is_none());

        // rx arrives second, consumes the slot and clears it
        s.record_rx_sample(0.0, 900, 7200.0, 1);
        assert_eq!(s.current_tx_bytes, None);
        assert!(s.flowrate.is_some());
    }

    #[test]
    fn rendezvous_resolves_rx_first() {
        let mut s = FlowStats::new();
        s.record_rx_sample(0.0, 500, 4000.0, 1);
        assert_eq!(s.current_rx_bytes, Some(500));

        s.record_tx_sample(0.0, 600, 4800.0, 1, 0, 0, 10.0, 1.0);
        assert_eq!(s.current_rx_bytes, None);
        assert!(s.flowrate.is_some());
    }

    #[test]
    fn arrays_grow_in_lockstep() {
        let mut s = FlowStats::new();
        s.record_tx_sample(0.0, 100, 800.0, 1, 0, 0, 10.0, 1.0);
        s.record_tx_sample(1.0, 200, 1600.0, 1, 0, 0, 10.0, 1.0);
        assert_eq!(s.tx_bytes.len(), s.tx_timestamp.len());
        assert_eq!(s.tx_bytes.len(), s.tx_writes.len());
    }

    #[test]
    fn histogram_insertion_tracks_names_once() {
        let mut s = FlowStats::new();
        let h = Histogram::from_bins("A1", 10, "0:1,1:1").unwrap();
        s.record_histogram(h.clone());
        s.record_histogram(h);
        assert_eq!(s.histogram_names, vec!["A1".to_string()]);
        assert_eq!(s.histograms.len(), 1);
    }
}

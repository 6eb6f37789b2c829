use crate::histogram::Histogram;
use crate::ks;
use crate::parser::{LineBuffer, LineClassifier, ParsedEvent, ReceiverClassifier, SenderClassifier};
use crate::stats::FlowStats;

/// A single reliable-stream flow: receiver and sender banners, then a handful
/// of interval samples that rendezvous into a flowrate (spec.md §8 scenario 1).
#[test]
fn single_reliable_stream_flow_rendezvous_and_samples() {
    let receiver = ReceiverClassifier;
    let sender = SenderClassifier;
    let mut rx_stats = FlowStats::new();

    let mut rx_buf = LineBuffer::new();
    let mut rx_opened = false;
    for line in rx_buf.push_chunk(b"Server listening on TCP port 61001 with pid 4242\n") {
        if let ParsedEvent::Open { pid } = receiver.classify(&line, rx_opened) {
            assert_eq!(pid, 4242);
            rx_opened = true;
        }
    }
    assert!(rx_opened);

    let mut tx_opened = false;
    let mut tx_buf = LineBuffer::new();
    for line in tx_buf.push_chunk(b"Client connecting to 10.0.0.2, TCP port 61001 with pid 4243\n") {
        if let ParsedEvent::Open { pid } = sender.classify(&line, tx_opened) {
            assert_eq!(pid, 4243);
            tx_opened = true;
        }
    }
    assert!(tx_opened);

    // Sender sample arrives first, parks in the rendezvous slot.
    for line in tx_buf.push_chunk(b"[  4] 0.0-0.5 sec 625000 Bytes 10000000 bits/sec 431/0 2 128.0K 950 us\n") {
        if let ParsedEvent::SenderSample {
            t0, bytes, throughput, writes, errwrites, retries, cwnd, rtt, ..
        } = sender.classify(&line, tx_opened)
        {
            rx_stats.record_tx_sample(t0, bytes, throughput, writes, errwrites, retries, cwnd, rtt);
        }
    }
    assert_eq!(rx_stats.current_tx_bytes, Some(625000));
    assert!(rx_stats.flowrate.is_none());

    // Matching receiver sample resolves the rendezvous.
    for line in rx_buf.push_chunk(b"[  4] 0.0-0.5 sec 600000 Bytes 9600000 bits/sec 420\n") {
        if let ParsedEvent::ReceiverSample { t0, bytes, throughput, reads, .. } =
            receiver.classify(&line, rx_opened)
        {
            rx_stats.record_rx_sample(t0, bytes, throughput, reads);
        }
    }
    assert!(rx_stats.current_tx_bytes.is_none());
    assert!(rx_stats.flowrate.is_some());
    assert_eq!(rx_stats.rx_bytes, vec![600000]);
    assert_eq!(rx_stats.tx_bytes, vec![625000]);
}

/// A datagram flow whose receiver emits an end-of-run PDF line instead of
/// interval samples (spec.md §8 scenario 2).
#[test]
fn datagram_flow_end_of_run_pdf_becomes_a_histogram() {
    let receiver = ReceiverClassifier;
    let mut buf = LineBuffer::new();
    let mut stats = FlowStats::new();

    for line in buf.push_chunk(
        b"[  3] 0.0-5.0 sec A1(f)-PDF: bin(w=10us):cnt(4)=0:2,1:2 (99.00/99.00/100.00)\n",
    ) {
        if let ParsedEvent::Pdf { name, binwidth_us, population, bin_list } =
            receiver.classify(&line, true)
        {
            let mut h = Histogram::from_bins(name, binwidth_us, &bin_list).unwrap();
            h.population = population.max(h.population);
            stats.record_histogram(h);
        }
    }

    assert_eq!(stats.histogram_names, vec!["A1".to_string()]);
    let h = &stats.histograms["A1"];
    assert_eq!(h.population, 4);
    assert_eq!(h.bins, vec![(0, 2), (1, 2)]);
}

/// Two datagram flows whose histograms are compared: a pair of near-identical
/// distributions should be flagged similar, never `'x'`-suppressed against
/// each other (spec.md §8 scenario 3).
#[test]
fn two_datagram_flows_compare_as_similar() {
    let mut h_a = Histogram::from_bins("A1", 10, "0:50,1:50").unwrap();
    let mut h_b = Histogram::from_bins("A1", 10, "0:48,1:52").unwrap();
    let cmp = ks::compare(std::slice::from_mut(&mut h_a), 0.01);
    assert_eq!(cmp.names.len(), 1);

    let mut pair = [h_a, h_b];
    let cmp = ks::compare(&mut pair, 0.01);
    assert_eq!(cmp.names.len(), 2);
    assert_eq!(cmp.similarity_rows[0], "11");
    assert_eq!(cmp.clusters[0], cmp.clusters[1]);
}

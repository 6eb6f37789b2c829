//! Line stream parser (spec.md §4.1, component C1).
//!
//! Buffers raw bytes per file descriptor, splits off complete lines, and
//! classifies stdout lines via the regex contracts in spec.md §4.1. Compiled
//! once via `lazy_static!`, in the style of
//! `cisco_lab::router::session::bgp`'s line-matching regexes.

use lazy_static::lazy_static;
use regex::Regex;

/// One event extracted from a classified stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    /// Startup banner; carries the remote process id.
    Open { pid: u32 },
    /// A reliable-stream receiver interval sample.
    ReceiverSample {
        t0: f64,
        t1: f64,
        bytes: u64,
        throughput: f64,
        reads: u64,
    },
    /// A reliable-stream sender interval sample.
    SenderSample {
        t0: f64,
        t1: f64,
        bytes: u64,
        throughput: f64,
        writes: u64,
        errwrites: u64,
        retries: u64,
        cwnd: f64,
        rtt: f64,
    },
    /// A datagram receiver's end-of-run histogram line.
    Pdf {
        name: String,
        binwidth_us: u32,
        population: u32,
        bin_list: String,
    },
    /// The line matched none of the known patterns (spec.md §7 "Parse miss").
    Unmatched,
}

lazy_static! {
    static ref RECEIVER_OPEN: Regex =
        Regex::new(r"Server listening on (?P<proto>\S+) port (?P<port>\d+) with pid (?P<pid>\d+)")
            .unwrap();
    static ref SENDER_OPEN: Regex = Regex::new(
        r"Client connecting to (?P<addr>\S+), (?P<proto>\S+) port (?P<port>\d+) with pid (?P<pid>\d+)"
    )
    .unwrap();
    static ref RECEIVER_SAMPLE: Regex = Regex::new(
        r"\[\s*\S+\]\s+(?P<t0>[\d.]+)-(?P<t1>[\d.]+)\s+sec\s+(?P<bytes>\d+)\s+Bytes\s+(?P<throughput>[\d.]+)\s+bits/sec\s+(?P<reads>\d+)\s*$"
    )
    .unwrap();
    static ref SENDER_SAMPLE: Regex = Regex::new(
        r"\[\s*\S+\]\s+(?P<t0>[\d.]+)-(?P<t1>[\d.]+)\s+sec\s+(?P<bytes>\d+)\s+Bytes\s+(?P<throughput>[\d.]+)\s+bits/sec\s+(?P<writes>\d+)/(?P<errwrites>\d+)\s+(?P<retries>\d+)\s+(?P<cwnd>[\d.]+)K\s+(?P<rtt>[\d.]+)\s*us"
    )
    .unwrap();
    static ref PDF_LINE: Regex = Regex::new(
        r"\[\s*\S+\]\s+[\d.]+-[\d.]+\s+sec\s+(?P<name>[A-Za-z0-9_]+)\(f\)-PDF:\s*bin\(w=(?P<binwidth>\d+)us\):cnt\((?P<population>\d+)\)=(?P<pdf>[0-9:,]+)"
    )
    .unwrap();
}

/// Per-endpoint-variant line classification. Receiver and sender share the
/// open-banner/sample-line shapes, differing only in the patterns used
/// (spec.md §4.1: "differ only in the 'open' and 'traffic' patterns").
pub trait LineClassifier {
    /// Classify one complete (newline-stripped) stdout line.
    ///
    /// `opened` gates the banner pattern: once the endpoint has opened, the
    /// banner is never re-matched (spec.md §4.1 "single-transition guard").
    fn classify(&self, line: &str, opened: bool) -> ParsedEvent;
}

/// Classifier for receiver endpoints.
pub struct ReceiverClassifier;

impl LineClassifier for ReceiverClassifier {
    fn classify(&self, line: &str, opened: bool) -> ParsedEvent {
        if !opened {
            if let Some(caps) = RECEIVER_OPEN.captures(line) {
                if let Ok(pid) = caps["pid"].parse() {
                    return ParsedEvent::Open { pid };
                }
            }
            return ParsedEvent::Unmatched;
        }
        if let Some(caps) = PDF_LINE.captures(line) {
            return ParsedEvent::Pdf {
                name: caps["name"].to_string(),
                binwidth_us: caps["binwidth"].parse().unwrap_or_default(),
                population: caps["population"].parse().unwrap_or_default(),
                bin_list: caps["pdf"].to_string(),
            };
        }
        if let Some(caps) = RECEIVER_SAMPLE.captures(line) {
            return ParsedEvent::ReceiverSample {
                t0: caps["t0"].parse().unwrap_or_default(),
                t1: caps["t1"].parse().unwrap_or_default(),
                bytes: caps["bytes"].parse().unwrap_or_default(),
                throughput: caps["throughput"].parse().unwrap_or_default(),
                reads: caps["reads"].parse().unwrap_or_default(),
            };
        }
        ParsedEvent::Unmatched
    }
}

/// Classifier for sender endpoints.
pub struct SenderClassifier;

impl LineClassifier for SenderClassifier {
    fn classify(&self, line: &str, opened: bool) -> ParsedEvent {
        if !opened {
            if let Some(caps) = SENDER_OPEN.captures(line) {
                if let Ok(pid) = caps["pid"].parse() {
                    return ParsedEvent::Open { pid };
                }
            }
            return ParsedEvent::Unmatched;
        }
        // Datagram senders emit no interval records (spec.md §9 open question,
        // preserved as specified): only the reliable-stream pattern applies.
        if let Some(caps) = SENDER_SAMPLE.captures(line) {
            return ParsedEvent::SenderSample {
                t0: caps["t0"].parse().unwrap_or_default(),
                t1: caps["t1"].parse().unwrap_or_default(),
                bytes: caps["bytes"].parse().unwrap_or_default(),
                throughput: caps["throughput"].parse().unwrap_or_default(),
                writes: caps["writes"].parse().unwrap_or_default(),
                errwrites: caps["errwrites"].parse().unwrap_or_default(),
                retries: caps["retries"].parse().unwrap_or_default(),
                cwnd: caps["cwnd"].parse().unwrap_or_default(),
                rtt: caps["rtt"].parse().unwrap_or_default(),
            };
        }
        ParsedEvent::Unmatched
    }
}

/// Buffers raw bytes from one file descriptor and splits off complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk (decoded lossily as UTF-8, matching the source's
    /// "decode as UTF-8" step) and drain complete newline-terminated lines.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn line_buffer_splits_chunks_across_boundaries() {
        let mut buf = LineBuffer::new();
        assert!(buf.push_chunk(b"hello ").is_empty());
        let lines = buf.push_chunk(b"world\nsecond\nthir");
        assert_eq!(lines, vec!["hello world", "second"]);
        let lines = buf.push_chunk(b"d line\n");
        assert_eq!(lines, vec!["third line"]);
    }

    #[test]
    fn receiver_classifies_open_banner() {
        let c = ReceiverClassifier;
        let ev = c.classify(
            "Server listening on TCP port 61001 with pid 1234",
            false,
        );
        assert_eq!(ev, ParsedEvent::Open { pid: 1234 });
    }

    #[test]
    fn receiver_skips_banner_once_opened() {
        let c = ReceiverClassifier;
        let ev = c.classify(
            "Server listening on TCP port 61001 with pid 1234",
            true,
        );
        assert_eq!(ev, ParsedEvent::Unmatched);
    }

    #[test]
    fn sender_classifies_open_banner() {
        let c = SenderClassifier;
        let ev = c.classify(
            "Client connecting to 10.0.0.2, TCP port 61001 with pid 999",
            false,
        );
        assert_eq!(ev, ParsedEvent::Open { pid: 999 });
    }

    #[test]
    fn receiver_classifies_interval_sample() {
        let c = ReceiverClassifier;
        let ev = c.classify(
            "[  4] 0.0-0.5 sec 625000 Bytes 10000000 bits/sec 431",
            true,
        );
        assert_eq!(
            ev,
            ParsedEvent::ReceiverSample {
                t0: 0.0,
                t1: 0.5,
                bytes: 625000,
                throughput: 10000000.0,
                reads: 431,
            }
        );
    }

    #[test]
    fn sender_classifies_interval_sample() {
        let c = SenderClassifier;
        let ev = c.classify(
            "[  4] 0.0-0.5 sec 625000 Bytes 10000000 bits/sec 431/0 2 128.0K 950 us",
            true,
        );
        assert_eq!(
            ev,
            ParsedEvent::SenderSample {
                t0: 0.0,
                t1: 0.5,
                bytes: 625000,
                throughput: 10000000.0,
                writes: 431,
                errwrites: 0,
                retries: 2,
                cwnd: 128.0,
                rtt: 950.0,
            }
        );
    }

    #[test]
    fn receiver_classifies_pdf_line() {
        let c = ReceiverClassifier;
        let ev = c.classify(
            "[  3] 0.0-5.0 sec A1(f)-PDF: bin(w=10us):cnt(4)=0:2,1:2 (...)",
            true,
        );
        assert_eq!(
            ev,
            ParsedEvent::Pdf {
                name: "A1".to_string(),
                binwidth_us: 10,
                population: 4,
                bin_list: "0:2,1:2".to_string(),
            }
        );
    }

    #[test]
    fn unmatched_line_is_reported_as_such() {
        let c = ReceiverClassifier;
        assert_eq!(c.classify("some unrelated log noise", true), ParsedEvent::Unmatched);
    }
}

//! Histogram value object (spec.md §3, §4.5): parses a textual PDF bin-list,
//! computes entropy, and renders data/control files for an external plotter.

use std::{cell::Cell, path::Path, process::Stdio};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

/// 98th-percentile cumulative-fraction threshold used to pick `max` (spec.md
/// §4.5).
const PERCENTILE_THRESHOLD: f64 = 0.98;

/// An end-of-run latency (or similar) histogram reported by a datagram
/// receiver.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub name: String,
    /// Dense index assigned by the KS comparator at comparison time.
    pub ks_index: Option<usize>,
    pub population: u32,
    pub binwidth_us: u32,
    /// Raw `(bin, count)` pairs, in the order they appeared on the wire.
    pub bins: Vec<(u32, u32)>,
    /// Expanded sample array: bin index repeated `count` times, length ==
    /// `population` (spec.md §4.5).
    pub samples: Vec<u32>,
    entropy: Cell<Option<f64>>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// The 98th-percentile bin value in ms; `None` means "do not plot"
    /// (spec.md §7 "Empty/degenerate histogram").
    pub max: Option<f64>,
    pub basefilename: Option<String>,
    pub datafilename: Option<String>,
}

impl Histogram {
    /// Parse a comma-separated `bin:count` list into a histogram.
    ///
    /// `bin_list` looks like `"0:12,1:40,2:8"`.
    pub fn from_bins(
        name: impl Into<String>,
        binwidth_us: u32,
        bin_list: &str,
    ) -> Result<Self, HistogramParseError> {
        let mut bins = Vec::new();
        let mut samples = Vec::new();
        for pair in bin_list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (bin_s, count_s) = pair
                .split_once(':')
                .ok_or_else(|| HistogramParseError::MalformedBin(pair.to_string()))?;
            let bin: u32 = bin_s
                .trim()
                .parse()
                .map_err(|_| HistogramParseError::MalformedBin(pair.to_string()))?;
            let count: u32 = count_s
                .trim()
                .parse()
                .map_err(|_| HistogramParseError::MalformedBin(pair.to_string()))?;
            bins.push((bin, count));
            samples.extend(std::iter::repeat(bin).take(count as usize));
        }
        let population = samples.len() as u32;

        Ok(Self {
            name: name.into(),
            ks_index: None,
            population,
            binwidth_us,
            bins,
            samples,
            entropy: Cell::new(None),
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            max: None,
            basefilename: None,
            datafilename: None,
        })
    }

    /// Shannon entropy in bits over the bin-count distribution, lazily
    /// computed and cached (spec.md §4.5).
    pub fn entropy(&self) -> f64 {
        if let Some(h) = self.entropy.get() {
            return h;
        }
        let population = self.population as f64;
        let h = if population == 0.0 {
            0.0
        } else {
            -self
                .bins
                .iter()
                .map(|(_, count)| *count as f64 / population)
                .filter(|p| *p > 0.0)
                .map(|p| p * p.log2())
                .sum::<f64>()
        };
        self.entropy.set(Some(h));
        h
    }

    /// Convert a bin index to its millisecond value.
    pub fn bin_to_ms(&self, bin: u32) -> f64 {
        bin as f64 * self.binwidth_us as f64 / 1000.0
    }

    /// Write the three-column data file (`ms_value count cumulative_fraction`)
    /// and determine `max`/`basefilename`/`datafilename` as a side effect
    /// (spec.md §4.5).
    pub async fn write(
        &mut self,
        directory: impl AsRef<Path>,
        filename: impl AsRef<str>,
    ) -> Result<(), std::io::Error> {
        let dir = directory.as_ref();
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let data_path = dir.join(format!("{}.data", filename.as_ref()));
        let mut file = tokio::fs::File::create(&data_path).await?;

        let mut cumulative = 0u64;
        let mut max_ms = None;
        let mut sorted_bins = self.bins.clone();
        sorted_bins.sort_by_key(|(bin, _)| *bin);

        for (bin, count) in &sorted_bins {
            cumulative += *count as u64;
            let fraction = if self.population == 0 {
                0.0
            } else {
                cumulative as f64 / self.population as f64
            };
            let ms = self.bin_to_ms(*bin);
            file.write_all(format!("{ms}\t{count}\t{fraction}\n").as_bytes())
                .await?;
            if max_ms.is_none() && fraction > PERCENTILE_THRESHOLD {
                max_ms = Some(ms);
            }
        }
        file.flush().await?;

        self.max = max_ms;
        self.datafilename = Some(format!("{}.data", filename.as_ref()));
        self.basefilename = max_ms.map(|_| filename.as_ref().to_string());
        Ok(())
    }

    /// Step table picking the plot x-range from `max` (spec.md §4.5).
    fn x_range(&self) -> (f64, f64) {
        let max = self.max.unwrap_or(0.0);
        if max < 5.0 {
            (0.0, 5.0)
        } else if max < 10.0 {
            (0.0, 10.0)
        } else if max < 20.0 {
            (0.0, 20.0)
        } else if max < 40.0 {
            (0.0, 40.0)
        } else if max < 50.0 {
            (0.0, 50.0)
        } else if max < 75.0 {
            (0.0, 75.0)
        } else {
            (0.0, 100.0)
        }
    }

    /// Render a gnuplot control file and invoke the external plotter,
    /// awaiting completion (spec.md §4.5, §6).
    pub async fn async_plot(
        &self,
        directory: impl AsRef<Path>,
        format: &str,
    ) -> Result<(), PlotError> {
        let Some(base) = self.basefilename.clone() else {
            log::debug!(
                "[{}] histogram has no basefilename, skipping plot",
                self.name
            );
            return Ok(());
        };
        let dir = directory.as_ref();
        let (x_low, x_high) = self.x_range();
        let out_ext = match format {
            "canvas" | "svg" => "html",
            _ => "png",
        };
        let gpc_path = dir.join(format!("{base}.gpc"));
        let out_path = dir.join(format!("{base}.{out_ext}"));

        let mut control = String::new();
        control.push_str(&format!("set terminal {format}\n"));
        control.push_str(&format!("set output '{}'\n", out_path.display()));
        control.push_str(&format!("set xrange [{x_low}:{x_high}]\n"));
        control.push_str("set yrange [0:1.01]\n");
        control.push_str("set xlabel 'latency (ms)'\n");
        control.push_str("set ylabel 'cumulative fraction'\n");
        control.push_str(&format!(
            "plot '{}' using 1:3 with lines title '{}'\n",
            self.datafilename.clone().unwrap_or_default(),
            self.name
        ));

        tokio::fs::write(&gpc_path, control).await?;

        let status = Command::new("gnuplot")
            .arg(&gpc_path)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(PlotError::PlotterFailed(status.code().unwrap_or(-1)));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum HistogramParseError {
    #[error("malformed bin:count pair `{0}`")]
    MalformedBin(String),
}

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plotter exited with code {0}")]
    PlotterFailed(i32),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_population_and_samples() {
        let h = Histogram::from_bins("A1", 10, "0:2,1:3").unwrap();
        assert_eq!(h.population, 5);
        assert_eq!(h.samples.len(), 5);
        assert_eq!(h.bins, vec![(0, 2), (1, 3)]);
    }

    #[test]
    fn entropy_is_zero_for_single_bin() {
        let h = Histogram::from_bins("A1", 10, "0:1").unwrap();
        assert_eq!(h.entropy(), 0.0);
    }

    #[test]
    fn entropy_is_bounded_by_log2_distinct_bins() {
        let h = Histogram::from_bins("A1", 10, "0:5,1:5,2:5,3:5").unwrap();
        let e = h.entropy();
        assert!(e >= 0.0);
        assert!(e <= (4f64).log2() + 1e-9);
    }

    #[test]
    fn malformed_bin_list_errors() {
        assert!(Histogram::from_bins("A1", 10, "oops").is_err());
    }

    #[tokio::test]
    async fn write_computes_max_and_basefilename() {
        let dir = tempfile::tempdir().unwrap();
        // 100 samples all in a low bin, one far out bin pushes the 98th
        // percentile crossing to a later bin.
        let mut h = Histogram::from_bins("A1", 10, "0:98,5:2").unwrap();
        h.write(dir.path(), "A1_0").await.unwrap();
        assert!(h.max.is_some());
        assert!(h.basefilename.is_some());
        assert!(tokio::fs::try_exists(dir.path().join("A1_0.data"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn degenerate_histogram_still_computes_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Histogram::from_bins("A1", 10, "0:1").unwrap();
        h.write(dir.path(), "A1_0").await.unwrap();
        // single bin crosses 98% immediately -> max == 0.0, not "no plot".
        assert_eq!(h.max, Some(0.0));
        assert!(h.basefilename.is_some());
    }
}

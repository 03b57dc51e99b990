use crate::error::{Error, Result};
use burn::data::dataloader::Progress;
use burn::prelude::*;
use burn::train::ClassificationOutput;
use burn::train::metric::{
    AccuracyMetric, Adaptor, LossMetric, Metric, MetricMetadata, Numeric,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

/// Averaged loss and accuracy over some number of samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub loss: f64,
    /// Fraction of correct predictions, in `[0, 1]`.
    pub accuracy: f64,
    /// Number of samples behind the averages.
    pub samples: usize,
}

/// burn's loss and accuracy metrics, cleared after every report.
///
/// burn averages the loss per batch, which matches a per-sample average
/// because every accumulated batch has the same size.
pub struct MetricsAccumulator<B: Backend> {
    loss: LossMetric<B>,
    accuracy: AccuracyMetric<B>,
    metadata: MetricMetadata,
}

impl<B: Backend> Default for MetricsAccumulator<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> MetricsAccumulator<B> {
    pub fn new() -> Self {
        Self {
            loss: LossMetric::new(),
            accuracy: AccuracyMetric::new(),
            metadata: MetricMetadata {
                progress: Progress::new(0, 0),
                epoch: 1,
                epoch_total: 1,
                iteration: 0,
                lr: None,
            },
        }
    }

    /// Feeds the batch loss and logits to the metrics.
    pub fn update_from_output(&mut self, output: &ClassificationOutput<B>) {
        let [batch_size, _num_classes] = output.output.dims();
        self.metadata.iteration += 1;
        self.metadata.progress.items_processed += batch_size;

        self.loss.update(&output.adapt(), &self.metadata);
        self.accuracy.update(&output.adapt(), &self.metadata);
    }

    /// `None` when nothing was accumulated since the last reset.
    pub fn compute(&self) -> Option<Metrics> {
        if self.count() == 0 {
            return None;
        }
        Some(Metrics {
            loss: self.loss.running_value().current(),
            // burn reports accuracy in percent
            accuracy: self.accuracy.running_value().current() / 100.0,
            samples: self.count(),
        })
    }

    pub fn count(&self) -> usize {
        self.metadata.progress.items_processed
    }

    pub fn reset(&mut self) {
        self.loss.clear();
        self.accuracy.clear();
        self.metadata.iteration = 0;
        self.metadata.progress.items_processed = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricSplit {
    Train,
    Test,
}

/// Metrics recorded at each report, kept for plotting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub train_step: Vec<usize>,
    pub train_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub train_samples: Vec<usize>,
    pub test_step: Vec<usize>,
    pub test_loss: Vec<f64>,
    pub test_accuracy: Vec<f64>,
    pub test_samples: Vec<usize>,
}

impl MetricsHistory {
    pub fn record(&mut self, split: MetricSplit, step: usize, metrics: Metrics) {
        let (steps, losses, accuracies, samples) = match split {
            MetricSplit::Train => (
                &mut self.train_step,
                &mut self.train_loss,
                &mut self.train_accuracy,
                &mut self.train_samples,
            ),
            MetricSplit::Test => (
                &mut self.test_step,
                &mut self.test_loss,
                &mut self.test_accuracy,
                &mut self.test_samples,
            ),
        };
        steps.push(step);
        losses.push(metrics.loss);
        accuracies.push(metrics.accuracy);
        samples.push(metrics.samples);
    }

    pub fn is_empty(&self) -> bool {
        self.train_step.is_empty() && self.test_step.is_empty()
    }

    /// One row per report: `step,split,loss,accuracy,samples`.
    pub fn to_csv(&self) -> String {
        let mut csv = String::from("step,split,loss,accuracy,samples\n");
        let rows = [
            (
                "train",
                &self.train_step,
                &self.train_loss,
                &self.train_accuracy,
                &self.train_samples,
            ),
            (
                "test",
                &self.test_step,
                &self.test_loss,
                &self.test_accuracy,
                &self.test_samples,
            ),
        ];
        for (split, steps, losses, accuracies, samples) in rows {
            let columns = steps.iter().zip(losses).zip(accuracies).zip(samples);
            for (((step, loss), accuracy), samples) in columns {
                let _ = writeln!(csv, "{step},{split},{loss:.6},{accuracy:.6},{samples}");
            }
        }
        csv
    }

    /// Writes `metrics.json` and `metrics.csv` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let json_path = dir.join("metrics.json");
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Record {
            what: "metrics",
            path: json_path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&json_path, json).map_err(|e| Error::io(&json_path, e))?;

        let csv_path = dir.join("metrics.csv");
        std::fs::write(&csv_path, self.to_csv()).map_err(|e| Error::io(&csv_path, e))?;
        tracing::debug!("Saved metrics history into {dir:?}");
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let json_path = dir.join("metrics.json");
        let json = std::fs::read_to_string(&json_path).map_err(|e| Error::io(&json_path, e))?;
        serde_json::from_str(&json).map_err(|e| Error::Record {
            what: "metrics",
            path: json_path,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn output(
        loss: f32,
        logits: [[f32; 2]; 2],
        targets: [i32; 2],
    ) -> ClassificationOutput<TestBackend> {
        let device = Default::default();
        ClassificationOutput::new(
            Tensor::<TestBackend, 1>::from_floats([loss], &device),
            Tensor::<TestBackend, 2>::from_floats(logits, &device),
            Tensor::<TestBackend, 1, Int>::from_ints(targets, &device),
        )
    }

    #[test]
    fn averages_over_batches() {
        let mut acc = MetricsAccumulator::<TestBackend>::new();
        // both right, then both wrong
        acc.update_from_output(&output(1.0, [[1.0, 0.0], [0.0, 1.0]], [0, 1]));
        acc.update_from_output(&output(2.0, [[1.0, 0.0], [0.0, 1.0]], [1, 0]));
        let metrics = acc.compute().unwrap();
        assert!((metrics.loss - 1.5).abs() < 1e-6);
        assert!((metrics.accuracy - 0.5).abs() < 1e-6);
        assert_eq!(metrics.samples, 4);
        assert_eq!(acc.count(), 4);
    }

    #[test]
    fn accuracy_follows_the_argmax() {
        let mut acc = MetricsAccumulator::<TestBackend>::new();
        acc.update_from_output(&output(0.5, [[1.0, 0.0], [0.0, 1.0]], [0, 0]));
        let metrics = acc.compute().unwrap();
        assert!((metrics.loss - 0.5).abs() < 1e-6);
        assert!((metrics.accuracy - 0.5).abs() < 1e-6);
    }

    #[test]
    fn reset_empties_the_accumulator() {
        let mut acc = MetricsAccumulator::<TestBackend>::new();
        assert!(acc.compute().is_none());
        acc.update_from_output(&output(3.0, [[1.0, 0.0], [1.0, 0.0]], [1, 1]));
        acc.reset();
        assert!(acc.compute().is_none());
        assert_eq!(acc.count(), 0);

        // nothing from before the reset leaks into the next report
        acc.update_from_output(&output(0.25, [[1.0, 0.0], [1.0, 0.0]], [0, 0]));
        let metrics = acc.compute().unwrap();
        assert!((metrics.loss - 0.25).abs() < 1e-6);
        assert!((metrics.accuracy - 1.0).abs() < 1e-6);
        assert_eq!(metrics.samples, 2);
    }

    #[test]
    fn history_is_written_as_csv_and_json() {
        let mut history = MetricsHistory::default();
        assert!(history.is_empty());
        let train = Metrics { loss: 0.5, accuracy: 0.8, samples: 64 };
        let test = Metrics { loss: 0.25, accuracy: 0.9, samples: 32 };
        history.record(MetricSplit::Train, 200, train);
        history.record(MetricSplit::Test, 200, test);
        assert!(!history.is_empty());

        assert_eq!(
            history.to_csv(),
            "step,split,loss,accuracy,samples\n\
             200,train,0.500000,0.800000,64\n\
             200,test,0.250000,0.900000,32\n"
        );

        let dir = temp_dir::TempDir::new().unwrap();
        history.save(dir.path()).unwrap();
        assert_eq!(MetricsHistory::load(dir.path()).unwrap(), history);
    }
}

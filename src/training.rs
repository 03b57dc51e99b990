use crate::cli::AppArgs;
use crate::error::{self, Error};
use crate::metrics::{MetricSplit, Metrics, MetricsAccumulator, MetricsHistory};
use crate::mnist::{MnistBatch, MnistBatcher, MnistDataset};
use crate::model::{Cnn, CnnConfig};
use crate::optim::SgdMomentumConfig;
use crate::plot;
use burn::prelude::*;
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub optimizer: SgdMomentumConfig,
    /// Total number of optimizer steps.
    #[config(default = 1200)]
    pub train_steps: usize,
    /// Steps between two evaluations on the test split.
    #[config(default = 200)]
    pub eval_every: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 5e-3)]
    pub lr: f64,
    #[config(default = 0)]
    pub seed: u64,
    /// Where the dataset files are cached. Defaults to `~/.cache/burn-dataset`.
    #[config(default = "None")]
    pub data_dir: Option<PathBuf>,
    /// Cap on the number of full test batches per evaluation. `None` evaluates the whole split.
    #[config(default = "None")]
    pub test_limit: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig::new(SgdMomentumConfig::new())
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.train_steps == 0 {
            return Err(Error::Config("train_steps must be positive".into()));
        }
        if self.eval_every == 0 {
            return Err(Error::Config("eval_every must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::Config(format!(
                "lr must be a positive number, got {}",
                self.lr
            )));
        }
        if self.test_limit == Some(0) {
            return Err(Error::Config("test_limit must be positive when set".into()));
        }
        Ok(())
    }

    /// Whether the train metrics are reported, and the test split evaluated, after `step` (1-based).
    pub fn is_report_step(&self, step: usize) -> bool {
        step % self.eval_every == 0 || step == self.train_steps
    }
}

type Dataloader<B> = Arc<dyn DataLoader<B, MnistBatch<B>>>;

/// Shuffled train loader and ordered test loader.
///
/// The train loader draws a new order from its seeded generator on every pass.
fn dataloaders<AutoB: AutodiffBackend>(
    training_config: &TrainingConfig,
    train: MnistDataset,
    test: MnistDataset,
) -> (Dataloader<AutoB>, Dataloader<AutoB::InnerBackend>) {
    let batcher = MnistBatcher::default();
    let dataloader_train = DataLoaderBuilder::new(batcher.clone())
        .batch_size(training_config.batch_size)
        .shuffle(training_config.seed)
        .num_workers(training_config.num_workers)
        .build(train);
    let dataloader_test = DataLoaderBuilder::new(batcher)
        .batch_size(training_config.batch_size)
        .num_workers(training_config.num_workers)
        .build(test);
    (dataloader_train, dataloader_test)
}

/// Trailing batches shorter than `batch_size` are dropped from both splits.
fn is_full_batch<B: Backend>(batch: &MnistBatch<B>, batch_size: usize) -> bool {
    let [size] = batch.targets.dims();
    if size < batch_size {
        tracing::debug!("Dropping a short batch of {size} items");
        return false;
    }
    true
}

/// Forward, backward and parameter update on a single batch.
///
/// The metrics see the loss and logits computed before the update.
pub fn train_step<AutoB, O>(
    model: Cnn<AutoB>,
    optim: &mut O,
    batch: MnistBatch<AutoB>,
    lr: f64,
    metrics: &mut MetricsAccumulator<AutoB>,
) -> Cnn<AutoB>
where
    AutoB: AutodiffBackend,
    O: Optimizer<Cnn<AutoB>, AutoB>,
{
    let output = model.forward_classification(batch.images, batch.targets);
    metrics.update_from_output(&output);

    let grads = output.loss.backward();
    let grads = GradientsParams::from_grads(grads, &model);
    optim.step(lr, model, grads)
}

/// Forward on a single batch, without any parameter update.
pub fn eval_step<B: Backend>(model: &Cnn<B>, batch: MnistBatch<B>, metrics: &mut MetricsAccumulator<B>) {
    let output = model.forward_classification(batch.images, batch.targets);
    metrics.update_from_output(&output);
}

/// Averaged metrics over the full batches of the test loader, stopping after `limit` of them if set.
pub fn evaluate<B: Backend>(
    dataloader_test: &Dataloader<B>,
    model: &Cnn<B>,
    batch_size: usize,
    limit: Option<usize>,
) -> Option<Metrics> {
    let mut metrics = MetricsAccumulator::new();
    let batches = dataloader_test
        .iter()
        .filter(|batch| is_full_batch(batch, batch_size))
        .take(limit.unwrap_or(usize::MAX));
    for batch in batches {
        eval_step(model, batch, &mut metrics);
    }
    metrics.compute()
}

/// Step-based training loop.
///
/// The train split is shuffled and replayed until `train_steps` steps ran.
/// Batches shorter than `batch_size` are dropped from both splits. See [`TrainingConfig::is_report_step`]
/// for when the test split gets evaluated. `on_report` then receives the model,
/// the optimizer and the history recorded so far.
pub fn fit<AutoB, O, F>(
    training_config: &TrainingConfig,
    mut model: Cnn<AutoB>,
    optim: &mut O,
    train: MnistDataset,
    test: MnistDataset,
    mut on_report: F,
) -> error::Result<(Cnn<AutoB>, MetricsHistory)>
where
    AutoB: AutodiffBackend,
    O: Optimizer<Cnn<AutoB>, AutoB>,
    F: FnMut(usize, &Cnn<AutoB>, &O, &MetricsHistory) -> error::Result<()>,
{
    training_config.validate()?;

    let (dataloader_train, dataloader_test) = dataloaders::<AutoB>(training_config, train, test);

    let mut history = MetricsHistory::default();
    let mut train_metrics = MetricsAccumulator::<AutoB>::new();
    let mut step = 0;

    tracing::info!(
        "Starting training: {} steps over {} train items, batch size {}",
        training_config.train_steps,
        dataloader_train.num_items(),
        training_config.batch_size,
    );
    while step < training_config.train_steps {
        let steps_before_pass = step;
        let batches = dataloader_train
            .iter()
            .filter(|batch| is_full_batch(batch, training_config.batch_size));
        for batch in batches {
            step += 1;
            model = train_step(model, optim, batch, training_config.lr, &mut train_metrics);
            tracing::debug!("step {step}/{}", training_config.train_steps);

            if training_config.is_report_step(step) {
                if let Some(metrics) = train_metrics.compute() {
                    log_metrics("train", step, &metrics);
                    history.record(MetricSplit::Train, step, metrics);
                }
                train_metrics.reset();

                let valid_model = model.valid();
                let test_metrics = evaluate(
                    &dataloader_test,
                    &valid_model,
                    training_config.batch_size,
                    training_config.test_limit,
                );
                if let Some(metrics) = test_metrics {
                    log_metrics("test", step, &metrics);
                    history.record(MetricSplit::Test, step, metrics);
                }

                on_report(step, &model, optim, &history)?;
            }

            if step == training_config.train_steps {
                break;
            }
        }

        if step == steps_before_pass {
            return Err(Error::Config(format!(
                "the train split holds no full batch of {} items",
                training_config.batch_size
            )));
        }
    }
    tracing::info!("Training finished.");

    Ok((model, history))
}

/// Trains from the artifacts directory state, saving the model, the optimizer,
/// the metrics and their plot after every evaluation.
pub fn train<AutoB: AutodiffBackend>(
    training_config: &TrainingConfig,
    model_config: &CnnConfig,
    data_dir: &Path,
    training_device: AutoB::Device,
    app_args: &AppArgs,
) -> error::Result<MetricsHistory> {
    training_config.validate()?;
    AutoB::seed(&training_device, training_config.seed);

    // load (or init and save) model and optim
    let model: Cnn<AutoB> = app_args.load_or_save_model::<AutoB, _>(model_config, &training_device)?;
    let mut optim = app_args
        .load_or_save_optim::<AutoB, Cnn<AutoB>, _>(&training_config.optimizer, &training_device)?;
    tracing::info!("Model has {} parameters", model.num_params());

    let train = MnistDataset::train(data_dir)?;
    let test = MnistDataset::test(data_dir)?;

    let (_model, history) = fit(
        training_config,
        model,
        &mut optim,
        train,
        test,
        |_step, model, optim, history| {
            app_args.save_model::<AutoB>(model)?;
            app_args.save_optim::<AutoB, Cnn<AutoB>>(optim)?;
            history.save(&app_args.artifacts_path)?;
            plot::save_svg(
                &app_args.artifacts_path.join("metrics.svg"),
                &plot::render_history_svg(history),
            )
        },
    )?;

    Ok(history)
}

fn log_metrics(split: &str, step: usize, metrics: &Metrics) {
    tracing::info!(
        "[{split}] step: {step}, loss: {:.4}, accuracy: {:.2}",
        metrics.loss,
        metrics.accuracy * 100.0,
    );
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mnist::dataset::tests::write_cached_split;
    use crate::mnist::{HEIGHT, MnistItem, Split, WIDTH};
    use crate::model::CnnConfig;
    use crate::optim::CnnOptim;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataloader::batcher::Batcher;
    use burn::data::dataset::Dataset;
    use std::ffi::OsString;

    type TestBackend = NdArray<f32>;
    type TestAutoBackend = Autodiff<TestBackend>;

    fn tiny_model_config() -> CnnConfig {
        CnnConfig::new()
            .with_conv1_channels(2)
            .with_conv2_channels(2)
            .with_hidden_size(8)
    }

    /// Digit `label` drawn as a bright horizontal band at a label-dependent row.
    fn synthetic_raw(count: usize) -> (Vec<Vec<u8>>, Vec<u8>) {
        let mut images = Vec::with_capacity(count);
        let mut labels = Vec::with_capacity(count);
        for i in 0..count {
            let label = (i % 2) as u8;
            let mut image = vec![0u8; WIDTH * HEIGHT];
            let row = 4 + 16 * label as usize;
            for pixel in &mut image[row * WIDTH..(row + 4) * WIDTH] {
                *pixel = 255;
            }
            images.push(image);
            labels.push(label);
        }
        (images, labels)
    }

    fn synthetic_split(count: usize) -> MnistDataset {
        let (images, labels) = synthetic_raw(count);
        MnistDataset::from_raw(images, labels).unwrap()
    }

    /// Item `i` has `i` as its first pixel.
    fn indexed_split(count: usize) -> MnistDataset {
        let images = (0..count)
            .map(|i| {
                let mut image = vec![0u8; WIDTH * HEIGHT];
                image[0] = i as u8;
                image
            })
            .collect();
        let labels = (0..count).map(|i| (i % 10) as u8).collect();
        MnistDataset::from_raw(images, labels).unwrap()
    }

    /// Item indices in the order one pass of `loader` yields them.
    fn pass_order<B: Backend>(loader: &Dataloader<B>) -> Vec<usize> {
        let mut order = Vec::new();
        for batch in loader.iter() {
            let [batch_size, ..] = batch.images.dims();
            let first_pixels = batch
                .images
                .slice([0..batch_size, 0..1, 0..1, 0..1])
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .unwrap();
            order.extend(first_pixels.iter().map(|p| (p * 255.0).round() as usize));
        }
        order
    }

    fn batch_of<B: Backend>(items: &[MnistItem], device: &B::Device) -> MnistBatch<B> {
        MnistBatcher::default().batch(items.to_vec(), device)
    }

    fn first_items(count: usize) -> Vec<MnistItem> {
        let dataset = synthetic_split(count);
        (0..count).filter_map(|i| dataset.get(i)).collect()
    }

    fn tiny_training_config() -> TrainingConfig {
        TrainingConfig::new(SgdMomentumConfig::new())
            .with_train_steps(5)
            .with_eval_every(2)
            .with_batch_size(4)
            .with_num_workers(1)
            .with_lr(1e-2)
    }

    fn tiny_optim(config: &TrainingConfig) -> CnnOptim<TestAutoBackend> {
        config.optimizer.init::<TestAutoBackend>()
    }

    #[test]
    fn default_config_matches_the_walkthrough() {
        let config = TrainingConfig::default();
        assert_eq!(config.train_steps, 1200);
        assert_eq!(config.eval_every, 200);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.lr, 5e-3);
        assert_eq!(config.optimizer.momentum, 0.9);
        assert!(!config.optimizer.nesterov);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let base = tiny_training_config();
        assert!(base.clone().with_train_steps(0).validate().is_err());
        assert!(base.clone().with_eval_every(0).validate().is_err());
        assert!(base.clone().with_batch_size(0).validate().is_err());
        assert!(base.clone().with_lr(0.0).validate().is_err());
        assert!(base.clone().with_lr(f64::NAN).validate().is_err());
        assert!(base.clone().with_test_limit(Some(0)).validate().is_err());
        assert!(base.validate().is_ok());
    }

    #[test]
    fn reports_at_every_interval_and_at_the_end() {
        let config = tiny_training_config();
        let steps: Vec<usize> = (1..=config.train_steps)
            .filter(|step| config.is_report_step(*step))
            .collect();
        assert_eq!(steps, vec![2, 4, 5]);

        let config = config.with_train_steps(6);
        let steps: Vec<usize> = (1..=6).filter(|step| config.is_report_step(*step)).collect();
        assert_eq!(steps, vec![2, 4, 6]);
    }

    #[test]
    fn repeated_steps_reduce_the_loss_on_one_batch() {
        let device = Default::default();
        TestAutoBackend::seed(&device, 0);
        let config = tiny_training_config();
        let mut model: Cnn<TestAutoBackend> = tiny_model_config().init(&device);
        let mut optim = tiny_optim(&config);

        let items = first_items(4);

        let mut first = MetricsAccumulator::new();
        model = train_step(model, &mut optim, batch_of(&items, &device), 2e-2, &mut first);
        for _ in 0..30 {
            let mut metrics = MetricsAccumulator::new();
            model = train_step(model, &mut optim, batch_of(&items, &device), 2e-2, &mut metrics);
        }
        let mut last = MetricsAccumulator::new();
        eval_step::<TestBackend>(&model.valid(), batch_of(&items, &device), &mut last);

        assert!(last.compute().unwrap().loss < first.compute().unwrap().loss);
    }

    #[test]
    fn evaluation_leaves_parameters_untouched() {
        let device = Default::default();
        let model: Cnn<TestBackend> = tiny_model_config().init(&device);
        let before = model.linear2.weight.val().into_data();

        let batch: MnistBatch<TestBackend> = batch_of(&first_items(4), &device);
        let mut metrics = MetricsAccumulator::new();
        eval_step(&model, batch, &mut metrics);

        assert_eq!(metrics.count(), 4);
        model.linear2.weight.val().into_data().assert_eq(&before, true);
    }

    #[test]
    fn evaluation_drops_the_short_batch_and_honors_the_limit() {
        let device = Default::default();
        let model: Cnn<TestBackend> = tiny_model_config().init(&device);
        // 14 items with batches of 4: three full batches and a short one of 2
        let loader: Dataloader<TestBackend> = DataLoaderBuilder::new(MnistBatcher::default())
            .batch_size(4)
            .build(synthetic_split(14));

        let all = evaluate(&loader, &model, 4, None).unwrap();
        assert_eq!(all.samples, 12);
        let limited = evaluate(&loader, &model, 4, Some(2)).unwrap();
        assert_eq!(limited.samples, 8);

        let too_small: Dataloader<TestBackend> = DataLoaderBuilder::new(MnistBatcher::default())
            .batch_size(4)
            .build(synthetic_split(3));
        assert!(evaluate(&too_small, &model, 4, None).is_none());
    }

    #[test]
    fn train_loader_reshuffles_every_pass_from_the_seed() {
        let config = tiny_training_config().with_batch_size(16).with_seed(7);
        let (loader, _) =
            dataloaders::<TestAutoBackend>(&config, indexed_split(16), indexed_split(4));
        let first = pass_order(&loader);
        let second = pass_order(&loader);

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
        assert_ne!(first, second);

        // same seed, same sequence of orders
        let (replay, _) =
            dataloaders::<TestAutoBackend>(&config, indexed_split(16), indexed_split(4));
        assert_eq!(pass_order(&replay), first);
        assert_eq!(pass_order(&replay), second);

        // the test loader keeps the split order
        let (_, test_loader) =
            dataloaders::<TestAutoBackend>(&config, indexed_split(16), indexed_split(16));
        assert_eq!(pass_order(&test_loader), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn fit_records_one_entry_per_report() {
        let device = Default::default();
        let config = tiny_training_config();
        let model: Cnn<TestAutoBackend> = tiny_model_config().init(&device);
        let mut optim = tiny_optim(&config);

        let mut reported = Vec::new();
        // 10 train items with batches of 4: every pass drops a short batch of 2,
        // and 6 test items leave a single full batch
        let (_model, history) = fit(
            &config,
            model,
            &mut optim,
            synthetic_split(10),
            synthetic_split(6),
            |step, _model, _optim, history| {
                reported.push((step, history.test_step.len()));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(reported, vec![(2, 1), (4, 2), (5, 3)]);
        assert_eq!(history.train_step, vec![2, 4, 5]);
        assert_eq!(history.test_step, vec![2, 4, 5]);
        // two full batches per report, then the single last step
        assert_eq!(history.train_samples, vec![8, 8, 4]);
        assert_eq!(history.test_samples, vec![4, 4, 4]);
        assert!(history.train_accuracy.iter().all(|a| (0.0..=1.0).contains(a)));
        assert!(history.test_loss.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn fit_fails_without_a_full_batch() {
        let device = Default::default();
        let config = tiny_training_config();
        let model: Cnn<TestAutoBackend> = tiny_model_config().init(&device);
        let mut optim = tiny_optim(&config);
        let result = fit(
            &config,
            model,
            &mut optim,
            synthetic_split(3),
            synthetic_split(3),
            |_, _, _, _| Ok(()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn train_saves_artifacts_at_every_report() {
        let data_dir = temp_dir::TempDir::new().unwrap();
        let (images, labels) = synthetic_raw(8);
        write_cached_split(data_dir.path(), Split::Train, &images, &labels);
        write_cached_split(data_dir.path(), Split::Test, &images, &labels);

        let artifacts = temp_dir::TempDir::new().unwrap();
        let args = vec![
            OsString::from("-a"),
            artifacts.path().as_os_str().to_owned(),
        ];
        let app_args = AppArgs::from_vec(args).unwrap();
        app_args.create_artifact_dir().unwrap();

        let config = tiny_training_config().with_train_steps(3);
        let history = train::<TestAutoBackend>(
            &config,
            &tiny_model_config(),
            data_dir.path(),
            Default::default(),
            &app_args,
        )
        .unwrap();
        assert_eq!(history.test_step, vec![2, 3]);

        for name in ["model.mpk", "optim.mpk", "metrics.json", "metrics.csv", "metrics.svg"] {
            assert!(artifacts.path().join(name).exists(), "missing {name}");
        }
        // the last report left the final history on disk
        assert_eq!(MetricsHistory::load(artifacts.path()).unwrap(), history);
        let csv = std::fs::read_to_string(artifacts.path().join("metrics.csv")).unwrap();
        assert_eq!(csv.lines().count(), 1 + 2 * 2);
    }
}

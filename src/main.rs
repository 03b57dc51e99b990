use anyhow::Context;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use mnist_cnn::{
    backend::{MainAutoBackend, MainBackend, MainDevice},
    cli::{AppArgs, HELP},
    inference,
    mnist::MnistDataset,
    model::CnnConfig,
    training::{self, TrainingConfig},
};
use tracing_subscriber::EnvFilter;

/// Number of test images shown in the predictions grid.
const PREDICTION_COUNT: usize = 25;

pub fn launch<B, AutoB>(app_args: &AppArgs) -> anyhow::Result<()>
where
    B: Backend + MainDevice,
    AutoB: AutodiffBackend + MainDevice,
{
    app_args.create_artifact_dir()?;

    // setup training and model configs
    let training_config = app_args
        .load_training_config::<TrainingConfig>()?
        .unwrap_or_default();
    let model_config = app_args
        .load_model_config::<CnnConfig>()?
        .unwrap_or_else(CnnConfig::new);
    training_config.validate()?;
    // save configs
    app_args.save_training_config(&training_config)?;
    app_args.save_model_config(&model_config)?;

    let data_dir = match &training_config.data_dir {
        Some(dir) => dir.clone(),
        None => MnistDataset::default_data_dir()?,
    };

    if app_args.training {
        let training_device = AutoB::main_device();
        let history = training::train::<AutoB>(
            &training_config,
            &model_config,
            &data_dir,
            training_device,
            app_args,
        )
        .context("training failed")?;
        if let (Some(loss), Some(accuracy)) = (history.test_loss.last(), history.test_accuracy.last()) {
            tracing::info!(
                "final test loss: {loss:.4}, test accuracy: {:.2}",
                accuracy * 100.0
            );
        }
    }

    if app_args.inference {
        let infer_device = B::main_device();
        inference::infer::<B>(
            &model_config,
            &data_dir,
            PREDICTION_COUNT,
            infer_device,
            app_args,
        )
        .context("inference failed")?;
    }

    if !app_args.inference && !app_args.training {
        tracing::warn!("neither training nor inference were enabled");
        println!("{HELP}");
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mnist_cnn=info")),
        )
        .init();

    let app_args = AppArgs::parse().context("failed to parse the arguments")?;
    if app_args.help {
        println!("{HELP}");
        return Ok(());
    }
    tracing::info!("artifacts directory: {:?}", app_args.artifacts_path);

    launch::<MainBackend, MainAutoBackend>(&app_args)
}

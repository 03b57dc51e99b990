use crate::cli::AppArgs;
use crate::error::{Error, Result};
use crate::mnist::{MnistBatcher, MnistDataset, MnistItem};
use crate::model::{Cnn, CnnConfig};
use crate::plot;
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
    tensor::Element,
};
use std::path::Path;

/// Most likely class for each image.
///
/// # Shapes
///   - Input [batch, 1, HEIGHT, WIDTH]
///   - Output [batch]
pub fn pred_step<B: Backend>(model: &Cnn<B>, images: Tensor<B, 4>) -> Tensor<B, 1, Int> {
    model.forward(images).argmax(1).squeeze_dim(1)
}

/// Predictions next to the true labels, in item order.
pub struct Predictions {
    /// Brightness of each image, scaled into `[0, 1]`.
    pub images: Vec<Vec<f32>>,
    pub predicted: Vec<usize>,
    pub labels: Vec<usize>,
}

impl Predictions {
    pub fn correct(&self) -> usize {
        self.predicted
            .iter()
            .zip(&self.labels)
            .filter(|(p, l)| p == l)
            .count()
    }
}

/// Values held by `data`, whose element type must already be `E`.
pub(crate) fn tensor_values<E: Element>(data: TensorData) -> Result<Vec<E>> {
    data.to_vec::<E>()
        .map_err(|e| Error::TensorData(format!("{e:?}")))
}

pub fn predict<B: Backend>(
    model: &Cnn<B>,
    items: Vec<MnistItem>,
    device: &B::Device,
) -> Result<Predictions> {
    let labels = items.iter().map(|item| item.label as usize).collect();
    let batch = MnistBatcher::default().batch(items, device);

    let pixels = tensor_values::<f32>(batch.images.clone().into_data().convert::<f32>())?;
    let images = pixels
        .chunks(crate::mnist::HEIGHT * crate::mnist::WIDTH)
        .map(<[f32]>::to_vec)
        .collect();
    let predicted = tensor_values::<i64>(pred_step(model, batch.images).into_data().convert::<i64>())?
        .into_iter()
        .map(|p| p as usize)
        .collect();

    Ok(Predictions {
        images,
        predicted,
        labels,
    })
}

/// Predicts the first `count` test images with the saved model and plots them.
pub fn infer<B: Backend>(
    model_config: &CnnConfig,
    data_dir: &Path,
    count: usize,
    device: B::Device,
    app_args: &AppArgs,
) -> Result<Predictions> {
    let model: Cnn<B> = app_args
        .load_model::<B, _>(model_config, &device)?
        .ok_or_else(|| {
            Error::Config(format!(
                "no trained model in {:?}; run with --training first",
                app_args.artifacts_path
            ))
        })?;

    let dataset = MnistDataset::test(data_dir)?;
    let items: Vec<MnistItem> = dataset.iter().take(count).collect();
    let predictions = predict(&model, items, &device)?;

    tracing::info!("predicted/expected:");
    for (predicted, label) in predictions.predicted.iter().zip(&predictions.labels) {
        tracing::info!("- {predicted}/{label}");
    }
    tracing::info!(
        "{}/{} predictions are correct",
        predictions.correct(),
        predictions.labels.len()
    );

    let svg = plot::render_predictions_svg(
        &predictions.images,
        &predictions.predicted,
        &predictions.labels,
        5,
    );
    plot::save_svg(&app_args.artifacts_path.join("predictions.svg"), &svg)?;

    Ok(predictions)
}

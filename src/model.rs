use crate::mnist::{HEIGHT, NUM_CLASSES, WIDTH};
use burn::{
    nn::{
        Linear, LinearConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AvgPool2d, AvgPool2dConfig},
    },
    prelude::*,
    train::ClassificationOutput,
};

pub trait ModelConfigExt<B: Backend>: Config {
    type Model: Module<B>;
    fn init(&self, device: &B::Device) -> Self::Model;
}

/// Small convolutional classifier for `[batch, 1, HEIGHT, WIDTH]` images.
///
/// Two `SAME`-padded convolutions, each followed by a ReLU and a 2x2 average pooling,
/// then two dense layers producing one logit per class.
#[derive(Config, Debug)]
pub struct CnnConfig {
    #[config(default = "NUM_CLASSES")]
    pub num_classes: usize,
    #[config(default = 32)]
    pub conv1_channels: usize,
    #[config(default = 64)]
    pub conv2_channels: usize,
    #[config(default = 256)]
    pub hidden_size: usize,
    /// Must be odd so that `SAME` padding keeps the spatial size.
    #[config(default = 3)]
    pub kernel_size: usize,
}

impl CnnConfig {
    /// Number of features entering the first dense layer.
    pub fn flat_features(&self) -> usize {
        // each pooling halves both spatial dims
        self.conv2_channels * (HEIGHT / 4) * (WIDTH / 4)
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Cnn<B> {
        assert_eq!(self.kernel_size % 2, 1, "kernel_size must be odd");
        let kernel = [self.kernel_size, self.kernel_size];
        let conv1 = Conv2dConfig::new([1, self.conv1_channels], kernel)
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let conv2 = Conv2dConfig::new([self.conv1_channels, self.conv2_channels], kernel)
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let pool = AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        let linear1 = LinearConfig::new(self.flat_features(), self.hidden_size).init(device);
        let linear2 = LinearConfig::new(self.hidden_size, self.num_classes).init(device);
        Cnn {
            conv1,
            conv2,
            pool,
            linear1,
            linear2,
            activation: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct Cnn<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
    pub pool: AvgPool2d,
    pub linear1: Linear<B>,
    pub linear2: Linear<B>,
    pub activation: Relu,
}

impl<B: Backend> ModelConfigExt<B> for CnnConfig {
    type Model = Cnn<B>;

    fn init(&self, device: &B::Device) -> Self::Model {
        CnnConfig::init(self, device)
    }
}

impl<B: Backend> Cnn<B> {
    /// # Shapes
    ///   - Input [batch, 1, HEIGHT, WIDTH]
    ///   - Output [batch, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, height, width] = images.dims();
        assert_eq!([1, HEIGHT, WIDTH], [channels, height, width]);

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);
        let [_, conv1_channels, _, _] = x.dims();
        assert_eq!([batch_size, conv1_channels, HEIGHT / 2, WIDTH / 2], x.dims());

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        let x: Tensor<B, 2> = x.flatten(1, 3);
        let x = self.linear1.forward(x);
        let x = self.activation.forward(x);
        let logits = self.linear2.forward(x);

        let [_, num_classes] = self.linear2.weight.dims();
        assert_eq!([batch_size, num_classes], logits.dims());
        logits
    }

    /// Logits and mean cross-entropy against integer labels.
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let [batch_size, ..] = images.dims();
        assert_eq!([batch_size], targets.dims());

        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

use crate::model::Cnn;
use burn::prelude::*;
use burn::{
    module::AutodiffModule,
    optim::{
        Optimizer, Sgd, SgdConfig, SimpleOptimizer, adaptor::OptimizerAdaptor,
        momentum::MomentumConfig,
    },
    tensor::backend::AutodiffBackend,
};

/// Maps an optimizer config to the adaptor that steps a module `AutoM`.
pub trait OptimConfigExt<AutoB, AutoM>
where
    Self: Config,
    AutoB: AutodiffBackend,
    AutoM: AutodiffModule<AutoB>,
{
    type Optim: SimpleOptimizer<AutoB::InnerBackend>;
    type Adaptor: Optimizer<AutoM, AutoB>;
    fn init(&self) -> Self::Adaptor;
}

/// Stochastic gradient descent with heavy-ball momentum.
///
/// The velocity is `v = momentum * v + grad` and the update is `-lr * v`.
/// There is no dampening and no weight decay.
#[derive(Config, Debug)]
pub struct SgdMomentumConfig {
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = false)]
    pub nesterov: bool,
}

/// Optimizer stepping the classifier.
pub type CnnOptim<AutoB> =
    OptimizerAdaptor<Sgd<<AutoB as AutodiffBackend>::InnerBackend>, Cnn<AutoB>, AutoB>;

impl SgdMomentumConfig {
    /// The equivalent burn config.
    pub fn to_sgd(&self) -> SgdConfig {
        // burn dampens the gradient by 0.1 unless told otherwise
        let momentum = MomentumConfig::new()
            .with_momentum(self.momentum)
            .with_dampening(0.0)
            .with_nesterov(self.nesterov);
        SgdConfig::new().with_momentum(Some(momentum))
    }

    pub fn init<AutoB: AutodiffBackend>(&self) -> CnnOptim<AutoB> {
        self.to_sgd().init::<AutoB, Cnn<AutoB>>()
    }
}

impl<AutoB, AutoM> OptimConfigExt<AutoB, AutoM> for SgdMomentumConfig
where
    AutoB: AutodiffBackend,
    AutoM: AutodiffModule<AutoB>,
{
    type Optim = Sgd<AutoB::InnerBackend>;
    type Adaptor = OptimizerAdaptor<Self::Optim, AutoM, AutoB>;
    fn init(&self) -> Self::Adaptor {
        self.to_sgd().init::<AutoB, AutoM>()
    }
}

use crate::backend::{MainBackend, RecorderTy};
use crate::error::{Error, Result};
use crate::model::ModelConfigExt;
use crate::optim::OptimConfigExt;
use burn::module::AutodiffModule;
use burn::record::{FileRecorder, Recorder};
use burn::{optim::Optimizer, prelude::*, tensor::backend::AutodiffBackend};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const HELP: &str = "\
MNIST CNN

Trains a small convolutional classifier on MNIST, evaluates it on the test split,
and plots the recorded loss and accuracy.
Models, optimizers, configurations, metrics and plots are persisted in an artifacts directory.

USAGE:
    mnist-cnn [OPTIONS]

When no --training or --inference flag is provided, the program exits after handling configuration logic.

BEHAVIOR OVERVIEW
- The program manages two configurations: training config and model config.
- If --training-config or --model-config is given, the corresponding config is loaded from the specified file and saved to the artifacts directory (overwriting any existing file).
- If no explicit config file is provided for a component, the program attempts to load it from the artifacts directory; if absent, a default configuration is created and saved.
- The artifacts directory (--artifacts-path) is used to read/write model weights, optimizer state, configurations, metrics and plots. If not specified, a new temporary directory is created and its path is printed.
- With --remove-artifacts, any existing model and optimizer files in the artifacts directory are deleted before training (if --training is active).
- Model and optimizer weights are loaded from the artifacts directory if present; otherwise new ones are created and saved.
- If both --training and --inference are specified, training executes first, followed by inference using the trained model.

FLAGS:
    -h, --help                  Show this help message and exit

OPTIONS:
    -t, --training              Run training (creates or updates model / optimizer)
    -i, --inference             Predict a grid of test images after training (if both flags are used) or immediately (if only inference is requested)
    -r, --remove-artifacts      Delete existing model and optimizer files from the artifacts directory before training
                                (has no effect if --training is not used)
    -c, --training-config <PATH>
                                Load training configuration from this file (overrides any config in artifacts directory)
    -m, --model-config <PATH>   Load model configuration from this file (overrides any config in artifacts directory)
    -a, --artifacts-path <PATH>
                                Directory where configurations, model weights, optimizer state, metrics and plots are saved and loaded.
                                If the directory does not exist, it will be created.
                                Defaults to a newly created temporary directory (path will be printed).

ENVIRONMENT:
    RUST_LOG                    Log filter, defaults to `mnist_cnn=info`
";

#[derive(Debug)]
pub struct AppArgs {
    pub help: bool,
    pub training: bool,
    pub inference: bool,
    pub remove_artifacts: bool,
    pub training_config: Option<PathBuf>,
    pub model_config: Option<PathBuf>,
    pub artifacts_path: PathBuf,
}

impl AppArgs {
    pub fn parse() -> Result<Self> {
        Self::from_vec(std::env::args_os().skip(1).collect())
    }

    pub fn from_vec(args: Vec<OsString>) -> Result<Self> {
        let mut pargs = pico_args::Arguments::from_vec(args);
        let invalid = |e: pico_args::Error| Error::InvalidArgs(e.to_string());

        // Help has a higher priority and should be handled separately.
        if pargs.contains(["-h", "--help"]) {
            return Ok(AppArgs {
                help: true,
                training: false,
                inference: false,
                remove_artifacts: false,
                training_config: None,
                model_config: None,
                artifacts_path: PathBuf::new(),
            });
        }

        let training_config = pargs
            .opt_value_from_os_str(["-c", "--training-config"], parse_path)
            .map_err(invalid)?;
        let model_config = pargs
            .opt_value_from_os_str(["-m", "--model-config"], parse_path)
            .map_err(invalid)?;
        let artifacts_path = pargs
            .opt_value_from_os_str(["-a", "--artifacts-path"], parse_path)
            .map_err(invalid)?;

        let args = AppArgs {
            help: false,
            training_config,
            model_config,
            artifacts_path: match artifacts_path {
                Some(path) => path,
                None => new_artifacts_dir()?,
            },
            // must parse flags after values
            training: pargs.contains(["-t", "--training"]),
            inference: pargs.contains(["-i", "--inference"]),
            remove_artifacts: pargs.contains(["-r", "--remove-artifacts"]),
        };

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            return Err(Error::InvalidArgs(format!("unused arguments: {remaining:?}")));
        }

        Ok(args)
    }

    pub fn create_artifact_dir(&self) -> Result<()> {
        create_artifact_dir(&self.artifacts_path, self.remove_artifacts && self.training)
    }

    pub fn save_training_config(&self, training_config: &impl Config) -> Result<()> {
        let path = config_path(&self.artifacts_path, TRAINING_CONFIG_NAME);
        save_config(&path, training_config, "training config")
    }

    /// The explicit `--training-config` file if given, else the one in the artifacts directory.
    pub fn load_training_config<TrainingConfig: Config>(&self) -> Result<Option<TrainingConfig>> {
        match &self.training_config {
            Some(path) => load_config(path, "training config")?
                .map(Some)
                .ok_or_else(|| Error::Config(format!("training config {path:?} does not exist"))),
            None => load_config(
                &config_path(&self.artifacts_path, TRAINING_CONFIG_NAME),
                "training config",
            ),
        }
    }

    pub fn save_model_config(&self, model_config: &impl Config) -> Result<()> {
        let path = config_path(&self.artifacts_path, MODEL_CONFIG_NAME);
        save_config(&path, model_config, "model config")
    }

    /// The explicit `--model-config` file if given, else the one in the artifacts directory.
    pub fn load_model_config<ModelConfig: Config>(&self) -> Result<Option<ModelConfig>> {
        match &self.model_config {
            Some(path) => load_config(path, "model config")?
                .map(Some)
                .ok_or_else(|| Error::Config(format!("model config {path:?} does not exist"))),
            None => load_config(
                &config_path(&self.artifacts_path, MODEL_CONFIG_NAME),
                "model config",
            ),
        }
    }

    pub fn save_model<B: Backend>(&self, model: &impl Module<B>) -> Result<()> {
        save_model(&self.artifacts_path, model)
    }

    pub fn load_model<B: Backend, ModelConfig: ModelConfigExt<B>>(
        &self,
        model_config: &ModelConfig,
        device: &B::Device,
    ) -> Result<Option<ModelConfig::Model>> {
        load_model(&self.artifacts_path, model_config, device)
    }

    pub fn load_or_save_model<B: Backend, ModelConfig: ModelConfigExt<B>>(
        &self,
        model_config: &ModelConfig,
        device: &B::Device,
    ) -> Result<ModelConfig::Model> {
        match self.load_model(model_config, device)? {
            Some(model) => Ok(model),
            None => {
                tracing::info!("Initializing new model");
                let model_init = model_config.init(device);
                self.save_model::<B>(&model_init)?;
                Ok(model_init)
            }
        }
    }

    pub fn save_optim<AutoB, AutoM>(&self, optim: &impl Optimizer<AutoM, AutoB>) -> Result<()>
    where
        AutoB: AutodiffBackend,
        AutoM: AutodiffModule<AutoB>,
    {
        save_optim(&self.artifacts_path, optim)
    }

    pub fn load_optim<AutoB, AutoM, OptimConfig>(
        &self,
        optim_config: &OptimConfig,
        device: &AutoB::Device,
    ) -> Result<Option<OptimConfig::Adaptor>>
    where
        AutoB: AutodiffBackend,
        AutoM: AutodiffModule<AutoB>,
        OptimConfig: OptimConfigExt<AutoB, AutoM>,
    {
        load_optim(&self.artifacts_path, optim_config, device)
    }

    pub fn load_or_save_optim<AutoB, AutoM, OptimConfig>(
        &self,
        optim_config: &OptimConfig,
        device: &AutoB::Device,
    ) -> Result<OptimConfig::Adaptor>
    where
        AutoB: AutodiffBackend,
        AutoM: AutodiffModule<AutoB>,
        OptimConfig: OptimConfigExt<AutoB, AutoM>,
    {
        match self.load_optim(optim_config, device)? {
            Some(optim) => Ok(optim),
            None => {
                tracing::info!("Initializing new optim");
                let optim_init = optim_config.init();
                self.save_optim::<AutoB, AutoM>(&optim_init)?;
                Ok(optim_init)
            }
        }
    }
}

fn parse_path(s: &std::ffi::OsStr) -> std::result::Result<PathBuf, &'static str> {
    Ok(s.into())
}

fn new_artifacts_dir() -> Result<PathBuf> {
    // e.g. /tmp/mnist-cnn-abcd-0
    let name = format!("{}-", std::env!("CARGO_PKG_NAME"));
    let tmp = temp_dir::TempDir::with_prefix(name)
        .map_err(|e| Error::io(std::env::temp_dir(), e))?
        .dont_delete_on_drop();
    let path = tmp.path().to_path_buf();
    tracing::info!("new artifacts directory: {path:?}");
    Ok(path)
}

/// Create the artifacts directory, optionally removing the saved model and optimizer first.
pub fn create_artifact_dir(artifact_dir: &Path, delete: bool) -> Result<()> {
    if delete {
        tracing::info!("removing {artifact_dir:?}/{{{MODEL_NAME},{OPTIM_NAME}}}");
        for name in [MODEL_NAME, OPTIM_NAME] {
            let path = record_path(artifact_dir, name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(path, e)),
            }
        }
    }
    std::fs::create_dir_all(artifact_dir).map_err(|e| Error::io(artifact_dir, e))
}

pub const TRAINING_CONFIG_NAME: &str = "training_config";
pub const MODEL_CONFIG_NAME: &str = "model_config";

fn config_path(artifact_dir: &Path, name: &str) -> PathBuf {
    artifact_dir.join(name).with_extension("json")
}

pub fn save_config(path: &Path, config: &impl Config, what: &str) -> Result<()> {
    tracing::info!("Saving {what} into {path:?}");
    config.save(path).map_err(|e| Error::io(path, e))
}

/// `None` when there is no file at `path`.
pub fn load_config<C: Config>(path: &Path, what: &str) -> Result<Option<C>> {
    if !path.exists() {
        return Ok(None);
    }
    tracing::info!("Loading {what} from {path:?}");
    C::load(path)
        .map(Some)
        .map_err(|e| Error::Config(format!("failed to load the {what} from {path:?}: {e}")))
}

pub const MODEL_NAME: &str = "model";
pub const OPTIM_NAME: &str = "optim";

/// Path of a record, including the extension the recorder appends on its own.
fn record_path(artifact_dir: &Path, name: &str) -> PathBuf {
    let file_ext = <RecorderTy as FileRecorder<MainBackend>>::file_extension();
    artifact_dir.join(name).with_extension(file_ext)
}

pub fn save_model<B: Backend>(artifact_dir: &Path, model: &impl Module<B>) -> Result<()> {
    let path = artifact_dir.join(MODEL_NAME);
    let path_ext = path.with_extension(<RecorderTy as FileRecorder<B>>::file_extension());
    tracing::info!("Saving model to {path_ext:?}");
    model
        .clone()
        .save_file(path, &RecorderTy::new()) // ext added automatically
        .map_err(|e| Error::Record {
            what: "model",
            path: path_ext,
            reason: e.to_string(),
        })
}

pub fn load_model<B: Backend, ModelConfig: ModelConfigExt<B>>(
    artifact_dir: &Path,
    model_config: &ModelConfig,
    device: &B::Device,
) -> Result<Option<ModelConfig::Model>> {
    let path = artifact_dir.join(MODEL_NAME);
    let path_ext = path.with_extension(<RecorderTy as FileRecorder<B>>::file_extension());
    if !path_ext.exists() {
        return Ok(None);
    }
    tracing::info!("Loading model from {path_ext:?}");
    let model_init = model_config.init(device);
    model_init
        .load_file(path, &RecorderTy::new(), device) // ext added automatically
        .map(Some)
        .map_err(|e| Error::Record {
            what: "model",
            path: path_ext,
            reason: e.to_string(),
        })
}

pub fn save_optim<AutoB, AutoM, Optim>(artifact_dir: &Path, optim: &Optim) -> Result<()>
where
    AutoB: AutodiffBackend,
    AutoM: AutodiffModule<AutoB>,
    Optim: Optimizer<AutoM, AutoB>,
{
    let path = artifact_dir.join(OPTIM_NAME);
    let path_ext = path.with_extension(<RecorderTy as FileRecorder<AutoB>>::file_extension());
    tracing::info!("Saving optim to {path_ext:?}");
    let record = optim.to_record();
    RecorderTy::new()
        .record(record, path) // ext added automatically
        .map_err(|e| Error::Record {
            what: "optim",
            path: path_ext,
            reason: e.to_string(),
        })
}

pub fn load_optim<AutoB, AutoM, OptimConfig>(
    artifact_dir: &Path,
    optim_config: &OptimConfig,
    device: &AutoB::Device,
) -> Result<Option<OptimConfig::Adaptor>>
where
    AutoB: AutodiffBackend,
    AutoM: AutodiffModule<AutoB>,
    OptimConfig: OptimConfigExt<AutoB, AutoM>,
{
    let path = artifact_dir.join(OPTIM_NAME);
    let path_ext = path.with_extension(<RecorderTy as FileRecorder<AutoB>>::file_extension());
    if !path_ext.exists() {
        return Ok(None);
    }
    tracing::info!("Loading optim from {path_ext:?}");
    let optim_init = optim_config.init();
    let record = RecorderTy::new()
        .load(path, device) // ext added automatically
        .map_err(|e| Error::Record {
            what: "optim",
            path: path_ext,
            reason: e.to_string(),
        })?;
    Ok(Some(optim_init.load_record(record)))
}

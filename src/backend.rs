use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

#[cfg(feature = "f16")]
pub type Element = burn::tensor::f16;
#[cfg(not(feature = "f16"))]
pub type Element = f32;

#[cfg(feature = "ndarray")]
pub type MainBackend = burn::backend::NdArray<Element, i32>;
#[cfg(all(not(feature = "ndarray"), any(feature = "tch-cpu", feature = "tch-gpu")))]
pub type MainBackend = burn::backend::libtorch::LibTorch<Element, i32>;
#[cfg(all(not(feature = "ndarray"), feature = "wgpu"))]
pub type MainBackend = burn::backend::wgpu::Wgpu<Element, i32>;
#[cfg(all(not(feature = "ndarray"), feature = "cuda"))]
pub type MainBackend = burn::backend::Cuda<Element, i32>;

/// Picks the device a backend trains or infers on.
pub trait MainDevice: Backend {
    fn main_device() -> <Self as Backend>::Device {
        Default::default()
    }
}

#[cfg(any(
    feature = "ndarray",
    feature = "tch-cpu",
    feature = "wgpu",
    feature = "cuda"
))]
impl MainDevice for MainBackend {}
#[cfg(all(
    not(any(feature = "ndarray", feature = "tch-cpu")),
    feature = "tch-gpu",
    not(target_os = "macos")
))]
impl MainDevice for MainBackend {
    fn main_device() -> <Self as Backend>::Device {
        burn::backend::libtorch::LibTorchDevice::Cuda(0)
    }
}
#[cfg(all(
    not(any(feature = "ndarray", feature = "tch-cpu")),
    feature = "tch-gpu",
    target_os = "macos"
))]
impl MainDevice for MainBackend {
    fn main_device() -> <Self as Backend>::Device {
        burn::backend::libtorch::LibTorchDevice::Mps
    }
}

pub type MainAutoBackend = burn::backend::Autodiff<MainBackend>;
impl MainDevice for MainAutoBackend {
    fn main_device() -> <Self as Backend>::Device {
        <<Self as AutodiffBackend>::InnerBackend as MainDevice>::main_device()
    }
}

#[cfg(not(feature = "_has-backend"))]
mod err {
    use super::*;
    std::compile_error!("No backend selected. Enable one of: ndarray, wgpu, cuda, tch-cpu, tch-gpu.");

    // pretend to fallback to ndarray (to avoid too many other unrelated errors)
    pub type MainBackend = burn::backend::NdArray<Element, i32>;
    impl MainDevice for MainBackend {}
}
#[cfg(not(feature = "_has-backend"))]
pub use err::*;

/// File format of the saved model and optimizer records.
pub type RecorderTy = burn::record::CompactRecorder;

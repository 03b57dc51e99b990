pub mod dataset;
pub mod idx;

pub use dataset::{HEIGHT, MnistBatch, MnistBatcher, MnistDataset, MnistItem, NUM_CLASSES, Split, WIDTH};

use crate::backend::Element;
use crate::error::{Error, Result};
use crate::mnist::idx;
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use burn_dataset::network::downloader::download_file_as_bytes;
use burn_dataset::{
    Dataset, InMemDataset,
    transform::{Mapper, MapperDataset},
};
use flate2::read::GzDecoder;
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

// CVDF mirror of http://yann.lecun.com/exdb/mnist/
const URL: &str = "https://storage.googleapis.com/cvdf-datasets/mnist/";
const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

pub const WIDTH: usize = 28;
pub const HEIGHT: usize = 28;
pub const NUM_CLASSES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }

    fn files(&self) -> (&'static str, &'static str) {
        match self {
            Split::Train => (TRAIN_IMAGES, TRAIN_LABELS),
            Split::Test => (TEST_IMAGES, TEST_LABELS),
        }
    }
}

/// MNIST item.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MnistItem {
    /// Image as a flat array of floats.
    /// Each value is a brightness, in between 0.0 and 255.0.
    ///
    /// # Shape
    /// [HEIGHT * WIDTH]
    pub image: Vec<Element>,

    /// Label of the image.
    /// Each value is in between 0 and 9.
    pub label: u8,
}

#[derive(Deserialize, Debug, Clone)]
struct MnistItemRaw {
    pub image_bytes: Vec<u8>,
    pub label: u8,
}

struct BytesToImage;

impl Mapper<MnistItemRaw, MnistItem> for BytesToImage {
    /// Convert a raw MNIST item (image bytes) to a MNIST item (flat array image).
    fn map(&self, item: &MnistItemRaw) -> MnistItem {
        debug_assert_eq!(item.image_bytes.len(), WIDTH * HEIGHT);

        let image: Vec<Element> = item
            .image_bytes
            .iter()
            .map(|brightness| {
                let element: Element = (*brightness).as_();
                element
            })
            .collect();

        MnistItem {
            image,
            label: item.label,
        }
    }
}

type MappedDataset = MapperDataset<InMemDataset<MnistItemRaw>, BytesToImage, MnistItemRaw>;

/// The MNIST dataset consists of 70,000 28x28 black-and-white images in 10 classes (one for each digits), with 7,000
/// images per class. There are 60,000 training images and 10,000 test images.
///
/// The data is downloaded from the web from the [CVDF mirror](https://github.com/cvdfoundation/mnist).
pub struct MnistDataset {
    dataset: MappedDataset,
}

impl Dataset<MnistItem> for MnistDataset {
    fn get(&self, index: usize) -> Option<MnistItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl MnistDataset {
    /// Creates the train split, downloading it into `data_dir` when absent.
    pub fn train(data_dir: &Path) -> Result<Self> {
        Self::new(data_dir, Split::Train)
    }

    /// Creates the test split, downloading it into `data_dir` when absent.
    pub fn test(data_dir: &Path) -> Result<Self> {
        Self::new(data_dir, Split::Test)
    }

    /// The burn-dataset cache directory, `~/.cache/burn-dataset`.
    pub fn default_data_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not get the home directory".into()))?;
        Ok(home.join(".cache").join("burn-dataset"))
    }

    /// Builds a dataset from already decoded images and labels.
    pub fn from_raw(images: Vec<Vec<u8>>, labels: Vec<u8>) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(Error::idx(
                "mnist",
                format!("{} images but {} labels", images.len(), labels.len()),
            ));
        }
        if let Some(i) = images.iter().position(|image| image.len() != WIDTH * HEIGHT) {
            return Err(Error::idx(
                "mnist",
                format!("image {i} is not {HEIGHT}x{WIDTH}"),
            ));
        }

        let items: Vec<_> = images
            .into_iter()
            .zip(labels)
            .map(|(image_bytes, label)| MnistItemRaw { image_bytes, label })
            .collect();

        let dataset = InMemDataset::new(items);
        let dataset = MapperDataset::new(dataset, BytesToImage);

        Ok(Self { dataset })
    }

    fn new(data_dir: &Path, split: Split) -> Result<Self> {
        let root = Self::download(data_dir, split)?;

        // MNIST is tiny so we can load it in-memory
        // Train images (u8): 28 * 28 * 60000 = 47.04Mb
        // Test images (u8): 28 * 28 * 10000 = 7.84Mb
        let (images_name, labels_name) = split.files();
        let images = idx::parse_images(&read_file(&root.join(images_name))?, images_name)?;
        let labels = idx::parse_labels(&read_file(&root.join(labels_name))?, labels_name)?;
        tracing::info!("Loaded {} {} images", images.len(), split.name());

        Self::from_raw(images, labels)
    }

    /// Download the split files into `<data_dir>/mnist/<split>`, reusing files already on disk.
    fn download(data_dir: &Path, split: Split) -> Result<PathBuf> {
        let split_dir = data_dir.join("mnist").join(split.name());
        create_dir_all(&split_dir).map_err(|e| Error::io(&split_dir, e))?;

        let (images_name, labels_name) = split.files();
        Self::download_file(images_name, &split_dir)?;
        Self::download_file(labels_name, &split_dir)?;

        Ok(split_dir)
    }

    /// Download a file from the MNIST dataset URL to the destination directory.
    /// File download progress is reported by burn-dataset's progress bar.
    fn download_file(name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let file_name = dest_dir.join(name);

        if file_name.exists() {
            tracing::debug!("Reusing {file_name:?}");
            return Ok(file_name);
        }

        let url = format!("{URL}{name}.gz");
        let bytes = download_file_as_bytes(&url, name);
        if bytes.is_empty() {
            return Err(Error::Download {
                url,
                reason: "empty response".into(),
            });
        }

        // decode into a temporary name so that an interrupted write is not mistaken for a cached file
        let partial = file_name.with_extension("part");
        let mut output_file = File::create(&partial).map_err(|e| Error::io(&partial, e))?;
        let mut gz_buffer = GzDecoder::new(&bytes[..]);
        std::io::copy(&mut gz_buffer, &mut output_file).map_err(|e| Error::Download {
            url: url.clone(),
            reason: format!("gzip decoding failed: {e}"),
        })?;
        std::fs::rename(&partial, &file_name).map_err(|e| Error::io(&file_name, e))?;

        Ok(file_name)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::io(path, e))
}

#[derive(Clone, Default)]
pub struct MnistBatcher {}

#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    /// The brightness, scaled into `[0, 1]`.
    ///
    /// # Shape
    /// [batch_size, 1, HEIGHT, WIDTH]
    pub images: Tensor<B, 4>,
    /// # Shape
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, MnistItem, MnistBatch<B>> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, device: &B::Device) -> MnistBatch<B> {
        let batch_size = items.len();
        let mut pixels: Vec<Element> = Vec::with_capacity(batch_size * HEIGHT * WIDTH);
        let mut labels: Vec<i64> = Vec::with_capacity(batch_size);
        for item in items {
            pixels.extend(item.image);
            labels.push(item.label as i64);
        }

        let images = TensorData::new(pixels, [batch_size, 1, HEIGHT, WIDTH]).convert::<B::FloatElem>();
        let images = Tensor::<B, 4>::from_data(images, device) / 255;

        let targets = TensorData::new(labels, [batch_size]).convert::<B::IntElem>();
        let targets = Tensor::<B, 1, Int>::from_data(targets, device);

        MnistBatch { images, targets }
    }
}

//! Decoding of the IDX container used by the MNIST distribution files.
//!
//! All header integers are big-endian `u32`.
//!
//! - images: `magic=2051, count, rows, cols`, then `count * rows * cols` bytes
//! - labels: `magic=2049, count`, then `count` bytes

use crate::error::{Error, Result};
use crate::mnist::dataset::{HEIGHT, NUM_CLASSES, WIDTH};

pub const IMAGES_MAGIC: u32 = 2051;
pub const LABELS_MAGIC: u32 = 2049;

const IMAGES_HEADER_LEN: usize = 16;
const LABELS_HEADER_LEN: usize = 8;

fn read_u32(bytes: &[u8], offset: usize, name: &str) -> Result<u32> {
    let word = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| Error::idx(name, format!("header truncated at byte {offset}")))?;
    Ok(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

/// Decodes an IDX image file into one `WIDTH * HEIGHT` byte vector per image.
pub fn parse_images(bytes: &[u8], name: &str) -> Result<Vec<Vec<u8>>> {
    let magic = read_u32(bytes, 0, name)?;
    if magic != IMAGES_MAGIC {
        return Err(Error::idx(
            name,
            format!("expected magic {IMAGES_MAGIC}, found {magic}"),
        ));
    }
    let count = read_u32(bytes, 4, name)? as usize;
    let rows = read_u32(bytes, 8, name)? as usize;
    let cols = read_u32(bytes, 12, name)? as usize;
    if (rows, cols) != (HEIGHT, WIDTH) {
        return Err(Error::idx(
            name,
            format!("expected {HEIGHT}x{WIDTH} images, found {rows}x{cols}"),
        ));
    }

    let payload = &bytes[IMAGES_HEADER_LEN..];
    let expected = count * rows * cols;
    if payload.len() < expected {
        return Err(Error::idx(
            name,
            format!(
                "expected {expected} pixel bytes for {count} images, found {}",
                payload.len()
            ),
        ));
    }

    Ok(payload[..expected]
        .chunks_exact(rows * cols)
        .map(<[u8]>::to_vec)
        .collect())
}

/// Decodes an IDX label file. Every label must name one of the ten digits.
pub fn parse_labels(bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    let magic = read_u32(bytes, 0, name)?;
    if magic != LABELS_MAGIC {
        return Err(Error::idx(
            name,
            format!("expected magic {LABELS_MAGIC}, found {magic}"),
        ));
    }
    let count = read_u32(bytes, 4, name)? as usize;

    let payload = &bytes[LABELS_HEADER_LEN..];
    if payload.len() < count {
        return Err(Error::idx(
            name,
            format!("expected {count} labels, found {}", payload.len()),
        ));
    }

    let labels = payload[..count].to_vec();
    if let Some((i, label)) = labels
        .iter()
        .enumerate()
        .find(|(_, label)| usize::from(**label) >= NUM_CLASSES)
    {
        return Err(Error::idx(name, format!("label {label} at index {i}")));
    }
    Ok(labels)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn images_file(images: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(IMAGES_MAGIC.to_be_bytes());
        bytes.extend((images.len() as u32).to_be_bytes());
        bytes.extend((HEIGHT as u32).to_be_bytes());
        bytes.extend((WIDTH as u32).to_be_bytes());
        for image in images {
            bytes.extend(image);
        }
        bytes
    }

    pub(crate) fn labels_file(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(LABELS_MAGIC.to_be_bytes());
        bytes.extend((labels.len() as u32).to_be_bytes());
        bytes.extend(labels);
        bytes
    }

    #[test]
    fn parses_images() {
        let a = vec![0u8; WIDTH * HEIGHT];
        let b = vec![255u8; WIDTH * HEIGHT];
        let parsed = parse_images(&images_file(&[a.clone(), b.clone()]), "imgs").unwrap();
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn parses_labels() {
        let parsed = parse_labels(&labels_file(&[3, 0, 9]), "lbls").unwrap();
        assert_eq!(parsed, vec![3, 0, 9]);
    }

    #[test]
    fn rejects_swapped_magic() {
        let err = parse_images(&labels_file(&[1]), "imgs").unwrap_err();
        assert!(matches!(err, Error::InvalidIdx { .. }));
        let err = parse_labels(&images_file(&[]), "lbls").unwrap_err();
        assert!(matches!(err, Error::InvalidIdx { .. }));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = images_file(&[vec![7u8; WIDTH * HEIGHT]]);
        bytes.pop();
        assert!(parse_images(&bytes, "imgs").is_err());

        let mut bytes = labels_file(&[1, 2]);
        bytes.pop();
        assert!(parse_labels(&bytes, "lbls").is_err());

        assert!(parse_labels(&[0, 0, 8], "lbls").is_err());
    }

    #[test]
    fn rejects_wrong_dimensions() {
        let mut bytes = images_file(&[]);
        bytes[8..12].copy_from_slice(&32u32.to_be_bytes());
        assert!(parse_images(&bytes, "imgs").is_err());
    }

    #[test]
    fn rejects_out_of_range_label() {
        let err = parse_labels(&labels_file(&[1, 10]), "lbls").unwrap_err();
        assert!(err.to_string().contains("label 10 at index 1"));
    }
}

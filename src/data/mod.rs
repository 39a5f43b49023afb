use std::{fs::File, io::{BufReader, ErrorKind, Read}, ops::Range, path::Path};

use flate2::read::GzDecoder;
use nalgebra::DMatrix;
use rand::{seq::SliceRandom, Rng};

use crate::error::{Error, Result};

pub const WIDTH: usize = 28;
pub const HEIGHT: usize = 28;
pub const NUM_PIXELS: usize = WIDTH * HEIGHT;
pub const NUM_CLASSES: usize = 10;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

pub type Image = [[u8; WIDTH]; HEIGHT];

/// MNIST item: a raw grayscale image and its digit.
#[derive(Debug, Clone, PartialEq)]
pub struct MnistItem {
    pub image: Image,
    pub label: u8,
}

/// One split of MNIST, loaded fully in memory.
/// Train images (u8): 28 * 28 * 60000 = 47.04Mb
/// Test images (u8): 28 * 28 * 10000 = 7.84Mb
#[derive(Debug, Clone)]
pub struct MnistDataset {
    items: Vec<MnistItem>,
}

impl MnistDataset {
    /// Reads the 60,000 training images from `root`.
    pub fn train<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::read(root.as_ref(), TRAIN_IMAGES, TRAIN_LABELS)
    }

    /// Reads the 10,000 test images from `root`.
    pub fn test<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::read(root.as_ref(), TEST_IMAGES, TEST_LABELS)
    }

    fn read(root: &Path, images: &str, labels: &str) -> Result<Self> {
        let images = read_images(open_idx(root, images)?)?;
        let labels = read_labels(open_idx(root, labels)?)?;
        if images.len() != labels.len() {
            return Err(Error::format(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }

        let items = images
            .into_iter()
            .zip(labels)
            .map(|(image, label)| MnistItem { image, label })
            .collect();

        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[MnistItem] {
        &self.items
    }
}

/// Opens `root/name`, falling back to the gzip archive `root/name.gz`.
fn open_idx(root: &Path, name: &str) -> Result<Box<dyn Read>> {
    let path = root.join(name);
    if path.exists() {
        return Ok(Box::new(BufReader::new(File::open(path)?)));
    }

    let archive = File::open(root.join(format!("{name}.gz")))?;
    Ok(Box::new(GzDecoder::new(BufReader::new(archive))))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => Error::format(format!("truncated {what}")),
        _ => Error::Io(err),
    })
}

/// Reads exactly `len` payload bytes; the buffer grows with the data read, not
/// with the count announced in the header.
fn read_payload<R: Read>(reader: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() < len {
        return Err(Error::format(format!(
            "truncated {what}: header announces {len} bytes, found {}",
            buf.len()
        )));
    }
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, what)?;
    Ok(u32::from_be_bytes(buf))
}

/// Parses an IDX3 image file (big-endian header: magic, count, rows, cols).
pub fn read_images<R: Read>(mut reader: R) -> Result<Vec<Image>> {
    let magic = read_u32(&mut reader, "image header")?;
    if magic != IMAGES_MAGIC {
        return Err(Error::format(format!("invalid image file magic {magic:#010x}")));
    }
    let count = read_u32(&mut reader, "image header")? as usize;
    let rows = read_u32(&mut reader, "image header")? as usize;
    let cols = read_u32(&mut reader, "image header")? as usize;
    if rows != HEIGHT || cols != WIDTH {
        return Err(Error::format(format!(
            "expected {HEIGHT}x{WIDTH} images, found {rows}x{cols}"
        )));
    }

    let len = count
        .checked_mul(NUM_PIXELS)
        .ok_or_else(|| Error::format(format!("image count {count} is too large")))?;
    let buf_images = read_payload(&mut reader, len, "image payload")?;

    let images = buf_images
        .chunks_exact(NUM_PIXELS)
        .map(|chunk| {
            let mut image = [[0u8; WIDTH]; HEIGHT];
            for (row, pixels) in image.iter_mut().zip(chunk.chunks_exact(WIDTH)) {
                row.copy_from_slice(pixels);
            }
            image
        })
        .collect();

    Ok(images)
}

/// Parses an IDX1 label file (big-endian header: magic, count).
pub fn read_labels<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let magic = read_u32(&mut reader, "label header")?;
    if magic != LABELS_MAGIC {
        return Err(Error::format(format!("invalid label file magic {magic:#010x}")));
    }
    let count = read_u32(&mut reader, "label header")? as usize;

    let buf_labels = read_payload(&mut reader, count, "label payload")?;
    if let Some(label) = buf_labels.iter().find(|&&label| label as usize >= NUM_CLASSES) {
        return Err(Error::format(format!("label {label} is not a digit")));
    }

    Ok(buf_labels)
}

/// Preprocessed samples: one flattened image per row.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: DMatrix<f32>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Gathers the rows at `indices` into a new mini-batch.
    pub fn batch(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select_rows(indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Contiguous rows, used for evaluation in order.
    pub fn slice(&self, range: Range<usize>) -> Dataset {
        Dataset {
            features: self.features.rows(range.start, range.len()).clone_owned(),
            labels: self.labels[range].to_vec(),
        }
    }
}

// scale a pixel from [0, 255] to [0, 1]
fn normalize_pixel(pixel: u8) -> f32 {
    pixel as f32 / 255.0
}

/// Normalizes and flattens raw images, row-major (`y * WIDTH + x`).
pub fn preprocess(items: &[MnistItem]) -> Dataset {
    let features = DMatrix::from_row_iterator(
        items.len(),
        NUM_PIXELS,
        items
            .iter()
            .flat_map(|item| item.image.iter().flatten().map(|&pixel| normalize_pixel(pixel))),
    );
    let labels = items.iter().map(|item| item.label as usize).collect();

    Dataset { features, labels }
}

/// Shuffles `0..len` and cuts it into mini-batches; the last one may be shorter.
pub fn shuffled_batches<R: Rng + ?Sized>(len: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut permutation = (0..len).collect::<Vec<_>>();
    permutation.shuffle(rng);

    permutation
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Deterministic digit-like images: label `k` lights up rows `2k+4..2k+7`.
#[cfg(test)]
pub(crate) fn toy_items(count: usize, seed: u64) -> Vec<MnistItem> {
    use rand::{rngs::StdRng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let label = (i % 10) as u8;
            let mut image = [[0u8; WIDTH]; HEIGHT];
            for (y, row) in image.iter_mut().enumerate() {
                for pixel in row.iter_mut() {
                    let lit = y >= 2 * label as usize + 4 && y < 2 * label as usize + 7;
                    *pixel = if lit { rng.gen_range(180..=255) } else { rng.gen_range(0..40) };
                }
            }
            MnistItem { image, label }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn idx_images(images: &[Image]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(images.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&(HEIGHT as u32).to_be_bytes());
        bytes.extend_from_slice(&(WIDTH as u32).to_be_bytes());
        for image in images {
            bytes.extend(image.iter().flatten());
        }
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    fn write_split(dir: &Path, items: &[MnistItem], gzip: bool) {
        let images = items.iter().map(|item| item.image).collect::<Vec<_>>();
        let labels = items.iter().map(|item| item.label).collect::<Vec<_>>();
        for (name, bytes) in [(TRAIN_IMAGES, idx_images(&images)), (TRAIN_LABELS, idx_labels(&labels))] {
            if gzip {
                let file = File::create(dir.join(format!("{name}.gz"))).unwrap();
                let mut encoder = GzEncoder::new(file, Compression::default());
                encoder.write_all(&bytes).unwrap();
                encoder.finish().unwrap();
            } else {
                std::fs::write(dir.join(name), bytes).unwrap();
            }
        }
    }

    #[test]
    fn reads_raw_idx_files() {
        let dir = tempfile::tempdir().unwrap();
        let items = toy_items(12, 1);
        write_split(dir.path(), &items, false);

        let dataset = MnistDataset::train(dir.path()).unwrap();

        assert_eq!(dataset.len(), 12);
        assert_eq!(dataset.items(), &items[..]);
    }

    #[test]
    fn reads_gzip_idx_files() {
        let dir = tempfile::tempdir().unwrap();
        let items = toy_items(7, 2);
        write_split(dir.path(), &items, true);

        let dataset = MnistDataset::train(dir.path()).unwrap();

        assert_eq!(dataset.items(), &items[..]);
    }

    #[test]
    fn missing_split_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = MnistDataset::test(dir.path());

        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn rejects_bad_magic_and_truncated_payload() {
        let mut bytes = idx_labels(&[1, 2, 3]);
        bytes[3] = 0x03;
        assert!(matches!(read_labels(&bytes[..]), Err(Error::Format(_))));

        let bytes = idx_images(&[[[0u8; WIDTH]; HEIGHT]; 2]);
        let truncated = &bytes[..bytes.len() - 10];
        assert!(matches!(read_images(truncated), Err(Error::Format(_))));
    }

    #[test]
    fn rejects_huge_count_over_small_payload() {
        let mut bytes = idx_images(&[]);
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 100]);
        assert!(matches!(read_images(&bytes[..]), Err(Error::Format(_))));

        let mut bytes = idx_labels(&[1, 2]);
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(read_labels(&bytes[..]), Err(Error::Format(_))));
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let bytes = idx_labels(&[3, 200]);

        assert!(matches!(read_labels(&bytes[..]), Err(Error::Format(_))));
        assert_eq!(read_labels(&idx_labels(&[0, 9])[..]).unwrap(), vec![0, 9]);
    }

    #[test]
    fn rejects_wrong_image_dimensions() {
        let mut bytes = idx_images(&[[[0u8; WIDTH]; HEIGHT]]);
        bytes[11] = 27;

        assert!(matches!(read_images(&bytes[..]), Err(Error::Format(_))));
    }

    #[test]
    fn rejects_mismatched_counts() {
        let dir = tempfile::tempdir().unwrap();
        let items = toy_items(4, 3);
        write_split(dir.path(), &items, false);
        std::fs::write(dir.path().join(TRAIN_LABELS), idx_labels(&[0, 1, 2])).unwrap();

        assert!(matches!(MnistDataset::train(dir.path()), Err(Error::Format(_))));
    }

    #[test]
    fn preprocess_scales_and_flattens() {
        let mut items = toy_items(5, 4);
        items[0].image[0][0] = 255;
        items[0].image[1][3] = 0;
        items[0].image[27][27] = 51;

        let dataset = preprocess(&items);

        assert_eq!(dataset.features.nrows(), 5);
        assert_eq!(dataset.features.ncols(), NUM_PIXELS);
        assert!(dataset.features.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(dataset.features[(0, 0)], 1.0);
        assert_eq!(dataset.features[(0, WIDTH + 3)], 0.0);
        assert!((dataset.features[(0, NUM_PIXELS - 1)] - 0.2).abs() < 1e-6);
        assert_eq!(dataset.labels, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn preprocess_empty_batch() {
        let dataset = preprocess(&[]);

        assert!(dataset.is_empty());
        assert_eq!(dataset.features.ncols(), NUM_PIXELS);
    }

    #[test]
    fn batches_cover_every_index_once() {
        let mut rng = StdRng::seed_from_u64(42);
        let batches = shuffled_batches(70, 32, &mut rng);

        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![32, 32, 6]);
        let mut seen = batches.concat();
        seen.sort_unstable();
        assert_eq!(seen, (0..70).collect::<Vec<_>>());
    }

    #[test]
    fn batch_gathers_matching_rows() {
        let dataset = preprocess(&toy_items(10, 5));

        let batch = dataset.batch(&[7, 2]);

        assert_eq!(batch.labels, vec![7, 2]);
        assert_eq!(batch.features.row(0), dataset.features.row(7));
        assert_eq!(batch.features.row(1), dataset.features.row(2));
        assert_eq!(dataset.slice(3..5).labels, vec![3, 4]);
    }
}

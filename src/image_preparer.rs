//! Image Preparer Module
//!
//! Decodes resolved images, downsizes anything whose longer edge exceeds the
//! configured maximum, and re-encodes at the configured JPEG quality. Large
//! camera exports are the main target; preparing them once and caching the
//! compressed result keeps build time and memory bounded.

use crate::asset_resolver::AssetResolver;
use crate::error::BuildWarning;
use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageOutputFormat, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Keep the original bytes unless re-encoding shaves off at least 5%.
const MIN_REENCODE_GAIN: f64 = 0.95;

/// A decoded-and-compressed image ready for embedding: encoded JPEG bytes
/// for the writer, pixel dimensions for layout reflow math.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PreparedImage {
    /// Width over height.
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// Stateless preparation policy plus an optional on-disk cache. The per-build
/// in-memory cache lives in [`PreparedImages`].
pub struct ImagePreparer {
    max_dimension: u32,
    quality: u8,
    cache_dir: Option<PathBuf>,
}

/// Results of the prefetch pass, owned by the build context for the duration
/// of one document build.
#[derive(Debug, Default)]
pub struct PreparedImages {
    /// Raw source path -> resolved location, for successful preparations.
    pub(crate) by_raw: HashMap<String, PathBuf>,
    /// Resolved location -> prepared pixels. Repeat references to the same
    /// file share one entry.
    pub(crate) by_location: HashMap<PathBuf, PreparedImage>,
}

impl PreparedImages {
    /// Looks an image up by the path as written in the source.
    pub fn lookup(&self, raw: &str) -> Option<(&Path, &PreparedImage)> {
        let location = self.by_raw.get(raw)?;
        let prepared = self.by_location.get(location)?;
        Some((location.as_path(), prepared))
    }

    pub fn get(&self, location: &Path) -> Option<&PreparedImage> {
        self.by_location.get(location)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &PreparedImage)> {
        self.by_location.iter().map(|(p, i)| (p.as_path(), i))
    }

    pub fn len(&self) -> usize {
        self.by_location.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }
}

impl ImagePreparer {
    pub fn new(max_dimension: u32, quality: u8, cache_dir: Option<PathBuf>) -> Self {
        ImagePreparer { max_dimension, quality, cache_dir }
    }

    /// Resolves and prepares every distinct image reference ahead of layout,
    /// on a bounded worker pool. Results are keyed so the layout engine can
    /// consume them in document order; failures become warnings here and
    /// placeholders there.
    pub fn prefetch(
        &self,
        refs: &[String],
        resolver: &AssetResolver,
        workers: usize,
        warnings: &mut Vec<BuildWarning>,
    ) -> Result<PreparedImages> {
        let mut unique: Vec<&String> = Vec::new();
        for r in refs {
            if !unique.contains(&r) {
                unique.push(r);
            }
        }
        if unique.is_empty() {
            return Ok(PreparedImages::default());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .context("Failed to build image preparation pool")?;

        let pb = ProgressBar::new(unique.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} Preparing images [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap()
                .progress_chars("##-"),
        );

        type Prefetched = (String, std::result::Result<(PathBuf, PreparedImage), BuildWarning>);
        let results: Vec<Prefetched> = pool.install(|| {
            unique
                .par_iter()
                .map(|raw| {
                    let outcome = match resolver.resolve(raw) {
                        Some(asset) => self
                            .prepare(&asset.location)
                            .map(|prepared| (asset.location, prepared))
                            .map_err(|e| BuildWarning::AssetUnpreparable {
                                path: raw.to_string(),
                                reason: format!("{e:#}"),
                            }),
                        None => Err(BuildWarning::AssetNotFound {
                            path: raw.to_string(),
                            candidates: resolver.candidate_count(raw),
                        }),
                    };
                    pb.inc(1);
                    (raw.to_string(), outcome)
                })
                .collect()
        });
        pb.finish_with_message("Images prepared");

        let mut prepared = PreparedImages::default();
        for (raw, outcome) in results {
            match outcome {
                Ok((location, image)) => {
                    prepared.by_location.entry(location.clone()).or_insert(image);
                    prepared.by_raw.insert(raw, location);
                }
                Err(warning) => {
                    // Surfaced once in the end-of-build summary.
                    debug!("{warning}");
                    warnings.push(warning);
                }
            }
        }
        info!("Prepared {} distinct image(s).", prepared.len());
        Ok(prepared)
    }

    /// Prepares one resolved file: decode once, downscale once, re-encode.
    /// Consults the on-disk cache first when one is configured.
    pub fn prepare(&self, location: &Path) -> Result<PreparedImage> {
        if let Some(hit) = self.cache_load(location) {
            debug!("Image cache hit for {:?}", location);
            return Ok(hit);
        }
        let prepared = self.prepare_uncached(location)?;
        self.cache_store(location, &prepared);
        Ok(prepared)
    }

    fn prepare_uncached(&self, location: &Path) -> Result<PreparedImage> {
        let bytes = fs::read(location)
            .with_context(|| format!("Failed to read image file {:?}", location))?;
        let img = image::load_from_memory(&bytes)
            .with_context(|| format!("Failed to decode image {:?}", location))?;
        let (width, height) = img.dimensions();
        let longer = width.max(height);

        if longer > self.max_dimension {
            let resized = img.resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3);
            let (w, h) = resized.dimensions();
            debug!("Resized {:?}: {}x{} -> {}x{}", location, width, height, w, h);
            let jpeg = encode_jpeg(&resized, self.quality)?;
            return Ok(PreparedImage { jpeg, width: w, height: h });
        }

        // Already small enough. Re-compress JPEGs only when it actually
        // helps; everything else is converted to JPEG for embedding.
        let already_jpeg = image::guess_format(&bytes).is_ok_and(|f| f == ImageFormat::Jpeg);
        let encoded = encode_jpeg(&img, self.quality)?;
        let jpeg = if already_jpeg && (encoded.len() as f64) >= bytes.len() as f64 * MIN_REENCODE_GAIN
        {
            bytes
        } else {
            encoded
        };
        Ok(PreparedImage { jpeg, width, height })
    }

    /// Content key: source path plus mtime and size, so an edited photo
    /// invalidates its entry. Eviction is manual (delete the cache dir).
    fn cache_key(&self, location: &Path) -> Option<String> {
        let meta = fs::metadata(location).ok()?;
        let mtime = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(location.as_os_str().as_encoded_bytes());
        hasher.update(mtime.as_nanos().to_le_bytes());
        hasher.update(meta.len().to_le_bytes());
        hasher.update(self.max_dimension.to_le_bytes());
        hasher.update([self.quality]);
        Some(format!("{:x}", hasher.finalize()))
    }

    fn cache_path(&self, location: &Path) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        Some(dir.join(format!("{}.jpg", self.cache_key(location)?)))
    }

    fn cache_load(&self, location: &Path) -> Option<PreparedImage> {
        let path = self.cache_path(location)?;
        let jpeg = fs::read(&path).ok()?;
        let (width, height) = image::io::Reader::new(Cursor::new(&jpeg))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()?;
        Some(PreparedImage { jpeg, width, height })
    }

    fn cache_store(&self, location: &Path, prepared: &PreparedImage) {
        let Some(path) = self.cache_path(location) else { return };
        let write = self
            .cache_dir
            .as_ref()
            .map(|dir| fs::create_dir_all(dir))
            .unwrap_or(Ok(()))
            .and_then(|_| fs::write(&path, &prepared.jpeg));
        if let Err(e) = write {
            // Cache misses are recoverable; the build just re-prepares.
            warn!("Failed to write image cache entry {:?}: {}", path, e);
        }
    }
}

/// Encodes to baseline JPEG, flattening any alpha channel onto white first.
fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = if img.color().has_alpha() {
        flatten_onto_white(img)
    } else {
        img.to_rgb8()
    };
    let mut encoded = Vec::new();
    let mut cursor = Cursor::new(&mut encoded);
    rgb.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))
        .context("JPEG encoding failed")?;
    Ok(encoded)
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let a = src[3] as u16;
        for c in 0..3 {
            dst[c] = ((src[c] as u16 * a + 255 * (255 - a)) / 255) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_test_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        let img = RgbImage::from_pixel(w, h, Rgb([180, 40, 40]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn oversized_images_are_downscaled_preserving_aspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_png(dir.path(), "wide.png", 100, 50);
        let preparer = ImagePreparer::new(40, 85, None);
        let prepared = preparer.prepare(&path).unwrap();
        assert_eq!((prepared.width, prepared.height), (40, 20));
        assert!((prepared.aspect() - 2.0).abs() < 1e-3);
        // The embedded bytes really are JPEG.
        assert_eq!(image::guess_format(&prepared.jpeg).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn small_images_keep_their_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_png(dir.path(), "small.png", 30, 10);
        let preparer = ImagePreparer::new(2000, 85, None);
        let prepared = preparer.prepare(&path).unwrap();
        assert_eq!((prepared.width, prepared.height), (30, 10));
    }

    #[test]
    fn corrupt_input_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        fs::write(&path, b"not an image at all").unwrap();
        let preparer = ImagePreparer::new(2000, 85, None);
        assert!(preparer.prepare(&path).is_err());
    }

    #[test]
    fn disk_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let path = write_test_png(dir.path(), "c.png", 64, 32);
        let preparer = ImagePreparer::new(2000, 85, Some(cache.clone()));

        let first = preparer.prepare(&path).unwrap();
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 1);
        let second = preparer.prepare(&path).unwrap();
        assert_eq!(first.jpeg, second.jpeg);
        assert_eq!((second.width, second.height), (64, 32));
    }

    #[test]
    fn prefetch_records_a_warning_per_missing_asset() {
        let dir = tempfile::tempdir().unwrap();
        let present = write_test_png(dir.path(), "ok.jpg", 20, 20);
        let resolver = AssetResolver::new(vec![dir.path().to_path_buf()]);
        let preparer = ImagePreparer::new(2000, 85, None);

        let refs = vec![
            present.to_str().unwrap().to_string(),
            dir.path().join("missing.jpg").to_str().unwrap().to_string(),
        ];
        let mut warnings = Vec::new();
        let prepared = preparer.prefetch(&refs, &resolver, 2, &mut warnings).unwrap();

        assert_eq!(prepared.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(prepared.lookup(refs[0].as_str()).is_some());
        assert!(prepared.lookup(refs[1].as_str()).is_none());
    }
}

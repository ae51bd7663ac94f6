//! travelpress - Core Library
//!
//! This file contains the primary logic for the application, orchestrating
//! the different modules that turn a travel write-up into a paginated PDF
//! and a set of per-page raster images.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

// Define modules for different functionalities
pub mod asset_resolver;
pub mod document_builder;
pub mod error;
pub mod image_preparer;
pub mod layout;
pub mod rasterizer;
pub mod source_parser;
pub mod typesetter;

use error::{BuildError, BuildWarning};
use layout::{LayoutEngine, LayoutOptions, PageGeometry};
use rasterizer::RasterFormat;

/// Application configuration structure.
#[derive(Debug)]
pub struct Config {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub primary_font: Option<PathBuf>,
    pub cjk_font: Option<PathBuf>,
    pub geometry: PageGeometry,
    /// Storage roots tried in order when an image path does not resolve
    /// literally.
    pub roots: Vec<PathBuf>,
    pub image_max_dimension: u32,
    pub image_quality: u8,
    pub image_cache: Option<PathBuf>,
    pub raster_format: RasterFormat,
    pub raster_dpi: f32,
    pub layout_seed: u64,
    pub date: String,
    pub footer: Option<String>,
    pub report: Option<PathBuf>,
    pub workers: usize,
}

/// Summary written as JSON when `--report` is given.
#[derive(Debug, Serialize)]
struct BuildReport<'a> {
    source: &'a Path,
    pages: usize,
    images_embedded: usize,
    raster_files: usize,
    warnings: &'a [BuildWarning],
    elapsed_ms: u128,
}

/// The main function that orchestrates the document build.
pub fn run(config: Config) -> Result<()> {
    let started = Instant::now();
    info!("Initializing build with config: {:?}", config);
    let mut warnings: Vec<BuildWarning> = Vec::new();

    // 1. Read and parse the source document
    let raw = fs::read_to_string(&config.input).map_err(|source| BuildError::SourceUnreadable {
        path: config.input.clone(),
        source,
    })?;
    let blocks = source_parser::parse_source(&raw);
    let title = source_parser::document_title(&blocks).map(str::to_string);
    if blocks.is_empty() {
        warn!("Source document is empty; producing a single blank page.");
    }

    // 2. Load fonts
    let fonts = typesetter::FontBook::load(
        config.primary_font.as_deref(),
        config.cjk_font.as_deref(),
        &mut warnings,
    )?;

    // 3. Resolve and prepare every referenced image up front
    let refs: Vec<String> = blocks
        .iter()
        .filter_map(|b| match b {
            source_parser::Block::Image(img) => Some(img.path.clone()),
            _ => None,
        })
        .collect();
    let resolver = asset_resolver::AssetResolver::new(config.roots.clone());
    let preparer = image_preparer::ImagePreparer::new(
        config.image_max_dimension,
        config.image_quality,
        config.image_cache.clone(),
    );
    let images = preparer.prefetch(&refs, &resolver, config.workers, &mut warnings)?;

    // 4. Lay out pages
    let typesetter = typesetter::Typesetter::new(&fonts)?;
    let options = LayoutOptions {
        date: config.date.clone(),
        title: title.clone(),
        footer: config.footer.clone(),
        seed: config.layout_seed,
    };
    let pb = ProgressBar::new(blocks.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Laying out pages [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap()
            .progress_chars("##-"),
    );
    let mut engine =
        LayoutEngine::new(config.geometry, &typesetter, &images, options, &mut warnings);
    for block in &blocks {
        engine.process(block);
        pb.inc(1);
    }
    let document = engine.finish();
    pb.finish_with_message(format!("{} page(s)", document.page_count()));
    info!("Laid out {} page(s) from {} block(s).", document.page_count(), blocks.len());

    // 5. Write the PDF (atomically; a failure leaves no partial file)
    fs::create_dir_all(&config.output_dir).context("Failed to create output directory")?;
    let pdf_path = config.output_dir.join("document.pdf");
    document_builder::write_pdf(&document, &images, &fonts, title.as_deref(), &pdf_path)
        .map_err(|e| BuildError::Writer(format!("{e:#}")))?;

    // 6. Rasterize each page
    let raster_dir = config.output_dir.join("pages");
    let raster_files = rasterizer::rasterize_pages(
        &document,
        &images,
        &fonts,
        config.raster_format,
        config.raster_dpi,
        &raster_dir,
    )?;

    // 7. Report recovered problems once, at the end
    if !warnings.is_empty() {
        warn!("Build completed with {} warning(s):", warnings.len());
        for warning in &warnings {
            warn!("  - {warning}");
        }
    }

    // 8. Optional machine-readable report
    if let Some(report_path) = &config.report {
        let report = BuildReport {
            source: &config.input,
            pages: document.page_count(),
            images_embedded: images.len(),
            raster_files: raster_files.len(),
            warnings: &warnings,
            elapsed_ms: started.elapsed().as_millis(),
        };
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        fs::write(report_path, json)
            .with_context(|| format!("Failed to write report to {:?}", report_path))?;
        info!("Wrote build report to {:?}", report_path);
    }

    info!(
        "Build finished in {:.2}s: {} page(s), {} image(s), {} warning(s).",
        started.elapsed().as_secs_f64(),
        document.page_count(),
        images.len(),
        warnings.len()
    );
    Ok(())
}

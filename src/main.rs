//! travelpress - Main Application Entrypoint
//!
//! This file is responsible for parsing command-line arguments, initializing
//! the application environment (like logging), and dispatching the core
//! build logic.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use travelpress::layout::PageGeometry;
use travelpress::rasterizer::RasterFormat;
use travelpress::run;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

/// A command-line tool that turns a travel write-up into a paginated PDF and
/// per-page raster images.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the source document (plain text with image-path lines)
    #[arg(short, long)]
    input: PathBuf,

    /// Directory to save the output files
    #[arg(short, long, default_value = "out")]
    output: PathBuf,

    /// Path to the primary text font (.ttf); auto-detected when omitted
    #[arg(long)]
    primary_font: Option<PathBuf>,

    /// Path to the CJK fallback font (.ttf/.ttc); auto-detected when omitted
    #[arg(long)]
    cjk_font: Option<PathBuf>,

    /// Page width in points
    #[arg(long, default_value_t = 595.0)]
    page_width: f32,

    /// Page height in points
    #[arg(long, default_value_t = 842.0)]
    page_height: f32,

    #[arg(long, default_value_t = 50.0)]
    margin_left: f32,

    #[arg(long, default_value_t = 50.0)]
    margin_right: f32,

    /// Top margin in points (leaves room for the header)
    #[arg(long, default_value_t = 80.0)]
    margin_top: f32,

    /// Bottom margin in points (leaves room for the footer)
    #[arg(long, default_value_t = 60.0)]
    margin_bottom: f32,

    /// Storage root for image resolution; repeat in priority order
    #[arg(long = "root")]
    roots: Vec<PathBuf>,

    /// Longest edge (px) above which images are downscaled before embedding
    #[arg(long, default_value_t = 2000)]
    image_max_dimension: u32,

    /// JPEG quality for embedded images (1-100)
    #[arg(long, default_value_t = 92)]
    image_quality: u8,

    /// Directory for the prepared-image disk cache
    #[arg(long)]
    image_cache: Option<PathBuf>,

    /// Format of the per-page raster images
    #[arg(long, value_enum, default_value_t = RasterFormat::Jpeg)]
    raster_format: RasterFormat,

    /// Raster density in dots per inch
    #[arg(long, default_value_t = 300.0)]
    raster_dpi: f32,

    /// Seed for the image-row grouping; fixed seed, fixed layout
    #[arg(long, default_value_t = 0)]
    layout_seed: u64,

    /// Date text shown in the page header (e.g. "June 2025")
    #[arg(long)]
    date: Option<String>,

    /// Footer text shown on every page, bottom left
    #[arg(long)]
    footer: Option<String>,

    /// Write a JSON build report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Worker threads for image preparation
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Logging verbosity level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let args = Args::parse();

    // 1. Initialize Logger
    let log_level = match args.log_level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Starting travelpress...");

    // 2. Validate input path
    if !args.input.exists() {
        error!("Input file does not exist: {:?}", args.input);
        std::process::exit(1);
    }

    // 3. Create a configuration object from arguments
    let config = travelpress::Config {
        input: args.input,
        output_dir: args.output,
        primary_font: args.primary_font,
        cjk_font: args.cjk_font,
        geometry: PageGeometry {
            width: args.page_width,
            height: args.page_height,
            margin_left: args.margin_left,
            margin_right: args.margin_right,
            margin_top: args.margin_top,
            margin_bottom: args.margin_bottom,
        },
        roots: args.roots,
        image_max_dimension: args.image_max_dimension,
        image_quality: args.image_quality.clamp(1, 100),
        image_cache: args.image_cache,
        raster_format: args.raster_format,
        raster_dpi: args.raster_dpi,
        layout_seed: args.layout_seed,
        date: args.date.unwrap_or_default(),
        footer: args.footer,
        report: args.report,
        workers: args.workers,
    };

    // 4. Run the main build
    if let Err(e) = run(config) {
        error!("Build failed: {:#}", e);
        std::process::exit(2);
    }

    info!("Build completed successfully.");
}

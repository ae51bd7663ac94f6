//! Page Rasterizer Module
//!
//! Renders each finalized page straight from the page model into a raster
//! image, sharing the exact element geometry the PDF writer uses so the two
//! outputs cannot drift apart. Pages are written sequentially under
//! deterministic names; a failure on page N leaves pages 1..N-1 on disk.

use crate::error::BuildError;
use crate::image_preparer::PreparedImages;
use crate::layout::{Document, Element, Page, PAGE_BACKGROUND, PLACEHOLDER_COLOR, TEXT_COLOR};
use crate::typesetter::{FontBook, FontChoice};
use anyhow::{Context, Result};
use image::{ImageOutputFormat, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tiny_skia::{
    Color, FillRule, IntSize, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke, Transform,
};
use ttf_parser::{Face, GlyphId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RasterFormat {
    Jpeg,
    Png,
}

impl RasterFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RasterFormat::Jpeg => "jpg",
            RasterFormat::Png => "png",
        }
    }
}

/// Renders every page of the document to `output_dir` as
/// `page_0001.<ext>`, `page_0002.<ext>`, ... at the requested density.
/// Returns the written paths in page order.
pub fn rasterize_pages(
    document: &Document,
    images: &PreparedImages,
    fonts: &FontBook,
    format: RasterFormat,
    dpi: f32,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, BuildError> {
    let fail = |page: usize, e: anyhow::Error| BuildError::Rasterizer {
        page,
        reason: format!("{e:#}"),
    };

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create raster output directory {:?}", output_dir))
        .map_err(|e| fail(0, e))?;
    let primary = fonts.primary.face().map_err(|e| fail(0, e))?;
    let fallback = fonts.fallback.face().map_err(|e| fail(0, e))?;

    let pb = ProgressBar::new(document.page_count() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Rasterizing pages [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("##-"),
    );

    // Photos repeat across pages rarely but decode cost is high enough to
    // keep each decoded file around for the whole pass.
    let mut decoded: HashMap<PathBuf, image::DynamicImage> = HashMap::new();
    let mut written = Vec::with_capacity(document.page_count());

    for (i, page) in document.pages.iter().enumerate() {
        let number = i + 1;
        let pixmap = render_page(document, page, images, &primary, &fallback, dpi, &mut decoded)
            .map_err(|e| fail(number, e))?;
        let path = output_dir.join(format!("page_{number:04}.{}", format.extension()));
        save_pixmap(&pixmap, format, &path).map_err(|e| fail(number, e))?;
        written.push(path);
        pb.inc(1);
    }
    pb.finish_with_message("Pages rasterized");
    info!("Rasterized {} page(s) at {} dpi into {:?}.", written.len(), dpi, output_dir);
    Ok(written)
}

fn render_page(
    document: &Document,
    page: &Page,
    images: &PreparedImages,
    primary: &Face,
    fallback: &Face,
    dpi: f32,
    decoded: &mut HashMap<PathBuf, image::DynamicImage>,
) -> Result<Pixmap> {
    let s = dpi / 72.0;
    let px_w = (document.geometry.width * s).round().max(1.0) as u32;
    let px_h = (document.geometry.height * s).round().max(1.0) as u32;
    let mut pixmap = Pixmap::new(px_w, px_h)
        .with_context(|| format!("Invalid page pixel size {px_w}x{px_h}"))?;
    pixmap.fill(rgb_color(PAGE_BACKGROUND));

    for element in &page.elements {
        match element {
            Element::Text(line) => {
                let mut pen_x = line.x;
                for run in &line.runs {
                    let face = match run.font {
                        FontChoice::Primary => primary,
                        FontChoice::CjkFallback => fallback,
                    };
                    pen_x = draw_run(&mut pixmap, face, &run.text, line.size, pen_x, line.baseline, s);
                }
            }
            Element::Image(placed) => {
                let prepared = images.get(&placed.location).with_context(|| {
                    format!("Image vanished from the build cache: {:?}", placed.location)
                })?;
                if !decoded.contains_key(&placed.location) {
                    let img = image::load_from_memory(&prepared.jpeg).with_context(|| {
                        format!("Failed to decode prepared image {:?}", placed.location)
                    })?;
                    decoded.insert(placed.location.clone(), img);
                }
                let source = &decoded[&placed.location];
                draw_image(&mut pixmap, source, placed.x, placed.y, placed.width, placed.height, s)?;
            }
            Element::Placeholder(frame) => {
                let rect = tiny_skia::Rect::from_xywh(
                    frame.x * s,
                    frame.y * s,
                    frame.width * s,
                    frame.height * s,
                )
                .context("Degenerate placeholder rectangle")?;
                let path = PathBuilder::from_rect(rect);
                let mut paint = Paint::default();
                paint.set_color(rgb_color(PLACEHOLDER_COLOR));
                paint.anti_alias = true;
                pixmap.stroke_path(
                    &path,
                    &paint,
                    &Stroke { width: s, ..Stroke::default() },
                    Transform::identity(),
                    None,
                );
            }
        }
    }
    Ok(pixmap)
}

/// Fills one run of glyphs and returns the advanced pen position (points).
fn draw_run(
    pixmap: &mut Pixmap,
    face: &Face,
    text: &str,
    size: f32,
    mut pen_x: f32,
    baseline: f32,
    device_scale: f32,
) -> f32 {
    let upem = face.units_per_em().max(1) as f32;
    let glyph_scale = size / upem;
    let mut paint = Paint::default();
    paint.set_color(rgb_color(TEXT_COLOR));
    paint.anti_alias = true;

    for c in text.chars() {
        let Some(gid) = face.glyph_index(c) else {
            pen_x += size * 0.5;
            continue;
        };
        let mut builder = GlyphPathBuilder::new(glyph_scale);
        if face.outline_glyph(gid, &mut builder).is_some() {
            if let Some(path) = builder.finish() {
                // Outlines are y-up around the baseline; flip into the
                // top-down device grid.
                let transform = Transform::from_row(
                    device_scale,
                    0.0,
                    0.0,
                    -device_scale,
                    pen_x * device_scale,
                    baseline * device_scale,
                );
                pixmap.fill_path(&path, &paint, FillRule::Winding, transform, None);
            }
        }
        pen_x += face
            .glyph_hor_advance(gid)
            .map(|adv| adv as f32 * glyph_scale)
            .unwrap_or(size * 0.5);
    }
    pen_x
}

fn draw_image(
    pixmap: &mut Pixmap,
    source: &image::DynamicImage,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    device_scale: f32,
) -> Result<()> {
    let px_w = (width * device_scale).round().max(1.0) as u32;
    let px_h = (height * device_scale).round().max(1.0) as u32;
    let resized = source
        .resize_exact(px_w, px_h, image::imageops::FilterType::Lanczos3)
        .to_rgba8();

    // tiny-skia wants premultiplied RGBA.
    let mut data = resized.into_raw();
    for px in data.chunks_exact_mut(4) {
        let a = px[3] as u16;
        for c in 0..3 {
            px[c] = ((px[c] as u16 * a) / 255) as u8;
        }
    }
    let size = IntSize::from_wh(px_w, px_h).context("Degenerate image size")?;
    let tile = Pixmap::from_vec(data, size).context("Image buffer size mismatch")?;
    pixmap.draw_pixmap(
        (x * device_scale).round() as i32,
        (y * device_scale).round() as i32,
        tile.as_ref(),
        &PixmapPaint::default(),
        Transform::identity(),
        None,
    );
    Ok(())
}

fn save_pixmap(pixmap: &Pixmap, format: RasterFormat, path: &Path) -> Result<()> {
    match format {
        RasterFormat::Png => pixmap
            .save_png(path)
            .with_context(|| format!("Failed to write {:?}", path)),
        RasterFormat::Jpeg => {
            let mut rgb = RgbImage::new(pixmap.width(), pixmap.height());
            for (dst, src) in rgb.pixels_mut().zip(pixmap.pixels()) {
                let c = src.demultiply();
                *dst = image::Rgb([c.red(), c.green(), c.blue()]);
            }
            let mut encoded = Vec::new();
            // Maximum quality: these are archival proofs of the pages.
            rgb.write_to(&mut Cursor::new(&mut encoded), ImageOutputFormat::Jpeg(100))
                .context("JPEG encoding failed")?;
            std::fs::write(path, encoded).with_context(|| format!("Failed to write {:?}", path))
        }
    }
}

fn rgb_color(c: [f32; 3]) -> Color {
    Color::from_rgba(c[0], c[1], c[2], 1.0).unwrap_or(Color::BLACK)
}

/// Builds a tiny-skia path from a glyph outline, scaling font units to
/// points as it goes.
struct GlyphPathBuilder {
    path: PathBuilder,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(scale: f32) -> Self {
        GlyphPathBuilder { path: PathBuilder::new(), scale }
    }

    fn finish(self) -> Option<tiny_skia::Path> {
        self.path.finish()
    }
}

impl ttf_parser::OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        self.path.move_to(x * self.scale, y * self.scale);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.path.line_to(x * self.scale, y * self.scale);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        self.path.quad_to(x1 * self.scale, y1 * self.scale, x * self.scale, y * self.scale);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.path.cubic_to(
            x1 * self.scale,
            y1 * self.scale,
            x2 * self.scale,
            y2 * self.scale,
            x * self.scale,
            y * self.scale,
        );
    }

    fn close(&mut self) {
        self.path.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{PageGeometry, PlaceholderBox};

    fn one_page_document() -> Document {
        Document {
            geometry: PageGeometry {
                width: 72.0,
                height: 144.0,
                margin_left: 4.0,
                margin_right: 4.0,
                margin_top: 4.0,
                margin_bottom: 4.0,
            },
            pages: vec![Page {
                elements: vec![Element::Placeholder(PlaceholderBox {
                    x: 4.0,
                    y: 4.0,
                    width: 64.0,
                    height: 20.0,
                })],
            }],
        }
    }

    #[test]
    fn pages_are_written_with_sequential_zero_padded_names() {
        let mut warnings = Vec::new();
        let Ok(fonts) = FontBook::load(None, None, &mut warnings) else { return };
        let dir = tempfile::tempdir().unwrap();
        let images = PreparedImages::default();

        let mut document = one_page_document();
        document.pages.push(document.pages[0].clone());

        let written =
            rasterize_pages(&document, &images, &fonts, RasterFormat::Png, 72.0, dir.path())
                .unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("page_0001.png"));
        assert!(written[1].ends_with("page_0002.png"));
        assert!(written.iter().all(|p| p.is_file()));
    }

    #[test]
    fn raster_density_scales_pixel_dimensions() {
        let mut warnings = Vec::new();
        let Ok(fonts) = FontBook::load(None, None, &mut warnings) else { return };
        let dir = tempfile::tempdir().unwrap();
        let images = PreparedImages::default();
        let document = one_page_document();

        rasterize_pages(&document, &images, &fonts, RasterFormat::Png, 144.0, dir.path()).unwrap();
        let (w, h) = image::image_dimensions(dir.path().join("page_0001.png")).unwrap();
        // 72x144 points at 144 dpi is exactly double the point size.
        assert_eq!((w, h), (144, 288));
    }

    #[test]
    fn jpeg_format_uses_the_jpg_extension() {
        assert_eq!(RasterFormat::Jpeg.extension(), "jpg");
        assert_eq!(RasterFormat::Png.extension(), "png");
    }
}

//! Page Layout Engine Module
//!
//! Consumes the parsed block stream strictly in document order and produces
//! fixed-size pages: wrapped text lines, image rows, placeholder boxes, and
//! header/footer furniture. Page-number labels are deferred until the total
//! count is known and patched in during `finish`, so a placeholder can never
//! leak into the output.

use crate::error::BuildWarning;
use crate::image_preparer::PreparedImages;
use crate::source_parser::{Block, ImageBlock, TextBlock, TextKind};
use crate::typesetter::{StyledRun, TextMeasure, line_width, segment_scripts, wrap_styled};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

/// Dark page theme carried over from the portfolio layouts this tool grew
/// out of: black pages, white text.
pub const PAGE_BACKGROUND: [f32; 3] = [0.0, 0.0, 0.0];
pub const TEXT_COLOR: [f32; 3] = [1.0, 1.0, 1.0];
pub const PLACEHOLDER_COLOR: [f32; 3] = [0.6, 0.6, 0.6];

/// Points between images in a row, and below each row.
const ROW_H_MARGIN: f32 = 4.0;
const ROW_V_MARGIN: f32 = 10.0;
/// Aspect-ratio thresholds for image grouping.
const PANORAMIC_ASPECT: f32 = 2.0;
const VERTICAL_ASPECT: f32 = 0.9;
/// Relative odds of grouping standard images into rows of one, two, three.
const ROW_SIZE_WEIGHTS: [(usize, f32); 3] = [(1, 0.18), (2, 0.60), (3, 0.22)];

const PARAGRAPH_SPACER: f32 = 6.0;
const PLACEHOLDER_HEIGHT: f32 = 40.0;
const FURNITURE_SIZE: f32 = 6.0;
const HEADER_BASELINE: f32 = 12.0;
const FOOTER_RISE: f32 = 10.0;

/// Fixed page geometry for one build. All values in points; the y axis runs
/// top-down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width: f32,
    pub height: f32,
    pub margin_left: f32,
    pub margin_right: f32,
    pub margin_top: f32,
    pub margin_bottom: f32,
}

impl PageGeometry {
    pub fn frame_width(&self) -> f32 {
        self.width - self.margin_left - self.margin_right
    }

    pub fn frame_height(&self) -> f32 {
        self.height - self.margin_top - self.margin_bottom
    }

    pub fn frame_bottom(&self) -> f32 {
        self.height - self.margin_bottom
    }
}

/// A line of text placed at an absolute baseline position.
#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub x: f32,
    pub baseline: f32,
    pub size: f32,
    pub runs: Vec<StyledRun>,
}

/// An image placed at an absolute position with its scaled display size.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedImage {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Key into [`PreparedImages`] by resolved location.
    pub location: PathBuf,
}

/// A bordered box standing in for an image that could not be resolved or
/// prepared. The caption is a separate [`Element::Text`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Text(TextLine),
    Image(PlacedImage),
    Placeholder(PlaceholderBox),
}

/// A finalized page. Only `finish` can produce these, with the page label
/// already patched in.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub elements: Vec<Element>,
}

/// The finalized, immutable document handed to the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub geometry: PageGeometry,
    pub pages: Vec<Page>,
}

impl Document {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Non-geometry inputs to a layout run.
#[derive(Debug, Clone)]
pub struct LayoutOptions {
    /// Shown in the page header, top left.
    pub date: String,
    /// First document heading; shown centered in the header.
    pub title: Option<String>,
    /// Optional footer text, bottom left.
    pub footer: Option<String>,
    /// Seed for the weighted image-row grouping; a fixed seed makes builds
    /// reproducible.
    pub seed: u64,
}

struct TextStyle {
    size: f32,
    leading: f32,
    space_after: f32,
    centered: bool,
}

fn style_for(kind: TextKind) -> TextStyle {
    match kind {
        TextKind::Body | TextKind::Bullet => {
            TextStyle { size: 11.0, leading: 16.0, space_after: 0.0, centered: false }
        }
        TextKind::Heading(1) => TextStyle { size: 30.0, leading: 36.0, space_after: 20.0, centered: false },
        TextKind::Heading(2) => TextStyle { size: 20.0, leading: 30.0, space_after: 6.0, centered: false },
        // Level three is the title style in the source documents: larger
        // than level two and centered.
        TextKind::Heading(_) => TextStyle { size: 25.0, leading: 30.0, space_after: 20.0, centered: true },
    }
}

/// An image that survived resolution and preparation, ready for grouping.
struct RowEntry {
    location: PathBuf,
    aspect: f32,
    full_width: bool,
}

/// Stateful engine fed one block at a time; call `finish` to obtain the
/// numbered document.
pub struct LayoutEngine<'a, M: TextMeasure> {
    geom: PageGeometry,
    measure: &'a M,
    images: &'a PreparedImages,
    options: LayoutOptions,
    warnings: &'a mut Vec<BuildWarning>,
    rng: StdRng,
    pages: Vec<Vec<Element>>,
    current: Vec<Element>,
    cursor: f32,
    /// Blank lines directly after a heading add no extra space.
    after_heading: bool,
    /// Consecutive image references buffer here until a non-image block (or
    /// the end of input) closes the section.
    image_section: Vec<ImageBlock>,
}

impl<'a, M: TextMeasure> LayoutEngine<'a, M> {
    pub fn new(
        geom: PageGeometry,
        measure: &'a M,
        images: &'a PreparedImages,
        options: LayoutOptions,
        warnings: &'a mut Vec<BuildWarning>,
    ) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        let mut engine = LayoutEngine {
            geom,
            measure,
            images,
            options,
            warnings,
            rng,
            pages: Vec::new(),
            current: Vec::new(),
            cursor: geom.margin_top,
            after_heading: false,
            image_section: Vec::new(),
        };
        engine.current = engine.page_furniture();
        engine
    }

    /// Consumes one block. Image blocks accumulate into a section so that
    /// consecutive photos can be grouped into rows.
    pub fn process(&mut self, block: &Block) {
        match block {
            Block::Image(image) => self.image_section.push(image.clone()),
            Block::Text(text) => {
                self.flush_image_section();
                self.layout_text(text);
            }
            Block::Break => {
                self.flush_image_section();
                self.layout_break();
            }
        }
    }

    /// Closes the last section, numbers every page, and returns the
    /// finalized document.
    pub fn finish(mut self) -> Document {
        self.flush_image_section();
        let mut pages = std::mem::take(&mut self.pages);
        pages.push(std::mem::take(&mut self.current));

        let total = pages.len();
        let finalized = pages
            .into_iter()
            .enumerate()
            .map(|(i, mut elements)| {
                elements.push(Element::Text(self.page_label(i + 1, total)));
                Page { elements }
            })
            .collect();
        Document { geometry: self.geom, pages: finalized }
    }

    // --- text flow ---

    fn layout_text(&mut self, block: &TextBlock) {
        let style = style_for(block.kind);
        let runs = segment_scripts(&block.text);
        let lines = wrap_styled(self.measure, &runs, style.size, self.geom.frame_width());

        for line in lines {
            if self.cursor + style.leading > self.geom.frame_bottom() {
                self.start_new_page();
            }
            let x = if style.centered {
                self.geom.margin_left + (self.geom.frame_width() - line_width(&line)).max(0.0) / 2.0
            } else {
                self.geom.margin_left
            };
            self.current.push(Element::Text(TextLine {
                x,
                baseline: self.cursor + style.size,
                size: style.size,
                runs: line,
            }));
            self.cursor += style.leading;
        }
        self.cursor += style.space_after;
        self.after_heading = matches!(block.kind, TextKind::Heading(_));
    }

    fn layout_break(&mut self) {
        if self.cursor <= self.geom.margin_top || self.after_heading {
            self.after_heading = false;
            return;
        }
        self.cursor += PARAGRAPH_SPACER;
    }

    // --- image sections ---

    fn flush_image_section(&mut self) {
        if self.image_section.is_empty() {
            return;
        }
        self.after_heading = false;
        let section = std::mem::take(&mut self.image_section);

        let mut available = Vec::new();
        for block in &section {
            match self.images.lookup(&block.path) {
                Some((location, prepared)) => available.push(RowEntry {
                    location: location.to_path_buf(),
                    aspect: prepared.aspect(),
                    full_width: block.full_width,
                }),
                // The prefetch pass already recorded the warning; here the
                // miss degrades to a visible placeholder.
                None => self.place_placeholder(&block.path),
            }
        }

        for row in self.group_rows(available) {
            self.place_row(&row);
        }
    }

    /// Groups a section's surviving images into rows: vertical shots pair
    /// up, full-width-flagged and panoramic shots stand alone, and the rest
    /// are grouped one to three across by seeded weighted choice.
    fn group_rows(&mut self, entries: Vec<RowEntry>) -> Vec<Vec<RowEntry>> {
        let mut verticals = Vec::new();
        let mut fulls = Vec::new();
        let mut panoramics = Vec::new();
        let mut others = Vec::new();
        for e in entries {
            if e.full_width {
                fulls.push(e);
            } else if e.aspect < VERTICAL_ASPECT {
                verticals.push(e);
            } else if e.aspect >= PANORAMIC_ASPECT {
                panoramics.push(e);
            } else {
                others.push(e);
            }
        }

        let mut rows: Vec<Vec<RowEntry>> = Vec::new();
        let mut vert_iter = verticals.into_iter().peekable();
        while let Some(first) = vert_iter.next() {
            match vert_iter.next() {
                Some(second) => rows.push(vec![first, second]),
                // A lone vertical flows with the standard images instead.
                None => others.insert(0, first),
            }
        }
        rows.extend(fulls.into_iter().map(|e| vec![e]));
        rows.extend(panoramics.into_iter().map(|e| vec![e]));

        let mut rest = others.into_iter().peekable();
        while rest.peek().is_some() {
            let remaining = rest.len();
            let take = if remaining == 1 { 1 } else { self.pick_row_size(remaining) };
            rows.push(rest.by_ref().take(take).collect());
        }
        rows
    }

    fn pick_row_size(&mut self, remaining: usize) -> usize {
        let choices: Vec<(usize, f32)> = ROW_SIZE_WEIGHTS
            .iter()
            .copied()
            .filter(|(n, _)| *n <= remaining)
            .collect();
        let total: f32 = choices.iter().map(|(_, w)| w).sum();
        let mut roll = self.rng.random_range(0.0..total);
        for (n, w) in &choices {
            if roll < *w {
                return *n;
            }
            roll -= w;
        }
        choices.last().map(|(n, _)| *n).unwrap_or(1)
    }

    /// Places one row of images, all scaled to a common height, centered
    /// within the frame.
    fn place_row(&mut self, entries: &[RowEntry]) {
        let n = entries.len();
        let margins = (n.saturating_sub(1)) as f32 * ROW_H_MARGIN;
        let available = self.geom.frame_width() - margins;
        let aspect_sum: f32 = entries.iter().map(|e| e.aspect).sum();
        if aspect_sum <= 0.0 {
            return;
        }

        let mut row_height = available / aspect_sum;
        if row_height > self.geom.frame_height() {
            // Cannot fit even an empty page at full width; force-scale down.
            row_height = self.geom.frame_height();
            self.warnings.push(BuildWarning::OverflowScaled {
                what: format!("image row ({} image(s))", n),
            });
        }

        if self.cursor + row_height > self.geom.frame_bottom() && self.cursor > self.geom.margin_top
        {
            self.start_new_page();
        }

        let row_width = row_height * aspect_sum + margins;
        let mut x = self.geom.margin_left + (self.geom.frame_width() - row_width).max(0.0) / 2.0;
        for e in entries {
            let width = row_height * e.aspect;
            self.current.push(Element::Image(PlacedImage {
                x,
                y: self.cursor,
                width,
                height: row_height,
                location: e.location.clone(),
            }));
            x += width + ROW_H_MARGIN;
        }
        self.cursor += row_height + ROW_V_MARGIN;
    }

    fn place_placeholder(&mut self, path: &str) {
        if self.cursor + PLACEHOLDER_HEIGHT > self.geom.frame_bottom()
            && self.cursor > self.geom.margin_top
        {
            self.start_new_page();
        }
        self.current.push(Element::Placeholder(PlaceholderBox {
            x: self.geom.margin_left,
            y: self.cursor,
            width: self.geom.frame_width(),
            height: PLACEHOLDER_HEIGHT,
        }));
        let caption = self.styled_line(&format!("[missing image: {path}]"), 11.0);
        self.current.push(Element::Text(TextLine {
            x: self.geom.margin_left + 8.0,
            baseline: self.cursor + PLACEHOLDER_HEIGHT / 2.0 + 4.0,
            size: 11.0,
            runs: caption,
        }));
        self.cursor += PLACEHOLDER_HEIGHT + ROW_V_MARGIN;
    }

    // --- page management ---

    fn start_new_page(&mut self) {
        let furniture = self.page_furniture();
        let finished = std::mem::replace(&mut self.current, furniture);
        self.pages.push(finished);
        self.cursor = self.geom.margin_top;
    }

    /// Header and footer elements every page carries from the start. The
    /// page-number label is deliberately absent here; it is patched in by
    /// `finish` once the total is known.
    fn page_furniture(&self) -> Vec<Element> {
        let mut elements = Vec::new();
        if !self.options.date.is_empty() {
            let runs = self.styled_line(&self.options.date, FURNITURE_SIZE);
            elements.push(Element::Text(TextLine {
                x: self.geom.margin_left,
                baseline: HEADER_BASELINE,
                size: FURNITURE_SIZE,
                runs,
            }));
        }
        if let Some(title) = &self.options.title {
            let runs = self.styled_line(title, FURNITURE_SIZE);
            let x = (self.geom.width - line_width(&runs)).max(0.0) / 2.0;
            elements.push(Element::Text(TextLine {
                x,
                baseline: HEADER_BASELINE,
                size: FURNITURE_SIZE,
                runs,
            }));
        }
        if let Some(footer) = &self.options.footer {
            let runs = self.styled_line(footer, FURNITURE_SIZE);
            elements.push(Element::Text(TextLine {
                x: self.geom.margin_left,
                baseline: self.geom.height - FOOTER_RISE,
                size: FURNITURE_SIZE,
                runs,
            }));
        }
        elements
    }

    fn page_label(&self, number: usize, total: usize) -> TextLine {
        let runs = self.styled_line(&format!("{number} of {total}"), FURNITURE_SIZE);
        TextLine {
            x: self.geom.width - self.geom.margin_right - line_width(&runs),
            baseline: self.geom.height - FOOTER_RISE,
            size: FURNITURE_SIZE,
            runs,
        }
    }

    fn styled_line(&self, text: &str, size: f32) -> Vec<StyledRun> {
        segment_scripts(text)
            .into_iter()
            .map(|(font, text)| {
                let width = self.measure.width(font, &text, size);
                StyledRun { font, text, width }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_parser::parse_source;
    use crate::typesetter::FontChoice;

    /// Half a size unit per char, any font.
    struct FakeMeasure;

    impl TextMeasure for FakeMeasure {
        fn width(&self, _font: FontChoice, text: &str, size: f32) -> f32 {
            text.chars().count() as f32 * size * 0.5
        }
    }

    fn small_geometry() -> PageGeometry {
        PageGeometry {
            width: 200.0,
            height: 120.0,
            margin_left: 10.0,
            margin_right: 10.0,
            margin_top: 20.0,
            margin_bottom: 20.0,
        }
    }

    fn options(seed: u64) -> LayoutOptions {
        LayoutOptions { date: "June 2024".into(), title: None, footer: None, seed }
    }

    fn build(src: &str, geom: PageGeometry, seed: u64) -> (Document, Vec<BuildWarning>) {
        let images = PreparedImages::default();
        let mut warnings = Vec::new();
        let blocks = parse_source(src);
        let mut engine = LayoutEngine::new(geom, &FakeMeasure, &images, options(seed), &mut warnings);
        for block in &blocks {
            engine.process(block);
        }
        (engine.finish(), warnings)
    }

    fn page_texts(page: &Page) -> String {
        page.elements
            .iter()
            .filter_map(|e| match e {
                Element::Text(t) => {
                    Some(t.runs.iter().map(|r| r.text.as_str()).collect::<String>())
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn text_only_page_count_matches_lines_per_page() {
        // Frame is 80pt tall, body leading is 16pt: five lines per page.
        let src = (0..12).map(|i| format!("line {i}\n\n")).collect::<String>();
        let (doc, _) = build(&src, small_geometry(), 1);
        // 12 one-line paragraphs with 6pt spacers: each costs 22pt except
        // the first per page; 80pt fits 3 per page plus the one that starts
        // at the spacer boundary.
        let total_lines: usize = doc
            .pages
            .iter()
            .map(|p| page_texts(p).matches("line").count())
            .sum();
        assert_eq!(total_lines, 12);
        assert!(doc.page_count() > 1);
    }

    #[test]
    fn every_page_gets_a_final_label_and_no_placeholder_leaks() {
        let src = (0..30).map(|i| format!("paragraph {i}\n\n")).collect::<String>();
        let (doc, _) = build(&src, small_geometry(), 1);
        let total = doc.page_count();
        for (i, page) in doc.pages.iter().enumerate() {
            let label = format!("{} of {}", i + 1, total);
            assert!(
                page_texts(page).contains(&label),
                "page {} missing label {label:?}",
                i + 1
            );
        }
    }

    #[test]
    fn missing_image_degrades_to_placeholder_and_build_completes() {
        let src = "Intro text.\n/roots/local/missing.jpg\nMore text.\n";
        let (doc, _) = build(src, small_geometry(), 1);
        let all: String = doc.pages.iter().map(page_texts).collect();
        assert!(all.contains("Intro text."));
        assert!(all.contains("[missing image: /roots/local/missing.jpg]"));
        assert!(all.contains("More text."));
        assert!(doc.pages.iter().any(|p| {
            p.elements.iter().any(|e| matches!(e, Element::Placeholder(_)))
        }));
    }

    #[test]
    fn placed_images_preserve_aspect_ratio() {
        let mut images = PreparedImages::default();
        let location = PathBuf::from("/resolved/photo1.jpg");
        images.by_raw.insert("/roots/local/photo1.jpg".into(), location.clone());
        images.by_location.insert(
            location,
            crate::image_preparer::PreparedImage { jpeg: vec![0xff], width: 1500, height: 1000 },
        );

        let mut warnings = Vec::new();
        let blocks = parse_source("/roots/local/photo1.jpg\n");
        let mut engine =
            LayoutEngine::new(small_geometry(), &FakeMeasure, &images, options(1), &mut warnings);
        for block in &blocks {
            engine.process(block);
        }
        let doc = engine.finish();

        let placed: Vec<&PlacedImage> = doc
            .pages
            .iter()
            .flat_map(|p| &p.elements)
            .filter_map(|e| match e {
                Element::Image(i) => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(placed.len(), 1);
        let ratio = placed[0].width / placed[0].height;
        assert!((ratio - 1.5).abs() < 1e-3, "aspect drifted: {ratio}");
    }

    #[test]
    fn layout_is_deterministic_for_a_fixed_seed() {
        let src = "photos:\n/a/1.jpg\n/a/2.jpg\n/a/3.jpg\nend\n";
        let (a, _) = build(src, small_geometry(), 42);
        let (b, _) = build(src, small_geometry(), 42);
        assert_eq!(a, b);
    }

    #[test]
    fn oversized_row_is_scaled_down_with_a_warning() {
        let mut images = PreparedImages::default();
        let location = PathBuf::from("/resolved/tall.jpg");
        images.by_raw.insert("/a/tall.jpg".into(), location.clone());
        images.by_location.insert(
            location,
            // Aspect 0.2: natural height at frame width far exceeds the page.
            crate::image_preparer::PreparedImage { jpeg: vec![0xff], width: 200, height: 1000 },
        );

        let mut warnings = Vec::new();
        let blocks = parse_source("/a/tall.jpg\n");
        let mut engine =
            LayoutEngine::new(small_geometry(), &FakeMeasure, &images, options(1), &mut warnings);
        for block in &blocks {
            engine.process(block);
        }
        let doc = engine.finish();

        let image = doc
            .pages
            .iter()
            .flat_map(|p| &p.elements)
            .find_map(|e| match e {
                Element::Image(i) => Some(i),
                _ => None,
            })
            .unwrap();
        assert!(image.height <= small_geometry().frame_height() + 1e-3);
        assert!(warnings.iter().any(|w| matches!(w, BuildWarning::OverflowScaled { .. })));
    }
}

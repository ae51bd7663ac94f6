//! Document Builder Module
//!
//! Serializes a finalized page model into a single PDF. Text is written as
//! real text runs against two embedded TrueType fonts (Identity-H encoded,
//! with a ToUnicode map so copy/paste works), images are embedded once per
//! distinct file as DCT-compressed XObjects, and the whole byte buffer is
//! committed atomically so a failure never leaves a partial artifact behind.

use crate::image_preparer::PreparedImages;
use crate::layout::{Document, Element, PAGE_BACKGROUND, PLACEHOLDER_COLOR, TEXT_COLOR};
use crate::typesetter::{FontBook, FontChoice, LoadedFont};
use anyhow::{Context, Result};
use log::info;
use pdf_writer::types::{CidFontType, FontFlags, SystemInfo, UnicodeCmap};
use pdf_writer::{Content, Filter, Finish, Name, Pdf, Rect, Ref, Str, TextStr};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use ttf_parser::{Face, GlyphId};

/// Resource names under which the two fonts appear in every page's
/// resource dictionary.
const PRIMARY_FONT_NAME: &[u8] = b"F1";
const FALLBACK_FONT_NAME: &[u8] = b"F2";

/// Object references for one embedded font.
struct FontRefs {
    type0: Ref,
}

/// Builds the complete PDF in memory and writes it atomically.
pub fn write_pdf(
    document: &Document,
    images: &PreparedImages,
    fonts: &FontBook,
    title: Option<&str>,
    output_path: &Path,
) -> Result<()> {
    let bytes = build_pdf(document, images, fonts, title)?;
    write_atomic(output_path, &bytes)?;
    info!("Wrote {} page(s) to {:?} ({} bytes).", document.page_count(), output_path, bytes.len());
    Ok(())
}

fn build_pdf(
    document: &Document,
    images: &PreparedImages,
    fonts: &FontBook,
    title: Option<&str>,
) -> Result<Vec<u8>> {
    let primary_face = fonts.primary.face()?;
    let fallback_face = fonts.fallback.face()?;
    let used = collect_used_glyphs(document, &primary_face, &fallback_face);

    let mut pdf = Pdf::new();
    let mut ref_counter = std::iter::successors(Some(1), |n| Some(n + 1));
    let mut alloc = move || Ref::new(ref_counter.next().unwrap());

    let catalog_ref = alloc();
    let page_tree_ref = alloc();
    let info_ref = alloc();
    pdf.catalog(catalog_ref).pages(page_tree_ref);
    {
        let mut info = pdf.document_info(info_ref);
        if let Some(title) = title {
            info.title(TextStr(title));
        }
        // No creation date: the same input must produce identical bytes.
        info.producer(TextStr(concat!("travelpress ", env!("CARGO_PKG_VERSION"))));
    }

    let primary_refs = embed_font(
        &mut pdf,
        &mut alloc,
        &fonts.primary,
        &primary_face,
        used.get(&FontChoice::Primary),
    )?;
    // Without a distinct CJK font both resource names point at one embed.
    let fallback_refs = if fonts.has_cjk {
        embed_font(
            &mut pdf,
            &mut alloc,
            &fonts.fallback,
            &fallback_face,
            used.get(&FontChoice::CjkFallback),
        )?
    } else {
        FontRefs { type0: primary_refs.type0 }
    };

    // One XObject per distinct prepared file, shared by every reference.
    let mut image_refs: HashMap<PathBuf, (Ref, String)> = HashMap::new();
    for page in &document.pages {
        for element in &page.elements {
            if let Element::Image(placed) = element {
                if image_refs.contains_key(&placed.location) {
                    continue;
                }
                let prepared = images
                    .get(&placed.location)
                    .with_context(|| format!("Image vanished from the build cache: {:?}", placed.location))?;
                let r = alloc();
                let name = format!("Im{}", image_refs.len() + 1);
                let mut xobject = pdf.image_xobject(r, &prepared.jpeg);
                xobject.filter(Filter::DctDecode);
                xobject.width(prepared.width as i32);
                xobject.height(prepared.height as i32);
                xobject.color_space().device_rgb();
                xobject.bits_per_component(8);
                xobject.finish();
                image_refs.insert(placed.location.clone(), (r, name));
            }
        }
    }

    let page_refs: Vec<Ref> = document.pages.iter().map(|_| alloc()).collect();
    for (page, &page_ref) in document.pages.iter().zip(&page_refs) {
        let content_ref = alloc();
        let content = render_page(document, page, &primary_face, &fallback_face, &image_refs);
        pdf.stream(content_ref, &content.finish());

        let mut page_writer = pdf.page(page_ref);
        page_writer.media_box(Rect::new(0.0, 0.0, document.geometry.width, document.geometry.height));
        page_writer.parent(page_tree_ref);
        page_writer.contents(content_ref);
        let mut resources = page_writer.resources();
        let mut font_dict = resources.fonts();
        font_dict.pair(Name(PRIMARY_FONT_NAME), primary_refs.type0);
        font_dict.pair(Name(FALLBACK_FONT_NAME), fallback_refs.type0);
        font_dict.finish();
        let mut xobjects = resources.x_objects();
        for (r, name) in image_refs.values() {
            xobjects.pair(Name(name.as_bytes()), *r);
        }
        xobjects.finish();
        resources.finish();
        page_writer.finish();
    }

    pdf.pages(page_tree_ref).kids(page_refs).count(document.page_count() as i32);
    Ok(pdf.finish())
}

/// Emits the content stream for one page: background first, then elements
/// in layout order. Layout coordinates are top-down; PDF's are bottom-up.
fn render_page(
    document: &Document,
    page: &crate::layout::Page,
    primary: &Face,
    fallback: &Face,
    image_refs: &HashMap<PathBuf, (Ref, String)>,
) -> Content {
    let page_h = document.geometry.height;
    let mut content = Content::new();

    content.set_fill_rgb(PAGE_BACKGROUND[0], PAGE_BACKGROUND[1], PAGE_BACKGROUND[2]);
    content.rect(0.0, 0.0, document.geometry.width, page_h);
    content.fill_nonzero();

    for element in &page.elements {
        match element {
            Element::Text(line) => {
                content.begin_text();
                content.set_fill_rgb(TEXT_COLOR[0], TEXT_COLOR[1], TEXT_COLOR[2]);
                let mut x = line.x;
                for run in &line.runs {
                    let (name, face) = match run.font {
                        FontChoice::Primary => (PRIMARY_FONT_NAME, primary),
                        FontChoice::CjkFallback => (FALLBACK_FONT_NAME, fallback),
                    };
                    content.set_font(Name(name), line.size);
                    content.set_text_matrix([1.0, 0.0, 0.0, 1.0, x, page_h - line.baseline]);
                    content.show(Str(&glyph_string(face, &run.text)));
                    x += run.width;
                }
                content.end_text();
            }
            Element::Image(placed) => {
                if let Some((_, name)) = image_refs.get(&placed.location) {
                    content.save_state();
                    content.transform([
                        placed.width,
                        0.0,
                        0.0,
                        placed.height,
                        placed.x,
                        page_h - placed.y - placed.height,
                    ]);
                    content.x_object(Name(name.as_bytes()));
                    content.restore_state();
                }
            }
            Element::Placeholder(frame) => {
                content.set_stroke_rgb(PLACEHOLDER_COLOR[0], PLACEHOLDER_COLOR[1], PLACEHOLDER_COLOR[2]);
                content.set_line_width(1.0);
                content.rect(frame.x, page_h - frame.y - frame.height, frame.width, frame.height);
                content.stroke();
            }
        }
    }
    content
}

/// Encodes text for an Identity-H font: two big-endian bytes per glyph ID.
/// Characters the face lacks map to .notdef.
fn glyph_string(face: &Face, text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() * 2);
    for c in text.chars() {
        let gid = face.glyph_index(c).unwrap_or(GlyphId(0)).0;
        bytes.extend_from_slice(&gid.to_be_bytes());
    }
    bytes
}

/// Walks every text run once and records, per font, which glyph renders
/// which character. Drives the W array and the ToUnicode map.
fn collect_used_glyphs(
    document: &Document,
    primary: &Face,
    fallback: &Face,
) -> HashMap<FontChoice, BTreeMap<u16, char>> {
    let mut used: HashMap<FontChoice, BTreeMap<u16, char>> = HashMap::new();
    for page in &document.pages {
        for element in &page.elements {
            let Element::Text(line) = element else { continue };
            for run in &line.runs {
                let face = match run.font {
                    FontChoice::Primary => primary,
                    FontChoice::CjkFallback => fallback,
                };
                let map = used.entry(run.font).or_default();
                for c in run.text.chars() {
                    if let Some(gid) = face.glyph_index(c) {
                        map.entry(gid.0).or_insert(c);
                    }
                }
            }
        }
    }
    used
}

/// Writes the full Type0 / CIDFontType2 / FontDescriptor / FontFile2 /
/// ToUnicode object cluster for one font and returns its references.
fn embed_font(
    pdf: &mut Pdf,
    alloc: &mut impl FnMut() -> Ref,
    font: &LoadedFont,
    face: &Face,
    used: Option<&BTreeMap<u16, char>>,
) -> Result<FontRefs> {
    let type0_ref = alloc();
    let cid_ref = alloc();
    let descriptor_ref = alloc();
    let file_ref = alloc();
    let cmap_ref = alloc();

    let base_font = Name(font.name.as_bytes());
    let upem = face.units_per_em().max(1) as f32;
    let to_pdf = |units: i16| units as f32 * 1000.0 / upem;
    let empty = BTreeMap::new();
    let used = used.unwrap_or(&empty);

    pdf.type0_font(type0_ref)
        .base_font(base_font)
        .encoding_predefined(Name(b"Identity-H"))
        .descendant_font(cid_ref)
        .to_unicode(cmap_ref);

    let mut cid = pdf.cid_font(cid_ref);
    cid.subtype(CidFontType::Type2);
    cid.base_font(base_font);
    cid.system_info(SystemInfo {
        registry: Str(b"Adobe"),
        ordering: Str(b"Identity"),
        supplement: 0,
    });
    cid.font_descriptor(descriptor_ref);
    cid.default_width(500.0);
    cid.cid_to_gid_map_predefined(Name(b"Identity"));
    let mut widths = cid.widths();
    for (first, group) in consecutive_width_groups(used, |gid| {
        face.glyph_hor_advance(GlyphId(gid)).map(|a| a as f32 * 1000.0 / upem)
    }) {
        widths.consecutive(first, group);
    }
    widths.finish();
    cid.finish();

    let bbox = face.global_bounding_box();
    pdf.font_descriptor(descriptor_ref)
        .name(base_font)
        .flags(FontFlags::NON_SYMBOLIC)
        .bbox(Rect::new(
            to_pdf(bbox.x_min),
            to_pdf(bbox.y_min),
            to_pdf(bbox.x_max),
            to_pdf(bbox.y_max),
        ))
        .italic_angle(0.0)
        .ascent(to_pdf(face.ascender()))
        .descent(to_pdf(face.descender()))
        .cap_height(to_pdf(face.capital_height().unwrap_or_else(|| face.ascender())))
        .stem_v(90.0)
        .font_file2(file_ref);

    pdf.stream(file_ref, &font.data)
        .pair(Name(b"Length1"), font.data.len() as i32);

    let mut cmap = UnicodeCmap::new(
        Name(b"Custom"),
        SystemInfo { registry: Str(b"Adobe"), ordering: Str(b"UCS"), supplement: 0 },
    );
    for (&gid, &c) in used {
        cmap.pair(gid, c);
    }
    pdf.cmap(cmap_ref, &cmap.finish());

    Ok(FontRefs { type0: type0_ref })
}

/// Groups the used-glyph map into runs of consecutive glyph IDs, the form
/// the CID W array wants. Glyphs without an advance are skipped.
fn consecutive_width_groups(
    used: &BTreeMap<u16, char>,
    width_of: impl Fn(u16) -> Option<f32>,
) -> Vec<(u16, Vec<f32>)> {
    let mut groups: Vec<(u16, Vec<f32>)> = Vec::new();
    for &gid in used.keys() {
        let Some(width) = width_of(gid) else { continue };
        match groups.last_mut() {
            Some((first, ws)) if *first as usize + ws.len() == gid as usize => ws.push(width),
            _ => groups.push((gid, vec![width])),
        }
    }
    groups
}

/// Writes the finished bytes next to the destination and renames into
/// place, so readers never observe a half-written file.
fn write_atomic(output_path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = output_path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = parent {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    }
    let dir = parent.unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
    tmp.write_all(bytes).context("Failed to write document bytes")?;
    tmp.persist(output_path)
        .with_context(|| format!("Failed to move document into place at {:?}", output_path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn width_groups_split_on_gid_gaps() {
        let mut used = BTreeMap::new();
        for gid in [3u16, 4, 5, 9, 11, 12] {
            used.insert(gid, 'x');
        }
        let groups = consecutive_width_groups(&used, |gid| Some(gid as f32 * 10.0));
        assert_eq!(
            groups,
            vec![
                (3, vec![30.0, 40.0, 50.0]),
                (9, vec![90.0]),
                (11, vec![110.0, 120.0]),
            ]
        );
    }

    #[test]
    fn width_groups_skip_glyphs_without_advances() {
        let mut used = BTreeMap::new();
        used.insert(1u16, 'a');
        used.insert(2u16, 'b');
        used.insert(3u16, 'c');
        let groups =
            consecutive_width_groups(&used, |gid| if gid == 2 { None } else { Some(500.0) });
        assert_eq!(groups, vec![(1, vec![500.0]), (3, vec![500.0])]);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out/doc.pdf");
        write_atomic(&target, b"%PDF-1.7 test").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"%PDF-1.7 test");
        // Only the final artifact remains.
        let entries: Vec<_> = std::fs::read_dir(target.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn glyph_encoding_is_two_bytes_per_char() {
        // Any face will do; skip quietly on systems without one.
        let mut warnings = Vec::new();
        let Ok(book) = crate::typesetter::FontBook::load(None, None, &mut warnings) else {
            return;
        };
        let face = book.primary.face().unwrap();
        let encoded = glyph_string(&face, "Ab");
        assert_eq!(encoded.len(), 4);
        assert_ne!(&encoded[0..2], &[0, 0]);
    }
}

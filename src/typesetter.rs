//! Script-Aware Typesetter Module
//!
//! Partitions text into sub-runs that a single font can render, measures
//! them with real glyph advances, and wraps them to a target width. CJK
//! ideographs (and Pinyin tone marks, which most Latin fonts lack) route to
//! a verified fallback font; everything else uses the primary font.

use crate::error::{BuildError, BuildWarning};
use anyhow::{Context, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use ttf_parser::Face;

/// Pinyin vowels with tone diacritics. Typical Latin display fonts miss
/// most of these, so they are rendered with the CJK fallback font too.
const PINYIN_CHARS: &str =
    "āáǎàōóǒòēéěèīíǐìūúǔùǖǘǚǜüĀÁǍÀŌÓǑÒĒÉĚÈĪÍǏÌŪÚǓÙǕǗǙǛÜ";

/// Which of the two embedded fonts a run is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FontChoice {
    Primary,
    CjkFallback,
}

/// A sub-run of text assigned to exactly one font, with its measured width
/// in points.
#[derive(Debug, Clone, PartialEq)]
pub struct StyledRun {
    pub font: FontChoice,
    pub text: String,
    pub width: f32,
}

/// Total advance width of a wrapped line.
pub fn line_width(runs: &[StyledRun]) -> f32 {
    runs.iter().map(|r| r.width).sum()
}

/// True for code points that need the fallback font.
pub fn needs_fallback(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'   // CJK Unified Ideographs
        | '\u{3400}'..='\u{4dbf}' // CJK Extension A
        | '\u{3000}'..='\u{303f}' // CJK punctuation
        | '\u{3040}'..='\u{30ff}' // Hiragana / Katakana
    ) || PINYIN_CHARS.contains(c)
}

/// Splits text into font-pure runs, merging adjacent same-font spans so the
/// per-run font-switch cost is paid as rarely as possible. Operates on whole
/// code points; a run never mixes scripts that need different fonts.
pub fn segment_scripts(text: &str) -> Vec<(FontChoice, String)> {
    let mut runs: Vec<(FontChoice, String)> = Vec::new();
    for c in text.chars() {
        let font = if needs_fallback(c) { FontChoice::CjkFallback } else { FontChoice::Primary };
        match runs.last_mut() {
            Some((last, buf)) if *last == font => buf.push(c),
            _ => runs.push((font, c.to_string())),
        }
    }
    runs
}

/// One loaded font file (optionally a face inside a TrueType collection).
#[derive(Debug, Clone)]
pub struct LoadedFont {
    /// Sanitized name used as the PDF BaseFont.
    pub name: String,
    pub path: PathBuf,
    pub data: Vec<u8>,
    pub index: u32,
}

impl LoadedFont {
    /// Re-parses the face. Parsing was validated at load time, so failures
    /// here only happen if the bytes were corrupted in memory.
    pub fn face(&self) -> Result<Face<'_>> {
        Face::parse(&self.data, self.index)
            .with_context(|| format!("Failed to re-parse font {:?}", self.path))
    }
}

/// The fonts for one document build: a primary text font and a CJK-capable
/// fallback. When no fallback can be found the primary doubles for it (and a
/// warning is recorded).
#[derive(Debug, Clone)]
pub struct FontBook {
    pub primary: LoadedFont,
    pub fallback: LoadedFont,
    pub has_cjk: bool,
}

const PRIMARY_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

const CJK_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/noto-cjk/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
    "/usr/share/fonts/truetype/wqy/wqy-zenhei.ttc",
    "/usr/share/fonts/truetype/droid/DroidSansFallbackFull.ttf",
    "/System/Library/Fonts/PingFang.ttc",
    "/System/Library/Fonts/STHeiti Light.ttc",
    "/Library/Fonts/Arial Unicode MS.ttf",
    "C:\\Windows\\Fonts\\msyh.ttc",
    "C:\\Windows\\Fonts\\simsun.ttc",
    "C:\\Windows\\Fonts\\simhei.ttf",
];

impl FontBook {
    /// Loads the primary font (explicit path or first working candidate;
    /// fatal when none works) and a CJK fallback verified by glyph coverage
    /// (recoverable when none works).
    pub fn load(
        primary: Option<&Path>,
        cjk: Option<&Path>,
        warnings: &mut Vec<BuildWarning>,
    ) -> Result<FontBook> {
        let primary = load_first(primary, PRIMARY_CANDIDATES, |face| {
            face.glyph_index('A').is_some()
        })
        .ok_or(BuildError::FontUnavailable { role: "primary" })?;
        info!("Primary font: {:?}", primary.path);

        // A fallback only counts if it actually covers CJK ideographs.
        let fallback = load_first(cjk, CJK_CANDIDATES, |face| {
            face.glyph_index('\u{4e2d}').is_some()
        });
        let (fallback, has_cjk) = match fallback {
            Some(f) => {
                info!("CJK fallback font: {:?} (face {})", f.path, f.index);
                (f, true)
            }
            None => {
                warn!("No CJK-capable font found; falling back to the primary font.");
                warnings.push(BuildWarning::NoCjkFont);
                (primary.clone(), false)
            }
        };

        Ok(FontBook { primary, fallback, has_cjk })
    }

    pub fn get(&self, choice: FontChoice) -> &LoadedFont {
        match choice {
            FontChoice::Primary => &self.primary,
            FontChoice::CjkFallback => &self.fallback,
        }
    }
}

/// Tries the explicit path first, then the candidate list. Collections are
/// probed at face indices 0..=2, matching how multi-face `.ttc` files ship
/// their CJK faces.
fn load_first(
    explicit: Option<&Path>,
    candidates: &[&str],
    accept: impl Fn(&Face) -> bool,
) -> Option<LoadedFont> {
    let mut paths: Vec<PathBuf> = Vec::new();
    if let Some(p) = explicit {
        paths.push(p.to_path_buf());
    }
    paths.extend(candidates.iter().map(PathBuf::from));

    for path in paths {
        if !path.is_file() {
            continue;
        }
        let Ok(data) = std::fs::read(&path) else { continue };
        let face_count = ttf_parser::fonts_in_collection(&data).unwrap_or(1);
        for index in 0..face_count.min(3) {
            match Face::parse(&data, index) {
                Ok(face) if accept(&face) => {
                    return Some(LoadedFont {
                        name: pdf_font_name(&path),
                        path,
                        data,
                        index,
                    });
                }
                _ => continue,
            }
        }
    }
    None
}

/// BaseFont names must be simple name tokens; keep ASCII alphanumerics from
/// the file stem.
fn pdf_font_name(path: &Path) -> String {
    let stem: String = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Embedded")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if stem.is_empty() { "Embedded".to_string() } else { stem }
}

/// Width measurement seam. The real implementation reads glyph advances;
/// layout tests substitute a fixed-advance fake.
pub trait TextMeasure {
    fn width(&self, font: FontChoice, text: &str, size: f32) -> f32;
}

/// Measures with parsed faces for the duration of one build.
pub struct Typesetter<'a> {
    primary: Face<'a>,
    fallback: Face<'a>,
}

impl<'a> Typesetter<'a> {
    pub fn new(book: &'a FontBook) -> Result<Self> {
        Ok(Typesetter {
            primary: book.primary.face()?,
            fallback: book.fallback.face()?,
        })
    }

    fn face(&self, font: FontChoice) -> &Face<'a> {
        match font {
            FontChoice::Primary => &self.primary,
            FontChoice::CjkFallback => &self.fallback,
        }
    }
}

impl TextMeasure for Typesetter<'_> {
    fn width(&self, font: FontChoice, text: &str, size: f32) -> f32 {
        let face = self.face(font);
        let upem = face.units_per_em().max(1) as f32;
        text.chars()
            .map(|c| {
                face.glyph_index(c)
                    .and_then(|gid| face.glyph_hor_advance(gid))
                    .map(|adv| adv as f32 * size / upem)
                    // Missing glyphs still advance the pen (.notdef box).
                    .unwrap_or(size * 0.5)
            })
            .sum()
    }
}

/// A measured, styled piece produced by tokenization.
#[derive(Debug, Clone)]
struct Token {
    font: FontChoice,
    text: String,
    width: f32,
    /// Whitespace tokens may be dropped at line ends and are always legal
    /// break points. CJK tokens are single chars and break freely.
    is_space: bool,
}

/// Wraps font-pure runs into lines no wider than `max_width`, greedily.
/// Breaks happen after whitespace and between CJK characters; a single
/// token wider than the line is hard-split so layout always progresses.
pub fn wrap_styled<M: TextMeasure>(
    measure: &M,
    runs: &[(FontChoice, String)],
    size: f32,
    max_width: f32,
) -> Vec<Vec<StyledRun>> {
    let tokens = tokenize(measure, runs, size);
    let mut lines: Vec<Vec<StyledRun>> = Vec::new();
    let mut line: Vec<Token> = Vec::new();
    let mut line_w = 0.0f32;
    let mut pending: Vec<Token> = Vec::new();
    let mut pending_w = 0.0f32;

    for token in tokens {
        if token.is_space {
            pending_w += token.width;
            pending.push(token);
            continue;
        }
        if !line.is_empty() && line_w + pending_w + token.width > max_width {
            lines.push(merge(std::mem::take(&mut line)));
            line_w = 0.0;
            // Leading whitespace carries no meaning after a soft break.
            pending.clear();
            pending_w = 0.0;
        }
        if token.width > max_width && line.is_empty() {
            for piece in hard_split(measure, &token, size, max_width) {
                lines.push(merge(vec![piece]));
            }
            continue;
        }
        line_w += pending_w + token.width;
        line.append(&mut pending);
        pending_w = 0.0;
        line.push(token);
    }
    if !line.is_empty() {
        lines.push(merge(line));
    }
    lines
}

fn tokenize<M: TextMeasure>(measure: &M, runs: &[(FontChoice, String)], size: f32) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (font, text) in runs {
        let mut word = String::new();
        let mut flush_word = |word: &mut String, tokens: &mut Vec<Token>| {
            if !word.is_empty() {
                let width = measure.width(*font, word, size);
                tokens.push(Token { font: *font, text: std::mem::take(word), width, is_space: false });
            }
        };
        for c in text.chars() {
            if c.is_whitespace() {
                flush_word(&mut word, &mut tokens);
                tokens.push(Token {
                    font: *font,
                    text: c.to_string(),
                    width: measure.width(*font, &c.to_string(), size),
                    is_space: true,
                });
            } else if needs_fallback(c) {
                // Each CJK char is its own break unit.
                flush_word(&mut word, &mut tokens);
                tokens.push(Token {
                    font: *font,
                    text: c.to_string(),
                    width: measure.width(*font, &c.to_string(), size),
                    is_space: false,
                });
            } else {
                word.push(c);
            }
        }
        flush_word(&mut word, &mut tokens);
    }
    tokens
}

/// Splits an over-long unbreakable token character by character.
fn hard_split<M: TextMeasure>(measure: &M, token: &Token, size: f32, max_width: f32) -> Vec<Token> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut width = 0.0f32;
    for c in token.text.chars() {
        let cw = measure.width(token.font, &c.to_string(), size);
        if !text.is_empty() && width + cw > max_width {
            pieces.push(Token { font: token.font, text: std::mem::take(&mut text), width, is_space: false });
            width = 0.0;
        }
        text.push(c);
        width += cw;
    }
    if !text.is_empty() {
        pieces.push(Token { font: token.font, text, width, is_space: false });
    }
    pieces
}

/// Collapses a finished token line into runs, merging same-font neighbours
/// and trimming trailing whitespace.
fn merge(mut tokens: Vec<Token>) -> Vec<StyledRun> {
    while tokens.last().is_some_and(|t| t.is_space) {
        tokens.pop();
    }
    let mut runs: Vec<StyledRun> = Vec::new();
    for token in tokens {
        match runs.last_mut() {
            Some(run) if run.font == token.font => {
                run.text.push_str(&token.text);
                run.width += token.width;
            }
            _ => runs.push(StyledRun { font: token.font, text: token.text, width: token.width }),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every char is one unit wide times the size.
    pub(crate) struct FixedMeasure;

    impl TextMeasure for FixedMeasure {
        fn width(&self, _font: FontChoice, text: &str, size: f32) -> f32 {
            text.chars().count() as f32 * size
        }
    }

    #[test]
    fn segmentation_never_mixes_scripts_and_merges_neighbours() {
        let runs = segment_scripts("go to 北京 then 上海 now");
        for (font, text) in &runs {
            for c in text.chars() {
                assert_eq!(
                    needs_fallback(c),
                    *font == FontChoice::CjkFallback,
                    "mixed-script run {text:?}"
                );
            }
        }
        // Adjacent same-font spans are merged, so fonts must alternate.
        for pair in runs.windows(2) {
            assert_ne!(pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn pinyin_diacritics_use_the_fallback_font() {
        let runs = segment_scripts("nǐ hǎo");
        assert!(runs.iter().any(|(f, t)| *f == FontChoice::CjkFallback && t.contains('ǐ')));
    }

    #[test]
    fn plain_latin_is_a_single_primary_run() {
        let runs = segment_scripts("just words");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, FontChoice::Primary);
    }

    #[test]
    fn wrapping_breaks_at_spaces_and_fills_greedily() {
        let runs = vec![(FontChoice::Primary, "aa bb cc dd".to_string())];
        let lines = wrap_styled(&FixedMeasure, &runs, 1.0, 6.0);
        let texts: Vec<String> =
            lines.iter().map(|l| l.iter().map(|r| r.text.as_str()).collect()).collect();
        assert_eq!(texts, vec!["aa bb", "cc dd"]);
    }

    #[test]
    fn wrapped_lines_never_exceed_the_target_width() {
        let runs = segment_scripts("word 北京上海广州深圳 and more latin text after");
        let lines = wrap_styled(&FixedMeasure, &runs, 2.0, 11.0);
        for line in &lines {
            assert!(line_width(line) <= 11.0 + 1e-4);
            assert!(!line.is_empty());
        }
    }

    #[test]
    fn cjk_breaks_between_characters() {
        let runs = vec![(FontChoice::CjkFallback, "中文中文中".to_string())];
        let lines = wrap_styled(&FixedMeasure, &runs, 1.0, 2.0);
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn overlong_tokens_are_hard_split() {
        let runs = vec![(FontChoice::Primary, "abcdefghij".to_string())];
        let lines = wrap_styled(&FixedMeasure, &runs, 1.0, 4.0);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| line_width(l) <= 4.0));
    }
}

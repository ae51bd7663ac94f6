//! Source Parser Module
//!
//! Reads the blueprint document (plain text mixing narrative and image-path
//! lines) and splits it into an ordered sequence of blocks. Also scrubs the
//! encoding artifacts a word-processor-to-markdown export leaves behind.

use regex::Regex;
use std::sync::LazyLock;

/// A line that is just a filesystem path ending in one of these extensions
/// is treated as an embedded image reference.
static IMAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*?\.(?:jpg|jpeg|png|gif|bmp))\s*(\{[^}]*\})?\s*$").unwrap()
});

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s*(?:\[\s*[xX]?\s*\])?\s*").unwrap());

static ESCAPED_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\([^\w/\\])").unwrap());

static INLINE_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\*\*|\*|`)").unwrap());

/// How a text block should be styled during layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Body,
    /// Heading level 1 to 3.
    Heading(u8),
    Bullet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub kind: TextKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBlock {
    /// The path exactly as written in the source (after artifact cleanup).
    pub path: String,
    /// Set by a `{layout=full}` attribute after the path.
    pub full_width: bool,
}

/// Atomic unit of the parsed source stream. Blocks are created once and
/// consumed in order, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text(TextBlock),
    Image(ImageBlock),
    /// A paragraph break (one or more blank source lines).
    Break,
}

/// Splits the raw document text into an ordered block sequence.
///
/// The parser never touches the filesystem; whether an image path actually
/// resolves is the layout engine's concern.
pub fn parse_source(raw: &str) -> Vec<Block> {
    let mut blocks = Vec::new();

    for line in raw.lines() {
        let cleaned = clean_markdown_escapes(&clean_export_artifacts(line.trim()));
        let unlisted = LIST_MARKER.replace(&cleaned, "").into_owned();

        if let Some(image) = parse_image_line(&unlisted) {
            blocks.push(Block::Image(image));
            continue;
        }

        if cleaned.is_empty() {
            // Collapse runs of blank lines into one paragraph break.
            if !matches!(blocks.last(), Some(Block::Break) | None) {
                blocks.push(Block::Break);
            }
            continue;
        }

        let block = if let Some(rest) = cleaned.strip_prefix("### ") {
            TextBlock { kind: TextKind::Heading(3), text: strip_inline_markers(rest) }
        } else if let Some(rest) = cleaned.strip_prefix("## ") {
            TextBlock { kind: TextKind::Heading(2), text: strip_inline_markers(rest) }
        } else if let Some(rest) = cleaned.strip_prefix("# ") {
            TextBlock { kind: TextKind::Heading(1), text: strip_inline_markers(rest) }
        } else if cleaned.starts_with("- ") || cleaned.starts_with("* ") {
            TextBlock { kind: TextKind::Bullet, text: format!("\u{2022} {}", strip_inline_markers(unlisted.trim())) }
        } else {
            TextBlock { kind: TextKind::Body, text: strip_inline_markers(&cleaned) }
        };
        blocks.push(Block::Text(block));
    }

    // A trailing break adds nothing to layout.
    if matches!(blocks.last(), Some(Block::Break)) {
        blocks.pop();
    }
    blocks
}

/// The first heading in the document doubles as the page-header title.
pub fn document_title(blocks: &[Block]) -> Option<&str> {
    blocks.iter().find_map(|b| match b {
        Block::Text(t) if matches!(t.kind, TextKind::Heading(_)) => Some(t.text.as_str()),
        _ => None,
    })
}

/// Checks whether a (cleaned, list-marker-stripped) line is an image
/// reference and extracts path and attributes if so.
fn parse_image_line(line: &str) -> Option<ImageBlock> {
    let caps = IMAGE_LINE.captures(line)?;
    let mut path = caps.get(1)?.as_str().trim();
    if path.is_empty() {
        return None;
    }
    path = path.strip_prefix("./").unwrap_or(path);
    let full_width = caps
        .get(2)
        .is_some_and(|attrs| attrs.as_str().contains("layout=full"));
    Some(ImageBlock { path: path.to_string(), full_width })
}

/// Scrubs artifacts introduced by exporting a word-processor document:
/// non-breaking spaces, CP-1252/UTF-8 smart-quote mojibake, and stray
/// control characters.
pub fn clean_export_artifacts(line: &str) -> String {
    // Mojibake sequences must be fixed before single-char filtering,
    // otherwise the control byte in the middle of a sequence is dropped
    // and the remainder no longer matches.
    let mut text = line.to_string();
    for (bad, good) in [
        ("\u{00e2}\u{20ac}\u{2122}", "\u{2019}"), // â€™ -> ’
        ("\u{00e2}\u{20ac}\u{0153}", "\u{201c}"), // â€œ -> “
        ("\u{00e2}\u{20ac}\u{009d}", "\u{201d}"), //       ”
        ("\u{00e2}\u{20ac}\u{201c}", "\u{2013}"), // â€“ -> –
        ("\u{00e2}\u{20ac}\u{201d}", "\u{2014}"), // â€” -> —
        ("\u{00e2}\u{20ac}\u{00a6}", "\u{2026}"), // â€¦ -> …
    ] {
        if text.contains(bad) {
            text = text.replace(bad, good);
        }
    }

    text.chars()
        .filter_map(|c| match c {
            '\u{00a0}' => Some(' '),
            c if c.is_control() && c != '\t' => None,
            c => Some(c),
        })
        .collect()
}

/// Un-escapes common Markdown escapes produced by document exports while
/// preserving Windows-style path backslashes (backslash before a word
/// character, slash, or another backslash is kept).
pub fn clean_markdown_escapes(line: &str) -> String {
    let line = line.replace(r"\_", "_").replace(r"\.", ".");
    ESCAPED_PUNCT.replace_all(&line, "$1").into_owned()
}

/// Removes bold/italic/code markers; a single font weight is used per
/// script, so the markers would otherwise leak into the output text.
fn strip_inline_markers(text: &str) -> String {
    INLINE_MARKER.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_lines_are_detected_with_and_without_attributes() {
        assert_eq!(
            parse_image_line("/roots/local/photo1.jpg"),
            Some(ImageBlock { path: "/roots/local/photo1.jpg".into(), full_width: false })
        );
        assert_eq!(
            parse_image_line("./trip/pano.JPEG {layout=full}"),
            Some(ImageBlock { path: "trip/pano.JPEG".into(), full_width: true })
        );
        assert_eq!(parse_image_line("Sunset over the bay."), None);
        assert_eq!(parse_image_line("The file was photo.jpg renamed"), None);
    }

    #[test]
    fn list_markers_are_stripped_before_image_detection() {
        let blocks = parse_source("- /vol/a/img.png\n- [x] /vol/b/img2.jpg\n");
        assert_eq!(
            blocks,
            vec![
                Block::Image(ImageBlock { path: "/vol/a/img.png".into(), full_width: false }),
                Block::Image(ImageBlock { path: "/vol/b/img2.jpg".into(), full_width: false }),
            ]
        );
    }

    #[test]
    fn export_artifacts_are_scrubbed() {
        assert_eq!(clean_export_artifacts("a\u{00a0}b"), "a b");
        assert_eq!(clean_export_artifacts("ok\u{0007}ok"), "okok");
        assert_eq!(
            clean_export_artifacts("it\u{00e2}\u{20ac}\u{2122}s"),
            "it\u{2019}s"
        );
    }

    #[test]
    fn markdown_escapes_keep_windows_paths() {
        assert_eq!(clean_markdown_escapes(r"snake\_case\."), "snake_case.");
        assert_eq!(clean_markdown_escapes(r"a\-b"), "a-b");
        assert_eq!(
            clean_markdown_escapes(r"C:\Users\ryan\photo.jpg"),
            r"C:\Users\ryan\photo.jpg"
        );
    }

    #[test]
    fn blocks_preserve_order_and_paragraph_breaks() {
        let src = "### China 2025\n\nIntro text.\n\n\n/roots/local/photo1.jpg\nMore text.\n";
        let blocks = parse_source(src);
        assert_eq!(
            blocks,
            vec![
                Block::Text(TextBlock { kind: TextKind::Heading(3), text: "China 2025".into() }),
                Block::Break,
                Block::Text(TextBlock { kind: TextKind::Body, text: "Intro text.".into() }),
                Block::Break,
                Block::Image(ImageBlock { path: "/roots/local/photo1.jpg".into(), full_width: false }),
                Block::Text(TextBlock { kind: TextKind::Body, text: "More text.".into() }),
            ]
        );
        assert_eq!(document_title(&blocks), Some("China 2025"));
    }

    #[test]
    fn bullets_become_bullet_blocks() {
        let blocks = parse_source("- pack light\n");
        assert_eq!(
            blocks,
            vec![Block::Text(TextBlock { kind: TextKind::Bullet, text: "\u{2022} pack light".into() })]
        );
    }

    #[test]
    fn inline_markers_are_stripped_from_text() {
        let blocks = parse_source("Some **bold** and *italic* and `code`.\n");
        assert_eq!(
            blocks,
            vec![Block::Text(TextBlock {
                kind: TextKind::Body,
                text: "Some bold and italic and code.".into()
            })]
        );
    }
}

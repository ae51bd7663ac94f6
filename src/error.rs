//! Error Taxonomy Module
//!
//! Splits failures into two families: fatal errors that abort the build with
//! a single diagnostic, and recoverable warnings that are collected during
//! the build and reported once at the end.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Whole-document failures. Any of these aborts the build early.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("source document {path:?} could not be read: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable {role} font found; pass an explicit font path")]
    FontUnavailable { role: &'static str },

    #[error("failed to write paginated document: {0}")]
    Writer(String),

    /// Pages before `page` are already on disk and are left in place.
    #[error("failed to rasterize page {page}: {reason} (pages before it remain on disk)")]
    Rasterizer { page: usize, reason: String },
}

/// Per-asset or per-element problems. These never abort the build; the
/// affected element degrades to a placeholder or a scaled-down fit.
#[derive(Debug, Clone, Error, Serialize)]
pub enum BuildWarning {
    #[error("image not found: {path} (tried {candidates} location(s))")]
    AssetNotFound { path: String, candidates: usize },

    #[error("image could not be prepared: {path}: {reason}")]
    AssetUnpreparable { path: String, reason: String },

    #[error("{what} was taller than an empty page and was scaled down to fit")]
    OverflowScaled { what: String },

    #[error("no CJK-capable fallback font found; CJK text may render with missing glyphs")]
    NoCjkFont,
}

//! 磁盘命名：`<root>/<series>/Chapter NNN/<page>.<ext>`，
//! 以及章节目录旁的 `.checkpoint` 目录。

use std::path::{Path, PathBuf};

use crate::download::models::ChapterNumber;

pub const CHECKPOINT_DIR: &str = ".checkpoint";

const MAX_SERIES_NAME: usize = 120;

pub fn series_folder_name(series_title: &str) -> String {
    safe_fs_name(series_title, MAX_SERIES_NAME)
}

pub fn series_folder_path(output_root: &Path, series_title: &str) -> PathBuf {
    output_root.join(series_folder_name(series_title))
}

/// `Chapter 005`, `Chapter 005.5`: sorts naturally in file browsers.
pub fn chapter_label(number: ChapterNumber) -> String {
    format!("Chapter {}", number.padded())
}

pub fn chapter_folder_path(series_dir: &Path, number: ChapterNumber) -> PathBuf {
    series_dir.join(chapter_label(number))
}

/// 1-based page file name, zero padded to at least three digits.
pub fn image_file_name(index: usize, total: usize, ext: &str) -> String {
    let width = total.to_string().len().max(3);
    format!("{:0width$}.{}", index + 1, ext, width = width)
}

/// Turns an arbitrary title or id into one portable path component.
///
/// Characters Windows rejects become `_`, the result is cut to `max_len`
/// bytes on a char boundary, trailing dots and spaces are dropped, and device
/// names such as `CON` get a `_` prefix.
pub fn safe_fs_name(name: &str, max_len: usize) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| if is_forbidden(c) { '_' } else { c })
        .collect();

    let mut cut = replaced.len().min(max_len);
    while !replaced.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = replaced[..cut].trim_end_matches([' ', '.']).to_string();

    if out.is_empty() {
        return "unnamed".to_string();
    }
    if is_device_name(&out) {
        out.insert(0, '_');
    }
    out
}

fn is_forbidden(c: char) -> bool {
    matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|') || c.is_control()
}

fn is_device_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "CON" | "PRN" | "AUX" | "NUL" => true,
        _ => ["COM", "LPT"].iter().any(|prefix| {
            upper
                .strip_prefix(prefix)
                .is_some_and(|d| d.len() == 1 && d.bytes().all(|b| (b'1'..=b'9').contains(&b)))
        }),
    }
}

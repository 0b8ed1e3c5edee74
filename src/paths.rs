//! Filename sanitization and the on-disk library layout.
//!
//! Layout: `<output>/<series title>/volume_<v>/chapter_<n>/<page>.<ext>`, with
//! engine state under `<output>/.mangabook/`.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Directory (under the output root) holding engine state.
pub const STATE_DIR_NAME: &str = ".mangabook";

/// Extensions accepted from page URLs; anything else falls back to [`DEFAULT_PAGE_EXTENSION`].
const PAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Extension used when a page URL carries none we recognise.
pub const DEFAULT_PAGE_EXTENSION: &str = "jpg";

/// Replaces characters that are invalid on common filesystems.
///
/// `/ \ : * ? " < > |` and control characters become `_`; leading and
/// trailing dots and spaces are stripped. Never returns an empty string or a
/// path traversal segment.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    if is_safe_segment(trimmed) {
        trimmed.to_string()
    } else {
        trimmed.replace('.', "_")
    }
}

fn is_safe_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

/// Directory name for a volume id (`"0"` is the ungrouped volume).
#[must_use]
pub fn volume_dir_name(volume: &str) -> String {
    format!("volume_{}", sanitize_filename(volume))
}

/// Directory name for a chapter number, zero-padding the integral part.
///
/// `"7"` becomes `chapter_007`, `"12.5"` becomes `chapter_012.5`; non-numeric
/// numbers are sanitized as-is.
#[must_use]
pub fn chapter_dir_name(number: &str) -> String {
    let number = number.trim();
    let (integral, fraction) = match number.split_once('.') {
        Some((integral, fraction)) => (integral, Some(fraction)),
        None => (number, None),
    };
    match integral.parse::<u32>() {
        Ok(value) => match fraction {
            Some(fraction) if !fraction.is_empty() => {
                format!("chapter_{value:03}.{}", sanitize_filename(fraction))
            }
            _ => format!("chapter_{value:03}"),
        },
        Err(_) => format!("chapter_{}", sanitize_filename(number)),
    }
}

/// File name for a 1-based page number.
#[must_use]
pub fn page_file_name(page_number: u32, extension: &str) -> String {
    format!("{page_number:03}.{extension}")
}

/// Image extension of a page URL, lowercased, or the default.
#[must_use]
pub fn page_extension_from_url(url: &str) -> &'static str {
    let Ok(parsed) = Url::parse(url) else {
        return DEFAULT_PAGE_EXTENSION;
    };
    let extension = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    extension
        .and_then(|ext| PAGE_EXTENSIONS.iter().find(|known| **known == ext).copied())
        .unwrap_or(DEFAULT_PAGE_EXTENSION)
}

/// Directory holding a series' pages.
#[must_use]
pub fn series_dir(output_dir: &Path, title: &str) -> PathBuf {
    output_dir.join(sanitize_filename(title))
}

/// Engine state directory under an output root.
#[must_use]
pub fn state_dir(output_dir: &Path) -> PathBuf {
    output_dir.join(STATE_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_replaces_invalid_chars() {
        assert_eq!(sanitize_filename("a/b:c*d?e"), "a_b_c_d_e");
        assert_eq!(sanitize_filename("x<y>z|w\"q"), "x_y_z_w_q");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }

    #[test]
    fn test_sanitize_filename_strips_dots_and_spaces() {
        assert_eq!(sanitize_filename("  Title. "), "Title");
        assert_eq!(sanitize_filename("..."), "unnamed");
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn test_sanitize_filename_keeps_unicode() {
        assert_eq!(sanitize_filename("ワンピース"), "ワンピース");
    }

    #[test]
    fn test_chapter_dir_name_pads_numbers() {
        assert_eq!(chapter_dir_name("7"), "chapter_007");
        assert_eq!(chapter_dir_name("12.5"), "chapter_012.5");
        assert_eq!(chapter_dir_name("1234"), "chapter_1234");
        assert_eq!(chapter_dir_name("Extra"), "chapter_Extra");
    }

    #[test]
    fn test_volume_and_page_names() {
        assert_eq!(volume_dir_name("3"), "volume_3");
        assert_eq!(volume_dir_name("0"), "volume_0");
        assert_eq!(page_file_name(4, "png"), "004.png");
    }

    #[test]
    fn test_page_extension_from_url() {
        assert_eq!(page_extension_from_url("https://x.org/data/h/1-abc.PNG"), "png");
        assert_eq!(page_extension_from_url("https://x.org/data/h/2.webp"), "webp");
        assert_eq!(page_extension_from_url("https://x.org/data/h/3.bin"), "jpg");
        assert_eq!(page_extension_from_url("https://x.org/data/h/noext"), "jpg");
        assert_eq!(page_extension_from_url("not a url"), "jpg");
    }

    #[test]
    fn test_series_and_state_dirs() {
        let out = Path::new("/library");
        assert_eq!(series_dir(out, "A: B"), PathBuf::from("/library/A_ B"));
        assert_eq!(state_dir(out), PathBuf::from("/library/.mangabook"));
    }
}

//! Bruker-style method file parsing.
//!
//! Scanner-exported acquisition parameters arrive as semi-structured text
//! using `##$KEY=VALUE` headers. Values may continue over several lines
//! (parenthesized tuples and arrays frequently do), so the parser buffers
//! lines until the next header and stores the joined, trimmed result.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::VfaError;

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*##\$([A-Za-z0-9_]+)\s*=\s*(.*)$").unwrap())
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?\d*\.?\d+(?:[eE][-+]?\d+)?").unwrap())
}

fn tuple_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((.*)\)").unwrap())
}

/// Flat key -> raw-value store for one parsed method text.
///
/// Keys are case-sensitive. If a key appears more than once, the first
/// occurrence wins. Immutable once parsed.
#[derive(Debug, Clone, Default)]
pub struct MethodStore {
    entries: HashMap<String, String>,
}

impl MethodStore {
    /// Parse a raw method text blob into a key/value store.
    ///
    /// A line matching `##$KEY=VALUE` opens a new entry; every following
    /// non-header line is appended verbatim (minus its newline) to that
    /// entry's value. Lines before the first header are discarded.
    pub fn parse(text: &str) -> Self {
        let mut entries: HashMap<String, String> = HashMap::new();
        let mut open: Option<(String, Vec<String>)> = None;

        for line in text.lines() {
            if let Some(caps) = header_re().captures(line) {
                if let Some((key, buf)) = open.take() {
                    entries.entry(key).or_insert_with(|| buf.join("\n").trim().to_string());
                }
                let key = caps[1].to_string();
                let first = caps[2].trim().to_string();
                open = Some((key, vec![first]));
            } else if let Some((_, buf)) = open.as_mut() {
                buf.push(line.to_string());
            }
        }

        if let Some((key, buf)) = open {
            entries.entry(key).or_insert_with(|| buf.join("\n").trim().to_string());
        }

        MethodStore { entries }
    }

    /// Raw value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a method file into its raw text.
///
/// An absent file is `ResourceNotFound`, which callers must keep distinct
/// from "file present but key absent" when assembling diagnostics. Invalid
/// UTF-8 bytes are replaced rather than rejected.
pub fn read_method_file(path: &Path) -> Result<String, VfaError> {
    if !path.is_file() {
        return Err(VfaError::ResourceNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(|_| VfaError::ResourceNotFound(path.to_path_buf()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Default method path adjacent to a NIfTI image: `dir/foo.nii.gz` ->
/// `dir/foo.method`.
pub fn default_adjacent_method_path(nifti_path: &Path) -> PathBuf {
    let name = nifti_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stem = if let Some(s) = name.strip_suffix(".nii.gz") {
        s.to_string()
    } else if let Some(s) = name.strip_suffix(".nii") {
        s.to_string()
    } else {
        match name.rfind('.') {
            Some(pos) if pos > 0 => name[..pos].to_string(),
            _ => name,
        }
    };

    nifti_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{stem}.method"))
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    let b = s.as_bytes();
    if b.len() >= 2 && ((b[0] == b'"' && b[b.len() - 1] == b'"') || (b[0] == b'\'' && b[b.len() - 1] == b'\'')) {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// First float-like token in a raw method value.
///
/// Strips one layer of surrounding quotes, blanks out angle brackets (Bruker
/// wraps some values in `<...>`), then matches a signed decimal or
/// scientific-notation number.
pub fn extract_first_number(raw: &str) -> Option<f64> {
    let s = strip_quotes(raw.trim()).replace(['<', '>'], " ");
    let m = number_re().find(&s)?;
    m.as_str().parse::<f64>().ok()
}

/// Flip angle from a pulse tuple such as `(1, 6000, 15, Yes, 4, ...)`.
///
/// The value is flattened (tuples may span lines), the first parenthesized
/// group split on commas, and the field at `field_index` numeric-extracted.
/// The result is accepted only if it lies strictly inside (0, 180) degrees;
/// anything else yields `None`, never an error.
pub fn extract_tuple_angle(raw: &str, field_index: usize) -> Option<f64> {
    let flat = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let caps = tuple_re().captures(&flat)?;
    let parts: Vec<&str> = caps[1].trim().split(',').map(str::trim).collect();
    if parts.len() < field_index + 1 {
        return None;
    }
    let fa = extract_first_number(parts[field_index])?;
    if fa > 0.0 && fa < 180.0 {
        Some(fa)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiline_value() {
        let store = MethodStore::parse("##$FOO=1\n2\n3");
        assert_eq!(store.get("FOO"), Some("1\n2\n3"));
    }

    #[test]
    fn test_parse_splits_at_second_header() {
        let store = MethodStore::parse("##$A=1\ncontinued\n##$B=2\n");
        assert_eq!(store.get("A"), Some("1\ncontinued"));
        assert_eq!(store.get("B"), Some("2"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_parse_discards_preamble() {
        let store = MethodStore::parse("TITLE=ignored\njunk\n##$KEY=value\n");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("KEY"), Some("value"));
    }

    #[test]
    fn test_parse_first_occurrence_wins() {
        let store = MethodStore::parse("##$K=first\n##$K=second\n");
        assert_eq!(store.get("K"), Some("first"));
    }

    #[test]
    fn test_parse_leading_whitespace_header() {
        let store = MethodStore::parse("  ##$PVM_RepetitionTime= 15\n");
        assert_eq!(store.get("PVM_RepetitionTime"), Some("15"));
    }

    #[test]
    fn test_parse_trims_value() {
        let store = MethodStore::parse("##$X=  3.5  \n");
        assert_eq!(store.get("X"), Some("3.5"));
    }

    #[test]
    fn test_extract_first_number_plain() {
        assert_eq!(extract_first_number("15"), Some(15.0));
        assert_eq!(extract_first_number("  -2.5 "), Some(-2.5));
        assert_eq!(extract_first_number("1.2e-3"), Some(0.0012));
    }

    #[test]
    fn test_extract_first_number_quoted_and_bracketed() {
        assert_eq!(extract_first_number("\"42\""), Some(42.0));
        assert_eq!(extract_first_number("<15.0>"), Some(15.0));
        assert_eq!(extract_first_number("'<7>'"), Some(7.0));
    }

    #[test]
    fn test_extract_first_number_picks_first_token() {
        assert_eq!(extract_first_number("( 2 ) 90 deg"), Some(2.0));
    }

    #[test]
    fn test_extract_first_number_none() {
        assert_eq!(extract_first_number("no digits here"), None);
        assert_eq!(extract_first_number(""), None);
    }

    #[test]
    fn test_extract_tuple_angle_third_field() {
        assert_eq!(extract_tuple_angle("(1, 6000, 15, Yes, 4)", 2), Some(15.0));
    }

    #[test]
    fn test_extract_tuple_angle_rejects_out_of_range() {
        assert_eq!(extract_tuple_angle("(1, 6000, 200, Yes)", 2), None);
        assert_eq!(extract_tuple_angle("(1, 6000, 0, Yes)", 2), None);
    }

    #[test]
    fn test_extract_tuple_angle_too_few_fields() {
        assert_eq!(extract_tuple_angle("(1, 6000)", 2), None);
    }

    #[test]
    fn test_extract_tuple_angle_multiline() {
        let raw = "(1, 6000,\n  15, Yes,\n  4)";
        assert_eq!(extract_tuple_angle(raw, 2), Some(15.0));
    }

    #[test]
    fn test_extract_tuple_angle_no_parens() {
        assert_eq!(extract_tuple_angle("1, 6000, 15", 2), None);
    }

    #[test]
    fn test_adjacent_method_path() {
        assert_eq!(
            default_adjacent_method_path(Path::new("/data/scan1.nii.gz")),
            PathBuf::from("/data/scan1.method")
        );
        assert_eq!(
            default_adjacent_method_path(Path::new("/data/scan1.nii")),
            PathBuf::from("/data/scan1.method")
        );
        assert_eq!(
            default_adjacent_method_path(Path::new("scan1.img")),
            PathBuf::from("scan1.method")
        );
    }

    #[test]
    fn test_read_method_file_missing() {
        let err = read_method_file(Path::new("/nonexistent/x.method")).unwrap_err();
        assert!(matches!(err, VfaError::ResourceNotFound(_)));
    }
}

//! Canonical file names.
//!
//! Document stores that refuse duplicate sibling names usually resolve a collision by
//! appending a numeric suffix to the base name: uploading `Invoice.pdf` into a folder that
//! already holds one yields `Invoice-1.pdf`, then `Invoice-2.pdf`, and so on. This module
//! reverses exactly that convention, and offers the forward direction for hosts that need it.

use std::sync::LazyLock;

use regex::Regex;

// Greedy base, so only the last hyphen segment is considered.
static NUMBERED_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*)-([0-9]+)$").expect("numbered suffix pattern is valid")
});

/// Returns the canonical name for `name`, i.e. the name with a trailing `-<digits>`
/// disambiguation suffix removed from the base name.
///
/// The name is split at its final `.` into base and extension. If the base ends in a hyphen
/// followed by one or more ASCII digits, that suffix is dropped and the rest of the base is
/// joined to the extension with a `.`. The `.` is always added, even when the name had no
/// extension (`Invoice-1` becomes `Invoice.`), and the rest of the base may be empty (`-1.pdf`
/// becomes `.pdf`). Any other input (no hyphen, non-numeric suffix, signed suffix) is returned
/// unchanged.
///
/// Only a single suffix is stripped. `canonicalize("v-2-3.txt")` is `"v-2.txt"`, and applying
/// the function again would strip another segment, so callers apply it exactly once.
///
/// ```
/// use autoversion_core::canonical::canonicalize;
///
/// assert_eq!(canonicalize("Invoice-1.pdf"), "Invoice.pdf");
/// assert_eq!(canonicalize("Photo-a.jpg"), "Photo-a.jpg");
/// ```
pub fn canonicalize(name: &str) -> String {
    let (base, extension) = split_extension(name);

    match NUMBERED_SUFFIX.captures(base) {
        Some(captures) => {
            let stem = captures.get(1).map_or("", |m| m.as_str());
            format!("{}.{}", stem, extension.unwrap_or(""))
        }
        None => name.to_string(),
    }
}

/// Appends the `-<n>` disambiguation suffix to the base name of `name`.
///
/// This is the renaming convention hosts apply on sibling name collisions, so that
/// `canonicalize(&with_numeric_suffix(name, n)) == name` for any `n`, provided `name` has an
/// extension. Names without one come back with a trailing `.` and never match the original.
pub fn with_numeric_suffix(name: &str, n: u32) -> String {
    match split_extension(name) {
        (base, Some(ext)) => format!("{}-{}.{}", base, n, ext),
        (base, None) => format!("{}-{}", base, n),
    }
}

/// Splits at the final `.`; the extension is `None` when there is no dot at all.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}

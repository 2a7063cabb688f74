//! SIMD single-pattern search over byte slices, via `memchr::memmem`.

use memchr::memmem::Finder;

/// Every position of the finder's needle in `haystack`, overlapping
/// occurrences included.
pub(crate) fn find_all_with(finder: &Finder<'_>, haystack: &[u8]) -> Vec<usize> {
    let mut results = Vec::new();
    let mut pos = 0;
    while pos < haystack.len() {
        match finder.find(&haystack[pos..]) {
            Some(local) => {
                results.push(pos + local);
                pos += local + 1;
            }
            None => break,
        }
    }
    results
}

/// Encode an ASCII/UTF-8 string as UTF-16LE bytes.
pub fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

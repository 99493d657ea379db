//! Canonical path value type.
//!
//! A [`CanonicalPath`] is the UTF-8 path form used to identify build targets:
//! forward-slash separators only, no interior `.` or `..` fragments, no
//! duplicate separators. Canonicalization is pure string surgery; the
//! filesystem is never consulted.
//!
//! Under Windows semantics every backslash separator is converted to a
//! forward slash, and the conversion is recorded in a 64-bit *slash bits*
//! mask (one bit per separator of the canonical form) so the original
//! spelling can be recovered with [`CanonicalPath::decanonicalized`].
//! Recovery is lossy past 64 separators: bit 63 sticks for all trailing
//! separators.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Canonicalize `path`, returning the canonical string and the slash-bits
/// mask. `windows` selects backslash-separator semantics; when false the
/// mask is always zero and backslashes are ordinary filename bytes.
///
/// Rules, in the order they apply while scanning:
/// - a leading separator is preserved (two of them under Windows semantics,
///   for network paths);
/// - `.` components are dropped;
/// - `..` components pop the previous component when one exists, and are
///   kept literally otherwise (so `/..` never climbs past the root);
/// - separator runs collapse to their first byte;
/// - an otherwise empty result becomes `.`, except for empty input which
///   stays empty.
fn canonicalize(path: &str, windows: bool) -> (String, u64) {
    let src = path.as_bytes();
    if src.is_empty() {
        return (String::new(), 0);
    }
    let is_sep = |byte: u8| byte == b'/' || (windows && byte == b'\\');

    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    // Start offsets of the components currently in `out`, for `..` backup.
    let mut components: Vec<usize> = Vec::new();
    let len = src.len();
    let mut i = 0;

    let mut root_len = 0;
    if is_sep(src[0]) {
        if windows && len > 1 && is_sep(src[1]) {
            // Network path: keep the double separator.
            out.extend_from_slice(&src[..2]);
            i = 2;
        } else {
            out.push(src[0]);
            i = 1;
        }
        root_len = i;
    }

    while i < len {
        if src[i] == b'.' {
            if i + 1 == len || is_sep(src[i + 1]) {
                // `.` component: skip it and its separator.
                i += 2;
                continue;
            }
            if src[i + 1] == b'.' && (i + 2 == len || is_sep(src[i + 2])) {
                // `..` component: back up when possible, else keep it.
                if let Some(start) = components.pop() {
                    out.truncate(start);
                } else {
                    out.push(b'.');
                    out.push(b'.');
                    if i + 2 < len {
                        out.push(src[i + 2]);
                    }
                }
                i += 3;
                continue;
            }
        }

        if is_sep(src[i]) {
            // Duplicate separator; the first byte of the run already went out.
            i += 1;
            continue;
        }

        components.push(out.len());
        while i < len && !is_sep(src[i]) {
            out.push(src[i]);
            i += 1;
        }
        if i < len {
            // Copy the terminating separator byte verbatim; backslashes are
            // rewritten in the conversion pass below so their positions land
            // in the bit mask.
            out.push(src[i]);
            i += 1;
        }
    }

    if out.is_empty() {
        out.push(b'.');
    } else if out.len() > root_len && is_sep(out[out.len() - 1]) {
        out.pop();
    }

    let mut slash_bits = 0u64;
    if windows {
        let mut sep_index = 0usize;
        for byte in out.iter_mut() {
            match *byte {
                b'\\' => {
                    slash_bits |= 1u64 << sep_index.min(63);
                    *byte = b'/';
                    sep_index += 1;
                }
                b'/' => sep_index += 1,
                _ => {}
            }
        }
    }

    // Only ASCII separators were touched, so the bytes are still valid UTF-8.
    (String::from_utf8(out).expect("canonicalization preserves UTF-8"), slash_bits)
}

/// A canonicalized UTF-8 path identifying a target in the build graph.
///
/// Equality, ordering and hashing consider the canonical string only; the
/// slash-bits mask is metadata for lossy round-tripping to the OS-native
/// spelling.
#[derive(Debug, Clone, Default, Eq)]
pub struct CanonicalPath {
    value: String,
    slash_bits: u64,
}

impl CanonicalPath {
    /// Canonicalize `path` using this host's separator semantics.
    pub fn new(path: impl Into<String>) -> CanonicalPath {
        Self::with_windows_semantics(path, cfg!(windows))
    }

    /// Canonicalize with explicit separator semantics. Exposed so that both
    /// behaviors stay testable on any host.
    pub fn with_windows_semantics(path: impl Into<String>, windows: bool) -> CanonicalPath {
        let (value, slash_bits) = canonicalize(&path.into(), windows);
        CanonicalPath { value, slash_bits }
    }

    /// Build from an already canonical string and mask, bypassing
    /// canonicalization. For callers reconstructing paths from a log.
    pub fn from_raw(value: impl Into<String>, slash_bits: u64) -> CanonicalPath {
        CanonicalPath {
            value: value.into(),
            slash_bits,
        }
    }

    /// The canonical path value. Always forward slashes.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The recorded back-to-forward conversions. Always zero when built
    /// with POSIX semantics.
    pub fn slash_bits(&self) -> u64 {
        self.slash_bits
    }

    /// Recover the original-separator spelling: the forward slash at
    /// separator position `i` becomes a backslash when bit `min(i, 63)` of
    /// the mask is set.
    pub fn decanonicalized(&self) -> String {
        let mut bytes = self.value.clone().into_bytes();
        let mut sep_index = 0usize;
        for byte in bytes.iter_mut() {
            if *byte == b'/' {
                if self.slash_bits & (1u64 << sep_index.min(63)) != 0 {
                    *byte = b'\\';
                }
                sep_index += 1;
            }
        }
        String::from_utf8(bytes).expect("separator rewrite preserves UTF-8")
    }
}

impl PartialEq for CanonicalPath {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialOrd for CanonicalPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for CanonicalPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl From<&str> for CanonicalPath {
    fn from(path: &str) -> Self {
        CanonicalPath::new(path)
    }
}

impl From<String> for CanonicalPath {
    fn from(path: String) -> Self {
        CanonicalPath::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posix(path: &str) -> CanonicalPath {
        CanonicalPath::with_windows_semantics(path, false)
    }

    fn win(path: &str) -> CanonicalPath {
        CanonicalPath::with_windows_semantics(path, true)
    }

    #[test]
    fn test_empty() {
        let empty = CanonicalPath::default();
        assert_eq!(empty.value(), "");
        assert_eq!(empty.slash_bits(), 0);

        assert_eq!(posix("").value(), "");
    }

    #[test]
    fn test_simple() {
        let path = posix("foo/bar");
        assert_eq!(path.value(), "foo/bar");
        assert_eq!(path.slash_bits(), 0);
    }

    #[test]
    fn test_path_samples() {
        assert_eq!(posix("foo.h").value(), "foo.h");
        assert_eq!(posix("./foo.h").value(), "foo.h");
        assert_eq!(posix("./foo/./bar.h").value(), "foo/bar.h");
        assert_eq!(posix("./x/foo/../bar.h").value(), "x/bar.h");
        assert_eq!(posix("./x/foo/../../bar.h").value(), "bar.h");
        assert_eq!(posix("foo//bar").value(), "foo/bar");
        assert_eq!(posix("foo//.//..///bar").value(), "bar");
        assert_eq!(posix("./x/../foo/../../bar.h").value(), "../bar.h");
        assert_eq!(posix("foo/./.").value(), "foo");
        assert_eq!(posix("foo/bar/..").value(), "foo");
        assert_eq!(posix("foo/.hidden_bar").value(), "foo/.hidden_bar");
        assert_eq!(posix("/foo").value(), "/foo");
        assert_eq!(posix("//foo").value(), "/foo");
        assert_eq!(posix("..").value(), "..");
        assert_eq!(posix("../").value(), "..");
        assert_eq!(posix("../foo").value(), "../foo");
        assert_eq!(posix("../..").value(), "../..");
        assert_eq!(posix("../../").value(), "../..");
        assert_eq!(posix("./../").value(), "..");
        assert_eq!(posix("/../").value(), "/..");
        assert_eq!(posix("/../..").value(), "/../..");
        assert_eq!(posix("/../../").value(), "/../..");
        assert_eq!(posix("/").value(), "/");
        assert_eq!(posix("/foo/..").value(), "/");
        assert_eq!(posix(".").value(), ".");
        assert_eq!(posix("./.").value(), ".");
        assert_eq!(posix("foo/..").value(), ".");
        assert_eq!(posix("foo/.._bar").value(), "foo/.._bar");
    }

    #[test]
    fn test_path_samples_windows_semantics() {
        assert_eq!(win(".\\foo.h").value(), "foo.h");
        assert_eq!(win(".\\foo\\.\\bar.h").value(), "foo/bar.h");
        assert_eq!(win(".\\x\\foo\\..\\bar.h").value(), "x/bar.h");
        assert_eq!(win(".\\x\\foo\\..\\..\\bar.h").value(), "bar.h");
        assert_eq!(win("foo\\\\bar").value(), "foo/bar");
        assert_eq!(win("foo\\\\.\\\\..\\\\\\bar").value(), "bar");
        assert_eq!(win(".\\x\\..\\foo\\..\\..\\bar.h").value(), "../bar.h");
        assert_eq!(win("foo\\.\\.").value(), "foo");
        assert_eq!(win("foo\\bar\\..").value(), "foo");
        assert_eq!(win("foo\\.hidden_bar").value(), "foo/.hidden_bar");
        assert_eq!(win("\\foo").value(), "/foo");
        assert_eq!(win("\\\\foo").value(), "//foo");
        assert_eq!(win("\\").value(), "/");
        // POSIX semantics collapse the leading double separator instead.
        assert_eq!(posix("//foo").value(), "/foo");
    }

    #[test]
    fn test_slash_tracking() {
        let samples: &[(&str, &str, u64)] = &[
            ("foo.h", "foo.h", 0),
            ("a\\foo.h", "a/foo.h", 0b1),
            ("a/bcd/efh\\foo.h", "a/bcd/efh/foo.h", 0b100),
            ("a\\bcd/efh\\foo.h", "a/bcd/efh/foo.h", 0b101),
            ("a\\bcd\\efh\\foo.h", "a/bcd/efh/foo.h", 0b111),
            ("a/bcd/efh/foo.h", "a/bcd/efh/foo.h", 0),
            ("a\\./efh\\foo.h", "a/efh/foo.h", 0b11),
            ("a\\../efh\\foo.h", "efh/foo.h", 0b1),
            ("a\\b\\c\\d\\e\\f\\g\\foo.h", "a/b/c/d/e/f/g/foo.h", 0b111_1111),
            ("a\\b\\c\\..\\..\\..\\g\\foo.h", "g/foo.h", 0b1),
            ("a\\b/c\\../../..\\g\\foo.h", "g/foo.h", 0b1),
            ("a\\b/c\\./../..\\g\\foo.h", "a/g/foo.h", 0b11),
            ("a\\b/c\\./../..\\g/foo.h", "a/g/foo.h", 0b1),
            ("a\\\\\\foo.h", "a/foo.h", 0b1),
            ("a/\\\\foo.h", "a/foo.h", 0),
            ("a\\//foo.h", "a/foo.h", 0b1),
        ];
        for (input, value, bits) in samples {
            let path = win(input);
            assert_eq!(path.value(), *value, "input {input:?}");
            assert_eq!(path.slash_bits(), *bits, "input {input:?}");
        }
    }

    #[test]
    fn test_many_components() {
        // 33 backslash separators: bits 0..=32 set.
        let input = "a\\".repeat(32) + "x\\y.h";
        let path = win(&input);
        assert_eq!(path.value().matches('/').count(), 33);
        assert_eq!(path.slash_bits(), 0x1_ffff_ffff);

        // Past 64 separators the top bit coalesces them all.
        let input = "a\\".repeat(218) + "y.h";
        let path = win(&input);
        assert_eq!(path.value().matches('/').count(), 218);
        assert_eq!(path.slash_bits(), u64::MAX);

        // Forward slashes never set a bit, however many there are.
        let input = "a/".repeat(218) + "y.h";
        let path = win(&input);
        assert_eq!(path.value().matches('/').count(), 218);
        assert_eq!(path.slash_bits(), 0);
    }

    #[test]
    fn test_up_dir() {
        assert_eq!(posix("../../foo/bar.h").value(), "../../foo/bar.h");
        assert_eq!(posix("test/../../foo/bar.h").value(), "../foo/bar.h");
    }

    #[test]
    fn test_absolute_path() {
        assert_eq!(posix("/usr/include/stdio.h").value(), "/usr/include/stdio.h");
    }

    #[test]
    fn test_idempotence() {
        for input in [
            "./x/foo/../../bar.h",
            "foo//.//..///bar",
            "/../../",
            "a/b/c/../../../g/foo.h",
            ".",
            "/",
        ] {
            let once = posix(input);
            let twice = posix(once.value());
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    #[test]
    fn test_equality_is_canonical() {
        assert_eq!(posix("./a/../b"), posix("b"));
        assert_ne!(posix("a"), posix("b"));

        // slash_bits never participates in equality or hashing.
        let forward = win("a/foo.h");
        let backward = win("a\\foo.h");
        assert_eq!(forward, backward);

        use std::collections::hash_map::DefaultHasher;
        let hash = |path: &CanonicalPath| {
            let mut hasher = DefaultHasher::new();
            path.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(hash(&forward), hash(&backward));
    }

    #[test]
    fn test_decanonicalized() {
        assert_eq!(win("a\\bcd/efh\\foo.h").decanonicalized(), "a\\bcd/efh\\foo.h");
        assert_eq!(win("a/b/c").decanonicalized(), "a/b/c");
        assert_eq!(posix("a/b/c").decanonicalized(), "a/b/c");
        assert_eq!(
            CanonicalPath::from_raw("a/b/c", u64::MAX).decanonicalized(),
            "a\\b\\c"
        );
    }

    #[test]
    fn test_spec_scenario_windows_mixed() {
        let path = win("a\\b/c\\./../..\\g/foo.h");
        assert_eq!(path.value(), "a/g/foo.h");
        assert_eq!(path.slash_bits(), 0b0001);
    }
}

//! Deterministic destination layout.
//!
//! A record's identity is already a path-derived hash fixed at indexing
//! time, so the destination is a pure function of identity, base directory,
//! and file name: retries land on the same path without consulting state.

use rehome_types::RecordId;

/// Splits identities into `depth` directory segments of `width` characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathResolver {
    depth: usize,
    width: usize,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self { depth: 3, width: 2 }
    }
}

impl PathResolver {
    #[must_use]
    pub fn new(depth: usize, width: usize) -> Self {
        Self { depth, width }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Directory segments for `identity`. Identities shorter than
    /// `depth * width` characters yield a shorter last segment and no empty
    /// ones.
    pub fn segments<'a>(&self, identity: &'a str) -> impl Iterator<Item = &'a str> {
        let width = self.width;
        let mut rest = identity;
        (0..self.depth).map_while(move |_| {
            if rest.is_empty() || width == 0 {
                return None;
            }
            let cut = rest
                .char_indices()
                .nth(width)
                .map_or(rest.len(), |(idx, _)| idx);
            let (segment, tail) = rest.split_at(cut);
            rest = tail;
            Some(segment)
        })
    }

    /// `<base_dir>/<seg1>/.../<segD>/<file_name>`.
    #[must_use]
    pub fn resolve(&self, id: &RecordId, base_dir: &str, file_name: &str) -> String {
        let base = base_dir.trim_end_matches('/');
        let mut path =
            String::with_capacity(base.len() + id.as_str().len() + self.depth + file_name.len() + 1);
        path.push_str(base);
        for segment in self.segments(id.as_str()) {
            path.push('/');
            path.push_str(segment);
        }
        path.push('/');
        path.push_str(file_name);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(resolver: PathResolver, id: &str, base: &str, name: &str) -> String {
        resolver.resolve(&RecordId::new(id), base, name)
    }

    #[test]
    fn default_layout() {
        assert_eq!(
            resolve(PathResolver::default(), "a1b2c3d4e5f6", "/dest", "report.pdf"),
            "/dest/a1/b2/c3/report.pdf"
        );
    }

    #[test]
    fn deterministic() {
        let resolver = PathResolver::new(4, 3);
        let a = resolve(resolver, "0123456789abcdef", "/organized", "x.txt");
        let b = resolve(resolver, "0123456789abcdef", "/organized", "x.txt");
        assert_eq!(a, b);
        assert_eq!(a, "/organized/012/345/678/9ab/x.txt");
    }

    #[test]
    fn short_identity_truncates_last_segment() {
        assert_eq!(
            resolve(PathResolver::default(), "a1b2c", "/dest", "f"),
            "/dest/a1/b2/c/f"
        );
        assert_eq!(
            resolve(PathResolver::default(), "a1b", "/dest", "f"),
            "/dest/a1/b/f"
        );
    }

    #[test]
    fn empty_identity_places_file_under_base() {
        assert_eq!(resolve(PathResolver::default(), "", "/dest", "f"), "/dest/f");
    }

    #[test]
    fn trailing_slash_on_base_is_normalised() {
        assert_eq!(
            resolve(PathResolver::default(), "a1b2c3", "/dest/", "f"),
            "/dest/a1/b2/c3/f"
        );
        assert_eq!(
            resolve(PathResolver::default(), "a1b2c3", "/", "f"),
            "/a1/b2/c3/f"
        );
    }

    #[test]
    fn segments_are_char_wise() {
        let resolver = PathResolver::new(2, 2);
        let segments: Vec<_> = resolver.segments("éàüö").collect();
        assert_eq!(segments, vec!["éà", "üö"]);
    }

    #[test]
    fn zero_width_yields_no_segments() {
        assert_eq!(
            resolve(PathResolver::new(3, 0), "a1b2c3", "/dest", "f"),
            "/dest/f"
        );
    }
}

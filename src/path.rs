//! Normalizes and splits a kernel-supplied absolute path into `(dir, file)`,
//! per spec §4.4. Three shapes are valid: the root, a directory, and a
//! file; anything deeper, or with an empty component, is rejected.
//!
//! The FUSE kernel protocol itself is inode-based (both the teacher's
//! `fuse` crate and its maintained successor `fuser` hand the dispatcher a
//! `(parent_ino, name)` pair, not a path string) — `fs::Dispatcher`
//! reconstructs the logical path from its inode table and always runs it
//! through this resolver before touching the namespace, so the validation
//! rules live in exactly one place. The resolver works on raw bytes: a
//! channel name is restricted to UTF-8 (the backend's channel-name field is
//! text), but a filename component is passed through untouched so an
//! attachment name with non-UTF-8 bytes still resolves.

use crate::error::DcfsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    Root,
    Dir(String),
    File(String, Vec<u8>),
}

/// `path` must start with `/`. Splits on `/`, rejecting empty components,
/// more than two levels of nesting, and a non-UTF-8 directory component.
pub fn resolve(path: &[u8]) -> Result<ResolvedPath, DcfsError> {
    if path.first() != Some(&b'/') {
        return Err(DcfsError::NotPermitted);
    }
    if path == b"/" {
        return Ok(ResolvedPath::Root);
    }

    let mut components = path[1..].split(|&b| b == b'/');
    let first = components.next().unwrap_or(b"");
    if first.is_empty() {
        return Err(DcfsError::NotPermitted);
    }
    let dirname = std::str::from_utf8(first)
        .map_err(|_| DcfsError::NotPermitted)?
        .to_string();

    match components.next() {
        None => Ok(ResolvedPath::Dir(dirname)),
        Some(second) => {
            if second.is_empty() {
                return Err(DcfsError::NotPermitted);
            }
            if components.next().is_some() {
                // depth > 2
                return Err(DcfsError::NotPermitted);
            }
            Ok(ResolvedPath::File(dirname, second.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves() {
        assert_eq!(resolve(b"/").unwrap(), ResolvedPath::Root);
    }

    #[test]
    fn directory_resolves() {
        assert_eq!(resolve(b"/general").unwrap(), ResolvedPath::Dir("general".to_string()));
    }

    #[test]
    fn file_resolves() {
        assert_eq!(
            resolve(b"/general/hello.txt").unwrap(),
            ResolvedPath::File("general".to_string(), b"hello.txt".to_vec())
        );
    }

    #[test]
    fn file_component_need_not_be_utf8() {
        let mut path = b"/general/".to_vec();
        path.extend_from_slice(b"\xff\xfe");
        assert_eq!(
            resolve(&path).unwrap(),
            ResolvedPath::File("general".to_string(), b"\xff\xfe".to_vec())
        );
    }

    #[test]
    fn depth_beyond_two_is_rejected() {
        assert!(resolve(b"/a/b/c").is_err());
    }

    #[test]
    fn empty_components_are_rejected() {
        assert!(resolve(b"//x").is_err());
        assert!(resolve(b"/a/").is_err());
    }

    #[test]
    fn missing_leading_slash_is_rejected() {
        assert!(resolve(b"general/hello.txt").is_err());
    }
}

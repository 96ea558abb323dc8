//! Ordered traversal of a `FileStore` tree for the fileplayer: `first`/
//! `last`/`next`/`previous` step across directory boundaries in timestamp
//! order (the tree's paths already sort lexically the way they're derived),
//! `reposition` seeks to a path or its closest neighbour. Grounded on the
//! teacher's `table::table_reader::TableReader` ordered-traversal shape,
//! simplified from a multi-partition timestamp-merge down to one flat,
//! already-sorted listing — there's only ever one stream per tree, not many
//! partitions to interleave.

use std::path::{Path, PathBuf};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reposition {
    Ok,
    OutOfTree,
    OffTheEnd,
}

/// Filters hidden files and, optionally, files whose basename doesn't start
/// with a required prefix — needed to let multiple streams share one base
/// directory, at the cost of a slower tree scan.
#[derive(Debug, Clone, Default)]
pub struct IgnorePredicate {
    pub required_prefix: Option<String>,
}

impl IgnorePredicate {
    pub fn should_ignore(&self, file_name: &str) -> bool {
        if file_name.starts_with('.') {
            return true;
        }
        match &self.required_prefix {
            Some(prefix) => !file_name.starts_with(prefix.as_str()),
            None => false,
        }
    }
}

pub struct FileTree {
    base: PathBuf,
    ignore: IgnorePredicate,
    entries: Vec<PathBuf>,
    index: Option<usize>,
    moved: bool,
}

impl FileTree {
    pub fn new(base: impl Into<PathBuf>, ignore: IgnorePredicate) -> Result<Self> {
        let base = base.into();
        let entries = scan(&base, &ignore)?;
        Ok(Self { base, ignore, entries, index: None, moved: false })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> Option<&Path> {
        self.index.map(|i| self.entries[i].as_path())
    }

    pub fn first(&mut self) -> Option<&Path> {
        self.moved = true;
        self.index = if self.entries.is_empty() { None } else { Some(0) };
        self.current()
    }

    pub fn last(&mut self) -> Option<&Path> {
        self.moved = true;
        self.index = self.entries.len().checked_sub(1);
        self.current()
    }

    /// `reverse` inverts the step direction; both `next` and `previous` are
    /// expressed through it.
    pub fn step(&mut self, reverse: bool) -> Option<&Path> {
        self.moved = true;
        match self.index {
            None => {
                if reverse {
                    self.last()
                } else {
                    self.first()
                }
            }
            Some(i) => {
                let next = if reverse { i.checked_sub(1) } else { i.checked_add(1) };
                match next {
                    Some(n) if n < self.entries.len() => {
                        self.index = Some(n);
                        self.current()
                    }
                    _ => {
                        self.index = None;
                        None
                    }
                }
            }
        }
    }

    pub fn next(&mut self) -> Option<&Path> {
        self.step(false)
    }

    pub fn previous(&mut self) -> Option<&Path> {
        self.step(true)
    }

    /// Seeks to `target`, or the closest existing neighbour if `target`
    /// itself isn't in the tree.
    pub fn reposition(&mut self, target: &Path) -> Reposition {
        self.moved = true;
        if !target.starts_with(&self.base) {
            self.index = None;
            return Reposition::OutOfTree;
        }
        match self.entries.binary_search_by(|p| p.as_path().cmp(target)) {
            Ok(i) => {
                self.index = Some(i);
                Reposition::Ok
            }
            Err(i) if i >= self.entries.len() => {
                self.index = self.entries.len().checked_sub(1);
                Reposition::OffTheEnd
            }
            Err(i) => {
                self.index = Some(i);
                Reposition::Ok
            }
        }
    }

    /// Only valid when `new_base` is a sibling of the current base.
    pub fn reroot(&mut self, new_base: impl Into<PathBuf>) -> Result<()> {
        let new_base = new_base.into();
        if new_base.parent() != self.base.parent() {
            return Err(crate::Error::Unsupported("reroot target must be a sibling of the current base"));
        }
        self.entries = scan(&new_base, &self.ignore)?;
        self.base = new_base;
        self.index = None;
        self.moved = true;
        Ok(())
    }

    /// `true` for one cycle after any seek; the player uses this to blank
    /// the display while hunting. Call [`Self::clear_moved`] once consumed.
    pub fn moved(&self) -> bool {
        self.moved
    }

    pub fn clear_moved(&mut self) {
        self.moved = false;
    }
}

fn scan(base: &Path, ignore: &IgnorePredicate) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    scan_dir(base, ignore, &mut out)?;
    out.sort();
    Ok(out)
}

fn scan_dir(dir: &Path, ignore: &IgnorePredicate, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if ignore.should_ignore(&name_str) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            scan_dir(&entry.path(), ignore, out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn traverses_in_timestamp_order_across_hour_boundaries() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        touch(&base.join("2026/07/26/09/cam-090000.jpg"));
        touch(&base.join("2026/07/26/10/cam-100000.jpg"));
        touch(&base.join("2026/07/26/10/cam-100500.jpg"));

        let mut tree = FileTree::new(base, IgnorePredicate::default()).unwrap();
        let first = tree.first().unwrap().to_path_buf();
        assert!(first.ends_with("09/cam-090000.jpg"));
        let second = tree.next().unwrap().to_path_buf();
        assert!(second.ends_with("10/cam-100000.jpg"));
        let third = tree.next().unwrap().to_path_buf();
        assert!(third.ends_with("10/cam-100500.jpg"));
        assert!(tree.next().is_none());
    }

    #[test]
    fn ignores_hidden_files_and_enforces_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        touch(&base.join("2026/07/26/10/.hidden.jpg"));
        touch(&base.join("2026/07/26/10/other-100000.jpg"));
        touch(&base.join("2026/07/26/10/cam-100000.jpg"));

        let ignore = IgnorePredicate { required_prefix: Some("cam".to_string()) };
        let tree = FileTree::new(base, ignore).unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn reposition_reports_out_of_tree_and_off_the_end() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        touch(&base.join("2026/07/26/10/cam-100000.jpg"));
        let mut tree = FileTree::new(base, IgnorePredicate::default()).unwrap();

        assert_eq!(tree.reposition(Path::new("/somewhere/else.jpg")), Reposition::OutOfTree);
        let target = base.join("2026/07/26/10/cam-100000.jpg");
        assert_eq!(tree.reposition(&target), Reposition::Ok);
        assert_eq!(tree.current(), Some(target.as_path()));
        assert_eq!(tree.reposition(&base.join("2026/07/26/99/zzz-999999.jpg")), Reposition::OffTheEnd);
    }

    #[test]
    fn moved_flag_is_set_by_seeks_and_clears_on_demand() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        touch(&base.join("2026/07/26/10/cam-100000.jpg"));
        let mut tree = FileTree::new(base, IgnorePredicate::default()).unwrap();
        assert!(!tree.moved());
        tree.first();
        assert!(tree.moved());
        tree.clear_moved();
        assert!(!tree.moved());
    }
}

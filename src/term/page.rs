//! On-disk term pages and their volatile scratch files.
//!
//! A page directory holds `{index:08}.page` files with a bincode-encoded term
//! list and, once a reasoner has run over them, `{index:08}.volatile` files
//! with the page's raw scratch floats. Both start with a 64-byte header:
//!
//! ```text
//! 0..8    magic
//! 8..12   format version (u32 LE)
//! 12..13  scratch kind tag (volatile files only)
//! 16..24  item count (u64 LE): terms, or scratch floats
//! 24..32  payload length in bytes (u64 LE)
//! ```
//!
//! Committed files are read back through a read-only memory map. Pages are
//! written once by the grounding thread and never modified afterwards;
//! volatile files are rewritten after every read-write pass.

use std::fs;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{HlmrfResult, StoreError};
use crate::term::Term;
use crate::term::store::ScratchKind;

const PAGE_MAGIC: &[u8; 8] = b"HLMPAGE\0";
const VOLATILE_MAGIC: &[u8; 8] = b"HLMVOLA\0";
const HEADER_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64; // Reserve 64 bytes for future expansion

/// A directory of numbered page files.
#[derive(Debug, Clone)]
pub struct PageDir {
    dir: PathBuf,
}

impl PageDir {
    /// Use `dir` for pages, creating it if needed.
    pub fn create(dir: &Path) -> HlmrfResult<Self> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{index:08}.page"))
    }

    pub fn volatile_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{index:08}.volatile"))
    }

    /// Serialize `terms` as page `index`. Returns the bytes written.
    pub fn write_terms(&self, index: usize, terms: &[Term]) -> HlmrfResult<usize> {
        let path = self.page_path(index);
        let payload = bincode::serialize(terms).map_err(|e| StoreError::Serialization {
            message: format!("encoding page {index}: {e}"),
        })?;
        let mut buf = header(PAGE_MAGIC, 0, terms.len(), payload.len());
        buf.extend_from_slice(&payload);
        fs::write(&path, &buf).map_err(|e| io_err(&path, e))?;
        Ok(buf.len())
    }

    pub fn read_terms(&self, index: usize) -> HlmrfResult<Vec<Term>> {
        let path = self.page_path(index);
        let mmap = map(&path)?;
        let (count, payload) = check_header(&path, &mmap, PAGE_MAGIC)?;
        let terms: Vec<Term> =
            bincode::deserialize(payload).map_err(|e| StoreError::Serialization {
                message: format!("decoding {}: {e}", path.display()),
            })?;
        if terms.len() != count {
            return Err(invalid(&path, format!("header says {count} terms, found {}", terms.len())));
        }
        Ok(terms)
    }

    /// Overwrite the scratch of page `index`.
    pub fn write_scratch(&self, index: usize, kind: ScratchKind, scratch: &[f32]) -> HlmrfResult<()> {
        let path = self.volatile_path(index);
        let mut buf = header(VOLATILE_MAGIC, kind.tag(), scratch.len(), scratch.len() * 4);
        for value in scratch {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        fs::write(&path, &buf).map_err(|e| io_err(&path, e))
    }

    /// Scratch of page `index`, or `None` if the page has never been written
    /// back with this kind.
    pub fn read_scratch(&self, index: usize, kind: ScratchKind) -> HlmrfResult<Option<Vec<f32>>> {
        let path = self.volatile_path(index);
        if !path.exists() {
            return Ok(None);
        }
        let mmap = map(&path)?;
        let (count, payload) = check_header(&path, &mmap, VOLATILE_MAGIC)?;
        if ScratchKind::from_tag(mmap[12]) != Some(kind) {
            return Ok(None);
        }
        if payload.len() != count * 4 {
            return Err(invalid(&path, format!("expected {count} floats, found {} bytes", payload.len())));
        }
        Ok(Some(
            payload
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes(b.try_into().expect("4 bytes")))
                .collect(),
        ))
    }

    /// Remove the scratch file of page `index`, if any.
    pub fn drop_scratch(&self, index: usize) -> HlmrfResult<()> {
        remove_if_exists(&self.volatile_path(index))
    }

    /// Remove both files of page `index`.
    pub fn remove(&self, index: usize) -> HlmrfResult<()> {
        remove_if_exists(&self.page_path(index))?;
        remove_if_exists(&self.volatile_path(index))
    }
}

fn header(magic: &[u8; 8], tag: u8, count: usize, payload: usize) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE];
    buf[..8].copy_from_slice(magic);
    buf[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    buf[12] = tag;
    buf[16..24].copy_from_slice(&(count as u64).to_le_bytes());
    buf[24..32].copy_from_slice(&(payload as u64).to_le_bytes());
    buf
}

fn map(path: &Path) -> HlmrfResult<Mmap> {
    let file = fs::File::open(path).map_err(|e| io_err(path, e))?;
    // Safety: page files are private to one store and never modified while mapped.
    let mmap = unsafe { Mmap::map(&file).map_err(|e| io_err(path, e))? };
    Ok(mmap)
}

/// Validate a header and return `(count, payload)`.
fn check_header<'m>(path: &Path, mmap: &'m Mmap, magic: &[u8; 8]) -> HlmrfResult<(usize, &'m [u8])> {
    if mmap.len() < HEADER_SIZE {
        return Err(invalid(path, format!("file is {} bytes, shorter than its header", mmap.len())));
    }
    if &mmap[..8] != magic {
        return Err(invalid(path, "bad magic".to_string()));
    }
    let version = u32::from_le_bytes(mmap[8..12].try_into().expect("4 bytes for version"));
    if version != HEADER_VERSION {
        return Err(invalid(path, format!("version {version} != expected {HEADER_VERSION}")));
    }
    let count = u64::from_le_bytes(mmap[16..24].try_into().expect("8 bytes")) as usize;
    let len = u64::from_le_bytes(mmap[24..32].try_into().expect("8 bytes")) as usize;
    if HEADER_SIZE + len > mmap.len() {
        return Err(invalid(path, format!("payload of {len} bytes is truncated")));
    }
    Ok((count, &mmap[HEADER_SIZE..HEADER_SIZE + len]))
}

fn remove_if_exists(path: &Path) -> HlmrfResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

pub(crate) fn io_err(path: &Path, source: std::io::Error) -> crate::error::HlmrfError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
    .into()
}

fn invalid(path: &Path, message: String) -> crate::error::HlmrfError {
    StoreError::InvalidPage {
        path: path.display().to_string(),
        message,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Comparator, RuleId};
    use crate::term::{Shape, TermKind};
    use tempfile::TempDir;

    fn terms() -> Vec<Term> {
        vec![
            Term::new(
                RuleId::new(1),
                vec![0, 4],
                vec![1.0, -0.5],
                0.25,
                TermKind::Potential {
                    weight: 2.0,
                    shape: Shape::SquaredHinge,
                },
            ),
            Term::new(
                RuleId::new(2),
                vec![3],
                vec![1.0],
                1.0,
                TermKind::Constraint {
                    comparator: Comparator::Eq,
                },
            ),
        ]
    }

    #[test]
    fn page_files_are_named_by_index() {
        let dir = TempDir::new().unwrap();
        let pages = PageDir::create(dir.path()).unwrap();
        assert!(pages.page_path(7).ends_with("00000007.page"));
        assert!(pages.volatile_path(12).ends_with("00000012.volatile"));
    }

    #[test]
    fn terms_survive_a_write() {
        let dir = TempDir::new().unwrap();
        let pages = PageDir::create(dir.path()).unwrap();
        pages.write_terms(0, &terms()).unwrap();
        assert_eq!(pages.read_terms(0).unwrap(), terms());
    }

    #[test]
    fn scratch_is_tagged_with_its_kind() {
        let dir = TempDir::new().unwrap();
        let pages = PageDir::create(dir.path()).unwrap();
        assert_eq!(pages.read_scratch(3, ScratchKind::Admm).unwrap(), None);
        pages.write_scratch(3, ScratchKind::Admm, &[0.5, -1.0, 2.0]).unwrap();
        assert_eq!(
            pages.read_scratch(3, ScratchKind::Admm).unwrap(),
            Some(vec![0.5, -1.0, 2.0])
        );
        // Scratch of another reasoner is ignored.
        assert_eq!(pages.read_scratch(3, ScratchKind::DualLcqp).unwrap(), None);
        pages.drop_scratch(3).unwrap();
        assert_eq!(pages.read_scratch(3, ScratchKind::Admm).unwrap(), None);
    }

    #[test]
    fn corrupt_page_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pages = PageDir::create(dir.path()).unwrap();
        fs::write(pages.page_path(0), b"not a page").unwrap();
        let err = pages.read_terms(0).unwrap_err();
        assert!(matches!(
            err,
            crate::error::HlmrfError::Store(StoreError::InvalidPage { .. })
        ));
    }

    #[test]
    fn missing_page_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let pages = PageDir::create(dir.path()).unwrap();
        let err = pages.read_terms(9).unwrap_err();
        assert!(matches!(err, crate::error::HlmrfError::Store(StoreError::Io { .. })));
    }

    #[test]
    fn remove_tolerates_missing_files() {
        let dir = TempDir::new().unwrap();
        let pages = PageDir::create(dir.path()).unwrap();
        pages.write_terms(1, &terms()).unwrap();
        pages.remove(1).unwrap();
        pages.remove(1).unwrap();
        assert!(!pages.page_path(1).exists());
    }
}

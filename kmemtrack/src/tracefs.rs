//! tracefs discovery and tracepoint `format` parsing
//!
//! Tracepoint record layouts change between kernel versions, so the eBPF
//! programs never hardcode field offsets. They are read from
//! `events/kmem/<name>/format` at startup:
//!
//! ```text
//! name: kmalloc
//! ID: 470
//! format:
//!     field:unsigned short common_type;   offset:0;   size:2; signed:0;
//!     field:unsigned long call_site;      offset:8;   size:8; signed:0;
//!     field:const void * ptr;     offset:16;  size:8; signed:0;
//!     field:size_t bytes_alloc;   offset:32;  size:8; signed:0;
//! ```

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use kmemtrack_common::FieldLayout;

use crate::domain::BackendError;
use crate::tracepoints::KmemTracepoint;

/// Mount points tried in order when `--tracefs` is not given
pub const TRACEFS_CANDIDATES: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// One `field:` line of a format file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatField {
    pub name: String,
    pub offset: u16,
    pub size: u16,
}

#[derive(Debug, Clone)]
pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    /// Find a mounted tracefs
    ///
    /// # Errors
    /// Returns [`BackendError::TracefsNotFound`] when no candidate has an
    /// `events` directory.
    pub fn locate(explicit: Option<&Path>) -> Result<Self, BackendError> {
        let candidates: Vec<PathBuf> = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => TRACEFS_CANDIDATES.iter().map(PathBuf::from).collect(),
        };
        candidates
            .iter()
            .find(|root| root.join("events").is_dir())
            .map(|root| Self::at(root.clone()))
            .ok_or_else(|| {
                BackendError::TracefsNotFound(
                    candidates.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "),
                )
            })
    }

    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `events/kmem/<name>` relative to `base` (the root or an instance)
    #[must_use]
    pub fn event_dir(base: &Path, name: &str) -> PathBuf {
        base.join("events").join("kmem").join(name)
    }

    #[must_use]
    pub fn has_event(&self, name: &str) -> bool {
        Self::event_dir(&self.root, name).is_dir()
    }

    /// Read a tracepoint's format file and locate its address and size fields
    ///
    /// # Errors
    /// Returns [`BackendError::MissingTracepoint`] if the tracepoint does not
    /// exist, or [`BackendError::BadFormat`] if an expected field is missing.
    pub fn field_layout(&self, tp: &KmemTracepoint) -> Result<FieldLayout, BackendError> {
        let path = Self::event_dir(&self.root, tp.name).join("format");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::MissingTracepoint(tp.name.to_string())
            } else {
                BackendError::tracefs("read", &path, e)
            }
        })?;
        layout_from_fields(tp, &parse_format(&content))
    }
}

/// `field:<decl>; offset:<n>; size:<n>;`
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*field:(?P<decl>[^;]+);\s*offset:(?P<offset>\d+);\s*size:(?P<size>\d+);")
        .expect("Invalid format field regex pattern")
});

/// Parse every `field:` line; lines that don't match are skipped
#[must_use]
pub fn parse_format(content: &str) -> Vec<FormatField> {
    content
        .lines()
        .filter_map(|line| {
            let caps = FIELD_RE.captures(line)?;
            Some(FormatField {
                name: field_name(&caps["decl"])?.to_string(),
                offset: caps["offset"].parse().ok()?,
                size: caps["size"].parse().ok()?,
            })
        })
        .collect()
}

/// Last identifier of a C declaration: `const void * ptr` -> `ptr`, `char name[16]` -> `name`
fn field_name(decl: &str) -> Option<&str> {
    let mut decl = decl.trim_end();
    while let Some(stripped) = decl.strip_suffix(']') {
        decl = stripped[..stripped.rfind('[')?].trim_end();
    }
    decl.rsplit(|c: char| !(c.is_ascii_alphanumeric() || c == '_')).next().filter(|n| !n.is_empty())
}

/// Build the eBPF-side layout for `tp` from its parsed fields
///
/// # Errors
/// Returns [`BackendError::BadFormat`] if a field is missing or wider than 8 bytes.
pub fn layout_from_fields(
    tp: &KmemTracepoint,
    fields: &[FormatField],
) -> Result<FieldLayout, BackendError> {
    let find = |name: &str| -> Result<&FormatField, BackendError> {
        let field = fields.iter().find(|f| f.name == name).ok_or_else(|| BackendError::BadFormat {
            event: tp.name.to_string(),
            reason: format!("no field named {name}"),
        })?;
        if !matches!(field.size, 1 | 2 | 4 | 8) {
            return Err(BackendError::BadFormat {
                event: tp.name.to_string(),
                reason: format!("field {name} has unsupported size {}", field.size),
            });
        }
        Ok(field)
    };

    let address = find(tp.address_field)?;
    let (size_offset, size_size) = match tp.size_field {
        Some(name) => {
            let field = find(name)?;
            (field.offset, field.size)
        }
        None => (0, 0),
    };

    Ok(FieldLayout {
        address_offset: address.offset,
        address_size: address.size,
        size_offset,
        size_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracepoints;

    const KMALLOC_FORMAT: &str = "\
name: kmalloc
ID: 470
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:unsigned long call_site;\toffset:8;\tsize:8;\tsigned:0;
\tfield:const void * ptr;\toffset:16;\tsize:8;\tsigned:0;
\tfield:size_t bytes_req;\toffset:24;\tsize:8;\tsigned:0;
\tfield:size_t bytes_alloc;\toffset:32;\tsize:8;\tsigned:0;
\tfield:unsigned long gfp_flags;\toffset:40;\tsize:8;\tsigned:0;

print fmt: \"call_site=%pS ptr=%p bytes_req=%zu bytes_alloc=%zu\"
";

    #[test]
    fn test_parse_format_fields() {
        let fields = parse_format(KMALLOC_FORMAT);
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[4], FormatField { name: "ptr".to_string(), offset: 16, size: 8 });
    }

    #[test]
    fn test_field_name_from_declaration() {
        assert_eq!(field_name("const void * ptr"), Some("ptr"));
        assert_eq!(field_name("char name[16]"), Some("name"));
        assert_eq!(field_name("unsigned long pfn"), Some("pfn"));
        assert_eq!(field_name("__data_loc char[] name"), Some("name"));
    }

    #[test]
    fn test_layout_for_kmalloc() {
        let tp = tracepoints::by_name("kmalloc").unwrap();
        let layout = layout_from_fields(tp, &parse_format(KMALLOC_FORMAT)).unwrap();
        assert_eq!(
            layout,
            FieldLayout { address_offset: 16, address_size: 8, size_offset: 32, size_size: 8 }
        );
    }

    #[test]
    fn test_layout_without_size_field() {
        let tp = tracepoints::by_name("kfree").unwrap();
        let layout = layout_from_fields(tp, &parse_format(KMALLOC_FORMAT)).unwrap();
        assert_eq!(layout.size_size, 0);
        assert!(layout.is_configured());
    }

    #[test]
    fn test_layout_missing_field() {
        let tp = tracepoints::by_name("mm_page_alloc").unwrap();
        let err = layout_from_fields(tp, &parse_format(KMALLOC_FORMAT)).unwrap_err();
        assert!(err.to_string().contains("no field named pfn"));
    }

    #[test]
    fn test_locate_explicit_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Tracefs::locate(Some(dir.path())).is_err());

        let kmalloc = dir.path().join("events/kmem/kmalloc");
        std::fs::create_dir_all(&kmalloc).unwrap();
        std::fs::write(kmalloc.join("format"), KMALLOC_FORMAT).unwrap();

        let tracefs = Tracefs::locate(Some(dir.path())).unwrap();
        assert!(tracefs.has_event("kmalloc"));
        assert!(!tracefs.has_event("kmalloc_node"));

        let layout = tracefs.field_layout(tracepoints::by_name("kmalloc").unwrap()).unwrap();
        assert_eq!(layout.address_offset, 16);

        let err = tracefs.field_layout(tracepoints::by_name("kmalloc_node").unwrap()).unwrap_err();
        assert!(matches!(err, BackendError::MissingTracepoint(_)));
    }
}

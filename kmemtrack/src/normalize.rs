//! # Event Normalization
//!
//! Turns backend-specific raw records into [`AllocEvent`]s. This is the only
//! place that knows the two wire formats:
//!
//! - **Binary** (eBPF): one [`AllocRecord`] as written by `kmemtrack-ebpf`
//! - **Text** (ftrace): one `trace_pipe` event line plus the ` => frame` lines
//!   of the `<stack trace>` block that follows it
//!
//! ```text
//!  kworker/u8:2-1234  [002] d..1.  1234.567890: kmalloc: call_site=f+0x12/0x40 ptr=00000000deadbeef bytes_req=64 bytes_alloc=64
//!  => __kmalloc+0x1a/0x80
//!  => f+0x12/0x40
//! ```
//!
//! Records that describe no live allocation (a failed page allocation,
//! `kfree(NULL)`, `ZERO_SIZE_PTR`) yield [`NormalizationError::Ignored`].

use regex::Regex;
use std::sync::LazyLock;

use kmemtrack_common::{AllocRecord, MAX_FRAMES};

use crate::domain::{AllocEvent, Domain, NormalizationError, RawFrames, TaskId};
use crate::tracepoints::{self, KmemTracepoint};

/// `(void *)16`, returned by `kmalloc(0)`
pub const ZERO_SIZE_PTR: u64 = 0x10;

/// pfn reported by `mm_page_alloc` when the allocation failed
const FAILED_PFN: u64 = u64::MAX;

/// Raw output of an event source, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    /// One `AllocRecord` from the eBPF ring buffer
    Binary(Vec<u8>),
    /// One ftrace event line and its stack trace lines
    Text { header: String, stack: Vec<String> },
}

/// `<comm>-<pid> [(<tgid>)] [<cpu>] [<flags>] <ts>: <event>: <body>`
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<comm>.+)-(?P<pid>\d+)\s+(?:\(\s*[\d-]+\)\s+)?\[(?P<cpu>\d+)\]\s+(?:[^\s:]+\s+)?(?P<ts>\d+\.\d+):\s+(?P<event>\w+):\s*(?P<body>.*)$",
    )
    .expect("Invalid trace header regex pattern")
});

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    page_size: u64,
}

impl Normalizer {
    #[must_use]
    pub fn new(page_size: u64) -> Self {
        Self { page_size }
    }

    /// Convert one raw record
    ///
    /// # Errors
    /// [`NormalizationError::Malformed`] for corrupt binary records,
    /// [`NormalizationError::Unparsable`] for text that doesn't match the
    /// trace grammar, [`NormalizationError::Ignored`] for records that don't
    /// describe a live allocation.
    pub fn normalize(&self, raw: &RawRecord) -> Result<AllocEvent, NormalizationError> {
        match raw {
            RawRecord::Binary(bytes) => self.normalize_binary(bytes),
            RawRecord::Text { header, stack } => self.normalize_text(header, stack),
        }
    }

    fn normalize_binary(&self, bytes: &[u8]) -> Result<AllocEvent, NormalizationError> {
        if bytes.len() < std::mem::size_of::<AllocRecord>() {
            return Err(NormalizationError::Malformed(format!(
                "{} bytes, expected {}",
                bytes.len(),
                std::mem::size_of::<AllocRecord>()
            )));
        }

        // SAFETY: the buffer is at least size_of::<AllocRecord>() bytes and AllocRecord
        // is a plain #[repr(C)] struct valid for any bit pattern
        #[allow(unsafe_code)]
        let record = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<AllocRecord>()) };

        let tp = tracepoints::by_kind(record.event_kind).ok_or_else(|| {
            NormalizationError::Malformed(format!("unknown event kind {}", record.event_kind))
        })?;
        let frame_count = record.frame_count as usize;
        if frame_count > MAX_FRAMES {
            return Err(NormalizationError::Malformed(format!(
                "frame count {frame_count} exceeds {MAX_FRAMES}"
            )));
        }

        let size = match tp.domain {
            Domain::Page => self.page_bytes(u64::from(record.order))?,
            Domain::Slab => record.bytes,
        };
        let event = self.build(tp, TaskId(record.tid), record.address, size)?;

        let event = match comm_from_bytes(&record.comm) {
            Some(comm) => event.with_comm(comm),
            None => event,
        };
        Ok(if tp.is_alloc() {
            event.with_frames(RawFrames::Addresses(record.frames[..frame_count].to_vec()))
        } else {
            event
        })
    }

    fn normalize_text(
        &self,
        header: &str,
        stack: &[String],
    ) -> Result<AllocEvent, NormalizationError> {
        let caps = HEADER_RE
            .captures(header)
            .ok_or_else(|| NormalizationError::Unparsable(header.to_string()))?;
        let pid: u32 = caps["pid"]
            .parse()
            .map_err(|_| NormalizationError::Unparsable(header.to_string()))?;
        let tp = tracepoints::by_name(&caps["event"])
            .ok_or_else(|| NormalizationError::Unparsable(header.to_string()))?;
        let body = &caps["body"];

        let missing = |key: &str| {
            NormalizationError::Unparsable(format!("{} without {key}: {header}", tp.name))
        };

        let (address, size) = match tp.domain {
            Domain::Page => {
                if field(body, "page").is_some_and(is_null_pointer) {
                    return Err(NormalizationError::Ignored("failed page allocation"));
                }
                let pfn = field(body, "pfn")
                    .and_then(parse_pfn)
                    .ok_or_else(|| missing("pfn"))?;
                let order = match tp.size_field.and_then(|key| field(body, key)) {
                    Some(value) => value.parse::<u64>().map_err(|_| missing("order"))?,
                    None => 0,
                };
                (pfn, self.page_bytes(order)?)
            }
            Domain::Slab => {
                let ptr = field(body, "ptr").and_then(parse_hex).ok_or_else(|| missing("ptr"))?;
                let bytes = if tp.is_alloc() {
                    field(body, "bytes_alloc")
                        .and_then(|v| v.parse::<u64>().ok())
                        .ok_or_else(|| missing("bytes_alloc"))?
                } else {
                    0
                };
                (ptr, bytes)
            }
        };

        let event = self.build(tp, TaskId(pid), address, size)?;
        let comm = caps["comm"].trim();
        let event = if comm.is_empty() || comm == "<...>" { event } else { event.with_comm(comm) };

        if !tp.is_alloc() {
            return Ok(event);
        }
        let frames = stack
            .iter()
            .filter_map(|line| {
                let frame = line.trim_start().strip_prefix("=>")?.trim();
                (!frame.is_empty()).then(|| frame.to_string())
            })
            .collect();
        Ok(event.with_frames(RawFrames::Symbols(frames)))
    }

    fn build(
        &self,
        tp: &KmemTracepoint,
        task_id: TaskId,
        address: u64,
        size: u64,
    ) -> Result<AllocEvent, NormalizationError> {
        match tp.domain {
            Domain::Page if address == FAILED_PFN => {
                return Err(NormalizationError::Ignored("failed page allocation"));
            }
            Domain::Slab if address == 0 => {
                return Err(NormalizationError::Ignored("null pointer"));
            }
            Domain::Slab if address == ZERO_SIZE_PTR => {
                return Err(NormalizationError::Ignored("zero-size allocation"));
            }
            _ => {}
        }
        Ok(if tp.is_alloc() {
            AllocEvent::alloc(task_id, tp.domain, address, size)
        } else {
            AllocEvent::free(task_id, tp.domain, address)
        })
    }

    fn page_bytes(&self, order: u64) -> Result<u64, NormalizationError> {
        u32::try_from(order)
            .ok()
            .and_then(|order| self.page_size.checked_shl(order))
            .filter(|bytes| *bytes != 0)
            .ok_or_else(|| NormalizationError::Malformed(format!("page order {order} out of range")))
    }
}

/// Value of `key=` in an event body
fn field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .find_map(|(k, v)| (k == key).then_some(v))
}

/// `0x1a2b`, or decimal on older kernels; `-1` is a failed allocation
fn parse_pfn(value: &str) -> Option<u64> {
    if value == "-1" {
        return Some(FAILED_PFN);
    }
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// `%p` output: hex with or without `0x`, `(null)` for NULL
fn parse_hex(value: &str) -> Option<u64> {
    if value == "(null)" {
        return Some(0);
    }
    let hex = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(hex, 16).ok()
}

fn is_null_pointer(value: &str) -> bool {
    parse_hex(value) == Some(0)
}

fn comm_from_bytes(comm: &[u8]) -> Option<String> {
    let len = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    (len > 0).then(|| String::from_utf8_lossy(&comm[..len]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use kmemtrack_common::{EVENT_KFREE, EVENT_KMALLOC, EVENT_PAGE_ALLOC};

    fn record_bytes(record: &AllocRecord) -> Vec<u8> {
        #[allow(unsafe_code)]
        let bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(record).cast::<u8>(),
                std::mem::size_of::<AllocRecord>(),
            )
        };
        bytes.to_vec()
    }

    fn kmalloc_record() -> AllocRecord {
        let mut record = AllocRecord::ZEROED;
        record.tid = 42;
        record.tgid = 40;
        record.event_kind = EVENT_KMALLOC;
        record.address = 0xffff_8880_0123_4000;
        record.bytes = 128;
        record.comm[..4].copy_from_slice(b"bash");
        record.frame_count = 2;
        record.frames[0] = 0xffff_ffff_8100_0010;
        record.frames[1] = 0xffff_ffff_8100_0020;
        record
    }

    #[test]
    fn test_binary_slab_alloc() {
        let normalizer = Normalizer::new(4096);
        let event =
            normalizer.normalize(&RawRecord::Binary(record_bytes(&kmalloc_record()))).unwrap();
        assert_eq!(event.task_id, TaskId(42));
        assert_eq!(event.domain, Domain::Slab);
        assert_eq!(event.kind, EventKind::Alloc { size: 128 });
        assert_eq!(event.comm.as_deref(), Some("bash"));
        assert_eq!(
            event.raw_frames,
            RawFrames::Addresses(vec![0xffff_ffff_8100_0010, 0xffff_ffff_8100_0020])
        );
    }

    #[test]
    fn test_binary_page_alloc_uses_order() {
        let mut record = AllocRecord::ZEROED;
        record.tid = 7;
        record.event_kind = EVENT_PAGE_ALLOC;
        record.address = 0x1234;
        record.order = 2;
        let event = Normalizer::new(4096).normalize(&RawRecord::Binary(record_bytes(&record))).unwrap();
        assert_eq!(event.kind, EventKind::Alloc { size: 16384 });
        assert_eq!(event.address, 0x1234);
        assert!(event.comm.is_none());
    }

    #[test]
    fn test_binary_free_drops_frames() {
        let mut record = kmalloc_record();
        record.event_kind = EVENT_KFREE;
        let event = Normalizer::new(4096).normalize(&RawRecord::Binary(record_bytes(&record))).unwrap();
        assert_eq!(event.kind, EventKind::Free);
        assert!(event.raw_frames.is_empty());
    }

    #[test]
    fn test_binary_malformed() {
        let normalizer = Normalizer::new(4096);
        let short = RawRecord::Binary(vec![0u8; 16]);
        assert!(matches!(normalizer.normalize(&short), Err(NormalizationError::Malformed(_))));

        let mut record = kmalloc_record();
        record.event_kind = 99;
        let bad_kind = RawRecord::Binary(record_bytes(&record));
        assert!(matches!(normalizer.normalize(&bad_kind), Err(NormalizationError::Malformed(_))));

        let mut record = kmalloc_record();
        record.frame_count = 1000;
        let bad_frames = RawRecord::Binary(record_bytes(&record));
        assert!(matches!(normalizer.normalize(&bad_frames), Err(NormalizationError::Malformed(_))));
    }

    #[test]
    fn test_binary_ignored_addresses() {
        let normalizer = Normalizer::new(4096);

        let mut record = kmalloc_record();
        record.address = ZERO_SIZE_PTR;
        assert!(matches!(
            normalizer.normalize(&RawRecord::Binary(record_bytes(&record))),
            Err(NormalizationError::Ignored(_))
        ));

        let mut record = AllocRecord::ZEROED;
        record.event_kind = EVENT_PAGE_ALLOC;
        record.address = u64::MAX;
        assert!(matches!(
            normalizer.normalize(&RawRecord::Binary(record_bytes(&record))),
            Err(NormalizationError::Ignored(_))
        ));
    }

    fn text(header: &str, stack: &[&str]) -> RawRecord {
        RawRecord::Text {
            header: header.to_string(),
            stack: stack.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_text_kmalloc_with_stack() {
        let raw = text(
            "    kworker/u8:2-1234    [002] d..1.  1234.567890: kmalloc: call_site=f+0x12/0x40 ptr=00000000deadbeef bytes_req=60 bytes_alloc=64 gfp_flags=GFP_KERNEL node=-1 accounted=false",
            &[" => __kmalloc+0x1a/0x80", " => f+0x12/0x40"],
        );
        let event = Normalizer::new(4096).normalize(&raw).unwrap();
        assert_eq!(event.task_id, TaskId(1234));
        assert_eq!(event.comm.as_deref(), Some("kworker/u8:2"));
        assert_eq!(event.address, 0xdead_beef);
        assert_eq!(event.kind, EventKind::Alloc { size: 64 });
        assert_eq!(
            event.raw_frames,
            RawFrames::Symbols(vec!["__kmalloc+0x1a/0x80".to_string(), "f+0x12/0x40".to_string()])
        );
    }

    #[test]
    fn test_text_page_events() {
        let normalizer = Normalizer::new(4096);
        let alloc = text(
            "bash-99 [000] ....  10.000001: mm_page_alloc: page=00000000c0ffee00 pfn=0x1a2b order=1 migratetype=0 gfp_flags=GFP_KERNEL",
            &[],
        );
        let event = normalizer.normalize(&alloc).unwrap();
        assert_eq!(event.address, 0x1a2b);
        assert_eq!(event.kind, EventKind::Alloc { size: 8192 });
        assert_eq!(event.raw_frames, RawFrames::Symbols(Vec::new()));

        let batched = text(
            "bash-99 (     99) [000] ....  10.000002: mm_page_free_batched: page=00000000c0ffee00 pfn=6699",
            &[],
        );
        let event = normalizer.normalize(&batched).unwrap();
        assert_eq!(event.address, 6699);
        assert_eq!(event.kind, EventKind::Free);

        let failed = text(
            "bash-99 [000] ....  10.000003: mm_page_alloc: page=0000000000000000 pfn=0x0 order=0 migratetype=0 gfp_flags=GFP_NOWAIT",
            &[],
        );
        assert!(matches!(normalizer.normalize(&failed), Err(NormalizationError::Ignored(_))));
    }

    #[test]
    fn test_text_kfree_null_is_ignored() {
        let raw = text("sh-5 [001] ....  3.5: kfree: call_site=g+0x4/0x10 ptr=(null)", &[]);
        assert!(matches!(
            Normalizer::new(4096).normalize(&raw),
            Err(NormalizationError::Ignored(_))
        ));
    }

    #[test]
    fn test_text_unknown_comm() {
        let raw = text("<...>-77 [003] ....  1.0: kmem_cache_free: call_site=h ptr=ffff888001 name=dentry", &[]);
        let event = Normalizer::new(4096).normalize(&raw).unwrap();
        assert!(event.comm.is_none());
        assert_eq!(event.task_id, TaskId(77));
    }

    #[test]
    fn test_text_unparsable() {
        let normalizer = Normalizer::new(4096);
        for line in [
            "",
            "# tracer: nop",
            "sh-5 [001] ....  3.5: <stack trace>",
            "sh-5 [001] ....  3.5: sched_switch: prev_comm=sh",
            "sh-5 [001] ....  3.5: kmalloc: call_site=f bytes_alloc=8",
        ] {
            assert!(
                matches!(normalizer.normalize(&text(line, &[])), Err(NormalizationError::Unparsable(_))),
                "{line:?}"
            );
        }
    }
}

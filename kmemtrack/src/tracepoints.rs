//! The `kmem` tracepoints kmemtrack consumes
//!
//! Both backends enable the same set: the eBPF backend attaches the program
//! of the same name, the ftrace backend writes `events/kmem/<name>/enable`.

use kmemtrack_common::{
    is_alloc_event, EVENT_CACHE_ALLOC, EVENT_CACHE_ALLOC_NODE, EVENT_CACHE_FREE, EVENT_KFREE,
    EVENT_KMALLOC, EVENT_KMALLOC_NODE, EVENT_PAGE_ALLOC, EVENT_PAGE_FREE, EVENT_PAGE_FREE_BATCHED,
};

use crate::domain::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmemTracepoint {
    /// Tracepoint name under `events/kmem/`, also the eBPF program name
    pub name: &'static str,
    /// `EVENT_*` constant from `kmemtrack-common`
    pub kind: u32,
    pub domain: Domain,
    /// Field holding the page frame number or object pointer
    pub address_field: &'static str,
    /// Field holding the page order or allocated bytes
    pub size_field: Option<&'static str>,
    /// Missing on some kernels (`*_node` variants were folded in 6.1)
    pub optional: bool,
}

impl KmemTracepoint {
    #[must_use]
    pub fn is_alloc(&self) -> bool {
        is_alloc_event(self.kind)
    }
}

pub const KMEM_TRACEPOINTS: [KmemTracepoint; 9] = [
    KmemTracepoint {
        name: "mm_page_alloc",
        kind: EVENT_PAGE_ALLOC,
        domain: Domain::Page,
        address_field: "pfn",
        size_field: Some("order"),
        optional: false,
    },
    KmemTracepoint {
        name: "mm_page_free",
        kind: EVENT_PAGE_FREE,
        domain: Domain::Page,
        address_field: "pfn",
        size_field: Some("order"),
        optional: false,
    },
    KmemTracepoint {
        name: "mm_page_free_batched",
        kind: EVENT_PAGE_FREE_BATCHED,
        domain: Domain::Page,
        address_field: "pfn",
        size_field: None,
        optional: true,
    },
    KmemTracepoint {
        name: "kmalloc",
        kind: EVENT_KMALLOC,
        domain: Domain::Slab,
        address_field: "ptr",
        size_field: Some("bytes_alloc"),
        optional: false,
    },
    KmemTracepoint {
        name: "kmalloc_node",
        kind: EVENT_KMALLOC_NODE,
        domain: Domain::Slab,
        address_field: "ptr",
        size_field: Some("bytes_alloc"),
        optional: true,
    },
    KmemTracepoint {
        name: "kmem_cache_alloc",
        kind: EVENT_CACHE_ALLOC,
        domain: Domain::Slab,
        address_field: "ptr",
        size_field: Some("bytes_alloc"),
        optional: false,
    },
    KmemTracepoint {
        name: "kmem_cache_alloc_node",
        kind: EVENT_CACHE_ALLOC_NODE,
        domain: Domain::Slab,
        address_field: "ptr",
        size_field: Some("bytes_alloc"),
        optional: true,
    },
    KmemTracepoint {
        name: "kfree",
        kind: EVENT_KFREE,
        domain: Domain::Slab,
        address_field: "ptr",
        size_field: None,
        optional: false,
    },
    KmemTracepoint {
        name: "kmem_cache_free",
        kind: EVENT_CACHE_FREE,
        domain: Domain::Slab,
        address_field: "ptr",
        size_field: None,
        optional: false,
    },
];

#[must_use]
pub fn by_name(name: &str) -> Option<&'static KmemTracepoint> {
    KMEM_TRACEPOINTS.iter().find(|tp| tp.name == name)
}

#[must_use]
pub fn by_kind(kind: u32) -> Option<&'static KmemTracepoint> {
    KMEM_TRACEPOINTS.iter().find(|tp| tp.kind == kind)
}

/// Tracepoints of the given domain
pub fn for_domain(domain: Domain) -> impl Iterator<Item = &'static KmemTracepoint> {
    KMEM_TRACEPOINTS.iter().filter(move |tp| tp.domain == domain)
}

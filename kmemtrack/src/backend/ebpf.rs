//! # eBPF Event Source
//!
//! Loads the compiled `kmemtrack-ebpf` object, tells it where each `kmem`
//! tracepoint keeps its fields, attaches one program per tracepoint and
//! drains [`AllocRecord`](kmemtrack_common::AllocRecord)s from the `EVENTS`
//! ring buffer.
//!
//! ## Maps
//!
//! - `LAYOUTS` - filled here from tracefs `format` files before attaching
//! - `CONFIG` - key 0 holds our own tgid so the tracer never traces itself
//! - `EVENTS` - ring buffer, polled through [`AsyncFd`]
//! - `DROPPED` - per-CPU count of records lost to a full ring buffer

use aya::maps::{Array, HashMap, MapData, PerCpuArray, RingBuf};
use aya::programs::{ProgramError, TracePoint};
use aya::Ebpf;
use aya_log::EbpfLogger;
use kmemtrack_common::{FieldLayout, CONFIG_SELF_TGID};
use log::{debug, info, warn};
use tokio::io::unix::AsyncFd;

use crate::config::Config;
use crate::domain::BackendError;
use crate::normalize::RawRecord;
use crate::tracefs::Tracefs;
use crate::tracepoints::{self, KmemTracepoint};

const TRACEPOINT_CATEGORY: &str = "kmem";

pub struct EbpfSource {
    bpf: Ebpf,
    ring: AsyncFd<RingBuf<MapData>>,
    attached: Vec<&'static str>,
    torn_down: bool,
}

impl EbpfSource {
    /// Load, configure and attach
    ///
    /// # Errors
    /// Returns a [`BackendError`] if the object can't be loaded, a required
    /// tracepoint is missing, or a program fails to attach.
    pub fn init(config: &Config, tracefs: &Tracefs) -> Result<Self, BackendError> {
        let mut bpf = Ebpf::load_file(&config.bpf_object).map_err(|source| {
            BackendError::EbpfLoadFailed { path: config.bpf_object.clone(), source }
        })?;
        init_ebpf_logger(&mut bpf);
        exclude_self(&mut bpf)?;

        let mut attached = Vec::new();
        for tp in config.domains().flat_map(tracepoints::for_domain) {
            if !tracefs.has_event(tp.name) {
                if tp.optional {
                    debug!("Skipping kmem/{}: not present on this kernel", tp.name);
                    continue;
                }
                return Err(BackendError::MissingTracepoint(tp.name.to_string()));
            }
            let layout = tracefs.field_layout(tp)?;
            set_layout(&mut bpf, tp, layout)?;
            attach_tracepoint(&mut bpf, tp)?;
            attached.push(tp.name);
        }

        let ring = RingBuf::try_from(bpf.take_map("EVENTS").ok_or(BackendError::MapNotFound("EVENTS"))?)?;
        let ring = AsyncFd::new(ring)?;

        Ok(Self { bpf, ring, attached, torn_down: false })
    }

    /// Wait for the ring buffer to become readable, then drain it
    ///
    /// # Errors
    /// Returns an error if polling the ring buffer fd fails.
    pub async fn next_batch(&mut self, out: &mut Vec<RawRecord>) -> Result<(), BackendError> {
        let mut guard = self.ring.readable_mut().await?;
        let ring = guard.get_inner_mut();
        while let Some(item) = ring.next() {
            out.push(RawRecord::Binary(item.to_vec()));
        }
        guard.clear_ready();
        Ok(())
    }

    /// Drain whatever is left without waiting
    pub fn drain_remaining(&mut self, out: &mut Vec<RawRecord>) {
        let ring = self.ring.get_mut();
        while let Some(item) = ring.next() {
            out.push(RawRecord::Binary(item.to_vec()));
        }
    }

    /// Records the kernel side had to discard
    ///
    /// # Errors
    /// Returns an error if the `DROPPED` map can't be read.
    pub fn dropped_records(&self) -> Result<u64, BackendError> {
        let dropped: PerCpuArray<_, u64> = PerCpuArray::try_from(
            self.bpf.map("DROPPED").ok_or(BackendError::MapNotFound("DROPPED"))?,
        )?;
        let per_cpu = dropped.get(&0, 0)?;
        Ok(per_cpu.iter().sum())
    }

    /// Detach every program; safe to call more than once
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        for name in &self.attached {
            let Some(program) = self.bpf.program_mut(name) else {
                continue;
            };
            let result: Result<(), ProgramError> =
                <&mut TracePoint>::try_from(program).and_then(TracePoint::unload);
            match result {
                Ok(()) => debug!("Detached {name}"),
                Err(e) => warn!("Failed to detach {name}: {e}"),
            }
        }
    }
}

impl Drop for EbpfSource {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Initialize eBPF logger
fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Store our tgid in `CONFIG` so the programs skip our own allocations
fn exclude_self(bpf: &mut Ebpf) -> Result<(), BackendError> {
    let mut config: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map_mut("CONFIG").ok_or(BackendError::MapNotFound("CONFIG"))?)?;
    config.insert(CONFIG_SELF_TGID, u64::from(std::process::id()), 0)?;
    Ok(())
}

fn set_layout(bpf: &mut Ebpf, tp: &KmemTracepoint, layout: FieldLayout) -> Result<(), BackendError> {
    let mut layouts: Array<_, FieldLayout> =
        Array::try_from(bpf.map_mut("LAYOUTS").ok_or(BackendError::MapNotFound("LAYOUTS"))?)?;
    layouts.set(tp.kind, layout, 0)?;
    debug!(
        "kmem/{}: address at {}+{}, size at {}+{}",
        tp.name, layout.address_offset, layout.address_size, layout.size_offset, layout.size_size
    );
    Ok(())
}

fn attach_tracepoint(bpf: &mut Ebpf, tp: &KmemTracepoint) -> Result<(), BackendError> {
    let attach_failed = |source: ProgramError| BackendError::AttachFailed {
        program: tp.name.to_string(),
        tracepoint: tp.name.to_string(),
        source,
    };

    let program: &mut TracePoint = bpf
        .program_mut(tp.name)
        .ok_or_else(|| BackendError::ProgramNotFound(tp.name.to_string()))?
        .try_into()
        .map_err(attach_failed)?;
    program.load().map_err(attach_failed)?;
    program.attach(TRACEPOINT_CATEGORY, tp.name).map_err(attach_failed)?;
    info!("Attached tracepoint: {TRACEPOINT_CATEGORY}/{}", tp.name);
    Ok(())
}

//! # kmemtrack - Live Kernel Memory Allocation Profiler
//!
//! kmemtrack attributes page and slab allocator activity to the kernel call
//! stack and task that caused it, and reports current and peak usage per
//! stack. It needs root: it either attaches eBPF programs to the `kmem`
//! tracepoints or drives a private ftrace instance.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Linux Kernel                           │
//! │   kmem tracepoints: mm_page_alloc/free, kmalloc, kfree, ...     │
//! └──────────────┬──────────────────────────────────┬───────────────┘
//!                │ --ebpf (default)                 │ --ftrace
//!                ▼                                  ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │ kmemtrack-ebpf programs      │  │ tracefs instance             │
//! │ AllocRecord → EVENTS ringbuf │  │ events + stacktrace option   │
//! └──────────────┬───────────────┘  └──────────────┬───────────────┘
//!                │ binary records                  │ trace_pipe lines
//!                ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      kmemtrack (This Crate)                     │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │   backend    │──▶│  normalize   │──▶│      store       │     │
//! │  │ EventSource  │   │  AllocEvent  │   │ AggregationStore │     │
//! │  └──────────────┘   └──────────────┘   └────────┬─────────┘     │
//! │                                                 │ snapshot      │
//! │                     ┌──────────────┐            ▼               │
//! │                     │   resolver   │◀── ┌──────────────────┐    │
//! │                     │  kallsyms    │    │      report      │    │
//! │                     └──────────────┘    │   text / JSON    │    │
//! │                                         └──────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline
//!
//! - [`backend`]: the two event sources behind one [`backend::EventSource`]
//! - [`normalize`]: binary and ftrace text records → [`domain::AllocEvent`]
//! - [`store`]: matches frees to allocations, keeps live/peak usage per
//!   task, domain and call stack
//! - [`report`]: sorted, throttled, optionally summarized text or JSON
//! - [`session`]: the ingestion loop, signals, and the final report
//!
//! ### Kernel Interfaces
//!
//! - [`tracefs`]: locating tracefs and reading event `format` files
//! - [`tracepoints`]: the `kmem` tracepoints we consume
//! - [`resolver`]: kernel symbols from `/proc/kallsyms`, task names from `/proc`
//! - [`slabinfo`]: `/proc/slabinfo` summary for `--show-misc`
//!
//! ### Setup
//!
//! - [`cli`] and [`config`]: arguments and the validated run configuration
//! - [`preflight`]: privilege and kernel checks
//! - [`tuning`]: process priority and allocator tuning
//! - [`domain`]: core types and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Slab usage by call stack, until Ctrl+C
//! sudo kmemtrack --slab
//!
//! # Page allocations for 30 seconds, stacks holding at least 5% of the peak
//! sudo kmemtrack --page --duration 30 --throttle 5
//!
//! # Without eBPF, as JSON
//! sudo kmemtrack --ftrace --page --slab --json --output report.json
//! ```
//!
//! Send `SIGUSR1` for an interim report while tracing.

pub mod backend;
pub mod cli;
pub mod config;
pub mod domain;
pub mod normalize;
pub mod preflight;
pub mod report;
pub mod resolver;
pub mod session;
pub mod slabinfo;
pub mod store;
pub mod tracefs;
pub mod tracepoints;
pub mod tuning;

//! # Bucketed Buffer Pool
//!
//! Tree operations allocate many short-lived buffers: parse copies, key
//! duplicates, re-folded values, encode scratch. This module provides a
//! process-wide pool of power-of-two size classes so that steady-state
//! operation performs no allocator calls and total memory stays capped.
//!
//! ## Size classes
//!
//! {64, 256, 1k, 4k, 16k, 64k, 256k, 1M, 4M, 16M}. A request larger than
//! the largest class falls through to a direct allocation that bypasses
//! pool accounting. Every pooled allocation hands back a buffer whose
//! capacity is the class size, which may exceed the requested length.
//!
//! ## Pressure handling
//!
//! Each class owns a share of the pool's soft cap (default 1 GiB total).
//! When a request would push its class past the cap, a shrink pass
//! releases retained free buffers — larger classes first, then smaller —
//! until at least the requested class size has been reclaimed, and the
//! allocation is retried once. Only then does the pool report
//! `OutOfMemory`.
//!
//! ## Handles
//!
//! [`PoolBuf`] is a mutable class-sized buffer that returns itself to its
//! class free list on drop. [`ByteBuf`] is an immutable shared view of a
//! `PoolBuf` — the zero-copy currency of the node engine: expanding a node
//! slices its buffer, projections share slices instead of copying leaf
//! payloads, and the backing buffer is released when the last view drops.

mod pool;

pub use pool::{ByteBuf, MemPool, PoolBuf, DEFAULT_POOL_CAPACITY};

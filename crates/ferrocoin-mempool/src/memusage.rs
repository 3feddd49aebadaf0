//! Rough dynamic-memory accounting, mirroring a 16-byte-aligned allocator.

use std::mem;

const PTR: usize = mem::size_of::<usize>();

/// Usable space of an allocation of `alloc` bytes on a 16-byte-aligned
/// allocator with a two-word header.
pub(crate) fn malloc_usage(alloc: usize) -> usize {
    if alloc == 0 {
        0
    } else {
        ((alloc + 31) >> 4) << 4
    }
}

/// Incremental usage of inserting one element into a node-based set or map.
pub(crate) fn node_usage<T>() -> usize {
    malloc_usage(3 * PTR + mem::size_of::<T>())
}

/// Usage of a vector by its capacity.
pub(crate) fn vec_usage<T>(capacity: usize) -> usize {
    malloc_usage(capacity * mem::size_of::<T>())
}

/// Approximate heap usage of a shared transaction body.
pub(crate) fn tx_usage(tx: &bitcoin::Transaction) -> usize {
    let mut usage = malloc_usage(mem::size_of::<bitcoin::Transaction>())
        + vec_usage::<bitcoin::TxIn>(tx.input.len())
        + vec_usage::<bitcoin::TxOut>(tx.output.len());
    for input in &tx.input {
        usage += malloc_usage(input.script_sig.len()) + malloc_usage(input.witness.size());
    }
    for output in &tx.output {
        usage += malloc_usage(output.script_pubkey.len());
    }
    usage
}

//! Deterministic partition of a facility's stacks into contiguous chunks.
use crate::codec::ChunkInfo;
use crate::error::{invalid, Result};

/// Near-equal group sizes; the remainder goes to the earliest groups.
pub fn chunk_sizes(num_stacks: usize, num_chunks: u32) -> Result<Vec<usize>> {
    let n = num_chunks as usize;
    if n == 0 || n > num_stacks {
        return Err(invalid(format!(
            "Cannot split {num_stacks} stacks into {num_chunks} chunks"
        )));
    }
    let even = num_stacks / n;
    let remainder = num_stacks % n;
    Ok((0..n).map(|i| even + usize::from(i < remainder)).collect())
}

/// 1-based chunk id of every stack, in stack order.
pub fn chunk_assignments(num_stacks: usize, num_chunks: u32) -> Result<Vec<u32>> {
    let sizes = chunk_sizes(num_stacks, num_chunks)?;
    Ok(sizes
        .iter()
        .enumerate()
        .flat_map(|(idx, &size)| std::iter::repeat(idx as u32 + 1).take(size))
        .collect())
}

/// The stacks belonging to `chunk`, or all of them when unchunked.
pub fn select_chunk<T>(items: &[T], chunk: Option<ChunkInfo>) -> Result<&[T]> {
    let chunk = match chunk {
        Some(c) if c.num_chunks > 1 => c,
        _ => return Ok(items),
    };
    let sizes = chunk_sizes(items.len(), chunk.num_chunks)?;
    let idx = chunk.chunk_id as usize - 1;
    let start: usize = sizes[..idx].iter().sum();
    Ok(&items[start..start + sizes[idx]])
}

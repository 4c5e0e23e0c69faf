use std::collections::HashMap;

use ipnet::Ipv4Net;
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("The block size /{} doesn't fit into pool {}!", .block_size, .pool)]
    BadBlockSize { pool: Ipv4Net, block_size: u8 },
    #[error("Block {} is outside the edge pod CIDR pool!", .0)]
    OutOfPool(Ipv4Net),
    #[error("The edge pod CIDR pool is exhausted!")]
    ExhaustedPool,
}

/// Carves the edge pod CIDR into fixed-size blocks and hands one to each
/// edge node. Allocation is stable: a node keeps its block across
/// re-observations until it is deleted, at which point the block returns to
/// the pool.
#[derive(Debug)]
pub struct Allocator {
    pool: Ipv4Net,
    block_size: u8,
    used: Vec<u64>,
    by_node: HashMap<String, Ipv4Net>,
}

impl Allocator {
    pub fn new(pool: Ipv4Net, block_size: u8) -> Result<Self, AllocatorError> {
        if block_size <= pool.prefix_len() || block_size > 30 {
            return Err(AllocatorError::BadBlockSize { pool, block_size });
        }

        let block_count = 1usize << (block_size - pool.prefix_len());

        Ok(Self {
            pool,
            block_size,
            used: vec![0; block_count.div_ceil(64)],
            by_node: HashMap::new(),
        })
    }

    pub fn block_count(&self) -> usize {
        1usize << (self.block_size - self.pool.prefix_len())
    }

    /// Marks a pre-existing allocation discovered at startup (or observed in
    /// a node annotation) as taken.
    pub fn record(&mut self, node_name: &str, block: Ipv4Net) -> Result<(), AllocatorError> {
        let index = self.index_of(block).ok_or(AllocatorError::OutOfPool(block))?;

        self.set_used(index, true);
        self.by_node.insert(node_name.to_owned(), block);

        Ok(())
    }

    /// The node's block, allocating a free one on first sight.
    pub fn get_or_allocate(&mut self, node_name: &str) -> Result<Ipv4Net, AllocatorError> {
        if let Some(block) = self.by_node.get(node_name) {
            return Ok(*block);
        }

        let index = self.first_free().ok_or(AllocatorError::ExhaustedPool)?;
        let block = self.block_at(index);

        self.set_used(index, true);
        self.by_node.insert(node_name.to_owned(), block);

        info!("Allocated pod CIDR {block} for node '{node_name}'!");

        Ok(block)
    }

    /// Returns the node's block to the pool.
    pub fn release(&mut self, node_name: &str) {
        if let Some(block) = self.by_node.remove(node_name) {
            if let Some(index) = self.index_of(block) {
                self.set_used(index, false);
            }

            info!("Released pod CIDR {block} of node '{node_name}'!");
        }
    }

    fn index_of(&self, block: Ipv4Net) -> Option<usize> {
        if block.prefix_len() != self.block_size || !self.pool.contains(&block.network()) {
            return None;
        }

        let offset = u32::from(block.network()) - u32::from(self.pool.network());
        let index = (offset >> (32 - self.block_size)) as usize;

        // reject blocks that aren't aligned to the pool's block grid
        (self.block_at(index) == block).then_some(index)
    }

    fn block_at(&self, index: usize) -> Ipv4Net {
        let base = u32::from(self.pool.network()) + ((index as u32) << (32 - self.block_size));

        Ipv4Net::new(base.into(), self.block_size).unwrap()
    }

    fn first_free(&self) -> Option<usize> {
        let count = self.block_count();

        (0..count).find(|&index| !self.is_used(index))
    }

    fn is_used(&self, index: usize) -> bool {
        self.used[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_used(&mut self, index: usize, used: bool) {
        if used {
            self.used[index / 64] |= 1 << (index % 64);
        } else {
            self.used[index / 64] &= !(1 << (index % 64));
        }
    }
}

use crate::crypto::{AesKey, AesXtsKey};
use crate::storage::BlockTransform;
use std::sync::Arc;

const AES_BLOCK_SIZE: u64 = 0x10;
const XTS_SECTOR_SIZE: u64 = 0x200;

/// AES-128-CTR with a 128-bit big-endian counter that advances by one per 16-byte block.
#[derive(Debug, Clone)]
pub struct AesCtrBlockTransform {
    key: AesKey,
    nonce: [u8; 0x10],
}

impl AesCtrBlockTransform {
    /// `nonce` is the counter of block 0.
    pub fn new(key: AesKey, nonce: [u8; 0x10]) -> Self {
        Self { key, nonce }
    }

    fn get_ctr(&self, block_index: u64) -> [u8; 0x10] {
        u128::from_be_bytes(self.nonce)
            .wrapping_add(block_index as u128)
            .to_be_bytes()
    }
}

impl BlockTransform for AesCtrBlockTransform {
    const BLOCK_SIZE: u64 = AES_BLOCK_SIZE;

    fn transform_read(&self, block: &mut [u8], block_index: u64) {
        debug_assert_eq!(block.len() as u64 % Self::BLOCK_SIZE, 0);

        self.key.apply_ctr(block, &self.get_ctr(block_index));
    }
}

/// AES-128-XTS over 0x200-byte sectors, the tweak being the sector index.
#[derive(Debug, Clone)]
pub struct AesXtsBlockTransform {
    key: AesXtsKey,
}

impl AesXtsBlockTransform {
    pub fn new(key: AesXtsKey) -> Self {
        Self { key }
    }
}

impl BlockTransform for AesXtsBlockTransform {
    const BLOCK_SIZE: u64 = XTS_SECTOR_SIZE;

    fn transform_read(&self, block: &mut [u8], block_index: u64) {
        self.key
            .decrypt(block, block_index, XTS_SECTOR_SIZE as usize);
    }
}

/// Start of a range of a patch section's data that shares one counter generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterGeneration {
    /// Offset of the range in the section data, aligned to the AES block size.
    pub offset: u64,
    /// `false` if the range is stored in plaintext.
    pub encrypted: bool,
    pub generation: u32,
}

/// AES-128-CTR where bytes 4..8 of the counter (the "generation") change along the storage.
///
/// Each block's generation is looked up from a table of breakpoints sorted by offset; the range
/// covered by an entry ends where the next entry begins.
#[derive(Debug, Clone)]
pub struct AesCtrExBlockTransform {
    key: AesKey,
    nonce: [u8; 0x10],
    generations: Arc<[CounterGeneration]>,
}

impl AesCtrExBlockTransform {
    /// `generations` must be sorted by offset, start at offset 0 and be block-aligned.
    pub fn new(key: AesKey, nonce: [u8; 0x10], generations: Arc<[CounterGeneration]>) -> Self {
        debug_assert!(generations.first().map_or(true, |g| g.offset == 0));
        Self {
            key,
            nonce,
            generations,
        }
    }

    /// Index of the entry covering `offset`.
    fn entry_index(&self, offset: u64) -> usize {
        self.generations
            .partition_point(|g| g.offset <= offset)
            .saturating_sub(1)
    }

    fn counter_for(&self, block_index: u64, generation: u32) -> [u8; 0x10] {
        let mut counter = self.nonce;
        let mut low = [0; 8];
        low.copy_from_slice(&counter[8..]);
        let low = u64::from_be_bytes(low).wrapping_add(block_index);
        counter[4..8].copy_from_slice(&generation.to_be_bytes());
        counter[8..].copy_from_slice(&low.to_be_bytes());
        counter
    }
}

impl BlockTransform for AesCtrExBlockTransform {
    const BLOCK_SIZE: u64 = AES_BLOCK_SIZE;

    fn transform_read(&self, mut block: &mut [u8], block_index: u64) {
        debug_assert_eq!(block.len() as u64 % Self::BLOCK_SIZE, 0);

        let mut offset = block_index * AES_BLOCK_SIZE;
        while !block.is_empty() {
            let index = self.entry_index(offset);
            let run_end = self
                .generations
                .get(index + 1)
                .map_or(u64::MAX, |next| next.offset);
            let run_size = std::cmp::min(run_end - offset, block.len() as u64) as usize;

            let (run, rest) = std::mem::take(&mut block).split_at_mut(run_size);
            match self.generations.get(index) {
                Some(entry) if !entry.encrypted => {}
                entry => {
                    let generation = entry.map_or(0, |e| e.generation);
                    self.key
                        .apply_ctr(run, &self.counter_for(offset / AES_BLOCK_SIZE, generation));
                }
            }

            offset += run_size as u64;
            block = rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AesKey {
        AesKey::from([0x2b; 0x10])
    }

    #[test]
    fn ctr_transform_matches_contiguous_stream() {
        let nonce = [0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0x20];
        let transform = AesCtrBlockTransform::new(key(), nonce);

        let mut whole = vec![0u8; 0x40];
        key().apply_ctr(&mut whole, &nonce);

        let mut tail = vec![0u8; 0x20];
        transform.transform_read(&mut tail, 2);
        assert_eq!(tail, &whole[0x20..]);
    }

    #[test]
    fn ctr_ex_switches_generation_at_breakpoints() {
        let mut nonce = [0u8; 0x10];
        nonce[..4].copy_from_slice(&0xcafe_u32.to_be_bytes());
        nonce[8..].copy_from_slice(&0x100u64.to_be_bytes());
        let generations: Arc<[CounterGeneration]> = vec![
            CounterGeneration {
                offset: 0,
                encrypted: true,
                generation: 1,
            },
            CounterGeneration {
                offset: 0x20,
                encrypted: true,
                generation: 7,
            },
            CounterGeneration {
                offset: 0x30,
                encrypted: false,
                generation: 0,
            },
        ]
        .into();
        let transform = AesCtrExBlockTransform::new(key(), nonce, generations);

        let mut data = vec![0u8; 0x40];
        transform.transform_read(&mut data, 0);

        let mut expected_first = vec![0u8; 0x20];
        let mut counter = nonce;
        counter[4..8].copy_from_slice(&1u32.to_be_bytes());
        key().apply_ctr(&mut expected_first, &counter);
        assert_eq!(&data[..0x20], &expected_first[..]);

        let mut expected_second = vec![0u8; 0x10];
        let mut counter = nonce;
        counter[4..8].copy_from_slice(&7u32.to_be_bytes());
        counter[8..].copy_from_slice(&0x102u64.to_be_bytes());
        key().apply_ctr(&mut expected_second, &counter);
        assert_eq!(&data[0x20..0x30], &expected_second[..]);

        // plaintext range is left untouched
        assert_eq!(&data[0x30..], &[0u8; 0x10]);
    }

    #[test]
    fn ctr_ex_partial_reads_agree_with_whole_reads() {
        let generations: Arc<[CounterGeneration]> = vec![
            CounterGeneration {
                offset: 0,
                encrypted: true,
                generation: 3,
            },
            CounterGeneration {
                offset: 0x50,
                encrypted: true,
                generation: 4,
            },
        ]
        .into();
        let transform = AesCtrExBlockTransform::new(key(), [9; 0x10], generations);

        let mut whole = vec![0xa5u8; 0x80];
        transform.transform_read(&mut whole, 0);

        let mut part = vec![0xa5u8; 0x30];
        transform.transform_read(&mut part, 3);
        assert_eq!(part, &whole[0x30..0x60]);
    }

    #[test]
    fn xts_transform_uses_relative_sector() {
        let xts = AesXtsKey::from_halves(AesKey::from([1; 0x10]), AesKey::from([2; 0x10]));
        let mut encrypted = vec![0x11u8; 0x400];
        xts.encrypt(&mut encrypted, 0, 0x200);

        let transform = AesXtsBlockTransform::new(xts);
        let mut second = encrypted[0x200..].to_vec();
        transform.transform_read(&mut second, 1);
        assert_eq!(second, vec![0x11u8; 0x200]);
    }
}

//! XTEA over little-endian 32-bit words, 32 rounds.
//!
//! Both directions work in place on a buffer whose length is a multiple of
//! the 8-byte block size; padding is the caller's concern.

use crate::error::{Result, WireError};

pub type XteaKey = [u32; 4];

pub const BLOCK_SIZE: usize = 8;
const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

pub fn encrypt(data: &mut [u8], key: &XteaKey) -> Result<()> {
    check_aligned(data)?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        let (v0, v1) = load(block);
        let (v0, v1) = encrypt_block(v0, v1, key);
        store(block, v0, v1);
    }
    Ok(())
}

pub fn decrypt(data: &mut [u8], key: &XteaKey) -> Result<()> {
    check_aligned(data)?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        let (v0, v1) = load(block);
        let (v0, v1) = decrypt_block(v0, v1, key);
        store(block, v0, v1);
    }
    Ok(())
}

/// Number of filler bytes needed to round `len` up to the block size.
pub fn padding_for(len: usize) -> usize {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(WireError::UnalignedCipherText(data.len()));
    }
    Ok(())
}

fn load(block: &[u8]) -> (u32, u32) {
    let v0 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let v1 = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    (v0, v1)
}

fn store(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_le_bytes());
    block[4..].copy_from_slice(&v1.to_le_bytes());
}

fn encrypt_block(mut v0: u32, mut v1: u32, key: &XteaKey) -> (u32, u32) {
    let mut sum: u32 = 0;
    for _ in 0..ROUNDS {
        v0 = v0.wrapping_add(
            ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1) ^ sum.wrapping_add(key[(sum & 3) as usize]),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
        );
    }
    (v0, v1)
}

fn decrypt_block(mut v0: u32, mut v1: u32, key: &XteaKey) -> (u32, u32) {
    let mut sum: u32 = DELTA.wrapping_mul(ROUNDS);
    for _ in 0..ROUNDS {
        v1 = v1.wrapping_sub(
            ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1) ^ sum.wrapping_add(key[(sum & 3) as usize]),
        );
    }
    (v0, v1)
}

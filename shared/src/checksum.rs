//! Adler-32 as used by the frame checksum.

const ADLER_MODULO: u32 = 65521;
/// Largest run of bytes that can be summed before `b` may overflow a u32.
const ADLER_RUN: usize = 5552;

pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for run in data.chunks(ADLER_RUN) {
        for &byte in run {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MODULO;
        b %= ADLER_MODULO;
    }

    (b << 16) | a
}

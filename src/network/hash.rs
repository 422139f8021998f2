//! Combined version hash
//!
//! 32-bit FNV-1 over UTF-16 code units, rendered in base 36 and cut or padded
//! to five characters. The load endpoint computes the same value to validate
//! batch freshness, so the output must match it exactly.

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Width of the rendered hash
pub const HASH_WIDTH: usize = 5;

/// FNV-1 32-bit hash of `input`, as a five character base 36 string.
pub fn fnv132(input: &str) -> String {
    let hash = input.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        hash.wrapping_mul(FNV_PRIME) ^ u32::from(unit)
    });
    let mut rendered = to_base36(hash);
    rendered.truncate(HASH_WIDTH);
    format!("{:0>width$}", rendered, width = HASH_WIDTH)
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.iter().rev().map(|&d| d as char).collect()
}

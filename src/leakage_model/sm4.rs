//! SM4 (GB/T 32907-2016) building blocks.

/// SM4 block size in bytes.
pub const BLOCK_SIZE: usize = 16;
/// Number of rounds.
pub const ROUNDS: usize = 32;

const SBOX: [u8; 256] = [
    0xd6, 0x90, 0xe9, 0xfe, 0xcc, 0xe1, 0x3d, 0xb7, 0x16, 0xb6, 0x14, 0xc2, 0x28, 0xfb, 0x2c, 0x05,
    0x2b, 0x67, 0x9a, 0x76, 0x2a, 0xbe, 0x04, 0xc3, 0xaa, 0x44, 0x13, 0x26, 0x49, 0x86, 0x06, 0x99,
    0x9c, 0x42, 0x50, 0xf4, 0x91, 0xef, 0x98, 0x7a, 0x33, 0x54, 0x0b, 0x43, 0xed, 0xcf, 0xac, 0x62,
    0xe4, 0xb3, 0x1c, 0xa9, 0xc9, 0x08, 0xe8, 0x95, 0x80, 0xdf, 0x94, 0xfa, 0x75, 0x8f, 0x3f, 0xa6,
    0x47, 0x07, 0xa7, 0xfc, 0xf3, 0x73, 0x17, 0xba, 0x83, 0x59, 0x3c, 0x19, 0xe6, 0x85, 0x4f, 0xa8,
    0x68, 0x6b, 0x81, 0xb2, 0x71, 0x64, 0xda, 0x8b, 0xf8, 0xeb, 0x0f, 0x4b, 0x70, 0x56, 0x9d, 0x35,
    0x1e, 0x24, 0x0e, 0x5e, 0x63, 0x58, 0xd1, 0xa2, 0x25, 0x22, 0x7c, 0x3b, 0x01, 0x21, 0x78, 0x87,
    0xd4, 0x00, 0x46, 0x57, 0x9f, 0xd3, 0x27, 0x52, 0x4c, 0x36, 0x02, 0xe7, 0xa0, 0xc4, 0xc8, 0x9e,
    0xea, 0xbf, 0x8a, 0xd2, 0x40, 0xc7, 0x38, 0xb5, 0xa3, 0xf7, 0xf2, 0xce, 0xf9, 0x61, 0x15, 0xa1,
    0xe0, 0xae, 0x5d, 0xa4, 0x9b, 0x34, 0x1a, 0x55, 0xad, 0x93, 0x32, 0x30, 0xf5, 0x8c, 0xb1, 0xe3,
    0x1d, 0xf6, 0xe2, 0x2e, 0x82, 0x66, 0xca, 0x60, 0xc0, 0x29, 0x23, 0xab, 0x0d, 0x53, 0x4e, 0x6f,
    0xd5, 0xdb, 0x37, 0x45, 0xde, 0xfd, 0x8e, 0x2f, 0x03, 0xff, 0x6a, 0x72, 0x6d, 0x6c, 0x5b, 0x51,
    0x8d, 0x1b, 0xaf, 0x92, 0xbb, 0xdd, 0xbc, 0x7f, 0x11, 0xd9, 0x5c, 0x41, 0x1f, 0x10, 0x5a, 0xd8,
    0x0a, 0xc1, 0x31, 0x88, 0xa5, 0xcd, 0x7b, 0xbd, 0x2d, 0x74, 0xd0, 0x12, 0xb8, 0xe5, 0xb4, 0xb0,
    0x89, 0x69, 0x97, 0x4a, 0x0c, 0x96, 0x77, 0x7e, 0x65, 0xb9, 0xf1, 0x09, 0xc5, 0x6e, 0xc6, 0x84,
    0x18, 0xf0, 0x7d, 0xec, 0x3a, 0xdc, 0x4d, 0x20, 0x79, 0xee, 0x5f, 0x3e, 0xd7, 0xcb, 0x39, 0x48,
];

const FK: [u32; 4] = [0xa3b1bac6, 0x56aa3350, 0x677d9197, 0xb27022dc];

pub fn sbox(x: u8) -> u8 {
    SBOX[x as usize]
}

/// The whole S-box, e.g. to use it as a lookup table.
pub fn sbox_table() -> [u32; 256] {
    SBOX.map(u32::from)
}

/// Non-linear transformation: S-box applied on each byte of the word.
pub fn tau(word: u32) -> u32 {
    u32::from_be_bytes(word.to_be_bytes().map(sbox))
}

/// Linear transformation of the round function.
pub fn l(word: u32) -> u32 {
    word ^ word.rotate_left(2) ^ word.rotate_left(10) ^ word.rotate_left(18) ^ word.rotate_left(24)
}

/// Linear transformation of the key schedule.
fn l_prime(word: u32) -> u32 {
    word ^ word.rotate_left(13) ^ word.rotate_left(23)
}

/// Round function T = L ∘ τ.
pub fn t(word: u32) -> u32 {
    l(tau(word))
}

/// Key schedule constant for round `i`.
fn ck(i: usize) -> u32 {
    u32::from_be_bytes(std::array::from_fn(|j| (((4 * i + j) * 7) & 0xff) as u8))
}

/// Splits a block into its four big-endian words `X0..X3`.
///
/// # Panics
/// Panics if `block` is shorter than 16 bytes.
pub fn words(block: &[u8]) -> [u32; 4] {
    std::array::from_fn(|i| {
        u32::from_be_bytes([block[4 * i], block[4 * i + 1], block[4 * i + 2], block[4 * i + 3]])
    })
}

/// Applies one round: `(X0, X1, X2, X3) -> (X1, X2, X3, X0 ^ T(X1 ^ X2 ^ X3 ^ rk))`.
pub fn round(state: [u32; 4], round_key: u32) -> [u32; 4] {
    let [x0, x1, x2, x3] = state;
    [x1, x2, x3, x0 ^ t(x1 ^ x2 ^ x3 ^ round_key)]
}

/// Derives the 32 round keys from a master key.
pub fn expand_key(key: &[u8; 16]) -> [u32; ROUNDS] {
    let mk = words(key);
    let mut k: [u32; 4] = std::array::from_fn(|i| mk[i] ^ FK[i]);
    let mut round_keys = [0; ROUNDS];
    for (i, rk) in round_keys.iter_mut().enumerate() {
        *rk = k[0] ^ l_prime(tau(k[1] ^ k[2] ^ k[3] ^ ck(i)));
        k = [k[1], k[2], k[3], *rk];
    }

    round_keys
}

/// Inverts the key schedule: the first four round keys determine the master key.
pub fn master_key_from_round_keys(round_keys: [u32; 4]) -> [u8; 16] {
    // k[i + 4] = rk[i], walk the recurrence backwards down to k[0..4].
    let mut k = [0u32; 8];
    k[4..].copy_from_slice(&round_keys);
    for i in (0..4).rev() {
        k[i] = k[i + 4] ^ l_prime(tau(k[i + 1] ^ k[i + 2] ^ k[i + 3] ^ ck(i)));
    }

    let mut key = [0u8; 16];
    for i in 0..4 {
        key[4 * i..4 * i + 4].copy_from_slice(&(k[i] ^ FK[i]).to_be_bytes());
    }

    key
}

/// Encrypts one block.
pub fn encrypt(block: &[u8; 16], round_keys: &[u32; ROUNDS]) -> [u8; 16] {
    let state = round_keys.iter().fold(words(block), |x, &rk| round(x, rk));

    let mut out = [0u8; 16];
    for (i, word) in state.iter().rev().enumerate() {
        out[4 * i..4 * i + 4].copy_from_slice(&word.to_be_bytes());
    }

    out
}

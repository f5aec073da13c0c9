//! Shamir secret sharing over GF(256), byte-wise, in the style of a
//! threshold-unlock keystore's escrow shares: every share is self-describing
//! (carries its own index and the scheme's `(m, n)`), so reconstruction
//! never depends on filename or insertion order.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{BarrierError, BarrierResult};

const POLY: u16 = 0x11B;

fn build_tables() -> ([u8; 256], [u8; 256]) {
    let mut exp = [0u8; 256];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    for i in 0..255usize {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= POLY;
        }
    }
    exp[255] = exp[0];
    (exp, log)
}

fn tables() -> &'static ([u8; 256], [u8; 256]) {
    static TABLES: std::sync::OnceLock<([u8; 256], [u8; 256])> = std::sync::OnceLock::new();
    TABLES.get_or_init(build_tables)
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let (exp, log) = tables();
    let sum = log[a as usize] as u16 + log[b as usize] as u16;
    exp[(sum % 255) as usize]
}

fn gf_div(a: u8, b: u8) -> u8 {
    assert!(b != 0, "division by zero in GF(256)");
    if a == 0 {
        return 0;
    }
    let (exp, log) = tables();
    let diff = (log[a as usize] as i16 - log[b as usize] as i16).rem_euclid(255);
    exp[diff as usize]
}

fn eval_poly(coeffs: &[u8], x: u8) -> u8 {
    // Horner's method, highest-degree coefficient first.
    let mut result = 0u8;
    for &c in coeffs.iter().rev() {
        result = gf_mul(result, x) ^ c;
    }
    result
}

/// One self-describing share: `y` holds one field element per secret byte
/// at `x = index`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Share {
    pub index: u8,
    pub m: u8,
    pub n: u8,
    pub y: Vec<u8>,
}

impl Drop for Share {
    fn drop(&mut self) {
        self.y.zeroize();
    }
}

impl Share {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("share serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> BarrierResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BarrierError::invalid(format!("invalid-share: {}", e)))
    }
}

/// Split `secret` into `n` shares, any `m` of which reconstruct it.
pub fn split(secret: &[u8], m: u8, n: u8) -> BarrierResult<Vec<Share>> {
    if m == 0 || n == 0 || m > n {
        return Err(BarrierError::invalid("invalid Shamir parameters: require 1 <= m <= n"));
    }
    let mut shares: Vec<Share> = (1..=n).map(|i| Share { index: i, m, n, y: vec![0u8; secret.len()] }).collect();

    for (byte_idx, &secret_byte) in secret.iter().enumerate() {
        let mut coeffs = vec![0u8; m as usize];
        coeffs[0] = secret_byte;
        if m > 1 {
            let mut random_tail = vec![0u8; m as usize - 1];
            OsRng.fill_bytes(&mut random_tail);
            coeffs[1..].copy_from_slice(&random_tail);
        }
        for share in shares.iter_mut() {
            share.y[byte_idx] = eval_poly(&coeffs, share.index);
        }
    }
    Ok(shares)
}

/// Reconstruct the secret from at least `m` shares via Lagrange
/// interpolation at `x = 0`. Returns `Invalid` (`insufficient-shares`) if
/// too few distinct shares are given, or if shares disagree on `(m, n)`.
pub fn combine(shares: &[Share]) -> BarrierResult<Vec<u8>> {
    if shares.is_empty() {
        return Err(BarrierError::invalid("insufficient-shares: no shares provided"));
    }
    let m = shares[0].m;
    let n = shares[0].n;
    if shares.iter().any(|s| s.m != m || s.n != n) {
        return Err(BarrierError::invalid("invalid-share: shares disagree on (m, n)"));
    }

    let mut by_index: Vec<&Share> = Vec::new();
    for s in shares {
        if by_index.iter().any(|existing| existing.index == s.index) {
            continue;
        }
        by_index.push(s);
    }
    if by_index.len() < m as usize {
        return Err(BarrierError::invalid(format!(
            "insufficient-shares: need {} distinct shares, have {}",
            m,
            by_index.len()
        )));
    }
    by_index.truncate(m as usize);

    let len = by_index[0].y.len();
    if by_index.iter().any(|s| s.y.len() != len) {
        return Err(BarrierError::invalid("invalid-share: mismatched secret length"));
    }

    let mut secret = vec![0u8; len];
    for (byte_idx, out) in secret.iter_mut().enumerate() {
        let mut acc = 0u8;
        for (i, share_i) in by_index.iter().enumerate() {
            let mut numerator = 1u8;
            let mut denominator = 1u8;
            for (j, share_j) in by_index.iter().enumerate() {
                if i == j {
                    continue;
                }
                numerator = gf_mul(numerator, share_j.index);
                denominator = gf_mul(denominator, share_i.index ^ share_j.index);
            }
            if denominator == 0 {
                return Err(BarrierError::invalid("invalid-share: duplicate share index"));
            }
            acc ^= gf_mul(share_i.y[byte_idx], gf_div(numerator, denominator));
        }
        *out = acc;
    }
    Ok(secret)
}

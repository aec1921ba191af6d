/// Target and difficulty conversions
///
/// Pool targets come in two little-endian widths: 4-byte "short" targets
/// (xmrig style) and 8-byte "mid" targets. Difficulty is the ratio of the
/// width's maximum value over the target.

use anyhow::{bail, Result};

const SHORT_DIFF_TARGET: u64 = 0xffff_ffff;
const MID_DIFF_TARGET: u64 = 0xffff_ffff_ffff_ffff;

/// Convert a 4-byte little-endian target to a difficulty.
pub fn short_target_to_diff(target: &[u8]) -> Result<u64> {
    if target.len() != 4 {
        bail!("short target length is not 4: {}", hex::encode(target));
    }
    let value = u32::from_le_bytes(target.try_into().unwrap()) as u64;
    if value == 0 {
        return Ok(0);
    }
    Ok(SHORT_DIFF_TARGET / value)
}

/// Convert an 8-byte little-endian target to a difficulty.
pub fn mid_target_to_diff(target: &[u8]) -> Result<u64> {
    if target.len() != 8 {
        bail!("mid target length is not 8: {}", hex::encode(target));
    }
    let value = u64::from_le_bytes(target.try_into().unwrap());
    if value == 0 {
        return Ok(0);
    }
    Ok(MID_DIFF_TARGET / value)
}

/// Decode a job's hex target (either width) into a difficulty.
pub fn job_target_to_diff(target_hex: &str) -> Result<u64> {
    let bytes = hex::decode(target_hex)?;
    match bytes.len() {
        8 => mid_target_to_diff(&bytes),
        4 => short_target_to_diff(&bytes),
        n => bail!("unsupported target width: {} bytes", n),
    }
}

/// Encode a difficulty as the 4-byte little-endian target miners expect.
pub fn diff_to_short_target(diff: u64) -> String {
    if diff == 0 {
        return "ffffffff".to_string();
    }
    let quotient = (SHORT_DIFF_TARGET / diff) as u32;
    hex::encode(quotient.to_le_bytes())
}

/// Encode a difficulty as an 8-byte little-endian target.
pub fn diff_to_target(diff: u64) -> [u8; 8] {
    if diff == 0 {
        return [0xff; 8];
    }
    (MID_DIFF_TARGET / diff).to_le_bytes()
}

/// Difficulty of a 32-byte hash: reverse to big-endian, divide 2^256-1 by
/// it. Quotients that do not fit in 64 bits are a protocol error.
pub fn hash_to_diff(hash: &[u8; 32]) -> Result<u64> {
    let mut be = *hash;
    be.reverse();

    let mut limbs = [0u64; 4];
    for (i, limb) in limbs.iter_mut().enumerate() {
        *limb = u64::from_be_bytes(be[i * 8..(i + 1) * 8].try_into().unwrap());
    }

    if limbs == [0u64; 4] {
        return Ok(0);
    }
    // A quotient below 2^64 needs the dividend's top 64 bits populated.
    if limbs[0] == 0 {
        bail!("hash difficulty overflows 64 bits: {}", hex::encode(be));
    }

    // Largest q with value * q <= 2^256 - 1, i.e. no carry out of 256 bits.
    let mut lo = 0u64;
    let mut hi = u64::MAX;
    while lo < hi {
        let mid = ((lo as u128 + hi as u128 + 1) / 2) as u64;
        if mul_overflows_256(&limbs, mid) {
            hi = mid - 1;
        } else {
            lo = mid;
        }
    }
    Ok(lo)
}

/// Whether `value * q` (value as big-endian u64 limbs) exceeds 2^256 - 1.
fn mul_overflows_256(value: &[u64; 4], q: u64) -> bool {
    let mut carry: u128 = 0;
    for limb in value.iter().rev() {
        let acc = (*limb as u128) * (q as u128) + carry;
        carry = acc >> 64;
    }
    carry != 0
}

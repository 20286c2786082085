//! Signing secret strength classification
//!
//! HS256 security rests entirely on the secret, so obviously weak values are
//! refused at startup instead of being discovered later.

const MIN_SECRET_LENGTH: usize = 32; // 256 bits minimum
const RECOMMENDED_SECRET_LENGTH: usize = 64; // 512 bits recommended
const MIN_ENTROPY_BITS: f64 = 4.0;
const STRONG_ENTROPY_BITS: f64 = 5.0;

/// Secret strength classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStrength {
    /// Weak secret - REJECT
    Weak,
    /// Acceptable secret - WARN
    Acceptable,
    /// Strong secret - OK
    Strong,
}

/// Classify an HS256 signing secret.
///
/// **Criteria**:
/// - Minimum 32 bytes (256 bits)
/// - Recommended 64 bytes (512 bits)
/// - Shannon entropy of at least 4.0 bits/byte
/// - No runs of four repeated or ascending bytes
pub fn validate_secret_strength(secret: &str) -> SecretStrength {
    let bytes = secret.as_bytes();

    if bytes.len() < MIN_SECRET_LENGTH {
        return SecretStrength::Weak;
    }

    let entropy = calculate_shannon_entropy(bytes);
    if entropy < MIN_ENTROPY_BITS {
        return SecretStrength::Weak;
    }

    if has_obvious_patterns(bytes) {
        return SecretStrength::Weak;
    }

    if bytes.len() >= RECOMMENDED_SECRET_LENGTH && entropy >= STRONG_ENTROPY_BITS {
        SecretStrength::Strong
    } else {
        SecretStrength::Acceptable
    }
}

/// Bits per byte (0-8 scale)
fn calculate_shannon_entropy(data: &[u8]) -> f64 {
    let mut freq = [0u32; 256];
    let len = data.len() as f64;

    for &byte in data {
        freq[byte as usize] += 1;
    }

    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn has_obvious_patterns(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    // "aaaa", "1111"
    let mut consecutive_same = 1;
    // "abcd", "1234"
    let mut consecutive_seq = 1;

    for window in data.windows(2) {
        if window[0] == window[1] {
            consecutive_same += 1;
            if consecutive_same >= 4 {
                return true;
            }
        } else {
            consecutive_same = 1;
        }

        if window[1] as i16 - window[0] as i16 == 1 {
            consecutive_seq += 1;
            if consecutive_seq >= 4 {
                return true;
            }
        } else {
            consecutive_seq = 1;
        }
    }

    false
}

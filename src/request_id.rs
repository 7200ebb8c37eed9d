//! Request-correlation IDs (§4.7 step 1, §8): `dev1:{podId}-{epochMs}-{12 hex}`,
//! matching `dev1:[a-z0-9]{5}-\d+-[0-9a-f]{12}`.

use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rand::Rng;

const POD_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const HEX_ALPHABET: &[u8] = b"0123456789abcdef";

/// A process-wide stand-in for the "pod" a production deployment would run
/// on; stable for the life of this process.
static POD_ID: Lazy<String> = Lazy::new(|| random_string(POD_ID_ALPHABET, 5));

/// Generate one request ID.
pub fn generate() -> String {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("dev1:{}-{epoch_ms}-{}", *POD_ID, random_string(HEX_ALPHABET, 12))
}

fn random_string(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn generated_ids_match_the_expected_pattern() {
        let pattern = Regex::new(r"^dev1:[a-z0-9]{5}-\d+-[0-9a-f]{12}$").unwrap();
        for _ in 0..20 {
            let id = generate();
            assert!(pattern.is_match(&id), "{id:?} did not match");
        }
    }

    #[test]
    fn pod_id_is_stable_across_calls() {
        let a = generate();
        let b = generate();
        let pod_a = a.split(':').nth(1).unwrap().split('-').next().unwrap();
        let pod_b = b.split(':').nth(1).unwrap().split('-').next().unwrap();
        assert_eq!(pod_a, pod_b);
    }
}

// Session PIN generation and normalisation.

use rand::Rng;

use crate::engine::config::{PIN_CHARSET, PIN_LENGTH};

/// Random six-character PIN of uppercase letters and digits.
pub fn generate_pin() -> String {
    let mut rng = rand::thread_rng();
    (0..PIN_LENGTH)
        .map(|_| PIN_CHARSET[rng.gen_range(0..PIN_CHARSET.len())] as char)
        .collect()
}

/// Upper-case and validate a PIN supplied by a client. Returns `None` for
/// anything that cannot be a PIN, so lookups can short-circuit.
pub fn normalize_pin(raw: &str) -> Option<String> {
    let pin = raw.trim().to_ascii_uppercase();
    if pin.len() == PIN_LENGTH && pin.bytes().all(|b| PIN_CHARSET.contains(&b)) {
        Some(pin)
    } else {
        None
    }
}

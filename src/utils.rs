use rand::distributions::Alphanumeric;
use rand::Rng;

/// Azureus-style client prefix.
const PEER_ID_PREFIX: &[u8; 8] = b"-SK0100-";

/// Generates a peer id: the client prefix plus a random alphanumeric tail.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in peer_id[8..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    peer_id
}

/// Human-readable byte count for status lines.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

use rand::Rng;

const OPAQUE_NAME_LEN: usize = 64;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Draws a 64-character token uniformly from `[A-Za-z0-9]` (62^64 ≈ 2^381
/// possibilities). Used as the flat backing directory's on-disk basename.
pub fn random_opaque_name() -> String {
    let mut rng = rand::thread_rng();
    (0..OPAQUE_NAME_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

use rand::Rng;

const BACKUP_CODE_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

/// 32 random bytes, hex encoded.
pub fn generate_random_token() -> String {
    let mut rng = rand::thread_rng();
    let token_bytes: [u8; 32] = rng.gen();
    hex::encode(token_bytes)
}

/// Generate a random numeric code of `length` digits.
pub fn generate_numeric_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| rng.gen_range(0..10).to_string())
        .collect()
}

/// Backup code formatted as `xxxx-xxxx`, avoiding look-alike characters.
pub fn generate_backup_code() -> String {
    let mut rng = rand::thread_rng();
    let mut pick = || {
        let idx = rng.gen_range(0..BACKUP_CODE_ALPHABET.len());
        BACKUP_CODE_ALPHABET[idx] as char
    };
    let first: String = (0..4).map(|_| pick()).collect();
    let second: String = (0..4).map(|_| pick()).collect();
    format!("{}-{}", first, second)
}

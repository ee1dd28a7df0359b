//! Identifier and ack-token generation.

use rand::Rng;

use crate::error::Error;

/// Generates a random token of size N bytes, encoded in base58.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> Result<String, Error> {
    let mut token = [0u8; N];
    rng.try_fill_bytes(&mut token).map_err(Error::internal)?;
    Ok(bs58::encode(token).into_string())
}

/// Generates a fresh lease credential.
pub fn generate_ack() -> Result<String, Error> {
    generate_token::<16>(rand::thread_rng())
}

/// Generates a message id for ordinary inserts.
pub fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

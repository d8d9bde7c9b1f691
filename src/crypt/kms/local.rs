use base64::{engine::general_purpose::STANDARD, Engine};

use super::KmsContext;
use crate::{
    bson::Bson,
    crypt::aead::{self, IvMode, KEY_LEN},
    error::{Error, Result},
};

fn master_key(ctx: &KmsContext<'_>) -> Result<Vec<u8>> {
    let key = match ctx.credentials.get("key") {
        Some(Bson::Binary(binary)) => binary.bytes.clone(),
        Some(Bson::String(encoded)) => STANDARD.decode(encoded).map_err(|e| {
            Error::invalid_argument(format!("invalid base64 local master key: {e}"))
        })?,
        _ => {
            return Err(Error::invalid_argument(format!(
                "{} credentials require a 'key' of {KEY_LEN} bytes",
                ctx.provider
            )))
        }
    };
    if key.len() != KEY_LEN {
        return Err(Error::invalid_argument(format!(
            "local master key must be {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

pub(super) fn wrap(ctx: &KmsContext<'_>, data_key: &[u8]) -> Result<Vec<u8>> {
    aead::encrypt(&master_key(ctx)?, data_key, &[], IvMode::Random)
}

pub(super) fn unwrap(ctx: &KmsContext<'_>, wrapped: &[u8]) -> Result<Vec<u8>> {
    aead::decrypt(&master_key(ctx)?, wrapped, &[]).map_err(|e| {
        Error::encryption(format!(
            "unable to decrypt data key with the {} master key: {e}",
            ctx.provider
        ))
    })
}

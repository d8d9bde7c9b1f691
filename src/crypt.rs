//! Client-side encryption: data keys, KMS providers, payload formats and the engine that turns
//! intent-to-encrypt markings into ciphertext.

pub(crate) mod aead;
pub(crate) mod analysis;
pub(crate) mod data_key;
pub(crate) mod engine;
pub(crate) mod key_broker;
pub(crate) mod key_vault;
pub(crate) mod kms;
pub(crate) mod marking;
pub(crate) mod payload;
pub(crate) mod schema;
pub(crate) mod tokens;

//! Scenario tests that run the client against an in-process mock deployment.

mod client;
mod mock;
mod util;

pub(crate) use self::mock::MockDeployment;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Document},
    client::options::TlsOptions,
    client_encryption::{ClientEncryption, KmsProvider},
    options::{IndexModel, IndexOptions},
    Client,
    Namespace,
};

pub(crate) const KEY_VAULT_DB: &str = "keyvault";
pub(crate) const KEY_VAULT_COLL: &str = "datakeys";

pub(crate) fn key_vault_namespace() -> Namespace {
    Namespace::new(KEY_VAULT_DB, KEY_VAULT_COLL)
}

/// A fixed 96-byte local master key.
pub(crate) fn local_master_key() -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes: (0..96u8).collect(),
    }
}

pub(crate) fn kms_providers() -> Vec<(KmsProvider, Document, Option<TlsOptions>)> {
    vec![(
        KmsProvider::local(),
        doc! { "key": local_master_key() },
        None,
    )]
}

/// Creates the unique `keyAltNames` index a key vault collection is expected to carry.
pub(crate) async fn setup_key_vault(client: &Client) {
    client
        .database(KEY_VAULT_DB)
        .collection::<Document>(KEY_VAULT_COLL)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "keyAltNames": 1 })
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(doc! { "keyAltNames": { "$exists": true } })
                        .build(),
                )
                .build(),
        )
        .await
        .unwrap();
}

pub(crate) async fn client_encryption(mock: &MockDeployment) -> ClientEncryption {
    let key_vault_client = mock.client();
    setup_key_vault(&key_vault_client).await;
    ClientEncryption::new(key_vault_client, key_vault_namespace(), kms_providers()).unwrap()
}

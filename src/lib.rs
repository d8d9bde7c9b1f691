//! An async MongoDB client with client-side field level and queryable encryption.
//!
//! The crate contains a complete command pipeline: server discovery and monitoring, per-server
//! connection pools speaking OP_MSG, retryable reads and writes, and an encryption layer that
//! rewrites outgoing commands and decrypts replies according to a JSON schema or an
//! `encryptedFields` configuration. BSON support comes from the [`bson`] crate, and the whole API
//! runs on [`tokio`].
//!
//! # Automatic encryption
//!
//! A [`Client`] built with [`Client::encrypted_builder`] consults a schema for each namespace it
//! writes to, encrypts the marked fields with data keys held in a key vault collection, and
//! decrypts every encrypted value in the replies it receives:
//!
//! ```no_run
//! # use mongodb_csfle::{bson::{doc, Document}, client_encryption::KmsProvider, error::Result, options::ClientOptions, Client, Namespace};
//! # async fn run(local_master_key: mongodb_csfle::bson::Binary, schema: Document) -> Result<()> {
//! let client = Client::encrypted_builder(
//!     ClientOptions::parse("mongodb://localhost:27017")?,
//!     Namespace::new("keyvault", "datakeys"),
//!     [(KmsProvider::local(), doc! { "key": local_master_key }, None)],
//! )?
//! .schema_map([("hr.employees".to_string(), schema)])
//! .build()
//! .await?;
//!
//! let employees = client.database("hr").collection::<Document>("employees");
//! employees.insert_one(doc! { "name": "Ada", "ssn": "123-45-6789" }, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Explicit encryption
//!
//! [`client_encryption::ClientEncryption`] manages data keys and encrypts or decrypts individual
//! values, including queryable encryption payloads for indexed and range fields.

#![warn(missing_docs)]

#[macro_use]
pub mod options;

pub use ::bson;

mod bson_util;
mod client;
mod cmap;
mod coll;
mod concern;
mod crypt;
mod cursor;
mod db;
pub mod error;
mod hello;
mod operation;
pub mod results;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod trace;
#[cfg(test)]
mod test;

use std::{future::Future, pin::Pin};

pub use crate::{
    client::{Client, EncryptedClientBuilder},
    coll::{Collection, Namespace},
    cursor::Cursor,
    db::Database,
    options::IndexModel,
};

pub use crate::client::csfle::client_encryption;
pub use sdam::public::*;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

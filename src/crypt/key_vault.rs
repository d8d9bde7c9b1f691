use bson::{doc, Bson, Document, Uuid};

use super::data_key::DataKey;
use crate::{
    client::WeakClient,
    coll::options::{
        DeleteOptions,
        FindOneAndUpdateOptions,
        FindOptions,
        InsertOneOptions,
        ReturnDocument,
        UpdateOptions,
    },
    concern::{ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    Collection,
    Cursor,
    Namespace,
};

/// The collection holding wrapped data keys.
#[derive(Clone, Debug)]
pub(crate) struct KeyVault {
    client: WeakClient,
    ns: Namespace,
}

impl KeyVault {
    pub(crate) fn new(client: WeakClient, ns: Namespace) -> Self {
        Self { client, ns }
    }

    pub(crate) fn namespace(&self) -> &Namespace {
        &self.ns
    }

    fn collection(&self) -> Result<Collection<Document>> {
        let client = self.client.upgrade().ok_or(ErrorKind::Shutdown)?;
        Ok(client.database(&self.ns.db).collection(&self.ns.coll))
    }

    fn read_options() -> FindOptions {
        FindOptions::builder()
            .read_concern(ReadConcern::majority())
            .build()
    }

    /// Stores `key`, failing with `DuplicateKeyAltName` if another key already holds one of its
    /// alt names.
    pub(crate) async fn insert(&self, key: &DataKey) -> Result<Uuid> {
        if !key.key_alt_names.is_empty() {
            let holders = self.find_many(&[], &key.key_alt_names).await?;
            if let Some(taken) = holders
                .iter()
                .filter(|holder| holder.id != key.id)
                .flat_map(|holder| holder.key_alt_names.iter())
                .find(|name| key.key_alt_names.contains(name))
            {
                return Err(ErrorKind::DuplicateKeyAltName {
                    key_alt_name: taken.clone(),
                }
                .into());
            }
        }
        let doc = bson::to_document(key)?;
        let options = InsertOneOptions::builder()
            .write_concern(WriteConcern::majority())
            .build();
        self.collection()?
            .insert_one(doc, options)
            .await
            .map_err(|e| duplicate_alt_name(e, &key.key_alt_names))?;
        Ok(key.id)
    }

    pub(crate) async fn cursor(&self, filter: Document) -> Result<Cursor<DataKey>> {
        self.collection()?
            .clone_with_type::<DataKey>()
            .find(filter, Self::read_options())
            .await
    }

    pub(crate) async fn find(&self, filter: Document) -> Result<Vec<DataKey>> {
        self.cursor(filter).await?.try_collect().await
    }

    async fn find_one(&self, filter: Document) -> Result<Option<DataKey>> {
        let mut options = Self::read_options();
        options.limit = Some(-1);
        let mut cursor = self.collection()?.find(filter, options).await?;
        if !cursor.advance().await? {
            return Ok(None);
        }
        let doc = cursor.deserialize_current()?;
        DataKey::from_document(doc).map(Some)
    }

    pub(crate) async fn find_by_id(&self, id: &Uuid) -> Result<Option<DataKey>> {
        self.find_one(doc! { "_id": *id }).await
    }

    pub(crate) async fn find_by_alt_name(&self, name: &str) -> Result<Option<DataKey>> {
        self.find_one(doc! { "keyAltNames": name }).await
    }

    /// Fetches every key whose id or alt name is listed.
    pub(crate) async fn find_many(
        &self,
        ids: &[Uuid],
        alt_names: &[String],
    ) -> Result<Vec<DataKey>> {
        let mut clauses = Vec::new();
        if !ids.is_empty() {
            let ids: Vec<Bson> = ids.iter().map(|id| Bson::from(*id)).collect();
            clauses.push(doc! { "_id": { "$in": ids } });
        }
        if !alt_names.is_empty() {
            clauses.push(doc! { "keyAltNames": { "$in": alt_names } });
        }
        if clauses.is_empty() {
            return Ok(Vec::new());
        }
        self.find(doc! { "$or": clauses }).await
    }

    /// Adds `name` to the key's alt names and returns the updated key, or `None` if no key has
    /// that id. Adding a name the key already has changes nothing.
    pub(crate) async fn add_key_alt_name(&self, id: &Uuid, name: &str) -> Result<Option<DataKey>> {
        if let Some(owner) = self.find_by_alt_name(name).await? {
            if owner.id != *id {
                return Err(ErrorKind::DuplicateKeyAltName {
                    key_alt_name: name.to_string(),
                }
                .into());
            }
        }
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .write_concern(WriteConcern::majority())
            .build();
        let updated = self
            .collection()?
            .find_one_and_update(
                doc! { "_id": *id },
                doc! { "$addToSet": { "keyAltNames": name } },
                options,
            )
            .await
            .map_err(|e| duplicate_alt_name(e, &[name.to_string()]))?;
        updated.map(DataKey::from_document).transpose()
    }

    /// Removes `name` from the key's alt names, dropping the field once it is empty. Returns the
    /// key as it was before the update.
    pub(crate) async fn remove_key_alt_name(
        &self,
        id: &Uuid,
        name: &str,
    ) -> Result<Option<DataKey>> {
        let pipeline = vec![doc! {
            "$set": {
                "keyAltNames": {
                    "$cond": [
                        { "$eq": ["$keyAltNames", [name]] },
                        "$$REMOVE",
                        {
                            "$filter": {
                                "input": "$keyAltNames",
                                "cond": { "$ne": ["$$this", name] },
                            }
                        },
                    ]
                }
            }
        }];
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::Before)
            .write_concern(WriteConcern::majority())
            .build();
        let before = self
            .collection()?
            .find_one_and_update(doc! { "_id": *id }, pipeline, options)
            .await?;
        before.map(DataKey::from_document).transpose()
    }

    /// Deletes the key, returning whether it existed.
    pub(crate) async fn delete(&self, id: &Uuid) -> Result<bool> {
        let options = DeleteOptions::builder()
            .write_concern(WriteConcern::majority())
            .build();
        let result = self
            .collection()?
            .delete_one(doc! { "_id": *id }, options)
            .await?;
        Ok(result.deleted_count > 0)
    }

    /// Stores rewrapped key material. `set` comes from [`DataKey::rewrap`].
    pub(crate) async fn replace_wrapped(&self, id: &Uuid, set: Document) -> Result<()> {
        let options = UpdateOptions::builder()
            .write_concern(WriteConcern::majority())
            .build();
        self.collection()?
            .update_one(
                doc! { "_id": *id },
                doc! { "$set": set, "$currentDate": { "updateDate": true } },
                options,
            )
            .await?;
        Ok(())
    }
}

fn duplicate_alt_name(error: Error, names: &[String]) -> Error {
    if !error.is_duplicate_key() {
        return error;
    }
    let key_alt_name = match names {
        [name] => name.clone(),
        names => names.join(", "),
    };
    Error::from(ErrorKind::DuplicateKeyAltName { key_alt_name }).with_source(error)
}

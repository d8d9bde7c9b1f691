use crate::{
    bson::{doc, Bson},
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, Result},
    operation::{append_write_concern, OperationWithDefaults, WriteConcernOnlyBody},
    options::IndexModel,
    results::CreateIndexesResult,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct CreateIndexes {
    ns: Namespace,
    indexes: Vec<IndexModel>,
    write_concern: Option<WriteConcern>,
}

impl CreateIndexes {
    pub(crate) fn new(
        ns: Namespace,
        indexes: Vec<IndexModel>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            indexes,
            write_concern: write_concern.filter(|wc| !wc.is_empty()),
        }
    }
}

impl OperationWithDefaults for CreateIndexes {
    type O = CreateIndexesResult;

    const NAME: &'static str = "createIndexes";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        self.indexes.iter_mut().for_each(|i| i.update_name());
        let indexes = self
            .indexes
            .iter()
            .map(|index| crate::bson::to_document(index).map(Bson::Document))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "indexes": indexes,
        };

        append_write_concern(&mut body, self.write_concern.as_ref())?;

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteConcernOnlyBody = response.body()?;
        response.validate()?;
        let index_names = self
            .indexes
            .iter()
            .map(|index| {
                index
                    .name()
                    .map(String::from)
                    .ok_or_else(|| Error::internal("index name was not generated"))
            })
            .collect::<Result<_>>()?;
        Ok(CreateIndexesResult { index_names })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }
}

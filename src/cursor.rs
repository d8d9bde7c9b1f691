use std::{collections::VecDeque, marker::PhantomData};

use futures_core::Stream;
use serde::de::DeserializeOwned;

use crate::{
    bson::{doc, Document},
    error::{Error, ErrorKind, Result},
    operation::{CursorSpecification, GetMore, RunCommand},
    options::ServerAddress,
    runtime,
    selection_criteria::SelectionCriteria,
    trace::COMMAND_TRACING_EVENT_TARGET,
    Client,
    Namespace,
};

const CURSOR_NOT_FOUND_CODE: i32 = 43;

/// Where a server-side cursor lives and how its batches are requested.
#[derive(Debug, Clone)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
}

/// A [`Cursor`] streams the result of a query. When a query is made, the returned [`Cursor`] will
/// contain the first batch of results from the server; the individual results will then be
/// returned as the [`Cursor`] is iterated. When the batch is exhausted and if there are more
/// results, the [`Cursor`] will fetch the next batch of documents, and so forth until the results
/// are exhausted.
///
/// Documents in a batch are decrypted before they reach the cursor when the owning client has
/// automatic encryption enabled.
///
/// If a [`Cursor`] is still open when it goes out of scope, it will automatically be closed via
/// an asynchronous `killCursors` command executed from its `Drop` implementation.
///
/// ```rust
/// # use mongodb_csfle::{bson::{doc, Document}, Client, error::Result};
/// # async fn do_stuff(client: Client) -> Result<()> {
/// let coll = client.database("db").collection::<Document>("coll");
/// let mut cursor = coll.find(doc! {}, None).await?;
/// while cursor.advance().await? {
///     println!("{:?}", cursor.deserialize_current()?);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Cursor<T> {
    client: Client,
    info: CursorInformation,
    buffer: VecDeque<Document>,
    current: Option<Document>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Cursor<T> {
    pub(crate) fn new(client: Client, spec: CursorSpecification) -> Self {
        Self {
            client,
            info: spec.info,
            buffer: spec.initial_buffer,
            current: None,
            _phantom: Default::default(),
        }
    }

    /// The address of the server this cursor was opened on.
    pub fn address(&self) -> &ServerAddress {
        &self.info.address
    }

    /// The server-side id of this cursor; 0 once the server has no more results.
    pub fn id(&self) -> i64 {
        self.info.id
    }

    fn is_exhausted(&self) -> bool {
        self.info.id == 0
    }

    /// Move the cursor forward, potentially triggering requests to the database for more results
    /// if the local buffer has been exhausted.
    ///
    /// This will keep requesting data from the server until either the cursor is exhausted
    /// or batch with results in it has been received.
    ///
    /// The return value indicates whether new results were successfully returned (true) or if
    /// the cursor has been closed (false).
    pub async fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                self.current = Some(doc);
                return Ok(true);
            }
            if self.is_exhausted() {
                self.current = None;
                return Ok(false);
            }

            let get_more = GetMore::new(self.info.clone());
            match self.client.execute_operation(get_more).await {
                Ok(result) => {
                    self.info.id = result.id;
                    self.buffer = result.batch;
                }
                Err(error) => {
                    if cursor_is_dead(&error) {
                        self.info.id = 0;
                    }
                    self.current = None;
                    return Err(error);
                }
            }
        }
    }

    /// Returns a reference to the current result in the cursor, or `None` if
    /// [`Cursor::advance`] has not returned `true` yet.
    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    /// Deserialize the current result to the generic type associated with this cursor.
    pub fn deserialize_current(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let current = self.current.as_ref().ok_or_else(|| {
            Error::invalid_argument("deserialize_current called before advance returned true")
        })?;
        Ok(crate::bson::from_document(current.clone())?)
    }

    /// Iterates the rest of the cursor, deserializing every result.
    pub async fn try_collect(mut self) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut results = Vec::with_capacity(self.buffer.len());
        while self.advance().await? {
            results.push(self.deserialize_current()?);
        }
        Ok(results)
    }

    /// Converts this cursor into a [`Stream`] of deserialized results.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send
    where
        T: DeserializeOwned + Send,
    {
        futures_util::stream::try_unfold(self, |mut cursor| async move {
            if cursor.advance().await? {
                let item = cursor.deserialize_current()?;
                Ok(Some((item, cursor)))
            } else {
                Ok(None)
            }
        })
    }
}

fn cursor_is_dead(error: &Error) -> bool {
    error.is_network_error()
        || matches!(*error.kind, ErrorKind::Command(ref e) if e.code == CURSOR_NOT_FOUND_CODE)
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        if self.is_exhausted() {
            return;
        }
        kill_cursor(self.client.clone(), &self.info);
    }
}

fn kill_cursor(client: Client, info: &CursorInformation) {
    // Drops outside of a runtime cannot issue the command; the server reaps the cursor on its
    // own timeout.
    if tokio::runtime::Handle::try_current().is_err() {
        return;
    }

    let command = doc! {
        "killCursors": info.ns.coll.clone(),
        "cursors": [info.id],
    };
    let criteria = SelectionCriteria::from_address(info.address.clone());
    let db = info.ns.db.clone();
    runtime::execute(async move {
        let result = match RunCommand::new(db, command, Some(criteria)) {
            Ok(op) => client.execute_operation(op).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(error) = result {
            tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                %error,
                "Failed to kill cursor",
            );
        }
    });
}

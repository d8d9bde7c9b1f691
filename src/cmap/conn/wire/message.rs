use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{Header, OpCode};
use crate::{
    bson::{Bson, Document},
    error::{Error, ErrorKind, Result},
};

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// The bitwise flags of an OP_MSG.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MessageFlags(u32);

impl MessageFlags {
    pub(crate) const CHECKSUM_PRESENT: MessageFlags = MessageFlags(0b1);

    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    /// The request ID of this message. Assigned when the message is sent if not already set.
    pub(crate) request_id: Option<i32>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    /// OP_MSG payload type 0.
    pub(crate) document_payload: Document,
    /// OP_MSG payload type 1.
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

#[derive(Clone, Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

impl Message {
    /// Creates a message carrying the given command body as its single section.
    pub(crate) fn with_body(document_payload: Document, request_id: Option<i32>) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: MessageFlags::default(),
            document_payload,
            document_sequences: Vec::new(),
        }
    }

    /// Gets this message's command as a single document, folding any document sequences into the
    /// body as arrays.
    pub(crate) fn into_command_document(self) -> Document {
        let mut command = self.document_payload;
        for sequence in self.document_sequences {
            command.insert(
                sequence.identifier,
                sequence
                    .documents
                    .into_iter()
                    .map(Bson::Document)
                    .collect::<Vec<_>>(),
            );
        }
        command
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len {
            return Err(Error::invalid_response(format!(
                "Message length {} over maximum {}",
                header.length, max_len
            )));
        }
        if header.op_code != OpCode::Message {
            return Err(Error::invalid_response(format!(
                "Invalid op code, expected {} and got {}",
                OpCode::Message as u32,
                header.op_code as u32
            )));
        }

        let length_remaining = usize::try_from(header.length)
            .ok()
            .and_then(|len| len.checked_sub(Header::LENGTH))
            .ok_or_else(|| {
                Error::invalid_response(format!("invalid message length {}", header.length))
            })?;
        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        Self::read_sections(&buf, &header)
    }

    fn read_sections(mut reader: &[u8], header: &Header) -> Result<Self> {
        let flags = MessageFlags(read_u32(&mut reader)?);
        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };

        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while reader.len() > checksum_len {
            match MessageSection::read(&mut reader)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "an OP_MSG must contain exactly one payload type 0 section"
                                .into(),
                        }
                        .into());
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(sequence) => document_sequences.push(sequence),
            }
        }

        if reader.len() != checksum_len {
            return Err(Error::invalid_response(format!(
                "The message indicated that it would be {} bytes long, but it instead was {}",
                header.length,
                header.length as usize - reader.len() + checksum_len,
            )));
        }

        Ok(Self {
            request_id: Some(header.request_id),
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG must contain exactly one payload type 0 section".into(),
            })?,
            document_sequences,
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let sections = self.get_sections_bytes()?;

        let total_length = Header::LENGTH + std::mem::size_of::<u32>() + sections.len();
        let header = Header {
            length: i32::try_from(total_length).map_err(|_| {
                Error::invalid_argument(format!("message of {total_length} bytes is too large"))
            })?,
            request_id: self.request_id.unwrap_or_else(super::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&sections).await?;
        writer.flush().await?;

        Ok(())
    }

    fn get_sections_bytes(&self) -> Result<Vec<u8>> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        self.document_payload.to_writer(&mut sections)?;

        for document_sequence in &self.document_sequences {
            // Payload type 1
            sections.push(1);

            let mut documents = Vec::new();
            for document in &document_sequence.documents {
                document.to_writer(&mut documents)?;
            }
            let identifier_bytes = document_sequence.identifier.as_bytes();

            // Size bytes + identifier bytes + null-terminator byte + document bytes
            let size = 4 + identifier_bytes.len() + 1 + documents.len();
            sections.extend((size as i32).to_le_bytes());
            sections.extend(identifier_bytes);
            sections.push(0);
            sections.extend(documents);
        }

        Ok(sections)
    }
}

fn read_u32(reader: &mut &[u8]) -> Result<u32> {
    let mut bytes = [0u8; 4];
    std::io::Read::read_exact(reader, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Reads the bytes of a single BSON document, which starts with its own little-endian length.
fn read_document(reader: &mut &[u8]) -> Result<Document> {
    let length = reader
        .get(..4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::invalid_response("truncated BSON document"))?;
    let length = usize::try_from(length)
        .ok()
        .filter(|len| *len >= 5 && *len <= reader.len())
        .ok_or_else(|| Error::invalid_response(format!("invalid BSON length {length}")))?;
    let (doc_bytes, rest) = reader.split_at(length);
    let document = Document::from_reader(doc_bytes)?;
    *reader = rest;
    Ok(document)
}

/// Represents a section as defined by the OP_MSG spec.
#[derive(Debug)]
enum MessageSection {
    Document(Document),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read(reader: &mut &[u8]) -> Result<Self> {
        let mut payload_type = [0u8; 1];
        std::io::Read::read_exact(reader, &mut payload_type)?;

        if payload_type[0] == 0 {
            return Ok(MessageSection::Document(read_document(reader)?));
        }

        let size = read_u32(reader)? as usize;
        let body_len = size
            .checked_sub(4)
            .filter(|len| *len <= reader.len())
            .ok_or_else(|| Error::invalid_response(format!("invalid section size {size}")))?;
        let (mut body, rest) = reader.split_at(body_len);
        *reader = rest;

        let nul = body
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::invalid_response("unterminated document sequence identifier"))?;
        let identifier = String::from_utf8_lossy(&body[..nul]).into_owned();
        body = &body[nul + 1..];

        let mut documents = Vec::new();
        while !body.is_empty() {
            documents.push(read_document(&mut body)?);
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::doc;

    #[tokio::test]
    async fn document_sequences_fold_into_command() {
        let mut message = Message::with_body(doc! { "insert": "coll", "$db": "db" }, Some(7));
        message.document_sequences.push(DocumentSequence {
            identifier: "documents".into(),
            documents: vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
        });

        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();
        let read = Message::read_from(&mut bytes.as_slice(), None).await.unwrap();

        assert_eq!(read.request_id, Some(7));
        assert_eq!(
            read.into_command_document(),
            doc! {
                "insert": "coll",
                "$db": "db",
                "documents": [{ "_id": 1 }, { "_id": 2 }],
            }
        );
    }

    #[tokio::test]
    async fn rejects_oversized_messages() {
        let message = Message::with_body(doc! { "ping": 1 }, None);
        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();
        let err = Message::read_from(&mut bytes.as_slice(), Some(10))
            .await
            .unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::InvalidResponse { .. }));
    }
}

//! Typed view over raw change stream documents.
//!
//! The server does not promise a closed set of operation types, so decoding
//! never fails on an unfamiliar `operationType`: such events become
//! [`EventKind::Unknown`]. The raw document is always kept next to the typed
//! view, which is only ever read from it.

use mongodb::bson::{self, spec::ElementType, Bson, Document, Timestamp};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("change event has no operationType field")]
    MissingOperationType,
    #[error("operationType has unexpected BSON type {0:?}")]
    OperationType(ElementType),
    #[error("malformed '{operation_type}' event: {source}")]
    Fields {
        operation_type: String,
        #[source]
        source: bson::de::Error,
    },
}

/// A change document that could not be decoded, handed back untouched.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct Malformed {
    pub raw: Document,
    #[source]
    pub source: DecodeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Namespace {
    pub db: String,
    #[serde(default)]
    pub coll: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Document,
    #[serde(default)]
    pub removed_fields: Vec<String>,
    #[serde(default)]
    pub truncated_arrays: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Insert {
        ns: Namespace,
        document_key: Document,
        full_document: Option<Document>,
    },
    Update {
        ns: Namespace,
        document_key: Document,
        update_description: UpdateDescription,
        full_document: Option<Document>,
    },
    Replace {
        ns: Namespace,
        document_key: Document,
        full_document: Option<Document>,
    },
    Delete {
        ns: Namespace,
        document_key: Document,
    },
    Drop {
        ns: Namespace,
    },
    Rename {
        ns: Namespace,
        to: Namespace,
    },
    DropDatabase {
        ns: Namespace,
    },
    Invalidate,
    Unknown {
        operation_type: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentChange {
    ns: Namespace,
    document_key: Document,
    #[serde(default)]
    full_document: Option<Document>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateChange {
    ns: Namespace,
    document_key: Document,
    update_description: UpdateDescription,
    #[serde(default)]
    full_document: Option<Document>,
}

#[derive(Deserialize)]
struct NamespaceChange {
    ns: Namespace,
}

#[derive(Deserialize)]
struct RenameChange {
    ns: Namespace,
    to: Namespace,
}

impl EventKind {
    /// Decode the typed view of a raw change document.
    pub fn from_document(raw: &Document) -> Result<Self, DecodeError> {
        let operation_type = match raw.get("operationType") {
            Some(Bson::String(operation_type)) => operation_type.as_str(),
            Some(other) => return Err(DecodeError::OperationType(other.element_type())),
            None => return Err(DecodeError::MissingOperationType),
        };

        let kind = match operation_type {
            "insert" => {
                let change: DocumentChange = fields(operation_type, raw)?;
                EventKind::Insert {
                    ns: change.ns,
                    document_key: change.document_key,
                    full_document: change.full_document,
                }
            }
            "update" => {
                let change: UpdateChange = fields(operation_type, raw)?;
                EventKind::Update {
                    ns: change.ns,
                    document_key: change.document_key,
                    update_description: change.update_description,
                    full_document: change.full_document,
                }
            }
            "replace" => {
                let change: DocumentChange = fields(operation_type, raw)?;
                EventKind::Replace {
                    ns: change.ns,
                    document_key: change.document_key,
                    full_document: change.full_document,
                }
            }
            "delete" => {
                let change: DocumentChange = fields(operation_type, raw)?;
                EventKind::Delete {
                    ns: change.ns,
                    document_key: change.document_key,
                }
            }
            "drop" => {
                let change: NamespaceChange = fields(operation_type, raw)?;
                EventKind::Drop { ns: change.ns }
            }
            "rename" => {
                let change: RenameChange = fields(operation_type, raw)?;
                EventKind::Rename {
                    ns: change.ns,
                    to: change.to,
                }
            }
            "dropDatabase" => {
                let change: NamespaceChange = fields(operation_type, raw)?;
                EventKind::DropDatabase { ns: change.ns }
            }
            "invalidate" => EventKind::Invalidate,
            other => EventKind::Unknown {
                operation_type: other.to_owned(),
            },
        };
        Ok(kind)
    }

    /// Namespace the event applies to, if the operation type carries one.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            EventKind::Insert { ns, .. }
            | EventKind::Update { ns, .. }
            | EventKind::Replace { ns, .. }
            | EventKind::Delete { ns, .. }
            | EventKind::Drop { ns }
            | EventKind::Rename { ns, .. }
            | EventKind::DropDatabase { ns } => Some(ns),
            EventKind::Invalidate | EventKind::Unknown { .. } => None,
        }
    }
}

fn fields<T: DeserializeOwned>(operation_type: &str, raw: &Document) -> Result<T, DecodeError> {
    bson::from_document(raw.clone()).map_err(|source| DecodeError::Fields {
        operation_type: operation_type.to_owned(),
        source,
    })
}

/// One change stream record: the document as sent by the server plus its typed view.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    kind: EventKind,
    raw: Document,
}

impl ChangeEvent {
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn operation_type(&self) -> &str {
        match &self.kind {
            EventKind::Unknown { operation_type } => operation_type,
            _ => self.raw.get_str("operationType").unwrap_or_default(),
        }
    }

    pub fn namespace(&self) -> Option<&Namespace> {
        self.kind.namespace()
    }

    pub fn full_document(&self) -> Option<&Document> {
        match &self.kind {
            EventKind::Insert { full_document, .. }
            | EventKind::Update { full_document, .. }
            | EventKind::Replace { full_document, .. } => full_document.as_ref(),
            _ => None,
        }
    }

    pub fn cluster_time(&self) -> Option<Timestamp> {
        self.raw.get_timestamp("clusterTime").ok()
    }

    /// The `_id` of the event, which is its resume token.
    pub fn resume_token(&self) -> Option<&Document> {
        self.raw.get_document("_id").ok()
    }

    pub fn raw(&self) -> &Document {
        &self.raw
    }

    pub fn into_raw(self) -> Document {
        self.raw
    }
}

impl TryFrom<Document> for ChangeEvent {
    type Error = Malformed;

    fn try_from(raw: Document) -> Result<Self, Self::Error> {
        match EventKind::from_document(&raw) {
            Ok(kind) => Ok(Self { kind, raw }),
            Err(source) => Err(Malformed { raw, source }),
        }
    }
}

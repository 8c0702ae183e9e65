//! Document-store driver built on the official MongoDB client.
//!
//! Statements are JSON command documents (extended JSON accepted), executed with
//! `runCommand` on the descriptor's database. Parameters are bound structurally: every
//! `{"$param": n}` node in the command is replaced by the n-th parameter, so values are
//! never spliced into text.
//!
//! Each session owns a client limited to one connection plus a client session, which
//! carries transactions.

use crate::db::driver::{Driver, Session};
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendKind, ConnectionDescriptor, QueryParam, RawResult, RawValue, Statement, Target,
};
use async_trait::async_trait;
use chrono::DateTime;
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId, spec::BinarySubtype};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, ClientSession, Database};
use serde_json::Value;
use tracing::{debug, warn};

const DEFAULT_DATABASE: &str = "test";
const FORCE_SERVER_OBJECT_ID: &str = "forceServerObjectId";

/// Extension keys consumed here rather than forwarded as URI options.
const LOCAL_KEYS: &[&str] = &[FORCE_SERVER_OBJECT_ID];

/// URI switches that the canonical `tls` flag overrides when set.
const TLS_SWITCHES: &[&str] = &["tls", "ssl"];

#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDriver;

impl MongoDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::MongoDB
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> DbResult<Box<dyn Session>> {
        debug!(
            target = %descriptor.masked_target(),
            "Opening document session"
        );
        let uri = client_uri(descriptor)?;
        let mut options = ClientOptions::parse(&uri).await.map_err(map_error)?;
        options.max_pool_size = Some(1);
        options.min_pool_size = Some(0);
        options.connect_timeout = Some(descriptor.timeouts().connect);
        options.server_selection_timeout = Some(descriptor.timeouts().connect);
        if let Some(credentials) = descriptor.credentials() {
            let mut credential = options.credential.take().unwrap_or_default();
            credential.username = Some(credentials.username.clone());
            credential.password = credentials.password.clone();
            options.credential = Some(credential);
        }

        let database_name = descriptor
            .database()
            .map(str::to_string)
            .or_else(|| options.default_database.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let client = Client::with_options(options).map_err(map_error)?;
        let database = client.database(&database_name);

        // Force a round trip so open fails here rather than on first use
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(map_error)?;
        let session = client.start_session().await.map_err(map_error)?;

        let force_server_object_id = match descriptor.extension(FORCE_SERVER_OBJECT_ID) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            Some(other) => {
                return Err(DbError::config(format!(
                    "Option '{}' must be a boolean, got {}",
                    FORCE_SERVER_OBJECT_ID, other
                )));
            }
        };

        Ok(Box::new(MongoSession {
            client,
            database,
            session,
            force_server_object_id,
        }))
    }
}

/// Build the connection string: the target plus TLS and scalar extension options.
fn client_uri(descriptor: &ConnectionDescriptor) -> DbResult<String> {
    let mut uri = match descriptor.target() {
        Target::Url(url) => url.clone(),
        Target::Host { host, port } => format!("mongodb://{}:{}/", host, port),
        Target::File(_) => {
            return Err(DbError::config("MongoDB needs a url or host, not a file path"));
        }
    };

    let mut params: Vec<(String, String)> = Vec::new();
    let tls = descriptor.tls();
    if let Some(enabled) = tls.enabled {
        params.push(("tls".into(), enabled.to_string()));
    }
    if let Some(ca) = &tls.ca_file {
        params.push(("tlsCAFile".into(), ca.clone()));
    }
    // The client takes the certificate and key as one combined PEM file
    match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) if cert != key => {
            return Err(DbError::config(
                "MongoDB needs the client certificate and key in one PEM file; \
                 set tls_key_file (or tls_cert_file) to the combined file",
            ));
        }
        (Some(pem), _) | (None, Some(pem)) => {
            params.push(("tlsCertificateKeyFile".into(), pem.clone()));
        }
        (None, None) => {}
    }
    if tls.allow_invalid_certificates {
        params.push(("tlsAllowInvalidCertificates".into(), "true".into()));
    }
    if tls.allow_invalid_hostnames {
        params.push(("tlsAllowInvalidHostnames".into(), "true".into()));
    }
    for (key, value) in descriptor.extensions() {
        if LOCAL_KEYS.contains(&key.as_str()) {
            continue;
        }
        if tls.enabled.is_some() && TLS_SWITCHES.contains(&key.as_str()) {
            continue;
        }
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            // Only scalars map onto URI options
            _ => continue,
        };
        params.push((key.clone(), value));
    }

    if !params.is_empty() {
        if !uri.contains('?') {
            // The option list must follow a path separator
            let after_scheme = uri.find("://").map(|i| i + 3).unwrap_or(0);
            if !uri[after_scheme..].contains('/') {
                uri.push('/');
            }
            uri.push('?');
        } else if !uri.ends_with('?') && !uri.ends_with('&') {
            uri.push('&');
        }
        let encoded: Vec<String> = params
            .iter()
            .map(|(k, v)| {
                let value: String = url::form_urlencoded::byte_serialize(v.as_bytes()).collect();
                format!("{}={}", k, value)
            })
            .collect();
        uri.push_str(&encoded.join("&"));
    }
    Ok(uri)
}

pub struct MongoSession {
    client: Client,
    database: Database,
    session: ClientSession,
    force_server_object_id: bool,
}

impl MongoSession {
    async fn command(&mut self, command: Document) -> DbResult<Document> {
        self.database
            .run_command(command)
            .session(&mut self.session)
            .await
            .map_err(map_error)
    }

    /// Drain a command cursor, following it with `getMore` until exhausted.
    async fn drain_cursor(&mut self, cursor: &Document) -> DbResult<Vec<Document>> {
        let mut documents = batch(cursor, "firstBatch")?;
        let mut id = cursor.get_i64("id").unwrap_or(0);
        let collection = cursor
            .get_str("ns")
            .ok()
            .and_then(|ns| ns.split_once('.'))
            .map(|(_, coll)| coll.to_string())
            .unwrap_or_default();

        while id != 0 {
            let response = self
                .command(doc! { "getMore": id, "collection": collection.as_str() })
                .await?;
            let cursor = response
                .get_document("cursor")
                .map_err(|_| DbError::internal("getMore response has no cursor"))?;
            documents.extend(batch(cursor, "nextBatch")?);
            id = cursor.get_i64("id").unwrap_or(0);
        }
        Ok(documents)
    }
}

#[async_trait]
impl Session for MongoSession {
    async fn execute(&mut self, statement: &Statement) -> DbResult<RawResult> {
        let mut command = parse_command(&statement.text, &statement.params)?;
        let generated = if command.contains_key("insert") && !self.force_server_object_id {
            fill_missing_ids(&mut command)?
        } else {
            Vec::new()
        };
        debug!(
            command = command.keys().next().map(String::as_str).unwrap_or(""),
            params = statement.params.len(),
            "Running command"
        );

        let response = self.command(command).await?;
        check_write_errors(&response)?;

        if let Ok(cursor) = response.get_document("cursor") {
            let cursor = cursor.clone();
            let documents = self.drain_cursor(&cursor).await?;
            return Ok(RawResult::Documents {
                documents: documents.into_iter().map(document_fields).collect(),
            });
        }
        if let Some(n) = count(&response, "n") {
            let mut generated_ids = generated;
            if let Ok(upserted) = response.get_array("upserted") {
                for entry in upserted {
                    if let Some(id) = entry.as_document().and_then(|d| d.get("_id")) {
                        generated_ids.push(bson_to_raw(id.clone()));
                    }
                }
            }
            return Ok(RawResult::Ack {
                affected: n,
                generated_ids,
            });
        }
        Ok(RawResult::Documents {
            documents: vec![document_fields(response)],
        })
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.session.start_transaction().await.map_err(map_error)
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.session.commit_transaction().await.map_err(map_error)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.session.abort_transaction().await.map_err(map_error)
    }

    async fn ping(&mut self) -> bool {
        self.command(doc! { "ping": 1 }).await.is_ok()
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let MongoSession {
            client, session, ..
        } = *self;
        drop(session);
        client.shutdown().await;
        Ok(())
    }
}

// =============================================================================
// Command Documents
// =============================================================================

fn parse_command(text: &str, params: &[QueryParam]) -> DbResult<Document> {
    let json: Value = serde_json::from_str(text)
        .map_err(|e| DbError::invalid_input(format!("Command is not valid JSON: {}", e)))?;
    let bson = Bson::try_from(json)
        .map_err(|e| DbError::invalid_input(format!("Command is not valid extended JSON: {}", e)))?;
    let Bson::Document(command) = bind_params(bson, params)? else {
        return Err(DbError::invalid_input("Command must be a JSON object"));
    };
    if command.is_empty() {
        return Err(DbError::invalid_input("Command document is empty"));
    }
    Ok(command)
}

/// Replace every `{"$param": n}` node with the n-th parameter.
fn bind_params(value: Bson, params: &[QueryParam]) -> DbResult<Bson> {
    match value {
        Bson::Document(document) => {
            if document.len() == 1 {
                if let Some(index) = document.get("$param") {
                    let index = match index {
                        Bson::Int32(i) => usize::try_from(*i).ok(),
                        Bson::Int64(i) => usize::try_from(*i).ok(),
                        _ => None,
                    }
                    .ok_or_else(|| {
                        DbError::invalid_input("$param placeholder needs a non-negative integer")
                    })?;
                    let param = params.get(index).ok_or_else(|| {
                        DbError::invalid_input(format!(
                            "$param {} out of range ({} parameters bound)",
                            index,
                            params.len()
                        ))
                    })?;
                    return param_to_bson(param);
                }
            }
            let mut bound = Document::new();
            for (key, value) in document {
                bound.insert(key, bind_params(value, params)?);
            }
            Ok(Bson::Document(bound))
        }
        Bson::Array(items) => items
            .into_iter()
            .map(|item| bind_params(item, params))
            .collect::<DbResult<Vec<_>>>()
            .map(Bson::Array),
        other => Ok(other),
    }
}

fn param_to_bson(param: &QueryParam) -> DbResult<Bson> {
    Ok(match param {
        QueryParam::Null => Bson::Null,
        QueryParam::Bool(v) => Bson::Boolean(*v),
        QueryParam::Int(v) => Bson::Int64(*v),
        QueryParam::Float(v) => Bson::Double(*v),
        QueryParam::String(v) => Bson::String(v.clone()),
        QueryParam::Bytes(v) => Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Generic,
            bytes: v.clone(),
        }),
        QueryParam::Json(v) => Bson::try_from(v.clone())
            .map_err(|e| DbError::invalid_input(format!("Invalid JSON parameter: {}", e)))?,
    })
}

/// Give every inserted document without `_id` a fresh ObjectId; returns the new ids.
fn fill_missing_ids(command: &mut Document) -> DbResult<Vec<RawValue>> {
    let Some(Bson::Array(documents)) = command.get_mut("documents") else {
        return Err(DbError::invalid_input(
            "insert command needs a 'documents' array",
        ));
    };
    let mut generated = Vec::new();
    for entry in documents.iter_mut() {
        let Bson::Document(document) = entry else {
            return Err(DbError::invalid_input("insert documents must be objects"));
        };
        if !document.contains_key("_id") {
            let id = ObjectId::new();
            let mut with_id = doc! { "_id": id };
            for (key, value) in std::mem::take(document) {
                with_id.insert(key, value);
            }
            *document = with_id;
            generated.push(RawValue::ObjectId(id.to_hex()));
        }
    }
    Ok(generated)
}

fn batch(cursor: &Document, key: &str) -> DbResult<Vec<Document>> {
    let items = cursor
        .get_array(key)
        .map_err(|_| DbError::internal(format!("cursor response has no {}", key)))?;
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => Ok(d.clone()),
            other => Err(DbError::internal(format!(
                "cursor returned a non-document {:?}",
                other.element_type()
            ))),
        })
        .collect()
}

fn count(response: &Document, key: &str) -> Option<u64> {
    match response.get(key)? {
        Bson::Int32(n) => u64::try_from(*n).ok(),
        Bson::Int64(n) => u64::try_from(*n).ok(),
        Bson::Double(n) if *n >= 0.0 => Some(*n as u64),
        _ => None,
    }
}

fn check_write_errors(response: &Document) -> DbResult<()> {
    let first = response
        .get_array("writeErrors")
        .ok()
        .and_then(|errors| errors.first())
        .and_then(Bson::as_document)
        .or_else(|| response.get_document("writeConcernError").ok());
    let Some(error) = first else {
        return Ok(());
    };
    let message = error.get_str("errmsg").unwrap_or("write failed");
    let code = error.get("code").map(|code| match code {
        Bson::Int32(c) => c.to_string(),
        Bson::Int64(c) => c.to_string(),
        other => other.to_string(),
    });
    warn!(code = ?code, error = %message, "Command reported write errors");
    Err(DbError::database(
        message,
        code,
        "Check the command document and unique indexes",
    ))
}

// =============================================================================
// Value Conversion
// =============================================================================

fn document_fields(document: Document) -> Vec<(String, RawValue)> {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_raw(value)))
        .collect()
}

fn bson_to_raw(value: Bson) -> RawValue {
    match value {
        Bson::Null | Bson::Undefined => RawValue::Null,
        Bson::Boolean(b) => RawValue::Bool(b),
        Bson::Int32(i) => RawValue::Int(i.into()),
        Bson::Int64(i) => RawValue::Int(i),
        Bson::Double(f) => RawValue::Float(f),
        Bson::Decimal128(d) => RawValue::Decimal(d.to_string()),
        Bson::String(s) => RawValue::Text(s),
        Bson::ObjectId(id) => RawValue::ObjectId(id.to_hex()),
        Bson::Binary(binary) => RawValue::Bytes(binary.bytes),
        Bson::DateTime(dt) => match DateTime::from_timestamp_millis(dt.timestamp_millis()) {
            Some(ts) => RawValue::Timestamp(ts),
            None => RawValue::Unsupported {
                type_name: "datetime out of range".to_string(),
            },
        },
        Bson::Array(items) => RawValue::Array(items.into_iter().map(bson_to_raw).collect()),
        Bson::Document(document) => RawValue::Document(document_fields(document)),
        other => RawValue::Unsupported {
            type_name: format!("{:?}", other.element_type()),
        },
    }
}

fn map_error(error: mongodb::error::Error) -> DbError {
    match error.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => DbError::connection(
            error.to_string(),
            "Check that the MongoDB server is running and accessible",
        ),
        ErrorKind::Authentication { .. } => DbError::connection_rejected(
            error.to_string(),
            "Verify the username, password and authSource",
        ),
        ErrorKind::Command(command) => DbError::database(
            command.message.clone(),
            Some(command.code.to_string()),
            format!("Server rejected the command ({})", command.code_name),
        ),
        ErrorKind::InvalidArgument { .. } => DbError::invalid_input(error.to_string()),
        _ => DbError::internal(error.to_string()),
    }
}

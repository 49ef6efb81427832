use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::MarqueeAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ScheduleFilter};
use crate::tenant::TenantManager;

pub struct MarqueeHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MarqueeQueryParser>,
}

/// Tenant and identity of the connection a statement arrived on.
struct Session {
    engine: Arc<Engine>,
    user: String,
}

impl MarqueeHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MarqueeQueryParser),
        }
    }

    fn session<C: ClientInfo>(&self, client: &C) -> PgWireResult<Session> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = metadata
            .get("user")
            .cloned()
            .unwrap_or_else(|| SYSTEM_OWNER.to_string());
        let engine = self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })?;
        Ok(Session { engine, user })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, session: &Session, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(session, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, session: &Session, cmd: Command) -> PgWireResult<Response> {
        let engine = &session.engine;
        match cmd {
            Command::InsertContent {
                id,
                title,
                kind,
                default_duration,
            } => {
                let content = Content {
                    id: id.unwrap_or_else(Ulid::new),
                    title,
                    kind,
                    default_duration,
                    owner: session.user.clone(),
                };
                engine
                    .register_content(content.clone())
                    .await
                    .map_err(engine_err)?;
                content_rows(vec![content])
            }
            Command::UpdateContent {
                id,
                title,
                default_duration,
            } => {
                let content = engine
                    .update_content(id, title, default_duration)
                    .await
                    .map_err(engine_err)?;
                content_rows(vec![content])
            }
            Command::DeleteContent { id } => {
                engine.remove_content(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectContents { id } => {
                let contents = match id {
                    Some(id) => engine.get_content(id).into_iter().collect(),
                    None => engine.list_contents(),
                };
                content_rows(contents)
            }
            Command::InsertSchedule {
                content_id,
                start,
                duration,
                owner,
            } => {
                let owner = owner.unwrap_or_else(|| session.user.clone());
                let placement = engine
                    .create_schedule(content_id, start, duration, Some(owner))
                    .await
                    .map_err(engine_err)?;
                placement_row(placement)
            }
            Command::UpdateSchedule {
                id,
                content_id,
                start,
                duration,
            } => {
                let placement = engine
                    .update_schedule(id, content_id, start, duration)
                    .await
                    .map_err(engine_err)?;
                placement_row(placement)
            }
            Command::SetScheduleActive { id, active } => {
                let placement = engine
                    .set_schedule_active(id, active)
                    .await
                    .map_err(engine_err)?;
                placement_row(placement)
            }
            Command::DeleteSchedule { id } => {
                engine.delete_schedule(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSchedules { filter } => {
                let entries = match filter {
                    ScheduleFilter::All => engine.list_schedules().await,
                    ScheduleFilter::Id(id) => engine.get_schedule(id).await.into_iter().collect(),
                    ScheduleFilter::Content(cid) => engine.schedules_for_content(cid).await,
                    ScheduleFilter::Window { start, end } => {
                        engine.schedules_overlapping(start, end).await
                    }
                };
                schedule_rows(entries)
            }
            Command::SelectCurrent { at } => {
                let entry = match at {
                    Some(t) => engine.current_at(t).await,
                    None => engine.current().await,
                };
                playing_rows(entry.and_then(|e| engine.describe(&e)))
            }
            Command::SelectNext { after } => {
                let entry = engine.next_after(after).await.map_err(engine_err)?;
                playing_rows(entry.and_then(|e| engine.describe(&e)))
            }
        }
    }
}

// ── Result schemas ──────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("content_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("duration", Type::INT8),
        text_field("active", Type::BOOL),
        text_field("owner", Type::VARCHAR),
    ]
}

fn placement_schema() -> Vec<FieldInfo> {
    let mut fields = schedule_schema();
    fields.push(text_field("adjusted", Type::BOOL));
    fields.push(text_field("note", Type::VARCHAR));
    fields
}

fn playing_schema() -> Vec<FieldInfo> {
    let mut fields = schedule_schema();
    fields.push(text_field("title", Type::VARCHAR));
    fields.push(text_field("kind", Type::VARCHAR));
    fields
}

fn content_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("kind", Type::VARCHAR),
        text_field("duration", Type::INT8),
        text_field("details", Type::VARCHAR),
        text_field("owner", Type::VARCHAR),
    ]
}

/// Pick the result schema from the statement text alone, for Describe
/// before parameters are bound.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    let has = |s: &str| normalized.contains(s);
    if normalized.starts_with("DELETE") {
        vec![]
    } else if has("INSERT INTO SCHEDULES") || has("UPDATE SCHEDULES") {
        placement_schema()
    } else if has("FROM SCHEDULES") {
        schedule_schema()
    } else if has("FROM CURRENT") || has("FROM NEXT") {
        playing_schema()
    } else if has("CONTENTS") {
        content_schema()
    } else {
        vec![]
    }
}

// ── Row encoding ────────────────────────────────────────────────

fn encode_entry(encoder: &mut DataRowEncoder, e: &ScheduleEntry) -> PgWireResult<()> {
    encoder.encode_field(&e.id.to_string())?;
    encoder.encode_field(&e.content_id.to_string())?;
    encoder.encode_field(&e.start())?;
    encoder.encode_field(&e.end())?;
    encoder.encode_field(&e.duration_secs)?;
    encoder.encode_field(&e.active)?;
    encoder.encode_field(&e.owner)
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> PgWireResult<Response> {
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn schedule_rows(entries: Vec<ScheduleEntry>) -> PgWireResult<Response> {
    let schema = Arc::new(schedule_schema());
    let rows = entries
        .iter()
        .map(|e| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_entry(&mut encoder, e)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn placement_row(p: Placement) -> PgWireResult<Response> {
    let schema = Arc::new(placement_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_entry(&mut encoder, &p.entry)?;
    encoder.encode_field(&p.adjusted)?;
    encoder.encode_field(&p.note)?;
    query_response(schema, vec![Ok(encoder.take_row())])
}

fn playing_rows(playing: Option<NowPlaying>) -> PgWireResult<Response> {
    let schema = Arc::new(playing_schema());
    let rows = playing
        .iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_entry(&mut encoder, &p.entry)?;
            encoder.encode_field(&p.title)?;
            encoder.encode_field(&p.kind.label())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn content_rows(contents: Vec<Content>) -> PgWireResult<Response> {
    let schema = Arc::new(content_schema());
    let rows = contents
        .iter()
        .map(|c| {
            let details = serde_json::to_string(&c.kind)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.title)?;
            encoder.encode_field(&c.kind.label())?;
            encoder.encode_field(&c.default_duration)?;
            encoder.encode_field(&details)?;
            encoder.encode_field(&c.owner)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

#[async_trait]
impl SimpleQueryHandler for MarqueeHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.session(client)?;
        Ok(vec![self.run(&session, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MarqueeQueryParser;

#[async_trait]
impl QueryParser for MarqueeQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for MarqueeHandler {
    type Statement = String;
    type QueryParser = MarqueeQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.session(client)?;
        self.run(&session, &substitute_params(portal)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as literals. Numeric-looking values stay
/// unquoted so they can fill integer and boolean columns alike.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` does not clobber the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                if !text.is_empty() && text.parse::<i64>().is_ok() {
                    text.into_owned()
                } else {
                    format!("'{}'", text.replace('\'', "''"))
                }
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MarqueeFactory {
    handler: Arc<MarqueeHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<MarqueeAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl MarqueeFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MarqueeHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                MarqueeAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MarqueeFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(MarqueeFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ContentNotFound(_) | EngineError::ScheduleNotFound(_) => "P0002",
        EngineError::InvalidDuration(_)
        | EngineError::InvalidContent(_)
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::ConflictUnresolved(_) => "23P01",
        EngineError::WalError(_) => "58030",
        EngineError::AlreadyExists(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM schedules"), 0);
        assert_eq!(
            count_params("INSERT INTO schedules (content_id, start, duration) VALUES ($1, $2, $3)"),
            3
        );
        assert_eq!(count_params("SELECT * FROM next WHERE after = $12"), 12);
        assert_eq!(count_params("SELECT '$' FROM current"), 0);
    }

    #[test]
    fn schema_follows_statement() {
        let names = |fields: Vec<FieldInfo>| -> Vec<String> {
            fields.iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names(schema_for("insert into schedules (content_id, start) values ($1, $2)")).last(),
            Some(&"note".to_string())
        );
        assert_eq!(names(schema_for("SELECT * FROM  schedules")).len(), 7);
        assert_eq!(
            names(schema_for("SELECT * FROM current WHERE at = $1")).last(),
            Some(&"kind".to_string())
        );
        assert_eq!(
            names(schema_for("SELECT * FROM contents")).get(4),
            Some(&"details".to_string())
        );
        assert!(schema_for("DELETE FROM schedules WHERE id = $1").is_empty());
        assert!(schema_for("DELETE FROM contents WHERE id = $1").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::ScheduleNotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::ContentNotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::InvalidDuration(0)), "22023");
        assert_eq!(sqlstate(&EngineError::ConflictUnresolved(id)), "23P01");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "P0001");
    }
}

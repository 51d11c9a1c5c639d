use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::FleetbookAuthSource;
use crate::clock::now_ms;
use crate::engine::{Engine, EngineError, NewReservation, ResourcePatch};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct FleetbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FleetbookQueryParser>,
}

impl FleetbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FleetbookQueryParser),
        }
    }

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResource {
                id,
                name,
                category,
                buffer_after,
            } => {
                engine
                    .create_resource(id, name, category, buffer_after)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateResource {
                id,
                name,
                category,
                buffer_after,
            } => {
                let patch = ResourcePatch {
                    name,
                    category,
                    buffer_after,
                };
                engine.update_resource(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                resource_id,
                start,
                end,
                customer_name,
                customer_email,
            } => {
                engine
                    .create_reservation(NewReservation {
                        id,
                        resource_id,
                        start,
                        end,
                        customer_name,
                        customer_email,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetReservationStatus { id, status } => {
                engine
                    .set_reservation_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                rows_response(resources_schema(), resources.iter(), encode_resource)
            }
            Command::SelectReservations {
                id,
                resource_id,
                status,
            } => {
                let reservations = match id {
                    Some(id) => match engine.get_reservation(id).await {
                        Ok(r) if resource_id.is_none_or(|rid| r.resource_id == rid)
                            && status.is_none_or(|s| r.status == s) =>
                        {
                            vec![r]
                        }
                        Ok(_) | Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine
                        .list_reservations(resource_id, status)
                        .await
                        .map_err(engine_err)?,
                };
                rows_response(reservations_schema(), reservations.iter(), encode_reservation)
            }
            Command::SelectAvailability {
                resource_id,
                start,
                end,
            } => {
                let outcome = engine
                    .check_availability(resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                rows_response(availability_schema(), [(resource_id, outcome)].iter(), |enc, (rid, o)| {
                    enc.encode_field(&rid.to_string())?;
                    enc.encode_field(&o.available)?;
                    enc.encode_field(&o.conflicting_reservation_id.map(|id| id.to_string()))?;
                    enc.encode_field(&o.message())
                })
            }
            Command::SelectFreeWindows {
                resource_id,
                start,
                end,
                min_duration,
            } => {
                let windows = engine
                    .free_windows(resource_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                let rid = resource_id.to_string();
                rows_response(free_windows_schema(), windows.iter(), |enc, span| {
                    enc.encode_field(&rid)?;
                    enc.encode_field(&span.start)?;
                    enc.encode_field(&span.end)
                })
            }
            Command::SelectAvailableResources {
                start,
                end,
                category,
            } => {
                let resources = engine
                    .available_resources(start, end, category.as_deref())
                    .await
                    .map_err(engine_err)?;
                rows_response(resources_schema(), resources.iter(), encode_resource)
            }
            Command::SelectFleetStatus => {
                let status = engine.fleet_status(now_ms()).await;
                rows_response(fleet_status_schema(), [status].iter(), |enc, s| {
                    enc.encode_field(&(s.total as i64))?;
                    enc.encode_field(&(s.reserved as i64))?;
                    enc.encode_field(&(s.available as i64))
                })
            }
        }
    }
}

/// Encode every item with `encode` into a single query response.
fn rows_response<'a, T: 'a>(
    schema: Vec<FieldInfo>,
    items: impl Iterator<Item = &'a T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_resource(enc: &mut DataRowEncoder, r: &ResourceInfo) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.name)?;
    enc.encode_field(&r.category)?;
    enc.encode_field(&r.buffer_after)
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.resource_id.to_string())?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.status.as_str())?;
    enc.encode_field(&r.customer_name)?;
    enc.encode_field(&r.customer_email)?;
    enc.encode_field(&r.created_at)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("buffer_after", Type::INT8),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("customer_name", Type::VARCHAR),
        field("customer_email", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("available", Type::BOOL),
        field("conflicting_reservation_id", Type::VARCHAR),
        field("message", Type::VARCHAR),
    ]
}

fn free_windows_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn fleet_status_schema() -> Vec<FieldInfo> {
    vec![
        field("total", Type::INT8),
        field("reserved", Type::INT8),
        field("available", Type::INT8),
    ]
}

/// Result columns for a statement, judged from the table after `FROM`.
/// Works on unbound statements, where `$n` placeholders still stand in for values.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    if !words
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("select"))
    {
        return Vec::new();
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_ascii_lowercase());
    match table.as_deref() {
        Some("resources" | "available_resources") => resources_schema(),
        Some("reservations") => reservations_schema(),
        Some("availability") => availability_schema(),
        Some("free_windows") => free_windows_schema(),
        Some("fleet_status") => fleet_status_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        if query.trim().trim_end_matches(';').trim().is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetbookQueryParser;

#[async_trait]
impl QueryParser for FleetbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetbookHandler {
    type Statement = String;
    type QueryParser = FleetbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Walk `sql` once, left to right, handing every `$N` placeholder outside
/// quoted literals and identifiers to `bind`. A `Some` return replaces the
/// placeholder; `None` keeps it verbatim.
fn rewrite_placeholders(sql: &str, mut bind: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match quote {
            // '' and "" escapes close and reopen, which leaves us inside.
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let replacement = sql[i + 1..end].parse::<usize>().ok().and_then(&mut bind);
                match replacement {
                    Some(text) => out.push_str(&text),
                    None => out.push_str(&sql[i..end]),
                }
            }
            None => out.push(c),
        }
    }
    out
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    rewrite_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Replace `$1`, `$2`, ... with bound text-format parameters as quoted
/// literals. Bound text is never rescanned.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    rewrite_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetbookFactory {
    handler: Arc<FleetbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FleetbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FleetbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = FleetbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetbookFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(FleetbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::HasActiveReservations(_) => "55006",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::MissingValue(_)
        | SqlError::MissingFilter(_) => "42601",
        SqlError::TooLong(_) => "54000",
        SqlError::Unsupported(_) => "0A000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::BadValue(..) => "22023",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM resources"), 0);
        assert_eq!(count_params("SELECT * FROM availability WHERE resource_id = $1 AND start = $3 AND \"end\" = $2"), 3);
        assert_eq!(count_params("x = $12"), 12);
        assert_eq!(count_params("costs $ 5"), 0);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"O'Brien"), None];
        assert_eq!(
            substitute_params("VALUES ($1, $2)", &params),
            "VALUES ('O''Brien', NULL)"
        );
    }

    #[test]
    fn substitute_handles_double_digit_placeholders() {
        let params: Vec<_> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        assert_eq!(substitute_params("$1 $10", &params), "'1' '10'");
    }

    #[test]
    fn bound_text_is_not_rescanned() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"2024-06-01"), Some(b"$1")];
        assert_eq!(
            substitute_params("VALUES ($1, $2)", &params),
            "VALUES ('2024-06-01', '$1')"
        );

        let params: Vec<Option<&[u8]>> = vec![Some(b"x', 'y"), Some(b"$1$1")];
        assert_eq!(
            substitute_params("VALUES ($2, $1)", &params),
            "VALUES ('$1$1', 'x'', ''y')"
        );
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"Ada")];
        assert_eq!(
            substitute_params("SELECT '$1', \"$1\", 'it''s $1', $1", &params),
            "SELECT '$1', \"$1\", 'it''s $1', 'Ada'"
        );
        assert_eq!(count_params("SELECT '$7' WHERE a = $2"), 2);
    }

    #[test]
    fn unbound_placeholders_stay_verbatim() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"a")];
        assert_eq!(substitute_params("$1 $2 $0 $", &params), "'a' $2 $0 $");
    }

    #[test]
    fn schema_follows_from_table() {
        assert_eq!(
            names(&statement_schema("SELECT * FROM availability WHERE resource_id = $1")),
            ["resource_id", "available", "conflicting_reservation_id", "message"]
        );
        assert_eq!(
            names(&statement_schema("select * from \"fleet_status\";")),
            ["total", "reserved", "available"]
        );
        assert_eq!(names(&statement_schema("SELECT * FROM available_resources"))[0], "id");
        assert!(statement_schema("INSERT INTO resources (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        let id = Ulid::new();
        assert_eq!(engine_sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(engine_sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::Conflict(id)), "23P01");
        assert_eq!(engine_sqlstate(&EngineError::Storage("disk".into())), "58030");
    }

    #[test]
    fn sql_errors_map_to_sqlstates() {
        assert_eq!(sql_sqlstate(&SqlError::UnknownTable("x".into())), "42P01");
        assert_eq!(sql_sqlstate(&SqlError::BadValue("start", "x".into())), "22023");
        assert_eq!(sql_sqlstate(&SqlError::Empty), "42601");
    }
}

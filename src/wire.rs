use std::fmt::Debug;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{self, AccountAuthSource};
use crate::engine::{Engine, EngineError};
use crate::ids::encode_id;
use crate::model::*;
use crate::observability;
use crate::policy::RequestContext;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Database name = tenant.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Login name = actor. The startup handler has already checked the password.
    fn resolve_actor<C: ClientInfo>(client: &C) -> Actor {
        auth::actor_for(client.metadata().get("user").map(String::as_str))
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = Self::resolve_actor(client);
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&engine, &actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        result.map_err(|e| {
            tracing::debug!("{label} failed: {e}");
            engine_err(e)
        })
    }
}

async fn execute_command(
    engine: &Engine,
    actor: &Actor,
    cmd: Command,
) -> Result<Response, EngineError> {
    let ctx = RequestContext::new(actor).with_credential(cmd.credential());
    match &cmd {
        Command::InsertResource { name, remarks } => {
            let info = engine
                .create_resource(&ctx, name.clone(), remarks.clone())
                .await?;
            Ok(resource_rows(vec![info]))
        }
        Command::UpdateResource { id, patch } => {
            let info = engine.update_resource(&ctx, *id, patch.clone()).await?;
            Ok(resource_rows(vec![info]))
        }
        Command::DeleteResource { id } => {
            engine.delete_resource(&ctx, *id).await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectResources { id: None } => Ok(resource_rows(engine.list_resources().await)),
        Command::SelectResources { id: Some(id) } => {
            Ok(resource_rows(vec![engine.get_resource_info(*id).await?]))
        }
        Command::InsertReservation {
            resource_id,
            fields,
        } => {
            let info = engine
                .create_reservation(&ctx, *resource_id, fields.clone())
                .await?;
            Ok(reservation_rows(vec![info]))
        }
        Command::UpdateReservation { id, patch, .. } => {
            let info = engine.update_reservation(&ctx, *id, patch.clone()).await?;
            Ok(reservation_rows(vec![info]))
        }
        Command::DeleteReservation { id, .. } => {
            engine.delete_reservation(&ctx, *id).await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectReservations {
            resource_id,
            since,
            until,
            ..
        } => {
            let rows = engine
                .list_reservations(&ctx, *resource_id, *since, *until)
                .await?;
            Ok(reservation_rows(rows))
        }
        Command::SelectReservation { id, .. } => {
            Ok(reservation_rows(vec![engine.get_reservation(&ctx, *id).await?]))
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

pub fn resource_schema() -> Vec<FieldInfo> {
    ["id", "name", "remarks", "owner", "created_at", "updated_at"]
        .into_iter()
        .map(text_field)
        .collect()
}

pub fn reservation_schema() -> Vec<FieldInfo> {
    [
        "id",
        "resource_id",
        "name",
        "contact",
        "remarks",
        "start_at",
        "end_at",
        "credential",
        "created_at",
        "updated_at",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn resource_rows(resources: Vec<ResourceInfo>) -> Response {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&encode_id(r.id))?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.remarks)?;
            encoder.encode_field(&r.owner)?;
            encoder.encode_field(&format_timestamp(r.created_at))?;
            encoder.encode_field(&format_timestamp(r.updated_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: Vec<ReservationInfo>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&encode_id(r.id))?;
            encoder.encode_field(&encode_id(r.resource_id))?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.contact)?;
            encoder.encode_field(&r.remarks)?;
            encoder.encode_field(&format_timestamp(r.start))?;
            encoder.encode_field(&format_timestamp(r.end))?;
            encoder.encode_field(&r.credential)?;
            encoder.encode_field(&format_timestamp(r.created_at))?;
            encoder.encode_field(&format_timestamp(r.updated_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row shape a statement will produce, judged from its text before parameters
/// are bound.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("DELETE") {
        vec![]
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("RESOURCES") {
        resource_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Copy `sql`, offering every `$N` outside single-quoted literals to
/// `replace`. Placeholders it declines are kept verbatim. Replacement text is
/// never rescanned.
fn rewrite_placeholders(sql: &str, mut replace: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        } else if c == '$' && !in_literal {
            let mut end = i + 1;
            while let Some(&(j, d)) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                end = j + 1;
                chars.next();
            }
            match sql[i + 1..end].parse::<usize>().ok().and_then(&mut replace) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&sql[i..end]),
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    rewrite_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Inline bound text parameters as quoted literals, NULL for missing ones.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    rewrite_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => format!(
                "'{}'",
                String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''")
            ),
            None => "NULL".to_string(),
        })
    })
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AccountAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, auth_source: AccountAuthSource) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    auth_source: AccountAuthSource,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(tenant_manager, auth_source));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidTimespan(_) | EngineError::InvalidInput(_) => "22023",
        EngineError::Collision(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

/// Missing or malformed field values are input errors, the rest is syntax.
pub fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::MissingColumn(_) | SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TimespanError;
    use ulid::Ulid;

    #[test]
    fn sqlstate_mapping() {
        assert_eq!(sqlstate(&EngineError::Forbidden), "42501");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::nil())), "P0002");
        assert_eq!(
            sqlstate(&EngineError::InvalidTimespan(TimespanError::NotPositive)),
            "22023"
        );
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
    }

    #[test]
    fn bad_field_values_are_input_errors() {
        assert_eq!(sql_sqlstate(&SqlError::MissingColumn("contact")), "22023");
        assert_eq!(sql_sqlstate(&SqlError::InvalidValue("bad timestamp: x".into())), "22023");
        assert_eq!(sql_sqlstate(&SqlError::Parse("Expected: )".into())), "42601");
        assert_eq!(sql_sqlstate(&SqlError::MissingFilter("resource_id")), "42601");
    }

    #[test]
    fn placeholders_counted() {
        assert_eq!(count_params("SELECT * FROM resources"), 0);
        assert_eq!(
            count_params("SELECT * FROM reservations WHERE resource_id = $1 AND end_at >= $12"),
            12
        );
        assert_eq!(count_params("SELECT * FROM resources WHERE name = '$3' AND id = $1"), 1);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO reservations (resource_id, remarks) VALUES ($1, $2)";
        let params = [
            Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAV".as_slice()),
            Some(b"fee is $1 per hour".as_slice()),
        ];
        assert_eq!(
            bind_params(sql, &params),
            "INSERT INTO reservations (resource_id, remarks) \
             VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'fee is $1 per hour')"
        );
    }

    #[test]
    fn binding_escapes_quotes_and_skips_literals() {
        let params = [Some(b"O'Brien".as_slice()), None];
        assert_eq!(
            bind_params("UPDATE resources SET name = $1, remarks = $2 WHERE id = '$1'", &params),
            "UPDATE resources SET name = 'O''Brien', remarks = NULL WHERE id = '$1'"
        );
        assert_eq!(bind_params("SELECT $0, $3", &params), "SELECT $0, $3");
    }

    #[test]
    fn schema_chosen_from_statement_text() {
        assert_eq!(result_schema_for("select * from reservations where id = $1").len(), 10);
        assert_eq!(result_schema_for("INSERT INTO resources (name) VALUES ($1)").len(), 6);
        assert!(result_schema_for("DELETE FROM reservations WHERE id = $1").is_empty());
    }
}

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

use crate::auth::SlotwiseAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind, now_ms};
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotwiseFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotwiseHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// The user the connection authenticated as; empty when unknown.
    fn login_user<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default()
    }

    async fn run(&self, engine: &Engine, login_user: &str, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, login_user, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        login_user: &str,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertProgram {
                key,
                mode,
                group_max,
                topology,
            } => {
                engine
                    .create_program(key, mode, group_max, topology)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteProgram { key } => {
                engine.delete_program(&key).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertSlots { program, slots } => {
                let added = engine.add_slots(&program, &slots).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(added)))
            }
            Command::InsertPatternCells { program, cells } => {
                for (row, time) in &cells {
                    engine
                        .add_pattern_cell(&program, *row, *time)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(cells.len())))
            }
            Command::Reserve {
                program,
                coord,
                occupancy,
                user_id,
                request_id,
            } => {
                let outcome = engine
                    .reserve(&program, coord, occupancy, &user_id, request_id.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(reserve_schema(), [outcome], |enc, o| {
                    enc.encode_field(&i64::from(o.booked_count))?;
                    enc.encode_field(&i64::from(o.max_cap))?;
                    enc.encode_field(&o.locked_for.to_string())?;
                    enc.encode_field(&o.replayed)
                }))
            }
            Command::Release {
                program,
                coord,
                occupancy,
                user_id,
            } => {
                let outcome = engine
                    .release(&program, coord, occupancy, &user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(release_schema(), [outcome], |enc, o| {
                    enc.encode_field(&i64::from(o.booked_count))?;
                    enc.encode_field(&o.locked_for.map(|t| t.to_string()))
                }))
            }
            Command::InsertBooking(req) => {
                let booking = engine.book_program(req).await.map_err(engine_err)?;
                Ok(rows_response(booking_schema(), [booking], encode_booking))
            }
            Command::InsertGrant {
                user_id,
                program_id,
                expires_at,
            } => {
                engine
                    .grant_access(&user_id, &program_id, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteGrant {
                user_id,
                program_id,
            } => {
                engine
                    .revoke_access(&user_id, &program_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectPrograms => {
                let programs = engine.list_programs().await;
                Ok(rows_response(programs_schema(), programs, |enc, p| {
                    enc.encode_field(&p.key.catalog.to_string())?;
                    enc.encode_field(&p.key.title)?;
                    enc.encode_field(&p.mode.to_string())?;
                    enc.encode_field(&i64::from(p.group_max))?;
                    enc.encode_field(&p.topology.to_string())?;
                    enc.encode_field(&(p.slot_count as i64))
                }))
            }
            Command::SelectSlots { program } => {
                let slots = engine.program_slots(&program).await.map_err(engine_err)?;
                Ok(rows_response(slots_schema(), slots, encode_slot))
            }
            Command::SelectBookings { user_id, status } => {
                let bookings = engine.list_bookings(user_id.as_deref(), status).await;
                Ok(rows_response(booking_schema(), bookings, encode_booking))
            }
            Command::SelectLifecycleTick { as_of } => {
                let as_of = as_of.unwrap_or_else(|| chrono::Utc::now().date_naive());
                let report = engine.process_lifecycle_tick(as_of).await;
                Ok(rows_response(tick_schema(), [report], |enc, r| {
                    enc.encode_field(&i64::from(r.activated))?;
                    enc.encode_field(&i64::from(r.refunded))?;
                    enc.encode_field(&i64::from(r.completed))?;
                    enc.encode_field(&i64::from(r.skipped))?;
                    enc.encode_field(&i64::from(r.failed))
                }))
            }
            Command::SelectSweepExpired { now, secret } => {
                let report = engine
                    .sweep_on_demand(now.unwrap_or_else(now_ms), secret.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(sweep_schema(), [report], |enc, r| {
                    enc.encode_field(&i64::from(r.deleted))?;
                    enc.encode_field(&i64::from(r.batches))?;
                    enc.encode_field(&i64::from(r.failed_batches))
                }))
            }
            Command::SelectGrantStatus { user_id, now } => {
                if user_id.is_some_and(|asked| asked != login_user) {
                    return Err(engine_err(EngineError::Unauthorized));
                }
                let status = engine
                    .check_grant_status(login_user, now.unwrap_or_else(now_ms))
                    .await
                    .map_err(engine_err)?;
                let rows = status
                    .active
                    .into_iter()
                    .map(|p| (p, "active".to_string()))
                    .chain(status.expired.into_iter().map(|p| (p, "expired".to_string())));
                Ok(rows_response(grant_status_schema(), rows, |enc, (program_id, state)| {
                    enc.encode_field(&program_id)?;
                    enc.encode_field(&state)
                }))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    let date = |d: Option<chrono::NaiveDate>| d.map(|d| d.to_string());
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.user_id)?;
    enc.encode_field(&b.program.catalog.to_string())?;
    enc.encode_field(&b.program.title)?;
    enc.encode_field(&b.occupancy.to_string())?;
    enc.encode_field(&b.status.to_string())?;
    enc.encode_field(&b.min_persons.map(i64::from))?;
    enc.encode_field(&date(b.waiting_period_end))?;
    enc.encode_field(&b.start_date.to_string())?;
    enc.encode_field(&b.end_date.to_string())?;
    enc.encode_field(&date(b.actual_start_date))?;
    enc.encode_field(&date(b.refund_date))?;
    enc.encode_field(&b.refund_reason)?;
    enc.encode_field(&date(b.completed_date))
}

fn encode_slot(enc: &mut DataRowEncoder, s: SlotInfo) -> PgWireResult<()> {
    let (date, start, end, row, index) = match s.coord {
        SlotCoord::Dated(slot) => (
            Some(slot.date.to_string()),
            Some(slot.start.format("%H:%M").to_string()),
            Some(slot.end.format("%H:%M").to_string()),
            None,
            None,
        ),
        SlotCoord::Cell { row, time_index } => (
            None,
            s.time.map(|t| t.format("%H:%M").to_string()),
            None,
            Some(i64::from(row)),
            Some(i64::from(time_index)),
        ),
    };
    enc.encode_field(&date)?;
    enc.encode_field(&start)?;
    enc.encode_field(&end)?;
    enc.encode_field(&row)?;
    enc.encode_field(&index)?;
    enc.encode_field(&i64::from(s.booked_count))?;
    enc.encode_field(&s.locked_for.map(|t| t.to_string()))?;
    enc.encode_field(&s.max_cap.map(i64::from))
}

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn programs_schema() -> Vec<FieldInfo> {
    vec![
        text("catalog"),
        text("title"),
        text("mode"),
        int("group_max"),
        text("topology"),
        int("slot_count"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text("date"),
        text("start_time"),
        text("end_time"),
        int("row_index"),
        int("time_index"),
        int("booked_count"),
        text("locked_for"),
        int("max_cap"),
    ]
}

fn reserve_schema() -> Vec<FieldInfo> {
    vec![
        int("booked_count"),
        int("max_cap"),
        text("locked_for"),
        FieldInfo::new("replayed".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn release_schema() -> Vec<FieldInfo> {
    vec![int("booked_count"), text("locked_for")]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("catalog"),
        text("program"),
        text("occupancy"),
        text("status"),
        int("min_persons"),
        text("waiting_period_end"),
        text("start_date"),
        text("end_date"),
        text("actual_start_date"),
        text("refund_date"),
        text("refund_reason"),
        text("completed_date"),
    ]
}

fn tick_schema() -> Vec<FieldInfo> {
    vec![
        int("activated"),
        int("refunded"),
        int("completed"),
        int("skipped"),
        int("failed"),
    ]
}

fn sweep_schema() -> Vec<FieldInfo> {
    vec![int("deleted"), int("batches"), int("failed_batches")]
}

fn grant_status_schema() -> Vec<FieldInfo> {
    vec![text("program_id"), text("state")]
}

/// Result columns for a statement, judged from its verb and target table.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == ',')
        .filter(|w| !w.is_empty())
        .collect();
    let after = |kw: &str| {
        words
            .iter()
            .position(|w| *w == kw)
            .and_then(|i| words.get(i + 1))
            .copied()
            .unwrap_or("")
    };

    match words.first().copied().unwrap_or("") {
        "SELECT" => match after("FROM") {
            "PROGRAMS" => programs_schema(),
            "SLOTS" => slots_schema(),
            "BOOKINGS" => booking_schema(),
            "LIFECYCLE_TICK" => tick_schema(),
            "SWEEP_EXPIRED" => sweep_schema(),
            "GRANT_STATUS" => grant_status_schema(),
            _ => vec![],
        },
        "INSERT" => match after("INTO") {
            "RESERVATIONS" => reserve_schema(),
            "BOOKINGS" => booking_schema(),
            _ => vec![],
        },
        "DELETE" if after("FROM") == "RESERVATIONS" => release_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let user = Self::login_user(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&engine, &user, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
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
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let user = Self::login_user(client);
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, &user, cmd).await
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
            schema_for_sql(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Replace `$N` placeholders with bound text values in one left-to-right pass,
/// so a value that itself contains `$N` is never substituted again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotwiseAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotwiseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotwiseHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e.kind() {
        ErrorKind::InvalidArgument => "22023",
        ErrorKind::NotFound => "P0002",
        ErrorKind::FailedPrecondition => match e {
            EngineError::LockConflict { .. } => "55P03",
            _ => "55000",
        },
        ErrorKind::ResourceExhausted => "53400",
        ErrorKind::Unauthorized => "42501",
        ErrorKind::Unauthenticated => "28000",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

/// SQLSTATE for a statement the SQL layer refused. Well-formed SQL with a
/// missing or malformed field is an invalid argument, not a syntax error.
fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::Label(_)
        | SqlError::BadValue(_)
        | SqlError::MissingColumn(_)
        | SqlError::MissingFilter(_) => "22023",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

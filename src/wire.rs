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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{Credentials, ParkdAuthSource};
use crate::engine::{Engine, EngineError, ReservationRequest, SlotSpec};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

/// Who is issuing the current statement.
#[derive(Debug, Clone)]
struct Session {
    user: UserId,
    admin: bool,
}

pub struct ParkdHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<ParkdQueryParser>,
}

impl ParkdHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(ParkdQueryParser),
        }
    }

    fn session<C: ClientInfo>(&self, client: &C) -> PgWireResult<Session> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "startup packet carried no user".into()))?;
        Ok(Session {
            admin: user == self.admin_user,
            user,
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, session: &Session, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(session, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, session: &Session, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSlot {
                id,
                location,
                slot_number,
                vehicle_class,
                coordinates,
            } => {
                require_admin(session)?;
                engine
                    .provision_slot(SlotSpec {
                        id,
                        location,
                        slot_number,
                        vehicle_class,
                        coordinates,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSlotStatus { id, status } => {
                require_admin(session)?;
                engine.set_slot_status(id, status).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                slot_id,
                vehicle_class,
                start,
                duration_hours,
                vehicle_number,
            } => {
                engine
                    .reserve(ReservationRequest {
                        id,
                        user: session.user.clone(),
                        slot_id,
                        vehicle_class,
                        start,
                        duration_hours,
                        vehicle_number,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine
                    .cancel(&session.user, id, session.admin)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::UpdateBookingStatus { id, status } => {
                require_admin(session)?;
                if status == BookingStatus::Cancelled {
                    engine.cancel(&session.user, id, true).await.map_err(engine_err)?;
                } else {
                    engine.advance_state(id, status).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectSlots { filter } => {
                let slots = engine.list_slots(&filter).await;
                Ok(vec![rows_response(slots_schema(), slots, encode_slot)])
            }
            Command::SelectBookings { slot_id, user } => {
                let bookings = self.visible_bookings(session, slot_id, user).await?;
                Ok(vec![rows_response(bookings_schema(), bookings, encode_booking)])
            }
            Command::SelectAvailability { slot_id, start, end } => {
                let windows = engine
                    .slot_free_windows(slot_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let slot_id = slot_id.to_string();
                Ok(vec![rows_response(availability_schema(), windows, |enc, span| {
                    enc.encode_field(&slot_id)?;
                    enc.encode_field(&span.start)?;
                    enc.encode_field(&span.end)
                })])
            }
            Command::SelectConflicts { slot_id, start, end } => {
                let mut bookings = engine
                    .conflicts(slot_id, start, end)
                    .await
                    .map_err(engine_err)?;
                if !session.admin {
                    // Others' bookings show up as busy time only.
                    for b in bookings.iter_mut().filter(|b| b.user != session.user) {
                        b.user = String::new();
                        b.vehicle_number = None;
                    }
                }
                Ok(vec![rows_response(bookings_schema(), bookings, encode_booking)])
            }
            Command::SelectBookingStats { from, to } => {
                require_admin(session)?;
                let days = engine
                    .booking_statistics(from, to)
                    .await
                    .map_err(engine_err)?;
                let rows = days.into_iter().flat_map(|d| {
                    let day = d.day.to_string();
                    d.statuses.into_iter().map(move |s| (day.clone(), s))
                });
                Ok(vec![rows_response(booking_stats_schema(), rows, |enc, (day, s)| {
                    enc.encode_field(&day)?;
                    enc.encode_field(&s.status.to_string())?;
                    enc.encode_field(&to_i64(s.count))?;
                    enc.encode_field(&to_i64(s.total_amount))
                })])
            }
            Command::SelectOccupancy => {
                let tree = engine.occupancy().await;
                let rows = tree.into_iter().flat_map(|loc| {
                    loc.classes.into_iter().flat_map(move |class| {
                        class
                            .statuses
                            .into_iter()
                            .map(move |s| (loc.location, class.vehicle_class, s))
                    })
                });
                Ok(vec![rows_response(occupancy_schema(), rows, |enc, (location, class, s)| {
                    enc.encode_field(&location.to_string())?;
                    enc.encode_field(&location.display_name().to_string())?;
                    enc.encode_field(&class.to_string())?;
                    enc.encode_field(&s.status.to_string())?;
                    enc.encode_field(&to_i64(s.count))
                })])
            }
        }
    }

    /// Admins may query any slot or user; everyone else only sees their own bookings.
    async fn visible_bookings(
        &self,
        session: &Session,
        slot_id: Option<ulid::Ulid>,
        user: Option<String>,
    ) -> PgWireResult<Vec<Booking>> {
        let engine = &self.engine;
        let user = if session.admin {
            user
        } else {
            match user {
                Some(u) if u != session.user => return Ok(Vec::new()),
                _ => Some(session.user.clone()),
            }
        };

        let mut bookings = match (slot_id, &user) {
            (Some(slot_id), _) => engine.bookings_for_slot(slot_id).await.map_err(engine_err)?,
            (None, Some(u)) => engine.bookings_for_user(u).await,
            (None, None) => engine.all_bookings().await,
        };
        if let Some(u) = user {
            bookings.retain(|b| b.user == u);
        }
        Ok(bookings)
    }
}

fn require_admin(session: &Session) -> PgWireResult<()> {
    if session.admin {
        Ok(())
    } else {
        Err(user_error(
            "42501",
            format!("permission denied for user {}", session.user),
        ))
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn rows_response<T, I, F>(schema: Vec<FieldInfo>, items: I, encode: F) -> Response
where
    I: IntoIterator<Item = T>,
    F: Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
{
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

fn encode_slot(enc: &mut DataRowEncoder, slot: Slot) -> PgWireResult<()> {
    enc.encode_field(&slot.id.to_string())?;
    enc.encode_field(&slot.location.to_string())?;
    enc.encode_field(&slot.location.display_name().to_string())?;
    enc.encode_field(&slot.slot_number)?;
    enc.encode_field(&slot.vehicle_class.to_string())?;
    enc.encode_field(&slot.status.to_string())?;
    enc.encode_field(&slot.current_booking.map(|b| b.to_string()))?;
    enc.encode_field(&slot.coordinates.x)?;
    enc.encode_field(&slot.coordinates.y)?;
    enc.encode_field(&slot.last_updated)
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.user)?;
    enc.encode_field(&b.slot_id.to_string())?;
    enc.encode_field(&b.vehicle_class.to_string())?;
    enc.encode_field(&b.vehicle_number)?;
    enc.encode_field(&b.span.start)?;
    enc.encode_field(&b.span.end)?;
    enc.encode_field(&i64::from(b.duration_hours))?;
    enc.encode_field(&b.status.to_string())?;
    enc.encode_field(&to_i64(b.total_amount))?;
    enc.encode_field(&b.created_at)
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("location"),
        text("location_name"),
        text("slot_number"),
        text("vehicle_class"),
        text("status"),
        text("current_booking"),
        int4("x"),
        int4("y"),
        int8("last_updated"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("slot_id"),
        text("vehicle_class"),
        text("vehicle_number"),
        int8("start"),
        int8("end"),
        int8("duration_hours"),
        text("status"),
        int8("total_amount"),
        int8("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("slot_id"), int8("start"), int8("end")]
}

fn booking_stats_schema() -> Vec<FieldInfo> {
    vec![text("day"), text("status"), int8("count"), int8("total_amount")]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        text("location"),
        text("location_name"),
        text("vehicle_class"),
        text("status"),
        int8("count"),
    ]
}

/// Result columns for a statement, judged from the table after `FROM`.
/// Statements without a result set describe as empty.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_whitespace()
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'))
        .unwrap_or_default();
    match table {
        "slots" => slots_schema(),
        "bookings" | "conflicts" => bookings_schema(),
        "availability" => availability_schema(),
        "booking_stats" => booking_stats_schema(),
        "occupancy" => occupancy_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.session(client)?;
        self.run(&session, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

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
        let sql = substitute_params(portal);
        self.run(&session, &sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        let admin_user = credentials.admin_user.clone();
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkdHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ParkdAuthSource::new(credentials),
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ParkdFactory::new(engine, credentials));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine error kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::SlotUnavailable { .. } => "55006",
        EngineError::VehicleClassMismatch { .. } => "22023",
        EngineError::TimeConflict(_) => "23P01",
        EngineError::NotCancellable(_) => "55000",
        EngineError::InvalidInterval(_) => "22007",
        EngineError::InvalidTransition { .. } => "P0001",
        EngineError::Contention(_) => "55P03",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

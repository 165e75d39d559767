use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::auth::{actor_for_login, RoomwiseAuthSource};
use crate::engine::{now_ms, EngineError, Operation, TransitionOutcome};
use crate::model::*;
use crate::notify::TransitionNotice;
use crate::observability;
use crate::sql::{self, Command, TransitionAction};
use crate::tenant::{Tenant, TenantManager};

/// Channel that carries every transition in the tenant.
pub const ALL_RESERVATIONS_CHANNEL: &str = "reservations";
/// Prefix of the per-room channels, `room_<ulid>`.
pub const ROOM_CHANNEL_PREFIX: &str = "room_";

static NEXT_BACKEND_PID: AtomicI32 = AtomicI32::new(1);

struct Subscription {
    channel: String,
    rx: broadcast::Receiver<TransitionNotice>,
}

/// Serves one client connection. LISTEN subscriptions live here, so every
/// connection gets its own handler.
pub struct RoomwiseHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RoomwiseQueryParser>,
    pid: i32,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl RoomwiseHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RoomwiseQueryParser),
            pid: NEXT_BACKEND_PID.fetch_add(1, Ordering::Relaxed),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, run and time one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let tenant = self.resolve_tenant(client)?;
        let actor = actor_for_login(client.metadata().get("user").map(String::as_str))?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&tenant, &actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!("{label} failed for {}: {e}", actor.user_id);
        }
        result
    }

    async fn execute_command(&self, tenant: &Tenant, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        let engine = &tenant.engine;
        let now = now_ms();
        match cmd {
            Command::UpsertRoom { room } => {
                if !actor.role.is_staff() {
                    return Err(engine_err(EngineError::Forbidden("only staff manage rooms")));
                }
                let room = engine.upsert_room(room).await.map_err(engine_err)?;
                rooms_response(vec![room])
            }
            Command::InsertReservation { request } => {
                let outcome = engine
                    .create_reservation(request, actor, now)
                    .await
                    .map_err(engine_err)?;
                Ok(outcome_response(tenant, outcome))
            }
            Command::Transition {
                reservation_id,
                action,
                version,
            } => {
                let op = match action {
                    TransitionAction::Approve => Operation::Approve,
                    TransitionAction::Reject => Operation::Reject,
                    TransitionAction::Start => Operation::Start,
                    TransitionAction::EndEarly => Operation::EndEarly,
                    TransitionAction::Cancel => Operation::Cancel,
                    TransitionAction::Archive => Operation::Archive,
                };
                self.apply(tenant, reservation_id, op, actor, version, now).await
            }
            Command::RequestExtension {
                reservation_id,
                reason,
                version,
            } => {
                let op = Operation::RequestExtension { reason };
                self.apply(tenant, reservation_id, op, actor, version, now).await
            }
            Command::DecideExtension {
                reservation_id,
                decision,
                version,
            } => {
                let op = Operation::HandleExtension(decision);
                self.apply(tenant, reservation_id, op, actor, version, now).await
            }
            Command::ReplaceParticipants {
                reservation_id,
                participants,
                version,
            } => {
                let op = Operation::ReplaceParticipants(participants);
                self.apply(tenant, reservation_id, op, actor, version, now).await
            }
            Command::CancelReservation { id } => self.apply(tenant, id, Operation::Cancel, actor, None, now).await,
            Command::SelectRooms => rooms_response(engine.list_rooms().await),
            Command::SelectReservations { id: Some(id), filter } => {
                let r = tenant.cache.get(id).await.map_err(engine_err)?;
                let rows = if filter.matches_fields(&r) { vec![r] } else { vec![] };
                Ok(reservations_response(rows.iter().map(|r| (r, None))))
            }
            Command::SelectReservations { id: None, filter } => {
                let rows = engine.list_reservations(&filter).await;
                Ok(reservations_response(rows.iter().map(|r| (r, None))))
            }
            Command::SelectAvailability { date } => {
                let rooms = engine
                    .compute_availability(date, Some(actor.user_id))
                    .await
                    .map_err(engine_err)?;
                Ok(availability_response(&rooms))
            }
            Command::Listen { channel } => {
                let rx = subscribe(tenant, &channel)?;
                let mut subs = self.subscriptions.lock().await;
                if !subs.iter().any(|s| s.channel == channel) {
                    subs.push(Subscription { channel, rx });
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.subscriptions.lock().await.retain(|s| s.channel != channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.subscriptions.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    async fn apply(
        &self,
        tenant: &Tenant,
        id: Ulid,
        op: Operation,
        actor: &Actor,
        version: Option<u64>,
        now: Ms,
    ) -> PgWireResult<Response> {
        let outcome = tenant
            .engine
            .apply_operation(id, op, actor, version, now)
            .await
            .map_err(engine_err)?;
        Ok(outcome_response(tenant, outcome))
    }

    /// Deliver whatever the subscribed channels collected since the last statement.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut subs = self.subscriptions.lock().await;
            for sub in subs.iter_mut() {
                loop {
                    match sub.rx.try_recv() {
                        Ok(notice) => pending.push((sub.channel.clone(), notice.payload())),
                        Err(TryRecvError::Lagged(missed)) => {
                            tracing::warn!("listener on {} dropped {missed} notifications", sub.channel);
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        for (channel, payload) in pending {
            client
                .feed(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.pid, channel, payload,
                )))
                .await?;
        }
        client.flush().await?;
        Ok(())
    }
}

fn subscribe(tenant: &Tenant, channel: &str) -> PgWireResult<broadcast::Receiver<TransitionNotice>> {
    if channel == ALL_RESERVATIONS_CHANNEL {
        return Ok(tenant.engine.notify.subscribe_all());
    }
    let room = channel.strip_prefix(ROOM_CHANNEL_PREFIX).ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42602".into(),
            format!("invalid channel: {channel} (expected {ALL_RESERVATIONS_CHANNEL} or {ROOM_CHANNEL_PREFIX}{{id}})"),
        )))
    })?;
    let room_id = Ulid::from_string(room).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42602".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })?;
    Ok(tenant.engine.notify.subscribe_room(room_id))
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("floor", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("active", Type::BOOL),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("room_id", Type::VARCHAR),
        text_field("floor", Type::VARCHAR),
        text_field("room_name", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("extended_end", Type::INT8),
        text_field("effective_end", Type::INT8),
        text_field("timezone", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("extension_status", Type::VARCHAR),
        text_field("extension_reason", Type::VARCHAR),
        text_field("max_extended_end", Type::INT8),
        text_field("actual_start", Type::INT8),
        text_field("actual_end", Type::INT8),
        text_field("purpose", Type::VARCHAR),
        text_field("participants", Type::VARCHAR),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
        text_field("version", Type::INT8),
        text_field("archived", Type::BOOL),
        text_field("conflict_time", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("room_id", Type::VARCHAR),
        text_field("floor", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("bookable", Type::BOOL),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("is_owned_by_viewer", Type::BOOL),
    ]
}

/// Result columns for a statement, decided from its text alone so that
/// Describe works before parameters are bound.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let lower = stmt.trim_start().to_lowercase();
    if lower.starts_with("listen") || lower.starts_with("unlisten") {
        vec![]
    } else if lower.contains("availability") {
        availability_schema()
    } else if lower.contains("rooms") {
        room_schema()
    } else if lower.starts_with("select") || lower.starts_with("insert") || lower.starts_with("delete") {
        reservation_schema()
    } else {
        vec![]
    }
}

fn rooms_response(rooms: Vec<Room>) -> PgWireResult<Response> {
    let schema = Arc::new(room_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .into_iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.floor)?;
            encoder.encode_field(&room.name)?;
            encoder.encode_field(&room.active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn outcome_response(tenant: &Tenant, outcome: TransitionOutcome) -> Response {
    tenant.cache.invalidate(&outcome.reservation.id, outcome.reservation.version);
    reservations_response(std::iter::once((&outcome.reservation, outcome.conflict_time)))
}

fn reservations_response<'a>(rows: impl Iterator<Item = (&'a Reservation, Option<Ms>)>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = rows.map(|(r, conflict)| encode_reservation(&schema, r, conflict)).collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_reservation(
    schema: &Arc<Vec<FieldInfo>>,
    r: &Reservation,
    conflict_time: Option<Ms>,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let participants = serde_json::to_string(&r.participants)
        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.room_id.to_string())?;
    encoder.encode_field(&r.floor)?;
    encoder.encode_field(&r.room_name)?;
    encoder.encode_field(&r.user_id.to_string())?;
    encoder.encode_field(&r.span.start)?;
    encoder.encode_field(&r.span.end)?;
    encoder.encode_field(&r.extended_end)?;
    encoder.encode_field(&r.effective_end())?;
    encoder.encode_field(&r.timezone)?;
    encoder.encode_field(&r.status.to_string())?;
    encoder.encode_field(&r.extension_status.to_string())?;
    encoder.encode_field(&r.extension_reason)?;
    encoder.encode_field(&r.max_extended_end)?;
    encoder.encode_field(&r.actual_start)?;
    encoder.encode_field(&r.actual_end)?;
    encoder.encode_field(&r.purpose)?;
    encoder.encode_field(&participants)?;
    encoder.encode_field(&r.created_at)?;
    encoder.encode_field(&r.updated_at)?;
    encoder.encode_field(&(r.version as i64))?;
    encoder.encode_field(&r.archived)?;
    encoder.encode_field(&conflict_time)?;
    Ok(encoder.take_row())
}

/// One row per occupied slot. A room with nothing booked still gets a row,
/// with the slot columns NULL.
fn availability_response(rooms: &[RoomAvailability]) -> Response {
    let schema = Arc::new(availability_schema());
    let mut rows: Vec<PgWireResult<_>> = Vec::new();
    for room in rooms {
        let room_id = room.room_id.to_string();
        let slots: Vec<Option<&OccupiedSlot>> = if room.occupied.is_empty() {
            vec![None]
        } else {
            room.occupied.iter().map(Some).collect()
        };
        for slot in slots {
            rows.push(encode_slot(&schema, &room_id, room, slot));
        }
    }
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_slot(
    schema: &Arc<Vec<FieldInfo>>,
    room_id: &String,
    room: &RoomAvailability,
    slot: Option<&OccupiedSlot>,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(room_id)?;
    encoder.encode_field(&room.floor)?;
    encoder.encode_field(&room.name)?;
    encoder.encode_field(&room.bookable)?;
    encoder.encode_field(&slot.map(|s| s.start))?;
    encoder.encode_field(&slot.map(|s| s.end))?;
    encoder.encode_field(&slot.map(|s| s.status.to_string()))?;
    encoder.encode_field(&slot.map(|s| s.is_owned_by_viewer))?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for RoomwiseHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let result = self.run(&*client, query).await;
        self.flush_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomwiseQueryParser;

#[async_trait]
impl QueryParser for RoomwiseQueryParser {
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

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomwiseHandler {
    type Statement = String;
    type QueryParser = RoomwiseQueryParser;

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
        let result = self.run(&*client, &sql).await;
        self.flush_notifications(client).await?;
        result
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 never clobbers the prefix of $10.
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

pub struct RoomwiseFactory {
    handler: Arc<RoomwiseHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoomwiseAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomwiseFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RoomwiseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomwiseHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomwiseFactory {
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

/// Serve one accepted socket until the client disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = RoomwiseFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), e.sqlstate().into(), e.to_string())))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "42601".into(), e.to_string())))
}

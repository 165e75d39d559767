use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::ExtensionDecision;
use crate::model::*;

/// Lifecycle actions accepted by `INSERT INTO transitions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    Approve,
    Reject,
    Start,
    EndEarly,
    Cancel,
    Archive,
}

impl TransitionAction {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "start" => Some(Self::Start),
            "end_early" | "end" => Some(Self::EndEarly),
            "cancel" => Some(Self::Cancel),
            "archive" => Some(Self::Archive),
            _ => None,
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertRoom {
        room: Room,
    },
    InsertReservation {
        request: NewReservation,
    },
    Transition {
        reservation_id: Ulid,
        action: TransitionAction,
        version: Option<u64>,
    },
    RequestExtension {
        reservation_id: Ulid,
        reason: String,
        version: Option<u64>,
    },
    DecideExtension {
        reservation_id: Ulid,
        decision: ExtensionDecision,
        version: Option<u64>,
    },
    ReplaceParticipants {
        reservation_id: Ulid,
        participants: Vec<Participant>,
        version: Option<u64>,
    },
    /// `DELETE FROM reservations` cancels; nothing is ever physically deleted.
    CancelReservation {
        id: Ulid,
    },
    SelectRooms,
    SelectReservations {
        id: Option<Ulid>,
        filter: ReservationFilter,
    },
    SelectAvailability {
        date: NaiveDate,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: channel_name(&trimmed[7..])?,
        });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        return Ok(Command::Unlisten {
            channel: channel_name(&trimmed[9..])?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let channel = raw.trim().trim_matches('"').to_lowercase();
    if channel.is_empty() {
        return Err(SqlError::Parse("missing channel name".into()));
    }
    Ok(channel)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "rooms" => {
            arity(3)?;
            Ok(Command::UpsertRoom {
                room: Room {
                    id: parse_ulid(&values[0])?,
                    floor: parse_string(&values[1])?,
                    name: parse_string(&values[2])?,
                    active: match values.get(3) {
                        Some(v) => parse_bool(v)?,
                        None => true,
                    },
                },
            })
        }
        "reservations" => {
            arity(5)?;
            let start = parse_instant(&values[2])?;
            let end = parse_instant(&values[3])?;
            Ok(Command::InsertReservation {
                request: NewReservation {
                    id: parse_ulid(&values[0])?,
                    room_id: parse_ulid(&values[1])?,
                    // Unchecked: the engine reports start >= end as a validation error.
                    span: Span { start, end },
                    participants: parse_participants(&values[4])?,
                    purpose: values.get(5).map(parse_string_or_null).transpose()?.flatten(),
                    timezone: values.get(6).map(parse_string_or_null).transpose()?.flatten(),
                },
            })
        }
        "transitions" => {
            arity(2)?;
            let action = parse_string(&values[1])?;
            Ok(Command::Transition {
                reservation_id: parse_ulid(&values[0])?,
                action: TransitionAction::parse(&action).ok_or(SqlError::UnknownAction(action))?,
                version: parse_version(values.get(2))?,
            })
        }
        "extension_requests" => {
            arity(2)?;
            Ok(Command::RequestExtension {
                reservation_id: parse_ulid(&values[0])?,
                reason: parse_string(&values[1])?,
                version: parse_version(values.get(2))?,
            })
        }
        "extension_decisions" => {
            arity(2)?;
            let verdict = parse_string(&values[1])?;
            let decision = match verdict.trim().to_lowercase().as_str() {
                "approve" | "approved" => ExtensionDecision::Approve {
                    end: values.get(2).map(parse_instant_or_null).transpose()?.flatten(),
                },
                "reject" | "rejected" => ExtensionDecision::Reject,
                _ => return Err(SqlError::UnknownAction(verdict)),
            };
            Ok(Command::DecideExtension {
                reservation_id: parse_ulid(&values[0])?,
                decision,
                version: parse_version(values.get(3))?,
            })
        }
        "participants" => {
            arity(2)?;
            Ok(Command::ReplaceParticipants {
                reservation_id: parse_ulid(&values[0])?,
                participants: parse_participants(&values[1])?,
                version: parse_version(values.get(2))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn table_label(table: &str) -> &'static str {
    match table {
        "rooms" => "rooms",
        "reservations" => "reservations",
        "transitions" => "transitions",
        "extension_requests" => "extension_requests",
        "extension_decisions" => "extension_decisions",
        "participants" => "participants",
        _ => "table",
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation { id }),
        "rooms" => Err(SqlError::Unsupported(
            "rooms cannot be deleted; set active = false instead".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |name: &str| filters.iter().find(|(col, _)| col == name).map(|(_, e)| e);

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "reservations" => {
            let status = match filter("status") {
                Some(e) => {
                    let s = parse_string(e)?;
                    Some(ReservationStatus::parse(&s).ok_or(SqlError::Parse(format!("unknown status: {s}")))?)
                }
                None => None,
            };
            Ok(Command::SelectReservations {
                id: filter("id").map(|e| parse_ulid(e)).transpose()?,
                filter: ReservationFilter {
                    room_id: filter("room_id").map(|e| parse_ulid(e)).transpose()?,
                    user_id: filter("user_id").map(|e| parse_ulid(e)).transpose()?,
                    status,
                },
            })
        }
        "availability" => {
            let raw = parse_string(filter("date").ok_or(SqlError::MissingFilter("date"))?)?;
            let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .map_err(|e| SqlError::Parse(format!("bad date {raw:?}: {e}")))?;
            Ok(Command::SelectAvailability { date })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y` into column/value pairs. Anything else is rejected
/// rather than silently ignored.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Participant documents ─────────────────────────────────────

/// A participant as clients send it. Field spellings vary between clients;
/// all of them land on the canonical `Participant`.
#[derive(Debug, Deserialize)]
struct ParticipantDoc {
    #[serde(alias = "idNumber", alias = "id_no", alias = "idNo", alias = "id")]
    id_number: LooseString,
    #[serde(alias = "fullName", alias = "full_name")]
    name: LooseString,
    #[serde(default)]
    course: Option<LooseString>,
    #[serde(default, alias = "yearLevel", alias = "year")]
    year_level: Option<LooseString>,
    #[serde(default, alias = "dept")]
    department: Option<LooseString>,
    #[serde(default, alias = "type", alias = "participantRole")]
    role: Option<String>,
    #[serde(default, alias = "isMainReserver", alias = "main_reserver")]
    is_main_reserver: bool,
}

/// Strings that some clients send as numbers (year levels, id numbers).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LooseString {
    Text(String),
    Number(serde_json::Number),
}

impl LooseString {
    fn into_string(self) -> String {
        match self {
            LooseString::Text(s) => s,
            LooseString::Number(n) => n.to_string(),
        }
    }
}

impl ParticipantDoc {
    fn into_participant(self) -> Result<Participant, SqlError> {
        let role = match self.role.as_deref().map(|r| r.trim().to_lowercase()) {
            None => ParticipantRole::Student,
            Some(r) => match r.as_str() {
                "student" | "" => ParticipantRole::Student,
                "faculty" | "teacher" | "instructor" => ParticipantRole::Faculty,
                "staff" | "employee" => ParticipantRole::Staff,
                _ => return Err(SqlError::Parse(format!("unknown participant role: {r}"))),
            },
        };
        Ok(Participant {
            id_number: self.id_number.into_string(),
            name: self.name.into_string(),
            course: self.course.map(LooseString::into_string),
            year_level: self.year_level.map(LooseString::into_string),
            department: self.department.map(LooseString::into_string),
            role,
            is_main_reserver: self.is_main_reserver,
        })
    }
}

pub fn parse_participants_json(raw: &str) -> Result<Vec<Participant>, SqlError> {
    let docs: Vec<ParticipantDoc> =
        serde_json::from_str(raw).map_err(|e| SqlError::Parse(format!("bad participants JSON: {e}")))?;
    docs.into_iter().map(ParticipantDoc::into_participant).collect()
}

fn parse_participants(expr: &Expr) -> Result<Vec<Participant>, SqlError> {
    parse_participants_json(&parse_string(expr)?)
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_string(expr).map(Some)
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.trim().parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.trim().parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_instant_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_instant(expr).map(Some) }
}

fn parse_version(expr: Option<&Expr>) -> Result<Option<u64>, SqlError> {
    match expr {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => {
            let v = parse_i64(e)?;
            u64::try_from(v).map(Some).map_err(|_| SqlError::Parse(format!("bad version: {v}")))
        }
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownAction(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownAction(a) => write!(f, "unknown action: {a}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

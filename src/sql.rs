use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::SlotFilter;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        id: Ulid,
        location: Location,
        slot_number: String,
        vehicle_class: VehicleClass,
        coordinates: Coordinates,
    },
    UpdateSlotStatus {
        id: Ulid,
        status: SlotStatus,
    },
    InsertBooking {
        id: Ulid,
        slot_id: Ulid,
        vehicle_class: VehicleClass,
        start: Ms,
        duration_hours: u32,
        vehicle_number: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    SelectSlots {
        filter: SlotFilter,
    },
    SelectBookings {
        slot_id: Option<Ulid>,
        user: Option<String>,
    },
    SelectAvailability {
        slot_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectConflicts {
        slot_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectBookingStats {
        from: Ms,
        to: Ms,
    },
    SelectOccupancy,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "slots" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("slots", 4, values.len()));
            }
            let coordinates = if values.len() >= 6 {
                Coordinates {
                    x: parse_i32(&values[4])?,
                    y: parse_i32(&values[5])?,
                }
            } else {
                Coordinates::default()
            };
            Ok(Command::InsertSlot {
                id: parse_ulid(&values[0])?,
                location: parse_enum(&values[1])?,
                slot_number: parse_string(&values[2])?,
                vehicle_class: parse_enum(&values[3])?,
                coordinates,
            })
        }
        "bookings" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            let vehicle_number = if values.len() >= 6 {
                parse_string_or_null(&values[5])?
            } else {
                None
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                slot_id: parse_ulid(&values[1])?,
                vehicle_class: parse_enum(&values[2])?,
                start: parse_i64(&values[3])?,
                duration_hours: parse_u32(&values[4])?,
                vehicle_number,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "slots" => Err(SqlError::Unsupported("slots cannot be deleted".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => status = Some(&assignment.value),
            Some(other) => return Err(SqlError::Unsupported(format!("cannot set column {other}"))),
            None => return Err(SqlError::Parse("unsupported SET target".into())),
        }
    }
    let status = status.ok_or(SqlError::MissingFilter("status"))?;

    match table.as_str() {
        "slots" => Ok(Command::UpdateSlotStatus {
            id,
            status: parse_enum(status)?,
        }),
        "bookings" => Ok(Command::UpdateBookingStatus {
            id,
            status: parse_enum(status)?,
        }),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            filter: SlotFilter {
                location: filters.eq_enum("location")?,
                vehicle_class: filters.eq_enum("vehicle_class")?,
                status: filters.eq_enum("status")?,
            },
        }),
        "bookings" => Ok(Command::SelectBookings {
            slot_id: filters.eq_ulid("slot_id")?,
            user: filters.eq_string("user_id")?,
        }),
        "availability" | "conflicts" => {
            let slot_id = filters
                .eq_ulid("slot_id")?
                .ok_or(SqlError::MissingFilter("slot_id"))?;
            let start = filters
                .bound(&filters.lower, "start")?
                .ok_or(SqlError::MissingFilter("start"))?;
            let end = filters
                .bound(&filters.upper, "end")?
                .ok_or(SqlError::MissingFilter("end"))?;
            if table == "availability" {
                Ok(Command::SelectAvailability { slot_id, start, end })
            } else {
                Ok(Command::SelectConflicts { slot_id, start, end })
            }
        }
        "booking_stats" => Ok(Command::SelectBookingStats {
            from: filters.bound(&filters.lower, "created_at")?.unwrap_or(0),
            to: filters.bound(&filters.upper, "created_at")?.unwrap_or(Ms::MAX),
        }),
        "occupancy" => Ok(Command::SelectOccupancy),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column predicates gathered from an AND-chain: `col = v`, `col >= v`, `col <= v`.
#[derive(Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    lower: Vec<(String, &'a Expr)>,
    upper: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn find(list: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
        list.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn eq_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        Self::find(&self.eq, column).map(parse_ulid).transpose()
    }

    fn eq_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        Self::find(&self.eq, column).map(parse_string).transpose()
    }

    fn eq_enum<T>(&self, column: &str) -> Result<Option<T>, SqlError>
    where
        T: FromStr<Err = UnknownVariant>,
    {
        Self::find(&self.eq, column).map(parse_enum).transpose()
    }

    fn bound(&self, list: &[(String, &'a Expr)], column: &str) -> Result<Option<Ms>, SqlError> {
        Self::find(list, column).map(parse_i64).transpose()
    }
}

fn collect_filters<'a>(expr: &'a Expr, filters: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            if let ast::BinaryOperator::And = op {
                collect_filters(left, filters)?;
                return collect_filters(right, filters);
            }
            let Some(column) = expr_column_name(left) else {
                return Err(SqlError::Unsupported(format!("predicate {expr}")));
            };
            match op {
                ast::BinaryOperator::Eq => filters.eq.push((column, right)),
                ast::BinaryOperator::GtEq => filters.lower.push((column, right)),
                ast::BinaryOperator::LtEq => filters.upper.push((column, right)),
                _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
            }
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
    }
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
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
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
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: FromStr<Err = UnknownVariant>,
{
    let s = parse_string(expr)?;
    s.parse().map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

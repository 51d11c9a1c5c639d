use sqlparser::ast::{
    self, Assignment, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::clock::parse_instant;
use crate::limits::MAX_STATEMENT_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
        category: Option<String>,
        buffer_after: Option<Ms>,
    },
    /// Only the columns named in `SET` are `Some`; the rest keep their value.
    UpdateResource {
        id: Ulid,
        name: Option<Option<String>>,
        category: Option<Option<String>>,
        buffer_after: Option<Option<Ms>>,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        customer_name: Option<String>,
        customer_email: Option<String>,
    },
    SetReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectResources,
    SelectReservations {
        id: Option<Ulid>,
        resource_id: Option<Ulid>,
        status: Option<ReservationStatus>,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectFreeWindows {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectAvailableResources {
        start: Ms,
        end: Ms,
        category: Option<String>,
    },
    SelectFleetStatus,
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("statement too long: {0} bytes")]
    TooLong(usize),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {1} on {0}")]
    UnknownColumn(&'static str, String),
    #[error("missing value for {0}")]
    MissingValue(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value for {0}: {1}")]
    BadValue(&'static str, String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_STATEMENT_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row, addressed by column name when the INSERT names its
/// columns and by position otherwise.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, allowed: &[&str], insert: &'a ast::Insert) -> Result<Self, SqlError> {
        let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
        if let Some(unknown) = columns.iter().find(|c| !allowed.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        let values = first_values_row(insert)?;
        if !columns.is_empty() && columns.len() != values.len() {
            return Err(SqlError::Parse(format!(
                "{table}: {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    fn get(&self, column: &str, position: usize) -> Option<&'a Expr> {
        if self.columns.is_empty() {
            self.values.get(position)
        } else {
            self.columns
                .iter()
                .position(|c| c == column)
                .map(|i| &self.values[i])
        }
    }

    fn required(&self, column: &'static str, position: usize) -> Result<&'a Expr, SqlError> {
        self.get(column, position).ok_or(SqlError::MissingValue(column))
    }

    fn ensure_positional_arity(&self, max: usize) -> Result<(), SqlError> {
        if self.columns.is_empty() && self.values.len() > max {
            return Err(SqlError::Parse(format!(
                "{}: expected at most {max} values, got {}",
                self.table,
                self.values.len()
            )));
        }
        Ok(())
    }
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "category", "buffer_after"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "start",
    "end",
    "customer_name",
    "customer_email",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "resources" => {
            let row = Row::new("resources", RESOURCE_COLUMNS, insert)?;
            row.ensure_positional_arity(RESOURCE_COLUMNS.len())?;
            Ok(Command::InsertResource {
                id: parse_ulid("id", row.required("id", 0)?)?,
                name: opt(row.get("name", 1), |e| parse_text_or_null("name", e))?,
                category: opt(row.get("category", 2), |e| parse_text_or_null("category", e))?,
                buffer_after: opt(row.get("buffer_after", 3), |e| {
                    parse_i64_or_null("buffer_after", e)
                })?,
            })
        }
        "reservations" => {
            let row = Row::new("reservations", RESERVATION_COLUMNS, insert)?;
            row.ensure_positional_arity(RESERVATION_COLUMNS.len())?;
            Ok(Command::InsertReservation {
                id: parse_ulid("id", row.required("id", 0)?)?,
                resource_id: parse_ulid("resource_id", row.required("resource_id", 1)?)?,
                start: parse_instant_expr("start", row.required("start", 2)?)?,
                end: parse_instant_expr("end", row.required("end", 3)?)?,
                customer_name: opt(row.get("customer_name", 4), |e| {
                    parse_text_or_null("customer_name", e)
                })?,
                customer_email: opt(row.get("customer_email", 5), |e| {
                    parse_text_or_null("customer_email", e)
                })?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Parse an optional cell whose parser already yields an `Option`.
fn opt<T>(
    expr: Option<&Expr>,
    parse: impl FnOnce(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        Some(e) => parse(e),
        None => Ok(None),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "resources" => {
            let (mut name, mut category, mut buffer_after) = (None, None, None);
            for a in assignments {
                let column = assignment_column(a)?;
                match column.as_str() {
                    "name" => name = Some(parse_text_or_null("name", &a.value)?),
                    "category" => category = Some(parse_text_or_null("category", &a.value)?),
                    "buffer_after" => {
                        buffer_after = Some(parse_i64_or_null("buffer_after", &a.value)?)
                    }
                    _ => return Err(SqlError::UnknownColumn("resources", column)),
                }
            }
            Ok(Command::UpdateResource {
                id,
                name,
                category,
                buffer_after,
            })
        }
        "reservations" => {
            let mut status = None;
            for a in assignments {
                let column = assignment_column(a)?;
                match column.as_str() {
                    "status" => status = Some(parse_status(&a.value)?),
                    _ => return Err(SqlError::UnknownColumn("reservations", column)),
                }
            }
            Ok(Command::SetReservationStatus {
                id,
                status: status.ok_or(SqlError::MissingValue("status"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_column(a: &Assignment) -> Result<String, SqlError> {
    match &a.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let f = Filters(filters);

    match table.as_str() {
        "resources" => {
            f.only("resources", &[])?;
            Ok(Command::SelectResources)
        }
        "reservations" => {
            f.only("reservations", &["id", "resource_id", "status"])?;
            Ok(Command::SelectReservations {
                id: f.eq("id").map(|e| parse_ulid("id", e)).transpose()?,
                resource_id: f
                    .eq("resource_id")
                    .map(|e| parse_ulid("resource_id", e))
                    .transpose()?,
                status: f.eq("status").map(parse_status).transpose()?,
            })
        }
        "availability" => {
            f.only("availability", &["resource_id", "start", "end"])?;
            Ok(Command::SelectAvailability {
                resource_id: parse_ulid("resource_id", f.require_eq("resource_id")?)?,
                start: parse_instant_expr("start", f.lower("start")?)?,
                end: parse_instant_expr("end", f.upper("end")?)?,
            })
        }
        "free_windows" => {
            f.only("free_windows", &["resource_id", "start", "end", "min_duration"])?;
            Ok(Command::SelectFreeWindows {
                resource_id: parse_ulid("resource_id", f.require_eq("resource_id")?)?,
                start: parse_instant_expr("start", f.lower("start")?)?,
                end: parse_instant_expr("end", f.upper("end")?)?,
                min_duration: f
                    .eq("min_duration")
                    .map(|e| parse_i64("min_duration", e))
                    .transpose()?,
            })
        }
        "available_resources" => {
            f.only("available_resources", &["start", "end", "category"])?;
            Ok(Command::SelectAvailableResources {
                start: parse_instant_expr("start", f.lower("start")?)?,
                end: parse_instant_expr("end", f.upper("end")?)?,
                category: f
                    .eq("category")
                    .map(|e| parse_text_or_null("category", e))
                    .transpose()?
                    .flatten(),
            })
        }
        "fleet_status" => {
            f.only("fleet_status", &[])?;
            Ok(Command::SelectFleetStatus)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column <op> value` comparisons from a WHERE clause joined by AND.
struct Filters(Vec<(String, BinaryOperator, Expr)>);

impl Filters {
    /// Reject any filter on a column `table` does not take.
    fn only(&self, table: &'static str, columns: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _, _)| !columns.contains(&c.as_str())) {
            Some((c, _, _)) => Err(SqlError::UnknownColumn(table, c.clone())),
            None => Ok(()),
        }
    }

    fn find(&self, column: &str, ops: &[BinaryOperator]) -> Option<&Expr> {
        self.0
            .iter()
            .find(|(c, op, _)| c == column && ops.contains(op))
            .map(|(_, _, e)| e)
    }

    fn eq(&self, column: &str) -> Option<&Expr> {
        self.find(column, &[BinaryOperator::Eq])
    }

    fn require_eq(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.eq(column).ok_or(SqlError::MissingFilter(column))
    }

    /// Window start: `start = x` or `start >= x`.
    fn lower(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.find(column, &[BinaryOperator::Eq, BinaryOperator::GtEq])
            .ok_or(SqlError::MissingFilter(column))
    }

    /// Window end: `"end" = x` or `"end" <= x`.
    fn upper(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.find(column, &[BinaryOperator::Eq, BinaryOperator::LtEq])
            .ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, BinaryOperator, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((column, op.clone(), (**right).clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn first_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid("id", right),
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

fn parse_ulid(column: &'static str, expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::BadValue(column, format!("bad ULID: {e}")))
        }
        _ => Err(SqlError::BadValue(column, format!("expected ULID string, got {expr}"))),
    }
}

fn parse_i64(column: &'static str, expr: &Expr) -> Result<i64, SqlError> {
    match (expr, extract_value(expr)) {
        (_, Some(Value::Number(s, _) | Value::SingleQuotedString(s))) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::BadValue(column, format!("{s}: {e}"))),
        (
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            },
            _,
        ) => parse_i64(column, expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::BadValue(column, format!("-{expr} out of range"))),
        _ => Err(SqlError::BadValue(column, format!("expected integer, got {expr}"))),
    }
}

fn parse_i64_or_null(column: &'static str, expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64(column, expr).map(Some)
    }
}

/// Unix milliseconds, a `YYYY-MM-DD` date or an RFC 3339 timestamp.
fn parse_instant_expr(column: &'static str, expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_instant(s)
            .ok_or_else(|| SqlError::BadValue(column, format!("unrecognised timestamp {s:?}"))),
        _ => parse_i64(column, expr),
    }
}

fn parse_text_or_null(column: &'static str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        _ => Err(SqlError::BadValue(column, format!("expected string, got {expr}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => ReservationStatus::parse(s)
            .ok_or_else(|| SqlError::BadValue("status", format!("unknown status {s:?}"))),
        _ => Err(SqlError::BadValue("status", format!("expected string, got {expr}"))),
    }
}

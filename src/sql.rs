use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::ids::decode_id;
use crate::limits::MAX_CREDENTIAL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        name: String,
        remarks: String,
    },
    UpdateResource {
        id: Ulid,
        patch: ResourcePatch,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources {
        id: Option<Ulid>,
    },
    InsertReservation {
        resource_id: Ulid,
        fields: ReservationFields,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
        credential: Option<String>,
    },
    DeleteReservation {
        id: Ulid,
        credential: Option<String>,
    },
    SelectReservations {
        resource_id: Ulid,
        since: Option<Ms>,
        until: Option<Ms>,
        credential: Option<String>,
    },
    SelectReservation {
        id: Ulid,
        credential: Option<String>,
    },
}

impl Command {
    /// The credential the statement carries, if any.
    pub fn credential(&self) -> Option<&str> {
        match self {
            Command::UpdateReservation { credential, .. }
            | Command::DeleteReservation { credential, .. }
            | Command::SelectReservations { credential, .. }
            | Command::SelectReservation { credential, .. } => credential.as_deref(),
            _ => None,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const RESOURCE_INSERT_COLUMNS: &[&str] = &["name", "remarks"];
const RESERVATION_INSERT_COLUMNS: &[&str] =
    &["resource_id", "name", "contact", "remarks", "start_at", "end_at"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = match table.as_str() {
        "resources" => RESOURCE_INSERT_COLUMNS,
        "reservations" => RESERVATION_INSERT_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let row = Row::new(&columns, values, defaults)?;

    if table == "resources" {
        Ok(Command::InsertResource {
            name: string_value(row.require("name")?)?,
            remarks: row.get("remarks").map(nullable_string).transpose()?.flatten().unwrap_or_default(),
        })
    } else {
        Ok(Command::InsertReservation {
            resource_id: id_value(row.require("resource_id")?)?,
            fields: ReservationFields {
                name: string_value(row.require("name")?)?,
                contact: string_value(row.require("contact")?)?,
                remarks: row.get("remarks").map(nullable_string).transpose()?.flatten().unwrap_or_default(),
                span: Span::new(
                    timestamp_value(row.require("start_at")?)?,
                    timestamp_value(row.require("end_at")?)?,
                ),
            },
        })
    }
}

/// Column name → value for a single VALUES row.
struct Row<'a> {
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(columns: &[String], values: &'a [Expr], known: &[&'static str]) -> Result<Self, SqlError> {
        let mut cells = Vec::with_capacity(columns.len());
        for (column, value) in columns.iter().zip(values) {
            let Some(name) = known.iter().find(|k| **k == column) else {
                return Err(SqlError::UnknownColumn(column.clone()));
            };
            if cells.iter().any(|(c, _)| c == name) {
                return Err(SqlError::Parse(format!("column {column} given twice")));
            }
            cells.push((*name, value));
        }
        Ok(Self { cells })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == column).map(|(_, v)| *v)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    let filters = Filters::from_selection(selection)?;

    match table.as_str() {
        "resources" => {
            filters.allow(&["id"])?;
            let mut patch = ResourcePatch::default();
            for (column, value) in assignment_pairs(assignments)? {
                match column.as_str() {
                    "name" => patch.name = Some(string_value(value)?),
                    "remarks" => patch.remarks = Some(nullable_string(value)?.unwrap_or_default()),
                    "id" | "owner" | "created_at" | "updated_at" => {
                        return Err(SqlError::ReadOnlyColumn(column));
                    }
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateResource {
                id: filters.require_id()?,
                patch,
            })
        }
        "reservations" => {
            filters.allow(&["id", "credential"])?;
            let mut patch = ReservationPatch::default();
            for (column, value) in assignment_pairs(assignments)? {
                match column.as_str() {
                    "name" => patch.name = Some(string_value(value)?),
                    "contact" => patch.contact = Some(string_value(value)?),
                    "remarks" => patch.remarks = Some(nullable_string(value)?.unwrap_or_default()),
                    "start_at" => patch.start = Some(timestamp_value(value)?),
                    "end_at" => patch.end = Some(timestamp_value(value)?),
                    "id" | "resource_id" | "credential" | "created_at" | "updated_at" => {
                        return Err(SqlError::ReadOnlyColumn(column));
                    }
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            if patch.is_empty() {
                return Err(SqlError::Parse("UPDATE without assignments".into()));
            }
            Ok(Command::UpdateReservation {
                id: filters.require_id()?,
                patch,
                credential: filters.credential,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_pairs(assignments: &[ast::Assignment]) -> Result<Vec<(String, &Expr)>, SqlError> {
    assignments
        .iter()
        .map(|a| match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .map(|column| (column, &a.value))
                .ok_or_else(|| SqlError::Parse("empty column name".into())),
            AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
        })
        .collect()
}

// ── DELETE / SELECT ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "resources" => {
            filters.allow(&["id"])?;
            Ok(Command::DeleteResource {
                id: filters.require_id()?,
            })
        }
        "reservations" => {
            filters.allow(&["id", "credential"])?;
            Ok(Command::DeleteReservation {
                id: filters.require_id()?,
                credential: filters.credential,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "resources" => {
            filters.allow(&["id"])?;
            Ok(Command::SelectResources { id: filters.id })
        }
        "reservations" if filters.id.is_some() => {
            filters.allow(&["id", "credential"])?;
            Ok(Command::SelectReservation {
                id: filters.require_id()?,
                credential: filters.credential,
            })
        }
        "reservations" => {
            filters.allow(&["resource_id", "since", "until", "credential"])?;
            Ok(Command::SelectReservations {
                resource_id: filters
                    .resource_id
                    .ok_or(SqlError::MissingFilter("resource_id"))?,
                since: filters.since,
                until: filters.until,
                credential: filters.credential,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

/// Conjunction of the few predicates statements may carry.
#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    resource_id: Option<Ulid>,
    credential: Option<String>,
    /// `end_at >= since`
    since: Option<Ms>,
    /// `start_at <= until`
    until: Option<Ms>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::UnsupportedFilter(expr.to_string()))?;
                match (column.as_str(), op) {
                    ("id", BinaryOperator::Eq) => self.id = Some(id_value(right)?),
                    ("resource_id", BinaryOperator::Eq) => self.resource_id = Some(id_value(right)?),
                    ("credential", BinaryOperator::Eq) => {
                        let credential = string_value(right)?;
                        if credential.len() > MAX_CREDENTIAL_LEN {
                            return Err(SqlError::InvalidValue("credential too long".into()));
                        }
                        self.credential = Some(credential);
                    }
                    ("end_at", BinaryOperator::GtEq) => self.since = Some(timestamp_value(right)?),
                    ("start_at", BinaryOperator::LtEq) => self.until = Some(timestamp_value(right)?),
                    _ => return Err(SqlError::UnsupportedFilter(expr.to_string())),
                }
                Ok(())
            }
            other => Err(SqlError::UnsupportedFilter(other.to_string())),
        }
    }

    fn present(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            ("id", self.id.is_some()),
            ("resource_id", self.resource_id.is_some()),
            ("credential", self.credential.is_some()),
            ("since", self.since.is_some()),
            ("until", self.until.is_some()),
        ]
        .into_iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| name)
    }

    fn allow(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.present().find(|name| !allowed.contains(name)) {
            Some(name) => Err(SqlError::UnsupportedFilter(name.to_string())),
            None => Ok(()),
        }
    }

    fn require_id(&self) -> Result<Ulid, SqlError> {
        self.id.ok_or(SqlError::MissingFilter("id"))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn nullable_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn string_value(expr: &Expr) -> Result<String, SqlError> {
    nullable_string(expr)?.ok_or_else(|| SqlError::InvalidValue("unexpected NULL".into()))
}

fn id_value(expr: &Expr) -> Result<Ulid, SqlError> {
    decode_id(&string_value(expr)?).map_err(|e| SqlError::InvalidValue(e.to_string()))
}

/// RFC 3339 string with any offset, or integer Unix milliseconds.
fn timestamp_value(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return timestamp_value(inner).map(|ms| -ms);
    }
    match extract_value(expr) {
        Some(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| SqlError::InvalidValue(format!("bad timestamp: {n}"))),
        Some(Value::SingleQuotedString(s)) => parse_timestamp(s)
            .or_else(|| s.trim().parse().ok())
            .ok_or_else(|| SqlError::InvalidValue(format!("bad timestamp: {s}"))),
        Some(value) => Err(SqlError::InvalidValue(format!("expected timestamp, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    ReadOnlyColumn(String),
    /// (columns, values)
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    /// Literal of the wrong shape for its column.
    InvalidValue(String),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column {c} cannot be set"),
            SqlError::WrongArity(columns, values) => {
                write!(f, "{columns} columns but {values} values")
            }
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(s) => write!(f, "unsupported filter: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

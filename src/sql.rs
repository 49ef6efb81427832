use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertContent {
        /// Generated when the statement leaves it out.
        id: Option<Ulid>,
        title: String,
        kind: ContentKind,
        default_duration: Option<Secs>,
    },
    UpdateContent {
        id: Ulid,
        title: Option<String>,
        /// `Some(None)` clears the default (`SET duration = NULL`).
        default_duration: Option<Option<Secs>>,
    },
    DeleteContent {
        id: Ulid,
    },
    SelectContents {
        id: Option<Ulid>,
    },
    InsertSchedule {
        content_id: Ulid,
        start: Ms,
        duration: Option<Secs>,
        /// Falls back to the session user.
        owner: Option<String>,
    },
    UpdateSchedule {
        id: Ulid,
        content_id: Ulid,
        start: Ms,
        duration: Option<Secs>,
    },
    SetScheduleActive {
        id: Ulid,
        active: bool,
    },
    DeleteSchedule {
        id: Ulid,
    },
    SelectSchedules {
        filter: ScheduleFilter,
    },
    SelectCurrent {
        /// Defaults to the engine clock.
        at: Option<Ms>,
    },
    SelectNext {
        after: Ulid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFilter {
    All,
    Id(Ulid),
    Content(Ulid),
    /// Active entries overlapping `[start, end)`.
    Window { start: Ms, end: Ms },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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
        } => parse_update(&table_factor_name(&table.relation)?, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column/value pairs of a single-row INSERT, keyed by lowercased column.
struct Row {
    cols: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cols.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }

    /// Present and not NULL.
    fn value(&self, col: &str) -> Option<&Expr> {
        self.get(col).filter(|e| !is_null(e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert)?;

    match table.as_str() {
        "contents" => {
            let id = row.value("id").map(parse_ulid_expr).transpose()?;
            let title = parse_string_expr(row.require("title")?)?;
            let kind = parse_kind(&row)?;
            let default_duration = row.value("duration").map(parse_i64_expr).transpose()?;
            Ok(Command::InsertContent {
                id,
                title,
                kind,
                default_duration,
            })
        }
        "schedules" => Ok(Command::InsertSchedule {
            content_id: parse_ulid_expr(row.require("content_id")?)?,
            start: parse_i64_expr(row.require("start")?)?,
            duration: row.value("duration").map(parse_i64_expr).transpose()?,
            owner: row.value("owner").map(parse_string_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_kind(row: &Row) -> Result<ContentKind, SqlError> {
    let kind = parse_string_expr(row.require("kind")?)?;
    let text = row.value("text").map(parse_string_expr).transpose()?;
    match kind.to_lowercase().as_str() {
        "video" => Ok(ContentKind::Video {
            url: parse_string_expr(row.require("url")?)?,
        }),
        "banner" => Ok(ContentKind::Banner {
            image_url: parse_string_expr(row.require("image_url")?)?,
            text,
        }),
        "text" => Ok(ContentKind::Text {
            text: text.ok_or(SqlError::MissingColumn("text"))?,
        }),
        _ => Err(SqlError::Parse(format!("unknown content kind: {kind}"))),
    }
}

fn parse_update(
    table: &str,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let id = extract_where_id(selection)?;
    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((col, a.value.clone()));
    }
    let set = Row { cols: set };

    match table {
        "contents" => {
            let title = set.get("title").map(parse_string_expr).transpose()?;
            let default_duration = set
                .get("duration")
                .map(|e| {
                    if is_null(e) {
                        Ok(None)
                    } else {
                        parse_i64_expr(e).map(Some)
                    }
                })
                .transpose()?;
            if title.is_none() && default_duration.is_none() {
                return Err(SqlError::MissingColumn("title or duration"));
            }
            Ok(Command::UpdateContent {
                id,
                title,
                default_duration,
            })
        }
        "schedules" => {
            if let Some(active) = set.get("active") {
                if set.cols.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "SET active cannot be combined with other columns".into(),
                    ));
                }
                return Ok(Command::SetScheduleActive {
                    id,
                    active: parse_bool(active)?,
                });
            }
            Ok(Command::UpdateSchedule {
                id,
                content_id: parse_ulid_expr(set.require("content_id")?)?,
                start: parse_i64_expr(set.require("start")?)?,
                duration: set.value("duration").map(parse_i64_expr).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "contents" => Ok(Command::DeleteContent { id }),
        "schedules" => Ok(Command::DeleteSchedule { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` and range comparisons found in a WHERE clause.
#[derive(Default)]
struct Filters {
    eq: Vec<(String, Expr)>,
    gte: Vec<(String, Expr)>,
    lte: Vec<(String, Expr)>,
}

impl Filters {
    fn find<'a>(list: &'a [(String, Expr)], col: &str) -> Option<&'a Expr> {
        list.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }
}

fn collect_filters(expr: &Expr, out: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let list = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => &mut out.eq,
                ast::BinaryOperator::GtEq => &mut out.gte,
                ast::BinaryOperator::LtEq => &mut out.lte,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            list.push((col, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "contents" => Ok(Command::SelectContents {
            id: Filters::find(&filters.eq, "id")
                .map(parse_ulid_expr)
                .transpose()?,
        }),
        "schedules" => {
            let filter = if let Some(id) = Filters::find(&filters.eq, "id") {
                ScheduleFilter::Id(parse_ulid_expr(id)?)
            } else if let Some(cid) = Filters::find(&filters.eq, "content_id") {
                ScheduleFilter::Content(parse_ulid_expr(cid)?)
            } else {
                match (
                    Filters::find(&filters.gte, "start"),
                    Filters::find(&filters.lte, "end"),
                ) {
                    (None, None) => ScheduleFilter::All,
                    (Some(s), Some(e)) => ScheduleFilter::Window {
                        start: parse_i64_expr(s)?,
                        end: parse_i64_expr(e)?,
                    },
                    (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
                    (Some(_), None) => return Err(SqlError::MissingFilter("end")),
                }
            };
            Ok(Command::SelectSchedules { filter })
        }
        "current" => Ok(Command::SelectCurrent {
            at: Filters::find(&filters.eq, "at")
                .map(parse_i64_expr)
                .transpose()?,
        }),
        "next" => Ok(Command::SelectNext {
            after: parse_ulid_expr(
                Filters::find(&filters.eq, "after").ok_or(SqlError::MissingFilter("after"))?,
            )?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
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

/// Pair the single VALUES row with its column list. Columns are required:
/// every optional column is keyed by name.
fn insert_row(insert: &ast::Insert) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let values = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
    }
    let cols = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(values.iter().cloned())
        .collect();
    Ok(Row { cols })
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
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
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
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
    /// Column count, value count.
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(cols, vals) => {
                write!(f, "{cols} columns but {vals} values")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

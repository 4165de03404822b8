use std::collections::HashMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::engine::NewBooking;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProgram {
        key: ProgramKey,
        mode: Mode,
        group_max: u32,
        topology: TopologyKind,
    },
    DeleteProgram {
        key: ProgramKey,
    },
    InsertSlots {
        program: ProgramKey,
        slots: Vec<SlotRef>,
    },
    InsertPatternCells {
        program: ProgramKey,
        cells: Vec<(u32, NaiveTime)>,
    },
    Reserve {
        program: ProgramKey,
        coord: SlotCoord,
        occupancy: OccupancyType,
        user_id: String,
        request_id: Option<String>,
    },
    Release {
        program: ProgramKey,
        coord: SlotCoord,
        occupancy: OccupancyType,
        user_id: String,
    },
    InsertBooking(NewBooking),
    InsertGrant {
        user_id: String,
        program_id: String,
        expires_at: Option<Ms>,
    },
    DeleteGrant {
        user_id: String,
        program_id: String,
    },
    SelectPrograms,
    SelectSlots {
        program: ProgramKey,
    },
    SelectBookings {
        user_id: Option<String>,
        status: Option<BookingStatus>,
    },
    /// `as_of` defaults to today.
    SelectLifecycleTick {
        as_of: Option<NaiveDate>,
    },
    /// `now` defaults to the wall clock.
    SelectSweepExpired {
        now: Option<Ms>,
        secret: Option<String>,
    },
    /// The connection's login user is the subject; a `user_id` filter must name it.
    SelectGrantStatus {
        user_id: Option<String>,
        now: Option<Ms>,
    },
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
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "programs" => {
            let f = single_row(&table, rows)?;
            Ok(Command::InsertProgram {
                key: ProgramKey::new(f.label("catalog")?, f.text("title")?),
                mode: f.label_or("mode", Mode::Online)?,
                group_max: f.opt_u32("group_max")?.unwrap_or(0),
                topology: f.label_or("topology", TopologyKind::Discrete)?,
            })
        }
        "slots" => {
            let program = rows[0].program_key("program")?;
            let mut slots = Vec::with_capacity(rows.len());
            for (i, f) in rows.iter().enumerate() {
                if f.program_key("program")? != program {
                    return Err(SqlError::BadValue(format!("row {i}: all rows must name the same program")));
                }
                slots.push(SlotRef::new(f.date("date")?, f.time("start_time")?, f.time("end_time")?));
            }
            Ok(Command::InsertSlots { program, slots })
        }
        "pattern_cells" => {
            let program = rows[0].program_key("program")?;
            let mut cells = Vec::with_capacity(rows.len());
            for (i, f) in rows.iter().enumerate() {
                if f.program_key("program")? != program {
                    return Err(SqlError::BadValue(format!("row {i}: all rows must name the same program")));
                }
                cells.push((f.u32("row_index")?, f.time("time")?));
            }
            Ok(Command::InsertPatternCells { program, cells })
        }
        "reservations" => {
            let f = single_row(&table, rows)?;
            Ok(Command::Reserve {
                program: f.program_key("program")?,
                coord: f.coord()?,
                occupancy: f.label("occupancy")?,
                user_id: f.text("user_id")?,
                request_id: f.opt_text("request_id")?,
            })
        }
        "bookings" => {
            let f = single_row(&table, rows)?;
            Ok(Command::InsertBooking(f.new_booking()?))
        }
        "grants" => {
            let f = single_row(&table, rows)?;
            Ok(Command::InsertGrant {
                user_id: f.text("user_id")?,
                program_id: f.text("program_id")?,
                expires_at: f.opt_i64("expires_at")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let f = where_fields(delete.selection.as_ref())?;

    match table.as_str() {
        "programs" => Ok(Command::DeleteProgram {
            key: f.program_key("title")?,
        }),
        "reservations" => Ok(Command::Release {
            program: f.program_key("program")?,
            coord: f.coord()?,
            occupancy: f.label("occupancy")?,
            user_id: f.text("user_id")?,
        }),
        "grants" => Ok(Command::DeleteGrant {
            user_id: f.text("user_id")?,
            program_id: f.text("program_id")?,
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
    let f = where_fields(select.selection.as_ref())?;

    match table.as_str() {
        "programs" => Ok(Command::SelectPrograms),
        "slots" => Ok(Command::SelectSlots {
            program: f
                .program_key("program")
                .map_err(|_| SqlError::MissingFilter("catalog and program"))?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            user_id: f.opt_text("user_id")?,
            status: f.opt_label("status")?,
        }),
        "lifecycle_tick" => Ok(Command::SelectLifecycleTick {
            as_of: f.opt_date("as_of")?,
        }),
        "sweep_expired" => Ok(Command::SelectSweepExpired {
            now: f.opt_i64("now")?,
            secret: f.opt_text("secret")?,
        }),
        "grant_status" => Ok(Command::SelectGrantStatus {
            user_id: f.opt_text("user_id")?,
            now: f.opt_i64("now")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Field access ──────────────────────────────────────────────

/// Literal values of one row or WHERE clause, keyed by lowercase column name.
/// `None` is SQL NULL.
#[derive(Debug, Default)]
struct Fields(HashMap<String, Option<String>>);

/// One element of the JSON `slots` column of a booking.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SlotSpec {
    Dated {
        date: NaiveDate,
        start: String,
        end: String,
    },
    Cell {
        row: u32,
        time_index: u32,
    },
}

impl Fields {
    fn opt_text(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        Ok(self.0.get(col).cloned().flatten())
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        self.opt_text(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn has(&self, col: &str) -> bool {
        self.0.get(col).is_some_and(Option::is_some)
    }

    fn opt_parsed<T: FromStr>(&self, col: &'static str, what: &str) -> Result<Option<T>, SqlError>
    where
        T::Err: std::fmt::Display,
    {
        self.opt_text(col)?
            .map(|s| {
                s.trim()
                    .parse()
                    .map_err(|e| SqlError::BadValue(format!("bad {what} in {col}: {e}")))
            })
            .transpose()
    }

    fn opt_u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.opt_parsed(col, "u32")
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        self.opt_u32(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn opt_i64(&self, col: &'static str) -> Result<Option<i64>, SqlError> {
        self.opt_parsed(col, "i64")
    }

    fn opt_label<T: FromStr<Err = ParseLabelError>>(
        &self,
        col: &'static str,
    ) -> Result<Option<T>, SqlError> {
        self.opt_text(col)?
            .map(|s| s.parse().map_err(SqlError::Label))
            .transpose()
    }

    fn label<T: FromStr<Err = ParseLabelError>>(&self, col: &'static str) -> Result<T, SqlError> {
        self.opt_label(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn label_or<T: FromStr<Err = ParseLabelError>>(
        &self,
        col: &'static str,
        default: T,
    ) -> Result<T, SqlError> {
        Ok(self.opt_label(col)?.unwrap_or(default))
    }

    fn opt_date(&self, col: &'static str) -> Result<Option<NaiveDate>, SqlError> {
        self.opt_text(col)?.map(|s| parse_date(&s)).transpose()
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        self.opt_date(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn time(&self, col: &'static str) -> Result<NaiveTime, SqlError> {
        parse_time(&self.text(col)?)
    }

    /// `catalog` plus the title held in `title_col`.
    fn program_key(&self, title_col: &'static str) -> Result<ProgramKey, SqlError> {
        Ok(ProgramKey::new(self.label("catalog")?, self.text(title_col)?))
    }

    /// A dated selector when `date` is present, a pattern cell otherwise.
    fn coord(&self) -> Result<SlotCoord, SqlError> {
        if self.has("date") {
            Ok(SlotCoord::Dated(SlotRef::new(
                self.date("date")?,
                self.time("start_time")?,
                self.time("end_time")?,
            )))
        } else if self.has("row_index") {
            Ok(SlotCoord::Cell {
                row: self.u32("row_index")?,
                time_index: self.u32("time_index")?,
            })
        } else {
            Err(SqlError::MissingColumn("date or row_index"))
        }
    }

    fn new_booking(&self) -> Result<NewBooking, SqlError> {
        let raw = self.text("slots")?;
        let specs: Vec<SlotSpec> =
            serde_json::from_str(&raw).map_err(|e| SqlError::BadValue(format!("bad slots JSON: {e}")))?;
        let slots = specs
            .into_iter()
            .map(|spec| match spec {
                SlotSpec::Dated { date, start, end } => Ok(SlotCoord::Dated(SlotRef::new(
                    date,
                    parse_time(&start)?,
                    parse_time(&end)?,
                ))),
                SlotSpec::Cell { row, time_index } => Ok(SlotCoord::Cell { row, time_index }),
            })
            .collect::<Result<Vec<_>, SqlError>>()?;

        // Dated bookings span their slots unless told otherwise.
        let dates: Vec<NaiveDate> = slots
            .iter()
            .filter_map(|c| match c {
                SlotCoord::Dated(s) => Some(s.date),
                SlotCoord::Cell { .. } => None,
            })
            .collect();
        let start_date = match self.opt_date("start_date")? {
            Some(d) => d,
            None => dates.iter().min().copied().ok_or(SqlError::MissingColumn("start_date"))?,
        };
        let end_date = match self.opt_date("end_date")? {
            Some(d) => d,
            None => dates.iter().max().copied().ok_or(SqlError::MissingColumn("end_date"))?,
        };

        Ok(NewBooking {
            user_id: self.text("user_id")?,
            program: self.program_key("program")?,
            occupancy: self.label("occupancy")?,
            slots,
            min_persons: self.opt_u32("min_persons")?,
            waiting_period_end: self.opt_date("waiting_period_end")?,
            start_date,
            end_date,
            payment_ref: self.opt_text("payment_ref")?,
            amount_cents: self.opt_i64("amount")?,
        })
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::BadValue(format!("bad date {s:?}: {e}")))
}

/// `HH:MM`, or `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<NaiveTime, SqlError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::BadValue(format!("bad time {s:?}: {e}")))
}

fn single_row(table: &str, mut rows: Vec<Fields>) -> Result<Fields, SqlError> {
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    Ok(rows.remove(0))
}

/// Collect `col = literal` terms joined by AND.
fn where_fields(selection: Option<&Expr>) -> Result<Fields, SqlError> {
    let mut fields = Fields::default();
    if let Some(expr) = selection {
        collect_filters(expr, &mut fields)?;
    }
    Ok(fields)
}

fn collect_filters(expr: &Expr, fields: &mut Fields) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, fields),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, fields)?;
                collect_filters(right, fields)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                fields.0.insert(col, literal_text(right)?);
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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

/// Every VALUES row, keyed by the INSERT's column list.
fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Fields>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    rows.iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(SqlError::WrongArity(columns.len(), row.len()));
            }
            let mut fields = Fields::default();
            for (col, expr) in columns.iter().zip(row) {
                fields.0.insert(col.clone(), literal_text(expr)?);
            }
            Ok(fields)
        })
        .collect()
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

/// Render a literal as text; NULL becomes `None`.
fn literal_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            _ => Err(SqlError::Parse(format!("unsupported literal {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(literal_text(expr)?.map(|s| format!("-{s}")))
    } else {
        Err(SqlError::Parse(format!("expected literal, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    /// Expected, got.
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// A literal that does not parse as what its column holds.
    BadValue(String),
    Label(ParseLabelError),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(s) => write!(f, "invalid value: {s}"),
            SqlError::Label(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        parse_time(s).unwrap()
    }

    fn yoga() -> ProgramKey {
        ProgramKey::new(Catalog::Live, "Sunrise Yoga")
    }

    #[test]
    fn parse_insert_program_with_defaults() {
        let cmd = parse_sql("INSERT INTO programs (catalog, title) VALUES ('live', 'Sunrise Yoga')")
            .unwrap();
        assert_eq!(
            cmd,
            Command::InsertProgram {
                key: yoga(),
                mode: Mode::Online,
                group_max: 0,
                topology: TopologyKind::Discrete,
            }
        );
    }

    #[test]
    fn parse_insert_recurring_program() {
        let sql = "INSERT INTO programs (catalog, title, mode, group_max, topology) \
                   VALUES ('guide', 'Breathwork', 'offline', 8, 'recurring')";
        match parse_sql(sql).unwrap() {
            Command::InsertProgram {
                key,
                mode,
                group_max,
                topology,
            } => {
                assert_eq!(key.catalog, Catalog::Guide);
                assert_eq!(mode, Mode::Offline);
                assert_eq!(group_max, 8);
                assert_eq!(topology, TopologyKind::Recurring);
            }
            other => panic!("expected InsertProgram, got {other:?}"),
        }
    }

    #[test]
    fn parse_multi_row_slots() {
        let sql = "INSERT INTO slots (catalog, program, date, start_time, end_time) VALUES \
                   ('live', 'Sunrise Yoga', '2025-01-10', '07:00', '08:00'), \
                   ('live', 'Sunrise Yoga', '2025-01-10', '09:00:00', '10:00')";
        match parse_sql(sql).unwrap() {
            Command::InsertSlots { program, slots } => {
                assert_eq!(program, yoga());
                assert_eq!(slots.len(), 2);
                assert_eq!(slots[1].start, t("09:00"));
            }
            other => panic!("expected InsertSlots, got {other:?}"),
        }
    }

    #[test]
    fn slots_rows_must_share_program() {
        let sql = "INSERT INTO slots (catalog, program, date, start_time, end_time) VALUES \
                   ('live', 'A', '2025-01-10', '07:00', '08:00'), \
                   ('live', 'B', '2025-01-10', '09:00', '10:00')";
        assert!(matches!(parse_sql(sql), Err(SqlError::BadValue(_))));
    }

    #[test]
    fn parse_pattern_cells() {
        let sql = "INSERT INTO pattern_cells (catalog, program, row_index, time) VALUES \
                   ('guide', 'Breathwork', 0, '09:00'), ('guide', 'Breathwork', 3, '18:30')";
        match parse_sql(sql).unwrap() {
            Command::InsertPatternCells { cells, .. } => {
                assert_eq!(cells, vec![(0, t("09:00")), (3, t("18:30"))]);
            }
            other => panic!("expected InsertPatternCells, got {other:?}"),
        }
    }

    #[test]
    fn parse_dated_reservation() {
        let sql = "INSERT INTO reservations (catalog, program, date, start_time, end_time, occupancy, user_id) \
                   VALUES ('live', 'Sunrise Yoga', '2025-01-10', '07:00', '08:00', 'couple', 'userA')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::Reserve {
                program: yoga(),
                coord: SlotCoord::Dated(SlotRef::new(d("2025-01-10"), t("07:00"), t("08:00"))),
                occupancy: OccupancyType::Couple,
                user_id: "userA".into(),
                request_id: None,
            }
        );
    }

    #[test]
    fn parse_cell_reservation_with_request_id() {
        let sql = "INSERT INTO reservations (catalog, program, row_index, time_index, occupancy, user_id, request_id) \
                   VALUES ('guide', 'Breathwork', 2, 1, 'group', 'u', 'req-9')";
        match parse_sql(sql).unwrap() {
            Command::Reserve {
                coord, request_id, ..
            } => {
                assert_eq!(coord, SlotCoord::Cell { row: 2, time_index: 1 });
                assert_eq!(request_id.as_deref(), Some("req-9"));
            }
            other => panic!("expected Reserve, got {other:?}"),
        }
    }

    #[test]
    fn reservation_rejects_unknown_occupancy() {
        let sql = "INSERT INTO reservations (catalog, program, date, start_time, end_time, occupancy, user_id) \
                   VALUES ('live', 'Sunrise Yoga', '2025-01-10', '07:00', '08:00', 'trio', 'u')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Label(_))));
    }

    #[test]
    fn reservation_needs_a_selector() {
        let sql = "INSERT INTO reservations (catalog, program, occupancy, user_id) \
                   VALUES ('live', 'Sunrise Yoga', 'couple', 'u')";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn(_))));
    }

    #[test]
    fn parse_release() {
        let sql = "DELETE FROM reservations WHERE catalog = 'live' AND program = 'Sunrise Yoga' \
                   AND date = '2025-01-10' AND start_time = '07:00' AND end_time = '08:00' \
                   AND occupancy = 'couple' AND user_id = 'userA'";
        match parse_sql(sql).unwrap() {
            Command::Release {
                program,
                occupancy,
                user_id,
                ..
            } => {
                assert_eq!(program, yoga());
                assert_eq!(occupancy, OccupancyType::Couple);
                assert_eq!(user_id, "userA");
            }
            other => panic!("expected Release, got {other:?}"),
        }
    }

    #[test]
    fn parse_group_booking() {
        let sql = r#"INSERT INTO bookings (user_id, catalog, program, occupancy, slots, min_persons, waiting_period_end, payment_ref, amount)
                     VALUES ('u', 'live', 'Sunrise Yoga', 'group',
                             '[{"date":"2025-01-10","start":"07:00","end":"08:00"},{"date":"2025-01-12","start":"07:00","end":"08:00"}]',
                             3, '2025-01-05', 'pay_1', 2500)"#;
        match parse_sql(sql).unwrap() {
            Command::InsertBooking(b) => {
                assert_eq!(b.slots.len(), 2);
                assert_eq!(b.min_persons, Some(3));
                assert_eq!(b.waiting_period_end, Some(d("2025-01-05")));
                assert_eq!(b.start_date, d("2025-01-10"));
                assert_eq!(b.end_date, d("2025-01-12"));
                assert_eq!(b.amount_cents, Some(2500));
                assert_eq!(b.payment_ref.as_deref(), Some("pay_1"));
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn cell_booking_needs_explicit_dates() {
        let sql = r#"INSERT INTO bookings (user_id, catalog, program, occupancy, slots)
                     VALUES ('u', 'guide', 'Breathwork', 'individual', '[{"row":0,"time_index":1}]')"#;
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::MissingColumn("start_date"))
        ));
    }

    #[test]
    fn parse_grants() {
        let cmd = parse_sql(
            "INSERT INTO grants (user_id, program_id, expires_at) VALUES ('u', 'yoga-101', 1700000000000)",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::InsertGrant {
                user_id: "u".into(),
                program_id: "yoga-101".into(),
                expires_at: Some(1_700_000_000_000),
            }
        );
        let cmd = parse_sql("INSERT INTO grants (user_id, program_id, expires_at) VALUES ('u', 'p', NULL)")
            .unwrap();
        assert!(matches!(cmd, Command::InsertGrant { expires_at: None, .. }));
    }

    #[test]
    fn parse_selects() {
        assert_eq!(parse_sql("SELECT * FROM programs").unwrap(), Command::SelectPrograms);
        assert_eq!(
            parse_sql("SELECT * FROM bookings WHERE user_id = 'u' AND status = 'waiting'").unwrap(),
            Command::SelectBookings {
                user_id: Some("u".into()),
                status: Some(BookingStatus::Waiting),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM lifecycle_tick WHERE as_of = '2025-01-05'").unwrap(),
            Command::SelectLifecycleTick {
                as_of: Some(d("2025-01-05"))
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM sweep_expired WHERE secret = 's3cret'").unwrap(),
            Command::SelectSweepExpired {
                now: None,
                secret: Some("s3cret".into())
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM grant_status").unwrap(),
            Command::SelectGrantStatus {
                user_id: None,
                now: None
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE catalog = 'live'"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn negative_numbers_and_unknown_tables() {
        let cmd = parse_sql("INSERT INTO grants (user_id, program_id, expires_at) VALUES ('u', 'p', -5)")
            .unwrap();
        assert!(matches!(cmd, Command::InsertGrant { expires_at: Some(-5), .. }));
        assert!(matches!(
            parse_sql("SELECT * FROM nope"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO programs VALUES ('live', 'x')"),
            Err(SqlError::Parse(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO programs (catalog, title) VALUES ('live')"),
            Err(SqlError::WrongArity(2, 1))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE created_at > 5"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn malformed_values_are_bad_values() {
        assert!(matches!(
            parse_sql("SELECT * FROM lifecycle_tick WHERE as_of = '2025-13-01'"),
            Err(SqlError::BadValue(_))
        ));
        let sql = "INSERT INTO slots (catalog, program, date, start_time, end_time) VALUES \
                   ('live', 'A', '2025-01-10', '25:00', '26:00')";
        assert!(matches!(parse_sql(sql), Err(SqlError::BadValue(_))));
        assert!(matches!(
            parse_sql("INSERT INTO programs (catalog, title, group_max) VALUES ('live', 'A', 'six')"),
            Err(SqlError::BadValue(_))
        ));
        let sql = "INSERT INTO bookings (user_id, catalog, program, occupancy, slots) \
                   VALUES ('u', 'live', 'A', 'group', 'not json')";
        assert!(matches!(parse_sql(sql), Err(SqlError::BadValue(_))));
    }
}

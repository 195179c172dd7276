//! Postgres-protocol query engine.
//!
//! Each connection owns a current-thread tokio runtime and blocks on it, so the
//! driver fits the synchronous [`SqlStatement`] contract used by worker threads.

use crate::driver::{Driver, DriverError, RowSink, SqlConnection, SqlStatement, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::{StreamExt, pin_mut};
use std::error::Error;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, Config, NoTls, Row};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type DecodeError = Box<dyn Error + Sync + Send>;

pub struct PgDriver;

impl Driver for PgDriver {
    fn connect(
        &self,
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<Box<dyn SqlConnection>, DriverError> {
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        let mut config =
            Config::from_str(url).map_err(|err| DriverError::Connect(format!("invalid url: {err}")))?;
        config.connect_timeout(CONNECT_TIMEOUT);
        if !user.is_empty() {
            config.user(user);
        }
        if !password.is_empty() {
            config.password(password);
        }
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| DriverError::Connect(err.to_string()))?;
        let (client, connection) = runtime
            .block_on(config.connect(NoTls))
            .map_err(|err| DriverError::Connect(err.to_string()))?;
        runtime.spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(error = %err, "postgres connection closed with error");
            }
        });
        Ok(Box::new(PgConn { runtime, client }))
    }
}

pub struct PgConn {
    runtime: Runtime,
    client: Client,
}

impl SqlConnection for PgConn {
    fn create_statement(&mut self) -> Result<Box<dyn SqlStatement + '_>, DriverError> {
        Ok(Box::new(PgStatement {
            conn: self,
            timeout: None,
        }))
    }
}

struct PgStatement<'c> {
    conn: &'c PgConn,
    timeout: Option<Duration>,
}

impl PgStatement<'_> {
    fn apply_timeout(&self) -> Result<(), DriverError> {
        let millis = self.timeout.map(|limit| limit.as_millis()).unwrap_or(0);
        let sql = format!("SET statement_timeout = {millis}");
        self.conn
            .runtime
            .block_on(self.conn.client.batch_execute(&sql))
            .map_err(sql_error)
    }
}

impl SqlStatement for PgStatement<'_> {
    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self.apply_timeout()
    }

    fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.conn
            .runtime
            .block_on(self.conn.client.batch_execute(sql))
            .map_err(sql_error)
    }

    fn execute_query(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<(), DriverError> {
        let PgConn { runtime, client } = self.conn;
        let statement = runtime.block_on(client.prepare(sql)).map_err(sql_error)?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        if sink.columns(&columns).is_break() {
            return Ok(());
        }
        let stream = runtime
            .block_on(client.query_raw(&statement, Vec::<String>::new()))
            .map_err(sql_error)?;
        pin_mut!(stream);
        while let Some(row) = runtime.block_on(stream.next()) {
            let row = row.map_err(sql_error)?;
            let values = (0..columns.len())
                .map(|idx| decode_column(&row, idx))
                .collect::<Result<Vec<_>, _>>()?;
            if sink.row(values).is_break() {
                break;
            }
        }
        Ok(())
    }
}

/// Borrows a column's binary wire value whatever its type, so no column can
/// fail the fetch for lack of a typed decoder.
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        Ok(RawValue(raw))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode_column(row: &Row, idx: usize) -> Result<Value, DriverError> {
    let column = &row.columns()[idx];
    match row.try_get::<_, Option<RawValue>>(idx).map_err(sql_error)? {
        None => Ok(Value::Null),
        Some(RawValue(raw)) => decode_binary(column.type_(), raw).map_err(|err| {
            DriverError::Sql(format!(
                "cannot decode column {} of type {}: {err}",
                column.name(),
                column.type_()
            ))
        }),
    }
}

fn text(value: impl ToString) -> Value {
    Value::Text(value.to_string())
}

/// Integers, floats and booleans stay typed; every other type is rendered
/// in the text form the server itself would print.
fn decode_binary(ty: &Type, raw: &[u8]) -> Result<Value, DecodeError> {
    let value = match *ty {
        Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
        Type::INT2 => Value::Long(i16::from_sql(ty, raw)?.into()),
        Type::INT4 => Value::Long(i32::from_sql(ty, raw)?.into()),
        Type::INT8 => Value::Long(i64::from_sql(ty, raw)?),
        Type::OID => Value::Long(u32::from_sql(ty, raw)?.into()),
        Type::FLOAT4 => Value::Double(f32::from_sql(ty, raw)?.into()),
        Type::FLOAT8 => Value::Double(f64::from_sql(ty, raw)?),
        Type::TIMESTAMP => text(NaiveDateTime::from_sql(ty, raw)?),
        Type::TIMESTAMPTZ => text(DateTime::<Utc>::from_sql(ty, raw)?),
        Type::DATE => text(NaiveDate::from_sql(ty, raw)?),
        Type::TIME => text(NaiveTime::from_sql(ty, raw)?),
        Type::JSON | Type::JSONB => text(serde_json::Value::from_sql(ty, raw)?),
        Type::UUID => text(uuid::Uuid::from_sql(ty, raw)?),
        Type::NUMERIC => Value::Text(numeric_text(raw)?),
        Type::BYTEA => Value::Text(hex_text(raw)),
        Type::INTERVAL => Value::Text(interval_text(raw)?),
        Type::MONEY => Value::Text(money_text(i64::from_sql(ty, raw)?)),
        Type::INET | Type::CIDR => Value::Text(inet_text(raw)?),
        Type::CHAR => text(char::from(i8::from_sql(ty, raw)?.to_ne_bytes()[0])),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN | Type::XML => {
            text(std::str::from_utf8(raw)?)
        }
        _ => match ty.kind() {
            Kind::Domain(base) => return decode_binary(base, raw),
            Kind::Array(element) => Value::Text(array_text(element, raw)?),
            Kind::Enum(_) => text(std::str::from_utf8(raw)?),
            _ if ty.name() == "citext" => text(std::str::from_utf8(raw)?),
            _ => Value::Text(hex_text(raw)),
        },
    };
    Ok(value)
}

fn take<'a, const N: usize>(raw: &mut &'a [u8]) -> Result<[u8; N], DecodeError> {
    let data: &'a [u8] = *raw;
    let (head, rest) = data.split_first_chunk::<N>().ok_or("value truncated")?;
    *raw = rest;
    Ok(*head)
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Base-10000 digits with a weight and a display scale.
fn numeric_text(mut raw: &[u8]) -> Result<String, DecodeError> {
    let ndigits = i16::from_be_bytes(take(&mut raw)?);
    let weight = i32::from(i16::from_be_bytes(take(&mut raw)?));
    let sign = u16::from_be_bytes(take(&mut raw)?);
    let dscale = usize::from(u16::from_be_bytes(take(&mut raw)?));
    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid numeric sign {other:#06x}").into()),
    }
    let digits = (0..ndigits.max(0))
        .map(|_| take(&mut raw).map(i16::from_be_bytes))
        .collect::<Result<Vec<_>, _>>()?;
    let digit = |index: i32| {
        usize::try_from(index)
            .ok()
            .and_then(|index| digits.get(index))
            .copied()
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for index in 1..=weight {
            out.push_str(&format!("{:04}", digit(index)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut index = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(index)));
            index += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

fn hex_text(raw: &[u8]) -> String {
    let mut out = String::with_capacity(2 + raw.len() * 2);
    out.push_str("\\x");
    for byte in raw {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn interval_text(mut raw: &[u8]) -> Result<String, DecodeError> {
    let micros = i64::from_be_bytes(take(&mut raw)?);
    let days = i32::from_be_bytes(take(&mut raw)?);
    let months = i32::from_be_bytes(take(&mut raw)?);
    let mut parts = Vec::new();
    for (count, unit) in [(months / 12, "year"), (months % 12, "mon"), (days, "day")] {
        if count != 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {unit}{plural}"));
        }
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let micros = micros.unsigned_abs();
        let secs = micros / 1_000_000;
        let mut clock = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let fraction = micros % 1_000_000;
        if fraction != 0 {
            clock.push('.');
            clock.push_str(format!("{fraction:06}").trim_end_matches('0'));
        }
        parts.push(clock);
    }
    Ok(parts.join(" "))
}

fn money_text(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

fn inet_text(mut raw: &[u8]) -> Result<String, DecodeError> {
    let [family, bits, is_cidr, len] = take::<4>(&mut raw)?;
    let (addr, full) = match (family, len) {
        (PGSQL_AF_INET, 4) => (IpAddr::from(take::<4>(&mut raw)?), 32),
        (PGSQL_AF_INET6, 16) => (IpAddr::from(take::<16>(&mut raw)?), 128),
        _ => return Err(format!("invalid inet family {family} with {len} address bytes").into()),
    };
    Ok(if is_cidr != 0 || bits != full {
        format!("{addr}/{bits}")
    } else {
        addr.to_string()
    })
}

/// Renders `{a,b}` literals, nesting one brace level per dimension.
fn array_text(element: &Type, mut raw: &[u8]) -> Result<String, DecodeError> {
    let ndim = i32::from_be_bytes(take(&mut raw)?);
    let _has_nulls = take::<4>(&mut raw)?;
    let _element_oid = take::<4>(&mut raw)?;
    let mut dims = Vec::new();
    for _ in 0..ndim.max(0) {
        dims.push(usize::try_from(i32::from_be_bytes(take(&mut raw)?))?);
        let _lower_bound = take::<4>(&mut raw)?;
    }
    if dims.is_empty() {
        return Ok("{}".to_string());
    }
    let mut out = String::new();
    array_level(element, &dims, &mut raw, &mut out)?;
    Ok(out)
}

fn array_level<'a>(
    element: &Type,
    dims: &[usize],
    raw: &mut &'a [u8],
    out: &mut String,
) -> Result<(), DecodeError> {
    out.push('{');
    for index in 0..dims[0] {
        if index > 0 {
            out.push(',');
        }
        if dims.len() > 1 {
            array_level(element, &dims[1..], raw, out)?;
            continue;
        }
        let len = i32::from_be_bytes(take(raw)?);
        if len < 0 {
            out.push_str("NULL");
            continue;
        }
        let data: &'a [u8] = *raw;
        let len = usize::try_from(len)?;
        if data.len() < len {
            return Err("array element truncated".into());
        }
        let (bytes, rest) = data.split_at(len);
        *raw = rest;
        let rendered = decode_binary(element, bytes)?.render().unwrap_or_default();
        push_array_element(out, &rendered);
    }
    out.push('}');
    Ok(())
}

fn push_array_element(out: &mut String, element: &str) {
    let quoted = element.is_empty()
        || element.eq_ignore_ascii_case("null")
        || element
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if !quoted {
        out.push_str(element);
        return;
    }
    out.push('"');
    for c in element.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

fn sql_error(err: tokio_postgres::Error) -> DriverError {
    match err.as_db_error() {
        Some(db) => DriverError::Sql(format!("{}: {}", db.code().code(), db.message())),
        None => DriverError::Sql(err.to_string()),
    }
}

//! PostgreSQL backend over a plain `sqlx` connection.
//!
//! Pooling is done by the `pool` crate, so this module only opens single
//! `PgConnection`s and translates between JSON values and Postgres types.
//!
//! Parameters are sent in binary, so each JSON value is encoded as the type
//! the server infers for its placeholder: `"2024-01-15"` bound against a
//! `DATE` column goes out as a date, not as text.

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::{Column, Connection, Either, Executor as _, Postgres, Row as _, Statement as _, TypeInfo};
use tracing::debug;

use crate::{Backend, BackendError, QueryResult, Row, Session};

/// Opens sessions against one PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgBackend {
    options: PgConnectOptions,
}

impl PgBackend {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    /// Build connect options from discrete address and credential parts.
    pub fn from_parts(host: &str, port: u16, user: &str, password: &str, database: &str) -> Self {
        Self::new(
            PgConnectOptions::new()
                .host(host)
                .port(port)
                .username(user)
                .password(password)
                .database(database),
        )
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn connect(&self) -> Result<Box<dyn Session>, BackendError> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        debug!(
            "opened postgres session to {}:{}",
            self.options.get_host(),
            self.options.get_port()
        );
        Ok(Box::new(PgSession { conn }))
    }
}

/// SQLSTATE for a placeholder whose type the server cannot infer.
const INDETERMINATE_DATATYPE: &str = "42P18";
/// SQLSTATE for a value that does not parse as the target type.
const INVALID_TEXT_REPRESENTATION: &str = "22P02";

struct PgSession {
    conn: PgConnection,
}

impl PgSession {
    /// Parameter types as the server infers them from `statement`.
    ///
    /// The prepared statement is cached on the connection, so the query that
    /// follows reuses it.  Empty when there are no parameters or the server
    /// cannot type them; values are then bound by their JSON kind.
    async fn parameter_types(
        &mut self,
        statement: &str,
        count: usize,
    ) -> Result<Vec<PgTypeInfo>, BackendError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        match (&mut self.conn).prepare(statement).await {
            Ok(prepared) => Ok(match prepared.parameters() {
                Some(Either::Left(types)) => types.to_vec(),
                _ => Vec::new(),
            }),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(INDETERMINATE_DATATYPE) =>
            {
                debug!("server could not type the parameters, binding by JSON kind");
                Ok(Vec::new())
            }
            Err(err) => Err(map_error(err)),
        }
    }
}

#[async_trait]
impl Session for PgSession {
    async fn query(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<QueryResult, BackendError> {
        let types = self.parameter_types(statement, params.len()).await?;
        let mut query = sqlx::query(statement);
        for (i, value) in params.iter().enumerate() {
            let param = PgParam::coerce(value, types.get(i).map(|t| t.name()))
                .map_err(|message| BackendError::Statement {
                    code: Some(INVALID_TEXT_REPRESENTATION.to_owned()),
                    message: format!("parameter ${}: {message}", i + 1),
                })?;
            query = param.bind(query);
        }

        let mut rows: Vec<Row> = Vec::new();
        let mut affected = 0u64;

        // `fetch_many` is the only single-round-trip way to get both the rows
        // and the command tag count.
        #[allow(deprecated)]
        let mut stream = query.fetch_many(&mut self.conn);
        while let Some(step) = stream.try_next().await.map_err(map_error)? {
            match step {
                Either::Left(done) => affected += done.rows_affected(),
                Either::Right(row) => rows.push(decode_row(&row)?),
            }
        }

        let row_count = affected.max(rows.len() as u64);
        Ok(QueryResult { rows, row_count })
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.conn
            .ping()
            .await
            .map_err(|e| BackendError::ConnectionLost(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), BackendError> {
        let PgSession { conn } = *self;
        conn.close()
            .await
            .map_err(|e| BackendError::ConnectionLost(e.to_string()))
    }
}

/// One parameter, converted to the Postgres type it is sent as.
#[derive(Debug, Clone, PartialEq)]
enum PgParam {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(Value),
    Text(String),
}

impl PgParam {
    /// Convert `value` for a placeholder the server typed as `type_name`.
    ///
    /// With no type, or a type not listed here, the JSON kind decides:
    /// integers as `INT8`, other numbers as `FLOAT8`, strings as `TEXT`,
    /// arrays and objects as `JSONB`.
    fn coerce(value: &Value, type_name: Option<&str>) -> Result<Self, String> {
        if value.is_null() {
            return Ok(Self::Null);
        }
        let Some(type_name) = type_name else {
            return Ok(Self::from_json(value));
        };
        let converted = match type_name {
            "BOOL" => value
                .as_bool()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .map(Self::Bool),
            "INT2" => integer(value).and_then(|i| i16::try_from(i).ok()).map(Self::Int2),
            "INT4" => integer(value).and_then(|i| i32::try_from(i).ok()).map(Self::Int4),
            "INT8" => integer(value).map(Self::Int8),
            "FLOAT4" => float(value).map(|f| Self::Float4(f as f32)),
            "FLOAT8" => float(value).map(Self::Float8),
            "NUMERIC" => decimal(value).map(Self::Numeric),
            "DATE" => value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .map(Self::Date),
            "TIME" => value.as_str().and_then(|s| s.parse().ok()).map(Self::Time),
            "TIMESTAMP" => value.as_str().and_then(timestamp).map(Self::Timestamp),
            "TIMESTAMPTZ" => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| Self::TimestampTz(t.with_timezone(&Utc))),
            "UUID" => value.as_str().and_then(|s| s.parse().ok()).map(Self::Uuid),
            "JSON" | "JSONB" => Some(Self::Json(value.clone())),
            "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "UNKNOWN" => Some(Self::Text(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            _ => Some(Self::from_json(value)),
        };
        converted.ok_or_else(|| format!("cannot bind {value} as {type_name}"))
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int8(i),
                None => Self::Float8(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    fn bind<'q>(self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Bool(v) => query.bind(v),
            Self::Int2(v) => query.bind(v),
            Self::Int4(v) => query.bind(v),
            Self::Int8(v) => query.bind(v),
            Self::Float4(v) => query.bind(v),
            Self::Float8(v) => query.bind(v),
            Self::Numeric(v) => query.bind(v),
            Self::Date(v) => query.bind(v),
            Self::Time(v) => query.bind(v),
            Self::Timestamp(v) => query.bind(v),
            Self::TimestampTz(v) => query.bind(v),
            Self::Uuid(v) => query.bind(v),
            Self::Json(v) => query.bind(sqlx::types::Json(v)),
            Self::Text(v) => query.bind(v),
        }
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_owned(),
        _ => return None,
    };
    text.parse()
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn timestamp(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

fn map_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db) => BackendError::Statement {
            code: db.code().map(|c| c.into_owned()),
            message: db.message().to_owned(),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => BackendError::ConnectionLost(err.to_string()),
        other => BackendError::statement(other.to_string()),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, BackendError> {
    let mut out = Map::new();
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name()).map_err(|_| {
            BackendError::Decode {
                column: column.name().to_owned(),
                type_name: column.type_info().name().to_owned(),
            }
        })?;
        out.insert(column.name().to_owned(), value);
    }
    Ok(out)
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Result<Option<T>, sqlx::Error>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => get::<bool>(row, idx)?.map(Value::from),
        "INT2" => get::<i16>(row, idx)?.map(Value::from),
        "INT4" => get::<i32>(row, idx)?.map(Value::from),
        "INT8" => get::<i64>(row, idx)?.map(Value::from),
        "FLOAT4" => get::<f32>(row, idx)?.map(Value::from),
        "FLOAT8" => get::<f64>(row, idx)?.map(Value::from),
        "NUMERIC" => get::<Decimal>(row, idx)?
            .and_then(|d| d.to_f64())
            .map(Value::from),
        "DATE" => get::<NaiveDate>(row, idx)?.map(|d| Value::from(d.to_string())),
        "TIME" => get::<NaiveTime>(row, idx)?.map(|t| Value::from(t.to_string())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx)?
            .map(|t| Value::from(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx)?
            .map(|t| Value::from(t.to_rfc3339())),
        "JSON" | "JSONB" => get::<Value>(row, idx)?,
        "UUID" => get::<uuid::Uuid>(row, idx)?.map(|u| Value::from(u.to_string())),
        "VOID" => None,
        _ => get::<String>(row, idx)?.map(Value::from),
    };
    Ok(value.unwrap_or(Value::Null))
}

// ABOUTME: PostgreSQL store: replace/insert/upsert writes, pending reads and push outcome marking
// ABOUTME: Values are bound as text and cast to each column's introspected type

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Transaction};
use tracing::{debug, error, info, warn};

use super::cache::{placeholder, TableInfo, TypeCastCache};
use super::fallback::{with_savepoint_fallback, BatchOutcome, SavepointApply};
use super::{SourceStore, TargetSink, WriteOutcome, WriteRequest};
use crate::config::{MarkTarget, WriteMode};
use crate::error::{clip, SyncError, REASON_CLIP};
use crate::filter::TimeRange;
use crate::ident;
use crate::mapper::Row;

/// PostgreSQL's bind parameter limit per statement.
const MAX_PARAMS: usize = 65_535;

const COLUMNS_SQL: &str = "SELECT a.attname::text, format_type(a.atttypid, NULL) \
     FROM pg_attribute a \
     WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";

const PRIMARY_KEY_SQL: &str = "SELECT a.attname::text \
     FROM pg_index i \
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
     WHERE i.indrelid = to_regclass($1) AND i.indisprimary \
     ORDER BY array_position(i.indkey::int2[], a.attnum)";

pub struct PgStore {
    client: Mutex<Client>,
    cache: TypeCastCache,
    statement_timeout: Duration,
}

/// Connect honouring the URL's `sslmode`; `prefer` falls back to plain TCP.
pub async fn connect_client(url: &str) -> Result<Client> {
    let config = url
        .parse::<Config>()
        .context("Invalid PostgreSQL connection string")?;

    match config.get_ssl_mode() {
        SslMode::Disable => connect_without_tls(config).await,
        SslMode::Prefer => match connect_with_tls(config.clone()).await {
            Ok(client) => Ok(client),
            Err(error) => {
                warn!(error = %format!("{:#}", error), "PostgreSQL TLS handshake failed, retrying without TLS");
                connect_without_tls(config).await
            }
        },
        _ => connect_with_tls(config).await,
    }
}

async fn connect_with_tls(config: Config) -> Result<Client> {
    let connector = TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);
    let (client, connection) = config
        .connect(tls)
        .await
        .context("Failed to connect to PostgreSQL over TLS")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "PostgreSQL connection error");
        }
    });
    Ok(client)
}

async fn connect_without_tls(config: Config) -> Result<Client> {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .context("Failed to connect to PostgreSQL")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "PostgreSQL connection error");
        }
    });
    Ok(client)
}

/// Render a JSON value as the text parameter Postgres will cast.
pub fn to_param(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Introspected type for every column, failing on columns the table lacks.
pub(crate) fn column_casts(info: &TableInfo, columns: &[String], table: &str) -> Result<Vec<String>> {
    columns
        .iter()
        .map(|col| {
            info.column_type(col)
                .map(str::to_string)
                .ok_or_else(|| {
                    anyhow::Error::from(SyncError::config(format!(
                        "column '{}' does not exist in table '{}'",
                        col, table
                    )))
                })
        })
        .collect()
}

pub(crate) fn rows_per_statement(batch_size: usize, width: usize) -> usize {
    (MAX_PARAMS / width.max(1)).min(batch_size).max(1)
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| ident::quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn values_list(types: &[String], rows: usize, first_param: usize) -> String {
    let mut n = first_param;
    (0..rows)
        .map(|_| {
            let row = types
                .iter()
                .map(|ty| {
                    let p = placeholder(n, Some(ty));
                    n += 1;
                    p
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", row)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn insert_sql(
    table: &str,
    columns: &[String],
    types: &[String],
    rows: usize,
    conflict: Option<&str>,
) -> String {
    format!(
        "INSERT INTO {} AS tgt ({}) VALUES {}{}",
        table,
        column_list(columns),
        values_list(types, rows, 1),
        conflict.unwrap_or("")
    )
}

/// `ON CONFLICT` clause that skips updates when no non-key column changed.
pub(crate) fn upsert_clause(columns: &[String], key: &[String]) -> String {
    let non_key: Vec<&String> = columns.iter().filter(|c| !key.contains(c)).collect();
    let conflict = column_list(key);
    if non_key.is_empty() {
        return format!(" ON CONFLICT ({}) DO NOTHING", conflict);
    }
    let set = non_key
        .iter()
        .map(|c| format!("{0} = EXCLUDED.{0}", ident::quote(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let current = non_key
        .iter()
        .map(|c| format!("tgt.{}", ident::quote(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let incoming = non_key
        .iter()
        .map(|c| format!("EXCLUDED.{}", ident::quote(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {} WHERE ({}) IS DISTINCT FROM ({})",
        conflict, set, current, incoming
    )
}

/// `UPDATE ... FROM (VALUES ...)` matching rows by primary key tuple.
/// `$1` is the status, `$2` the message, key values follow.
pub(crate) fn mark_sql(table: &str, mark: &MarkTarget, pk_types: &[String], rows: usize, sent: bool) -> String {
    let sent_at = match (&mark.sent_at_column, sent) {
        (Some(col), true) => format!(", {} = now()", ident::quote(col)),
        _ => String::new(),
    };
    let join = mark
        .pk
        .iter()
        .map(|c| format!("tgt.{0} = v.{0}", ident::quote(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "UPDATE {} AS tgt SET {} = $1::text, {} = $2::text{} FROM (VALUES {}) AS v({}) WHERE {}",
        table,
        ident::quote(&mark.status_column),
        ident::quote(&mark.message_column),
        sent_at,
        values_list(pk_types, rows, 3),
        column_list(&mark.pk),
        join
    )
}

fn pk_snapshot(rows: &[&Row], pk: &[String]) -> String {
    let keys: Vec<Value> = rows
        .iter()
        .map(|row| Value::Array(pk.iter().map(|k| row.get(k).cloned().unwrap_or(Value::Null)).collect()))
        .collect();
    Value::Array(keys).to_string()
}

fn as_refs(params: &[Option<String>]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

pub(crate) fn wrap_pending_sql(sql: &str) -> String {
    format!(
        "SELECT row_to_json(src) FROM ({}) AS src",
        sql.trim().trim_end_matches(';')
    )
}

struct TxApplier<'a, 't> {
    tx: &'a Transaction<'t>,
    table: &'a str,
    columns: &'a [String],
    types: &'a [String],
    conflict: Option<&'a str>,
}

#[async_trait]
impl<'a, 't> SavepointApply for TxApplier<'a, 't> {
    async fn apply(&mut self, rows: &[Vec<Value>]) -> Result<()> {
        let sql = insert_sql(self.table, self.columns, self.types, rows.len(), self.conflict);
        let params: Vec<Option<String>> = rows.iter().flat_map(|r| r.iter().map(to_param)).collect();
        self.tx
            .execute(sql.as_str(), &as_refs(&params))
            .await
            .with_context(|| format!("INSERT into {} failed", self.table))?;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.tx.batch_execute(&format!("SAVEPOINT {}", name)).await?;
        Ok(())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.tx
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await?;
        Ok(())
    }

    async fn release(&mut self, name: &str) -> Result<()> {
        self.tx
            .batch_execute(&format!("RELEASE SAVEPOINT {}", name))
            .await?;
        Ok(())
    }
}

impl PgStore {
    pub async fn connect(url: &str, cache: TypeCastCache, statement_timeout: Duration) -> Result<Self> {
        let client = connect_client(url).await?;
        Ok(Self::with_client(client, cache, statement_timeout))
    }

    pub fn with_client(client: Client, cache: TypeCastCache, statement_timeout: Duration) -> Self {
        Self {
            client: Mutex::new(client),
            cache,
            statement_timeout,
        }
    }

    pub fn cache(&self) -> &TypeCastCache {
        &self.cache
    }

    async fn table_info(&self, client: &Client, schema: &str, table: &str) -> Result<Arc<TableInfo>> {
        if let Some(info) = self.cache.get(schema, table) {
            return Ok(info);
        }

        let regclass = ident::qualified(schema, table);
        let rows = client
            .query(COLUMNS_SQL, &[&regclass])
            .await
            .with_context(|| format!("Failed to introspect columns of {}", regclass))?;
        if rows.is_empty() {
            bail!("Table {} does not exist or has no columns", regclass);
        }
        let columns = rows
            .iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect();

        let primary_key = client
            .query(PRIMARY_KEY_SQL, &[&regclass])
            .await
            .with_context(|| format!("Failed to introspect primary key of {}", regclass))?
            .iter()
            .map(|r| r.get::<_, String>(0))
            .collect::<Vec<_>>();

        debug!(table = %regclass, pk = ?primary_key, "Cached table types");
        Ok(self.cache.insert(
            schema,
            table,
            TableInfo {
                columns,
                primary_key,
            },
        ))
    }

    async fn mark(
        &self,
        rows: &[&Row],
        status: &str,
        message: Option<&str>,
        mark: &MarkTarget,
        sent: bool,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut client = self.client.lock().await;
        let info = self.table_info(&client, &mark.schema, &mark.table).await?;
        let pk_types = column_casts(&info, &mark.pk, &mark.table)?;
        let table = ident::qualified(&mark.schema, &mark.table);
        let per_statement = ((MAX_PARAMS - 2) / mark.pk.len()).max(1);

        let tx = client
            .transaction()
            .await
            .context("Failed to begin mark transaction")?;
        let mut affected = 0;
        for chunk in rows.chunks(per_statement) {
            let sql = mark_sql(&table, mark, &pk_types, chunk.len(), sent);
            let mut params: Vec<Option<String>> =
                vec![Some(status.to_string()), message.map(|m| clip(m, REASON_CLIP))];
            for row in chunk {
                for pk in &mark.pk {
                    let value = row
                        .get(pk)
                        .ok_or_else(|| anyhow!("Row is missing primary key column '{}'", pk))?;
                    params.push(to_param(value));
                }
            }
            affected += tx
                .execute(sql.as_str(), &as_refs(&params))
                .await
                .with_context(|| format!("Failed to mark rows in {}", table))?;
        }
        tx.commit().await.context("Failed to commit mark transaction")?;

        debug!(
            table = %table,
            status,
            affected,
            keys = %pk_snapshot(rows, &mark.pk),
            "Marked rows"
        );
        Ok(affected)
    }
}

#[async_trait]
impl TargetSink for PgStore {
    async fn write(&self, request: &WriteRequest<'_>, rows: &[Vec<Value>]) -> Result<WriteOutcome> {
        let target = request.target;
        let mut client = self.client.lock().await;
        let info = self.table_info(&client, &target.schema, &target.table).await?;
        let types = column_casts(&info, &target.columns, &target.table)?;
        let table = ident::qualified(&target.schema, &target.table);
        let per_statement = rows_per_statement(target.batch_size, target.columns.len());

        let conflict = match request.mode {
            WriteMode::Upsert => {
                let key = target.key.clone().unwrap_or_else(|| info.primary_key.clone());
                if key.is_empty() {
                    return Err(SyncError::config(format!(
                        "table {} has no primary key; set target.key for upserts",
                        table
                    ))
                    .into());
                }
                if let Some(missing) = key.iter().find(|k| !target.columns.contains(k)) {
                    return Err(SyncError::config(format!(
                        "upsert key column '{}' is not in target.columns",
                        missing
                    ))
                    .into());
                }
                Some(upsert_clause(&target.columns, &key))
            }
            _ => None,
        };

        let tx = client
            .transaction()
            .await
            .context("Failed to begin write transaction")?;

        let wipe = request.mode == WriteMode::Replace
            || (request.mode == WriteMode::Insert && request.truncate);
        if wipe {
            let deleted = tx
                .execute(format!("DELETE FROM {}", table).as_str(), &[])
                .await
                .with_context(|| format!("Failed to clear {}", table))?;
            debug!(table = %table, deleted, "Cleared target table");
        }

        let mut applier = TxApplier {
            tx: &tx,
            table: &table,
            columns: &target.columns,
            types: &types,
            conflict: conflict.as_deref(),
        };

        let outcome = if request.mode == WriteMode::Replace {
            for batch in rows.chunks(per_statement) {
                applier.apply(batch).await?;
            }
            WriteOutcome::all_ok(rows.len())
        } else {
            let mut batches = BatchOutcome::default();
            for (i, batch) in rows.chunks(per_statement).enumerate() {
                let result = with_savepoint_fallback(
                    &mut applier,
                    batch,
                    i * per_statement,
                    &target.columns,
                    request.on_error,
                )
                .await?;
                batches.merge(result);
            }
            WriteOutcome::from_batches(rows.len(), batches)
        };

        tx.commit().await.context("Failed to commit write transaction")?;
        info!(
            table = %table,
            rows = outcome.rows,
            ok = outcome.ok,
            fail = outcome.fail,
            "Wrote target rows"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl SourceStore for PgStore {
    async fn read_pending(&self, sql: &str, window: Option<&TimeRange>) -> Result<Vec<Row>> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin read transaction")?;
        tx.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .await
        .context("Failed to set statement timeout")?;

        let statement = tx
            .prepare(&wrap_pending_sql(sql))
            .await
            .context("Failed to prepare pending-row statement")?;
        // Statements may ignore the window; bind only the bounds they declare.
        let bounds: Vec<&(dyn ToSql + Sync)> = match window {
            Some(range) => vec![&range.from as &(dyn ToSql + Sync), &range.to],
            None => Vec::new(),
        };
        let wanted = statement.params().len();
        if wanted > bounds.len() {
            return Err(SyncError::config(format!(
                "pending-row statement expects {} parameters but only {} window bounds are available",
                wanted,
                bounds.len()
            ))
            .into());
        }
        let rows = tx
            .query(&statement, &bounds[..wanted])
            .await
            .context("Failed to read pending rows")?;
        tx.commit().await.context("Failed to close read transaction")?;

        rows.iter()
            .map(|r| match r.try_get::<_, Value>(0)? {
                Value::Object(map) => Ok(map),
                other => bail!("Pending row is not an object: {}", other),
            })
            .collect()
    }

    async fn mark_sent(&self, rows: &[&Row], note: Option<&str>, mark: &MarkTarget) -> Result<u64> {
        self.mark(rows, &mark.sent_value, note, mark, true).await
    }

    async fn mark_error(&self, rows: &[&Row], reason: &str, mark: &MarkTarget) -> Result<u64> {
        self.mark(rows, &mark.error_value, Some(reason), mark, false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn mark_target() -> MarkTarget {
        MarkTarget {
            schema: "mes".into(),
            table: "conf_item".into(),
            pk: strings(&["conf_no", "day"]),
            status_column: "sync_status".into(),
            message_column: "sync_message".into(),
            sent_at_column: Some("sent_at".into()),
            sent_value: "SENT".into(),
            error_value: "ERROR".into(),
        }
    }

    #[test]
    fn test_insert_sql_casts_per_column() {
        let sql = insert_sql(
            "\"mes\".\"orders\"",
            &strings(&["id", "name"]),
            &strings(&["integer", "text"]),
            2,
            None,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"mes\".\"orders\" AS tgt (\"id\", \"name\") VALUES \
             ($1::text::integer, $2::text), ($3::text::integer, $4::text)"
        );
    }

    #[test]
    fn test_upsert_clause_skips_unchanged_rows() {
        let clause = upsert_clause(&strings(&["id", "name", "qty"]), &strings(&["id"]));
        assert_eq!(
            clause,
            " ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\", \"qty\" = EXCLUDED.\"qty\" \
             WHERE (tgt.\"name\", tgt.\"qty\") IS DISTINCT FROM (EXCLUDED.\"name\", EXCLUDED.\"qty\")"
        );
    }

    #[test]
    fn test_upsert_clause_all_key_columns() {
        let clause = upsert_clause(&strings(&["a", "b"]), &strings(&["a", "b"]));
        assert_eq!(clause, " ON CONFLICT (\"a\", \"b\") DO NOTHING");
    }

    #[test]
    fn test_mark_sql_matches_by_pk_tuple() {
        let mark = mark_target();
        let sql = mark_sql(
            "\"mes\".\"conf_item\"",
            &mark,
            &strings(&["character varying", "date"]),
            2,
            true,
        );
        assert_eq!(
            sql,
            "UPDATE \"mes\".\"conf_item\" AS tgt SET \"sync_status\" = $1::text, \"sync_message\" = $2::text, \
             \"sent_at\" = now() FROM (VALUES ($3::text, $4::text::date), ($5::text, $6::text::date)) \
             AS v(\"conf_no\", \"day\") WHERE tgt.\"conf_no\" = v.\"conf_no\" AND tgt.\"day\" = v.\"day\""
        );

        let error_sql = mark_sql("\"mes\".\"conf_item\"", &mark, &strings(&["text", "date"]), 1, false);
        assert!(!error_sql.contains("sent_at"));
    }

    #[test]
    fn test_column_casts_reject_unknown_columns() {
        let info = TableInfo {
            columns: [("id".to_string(), "integer".to_string())].into_iter().collect(),
            primary_key: strings(&["id"]),
        };
        assert_eq!(column_casts(&info, &strings(&["id"]), "t").unwrap(), vec!["integer"]);
        let err = column_casts(&info, &strings(&["id", "ghost"]), "t").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rows_per_statement_respects_param_limit() {
        assert_eq!(rows_per_statement(500, 10), 500);
        assert_eq!(rows_per_statement(100_000, 10), 6_553);
        assert_eq!(rows_per_statement(0, 10), 1);
    }

    #[test]
    fn test_to_param_renders_text() {
        assert_eq!(to_param(&Value::Null), None);
        assert_eq!(to_param(&json!(1.5)).as_deref(), Some("1.5"));
        assert_eq!(to_param(&json!(true)).as_deref(), Some("true"));
        assert_eq!(to_param(&json!({"a": 1})).as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_wrap_pending_sql_strips_semicolon() {
        assert_eq!(
            wrap_pending_sql(" select * from t where x = 1; "),
            "SELECT row_to_json(src) FROM (select * from t where x = 1) AS src"
        );
    }
}

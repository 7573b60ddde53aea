//! Query execution: the simple, one-round-trip and prepared statement
//! paths, all sharing the [`Rows`] cursor surface.
use bytes::Bytes;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Instant,
};

use crate::{
    Error, ErrorKind, Result,
    connection::Connection,
    encode::Encoded,
    logger,
    postgres::{BackendMessage, FieldDescription, Oid, PgFormat, frontend},
    rows::{DEFAULT_BATCH, FromRow, Rows},
    sql::{self, Sql},
    statement::{PortalName, PreparedStatement, StatementName},
    types::{DecodeError, TypeRegistry, Value},
};

/// Options for [`query_ex`][Connection::query_ex].
#[derive(Debug, Default)]
pub struct QueryOptions {
    /// When present and the query is not a prepared statement, parameter
    /// oids and result format codes are sent up front to avoid an extra
    /// network round trip.
    pub parameter_oids: Vec<Oid>,
    /// Result column formats: empty for all-text, a single element to
    /// broadcast, or one code per column.
    pub result_format_codes: Vec<PgFormat>,
    /// Interpolate arguments into the SQL text and use the simple
    /// protocol. Requires `standard_conforming_strings=on` and
    /// `client_encoding=UTF8`.
    pub simple_protocol: bool,
}

impl Connection {
    /// Execute `sql` with bound parameters and stream the result rows.
    pub async fn query<'c, S: Sql>(
        &'c mut self,
        sql: S,
        params: &[Encoded<'_>],
    ) -> Result<Rows<'c>> {
        self.query_ex(None, 0, sql, None, params).await
    }

    /// Like [`query`][Connection::query] with an explicit row batch
    /// capacity.
    pub async fn query_with_buffer_size<'c, S: Sql>(
        &'c mut self,
        buffer_size: usize,
        sql: S,
        params: &[Encoded<'_>],
    ) -> Result<Rows<'c>> {
        self.query_ex(None, buffer_size, sql, None, params).await
    }

    /// Execute a query with an optional deadline, a row buffer bound and
    /// protocol options.
    ///
    /// `max_row_count` bounds the cursor's row batch; zero selects the
    /// default of 100. A deadline expiry surfaces as a non-fatal timeout
    /// error from the cursor.
    pub async fn query_ex<'c, S: Sql>(
        &'c mut self,
        deadline: Option<Instant>,
        max_row_count: usize,
        sql: S,
        options: Option<&QueryOptions>,
        params: &[Encoded<'_>],
    ) -> Result<Rows<'c>> {
        let batch_capacity = match max_row_count {
            0 => DEFAULT_BATCH,
            n => n,
        };

        self.lock()?;
        let fields = match self
            .start_query(deadline, batch_capacity, &sql, options, params)
            .await
        {
            Ok(fields) => fields,
            Err(err) => {
                self.unlock();
                return Err(err);
            }
        };

        Ok(Rows::new(
            self,
            batch_capacity,
            fields,
            sql.sql().to_owned(),
            logger::redact_args(params),
            deadline,
        ))
    }

    /// Execute a query expected to return at most one row.
    ///
    /// Returns the row-not-found error when the result set is empty;
    /// extra rows are discarded.
    pub async fn query_row<S: Sql>(&mut self, sql: S, params: &[Encoded<'_>]) -> Result<Row> {
        let mut rows = self.query_ex(None, 1, sql, None, params).await?;
        let row = match rows.next().await {
            true => rows.snapshot_row(),
            false => None,
        };
        rows.close().await;
        if let Some(err) = rows.take_err() {
            return Err(err);
        }
        row.ok_or_else(|| ErrorKind::RowNotFound.into())
    }

    async fn start_query(
        &mut self,
        deadline: Option<Instant>,
        batch_capacity: usize,
        sql: &impl Sql,
        options: Option<&QueryOptions>,
        params: &[Encoded<'_>],
    ) -> Result<Vec<FieldDescription>> {
        // answer anything still pipelined from the previous cursor
        self.drain_ready().await?;
        self.last_activity = Instant::now();

        if self.rmsgs.capacity() < batch_capacity {
            self.rmsgs.set_capacity(batch_capacity);
        }

        if options.is_some_and(|o| o.simple_protocol) {
            return self.start_simple(sql.sql(), params).await;
        }

        if let Some(options) = options.filter(|o| !o.parameter_oids.is_empty()) {
            return self.start_described(deadline, sql.sql(), options, params).await;
        }

        self.start_prepared(deadline, sql, options, params).await
    }

    /// Simple protocol: arguments interpolated into the SQL text, a single
    /// Query message, fields picked up from the reply stream.
    async fn start_simple(
        &mut self,
        sql: &str,
        params: &[Encoded<'_>],
    ) -> Result<Vec<FieldDescription>> {
        if self.parameter("standard_conforming_strings") != Some("on") {
            return Err(Error::usage(
                "simple protocol queries must be run with standard_conforming_strings=on",
            ));
        }
        if self.parameter("client_encoding") != Some("UTF8") {
            return Err(Error::usage(
                "simple protocol queries must be run with client_encoding=UTF8",
            ));
        }

        let interpolated;
        let sql = match params.is_empty() {
            true => sql,
            false => {
                interpolated = sql::interpolate(sql, params)?;
                &interpolated
            }
        };

        self.frontend.send(frontend::Query { sql });
        self.ready_request();
        self.flush().await?;

        // RowDescription arrives in-stream and the cursor installs it
        Ok(Vec::new())
    }

    /// One-round-trip described query: parameter oids supplied by the
    /// caller, everything through Sync in a single write.
    async fn start_described(
        &mut self,
        deadline: Option<Instant>,
        sql: &str,
        options: &QueryOptions,
        params: &[Encoded<'_>],
    ) -> Result<Vec<FieldDescription>> {
        if params.len() != options.parameter_oids.len() {
            return Err(Error::usage(format!(
                "mismatched number of arguments ({}) and options.ParameterOIDs ({})",
                params.len(),
                options.parameter_oids.len(),
            )));
        }
        if options.parameter_oids.len() > 65535 {
            return Err(Error::usage(format!(
                "Number of QueryOptions parameter_oids must be between 0 and 65535, received {}",
                options.parameter_oids.len(),
            )));
        }

        self.frontend.send(frontend::Parse {
            prepare_name: "",
            sql,
            param_oids: &options.parameter_oids,
        });
        self.frontend.send(frontend::Describe { kind: b'S', name: "" });
        let portal = PortalName::unnamed();
        self.frontend.send(frontend::Bind {
            portal_name: portal.as_str(),
            stmt_name: "",
            param_formats: &[PgFormat::Binary],
            params,
            result_formats: &options.result_format_codes,
        });
        self.frontend.send(frontend::Execute { portal_name: portal.as_str(), max_row: 0 });
        self.frontend.send(frontend::Sync);
        self.ready_request();
        self.flush().await?;

        let fields = self.read_until_row_description(deadline).await?;
        apply_result_formats(fields, &options.result_format_codes)
    }

    async fn read_until_row_description(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Vec<FieldDescription>> {
        loop {
            match self.recv_message(deadline).await? {
                BackendMessage::ParseComplete(_) => { }
                BackendMessage::ParameterDescription(_) => { }
                BackendMessage::NoData(_) => return Ok(Vec::new()),
                BackendMessage::RowDescription(rd) => {
                    let mut fields = rd.fields()?;
                    resolve_type_names(&self.registry, &mut fields)?;
                    return Ok(fields);
                }
                BackendMessage::ErrorResponse(err) => return Err(err.error.into()),
                message => self.handle_async_message(message),
            }
        }
    }

    /// Prepared statement path: look up the statement cache, preparing on
    /// miss, then Bind/Execute/Sync against the statement.
    async fn start_prepared(
        &mut self,
        deadline: Option<Instant>,
        sql: &impl Sql,
        options: Option<&QueryOptions>,
        params: &[Encoded<'_>],
    ) -> Result<Vec<FieldDescription>> {
        let text = sql.sql().trim();
        let persistent = sql.persistent();

        let sqlid = {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            hasher.finish()
        };

        let stmt = match persistent {
            true => match self.get_stmt(sqlid) {
                Some(stmt) => stmt,
                None => {
                    let stmt = self.prepare(deadline, text, StatementName::next()).await?;
                    self.add_stmt(sqlid, stmt.clone());
                    stmt
                }
            },
            false => self.prepare(deadline, text, StatementName::unnamed()).await?,
        };

        let result_formats = options.map(|o| &o.result_format_codes[..]).unwrap_or(&[]);

        let portal = PortalName::unnamed();
        self.frontend.send(frontend::Bind {
            portal_name: portal.as_str(),
            stmt_name: stmt.name.as_str(),
            param_formats: &[PgFormat::Binary],
            params,
            result_formats,
        });
        self.frontend.send(frontend::Execute { portal_name: portal.as_str(), max_row: 0 });
        self.frontend.send(frontend::Sync);
        self.ready_request();
        self.flush().await?;

        apply_result_formats(stmt.fields.clone(), result_formats)
    }

    /// Parse and describe a statement, one full round trip.
    async fn prepare(
        &mut self,
        deadline: Option<Instant>,
        sql: &str,
        name: StatementName,
    ) -> Result<Arc<PreparedStatement>> {
        self.frontend.send(frontend::Parse {
            prepare_name: name.as_str(),
            sql,
            param_oids: &[],
        });
        self.frontend.send(frontend::Describe { kind: b'S', name: name.as_str() });
        self.frontend.send(frontend::Sync);
        self.ready_request();
        self.flush().await?;

        let mut param_oids = Vec::new();
        let mut fields = Vec::new();
        let mut failure: Option<Error> = None;

        loop {
            match self.recv_message(deadline).await? {
                BackendMessage::ParseComplete(_) => { }
                BackendMessage::ParameterDescription(pd) => param_oids = pd.oids,
                BackendMessage::NoData(_) => { }
                BackendMessage::RowDescription(rd) => {
                    fields = rd.fields()?;
                    if let Err(err) = resolve_type_names(&self.registry, &mut fields) {
                        failure.get_or_insert(err);
                    }
                }
                BackendMessage::ErrorResponse(err) => {
                    // keep consuming to the ReadyForQuery the Sync owes us
                    failure.get_or_insert(err.error.into());
                }
                message @ BackendMessage::ReadyForQuery(_) => {
                    self.handle_async_message(message);
                    break;
                }
                message => self.handle_async_message(message),
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(Arc::new(PreparedStatement {
                name,
                sql: sql.to_owned(),
                param_oids,
                fields,
            })),
        }
    }
}

fn resolve_type_names(registry: &TypeRegistry, fields: &mut [FieldDescription]) -> Result<()> {
    for field in fields {
        let Some(info) = registry.get(field.data_type) else {
            return Err(DecodeError::UnknownOid(field.data_type).into());
        };
        field.type_name = info.name.into();
    }
    Ok(())
}

/// Apply the result format code convention: empty leaves every column
/// text, one code broadcasts, otherwise codes map positionally.
fn apply_result_formats(
    mut fields: Vec<FieldDescription>,
    codes: &[PgFormat],
) -> Result<Vec<FieldDescription>> {
    match codes {
        [] => { }
        [format] => {
            for field in &mut fields {
                field.format = *format;
            }
        }
        codes => {
            if codes.len() != fields.len() {
                return Err(Error::usage(format!(
                    "mismatched number of result format codes ({}) and result columns ({})",
                    codes.len(),
                    fields.len(),
                )));
            }
            for (field, format) in fields.iter_mut().zip(codes) {
                field.format = *format;
            }
        }
    }
    Ok(fields)
}

/// A single row materialized out of a cursor, returned by
/// [`query_row`][Connection::query_row].
pub struct Row {
    fields: Vec<FieldDescription>,
    values: Vec<Option<Bytes>>,
    registry: Arc<TypeRegistry>,
}

impl Row {
    pub(crate) fn new(
        fields: Vec<FieldDescription>,
        values: Vec<Option<Bytes>>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        Self { fields, values, registry }
    }

    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Decode the row positionally, like [`Rows::scan`][crate::Rows::scan].
    pub fn scan<R: FromRow>(&self) -> Result<R> {
        if R::WIDTH != self.fields.len() {
            return Err(Error::usage(format!(
                "Scan received wrong number of arguments, got {} but expected {}",
                R::WIDTH,
                self.fields.len(),
            )));
        }
        R::from_row(&self.fields, &self.values)
            .map_err(|e| ErrorKind::Scan { col: e.col, source: e.source }.into())
    }

    /// Decode every column into a dynamic [`Value`].
    pub fn values(&self) -> Result<Vec<Value>> {
        self.fields
            .iter()
            .zip(&self.values)
            .enumerate()
            .map(|(col, (field, value))| {
                self.registry
                    .decode(field, value.as_ref())
                    .map_err(|source| ErrorKind::Scan { col, source }.into())
            })
            .collect()
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row").field("fields", &self.fields.len()).finish()
    }
}

//! The batched, pipelined rows cursor.
use bytes::Bytes;
use std::time::Instant;

use crate::{
    Error, ErrorKind, Result,
    connection::Connection,
    logger::LogLevel,
    postgres::{
        BackendMessage, BackendProtocol, FieldDescription, ProtocolError,
        backend::{CommandComplete, DataRow, RowDescription},
    },
    query::Row,
    types::{Decode, DecodeError, Value},
};

/// Default row batch capacity.
pub const DEFAULT_BATCH: usize = 100;

/// The result set returned from a query.
///
/// Rows must be closed before the connection can be used again. They are
/// closed by calling [`close`][Rows::close], by reading every row, or when
/// a fatal error occurs.
///
/// Data rows are buffered in batches of at most the requested buffer size;
/// [`batch_next`][Rows::batch_next] refills the batch from the server's
/// reply stream.
pub struct Rows<'c> {
    conn: &'c mut Connection,

    values: Vec<Vec<Option<Bytes>>>,
    batch_capacity: usize,
    fields: Vec<FieldDescription>,

    sql: String,
    args: Vec<String>,
    start_time: Instant,
    deadline: Option<Instant>,

    row_count: u64,
    pending_row_count: usize,
    row_idx: usize,
    column_idx: usize,

    err: Option<Error>,
    closed: bool,
    unlock_conn: bool,
}

impl<'c> Rows<'c> {
    pub(crate) fn new(
        conn: &'c mut Connection,
        batch_capacity: usize,
        fields: Vec<FieldDescription>,
        sql: String,
        args: Vec<String>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            conn,
            values: Vec::with_capacity(batch_capacity),
            batch_capacity,
            fields,
            sql,
            args,
            start_time: Instant::now(),
            deadline,
            row_count: 0,
            pending_row_count: 0,
            row_idx: 0,
            column_idx: 0,
            err: None,
            closed: false,
            unlock_conn: true,
        }
    }

    /// Field metadata of the result columns.
    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// The first error this cursor hit, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub(crate) fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }

    /// Signal an error after the query was sent to the server.
    ///
    /// Latches the first error and closes the cursor. Connection-fatal
    /// errors also kill the connection.
    fn fatal(&mut self, err: Error) {
        if err.is_fatal() {
            self.conn.die();
        }
        if self.err.is_none() {
            self.err = Some(err);
        }
        self.finish();
    }

    /// Prepare the next row for reading.
    ///
    /// Returns `true` if there is another row and `false` if no more rows
    /// are available; the cursor closes itself once every row is read.
    /// Check [`err`][Rows::err] after the final `false`.
    pub async fn next(&mut self) -> bool {
        self.batch_next().await > 0
    }

    /// Refill the row batch, returning the number of buffered rows not
    /// yet scanned.
    ///
    /// Returns 0 once the server completed the command; the cursor is
    /// closed at that point.
    pub async fn batch_next(&mut self) -> usize {
        if self.closed {
            return 0;
        }

        // rows already buffered and not yet scanned
        if self.pending_row_count > self.row_idx {
            return self.pending_row_count - self.row_idx;
        }

        self.column_idx = 0;
        self.row_idx = 0;
        self.pending_row_count = 0;
        self.values.clear();

        loop {
            while let Some(frame) = self.conn.rmsgs.read() {
                // preserve a CommandComplete that terminates a non-empty
                // batch: the next call starts from it
                if frame.tag == CommandComplete::MSGTYPE && self.pending_row_count > 0 {
                    self.conn.rmsgs.backward();
                    return self.pending_row_count;
                }

                let message = match BackendMessage::decode(frame.tag, frame.body) {
                    Ok(message) => message,
                    Err(err) => {
                        self.fatal(err.into());
                        return 0;
                    }
                };

                match message {
                    BackendMessage::RowDescription(rd) => {
                        if let Err(err) = self.replace_fields(rd) {
                            self.fatal(err);
                            return 0;
                        }
                    }
                    BackendMessage::DataRow(dr) => match self.buffer_row(dr) {
                        Ok(true) => return self.pending_row_count,
                        Ok(false) => { }
                        Err(err) => {
                            self.fatal(err);
                            return 0;
                        }
                    },
                    BackendMessage::CommandComplete(_) => {
                        self.finish();
                        return 0;
                    }
                    BackendMessage::EmptyQueryResponse(_) => {
                        self.finish();
                        return 0;
                    }
                    BackendMessage::ErrorResponse(err) => {
                        self.fatal(err.error.into());
                        return 0;
                    }
                    message => self.conn.handle_async_message(message),
                }
            }

            // queue drained; go back to the socket. The server follows a
            // DataRow stream with CommandComplete, so progress is
            // guaranteed here.
            if let Err(err) = self.batch_read().await {
                self.fatal(err);
                return 0;
            }
        }
    }

    /// One `frontend.receive` round.
    ///
    /// Timeouts are surfaced without killing the connection; any other
    /// receive failure already killed it.
    async fn batch_read(&mut self) -> Result<()> {
        let conn = &mut *self.conn;
        match conn.frontend.receive(&mut conn.rmsgs, self.deadline).await {
            Ok(()) => {
                self.conn.last_activity = Instant::now();
                Ok(())
            }
            Err(err) => {
                if !err.is_timeout() {
                    self.conn.die();
                }
                Err(err)
            }
        }
    }

    /// Install fields from a `RowDescription` seen mid-stream (the simple
    /// protocol path), resolving type names through the registry.
    fn replace_fields(&mut self, rd: RowDescription) -> Result<()> {
        let mut fields = rd.fields()?;
        let registry = self.conn.registry.clone();
        for field in &mut fields {
            let Some(info) = registry.get(field.data_type) else {
                return Err(DecodeError::UnknownOid(field.data_type).into());
            };
            field.type_name = info.name.into();
        }
        self.fields = fields;
        Ok(())
    }

    /// Buffer one data row; `true` when the batch is full.
    fn buffer_row(&mut self, dr: DataRow) -> Result<bool> {
        let row = dr.values()?;
        if row.len() != self.fields.len() {
            return Err(ProtocolError::RowFieldCount {
                fields: self.fields.len(),
                values: row.len(),
            }
            .into());
        }

        self.values.push(row);
        self.row_count += 1;
        self.pending_row_count += 1;
        Ok(self.pending_row_count == self.batch_capacity)
    }

    /// Read the values from the current row positionally.
    ///
    /// The row is consumed: the next scan reads the next buffered row.
    /// Use `()` as a destination type to skip a column undecoded, and an
    /// `Option` to allow NULL.
    pub fn scan<R: FromRow>(&mut self) -> Result<R> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }

        if R::WIDTH != self.fields.len() {
            let err = Error::usage(format!(
                "Scan received wrong number of arguments, got {} but expected {}",
                R::WIDTH,
                self.fields.len(),
            ));
            self.fatal(err.clone());
            return Err(err);
        }

        if self.row_idx >= self.pending_row_count {
            let err = Error::usage("no row data");
            self.fatal(err.clone());
            return Err(err);
        }

        self.column_idx = 0;
        let row = &self.values[self.row_idx];
        match R::from_row(&self.fields, row) {
            Ok(out) => {
                self.column_idx = self.fields.len();
                self.row_idx += 1;
                Ok(out)
            }
            Err(ScanError { col, source }) => {
                self.column_idx = col;
                let err: Error = ErrorKind::Scan { col, source }.into();
                self.fatal(err.clone());
                Err(err)
            }
        }
    }

    /// Decode every column of the current row into dynamic [`Value`]s
    /// through the registry.
    ///
    /// Like [`scan`][Rows::scan], the current row is consumed.
    pub fn values(&mut self) -> Result<Vec<Value>> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.closed {
            return Err(Error::usage("rows is closed"));
        }
        if self.row_idx >= self.pending_row_count {
            let err = Error::usage("no row data");
            self.fatal(err.clone());
            return Err(err);
        }

        self.column_idx = 0;
        let mut out = Vec::with_capacity(self.fields.len());
        let row = &self.values[self.row_idx];
        let registry = self.conn.registry.clone();
        for (col, (field, value)) in self.fields.iter().zip(row).enumerate() {
            self.column_idx = col;
            match registry.decode(field, value.as_ref()) {
                Ok(value) => out.push(value),
                Err(source) => {
                    let err: Error = ErrorKind::Scan { col, source }.into();
                    self.fatal(err.clone());
                    return Err(err);
                }
            }
        }
        self.column_idx = self.fields.len();
        self.row_idx += 1;
        Ok(out)
    }

    /// Clone the current row out of the batch, consuming it.
    pub(crate) fn snapshot_row(&mut self) -> Option<Row> {
        if self.closed || self.row_idx >= self.pending_row_count {
            return None;
        }
        let row = Row::new(
            self.fields.clone(),
            self.values[self.row_idx].clone(),
            self.conn.registry.clone(),
        );
        self.row_idx += 1;
        Some(row)
    }

    /// Mark the cursor closed: unlock the connection at most once and emit
    /// the query log event. Idempotent; the remaining drain is done by
    /// [`close`][Rows::close] or before the next query.
    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.unlock_conn {
            self.conn.unlock();
            self.unlock_conn = false;
        }

        match &self.err {
            None => {
                if self.conn.should_log(LogLevel::Info) {
                    tracing::info!(
                        target: "postrow::query",
                        time = ?self.start_time.elapsed(),
                        row_count = self.row_count,
                        sql = %self.sql,
                        args = ?self.args,
                        "Query"
                    );
                }
            }
            Some(err) => {
                if self.conn.should_log(LogLevel::Error) {
                    tracing::error!(
                        target: "postrow::query",
                        error = %err,
                        sql = %self.sql,
                        args = ?self.args,
                        "Query"
                    );
                }
            }
        }
    }

    /// Close the rows, making the connection ready for use again.
    ///
    /// Remaining backend messages are consumed until every pending query
    /// submission has seen its ReadyForQuery. It is safe to call `close`
    /// after the rows are already closed.
    pub async fn close(&mut self) {
        self.finish();
        if let Err(err) = self.conn.drain_ready().await {
            if self.err.is_none() {
                self.err = Some(err);
            }
        }
    }
}

impl Drop for Rows<'_> {
    /// An unclosed cursor still unlocks and logs; the message drain is
    /// deferred to the next operation on the connection.
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for Rows<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("sql", &self.sql)
            .field("fields", &self.fields.len())
            .field("row_count", &self.row_count)
            .field("pending", &(self.pending_row_count - self.row_idx))
            .field("closed", &self.closed)
            .finish()
    }
}

/// Error from one scan destination.
pub struct ScanError {
    pub col: usize,
    pub source: DecodeError,
}

/// A tuple of [`Decode`] destinations filled positionally from a row.
pub trait FromRow: Sized {
    /// Number of columns this type consumes; must equal the field count.
    const WIDTH: usize;

    fn from_row(fields: &[FieldDescription], values: &[Option<Bytes>]) -> Result<Self, ScanError>;
}

macro_rules! from_row_tuple {
    ($len:literal; $($t:ident $i:tt),*) => {
        impl<$($t),*> FromRow for ($($t,)*)
        where
            $($t: Decode),*
        {
            const WIDTH: usize = $len;

            fn from_row(fields: &[FieldDescription], values: &[Option<Bytes>]) -> Result<Self, ScanError> {
                Ok((
                    $(
                        $t::decode(&fields[$i], values[$i].as_ref())
                            .map_err(|source| ScanError { col: $i, source })?,
                    )*
                ))
            }
        }
    };
}

from_row_tuple!(1; T0 0);
from_row_tuple!(2; T0 0, T1 1);
from_row_tuple!(3; T0 0, T1 1, T2 2);
from_row_tuple!(4; T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(5; T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(6; T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);
from_row_tuple!(7; T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6);
from_row_tuple!(8; T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6, T7 7);

/// Skip a column without decoding it.
impl Decode for () {
    fn decode(_: &FieldDescription, _: Option<&Bytes>) -> Result<Self, DecodeError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bytes::BufMut;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use crate::{
        Connection, PgFormat, QueryOptions,
        encode::Encode,
        ext::BufMutExt,
        types::{INT4, TEXT, Value},
    };

    // ===== scripted server transcript =====

    fn msg(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
        out.put_u8(tag);
        out.put_i32(4 + body.len() as i32);
        out.put_slice(body);
    }

    fn parse_complete(out: &mut Vec<u8>) {
        msg(out, b'1', b"");
    }

    fn bind_complete(out: &mut Vec<u8>) {
        msg(out, b'2', b"");
    }

    fn parameter_description(out: &mut Vec<u8>, oids: &[u32]) {
        let mut body = Vec::new();
        body.put_u16(oids.len() as u16);
        for oid in oids {
            body.put_u32(*oid);
        }
        msg(out, b't', &body);
    }

    fn row_description(out: &mut Vec<u8>, cols: &[(&str, u32)]) {
        let mut body = Vec::new();
        body.put_u16(cols.len() as u16);
        for (name, oid) in cols {
            body.put_nul_string(name);
            body.put_u32(0);
            body.put_u16(0);
            body.put_u32(*oid);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_u16(0);
        }
        msg(out, b'T', &body);
    }

    fn data_row(out: &mut Vec<u8>, values: &[Option<&[u8]>]) {
        let mut body = Vec::new();
        body.put_u16(values.len() as u16);
        for value in values {
            match value {
                None => body.put_i32(-1),
                Some(v) => {
                    body.put_i32(v.len() as i32);
                    body.put_slice(v);
                }
            }
        }
        msg(out, b'D', &body);
    }

    fn command_complete(out: &mut Vec<u8>, tag: &str) {
        let mut body = Vec::new();
        body.put_nul_string(tag);
        msg(out, b'C', &body);
    }

    fn ready_for_query(out: &mut Vec<u8>) {
        msg(out, b'Z', b"I");
    }

    /// ParseComplete + ParameterDescription + RowDescription + ReadyForQuery,
    /// the reply to a Parse/Describe('S')/Sync round trip.
    fn prepare_reply(out: &mut Vec<u8>, param_oids: &[u32], cols: &[(&str, u32)]) {
        parse_complete(out);
        parameter_description(out, param_oids);
        if cols.is_empty() {
            msg(out, b'n', b""); // NoData
        } else {
            row_description(out, cols);
        }
        ready_for_query(out);
    }

    async fn pipe_conn(transcript: Vec<u8>) -> (Connection, DuplexStream) {
        let (client, mut server) = tokio::io::duplex(65536);
        let conn = Connection::pipe(client);
        server.write_all(&transcript).await.unwrap();
        (conn, server)
    }

    // ===== scenarios =====

    #[tokio::test]
    async fn empty_select() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("?column?", INT4)]);
        bind_complete(&mut t);
        command_complete(&mut t, "SELECT 0");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let mut rows = conn.query("SELECT 1 WHERE false", &[]).await.unwrap();

        assert!(!rows.next().await);
        assert!(rows.err().is_none());
        assert!(!rows.next().await, "closed cursor stays closed");
        rows.close().await;
        drop(rows);

        assert!(!conn.is_dead());
        assert_eq!(conn.pending_ready, 0);
    }

    #[tokio::test]
    async fn single_row_typed() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[INT4], &[("int4", INT4)]);
        bind_complete(&mut t);
        data_row(&mut t, &[Some(b"42")]);
        command_complete(&mut t, "SELECT 1");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let row = conn
            .query_row("SELECT $1::int4", &[42i32.encode()])
            .await
            .unwrap();
        let (x,) = row.scan::<(i32,)>().unwrap();
        assert_eq!(x, 42);
    }

    #[tokio::test]
    async fn query_row_empty_is_row_not_found() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("int4", INT4)]);
        bind_complete(&mut t);
        command_complete(&mut t, "SELECT 0");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let err = conn.query_row("SELECT 1 WHERE false", &[]).await.unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::RowNotFound));
    }

    #[tokio::test]
    async fn batch_boundary() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("generate_series", INT4)]);
        bind_complete(&mut t);
        for n in 1..=7 {
            data_row(&mut t, &[Some(n.to_string().as_bytes())]);
        }
        command_complete(&mut t, "SELECT 7");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let mut rows = conn
            .query_with_buffer_size(3, "SELECT generate_series(1,7)", &[])
            .await
            .unwrap();

        let mut batches = Vec::new();
        loop {
            let n = rows.batch_next().await;
            if n == 0 {
                break;
            }
            let mut batch = Vec::with_capacity(n);
            for _ in 0..n {
                let (v,) = rows.scan::<(i32,)>().unwrap();
                batch.push(v);
            }
            batches.push(batch);
        }

        assert_eq!(batches, [vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
        assert!(rows.err().is_none());
        rows.close().await;
    }

    #[tokio::test]
    async fn wrong_scan_arity() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("a", INT4), ("b", INT4)]);
        bind_complete(&mut t);
        data_row(&mut t, &[Some(b"1"), Some(b"2")]);
        command_complete(&mut t, "SELECT 1");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let mut rows = conn.query("SELECT 1, 2", &[]).await.unwrap();
        assert!(rows.next().await);

        let err = rows.scan::<(i32,)>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Scan received wrong number of arguments, got 1 but expected 2",
        );
        assert!(!rows.next().await, "cursor latched closed");
        assert!(rows.err().is_some());
        drop(rows);
        assert!(!conn.is_dead(), "usage errors do not kill the connection");
    }

    #[tokio::test]
    async fn data_row_field_count_mismatch() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("a", INT4), ("b", INT4)]);
        bind_complete(&mut t);
        data_row(&mut t, &[Some(b"1"), Some(b"2"), Some(b"3")]);
        command_complete(&mut t, "SELECT 1");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let mut rows = conn.query("SELECT 1, 2", &[]).await.unwrap();

        assert!(!rows.next().await);
        let err = rows.err().expect("protocol violation latched");
        assert_eq!(
            err.to_string(),
            "Row description field count (2) and data row field count (3) do not match",
        );
        drop(rows);
        assert!(conn.is_dead(), "protocol violations kill the connection");
    }

    #[tokio::test]
    async fn null_column_and_skip() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("a", INT4), ("b", TEXT)]);
        bind_complete(&mut t);
        data_row(&mut t, &[None, Some(b"keep")]);
        command_complete(&mut t, "SELECT 1");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let mut rows = conn.query("SELECT NULL, 'keep'", &[]).await.unwrap();
        assert!(rows.next().await);
        let (a, b) = rows.scan::<(Option<i32>, String)>().unwrap();
        assert_eq!(a, None);
        assert_eq!(b, "keep");
        assert!(!rows.next().await);
        rows.close().await;

        assert!(rows.err().is_none());
    }

    #[tokio::test]
    async fn values_through_registry() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("n", INT4), ("s", TEXT)]);
        bind_complete(&mut t);
        data_row(&mut t, &[Some(b"7"), Some(b"seven")]);
        command_complete(&mut t, "SELECT 1");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let mut rows = conn.query("SELECT 7, 'seven'", &[]).await.unwrap();
        assert!(rows.next().await);
        let values = rows.values().unwrap();
        assert_eq!(values[0], Value::Int4(7));
        assert!(matches!(&values[1], Value::Text(s) if s == &"seven"));
        assert_eq!(rows.field_descriptions()[0].type_name, "int4");
        rows.close().await;
    }

    #[tokio::test]
    async fn simple_protocol_streams_fields() {
        let mut t = Vec::new();
        row_description(&mut t, &[("v", TEXT)]);
        data_row(&mut t, &[Some(b"it's")]);
        command_complete(&mut t, "SELECT 1");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let options = QueryOptions { simple_protocol: true, ..Default::default() };
        let mut rows = conn
            .query_ex(None, 0, "SELECT $1", Some(&options), &["it's".encode()])
            .await
            .unwrap();

        assert!(rows.next().await);
        let (v,) = rows.scan::<(String,)>().unwrap();
        assert_eq!(v, "it's");
        assert!(!rows.next().await);
        rows.close().await;
    }

    #[tokio::test]
    async fn simple_protocol_requires_runtime_params() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);
        conn.run_params.remove("standard_conforming_strings");

        let options = QueryOptions { simple_protocol: true, ..Default::default() };
        let err = conn
            .query_ex(None, 0, "SELECT 1", Some(&options), &[])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "simple protocol queries must be run with standard_conforming_strings=on",
        );

        // the failed attempt released the lock
        conn.lock().unwrap();
        conn.unlock();
    }

    #[tokio::test]
    async fn described_one_round_trip_binary_results() {
        let mut t = Vec::new();
        parse_complete(&mut t);
        parameter_description(&mut t, &[INT4]);
        row_description(&mut t, &[("n", INT4)]);
        bind_complete(&mut t);
        data_row(&mut t, &[Some(&42i32.to_be_bytes())]);
        command_complete(&mut t, "SELECT 1");
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let options = QueryOptions {
            parameter_oids: vec![INT4],
            result_format_codes: vec![PgFormat::Binary],
            ..Default::default()
        };
        let mut rows = conn
            .query_ex(None, 0, "SELECT $1::int4", Some(&options), &[42i32.encode()])
            .await
            .unwrap();

        assert_eq!(rows.field_descriptions()[0].format, PgFormat::Binary);
        assert!(rows.next().await);
        let (n,) = rows.scan::<(i32,)>().unwrap();
        assert_eq!(n, 42);
        rows.close().await;
    }

    #[tokio::test]
    async fn described_arg_count_mismatch() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);

        let options = QueryOptions { parameter_oids: vec![INT4, TEXT], ..Default::default() };
        let err = conn
            .query_ex(None, 0, "SELECT $1, $2", Some(&options), &[1i32.encode()])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "mismatched number of arguments (1) and options.ParameterOIDs (2)",
        );
    }

    #[tokio::test]
    async fn server_error_latches_without_killing_connection() {
        let mut t = Vec::new();
        // Parse fails; the Sync still gets its ReadyForQuery
        let mut body = Vec::new();
        for (field, value) in [(b'S', "ERROR"), (b'C', "42601"), (b'M', "syntax error")] {
            body.put_u8(field);
            body.put_nul_string(value);
        }
        body.put_u8(0);
        msg(&mut t, b'E', &body);
        ready_for_query(&mut t);

        let (mut conn, _server) = pipe_conn(t).await;
        let err = conn.query("SELEC 1", &[]).await.unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::Database(_)));
        assert!(!conn.is_dead());
        assert_eq!(conn.pending_ready, 0, "prepare drained to ReadyForQuery");
    }

    #[tokio::test]
    async fn deadline_timeout_is_non_fatal() {
        let mut t = Vec::new();
        prepare_reply(&mut t, &[], &[("n", INT4)]);
        bind_complete(&mut t);
        // server goes silent before any DataRow

        let (mut conn, _server) = pipe_conn(t).await;
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(20);
        let mut rows = conn
            .query_ex(Some(deadline), 0, "SELECT pg_sleep(10)", None, &[])
            .await
            .unwrap();

        assert!(!rows.next().await);
        assert!(rows.err().expect("timeout latched").is_timeout());
        drop(rows);
        assert!(!conn.is_dead(), "timeouts do not kill the connection");
    }
}

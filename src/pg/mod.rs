//! A pipelined, non-blocking PostgreSQL client built directly on `pq-sys`
//! (libpq's nonblocking pipeline-mode entry points are not exposed by the
//! higher-level `postgres`/`tokio-postgres` crates).
//!
//! Grounded in `original_source/src/pgeff.c`: the `PQconnectStart`/
//! `PQconnectPoll` handshake loop, the pipeline send/harvest/sync
//! sequence, the notice-processor trampoline, and the dual-stream
//! query/listen wake arbitration, reworked from Lua coroutine
//! continuations into `async fn`s driven by [`crate::reactor::Reactor`].

pub mod types;

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::reactor::{select2, Either, Reactor, Sleeper, Waker};
use types::{convert_value, InputConverter, OutputConverter, Param, QueryResult, Row, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Open,
    Broken,
    Closed,
}

/// Module-wide defaults shared across connections: the notice hook and
/// input/output converters a `DbConn` falls back to when it hasn't set
/// its own.
#[derive(Default, Clone)]
pub struct Module {
    notice_processor: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    input_converter: Option<InputConverter>,
    output_converter: Option<OutputConverter>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    pub fn set_notice_processor(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.notice_processor = Some(Arc::new(f));
    }

    pub fn set_input_converter(&mut self, f: impl Fn(&Param) -> Param + Send + Sync + 'static) {
        self.input_converter = Some(Arc::new(f));
    }

    pub fn set_output_converter(&mut self, f: impl Fn(u32, &str) -> Option<Value> + Send + Sync + 'static) {
        self.output_converter = Some(Arc::new(f));
    }
}

struct NoticeBox {
    f: Arc<dyn Fn(&str) + Send + Sync>,
}

unsafe extern "C" fn notice_trampoline(arg: *mut c_void, message: *const c_char) {
    if arg.is_null() || message.is_null() {
        return;
    }
    let notice = &*(arg as *const NoticeBox);
    let raw = CStr::from_ptr(message).to_string_lossy();
    let trimmed = raw.trim_end_matches('\n');
    (notice.f)(trimmed);
}

/// A single pipelined connection. Not `Send`/`Sync`: it is driven from
/// exactly one `Reactor` on one OS thread.
pub struct DbConn<'a> {
    conn: *mut pq_sys::PGconn,
    reactor: &'a Reactor,
    state: ConnState,
    sync_count: u32,
    /// Set when `get_result`'s drain loop already consumed the
    /// `PGRES_PIPELINE_SYNC` marker belonging to a still-outstanding
    /// `get_sync` call, so `get_sync` doesn't re-issue `PQgetResult`
    /// for it.
    pending_sync: Cell<bool>,
    query_waiting: Cell<bool>,
    listen_waiting: Cell<bool>,
    query_pair: (Sleeper, Waker),
    listen_pair: (Sleeper, Waker),
    notice_box: Option<Box<NoticeBox>>,
    input_converter: Option<InputConverter>,
    output_converter: Option<OutputConverter>,
    module_input_converter: Option<InputConverter>,
    module_output_converter: Option<OutputConverter>,
}

fn last_error(conn: *mut pq_sys::PGconn) -> String {
    unsafe {
        let ptr = pq_sys::PQerrorMessage(conn);
        if ptr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(ptr as *const c_char).to_string_lossy().trim_end_matches('\n').to_string()
        }
    }
}

impl<'a> DbConn<'a> {
    /// Initiates a non-blocking connection and drives `PQconnectPoll` to
    /// completion, suspending on the connection fd's readiness as libpq
    /// requests it.
    pub async fn connect(reactor: &'a Reactor, conninfo: &str, module: &Module) -> Result<DbConn<'a>> {
        let c_conninfo = CString::new(conninfo)
            .map_err(|_| Error::BadArgument("conninfo contains a NUL byte".into()))?;

        let conn = unsafe { pq_sys::PQconnectStart(c_conninfo.as_ptr()) };
        if conn.is_null() {
            return Err(Error::ConnectFailed("out of memory starting connection".into()));
        }
        if unsafe { pq_sys::PQstatus(conn) } == pq_sys::CONNECTION_BAD {
            let msg = last_error(conn);
            unsafe { pq_sys::PQfinish(conn) };
            return Err(Error::ConnectFailed(msg));
        }

        let notice_box = module.notice_processor.clone().map(|f| Box::new(NoticeBox { f }));
        if let Some(boxed) = &notice_box {
            unsafe {
                pq_sys::PQsetNoticeProcessor(
                    conn,
                    Some(notice_trampoline),
                    boxed.as_ref() as *const NoticeBox as *mut c_void,
                );
            }
        }

        loop {
            match unsafe { pq_sys::PQconnectPoll(conn) } {
                pq_sys::PGRES_POLLING_OK => break,
                pq_sys::PGRES_POLLING_FAILED => {
                    let msg = last_error(conn);
                    unsafe { pq_sys::PQfinish(conn) };
                    return Err(Error::ConnectFailed(msg));
                }
                pq_sys::PGRES_POLLING_READING => {
                    let fd = unsafe { pq_sys::PQsocket(conn) };
                    if let Err(e) = reactor.readable(fd as RawFd).await {
                        unsafe { pq_sys::PQfinish(conn) };
                        return Err(Error::Io(e));
                    }
                }
                pq_sys::PGRES_POLLING_WRITING => {
                    let fd = unsafe { pq_sys::PQsocket(conn) };
                    if let Err(e) = reactor.writable(fd as RawFd).await {
                        unsafe { pq_sys::PQfinish(conn) };
                        return Err(Error::Io(e));
                    }
                }
                _ => {}
            }
        }

        if unsafe { pq_sys::PQsetnonblocking(conn, 1) } != 0 {
            let msg = last_error(conn);
            unsafe { pq_sys::PQfinish(conn) };
            return Err(Error::ConnectFailed(msg));
        }
        let pipeline = unsafe { pq_sys::PQenterPipelineMode(conn) };
        if pipeline == 0 {
            let msg = last_error(conn);
            unsafe { pq_sys::PQfinish(conn) };
            return Err(Error::ConnectFailed(msg));
        }

        Ok(DbConn {
            conn,
            reactor,
            state: ConnState::Open,
            sync_count: 0,
            pending_sync: Cell::new(false),
            query_waiting: Cell::new(false),
            listen_waiting: Cell::new(false),
            query_pair: reactor.notify(),
            listen_pair: reactor.notify(),
            notice_box,
            input_converter: None,
            output_converter: None,
            module_input_converter: module.input_converter.clone(),
            module_output_converter: module.output_converter.clone(),
        })
    }

    pub fn set_notice_processor(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        let boxed = Box::new(NoticeBox { f: Arc::new(f) });
        unsafe {
            pq_sys::PQsetNoticeProcessor(
                self.conn,
                Some(notice_trampoline),
                boxed.as_ref() as *const NoticeBox as *mut c_void,
            );
        }
        self.notice_box = Some(boxed);
    }

    pub fn set_input_converter(&mut self, f: impl Fn(&Param) -> Param + Send + Sync + 'static) {
        self.input_converter = Some(Arc::new(f));
    }

    pub fn set_output_converter(&mut self, f: impl Fn(u32, &str) -> Option<Value> + Send + Sync + 'static) {
        self.output_converter = Some(Arc::new(f));
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnState::Open => Ok(()),
            ConnState::Broken => Err(Error::ConnectionBroken(last_error(self.conn))),
            ConnState::Closed => Err(Error::InvalidState("database handle has been closed")),
        }
    }

    fn mark_broken(&mut self) -> Error {
        let msg = last_error(self.conn);
        self.state = ConnState::Broken;
        Error::ConnectionBroken(msg)
    }

    fn query_error(&self) -> Error {
        Error::QueryError {
            message: last_error(self.conn),
            code: String::new(),
        }
    }

    fn fd(&self) -> RawFd {
        unsafe { pq_sys::PQsocket(self.conn) as RawFd }
    }

    /// Consumes whatever input is currently available (non-blocking),
    /// flushes any still-buffered output, and wakes both the query and
    /// listen sibling sleepers, since a single `PQconsumeInput` call may
    /// have delivered bytes either path cares about.
    fn pump(&mut self) -> Result<()> {
        if unsafe { pq_sys::PQconsumeInput(self.conn) } == 0 {
            return Err(self.mark_broken());
        }
        if unsafe { pq_sys::PQflush(self.conn) } < 0 {
            return Err(self.mark_broken());
        }
        self.query_pair.1.wake();
        self.listen_pair.1.wake();
        Ok(())
    }

    async fn wait_for_activity(&self, sleeper: Sleeper) -> Result<()> {
        let fd = self.fd();
        match select2(self.reactor.readable(fd), sleeper).await {
            Either::Left(r) => r.map_err(Error::Io),
            Either::Right(_) => Ok(()),
        }
    }

    /// Serializes `params` through the registered input converter (if
    /// any — connection-level taking precedence over module-level),
    /// issues a parameterized pipelined query, and flushes. Does not
    /// wait for a result; call `get_result` for that.
    pub fn send_query(&mut self, sql: &str, params: &[Param]) -> Result<()> {
        self.ensure_open()?;

        let converter = self.input_converter.clone().or_else(|| self.module_input_converter.clone());
        let converted: Vec<Param> = params
            .iter()
            .map(|p| converter.as_ref().map(|f| f(p)).unwrap_or_else(|| p.clone()))
            .collect();

        let oids: Vec<pq_sys::Oid> = converted.iter().map(|p| p.oid()).collect();
        let texts: Vec<Option<CString>> = converted
            .iter()
            .map(|p| p.text().map(|s| CString::new(s).unwrap_or_default()))
            .collect();
        let ptrs: Vec<*const c_char> = texts
            .iter()
            .map(|t| t.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()))
            .collect();

        let sql_c = CString::new(sql)
            .map_err(|_| Error::BadArgument("query text contains a NUL byte".into()))?;

        let ok = unsafe {
            pq_sys::PQsendQueryParams(
                self.conn,
                sql_c.as_ptr(),
                ptrs.len() as c_int,
                oids.as_ptr(),
                ptrs.as_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                0,
            )
        };
        if ok == 0 {
            return Err(self.query_error());
        }
        if unsafe { pq_sys::PQflush(self.conn) } < 0 {
            return Err(self.mark_broken());
        }
        Ok(())
    }

    /// Appends a pipeline sync point.
    pub fn send_sync(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.sync_count == u32::MAX {
            return Err(Error::BadArgument("sync_count would overflow".into()));
        }
        if unsafe { pq_sys::PQpipelineSync(self.conn) } == 0 {
            return Err(self.query_error());
        }
        self.sync_count += 1;
        Ok(())
    }

    fn row_from_pgresult(&self, pgres: *mut pq_sys::PGresult, row: c_int, columns: &Rc<HashMap<String, usize>>) -> Row {
        let ncols = unsafe { pq_sys::PQnfields(pgres) };
        let converter = self.output_converter.as_ref().or(self.module_output_converter.as_ref());
        let mut values = Vec::with_capacity(ncols as usize);
        for col in 0..ncols {
            if unsafe { pq_sys::PQgetisnull(pgres, row, col) } == 1 {
                values.push(None);
                continue;
            }
            let oid = unsafe { pq_sys::PQftype(pgres, col) };
            let raw = unsafe { pq_sys::PQgetvalue(pgres, row, col) } as *const c_char;
            let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy();
            values.push(Some(convert_value(converter, oid, &text)));
        }
        Row {
            values,
            columns: columns.clone(),
        }
    }

    /// Drains server output up to the next query or sync boundary,
    /// returning every completed statement's results in submission
    /// order. Errors (a bad query, or a `PGRES_PIPELINE_ABORTED`
    /// casualty of an earlier failed statement) are recorded but do not
    /// stop the drain — the connection's read cursor must stay in sync
    /// with the server — and surface as this call's `Err` once draining
    /// reaches the boundary.
    pub async fn get_result(&mut self) -> Result<Vec<QueryResult>> {
        self.ensure_open()?;
        if self.query_waiting.get() {
            return Err(Error::InvalidState(
                "cannot execute two queries concurrently on same database connection",
            ));
        }
        self.query_waiting.set(true);
        let result = self.get_result_inner().await;
        self.query_waiting.set(false);
        result
    }

    async fn get_result_inner(&mut self) -> Result<Vec<QueryResult>> {
        let mut out = Vec::new();
        let mut first_error: Option<Error> = None;

        loop {
            self.pump()?;
            loop {
                if unsafe { pq_sys::PQisBusy(self.conn) } != 0 {
                    break;
                }
                let pgres = unsafe { pq_sys::PQgetResult(self.conn) };
                if pgres.is_null() {
                    return match first_error {
                        Some(e) => Err(e),
                        None => Ok(out),
                    };
                }
                let status = unsafe { pq_sys::PQresultStatus(pgres) };
                match status {
                    pq_sys::PGRES_PIPELINE_SYNC => {
                        unsafe { pq_sys::PQclear(pgres) };
                        self.pending_sync.set(true);
                        return match first_error {
                            Some(e) => Err(e),
                            None => Ok(out),
                        };
                    }
                    pq_sys::PGRES_PIPELINE_ABORTED => {
                        unsafe { pq_sys::PQclear(pgres) };
                        first_error.get_or_insert(Error::PipelineAborted);
                    }
                    pq_sys::PGRES_FATAL_ERROR | pq_sys::PGRES_NONFATAL_ERROR => {
                        let message = pg_result_error_message(pgres);
                        let code = pg_result_error_field(pgres, pq_sys::PG_DIAG_SQLSTATE as c_int);
                        unsafe { pq_sys::PQclear(pgres) };
                        first_error.get_or_insert(Error::QueryError { message, code });
                    }
                    _ => {
                        let ncols = unsafe { pq_sys::PQnfields(pgres) };
                        let nrows = unsafe { pq_sys::PQntuples(pgres) };
                        let mut column_names = Vec::with_capacity(ncols as usize);
                        let mut column_oids = Vec::with_capacity(ncols as usize);
                        let mut index: HashMap<String, usize> = HashMap::with_capacity(ncols as usize);
                        for col in 0..ncols {
                            let name = unsafe { CStr::from_ptr(pq_sys::PQfname(pgres, col) as *const c_char) }
                                .to_string_lossy()
                                .into_owned();
                            index.insert(name.clone(), col as usize);
                            column_names.push(name);
                            column_oids.push(unsafe { pq_sys::PQftype(pgres, col) });
                        }
                        let columns = Rc::new(index);
                        let mut rows = Vec::with_capacity(nrows as usize);
                        for r in 0..nrows {
                            rows.push(self.row_from_pgresult(pgres, r, &columns));
                        }
                        unsafe { pq_sys::PQclear(pgres) };
                        out.push(QueryResult { column_names, column_oids, rows });
                    }
                }
            }
            self.wait_for_activity(self.query_pair.0.clone()).await?;
        }
    }

    /// Drains output discarding non-sync results until the next
    /// `PGRES_PIPELINE_SYNC` marker is consumed; returns the remaining
    /// sync count (0 means every pipelined statement is acknowledged).
    pub async fn get_sync(&mut self) -> Result<u32> {
        self.ensure_open()?;
        if self.query_waiting.get() {
            return Err(Error::InvalidState(
                "cannot execute two queries concurrently on same database connection",
            ));
        }
        self.query_waiting.set(true);
        let result = self.get_sync_inner().await;
        self.query_waiting.set(false);
        result
    }

    async fn get_sync_inner(&mut self) -> Result<u32> {
        if self.pending_sync.take() {
            self.sync_count = self.sync_count.saturating_sub(1);
            return Ok(self.sync_count);
        }
        loop {
            self.pump()?;
            loop {
                if unsafe { pq_sys::PQisBusy(self.conn) } != 0 {
                    break;
                }
                let pgres = unsafe { pq_sys::PQgetResult(self.conn) };
                if pgres.is_null() {
                    break;
                }
                let status = unsafe { pq_sys::PQresultStatus(pgres) };
                unsafe { pq_sys::PQclear(pgres) };
                if status == pq_sys::PGRES_PIPELINE_SYNC {
                    self.sync_count = self.sync_count.saturating_sub(1);
                    return Ok(self.sync_count);
                }
            }
            self.wait_for_activity(self.query_pair.0.clone()).await?;
        }
    }

    /// Returns the next asynchronous `NOTIFY` delivered on this
    /// connection, suspending until one arrives.
    pub async fn listen(&mut self) -> Result<types::Notification> {
        self.ensure_open()?;
        if self.listen_waiting.get() {
            return Err(Error::InvalidState(
                "already listening for notifies on same database connection",
            ));
        }
        self.listen_waiting.set(true);
        let result = self.listen_inner().await;
        self.listen_waiting.set(false);
        result
    }

    async fn listen_inner(&mut self) -> Result<types::Notification> {
        loop {
            self.pump()?;
            if let Some(n) = self.take_notification() {
                return Ok(n);
            }
            self.wait_for_activity(self.listen_pair.0.clone()).await?;
        }
    }

    fn take_notification(&self) -> Option<types::Notification> {
        let raw = unsafe { pq_sys::PQnotifies(self.conn) };
        if raw.is_null() {
            return None;
        }
        unsafe {
            let name = CStr::from_ptr((*raw).relname as *const c_char).to_string_lossy().into_owned();
            let payload = CStr::from_ptr((*raw).extra as *const c_char).to_string_lossy().into_owned();
            let backend_pid = (*raw).be_pid;
            pq_sys::PQfreemem(raw as *mut c_void);
            Some(types::Notification { name, backend_pid, payload })
        }
    }

    /// Deregisters the fd from the scheduler before finishing libpq, then
    /// releases the connection. Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        if !self.conn.is_null() {
            let _ = self.reactor.deregister_fd(self.fd());
            unsafe { pq_sys::PQfinish(self.conn) };
        }
        self.conn = std::ptr::null_mut();
        self.state = ConnState::Closed;
    }
}

fn pg_result_error_message(pgres: *mut pq_sys::PGresult) -> String {
    unsafe {
        let ptr = pq_sys::PQresultErrorMessage(pgres);
        if ptr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(ptr as *const c_char).to_string_lossy().trim_end_matches('\n').to_string()
        }
    }
}

fn pg_result_error_field(pgres: *mut pq_sys::PGresult, field: c_int) -> String {
    unsafe {
        let ptr = pq_sys::PQresultErrorField(pgres, field);
        if ptr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(ptr as *const c_char).to_string_lossy().into_owned()
        }
    }
}

impl<'a> Drop for DbConn<'a> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::types::Param;

    #[test]
    fn bool_param_serializes_to_pg_bool_oid_and_text() {
        assert_eq!(Param::Bool(true).oid(), super::types::OID_BOOL);
        assert_eq!(Param::Bool(true).text().as_deref(), Some("t"));
        assert_eq!(Param::Bool(false).text().as_deref(), Some("f"));
    }

    #[test]
    fn null_param_has_no_text() {
        assert_eq!(Param::Null.text(), None);
    }
}

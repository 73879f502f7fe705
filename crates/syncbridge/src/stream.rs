//! Streaming results from a server-side cursor.

use crate::connection::AsyncConnection;
use asupersync::{Cx, Outcome};
use syncbridge_core::connection::{CursorId, SyncConnection};
use syncbridge_core::error::{BridgeErrorKind, Error};
use syncbridge_core::Row;

/// Rows fetched per round trip by [`AsyncCursor::fetch_all`].
const FETCH_ALL_BATCH: usize = 256;

/// An open server-side cursor on an [`AsyncConnection`].
///
/// Every fetch is one operation on the owning connection, so a cursor cannot
/// be read while another operation on that connection is in flight.
///
/// Close the cursor explicitly when done. Dropping it queues the cursor on the
/// connection, which closes it before its next operation.
pub struct AsyncCursor<'a, C: SyncConnection> {
    conn: &'a AsyncConnection<C>,
    cursor: CursorId,
    exhausted: bool,
    closed: bool,
}

impl<C: SyncConnection> std::fmt::Debug for AsyncCursor<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCursor")
            .field("cursor", &self.cursor)
            .field("exhausted", &self.exhausted)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<'a, C: SyncConnection> AsyncCursor<'a, C> {
    pub(crate) fn new(conn: &'a AsyncConnection<C>, cursor: CursorId) -> Self {
        Self {
            conn,
            cursor,
            exhausted: false,
            closed: false,
        }
    }

    pub fn id(&self) -> CursorId {
        self.cursor
    }

    /// Whether the last fetch came back empty.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn ensure_open(&self) -> Option<Error> {
        self.closed
            .then(|| Error::bridge(BridgeErrorKind::UseAfterDispose, "cursor is closed"))
    }

    /// Fetch up to `max_rows` rows. An empty batch means the cursor is
    /// exhausted.
    pub async fn fetch_many(&mut self, cx: &Cx, max_rows: usize) -> Outcome<Vec<Row>, Error> {
        if let Some(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        if self.exhausted || max_rows == 0 {
            return Outcome::Ok(Vec::new());
        }
        let cursor = self.cursor;
        let outcome = self
            .conn
            .with_conn(cx, move |conn| conn.fetch(cursor, max_rows))
            .await;
        if let Outcome::Ok(rows) = &outcome {
            if rows.is_empty() {
                self.exhausted = true;
            }
        }
        outcome
    }

    /// Fetch the next row.
    pub async fn fetch_one(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        match self.fetch_many(cx, 1).await {
            Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Fetch every remaining row.
    pub async fn fetch_all(&mut self, cx: &Cx) -> Outcome<Vec<Row>, Error> {
        let mut all = Vec::new();
        while !self.exhausted {
            match self.fetch_many(cx, FETCH_ALL_BATCH).await {
                Outcome::Ok(rows) => all.extend(rows),
                other => return other,
            }
        }
        Outcome::Ok(all)
    }

    /// Close the cursor on the server.
    ///
    /// If the close never reached the connection (it was busy, or bound to
    /// another context) the cursor is queued for cleanup as if dropped.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        let cursor = self.cursor;
        let outcome = self
            .conn
            .with_conn(cx, move |conn| conn.close_cursor(cursor))
            .await;
        self.closed = !matches!(&outcome, Outcome::Err(e) if e.bridge_kind().is_some());
        outcome
    }
}

impl<C: SyncConnection> Drop for AsyncCursor<'_, C> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(cursor = self.cursor.get(), "Cursor dropped without close; queued for cleanup");
            self.conn.orphans().push(self.cursor);
        }
    }
}

//! Query logging.
//!
//! One record per subscription, carrying the connection id and the query
//! text. Tokens are never logged at info level.

use crate::client::ConnectionContext;

/// Log the start of a query subscription.
pub(crate) fn log_query(context: &ConnectionContext, sql: &str) {
    tracing::debug!(connection_id = %context.connection_id(), sql, "executing query");
}

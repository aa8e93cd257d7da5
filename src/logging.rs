//! Helper macro enforcing consistent network log fields.
//!
//! Every transport and channel log carries `event` and `endpoint` so log
//! consumers can group retries, fallbacks and reconnects by server.

/// Log a network event for an endpoint plus any extra fields.
#[macro_export]
macro_rules! network_event {
    ($level:ident, $event:expr, endpoint = $endpoint:expr, request_id = $request_id:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            event = $event,
            endpoint = %$endpoint,
            request_id = %$request_id,
            $($field = %$value,)*
        )
    };
    ($level:ident, $event:expr, endpoint = $endpoint:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            event = $event,
            endpoint = %$endpoint,
            $($field = %$value,)*
        )
    };
}

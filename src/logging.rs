//! Helper macros enforcing consistent switchyard log fields.
//!
//! These macros keep `route` (and optionally `flow`/`endpoint`) fields present on every
//! log emitted from gateway/orchestrator layers so downstream parsing can rely on them.

/// Log an event for a route/flow pair plus any extra fields.
#[macro_export]
macro_rules! switchyard_event {
    ($level:ident, $target:expr, $event:expr, route = $route:expr, flow = $flow:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            route = $route,
            flow = $flow,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, route = $route:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            route = $route,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, flow = $flow:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            flow = $flow,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, endpoint = $endpoint:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            endpoint = $endpoint,
            $($field = %$value,)*
        )
    };
}

use std::future::Future;

/// Await `operation`; on failure report the error through `on_error` and
/// return `fallback` instead.
///
/// Only for genuinely optional reads. Never wrap a write whose failure the
/// caller must see.
pub async fn with_fallback<Fut, T, E, H>(operation: Fut, fallback: T, on_error: H) -> T
where
    Fut: Future<Output = Result<T, E>>,
    H: FnOnce(&E),
{
    match operation.await {
        Ok(value) => value,
        Err(err) => {
            on_error(&err);
            fallback
        }
    }
}

/// Checks a deserialized payload before it is handed to the handler.
///
/// A validator may also normalise the payload (fill defaults, trim fields) by returning a
/// different value. Rejection consumes one attempt of the job, the same as a handler error,
/// without ever calling the handler.
///
/// Any `Fn(T) -> anyhow::Result<T>` closure is a validator:
///
/// ```rust
/// use liteque::core::validator::PayloadValidator;
///
/// let positive = |n: i64| -> anyhow::Result<i64> {
///     anyhow::ensure!(n > 0, "expected a positive number, got {n}");
///     Ok(n)
/// };
///
/// assert_eq!(positive.validate(3).unwrap(), 3);
/// assert!(positive.validate(-1).is_err());
/// ```
pub trait PayloadValidator<T>: Send + Sync {
    fn validate(&self, payload: T) -> anyhow::Result<T>;
}

impl<T, F> PayloadValidator<T> for F
where
    F: Fn(T) -> anyhow::Result<T> + Send + Sync,
{
    fn validate(&self, payload: T) -> anyhow::Result<T> {
        self(payload)
    }
}

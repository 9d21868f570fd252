use std::fmt;

macro_rules! err {
    ($base:ident, $msg:literal) => {
        $crate::android::error::ChunkError::with_context($base, $msg.to_string())
    };
    ($base:ident, $fmtstr:literal, $($args:tt)*) => {
        $crate::android::error::ChunkError::with_context($base, format!($fmtstr, $($args)*))
    };
    ($msg:literal) => {
        $crate::android::error::ChunkError::new($msg)
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::android::error::ChunkError::new(&format!($fmtstr, $($args)*))
    };
}

macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::android::error::ChunkError::new($msg))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::android::error::ChunkError::new(&format!($fmtstr, $($args)*)))
    };
}

/// Result alias for chunk-level codec operations.
pub type ChunkResult<T> = Result<T, ChunkError>;

/// A decoding/encoding failure inside a binary chunk stream.
///
/// The message names what went wrong, the contexts name where, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkError
{
    msg: String,
    contexts: Vec<String>,
}

impl ChunkError
{
    pub(crate) fn new(msg: &str) -> Self
    {
        ChunkError {
            msg: msg.to_string(),
            contexts: Vec::new(),
        }
    }

    pub(crate) fn with_context(base: ChunkError, context: String) -> Self
    {
        let mut contexts = base.contexts;
        contexts.push(context);
        ChunkError { msg: base.msg, contexts }
    }
}

/// Attach a lazily-built context to a chunk result.
pub(crate) trait ChunkContext<T>
{
    fn within<F: FnOnce() -> String>(self, context: F) -> ChunkResult<T>;
}

impl<T> ChunkContext<T> for ChunkResult<T>
{
    fn within<F: FnOnce() -> String>(self, context: F) -> ChunkResult<T>
    {
        self.map_err(|e| ChunkError::with_context(e, context()))
    }
}

impl fmt::Display for ChunkError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for ChunkError {}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn contexts_render_innermost_first()
    {
        let base = err!("pool index 9 out of range");
        let inner = err!(base, "entry {}", 3);
        let outer = err!(inner, "type chunk");
        assert_eq!(outer.to_string(), "pool index 9 out of range for entry 3 of type chunk");
    }
}

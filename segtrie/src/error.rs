use std::fmt;

use segtrie_core::IdAddress;

/// Failures reported to callers of the key-value API.
///
/// All of them leave the store as it was before the failed operation. Corruption is not an
/// error: it panics.
#[derive(Debug)]
pub enum Error {
    /// An object already has the maximum number of references.
    RefCountOverflow(IdAddress),
    /// Every id of the metadata table is in use.
    IdSpaceExhausted,
    /// Every segment is in use and none could be reclaimed.
    SegmentSpaceExhausted { max_segments: u32 },
    /// All session slots are taken.
    TooManySessions,
    KeyTooLarge { len: usize, max: usize },
    ValueTooLarge { len: usize, max: usize },
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RefCountOverflow(id) => write!(f, "too many references to object {id}"),
            Error::IdSpaceExhausted => write!(f, "object id space exhausted"),
            Error::SegmentSpaceExhausted { max_segments } => {
                write!(f, "all {max_segments} segments are in use")
            }
            Error::TooManySessions => write!(
                f,
                "too many sessions, at most {} may be open",
                crate::seg_alloc::MAX_SESSIONS
            ),
            Error::KeyTooLarge { len, max } => {
                write!(f, "key of {len} bytes exceeds the maximum of {max}")
            }
            Error::ValueTooLarge { len, max } => {
                write!(f, "value of {len} bytes exceeds the maximum of {max}")
            }
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn converts_into_anyhow() {
        fn fails() -> anyhow::Result<()> {
            Err::<(), _>(Error::TooManySessions)?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
        assert!(err.to_string().contains("too many sessions"));
    }
}

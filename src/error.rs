/// Represents errors that can occur in the write path
#[derive(Debug)]
pub enum Error {
    /// The `(seqno, user key)` combination already exists in the memtable.
    ///
    /// The write should be retried with a larger sequence number.
    TryAgain,

    /// An entry failed its checksum verification
    Corruption(String),

    /// The arena could not satisfy an allocation
    ArenaExhausted,

    /// An encoded entry carries an unknown kind tag
    InvalidTag(u8),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiltError: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;

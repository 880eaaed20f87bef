use core::fmt::{self, Display, Formatter};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    Ok = 250,
    StartMailInput = 354,
    Unavailable = 421,
    ActionUnavailable = 451,
    InsufficientStorage = 452,
    SyntaxError = 500,
    ParameterSyntaxError = 501,
    NotImplemented = 502,
    InvalidCommandSequence = 503,
    Error = 550,
    ExceededStorage = 552,
    TransactionFailed = 554,
}

impl Status {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", self.code())
    }
}

/// A reply line refusing a submission, as handed back by an envelope handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub status: Status,
    /// RFC 3463 enhanced status code, e.g. `4.4.1`.
    pub enhanced: &'static str,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn new(status: Status, enhanced: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            enhanced,
            message: message.into(),
        }
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Replies are a single line; multi-line diagnostics are folded.
        let message = self.message.replace(['\r', '\n'], " ");
        write!(f, "{} {} {message}", self.status, self.enhanced)
    }
}

#[cfg(test)]
mod test {
    use super::{Rejection, Status};

    #[test]
    fn status() {
        assert_eq!(Status::ActionUnavailable.code(), 451);
        assert_eq!(Status::ExceededStorage.to_string(), "552");
    }

    #[test]
    fn rejection_is_a_single_line() {
        let rejection = Rejection::new(
            Status::ActionUnavailable,
            "4.4.1",
            "mx1 failed\nmx2 failed",
        );
        assert_eq!(rejection.to_string(), "451 4.4.1 mx1 failed mx2 failed");
    }
}

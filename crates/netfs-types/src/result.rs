use crate::status::Status;
use crate::status_code::status_code_t;

/// The result type used throughout netfs, with `Status` as the error.
pub type Result<T> = std::result::Result<T, Status>;

/// Create an error result from a status code.
pub fn make_error<T>(code: status_code_t) -> Result<T> {
    Err(Status::new(code))
}

/// Create an error result from a status code and message.
pub fn make_error_msg<T>(code: status_code_t, msg: impl Into<String>) -> Result<T> {
    Err(Status::with_message(code, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::{FsCode, RPCCode};

    #[test]
    fn test_make_error() {
        let r: Result<i32> = make_error(FsCode::NOT_ALLOWED);
        assert_eq!(r.unwrap_err().code(), FsCode::NOT_ALLOWED);
    }

    #[test]
    fn test_make_error_msg() {
        let r: Result<()> = make_error_msg(RPCCode::BAD_DATA, "unexpected reply");
        let err = r.unwrap_err();
        assert_eq!(err.code(), RPCCode::BAD_DATA);
        assert_eq!(err.message(), Some("unexpected reply"));
    }
}

//! Retrieval error to HTTP status mapping
//!
//! | Error | Status |
//! |---|---|
//! | `MissingParameter`, `InvalidParameter` | 400 |
//! | `FetchFailed` | 502 |
//! | `NotFoundAfterFetch` | 404 |
//! | `TranscodeFailure`, `ReadFailure` | 500 |

use http::StatusCode;

use crate::pipeline::RetrieveError;

pub fn retrieve_error_status(error: &RetrieveError) -> StatusCode {
    match error {
        RetrieveError::MissingParameter(_) | RetrieveError::InvalidParameter { .. } => {
            StatusCode::BAD_REQUEST
        }
        RetrieveError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
        RetrieveError::NotFoundAfterFetch { .. } => StatusCode::NOT_FOUND,
        RetrieveError::TranscodeFailure(_) | RetrieveError::ReadFailure { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session error types.
//!
//! Every failure the protocol engine and the session controllers can
//! encounter maps onto one of the variants below. All variants except
//! `UnsupportedFeature` are fatal to the session that raised them; the
//! listener and the capture loop are never torn down by a per-session
//! error.

use thiserror::Error;

/// Errors raised by an RFB session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or inconsistent wire bytes. Fatal.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message arrived in a state that forbids it. Fatal.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// Password mismatch or unsupported security type. Fatal; the server
    /// emits an RFB reason string before closing.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Encoding or pseudo-encoding not implemented. Non-fatal on the
    /// receive side when framing permits skipping the rectangle; never
    /// surfaced to embedders as an error.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Underlying stream read/write failure or EOF. Fatal.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Inactivity exceeded the configured bound. Fatal.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SessionError {
    /// Whether this error must terminate the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::UnsupportedFeature(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_feature_is_not_fatal() {
        assert!(!SessionError::UnsupportedFeature("encoding 999".into()).is_fatal());
        assert!(SessionError::Decode("bad length".into()).is_fatal());
        assert!(SessionError::Auth("mismatch".into()).is_fatal());
    }

    #[test]
    fn io_errors_convert_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed");
        let err: SessionError = io.into();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}

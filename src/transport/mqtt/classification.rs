//! Pure mapping from rumqttc outcomes to connect classifications
//!
//! MQTT 3.1.1 CONNACK return codes map one-to-one onto [`ConnectResult`];
//! transport-level errors collapse into UNAVAILABLE or PROTOCOL_ERROR.

use super::connection::ConnectResult;
use rumqttc::{ConnectReturnCode, ConnectionError};

/// Classify a CONNACK return code
pub fn classify_connack(code: &ConnectReturnCode) -> ConnectResult {
    match code {
        ConnectReturnCode::Success => ConnectResult::Success,
        ConnectReturnCode::RefusedProtocolVersion => ConnectResult::ProtocolError,
        ConnectReturnCode::BadClientId => ConnectResult::IdentityRejected,
        ConnectReturnCode::ServiceUnavailable => ConnectResult::Unavailable,
        ConnectReturnCode::BadUserNamePassword => ConnectResult::AuthFailed,
        ConnectReturnCode::NotAuthorized => ConnectResult::NotAuthorized,
    }
}

/// Classify an event-loop error raised while establishing a session
pub fn classify_connection_error(error: &ConnectionError) -> ConnectResult {
    match error {
        ConnectionError::ConnectionRefused(code) => classify_connack(code),
        ConnectionError::NetworkTimeout
        | ConnectionError::FlushTimeout
        | ConnectionError::Io(_) => ConnectResult::Unavailable,
        ConnectionError::NotConnAck(_) | ConnectionError::MqttState(_) => {
            ConnectResult::ProtocolError
        }
        _ => ConnectResult::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_connack_codes() {
        let cases = [
            (ConnectReturnCode::Success, ConnectResult::Success),
            (
                ConnectReturnCode::RefusedProtocolVersion,
                ConnectResult::ProtocolError,
            ),
            (
                ConnectReturnCode::BadClientId,
                ConnectResult::IdentityRejected,
            ),
            (
                ConnectReturnCode::ServiceUnavailable,
                ConnectResult::Unavailable,
            ),
            (
                ConnectReturnCode::BadUserNamePassword,
                ConnectResult::AuthFailed,
            ),
            (ConnectReturnCode::NotAuthorized, ConnectResult::NotAuthorized),
        ];

        for (code, expected) in cases {
            assert_eq!(classify_connack(&code), expected, "code {code:?}");
        }
    }

    #[test]
    fn test_refused_connection_uses_return_code() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert_eq!(classify_connection_error(&error), ConnectResult::AuthFailed);

        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(
            classify_connection_error(&error),
            ConnectResult::NotAuthorized
        );
    }

    #[test]
    fn test_transport_errors_are_unavailable() {
        let refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(
            classify_connection_error(&refused),
            ConnectResult::Unavailable
        );
        assert_eq!(
            classify_connection_error(&ConnectionError::NetworkTimeout),
            ConnectResult::Unavailable
        );
    }

    #[test]
    fn test_unexpected_errors_are_unknown() {
        assert_eq!(
            classify_connection_error(&ConnectionError::RequestsDone),
            ConnectResult::Unknown
        );
    }
}

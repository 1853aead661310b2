/*!
 * Error Taxonomy
 * Failure kinds reported to frontends and mapped from BlueZ
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum BtError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("device not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("another authentication is in progress")]
    Busy,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("rejected")]
    Rejected,
    #[error("timed out")]
    Timeout,
    #[error("bluetooth service unavailable")]
    StackUnavailable,
    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl BtError {
    /// Maps a D-Bus error name (BlueZ or bus daemon) onto the taxonomy.
    pub fn from_error_name(name: &str, message: &str) -> Self {
        let short = name.rsplit('.').next().unwrap_or(name);
        match short {
            "DoesNotExist" | "UnknownObject" | "UnknownMethod" => BtError::NotFound,
            "AlreadyExists" | "AlreadyConnected" => BtError::AlreadyExists,
            "AuthenticationFailed" | "AuthenticationRejected" | "AuthenticationCanceled" => {
                BtError::AuthenticationFailed
            }
            "ConnectionAttemptFailed" | "Failed" | "NotReady" | "InProgress" | "NotConnected" => {
                BtError::ConnectionFailed
            }
            "AuthenticationTimeout" | "NoReply" | "Timeout" | "TimedOut" => BtError::Timeout,
            "Rejected" | "Canceled" => BtError::Rejected,
            "ServiceUnknown" | "NameHasNoOwner" | "Disconnected" | "NoServer" => {
                BtError::StackUnavailable
            }
            _ => BtError::InternalFailure(format!("{name}: {message}")),
        }
    }
}

impl From<dbus::Error> for BtError {
    fn from(err: dbus::Error) -> Self {
        BtError::from_error_name(err.name().unwrap_or_default(), err.message().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bluez_error_names_map_to_kinds() {
        assert_eq!(BtError::from_error_name("org.bluez.Error.DoesNotExist", ""), BtError::NotFound);
        assert_eq!(
            BtError::from_error_name("org.freedesktop.DBus.Error.UnknownObject", ""),
            BtError::NotFound
        );
        assert_eq!(
            BtError::from_error_name("org.bluez.Error.AlreadyConnected", ""),
            BtError::AlreadyExists
        );
        assert_eq!(
            BtError::from_error_name("org.bluez.Error.AuthenticationCanceled", ""),
            BtError::AuthenticationFailed
        );
        assert_eq!(
            BtError::from_error_name("org.bluez.Error.ConnectionAttemptFailed", ""),
            BtError::ConnectionFailed
        );
        assert_eq!(BtError::from_error_name("org.freedesktop.DBus.Error.NoReply", ""), BtError::Timeout);
        assert_eq!(BtError::from_error_name("org.bluez.Error.Rejected", ""), BtError::Rejected);
        assert_eq!(
            BtError::from_error_name("org.freedesktop.DBus.Error.ServiceUnknown", ""),
            BtError::StackUnavailable
        );
    }

    #[test]
    fn unknown_names_keep_their_detail() {
        let err = BtError::from_error_name("org.example.Weird", "boom");
        assert_eq!(err, BtError::InternalFailure("org.example.Weird: boom".to_string()));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_string(&BtError::NotFound).unwrap();
        assert_eq!(json, r#"{"kind":"NotFound"}"#);
        let json = serde_json::to_string(&BtError::InvalidAddress("zz".into())).unwrap();
        assert_eq!(json, r#"{"kind":"InvalidAddress","detail":"zz"}"#);
    }
}

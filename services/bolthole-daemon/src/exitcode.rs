//! Exit-code mapping - the process's single exit site
//!
//! Every typed error funnels through [`exit_status`]; nothing else in the
//! daemon inspects error types to decide a process exit code. The numeric
//! values are part of the CLI contract with wrapping tooling.

use bolthole_bzcert::{BzCertError, TokenError};
use bolthole_cch::CchError;
use bolthole_datachannel::{DataChannelError, PluginError};

use crate::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    UnspecifiedError = 1,
    CancelledByUser = 3,
    UserNotFound = 4,
    ZliConfigError = 5,
    ServiceAccountNotConfigured = 6,
    PolicyEditedClosed = 7,
    PolicyDeletedClosed = 8,
    IdleTimeout = 9,
    ConnectionRefused = 10,
    ConnectionFailed = 11,
    TlsDisabled = 12,
    ClientCertCosign = 13,
    PwdbMissingKey = 14,
    PwdbUnknownAuthority = 15,
    ServerCertExpired = 16,
    IncorrectServerName = 17,
    BzCertIdTokenError = 18,
}

pub fn exit_status(result: &Result<(), DaemonError>) -> ExitStatus {
    let error = match result {
        Ok(()) => return ExitStatus::Success,
        Err(error) => error,
    };

    match error {
        DaemonError::Cancelled => ExitStatus::CancelledByUser,
        DaemonError::ZliConfig(_) => ExitStatus::ZliConfigError,
        DaemonError::DataChannel(e) => datachannel_status(e),
        DaemonError::Cch(e) => cch_status(e),
        DaemonError::Transport(_) => ExitStatus::ConnectionFailed,
    }
}

fn datachannel_status(error: &DataChannelError) -> ExitStatus {
    match error {
        DataChannelError::UserNotFound => ExitStatus::UserNotFound,
        DataChannelError::PolicyEditedClosed => ExitStatus::PolicyEditedClosed,
        DataChannelError::PolicyDeletedClosed => ExitStatus::PolicyDeletedClosed,
        DataChannelError::IdleTimeout => ExitStatus::IdleTimeout,
        DataChannelError::CertIdToken(_) => ExitStatus::BzCertIdTokenError,
        DataChannelError::Plugin(e) => plugin_status(e),
        DataChannelError::Cch(e) => cch_status(e),
        DataChannelError::Transport(_) => ExitStatus::ConnectionFailed,
        DataChannelError::Closed => ExitStatus::CancelledByUser,
        _ => ExitStatus::UnspecifiedError,
    }
}

fn plugin_status(error: &PluginError) -> ExitStatus {
    match error {
        PluginError::UserNotFound(_) => ExitStatus::UserNotFound,
        PluginError::ConnectionRefused(_) => ExitStatus::ConnectionRefused,
        PluginError::ConnectionFailed(_) => ExitStatus::ConnectionFailed,
        PluginError::TlsDisabled(_) => ExitStatus::TlsDisabled,
        PluginError::ClientCertCosign(_) => ExitStatus::ClientCertCosign,
        PluginError::PwdbMissingKey(_) => ExitStatus::PwdbMissingKey,
        PluginError::PwdbUnknownAuthority(_) => ExitStatus::PwdbUnknownAuthority,
        PluginError::ServerCertificateExpired(_) => ExitStatus::ServerCertExpired,
        PluginError::IncorrectServerName { .. } => ExitStatus::IncorrectServerName,
        PluginError::Internal(_) => ExitStatus::UnspecifiedError,
    }
}

fn cch_status(error: &CchError) -> ExitStatus {
    match error {
        CchError::Cert(cert_error) => cert_status(cert_error),
        CchError::Shutdown => ExitStatus::CancelledByUser,
        _ => ExitStatus::UnspecifiedError,
    }
}

fn cert_status(error: &BzCertError) -> ExitStatus {
    match error {
        // A jku outside the allow-list means the org never configured
        // this service account.
        BzCertError::ServiceAccount(TokenError::JkuNotAllowed(_)) => {
            ExitStatus::ServiceAccountNotConfigured
        }
        BzCertError::InitialIdToken(_)
        | BzCertError::CurrentIdToken(_)
        | BzCertError::ServiceAccount(_) => ExitStatus::BzCertIdTokenError,
        BzCertError::CertConfig(_) => ExitStatus::ZliConfigError,
    }
}

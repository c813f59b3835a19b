//! Command codes carried in the `command` field of every stream frame.
//!
//! Workers and the gateway agree on short numeric string codes. Inside the
//! gateway a command is always a [`Command`] variant; the string form only
//! exists at the serialization boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How long a caller is willing to wait for the reply to a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Ordinary request/response calls.
    Standard,
    /// Batch operations that touch many records.
    Bulk,
    /// Large binary transfers.
    Transfer,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    // Stream lifecycle
    Register,
    Pong,
    GracefulRestart,

    // Account
    SignUp,
    SignIn,
    SignOut,
    GetProfile,
    UpdateProfile,
    ChangeMasterPassword,
    DeleteAccount,
    RefreshToken,

    // Ledger transactions
    CheckTx,
    DeliverTx,
    QueryTx,
    BatchDeliverTx,

    // Vault items
    ListItems,
    GetItem,
    CreateItem,
    UpdateItem,
    DeleteItem,
    ShareItem,
    ImportItems,
    ExportItems,
    SyncVault,

    // Content index
    IndexItem,
    SearchItems,
    RebuildIndex,
    DropIndex,

    // Blob storage
    UploadFile,
    DownloadFile,
    DeleteFile,
    StatFile,

    /// A code this gateway does not know. Kept verbatim so it can be relayed.
    Unrecognized(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Register => "1",
            Command::Pong => "2",
            Command::GracefulRestart => "3",

            Command::SignUp => "10",
            Command::SignIn => "11",
            Command::SignOut => "12",
            Command::GetProfile => "13",
            Command::UpdateProfile => "14",
            Command::ChangeMasterPassword => "15",
            Command::DeleteAccount => "16",
            Command::RefreshToken => "17",

            Command::CheckTx => "20",
            Command::DeliverTx => "21",
            Command::QueryTx => "22",
            Command::BatchDeliverTx => "23",

            Command::ListItems => "30",
            Command::GetItem => "31",
            Command::CreateItem => "32",
            Command::UpdateItem => "33",
            Command::DeleteItem => "34",
            Command::ShareItem => "35",
            Command::ImportItems => "36",
            Command::ExportItems => "37",
            Command::SyncVault => "38",

            Command::IndexItem => "40",
            Command::SearchItems => "41",
            Command::RebuildIndex => "42",
            Command::DropIndex => "43",

            Command::UploadFile => "50",
            Command::DownloadFile => "51",
            Command::DeleteFile => "52",
            Command::StatFile => "53",

            Command::Unrecognized(code) => code,
        }
    }

    /// Control signals are handled by the session itself and are never replies.
    pub fn is_control(&self) -> bool {
        matches!(self, Command::GracefulRestart)
    }

    /// Codes that only manage the stream itself and cannot be sent as requests.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Command::Register | Command::Pong | Command::GracefulRestart
        )
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Command::BatchDeliverTx
            | Command::ImportItems
            | Command::ExportItems
            | Command::SyncVault
            | Command::RebuildIndex => TimeoutClass::Bulk,
            Command::UploadFile | Command::DownloadFile => TimeoutClass::Transfer,
            _ => TimeoutClass::Standard,
        }
    }
}

impl From<&str> for Command {
    fn from(code: &str) -> Self {
        match code {
            "1" => Command::Register,
            "2" => Command::Pong,
            "3" => Command::GracefulRestart,

            "10" => Command::SignUp,
            "11" => Command::SignIn,
            "12" => Command::SignOut,
            "13" => Command::GetProfile,
            "14" => Command::UpdateProfile,
            "15" => Command::ChangeMasterPassword,
            "16" => Command::DeleteAccount,
            "17" => Command::RefreshToken,

            "20" => Command::CheckTx,
            "21" => Command::DeliverTx,
            "22" => Command::QueryTx,
            "23" => Command::BatchDeliverTx,

            "30" => Command::ListItems,
            "31" => Command::GetItem,
            "32" => Command::CreateItem,
            "33" => Command::UpdateItem,
            "34" => Command::DeleteItem,
            "35" => Command::ShareItem,
            "36" => Command::ImportItems,
            "37" => Command::ExportItems,
            "38" => Command::SyncVault,

            "40" => Command::IndexItem,
            "41" => Command::SearchItems,
            "42" => Command::RebuildIndex,
            "43" => Command::DropIndex,

            "50" => Command::UploadFile,
            "51" => Command::DownloadFile,
            "52" => Command::DeleteFile,
            "53" => Command::StatFile,

            other => Command::Unrecognized(other.to_string()),
        }
    }
}

impl From<String> for Command {
    fn from(code: String) -> Self {
        match Command::from(code.as_str()) {
            Command::Unrecognized(_) => Command::Unrecognized(code),
            known => known,
        }
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        match command {
            Command::Unrecognized(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Copyright 2026 The Tessera Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // business errors
    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("group {0} not found")]
    GroupNotFound(u64),

    #[error("cluster state change failed")]
    StateChangeFailed,

    #[error("affinity reconciliation {0}")]
    Affinity(String),

    #[error("history reservation failed for group {0}")]
    HistoryReservation(u64),

    // transport errors; peer-gone is recoverable, the coordinator observes
    // the node-leave event independently
    #[error("peer {0} is gone")]
    PeerGone(u64),

    #[error("transport {0}")]
    Transport(String),

    // internal errors
    #[error("invalid {0} data")]
    InvalidData(String),

    #[error("exchange interrupted")]
    Interrupted,

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("node is stopping")]
    Stopping,

    #[error("need reconnect: {0}")]
    NeedReconnect(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::InvalidArgument(a), Error::InvalidArgument(b)) => a == b,
            (Error::GroupNotFound(a), Error::GroupNotFound(b)) => a == b,
            (Error::StateChangeFailed, Error::StateChangeFailed) => true,
            (Error::Affinity(a), Error::Affinity(b)) => a == b,
            (Error::HistoryReservation(a), Error::HistoryReservation(b)) => a == b,
            (Error::PeerGone(a), Error::PeerGone(b)) => a == b,
            (Error::Transport(a), Error::Transport(b)) => a == b,
            (Error::InvalidData(a), Error::InvalidData(b)) => a == b,
            (Error::Interrupted, Error::Interrupted) => true,
            (Error::ClientDisconnected, Error::ClientDisconnected) => true,
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            (Error::Stopping, Error::Stopping) => true,
            (Error::NeedReconnect(a), Error::NeedReconnect(b)) => a == b,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for causes that should restart the node's session rather
    /// than leave the exchange failed: io trouble, a disconnected client,
    /// or a reconciliation the node can no longer back with local state.
    pub fn is_reconnect_cause(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ClientDisconnected
                | Error::HistoryReservation(_)
                | Error::Affinity(_)
        )
    }

    pub fn is_peer_gone(&self) -> bool {
        matches!(self, Error::PeerGone(_))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

use crate::addr::CidrParseError;
use crate::allocation::AllocationError;
use crate::config::ConfigError;
use crate::drift::DigestError;
use crate::keys::KeyError;
use crate::server_config::RenderError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("public key {0} is already used by another client")]
    DuplicatePublicKey(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// User-input errors. An operation failing with one of these changed
    /// nothing.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::Allocation(e) => e.is_rejection(),
            other => matches!(
                other,
                Self::Key(_)
                    | Self::Validation(_)
                    | Self::ClientNotFound(_)
                    | Self::DuplicatePublicKey(_)
            ),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ClientNotFound(id) => Self::ClientNotFound(id),
            StoreError::InvalidUsername(name) => {
                Self::Validation(format!("invalid username {name:?}"))
            }
            other => {
                tracing::error!(error = %other, "store error");
                Self::Store(other)
            }
        }
    }
}

impl From<CidrParseError> for Error {
    fn from(err: CidrParseError) -> Self {
        Self::Allocation(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn allocation_errors_are_rejections() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(Error::from(AllocationError::DuplicateAddress(ip)).is_rejection());
        assert!(Error::from(CidrParseError("nope".into())).is_rejection());
        assert!(Error::Validation("bad".into()).is_rejection());
    }

    #[test]
    fn missing_client_maps_through() {
        let err = Error::from(StoreError::ClientNotFound("abc".into()));
        assert!(matches!(err, Error::ClientNotFound(ref id) if id == "abc"));
        assert!(err.is_rejection());
    }

    #[test]
    fn corrupt_records_are_not_rejections() {
        let err = Error::from(AllocationError::CorruptRecord {
            owner: "client a".into(),
            value: "10.0.0.2".into(),
        });
        assert!(!err.is_rejection());
    }

    #[test]
    fn invalid_username_is_a_rejection() {
        let err = Error::from(StoreError::InvalidUsername("../x".into()));
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.is_rejection());
    }

    #[test]
    fn io_failures_are_not_rejections() {
        let err = Error::from(StoreError::Io {
            path: "/db/server/hashes.json".into(),
            source: std::io::Error::other("disk gone"),
        });
        assert!(!err.is_rejection());
    }
}

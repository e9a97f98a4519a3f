use thiserror::Error;

use crate::driver::DriverError;
use crate::group::GroupError;
use crate::header::HeaderError;
use crate::inventory::InventoryError;
use crate::key::KeyError;
use crate::shm::ShmError;
use crate::transfer::TransferError;

/// Top-level error for library consumers.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

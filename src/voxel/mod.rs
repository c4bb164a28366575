//! Voxel-grid point reduction and spatial queries.

pub mod cell;
pub mod key;
pub mod store;

pub use cell::VoxelCell;
pub use key::{Aabb, VoxelKey};
pub use store::{StoreConfig, StoreError, StoreStatistics, VoxelPointStore};
